//! Inbound message endpoint.

use std::sync::Arc;

use axum::Json;
use axum::extract::State;
use contracts::SagaEvent;
use saga::DispatchOutcome;
use serde::Serialize;

use super::AppState;
use crate::error::ApiError;

#[derive(Debug, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum DispatchResponse {
    Applied {
        correlation_id: String,
        message_type: &'static str,
        from: String,
        to: String,
        version: i64,
        attempts: u32,
        commands_published: usize,
        dead_letters: Vec<String>,
        pending_effects: usize,
    },
    Ignored {
        correlation_id: String,
        message_type: &'static str,
        reason: &'static str,
        detail: String,
    },
}

impl From<DispatchOutcome> for DispatchResponse {
    fn from(outcome: DispatchOutcome) -> Self {
        match outcome {
            DispatchOutcome::Applied(applied) => DispatchResponse::Applied {
                correlation_id: applied.correlation_id.to_string(),
                message_type: applied.message_type,
                from: applied.from.to_string(),
                to: applied.to.to_string(),
                version: applied.version.as_i64(),
                attempts: applied.attempts,
                commands_published: applied.commands_published,
                dead_letters: applied.dead_letters.iter().map(|id| id.to_string()).collect(),
                pending_effects: applied.pending_effects,
            },
            DispatchOutcome::Ignored(ignored) => DispatchResponse::Ignored {
                correlation_id: ignored.correlation_id.to_string(),
                message_type: ignored.message_type,
                reason: ignored.rejection.reason(),
                detail: ignored.rejection.to_string(),
            },
        }
    }
}

/// POST /messages: dispatch one inbound saga event.
#[tracing::instrument(skip(state, event))]
pub async fn receive(
    State(state): State<Arc<AppState>>,
    Json(event): Json<SagaEvent>,
) -> Result<Json<DispatchResponse>, ApiError> {
    let outcome = state.dispatcher.dispatch(event).await?;
    Ok(Json(outcome.into()))
}
