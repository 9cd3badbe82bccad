//! Dead letter inspection and redrive.

use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, Query, State};
use common::DeadLetterId;
use serde::{Deserialize, Serialize};

use super::AppState;
use crate::error::ApiError;

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub limit: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct DeadLetterResponse {
    pub id: String,
    pub correlation_id: String,
    pub effect_kind: String,
    pub payload: serde_json::Value,
    pub last_error: String,
    pub attempts: u32,
    pub created_at: String,
}

#[derive(Debug, Serialize)]
pub struct RedriveResponse {
    pub id: String,
    pub status: &'static str,
}

/// GET /dead-letters: oldest dead letters first.
#[tracing::instrument(skip(state))]
pub async fn list(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Vec<DeadLetterResponse>>, ApiError> {
    let limit = query.limit.unwrap_or(100).min(1000);
    let letters = state.dispatcher.dead_letters(limit).await?;

    Ok(Json(
        letters
            .into_iter()
            .map(|l| DeadLetterResponse {
                id: l.id.to_string(),
                correlation_id: l.correlation_id.to_string(),
                effect_kind: l.effect_kind,
                payload: l.payload,
                last_error: l.last_error,
                attempts: l.attempts,
                created_at: l.created_at.to_rfc3339(),
            })
            .collect(),
    ))
}

/// POST /dead-letters/{id}/redrive: retry a dead-lettered effect.
#[tracing::instrument(skip(state))]
pub async fn redrive(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<RedriveResponse>, ApiError> {
    let dead_letter_id: DeadLetterId = id
        .parse()
        .map_err(|e| ApiError::BadRequest(format!("Invalid dead letter id: {e}")))?;

    state.dispatcher.redrive_dead_letter(dead_letter_id).await?;

    Ok(Json(RedriveResponse {
        id,
        status: "redriven",
    }))
}
