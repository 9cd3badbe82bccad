//! Saga status endpoints.

use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, Query, State};
use common::CorrelationId;
use saga::{SagaInstance, SagaState};
use saga_store::ScheduledTimeout;
use serde::{Deserialize, Serialize};

use super::AppState;
use crate::error::ApiError;

#[derive(Debug, Deserialize)]
pub struct ListSagasQuery {
    pub state: String,
    pub limit: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct PendingTimeoutResponse {
    pub token_id: String,
    pub kind: String,
    pub deadline: String,
}

#[derive(Debug, Serialize)]
pub struct SagaStatusResponse {
    pub correlation_id: String,
    pub state: String,
    pub terminal: bool,
    pub version: i64,
    pub booking_id: Option<String>,
    pub payment_id: Option<String>,
    pub amount_cents: Option<i64>,
    pub currency: Option<String>,
    pub failure_reason: Option<String>,
    pub payment_reference: Option<String>,
    pub booking_confirmation_retry_count: u32,
    pub created_at: String,
    pub updated_at: String,
    pub completed_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pending_timeouts: Option<Vec<PendingTimeoutResponse>>,
}

impl SagaStatusResponse {
    fn from_instance(saga: &SagaInstance, pending: Option<Vec<ScheduledTimeout>>) -> Self {
        Self {
            correlation_id: saga.correlation_id().to_string(),
            state: saga.state().to_string(),
            terminal: saga.is_terminal(),
            version: saga.version().as_i64(),
            booking_id: saga.booking_id().map(|id| id.to_string()),
            payment_id: saga.payment_id().map(|id| id.to_string()),
            amount_cents: saga.amount().map(|a| a.cents()),
            currency: saga.currency().map(|c| c.to_string()),
            failure_reason: saga.failure_reason().map(String::from),
            payment_reference: saga.payment_reference().map(String::from),
            booking_confirmation_retry_count: saga.booking_confirmation_retry_count(),
            created_at: saga.created_at().to_rfc3339(),
            updated_at: saga.updated_at().to_rfc3339(),
            completed_at: saga.completed_at().map(|t| t.to_rfc3339()),
            pending_timeouts: pending.map(|timeouts| {
                timeouts
                    .into_iter()
                    .map(|t| PendingTimeoutResponse {
                        token_id: t.token_id.to_string(),
                        kind: t.kind,
                        deadline: t.deadline.to_rfc3339(),
                    })
                    .collect()
            }),
        }
    }
}

/// GET /sagas/{correlation_id}: status of one saga instance.
#[tracing::instrument(skip(state))]
pub async fn get(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<SagaStatusResponse>, ApiError> {
    let correlation_id: CorrelationId = id
        .parse()
        .map_err(|e| ApiError::BadRequest(format!("Invalid correlation id: {e}")))?;

    let saga = state
        .dispatcher
        .get_saga(correlation_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("Saga {id} not found")))?;
    let pending = state.dispatcher.pending_timeouts(correlation_id).await?;

    Ok(Json(SagaStatusResponse::from_instance(&saga, Some(pending))))
}

/// GET /sagas?state=...: sagas currently in a state.
#[tracing::instrument(skip(state))]
pub async fn list(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListSagasQuery>,
) -> Result<Json<Vec<SagaStatusResponse>>, ApiError> {
    let saga_state: SagaState = query.state.parse().map_err(ApiError::BadRequest)?;
    let limit = query.limit.unwrap_or(100).min(1000);

    let sagas = state.dispatcher.find_by_state(saga_state, limit).await?;
    Ok(Json(
        sagas
            .iter()
            .map(|saga| SagaStatusResponse::from_instance(saga, None))
            .collect(),
    ))
}
