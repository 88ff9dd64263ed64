//! Inbound worker replies.

use std::sync::Arc;

use axum::Json;
use axum::extract::State;
use common::ProcessId;
use saga::StepResult;
use saga_store::{ProcessStatus, SagaStore};
use serde::Serialize;

use crate::AppState;
use crate::error::ApiError;

#[derive(Debug, Serialize)]
pub struct EventResponse {
    pub process_id: ProcessId,
    pub status: ProcessStatus,
    pub current_step: Option<String>,
    /// False when the reply no longer matched the work in flight.
    pub applied: bool,
    /// True when an earlier delivery of the same reply was already handled.
    pub duplicate: bool,
}

/// POST /events: apply a step or compensation result.
///
/// Redelivering a reply is safe and answers with the original outcome.
#[tracing::instrument(
    skip(state, result),
    fields(process_id = %result.process_id, step = %result.step_name, attempt = result.attempt)
)]
pub async fn submit<S: SagaStore>(
    State(state): State<Arc<AppState<S>>>,
    Json(result): Json<StepResult>,
) -> Result<Json<EventResponse>, ApiError> {
    let delivery = state.engine.submit_result(result).await?;
    let duplicate = delivery.is_duplicate();
    let transition = delivery.into_inner();

    Ok(Json(EventResponse {
        process_id: transition.process_id,
        status: transition.status,
        current_step: transition.current_step,
        applied: transition.applied,
        duplicate,
    }))
}
