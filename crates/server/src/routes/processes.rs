//! Saga lifecycle endpoints.

use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use chrono::{DateTime, Utc};
use common::ProcessId;
use saga::StartRequest;
use saga_store::{ProcessState, ProcessStatus, SagaStore, StepExecution};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::AppState;
use crate::error::ApiError;

const DEFAULT_ABORT_REASON: &str = "aborted by operator";

// -- Request types --

#[derive(Debug, Default, Deserialize)]
pub struct AbortRequest {
    pub reason: Option<String>,
}

// -- Response types --

#[derive(Debug, Serialize)]
pub struct ProcessResponse {
    pub process_id: ProcessId,
    pub process_type: String,
    pub status: ProcessStatus,
    pub current_step: Option<String>,
    pub completed_steps: Vec<String>,
    pub data: Map<String, Value>,
    pub history: Vec<StepExecution>,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<ProcessState> for ProcessResponse {
    fn from(state: ProcessState) -> Self {
        Self {
            completed_steps: state
                .completed_steps()
                .into_iter()
                .map(str::to_string)
                .collect(),
            process_id: state.process_id().clone(),
            process_type: state.process_type().to_string(),
            status: state.status(),
            current_step: state.current_step().map(str::to_string),
            data: state.data().clone(),
            history: state.history().to_vec(),
            started_at: state.started_at(),
            updated_at: state.updated_at(),
        }
    }
}

// -- Handlers --

/// POST /processes: start a saga and dispatch its first step.
#[tracing::instrument(skip(state, request), fields(process_type = %request.process_type))]
pub async fn start<S: SagaStore>(
    State(state): State<Arc<AppState<S>>>,
    Json(request): Json<StartRequest>,
) -> Result<(StatusCode, Json<ProcessResponse>), ApiError> {
    if request.process_id.as_ref().is_some_and(|id| id.as_str().is_empty()) {
        return Err(ApiError::BadRequest("process_id must not be empty".to_string()));
    }
    let process = state.engine.start(request).await?;
    Ok((StatusCode::CREATED, Json(process.into())))
}

/// GET /processes/{id}: load a saga's current state.
#[tracing::instrument(skip(state))]
pub async fn get<S: SagaStore>(
    State(state): State<Arc<AppState<S>>>,
    Path(id): Path<String>,
) -> Result<Json<ProcessResponse>, ApiError> {
    let process = state.orchestrator.get_process(&ProcessId::from(id)).await?;
    Ok(Json(process.into()))
}

/// POST /processes/{id}/abort: stop a running saga and compensate it.
///
/// The body is optional; `{"reason": "..."}` is recorded on the failed step.
#[tracing::instrument(skip(state, request))]
pub async fn abort<S: SagaStore>(
    State(state): State<Arc<AppState<S>>>,
    Path(id): Path<String>,
    request: Option<Json<AbortRequest>>,
) -> Result<Json<ProcessResponse>, ApiError> {
    let reason = request
        .and_then(|Json(body)| body.reason)
        .unwrap_or_else(|| DEFAULT_ABORT_REASON.to_string());
    let process = state.engine.abort(ProcessId::from(id), reason).await?;
    Ok(Json(process.into()))
}
