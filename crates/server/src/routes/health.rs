//! Health check endpoint.

use std::sync::Arc;

use axum::Json;
use axum::extract::State;
use axum::http::StatusCode;
use saga_store::SagaStore;
use serde::Serialize;

use crate::AppState;

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    /// Outbox messages awaiting publication, absent when the store is unreachable.
    pub outbox_pending: Option<u64>,
}

/// GET /health: reports whether the engine is accepting work and the store answers.
pub async fn check<S: SagaStore>(
    State(state): State<Arc<AppState<S>>>,
) -> (StatusCode, Json<HealthResponse>) {
    if state.engine.is_shutting_down() {
        let body = HealthResponse {
            status: "shutting_down",
            outbox_pending: None,
        };
        return (StatusCode::SERVICE_UNAVAILABLE, Json(body));
    }

    match state.orchestrator.store().pending_count().await {
        Ok(pending) => (
            StatusCode::OK,
            Json(HealthResponse {
                status: "ok",
                outbox_pending: Some(pending),
            }),
        ),
        Err(err) => {
            tracing::warn!(error = %err, "health check could not reach the store");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(HealthResponse {
                    status: "store_unavailable",
                    outbox_pending: None,
                }),
            )
        }
    }
}
