//! Prometheus metrics endpoint.

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use saga_store::SagaStore;

use crate::AppState;

/// GET /metrics: returns Prometheus-formatted metrics.
///
/// The outbox backlog gauge is sampled on each scrape.
pub async fn get<S: SagaStore>(State(state): State<Arc<AppState<S>>>) -> impl IntoResponse {
    match state.orchestrator.store().pending_count().await {
        Ok(pending) => metrics::gauge!("outbox_pending_messages").set(pending as f64),
        Err(err) => tracing::warn!(error = %err, "could not sample outbox backlog"),
    }

    (
        StatusCode::OK,
        [(
            axum::http::header::CONTENT_TYPE,
            "text/plain; version=0.0.4; charset=utf-8",
        )],
        state.metrics.render(),
    )
}
