//! Dead-letter inspection.

use std::sync::Arc;

use axum::Json;
use axum::extract::{Query, State};
use saga_store::{DeadLetterRecord, SagaStore};
use serde::Deserialize;

use crate::AppState;
use crate::error::ApiError;

const DEFAULT_LIMIT: usize = 50;
const MAX_LIMIT: usize = 500;

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub limit: Option<usize>,
}

/// GET /dead-letters: most recent dead letters, newest first.
#[tracing::instrument(skip(state))]
pub async fn list<S: SagaStore>(
    State(state): State<Arc<AppState<S>>>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Vec<DeadLetterRecord>>, ApiError> {
    let limit = query.limit.unwrap_or(DEFAULT_LIMIT).min(MAX_LIMIT);
    let records = state.orchestrator.store().list(limit).await?;
    Ok(Json(records))
}
