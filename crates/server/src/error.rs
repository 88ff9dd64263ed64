//! API error types with HTTP response mapping.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use saga::SagaError;

/// API-level error type that maps to HTTP responses.
#[derive(Debug)]
pub enum ApiError {
    /// Bad request from the client.
    BadRequest(String),
    /// Saga engine error.
    Saga(SagaError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Saga(err) => saga_error_to_response(err),
        };

        let body = serde_json::json!({ "error": message });
        (status, axum::Json(body)).into_response()
    }
}

fn saga_error_to_response(err: SagaError) -> (StatusCode, String) {
    let status = match &err {
        SagaError::NotFound(_) => StatusCode::NOT_FOUND,
        SagaError::AlreadyExists(_)
        | SagaError::InvalidState { .. }
        | SagaError::InProgress(_)
        | SagaError::Transition(_) => StatusCode::CONFLICT,
        SagaError::UnknownProcessType(_)
        | SagaError::UnknownStep(_)
        | SagaError::InvalidDefinition(_)
        | SagaError::InvalidProcessId(..) => StatusCode::BAD_REQUEST,
        SagaError::StoreUnavailable(_) | SagaError::ShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
        SagaError::Store(_) | SagaError::Serialization(_) => {
            tracing::error!(error = %err, "saga operation failed");
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    (status, err.to_string())
}

impl From<SagaError> for ApiError {
    fn from(err: SagaError) -> Self {
        ApiError::Saga(err)
    }
}

impl From<saga_store::StoreError> for ApiError {
    fn from(err: saga_store::StoreError) -> Self {
        ApiError::Saga(err.into())
    }
}

#[cfg(test)]
mod tests {
    use common::ProcessId;

    use super::*;

    fn status_of(err: SagaError) -> StatusCode {
        ApiError::from(err).into_response().status()
    }

    #[test]
    fn test_saga_error_mapping() {
        assert_eq!(
            status_of(SagaError::NotFound(ProcessId::from("p-1"))),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            status_of(SagaError::AlreadyExists(ProcessId::from("p-1"))),
            StatusCode::CONFLICT
        );
        assert_eq!(
            status_of(SagaError::UnknownProcessType("Nope".into())),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            status_of(SagaError::StoreUnavailable("down".into())),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(status_of(SagaError::ShuttingDown), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[test]
    fn test_store_failures_are_internal_errors() {
        let err = saga_store::StoreError::InvalidData("bad status".into());
        assert_eq!(
            ApiError::from(err).into_response().status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
