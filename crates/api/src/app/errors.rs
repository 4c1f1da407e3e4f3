use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde_json::json;

use hybridcap_core::DomainError;
use hybridcap_infra::resilience::ResilienceError;
use hybridcap_infra::{CaptureError, StoreError};

pub fn capture_error_to_response(err: CaptureError) -> axum::response::Response {
    match err {
        CaptureError::Caller(e) => domain_error_to_response(e),
        CaptureError::Store(e) => store_error_to_response(e),
        CaptureError::Remote(e @ ResilienceError::CircuitOpen { .. }) => {
            json_error(StatusCode::SERVICE_UNAVAILABLE, "circuit_open", e.to_string())
        }
        CaptureError::Remote(e) => json_error(StatusCode::BAD_GATEWAY, "remote_error", e.to_string()),
        CaptureError::Dispatch(msg) => {
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "dispatch_error", msg)
        }
    }
}

pub fn domain_error_to_response(err: DomainError) -> axum::response::Response {
    match err {
        DomainError::Validation(msg) => json_error(StatusCode::BAD_REQUEST, "validation_error", msg),
        DomainError::InvalidId(msg) => json_error(StatusCode::BAD_REQUEST, "invalid_id", msg),
        DomainError::InvariantViolation(msg) => {
            json_error(StatusCode::UNPROCESSABLE_ENTITY, "invariant_violation", msg)
        }
        DomainError::NotFound => json_error(StatusCode::NOT_FOUND, "not_found", "not found"),
        DomainError::Conflict(msg) => json_error(StatusCode::CONFLICT, "conflict", msg),
    }
}

pub fn store_error_to_response(err: StoreError) -> axum::response::Response {
    match err {
        StoreError::NotFound(msg) => json_error(StatusCode::NOT_FOUND, "not_found", msg),
        StoreError::Conflict(msg) => json_error(StatusCode::CONFLICT, "conflict", msg),
        StoreError::Storage(msg) => {
            tracing::error!(error = %msg, "store failure");
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "store_error", msg)
        }
    }
}

pub fn json_error(
    status: StatusCode,
    code: &'static str,
    message: impl Into<String>,
) -> axum::response::Response {
    (
        status,
        axum::Json(json!({
            "error": code,
            "message": message.into(),
        })),
    )
        .into_response()
}
