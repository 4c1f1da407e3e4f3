use std::sync::Arc;

use axum::{
    extract::Extension,
    http::StatusCode,
    response::IntoResponse,
    routing::post,
    Json, Router,
};

use hybridcap_infra::jobs::CaptureRequest;
use hybridcap_infra::Orchestrator;

use crate::app::errors;

pub fn router() -> Router {
    Router::new().route("/", post(route_capture))
}

/// Inbound routing endpoint: classify, persist and hand off one request.
pub async fn route_capture(
    Extension(orchestrator): Extension<Arc<Orchestrator>>,
    Json(body): Json<CaptureRequest>,
) -> axum::response::Response {
    match orchestrator.router().route(body).await {
        Ok(outcome) => (StatusCode::ACCEPTED, Json(outcome)).into_response(),
        Err(e) => errors::capture_error_to_response(e),
    }
}
