use std::sync::Arc;

use axum::{extract::Extension, response::IntoResponse, routing::post, Json, Router};

use hybridcap_infra::Orchestrator;

use crate::app::errors;

pub fn router() -> Router {
    Router::new().route("/tick", post(tick))
}

/// External schedule entry point for the batch substrate.
pub async fn tick(Extension(orchestrator): Extension<Arc<Orchestrator>>) -> axum::response::Response {
    match orchestrator.tick().await {
        Ok(report) => Json(report).into_response(),
        Err(e) => errors::capture_error_to_response(e),
    }
}
