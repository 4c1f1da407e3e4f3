use std::sync::Arc;

use axum::{
    extract::{Extension, Path},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde_json::json;

use hybridcap_infra::Orchestrator;

use crate::app::errors;

pub fn router() -> Router {
    Router::new()
        .route("/", get(list_breakers))
        .route("/reset", post(reset_all))
        .route("/:key/reset", post(reset_breaker))
}

pub async fn list_breakers(Extension(orchestrator): Extension<Arc<Orchestrator>>) -> impl IntoResponse {
    Json(orchestrator.breakers().snapshot())
}

pub async fn reset_breaker(
    Extension(orchestrator): Extension<Arc<Orchestrator>>,
    Path(key): Path<String>,
) -> axum::response::Response {
    orchestrator.breakers().reset(&key);
    if let Err(e) = orchestrator.persist_breakers().await {
        return errors::store_error_to_response(e);
    }
    Json(orchestrator.breakers().get_state(&key)).into_response()
}

pub async fn reset_all(Extension(orchestrator): Extension<Arc<Orchestrator>>) -> axum::response::Response {
    orchestrator.breakers().reset_all();
    if let Err(e) = orchestrator.persist_breakers().await {
        return errors::store_error_to_response(e);
    }
    Json(json!({ "reset": orchestrator.breakers().snapshot().len() })).into_response()
}
