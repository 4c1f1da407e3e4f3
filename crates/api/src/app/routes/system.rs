use std::sync::Arc;

use axum::{extract::Extension, http::StatusCode, response::IntoResponse, Json};

use hybridcap_infra::Orchestrator;

use crate::app::dto;

pub async fn health() -> StatusCode {
    StatusCode::OK
}

/// Last observed remote quota.
pub async fn rate_limit(Extension(orchestrator): Extension<Arc<Orchestrator>>) -> impl IntoResponse {
    let governor = orchestrator.governor();
    Json(dto::RateLimitView {
        rate_limit: governor.current(),
        wait_before_next_call_ms: u64::try_from(governor.wait_before_next_call().as_millis())
            .unwrap_or(u64::MAX),
    })
}
