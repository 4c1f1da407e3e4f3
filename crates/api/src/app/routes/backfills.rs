use std::sync::Arc;

use axum::{
    extract::{Extension, Path, Query},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};

use hybridcap_infra::Orchestrator;

use crate::app::{dto, errors};

pub fn router() -> Router {
    Router::new()
        .route("/", get(list_backfills))
        .route("/:resource_id", get(get_backfill))
        .route("/:resource_id/reactivate", post(reactivate_backfill))
}

pub async fn list_backfills(
    Extension(orchestrator): Extension<Arc<Orchestrator>>,
    Query(query): Query<dto::BackfillListQuery>,
) -> axum::response::Response {
    let status = match query.status() {
        Ok(status) => status,
        Err(resp) => return resp,
    };
    match orchestrator.backfills().list(status, query.limit()).await {
        Ok(states) => {
            let views: Vec<dto::BackfillView> = states.into_iter().map(Into::into).collect();
            Json(views).into_response()
        }
        Err(e) => errors::store_error_to_response(e),
    }
}

pub async fn get_backfill(
    Extension(orchestrator): Extension<Arc<Orchestrator>>,
    Path(resource_id): Path<String>,
) -> axum::response::Response {
    let resource_id = match dto::parse_resource_id(&resource_id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    match orchestrator.backfills().get(&resource_id).await {
        Ok(Some(state)) => Json(dto::BackfillView::from(state)).into_response(),
        Ok(None) => errors::json_error(StatusCode::NOT_FOUND, "not_found", "backfill not found"),
        Err(e) => errors::store_error_to_response(e),
    }
}

/// Resume a paused backfill.
pub async fn reactivate_backfill(
    Extension(orchestrator): Extension<Arc<Orchestrator>>,
    Path(resource_id): Path<String>,
) -> axum::response::Response {
    let resource_id = match dto::parse_resource_id(&resource_id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    match orchestrator.machine().reactivate(&resource_id).await {
        Ok(state) => Json(dto::BackfillView::from(state)).into_response(),
        Err(e) => errors::capture_error_to_response(e),
    }
}
