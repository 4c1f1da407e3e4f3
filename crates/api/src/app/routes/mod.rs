use axum::{routing::get, Router};

pub mod backfills;
pub mod batch;
pub mod breakers;
pub mod captures;
pub mod jobs;
pub mod system;

/// Router for every versioned endpoint.
pub fn router() -> Router {
    Router::new()
        .route("/rate-limit", get(system::rate_limit))
        .nest("/captures", captures::router())
        .nest("/jobs", jobs::router())
        .nest("/breakers", breakers::router())
        .nest("/backfills", backfills::router())
        .nest("/batch", batch::router())
}
