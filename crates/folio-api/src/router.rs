use std::sync::Arc;

use axum::{
    Router,
    routing::{get, post},
};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use crate::{handlers, state::AppState};

pub fn api_router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health/live", get(handlers::health::health_live))
        .route("/jobs", get(handlers::jobs::list_jobs))
        .route("/jobs/{job_id}", get(handlers::jobs::get_job))
        .route("/jobs/{job_id}/events", get(handlers::jobs::job_events))
        .route(
            "/documents/{document_id}/beautify",
            post(handlers::jobs::create_job),
        )
        .route(
            "/documents/{document_id}/pages",
            get(handlers::documents::list_pages),
        )
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
}
