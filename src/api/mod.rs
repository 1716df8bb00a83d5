use crate::state::AppState;
use axum::Router;
use axum::routing::{get, post};
use std::sync::Arc;

pub mod handlers;
pub mod responses;

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/collection/route", post(handlers::post_route))
        .route("/api/forecast/{sensor_id}", get(handlers::get_forecast))
        .route(
            "/api/regions/{region_id}/levels",
            get(handlers::get_region_levels),
        )
        .route("/api/health", get(handlers::get_health))
        .with_state(state)
}
