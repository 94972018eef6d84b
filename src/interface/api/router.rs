//! API Router configuration

use super::queue_handler::{get_queue, health_check, promote_next, ApiState};
use axum::{
    http::StatusCode,
    routing::{get, post},
    Router,
};
use std::time::Duration;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

/// Request timeout for the control plane
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Build the API router
pub fn build_router(state: ApiState) -> Router {
    // Health check route
    let health_routes = Router::new().route("/health", get(health_check));

    // Call queue routes
    let queue_routes = Router::new()
        .route("/queue", get(get_queue))
        .route("/queue/promote", post(promote_next));

    Router::new()
        .merge(health_routes)
        .merge(queue_routes)
        .with_state(state)
        .layer(timeout_layer(REQUEST_TIMEOUT))
        .layer(CatchPanicLayer::new())
        .layer(TraceLayer::new_for_http())
}

/// Answers `408 Request Timeout` once `timeout` elapses
fn timeout_layer(timeout: Duration) -> TimeoutLayer {
    TimeoutLayer::with_status_code(StatusCode::REQUEST_TIMEOUT, timeout)
}
