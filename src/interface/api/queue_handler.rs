//! Call queue endpoints

use super::dto::{ApiResponse, PromoteResponse, QueueResponse};
use crate::domain::Session;
use crate::infrastructure::protocols::sip::CallControl;
use axum::{extract::State, http::StatusCode, response::Json};
use std::sync::Arc;
use tracing::info;

/// Shared state for the control-plane API
#[derive(Clone)]
pub struct ApiState {
    pub calls: Arc<CallControl>,
}

/// Health check
pub async fn health_check() -> Json<ApiResponse<&'static str>> {
    Json(ApiResponse::success("OK"))
}

/// Current call and waiting list
pub async fn get_queue(State(state): State<ApiState>) -> Json<ApiResponse<QueueResponse>> {
    let queue = state.calls.queue();
    Json(ApiResponse::success(QueueResponse::new(
        queue.snapshot(),
        queue.max_waiting(),
    )))
}

/// Serve the next waiting call, replacing the current one
pub async fn promote_next(
    State(state): State<ApiState>,
) -> (StatusCode, Json<ApiResponse<PromoteResponse>>) {
    match state.calls.promote() {
        Some(promotion) => {
            info!("API: promoted call {}", promotion.current.id());
            (
                StatusCode::OK,
                Json(ApiResponse::success(PromoteResponse {
                    current: promotion.current.id().to_string(),
                    previous: promotion.previous.map(|p| p.id().to_string()),
                })),
            )
        }
        None => (
            StatusCode::CONFLICT,
            Json(ApiResponse::error("No call is waiting".to_string())),
        ),
    }
}
