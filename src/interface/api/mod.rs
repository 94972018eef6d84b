//! API interface implementations

pub mod dto;
pub mod queue_handler;
pub mod router;

pub use dto::{ApiResponse, PromoteResponse, QueueResponse};
pub use queue_handler::ApiState;
pub use router::build_router;
