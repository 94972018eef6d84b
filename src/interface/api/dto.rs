//! API response envelopes

use crate::domain::QueueSnapshot;
use serde::Serialize;

/// Standard API response
#[derive(Debug, Serialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub data: Option<T>,
    pub error: Option<String>,
}

impl<T> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn error(message: String) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(message),
        }
    }
}

/// Queue state as exposed over HTTP
#[derive(Debug, Serialize)]
pub struct QueueResponse {
    pub current: Option<String>,
    pub waiting: Vec<String>,
    pub max_waiting: usize,
}

impl QueueResponse {
    pub fn new(snapshot: QueueSnapshot, max_waiting: usize) -> Self {
        Self {
            current: snapshot.current,
            waiting: snapshot.waiting,
            max_waiting,
        }
    }
}

/// Result of an explicit promotion
#[derive(Debug, Serialize)]
pub struct PromoteResponse {
    pub current: String,
    pub previous: Option<String>,
}
