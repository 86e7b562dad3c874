//! REST API Data Transfer Objects
//!
//! JSON bodies of the HTTP probe endpoints.

use serde::{Deserialize, Serialize};

/// JSON response: { success, data?, error? }
#[derive(Debug, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
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

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(message.into()),
        }
    }
}

/// Health check response
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthDto {
    pub status: String,
    pub version: String,
    pub uptime_secs: u64,
    /// Jobs waiting for the dispatch loop
    pub queue_len: usize,
    /// Open WebSocket connections
    pub active_connections: usize,
    /// Clients remembered by the message limiter
    pub tracked_clients: usize,
}

/// Liveness probe response
#[derive(Debug, Serialize, Deserialize)]
pub struct LivenessDto {
    pub status: String,
}
