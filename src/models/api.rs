use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Health check response.
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    /// Service health status
    pub status: String,
    /// Service version
    pub version: String,
    /// Seconds since startup
    pub uptime_seconds: u64,
    /// Current timestamp
    pub timestamp: DateTime<Utc>,
}

/// Echo of the received request.
#[derive(Debug, Serialize, Deserialize)]
pub struct EchoResponse {
    /// Request ID assigned by the middleware, if any
    pub request_id: Option<String>,
    /// Raw query string
    pub query: Option<String>,
    /// Request body as UTF-8 (lossy)
    pub body: String,
}

/// Result of a delayed request.
#[derive(Debug, Serialize, Deserialize)]
pub struct DelayResponse {
    /// Requested delay in milliseconds
    pub requested_ms: u64,
    /// Time actually spent waiting
    pub waited_ms: u64,
    /// `false` when the wait was cut short by the request deadline
    pub completed: bool,
}
