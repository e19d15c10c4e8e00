//! `/healthz` endpoint.

use serde::Serialize;
use std::time::Instant;

/// Health check response body.
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    /// Always `"ok"` when the process is serving HTTP.
    pub status: &'static str,
    /// Seconds since the server started.
    pub uptime_secs: u64,
}

/// Build a health response. Does not look at session state.
pub fn health_check(start_time: Instant) -> HealthResponse {
    HealthResponse {
        status: "ok",
        uptime_secs: start_time.elapsed().as_secs(),
    }
}
