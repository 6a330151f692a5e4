//! `/health` endpoint.

use serde::Serialize;
use std::time::Instant;

use crate::registry::RegistryStats;

/// Health check response body.
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    /// Always `"ok"` when the server is running.
    pub status: String,
    /// Seconds since the server started.
    pub uptime_secs: u64,
    /// Sessions with a live connection.
    pub active_connections: usize,
    /// Messages waiting in offline buffers across all sessions.
    pub total_buffered_messages: usize,
    /// Sessions holding at least one buffered message.
    pub sessions_with_buffer: usize,
    /// Messages delivered since start.
    pub total_messages_sent: u64,
}

/// Build a health response from registry counters.
pub fn health_check(start_time: Instant, stats: &RegistryStats) -> HealthResponse {
    HealthResponse {
        status: "ok".into(),
        uptime_secs: start_time.elapsed().as_secs(),
        active_connections: stats.active_connections,
        total_buffered_messages: stats.total_buffered_messages,
        sessions_with_buffer: stats.sessions_with_buffer,
        total_messages_sent: stats.total_messages_sent,
    }
}
