//! Prometheus metrics recorder and metric names.

use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};
use tracing::info;

/// Install the Prometheus metrics recorder (global).
///
/// Returns the handle used to render `/metrics`. Fails if another recorder
/// is already installed.
pub fn install_recorder() -> Result<PrometheusHandle, BuildError> {
    let handle = PrometheusBuilder::new().install_recorder()?;
    info!("prometheus metrics recorder installed");
    Ok(handle)
}

/// Render Prometheus text format from the installed recorder.
pub fn render(handle: &PrometheusHandle) -> String {
    handle.render()
}

// Metric name constants to avoid typos across modules.

/// WebSocket connections accepted (counter).
pub const WS_CONNECTIONS_TOTAL: &str = "ws_connections_total";
/// WebSocket connections ended (counter, labels: reason).
pub const WS_DISCONNECTIONS_TOTAL: &str = "ws_disconnections_total";
/// Open WebSocket connections (gauge).
pub const WS_CONNECTIONS_ACTIVE: &str = "ws_connections_active";
/// Time a handle stayed registered (histogram).
pub const SESSION_CONNECTED_SECONDS: &str = "session_connected_seconds";
/// Handles replaced by a newer connection for the same session (counter).
pub const SESSIONS_SUPERSEDED_TOTAL: &str = "sessions_superseded_total";
/// Sessions dropped by administrative cleanup (counter).
pub const SESSIONS_REMOVED_TOTAL: &str = "sessions_removed_total";
/// Messages handed to a live connection (counter).
pub const MESSAGES_SENT_TOTAL: &str = "messages_sent_total";
/// Messages deferred to the offline buffer (counter).
pub const MESSAGES_BUFFERED_TOTAL: &str = "messages_buffered_total";
/// Buffered messages evicted by overflow (counter).
pub const MESSAGES_EVICTED_TOTAL: &str = "messages_evicted_total";
/// Buffered messages delivered on reconnect (counter).
pub const MESSAGES_FLUSHED_TOTAL: &str = "messages_flushed_total";
/// Broadcast targets pruned because their transport was gone (counter).
pub const BROADCAST_PRUNED_TOTAL: &str = "broadcast_pruned_total";
/// Inbound frames that failed to parse (counter).
pub const PROTOCOL_ERRORS_TOTAL: &str = "protocol_errors_total";
/// Queries accepted (counter).
pub const QUERIES_STARTED_TOTAL: &str = "queries_started_total";
/// Queries that ended with `complete` (counter).
pub const QUERIES_COMPLETED_TOTAL: &str = "queries_completed_total";
/// Queries that ended with `error` (counter, labels: reason).
pub const QUERIES_FAILED_TOTAL: &str = "queries_failed_total";
/// Query wall time (histogram).
pub const QUERY_DURATION_SECONDS: &str = "query_duration_seconds";
/// Chunks per completed query (histogram).
pub const QUERY_CHUNKS: &str = "query_chunks";
/// History notifications that failed (counter).
pub const HISTORY_FAILURES_TOTAL: &str = "history_failures_total";
