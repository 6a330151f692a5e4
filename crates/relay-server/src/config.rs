//! Server configuration.

use std::time::Duration;

use relay_settings::ServerSettings;
use serde::{Deserialize, Serialize};

/// Runtime configuration for [`RelayServer`](crate::server::RelayServer).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Host to bind (default `"127.0.0.1"`).
    pub host: String,
    /// Port to bind (default `0` for auto-assign).
    pub port: u16,
    /// Per-session offline buffer capacity.
    pub buffer_capacity: usize,
    /// Interval between `keepalive` messages on each connection.
    pub keepalive_interval: Duration,
    /// Idle sessions without a handle are swept after this long.
    pub session_idle_timeout: Option<Duration>,
    /// How often the idle sweep runs.
    pub cleanup_interval: Duration,
    /// Max WebSocket message size in bytes.
    pub max_message_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 0,
            buffer_capacity: 100,
            keepalive_interval: Duration::from_secs(30),
            session_idle_timeout: None,
            cleanup_interval: Duration::from_secs(60),
            max_message_size: 1024 * 1024,
        }
    }
}

impl From<&ServerSettings> for ServerConfig {
    fn from(settings: &ServerSettings) -> Self {
        Self {
            host: settings.host.clone(),
            port: settings.port,
            buffer_capacity: settings.buffer_capacity,
            keepalive_interval: Duration::from_secs(settings.keepalive_interval_secs),
            session_idle_timeout: settings.session_idle_timeout_secs.map(Duration::from_secs),
            cleanup_interval: Duration::from_secs(settings.cleanup_interval_secs),
            max_message_size: settings.max_message_size,
        }
    }
}

impl ServerConfig {
    /// `host:port` for binding.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
