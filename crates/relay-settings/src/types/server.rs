//! Server-side settings.

use serde::{Deserialize, Serialize};

use crate::errors::SettingsError;

/// Endpoint, registry and keepalive settings.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerSettings {
    /// Bind address.
    pub host: String,
    /// Listen port (0 picks an ephemeral port).
    pub port: u16,
    /// Per-session offline buffer capacity.
    pub buffer_capacity: usize,
    /// Interval between server `keepalive` messages, in seconds.
    pub keepalive_interval_secs: u64,
    /// Sessions with no handle and no activity for this long are swept.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_idle_timeout_secs: Option<u64>,
    /// How often the idle sweep runs, in seconds.
    pub cleanup_interval_secs: u64,
    /// Largest inbound frame accepted, in bytes.
    pub max_message_size: usize,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
            buffer_capacity: 100,
            keepalive_interval_secs: 30,
            session_idle_timeout_secs: None,
            cleanup_interval_secs: 60,
            max_message_size: 1024 * 1024,
        }
    }
}

impl ServerSettings {
    pub(crate) fn validate(&self) -> Result<(), SettingsError> {
        if self.buffer_capacity == 0 {
            return Err(SettingsError::at_least_one("server.bufferCapacity"));
        }
        if self.keepalive_interval_secs == 0 {
            return Err(SettingsError::at_least_one("server.keepaliveIntervalSecs"));
        }
        if self.cleanup_interval_secs == 0 {
            return Err(SettingsError::at_least_one("server.cleanupIntervalSecs"));
        }
        Ok(())
    }

    /// `host:port` for binding.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
