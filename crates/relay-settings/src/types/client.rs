//! Client connection manager settings.

use serde::{Deserialize, Serialize};

use crate::errors::SettingsError;

/// Connection, keepalive and reconnect settings for the client.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ClientSettings {
    /// WebSocket endpoint, without query parameters.
    pub url: String,
    /// Time allowed for the transport to open.
    pub connect_timeout_ms: u64,
    /// Interval between client `ping` messages.
    pub keepalive_interval_ms: u64,
    /// Delay before the first reconnect attempt.
    pub initial_reconnect_delay_ms: u64,
    /// Upper bound on the reconnect delay.
    pub max_reconnect_delay_ms: u64,
    /// Reconnect attempts before giving up with `error`.
    pub max_reconnect_attempts: u32,
    /// Bound on the outbound queue; oldest entries drop first.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_queue_size: Option<usize>,
    /// Treat the connection as lost when no `pong` arrives in this window.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pong_timeout_ms: Option<u64>,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:8080/ws".to_string(),
            connect_timeout_ms: 10_000,
            keepalive_interval_ms: 30_000,
            initial_reconnect_delay_ms: 1_000,
            max_reconnect_delay_ms: 30_000,
            max_reconnect_attempts: 5,
            max_queue_size: None,
            pong_timeout_ms: None,
        }
    }
}

impl ClientSettings {
    pub(crate) fn validate(&self) -> Result<(), SettingsError> {
        if self.initial_reconnect_delay_ms > self.max_reconnect_delay_ms {
            return Err(SettingsError::ReconnectDelayInverted {
                initial_ms: self.initial_reconnect_delay_ms,
                max_ms: self.max_reconnect_delay_ms,
            });
        }
        if self.max_queue_size == Some(0) {
            return Err(SettingsError::at_least_one("client.maxQueueSize"));
        }
        Ok(())
    }
}
