//! Why a relay settings file was refused.

use std::path::PathBuf;

use thiserror::Error;

/// Settings could not be turned into a usable [`RelaySettings`](crate::RelaySettings).
#[derive(Debug, Error)]
pub enum SettingsError {
    /// The file exists but could not be read.
    #[error("cannot read {}: {source}", path.display())]
    Unreadable {
        /// File that was opened.
        path: PathBuf,
        /// Underlying I/O failure.
        source: std::io::Error,
    },
    /// The file is not JSON, or a key has the wrong type.
    #[error("malformed relay settings: {0}")]
    Malformed(#[from] serde_json::Error),
    /// A single value is outside what the relay can run with.
    #[error("{field} {reason}")]
    OutOfRange {
        /// camelCase path of the offending key, e.g. `server.bufferCapacity`.
        field: &'static str,
        /// What the value must satisfy.
        reason: &'static str,
    },
    /// The client reconnect floor sits above its ceiling.
    #[error("client.initialReconnectDelayMs ({initial_ms}) exceeds client.maxReconnectDelayMs ({max_ms})")]
    ReconnectDelayInverted {
        /// Configured first delay.
        initial_ms: u64,
        /// Configured cap.
        max_ms: u64,
    },
}

impl SettingsError {
    pub(crate) fn at_least_one(field: &'static str) -> Self {
        Self::OutOfRange {
            field,
            reason: "must be at least 1",
        }
    }
}

/// Result type for settings operations.
pub type Result<T> = std::result::Result<T, SettingsError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn out_of_range_names_the_key() {
        let err = SettingsError::at_least_one("server.bufferCapacity");
        assert_eq!(err.to_string(), "server.bufferCapacity must be at least 1");
    }

    #[test]
    fn inverted_delays_report_both_values() {
        let err = SettingsError::ReconnectDelayInverted {
            initial_ms: 5000,
            max_ms: 1000,
        };
        let text = err.to_string();
        assert!(text.contains("(5000)"));
        assert!(text.contains("(1000)"));
    }

    #[test]
    fn unreadable_includes_path() {
        let err = SettingsError::Unreadable {
            path: PathBuf::from("/etc/relay/settings.json"),
            source: std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied"),
        };
        assert!(err.to_string().starts_with("cannot read /etc/relay/settings.json"));
    }
}
