//! Client errors.

use std::time::Duration;

use relay_core::RelayError;

/// Errors surfaced by the connection manager and its transports.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// The transport failed or dropped.
    #[error("transport error: {0}")]
    Transport(String),

    /// The transport did not open in time.
    #[error("connection timed out after {0:?}")]
    Timeout(Duration),

    /// The server refused the handshake (401/403).
    #[error("handshake rejected with HTTP {status}")]
    Rejected {
        /// HTTP status of the refusal.
        status: u16,
    },

    /// Any other non-101 handshake response.
    #[error("handshake failed with HTTP {status}")]
    Handshake {
        /// HTTP status returned.
        status: u16,
    },

    /// The manager task is gone.
    #[error("connection manager has shut down")]
    Closed,

    /// Protocol encoding or decoding failed.
    #[error(transparent)]
    Relay(#[from] RelayError),
}

impl ClientError {
    /// Whether retrying can help. Rejected handshakes are final.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::Rejected { .. } | Self::Closed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejection_is_final() {
        assert!(!ClientError::Rejected { status: 401 }.is_retryable());
        assert!(!ClientError::Closed.is_retryable());
        assert!(ClientError::Handshake { status: 502 }.is_retryable());
        assert!(ClientError::Timeout(Duration::from_secs(10)).is_retryable());
        assert!(ClientError::Transport("reset".into()).is_retryable());
    }

    #[test]
    fn relay_errors_convert() {
        let err: ClientError = RelayError::Protocol("bad".into()).into();
        assert_eq!(err.to_string(), "invalid message: bad");
    }
}
