//! Error taxonomy shared by server and client.
//!
//! Every failure is classified into an [`ErrorKind`] that decides how it is
//! handled: transport failures drive reconnect (client) or implicit disconnect
//! (server), protocol and execution failures become an `error` message on the
//! wire while the connection stays open.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::ids::SessionId;

/// How a failure propagates.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Dropped or timed-out transport.
    Transport,
    /// Malformed or unexpected payload.
    Protocol,
    /// The generation collaborator failed.
    Execution,
    /// Unrecoverable process-level failure.
    Fatal,
}

impl ErrorKind {
    /// Short label for logs and metrics.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Transport => "transport",
            Self::Protocol => "protocol",
            Self::Execution => "execution",
            Self::Fatal => "fatal",
        }
    }
}

/// Machine-readable code attached to `error` messages.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// The inbound payload could not be parsed.
    InvalidMessage,
    /// A query is already executing on this connection.
    Busy,
    /// The generation collaborator failed.
    ExecutionFailed,
    /// The owning connection went away mid-query.
    ConnectionClosed,
    /// The query named a different session than the connection is bound to.
    SessionMismatch,
}

impl ErrorCode {
    /// Wire string for this code.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::InvalidMessage => "invalid_message",
            Self::Busy => "busy",
            Self::ExecutionFailed => "execution_failed",
            Self::ConnectionClosed => "connection_closed",
            Self::SessionMismatch => "session_mismatch",
        }
    }
}

/// Relay error hierarchy.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    /// Transport failure (drop, reset, refused).
    #[error("transport error: {0}")]
    Transport(String),

    /// Transport did not become ready in time.
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// Malformed inbound payload.
    #[error("invalid message: {0}")]
    Protocol(String),

    /// Generation collaborator failure.
    #[error("generation failed: {0}")]
    Execution(String),

    /// A second query arrived while one is executing.
    #[error("a query is already running on this connection")]
    Busy,

    /// The connection closed before the query finished.
    #[error("connection closed before the query completed")]
    ConnectionClosed,

    /// A query named a session other than the connection's.
    #[error("query targets session {requested}, connection is bound to {bound}")]
    SessionMismatch {
        /// Session named in the query.
        requested: SessionId,
        /// Session the connection is registered under.
        bound: SessionId,
    },

    /// JSON encoding/decoding failed.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Anything that should take the process down.
    #[error("internal error: {0}")]
    Internal(String),
}

impl RelayError {
    /// Classify for propagation.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Transport(_) | Self::Timeout(_) | Self::ConnectionClosed => ErrorKind::Transport,
            Self::Protocol(_)
            | Self::Busy
            | Self::SessionMismatch { .. }
            | Self::Serialization(_) => ErrorKind::Protocol,
            Self::Execution(_) => ErrorKind::Execution,
            Self::Internal(_) => ErrorKind::Fatal,
        }
    }

    /// Code reported to the peer, if this error is ever put on the wire.
    pub fn code(&self) -> Option<ErrorCode> {
        match self {
            Self::Protocol(_) | Self::Serialization(_) => Some(ErrorCode::InvalidMessage),
            Self::Busy => Some(ErrorCode::Busy),
            Self::Execution(_) => Some(ErrorCode::ExecutionFailed),
            Self::ConnectionClosed => Some(ErrorCode::ConnectionClosed),
            Self::SessionMismatch { .. } => Some(ErrorCode::SessionMismatch),
            Self::Transport(_) | Self::Timeout(_) | Self::Internal(_) => None,
        }
    }

    /// Whether the connection survives this error.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self.kind(), ErrorKind::Fatal)
    }
}

/// A state machine was asked to move along an edge it does not have.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("invalid transition from {from} to {to}")]
pub struct InvalidTransition {
    /// State the machine was in.
    pub from: &'static str,
    /// State that was requested.
    pub to: &'static str,
}

/// Result alias for relay operations.
pub type Result<T> = std::result::Result<T, RelayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_classification() {
        assert_eq!(RelayError::Transport("reset".into()).kind(), ErrorKind::Transport);
        assert_eq!(RelayError::Timeout(Duration::from_secs(10)).kind(), ErrorKind::Transport);
        assert_eq!(RelayError::Protocol("bad".into()).kind(), ErrorKind::Protocol);
        assert_eq!(RelayError::Busy.kind(), ErrorKind::Protocol);
        assert_eq!(RelayError::Execution("boom".into()).kind(), ErrorKind::Execution);
        assert_eq!(RelayError::Internal("oom".into()).kind(), ErrorKind::Fatal);
    }

    #[test]
    fn only_internal_is_fatal() {
        assert!(RelayError::Execution("x".into()).is_recoverable());
        assert!(RelayError::Protocol("x".into()).is_recoverable());
        assert!(!RelayError::Internal("x".into()).is_recoverable());
    }

    #[test]
    fn wire_codes() {
        assert_eq!(RelayError::Busy.code(), Some(ErrorCode::Busy));
        assert_eq!(
            RelayError::Execution("x".into()).code(),
            Some(ErrorCode::ExecutionFailed)
        );
        assert_eq!(RelayError::Transport("x".into()).code(), None);
    }

    #[test]
    fn error_code_serde_matches_as_str() {
        for code in [
            ErrorCode::InvalidMessage,
            ErrorCode::Busy,
            ErrorCode::ExecutionFailed,
            ErrorCode::ConnectionClosed,
            ErrorCode::SessionMismatch,
        ] {
            let json = serde_json::to_string(&code).unwrap();
            assert_eq!(json, format!("\"{}\"", code.as_str()));
        }
    }

    #[test]
    fn invalid_transition_display() {
        let err = InvalidTransition {
            from: "closed",
            to: "idle",
        };
        assert_eq!(err.to_string(), "invalid transition from closed to idle");
    }

    #[test]
    fn session_mismatch_message_names_both_sessions() {
        let err = RelayError::SessionMismatch {
            requested: SessionId::from_raw("a"),
            bound: SessionId::from_raw("b"),
        };
        let msg = err.to_string();
        assert!(msg.contains("session a"));
        assert!(msg.contains("bound to b"));
    }
}
