//! Client connection status and its transition table.

use std::fmt;

use relay_core::InvalidTransition;

/// Connection status of a [`ConnectionManager`](crate::ConnectionManager).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum ConnectionStatus {
    /// Idle; no transport and no pending reconnect.
    #[default]
    Disconnected,
    /// A transport open is in flight.
    Connecting,
    /// Transport open; sends go straight out.
    Connected,
    /// Waiting out the backoff delay before the next attempt.
    Reconnecting,
    /// Gave up: attempts exhausted or the handshake was rejected.
    Error,
}

impl ConnectionStatus {
    /// Lowercase label.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
            Self::Error => "error",
        }
    }

    /// Whether the table has an edge from `self` to `next`.
    pub fn can_transition(self, next: Self) -> bool {
        use ConnectionStatus::{Connected, Connecting, Disconnected, Error, Reconnecting};
        matches!(
            (self, next),
            (Disconnected, Connecting)
                | (Connecting, Connected | Reconnecting | Error | Disconnected)
                | (Connected, Reconnecting | Disconnected | Error)
                | (Reconnecting, Connecting | Disconnected | Error)
                | (Error, Connecting | Disconnected)
        )
    }

    /// Move to `next`, rejecting edges the table does not have.
    pub fn transition(self, next: Self) -> Result<Self, InvalidTransition> {
        if self.can_transition(next) {
            Ok(next)
        } else {
            Err(InvalidTransition {
                from: self.as_str(),
                to: next.as_str(),
            })
        }
    }

    /// `connecting` or `connected`: a manual `connect()` is a no-op.
    pub fn is_active(self) -> bool {
        matches!(self, Self::Connecting | Self::Connected)
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
