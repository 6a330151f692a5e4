//! Per-connection state machine.

use relay_core::InvalidTransition;

/// Where a connection is in its lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionPhase {
    /// Accepted, nothing received yet.
    AwaitingFirstMessage,
    /// Ready for a query.
    Idle,
    /// A query is running.
    ExecutingQuery,
    /// Terminal.
    Closed,
}

impl ConnectionPhase {
    /// Label for logs and errors.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::AwaitingFirstMessage => "awaiting_first_message",
            Self::Idle => "idle",
            Self::ExecutingQuery => "executing_query",
            Self::Closed => "closed",
        }
    }

    /// Whether `next` is a legal successor.
    pub fn can_transition(self, next: Self) -> bool {
        use ConnectionPhase::{AwaitingFirstMessage, Closed, ExecutingQuery, Idle};
        matches!(
            (self, next),
            (AwaitingFirstMessage, Idle | ExecutingQuery | Closed)
                | (Idle, ExecutingQuery | Closed)
                | (ExecutingQuery, Idle | Closed)
        )
    }

    /// Move to `next`, rejecting edges the machine does not have.
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

    /// Whether a new query would be rejected as busy.
    pub fn is_busy(self) -> bool {
        self == Self::ExecutingQuery
    }
}
