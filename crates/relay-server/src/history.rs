//! Session history collaborator.
//!
//! After each query the executor reports a [`HistoryEntry`] to a
//! [`SessionStore`]. Recording is best-effort: failures are logged and never
//! reach the client.

use std::collections::VecDeque;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use relay_core::SessionId;
use serde::{Deserialize, Serialize};

/// Failure reported by a store.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum HistoryError {
    /// The store could not accept the entry.
    #[error("history store unavailable: {0}")]
    Unavailable(String),
}

/// How a query ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryOutcome {
    /// Ended with `complete`.
    Completed,
    /// Ended with `error`.
    Failed,
}

/// One finished query.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEntry {
    /// Prompt text.
    pub query: String,
    /// Characters of generated text.
    pub response_length: usize,
    /// When the query finished.
    pub timestamp: DateTime<Utc>,
    /// Terminal outcome.
    pub outcome: QueryOutcome,
}

/// Records finished queries and supplies context for later ones.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Record a finished query.
    async fn record(&self, session_id: &SessionId, entry: HistoryEntry) -> Result<(), HistoryError>;

    /// Context to hand the generator when a query asks for it.
    async fn context(&self, _session_id: &SessionId) -> Option<String> {
        None
    }
}

/// Store that discards everything.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopSessionStore;

#[async_trait]
impl SessionStore for NoopSessionStore {
    async fn record(&self, _session_id: &SessionId, _entry: HistoryEntry) -> Result<(), HistoryError> {
        Ok(())
    }
}

/// Keeps the last few entries per session in memory.
pub struct InMemorySessionStore {
    entries: DashMap<SessionId, VecDeque<HistoryEntry>>,
    max_per_session: usize,
}

impl InMemorySessionStore {
    /// Retain at most `max_per_session` entries per session.
    pub fn new(max_per_session: usize) -> Self {
        Self {
            entries: DashMap::new(),
            max_per_session: max_per_session.max(1),
        }
    }

    /// Entries for a session, oldest first.
    pub fn entries(&self, session_id: &SessionId) -> Vec<HistoryEntry> {
        self.entries
            .get(session_id)
            .map(|e| e.iter().cloned().collect())
            .unwrap_or_default()
    }
}

impl Default for InMemorySessionStore {
    fn default() -> Self {
        Self::new(20)
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn record(&self, session_id: &SessionId, entry: HistoryEntry) -> Result<(), HistoryError> {
        let mut log = self.entries.entry(session_id.clone()).or_default();
        if log.len() >= self.max_per_session {
            let _ = log.pop_front();
        }
        log.push_back(entry);
        Ok(())
    }

    async fn context(&self, session_id: &SessionId) -> Option<String> {
        let log = self.entries.get(session_id)?;
        let answered: Vec<&HistoryEntry> = log
            .iter()
            .filter(|e| e.outcome == QueryOutcome::Completed)
            .collect();
        if answered.is_empty() {
            return None;
        }
        let mut context = String::from("Earlier in this session the user asked:");
        for entry in answered {
            context.push_str("\n- ");
            context.push_str(&entry.query);
        }
        Some(context)
    }
}
