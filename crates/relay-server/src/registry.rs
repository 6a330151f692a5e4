//! Session registry: the authoritative map from session to live connection.
//!
//! Every session owns at most one [`ConnectionHandle`] and one bounded
//! [`MessageBuffer`]. All mutations for a session happen under its map entry,
//! so `connect`, `disconnect`, `send` and the buffer flush never interleave
//! for the same session.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use metrics::{counter, histogram};
use relay_core::{ConnectionId, RelayError, ServerMessage, SessionId, UserId};
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::buffer::{BufferedMessage, MessageBuffer};
use crate::websocket::connection::ConnectionHandle;

/// Where a message went.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SendOutcome {
    /// Handed to the live connection.
    Sent,
    /// Stored in the offline buffer.
    Buffered,
}

/// Point-in-time counters for the health surface.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct RegistryStats {
    /// Sessions holding a live handle.
    pub active_connections: usize,
    /// Messages waiting across all buffers.
    pub total_buffered_messages: usize,
    /// Sessions with a non-empty buffer.
    pub sessions_with_buffer: usize,
    /// Messages handed to live connections since startup.
    pub total_messages_sent: u64,
}

/// Read-only view of one session.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct SessionSnapshot {
    /// Session identifier.
    pub session_id: SessionId,
    /// User the session was registered for.
    pub user_id: Option<UserId>,
    /// Current connection, if any.
    pub connection_id: Option<ConnectionId>,
    /// When the session was first seen.
    pub created_at: DateTime<Utc>,
    /// Last connect or delivered message.
    pub last_activity: DateTime<Utc>,
    /// Messages delivered over the session's lifetime.
    pub message_count: u64,
    /// Messages currently buffered.
    pub buffered: usize,
}

impl SessionSnapshot {
    /// Whether a live handle is registered.
    pub fn is_connected(&self) -> bool {
        self.connection_id.is_some()
    }
}

struct SessionEntry {
    user_id: Option<UserId>,
    handle: Option<ConnectionHandle>,
    buffer: MessageBuffer,
    created_at: DateTime<Utc>,
    last_activity: DateTime<Utc>,
    last_seen: Instant,
    message_count: u64,
}

impl SessionEntry {
    fn new(capacity: usize) -> Self {
        let now = Utc::now();
        Self {
            user_id: None,
            handle: None,
            buffer: MessageBuffer::new(capacity),
            created_at: now,
            last_activity: now,
            last_seen: Instant::now(),
            message_count: 0,
        }
    }

    fn touch(&mut self) {
        self.last_activity = Utc::now();
        self.last_seen = Instant::now();
    }

    fn record_delivered(&mut self, count: u64) {
        self.message_count += count;
        self.touch();
    }
}

/// Shared registry of sessions, their handles, and their offline buffers.
pub struct SessionRegistry {
    sessions: DashMap<SessionId, SessionEntry>,
    buffer_capacity: usize,
    total_sent: AtomicU64,
}

impl SessionRegistry {
    /// Create a registry whose sessions buffer up to `buffer_capacity` messages.
    pub fn new(buffer_capacity: usize) -> Self {
        Self {
            sessions: DashMap::new(),
            buffer_capacity: buffer_capacity.max(1),
            total_sent: AtomicU64::new(0),
        }
    }

    /// Register `handle` as the session's live connection.
    ///
    /// Any previous handle is returned for its owner to close. Buffered
    /// messages are delivered through the new handle in enqueue order before
    /// this returns. If the handle dies mid-flush, the rest go back into the
    /// buffer and the handle is cleared.
    pub fn connect(
        &self,
        session_id: &SessionId,
        user_id: Option<UserId>,
        handle: ConnectionHandle,
    ) -> Option<ConnectionHandle> {
        let mut entry = self
            .sessions
            .entry(session_id.clone())
            .or_insert_with(|| SessionEntry::new(self.buffer_capacity));

        if user_id.is_some() {
            entry.user_id = user_id;
        }
        let previous = entry.handle.replace(handle.clone());
        entry.touch();

        let mut pending = entry.buffer.take_all();
        let mut delivered = 0u64;
        while let Some(message) = pending.pop_front() {
            if !handle.send(Arc::clone(&message.payload)) {
                pending.push_front(message);
                break;
            }
            delivered += 1;
        }

        if !pending.is_empty() {
            warn!(
                %session_id,
                remaining = pending.len(),
                "connection closed during buffer flush, requeueing"
            );
            entry.handle = None;
            let dropped = entry.buffer.restore_front(pending);
            if dropped > 0 {
                counter!(crate::metrics::MESSAGES_EVICTED_TOTAL).increment(dropped as u64);
            }
        }

        if delivered > 0 {
            entry.record_delivered(delivered);
            let _ = self.total_sent.fetch_add(delivered, Ordering::Relaxed);
            counter!(crate::metrics::MESSAGES_FLUSHED_TOTAL).increment(delivered);
            counter!(crate::metrics::MESSAGES_SENT_TOTAL).increment(delivered);
        }

        if let Some(prev) = previous.as_ref() {
            counter!(crate::metrics::SESSIONS_SUPERSEDED_TOTAL).increment(1);
            debug!(%session_id, previous = %prev.id(), current = %handle.id(), "handle superseded");
        }
        info!(%session_id, connection_id = %handle.id(), flushed = delivered, "session connected");
        previous
    }

    /// Clear the session's live handle, keeping its buffer. Idempotent.
    ///
    /// Returns `true` if a handle was removed.
    pub fn disconnect(&self, session_id: &SessionId) -> bool {
        let Some(mut entry) = self.sessions.get_mut(session_id) else {
            return false;
        };
        let Some(handle) = entry.handle.take() else {
            return false;
        };
        Self::record_disconnect(session_id, &handle, entry.message_count);
        true
    }

    /// Clear the handle only if it is still `connection_id`.
    ///
    /// A connection that was superseded uses this on its way out so it cannot
    /// unregister its successor.
    pub fn disconnect_connection(&self, session_id: &SessionId, connection_id: &ConnectionId) -> bool {
        let Some(mut entry) = self.sessions.get_mut(session_id) else {
            return false;
        };
        if entry.handle.as_ref().map(ConnectionHandle::id) != Some(connection_id) {
            return false;
        }
        let Some(handle) = entry.handle.take() else {
            return false;
        };
        Self::record_disconnect(session_id, &handle, entry.message_count);
        true
    }

    fn record_disconnect(session_id: &SessionId, handle: &ConnectionHandle, message_count: u64) {
        let duration = handle.age();
        histogram!(crate::metrics::SESSION_CONNECTED_SECONDS).record(duration.as_secs_f64());
        info!(
            %session_id,
            connection_id = %handle.id(),
            duration_ms = duration.as_millis() as u64,
            connection_messages = handle.sent_count(),
            message_count,
            "session disconnected"
        );
    }

    /// Serialize and send a message to the session.
    pub fn send(&self, session_id: &SessionId, message: &ServerMessage) -> Result<SendOutcome, RelayError> {
        let payload = Arc::new(message.to_json()?);
        Ok(self.send_raw(session_id, payload))
    }

    /// Send a pre-serialized frame. Transmits on a live handle, otherwise
    /// buffers. Buffer state is created on demand.
    pub fn send_raw(&self, session_id: &SessionId, payload: Arc<String>) -> SendOutcome {
        let mut entry = self
            .sessions
            .entry(session_id.clone())
            .or_insert_with(|| SessionEntry::new(self.buffer_capacity));

        if let Some(handle) = entry.handle.as_ref() {
            if handle.send(Arc::clone(&payload)) {
                entry.record_delivered(1);
                let _ = self.total_sent.fetch_add(1, Ordering::Relaxed);
                counter!(crate::metrics::MESSAGES_SENT_TOTAL).increment(1);
                return SendOutcome::Sent;
            }
            debug!(%session_id, "handle transport gone, treating as disconnected");
            if let Some(handle) = entry.handle.take() {
                Self::record_disconnect(session_id, &handle, entry.message_count);
            }
        }

        let evicted = entry
            .buffer
            .push(BufferedMessage::new(session_id.clone(), payload));
        counter!(crate::metrics::MESSAGES_BUFFERED_TOTAL).increment(1);
        if let Some(old) = evicted {
            counter!(crate::metrics::MESSAGES_EVICTED_TOTAL).increment(1);
            debug!(
                %session_id,
                enqueued_at = %old.enqueued_at,
                capacity = entry.buffer.capacity(),
                "buffer full, evicted oldest message"
            );
        }
        SendOutcome::Buffered
    }

    /// Send to every connected session not in `exclude`.
    ///
    /// Handles whose transport is gone are removed. Returns the number of
    /// successful sends.
    pub fn broadcast(&self, message: &ServerMessage, exclude: &HashSet<SessionId>) -> Result<usize, RelayError> {
        let payload = Arc::new(message.to_json()?);
        let mut delivered = 0usize;
        let mut pruned = 0u64;

        for mut item in self.sessions.iter_mut() {
            if exclude.contains(item.key()) {
                continue;
            }
            let (session_id, entry) = item.pair_mut();
            let Some(handle) = entry.handle.as_ref() else {
                continue;
            };
            if handle.send(Arc::clone(&payload)) {
                entry.record_delivered(1);
                delivered += 1;
            } else if let Some(handle) = entry.handle.take() {
                Self::record_disconnect(session_id, &handle, entry.message_count);
                pruned += 1;
            }
        }

        let _ = self.total_sent.fetch_add(delivered as u64, Ordering::Relaxed);
        counter!(crate::metrics::MESSAGES_SENT_TOTAL).increment(delivered as u64);
        if pruned > 0 {
            counter!(crate::metrics::BROADCAST_PRUNED_TOTAL).increment(pruned);
        }
        debug!(delivered, pruned, kind = message.type_name(), "broadcast");
        Ok(delivered)
    }

    /// Eventually-consistent counters across all sessions.
    pub fn statistics(&self) -> RegistryStats {
        let mut stats = RegistryStats {
            total_messages_sent: self.total_sent.load(Ordering::Relaxed),
            ..RegistryStats::default()
        };
        for entry in &self.sessions {
            if entry.handle.is_some() {
                stats.active_connections += 1;
            }
            let buffered = entry.buffer.len();
            if buffered > 0 {
                stats.total_buffered_messages += buffered;
                stats.sessions_with_buffer += 1;
            }
        }
        stats
    }

    /// Read-only view of one session.
    pub fn session_snapshot(&self, session_id: &SessionId) -> Option<SessionSnapshot> {
        self.sessions.get(session_id).map(|entry| SessionSnapshot {
            session_id: session_id.clone(),
            user_id: entry.user_id.clone(),
            connection_id: entry.handle.as_ref().map(|h| h.id().clone()),
            created_at: entry.created_at,
            last_activity: entry.last_activity,
            message_count: entry.message_count,
            buffered: entry.buffer.len(),
        })
    }

    /// Whether the session currently holds a live handle.
    pub fn is_connected(&self, session_id: &SessionId) -> bool {
        self.sessions
            .get(session_id)
            .is_some_and(|entry| entry.handle.is_some())
    }

    /// Number of known sessions, connected or not.
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Drop a session and its buffer. A live handle is closed.
    pub fn remove_session(&self, session_id: &SessionId) -> bool {
        let Some((_, entry)) = self.sessions.remove(session_id) else {
            return false;
        };
        if let Some(handle) = entry.handle {
            handle.close();
        }
        counter!(crate::metrics::SESSIONS_REMOVED_TOTAL).increment(1);
        info!(%session_id, discarded = entry.buffer.len(), "session removed");
        true
    }

    /// Remove sessions with no handle and no activity for at least `max_idle`.
    pub fn cleanup_idle(&self, max_idle: Duration) -> usize {
        let before = self.sessions.len();
        self.sessions.retain(|session_id, entry| {
            let idle = entry.handle.is_none() && entry.last_seen.elapsed() >= max_idle;
            if idle {
                debug!(%session_id, discarded = entry.buffer.len(), "sweeping idle session");
            }
            !idle
        });
        let removed = before.saturating_sub(self.sessions.len());
        if removed > 0 {
            counter!(crate::metrics::SESSIONS_REMOVED_TOTAL).increment(removed as u64);
        }
        removed
    }

    /// Buffered payloads for a session, oldest first.
    pub fn buffered_payloads(&self, session_id: &SessionId) -> Vec<Arc<String>> {
        self.sessions
            .get(session_id)
            .map(|entry| entry.buffer.iter().map(|m| Arc::clone(&m.payload)).collect())
            .unwrap_or_default()
    }
}

/// Periodically sweep idle sessions until `shutdown` fires.
pub fn start_cleanup_task(
    registry: Arc<SessionRegistry>,
    interval: Duration,
    max_idle: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        let _ = ticker.tick().await;
        loop {
            tokio::select! {
                () = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let removed = registry.cleanup_idle(max_idle);
                    if removed > 0 {
                        info!(removed, "idle session cleanup");
                    }
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use tokio::sync::mpsc;

    fn sid(s: &str) -> SessionId {
        SessionId::from_raw(s)
    }

    fn handle() -> (ConnectionHandle, mpsc::UnboundedReceiver<Arc<String>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (ConnectionHandle::new(tx), rx)
    }

    fn frame(text: &str) -> Arc<String> {
        Arc::new(text.to_string())
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<Arc<String>>) -> Vec<String> {
        let mut out = Vec::new();
        while let Ok(f) = rx.try_recv() {
            out.push(f.to_string());
        }
        out
    }

    #[test]
    fn send_without_session_buffers() {
        let registry = SessionRegistry::new(10);
        assert_eq!(registry.send_raw(&sid("s1"), frame("a")), SendOutcome::Buffered);
        let stats = registry.statistics();
        assert_eq!(stats.total_buffered_messages, 1);
        assert_eq!(stats.sessions_with_buffer, 1);
        assert_eq!(stats.active_connections, 0);
    }

    #[test]
    fn send_with_handle_transmits() {
        let registry = SessionRegistry::new(10);
        let (h, mut rx) = handle();
        assert!(registry.connect(&sid("s1"), None, h).is_none());
        assert_eq!(registry.send_raw(&sid("s1"), frame("a")), SendOutcome::Sent);
        assert_eq!(drain(&mut rx), vec!["a"]);
        assert_eq!(registry.statistics().total_messages_sent, 1);
        assert_eq!(registry.session_snapshot(&sid("s1")).unwrap().message_count, 1);
    }

    #[test]
    fn connect_flushes_buffer_in_order() {
        let registry = SessionRegistry::new(10);
        for p in ["m1", "m2", "m3"] {
            let _ = registry.send_raw(&sid("s1"), frame(p));
        }
        let (h, mut rx) = handle();
        let _ = registry.connect(&sid("s1"), None, h);
        assert_eq!(drain(&mut rx), vec!["m1", "m2", "m3"]);
        assert!(registry.buffered_payloads(&sid("s1")).is_empty());
        assert_eq!(registry.statistics().total_buffered_messages, 0);
    }

    #[test]
    fn flush_precedes_later_sends() {
        let registry = SessionRegistry::new(10);
        let _ = registry.send_raw(&sid("s1"), frame("old"));
        let (h, mut rx) = handle();
        let _ = registry.connect(&sid("s1"), None, h);
        let _ = registry.send_raw(&sid("s1"), frame("new"));
        assert_eq!(drain(&mut rx), vec!["old", "new"]);
    }

    #[test]
    fn overflow_keeps_most_recent() {
        let registry = SessionRegistry::new(2);
        for p in ["a", "b", "c"] {
            let _ = registry.send_raw(&sid("s1"), frame(p));
        }
        let buffered: Vec<String> = registry
            .buffered_payloads(&sid("s1"))
            .iter()
            .map(ToString::to_string)
            .collect();
        assert_eq!(buffered, vec!["b", "c"]);
    }

    #[test]
    fn reconnect_returns_previous_handle() {
        let registry = SessionRegistry::new(10);
        let (first, _rx1) = handle();
        let first_id = first.id().clone();
        let (second, mut rx2) = handle();
        assert!(registry.connect(&sid("s1"), None, first).is_none());
        let prev = registry.connect(&sid("s1"), None, second).unwrap();
        assert_eq!(prev.id(), &first_id);
        assert!(!prev.is_closed(), "registry must not close the previous handle");

        let _ = registry.send_raw(&sid("s1"), frame("x"));
        assert_eq!(drain(&mut rx2), vec!["x"]);
        assert_eq!(registry.statistics().active_connections, 1);
    }

    #[test]
    fn disconnect_keeps_buffer_and_is_idempotent() {
        let registry = SessionRegistry::new(10);
        let (h, _rx) = handle();
        let _ = registry.connect(&sid("s1"), None, h);
        assert!(registry.disconnect(&sid("s1")));
        assert!(!registry.disconnect(&sid("s1")));
        assert!(!registry.disconnect(&sid("unknown")));

        assert_eq!(registry.send_raw(&sid("s1"), frame("later")), SendOutcome::Buffered);
        let snap = registry.session_snapshot(&sid("s1")).unwrap();
        assert!(!snap.is_connected());
        assert_eq!(snap.buffered, 1);
    }

    #[test]
    fn disconnect_connection_ignores_stale_id() {
        let registry = SessionRegistry::new(10);
        let (old, _rx1) = handle();
        let old_id = old.id().clone();
        let (new, _rx2) = handle();
        let _ = registry.connect(&sid("s1"), None, old);
        let _ = registry.connect(&sid("s1"), None, new);

        assert!(!registry.disconnect_connection(&sid("s1"), &old_id));
        assert!(registry.is_connected(&sid("s1")));
    }

    #[test]
    fn dead_handle_treated_as_absent() {
        let registry = SessionRegistry::new(10);
        let (h, rx) = handle();
        let _ = registry.connect(&sid("s1"), None, h);
        drop(rx);

        assert_eq!(registry.send_raw(&sid("s1"), frame("a")), SendOutcome::Buffered);
        assert!(!registry.is_connected(&sid("s1")));
        assert_eq!(registry.buffered_payloads(&sid("s1")).len(), 1);
    }

    #[test]
    fn flush_into_dead_handle_requeues() {
        let registry = SessionRegistry::new(10);
        let _ = registry.send_raw(&sid("s1"), frame("a"));
        let _ = registry.send_raw(&sid("s1"), frame("b"));
        let (h, rx) = handle();
        drop(rx);
        let _ = registry.connect(&sid("s1"), None, h);

        assert!(!registry.is_connected(&sid("s1")));
        let buffered: Vec<String> = registry
            .buffered_payloads(&sid("s1"))
            .iter()
            .map(ToString::to_string)
            .collect();
        assert_eq!(buffered, vec!["a", "b"]);
    }

    #[test]
    fn broadcast_skips_excluded_and_disconnected() {
        let registry = SessionRegistry::new(10);
        let (h1, mut rx1) = handle();
        let (h2, mut rx2) = handle();
        let _ = registry.connect(&sid("s1"), None, h1);
        let _ = registry.connect(&sid("s2"), None, h2);
        let _ = registry.send_raw(&sid("offline"), frame("x"));

        let exclude: HashSet<SessionId> = [sid("s2")].into_iter().collect();
        let count = registry.broadcast(&ServerMessage::keepalive(), &exclude).unwrap();
        assert_eq!(count, 1);
        assert_eq!(drain(&mut rx1).len(), 1);
        assert!(drain(&mut rx2).is_empty());
        assert_eq!(registry.buffered_payloads(&sid("offline")).len(), 1);
    }

    #[test]
    fn broadcast_prunes_dead_handles() {
        let registry = SessionRegistry::new(10);
        let (h1, rx1) = handle();
        let (h2, _rx2) = handle();
        let _ = registry.connect(&sid("s1"), None, h1);
        let _ = registry.connect(&sid("s2"), None, h2);
        drop(rx1);

        let count = registry
            .broadcast(&ServerMessage::keepalive(), &HashSet::new())
            .unwrap();
        assert_eq!(count, 1);
        assert!(!registry.is_connected(&sid("s1")));
        assert!(registry.is_connected(&sid("s2")));
    }

    #[test]
    fn send_serializes_server_message() {
        let registry = SessionRegistry::new(10);
        let (h, mut rx) = handle();
        let _ = registry.connect(&sid("s1"), None, h);
        let outcome = registry.send(&sid("s1"), &ServerMessage::pong()).unwrap();
        assert_eq!(outcome, SendOutcome::Sent);
        let frames = drain(&mut rx);
        let parsed = ServerMessage::parse(&frames[0]).unwrap();
        assert_matches!(parsed, ServerMessage::Pong { .. });
    }

    #[test]
    fn snapshot_records_user() {
        let registry = SessionRegistry::new(10);
        let (h, _rx) = handle();
        let _ = registry.connect(&sid("s1"), Some(UserId::from_raw("u1")), h);
        let snap = registry.session_snapshot(&sid("s1")).unwrap();
        assert_eq!(snap.user_id, Some(UserId::from_raw("u1")));
        assert!(snap.is_connected());
        assert!(registry.session_snapshot(&sid("nope")).is_none());
    }

    #[test]
    fn remove_session_closes_handle() {
        let registry = SessionRegistry::new(10);
        let (h, _rx) = handle();
        let token = h.close_token();
        let _ = registry.connect(&sid("s1"), None, h);
        assert!(registry.remove_session(&sid("s1")));
        assert!(token.is_cancelled());
        assert_eq!(registry.session_count(), 0);
        assert!(!registry.remove_session(&sid("s1")));
    }

    #[tokio::test(start_paused = true)]
    async fn cleanup_idle_only_removes_disconnected_sessions() {
        let registry = SessionRegistry::new(10);
        let (h, _rx) = handle();
        let _ = registry.connect(&sid("live"), None, h);
        let _ = registry.send_raw(&sid("idle"), frame("x"));

        tokio::time::advance(Duration::from_secs(120)).await;
        assert_eq!(registry.cleanup_idle(Duration::from_secs(60)), 1);
        assert!(registry.session_snapshot(&sid("idle")).is_none());
        assert!(registry.session_snapshot(&sid("live")).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn cleanup_idle_respects_recent_activity() {
        let registry = SessionRegistry::new(10);
        let (h, _rx) = handle();
        let _ = registry.connect(&sid("s1"), None, h);
        let _ = registry.disconnect(&sid("s1"));

        tokio::time::advance(Duration::from_secs(30)).await;
        assert_eq!(registry.cleanup_idle(Duration::from_secs(60)), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn cleanup_task_sweeps_and_stops() {
        let registry = Arc::new(SessionRegistry::new(10));
        let _ = registry.send_raw(&sid("idle"), frame("x"));
        let token = CancellationToken::new();
        let task = start_cleanup_task(
            Arc::clone(&registry),
            Duration::from_secs(10),
            Duration::from_secs(15),
            token.clone(),
        );

        tokio::time::sleep(Duration::from_secs(25)).await;
        assert_eq!(registry.session_count(), 0);

        token.cancel();
        task.await.unwrap();
    }
}
