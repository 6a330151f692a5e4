//! Per-session bounded FIFO for messages that could not be delivered.

use std::collections::VecDeque;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use relay_core::SessionId;

/// A serialized message waiting for its session to reconnect.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BufferedMessage {
    /// Owning session.
    pub session_id: SessionId,
    /// Serialized JSON frame.
    pub payload: Arc<String>,
    /// When the message was buffered.
    pub enqueued_at: DateTime<Utc>,
}

impl BufferedMessage {
    /// Stamp a payload with the current time.
    pub fn new(session_id: SessionId, payload: Arc<String>) -> Self {
        Self {
            session_id,
            payload,
            enqueued_at: Utc::now(),
        }
    }
}

/// Bounded FIFO. Pushing into a full buffer evicts the oldest entry.
#[derive(Debug)]
pub struct MessageBuffer {
    capacity: usize,
    entries: VecDeque<BufferedMessage>,
}

impl MessageBuffer {
    /// Create an empty buffer. A capacity of zero is raised to one.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: VecDeque::new(),
        }
    }

    /// Append a message, returning the entry evicted to make room.
    pub fn push(&mut self, message: BufferedMessage) -> Option<BufferedMessage> {
        let evicted = if self.entries.len() >= self.capacity {
            self.entries.pop_front()
        } else {
            None
        };
        self.entries.push_back(message);
        evicted
    }

    /// Remove and return every entry in enqueue order.
    pub fn take_all(&mut self) -> VecDeque<BufferedMessage> {
        std::mem::take(&mut self.entries)
    }

    /// Put undelivered entries back ahead of anything buffered since.
    ///
    /// Entries beyond capacity are dropped from the old end; the number
    /// dropped is returned.
    pub fn restore_front(&mut self, mut undelivered: VecDeque<BufferedMessage>) -> usize {
        undelivered.append(&mut self.entries);
        let overflow = undelivered.len().saturating_sub(self.capacity);
        drop(undelivered.drain(..overflow));
        self.entries = undelivered;
        overflow
    }

    /// Number of buffered messages.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing is buffered.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Maximum number of entries.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Iterate in enqueue order.
    pub fn iter(&self) -> impl Iterator<Item = &BufferedMessage> {
        self.entries.iter()
    }
}
