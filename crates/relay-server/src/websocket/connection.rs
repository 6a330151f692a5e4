//! Handle to one live WebSocket connection.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use relay_core::ConnectionId;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Cloneable handle the registry uses to reach a connection's write task.
///
/// Frames pushed through [`send`](Self::send) are written in order. Closing
/// the handle signals both the reader loop and the writer of the owning
/// connection; the registry never closes a handle itself.
#[derive(Clone, Debug)]
pub struct ConnectionHandle {
    id: ConnectionId,
    tx: mpsc::UnboundedSender<Arc<String>>,
    closer: CancellationToken,
    connected_at: Instant,
    sent: Arc<AtomicU64>,
}

impl ConnectionHandle {
    /// Wrap the sending half of a connection's outbound channel.
    pub fn new(tx: mpsc::UnboundedSender<Arc<String>>) -> Self {
        Self {
            id: ConnectionId::new(),
            tx,
            closer: CancellationToken::new(),
            connected_at: Instant::now(),
            sent: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Connection identifier.
    pub fn id(&self) -> &ConnectionId {
        &self.id
    }

    /// Queue a frame for the writer.
    ///
    /// Returns `false` once the connection is closed or its writer is gone.
    pub fn send(&self, frame: Arc<String>) -> bool {
        if self.closer.is_cancelled() || self.tx.send(frame).is_err() {
            return false;
        }
        let _ = self.sent.fetch_add(1, Ordering::Relaxed);
        true
    }

    /// Ask the owning connection to shut down.
    pub fn close(&self) {
        self.closer.cancel();
    }

    /// Whether the handle can no longer deliver frames.
    pub fn is_closed(&self) -> bool {
        self.closer.is_cancelled() || self.tx.is_closed()
    }

    /// Token cancelled when the handle is closed.
    pub fn close_token(&self) -> CancellationToken {
        self.closer.clone()
    }

    /// Frames accepted by this handle.
    pub fn sent_count(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }

    /// Time since the connection was accepted.
    pub fn age(&self) -> Duration {
        self.connected_at.elapsed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_handle() -> (ConnectionHandle, mpsc::UnboundedReceiver<Arc<String>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (ConnectionHandle::new(tx), rx)
    }

    #[tokio::test]
    async fn send_preserves_order() {
        let (handle, mut rx) = make_handle();
        for i in 0..5 {
            assert!(handle.send(Arc::new(format!("msg_{i}"))));
        }
        for i in 0..5 {
            assert_eq!(rx.recv().await.unwrap().as_str(), format!("msg_{i}"));
        }
        assert_eq!(handle.sent_count(), 5);
    }

    #[test]
    fn send_after_receiver_dropped_fails() {
        let (handle, rx) = make_handle();
        drop(rx);
        assert!(handle.is_closed());
        assert!(!handle.send(Arc::new("hello".into())));
        assert_eq!(handle.sent_count(), 0);
    }

    #[test]
    fn close_rejects_further_sends() {
        let (handle, _rx) = make_handle();
        let token = handle.close_token();
        handle.close();
        assert!(token.is_cancelled());
        assert!(handle.is_closed());
        assert!(!handle.send(Arc::new("late".into())));
    }

    #[test]
    fn clones_share_identity_and_close_state() {
        let (handle, _rx) = make_handle();
        let clone = handle.clone();
        assert_eq!(clone.id(), handle.id());
        clone.close();
        assert!(handle.is_closed());
    }

    #[test]
    fn ids_are_distinct() {
        let (a, _ra) = make_handle();
        let (b, _rb) = make_handle();
        assert_ne!(a.id(), b.id());
    }

    #[tokio::test(start_paused = true)]
    async fn age_tracks_clock() {
        let (handle, _rx) = make_handle();
        tokio::time::advance(Duration::from_secs(5)).await;
        assert!(handle.age() >= Duration::from_secs(5));
    }
}
