//! Graceful shutdown coordination via `CancellationToken`.
//!
//! One token fans out to the accept loop, every connection task and the idle
//! session sweeper. Connection tasks observe it and exit their read loop,
//! which unregisters them from the registry like any other disconnect.

use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Default grace period before outstanding tasks are abandoned.
const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// Coordinates graceful shutdown across server tasks.
#[derive(Debug, Default)]
pub struct ShutdownCoordinator {
    token: CancellationToken,
}

impl ShutdownCoordinator {
    /// Create a coordinator that has not fired yet.
    pub fn new() -> Self {
        Self::default()
    }

    /// Clone of the shutdown token.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Fire the shutdown signal. Idempotent.
    pub fn shutdown(&self) {
        if !self.token.is_cancelled() {
            info!("shutdown requested");
        }
        self.token.cancel();
    }

    /// Whether shutdown has been requested.
    pub fn is_shutting_down(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Fire shutdown when the process receives Ctrl-C.
    pub fn spawn_signal_listener(&self) -> JoinHandle<()> {
        let token = self.token.clone();
        tokio::spawn(async move {
            tokio::select! {
                result = tokio::signal::ctrl_c() => {
                    if let Err(e) = result {
                        warn!(error = %e, "failed to listen for ctrl-c");
                        return;
                    }
                    info!("ctrl-c received");
                    token.cancel();
                }
                () = token.cancelled() => {}
            }
        })
    }

    /// Fire shutdown and wait for `handles` to finish.
    ///
    /// Tasks still running after `timeout` are aborted. Returns `true` when
    /// everything drained in time.
    pub async fn graceful_shutdown(&self, handles: Vec<JoinHandle<()>>, timeout: Option<Duration>) -> bool {
        let timeout = timeout.unwrap_or(DEFAULT_SHUTDOWN_TIMEOUT);
        self.shutdown();
        info!(task_count = handles.len(), timeout_ms = timeout.as_millis() as u64, "draining tasks");

        let aborts: Vec<_> = handles.iter().map(JoinHandle::abort_handle).collect();
        let drain = futures::future::join_all(handles);
        if tokio::time::timeout(timeout, drain).await.is_err() {
            warn!(?timeout, "shutdown timed out, aborting remaining tasks");
            for abort in aborts {
                abort.abort();
            }
            return false;
        }
        true
    }
}
