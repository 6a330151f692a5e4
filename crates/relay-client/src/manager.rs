//! Client connection manager.
//!
//! A single actor task owns the transport, the outbound queue and the status.
//! The public handle only posts commands to it, so reconnect timers cannot
//! race a manual `connect()` or `disconnect()`.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use relay_core::{ClientMessage, ServerMessage};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, instrument, warn};

use crate::backoff::reconnect_delay;
use crate::config::ClientConfig;
use crate::error::ClientError;
use crate::events::{EventHub, HandlerHandle, Subscription};
use crate::status::ConnectionStatus;
use crate::transport::{Connector, FrameSink, Transport, WsConnector};

/// Parks the pong deadline when no ping is outstanding.
const FAR_FUTURE: Duration = Duration::from_secs(365 * 24 * 3600);

/// One status transition, as published on the status channel.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StatusChange {
    /// Status before.
    pub from: ConnectionStatus,
    /// Status after.
    pub to: ConnectionStatus,
    /// Reconnect attempt counter at the time of the transition.
    pub attempt: u32,
}

enum Command {
    Connect,
    Send(String),
    Disconnect(oneshot::Sender<()>),
}

/// State readable from the handle without going through the actor.
struct Shared {
    status: watch::Sender<ConnectionStatus>,
    attempts: AtomicU32,
    pending: AtomicUsize,
    last_pong: Mutex<Option<DateTime<Utc>>>,
    status_events: EventHub<StatusChange>,
    messages: EventHub<ServerMessage>,
}

/// Handle to a reconnecting connection.
///
/// Dropping the handle stops the actor and closes the transport.
pub struct ConnectionManager {
    commands: mpsc::UnboundedSender<Command>,
    shared: Arc<Shared>,
}

impl ConnectionManager {
    /// Manager over WebSocket. Must be created inside a Tokio runtime.
    pub fn new(config: ClientConfig) -> Self {
        Self::with_connector(config, Arc::new(WsConnector))
    }

    /// Manager over a custom transport.
    pub fn with_connector(config: ClientConfig, connector: Arc<dyn Connector>) -> Self {
        let (commands, rx) = mpsc::unbounded_channel();
        let (status, _) = watch::channel(ConnectionStatus::Disconnected);
        let shared = Arc::new(Shared {
            status,
            attempts: AtomicU32::new(0),
            pending: AtomicUsize::new(0),
            last_pong: Mutex::new(None),
            status_events: EventHub::new(),
            messages: EventHub::new(),
        });
        let actor = Actor {
            config,
            connector,
            commands: rx,
            shared: Arc::clone(&shared),
            status: ConnectionStatus::Disconnected,
            attempts: 0,
            queue: VecDeque::new(),
        };
        let _ = tokio::spawn(actor.run());
        Self { commands, shared }
    }

    /// Open the connection. No-op while `connecting` or `connected`; skips the
    /// remaining backoff while `reconnecting`.
    pub fn connect(&self) {
        let _ = self.commands.send(Command::Connect);
    }

    /// Transmit `message`, or queue it until the connection opens.
    pub fn send(&self, message: &ClientMessage) -> Result<(), ClientError> {
        let json = message.to_json()?;
        self.commands
            .send(Command::Send(json))
            .map_err(|_| ClientError::Closed)
    }

    /// Close the connection and stop reconnecting. Idempotent.
    ///
    /// Notifies the server, closes the transport and cancels any pending
    /// reconnect timer or connect attempt in flight.
    pub async fn disconnect(&self) {
        let (ack, done) = oneshot::channel();
        if self.commands.send(Command::Disconnect(ack)).is_ok() {
            let _ = done.await;
        }
    }

    /// Current status.
    pub fn status(&self) -> ConnectionStatus {
        *self.shared.status.borrow()
    }

    /// Watch the status value.
    pub fn watch_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.shared.status.subscribe()
    }

    /// Call `handler` on every later status transition.
    pub fn on_status(&self, handler: impl Fn(&StatusChange) + Send + Sync + 'static) -> HandlerHandle {
        self.shared.status_events.on(handler)
    }

    /// Ordered channel of later status transitions.
    pub fn status_events(&self) -> Subscription<StatusChange> {
        self.shared.status_events.subscribe()
    }

    /// Call `handler` on every later inbound message.
    pub fn on_message(&self, handler: impl Fn(&ServerMessage) + Send + Sync + 'static) -> HandlerHandle {
        self.shared.messages.on(handler)
    }

    /// Ordered channel of later inbound messages.
    pub fn messages(&self) -> Subscription<ServerMessage> {
        self.shared.messages.subscribe()
    }

    /// Messages waiting in the outbound queue.
    pub fn pending_messages(&self) -> usize {
        self.shared.pending.load(Ordering::SeqCst)
    }

    /// Consecutive failed attempts since the last successful open.
    pub fn reconnect_attempts(&self) -> u32 {
        self.shared.attempts.load(Ordering::SeqCst)
    }

    /// When the last `pong` arrived.
    pub fn last_pong(&self) -> Option<DateTime<Utc>> {
        *self.shared.last_pong.lock()
    }
}

/// What a command means to an attempt or backoff in progress.
enum Interrupt {
    ConnectNow,
    Disconnected,
    Stop,
}

enum Opened {
    Transport(Transport),
    Failed(ClientError),
    Interrupted(Interrupt),
}

enum OpenEnd {
    Lost(String),
    Disconnected,
    Stop,
}

/// `false` once the handle is gone and the actor should exit.
type KeepRunning = bool;

struct Actor {
    config: ClientConfig,
    connector: Arc<dyn Connector>,
    commands: mpsc::UnboundedReceiver<Command>,
    shared: Arc<Shared>,
    status: ConnectionStatus,
    attempts: u32,
    queue: VecDeque<String>,
}

impl Actor {
    async fn run(mut self) {
        while let Some(command) = self.commands.recv().await {
            let keep_running = match command {
                Command::Connect => self.connect_loop().await,
                Command::Send(payload) => {
                    self.enqueue(payload);
                    true
                }
                Command::Disconnect(ack) => {
                    if self.status != ConnectionStatus::Disconnected {
                        self.transition(ConnectionStatus::Disconnected);
                    }
                    let _ = ack.send(());
                    true
                }
            };
            if !keep_running {
                break;
            }
        }
        debug!("connection manager stopped");
    }

    /// Connect, stay connected, and reconnect with backoff until an explicit
    /// disconnect, a final failure or the handle is dropped.
    #[instrument(skip_all, fields(url = %self.config.url))]
    async fn connect_loop(&mut self) -> KeepRunning {
        loop {
            self.transition(ConnectionStatus::Connecting);
            let failure = match self.open().await {
                Opened::Transport(transport) => {
                    self.set_attempts(0);
                    self.transition(ConnectionStatus::Connected);
                    info!("connected");
                    match self.run_open(transport).await {
                        OpenEnd::Lost(reason) => reason,
                        OpenEnd::Disconnected => return true,
                        OpenEnd::Stop => return false,
                    }
                }
                Opened::Failed(err) if !err.is_retryable() => {
                    warn!(error = %err, "connection refused permanently");
                    self.transition(ConnectionStatus::Error);
                    return true;
                }
                Opened::Failed(err) => err.to_string(),
                Opened::Interrupted(Interrupt::Stop) => return false,
                Opened::Interrupted(_) => return true,
            };

            self.set_attempts(self.attempts + 1);
            if self.attempts > self.config.max_reconnect_attempts {
                warn!(attempts = self.attempts, %failure, "reconnect attempts exhausted");
                self.transition(ConnectionStatus::Error);
                return true;
            }

            self.transition(ConnectionStatus::Reconnecting);
            let delay = reconnect_delay(
                self.attempts,
                self.config.initial_reconnect_delay,
                self.config.max_reconnect_delay,
            );
            info!(attempt = self.attempts, delay_ms = delay.as_millis() as u64, %failure, "reconnecting");

            match self.wait_backoff(delay).await {
                None | Some(Interrupt::ConnectNow) => {}
                Some(Interrupt::Disconnected) => return true,
                Some(Interrupt::Stop) => return false,
            }
        }
    }

    /// Open one transport, serving commands while the attempt is in flight.
    async fn open(&mut self) -> Opened {
        let connector = Arc::clone(&self.connector);
        let url = self.config.endpoint_url();
        let timeout = self.config.connect_timeout;
        let attempt = async move {
            match tokio::time::timeout(timeout, connector.connect(&url)).await {
                Ok(result) => result,
                Err(_) => Err(ClientError::Timeout(timeout)),
            }
        };
        tokio::pin!(attempt);

        loop {
            tokio::select! {
                biased;
                command = self.commands.recv() => match self.interrupt(command) {
                    None | Some(Interrupt::ConnectNow) => {}
                    Some(other) => return Opened::Interrupted(other),
                },
                result = &mut attempt => {
                    return match result {
                        Ok(transport) => Opened::Transport(transport),
                        Err(err) => Opened::Failed(err),
                    };
                }
            }
        }
    }

    /// Sleep out the backoff delay, serving commands meanwhile.
    async fn wait_backoff(&mut self, delay: Duration) -> Option<Interrupt> {
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                biased;
                command = self.commands.recv() => {
                    if let Some(interrupt) = self.interrupt(command) {
                        return Some(interrupt);
                    }
                }
                () = &mut sleep => return None,
            }
        }
    }

    /// Apply a command that arrived while not connected.
    fn interrupt(&mut self, command: Option<Command>) -> Option<Interrupt> {
        match command {
            None => Some(Interrupt::Stop),
            Some(Command::Connect) => Some(Interrupt::ConnectNow),
            Some(Command::Send(payload)) => {
                self.enqueue(payload);
                None
            }
            Some(Command::Disconnect(ack)) => {
                self.transition(ConnectionStatus::Disconnected);
                let _ = ack.send(());
                Some(Interrupt::Disconnected)
            }
        }
    }

    /// Serve an open transport until it is lost or closed.
    async fn run_open(&mut self, transport: Transport) -> OpenEnd {
        let Transport { mut sink, mut stream } = transport;
        if let Err(err) = self.flush_queue(&mut sink).await {
            return OpenEnd::Lost(err.to_string());
        }

        let keepalive = self.config.keepalive_interval;
        let mut ticker = tokio::time::interval_at(Instant::now() + keepalive, keepalive);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut pong_deadline: Option<Instant> = None;

        loop {
            let pong_wait = tokio::time::sleep_until(pong_deadline.unwrap_or_else(|| Instant::now() + FAR_FUTURE));
            tokio::select! {
                biased;
                command = self.commands.recv() => match command {
                    None => {
                        let _ = sink.close().await;
                        return OpenEnd::Stop;
                    }
                    Some(Command::Connect) => {}
                    Some(Command::Send(payload)) => {
                        if let Err(err) = sink.send(payload.clone()).await {
                            self.enqueue(payload);
                            return OpenEnd::Lost(err.to_string());
                        }
                    }
                    Some(Command::Disconnect(ack)) => {
                        close_gracefully(&mut sink).await;
                        self.transition(ConnectionStatus::Disconnected);
                        let _ = ack.send(());
                        return OpenEnd::Disconnected;
                    }
                },
                frame = stream.next() => match frame {
                    Some(Ok(text)) => {
                        if self.dispatch_inbound(&text) {
                            pong_deadline = None;
                        }
                    }
                    Some(Err(err)) => return OpenEnd::Lost(err.to_string()),
                    None => return OpenEnd::Lost("closed by server".into()),
                },
                _ = ticker.tick() => {
                    if let Err(err) = send_message(&mut sink, &ClientMessage::Ping).await {
                        return OpenEnd::Lost(err.to_string());
                    }
                    if let (Some(window), None) = (self.config.pong_timeout, pong_deadline) {
                        pong_deadline = Some(Instant::now() + window);
                    }
                }
                () = pong_wait, if pong_deadline.is_some() => {
                    return OpenEnd::Lost("no pong before timeout".into());
                }
            }
        }
    }

    /// Publish one inbound frame. Returns `true` for `pong`.
    fn dispatch_inbound(&self, text: &str) -> bool {
        match ServerMessage::parse(text) {
            Ok(message) => {
                let is_pong = matches!(message, ServerMessage::Pong { .. });
                if is_pong {
                    *self.shared.last_pong.lock() = Some(Utc::now());
                }
                let _ = self.shared.messages.publish(&message);
                is_pong
            }
            Err(err) => {
                warn!(error = %err, "dropping unparseable server frame");
                false
            }
        }
    }

    async fn flush_queue(&mut self, sink: &mut FrameSink) -> Result<(), ClientError> {
        let queued = self.queue.len();
        while let Some(payload) = self.queue.pop_front() {
            if let Err(err) = sink.send(payload.clone()).await {
                self.queue.push_front(payload);
                self.sync_pending();
                return Err(err);
            }
        }
        self.sync_pending();
        if queued > 0 {
            debug!(queued, "outbound queue flushed");
        }
        Ok(())
    }

    fn enqueue(&mut self, payload: String) {
        if let Some(max) = self.config.max_queue_size {
            while self.queue.len() >= max.max(1) {
                let _ = self.queue.pop_front();
                warn!(max, "outbound queue full, dropped oldest message");
            }
        }
        self.queue.push_back(payload);
        self.sync_pending();
    }

    fn sync_pending(&self) {
        self.shared.pending.store(self.queue.len(), Ordering::SeqCst);
    }

    fn set_attempts(&mut self, attempts: u32) {
        self.attempts = attempts;
        self.shared.attempts.store(attempts, Ordering::SeqCst);
    }

    fn transition(&mut self, next: ConnectionStatus) {
        match self.status.transition(next) {
            Ok(next) => {
                let change = StatusChange {
                    from: self.status,
                    to: next,
                    attempt: self.attempts,
                };
                self.status = next;
                let _ = self.shared.status.send_replace(next);
                debug!(from = %change.from, to = %change.to, attempt = change.attempt, "status change");
                let _ = self.shared.status_events.publish(&change);
            }
            Err(err) => warn!(error = %err, "ignoring illegal status change"),
        }
    }
}

async fn send_message(sink: &mut FrameSink, message: &ClientMessage) -> Result<(), ClientError> {
    sink.send(message.to_json()?).await
}

/// Tell the server we are leaving, then close our half.
async fn close_gracefully(sink: &mut FrameSink) {
    if let Err(err) = send_message(sink, &ClientMessage::Disconnect).await {
        debug!(error = %err, "could not send disconnect");
    }
    let _ = sink.close().await;
}
