//! WebSocket session lifecycle: handles one connected client from upgrade
//! through disconnect.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use metrics::{counter, gauge};
use relay_core::{ClientMessage, ErrorCode, RelayError, ServerMessage, SessionId, UserId};
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, Span, debug, info, instrument, warn};

use super::connection::ConnectionHandle;
use super::phase::ConnectionPhase;
use crate::executor::{QueryExecution, QueryExecutor, QueryRequest};
use crate::registry::SessionRegistry;

/// How long the writer gets to flush after the reader stops.
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Everything a connection task needs from the server.
#[derive(Clone)]
pub struct EndpointContext {
    /// Shared session registry.
    pub registry: Arc<SessionRegistry>,
    /// Query executor.
    pub executor: Arc<QueryExecutor>,
    /// Interval between `keepalive` messages.
    pub keepalive_interval: Duration,
    /// Cancelled when the server shuts down.
    pub shutdown: CancellationToken,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum CloseReason {
    ClientDisconnect,
    TransportClosed,
    TransportError,
    Superseded,
    Shutdown,
}

impl CloseReason {
    fn as_str(self) -> &'static str {
        match self {
            Self::ClientDisconnect => "client_disconnect",
            Self::TransportClosed => "transport_closed",
            Self::TransportError => "transport_error",
            Self::Superseded => "superseded",
            Self::Shutdown => "shutdown",
        }
    }
}

/// Run a WebSocket session for a connected client.
///
/// 1. Queues `connected`, then registers with the registry so the ack
///    precedes any flushed buffered messages
/// 2. Dispatches `ping`, `disconnect` and `query` frames
/// 3. Runs at most one query at a time; a second one gets `busy`
/// 4. Emits `keepalive` from the writer on a fixed interval
/// 5. Unregisters on disconnect, transport loss, supersession or shutdown
#[instrument(skip_all, fields(session_id = %session_id, connection_id = tracing::field::Empty))]
pub async fn run_ws_session(ws: WebSocket, session_id: SessionId, user_id: Option<UserId>, ctx: EndpointContext) {
    let (ws_tx, mut ws_rx) = ws.split();
    let (send_tx, send_rx) = mpsc::unbounded_channel::<Arc<String>>();
    let handle = ConnectionHandle::new(send_tx);
    let connection_id = handle.id().clone();
    let closer = handle.close_token();
    let _ = Span::current().record("connection_id", tracing::field::display(&connection_id));

    counter!(crate::metrics::WS_CONNECTIONS_TOTAL).increment(1);
    gauge!(crate::metrics::WS_CONNECTIONS_ACTIVE).increment(1.0);

    reply(&handle, &ServerMessage::connected(session_id.clone()));
    if let Some(previous) = ctx.registry.connect(&session_id, user_id, handle.clone()) {
        info!(previous = %previous.id(), "closing superseded connection");
        previous.close();
    }

    let writer = tokio::spawn(
        write_loop(ws_tx, send_rx, closer.clone(), ctx.keepalive_interval).in_current_span(),
    );

    let mut phase = ConnectionPhase::AwaitingFirstMessage;
    let mut running: Option<CancellationToken> = None;
    let (done_tx, mut done_rx) = mpsc::unbounded_channel::<QueryExecution>();

    let reason = loop {
        tokio::select! {
            () = closer.cancelled() => break CloseReason::Superseded,
            () = ctx.shutdown.cancelled() => break CloseReason::Shutdown,
            Some(execution) = done_rx.recv() => {
                running = None;
                phase = advance(phase, ConnectionPhase::Idle);
                debug!(chunks = execution.chunks, outcome = ?execution.outcome, "query finished");
            }
            frame = ws_rx.next() => {
                let text = match frame {
                    Some(Ok(Message::Text(text))) => text.to_string(),
                    Some(Ok(Message::Binary(data))) => {
                        if let Ok(text) = std::str::from_utf8(&data) {
                            text.to_owned()
                        } else {
                            reply(&handle, &ServerMessage::error(
                                "binary frames must carry UTF-8 JSON",
                                Some(ErrorCode::InvalidMessage),
                            ));
                            continue;
                        }
                    }
                    Some(Ok(Message::Ping(_) | Message::Pong(_))) => continue,
                    Some(Ok(Message::Close(_))) | None => break CloseReason::TransportClosed,
                    Some(Err(e)) => {
                        debug!(error = %e, "transport error");
                        break CloseReason::TransportError;
                    }
                };

                if phase == ConnectionPhase::AwaitingFirstMessage {
                    phase = advance(phase, ConnectionPhase::Idle);
                }

                match ClientMessage::parse(&text) {
                    Err(err) => {
                        counter!(crate::metrics::PROTOCOL_ERRORS_TOTAL).increment(1);
                        debug!(error = %err, "rejecting malformed frame");
                        reply(&handle, &ServerMessage::from_error(&err));
                    }
                    Ok(ClientMessage::Ping) => reply(&handle, &ServerMessage::pong()),
                    Ok(ClientMessage::Disconnect) => {
                        reply(&handle, &ServerMessage::disconnected(session_id.clone()));
                        break CloseReason::ClientDisconnect;
                    }
                    Ok(ClientMessage::Query { query, session_id: requested, include_context, system_prompt }) => {
                        if let Some(requested) = requested.filter(|r| *r != session_id) {
                            let err = RelayError::SessionMismatch { requested, bound: session_id.clone() };
                            reply(&handle, &ServerMessage::from_error(&err));
                            continue;
                        }
                        if phase.is_busy() {
                            reply(&handle, &ServerMessage::from_error(&RelayError::Busy));
                            continue;
                        }
                        phase = advance(phase, ConnectionPhase::ExecutingQuery);

                        let token = closer.child_token();
                        running = Some(token.clone());
                        let request = QueryRequest {
                            session_id: session_id.clone(),
                            query,
                            include_context,
                            system_prompt,
                        };
                        spawn_query(Arc::clone(&ctx.executor), request, token, done_tx.clone());
                    }
                }
            }
        }
    };

    let _ = advance(phase, ConnectionPhase::Closed);
    let unregistered = ctx.registry.disconnect_connection(&session_id, &connection_id);
    if let Some(token) = running.take() {
        token.cancel();
    }
    closer.cancel();

    let abort = writer.abort_handle();
    if tokio::time::timeout(WRITER_DRAIN_TIMEOUT, writer).await.is_err() {
        warn!("writer did not drain in time, aborting");
        abort.abort();
    }

    info!(reason = reason.as_str(), unregistered, "client disconnected");
    counter!(crate::metrics::WS_DISCONNECTIONS_TOTAL, "reason" => reason.as_str()).increment(1);
    gauge!(crate::metrics::WS_CONNECTIONS_ACTIVE).decrement(1.0);
}

fn spawn_query(
    executor: Arc<QueryExecutor>,
    request: QueryRequest,
    token: CancellationToken,
    done: mpsc::UnboundedSender<QueryExecution>,
) {
    let _ = tokio::spawn(
        async move {
            let execution = executor.execute(request, token).await;
            let _ = done.send(execution);
        }
        .in_current_span(),
    );
}

/// Forward queued frames to the socket and emit keepalives.
///
/// On close, frames already queued are flushed before the close frame.
async fn write_loop(
    mut ws_tx: SplitSink<WebSocket, Message>,
    mut rx: mpsc::UnboundedReceiver<Arc<String>>,
    closer: CancellationToken,
    keepalive: Duration,
) {
    let mut ticker = tokio::time::interval(keepalive);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // Skip the immediate first tick
    let _ = ticker.tick().await;

    loop {
        tokio::select! {
            biased;
            frame = rx.recv() => {
                let Some(frame) = frame else { break };
                if ws_tx.send(text_frame(&frame)).await.is_err() {
                    return;
                }
            }
            () = closer.cancelled() => {
                while let Ok(frame) = rx.try_recv() {
                    if ws_tx.send(text_frame(&frame)).await.is_err() {
                        return;
                    }
                }
                break;
            }
            _ = ticker.tick() => {
                match ServerMessage::keepalive().to_json() {
                    Ok(json) => {
                        if ws_tx.send(Message::Text(json.into())).await.is_err() {
                            return;
                        }
                    }
                    Err(e) => warn!(error = %e, "failed to encode keepalive"),
                }
            }
        }
    }

    let _ = ws_tx.send(Message::Close(None)).await;
    let _ = ws_tx.close().await;
}

fn text_frame(frame: &Arc<String>) -> Message {
    Message::Text(String::clone(frame).into())
}

/// Queue a direct reply on this connection, bypassing the registry.
fn reply(handle: &ConnectionHandle, message: &ServerMessage) {
    match message.to_json() {
        Ok(json) => {
            if !handle.send(Arc::new(json)) {
                debug!(kind = message.type_name(), "connection closed, reply dropped");
            }
        }
        Err(e) => warn!(kind = message.type_name(), error = %e, "failed to encode reply"),
    }
}

fn advance(phase: ConnectionPhase, next: ConnectionPhase) -> ConnectionPhase {
    match phase.transition(next) {
        Ok(next) => next,
        Err(e) => {
            warn!(error = %e, "ignoring illegal phase change");
            phase
        }
    }
}
