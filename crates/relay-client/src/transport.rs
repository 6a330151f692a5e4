//! Transport seam between the connection manager and the wire.

use std::fmt;
use std::pin::Pin;

use async_trait::async_trait;
use futures::{Sink, SinkExt, Stream, StreamExt, future};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::{self, Message};
use tracing::debug;

use crate::error::ClientError;

/// Outbound half: accepts JSON text frames.
pub type FrameSink = Pin<Box<dyn Sink<String, Error = ClientError> + Send>>;

/// Inbound half: yields JSON text frames and ends when the peer closes.
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<String, ClientError>> + Send>>;

/// An open transport.
pub struct Transport {
    /// Outbound frames.
    pub sink: FrameSink,
    /// Inbound frames.
    pub stream: FrameStream,
}

impl fmt::Debug for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transport").finish_non_exhaustive()
    }
}

/// Opens transports. The manager holds one and calls it on every attempt.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Open a transport to `url`.
    async fn connect(&self, url: &str) -> Result<Transport, ClientError>;
}

/// [`Connector`] over `tokio-tungstenite`.
#[derive(Clone, Copy, Debug, Default)]
pub struct WsConnector;

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self, url: &str) -> Result<Transport, ClientError> {
        let (ws, response) = connect_async(url).await.map_err(handshake_error)?;
        debug!(status = response.status().as_u16(), "websocket handshake complete");

        let (ws_tx, ws_rx) = ws.split();
        let sink = ws_tx
            .with(|text: String| future::ready(Ok::<_, tungstenite::Error>(Message::text(text))))
            .sink_map_err(|e| ClientError::Transport(e.to_string()));

        let stream = ws_rx
            .take_while(|frame| future::ready(!matches!(frame, Ok(Message::Close(_)))))
            .filter_map(|frame| {
                future::ready(match frame {
                    Ok(Message::Text(text)) => Some(Ok(text.to_string())),
                    Ok(Message::Binary(data)) => String::from_utf8(data.to_vec()).ok().map(Ok),
                    Ok(_) => None,
                    Err(e) => Some(Err(ClientError::Transport(e.to_string()))),
                })
            });

        Ok(Transport {
            sink: Box::pin(sink),
            stream: Box::pin(stream),
        })
    }
}

fn handshake_error(err: tungstenite::Error) -> ClientError {
    match err {
        tungstenite::Error::Http(response) => status_error(response.status().as_u16()),
        other => ClientError::Transport(other.to_string()),
    }
}

fn status_error(status: u16) -> ClientError {
    if matches!(status, 401 | 403) {
        ClientError::Rejected { status }
    } else {
        ClientError::Handshake { status }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn unauthorized_and_forbidden_are_rejections() {
        assert_matches!(status_error(401), ClientError::Rejected { status: 401 });
        assert_matches!(status_error(403), ClientError::Rejected { status: 403 });
    }

    #[test]
    fn other_statuses_are_retryable() {
        let err = status_error(503);
        assert_matches!(err, ClientError::Handshake { status: 503 });
        assert!(err.is_retryable());
    }

    #[test]
    fn io_errors_are_transport() {
        let err = handshake_error(tungstenite::Error::ConnectionClosed);
        assert_matches!(err, ClientError::Transport(_));
    }

    #[test]
    fn transport_debug_hides_halves() {
        let transport = Transport {
            sink: Box::pin(
                futures::sink::drain::<String>()
                    .sink_map_err(|e: std::convert::Infallible| -> ClientError { match e {} }),
            ),
            stream: Box::pin(futures::stream::empty::<Result<String, ClientError>>()),
        };
        assert_eq!(format!("{transport:?}"), "Transport { .. }");
    }

    #[tokio::test]
    async fn refused_connection_is_transport_error() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let result = WsConnector.connect(&format!("ws://{addr}/ws")).await;
        assert_matches!(result, Err(ClientError::Transport(_)));
    }
}
