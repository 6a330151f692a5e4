//! Wire protocol.
//!
//! Both directions are JSON objects tagged by a `type` field. Field names are
//! `snake_case` on the wire.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::{ErrorCode, RelayError};
use crate::ids::SessionId;

// ── Client → Server ─────────────────────────────────────────────────

/// Messages sent by the client.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Start a streamed generation.
    Query {
        /// Prompt text.
        query: String,
        /// Session the query targets; defaults to the connection's session.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<SessionId>,
        /// Ask the server to prepend stored session context.
        #[serde(default, skip_serializing_if = "std::ops::Not::not")]
        include_context: bool,
        /// Optional system instructions for the generator.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        system_prompt: Option<String>,
    },
    /// Liveness probe; answered with `pong`.
    Ping,
    /// Graceful close request.
    Disconnect,
}

impl ClientMessage {
    /// Build a plain query.
    pub fn query(text: impl Into<String>) -> Self {
        Self::Query {
            query: text.into(),
            session_id: None,
            include_context: false,
            system_prompt: None,
        }
    }

    /// Parse one inbound text frame.
    pub fn parse(raw: &str) -> Result<Self, RelayError> {
        serde_json::from_str(raw).map_err(|e| RelayError::Protocol(e.to_string()))
    }

    /// Serialize to a JSON text frame.
    pub fn to_json(&self) -> Result<String, RelayError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Wire tag of this message.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Query { .. } => "query",
            Self::Ping => "ping",
            Self::Disconnect => "disconnect",
        }
    }
}

// ── Server → Client ─────────────────────────────────────────────────

/// Messages sent by the server.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Sent once, right after the transport is accepted.
    Connected {
        /// Human-readable greeting.
        message: String,
        /// Session the connection is bound to.
        session_id: SessionId,
        /// Server time.
        timestamp: DateTime<Utc>,
    },
    /// A query has been accepted and generation is starting.
    QueryStart {
        /// Echo of the query text.
        query: String,
        /// Owning session.
        session_id: SessionId,
        /// Server time.
        timestamp: DateTime<Utc>,
    },
    /// One incremental unit of generated text.
    Chunk {
        /// Text delta.
        content: String,
        /// 1-based, gapless sequence number within the query.
        chunk_number: u64,
        /// Owning session.
        session_id: SessionId,
        /// Server time.
        timestamp: DateTime<Utc>,
    },
    /// Generation finished normally.
    Complete {
        /// Concatenation of every chunk.
        full_response: String,
        /// Number of chunks emitted.
        total_chunks: u64,
        /// Owning session.
        session_id: SessionId,
        /// Server time.
        timestamp: DateTime<Utc>,
    },
    /// A request or query failed; the connection stays open.
    Error {
        /// Human-readable description.
        error: String,
        /// Machine-readable classification.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        code: Option<ErrorCode>,
        /// Server time.
        timestamp: DateTime<Utc>,
    },
    /// Reply to `ping`.
    Pong {
        /// Server time.
        timestamp: DateTime<Utc>,
    },
    /// Periodic server heartbeat.
    Keepalive {
        /// Server time.
        timestamp: DateTime<Utc>,
    },
    /// Acknowledges a client `disconnect`.
    Disconnected {
        /// Human-readable farewell.
        message: String,
        /// Session that was released.
        session_id: SessionId,
        /// Server time.
        timestamp: DateTime<Utc>,
    },
}

impl ServerMessage {
    /// `connected` greeting.
    pub fn connected(session_id: SessionId) -> Self {
        Self::Connected {
            message: "Connected to relay".into(),
            session_id,
            timestamp: Utc::now(),
        }
    }

    /// `query_start` echo.
    pub fn query_start(query: impl Into<String>, session_id: SessionId) -> Self {
        Self::QueryStart {
            query: query.into(),
            session_id,
            timestamp: Utc::now(),
        }
    }

    /// One `chunk`.
    pub fn chunk(content: impl Into<String>, chunk_number: u64, session_id: SessionId) -> Self {
        Self::Chunk {
            content: content.into(),
            chunk_number,
            session_id,
            timestamp: Utc::now(),
        }
    }

    /// Terminal `complete`.
    pub fn complete(full_response: impl Into<String>, total_chunks: u64, session_id: SessionId) -> Self {
        Self::Complete {
            full_response: full_response.into(),
            total_chunks,
            session_id,
            timestamp: Utc::now(),
        }
    }

    /// `error` with an optional code.
    pub fn error(error: impl Into<String>, code: Option<ErrorCode>) -> Self {
        Self::Error {
            error: error.into(),
            code,
            timestamp: Utc::now(),
        }
    }

    /// `error` built from a [`RelayError`].
    pub fn from_error(err: &RelayError) -> Self {
        Self::error(err.to_string(), err.code())
    }

    /// `pong` reply.
    pub fn pong() -> Self {
        Self::Pong {
            timestamp: Utc::now(),
        }
    }

    /// `keepalive` heartbeat.
    pub fn keepalive() -> Self {
        Self::Keepalive {
            timestamp: Utc::now(),
        }
    }

    /// `disconnected` acknowledgment.
    pub fn disconnected(session_id: SessionId) -> Self {
        Self::Disconnected {
            message: "Disconnected from relay".into(),
            session_id,
            timestamp: Utc::now(),
        }
    }

    /// Wire tag of this message.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Connected { .. } => "connected",
            Self::QueryStart { .. } => "query_start",
            Self::Chunk { .. } => "chunk",
            Self::Complete { .. } => "complete",
            Self::Error { .. } => "error",
            Self::Pong { .. } => "pong",
            Self::Keepalive { .. } => "keepalive",
            Self::Disconnected { .. } => "disconnected",
        }
    }

    /// Whether this message ends a query execution.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete { .. } | Self::Error { .. })
    }

    /// Session this message belongs to, when it carries one.
    pub fn session_id(&self) -> Option<&SessionId> {
        match self {
            Self::Connected { session_id, .. }
            | Self::QueryStart { session_id, .. }
            | Self::Chunk { session_id, .. }
            | Self::Complete { session_id, .. }
            | Self::Disconnected { session_id, .. } => Some(session_id),
            Self::Error { .. } | Self::Pong { .. } | Self::Keepalive { .. } => None,
        }
    }

    /// Serialize to a JSON text frame.
    pub fn to_json(&self) -> Result<String, RelayError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parse one inbound text frame.
    pub fn parse(raw: &str) -> Result<Self, RelayError> {
        serde_json::from_str(raw).map_err(|e| RelayError::Protocol(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use serde_json::{Value, json};

    #[test]
    fn parse_query_with_all_fields() {
        let raw = r#"{"type":"query","query":"hello","session_id":"s1","include_context":true,"system_prompt":"be brief"}"#;
        let msg = ClientMessage::parse(raw).unwrap();
        assert_matches!(msg, ClientMessage::Query { query, session_id: Some(sid), include_context: true, system_prompt: Some(sp) } => {
            assert_eq!(query, "hello");
            assert_eq!(sid.as_str(), "s1");
            assert_eq!(sp, "be brief");
        });
    }

    #[test]
    fn parse_query_minimal() {
        let msg = ClientMessage::parse(r#"{"type":"query","query":"hi"}"#).unwrap();
        assert_eq!(msg, ClientMessage::query("hi"));
    }

    #[test]
    fn parse_ping_and_disconnect() {
        assert_eq!(ClientMessage::parse(r#"{"type":"ping"}"#).unwrap(), ClientMessage::Ping);
        assert_eq!(
            ClientMessage::parse(r#"{"type":"disconnect"}"#).unwrap(),
            ClientMessage::Disconnect
        );
    }

    #[test]
    fn parse_rejects_unknown_type() {
        let err = ClientMessage::parse(r#"{"type":"subscribe"}"#).unwrap_err();
        assert_matches!(err, RelayError::Protocol(_));
    }

    #[test]
    fn parse_rejects_non_json() {
        assert_matches!(ClientMessage::parse("not json"), Err(RelayError::Protocol(_)));
    }

    #[test]
    fn parse_rejects_query_without_text() {
        assert!(ClientMessage::parse(r#"{"type":"query"}"#).is_err());
    }

    #[test]
    fn plain_query_omits_optional_fields() {
        let json: Value = serde_json::from_str(&ClientMessage::query("x").to_json().unwrap()).unwrap();
        assert_eq!(json, json!({"type": "query", "query": "x"}));
    }

    #[test]
    fn chunk_wire_shape() {
        let msg = ServerMessage::chunk("He", 1, SessionId::from_raw("s1"));
        let json: Value = serde_json::from_str(&msg.to_json().unwrap()).unwrap();
        assert_eq!(json["type"], "chunk");
        assert_eq!(json["content"], "He");
        assert_eq!(json["chunk_number"], 1);
        assert_eq!(json["session_id"], "s1");
        assert!(json["timestamp"].is_string());
    }

    #[test]
    fn error_code_serialized_only_when_present() {
        let with = serde_json::to_value(ServerMessage::error("busy", Some(ErrorCode::Busy))).unwrap();
        assert_eq!(with["code"], "busy");
        let without = serde_json::to_value(ServerMessage::error("oops", None)).unwrap();
        assert!(without.get("code").is_none());
    }

    #[test]
    fn from_error_carries_code() {
        let msg = ServerMessage::from_error(&RelayError::Busy);
        assert_matches!(msg, ServerMessage::Error { code: Some(ErrorCode::Busy), .. });
    }

    #[test]
    fn type_name_matches_serde_tag() {
        let sid = SessionId::from_raw("s");
        let all = [
            ServerMessage::connected(sid.clone()),
            ServerMessage::query_start("q", sid.clone()),
            ServerMessage::chunk("c", 1, sid.clone()),
            ServerMessage::complete("c", 1, sid.clone()),
            ServerMessage::error("e", None),
            ServerMessage::pong(),
            ServerMessage::keepalive(),
            ServerMessage::disconnected(sid),
        ];
        for msg in all {
            let json = serde_json::to_value(&msg).unwrap();
            assert_eq!(json["type"], msg.type_name());
            let back = ServerMessage::parse(&msg.to_json().unwrap()).unwrap();
            assert_eq!(back, msg);
        }
    }

    #[test]
    fn terminal_messages() {
        let sid = SessionId::from_raw("s");
        assert!(ServerMessage::complete("x", 1, sid.clone()).is_terminal());
        assert!(ServerMessage::error("x", None).is_terminal());
        assert!(!ServerMessage::chunk("x", 1, sid).is_terminal());
        assert!(!ServerMessage::pong().is_terminal());
    }
}
