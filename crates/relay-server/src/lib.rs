//! # relay-server
//!
//! Session relay: streams generated text to WebSocket clients and buffers it
//! for sessions that are momentarily offline.
//!
//! - Session registry: one live connection per session, bounded FIFO offline buffer
//! - `WebSocket` endpoint: `connected` ack, ping/pong, keepalive, one query at a time
//! - Query executor: `query_start`, gapless numbered `chunk`s, then `complete` or `error`
//! - Pluggable `TextGenerator` and `SessionStore` collaborators
//! - Health and Prometheus endpoints, graceful shutdown via `CancellationToken`

#![deny(unsafe_code)]

pub mod buffer;
pub mod config;
pub mod executor;
pub mod generation;
pub mod health;
pub mod history;
pub mod metrics;
pub mod mock;
pub mod registry;
pub mod server;
pub mod shutdown;
pub mod websocket;

pub use config::ServerConfig;
pub use executor::{QueryExecution, QueryExecutor, QueryRequest};
pub use generation::{EchoGenerator, GenerationError, GenerationRequest, TextGenerator};
pub use history::{InMemorySessionStore, SessionStore};
pub use registry::{RegistryStats, SendOutcome, SessionRegistry};
pub use server::RelayServer;
