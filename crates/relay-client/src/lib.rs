//! # relay-client
//!
//! Peer side of the session relay.
//!
//! - `ConnectionManager`: single actor task owning the transport and status
//! - Exponential reconnect backoff with a terminal `error` status
//! - Outbound queue flushed in order when the connection opens
//! - Client `ping` keepalive, optional pong timeout
//! - Status and message event hubs with revocable handlers

#![deny(unsafe_code)]

pub mod backoff;
pub mod config;
pub mod error;
pub mod events;
pub mod manager;
pub mod status;
pub mod transport;

pub use config::ClientConfig;
pub use error::ClientError;
pub use events::{EventHub, HandlerHandle, Subscription};
pub use manager::{ConnectionManager, StatusChange};
pub use status::ConnectionStatus;
pub use transport::{Connector, Transport, WsConnector};
