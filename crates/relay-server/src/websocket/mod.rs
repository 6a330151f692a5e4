//! WebSocket connection endpoint.

pub mod connection;
pub mod phase;
pub mod session;
