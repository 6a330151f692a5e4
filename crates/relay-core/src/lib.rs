//! # relay-core
//!
//! Shared vocabulary for the session relay server and its clients.
//!
//! - **Branded IDs**: `SessionId`, `ConnectionId`, `UserId` as newtypes for type safety
//! - **Protocol**: `ClientMessage` / `ServerMessage` tagged unions (`"type"` field)
//! - **Errors**: `RelayError` taxonomy with wire-level `ErrorCode`s

#![deny(unsafe_code)]

pub mod errors;
pub mod ids;
pub mod protocol;

pub use errors::{ErrorCode, ErrorKind, InvalidTransition, RelayError, Result};
pub use ids::{ConnectionId, SessionId, UserId};
pub use protocol::{ClientMessage, ServerMessage};
