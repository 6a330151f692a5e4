//! Settings type definitions.
//!
//! All types use `#[serde(rename_all = "camelCase", default)]`, so a partial
//! JSON file fills the missing fields from [`Default`].

mod client;
mod logging;
mod server;

pub use client::*;
pub use logging::*;
pub use server::*;

use serde::{Deserialize, Serialize};

/// Root settings for the relay server, client and binary.
///
/// ```json
/// {
///   "server": { "port": 9000, "bufferCapacity": 250 },
///   "client": { "maxReconnectAttempts": 10 },
///   "logging": { "level": "debug", "format": "json" }
/// }
/// ```
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RelaySettings {
    /// Server endpoint and registry settings.
    pub server: ServerSettings,
    /// Client connection manager settings.
    pub client: ClientSettings,
    /// Log output settings.
    pub logging: LoggingSettings,
}

impl RelaySettings {
    /// Reject values that would make the relay misbehave.
    pub fn validate(&self) -> crate::Result<()> {
        self.server.validate()?;
        self.client.validate()
    }
}
