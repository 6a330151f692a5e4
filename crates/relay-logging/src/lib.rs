//! # relay-logging
//!
//! Installs the process-wide `tracing` subscriber.
//!
//! `RUST_LOG` wins over the configured level. Output is either
//! human-readable or one JSON object per line.

#![deny(unsafe_code)]

use relay_settings::{LogFormat, LoggingSettings};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Failure to install the global subscriber.
#[derive(Debug, thiserror::Error)]
pub enum LoggingError {
    /// A global subscriber is already set.
    #[error("failed to install tracing subscriber: {0}")]
    AlreadyInitialized(#[from] tracing_subscriber::util::TryInitError),
}

/// Filter directive used when `RUST_LOG` is absent.
///
/// Noisy transport crates are capped at `warn` unless the configured level is
/// stricter.
pub fn default_directive(settings: &LoggingSettings) -> String {
    let level = settings.level.as_filter_str();
    let deps = match level {
        "error" => "error",
        _ => "warn",
    };
    format!("{level},hyper={deps},tungstenite={deps},tokio_tungstenite={deps}")
}

fn build_filter(settings: &LoggingSettings) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive(settings)))
}

/// Install the global subscriber. Call once at startup.
///
/// A second call returns [`LoggingError::AlreadyInitialized`] instead of
/// panicking.
pub fn init_logging(settings: &LoggingSettings) -> Result<(), LoggingError> {
    let filter = build_filter(settings);

    let fmt_layer = match settings.format {
        LogFormat::Json => tracing_subscriber::fmt::layer()
            .json()
            .with_target(true)
            .with_span_list(true)
            .with_filter(filter)
            .boxed(),
        LogFormat::Pretty => tracing_subscriber::fmt::layer()
            .with_target(true)
            .with_filter(filter)
            .boxed(),
    };

    tracing_subscriber::registry().with(fmt_layer).try_init()?;
    Ok(())
}
