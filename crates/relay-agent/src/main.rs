//! # relay-agent
//!
//! Session relay binary. `serve` runs the relay server; `ask` connects to a
//! running relay, streams one answer to stdout and exits.

#![deny(unsafe_code)]

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use relay_client::{ClientConfig, ConnectionManager, ConnectionStatus};
use relay_core::{ClientMessage, ServerMessage, SessionId, UserId};
use relay_server::{EchoGenerator, InMemorySessionStore, RelayServer, ServerConfig};
use relay_settings::RelaySettings;
use tracing::{info, warn};

/// Session relay.
#[derive(Parser, Debug)]
#[command(name = "relay-agent", about = "Real-time session relay")]
struct Cli {
    /// Settings file (defaults to `~/.relay/settings.json`).
    #[arg(long, global = true)]
    settings: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the relay server.
    Serve {
        /// Host to bind (overrides settings).
        #[arg(long)]
        host: Option<String>,

        /// Port to bind, 0 for auto-assign (overrides settings).
        #[arg(long)]
        port: Option<u16>,

        /// Characters per streamed chunk from the demo generator.
        #[arg(long, default_value = "8")]
        chunk_chars: usize,

        /// Delay before each streamed chunk, in milliseconds.
        #[arg(long, default_value = "20")]
        chunk_delay_ms: u64,
    },
    /// Send one query to a running relay and print the streamed answer.
    Ask {
        /// Query text.
        query: String,

        /// Relay endpoint (overrides settings).
        #[arg(long)]
        url: Option<String>,

        /// Session to bind to; the server generates one when omitted.
        #[arg(long)]
        session: Option<String>,

        /// User identity passed to the server.
        #[arg(long)]
        user: Option<String>,

        /// Prepend stored session history to the prompt.
        #[arg(long)]
        include_context: bool,

        /// Give up after this many seconds.
        #[arg(long, default_value = "60")]
        timeout_secs: u64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let settings = load_settings(cli.settings.as_deref())?;
    relay_logging::init_logging(&settings.logging).context("Failed to initialize logging")?;

    match cli.command {
        Command::Serve {
            host,
            port,
            chunk_chars,
            chunk_delay_ms,
        } => {
            let mut config = ServerConfig::from(&settings.server);
            if let Some(host) = host {
                config.host = host;
            }
            if let Some(port) = port {
                config.port = port;
            }
            let generator = EchoGenerator::new(chunk_chars, Duration::from_millis(chunk_delay_ms));
            serve(config, generator).await
        }
        Command::Ask {
            query,
            url,
            session,
            user,
            include_context,
            timeout_secs,
        } => {
            let mut config = ClientConfig::from(&settings.client);
            if let Some(url) = url {
                config.url = url;
            }
            if let Some(session) = session {
                config = config.with_session(SessionId::from_raw(session));
            }
            if let Some(user) = user {
                config = config.with_user(UserId::from_raw(user));
            }
            let message = ClientMessage::Query {
                query,
                session_id: None,
                include_context,
                system_prompt: None,
            };
            let deadline = Duration::from_secs(timeout_secs);
            tokio::time::timeout(deadline, ask(config, &message))
                .await
                .with_context(|| format!("No answer within {timeout_secs}s"))?
        }
    }
}

fn load_settings(path: Option<&Path>) -> Result<RelaySettings> {
    let path = path.map_or_else(relay_settings::loader::settings_path, Path::to_path_buf);
    relay_settings::loader::load_settings_from_path(&path)
        .with_context(|| format!("Failed to load settings from {}", path.display()))
}

async fn serve(config: ServerConfig, generator: EchoGenerator) -> Result<()> {
    let mut server = RelayServer::new(config, Arc::new(generator))
        .with_store(Arc::new(InMemorySessionStore::default()));
    match relay_server::metrics::install_recorder() {
        Ok(handle) => server = server.with_metrics(handle),
        Err(e) => warn!(error = %e, "metrics disabled"),
    }

    let (addr, server_task) = server.listen().await.context("Failed to bind relay server")?;
    info!(%addr, ws = %format!("ws://{addr}/ws"), "relay ready");

    let shutdown = server.shutdown();
    let signals = shutdown.spawn_signal_listener();
    shutdown.token().cancelled().await;

    let clean = shutdown.graceful_shutdown(vec![server_task, signals], None).await;
    if !clean {
        warn!("shutdown timed out; remaining tasks aborted");
    }
    Ok(())
}

async fn ask(config: ClientConfig, message: &ClientMessage) -> Result<()> {
    let manager = ConnectionManager::new(config);
    let mut messages = manager.messages();
    let mut status = manager.watch_status();

    manager.send(message).context("Failed to queue query")?;
    manager.connect();

    let mut stdout = std::io::stdout();
    let outcome = loop {
        tokio::select! {
            msg = messages.recv() => {
                let Some(msg) = msg else {
                    break Err(anyhow::anyhow!("connection manager stopped"));
                };
                match msg {
                    ServerMessage::Chunk { content, .. } => {
                        write!(stdout, "{content}").context("Failed to write to stdout")?;
                        stdout.flush().context("Failed to flush stdout")?;
                    }
                    ServerMessage::Complete { total_chunks, .. } => {
                        writeln!(stdout).context("Failed to write to stdout")?;
                        info!(total_chunks, "answer complete");
                        break Ok(());
                    }
                    ServerMessage::Error { error, code, .. } => {
                        break Err(anyhow::anyhow!("relay error ({code:?}): {error}"));
                    }
                    _ => {}
                }
            }
            changed = status.changed() => {
                if changed.is_err() || *status.borrow() == ConnectionStatus::Error {
                    break Err(anyhow::anyhow!("could not reach relay after {} attempts", manager.reconnect_attempts()));
                }
            }
        }
    };

    manager.disconnect().await;
    outcome
}
