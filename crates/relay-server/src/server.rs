//! `RelayServer`: Axum HTTP + WebSocket server.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::Router;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use metrics_exporter_prometheus::PrometheusHandle;
use relay_core::{SessionId, UserId};
use serde::Deserialize;
use tokio::task::JoinHandle;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use crate::config::ServerConfig;
use crate::executor::QueryExecutor;
use crate::generation::TextGenerator;
use crate::health::{self, HealthResponse};
use crate::history::SessionStore;
use crate::registry::{self, SessionRegistry};
use crate::shutdown::ShutdownCoordinator;
use crate::websocket::session::{EndpointContext, run_ws_session};

/// Shared state accessible from Axum handlers.
#[derive(Clone)]
pub struct AppState {
    /// Context handed to every connection task.
    pub endpoint: EndpointContext,
    /// Shutdown coordinator.
    pub shutdown: Arc<ShutdownCoordinator>,
    /// When the server started.
    pub start_time: Instant,
    /// Max inbound WebSocket message size.
    pub max_message_size: usize,
    /// Prometheus render handle, when a recorder is installed.
    pub metrics: Option<PrometheusHandle>,
}

/// The relay server.
pub struct RelayServer {
    config: ServerConfig,
    registry: Arc<SessionRegistry>,
    generator: Arc<dyn TextGenerator>,
    executor: Arc<QueryExecutor>,
    shutdown: Arc<ShutdownCoordinator>,
    metrics: Option<PrometheusHandle>,
    start_time: Instant,
}

impl RelayServer {
    /// Create a server that streams answers from `generator`.
    pub fn new(config: ServerConfig, generator: Arc<dyn TextGenerator>) -> Self {
        let registry = Arc::new(SessionRegistry::new(config.buffer_capacity));
        let executor = Arc::new(QueryExecutor::new(Arc::clone(&registry), Arc::clone(&generator)));
        Self {
            config,
            registry,
            generator,
            executor,
            shutdown: Arc::new(ShutdownCoordinator::new()),
            metrics: None,
            start_time: Instant::now(),
        }
    }

    /// Record query history in `store` and use it for `include_context`.
    #[must_use]
    pub fn with_store(mut self, store: Arc<dyn SessionStore>) -> Self {
        self.executor = Arc::new(
            QueryExecutor::new(Arc::clone(&self.registry), Arc::clone(&self.generator)).with_store(store),
        );
        self
    }

    /// Serve `/metrics` from an installed Prometheus recorder.
    #[must_use]
    pub fn with_metrics(mut self, handle: PrometheusHandle) -> Self {
        self.metrics = Some(handle);
        self
    }

    /// Build the Axum router with all routes.
    pub fn router(&self) -> Router {
        let state = AppState {
            endpoint: EndpointContext {
                registry: Arc::clone(&self.registry),
                executor: Arc::clone(&self.executor),
                keepalive_interval: self.config.keepalive_interval,
                shutdown: self.shutdown.token(),
            },
            shutdown: Arc::clone(&self.shutdown),
            start_time: self.start_time,
            max_message_size: self.config.max_message_size,
            metrics: self.metrics.clone(),
        };

        Router::new()
            .route("/ws", get(ws_handler))
            .route("/health", get(health_handler))
            .route("/metrics", get(metrics_handler))
            .layer(TraceLayer::new_for_http())
            .layer(CorsLayer::permissive())
            .with_state(state)
    }

    /// Bind and start serving in the background.
    ///
    /// Returns the bound address (useful with port `0`) and the server task,
    /// which finishes once shutdown fires and in-flight requests drain. The
    /// idle session sweeper is started when an idle timeout is configured.
    pub async fn listen(&self) -> std::io::Result<(SocketAddr, JoinHandle<()>)> {
        let listener = tokio::net::TcpListener::bind(self.config.bind_addr()).await?;
        let addr = listener.local_addr()?;
        info!(%addr, "relay server listening");

        if let Some(max_idle) = self.config.session_idle_timeout {
            let _sweeper = registry::start_cleanup_task(
                Arc::clone(&self.registry),
                self.config.cleanup_interval,
                max_idle,
                self.shutdown.token(),
            );
        }

        let router = self.router();
        let token = self.shutdown.token();
        let handle = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, router)
                .with_graceful_shutdown(token.cancelled_owned())
                .await
            {
                warn!(error = %e, "server stopped with error");
            }
            info!("relay server stopped");
        });
        Ok((addr, handle))
    }

    /// Session registry.
    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Query executor.
    pub fn executor(&self) -> &Arc<QueryExecutor> {
        &self.executor
    }

    /// Shutdown coordinator.
    pub fn shutdown(&self) -> &Arc<ShutdownCoordinator> {
        &self.shutdown
    }

    /// Server configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }
}

/// Query string accepted on `/ws`.
#[derive(Debug, Default, Deserialize)]
struct ConnectParams {
    session_id: Option<String>,
    user_id: Option<String>,
}

impl ConnectParams {
    fn session_id(&self) -> SessionId {
        self.session_id
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map_or_else(SessionId::new, SessionId::from_raw)
    }

    fn user_id(&self) -> Option<UserId> {
        self.user_id
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(UserId::from_raw)
    }
}

/// GET /ws: upgrade and bind the connection to a session.
///
/// A missing or empty `session_id` gets a freshly generated one.
async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<ConnectParams>,
    State(state): State<AppState>,
) -> Response {
    if state.shutdown.is_shutting_down() {
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }
    let session_id = params.session_id();
    let user_id = params.user_id();
    debug!(%session_id, "accepting websocket upgrade");

    let endpoint = state.endpoint;
    ws.max_message_size(state.max_message_size)
        .on_upgrade(move |socket| run_ws_session(socket, session_id, user_id, endpoint))
}

/// GET /health
async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    let stats = state.endpoint.registry.statistics();
    Json(health::health_check(state.start_time, &stats))
}

/// GET /metrics
async fn metrics_handler(State(state): State<AppState>) -> Result<String, StatusCode> {
    state
        .metrics
        .as_ref()
        .map(crate::metrics::render)
        .ok_or(StatusCode::NOT_FOUND)
}
