//! `GatewayServer`: Axum HTTP surface and WebSocket acceptor.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::ws::rejection::WebSocketUpgradeRejection;
use axum::extract::ws::{WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::header::{CONTENT_TYPE, ORIGIN};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use axum::Router;
use futures::StreamExt;
use hyper_util::rt::{TokioExecutor, TokioIo, TokioTimer};
use hyper_util::server::conn::auto;
use hyper_util::service::TowerToHyperService;
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use crate::config::{Limits, OriginPolicy, ServerConfig};
use crate::errors::ServerError;
use crate::health::{self, HealthResponse};
use crate::metrics::{self, GatewayMetrics};
use crate::shutdown::{ShutdownCoordinator, ShutdownReport};
use crate::websocket::handler::MessageHandler;
use crate::websocket::registry::SessionRegistry;
use crate::websocket::session::{spawn_session, SessionContext};

/// Pause after a failed `accept` so a persistent error does not spin.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Drive one HTTP connection, upgrades included.
///
/// Slow request headers are cut off by the builder's header read timeout.
/// Once shutdown begins, keep-alive connections finish their current request.
async fn serve_connection(
    builder: auto::Builder<TokioExecutor>,
    stream: TcpStream,
    peer: SocketAddr,
    router: Router,
    token: CancellationToken,
) {
    let service = TowerToHyperService::new(router);
    let conn = builder.serve_connection_with_upgrades(TokioIo::new(stream), service);
    tokio::pin!(conn);
    let result = tokio::select! {
        res = conn.as_mut() => res,
        () = token.cancelled() => {
            conn.as_mut().graceful_shutdown();
            conn.await
        }
    };
    if let Err(e) = result {
        debug!(%peer, error = %e, "http connection ended with error");
    }
}

/// Shared state accessible from Axum handlers.
#[derive(Clone)]
struct AppState {
    sessions: SessionContext,
    origins: Arc<OriginPolicy>,
    shutdown: Arc<ShutdownCoordinator>,
    prometheus: Option<PrometheusHandle>,
    start_time: Instant,
}

/// The gateway server.
pub struct GatewayServer {
    config: ServerConfig,
    limits: Limits,
    origins: Arc<OriginPolicy>,
    handler: Arc<dyn MessageHandler>,
    registry: Arc<SessionRegistry>,
    metrics: Arc<GatewayMetrics>,
    shutdown: Arc<ShutdownCoordinator>,
    prometheus: Option<PrometheusHandle>,
    start_time: Instant,
}

impl GatewayServer {
    /// Create a new server.
    pub fn new(config: ServerConfig, limits: Limits, handler: Arc<dyn MessageHandler>) -> Self {
        let origins = Arc::new(OriginPolicy::from_origins(&config.allowed_origins));
        let shutdown = Arc::new(ShutdownCoordinator::new(limits.close_grace));
        Self {
            config,
            limits,
            origins,
            handler,
            registry: Arc::new(SessionRegistry::new()),
            metrics: Arc::new(GatewayMetrics::new()),
            shutdown,
            prometheus: None,
            start_time: Instant::now(),
        }
    }

    /// Serve `/metrics` from this recorder handle.
    #[must_use]
    pub fn with_prometheus(mut self, handle: PrometheusHandle) -> Self {
        self.prometheus = Some(handle);
        self
    }

    /// Build the Axum router with all routes.
    pub fn router(&self) -> Router {
        let state = AppState {
            sessions: SessionContext {
                limits: self.limits.clone(),
                registry: self.registry.clone(),
                metrics: self.metrics.clone(),
                handler: self.handler.clone(),
            },
            origins: self.origins.clone(),
            shutdown: self.shutdown.clone(),
            prometheus: self.prometheus.clone(),
            start_time: self.start_time,
        };

        Router::new()
            .route("/ws", get(ws_handler))
            .route("/healthz", get(health_handler))
            .route("/metrics", get(metrics_handler))
            .layer(TraceLayer::new_for_http())
            .with_state(state)
    }

    /// Bind the listener and serve until shutdown begins.
    ///
    /// Returns the bound address and the accept task. Invalid limits and bind
    /// failure are the only errors; everything after it is handled per
    /// connection.
    pub async fn listen(&self) -> Result<(SocketAddr, JoinHandle<()>), ServerError> {
        self.limits.validate()?;
        self.config.validate()?;

        let addr = self.config.bind_addr();
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|source| ServerError::Bind { addr: addr.clone(), source })?;
        let local_addr = listener.local_addr()?;

        if self.origins.is_open() {
            warn!("origin check disabled, accepting upgrades from any origin");
        }
        info!(
            addr = %local_addr,
            max_message_bytes = self.limits.max_message_bytes,
            ping_interval_ms = u64::try_from(self.limits.ping_interval.as_millis()).unwrap_or(u64::MAX),
            pong_wait_ms = u64::try_from(self.limits.pong_wait.as_millis()).unwrap_or(u64::MAX),
            read_header_timeout_ms =
                u64::try_from(self.config.read_header_timeout.as_millis()).unwrap_or(u64::MAX),
            "gateway listening"
        );

        let mut builder = auto::Builder::new(TokioExecutor::new()).http1_only();
        let _ = builder
            .http1()
            .timer(TokioTimer::new())
            .header_read_timeout(self.config.read_header_timeout);

        let router = self.router();
        let token = self.shutdown.token();
        let handle = tokio::spawn(async move {
            loop {
                let (stream, peer) = tokio::select! {
                    () = token.cancelled() => break,
                    accepted = listener.accept() => match accepted {
                        Ok(conn) => conn,
                        Err(e) => {
                            warn!(error = %e, "accept failed");
                            tokio::time::sleep(ACCEPT_BACKOFF).await;
                            continue;
                        }
                    },
                };
                let _ = tokio::spawn(serve_connection(
                    builder.clone(),
                    stream,
                    peer,
                    router.clone(),
                    token.clone(),
                ));
            }
            info!("http listener stopped");
        });

        Ok((local_addr, handle))
    }

    /// Stop accepting upgrades and drain every open session.
    ///
    /// Returns `None` if shutdown was already started.
    pub async fn shutdown(&self) -> Option<ShutdownReport> {
        self.shutdown.shutdown(&self.registry).await
    }

    /// Get the shutdown coordinator.
    pub fn coordinator(&self) -> &Arc<ShutdownCoordinator> {
        &self.shutdown
    }

    /// Get the session registry.
    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Get the metrics sink.
    pub fn metrics(&self) -> &Arc<GatewayMetrics> {
        &self.metrics
    }

    /// Get the server configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Get the session limits.
    pub fn limits(&self) -> &Limits {
        &self.limits
    }
}

/// GET /ws
async fn ws_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    upgrade: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    if state.shutdown.is_shutting_down() {
        return (StatusCode::SERVICE_UNAVAILABLE, "server shutting down").into_response();
    }

    // A non-UTF-8 Origin never matches an allow list.
    let origin = headers.get(ORIGIN).map(|v| v.to_str().unwrap_or_default());
    if !state.origins.allows(origin) {
        warn!(origin = origin.unwrap_or_default(), "upgrade rejected: origin not allowed");
        return (StatusCode::FORBIDDEN, "origin not allowed").into_response();
    }

    let ws = match upgrade {
        Ok(ws) => ws,
        Err(rejection) => {
            debug!(%rejection, "upgrade rejected: not a websocket handshake");
            return rejection.into_response();
        }
    };

    let max = state.sessions.limits.max_message_bytes;
    ws.max_message_size(max)
        .max_frame_size(max)
        .on_failed_upgrade(|error| warn!(%error, "websocket upgrade failed"))
        .on_upgrade(move |socket| accept(socket, state))
}

async fn accept(socket: WebSocket, state: AppState) {
    let (sink, stream) = socket.split();
    match spawn_session(sink, stream, state.sessions).await {
        Ok(session) => debug!(session_id = %session.id(), "upgrade accepted"),
        Err(e) => info!(error = %e, "upgrade raced shutdown, connection dropped"),
    }
}

/// GET /healthz
async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(health::health_check(state.start_time))
}

/// GET /metrics
async fn metrics_handler(State(state): State<AppState>) -> Response {
    match &state.prometheus {
        Some(handle) => (
            [(CONTENT_TYPE, "text/plain; version=0.0.4")],
            metrics::render(handle),
        )
            .into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}
