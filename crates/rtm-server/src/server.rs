//! `RtmServer`: axum HTTP + `WebSocket` server.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::Router;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{ConnectInfo, Query, State};
use axum::http::header::CONTENT_TYPE;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use metrics::counter;
use metrics_exporter_prometheus::PrometheusHandle;
use rtm_core::AuthContext;
use rtm_protocol::CloseCode;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::auth::{self, Authenticator};
use crate::config::ServerConfig;
use crate::dispatch::registry::{RegistryMismatch, verify};
use crate::dispatch::{AuthorizerRegistry, HandlerRegistry, MessageDispatcher};
use crate::health::{self, HealthResponse};
use crate::metrics::{CONNECTIONS_REFUSED_TOTAL, render};
use crate::shutdown::ShutdownCoordinator;
use crate::websocket::broadcast::EventBroadcaster;
use crate::websocket::broker::{BrokerConfig, BrokerDeps, ConnectionBroker};
use crate::websocket::connection::{ClientConnection, ClientContext, ConnectionKind};
use crate::websocket::registry::{ConnectionRegistry, ShutdownReport};
use crate::websocket::session::{self, OUTBOUND_CAPACITY, SessionConfig, run_ws_session};

/// Shared state accessible from axum handlers.
#[derive(Clone)]
pub struct AppState {
    /// Server configuration.
    pub config: Arc<ServerConfig>,
    /// Live connections.
    pub registry: Arc<ConnectionRegistry>,
    /// Topic fan-out.
    pub broadcaster: Arc<EventBroadcaster>,
    /// Validate/authorize/dispatch pipeline.
    pub dispatcher: Arc<MessageDispatcher>,
    /// Handshake token verification.
    pub authenticator: Arc<dyn Authenticator>,
    /// When the server started.
    pub start_time: Instant,
    /// Prometheus handle, when a recorder is installed.
    pub metrics: Option<PrometheusHandle>,
}

impl AppState {
    fn broker_deps(&self) -> BrokerDeps {
        BrokerDeps {
            dispatcher: Arc::clone(&self.dispatcher),
            registry: Arc::clone(&self.registry),
            broadcaster: Arc::clone(&self.broadcaster),
        }
    }
}

/// The RTM server.
pub struct RtmServer {
    config: Arc<ServerConfig>,
    registry: Arc<ConnectionRegistry>,
    broadcaster: Arc<EventBroadcaster>,
    dispatcher: Arc<MessageDispatcher>,
    authenticator: Arc<dyn Authenticator>,
    shutdown: Arc<ShutdownCoordinator>,
    start_time: Instant,
    metrics: Option<PrometheusHandle>,
}

impl RtmServer {
    /// Create a server over the startup registration tables.
    ///
    /// Every message type must have both a handler and an authorizer. A
    /// mismatch fails construction when `strict_registry` is set and is
    /// logged otherwise.
    pub fn new(
        config: ServerConfig,
        handlers: HandlerRegistry,
        authorizers: AuthorizerRegistry,
        authenticator: Arc<dyn Authenticator>,
    ) -> Result<Self, RegistryMismatch> {
        if let Err(mismatch) = verify(&handlers, &authorizers) {
            if config.strict_registry {
                error!(error = %mismatch, "refusing to start");
                return Err(mismatch);
            }
            warn!(error = %mismatch, "starting with incomplete registration table");
        }
        info!(
            message_types = handlers.message_types().len(),
            "registration table loaded"
        );
        Ok(Self {
            config: Arc::new(config),
            registry: Arc::new(ConnectionRegistry::new()),
            broadcaster: Arc::new(EventBroadcaster::new()),
            dispatcher: Arc::new(MessageDispatcher::new(handlers, authorizers)),
            authenticator,
            shutdown: Arc::new(ShutdownCoordinator::new()),
            start_time: Instant::now(),
            metrics: None,
        })
    }

    /// Serve `/metrics` from `handle`.
    #[must_use]
    pub fn with_metrics(mut self, handle: PrometheusHandle) -> Self {
        self.metrics = Some(handle);
        self
    }

    /// Build the axum router with all routes.
    pub fn router(&self) -> Router {
        let state = AppState {
            config: Arc::clone(&self.config),
            registry: Arc::clone(&self.registry),
            broadcaster: Arc::clone(&self.broadcaster),
            dispatcher: Arc::clone(&self.dispatcher),
            authenticator: Arc::clone(&self.authenticator),
            start_time: self.start_time,
            metrics: self.metrics.clone(),
        };

        Router::new()
            .route("/health", get(health_handler))
            .route("/metrics", get(metrics_handler))
            .route("/rtm", get(client_ws_handler))
            .route("/rtm/admin", get(admin_ws_handler))
            .layer(TraceLayer::new_for_http())
            .with_state(state)
    }

    /// Bind the configured address and serve in a background task tracked
    /// by the coordinator. [`shutdown`](Self::shutdown) stops it.
    pub async fn listen(&self) -> std::io::Result<SocketAddr> {
        let listener = TcpListener::bind((self.config.host.as_str(), self.config.port)).await?;
        let addr = listener.local_addr()?;
        let service = self
            .router()
            .into_make_service_with_connect_info::<SocketAddr>();
        let token = self.shutdown.token();
        info!(%addr, "rtm server listening");

        let handle = tokio::spawn(async move {
            let stop = async move { token.cancelled().await };
            if let Err(e) = axum::serve(listener, service)
                .with_graceful_shutdown(stop)
                .await
            {
                error!(error = %e, "server error");
            }
        });
        self.shutdown.track(handle);
        Ok(addr)
    }

    /// Shut down every live connection, then stop the listeners.
    ///
    /// Connections are notified and drained concurrently, each bounded by
    /// `shutdown_drain_timeout`, and finally closed with `going away`. The
    /// listeners then get the same budget before they are aborted.
    pub async fn shutdown(&self) -> ShutdownReport {
        let timeout = self.config.shutdown_drain_timeout;
        let report = self
            .registry
            .close_all_connections(timeout, &self.config.shutdown_reason)
            .await;
        if !self.shutdown.stop_listeners(timeout).await {
            warn!("listener did not stop in time");
        }
        report
    }

    /// Server configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Live connections.
    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// Topic fan-out.
    pub fn broadcaster(&self) -> &Arc<EventBroadcaster> {
        &self.broadcaster
    }

    /// Dispatch pipeline.
    pub fn dispatcher(&self) -> &Arc<MessageDispatcher> {
        &self.dispatcher
    }

    /// Listener shutdown coordinator.
    pub fn coordinator(&self) -> &Arc<ShutdownCoordinator> {
        &self.shutdown
    }
}

/// GET /health
async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(health::health_check(
        state.start_time,
        state.registry.len(),
        state.registry.is_shutting_down(),
    ))
}

/// GET /metrics
async fn metrics_handler(State(state): State<AppState>) -> Response {
    match &state.metrics {
        Some(handle) => (
            [(CONTENT_TYPE, "text/plain; version=0.0.4")],
            render(handle),
        )
            .into_response(),
        None => (StatusCode::NOT_FOUND, "metrics recorder not installed").into_response(),
    }
}

/// GET /rtm
async fn client_ws_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
    State(state): State<AppState>,
) -> Response {
    upgrade(ws, addr, &headers, &query, state, ConnectionKind::Client)
}

/// GET /rtm/admin
async fn admin_ws_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
    State(state): State<AppState>,
) -> Response {
    upgrade(ws, addr, &headers, &query, state, ConnectionKind::Admin)
}

fn upgrade(
    ws: WebSocketUpgrade,
    addr: SocketAddr,
    headers: &HeaderMap,
    query: &HashMap<String, String>,
    state: AppState,
    kind: ConnectionKind,
) -> Response {
    let identity = auth::authenticate_request(state.authenticator.as_ref(), headers, query);
    ws.max_message_size(state.config.max_message_size)
        .on_upgrade(move |socket| async move {
            let identity = match identity {
                Ok(identity) => identity,
                Err(e) => {
                    warn!(remote_addr = %addr, %kind, error = %e, "handshake authentication failed");
                    counter!(CONNECTIONS_REFUSED_TOTAL, "reason" => "auth").increment(1);
                    session::reject(socket, CloseCode::PolicyViolation, e.to_string()).await;
                    return;
                }
            };

            let client = ClientContext::new(addr, kind);
            let (tx, rx) = mpsc::channel(OUTBOUND_CAPACITY);
            let connection = Arc::new(ClientConnection::new(client.client_id.clone(), tx));
            let auth = identity.map_or_else(AuthContext::new, AuthContext::with_identity);
            let broker = ConnectionBroker::new(
                client,
                connection,
                auth,
                state.broker_deps(),
                BrokerConfig::from(state.config.as_ref()),
            );
            let session_config = SessionConfig {
                heartbeat_interval: state.config.heartbeat_interval,
                idle_timeout: state.config.idle_timeout,
            };
            run_ws_session(socket, broker, rx, session_config).await;
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::AnonymousAuthenticator;
    use crate::dispatch::handlers::{AllowAll, register_builtins};
    use axum::body::Body;
    use axum::http::Request;
    use metrics_exporter_prometheus::PrometheusBuilder;
    use tower::ServiceExt;

    fn make_server() -> RtmServer {
        let mut handlers = HandlerRegistry::new();
        let mut authorizers = AuthorizerRegistry::new();
        register_builtins(&mut handlers, &mut authorizers);
        RtmServer::new(
            ServerConfig::default(),
            handlers,
            authorizers,
            Arc::new(AnonymousAuthenticator),
        )
        .unwrap()
    }

    async fn get_json(app: Router, uri: &str) -> (StatusCode, serde_json::Value) {
        let req = Request::builder().uri(uri).body(Body::empty()).unwrap();
        let resp = app.oneshot(req).await.unwrap();
        let status = resp.status();
        let body = axum::body::to_bytes(resp.into_body(), 10_000).await.unwrap();
        (status, serde_json::from_slice(&body).unwrap())
    }

    #[test]
    fn strict_registry_rejects_mismatch() {
        let handlers = HandlerRegistry::new();
        let mut authorizers = AuthorizerRegistry::new();
        let _ = authorizers.register_default::<AllowAll>("orphan");
        let result = RtmServer::new(
            ServerConfig::default(),
            handlers,
            authorizers,
            Arc::new(AnonymousAuthenticator),
        );
        let mismatch = result.err().unwrap();
        assert_eq!(mismatch.missing_handler, vec!["orphan".to_string()]);
    }

    #[test]
    fn lenient_registry_accepts_mismatch() {
        let mut authorizers = AuthorizerRegistry::new();
        let _ = authorizers.register_default::<AllowAll>("orphan");
        let config = ServerConfig {
            strict_registry: false,
            ..ServerConfig::default()
        };
        assert!(
            RtmServer::new(
                config,
                HandlerRegistry::new(),
                authorizers,
                Arc::new(AnonymousAuthenticator)
            )
            .is_ok()
        );
    }

    #[tokio::test]
    async fn health_endpoint_returns_ok() {
        let server = make_server();
        let (status, body) = get_json(server.router(), "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert_eq!(body["connections"], 0);
        assert!(body.get("uptime_secs").is_some());
    }

    #[tokio::test]
    async fn health_reports_shutdown() {
        let server = make_server();
        let report = server.shutdown().await;
        assert_eq!(report.total(), 0);
        assert!(server.coordinator().is_shutting_down());

        let (_, body) = get_json(server.router(), "/health").await;
        assert_eq!(body["status"], "shutting_down");
    }

    #[tokio::test]
    async fn metrics_without_recorder_is_404() {
        let server = make_server();
        let req = Request::builder().uri("/metrics").body(Body::empty()).unwrap();
        let resp = server.router().oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn metrics_with_recorder_renders_text() {
        let handle = PrometheusBuilder::new().build_recorder().handle();
        let server = make_server().with_metrics(handle);
        let req = Request::builder().uri("/metrics").body(Body::empty()).unwrap();
        let resp = server.router().oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let content_type = resp.headers().get(CONTENT_TYPE).unwrap().to_str().unwrap();
        assert!(content_type.starts_with("text/plain"));
    }

    #[tokio::test]
    async fn unknown_route_returns_404() {
        let server = make_server();
        let req = Request::builder()
            .uri("/nonexistent")
            .body(Body::empty())
            .unwrap();
        let resp = server.router().oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn listen_binds_auto_port_and_stops_on_shutdown() {
        let server = make_server();
        let addr = server.listen().await.unwrap();
        assert_ne!(addr.port(), 0);
        assert_eq!(server.coordinator().listener_count(), 1);

        let _ = server.shutdown().await;
        assert_eq!(server.coordinator().listener_count(), 0);
        assert!(tokio::net::TcpStream::connect(addr).await.is_err());
    }
}
