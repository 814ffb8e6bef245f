//! Terminal socket gateway.
//!
//! One [`Gateway`] per process. The server is bound on the first call to
//! [`Gateway::ensure_started`]; later calls return the same address. Each
//! socket accepted on the terminal path gets its own relay bridge, torn down
//! when the socket goes away.

use std::{io, net::SocketAddr, sync::Arc};

use axum::{
    Router,
    extract::{
        Query, State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    response::IntoResponse,
    routing::get,
};
use futures::{SinkExt, StreamExt, stream::SplitSink};
use portal_core::{ClientMessage, ConfigurationError, ControlPlane, GatewayConfig, ServerMessage};
use portal_exec::{CommandRunner, DockerClient};
use portal_relay::{BridgeConfig, RelayRegistry};
use serde::Deserialize;
use thiserror::Error;
use tokio::{
    net::TcpListener,
    sync::{Notify, OnceCell, mpsc},
};
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::routes;

const EVENT_CHANNEL_LEN: usize = 1024;

/// Gateway error.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
    #[error(transparent)]
    Config(#[from] ConfigurationError),
}

/// State shared by every handler.
#[derive(Clone)]
pub struct GatewayState {
    pub config: Arc<GatewayConfig>,
    pub relays: Arc<RelayRegistry>,
    pub runner: Arc<dyn CommandRunner>,
}

impl GatewayState {
    /// Build state around a control plane and a one-shot command runner.
    #[must_use]
    pub fn new(
        config: GatewayConfig,
        control: Arc<dyn ControlPlane>,
        runner: Arc<dyn CommandRunner>,
    ) -> Self {
        let bridge = BridgeConfig::from(&config);
        Self::with_bridge(config, bridge, control, runner)
    }

    /// Like [`Self::new`] with an explicit bridge configuration.
    #[must_use]
    pub fn with_bridge(
        config: GatewayConfig,
        bridge: BridgeConfig,
        control: Arc<dyn ControlPlane>,
        runner: Arc<dyn CommandRunner>,
    ) -> Self {
        let relays = RelayRegistry::new(control, bridge);
        Self {
            config: Arc::new(config),
            relays: Arc::new(relays),
            runner,
        }
    }
}

/// Handshake parameters of the terminal socket. Other parameters are ignored.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TerminalQuery {
    pub container_id: Option<String>,
}

struct Running {
    addr: SocketAddr,
    shutdown: Arc<Notify>,
}

/// Process-wide terminal gateway.
pub struct Gateway {
    state: GatewayState,
    extra: Router,
    running: OnceCell<Running>,
}

impl Gateway {
    /// Create a gateway. Nothing is bound until [`Self::ensure_started`].
    #[must_use]
    pub fn new(state: GatewayState) -> Self {
        Self {
            state,
            extra: Router::new(),
            running: OnceCell::new(),
        }
    }

    /// Gateway talking to the container runtime named by `config`.
    #[must_use]
    pub fn from_config(config: GatewayConfig) -> Self {
        let docker = Arc::new(DockerClient::from_config(&config));
        Self::new(GatewayState::new(config, docker.clone(), docker))
    }

    /// Serve additional routes next to the gateway's own.
    #[must_use]
    pub fn with_routes(mut self, routes: Router) -> Self {
        self.extra = self.extra.merge(routes);
        self
    }

    /// Shared handler state.
    #[must_use]
    pub const fn state(&self) -> &GatewayState {
        &self.state
    }

    /// Live relay connections.
    #[must_use]
    pub fn registry(&self) -> &Arc<RelayRegistry> {
        &self.state.relays
    }

    /// Address the server is bound to, if started.
    #[must_use]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.running.get().map(|r| r.addr)
    }

    /// Full router: terminal socket, collaborator routes and extras.
    pub fn router(&self) -> Router {
        Router::new()
            .route(&self.state.config.ws_path, get(ws_handler))
            .merge(routes::api_router())
            .with_state(self.state.clone())
            .merge(self.extra.clone())
            .layer(CorsLayer::permissive())
            .layer(TraceLayer::new_for_http())
    }

    /// Bind and start serving unless already running.
    ///
    /// Concurrent callers wait for the same initialization and all get the
    /// same address.
    ///
    /// # Errors
    /// Returns error if the listen address cannot be bound.
    pub async fn ensure_started(&self) -> Result<SocketAddr, GatewayError> {
        let running = self
            .running
            .get_or_try_init(|| async {
                let bind = self.state.config.bind;
                let listener = TcpListener::bind(bind)
                    .await
                    .map_err(|source| GatewayError::Bind { addr: bind, source })?;
                let addr = listener
                    .local_addr()
                    .map_err(|source| GatewayError::Bind { addr: bind, source })?;

                let shutdown = Arc::new(Notify::new());
                let signal = Arc::clone(&shutdown);
                let app = self.router();
                tokio::spawn(async move {
                    let served = axum::serve(listener, app)
                        .with_graceful_shutdown(async move { signal.notified().await })
                        .await;
                    if let Err(e) = served {
                        tracing::error!("Gateway server failed: {e}");
                    }
                });

                tracing::info!(%addr, ws_path = %self.state.config.ws_path, "Gateway listening");
                Ok::<_, GatewayError>(Running { addr, shutdown })
            })
            .await?;
        Ok(running.addr)
    }

    /// Close every relay and stop accepting connections.
    pub async fn shutdown(&self) {
        self.state.relays.close_all().await;
        if let Some(running) = self.running.get() {
            running.shutdown.notify_one();
            tracing::info!(addr = %running.addr, "Gateway shutting down");
        }
    }
}

impl std::fmt::Debug for Gateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Gateway")
            .field("bind", &self.state.config.bind)
            .field("local_addr", &self.local_addr())
            .finish_non_exhaustive()
    }
}

/// Terminal socket upgrade handler.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(query): Query<TerminalQuery>,
    State(state): State<GatewayState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state, query))
}

async fn handle_socket(socket: WebSocket, state: GatewayState, query: TerminalQuery) {
    let (mut sender, mut receiver) = socket.split();

    let target = match state.config.resolve_target(query.container_id.as_deref()) {
        Ok(target) => target,
        Err(e) => {
            tracing::warn!("Rejecting terminal socket: {e}");
            let _ = send_json(&mut sender, &ServerMessage::error(e.to_string())).await;
            let _ = sender.send(Message::Close(None)).await;
            return;
        }
    };

    let (tx, mut rx) = mpsc::channel::<ServerMessage>(EVENT_CHANNEL_LEN);

    let send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if send_json(&mut sender, &msg).await.is_err() {
                break;
            }
        }
    });

    let (conn_id, bridge) = state.relays.open(&target, tx.clone()).await;

    while let Some(msg) = receiver.next().await {
        let text = match msg {
            Ok(Message::Text(text)) => text.to_string(),
            Ok(Message::Binary(data)) => match String::from_utf8(data.to_vec()) {
                Ok(s) => s,
                Err(_) => continue,
            },
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => {
                tracing::error!(%conn_id, "WebSocket error: {e}");
                break;
            }
        };

        let client_msg: ClientMessage = match serde_json::from_str(&text) {
            Ok(m) => m,
            Err(e) => {
                tracing::warn!(%conn_id, "Invalid client message: {e}");
                let _ = tx
                    .send(ServerMessage::error(format!("Invalid message: {e}")))
                    .await;
                continue;
            }
        };

        let sent = match client_msg {
            ClientMessage::Ping => {
                let _ = tx.send(ServerMessage::Pong).await;
                Ok(())
            }
            ClientMessage::Input { data } => bridge.input(data).await,
            ClientMessage::Resize { cols, rows } => bridge.resize(cols, rows).await,
            ClientMessage::Reconnect => bridge.reconnect().await,
        };
        if let Err(e) = sent {
            tracing::warn!(%conn_id, "Dropping client message: {e}");
            break;
        }
    }

    state.relays.close(conn_id).await;
    bridge.stopped().await;
    drop(tx);
    send_task.abort();

    tracing::info!(%conn_id, target_container = %target, "Terminal socket disconnected");
}

async fn send_json(
    sender: &mut SplitSink<WebSocket, Message>,
    msg: &ServerMessage,
) -> Result<(), axum::Error> {
    let json = match serde_json::to_string(msg) {
        Ok(j) => j,
        Err(e) => {
            tracing::error!("Failed to serialize message: {e}");
            return Ok(());
        }
    };
    sender.send(Message::Text(json.into())).await
}
