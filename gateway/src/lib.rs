// Library surface for the gateway: router and run loop shared with the
// integration tests. Binary entrypoint stays in src/main.rs.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use dashmap::DashMap;
use once_cell::sync::Lazy;
use prometheus::{
    register_int_counter, register_int_counter_vec, register_int_gauge, Encoder, IntCounter,
    IntCounterVec, IntGauge, TextEncoder,
};
use tokio::sync::{mpsc, oneshot};
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{debug, error, info, warn};

use common_sync::{
    clock,
    message::{self, ClientMessage, ServerMessage},
    metrics, shutdown,
};
use registry::{Effect, RegistryError, SharedRegistry};

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

pub const HEALTHZ_PATH: &str = "/healthz";
pub const VERSION_PATH: &str = "/version";
pub const METRICS_PATH: &str = "/metrics";
pub const WS_PATH: &str = "/ws";

static HTTP_REQUESTS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "gateway_http_requests_total",
        "Total HTTP requests per route",
        &["path"]
    )
    .expect("register gateway_http_requests_total")
});

static CONNECTED_CLIENTS: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!(
        "gateway_connected_clients",
        "WebSocket connections currently attached"
    )
    .expect("register gateway_connected_clients")
});

static SNAPSHOTS_RELAYED_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "gateway_snapshots_relayed_total",
        "Host position snapshots accepted and relayed"
    )
    .expect("register gateway_snapshots_relayed_total")
});

static CONTROL_REJECTED_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "gateway_control_rejected_total",
        "Playback control messages rejected because the sender was not host"
    )
    .expect("register gateway_control_rejected_total")
});

#[derive(Debug, Clone, serde::Deserialize, serde::Serialize)]
pub struct GatewaySettings {
    pub bind_addr: SocketAddr,
}

impl GatewaySettings {
    pub fn from_env() -> Result<Self, BoxError> {
        let bind_addr: SocketAddr = std::env::var("GATEWAY_BIND_ADDR")
            .unwrap_or_else(|_| "127.0.0.1:3000".to_string())
            .parse()
            .map_err(|e| Box::new(e) as BoxError)?;
        Ok(Self { bind_addr })
    }
}

#[derive(Debug)]
pub struct GatewayConfig {
    pub bind_addr: SocketAddr,
    pub ready_tx: Option<oneshot::Sender<SocketAddr>>,
}

impl GatewayConfig {
    pub fn from_settings(s: GatewaySettings) -> Self {
        Self {
            bind_addr: s.bind_addr,
            ready_tx: None,
        }
    }

    pub fn from_env() -> Result<Self, BoxError> {
        GatewaySettings::from_env().map(Self::from_settings)
    }
}

/// Fan-out handles, one unbounded sender per attached connection. The
/// session task owns the socket write half; everything else posts here.
type ConnectionRegistry = DashMap<String, mpsc::UnboundedSender<Message>>;

#[derive(Clone)]
struct AppState {
    registry: SharedRegistry,
    connections: Arc<ConnectionRegistry>,
}

pub fn build_router() -> Router {
    let state = AppState {
        registry: registry::shared(),
        connections: Arc::new(DashMap::new()),
    };

    Router::new()
        .route(HEALTHZ_PATH, get(healthz))
        .route(VERSION_PATH, get(version))
        .route(METRICS_PATH, get(metrics_endpoint))
        .route(WS_PATH, get(ws_handler))
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

async fn healthz() -> impl IntoResponse {
    HTTP_REQUESTS_TOTAL.with_label_values(&[HEALTHZ_PATH]).inc();
    axum::http::StatusCode::OK
}

async fn version() -> impl IntoResponse {
    HTTP_REQUESTS_TOTAL.with_label_values(&[VERSION_PATH]).inc();
    let body = serde_json::json!({
        "name": "gateway",
        "version": env!("CARGO_PKG_VERSION"),
    });
    Json(body)
}

async fn metrics_endpoint() -> impl IntoResponse {
    HTTP_REQUESTS_TOTAL.with_label_values(&[METRICS_PATH]).inc();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    let encoder = TextEncoder::new();
    if let Err(err) = encoder.encode(&metric_families, &mut buffer) {
        error!(%err, "metrics encode failed");
        return (
            axum::http::StatusCode::INTERNAL_SERVER_ERROR,
            "metrics encode failed",
        )
            .into_response();
    }
    let body = String::from_utf8(buffer).unwrap_or_default();
    (
        axum::http::StatusCode::OK,
        [(axum::http::header::CONTENT_TYPE, encoder.format_type())],
        body,
    )
        .into_response()
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    HTTP_REQUESTS_TOTAL.with_label_values(&[WS_PATH]).inc();
    ws.on_upgrade(|socket| ws_session(socket, state))
}

async fn ws_session(mut socket: WebSocket, state: AppState) {
    let connection_id = uuid::Uuid::new_v4().to_string();
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();

    state.connections.insert(connection_id.clone(), tx.clone());
    CONNECTED_CLIENTS.inc();
    debug!(connection_id = %connection_id, "connection attached");

    // Fresh connections get the room listing straight away.
    {
        let listing = ServerMessage::RoomsList {
            rooms: state.registry.read().await.rooms_list(),
        };
        if let Some(bytes) = encode_logged(&listing) {
            let _ = tx.send(Message::Binary(bytes));
        }
    }

    loop {
        tokio::select! {
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Binary(bytes))) => {
                        handle_frame(&state, &connection_id, &bytes).await;
                    }
                    Some(Ok(Message::Text(text))) => {
                        handle_frame(&state, &connection_id, text.as_bytes()).await;
                    }
                    Some(Ok(Message::Ping(payload))) => {
                        let _ = socket.send(Message::Pong(payload)).await;
                    }
                    Some(Ok(Message::Pong(_))) => {}
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                }
            }

            Some(outgoing) = rx.recv() => {
                if socket.send(outgoing).await.is_err() {
                    break;
                }
            }
        }
    }

    state.connections.remove(&connection_id);
    CONNECTED_CLIENTS.dec();
    debug!(connection_id = %connection_id, "connection detached");

    let effects = state.registry.write().await.disconnect(&connection_id);
    dispatch(&state, effects);

    let _ = socket.close().await;
}

async fn handle_frame(state: &AppState, connection_id: &str, bytes: &[u8]) {
    match message::decode::<ClientMessage>(bytes) {
        Ok(message) => handle_client_message(state, connection_id, message).await,
        Err(err) => {
            debug!(connection_id = %connection_id, %err, "dropped undecodable frame");
        }
    }
}

async fn handle_client_message(state: &AppState, connection_id: &str, message: ClientMessage) {
    match message {
        ClientMessage::SyncTime { nonce } => {
            let reply = ServerMessage::SyncTimeResponse {
                nonce,
                reference_time_ms: clock::timestamp_ms(),
            };
            if let Some(bytes) = encode_logged(&reply) {
                send_bytes(state, connection_id, bytes);
            }
        }
        ClientMessage::JoinRoom {
            room_id,
            display_name,
        } => {
            let result = {
                let mut registry = state.registry.write().await;
                registry.join_room(&room_id, connection_id, &display_name, |id| {
                    state.connections.contains_key(id)
                })
            };
            finish_control(state, result, "join_room");
        }
        ClientMessage::LeaveRoom => {
            let effects = state.registry.write().await.leave(connection_id);
            dispatch(state, effects);
        }
        ClientMessage::PlaySong {
            room_id,
            media_id,
            title,
        } => {
            let result = state
                .registry
                .write()
                .await
                .play_song(&room_id, connection_id, &media_id, &title);
            finish_control(state, result, "play_song");
        }
        ClientMessage::PlayerAction { room_id, action } => {
            let result = state
                .registry
                .write()
                .await
                .player_action(&room_id, connection_id, action);
            finish_control(state, result, "player_action");
        }
        ClientMessage::TimeUpdate {
            room_id,
            position_secs,
            reference_now_ms,
        } => {
            let result = state.registry.write().await.time_update(
                &room_id,
                connection_id,
                position_secs,
                reference_now_ms,
            );
            if result.is_ok() {
                SNAPSHOTS_RELAYED_TOTAL.inc();
            }
            finish_control(state, result, "time_update");
        }
        ClientMessage::AddToQueue {
            room_id,
            media_id,
            title,
        } => {
            let result = state
                .registry
                .write()
                .await
                .add_to_queue(&room_id, connection_id, &media_id, &title);
            finish_control(state, result, "add_to_queue");
        }
        ClientMessage::PlayNext { room_id } => {
            let result = state
                .registry
                .write()
                .await
                .play_next(&room_id, connection_id);
            finish_control(state, result, "play_next");
        }
    }
}

fn finish_control(
    state: &AppState,
    result: Result<Vec<Effect>, RegistryError>,
    kind: &'static str,
) {
    match result {
        Ok(effects) => dispatch(state, effects),
        Err(RegistryError::NotHost {
            room_id,
            connection_id,
        }) => {
            CONTROL_REJECTED_TOTAL.inc();
            warn!(room_id = %room_id, connection_id = %connection_id, kind, "rejected control message from non-host");
        }
        Err(RegistryError::RoomNotFound { room_id }) => {
            debug!(room_id = %room_id, kind, "dropped message for unknown room");
        }
        Err(RegistryError::InvalidRoomId { room_id }) => {
            debug!(room_id = %room_id, kind, "refused malformed room id");
        }
    }
}

fn dispatch(state: &AppState, effects: Vec<Effect>) {
    for effect in effects {
        match effect {
            Effect::Send { to, message } => {
                if let Some(bytes) = encode_logged(&message) {
                    send_bytes(state, &to, bytes);
                }
            }
            Effect::SendMany { to, message } => {
                if let Some(bytes) = encode_logged(&message) {
                    for connection_id in &to {
                        send_bytes(state, connection_id, bytes.clone());
                    }
                }
            }
            Effect::SendAll { message } => {
                if let Some(bytes) = encode_logged(&message) {
                    for entry in state.connections.iter() {
                        let _ = entry.value().send(Message::Binary(bytes.clone()));
                    }
                }
            }
        }
    }
}

fn send_bytes(state: &AppState, connection_id: &str, bytes: Vec<u8>) {
    if let Some(sender) = state.connections.get(connection_id) {
        let _ = sender.send(Message::Binary(bytes));
    }
}

fn encode_logged(message: &ServerMessage) -> Option<Vec<u8>> {
    match message::encode(message) {
        Ok(bytes) => Some(bytes),
        Err(err) => {
            error!(%err, "failed to encode outbound message");
            None
        }
    }
}

pub async fn run(
    config: GatewayConfig,
    shutdown_rx: shutdown::ShutdownReceiver,
) -> Result<(), BoxError> {
    let listener = tokio::net::TcpListener::bind(config.bind_addr)
        .await
        .map_err(|e| Box::new(e) as BoxError)?;
    let local_addr = listener.local_addr().map_err(|e| Box::new(e) as BoxError)?;
    if let Some(tx) = config.ready_tx {
        let _ = tx.send(local_addr);
    }

    metrics::room_metrics().on_startup();
    Lazy::force(&CONNECTED_CLIENTS);
    Lazy::force(&SNAPSHOTS_RELAYED_TOTAL);
    Lazy::force(&CONTROL_REJECTED_TOTAL);

    let app = build_router();
    info!(addr = %local_addr, "gateway listening");
    let server = tokio::spawn(async move {
        if let Err(err) = axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        {
            error!(%err, "gateway server stopped unexpectedly");
        }
    });

    shutdown::wait(shutdown_rx).await;
    server.abort();
    Ok(())
}

pub async fn run_with_ctrl_c(config: GatewayConfig) -> Result<(), BoxError> {
    let (tx, rx) = shutdown::channel();
    let task = tokio::spawn(async move {
        let _ = run(config, rx).await;
    });

    tokio::signal::ctrl_c().await.ok();
    info!("gateway: ctrl_c received, shutting down");
    shutdown::trigger(&tx);
    let _ = task.await;
    Ok(())
}
