//! Playback participant: joins a room on the gateway, runs the clock
//! offset handshake, then either broadcasts its position (host) or keeps
//! local playback locked to the relayed host position (listener).

pub mod media;
pub mod session;
pub mod sync;

use std::net::SocketAddr;

use rand::Rng;
use tracing::{error, info};

use common_sync::{message::ClientMessage, metrics, shutdown};

use media::SimPlayer;
use session::{estimate_offset, run_session, Connection, SessionState};

pub type BoxError = common_sync::metrics::BoxError;

pub const METRICS_PATH: &str = "/metrics";

#[derive(Debug, Clone, serde::Deserialize, serde::Serialize)]
pub struct PlayerSettings {
    pub server_url: String,
    pub room_id: String,
    pub display_name: String,
    pub media_id: Option<String>,
    pub media_title: Option<String>,
    pub metrics_addr: SocketAddr,
}

impl PlayerSettings {
    pub fn from_env() -> Result<Self, BoxError> {
        let server_url = std::env::var("PLAYER_SERVER_URL")
            .unwrap_or_else(|_| "ws://127.0.0.1:3000/ws".to_string());
        let room_id = std::env::var("PLAYER_ROOM_ID").unwrap_or_else(|_| generate_room_code());
        let display_name =
            std::env::var("PLAYER_DISPLAY_NAME").unwrap_or_else(|_| "player".to_string());
        let media_id = std::env::var("PLAYER_MEDIA_ID").ok();
        let media_title = std::env::var("PLAYER_MEDIA_TITLE").ok();
        let metrics_addr: SocketAddr = std::env::var("PLAYER_METRICS_ADDR")
            .unwrap_or_else(|_| "127.0.0.1:3300".to_string())
            .parse()
            .map_err(|e| Box::new(e) as BoxError)?;
        Ok(Self {
            server_url,
            room_id,
            display_name,
            media_id,
            media_title,
            metrics_addr,
        })
    }

    pub fn into_config(self) -> PlayerConfig {
        PlayerConfig::from_settings(self)
    }
}

#[derive(Debug)]
pub struct PlayerConfig {
    pub server_url: String,
    pub room_id: String,
    pub display_name: String,
    pub media_id: Option<String>,
    pub media_title: Option<String>,
    pub metrics_addr: SocketAddr,
}

impl PlayerConfig {
    pub fn from_settings(settings: PlayerSettings) -> Self {
        Self {
            server_url: settings.server_url,
            room_id: settings.room_id,
            display_name: settings.display_name,
            media_id: settings.media_id,
            media_title: settings.media_title,
            metrics_addr: settings.metrics_addr,
        }
    }

    pub fn from_env() -> Result<Self, BoxError> {
        PlayerSettings::from_env().map(Self::from_settings)
    }
}

/// Room codes are the four-digit kind people read out loud.
pub fn generate_room_code() -> String {
    rand::thread_rng().gen_range(1000..10000).to_string()
}

pub async fn run(
    config: PlayerConfig,
    shutdown_rx: shutdown::ShutdownReceiver,
) -> Result<(), BoxError> {
    metrics::playback_metrics().on_startup();
    metrics::spawn_metrics_exporter(config.metrics_addr, METRICS_PATH, "player");

    let mut conn = Connection::connect(&config.server_url).await?;
    let offset_ms = estimate_offset(&mut conn).await?;

    info!(room_id = %config.room_id, display_name = %config.display_name, "joining room");
    conn.send(&ClientMessage::JoinRoom {
        room_id: config.room_id.clone(),
        display_name: config.display_name.clone(),
    })
    .await?;

    let auto_start = config.media_id.map(|media_id| {
        let title = config.media_title.unwrap_or_else(|| media_id.clone());
        (media_id, title)
    });

    let state = SessionState::new(config.room_id, auto_start, SimPlayer::new(), offset_ms);
    run_session(conn, state, shutdown_rx).await?;
    Ok(())
}

pub async fn run_with_ctrl_c(config: PlayerConfig) -> Result<(), BoxError> {
    let (shutdown_tx, shutdown_rx) = shutdown::channel();

    let ctrl_c = tokio::spawn(async move {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!(%err, "player: cannot listen for ctrl_c");
        }
        shutdown::trigger(&shutdown_tx);
    });

    let result = run(config, shutdown_rx).await;

    ctrl_c.abort();
    result
}
