//! One participant session: the connection to the gateway, the clock
//! offset handshake, and the state machine that reacts to room traffic.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio_tungstenite::{
    connect_async,
    tungstenite::{Error as WsError, Message},
    MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, info, warn};

use common_sync::{
    clock::{self, OffsetEstimator, OffsetSample, SAMPLE_ROUNDS},
    message::{self, ClientMessage, PlaybackAction, QueueEntry, Role, RoomUser, ServerMessage},
    metrics::playback_metrics,
    shutdown,
};

use crate::media::{MediaError, MediaPlayer};
use crate::sync::{Correction, DriftCorrector, SyncPoint};

/// Host position reports go out on this cadence.
pub const BROADCAST_INTERVAL: Duration = Duration::from_millis(500);
/// One clock probe round is abandoned after this long.
pub const SYNC_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Error)]
pub enum PlayerError {
    #[error("websocket error: {0}")]
    Ws(#[from] WsError),
    #[error("encoding failed: {0}")]
    Encoding(#[from] serde_json::Error),
    #[error("connection closed")]
    ConnectionClosed,
    #[error("timed out waiting for the server")]
    Timeout,
    #[error(transparent)]
    Media(#[from] MediaError),
}

/// Binary-frame message channel to the gateway.
pub struct Connection {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl Connection {
    pub async fn connect(url: &str) -> Result<Self, PlayerError> {
        let (stream, _response) = connect_async(url).await?;
        Ok(Self { stream })
    }

    pub async fn send(&mut self, message: &ClientMessage) -> Result<(), PlayerError> {
        let bytes = message::encode(message)?;
        self.stream.send(Message::Binary(bytes)).await?;
        Ok(())
    }

    pub async fn recv(&mut self) -> Result<ServerMessage, PlayerError> {
        loop {
            match self.stream.next().await {
                Some(Ok(Message::Binary(bytes))) => return Ok(message::decode(&bytes)?),
                Some(Ok(Message::Text(text))) => return Ok(message::decode(text.as_bytes())?),
                Some(Ok(Message::Ping(payload))) => {
                    self.stream.send(Message::Pong(payload)).await?;
                }
                Some(Ok(Message::Pong(_))) => {}
                Some(Ok(Message::Close(_))) | None => return Err(PlayerError::ConnectionClosed),
                Some(Ok(other)) => {
                    debug!(frame = ?other, "ignoring unexpected websocket frame");
                }
                Some(Err(err)) => return Err(err.into()),
            }
        }
    }

    pub async fn close(&mut self) -> Result<(), PlayerError> {
        self.stream.close(None).await?;
        Ok(())
    }
}

/// Runs the clock offset handshake: [`SAMPLE_ROUNDS`] probe round trips,
/// failed rounds dropped, median of the survivors. With no survivors the
/// offset is zero and playback runs on the local clock alone.
pub async fn estimate_offset(conn: &mut Connection) -> Result<f64, PlayerError> {
    let mut estimator = OffsetEstimator::new();

    for round in 0..SAMPLE_ROUNDS {
        let nonce = round as u64;
        let t0 = clock::timestamp_ms();
        conn.send(&ClientMessage::SyncTime { nonce }).await?;

        match await_probe_response(conn, nonce).await {
            Ok(t1) => {
                let t2 = clock::timestamp_ms();
                estimator.record(OffsetSample::from_round_trip(t0, t1, t2));
                playback_metrics().inc_clock_samples();
            }
            Err(PlayerError::Timeout) => {
                warn!(round, "clock probe timed out");
            }
            Err(err) => return Err(err),
        }
    }

    let offset_ms = estimator.estimate();
    info!(
        offset_ms,
        samples = estimator.sample_count(),
        "clock offset estimated"
    );
    Ok(offset_ms)
}

async fn await_probe_response(conn: &mut Connection, nonce: u64) -> Result<u64, PlayerError> {
    loop {
        let message = tokio::time::timeout(SYNC_TIMEOUT, conn.recv())
            .await
            .map_err(|_| PlayerError::Timeout)??;
        match message {
            ServerMessage::SyncTimeResponse {
                nonce: got,
                reference_time_ms,
            } if got == nonce => return Ok(reference_time_ms),
            ServerMessage::SyncTimeResponse { nonce: got, .. } => {
                debug!(expected = nonce, got, "skipping stale probe response");
            }
            other => {
                debug!(message = ?other, "skipping message during clock handshake");
            }
        }
    }
}

/// Everything a participant tracks about its room, independent of the
/// transport. Message handlers return what should be sent back, so the
/// state machine can be driven directly in tests.
pub struct SessionState<P> {
    room_id: String,
    auto_start: Option<(String, String)>,
    player: P,
    corrector: DriftCorrector,
    offset_ms: f64,
    role: Option<Role>,
    playing: bool,
    queue: Vec<QueueEntry>,
    roster: Vec<RoomUser>,
}

impl<P: MediaPlayer> SessionState<P> {
    pub fn new(
        room_id: String,
        auto_start: Option<(String, String)>,
        player: P,
        offset_ms: f64,
    ) -> Self {
        Self {
            room_id,
            auto_start,
            player,
            corrector: DriftCorrector::new(),
            offset_ms,
            role: None,
            playing: false,
            queue: Vec::new(),
            roster: Vec::new(),
        }
    }

    pub fn role(&self) -> Option<Role> {
        self.role
    }

    pub fn player(&self) -> &P {
        &self.player
    }

    pub fn queue(&self) -> &[QueueEntry] {
        &self.queue
    }

    pub fn roster(&self) -> &[RoomUser] {
        &self.roster
    }

    pub fn handle_message(
        &mut self,
        message: ServerMessage,
        now_ms: u64,
    ) -> Result<Vec<ClientMessage>, PlayerError> {
        match message {
            ServerMessage::UserRole { role } => self.transition_role(role),
            ServerMessage::InitialSync {
                media_id,
                title,
                playing,
                position_secs,
                reference_now_ms,
                sequence,
                queue,
            } => {
                self.queue = queue;
                self.playing = playing;
                match media_id {
                    Some(media_id) => {
                        self.player
                            .load(&media_id, title.as_deref().unwrap_or(""))?;
                        if playing {
                            self.player.play()?;
                        }
                        let snapshot = SyncPoint {
                            position_secs,
                            reference_now_ms,
                            sequence,
                        };
                        let target = self.corrector.catch_up(
                            &snapshot,
                            playing,
                            now_ms,
                            self.offset_ms,
                            &mut self.player,
                        )?;
                        info!(%media_id, target, "caught up into the room");
                    }
                    None => {
                        // Nothing to drive yet, but relays at or below the
                        // snapshot sequence are already covered by it.
                        self.corrector.set_floor(sequence);
                    }
                }
                Ok(Vec::new())
            }
            ServerMessage::ReceiveSong { media_id, title } => {
                self.player.load(&media_id, &title)?;
                self.playing = false;
                info!(%title, "loaded track");
                Ok(Vec::new())
            }
            ServerMessage::ReceiveAction { action } => {
                self.apply_action(action)?;
                Ok(Vec::new())
            }
            ServerMessage::ReceiveTime {
                position_secs,
                reference_now_ms,
                sequence,
            } => {
                self.apply_time(position_secs, reference_now_ms, sequence, now_ms)?;
                Ok(Vec::new())
            }
            ServerMessage::UpdateQueue { queue } => {
                debug!(entries = queue.len(), "queue updated");
                self.queue = queue;
                Ok(Vec::new())
            }
            ServerMessage::UpdateUsers { users } => {
                info!(participants = users.len(), "roster updated");
                self.roster = users;
                Ok(Vec::new())
            }
            ServerMessage::SyncTimeResponse { nonce, .. } => {
                debug!(nonce, "late probe response after handshake");
                Ok(Vec::new())
            }
            ServerMessage::RoomsList { rooms } => {
                debug!(rooms = rooms.len(), "room listing received");
                Ok(Vec::new())
            }
        }
    }

    /// Emits the host position report, or nothing when this participant
    /// has no broadcast duty right now.
    pub fn broadcast(&mut self, now_ms: u64) -> Result<Option<ClientMessage>, PlayerError> {
        if self.role != Some(Role::Host) || !self.playing {
            return Ok(None);
        }
        if self.player.loaded_media().is_none() {
            return Ok(None);
        }

        let position_secs = self.player.position_secs()?;
        Ok(Some(ClientMessage::TimeUpdate {
            room_id: self.room_id.clone(),
            position_secs,
            reference_now_ms: reference_now_ms(now_ms, self.offset_ms),
        }))
    }

    fn transition_role(&mut self, next: Role) -> Result<Vec<ClientMessage>, PlayerError> {
        if self.role == Some(next) {
            return Ok(Vec::new());
        }
        if let Some(previous) = self.role {
            self.on_role_exit(previous)?;
        }
        self.role = Some(next);
        self.on_role_entry(next)
    }

    fn on_role_exit(&mut self, role: Role) -> Result<(), PlayerError> {
        match role {
            Role::Listener => {
                // A promotion must not carry a correction rate along.
                if self.player.loaded_media().is_some() && self.player.rate() != 1.0 {
                    self.player.set_rate(1.0)?;
                }
            }
            Role::Host => {}
        }
        Ok(())
    }

    fn on_role_entry(&mut self, role: Role) -> Result<Vec<ClientMessage>, PlayerError> {
        match role {
            Role::Host => {
                info!(room_id = %self.room_id, "assigned host duties");
                let mut outgoing = Vec::new();
                if let Some((media_id, title)) = self.auto_start.take() {
                    outgoing.push(ClientMessage::PlaySong {
                        room_id: self.room_id.clone(),
                        media_id,
                        title,
                    });
                }
                Ok(outgoing)
            }
            Role::Listener => {
                info!(room_id = %self.room_id, "joined as listener");
                Ok(Vec::new())
            }
        }
    }

    fn apply_action(&mut self, action: PlaybackAction) -> Result<(), PlayerError> {
        match action {
            PlaybackAction::Play => {
                self.playing = true;
                if self.player.loaded_media().is_some() {
                    self.player.play()?;
                }
            }
            PlaybackAction::Pause => {
                self.playing = false;
                if self.player.loaded_media().is_some() {
                    self.player.pause()?;
                }
            }
        }
        Ok(())
    }

    fn apply_time(
        &mut self,
        position_secs: f64,
        reference_now_ms: u64,
        sequence: u64,
        now_ms: u64,
    ) -> Result<(), PlayerError> {
        // The host is the reference; it never corrects against itself.
        if self.role == Some(Role::Host) {
            debug!(sequence, "ignoring relayed position as host");
            return Ok(());
        }
        if self.player.loaded_media().is_none() {
            debug!(sequence, "no media loaded, skipping position report");
            return Ok(());
        }

        let point = SyncPoint {
            position_secs,
            reference_now_ms,
            sequence,
        };
        let outcome = match self.corrector.apply(
            &point,
            self.playing,
            now_ms,
            self.offset_ms,
            &mut self.player,
        ) {
            Ok(outcome) => outcome,
            // The player was not ready for this cycle; the next report
            // corrects from wherever playback actually is.
            Err(err) => {
                debug!(%err, sequence, "skipping drift correction");
                return Ok(());
            }
        };
        match outcome {
            Correction::Seek { to } => info!(seek_to = to, "hard drift correction"),
            Correction::Rate { to } => debug!(rate = to, "playback rate adjusted"),
            Correction::Stale | Correction::Unchanged => {}
        }
        Ok(())
    }
}

/// Drives a session until shutdown or the connection drops.
pub async fn run_session<P: MediaPlayer>(
    mut conn: Connection,
    mut state: SessionState<P>,
    shutdown_rx: shutdown::ShutdownReceiver,
) -> Result<(), PlayerError> {
    let mut ticker = tokio::time::interval(BROADCAST_INTERVAL);
    let mut shutdown_wait = Box::pin(shutdown::wait(shutdown_rx));

    loop {
        tokio::select! {
            _ = &mut shutdown_wait => {
                info!("session shutting down");
                let _ = conn.send(&ClientMessage::LeaveRoom).await;
                let _ = conn.close().await;
                return Ok(());
            }

            incoming = conn.recv() => {
                match incoming {
                    Ok(message) => {
                        let outgoing = state.handle_message(message, clock::timestamp_ms())?;
                        for reply in &outgoing {
                            conn.send(reply).await?;
                        }
                    }
                    Err(PlayerError::ConnectionClosed) => {
                        info!("server closed the connection");
                        return Ok(());
                    }
                    Err(err) => return Err(err),
                }
            }

            _ = ticker.tick() => {
                match state.broadcast(clock::timestamp_ms()) {
                    Ok(Some(report)) => conn.send(&report).await?,
                    Ok(None) => {}
                    // A position read can fail transiently; drop the tick,
                    // the next one reads again.
                    Err(PlayerError::Media(err)) => {
                        debug!(%err, "skipping position report");
                    }
                    Err(err) => return Err(err),
                }
            }
        }
    }
}

fn reference_now_ms(now_ms: u64, offset_ms: f64) -> u64 {
    (now_ms as f64 + offset_ms).max(0.0) as u64
}
