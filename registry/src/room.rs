use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use common_sync::message::{QueueEntry, RoomSummary, RoomUser, ServerMessage};

/// A connection attached to a room. Kept in join order; the oldest
/// remaining participant inherits the host role on failover.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Participant {
    pub connection_id: String,
    pub display_name: String,
    pub joined_at: DateTime<Utc>,
}

impl Participant {
    pub fn new(connection_id: String, display_name: String) -> Self {
        Self {
            connection_id,
            display_name,
            joined_at: Utc::now(),
        }
    }
}

/// Media currently loaded in a room.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaRef {
    pub media_id: String,
    pub title: String,
}

/// One listening room.
///
/// `position_secs` and `reference_now_ms` describe the last authoritative
/// playback point: while playing, the true position is that pair projected
/// forward on the reference clock; while paused, `position_secs` is frozen
/// at the pause instant. `sequence` increases with every stored snapshot
/// and never resets for the lifetime of the room.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Room {
    pub id: String,
    pub host: Option<String>,
    pub media: Option<MediaRef>,
    pub playing: bool,
    pub position_secs: f64,
    pub reference_now_ms: u64,
    pub sequence: u64,
    pub queue: Vec<QueueEntry>,
    pub participants: Vec<Participant>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Room {
    pub fn new(id: String, creator: Participant, now_ms: u64) -> Self {
        let now = Utc::now();
        Self {
            id,
            host: Some(creator.connection_id.clone()),
            media: None,
            playing: false,
            position_secs: 0.0,
            reference_now_ms: now_ms,
            sequence: 0,
            queue: Vec::new(),
            participants: vec![creator],
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.participants.is_empty()
    }

    pub fn contains(&self, connection_id: &str) -> bool {
        self.participants
            .iter()
            .any(|p| p.connection_id == connection_id)
    }

    pub fn is_host(&self, connection_id: &str) -> bool {
        self.host.as_deref() == Some(connection_id)
    }

    pub fn participant_ids(&self) -> Vec<String> {
        self.participants
            .iter()
            .map(|p| p.connection_id.clone())
            .collect()
    }

    pub fn participant_ids_except(&self, excluded: &str) -> Vec<String> {
        self.participants
            .iter()
            .filter(|p| p.connection_id != excluded)
            .map(|p| p.connection_id.clone())
            .collect()
    }

    pub fn roster(&self) -> Vec<RoomUser> {
        self.participants
            .iter()
            .map(|p| RoomUser {
                connection_id: p.connection_id.clone(),
                display_name: p.display_name.clone(),
            })
            .collect()
    }

    /// Removes a participant, returning it if present.
    pub fn remove_participant(&mut self, connection_id: &str) -> Option<Participant> {
        let index = self
            .participants
            .iter()
            .position(|p| p.connection_id == connection_id)?;
        Some(self.participants.remove(index))
    }

    /// The playback position implied by the stored point at `now_ms`.
    /// Reference timestamps ahead of `now_ms` contribute nothing rather
    /// than rewinding the position.
    pub fn projected_position(&self, now_ms: u64) -> f64 {
        if !self.playing {
            return self.position_secs;
        }
        let elapsed_ms = (now_ms as f64 - self.reference_now_ms as f64).max(0.0);
        self.position_secs + elapsed_ms / 1000.0
    }

    pub fn next_sequence(&mut self) -> u64 {
        self.sequence += 1;
        self.sequence
    }

    /// Catch-up snapshot for a joiner, projected so the (position,
    /// timestamp, playing) triple stays consistent at send time.
    pub fn synthesized_snapshot(&self, now_ms: u64) -> ServerMessage {
        ServerMessage::InitialSync {
            media_id: self.media.as_ref().map(|m| m.media_id.clone()),
            title: self.media.as_ref().map(|m| m.title.clone()),
            playing: self.playing,
            position_secs: self.projected_position(now_ms),
            reference_now_ms: now_ms,
            sequence: self.sequence,
            queue: self.queue.clone(),
        }
    }

    pub fn summary(&self) -> RoomSummary {
        RoomSummary {
            room_id: self.id.clone(),
            title: self.media.as_ref().map(|m| m.title.clone()),
            participants: self.participants.len() as u32,
            playing: self.playing,
        }
    }
}
