use serde::{Deserialize, Serialize};

/// Role assigned to a connection inside a room.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Host,
    Listener,
}

/// Transport-level playback commands relayed between participants.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PlaybackAction {
    Play,
    Pause,
}

/// One entry in a room's play queue.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QueueEntry {
    pub media_id: String,
    pub title: String,
}

/// Roster entry broadcast whenever room membership changes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RoomUser {
    pub connection_id: String,
    pub display_name: String,
}

/// Aggregate view of one room for discovery listings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RoomSummary {
    pub room_id: String,
    pub title: Option<String>,
    pub participants: u32,
    pub playing: bool,
}

/// Messages a participant sends to the gateway.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    JoinRoom {
        room_id: String,
        display_name: String,
    },
    LeaveRoom,
    PlaySong {
        room_id: String,
        media_id: String,
        title: String,
    },
    PlayerAction {
        room_id: String,
        action: PlaybackAction,
    },
    /// Host position report; `reference_now_ms` is the host's local clock
    /// shifted into the shared reference frame.
    TimeUpdate {
        room_id: String,
        position_secs: f64,
        reference_now_ms: u64,
    },
    AddToQueue {
        room_id: String,
        media_id: String,
        title: String,
    },
    PlayNext {
        room_id: String,
    },
    /// One clock-sync round trip. The nonce comes back in the response so
    /// overlapping probes stay distinguishable.
    SyncTime {
        nonce: u64,
    },
}

impl ClientMessage {
    /// Playback-control messages only the room host may issue.
    pub fn requires_host(&self) -> bool {
        matches!(
            self,
            ClientMessage::PlaySong { .. }
                | ClientMessage::PlayerAction { .. }
                | ClientMessage::TimeUpdate { .. }
                | ClientMessage::AddToQueue { .. }
                | ClientMessage::PlayNext { .. }
        )
    }
}

/// Messages the gateway sends to participants.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    UserRole {
        role: Role,
    },
    /// Catch-up snapshot sent once to every joiner that did not create the
    /// room. Consumed at player-ready.
    InitialSync {
        media_id: Option<String>,
        title: Option<String>,
        playing: bool,
        position_secs: f64,
        reference_now_ms: u64,
        sequence: u64,
        queue: Vec<QueueEntry>,
    },
    ReceiveSong {
        media_id: String,
        title: String,
    },
    ReceiveAction {
        action: PlaybackAction,
    },
    /// Relayed host position report, stamped with the room's snapshot
    /// sequence. Receivers drop anything at or below the last applied one.
    ReceiveTime {
        position_secs: f64,
        reference_now_ms: u64,
        sequence: u64,
    },
    UpdateQueue {
        queue: Vec<QueueEntry>,
    },
    UpdateUsers {
        users: Vec<RoomUser>,
    },
    SyncTimeResponse {
        nonce: u64,
        reference_time_ms: u64,
    },
    RoomsList {
        rooms: Vec<RoomSummary>,
    },
}

/// Encode a message into JSON bytes for a binary WS frame.
pub fn encode<T: Serialize>(message: &T) -> Result<Vec<u8>, serde_json::Error> {
    serde_json::to_vec(message)
}

/// Decode a message from JSON bytes.
pub fn decode<'a, T: Deserialize<'a>>(bytes: &'a [u8]) -> Result<T, serde_json::Error> {
    serde_json::from_slice(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_message_roundtrip() {
        let msg = ClientMessage::TimeUpdate {
            room_id: "4821".into(),
            position_secs: 12.5,
            reference_now_ms: 1_700_000_000_123,
        };

        let bytes = encode(&msg).expect("encode");
        let decoded: ClientMessage = decode(&bytes).expect("decode");

        assert_eq!(msg, decoded);
    }

    #[test]
    fn tagged_representation_uses_snake_case() {
        let bytes = encode(&ClientMessage::SyncTime { nonce: 9 }).expect("encode");
        let value: serde_json::Value = serde_json::from_slice(&bytes).expect("json");
        assert_eq!(value["type"], "sync_time");
        assert_eq!(value["nonce"], 9);

        let bytes = encode(&ServerMessage::UserRole { role: Role::Host }).expect("encode");
        let value: serde_json::Value = serde_json::from_slice(&bytes).expect("json");
        assert_eq!(value["type"], "user_role");
        assert_eq!(value["role"], "host");
    }

    #[test]
    fn host_only_messages_are_flagged() {
        let host_only = ClientMessage::PlayNext {
            room_id: "4821".into(),
        };
        assert!(host_only.requires_host());

        let open = ClientMessage::JoinRoom {
            room_id: "4821".into(),
            display_name: "mallory".into(),
        };
        assert!(!open.requires_host());
        assert!(!ClientMessage::SyncTime { nonce: 1 }.requires_host());
        assert!(!ClientMessage::LeaveRoom.requires_host());
    }
}
