use thiserror::Error;

/// Errors surfaced by room operations.
///
/// `RoomNotFound` covers messages that name a room the registry no longer
/// tracks; callers drop those silently. `NotHost` marks a playback control
/// sent by a non-host connection and is rejected without touching state.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("room {room_id} not found")]
    RoomNotFound { room_id: String },
    #[error("connection {connection_id} is not the host of room {room_id}")]
    NotHost {
        room_id: String,
        connection_id: String,
    },
    #[error("room id {room_id:?} is empty or too long")]
    InvalidRoomId { room_id: String },
}
