//! Room registry and join/failover coordination.
//!
//! All room state lives behind one `Arc<RwLock<Registry>>`; every operation
//! mutates under the write lock and returns the outbound messages it
//! produced, so transports stay free of room logic and never hold the lock
//! across a send. Rooms are ephemeral: the first joiner to an unknown id
//! creates the room and becomes host, the last departure deletes it.

use std::{collections::HashMap, sync::Arc};

use chrono::Utc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use common_sync::{
    clock,
    message::{PlaybackAction, QueueEntry, Role, RoomSummary, ServerMessage},
    metrics,
};

pub mod error;
pub mod room;

pub use error::RegistryError;
pub use room::{MediaRef, Participant, Room};

/// Room ids are short join codes; anything longer is a malformed client.
pub const MAX_ROOM_ID_LEN: usize = 32;

/// Outbound messages produced by one registry operation, in send order.
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    /// Deliver to a single connection.
    Send { to: String, message: ServerMessage },
    /// Deliver to an explicit recipient list. Resolved under the registry
    /// lock so a racing roster change cannot widen it.
    SendMany {
        to: Vec<String>,
        message: ServerMessage,
    },
    /// Deliver to every attached connection.
    SendAll { message: ServerMessage },
}

/// Single serialization point for all room mutations.
pub type SharedRegistry = Arc<RwLock<Registry>>;

pub fn shared() -> SharedRegistry {
    Arc::new(RwLock::new(Registry::default()))
}

#[derive(Debug, Default)]
pub struct Registry {
    rooms: HashMap<String, Room>,
    /// connection id -> room id, maintained alongside every roster change.
    memberships: HashMap<String, String>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a connection to a room, creating the room if the id is
    /// unknown. `is_live` reports whether a connection id still has an open
    /// socket; it drives both stale-room cleanup and ghost-host takeover.
    pub fn join_room(
        &mut self,
        room_id: &str,
        connection_id: &str,
        display_name: &str,
        is_live: impl Fn(&str) -> bool,
    ) -> Result<Vec<Effect>, RegistryError> {
        if room_id.is_empty() || room_id.len() > MAX_ROOM_ID_LEN {
            return Err(RegistryError::InvalidRoomId {
                room_id: room_id.to_string(),
            });
        }

        let mut effects = Vec::new();

        // A join while still a member elsewhere is an implicit leave.
        if self.memberships.contains_key(connection_id) {
            effects.extend(self.remove_connection(connection_id, "joined another room"));
        }

        // A room whose whole roster went dark kept its id hostage; drop it
        // so the code starts fresh.
        let stale = self
            .rooms
            .get(room_id)
            .is_some_and(|room| room.participants.iter().all(|p| !is_live(&p.connection_id)));
        if stale {
            info!(room_id, "removing stale room before join");
            self.delete_room(room_id);
        }

        let now_ms = clock::timestamp_ms();
        if let Some(room) = self.rooms.get_mut(room_id) {
            let role = match room.host.as_deref() {
                Some(host) if is_live(host) => Role::Listener,
                _ => {
                    warn!(room_id, connection_id, "host connection is gone, promoting joiner");
                    room.host = Some(connection_id.to_string());
                    Role::Host
                }
            };
            room.participants.push(Participant::new(
                connection_id.to_string(),
                display_name.to_string(),
            ));
            room.updated_at = Utc::now();

            info!(room_id, connection_id, ?role, "joined room");
            effects.push(Effect::Send {
                to: connection_id.to_string(),
                message: ServerMessage::UserRole { role },
            });
            effects.push(Effect::Send {
                to: connection_id.to_string(),
                message: room.synthesized_snapshot(now_ms),
            });
        } else {
            let creator =
                Participant::new(connection_id.to_string(), display_name.to_string());
            self.rooms
                .insert(room_id.to_string(), Room::new(room_id.to_string(), creator, now_ms));
            metrics::room_metrics().inc_rooms_created();
            metrics::room_metrics().set_active_rooms(self.rooms.len() as i64);

            info!(room_id, connection_id, "room created, creator is host");
            effects.push(Effect::Send {
                to: connection_id.to_string(),
                message: ServerMessage::UserRole { role: Role::Host },
            });
        }

        self.memberships
            .insert(connection_id.to_string(), room_id.to_string());
        metrics::room_metrics().inc_joins();

        if let Some(room) = self.rooms.get(room_id) {
            effects.push(Effect::SendMany {
                to: room.participant_ids(),
                message: ServerMessage::UpdateUsers {
                    users: room.roster(),
                },
            });
        }
        effects.push(self.rooms_list_effect());
        Ok(effects)
    }

    pub fn leave(&mut self, connection_id: &str) -> Vec<Effect> {
        self.remove_connection(connection_id, "left room")
    }

    pub fn disconnect(&mut self, connection_id: &str) -> Vec<Effect> {
        self.remove_connection(connection_id, "connection closed")
    }

    /// Replace the room's media and force playback from zero.
    pub fn play_song(
        &mut self,
        room_id: &str,
        sender: &str,
        media_id: &str,
        title: &str,
    ) -> Result<Vec<Effect>, RegistryError> {
        let now_ms = clock::timestamp_ms();
        let recipients = {
            let room = self.host_room_mut(room_id, sender)?;
            room.media = Some(MediaRef {
                media_id: media_id.to_string(),
                title: title.to_string(),
            });
            room.playing = true;
            room.position_secs = 0.0;
            room.reference_now_ms = now_ms;
            room.updated_at = Utc::now();
            room.participant_ids()
        };

        info!(room_id, media_id, "host started new media");
        Ok(vec![
            Effect::SendMany {
                to: recipients.clone(),
                message: ServerMessage::ReceiveSong {
                    media_id: media_id.to_string(),
                    title: title.to_string(),
                },
            },
            Effect::SendMany {
                to: recipients,
                message: ServerMessage::ReceiveAction {
                    action: PlaybackAction::Play,
                },
            },
            self.rooms_list_effect(),
        ])
    }

    /// Toggle the playing flag and relay the action to everyone else.
    /// Pausing freezes the position at the pause instant; resuming restamps
    /// the reference so projection continues from the frozen position.
    pub fn player_action(
        &mut self,
        room_id: &str,
        sender: &str,
        action: PlaybackAction,
    ) -> Result<Vec<Effect>, RegistryError> {
        let now_ms = clock::timestamp_ms();
        let recipients = {
            let room = self.host_room_mut(room_id, sender)?;
            match action {
                PlaybackAction::Pause if room.playing => {
                    room.position_secs = room.projected_position(now_ms);
                    room.reference_now_ms = now_ms;
                    room.playing = false;
                }
                PlaybackAction::Play if !room.playing => {
                    room.reference_now_ms = now_ms;
                    room.playing = true;
                }
                // Repeated actions relay without restamping the point.
                _ => {}
            }
            room.updated_at = Utc::now();
            room.participant_ids_except(sender)
        };

        debug!(room_id, ?action, "playback toggled");
        Ok(vec![
            Effect::SendMany {
                to: recipients,
                message: ServerMessage::ReceiveAction { action },
            },
            self.rooms_list_effect(),
        ])
    }

    /// Store the host's position report and relay it, stamped with the next
    /// snapshot sequence, to everyone else in the room.
    pub fn time_update(
        &mut self,
        room_id: &str,
        sender: &str,
        position_secs: f64,
        reference_now_ms: u64,
    ) -> Result<Vec<Effect>, RegistryError> {
        let (sequence, recipients) = {
            let room = self.host_room_mut(room_id, sender)?;
            room.position_secs = position_secs;
            room.reference_now_ms = reference_now_ms;
            room.updated_at = Utc::now();
            (room.next_sequence(), room.participant_ids_except(sender))
        };

        Ok(vec![Effect::SendMany {
            to: recipients,
            message: ServerMessage::ReceiveTime {
                position_secs,
                reference_now_ms,
                sequence,
            },
        }])
    }

    pub fn add_to_queue(
        &mut self,
        room_id: &str,
        sender: &str,
        media_id: &str,
        title: &str,
    ) -> Result<Vec<Effect>, RegistryError> {
        let (queue, recipients) = {
            let room = self.host_room_mut(room_id, sender)?;
            room.queue.push(QueueEntry {
                media_id: media_id.to_string(),
                title: title.to_string(),
            });
            room.updated_at = Utc::now();
            (room.queue.clone(), room.participant_ids())
        };

        info!(room_id, depth = queue.len(), "queue extended");
        Ok(vec![Effect::SendMany {
            to: recipients,
            message: ServerMessage::UpdateQueue { queue },
        }])
    }

    /// Pop the queue head into the current media slot. A no-op on an empty
    /// queue. Broadcast order is song, then queue, then the play action.
    pub fn play_next(&mut self, room_id: &str, sender: &str) -> Result<Vec<Effect>, RegistryError> {
        let now_ms = clock::timestamp_ms();
        let popped = {
            let room = self.host_room_mut(room_id, sender)?;
            if room.queue.is_empty() {
                debug!(room_id, "play_next on empty queue");
                None
            } else {
                let entry = room.queue.remove(0);
                room.media = Some(MediaRef {
                    media_id: entry.media_id.clone(),
                    title: entry.title.clone(),
                });
                room.playing = true;
                room.position_secs = 0.0;
                room.reference_now_ms = now_ms;
                room.updated_at = Utc::now();
                Some((entry, room.queue.clone(), room.participant_ids()))
            }
        };

        let Some((entry, queue, recipients)) = popped else {
            return Ok(Vec::new());
        };

        info!(room_id, media_id = %entry.media_id, "advanced to next queued media");
        Ok(vec![
            Effect::SendMany {
                to: recipients.clone(),
                message: ServerMessage::ReceiveSong {
                    media_id: entry.media_id,
                    title: entry.title,
                },
            },
            Effect::SendMany {
                to: recipients.clone(),
                message: ServerMessage::UpdateQueue { queue },
            },
            Effect::SendMany {
                to: recipients,
                message: ServerMessage::ReceiveAction {
                    action: PlaybackAction::Play,
                },
            },
            self.rooms_list_effect(),
        ])
    }

    /// Aggregate listing of every occupied room, stable by id.
    pub fn rooms_list(&self) -> Vec<RoomSummary> {
        let mut rooms: Vec<RoomSummary> = self
            .rooms
            .values()
            .filter(|room| !room.is_empty())
            .map(Room::summary)
            .collect();
        rooms.sort_by(|a, b| a.room_id.cmp(&b.room_id));
        rooms
    }

    pub fn room(&self, room_id: &str) -> Option<&Room> {
        self.rooms.get(room_id)
    }

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    pub fn member_room(&self, connection_id: &str) -> Option<&str> {
        self.memberships.get(connection_id).map(String::as_str)
    }

    fn rooms_list_effect(&self) -> Effect {
        Effect::SendAll {
            message: ServerMessage::RoomsList {
                rooms: self.rooms_list(),
            },
        }
    }

    fn host_room_mut(
        &mut self,
        room_id: &str,
        sender: &str,
    ) -> Result<&mut Room, RegistryError> {
        let room = self
            .rooms
            .get_mut(room_id)
            .ok_or_else(|| RegistryError::RoomNotFound {
                room_id: room_id.to_string(),
            })?;
        if !room.is_host(sender) {
            return Err(RegistryError::NotHost {
                room_id: room_id.to_string(),
                connection_id: sender.to_string(),
            });
        }
        Ok(room)
    }

    fn remove_connection(&mut self, connection_id: &str, reason: &str) -> Vec<Effect> {
        let Some(room_id) = self.memberships.remove(connection_id) else {
            debug!(connection_id, reason, "connection was not in a room");
            return Vec::new();
        };

        let mut effects = Vec::new();
        let (now_empty, promoted) = {
            let Some(room) = self.rooms.get_mut(&room_id) else {
                return effects;
            };
            room.remove_participant(connection_id);
            if room.is_host(connection_id) {
                room.host = None;
            }
            room.updated_at = Utc::now();

            if room.is_empty() {
                (true, None)
            } else if room.host.is_none() {
                let next = room.participants[0].connection_id.clone();
                room.host = Some(next.clone());
                (false, Some(next))
            } else {
                (false, None)
            }
        };

        info!(room_id = %room_id, connection_id, reason, "participant removed");
        if now_empty {
            self.delete_room(&room_id);
            effects.push(self.rooms_list_effect());
            return effects;
        }

        if let Some(new_host) = promoted {
            info!(room_id = %room_id, new_host = %new_host, "promoted oldest remaining participant to host");
            effects.push(Effect::Send {
                to: new_host,
                message: ServerMessage::UserRole { role: Role::Host },
            });
        }
        if let Some(room) = self.rooms.get(&room_id) {
            effects.push(Effect::SendMany {
                to: room.participant_ids(),
                message: ServerMessage::UpdateUsers {
                    users: room.roster(),
                },
            });
        }
        effects.push(self.rooms_list_effect());
        effects
    }

    fn delete_room(&mut self, room_id: &str) {
        if let Some(room) = self.rooms.remove(room_id) {
            for participant in &room.participants {
                self.memberships.remove(&participant.connection_id);
            }
            metrics::room_metrics().set_active_rooms(self.rooms.len() as i64);
            info!(room_id, "room deleted");
        }
    }
}
