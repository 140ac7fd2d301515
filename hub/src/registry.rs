use crate::room::{Room, Unauthorized};
use crate::types::RoomSummary;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

const ACTIVE_WINDOW_MS: i64 = 30 * 60 * 1000;

/// Process-lifetime index of rooms. Reads take the shared lock; only room
/// creation takes the exclusive one.
#[derive(Default)]
pub struct RoomRegistry {
    rooms: RwLock<HashMap<String, Arc<Room>>>,
}

impl RoomRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up or create `room_id`, enforcing the token either way. No
    /// room state is created for a mismatched token on an existing room.
    pub fn get_or_create(&self, room_id: &str, token: &str) -> Result<Arc<Room>, Unauthorized> {
        let mut rooms = self.rooms.write().unwrap_or_else(|e| e.into_inner());
        if let Some(room) = rooms.get(room_id) {
            room.authorize(token)?;
            return Ok(room.clone());
        }
        let room = Arc::new(Room::new(room_id, token));
        rooms.insert(room_id.to_string(), room.clone());
        Ok(room)
    }

    pub fn get(&self, room_id: &str) -> Option<Arc<Room>> {
        self.rooms
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(room_id)
            .cloned()
    }

    pub fn all_rooms(&self) -> Vec<Arc<Room>> {
        self.rooms
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect()
    }

    /// Room summaries sorted by last-seen desc (ties by id). With
    /// `active_only`, rooms idle longer than 30 minutes are omitted.
    pub fn list_rooms(&self, now_unix_ms: i64, active_only: bool) -> Vec<RoomSummary> {
        let rooms = self.all_rooms();
        let active_cutoff = now_unix_ms - ACTIVE_WINDOW_MS;

        let mut out: Vec<RoomSummary> = rooms
            .iter()
            .map(|r| r.summary(now_unix_ms))
            .filter(|s| !active_only || (s.last_seen_unix_ms > 0 && s.last_seen_unix_ms >= active_cutoff))
            .collect();
        out.sort_by(|a, b| {
            b.last_seen_unix_ms
                .cmp(&a.last_seen_unix_ms)
                .then_with(|| a.room_id.cmp(&b.room_id))
        });
        out
    }
}
