use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::room::Room;

/// One joined room: the shared room handle plus the task that forwards the
/// room's broadcasts onto this connection's socket.
pub struct RoomBinding {
    pub room: Arc<Room>,
    pub forwarder: JoinHandle<()>,
}

/// Per-connection state. A session only exists after authentication and is
/// owned by the connection task alone, so it needs no locking.
pub struct Session {
    pub session_id: Uuid,
    pub user_id: String,
    pub connected_at: DateTime<Utc>,
    rooms: HashMap<String, RoomBinding>,
}

impl Session {
    pub fn new(session_id: Uuid, user_id: String) -> Self {
        Self {
            session_id,
            user_id,
            connected_at: Utc::now(),
            rooms: HashMap::new(),
        }
    }

    pub fn room(&self, project_id: &str) -> Option<&Arc<Room>> {
        self.rooms.get(project_id).map(|binding| &binding.room)
    }

    pub fn bind_room(&mut self, project_id: String, binding: RoomBinding) {
        self.rooms.insert(project_id, binding);
    }

    pub fn unbind_room(&mut self, project_id: &str) -> Option<RoomBinding> {
        self.rooms.remove(project_id)
    }

    pub fn joined_count(&self) -> usize {
        self.rooms.len()
    }

    /// Empties the room table for disconnect cleanup.
    pub fn take_rooms(&mut self) -> HashMap<String, RoomBinding> {
        std::mem::take(&mut self.rooms)
    }
}
