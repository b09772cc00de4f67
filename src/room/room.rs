use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::crdt::{ActivityRecord, CursorState, ProjectDocument};
use crate::db::{SnapshotStore, StoreError};
use crate::models::{
    ActivityBroadcast, ActivityMessage, Collaborator, CursorMessage, CursorMoveMessage,
    FileChangeMessage, FileMessage, JoinedMessage, PresenceJoinMessage, PresenceLeaveMessage,
    PresenceUpdateMessage, RoomMessage, SendMessage,
};
use crate::presence::{color_for_user, PresenceStore};

/// How many activity records a join bootstrap carries.
const ACTIVITY_TAIL: usize = 100;

const SAVE_RETRY_ATTEMPTS: u32 = 3;
const SAVE_RETRY_BASE: Duration = Duration::from_secs(1);

struct RoomState {
    doc: ProjectDocument,
    /// sessionId -> userId of everyone attached.
    members: HashMap<Uuid, String>,
    dirty: bool,
    /// Last join or document mutation. Drives idle eviction.
    last_activity: DateTime<Utc>,
    /// Set by the registry once the room is removed from its map; a retired
    /// room rejects joins so stale handles cannot revive it.
    retired: bool,
    save_task: Option<JoinHandle<()>>,
}

/// The runtime binding of one project: its document, the attached sessions
/// and the broadcast fan-out. All mutation goes through the state mutex, and
/// broadcasts are sent while it is held, so every receiver observes one
/// source's messages in the order they were applied.
pub struct Room {
    project_id: String,
    state: Mutex<RoomState>,
    tx: broadcast::Sender<RoomMessage>,
    store: Arc<dyn SnapshotStore>,
    presence: Arc<PresenceStore>,
    save_debounce: Duration,
}

impl Room {
    pub fn new(
        project_id: String,
        doc: ProjectDocument,
        store: Arc<dyn SnapshotStore>,
        presence: Arc<PresenceStore>,
        broadcast_buffer: usize,
        save_debounce: Duration,
    ) -> Self {
        let (tx, _) = broadcast::channel(broadcast_buffer);
        Self {
            project_id,
            state: Mutex::new(RoomState {
                doc,
                members: HashMap::new(),
                dirty: false,
                last_activity: Utc::now(),
                retired: false,
                save_task: None,
            }),
            tx,
            store,
            presence,
            save_debounce,
        }
    }

    pub fn project_id(&self) -> &str {
        &self.project_id
    }

    /// Attach a session. The subscription is taken under the state lock, so
    /// nothing broadcast after the bootstrap snapshot can be missed. Returns
    /// None when the room was retired by eviction; the caller resolves a
    /// fresh room from the registry.
    pub async fn join(
        &self,
        session_id: Uuid,
        user_id: &str,
    ) -> Option<(JoinedMessage, broadcast::Receiver<RoomMessage>, Collaborator)> {
        let mut state = self.state.lock().await;
        if state.retired {
            return None;
        }

        let collaborator = self.presence.join(user_id, &self.project_id, session_id).await;
        state.members.insert(session_id, user_id.to_string());
        state.last_activity = Utc::now();

        let rx = self.tx.subscribe();
        // The bootstrap lists everyone except the session that is joining.
        let collaborators = self
            .presence
            .list_collaborators(&self.project_id)
            .await
            .into_iter()
            .filter(|c| c.session_id != session_id)
            .collect();
        let joined = JoinedMessage {
            project_id: self.project_id.clone(),
            success: true,
            collaborators,
            files: state.doc.live_files(),
            activity: state.doc.recent_activity(ACTIVITY_TAIL),
        };

        self.send(RoomMessage {
            sender_id: session_id,
            message: SendMessage::PresenceJoin(PresenceJoinMessage {
                project_id: self.project_id.clone(),
                collaborator: collaborator.clone(),
            }),
        });

        info!(
            "Session {} ({}) joined project {} ({} member(s))",
            session_id,
            user_id,
            self.project_id,
            state.members.len()
        );
        Some((joined, rx, collaborator))
    }

    /// Detach a session. Returns true when the room just became empty, in
    /// which case the caller schedules an eviction check.
    pub async fn leave(&self, session_id: Uuid, user_id: &str) -> bool {
        let mut state = self.state.lock().await;

        if state.members.remove(&session_id).is_none() {
            return false;
        }
        state.doc.remove_cursor(&session_id);
        self.presence
            .set_offline(session_id, Some(&self.project_id))
            .await;

        self.send(RoomMessage {
            sender_id: session_id,
            message: SendMessage::PresenceLeave(PresenceLeaveMessage {
                project_id: self.project_id.clone(),
                session_id,
                user_id: user_id.to_string(),
            }),
        });

        let empty = state.members.is_empty();
        info!(
            "Session {} left project {} ({} member(s) remain)",
            session_id,
            self.project_id,
            state.members.len()
        );
        empty
    }

    /// Apply a file mutation and fan it out. Returns false when the change
    /// was a no-op (e.g. renaming a path that does not exist).
    pub async fn apply_file(self: &Arc<Self>, session_id: Uuid, user_id: &str, msg: &FileMessage) -> bool {
        let mut state = self.state.lock().await;

        let change = msg.to_change();
        let writes = state.doc.apply_file(&session_id.to_string(), &change);
        if writes.is_empty() {
            debug!(
                "Dropped no-op {} on '{}' in project {}",
                msg.action.as_str(),
                msg.path,
                self.project_id
            );
            return false;
        }

        // Every applied file mutation lands in the activity feed too.
        let record = ActivityRecord::new(
            format!("file.{}", msg.action.as_str()),
            Some(msg.path.clone()),
            session_id,
            user_id,
            None,
        );
        state.doc.append_activity(record.clone());

        state.last_activity = Utc::now();
        self.mark_dirty(&mut state);
        self.presence.touch(session_id, &self.project_id).await;

        self.send(RoomMessage {
            sender_id: session_id,
            message: SendMessage::FileChange(FileChangeMessage {
                project_id: self.project_id.clone(),
                action: msg.action,
                path: msg.path.clone(),
                content: msg.content.clone(),
                new_path: msg.new_path.clone(),
                session_id,
                user_id: user_id.to_string(),
            }),
        });
        self.send(RoomMessage {
            sender_id: session_id,
            message: SendMessage::Activity(ActivityBroadcast {
                project_id: self.project_id.clone(),
                record,
            }),
        });
        true
    }

    /// Record a cursor move. Cursors never dirty the room; they are gone
    /// once the session is.
    pub async fn apply_cursor(&self, session_id: Uuid, user_id: &str, msg: &CursorMessage) -> CursorState {
        let mut state = self.state.lock().await;

        let color = match msg.color.clone() {
            Some(color) => color,
            None => match self.presence.collaborator(&self.project_id, session_id).await {
                Some(collaborator) => collaborator.color,
                None => color_for_user(user_id),
            },
        };
        let cursor = state
            .doc
            .apply_cursor(session_id, user_id, msg.position, msg.selection, color);
        state.last_activity = Utc::now();
        self.presence
            .update_cursor(session_id, &self.project_id, msg.position)
            .await;

        self.send(RoomMessage {
            sender_id: session_id,
            message: SendMessage::CursorMove(CursorMoveMessage {
                project_id: self.project_id.clone(),
                cursor: cursor.clone(),
            }),
        });
        cursor
    }

    /// Append a client-reported activity record and fan it out.
    pub async fn record_activity(
        self: &Arc<Self>,
        session_id: Uuid,
        user_id: &str,
        msg: &ActivityMessage,
    ) -> ActivityRecord {
        let mut state = self.state.lock().await;

        let record = ActivityRecord::new(
            msg.action.clone(),
            msg.file_path.clone(),
            session_id,
            user_id,
            msg.metadata.clone(),
        );
        state.doc.append_activity(record.clone());
        state.last_activity = Utc::now();
        self.mark_dirty(&mut state);
        self.presence.touch(session_id, &self.project_id).await;

        self.send(RoomMessage {
            sender_id: session_id,
            message: SendMessage::Activity(ActivityBroadcast {
                project_id: self.project_id.clone(),
                record: record.clone(),
            }),
        });
        record
    }

    /// Fan out a presence update that did not originate inside the room
    /// (manual status changes, page switches).
    pub async fn broadcast_presence_update(&self, sender_id: Uuid, collaborator: Collaborator) {
        let _state = self.state.lock().await;
        self.send(RoomMessage {
            sender_id,
            message: SendMessage::PresenceUpdate(PresenceUpdateMessage {
                project_id: self.project_id.clone(),
                collaborator,
            }),
        });
    }

    /// Flush the document if it is dirty. Returns whether a write happened.
    pub async fn save_now(&self) -> Result<bool, StoreError> {
        let snapshot = {
            let mut state = self.state.lock().await;
            if !state.dirty {
                return Ok(false);
            }
            state.dirty = false;
            state.doc.snapshot()
        };

        match self.store.save(&self.project_id, &snapshot).await {
            Ok(()) => Ok(true),
            Err(e) => {
                // Keep the room marked dirty so a later pass retries.
                self.state.lock().await.dirty = true;
                Err(e)
            }
        }
    }

    pub async fn is_dirty(&self) -> bool {
        self.state.lock().await.dirty
    }

    pub async fn member_count(&self) -> usize {
        self.state.lock().await.members.len()
    }

    /// True when the room has no members and nothing has happened in it for
    /// at least `window`.
    pub async fn eviction_ready(&self, window: Duration) -> bool {
        let state = self.state.lock().await;
        state.members.is_empty()
            && (Utc::now() - state.last_activity).num_seconds() >= window.as_secs() as i64
    }

    /// Retire the room if it is still empty and idle. Once retired, every
    /// later `join` on this handle fails, so a session that resolved the
    /// room before eviction cannot land in it afterwards. The registry
    /// calls this while holding its map lock, making retirement atomic
    /// with removal from the map.
    pub async fn retire_if_idle(&self, window: Duration) -> bool {
        let mut state = self.state.lock().await;
        if state.retired || !state.members.is_empty() {
            return false;
        }
        if (Utc::now() - state.last_activity).num_seconds() < window.as_secs() as i64 {
            return false;
        }
        state.retired = true;
        true
    }

    fn send(&self, message: RoomMessage) {
        // Err just means nobody is subscribed right now.
        let _ = self.tx.send(message);
    }

    fn mark_dirty(self: &Arc<Self>, state: &mut RoomState) {
        state.dirty = true;
        let pending = state
            .save_task
            .as_ref()
            .map(|task| !task.is_finished())
            .unwrap_or(false);
        if pending {
            return;
        }
        let room = Arc::clone(self);
        state.save_task = Some(tokio::spawn(async move {
            tokio::time::sleep(room.save_debounce).await;
            room.save_with_retry().await;
        }));
    }

    async fn save_with_retry(&self) {
        let mut backoff = SAVE_RETRY_BASE;
        for attempt in 1..=SAVE_RETRY_ATTEMPTS {
            match self.save_now().await {
                Ok(true) => {
                    debug!("Persisted project {}", self.project_id);
                    return;
                }
                Ok(false) => return,
                Err(e) if attempt < SAVE_RETRY_ATTEMPTS => {
                    warn!(
                        "Save attempt {}/{} for project {} failed: {}",
                        attempt, SAVE_RETRY_ATTEMPTS, self.project_id, e
                    );
                    tokio::time::sleep(backoff).await;
                    backoff *= 2;
                }
                Err(e) => {
                    error!(
                        "Giving up saving project {} after {} attempts: {}",
                        self.project_id, SAVE_RETRY_ATTEMPTS, e
                    );
                }
            }
        }
    }

    /// Final teardown: flush and stop the pending save task.
    pub async fn shutdown(&self) -> Result<bool, StoreError> {
        let saved = self.save_now().await?;
        let mut state = self.state.lock().await;
        if let Some(task) = state.save_task.take() {
            task.abort();
        }
        Ok(saved)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crdt::FileAction;
    use crate::db::MemorySnapshotStore;

    fn test_presence() -> Arc<PresenceStore> {
        Arc::new(PresenceStore::new(
            Duration::from_secs(60),
            Duration::from_secs(300),
            Duration::from_secs(3600),
        ))
    }

    fn test_room(store: Arc<dyn SnapshotStore>) -> Arc<Room> {
        Arc::new(Room::new(
            "p1".into(),
            ProjectDocument::new(),
            store,
            test_presence(),
            64,
            Duration::from_millis(10),
        ))
    }

    fn file_msg(action: FileAction, path: &str, content: Option<&str>) -> FileMessage {
        FileMessage {
            project_id: "p1".into(),
            action,
            path: path.into(),
            content: content.map(str::to_string),
            new_path: None,
        }
    }

    #[tokio::test]
    async fn join_bootstrap_carries_prior_state_and_collaborators() {
        let room = test_room(Arc::new(MemorySnapshotStore::new()));
        let writer = Uuid::new_v4();
        let reader = Uuid::new_v4();

        room.join(writer, "alice").await.unwrap();
        room.apply_file(writer, "alice", &file_msg(FileAction::Create, "main.rs", Some("fn main() {}")))
            .await;

        let (joined, _rx, me) = room.join(reader, "bob").await.unwrap();
        assert!(joined.success);
        assert_eq!(joined.files.get("main.rs").map(String::as_str), Some("fn main() {}"));
        assert_eq!(joined.activity.len(), 1);
        assert_eq!(joined.activity[0].action, "file.create");

        // The bootstrap names the peers, never the session that is joining.
        let users: Vec<&str> = joined.collaborators.iter().map(|c| c.user_id.as_str()).collect();
        assert_eq!(users, vec!["alice"]);
        assert!(joined.collaborators.iter().all(|c| c.session_id != reader));
        assert_eq!(me.session_id, reader);
    }

    #[tokio::test]
    async fn peers_receive_broadcasts_with_sender_id() {
        let room = test_room(Arc::new(MemorySnapshotStore::new()));
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();

        room.join(a, "alice").await.unwrap();
        let (_, mut rx_b, _) = room.join(b, "bob").await.unwrap();

        room.apply_file(a, "alice", &file_msg(FileAction::Create, "x.txt", Some("1")))
            .await;

        // The subscription is taken under the join lock, so the first event is
        // bob's own presence-join (filtered at the gateway layer, not here).
        let own_join = rx_b.recv().await.unwrap();
        assert_eq!(own_join.sender_id, b);

        let event = rx_b.recv().await.unwrap();
        assert_eq!(event.sender_id, a);
        match event.message {
            SendMessage::FileChange(change) => {
                assert_eq!(change.path, "x.txt");
                assert_eq!(change.user_id, "alice");
            }
            other => panic!("unexpected broadcast: {other:?}"),
        }
    }

    #[tokio::test]
    async fn last_leave_reports_empty_and_eviction_readiness() {
        let room = test_room(Arc::new(MemorySnapshotStore::new()));
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();

        room.join(a, "alice").await.unwrap();
        room.join(b, "bob").await.unwrap();
        assert!(!room.leave(a, "alice").await);
        assert!(room.leave(b, "bob").await);

        assert!(room.eviction_ready(Duration::from_secs(0)).await);
        assert!(!room.eviction_ready(Duration::from_secs(3600)).await);
    }

    #[tokio::test]
    async fn retired_room_rejects_joins() {
        let room = test_room(Arc::new(MemorySnapshotStore::new()));
        let a = Uuid::new_v4();

        room.join(a, "alice").await.unwrap();
        // Occupied rooms never retire.
        assert!(!room.retire_if_idle(Duration::from_secs(0)).await);
        room.leave(a, "alice").await;

        assert!(room.retire_if_idle(Duration::from_secs(0)).await);
        assert!(room.join(Uuid::new_v4(), "bob").await.is_none());
        // Retiring twice reports nothing to do.
        assert!(!room.retire_if_idle(Duration::from_secs(0)).await);
    }

    #[tokio::test]
    async fn save_now_flushes_once_until_dirty_again() {
        let store = Arc::new(MemorySnapshotStore::new());
        let room = test_room(store.clone());
        let a = Uuid::new_v4();

        room.join(a, "alice").await.unwrap();
        room.apply_file(a, "alice", &file_msg(FileAction::Create, "x.txt", Some("1")))
            .await;

        assert!(room.save_now().await.unwrap());
        assert!(!room.save_now().await.unwrap());

        let snapshot = store.load("p1").await.unwrap().unwrap();
        assert_eq!(snapshot.files.len(), 1);

        room.apply_file(a, "alice", &file_msg(FileAction::Update, "x.txt", Some("2")))
            .await;
        assert!(room.save_now().await.unwrap());
    }

    #[tokio::test]
    async fn cursor_moves_do_not_dirty_the_room() {
        let room = test_room(Arc::new(MemorySnapshotStore::new()));
        let a = Uuid::new_v4();
        room.join(a, "alice").await.unwrap();

        let msg = CursorMessage {
            project_id: "p1".into(),
            position: crate::crdt::CursorPosition { line: 3, column: 7 },
            selection: None,
            color: None,
        };
        let cursor = room.apply_cursor(a, "alice", &msg).await;
        assert_eq!(cursor.position.line, 3);
        assert!(!cursor.color.is_empty());
        assert!(!room.is_dirty().await);
    }
}
