use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, OnceCell};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::crdt::ProjectDocument;
use crate::db::{SnapshotStore, StoreError};
use crate::presence::PresenceStore;
use crate::room::room::Room;

/// Counters the diagnostics endpoint reports.
#[derive(Debug, Default, Clone, Copy)]
pub struct RegistryStats {
    pub n_rooms: u32,
    pub n_sessions: u32,
    pub n_dirty_rooms: u32,
}

/// Owns the projectId -> Room map. The per-key `OnceCell` makes first-join
/// races safe: concurrent joins for one project all land in the single
/// initialization, while different projects initialize in parallel.
pub struct RoomRegistry {
    rooms: Mutex<HashMap<String, Arc<OnceCell<Arc<Room>>>>>,
    store: Arc<dyn SnapshotStore>,
    presence: Arc<PresenceStore>,
    config: Config,
}

impl RoomRegistry {
    pub fn new(config: Config, store: Arc<dyn SnapshotStore>, presence: Arc<PresenceStore>) -> Self {
        Self {
            rooms: Mutex::new(HashMap::new()),
            store,
            presence,
            config,
        }
    }

    /// Resolve the room for a project, creating it on first use. Creation
    /// loads the prior snapshot when one exists; a storage read error fails
    /// the join rather than silently starting an empty document.
    pub async fn get_or_create(&self, project_id: &str) -> Result<Arc<Room>, StoreError> {
        let cell = {
            let mut rooms = self.rooms.lock().await;
            rooms
                .entry(project_id.to_string())
                .or_insert_with(|| Arc::new(OnceCell::new()))
                .clone()
        };

        let room = cell
            .get_or_try_init(|| async {
                let doc = match self.store.load(project_id).await? {
                    Some(snapshot) => {
                        info!(
                            "Restoring project {} from snapshot ({} file(s))",
                            project_id,
                            snapshot.files.len()
                        );
                        let mut doc = ProjectDocument::new();
                        doc.restore(snapshot);
                        doc
                    }
                    None => {
                        info!("Creating empty room for project {}", project_id);
                        ProjectDocument::new()
                    }
                };
                Ok::<Arc<Room>, StoreError>(Arc::new(Room::new(
                    project_id.to_string(),
                    doc,
                    Arc::clone(&self.store),
                    Arc::clone(&self.presence),
                    self.config.broadcast_buffer,
                    self.config.save_debounce(),
                )))
            })
            .await?;

        Ok(Arc::clone(room))
    }

    /// Grace check kicked off when a room's last client leaves: wait a bit,
    /// then evict if the room is still empty and already idle enough.
    pub fn schedule_eviction(self: &Arc<Self>, project_id: String) {
        let registry = Arc::clone(self);
        let grace = self.config.eviction_grace();
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            if registry.try_evict(&project_id).await {
                debug!("Grace eviction destroyed room {}", project_id);
            }
        });
    }

    /// Destroy the project's room if it is empty and idle beyond the
    /// eviction window. The room is flushed first, then retired and removed
    /// from the map in one step under the map lock: a session that resolved
    /// the room but has not joined yet either lands before retirement
    /// (keeping the room) or finds it retired and resolves a fresh one.
    pub async fn try_evict(&self, project_id: &str) -> bool {
        let Some(room) = self.room_if_ready(project_id).await else {
            return false;
        };

        let window = self.config.eviction_window();
        if !room.eviction_ready(window).await {
            return false;
        }

        // Flush outside any registry lock; a racing join sees either the
        // live room or this snapshot.
        if let Err(e) = room.save_now().await {
            error!(
                "Skipping eviction of room {}: final save failed: {}",
                project_id, e
            );
            return false;
        }

        {
            let mut rooms = self.rooms.lock().await;
            let still_same = rooms
                .get(project_id)
                .and_then(|cell| cell.get())
                .map(|current| Arc::ptr_eq(current, &room))
                .unwrap_or(false);
            if !still_same || !room.retire_if_idle(window).await {
                warn!("Room {} became active during eviction, keeping it", project_id);
                return false;
            }
            rooms.remove(project_id);
        }

        // Nothing can join a retired room, so this flush is final.
        if let Err(e) = room.shutdown().await {
            warn!("Final flush for evicted room {} failed: {}", project_id, e);
        }
        info!("Evicted idle room {}", project_id);
        true
    }

    /// Periodic pass over every live room: retry lingering dirty saves and
    /// evict whatever the grace check missed.
    pub async fn sweep(&self) {
        let project_ids: Vec<String> = {
            let rooms = self.rooms.lock().await;
            rooms.keys().cloned().collect()
        };
        for project_id in project_ids {
            if let Some(room) = self.room_if_ready(&project_id).await {
                if room.is_dirty().await {
                    if let Err(e) = room.save_now().await {
                        warn!("Sweep save for room {} failed: {}", project_id, e);
                    }
                }
            }
            self.try_evict(&project_id).await;
        }
    }

    pub async fn stats(&self) -> RegistryStats {
        let cells: Vec<Arc<OnceCell<Arc<Room>>>> = {
            let rooms = self.rooms.lock().await;
            rooms.values().cloned().collect()
        };
        let mut stats = RegistryStats::default();
        for cell in cells {
            if let Some(room) = cell.get() {
                stats.n_rooms += 1;
                stats.n_sessions += room.member_count().await as u32;
                if room.is_dirty().await {
                    stats.n_dirty_rooms += 1;
                }
            }
        }
        stats
    }

    async fn room_if_ready(&self, project_id: &str) -> Option<Arc<Room>> {
        let rooms = self.rooms.lock().await;
        rooms.get(project_id).and_then(|cell| cell.get()).cloned()
    }
}

/// Background sweep over the registry, spawned once at startup.
pub fn spawn_registry_sweep(registry: Arc<RoomRegistry>, every: std::time::Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            registry.sweep().await;
        }
    })
}
