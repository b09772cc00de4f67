use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::debug;
use uuid::Uuid;

use crate::crdt::CursorPosition;
use crate::models::{Collaborator, PresenceStatus};

const COLLABORATOR_COLORS: [&str; 12] = [
    "#FF6B6B", "#4ECDC4", "#45B7D1", "#96CEB4", "#FFEAA7", "#DDA0DD", "#98D8C8", "#F7DC6F",
    "#BB8FCE", "#85C1E9", "#F8B500", "#00CED1",
];

/// Stable per-user color so the same user looks identical across tabs.
pub fn color_for_user(user_id: &str) -> String {
    let mut hasher = DefaultHasher::new();
    user_id.hash(&mut hasher);
    let idx = (hasher.finish() % COLLABORATOR_COLORS.len() as u64) as usize;
    COLLABORATOR_COLORS[idx].to_string()
}

/// One record per attached (user, project, session) triple.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PresenceKey {
    pub user_id: String,
    pub project_id: String,
    pub session_id: Uuid,
}

#[derive(Debug, Clone)]
pub struct PresenceRecord {
    pub status: PresenceStatus,
    pub color: String,
    pub cursor_position: Option<CursorPosition>,
    pub current_page: Option<String>,
    /// Advanced by heartbeats and any client message. Monotonic.
    pub last_seen: DateTime<Utc>,
    /// Advanced by user interaction only, drives away demotion.
    pub last_active: DateTime<Utc>,
}

/// Authoritative record of who is attached where. Liveness is
/// heartbeat-based: a record whose `last_seen` is older than the offline
/// threshold is excluded from listings even before cleanup rewrites it.
#[derive(Debug)]
pub struct PresenceStore {
    records: Mutex<HashMap<PresenceKey, PresenceRecord>>,
    offline_secs: i64,
    away_secs: i64,
    retention_secs: i64,
}

impl PresenceStore {
    pub fn new(offline_threshold: Duration, away_threshold: Duration, retention: Duration) -> Self {
        Self {
            records: Mutex::new(HashMap::new()),
            offline_secs: offline_threshold.as_secs() as i64,
            away_secs: away_threshold.as_secs() as i64,
            retention_secs: retention.as_secs() as i64,
        }
    }

    /// Register a session in a project. Rejoining refreshes the existing
    /// record instead of duplicating it.
    pub async fn join(&self, user_id: &str, project_id: &str, session_id: Uuid) -> Collaborator {
        let key = PresenceKey {
            user_id: user_id.to_string(),
            project_id: project_id.to_string(),
            session_id,
        };
        let now = Utc::now();
        let mut records = self.records.lock().await;
        let record = records.entry(key.clone()).or_insert_with(|| PresenceRecord {
            status: PresenceStatus::Online,
            color: color_for_user(user_id),
            cursor_position: None,
            current_page: None,
            last_seen: now,
            last_active: now,
        });
        record.status = PresenceStatus::Online;
        record.last_seen = record.last_seen.max(now);
        record.last_active = record.last_active.max(now);
        to_collaborator(&key, record)
    }

    pub async fn leave(&self, user_id: &str, project_id: &str, session_id: Uuid) -> bool {
        let key = PresenceKey {
            user_id: user_id.to_string(),
            project_id: project_id.to_string(),
            session_id,
        };
        self.records.lock().await.remove(&key).is_some()
    }

    /// Mark a session offline, in one project or in all of them. Offline is
    /// terminal for the session; the records linger (hidden from listings)
    /// until retention cleanup removes them. Returns what was transitioned
    /// so leave events can be broadcast.
    pub async fn set_offline(&self, session_id: Uuid, project_id: Option<&str>) -> Vec<Collaborator> {
        let now = Utc::now();
        let mut records = self.records.lock().await;
        let mut transitioned = Vec::new();
        for (key, record) in records.iter_mut() {
            if key.session_id != session_id {
                continue;
            }
            if let Some(project) = project_id {
                if key.project_id != project {
                    continue;
                }
            }
            if record.status == PresenceStatus::Offline {
                continue;
            }
            record.status = PresenceStatus::Offline;
            record.last_seen = record.last_seen.max(now);
            transitioned.push(to_collaborator(key, record));
        }
        transitioned
    }

    /// Advance `last_seen` on every live record of the session. Heartbeats
    /// keep a session visible but do not count as user interaction, and they
    /// never refresh records already marked offline.
    pub async fn heartbeat(&self, session_id: Uuid) -> usize {
        let now = Utc::now();
        let mut records = self.records.lock().await;
        let mut touched = 0;
        for (key, record) in records.iter_mut() {
            if key.session_id == session_id && record.status != PresenceStatus::Offline {
                record.last_seen = record.last_seen.max(now);
                touched += 1;
            }
        }
        touched
    }

    /// Mark user interaction on a session within one project.
    pub async fn touch(&self, session_id: Uuid, project_id: &str) {
        let now = Utc::now();
        let mut records = self.records.lock().await;
        for (key, record) in records.iter_mut() {
            if key.session_id == session_id && key.project_id == project_id {
                record.last_seen = record.last_seen.max(now);
                record.last_active = record.last_active.max(now);
                if record.status == PresenceStatus::Away {
                    record.status = PresenceStatus::Online;
                }
            }
        }
    }

    pub async fn update_cursor(&self, session_id: Uuid, project_id: &str, position: CursorPosition) {
        let now = Utc::now();
        let mut records = self.records.lock().await;
        for (key, record) in records.iter_mut() {
            if key.session_id == session_id && key.project_id == project_id {
                record.cursor_position = Some(position);
                record.last_seen = record.last_seen.max(now);
                record.last_active = record.last_active.max(now);
            }
        }
    }

    /// Explicit status change from the client. Applies to one project when
    /// given, otherwise to every project the session joined. Returns the
    /// updated entries for broadcast.
    pub async fn update_status(
        &self,
        session_id: Uuid,
        status: PresenceStatus,
        project_id: Option<&str>,
        current_page: Option<String>,
    ) -> Vec<Collaborator> {
        let now = Utc::now();
        let mut records = self.records.lock().await;
        let mut updated = Vec::new();
        for (key, record) in records.iter_mut() {
            if key.session_id != session_id {
                continue;
            }
            if let Some(project) = project_id {
                if key.project_id != project {
                    continue;
                }
            }
            // Offline is terminal; only a rejoin revives the record.
            if record.status == PresenceStatus::Offline {
                continue;
            }
            record.status = status;
            if current_page.is_some() {
                record.current_page = current_page.clone();
            }
            record.last_seen = record.last_seen.max(now);
            record.last_active = record.last_active.max(now);
            updated.push(to_collaborator(key, record));
        }
        updated
    }

    /// Everyone currently live in a project, stably ordered. Offline records
    /// and records whose heartbeat lapsed past the offline threshold are
    /// left out, even before cleanup rewrites the latter.
    pub async fn list_collaborators(&self, project_id: &str) -> Vec<Collaborator> {
        let now = Utc::now();
        let records = self.records.lock().await;
        let mut out: Vec<Collaborator> = records
            .iter()
            .filter(|(key, record)| {
                key.project_id == project_id
                    && record.status != PresenceStatus::Offline
                    && (now - record.last_seen).num_seconds() <= self.offline_secs
            })
            .map(|(key, record)| to_collaborator(key, record))
            .collect();
        out.sort_by(|a, b| (&a.user_id, a.session_id).cmp(&(&b.user_id, b.session_id)));
        out
    }

    pub async fn collaborator(&self, project_id: &str, session_id: Uuid) -> Option<Collaborator> {
        let records = self.records.lock().await;
        records
            .iter()
            .find(|(key, _)| key.project_id == project_id && key.session_id == session_id)
            .map(|(key, record)| to_collaborator(key, record))
    }

    /// Periodic maintenance: demote idle online sessions to away, drop
    /// records nothing has refreshed within the retention window.
    pub async fn cleanup(&self) -> (usize, usize) {
        let now = Utc::now();
        let mut records = self.records.lock().await;
        let before = records.len();
        records.retain(|_, record| (now - record.last_seen).num_seconds() <= self.retention_secs);
        let expired = before - records.len();
        let mut demoted = 0;
        for record in records.values_mut() {
            if record.status == PresenceStatus::Online
                && (now - record.last_active).num_seconds() > self.away_secs
            {
                record.status = PresenceStatus::Away;
                demoted += 1;
            }
        }
        (demoted, expired)
    }

    /// (total records, live records within the offline threshold)
    pub async fn counts(&self) -> (usize, usize) {
        let now = Utc::now();
        let records = self.records.lock().await;
        let active = records
            .values()
            .filter(|r| {
                r.status != PresenceStatus::Offline
                    && (now - r.last_seen).num_seconds() <= self.offline_secs
            })
            .count();
        (records.len(), active)
    }

    #[cfg(test)]
    pub async fn backdate(&self, session_id: Uuid, secs: i64) {
        let delta = chrono::Duration::seconds(secs);
        let mut records = self.records.lock().await;
        for (key, record) in records.iter_mut() {
            if key.session_id == session_id {
                record.last_seen -= delta;
                record.last_active -= delta;
            }
        }
    }
}

fn to_collaborator(key: &PresenceKey, record: &PresenceRecord) -> Collaborator {
    Collaborator {
        user_id: key.user_id.clone(),
        session_id: key.session_id,
        project_id: key.project_id.clone(),
        status: record.status,
        color: record.color.clone(),
        cursor_position: record.cursor_position,
        current_page: record.current_page.clone(),
        last_seen: record.last_seen,
    }
}

/// Background sweep over the store, spawned once at startup.
pub fn spawn_presence_cleanup(store: Arc<PresenceStore>, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            let (demoted, expired) = store.cleanup().await;
            if demoted > 0 || expired > 0 {
                debug!("Presence cleanup: {} demoted to away, {} expired", demoted, expired);
            }
        }
    })
}
