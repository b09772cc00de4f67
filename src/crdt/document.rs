use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::crdt::activity::{ActivityLog, ActivityRecord};
use crate::crdt::clock::{LamportClock, VersionStamp};
use crate::crdt::files::{FileChange, FileEntry, FileSync, FileWrite, LwwFileMap};

/// A caret location inside a file, zero-based.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct CursorPosition {
    pub line: u32,
    pub column: u32,
}

/// An optional selection span, anchor to head.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct CursorSelection {
    pub anchor: CursorPosition,
    pub head: CursorPosition,
}

/// Per-session cursor state. Last write per session wins; cursors are
/// ephemeral and never persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CursorState {
    pub session_id: Uuid,
    pub user_id: String,
    pub position: CursorPosition,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub selection: Option<CursorSelection>,
    pub color: String,
    pub stamp: VersionStamp,
}

/// Durable image of a document, written as one blob by the snapshot store.
/// Cursors are deliberately absent.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentSnapshot {
    pub files: Vec<FileEntry>,
    pub activity: Vec<ActivityRecord>,
    pub clock: u64,
    pub saved_at: DateTime<Utc>,
}

/// The replicated state of one project: file contents, live cursors and the
/// activity feed, all stamped by a shared Lamport clock.
#[derive(Debug, Default)]
pub struct ProjectDocument {
    clock: LamportClock,
    files: LwwFileMap,
    cursors: HashMap<Uuid, CursorState>,
    activity: ActivityLog,
}

impl ProjectDocument {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply a local file change on behalf of `actor` (the originating
    /// session). Returns the stamped writes to replicate.
    pub fn apply_file(&mut self, actor: &str, change: &FileChange) -> Vec<FileWrite> {
        self.files.apply(&mut self.clock, actor, change)
    }

    /// Fold in stamped writes from elsewhere. Returns true if state moved.
    pub fn merge_file_writes(&mut self, writes: &[FileWrite]) -> bool {
        for write in writes {
            self.clock.observe(&write.stamp);
        }
        self.files.merge(writes)
    }

    /// Record a cursor move for a session, stamping it with the shared clock.
    pub fn apply_cursor(
        &mut self,
        session_id: Uuid,
        user_id: &str,
        position: CursorPosition,
        selection: Option<CursorSelection>,
        color: String,
    ) -> CursorState {
        let stamp = self.clock.tick(&session_id.to_string());
        let state = CursorState {
            session_id,
            user_id: user_id.to_string(),
            position,
            selection,
            color,
            stamp,
        };
        self.cursors.insert(session_id, state.clone());
        state
    }

    /// Fold in a cursor observed elsewhere; stale stamps lose.
    pub fn merge_cursor(&mut self, state: CursorState) -> bool {
        self.clock.observe(&state.stamp);
        match self.cursors.get(&state.session_id) {
            Some(current) if current.stamp >= state.stamp => false,
            _ => {
                self.cursors.insert(state.session_id, state);
                true
            }
        }
    }

    /// Drop a session's cursor, typically on leave or disconnect.
    pub fn remove_cursor(&mut self, session_id: &Uuid) -> bool {
        self.cursors.remove(session_id).is_some()
    }

    pub fn cursors(&self) -> Vec<CursorState> {
        let mut all: Vec<CursorState> = self.cursors.values().cloned().collect();
        all.sort_by(|a, b| a.session_id.cmp(&b.session_id));
        all
    }

    pub fn append_activity(&mut self, record: ActivityRecord) -> bool {
        self.activity.append(record)
    }

    pub fn merge_activity(&mut self, records: &[ActivityRecord]) -> bool {
        self.activity.merge(records)
    }

    pub fn recent_activity(&self, n: usize) -> Vec<ActivityRecord> {
        self.activity.recent(n)
    }

    /// Current non-deleted files, path to content.
    pub fn live_files(&self) -> BTreeMap<String, String> {
        self.files.live()
    }

    pub fn file_count(&self) -> usize {
        self.files.live().len()
    }

    pub fn activity_len(&self) -> usize {
        self.activity.len()
    }

    /// Durable image of the document. Cursors are excluded.
    pub fn snapshot(&self) -> DocumentSnapshot {
        DocumentSnapshot {
            files: self.files.snapshot(),
            activity: self.activity.snapshot(),
            clock: self.clock.counter(),
            saved_at: Utc::now(),
        }
    }

    /// Rebuild state from a stored snapshot. Existing state merges in, so a
    /// restore over live edits never loses the newer side.
    pub fn restore(&mut self, snapshot: DocumentSnapshot) {
        self.clock.restore(snapshot.clock);
        self.files.restore(snapshot.files);
        self.activity.restore(snapshot.activity);
    }
}
