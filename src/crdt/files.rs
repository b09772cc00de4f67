use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

use super::clock::{LamportClock, VersionStamp};

/// A file mutation as issued by a client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileChange {
    pub action: FileAction,
    pub path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub new_path: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileAction {
    Create,
    Update,
    Delete,
    Rename,
}

impl FileAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            FileAction::Create => "create",
            FileAction::Update => "update",
            FileAction::Delete => "delete",
            FileAction::Rename => "rename",
        }
    }
}

/// The replicated unit for the files map: one stamped key write.
/// `value: None` is a tombstone.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileWrite {
    pub path: String,
    pub value: Option<String>,
    pub stamp: VersionStamp,
}

/// Durable form of one files-map entry, tombstones included.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileEntry {
    pub path: String,
    pub content: Option<String>,
    pub stamp: VersionStamp,
}

/// Replication contract for the files map.
///
/// `apply` turns a local mutation into stamped writes, `merge` folds in
/// remote writes, and `snapshot`/`restore` round-trip durable state. The
/// whole-value LWW implementation below is the default; a sequence-CRDT
/// text type can implement the same contract for character-level merging
/// without the Room noticing.
pub trait FileSync: Send {
    /// Apply a local change, stamping each resulting write from `clock`.
    /// Returns the writes to replicate; empty means the change was a no-op
    /// (e.g. renaming a path that does not exist).
    fn apply(&mut self, clock: &mut LamportClock, actor: &str, change: &FileChange) -> Vec<FileWrite>;

    /// Merge remote writes. Returns true if any entry changed.
    fn merge(&mut self, writes: &[FileWrite]) -> bool;

    fn snapshot(&self) -> Vec<FileEntry>;

    fn restore(&mut self, entries: Vec<FileEntry>);
}

/// Last-writer-wins register map keyed by file path.
///
/// Each key holds the latest (stamp, content) pair; deletes are tombstones
/// so a slow replica cannot resurrect a removed file with a stale write.
/// Merge keeps the entry with the greater stamp, which makes it
/// commutative, idempotent and order-independent.
#[derive(Debug, Default)]
pub struct LwwFileMap {
    entries: HashMap<String, Slot>,
}

#[derive(Debug, Clone)]
struct Slot {
    content: Option<String>,
    stamp: VersionStamp,
}

impl LwwFileMap {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    /// Live (non-tombstoned) content of a path.
    pub fn get(&self, path: &str) -> Option<&str> {
        self.entries
            .get(path)
            .and_then(|slot| slot.content.as_deref())
    }

    /// Number of live files.
    pub fn len(&self) -> usize {
        self.entries.values().filter(|s| s.content.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Live path→content view in stable path order, used to bootstrap a
    /// joining client.
    pub fn live(&self) -> BTreeMap<String, String> {
        self.entries
            .iter()
            .filter_map(|(path, slot)| slot.content.clone().map(|c| (path.clone(), c)))
            .collect()
    }

    fn write(&mut self, path: String, value: Option<String>, stamp: VersionStamp) -> FileWrite {
        let write = FileWrite {
            path: path.clone(),
            value: value.clone(),
            stamp: stamp.clone(),
        };
        self.entries.insert(path, Slot { content: value, stamp });
        write
    }
}

impl FileSync for LwwFileMap {
    fn apply(&mut self, clock: &mut LamportClock, actor: &str, change: &FileChange) -> Vec<FileWrite> {
        match change.action {
            FileAction::Create | FileAction::Update => {
                let content = change.content.clone().unwrap_or_default();
                let stamp = clock.tick(actor);
                vec![self.write(change.path.clone(), Some(content), stamp)]
            }
            FileAction::Delete => {
                let stamp = clock.tick(actor);
                vec![self.write(change.path.clone(), None, stamp)]
            }
            FileAction::Rename => {
                let Some(new_path) = change.new_path.clone() else {
                    return Vec::new();
                };
                // Content may be supplied with the rename; otherwise carry
                // the current value of the source path.
                let carried = change
                    .content
                    .clone()
                    .or_else(|| self.get(&change.path).map(str::to_string));
                let Some(content) = carried else {
                    return Vec::new();
                };
                let drop_stamp = clock.tick(actor);
                let create_stamp = clock.tick(actor);
                vec![
                    self.write(change.path.clone(), None, drop_stamp),
                    self.write(new_path, Some(content), create_stamp),
                ]
            }
        }
    }

    fn merge(&mut self, writes: &[FileWrite]) -> bool {
        let mut changed = false;
        for write in writes {
            match self.entries.get(&write.path) {
                Some(slot) if slot.stamp >= write.stamp => {}
                _ => {
                    self.entries.insert(
                        write.path.clone(),
                        Slot {
                            content: write.value.clone(),
                            stamp: write.stamp.clone(),
                        },
                    );
                    changed = true;
                }
            }
        }
        changed
    }

    fn snapshot(&self) -> Vec<FileEntry> {
        let mut entries: Vec<FileEntry> = self
            .entries
            .iter()
            .map(|(path, slot)| FileEntry {
                path: path.clone(),
                content: slot.content.clone(),
                stamp: slot.stamp.clone(),
            })
            .collect();
        entries.sort_by(|a, b| a.path.cmp(&b.path));
        entries
    }

    fn restore(&mut self, entries: Vec<FileEntry>) {
        for entry in entries {
            match self.entries.get(&entry.path) {
                Some(slot) if slot.stamp >= entry.stamp => {}
                _ => {
                    self.entries.insert(
                        entry.path,
                        Slot {
                            content: entry.content,
                            stamp: entry.stamp,
                        },
                    );
                }
            }
        }
    }
}
