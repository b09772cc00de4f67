use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One entry of a project's activity feed.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivityRecord {
    pub id: Uuid,
    pub action: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_path: Option<String>,
    pub session_id: Uuid,
    pub user_id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

impl ActivityRecord {
    pub fn new(
        action: impl Into<String>,
        file_path: Option<String>,
        session_id: Uuid,
        user_id: impl Into<String>,
        metadata: Option<serde_json::Value>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            action: action.into(),
            file_path,
            session_id,
            user_id: user_id.into(),
            timestamp: Utc::now(),
            metadata,
        }
    }
}

/// Append-only activity log with a bounded retained window.
///
/// Records are kept ordered by (timestamp, id) — a total order identical on
/// every replica — and merged as a union keyed by record id, so merging is
/// commutative and idempotent. The log is truncated oldest-first once it
/// exceeds `cap`; it is never reordered.
#[derive(Debug)]
pub struct ActivityLog {
    records: Vec<ActivityRecord>,
    seen: HashSet<Uuid>,
    cap: usize,
}

pub const DEFAULT_ACTIVITY_CAP: usize = 1000;

impl Default for ActivityLog {
    fn default() -> Self {
        Self::with_cap(DEFAULT_ACTIVITY_CAP)
    }
}

impl ActivityLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_cap(cap: usize) -> Self {
        Self {
            records: Vec::new(),
            seen: HashSet::new(),
            cap: cap.max(1),
        }
    }

    /// Append a record. Duplicates (by id) are ignored.
    pub fn append(&mut self, record: ActivityRecord) -> bool {
        if !self.seen.insert(record.id) {
            return false;
        }
        let at = self
            .records
            .partition_point(|r| (r.timestamp, r.id) <= (record.timestamp, record.id));
        self.records.insert(at, record);
        self.enforce_cap();
        true
    }

    /// Union-merge remote records. Returns true if anything new landed.
    pub fn merge(&mut self, records: &[ActivityRecord]) -> bool {
        let mut changed = false;
        for record in records {
            if self.append(record.clone()) {
                changed = true;
            }
        }
        changed
    }

    /// The newest `n` records, oldest first.
    pub fn recent(&self, n: usize) -> Vec<ActivityRecord> {
        let start = self.records.len().saturating_sub(n);
        self.records[start..].to_vec()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn snapshot(&self) -> Vec<ActivityRecord> {
        self.records.clone()
    }

    pub fn restore(&mut self, records: Vec<ActivityRecord>) {
        self.merge(&records);
    }

    fn enforce_cap(&mut self) {
        while self.records.len() > self.cap {
            let dropped = self.records.remove(0);
            self.seen.remove(&dropped.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn record_at(secs: i64, action: &str) -> ActivityRecord {
        let mut record = ActivityRecord::new(action, None, Uuid::new_v4(), "u1", None);
        record.timestamp = Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap();
        record
    }

    #[test]
    fn merge_is_order_independent() {
        let records: Vec<ActivityRecord> =
            (0..6).map(|i| record_at(i, &format!("edit-{i}"))).collect();

        let mut forward = ActivityLog::new();
        forward.merge(&records);

        let mut backward = ActivityLog::new();
        let mut reversed = records.clone();
        reversed.reverse();
        backward.merge(&reversed);

        let forward_ids: Vec<Uuid> = forward.snapshot().iter().map(|r| r.id).collect();
        let backward_ids: Vec<Uuid> = backward.snapshot().iter().map(|r| r.id).collect();
        assert_eq!(forward_ids, backward_ids);
    }

    #[test]
    fn duplicate_records_are_dropped() {
        let mut log = ActivityLog::new();
        let record = record_at(0, "edit");
        assert!(log.append(record.clone()));
        assert!(!log.append(record.clone()));
        assert!(!log.merge(&[record]));
        assert_eq!(log.len(), 1);
    }

    #[test]
    fn truncation_keeps_newest_without_reordering() {
        let mut log = ActivityLog::with_cap(3);
        for i in 0..5 {
            log.append(record_at(i, &format!("a{i}")));
        }
        assert_eq!(log.len(), 3);
        let actions: Vec<String> = log.snapshot().iter().map(|r| r.action.clone()).collect();
        assert_eq!(actions, vec!["a2", "a3", "a4"]);
    }

    #[test]
    fn recent_returns_bounded_suffix() {
        let mut log = ActivityLog::new();
        for i in 0..10 {
            log.append(record_at(i, &format!("a{i}")));
        }
        let tail = log.recent(3);
        assert_eq!(tail.len(), 3);
        assert_eq!(tail[0].action, "a7");
        assert_eq!(tail[2].action, "a9");
        assert_eq!(log.recent(100).len(), 10);
    }
}
