use serde::{Deserialize, Serialize};

/// Lamport clock for stamping local writes.
///
/// `tick` produces the stamp for a local mutation; `observe` folds in a
/// remote stamp so later local writes order after everything already seen.
#[derive(Debug, Clone, Default)]
pub struct LamportClock {
    counter: u64,
}

impl LamportClock {
    pub fn new() -> Self {
        Self { counter: 0 }
    }

    /// Advance the clock and stamp a local write for the given actor.
    pub fn tick(&mut self, actor: &str) -> VersionStamp {
        self.counter += 1;
        VersionStamp {
            counter: self.counter,
            actor: actor.to_string(),
        }
    }

    /// Merge in a remotely observed stamp.
    pub fn observe(&mut self, stamp: &VersionStamp) {
        if stamp.counter > self.counter {
            self.counter = stamp.counter;
        }
    }

    pub fn counter(&self) -> u64 {
        self.counter
    }

    /// Restore the counter from a persisted snapshot.
    pub fn restore(&mut self, counter: u64) {
        if counter > self.counter {
            self.counter = counter;
        }
    }
}

/// Version stamp attached to every replicated write.
///
/// Ordering is (counter, actor): the counter decides, the actor id breaks
/// ties between concurrent writes so that every pair of distinct stamps is
/// strictly ordered and merge is deterministic on all replicas.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct VersionStamp {
    pub counter: u64,
    pub actor: String,
}

impl VersionStamp {
    pub fn new(counter: u64, actor: impl Into<String>) -> Self {
        Self {
            counter,
            actor: actor.into(),
        }
    }
}
