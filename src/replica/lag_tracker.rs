//! Replica-lag tracker and read/write split policy (spec.md §4.6).

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy)]
struct LagState {
    last_write_at: Instant,
    sticky_until: Option<Instant>,
}

pub struct LagTracker {
    state: Mutex<HashMap<(String, Option<String>), LagState>>,
}

impl LagTracker {
    pub fn new() -> Self {
        Self { state: Mutex::new(HashMap::new()) }
    }

    fn key(database: &str, shard: Option<&str>) -> (String, Option<String>) {
        (database.to_string(), shard.map(|s| s.to_string()))
    }

    /// Stamp a successful write to `(database, shard)` as having just
    /// happened now.
    pub fn record_write(&self, database: &str, shard: Option<&str>) {
        let key = Self::key(database, shard);
        let mut state = self.state.lock().expect("lag state lock poisoned");
        state
            .entry(key)
            .or_insert_with(|| LagState { last_write_at: Instant::now(), sticky_until: None })
            .last_write_at = Instant::now();
    }

    /// Force reads for `(database, shard)` to primary for `duration`.
    pub fn stick_to_primary(&self, database: &str, shard: Option<&str>, duration: Duration) {
        let key = Self::key(database, shard);
        let mut state = self.state.lock().expect("lag state lock poisoned");
        let entry = state
            .entry(key)
            .or_insert_with(|| LagState { last_write_at: Instant::now(), sticky_until: None });
        let until = Instant::now() + duration;
        entry.sticky_until = Some(entry.sticky_until.map_or(until, |u| u.max(until)));
    }

    /// Whether a read for `(database, shard)` may be served by a replica,
    /// given the model's lag threshold. `force_writing` models a context
    /// that has pinned the role to Writing; `prevent_writes` scopes do not
    /// affect this decision (they block writes, not replica reads).
    pub fn may_use_replica(&self, database: &str, shard: Option<&str>, lag_threshold: Duration, force_writing: bool) -> bool {
        if force_writing {
            return false;
        }
        let key = Self::key(database, shard);
        let state = self.state.lock().expect("lag state lock poisoned");
        let Some(entry) = state.get(&key) else {
            return true;
        };
        let now = Instant::now();
        if let Some(sticky_until) = entry.sticky_until {
            if sticky_until > now {
                return false;
            }
        }
        let age = now.saturating_duration_since(entry.last_write_at);
        age >= lag_threshold
    }
}

impl Default for LagTracker {
    fn default() -> Self {
        Self::new()
    }
}
