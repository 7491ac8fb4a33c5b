//! Capped-cardinality outcome counter.
//!
//! Error messages coming back from the network are unboundedly diverse, so the
//! per-shard tally stops tracking new distinct labels once `capacity` of them
//! exist. Increments for untracked labels are folded into a single overflow
//! bucket; the total number of increments is always preserved.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use serde::Serialize;

/// Default number of distinct labels tracked per shard.
pub const DEFAULT_COUNTER_CAPACITY: usize = 1000;

/// Label under which folded increments appear in serialized snapshots.
pub const OVERFLOW_LABEL: &str = "__overflow__";

/// Thread-safe label counter with a ceiling on distinct labels.
#[derive(Debug)]
pub struct CappedCounter {
    capacity: usize,
    inner: Mutex<CounterState>,
}

#[derive(Debug, Default)]
struct CounterState {
    counts: HashMap<String, u64>,
    overflow: u64,
}

/// Point-in-time copy of a [`CappedCounter`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CounterSnapshot {
    /// Tracked labels and their counts, sorted by label.
    pub counts: BTreeMap<String, u64>,
    /// Increments of labels that arrived after the ceiling was reached.
    pub overflow: u64,
}

impl CounterSnapshot {
    /// Sum of all increments, tracked and folded.
    #[must_use]
    pub fn total(&self) -> u64 {
        self.counts.values().sum::<u64>() + self.overflow
    }

    /// Flattens the snapshot into a single label map, with the overflow bucket
    /// under [`OVERFLOW_LABEL`] when non-zero.
    #[must_use]
    pub fn to_flat_map(&self) -> BTreeMap<String, u64> {
        let mut map = self.counts.clone();
        if self.overflow > 0 {
            map.insert(OVERFLOW_LABEL.to_string(), self.overflow);
        }
        map
    }
}

impl Default for CappedCounter {
    fn default() -> Self {
        Self::new(DEFAULT_COUNTER_CAPACITY)
    }
}

impl CappedCounter {
    /// Creates a counter tracking at most `capacity` distinct labels.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            inner: Mutex::new(CounterState::default()),
        }
    }

    /// Maximum number of distinct labels tracked.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Counts one occurrence of `label`.
    pub fn increment(&self, label: &str) {
        let mut state = self.lock();
        if let Some(count) = state.counts.get_mut(label) {
            *count += 1;
        } else if state.counts.len() < self.capacity {
            state.counts.insert(label.to_string(), 1);
        } else {
            state.overflow += 1;
        }
    }

    /// Returns the current count for a tracked label (0 if untracked).
    #[must_use]
    pub fn get(&self, label: &str) -> u64 {
        self.lock().counts.get(label).copied().unwrap_or(0)
    }

    /// Copies the current state.
    #[must_use]
    pub fn snapshot(&self) -> CounterSnapshot {
        let state = self.lock();
        CounterSnapshot {
            counts: state
                .counts
                .iter()
                .map(|(label, count)| (label.clone(), *count))
                .collect(),
            overflow: state.overflow,
        }
    }

    // A poisoned counter still holds valid integers; keep counting.
    fn lock(&self) -> std::sync::MutexGuard<'_, CounterState> {
        self.inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}
