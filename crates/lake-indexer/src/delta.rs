//! Incremental deltas between consecutive observations.
//!
//! Counters such as vote credits or round-trip times are sampled
//! periodically; the stored delta is the change since the previous sample of
//! the same entity. The previous sample may come from the same batch or, on
//! the first batch after a restart, from the store, and both paths must give
//! identical results. [`DeltaTracker`] holds the reference per entity;
//! [`delta`] decides whether two observations are comparable.

use std::collections::HashMap;
use std::hash::Hash;

/// How a counter behaves over time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeltaPolicy {
    /// The counter only grows within a period; decreases clamp to zero.
    pub monotonic: bool,
    /// The counter restarts every period, so values across a period
    /// boundary are not comparable.
    pub resets_per_period: bool,
}

/// One observed value within a period (typically an epoch).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Observation {
    /// Period the value belongs to.
    pub period: u64,
    /// Observed value.
    pub value: i64,
}

impl Observation {
    /// Creates an observation.
    #[must_use]
    pub const fn new(period: u64, value: i64) -> Self {
        Self { period, value }
    }
}

/// Delta of `current` against `prev`, or `None` when they are not comparable.
///
/// - no previous observation: `None`
/// - same period: `max(cur - prev, 0)` if monotonic, else `|cur - prev|`
/// - next period: `None` if the counter resets per period, else as above
/// - a gap of more than one period, or a period going backwards: `None`
#[must_use]
pub fn delta(prev: Option<Observation>, current: Observation, policy: DeltaPolicy) -> Option<i64> {
    let prev = prev?;
    let comparable = if current.period == prev.period {
        true
    } else if prev.period.checked_add(1) == Some(current.period) {
        !policy.resets_per_period
    } else {
        false
    };
    if !comparable {
        return None;
    }
    let diff = current.value.saturating_sub(prev.value);
    Some(if policy.monotonic {
        diff.max(0)
    } else {
        diff.saturating_abs()
    })
}

/// Per-entity reference observations for delta computation.
#[derive(Debug, Clone)]
pub struct DeltaTracker<K> {
    policy: DeltaPolicy,
    last: HashMap<K, Observation>,
}

impl<K: Eq + Hash> DeltaTracker<K> {
    /// Creates an empty tracker.
    #[must_use]
    pub fn new(policy: DeltaPolicy) -> Self {
        Self {
            policy,
            last: HashMap::new(),
        }
    }

    /// Installs a reference (typically the entity's last stored sample).
    pub fn seed(&mut self, key: K, observation: Observation) {
        self.last.insert(key, observation);
    }

    /// Returns true if the entity has a reference.
    pub fn contains(&self, key: &K) -> bool {
        self.last.contains_key(key)
    }

    /// Reference observation for an entity.
    pub fn last(&self, key: &K) -> Option<Observation> {
        self.last.get(key).copied()
    }

    /// Computes the delta for `observation` and makes it the new reference.
    pub fn observe(&mut self, key: K, observation: Observation) -> Option<i64> {
        let prev = self.last.insert(key, observation);
        delta(prev, observation, self.policy)
    }

    /// Drops the reference of one entity.
    pub fn forget(&mut self, key: &K) -> Option<Observation> {
        self.last.remove(key)
    }

    /// Drops references for periods older than `period`.
    pub fn retain_from(&mut self, period: u64) {
        self.last.retain(|_, obs| obs.period >= period);
    }

    /// Number of tracked entities.
    #[must_use]
    pub fn len(&self) -> usize {
        self.last.len()
    }

    /// Returns true if nothing is tracked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.last.is_empty()
    }
}
