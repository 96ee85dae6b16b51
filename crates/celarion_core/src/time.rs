//! Time types for CELARION.
//!
//! Uses logical time for determinism. Wall clock time only bounds
//! deadlines in the async layers and never decides an outcome.

use crate::id::MemberId;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;

/// Logical time - monotonically increasing counter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LogicalTime(u64);

impl LogicalTime {
    /// Create a new logical time at zero
    #[must_use]
    pub const fn zero() -> Self {
        Self(0)
    }

    /// Create from raw value
    #[must_use]
    pub const fn from_raw(value: u64) -> Self {
        Self(value)
    }

    /// Get raw value
    #[must_use]
    pub const fn as_u64(&self) -> u64 {
        self.0
    }

    /// Increment logical time
    pub fn increment(&mut self) {
        self.0 = self.0.saturating_add(1);
    }

    /// Create incremented time
    #[must_use]
    pub const fn incremented(&self) -> Self {
        Self(self.0.saturating_add(1))
    }

    /// Time `ticks` later, clamped at `u64::MAX`
    #[must_use]
    pub const fn saturating_add(&self, ticks: u64) -> Self {
        Self(self.0.saturating_add(ticks))
    }

    /// Ticks elapsed since `earlier`, zero if `earlier` is later
    #[must_use]
    pub const fn since(&self, earlier: LogicalTime) -> u64 {
        self.0.saturating_sub(earlier.0)
    }
}

impl Default for LogicalTime {
    fn default() -> Self {
        Self::zero()
    }
}

impl std::fmt::Display for LogicalTime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "T{}", self.0)
    }
}

impl From<u64> for LogicalTime {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

/// Per-member event counters for causal ordering of guild messages
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VectorClock {
    counters: BTreeMap<MemberId, u64>,
}

impl VectorClock {
    /// Create an empty clock
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Counter for `member`, zero if never seen
    #[must_use]
    pub fn get(&self, member: &MemberId) -> u64 {
        self.counters.get(member).copied().unwrap_or(0)
    }

    /// Record a local event at `member`
    pub fn increment(&mut self, member: &MemberId) -> u64 {
        let counter = self.counters.entry(member.clone()).or_insert(0);
        *counter = counter.saturating_add(1);
        *counter
    }

    /// Pointwise maximum with another clock
    pub fn merge(&mut self, other: &VectorClock) {
        for (member, &count) in &other.counters {
            let entry = self.counters.entry(member.clone()).or_insert(0);
            *entry = (*entry).max(count);
        }
    }

    /// True if every counter here is `<=` the matching counter in `other`
    #[must_use]
    pub fn dominated_by(&self, other: &VectorClock) -> bool {
        self.counters
            .iter()
            .all(|(member, &count)| count <= other.get(member))
    }

    /// Causal comparison; `None` when the clocks are concurrent
    #[must_use]
    pub fn causal_cmp(&self, other: &VectorClock) -> Option<Ordering> {
        match (self.dominated_by(other), other.dominated_by(self)) {
            (true, true) => Some(Ordering::Equal),
            (true, false) => Some(Ordering::Less),
            (false, true) => Some(Ordering::Greater),
            (false, false) => None,
        }
    }

    /// Iterate counters in member order
    pub fn iter(&self) -> impl Iterator<Item = (&MemberId, &u64)> {
        self.counters.iter()
    }
}
