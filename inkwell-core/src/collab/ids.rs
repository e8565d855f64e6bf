//! Actor identities, element identifiers and logical clocks.
//!
//! Element ids are `(clock, origin)` pairs. Ordering compares the Lamport
//! clock first and the origin string second, so every replica sorts the
//! same pair of ids the same way.
//!
//! Reference: Lamport, Time, Clocks, and the Ordering of Events (1978)

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use uuid::Uuid;

/// Names the actor (user session) that produced an update.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ActorId(String);

impl ActorId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Short random actor name in the `user-xxxxx` form.
    pub fn random() -> Self {
        let simple = Uuid::new_v4().simple().to_string();
        Self(format!("user-{}", &simple[..5]))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ActorId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ActorId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// Causal identifier of one element in the replicated sequence.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq, Eq, Hash)]
pub struct ElementId {
    pub clock: u64,
    pub origin: ActorId,
}

impl ElementId {
    pub fn new(clock: u64, origin: ActorId) -> Self {
        Self { clock, origin }
    }
}

impl Ord for ElementId {
    fn cmp(&self, other: &Self) -> Ordering {
        self.clock
            .cmp(&other.clock)
            .then_with(|| self.origin.cmp(&other.origin))
    }
}

impl PartialOrd for ElementId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl std::fmt::Display for ElementId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.clock, self.origin)
    }
}

/// Largest clock accepted from a peer. Leaves the upper half of the range
/// as headroom so a replica that observed it can keep ticking.
pub const MAX_REMOTE_CLOCK: u64 = u64::MAX / 2;

/// Lamport clock: ticks on every local op, jumps forward on remote stamps.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LamportClock(u64);

impl LamportClock {
    pub fn new() -> Self {
        Self(0)
    }

    /// Advance and return the new value. Saturates instead of wrapping.
    pub fn tick(&mut self) -> u64 {
        match self.0.checked_add(1) {
            Some(next) => self.0 = next,
            None => log::error!("Lamport clock exhausted at {}", self.0),
        }
        self.0
    }

    pub fn observe(&mut self, remote: u64) {
        self.0 = self.0.max(remote);
    }

    pub fn current(&self) -> u64 {
        self.0
    }
}

/// Highest fully integrated update clock per origin.
///
/// Sent in `SyncStep1` so the relay can skip backlog entries the requester
/// already has. Only ever an optimization: resending is harmless.
#[derive(Clone, Serialize, Deserialize, Debug, Default, PartialEq, Eq)]
pub struct StateVector(BTreeMap<ActorId, u64>);

impl StateVector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, origin: &ActorId) -> u64 {
        self.0.get(origin).copied().unwrap_or(0)
    }

    pub fn observe(&mut self, origin: &ActorId, clock: u64) {
        let entry = self.0.entry(origin.clone()).or_insert(0);
        *entry = (*entry).max(clock);
    }

    /// Whether an update stamped `(origin, clock)` is already covered.
    pub fn includes(&self, origin: &ActorId, clock: u64) -> bool {
        self.get(origin) >= clock
    }

    /// True when every entry of `other` is included here.
    pub fn dominates(&self, other: &StateVector) -> bool {
        other.0.iter().all(|(origin, clock)| self.includes(origin, *clock))
    }

    pub fn merge(&mut self, other: &StateVector) {
        for (origin, clock) in &other.0 {
            self.observe(origin, *clock);
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&ActorId, u64)> {
        self.0.iter().map(|(origin, clock)| (origin, *clock))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}
