//! Vector clocks ordering database versions causally.

use std::{cmp::Ordering, collections::BTreeMap, fmt};

use serde::{Deserialize, Serialize};

use crate::ids::ClientId;

/// Result of comparing two [`VectorClock`]s.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Causality {
    /// Every component is equal.
    Equal,
    /// The left clock has seen everything the right one has, and more.
    Greater,
    /// The right clock has seen everything the left one has, and more.
    Smaller,
    /// Neither clock dominates; the versions happened concurrently.
    Concurrent,
}

impl Causality {
    /// The comparison with swapped arguments.
    pub fn inverse(self) -> Self {
        match self {
            Causality::Greater => Causality::Smaller,
            Causality::Smaller => Causality::Greater,
            other => other,
        }
    }
}

/// A vector clock: one logical counter per client.
///
/// Missing components count as zero, so `{}` and `{a: 0}` compare equal.
/// Counters only ever grow; a client increments its own axis when it
/// creates a database version, and foreign axes advance only by merging
/// foreign clocks in.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VectorClock {
    counters: BTreeMap<ClientId, u64>,
}

impl VectorClock {
    /// The empty clock.
    pub fn new() -> Self {
        Self::default()
    }

    /// The counter for `client`, zero when absent.
    pub fn get(&self, client: &ClientId) -> u64 {
        self.counters.get(client).copied().unwrap_or(0)
    }

    /// Set the counter for `client`.
    ///
    /// Counters never decrease; lowering one is a caller bug, so this
    /// stays crate-internal.
    pub(crate) fn set(&mut self, client: ClientId, value: u64) {
        self.counters.insert(client, value);
    }

    /// Increment the counter for `client` by one, returning the new value.
    pub fn increment(&mut self, client: ClientId) -> u64 {
        let counter = self.counters.entry(client).or_insert(0);
        *counter += 1;
        *counter
    }

    /// Merge `other` into `self`, taking the pointwise maximum.
    pub fn merge(&mut self, other: &VectorClock) {
        for (client, &value) in other.counters.iter() {
            self.counters
                .entry(client.clone())
                .and_modify(|v| *v = (*v).max(value))
                .or_insert(value);
        }
    }

    /// The pointwise maximum of `self` and `other`.
    pub fn merged(&self, other: &VectorClock) -> VectorClock {
        let mut clock = self.clone();
        clock.merge(other);
        clock
    }

    /// Compare two clocks causally.
    ///
    /// Looks at every client appearing in either clock, counting missing
    /// components as zero. If some components are larger on one side and
    /// some on the other, the clocks are [`Causality::Concurrent`].
    pub fn compare(&self, other: &VectorClock) -> Causality {
        let mut greater = false;
        let mut smaller = false;
        for client in self.counters.keys().chain(other.counters.keys()) {
            match self.get(client).cmp(&other.get(client)) {
                Ordering::Greater => greater = true,
                Ordering::Less => smaller = true,
                Ordering::Equal => {}
            }
        }
        match (greater, smaller) {
            (false, false) => Causality::Equal,
            (true, false) => Causality::Greater,
            (false, true) => Causality::Smaller,
            (true, true) => Causality::Concurrent,
        }
    }

    /// Sum of all counters.
    ///
    /// Strictly monotone along causality: a causally smaller clock always
    /// has a smaller total, which makes the total usable as the primary
    /// key of a total order extending the causal partial order.
    pub fn total(&self) -> u64 {
        self.counters.values().sum()
    }

    /// Whether no component is set.
    pub fn is_empty(&self) -> bool {
        self.counters.is_empty()
    }

    /// Number of components.
    pub fn len(&self) -> usize {
        self.counters.len()
    }

    /// Iterate over `(client, counter)` pairs in client order.
    pub fn iter(&self) -> impl Iterator<Item = (&ClientId, &u64)> {
        self.counters.iter()
    }
}

impl FromIterator<(ClientId, u64)> for VectorClock {
    fn from_iter<T: IntoIterator<Item = (ClientId, u64)>>(iter: T) -> Self {
        Self {
            counters: iter.into_iter().collect(),
        }
    }
}

impl fmt::Display for VectorClock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(")?;
        for (i, (client, value)) in self.counters.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            write!(f, "{client}{value}")?;
        }
        write!(f, ")")
    }
}
