//! Per-client header chains and the deterministic apply order.

use std::collections::BTreeMap;

use crate::{
    clock::{Causality, VectorClock},
    ids::ClientId,
    version::DatabaseVersionHeader,
};

/// The database version headers one client has authored, oldest first.
///
/// A client only ever appends to its own chain, so the headers in a
/// branch are totally ordered along the author's clock axis.
#[derive(Debug, Clone, Default)]
pub struct Branch {
    headers: Vec<DatabaseVersionHeader>,
}

impl Branch {
    /// Create an empty branch.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a header to the end of the branch.
    pub fn add(&mut self, header: DatabaseVersionHeader) {
        self.headers.push(header);
    }

    /// Append all given headers, in order.
    pub fn add_all(&mut self, headers: impl IntoIterator<Item = DatabaseVersionHeader>) {
        self.headers.extend(headers);
    }

    /// The most recent header.
    pub fn last(&self) -> Option<&DatabaseVersionHeader> {
        self.headers.last()
    }

    /// The header with exactly this vector clock, if present.
    pub fn get(&self, clock: &VectorClock) -> Option<&DatabaseVersionHeader> {
        self.headers
            .iter()
            .find(|h| h.vector_clock.compare(clock) == Causality::Equal)
    }

    /// Iterate over the headers, oldest first.
    pub fn iter(&self) -> impl Iterator<Item = &DatabaseVersionHeader> {
        self.headers.iter()
    }

    /// Number of headers in the branch.
    pub fn len(&self) -> usize {
        self.headers.len()
    }

    /// Whether the branch holds no headers.
    pub fn is_empty(&self) -> bool {
        self.headers.is_empty()
    }

    /// The headers a peer that has seen up to `known` is missing.
    ///
    /// With `None` the whole branch is unknown. Otherwise everything
    /// after the last header whose clock is dominated by (or equal to)
    /// `known` is returned.
    pub fn unknown_suffix(&self, known: Option<&VectorClock>) -> &[DatabaseVersionHeader] {
        let Some(known) = known else {
            return &self.headers;
        };
        let seen = self.headers.iter().rposition(|h| {
            matches!(
                h.vector_clock.compare(known),
                Causality::Smaller | Causality::Equal
            )
        });
        match seen {
            Some(idx) => &self.headers[idx + 1..],
            None => &self.headers,
        }
    }
}

/// All branches a client knows about, its own included.
#[derive(Debug, Clone, Default)]
pub struct Branches {
    branches: BTreeMap<ClientId, Branch>,
}

impl Branches {
    /// Create an empty set of branches.
    pub fn new() -> Self {
        Self::default()
    }

    /// File a header under its author's branch.
    ///
    /// Returns `false` if the author's branch already holds a header with
    /// the same vector clock, so replaying known versions is harmless.
    pub fn add(&mut self, header: DatabaseVersionHeader) -> bool {
        let branch = self.branches.entry(header.client.clone()).or_default();
        if branch.get(&header.vector_clock).is_some() {
            return false;
        }
        branch.add(header);
        true
    }

    /// The branch of the given client.
    pub fn get(&self, client: &ClientId) -> Option<&Branch> {
        self.branches.get(client)
    }

    /// Replace the branch of the given client.
    pub fn put(&mut self, client: ClientId, branch: Branch) {
        self.branches.insert(client, branch);
    }

    /// The clients with at least one known header.
    pub fn clients(&self) -> impl Iterator<Item = &ClientId> {
        self.branches.keys()
    }

    /// Iterate over `(client, branch)` pairs.
    pub fn iter(&self) -> impl Iterator<Item = (&ClientId, &Branch)> {
        self.branches.iter()
    }

    /// Number of known branches.
    pub fn len(&self) -> usize {
        self.branches.len()
    }

    /// Whether no branch is known yet.
    pub fn is_empty(&self) -> bool {
        self.branches.is_empty()
    }
}

/// The deterministic apply order between two version headers.
///
/// The counter total of a vector clock strictly grows along causal edges,
/// so ordering by `(total, timestamp, client)` yields a total order that
/// extends the causal partial order and breaks ties between concurrent
/// versions the same way on every client.
pub fn causal_order(a: &DatabaseVersionHeader, b: &DatabaseVersionHeader) -> std::cmp::Ordering {
    (a.vector_clock.total(), a.timestamp, &a.client).cmp(&(
        b.vector_clock.total(),
        b.timestamp,
        &b.client,
    ))
}

/// Sort headers into the deterministic apply order of [`causal_order`].
pub fn sort_causal(headers: &mut [DatabaseVersionHeader]) {
    headers.sort_by(|a, b| causal_order(a, b));
}
