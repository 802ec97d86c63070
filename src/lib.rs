//! Replicate a folder between clients through any dumb blob store.
//!
//! Every client keeps an append-only log of [`DatabaseVersion`]s stamped
//! with vector clocks, publishes new versions as files on a shared
//! remote, and merges the versions of others back in. Conflicts are
//! resolved deterministically, so all clients converge on the same state
//! without ever talking to each other directly. Remote writes go through
//! a manifest-based transaction layer that keeps partially uploaded
//! batches invisible and resumable.

#![deny(missing_docs, rustdoc::broken_intra_doc_links)]

pub mod branch;
pub mod clock;
pub mod database;
pub mod engine;
pub mod entry;
pub mod file;
pub mod ids;
pub mod reconcile;
pub mod remote;
pub mod transaction;
mod util;
pub mod version;
pub mod wire;

pub use crate::{
    clock::{Causality, VectorClock},
    database::Database,
    engine::{Changeset, SyncEngine},
    ids::ClientId,
    remote::TransferManager,
    version::{DatabaseVersion, DatabaseVersionHeader},
};
