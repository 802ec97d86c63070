//! Synchronization rounds against one shared remote store.
//!
//! The engine owns one client's in-memory state (database, branches,
//! queued resolution artifacts) and runs the two halves of a sync
//! round: [`pull`](SyncEngine::pull) applies everything new from the
//! remote, [`push`](SyncEngine::push) publishes local changes as one
//! atomic transaction. All calls are synchronous and blocking; retry
//! and backoff policy belong to the caller.

use std::{collections::BTreeMap, fs, io, path::PathBuf};

use tracing::{debug, info};

use crate::{
    branch::{causal_order, Branches},
    database::{Database, DatabaseError},
    entry::{ChunkEntry, FileContent, MultiChunkEntry},
    file::FileHistory,
    ids::{ClientId, MultiChunkId},
    reconcile::{self, MergeReport},
    remote::{RemoteKind, RemoteRef, TransferError, TransferManager},
    transaction::{discard_pending, RemoteTransaction, TransactionAware, TransactionError},
    util,
    version::{DatabaseVersion, DatabaseVersionHeader},
    wire::{self, WireError},
};

/// Error running a sync round.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Database files appeared on the remote since the last pull.
    /// Recoverable: pull, then push again.
    #[error("remote changed since the last pull: {0:?}")]
    RemoteChanged(Vec<String>),
    /// A remote operation failed.
    #[error(transparent)]
    Transfer(#[from] TransferError),
    /// A database file could not be read or written.
    #[error(transparent)]
    Wire(#[from] WireError),
    /// Merging into the local database failed.
    #[error(transparent)]
    Database(#[from] DatabaseError),
    /// A remote transaction failed.
    #[error(transparent)]
    Transaction(#[from] TransactionError),
    /// Local staging I/O failed.
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// New local state to publish with [`SyncEngine::push`].
///
/// Filled by whatever indexes the local working tree: the entities
/// describing new content plus the packed multichunk files holding it.
#[derive(Debug, Default)]
pub struct Changeset {
    chunks: Vec<ChunkEntry>,
    multichunks: Vec<MultiChunkEntry>,
    contents: Vec<FileContent>,
    histories: Vec<FileHistory>,
    payloads: BTreeMap<MultiChunkId, PathBuf>,
}

impl Changeset {
    /// Create an empty changeset.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a chunk entry.
    pub fn add_chunk(&mut self, chunk: ChunkEntry) {
        self.chunks.push(chunk);
    }

    /// Add a multichunk entry together with the packed local file that
    /// holds its bytes and will be uploaded alongside the metadata.
    pub fn add_multichunk(&mut self, multichunk: MultiChunkEntry, payload: impl Into<PathBuf>) {
        self.payloads.insert(*multichunk.id(), payload.into());
        self.multichunks.push(multichunk);
    }

    /// Add a file content entry.
    pub fn add_content(&mut self, content: FileContent) {
        self.contents.push(content);
    }

    /// Add new file versions, as a partial history.
    pub fn add_history(&mut self, history: FileHistory) {
        self.histories.push(history);
    }

    /// Whether nothing was added.
    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
            && self.multichunks.is_empty()
            && self.contents.is_empty()
            && self.histories.is_empty()
            && self.payloads.is_empty()
    }
}

/// What a pull applied.
#[derive(Debug, Default)]
pub struct PullReport {
    /// Number of database versions merged in.
    pub applied: usize,
    /// Conflict resolution decisions taken while merging.
    pub report: MergeReport,
}

/// What a cleanup reclaimed.
#[derive(Debug, Default)]
pub struct CleanupReport {
    /// Stale own transactions that were rolled back.
    pub rolled_back: usize,
    /// Orphaned temp files that were removed.
    pub temps_removed: usize,
}

/// One client's synchronization engine.
///
/// State is in-memory only and rebuilt from the remote: a fresh engine
/// pulls its own published files like anyone else's, which also makes
/// a crash between remote commit and local bookkeeping harmless.
#[derive(Debug)]
pub struct SyncEngine<T> {
    client: ClientId,
    database: Database,
    branches: Branches,
    transfers: TransactionAware<T>,
    /// Resolution artifacts (branched histories, conflicted copy
    /// renames) queued for the next push.
    pending: Vec<FileHistory>,
}

impl<T: TransferManager> SyncEngine<T> {
    /// Create an engine for `client`, with a local staging directory.
    pub fn new(
        client: ClientId,
        transfers: T,
        staging: impl Into<PathBuf>,
    ) -> Result<Self, EngineError> {
        let transfers = TransactionAware::new(transfers, staging)?;
        Ok(Self {
            client,
            database: Database::new(),
            branches: Branches::new(),
            transfers,
            pending: Vec::new(),
        })
    }

    /// The client this engine syncs for.
    pub fn client(&self) -> &ClientId {
        &self.client
    }

    /// The merged local database.
    pub fn database(&self) -> &Database {
        &self.database
    }

    /// All known version headers, per client.
    pub fn branches(&self) -> &Branches {
        &self.branches
    }

    /// Whether resolution artifacts are waiting for the next push.
    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Apply every database version published since the last pull.
    ///
    /// Downloads unseen database files, orders their versions causally
    /// and merges them through conflict resolution. Anything resolution
    /// synthesizes (branched histories, conflicted copy renames) is
    /// queued and goes out with the next push.
    pub fn pull(&mut self) -> Result<PullReport, EngineError> {
        let unseen = self.unseen_databases()?;
        if unseen.is_empty() {
            return Ok(PullReport::default());
        }

        let mut candidates = Vec::new();
        for (name, reference) in unseen {
            let peek = self.transfers.staging().join(&name);
            self.transfers.download_committed(&reference, &peek)?;
            let versions = wire::load_all(&peek)?;
            let _ = fs::remove_file(&peek);
            for version in versions {
                let header = version.header();
                let known = self
                    .branches
                    .get(&header.client)
                    .and_then(|b| b.get(&header.vector_clock))
                    .is_some();
                if !known {
                    candidates.push(version);
                }
            }
        }
        candidates.sort_by(|a, b| causal_order(a.header(), b.header()));
        let headers: Vec<_> = candidates.iter().map(|v| v.header().clone()).collect();
        let applied = headers.len();
        debug!("pull: merging {applied} new database versions");

        let outcome = reconcile::merge_remote(&mut self.database, &self.client, candidates)?;
        for header in headers {
            self.branches.add(header);
        }
        if outcome.has_pending() {
            info!(
                "pull: queued {} resolution artifacts for the next push",
                outcome.pending.len()
            );
            self.pending.extend(outcome.pending);
        }
        Ok(PullReport {
            applied,
            report: outcome.report,
        })
    }

    /// Publish local changes as one atomic remote transaction.
    ///
    /// Fails with [`EngineError::RemoteChanged`] when another client
    /// published since the last pull; pull and push again. The local
    /// database is only updated after the commit went through, so a
    /// crash in between is recovered by the next pull, which re-reads
    /// the published file like any other.
    pub fn push(
        &mut self,
        changeset: Changeset,
    ) -> Result<Option<DatabaseVersionHeader>, EngineError> {
        let unseen = self.unseen_databases()?;
        if !unseen.is_empty() {
            return Err(EngineError::RemoteChanged(
                unseen.into_iter().map(|(name, _)| name).collect(),
            ));
        }
        if changeset.is_empty() && self.pending.is_empty() {
            return Ok(None);
        }

        let Changeset {
            chunks,
            multichunks,
            contents,
            histories,
            payloads,
        } = changeset;
        let header = self.database.next_header(&self.client, util::now_millis());
        let mut version = DatabaseVersion::new(header.clone());
        for chunk in chunks {
            version.add_chunk(chunk);
        }
        for multichunk in multichunks {
            version.add_multichunk(multichunk);
        }
        for content in contents {
            version.add_content(content);
        }
        for history in histories {
            version.add_history(history);
        }
        for history in &self.pending {
            version.add_history(history.clone());
        }
        // catch dangling references before anything leaves the machine
        self.database.validate(&version)?;

        let sequence = header.vector_clock.get(&self.client);
        let target = RemoteRef::database(self.client.clone(), sequence);
        let staged = self.transfers.staging().join(target.to_string());
        wire::save(&staged, [&version])?;

        let mut tx = RemoteTransaction::new(
            self.transfers.inner(),
            self.transfers.staging(),
            self.client.clone(),
        );
        tx.upload(&staged, target);
        for (id, payload) in payloads {
            tx.upload(payload, RemoteRef::multichunk(id));
        }
        info!("push: publishing {header} in {} actions", tx.len());
        tx.commit()?;
        let _ = fs::remove_file(&staged);

        self.database.insert(version)?;
        self.branches.add(header.clone());
        self.pending.clear();
        Ok(Some(header))
    }

    /// Finish a commit that was interrupted by a crash.
    ///
    /// Call before the first round of a session. Returns whether a
    /// pending transaction was found and driven to completion. The
    /// published version then comes back through the next [`pull`](Self::pull).
    pub fn resume_pending(&self) -> Result<bool, EngineError> {
        match RemoteTransaction::load_pending(self.transfers.inner(), self.transfers.staging())? {
            Some(tx) => {
                info!("resuming interrupted transaction {}", tx.id());
                tx.commit()?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Recover instead of resuming: undo own stale remote transactions,
    /// drop the local manifest of any interrupted commit and reclaim
    /// orphaned temp files.
    pub fn cleanup(&self) -> Result<CleanupReport, EngineError> {
        let rolled_back = self.transfers.rollback_client(&self.client)?;
        // a crash before the manifest upload leaves only this file; it
        // must go too, or a later resume would publish the stale batch
        discard_pending(self.transfers.staging())?;
        let temps_removed = self.transfers.remove_unreferenced_temps()?;
        if rolled_back > 0 || temps_removed > 0 {
            info!("cleanup: rolled back {rolled_back} transactions, removed {temps_removed} temps");
        }
        Ok(CleanupReport {
            rolled_back,
            temps_removed,
        })
    }

    /// Remote database files whose versions this engine has not seen.
    fn unseen_databases(&self) -> Result<Vec<(String, RemoteRef)>, EngineError> {
        let mut unseen = Vec::new();
        for (name, reference) in self.transfers.list_committed(RemoteKind::Database)? {
            let RemoteRef::Database { client, sequence } = &reference else {
                continue;
            };
            let seen = self
                .branches
                .get(client)
                .map(|b| b.iter().any(|h| h.vector_clock.get(client) == *sequence))
                .unwrap_or(false);
            if !seen {
                unseen.push((name, reference));
            }
        }
        Ok(unseen)
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use super::*;
    use crate::{
        file::{FileStatus, FileType, FileVersion},
        ids::{ChunkChecksum, FileChecksum, FileHistoryId},
        remote::local::LocalTransfer,
    };

    fn client(name: &str) -> ClientId {
        ClientId::new(name).unwrap()
    }

    fn engine(dir: &Path, name: &str) -> SyncEngine<LocalTransfer> {
        let store = LocalTransfer::new(dir.join("remote")).unwrap();
        SyncEngine::new(client(name), store, dir.join(name)).unwrap()
    }

    /// A changeset with one new file at `path`, including its packed
    /// multichunk payload on disk.
    fn single_file_changeset(
        dir: &Path,
        history: u8,
        path: &str,
        data: &[u8],
        updated: u64,
        author: &str,
    ) -> Changeset {
        let mut changeset = Changeset::new();
        let chunk = ChunkEntry::new(ChunkChecksum::of(data), data.len() as u64);
        let mut mc_id = [0u8; 20];
        mc_id.copy_from_slice(&chunk.checksum().as_bytes()[..20]);
        let multichunk =
            MultiChunkEntry::with_chunks(MultiChunkId::from_bytes(mc_id), [*chunk.checksum()]);
        let payload = dir.join(format!("mc-{history}-{updated}"));
        fs::write(&payload, data).unwrap();
        changeset.add_content(FileContent::with_chunks(
            FileChecksum::of(data),
            data.len() as u64,
            [*chunk.checksum()],
        ));
        changeset.add_multichunk(multichunk, payload);
        changeset.add_chunk(chunk);
        let mut history_obj = FileHistory::new(FileHistoryId::from_bytes([history; 20]));
        history_obj
            .add(FileVersion {
                version: 1,
                path: path.to_string(),
                file_type: FileType::File,
                status: FileStatus::New,
                size: data.len() as u64,
                last_modified: updated,
                updated,
                checksum: Some(FileChecksum::of(data)),
                created_by: Some(client(author)),
                link_target: None,
            })
            .unwrap();
        changeset.add_history(history_obj);
        changeset
    }

    #[test]
    fn test_push_names_files_by_own_counter() {
        let dir = tempfile::tempdir().unwrap();
        let mut alice = engine(dir.path(), "alice");

        let header = alice
            .push(single_file_changeset(
                dir.path(),
                1,
                "a.txt",
                b"one",
                1_000,
                "alice",
            ))
            .unwrap()
            .unwrap();
        assert_eq!(header.vector_clock.get(&client("alice")), 1);
        alice
            .push(single_file_changeset(
                dir.path(),
                2,
                "b.txt",
                b"two",
                2_000,
                "alice",
            ))
            .unwrap();

        let store = LocalTransfer::new(dir.path().join("remote")).unwrap();
        let names: Vec<_> = store
            .list(RemoteKind::Database)
            .unwrap()
            .into_keys()
            .collect();
        assert_eq!(names, vec!["db-alice-0000000001", "db-alice-0000000002"]);
        assert_eq!(store.list(RemoteKind::MultiChunk).unwrap().len(), 2);
    }

    #[test]
    fn test_push_without_changes_is_a_noop() {
        let dir = tempfile::tempdir().unwrap();
        let mut alice = engine(dir.path(), "alice");
        assert!(alice.push(Changeset::new()).unwrap().is_none());
        assert!(alice.database().is_empty());
    }

    #[test]
    fn test_push_detects_foreign_interleaving() {
        let dir = tempfile::tempdir().unwrap();
        let mut alice = engine(dir.path(), "alice");
        let mut bob = engine(dir.path(), "bob");

        bob.push(single_file_changeset(
            dir.path(),
            1,
            "b.txt",
            b"bob",
            1_000,
            "bob",
        ))
        .unwrap();

        let err = alice
            .push(single_file_changeset(
                dir.path(),
                2,
                "a.txt",
                b"alice",
                2_000,
                "alice",
            ))
            .unwrap_err();
        assert!(matches!(err, EngineError::RemoteChanged(_)));

        // pull resolves the interleaving, then the push goes through
        alice.pull().unwrap();
        alice
            .push(single_file_changeset(
                dir.path(),
                2,
                "a.txt",
                b"alice",
                2_000,
                "alice",
            ))
            .unwrap()
            .unwrap();
    }

    #[test]
    fn test_pull_merges_foreign_versions() {
        let dir = tempfile::tempdir().unwrap();
        let mut alice = engine(dir.path(), "alice");
        let mut bob = engine(dir.path(), "bob");

        bob.push(single_file_changeset(
            dir.path(),
            1,
            "b.txt",
            b"bob",
            1_000,
            "bob",
        ))
        .unwrap();

        let report = alice.pull().unwrap();
        assert_eq!(report.applied, 1);
        assert!(alice.database().history_at_path("b.txt").is_some());
        // a second pull finds nothing new
        assert_eq!(alice.pull().unwrap().applied, 0);
    }

    #[test]
    fn test_pushed_clock_carries_merged_knowledge() {
        let dir = tempfile::tempdir().unwrap();
        let mut alice = engine(dir.path(), "alice");
        let mut bob = engine(dir.path(), "bob");

        alice
            .push(single_file_changeset(
                dir.path(),
                1,
                "a.txt",
                b"a",
                1_000,
                "alice",
            ))
            .unwrap();
        bob.pull().unwrap();
        let header = bob
            .push(single_file_changeset(
                dir.path(),
                2,
                "b.txt",
                b"b",
                2_000,
                "bob",
            ))
            .unwrap()
            .unwrap();

        assert_eq!(header.vector_clock.get(&client("alice")), 1);
        assert_eq!(header.vector_clock.get(&client("bob")), 1);
    }
}
