use std::{cell::Cell, collections::BTreeMap, fs, io, path::Path, rc::Rc};

use anyhow::Result;
use cairn::{
    engine::EngineError,
    entry::{ChunkEntry, FileContent, MultiChunkEntry},
    file::{FileHistory, FileStatus, FileType, FileVersion},
    ids::{ChunkChecksum, FileChecksum, FileHistoryId, MultiChunkId},
    remote::{local::LocalTransfer, RemoteKind, RemoteRef, TransferError, TransferManager},
    version::{DatabaseVersion, DatabaseVersionHeader},
    wire, Changeset, ClientId, Database, SyncEngine, VectorClock,
};
use tracing::info;
use tracing_subscriber::{prelude::*, EnvFilter};

fn setup_logging() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::from_default_env())
        .try_init()
        .ok();
}

fn client(name: &str) -> ClientId {
    ClientId::new(name).unwrap()
}

/// An engine for `name` over the shared remote directory under `dir`.
fn engine(dir: &Path, name: &str) -> SyncEngine<LocalTransfer> {
    let store = LocalTransfer::new(dir.join("remote")).unwrap();
    SyncEngine::new(client(name), store, dir.join(name)).unwrap()
}

fn file_version(n: u64, path: &str, data: &[u8], updated: u64, author: &str) -> FileVersion {
    FileVersion {
        version: n,
        path: path.to_string(),
        file_type: FileType::File,
        status: if n == 1 {
            FileStatus::New
        } else {
            FileStatus::Changed
        },
        size: data.len() as u64,
        last_modified: updated,
        updated,
        checksum: Some(FileChecksum::of(data)),
        created_by: Some(client(author)),
        link_target: None,
    }
}

/// A changeset carrying version `n` of the file at `path`, with the
/// entities for its content and the packed payload written to disk.
fn file_changeset(
    dir: &Path,
    history: u8,
    n: u64,
    path: &str,
    data: &[u8],
    updated: u64,
    author: &str,
) -> Changeset {
    let mut changeset = Changeset::new();
    let chunk = ChunkEntry::new(ChunkChecksum::of(data), data.len() as u64);
    let mut mc_id = [0u8; 20];
    mc_id.copy_from_slice(&chunk.checksum().as_bytes()[..20]);
    let payload = dir.join(format!("payload-{history}-{n}"));
    fs::write(&payload, data).unwrap();
    changeset.add_content(FileContent::with_chunks(
        FileChecksum::of(data),
        data.len() as u64,
        [*chunk.checksum()],
    ));
    changeset.add_multichunk(
        MultiChunkEntry::with_chunks(MultiChunkId::from_bytes(mc_id), [*chunk.checksum()]),
        payload,
    );
    changeset.add_chunk(chunk);
    let mut partial = FileHistory::new(FileHistoryId::from_bytes([history; 20]));
    partial.add(file_version(n, path, data, updated, author)).unwrap();
    changeset.add_history(partial);
    changeset
}

fn new_file(dir: &Path, history: u8, path: &str, data: &[u8], updated: u64, author: &str) -> Changeset {
    file_changeset(dir, history, 1, path, data, updated, author)
}

fn change_file(
    dir: &Path,
    history: u8,
    n: u64,
    path: &str,
    data: &[u8],
    updated: u64,
    author: &str,
) -> Changeset {
    file_changeset(dir, history, n, path, data, updated, author)
}

/// The live tree as (path, content checksum) pairs.
fn tree(db: &Database) -> BTreeMap<String, Option<FileChecksum>> {
    db.live_paths()
        .map(|(path, id)| {
            let checksum = db
                .file_history(id)
                .and_then(|h| h.last())
                .and_then(|v| v.checksum);
            (path.clone(), checksum)
        })
        .collect()
}

/// A full database version by `author`: the given partial histories
/// (`(history byte, [(version, path, data, updated, author)])`) plus
/// entities for every referenced checksum.
fn remote_version(
    author: &str,
    clock: &[(&str, u64)],
    timestamp: u64,
    histories: Vec<(u8, Vec<(u64, &str, &[u8], u64, &str)>)>,
) -> DatabaseVersion {
    let header = DatabaseVersionHeader {
        client: client(author),
        timestamp,
        vector_clock: clock
            .iter()
            .map(|(name, value)| (client(name), *value))
            .collect::<VectorClock>(),
    };
    let mut version = DatabaseVersion::new(header);
    for (id_byte, file_versions) in histories {
        let mut history = FileHistory::new(FileHistoryId::from_bytes([id_byte; 20]));
        for (n, path, data, updated, who) in file_versions {
            let chunk = ChunkEntry::new(ChunkChecksum::of(data), data.len() as u64);
            let mut mc_id = [0u8; 20];
            mc_id.copy_from_slice(&chunk.checksum().as_bytes()[..20]);
            version.add_multichunk(MultiChunkEntry::with_chunks(
                MultiChunkId::from_bytes(mc_id),
                [*chunk.checksum()],
            ));
            version.add_content(FileContent::with_chunks(
                FileChecksum::of(data),
                data.len() as u64,
                [*chunk.checksum()],
            ));
            version.add_chunk(chunk);
            history.add(file_version(n, path, data, updated, who)).unwrap();
        }
        version.add_history(history);
    }
    version
}

/// Publish a database version directly, bypassing the engine. This is
/// how the tests stage genuinely concurrent remote state, which the
/// engine's own interleaving guard would refuse to create.
fn publish_raw(dir: &Path, version: &DatabaseVersion) -> Result<()> {
    let store = LocalTransfer::new(dir.join("remote"))?;
    let header = version.header();
    let sequence = header.vector_clock.get(&header.client);
    let staged = dir.join(format!("raw-{}-{sequence}", header.client));
    wire::save(&staged, [version])?;
    store.upload(&staged, &RemoteRef::database(header.client.clone(), sequence))?;
    Ok(())
}

/// A transfer backend that fails one mutating operation on command.
///
/// Reads always succeed. [`fail_after`](Self::fail_after) arms a fuse
/// that lets `n` mutating operations (uploads, renames, deletes) through
/// and fails the next one, simulating a crash mid transaction.
#[derive(Debug, Clone)]
struct FlakyStore {
    inner: LocalTransfer,
    fuse: Rc<Cell<Option<u32>>>,
}

impl FlakyStore {
    fn new(root: &Path) -> Self {
        Self {
            inner: LocalTransfer::new(root).unwrap(),
            fuse: Rc::new(Cell::new(None)),
        }
    }

    /// Let `n` more mutating operations through, then fail one.
    fn fail_after(&self, n: u32) {
        self.fuse.set(Some(n));
    }

    fn tick(&self) -> Result<(), TransferError> {
        match self.fuse.get() {
            Some(0) => {
                self.fuse.set(None);
                Err(TransferError::Io(io::Error::other("injected crash")))
            }
            Some(n) => {
                self.fuse.set(Some(n - 1));
                Ok(())
            }
            None => Ok(()),
        }
    }
}

impl TransferManager for FlakyStore {
    fn list(&self, kind: RemoteKind) -> Result<BTreeMap<String, RemoteRef>, TransferError> {
        self.inner.list(kind)
    }

    fn upload(&self, source: &Path, target: &RemoteRef) -> Result<(), TransferError> {
        self.tick()?;
        self.inner.upload(source, target)
    }

    fn download(&self, source: &RemoteRef, target: &Path) -> Result<(), TransferError> {
        self.inner.download(source, target)
    }

    fn rename(&self, source: &RemoteRef, target: &RemoteRef) -> Result<(), TransferError> {
        self.tick()?;
        self.inner.rename(source, target)
    }

    fn delete(&self, target: &RemoteRef) -> Result<bool, TransferError> {
        self.tick()?;
        self.inner.delete(target)
    }
}

/// An engine over a fault-injecting store, plus a handle to arm it.
fn flaky_engine(dir: &Path, name: &str) -> (SyncEngine<FlakyStore>, FlakyStore) {
    let store = FlakyStore::new(&dir.join("remote"));
    let handle = store.clone();
    let engine = SyncEngine::new(client(name), store, dir.join(name)).unwrap();
    (engine, handle)
}

/// A file created on one client appears on the other, and both end up
/// with the same tree and full knowledge of each other's versions.
#[test]
fn sync_two_clients_converge() -> Result<()> {
    setup_logging();
    let dir = tempfile::tempdir()?;
    let mut alice = engine(dir.path(), "alice");
    let mut bob = engine(dir.path(), "bob");

    alice.push(new_file(dir.path(), 1, "docs/report.txt", b"quarterly numbers", 1_000, "alice"))?;
    bob.pull()?;
    bob.push(new_file(dir.path(), 2, "notes.md", b"reviewed", 2_000, "bob"))?;
    alice.pull()?;

    assert_eq!(tree(alice.database()), tree(bob.database()));
    assert_eq!(tree(alice.database()).len(), 2);
    assert_eq!(alice.database().clock().get(&client("bob")), 1);
    assert_eq!(bob.database().clock().get(&client("alice")), 1);
    Ok(())
}

/// An edit made on one client extends the file's history everywhere.
#[test]
fn sync_edit_extends_the_history() -> Result<()> {
    setup_logging();
    let dir = tempfile::tempdir()?;
    let mut alice = engine(dir.path(), "alice");
    let mut bob = engine(dir.path(), "bob");

    alice.push(new_file(dir.path(), 1, "notes.md", b"draft", 1_000, "alice"))?;
    bob.pull()?;
    bob.push(change_file(dir.path(), 1, 2, "notes.md", b"final", 2_000, "bob"))?;
    alice.pull()?;

    let history = alice.database().history_at_path("notes.md").expect("history");
    assert_eq!(history.len(), 2);
    assert_eq!(
        history.last().unwrap().checksum,
        Some(FileChecksum::of(b"final"))
    );
    assert_eq!(history.last().unwrap().created_by, Some(client("bob")));
    assert_eq!(tree(alice.database()), tree(bob.database()));
    Ok(())
}

/// Two clients create the same path concurrently: the earlier edit keeps
/// the name, the later one is renamed to a conflicted copy, and a
/// newcomer who reads everything computes the identical tree.
#[test]
fn sync_concurrent_create_yields_conflicted_copy() -> Result<()> {
    setup_logging();
    let dir = tempfile::tempdir()?;
    let mut alice = engine(dir.path(), "alice");

    alice.push(new_file(dir.path(), 1, "todo.txt", b"alice's list", 1_000, "alice"))?;
    // bob published concurrently, unaware of alice's version
    publish_raw(
        dir.path(),
        &remote_version(
            "bob",
            &[("bob", 1)],
            2,
            vec![(2, vec![(1, "todo.txt", b"bob's list", 2_000, "bob")])],
        ),
    )?;

    let report = alice.pull()?;
    assert_eq!(report.applied, 1);
    assert_eq!(report.report.renamed.len(), 1);

    // alice keeps her earlier version at the contested path
    let winner = alice.database().history_at_path("todo.txt").expect("winner");
    assert_eq!(
        winner.last().unwrap().checksum,
        Some(FileChecksum::of(b"alice's list"))
    );
    let paths: Vec<_> = tree(alice.database()).into_keys().collect();
    assert!(paths.iter().any(|p| p.contains("bob's conflicted copy")));

    // the rename goes out with the next push; a fresh third client then
    // arrives at the same tree without resolving anything itself
    assert!(alice.has_pending());
    alice.push(Changeset::new())?.expect("amendment publishes");
    let mut carol = engine(dir.path(), "carol");
    carol.pull()?;
    assert_eq!(tree(carol.database()), tree(alice.database()));
    assert!(!carol.has_pending());
    Ok(())
}

/// Two clients extend the same history concurrently. The earlier edit
/// wins everywhere; the loser's own work is branched aside as a
/// conflicted copy rather than lost.
#[test]
fn sync_divergent_history_branches_the_losing_suffix() -> Result<()> {
    setup_logging();
    let dir = tempfile::tempdir()?;
    let mut alice = engine(dir.path(), "alice");

    alice.push(new_file(dir.path(), 1, "notes.md", b"draft", 1_000, "alice"))?;
    alice.push(change_file(dir.path(), 1, 2, "notes.md", b"alice's final", 3_000, "alice"))?;
    // bob extended version 1 concurrently, with an earlier stamp
    publish_raw(
        dir.path(),
        &remote_version(
            "bob",
            &[("alice", 1), ("bob", 1)],
            2,
            vec![(1, vec![(2, "notes.md", b"bob's final", 2_000, "bob")])],
        ),
    )?;

    let report = alice.pull()?;
    assert_eq!(report.report.branched.len(), 1);

    // bob's earlier edit owns the history now
    let history = alice.database().history_at_path("notes.md").expect("history");
    assert_eq!(
        history.last().unwrap().checksum,
        Some(FileChecksum::of(b"bob's final"))
    );
    // alice's displaced edit survives under a conflicted name
    let paths: Vec<_> = tree(alice.database()).into_keys().collect();
    assert!(paths.iter().any(|p| p.contains("alice's conflicted copy")));

    alice.push(Changeset::new())?.expect("branch publishes");
    let mut carol = engine(dir.path(), "carol");
    carol.pull()?;
    assert_eq!(tree(carol.database()), tree(alice.database()));
    Ok(())
}

/// A crash while files are still being parked leaves nothing visible to
/// other clients; resuming finishes the publish exactly as staged.
#[test]
fn sync_crash_while_parking_is_atomic() -> Result<()> {
    setup_logging();
    let dir = tempfile::tempdir()?;
    let (mut alice, store) = flaky_engine(dir.path(), "alice");
    let mut bob = engine(dir.path(), "bob");

    // the manifest and the first parked file make it out, then the crash
    store.fail_after(2);
    let err = alice
        .push(new_file(dir.path(), 1, "big.bin", b"payload bytes", 1_000, "alice"))
        .unwrap_err();
    assert!(matches!(err, EngineError::Transaction(_)));

    // nothing of the half-published batch is visible
    assert_eq!(bob.pull()?.applied, 0);
    assert!(bob.database().is_empty());

    info!("resuming the interrupted push");
    assert!(alice.resume_pending()?);
    assert_eq!(bob.pull()?.applied, 1);
    assert!(bob.database().history_at_path("big.bin").is_some());

    // the remote is clean again
    let raw = LocalTransfer::new(dir.path().join("remote"))?;
    assert!(raw.list(RemoteKind::Transaction)?.is_empty());
    assert!(raw.list(RemoteKind::Temp)?.is_empty());

    // alice reads her own file back like anyone else and continues
    assert_eq!(alice.pull()?.applied, 1);
    let header = alice
        .push(new_file(dir.path(), 2, "second.txt", b"more", 2_000, "alice"))?
        .expect("push");
    assert_eq!(header.vector_clock.get(&client("alice")), 2);
    Ok(())
}

/// A crash after the database file already sits at its final name still
/// keeps the batch invisible while the manifest lives, and resuming
/// completes it without re-running finished steps.
#[test]
fn sync_crash_mid_publish_stays_invisible() -> Result<()> {
    setup_logging();
    let dir = tempfile::tempdir()?;
    let (mut alice, store) = flaky_engine(dir.path(), "alice");
    let mut bob = engine(dir.path(), "bob");

    // everything parked and the database file renamed live; the payload
    // rename fails
    store.fail_after(4);
    let err = alice
        .push(new_file(dir.path(), 1, "big.bin", b"payload bytes", 1_000, "alice"))
        .unwrap_err();
    assert!(matches!(err, EngineError::Transaction(_)));

    // the database file is physically present at its final name
    let raw = LocalTransfer::new(dir.path().join("remote"))?;
    assert_eq!(raw.list(RemoteKind::Database)?.len(), 1);
    // but committed readers do not see it
    assert_eq!(bob.pull()?.applied, 0);

    assert!(alice.resume_pending()?);
    assert_eq!(bob.pull()?.applied, 1);
    assert_eq!(raw.list(RemoteKind::MultiChunk)?.len(), 1);
    assert!(raw.list(RemoteKind::Transaction)?.is_empty());
    assert!(raw.list(RemoteKind::Temp)?.is_empty());
    Ok(())
}

/// Instead of resuming, a client can roll its crashed transaction back
/// and publish afresh.
#[test]
fn sync_cleanup_rolls_back_a_crashed_push() -> Result<()> {
    setup_logging();
    let dir = tempfile::tempdir()?;
    let (mut alice, store) = flaky_engine(dir.path(), "alice");

    // crash with the manifest live and both files parked
    store.fail_after(3);
    let err = alice
        .push(new_file(dir.path(), 1, "a.txt", b"one", 1_000, "alice"))
        .unwrap_err();
    assert!(matches!(err, EngineError::Transaction(_)));

    let report = alice.cleanup()?;
    assert_eq!(report.rolled_back, 1);
    assert!(!alice.resume_pending()?);
    let raw = LocalTransfer::new(dir.path().join("remote"))?;
    assert!(raw.list(RemoteKind::Database)?.is_empty());
    assert!(raw.list(RemoteKind::Temp)?.is_empty());
    assert!(raw.list(RemoteKind::Transaction)?.is_empty());

    // the same change publishes cleanly afterwards
    alice
        .push(new_file(dir.path(), 1, "a.txt", b"one", 1_000, "alice"))?
        .expect("push");
    assert_eq!(raw.list(RemoteKind::Database)?.len(), 1);
    Ok(())
}

/// A crash before the transaction is even announced leaves only the
/// local manifest; cleanup must drop it so a later resume cannot
/// publish the stale batch.
#[test]
fn sync_cleanup_discards_an_unannounced_batch() -> Result<()> {
    setup_logging();
    let dir = tempfile::tempdir()?;
    let (mut alice, store) = flaky_engine(dir.path(), "alice");

    store.fail_after(0);
    alice
        .push(new_file(dir.path(), 1, "a.txt", b"one", 1_000, "alice"))
        .unwrap_err();

    let report = alice.cleanup()?;
    assert_eq!(report.rolled_back, 0);
    assert!(!alice.resume_pending()?);
    Ok(())
}

/// Three clients each contribute a file; after a round of pulls all
/// trees and knowledge clocks are identical.
#[test]
fn sync_three_client_mesh() -> Result<()> {
    setup_logging();
    let dir = tempfile::tempdir()?;
    let mut alice = engine(dir.path(), "alice");
    let mut bob = engine(dir.path(), "bob");
    let mut carol = engine(dir.path(), "carol");

    alice.push(new_file(dir.path(), 1, "a.txt", b"from alice", 1_000, "alice"))?;
    bob.pull()?;
    bob.push(new_file(dir.path(), 2, "b.txt", b"from bob", 2_000, "bob"))?;
    carol.pull()?;
    carol.push(new_file(dir.path(), 3, "c.txt", b"from carol", 3_000, "carol"))?;
    alice.pull()?;
    bob.pull()?;

    let reference = tree(alice.database());
    assert_eq!(reference.len(), 3);
    assert_eq!(tree(bob.database()), reference);
    assert_eq!(tree(carol.database()), reference);
    for peer in [&alice, &bob, &carol] {
        for name in ["alice", "bob", "carol"] {
            assert_eq!(peer.database().clock().get(&client(name)), 1);
        }
    }
    Ok(())
}

/// Engine state is rebuilt entirely from the remote: a restarted client
/// re-reads its own published files and continues its sequence.
#[test]
fn sync_restart_rebuilds_from_the_remote() -> Result<()> {
    setup_logging();
    let dir = tempfile::tempdir()?;
    let mut alice = engine(dir.path(), "alice");
    alice.push(new_file(dir.path(), 1, "a.txt", b"one", 1_000, "alice"))?;
    alice.push(change_file(dir.path(), 1, 2, "a.txt", b"two", 2_000, "alice"))?;
    drop(alice);

    let mut restarted = engine(dir.path(), "alice");
    assert_eq!(restarted.pull()?.applied, 2);
    let history = restarted
        .database()
        .history_at_path("a.txt")
        .expect("history");
    assert_eq!(history.len(), 2);
    assert_eq!(history.last().unwrap().checksum, Some(FileChecksum::of(b"two")));

    let header = restarted
        .push(new_file(dir.path(), 2, "b.txt", b"three", 3_000, "alice"))?
        .expect("push");
    assert_eq!(header.vector_clock.get(&client("alice")), 3);
    Ok(())
}
