//! Atomic, resumable batches of remote operations.
//!
//! The remote store has no transactions, so atomicity is staged: all
//! files first travel to parked temp locations, then a quick rename
//! pass swaps them live. A manifest describing every staged action is
//! published on the remote before anything else happens and deleted
//! after everything is done. Its presence is the whole signal: readers
//! ignore remote files named by a live manifest, and a client finding
//! its own manifest after a crash can finish (or undo) the batch from
//! the per action status it persisted locally along the way.

use std::{
    collections::BTreeSet,
    fs, io,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::{
    ids::ClientId,
    remote::{RemoteKind, RemoteRef, TransferError, TransferManager},
    util,
    wire::WireError,
};

/// Manifest file magic.
pub const MANIFEST_MAGIC: &[u8; 8] = b"cairntx1";

/// Name of the locally persisted manifest inside the staging directory.
const MANIFEST_FILE: &str = "transaction-manifest";

/// How far one staged action has progressed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActionStatus {
    /// Nothing happened on the remote yet.
    Unstarted,
    /// The file is parked at its temp location.
    Started,
    /// The action took its final effect.
    Done,
}

/// One staged remote operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransactionAction {
    /// Publish a local file at a final remote location.
    Upload {
        /// Local file to publish.
        source: PathBuf,
        /// Where the file goes live.
        target: RemoteRef,
        /// Parking spot until the batch commits.
        temp: RemoteRef,
        /// Progress of this action.
        status: ActionStatus,
    },
    /// Remove a remote file.
    Delete {
        /// The file to remove.
        target: RemoteRef,
        /// Parking spot holding the file until the batch commits,
        /// so the delete can still be undone.
        temp: RemoteRef,
        /// Progress of this action.
        status: ActionStatus,
    },
}

impl TransactionAction {
    fn status(&self) -> ActionStatus {
        match self {
            Self::Upload { status, .. } | Self::Delete { status, .. } => *status,
        }
    }

    fn set_status(&mut self, new: ActionStatus) {
        match self {
            Self::Upload { status, .. } | Self::Delete { status, .. } => *status = new,
        }
    }

    /// The final remote location this action affects.
    pub fn target(&self) -> &RemoteRef {
        match self {
            Self::Upload { target, .. } | Self::Delete { target, .. } => target,
        }
    }

    /// The temp location this action parks at.
    pub fn temp(&self) -> &RemoteRef {
        match self {
            Self::Upload { temp, .. } | Self::Delete { temp, .. } => temp,
        }
    }
}

/// The persisted description of a transaction.
///
/// The copy on the remote is written once, before any action runs, so
/// its statuses are always [`ActionStatus::Unstarted`]; progress is
/// only tracked in the client's local copy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionManifest {
    /// The client that authored the transaction.
    pub client: ClientId,
    /// Identifier, also the number in the remote manifest name.
    pub id: u64,
    /// The staged actions, in execution order.
    pub actions: Vec<TransactionAction>,
}

impl TransactionManifest {
    /// Serialize to the manifest format.
    pub fn encode(&self) -> Result<Vec<u8>, WireError> {
        let mut buf = Vec::new();
        buf.extend_from_slice(MANIFEST_MAGIC);
        buf.extend_from_slice(&postcard::to_allocvec(self)?);
        Ok(buf)
    }

    /// Parse from the manifest format.
    pub fn decode(bytes: &[u8]) -> Result<Self, WireError> {
        let payload = bytes
            .strip_prefix(MANIFEST_MAGIC)
            .ok_or(WireError::BadMagic)?;
        Ok(postcard::from_bytes(payload)?)
    }

    /// Whether no action has progressed beyond staging.
    pub fn all_unstarted(&self) -> bool {
        self.actions
            .iter()
            .all(|a| a.status() == ActionStatus::Unstarted)
    }
}

/// Error running or resuming a transaction.
#[derive(Debug, thiserror::Error)]
pub enum TransactionError {
    /// A remote operation failed. Retry the commit, it resumes.
    #[error(transparent)]
    Transfer(#[from] TransferError),
    /// A manifest failed to encode or decode.
    #[error(transparent)]
    Wire(#[from] WireError),
    /// Local staging I/O failed.
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// A staged batch of uploads and deletes against the remote store.
///
/// Build the batch with [`upload`](Self::upload) and
/// [`delete`](Self::delete), then run [`commit`](Self::commit). From
/// any reader's point of view the whole batch lands at once. A commit
/// interrupted by a crash continues where it stopped: recover it with
/// [`load_pending`](Self::load_pending) and commit again.
#[derive(Debug)]
pub struct RemoteTransaction<'a, T> {
    transfers: &'a T,
    staging: PathBuf,
    manifest: TransactionManifest,
    resumed: bool,
}

impl<'a, T: TransferManager> RemoteTransaction<'a, T> {
    /// Start an empty transaction for `client`.
    ///
    /// `staging` is the local directory where the manifest is persisted
    /// between status transitions.
    pub fn new(transfers: &'a T, staging: impl Into<PathBuf>, client: ClientId) -> Self {
        Self {
            transfers,
            staging: staging.into(),
            manifest: TransactionManifest {
                client,
                id: rand::random(),
                actions: Vec::new(),
            },
            resumed: false,
        }
    }

    /// Recover the transaction persisted in `staging`, if any.
    pub fn load_pending(
        transfers: &'a T,
        staging: impl Into<PathBuf>,
    ) -> Result<Option<Self>, TransactionError> {
        let staging = staging.into();
        let bytes = match fs::read(staging.join(MANIFEST_FILE)) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        let manifest = match TransactionManifest::decode(&bytes) {
            Ok(manifest) => manifest,
            Err(err) => {
                // an unreadable manifest cannot be resumed; its remote
                // leftovers are reclaimed by rollback and temp cleanup
                warn!("discarding unreadable local transaction manifest: {err}");
                discard_pending(&staging)?;
                return Ok(None);
            }
        };
        debug!(
            "recovered transaction {} with {} actions",
            manifest.id,
            manifest.actions.len()
        );
        Ok(Some(Self {
            transfers,
            staging,
            manifest,
            resumed: true,
        }))
    }

    /// The transaction identifier.
    pub fn id(&self) -> u64 {
        self.manifest.id
    }

    /// Number of staged actions.
    pub fn len(&self) -> usize {
        self.manifest.actions.len()
    }

    /// Whether nothing is staged.
    pub fn is_empty(&self) -> bool {
        self.manifest.actions.is_empty()
    }

    /// Stage an upload of a local file to a final remote location.
    pub fn upload(&mut self, source: impl Into<PathBuf>, target: RemoteRef) {
        self.manifest.actions.push(TransactionAction::Upload {
            source: source.into(),
            target,
            temp: RemoteRef::temp(rand::random()),
            status: ActionStatus::Unstarted,
        });
    }

    /// Stage a delete of a remote file.
    pub fn delete(&mut self, target: RemoteRef) {
        self.manifest.actions.push(TransactionAction::Delete {
            target,
            temp: RemoteRef::temp(rand::random()),
            status: ActionStatus::Unstarted,
        });
    }

    /// Run the batch to completion.
    ///
    /// The remote manifest goes up first; it is the commit point from
    /// which a crashed run can always be finished. Then every action is
    /// parked at its temp location, then all uploads are renamed live,
    /// then the remote manifest is deleted, which makes the transaction
    /// final. Already finished steps of a resumed transaction are
    /// skipped based on the locally persisted statuses.
    pub fn commit(mut self) -> Result<(), TransactionError> {
        if self.manifest.actions.is_empty() {
            self.discard_local()?;
            return Ok(());
        }
        let remote_manifest = RemoteRef::transaction(self.manifest.id);

        let mut announced = false;
        if self.resumed {
            announced = self
                .transfers
                .list(RemoteKind::Transaction)?
                .values()
                .any(|r| r == &remote_manifest);
            if !announced && !self.manifest.all_unstarted() {
                // the manifest is gone but actions had progressed: a
                // previous run got past the durability point, only the
                // temp cleanup is left
                debug!("transaction {} already final, cleaning up", self.manifest.id);
                self.cleanup_parked();
                self.discard_local()?;
                return Ok(());
            }
        }

        if !announced {
            self.persist_local()?;
            self.transfers
                .upload(&self.local_manifest_path(), &remote_manifest)?;
            debug!(
                "transaction {} announced with {} actions",
                self.manifest.id,
                self.manifest.actions.len()
            );
        }

        // park everything at its temp location
        for i in 0..self.manifest.actions.len() {
            if self.manifest.actions[i].status() != ActionStatus::Unstarted {
                continue;
            }
            match &self.manifest.actions[i] {
                TransactionAction::Upload { source, temp, .. } => {
                    self.transfers.upload(source, temp)?;
                }
                TransactionAction::Delete { target, temp, .. } => {
                    match self.transfers.rename(target, temp) {
                        Ok(()) => {}
                        Err(err) if err.is_not_found() => {
                            debug!("delete target {target} already gone");
                        }
                        Err(err) => return Err(err.into()),
                    }
                }
            }
            self.manifest.actions[i].set_status(ActionStatus::Started);
            self.persist_local()?;
        }

        // swap the uploads live
        for i in 0..self.manifest.actions.len() {
            let finalized = match &self.manifest.actions[i] {
                TransactionAction::Upload {
                    target,
                    temp,
                    status: ActionStatus::Started,
                    ..
                } => {
                    match self.transfers.rename(temp, target) {
                        Ok(()) => {}
                        Err(err) if err.is_not_found() => {
                            // renamed by a run that crashed before it
                            // could persist the status
                            debug!("upload {target} already finalized");
                        }
                        Err(err) => return Err(err.into()),
                    }
                    true
                }
                TransactionAction::Delete {
                    status: ActionStatus::Started,
                    ..
                } => true,
                _ => false,
            };
            if finalized {
                self.manifest.actions[i].set_status(ActionStatus::Done);
                self.persist_local()?;
            }
        }

        // the durability point: once the remote manifest is gone the
        // transaction is final and must not be rolled back
        self.transfers.delete(&remote_manifest)?;
        debug!("transaction {} committed", self.manifest.id);

        self.cleanup_parked();
        self.discard_local()?;
        Ok(())
    }

    /// Best-effort removal of the parked copies of deleted files.
    /// Anything left over is reclaimed by
    /// [`TransactionAware::remove_unreferenced_temps`].
    fn cleanup_parked(&self) {
        for action in &self.manifest.actions {
            if let TransactionAction::Delete { temp, .. } = action {
                if let Err(err) = self.transfers.delete(temp) {
                    warn!("could not clean up parked file {temp}: {err}");
                }
            }
        }
    }

    fn local_manifest_path(&self) -> PathBuf {
        self.staging.join(MANIFEST_FILE)
    }

    fn persist_local(&self) -> Result<(), TransactionError> {
        let bytes = self.manifest.encode()?;
        util::overwrite_and_sync(&self.local_manifest_path(), &bytes)?;
        Ok(())
    }

    fn discard_local(&self) -> Result<(), TransactionError> {
        match fs::remove_file(self.local_manifest_path()) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

/// Remove the locally persisted manifest, if any.
///
/// Used when the pending transaction was rolled back rather than
/// resumed. Returns whether a manifest existed.
pub fn discard_pending(staging: &Path) -> Result<bool, io::Error> {
    match fs::remove_file(staging.join(MANIFEST_FILE)) {
        Ok(()) => Ok(true),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(err) => Err(err),
    }
}

/// A view of the remote store that only shows committed state.
///
/// In-flight transactions are invisible: files their manifests are
/// about to publish are filtered out of listings, files they are about
/// to delete are still listed and still downloadable (from the parked
/// copy if the delete already ran). This is what makes a transaction
/// atomic for every other client.
#[derive(Debug)]
pub struct TransactionAware<T> {
    inner: T,
    staging: PathBuf,
}

impl<T: TransferManager> TransactionAware<T> {
    /// Wrap a transfer backend. `staging` is a local scratch directory.
    pub fn new(inner: T, staging: impl Into<PathBuf>) -> io::Result<Self> {
        let staging = staging.into();
        fs::create_dir_all(&staging)?;
        Ok(Self { inner, staging })
    }

    /// The raw, unfiltered backend.
    pub fn inner(&self) -> &T {
        &self.inner
    }

    /// The local scratch directory.
    pub fn staging(&self) -> &Path {
        &self.staging
    }

    /// Fetch and decode every live transaction manifest.
    ///
    /// Manifests that fail to decode are skipped with a warning; their
    /// leftovers are reclaimed through
    /// [`remove_unreferenced_temps`](Self::remove_unreferenced_temps).
    pub fn live_manifests(&self) -> Result<Vec<TransactionManifest>, TransactionError> {
        let mut manifests = Vec::new();
        for (name, reference) in self.inner.list(RemoteKind::Transaction)? {
            let peek = self.staging.join(format!("peek-{name}"));
            self.inner.download(&reference, &peek)?;
            let bytes = fs::read(&peek)?;
            let _ = fs::remove_file(&peek);
            match TransactionManifest::decode(&bytes) {
                Ok(manifest) => manifests.push(manifest),
                Err(err) => warn!("ignoring unreadable transaction manifest {name}: {err}"),
            }
        }
        Ok(manifests)
    }

    /// List remote files of one kind as a reader should see them:
    /// without files a live transaction is still publishing, with files
    /// a live transaction is deleting.
    pub fn list_committed(
        &self,
        kind: RemoteKind,
    ) -> Result<std::collections::BTreeMap<String, RemoteRef>, TransactionError> {
        let mut listing = self.inner.list(kind)?;
        for manifest in self.live_manifests()? {
            for action in &manifest.actions {
                match action {
                    TransactionAction::Upload { target, .. } if target.kind() == kind => {
                        listing.remove(&target.to_string());
                    }
                    TransactionAction::Delete { target, .. } if target.kind() == kind => {
                        listing.insert(target.to_string(), target.clone());
                    }
                    _ => {}
                }
            }
        }
        Ok(listing)
    }

    /// Download a committed file.
    ///
    /// Falls back to the parked copy when an in-flight delete already
    /// moved the file away.
    pub fn download_committed(
        &self,
        source: &RemoteRef,
        target: &Path,
    ) -> Result<(), TransactionError> {
        match self.inner.download(source, target) {
            Ok(()) => Ok(()),
            Err(err) if err.is_not_found() => {
                for manifest in self.live_manifests()? {
                    for action in &manifest.actions {
                        if let TransactionAction::Delete {
                            target: parked,
                            temp,
                            ..
                        } = action
                        {
                            if parked == source {
                                debug!(
                                    "{source} is parked by transaction {}, reading the temp copy",
                                    manifest.id
                                );
                                return Ok(self.inner.download(temp, target)?);
                            }
                        }
                    }
                }
                Err(err.into())
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Delete temp files no live manifest refers to.
    ///
    /// These are leftovers of transactions that finished (or were
    /// rolled back) without managing their best-effort cleanup.
    /// Returns how many files were removed.
    pub fn remove_unreferenced_temps(&self) -> Result<usize, TransactionError> {
        let mut referenced = BTreeSet::new();
        for manifest in self.live_manifests()? {
            for action in &manifest.actions {
                referenced.insert(action.temp().clone());
            }
        }
        let mut removed = 0;
        for reference in self.inner.list(RemoteKind::Temp)?.into_values() {
            if !referenced.contains(&reference) && self.inner.delete(&reference)? {
                debug!("removed orphaned temp file {reference}");
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Undo every live transaction authored by `client`.
    ///
    /// Uploads are undone by deleting the final and parked copies,
    /// deletes by moving the parked copy back. Used when a client
    /// decides to recover instead of resuming a crashed run. Returns
    /// how many transactions were rolled back.
    pub fn rollback_client(&self, client: &ClientId) -> Result<usize, TransactionError> {
        let mut rolled_back = 0;
        for manifest in self.live_manifests()? {
            if &manifest.client != client {
                continue;
            }
            debug!("rolling back transaction {} of {client}", manifest.id);
            for action in &manifest.actions {
                match action {
                    TransactionAction::Upload { target, temp, .. } => {
                        self.inner.delete(target)?;
                        self.inner.delete(temp)?;
                    }
                    TransactionAction::Delete { target, temp, .. } => {
                        match self.inner.rename(temp, target) {
                            Ok(()) => {}
                            Err(err) if err.is_not_found() => {
                                // the delete never got to park anything
                            }
                            Err(err) => return Err(err.into()),
                        }
                    }
                }
            }
            self.inner.delete(&RemoteRef::transaction(manifest.id))?;
            rolled_back += 1;
        }
        Ok(rolled_back)
    }
}
