//! The local database: every known version plus the merged full view.

use std::collections::BTreeMap;

use tracing::debug;

use crate::{
    clock::VectorClock,
    entry::{ChunkEntry, FileContent, MultiChunkEntry},
    file::{FileHistory, FileVersion, HistoryError},
    ids::{ChunkChecksum, ClientId, FileChecksum, FileHistoryId, MultiChunkId},
    version::{DatabaseVersion, DatabaseVersionHeader},
};

/// Error inserting into or amending a [`Database`].
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    /// A multichunk claims to pack a chunk that is nowhere to be found.
    #[error("multichunk {multichunk} references unknown chunk {chunk}")]
    MissingChunkInMultiChunk {
        /// The multichunk holding the dangling reference.
        multichunk: MultiChunkId,
        /// The unknown chunk.
        chunk: ChunkChecksum,
    },
    /// A file content references a chunk that is nowhere to be found.
    #[error("content {content} references unknown chunk {chunk}")]
    MissingChunkInContent {
        /// The content holding the dangling reference.
        content: FileChecksum,
        /// The unknown chunk.
        chunk: ChunkChecksum,
    },
    /// A file version references a content that is nowhere to be found.
    #[error("history {history:?} references unknown content {checksum}")]
    MissingContent {
        /// The history holding the dangling reference.
        history: FileHistoryId,
        /// The unknown content.
        checksum: FileChecksum,
    },
    /// Overlapping version numbers with different content: the caller
    /// must run conflict resolution before inserting.
    #[error("history {history:?} diverges at version {version}; reconcile before inserting")]
    Divergent {
        /// The diverging history.
        history: FileHistoryId,
        /// First version number that differs.
        version: u64,
    },
    /// A history contract was violated.
    #[error(transparent)]
    History(#[from] HistoryError),
}

/// The merged view across all inserted versions.
#[derive(Debug, Default)]
struct FullView {
    chunks: BTreeMap<ChunkChecksum, ChunkEntry>,
    multichunks: BTreeMap<MultiChunkId, MultiChunkEntry>,
    contents: BTreeMap<FileChecksum, FileContent>,
    histories: BTreeMap<FileHistoryId, FileHistory>,
    /// Which multichunk each chunk is packed in.
    chunk_index: BTreeMap<ChunkChecksum, MultiChunkId>,
}

/// The database one client keeps in memory: an ordered list of database
/// versions plus the merged view across all of them.
///
/// One instance per client session, owned by whoever drives the sync
/// round. Entities merge by identity, so inserting the same version twice
/// changes nothing in the full view.
#[derive(Debug, Default)]
pub struct Database {
    versions: BTreeMap<u64, DatabaseVersion>,
    full: FullView,
    /// Pointwise maximum over the clocks of all inserted versions.
    clock: VectorClock,
    /// Live path to the history owning it. Histories whose last version
    /// is terminal are not listed.
    path_cache: BTreeMap<String, FileHistoryId>,
}

impl Database {
    /// Create an empty database.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of inserted database versions.
    pub fn len(&self) -> usize {
        self.versions.len()
    }

    /// Whether no version was inserted yet.
    pub fn is_empty(&self) -> bool {
        self.versions.is_empty()
    }

    /// The version stored under the given local sequence number.
    pub fn get(&self, sequence: u64) -> Option<&DatabaseVersion> {
        self.versions.get(&sequence)
    }

    /// Iterate over `(sequence, version)` in insertion order.
    pub fn versions(&self) -> impl Iterator<Item = (&u64, &DatabaseVersion)> {
        self.versions.iter()
    }

    /// The header of the most recently inserted version.
    pub fn last_header(&self) -> Option<&DatabaseVersionHeader> {
        self.versions.values().next_back().map(|v| v.header())
    }

    /// Everything this database has seen, as one clock: the pointwise
    /// maximum over the clocks of all inserted versions.
    pub fn clock(&self) -> &VectorClock {
        &self.clock
    }

    /// The header for the next locally authored version.
    ///
    /// The first version a client ever creates gets `{client: 1}`; after
    /// that the merged knowledge of all inserted versions is carried
    /// forward with the own axis bumped by one. Starting from the merged
    /// clock rather than the last inserted version's keeps the own axis
    /// strictly increasing even when a straggling foreign version with an
    /// old view of this client arrives late. Foreign axes only advance
    /// when foreign versions are inserted.
    pub fn next_header(&self, client: &ClientId, timestamp: u64) -> DatabaseVersionHeader {
        let mut vector_clock = self.clock.clone();
        let next = vector_clock.get(client) + 1;
        vector_clock.set(client.clone(), next);
        DatabaseVersionHeader {
            client: client.clone(),
            timestamp,
            vector_clock,
        }
    }

    /// Check that `version` could be inserted right now.
    ///
    /// Verifies that every reference resolves (within the version itself
    /// or the database) and that its histories extend the known ones
    /// without diverging or resurrecting terminated files.
    pub fn validate(&self, version: &DatabaseVersion) -> Result<(), DatabaseError> {
        self.validate_entities(version)?;
        for history in version.histories() {
            if let Some(existing) = self.full.histories.get(history.id()) {
                for file_version in history.versions() {
                    if let Some(ours) = existing.get(file_version.version) {
                        if ours != file_version {
                            return Err(DatabaseError::Divergent {
                                history: *history.id(),
                                version: file_version.version,
                            });
                        }
                    }
                }
                if let Some(last) = existing.last() {
                    if last.status.is_terminal()
                        && history.versions().any(|v| v.version > last.version)
                    {
                        return Err(HistoryError::Terminated {
                            history: *history.id(),
                            last: last.version,
                        }
                        .into());
                    }
                }
            }
        }
        Ok(())
    }

    /// Check that every chunk, multichunk and content `version` refers
    /// to is carried by the version itself or already known.
    pub(crate) fn validate_entities(
        &self,
        version: &DatabaseVersion,
    ) -> Result<(), DatabaseError> {
        let chunk_known =
            |c: &ChunkChecksum| version.chunk(c).is_some() || self.full.chunks.contains_key(c);
        for multichunk in version.multichunks() {
            for chunk in multichunk.chunks() {
                if !chunk_known(chunk) {
                    return Err(DatabaseError::MissingChunkInMultiChunk {
                        multichunk: *multichunk.id(),
                        chunk: *chunk,
                    });
                }
            }
        }
        for content in version.contents() {
            for chunk in content.chunks() {
                if !chunk_known(chunk) {
                    return Err(DatabaseError::MissingChunkInContent {
                        content: *content.checksum(),
                        chunk: *chunk,
                    });
                }
            }
        }
        for history in version.histories() {
            for file_version in history.versions() {
                if let Some(checksum) = &file_version.checksum {
                    let known = version.content(checksum).is_some()
                        || self.full.contents.contains_key(checksum);
                    if !known {
                        return Err(DatabaseError::MissingContent {
                            history: *history.id(),
                            checksum: *checksum,
                        });
                    }
                }
            }
        }
        Ok(())
    }

    /// Insert a version, assigning the next local sequence number.
    ///
    /// All entities merge into the full view by identity; re-inserting
    /// known entities is a no-op there. Validation runs first, so a
    /// failed insert leaves the database untouched.
    pub fn insert(&mut self, version: DatabaseVersion) -> Result<u64, DatabaseError> {
        self.validate(&version)?;

        for chunk in version.chunks() {
            self.full
                .chunks
                .entry(*chunk.checksum())
                .or_insert_with(|| chunk.clone());
        }
        for multichunk in version.multichunks() {
            for chunk in multichunk.chunks() {
                self.full.chunk_index.entry(*chunk).or_insert(*multichunk.id());
            }
            self.full
                .multichunks
                .entry(*multichunk.id())
                .or_insert_with(|| multichunk.clone());
        }
        for content in version.contents() {
            self.full
                .contents
                .entry(*content.checksum())
                .or_insert_with(|| content.clone());
        }
        let touched: Vec<FileHistoryId> = version.histories().map(|h| *h.id()).collect();
        for history in version.histories() {
            self.merge_history(history);
        }
        for id in touched {
            self.refresh_path(&id);
        }
        self.clock.merge(&version.header().vector_clock);

        let sequence = self.versions.keys().next_back().copied().unwrap_or(0) + 1;
        debug!(
            "inserted database version {} as sequence {sequence}",
            version.header()
        );
        self.versions.insert(sequence, version);
        Ok(sequence)
    }

    fn merge_history(&mut self, history: &FileHistory) {
        match self.full.histories.get_mut(history.id()) {
            Some(existing) => {
                existing.merge_versions(history);
            }
            None => {
                self.full.histories.insert(*history.id(), history.clone());
            }
        }
    }

    /// Bring the path cache in line with a history's current last version.
    fn refresh_path(&mut self, id: &FileHistoryId) {
        // drop whatever this history currently claims
        let mut vacated = Vec::new();
        self.path_cache.retain(|path, owner| {
            let keep = owner != id;
            if !keep {
                vacated.push(path.clone());
            }
            keep
        });
        if let Some(last) = self.full.histories.get(id).and_then(|h| h.last()) {
            if !last.status.is_terminal() {
                // on a path collision the last merged history wins the cache
                // slot until conflict resolution renames one of the two
                vacated.retain(|path| path != &last.path);
                self.path_cache.insert(last.path.clone(), *id);
            }
        }
        // a vacated path may still belong to another live history, say the
        // winner of a collision whose loser was just demoted off the path
        for path in vacated {
            if let Some(owner) = self.live_owner_at(&path) {
                self.path_cache.insert(path, owner);
            }
        }
    }

    /// A live history whose last version sits at `path`, if any.
    fn live_owner_at(&self, path: &str) -> Option<FileHistoryId> {
        self.full.histories.values().find_map(|history| {
            history
                .last()
                .filter(|last| !last.status.is_terminal() && last.path == path)
                .map(|_| *history.id())
        })
    }

    /// Adopt a history created by conflict resolution (a branched copy).
    pub(crate) fn adopt_history(&mut self, history: FileHistory) {
        let id = *history.id();
        self.merge_history(&history);
        self.refresh_path(&id);
    }

    /// Append one resolved version to a history in the full view.
    pub(crate) fn append_version(
        &mut self,
        id: &FileHistoryId,
        version: FileVersion,
    ) -> Result<(), DatabaseError> {
        let Some(history) = self.full.histories.get_mut(id) else {
            // appending to an unknown history is a caller bug
            return Err(HistoryError::NonMonotonic {
                history: *id,
                last: 0,
                got: version.version,
            }
            .into());
        };
        history.add(version)?;
        self.refresh_path(id);
        Ok(())
    }

    /// Drop every version numbered `at` or higher from a history in the
    /// full view. Returns the removed versions.
    pub(crate) fn truncate_history(&mut self, id: &FileHistoryId, at: u64) -> Vec<FileVersion> {
        let removed = match self.full.histories.get_mut(id) {
            Some(history) => history.truncate_from(at),
            None => Vec::new(),
        };
        if self
            .full
            .histories
            .get(id)
            .map(|h| h.is_empty())
            .unwrap_or(false)
        {
            self.full.histories.remove(id);
        }
        self.refresh_path(id);
        removed
    }

    /// The chunk with the given checksum, across all versions.
    pub fn chunk(&self, checksum: &ChunkChecksum) -> Option<&ChunkEntry> {
        self.full.chunks.get(checksum)
    }

    /// The multichunk with the given id, across all versions.
    pub fn multichunk(&self, id: &MultiChunkId) -> Option<&MultiChunkEntry> {
        self.full.multichunks.get(id)
    }

    /// The multichunk a chunk is packed in, across all versions.
    pub fn multichunk_for_chunk(&self, checksum: &ChunkChecksum) -> Option<&MultiChunkId> {
        self.full.chunk_index.get(checksum)
    }

    /// The file content with the given checksum, across all versions.
    pub fn content(&self, checksum: &FileChecksum) -> Option<&FileContent> {
        self.full.contents.get(checksum)
    }

    /// The glued history with the given id.
    pub fn file_history(&self, id: &FileHistoryId) -> Option<&FileHistory> {
        self.full.histories.get(id)
    }

    /// Iterate over all glued histories in id order.
    pub fn file_histories(&self) -> impl Iterator<Item = &FileHistory> {
        self.full.histories.values()
    }

    /// The history currently owning `path`, if the file is live.
    pub fn history_at_path(&self, path: &str) -> Option<&FileHistory> {
        self.path_cache
            .get(path)
            .and_then(|id| self.full.histories.get(id))
    }

    /// Iterate over `(path, history id)` for every live file.
    pub fn live_paths(&self) -> impl Iterator<Item = (&String, &FileHistoryId)> {
        self.path_cache.iter()
    }

    /// Histories whose current last version has the given checksum.
    pub fn histories_with_file_checksum(&self, checksum: &FileChecksum) -> Vec<&FileHistory> {
        self.full
            .histories
            .values()
            .filter(|h| {
                h.last()
                    .map(|last| last.checksum.as_ref() == Some(checksum))
                    .unwrap_or(false)
            })
            .collect()
    }
}
