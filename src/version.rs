//! Database versions: the unit clients exchange.

use std::{collections::BTreeMap, fmt};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::{
    clock::VectorClock,
    entry::{ChunkEntry, FileContent, MultiChunkEntry},
    file::FileHistory,
    ids::{ChunkChecksum, ClientId, FileChecksum, FileHistoryId, MultiChunkId},
};

/// Identity and causal position of a database version.
///
/// Headers are what [`Branch`](crate::branch::Branch)es carry and what the
/// wire format indexes; the vector clock identifies the version globally.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseVersionHeader {
    /// Client that created the version.
    pub client: ClientId,
    /// Wall-clock creation time, milliseconds since the epoch.
    pub timestamp: u64,
    /// Causal position among all versions.
    pub vector_clock: VectorClock,
}

impl fmt::Display for DatabaseVersionHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/T={}", self.client, self.vector_clock, self.timestamp)
    }
}

/// The entity maps of a database version, without the header.
///
/// Kept separate so the wire format can frame header and body
/// independently: range loads decode headers and skip bodies.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct VersionBody {
    pub(crate) chunks: BTreeMap<ChunkChecksum, ChunkEntry>,
    pub(crate) multichunks: BTreeMap<MultiChunkId, MultiChunkEntry>,
    pub(crate) contents: BTreeMap<FileChecksum, FileContent>,
    pub(crate) histories: BTreeMap<FileHistoryId, FileHistory>,
}

/// One atomic set of changes: new chunks, multichunks, file contents and
/// file versions, stamped with a header.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseVersion {
    header: DatabaseVersionHeader,
    body: VersionBody,
}

impl DatabaseVersion {
    /// Create an empty version under the given header.
    pub fn new(header: DatabaseVersionHeader) -> Self {
        Self {
            header,
            body: VersionBody::default(),
        }
    }

    pub(crate) fn from_parts(header: DatabaseVersionHeader, body: VersionBody) -> Self {
        Self { header, body }
    }

    pub(crate) fn body(&self) -> &VersionBody {
        &self.body
    }

    /// The version's header.
    pub fn header(&self) -> &DatabaseVersionHeader {
        &self.header
    }

    /// Record a chunk. Re-adding a known checksum is a no-op.
    pub fn add_chunk(&mut self, chunk: ChunkEntry) {
        if let Some(existing) = self.body.chunks.get(chunk.checksum()) {
            if existing.size() != chunk.size() {
                warn!(
                    "ignoring chunk {} with conflicting size {} (have {})",
                    chunk.checksum(),
                    chunk.size(),
                    existing.size()
                );
            }
            return;
        }
        self.body.chunks.insert(*chunk.checksum(), chunk);
    }

    /// The chunk with the given checksum, if present.
    pub fn chunk(&self, checksum: &ChunkChecksum) -> Option<&ChunkEntry> {
        self.body.chunks.get(checksum)
    }

    /// Iterate over the chunks in checksum order.
    pub fn chunks(&self) -> impl Iterator<Item = &ChunkEntry> {
        self.body.chunks.values()
    }

    /// Record a multichunk. Re-adding a known id is a no-op.
    pub fn add_multichunk(&mut self, multichunk: MultiChunkEntry) {
        if self.body.multichunks.contains_key(multichunk.id()) {
            return;
        }
        self.body.multichunks.insert(*multichunk.id(), multichunk);
    }

    /// The multichunk with the given id, if present.
    pub fn multichunk(&self, id: &MultiChunkId) -> Option<&MultiChunkEntry> {
        self.body.multichunks.get(id)
    }

    /// Iterate over the multichunks in id order.
    pub fn multichunks(&self) -> impl Iterator<Item = &MultiChunkEntry> {
        self.body.multichunks.values()
    }

    /// The multichunk a chunk is packed in, if recorded in this version.
    pub fn multichunk_for_chunk(&self, checksum: &ChunkChecksum) -> Option<&MultiChunkId> {
        self.body
            .multichunks
            .values()
            .find(|mc| mc.contains(checksum))
            .map(|mc| mc.id())
    }

    /// Record a file content. Re-adding a known checksum is a no-op.
    pub fn add_content(&mut self, content: FileContent) {
        if self.body.contents.contains_key(content.checksum()) {
            return;
        }
        self.body.contents.insert(*content.checksum(), content);
    }

    /// The file content with the given checksum, if present.
    pub fn content(&self, checksum: &FileChecksum) -> Option<&FileContent> {
        self.body.contents.get(checksum)
    }

    /// Iterate over the file contents in checksum order.
    pub fn contents(&self) -> impl Iterator<Item = &FileContent> {
        self.body.contents.values()
    }

    /// Record a (partial) file history.
    ///
    /// If the id is already present, the version maps are unioned; equal
    /// version numbers keep the first-seen entry.
    pub fn add_history(&mut self, history: FileHistory) {
        match self.body.histories.get_mut(history.id()) {
            None => {
                self.body.histories.insert(*history.id(), history);
            }
            Some(existing) => {
                let mut merged = existing.clone();
                for version in history.versions() {
                    if merged.get(version.version).is_none() {
                        if let Err(err) = merged.add(version.clone()) {
                            warn!("dropping stray file version: {err}");
                        }
                    }
                }
                *existing = merged;
            }
        }
    }

    /// The history with the given id, if present.
    pub fn history(&self, id: &FileHistoryId) -> Option<&FileHistory> {
        self.body.histories.get(id)
    }

    /// Iterate over the histories in id order.
    pub fn histories(&self) -> impl Iterator<Item = &FileHistory> {
        self.body.histories.values()
    }

    pub(crate) fn replace_histories(&mut self, histories: impl IntoIterator<Item = FileHistory>) {
        self.body.histories = histories.into_iter().map(|h| (*h.id(), h)).collect();
    }

    pub(crate) fn take_histories(&mut self) -> Vec<FileHistory> {
        std::mem::take(&mut self.body.histories)
            .into_values()
            .collect()
    }

    /// Whether the version carries no entities at all.
    pub fn is_empty(&self) -> bool {
        self.body.chunks.is_empty()
            && self.body.multichunks.is_empty()
            && self.body.contents.is_empty()
            && self.body.histories.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use crate::file::{FileStatus, FileType, FileVersion};

    use super::*;

    fn header() -> DatabaseVersionHeader {
        DatabaseVersionHeader {
            client: ClientId::new("alice").unwrap(),
            timestamp: 1_000,
            vector_clock: [(ClientId::new("alice").unwrap(), 1)].into_iter().collect(),
        }
    }

    #[test]
    fn test_add_chunk_is_idempotent() {
        let mut version = DatabaseVersion::new(header());
        let chunk = ChunkEntry::new(ChunkChecksum::of(b"x"), 1);
        version.add_chunk(chunk.clone());
        version.add_chunk(chunk);
        assert_eq!(version.chunks().count(), 1);
    }

    #[test]
    fn test_multichunk_for_chunk() {
        let mut version = DatabaseVersion::new(header());
        let chunk = ChunkChecksum::of(b"payload");
        let id = MultiChunkId::from_bytes([2; 20]);
        version.add_multichunk(MultiChunkEntry::with_chunks(id, [chunk]));
        assert_eq!(version.multichunk_for_chunk(&chunk), Some(&id));
        assert_eq!(version.multichunk_for_chunk(&ChunkChecksum::of(b"other")), None);
    }

    #[test]
    fn test_add_history_unions_versions() {
        let id = FileHistoryId::from_bytes([3; 20]);
        let v1 = FileVersion {
            version: 1,
            path: "a.txt".to_string(),
            file_type: FileType::File,
            status: FileStatus::New,
            size: 1,
            last_modified: 0,
            updated: 1,
            checksum: Some(FileChecksum::of(b"a")),
            created_by: None,
            link_target: None,
        };
        let mut v2 = v1.clone();
        v2.version = 2;
        v2.status = FileStatus::Changed;

        let mut first = FileHistory::new(id);
        first.add(v1).unwrap();
        let mut second = FileHistory::new(id);
        second.add(v2).unwrap();

        let mut version = DatabaseVersion::new(header());
        version.add_history(first);
        version.add_history(second);
        assert_eq!(version.history(&id).unwrap().len(), 2);
    }

    #[test]
    fn test_display_header() {
        assert_eq!(header().to_string(), "alice/(alice1)/T=1000");
    }
}
