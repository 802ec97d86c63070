//! Content-addressed entities carried by database versions.
//!
//! Chunks, multichunks and file contents are all identified by their
//! primary key alone. Re-adding an entity under a key that is already
//! known is a no-op, which is what makes merging databases idempotent.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::ids::{ChunkChecksum, FileChecksum, MultiChunkId};

/// A deduplicated chunk of file data.
///
/// The checksum is the chunk's whole identity: two entries with the same
/// checksum describe the same bytes everywhere.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkEntry {
    checksum: ChunkChecksum,
    size: u64,
}

impl ChunkEntry {
    /// Create an entry for a chunk of `size` bytes.
    pub fn new(checksum: ChunkChecksum, size: u64) -> Self {
        Self { checksum, size }
    }

    /// The chunk's content checksum.
    pub fn checksum(&self) -> &ChunkChecksum {
        &self.checksum
    }

    /// Chunk size in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }
}

/// A container of chunks packed together into one remote file.
///
/// Membership is a set: unordered, deduplicated. The actual payload lives
/// on the remote under the multichunk's name; this entry only records
/// which chunks can be extracted from it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MultiChunkEntry {
    id: MultiChunkId,
    chunks: BTreeSet<ChunkChecksum>,
}

impl MultiChunkEntry {
    /// Create an empty multichunk.
    pub fn new(id: MultiChunkId) -> Self {
        Self {
            id,
            chunks: BTreeSet::new(),
        }
    }

    /// Create a multichunk holding the given chunks.
    pub fn with_chunks(id: MultiChunkId, chunks: impl IntoIterator<Item = ChunkChecksum>) -> Self {
        Self {
            id,
            chunks: chunks.into_iter().collect(),
        }
    }

    /// The multichunk's identity.
    pub fn id(&self) -> &MultiChunkId {
        &self.id
    }

    /// Record that `checksum` is packed in this multichunk.
    ///
    /// Returns false if it was already recorded.
    pub fn add_chunk(&mut self, checksum: ChunkChecksum) -> bool {
        self.chunks.insert(checksum)
    }

    /// Whether `checksum` is packed in this multichunk.
    pub fn contains(&self, checksum: &ChunkChecksum) -> bool {
        self.chunks.contains(checksum)
    }

    /// Iterate over the packed chunks in checksum order.
    pub fn chunks(&self) -> impl Iterator<Item = &ChunkChecksum> {
        self.chunks.iter()
    }

    /// Number of packed chunks.
    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    /// Whether nothing is packed yet.
    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }
}

/// The recipe reassembling one file from chunks.
///
/// The chunk list is ordered; concatenating the chunks in list order
/// yields the file whose checksum and size are recorded here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileContent {
    checksum: FileChecksum,
    size: u64,
    chunks: Vec<ChunkChecksum>,
}

impl FileContent {
    /// Create an empty recipe for a file of `size` bytes.
    pub fn new(checksum: FileChecksum, size: u64) -> Self {
        Self {
            checksum,
            size,
            chunks: Vec::new(),
        }
    }

    /// Create a recipe with its chunk list.
    pub fn with_chunks(
        checksum: FileChecksum,
        size: u64,
        chunks: impl IntoIterator<Item = ChunkChecksum>,
    ) -> Self {
        Self {
            checksum,
            size,
            chunks: chunks.into_iter().collect(),
        }
    }

    /// Append the next chunk of the file.
    pub fn add_chunk(&mut self, checksum: ChunkChecksum) {
        self.chunks.push(checksum);
    }

    /// The assembled file's checksum.
    pub fn checksum(&self) -> &FileChecksum {
        &self.checksum
    }

    /// The assembled file's size in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// The chunks, in assembly order.
    pub fn chunks(&self) -> &[ChunkChecksum] {
        &self.chunks
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_multichunk_membership_deduplicates() {
        let mut mc = MultiChunkEntry::new(MultiChunkId::from_bytes([1; 20]));
        let c = ChunkChecksum::of(b"data");
        assert!(mc.add_chunk(c));
        assert!(!mc.add_chunk(c));
        assert_eq!(mc.len(), 1);
        assert!(mc.contains(&c));
    }

    #[test]
    fn test_content_preserves_chunk_order() {
        let a = ChunkChecksum::of(b"a");
        let b = ChunkChecksum::of(b"b");
        let content = FileContent::with_chunks(FileChecksum::of(b"ab"), 2, [b, a]);
        assert_eq!(content.chunks(), &[b, a]);
    }
}
