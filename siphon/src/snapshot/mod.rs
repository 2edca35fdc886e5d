//! Immutable file-metadata views consumed by downloads.
//!
//! A download never touches live file-system state: it operates on a
//! [`Snapshot`], a cheaply-cloneable view of the file's geometry, keys, and
//! per-chunk piece placement. The snapshot is taken once when the download is
//! created and holds no locks for the download's lifetime.

mod builder;

pub use self::builder::{BuiltFile, SnapshotBuilder};

use std::collections::HashMap;
use std::sync::Arc;

use crate::crypto::merkle::{self, Hash};
use crate::crypto::MasterKey;
use crate::erasure::ErasureCoder;

/// Identity of a remote host, as established by the contract layer.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HostKey(Arc<str>);

impl HostKey {
    pub fn new(key: impl Into<Arc<str>>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for HostKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::fmt::Debug for HostKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "HostKey({})", self.0)
    }
}

impl From<&str> for HostKey {
    fn from(key: &str) -> Self {
        Self::new(key)
    }
}

/// Placement of one piece of one chunk on a host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PieceLocation {
    /// Index of the piece within the chunk's erasure group.
    pub piece_index: u64,
    /// Merkle root the host committed to for the stored piece.
    pub root: Hash,
}

/// Which host holds which piece of a single chunk.
#[derive(Debug, Clone, Default)]
pub struct ChunkMap {
    pieces: HashMap<HostKey, PieceLocation>,
}

impl ChunkMap {
    pub fn new(pieces: HashMap<HostKey, PieceLocation>) -> Self {
        Self { pieces }
    }

    /// The piece this host stores for the chunk, if any.
    pub fn piece_for(&self, host: &HostKey) -> Option<&PieceLocation> {
        self.pieces.get(host)
    }

    pub fn hosts(&self) -> impl Iterator<Item = &HostKey> {
        self.pieces.keys()
    }

    pub fn len(&self) -> usize {
        self.pieces.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pieces.is_empty()
    }
}

struct Inner {
    file_id: String,
    file_size: u64,
    piece_size: u64,
    master_key: MasterKey,
    erasure: Arc<dyn ErasureCoder>,
    chunks: Vec<ChunkMap>,
}

/// Immutable view of a file's download-relevant metadata.
#[derive(Clone)]
pub struct Snapshot {
    inner: Arc<Inner>,
}

impl Snapshot {
    /// Assembles a snapshot from its parts. `chunks[i]` maps hosts to the
    /// pieces of chunk `i`.
    pub fn new(
        file_id: impl Into<String>,
        file_size: u64,
        piece_size: u64,
        master_key: MasterKey,
        erasure: Arc<dyn ErasureCoder>,
        chunks: Vec<ChunkMap>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                file_id: file_id.into(),
                file_size,
                piece_size,
                master_key,
                erasure,
                chunks,
            }),
        }
    }

    /// Logical file size in bytes.
    pub fn file_size(&self) -> u64 {
        self.inner.file_size
    }

    /// Size of one stored piece in bytes.
    pub fn piece_size(&self) -> u64 {
        self.inner.piece_size
    }

    /// Size of one logical chunk: `min_pieces * piece_size`.
    pub fn chunk_size(&self) -> u64 {
        self.inner.erasure.min_pieces() as u64 * self.inner.piece_size
    }

    /// Number of chunks in the file.
    pub fn num_chunks(&self) -> u64 {
        self.inner.chunks.len() as u64
    }

    /// Logical bytes stored in chunk `index` (the final chunk may be short).
    pub fn chunk_len(&self, index: u64) -> u64 {
        let start = index * self.chunk_size();
        self.chunk_size().min(self.inner.file_size.saturating_sub(start))
    }

    pub fn erasure(&self) -> &Arc<dyn ErasureCoder> {
        &self.inner.erasure
    }

    pub fn master_key(&self) -> &MasterKey {
        &self.inner.master_key
    }

    /// Piece placement for chunk `index`.
    pub fn chunk_map(&self, index: u64) -> Option<&ChunkMap> {
        self.inner.chunks.get(index as usize)
    }

    /// Stable identifier for a chunk, unique within the engine.
    pub fn cache_id(&self, index: u64) -> String {
        format!("{}/{}", self.inner.file_id, index)
    }

    /// Segment granularity of the per-piece Merkle trees.
    ///
    /// Matches the erasure coder's segment size when partial encoding is
    /// supported so that fetchable piece ranges align with provable ranges.
    pub fn merkle_segment_size(&self) -> u64 {
        self.inner
            .erasure
            .supports_partial_encoding()
            .unwrap_or(merkle::SEGMENT_SIZE)
    }
}

impl std::fmt::Debug for Snapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Snapshot")
            .field("file_id", &self.inner.file_id)
            .field("file_size", &self.inner.file_size)
            .field("piece_size", &self.inner.piece_size)
            .field("num_chunks", &self.inner.chunks.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::erasure::RsCode;

    fn snapshot(file_size: u64) -> Snapshot {
        let erasure: Arc<dyn ErasureCoder> = Arc::new(RsCode::new(3, 2).unwrap());
        let num_chunks = file_size.div_ceil(120);
        Snapshot::new(
            "file",
            file_size,
            40,
            MasterKey::from_seed(b"k"),
            erasure,
            vec![ChunkMap::default(); num_chunks as usize],
        )
    }

    #[test]
    fn test_geometry() {
        let snap = snapshot(300);
        assert_eq!(snap.chunk_size(), 120);
        assert_eq!(snap.num_chunks(), 3);
        assert_eq!(snap.chunk_len(0), 120);
        assert_eq!(snap.chunk_len(2), 60);
    }

    #[test]
    fn test_cache_ids_are_distinct() {
        let snap = snapshot(240);
        assert_ne!(snap.cache_id(0), snap.cache_id(1));
    }

    #[test]
    fn test_merkle_segment_size_defaults_without_partial() {
        let snap = snapshot(120);
        assert_eq!(snap.merkle_segment_size(), merkle::SEGMENT_SIZE);
    }
}
