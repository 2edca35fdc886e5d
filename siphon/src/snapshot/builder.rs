//! Fixture builder: encodes plaintext into host sectors plus a matching
//! snapshot.
//!
//! The engine itself never uploads; this builder exists so tests and
//! reference deployments can produce the host-side state a download expects
//! (erasure-coded, per-piece-encrypted sectors committed to by Merkle roots).

use std::collections::HashMap;
use std::sync::Arc;

use crate::crypto::merkle::{self, Hash};
use crate::crypto::MasterKey;
use crate::erasure::{ErasureCoder, ErasureError};
use crate::snapshot::{ChunkMap, HostKey, PieceLocation, Snapshot};

/// Result of building a file: the renter-side snapshot and the host-side
/// sector stores, keyed by host and then by Merkle root.
pub struct BuiltFile {
    pub snapshot: Snapshot,
    pub sectors: HashMap<HostKey, HashMap<Hash, Vec<u8>>>,
}

impl std::fmt::Debug for BuiltFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BuiltFile").finish()
    }
}

/// Builds a [`Snapshot`] and matching host sectors from plaintext.
pub struct SnapshotBuilder {
    file_id: String,
    master_key: MasterKey,
    erasure: Arc<dyn ErasureCoder>,
    chunk_size: u64,
    hosts: Vec<HostKey>,
}

impl SnapshotBuilder {
    pub fn new(
        file_id: impl Into<String>,
        master_key: MasterKey,
        erasure: Arc<dyn ErasureCoder>,
        chunk_size: u64,
    ) -> Self {
        Self {
            file_id: file_id.into(),
            master_key,
            erasure,
            chunk_size,
            hosts: Vec::new(),
        }
    }

    /// Assigns hosts: piece `i` of every chunk is stored on `hosts[i]`.
    /// Supplying fewer hosts than pieces leaves the tail pieces unstored.
    pub fn hosts<I, K>(mut self, hosts: I) -> Self
    where
        I: IntoIterator<Item = K>,
        K: Into<HostKey>,
    {
        self.hosts = hosts.into_iter().map(Into::into).collect();
        self
    }

    /// Encodes and encrypts `plaintext` into per-host sectors and returns the
    /// matching snapshot.
    pub fn build(self, plaintext: &[u8]) -> Result<BuiltFile, ErasureError> {
        let min = self.erasure.min_pieces() as u64;
        if plaintext.is_empty() {
            return Err(ErasureError::InvalidParameters(
                "cannot build an empty file".to_string(),
            ));
        }
        if self.chunk_size == 0 || self.chunk_size % min != 0 {
            return Err(ErasureError::InvalidParameters(format!(
                "chunk size {} is not a multiple of min pieces {}",
                self.chunk_size, min
            )));
        }
        let piece_size = self.chunk_size / min;
        if let Some(seg) = self.erasure.supports_partial_encoding() {
            if piece_size % seg != 0 {
                return Err(ErasureError::InvalidParameters(format!(
                    "piece size {} is not a multiple of segment size {}",
                    piece_size, seg
                )));
            }
        }
        let seg_size = self
            .erasure
            .supports_partial_encoding()
            .unwrap_or(merkle::SEGMENT_SIZE);

        let mut sectors: HashMap<HostKey, HashMap<Hash, Vec<u8>>> = HashMap::new();
        let mut chunks = Vec::new();

        for (chunk_index, chunk) in plaintext.chunks(self.chunk_size as usize).enumerate() {
            // The final chunk is zero-padded up to the erasure geometry; the
            // snapshot's file size bounds what downloads may request.
            let mut data = chunk.to_vec();
            data.resize(self.chunk_size as usize, 0);
            let pieces = self.erasure.encode(&data)?;

            let mut map = HashMap::new();
            for (piece_index, mut piece) in pieces.into_iter().enumerate() {
                let Some(host) = self.hosts.get(piece_index) else {
                    continue;
                };
                let key = self
                    .master_key
                    .derive_piece_key(chunk_index as u64, piece_index as u64);
                key.apply(&mut piece);
                let root = merkle::piece_root(&piece, seg_size);
                sectors.entry(host.clone()).or_default().insert(root, piece);
                map.insert(
                    host.clone(),
                    PieceLocation {
                        piece_index: piece_index as u64,
                        root,
                    },
                );
            }
            chunks.push(ChunkMap::new(map));
        }

        let snapshot = Snapshot::new(
            self.file_id,
            plaintext.len() as u64,
            piece_size,
            self.master_key,
            self.erasure,
            chunks,
        );
        Ok(BuiltFile { snapshot, sectors })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::erasure::RsCode;

    fn host_names(n: usize) -> Vec<HostKey> {
        (0..n).map(|i| HostKey::new(format!("host-{i}"))).collect()
    }

    #[test]
    fn test_build_assigns_one_piece_per_host() {
        let erasure: Arc<dyn ErasureCoder> = Arc::new(RsCode::segmented(3, 2, 8).unwrap());
        let plaintext: Vec<u8> = (0..240).map(|i| (i % 256) as u8).collect();
        let built = SnapshotBuilder::new("f", MasterKey::from_seed(b"k"), erasure, 120)
            .hosts(host_names(5))
            .build(&plaintext)
            .unwrap();

        assert_eq!(built.snapshot.num_chunks(), 2);
        assert_eq!(built.snapshot.piece_size(), 40);
        for chunk in 0..2 {
            let map = built.snapshot.chunk_map(chunk).unwrap();
            assert_eq!(map.len(), 5);
        }
        // Every host stores one sector per chunk.
        for host in host_names(5) {
            assert_eq!(built.sectors[&host].len(), 2);
        }
    }

    #[test]
    fn test_sectors_verify_against_snapshot_roots() {
        let erasure: Arc<dyn ErasureCoder> = Arc::new(RsCode::segmented(3, 2, 8).unwrap());
        let plaintext: Vec<u8> = (0..120).map(|i| (i % 256) as u8).collect();
        let built = SnapshotBuilder::new("f", MasterKey::from_seed(b"k"), erasure, 120)
            .hosts(host_names(5))
            .build(&plaintext)
            .unwrap();

        let seg = built.snapshot.merkle_segment_size();
        let map = built.snapshot.chunk_map(0).unwrap();
        for host in host_names(5) {
            let loc = map.piece_for(&host).unwrap();
            let sector = &built.sectors[&host][&loc.root];
            assert_eq!(merkle::piece_root(sector, seg), loc.root);
        }
    }

    #[test]
    fn test_fewer_hosts_than_pieces_leaves_tail_unstored() {
        let erasure: Arc<dyn ErasureCoder> = Arc::new(RsCode::new(3, 2).unwrap());
        let plaintext = vec![7u8; 120];
        let built = SnapshotBuilder::new("f", MasterKey::from_seed(b"k"), erasure, 120)
            .hosts(host_names(2))
            .build(&plaintext)
            .unwrap();
        assert_eq!(built.snapshot.chunk_map(0).unwrap().len(), 2);
    }

    #[test]
    fn test_misaligned_chunk_size_rejected() {
        let erasure: Arc<dyn ErasureCoder> = Arc::new(RsCode::new(3, 2).unwrap());
        let err = SnapshotBuilder::new("f", MasterKey::from_seed(b"k"), erasure, 100)
            .hosts(host_names(5))
            .build(&[0u8; 100])
            .unwrap_err();
        assert!(matches!(err, ErasureError::InvalidParameters(_)));
    }
}
