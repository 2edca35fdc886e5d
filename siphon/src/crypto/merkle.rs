//! Segment Merkle trees over stored pieces.
//!
//! A host stores each piece as ciphertext and commits to it with a Merkle
//! root over fixed-size segments. A range of segments can then be proven
//! against the root without transferring the rest of the piece, which is
//! what allows partial-range downloads to stay verifiable.
//!
//! The tree is the usual left-perfect unbalanced binary tree: an interior
//! node splits its span at the largest power of two strictly below the span
//! length. Leaves and interior nodes are domain-separated BLAKE3 hashes.

/// Default segment size for piece trees, in bytes.
pub const SEGMENT_SIZE: u64 = 64;

/// A 32-byte Merkle hash.
pub type Hash = [u8; 32];

const LEAF_PREFIX: &[u8] = &[0x00];
const NODE_PREFIX: &[u8] = &[0x01];

fn leaf_hash(segment: &[u8]) -> Hash {
    let mut hasher = blake3::Hasher::new();
    hasher.update(LEAF_PREFIX);
    hasher.update(segment);
    *hasher.finalize().as_bytes()
}

fn node_hash(left: &Hash, right: &Hash) -> Hash {
    let mut hasher = blake3::Hasher::new();
    hasher.update(NODE_PREFIX);
    hasher.update(left);
    hasher.update(right);
    *hasher.finalize().as_bytes()
}

/// Largest power of two strictly less than `n`. Callers guarantee `n >= 2`.
fn split_point(n: usize) -> usize {
    let mut k = 1;
    while k * 2 < n {
        k *= 2;
    }
    k
}

/// Number of segments in a piece of `len` bytes.
pub fn segment_count(len: u64, segment_size: u64) -> u64 {
    if len == 0 {
        1
    } else {
        len.div_ceil(segment_size)
    }
}

fn segment(piece: &[u8], index: usize, segment_size: usize) -> &[u8] {
    let start = index * segment_size;
    let end = (start + segment_size).min(piece.len());
    &piece[start..end]
}

fn subtree_root(piece: &[u8], lo: usize, hi: usize, segment_size: usize) -> Hash {
    if hi - lo == 1 {
        return leaf_hash(segment(piece, lo, segment_size));
    }
    let mid = lo + split_point(hi - lo);
    let left = subtree_root(piece, lo, mid, segment_size);
    let right = subtree_root(piece, mid, hi, segment_size);
    node_hash(&left, &right)
}

/// Computes the Merkle root of a whole piece.
pub fn piece_root(piece: &[u8], segment_size: u64) -> Hash {
    let segs = segment_count(piece.len() as u64, segment_size) as usize;
    subtree_root(piece, 0, segs, segment_size as usize)
}

/// Proof that a contiguous segment range belongs to a piece root.
///
/// The proof carries the roots of the maximal subtrees disjoint from the
/// proven range, in deterministic pre-order; the verifier recombines them
/// with leaf hashes recomputed from the transferred data.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RangeProof {
    hashes: Vec<Hash>,
}

impl RangeProof {
    /// Number of subtree hashes in the proof.
    pub fn len(&self) -> usize {
        self.hashes.len()
    }

    /// True if the proof carries no hashes (range covers the whole piece).
    pub fn is_empty(&self) -> bool {
        self.hashes.is_empty()
    }
}

fn collect_proof(
    piece: &[u8],
    lo: usize,
    hi: usize,
    start: usize,
    end: usize,
    segment_size: usize,
    out: &mut Vec<Hash>,
) {
    if hi <= start || lo >= end {
        out.push(subtree_root(piece, lo, hi, segment_size));
        return;
    }
    if hi - lo == 1 {
        // Leaf inside the range: the verifier recomputes it from the data.
        return;
    }
    let mid = lo + split_point(hi - lo);
    collect_proof(piece, lo, mid, start, end, segment_size, out);
    collect_proof(piece, mid, hi, start, end, segment_size, out);
}

/// Builds a proof for segments `[start, end)` of `piece`.
pub fn build_range_proof(piece: &[u8], start: usize, end: usize, segment_size: u64) -> RangeProof {
    let segs = segment_count(piece.len() as u64, segment_size) as usize;
    debug_assert!(start < end && end <= segs);
    let mut hashes = Vec::new();
    collect_proof(piece, 0, segs, start, end, segment_size as usize, &mut hashes);
    RangeProof { hashes }
}

fn recompute(
    data: &[u8],
    lo: usize,
    hi: usize,
    start: usize,
    end: usize,
    segment_size: usize,
    proof: &mut std::slice::Iter<'_, Hash>,
) -> Option<Hash> {
    if hi <= start || lo >= end {
        return proof.next().copied();
    }
    if hi - lo == 1 {
        let rel = lo - start;
        let seg_start = rel * segment_size;
        if seg_start > data.len() {
            return None;
        }
        let seg_end = (seg_start + segment_size).min(data.len());
        return Some(leaf_hash(&data[seg_start..seg_end]));
    }
    let mid = lo + split_point(hi - lo);
    let left = recompute(data, lo, mid, start, end, segment_size, proof)?;
    let right = recompute(data, mid, hi, start, end, segment_size, proof)?;
    Some(node_hash(&left, &right))
}

/// Verifies that `data` is segments `[start, end)` of a piece with the given
/// root and total segment count.
pub fn verify_range_proof(
    root: &Hash,
    data: &[u8],
    proof: &RangeProof,
    start: usize,
    end: usize,
    total_segments: usize,
    segment_size: u64,
) -> bool {
    if start >= end || end > total_segments {
        return false;
    }
    // The data must span exactly the claimed segments; only the final segment
    // of the piece may be short.
    let full = (end - start) * segment_size as usize;
    if data.len() > full || (end < total_segments && data.len() != full) {
        return false;
    }
    let mut iter = proof.hashes.iter();
    let computed = recompute(
        data,
        0,
        total_segments,
        start,
        end,
        segment_size as usize,
        &mut iter,
    );
    // Every proof hash must be consumed.
    matches!(computed, Some(h) if h == *root && iter.next().is_none())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn piece(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 256) as u8).collect()
    }

    #[test]
    fn test_root_is_deterministic() {
        let p = piece(640);
        assert_eq!(piece_root(&p, SEGMENT_SIZE), piece_root(&p, SEGMENT_SIZE));
    }

    #[test]
    fn test_root_changes_with_content() {
        let p = piece(640);
        let mut q = p.clone();
        q[17] ^= 0xff;
        assert_ne!(piece_root(&p, SEGMENT_SIZE), piece_root(&q, SEGMENT_SIZE));
    }

    #[test]
    fn test_full_range_proof_is_empty() {
        let p = piece(320);
        let proof = build_range_proof(&p, 0, 5, SEGMENT_SIZE);
        assert!(proof.is_empty());
        let root = piece_root(&p, SEGMENT_SIZE);
        assert!(verify_range_proof(&root, &p, &proof, 0, 5, 5, SEGMENT_SIZE));
    }

    #[test]
    fn test_single_segment_proofs() {
        let p = piece(640); // 10 segments
        let root = piece_root(&p, SEGMENT_SIZE);
        for i in 0..10 {
            let proof = build_range_proof(&p, i, i + 1, SEGMENT_SIZE);
            let data = &p[i * 64..(i + 1) * 64];
            assert!(
                verify_range_proof(&root, data, &proof, i, i + 1, 10, SEGMENT_SIZE),
                "segment {}",
                i
            );
        }
    }

    #[test]
    fn test_all_ranges_verify() {
        let p = piece(7 * 64 + 13); // 8 segments, last one short
        let root = piece_root(&p, SEGMENT_SIZE);
        for start in 0..8 {
            for end in (start + 1)..=8 {
                let proof = build_range_proof(&p, start, end, SEGMENT_SIZE);
                let hi = (end * 64).min(p.len());
                let data = &p[start * 64..hi];
                assert!(
                    verify_range_proof(&root, data, &proof, start, end, 8, SEGMENT_SIZE),
                    "range [{}, {})",
                    start,
                    end
                );
            }
        }
    }

    #[test]
    fn test_tampered_data_fails() {
        let p = piece(640);
        let root = piece_root(&p, SEGMENT_SIZE);
        let proof = build_range_proof(&p, 2, 4, SEGMENT_SIZE);
        let mut data = p[128..256].to_vec();
        data[5] ^= 1;
        assert!(!verify_range_proof(
            &root,
            &data,
            &proof,
            2,
            4,
            10,
            SEGMENT_SIZE
        ));
    }

    #[test]
    fn test_wrong_range_fails() {
        let p = piece(640);
        let root = piece_root(&p, SEGMENT_SIZE);
        let proof = build_range_proof(&p, 2, 4, SEGMENT_SIZE);
        let data = &p[128..256];
        // Claiming a different position with the same proof must fail.
        assert!(!verify_range_proof(
            &root,
            data,
            &proof,
            3,
            5,
            10,
            SEGMENT_SIZE
        ));
    }

    #[test]
    fn test_truncated_proof_fails() {
        let p = piece(640);
        let root = piece_root(&p, SEGMENT_SIZE);
        let mut proof = build_range_proof(&p, 2, 4, SEGMENT_SIZE);
        proof.hashes.pop();
        let data = &p[128..256];
        assert!(!verify_range_proof(
            &root,
            data,
            &proof,
            2,
            4,
            10,
            SEGMENT_SIZE
        ));
    }

    #[test]
    fn test_small_segment_size() {
        let p = piece(40); // 5 segments of 8 bytes
        let root = piece_root(&p, 8);
        let proof = build_range_proof(&p, 1, 3, 8);
        assert!(verify_range_proof(&root, &p[8..24], &proof, 1, 3, 5, 8));
    }
}
