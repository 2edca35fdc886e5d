//! Partial-range recovery math.
//!
//! With a partial-encoding coder a chunk is recovered in units of
//! `min_pieces * segment_size` bytes (one "recovered segment" spans one
//! segment row of every data piece). A byte range therefore maps to the
//! aligned run of recovered segments covering it; the surplus bytes at both
//! ends are recovered and discarded. Without partial encoding the whole
//! chunk is recovered and the range is cut from it directly.

use crate::erasure::ErasureCoder;

/// Byte range of each piece that must be fetched from hosts to recover
/// `[offset, offset + length)` of the chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct PieceRange {
    pub offset: u64,
    pub length: u64,
}

/// First recovered segment touched by the range and how many are touched.
pub(crate) fn segments_for_recovery(offset: u64, length: u64, coder: &dyn ErasureCoder) -> Option<(u64, u64)> {
    let segment_size = coder.supports_partial_encoding()?;
    let recovered = coder.min_pieces() as u64 * segment_size;
    let first = offset / recovered;
    let num = (offset + length).div_ceil(recovered) - first;
    Some((first, num))
}

/// Bytes of logical data that must be recovered to serve the range.
pub(crate) fn bytes_to_recover(
    offset: u64,
    length: u64,
    chunk_size: u64,
    coder: &dyn ErasureCoder,
) -> u64 {
    match segments_for_recovery(offset, length, coder) {
        Some((_, num)) => {
            let recovered = coder.min_pieces() as u64
                * coder.supports_partial_encoding().unwrap_or(0);
            num * recovered
        }
        None => chunk_size,
    }
}

/// Offset of the requested range within the recovered data.
pub(crate) fn recovered_data_offset(offset: u64, coder: &dyn ErasureCoder) -> u64 {
    match coder.supports_partial_encoding() {
        Some(segment_size) => offset % (coder.min_pieces() as u64 * segment_size),
        None => offset,
    }
}

/// Slice of each piece the workers must fetch.
pub(crate) fn piece_range(
    offset: u64,
    length: u64,
    piece_size: u64,
    coder: &dyn ErasureCoder,
) -> PieceRange {
    match (
        coder.supports_partial_encoding(),
        segments_for_recovery(offset, length, coder),
    ) {
        (Some(segment_size), Some((first, num))) => PieceRange {
            offset: first * segment_size,
            length: num * segment_size,
        },
        _ => PieceRange {
            offset: 0,
            length: piece_size,
        },
    }
}
