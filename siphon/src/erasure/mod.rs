//! Erasure-coder capability and the Reed-Solomon implementation.
//!
//! Chunks are encoded into `num_pieces` pieces of which any `min_pieces`
//! suffice to reconstruct the original data. The engine consumes the coder
//! through the [`ErasureCoder`] trait so tests and alternative codecs can be
//! swapped in behind the same seam.
//!
//! # Partial encoding
//!
//! A coder that reports a segment size supports recovering a sub-range of a
//! chunk without fetching whole pieces. [`RsCode`] achieves this by striping
//! the chunk across pieces in segment-sized rows: logical bytes
//! `[j*k*s, (j+1)*k*s)` live in row `j` of the `k` data pieces. Reed-Solomon
//! over GF(2^8) is byte-positional, so any aligned row range of the pieces
//! reconstructs independently of the rest of the chunk.

use std::io::Write;

use reed_solomon_erasure::galois_8::ReedSolomon;
use thiserror::Error;

/// Errors produced by erasure encoding and recovery.
#[derive(Debug, Clone, Error)]
pub enum ErasureError {
    /// The coder was constructed with unusable parameters.
    #[error("invalid erasure parameters: {0}")]
    InvalidParameters(String),

    /// Not enough pieces were supplied to reconstruct the data.
    #[error("not enough pieces to recover: need {needed}, have {have}")]
    NotEnoughPieces { needed: usize, have: usize },

    /// The piece vector does not match the coder geometry.
    #[error("wrong piece count: expected {expected}, got {got}")]
    WrongPieceCount { expected: usize, got: usize },

    /// Supplied pieces have inconsistent lengths.
    #[error("piece length mismatch: expected {expected} bytes, got {got}")]
    PieceLength { expected: usize, got: usize },

    /// The underlying codec failed.
    #[error("reed-solomon: {0}")]
    Codec(String),

    /// More bytes were requested than the supplied pieces can yield.
    #[error("short recovery: requested {requested} bytes, recovered {recovered}")]
    ShortRecovery { requested: u64, recovered: u64 },

    /// Writing recovered data to the sink failed.
    #[error("recovery sink: {0}")]
    Sink(String),
}

/// Capability surface of an erasure codec.
///
/// Implementations must be deterministic: recovering from any sufficient
/// subset of pieces yields identical output.
pub trait ErasureCoder: Send + Sync + 'static {
    /// Minimum number of pieces required to reconstruct a chunk.
    fn min_pieces(&self) -> usize;

    /// Total number of pieces a chunk is encoded into.
    fn num_pieces(&self) -> usize;

    /// Segment granularity at which sub-chunk ranges can be recovered,
    /// or `None` if only whole chunks can be recovered.
    fn supports_partial_encoding(&self) -> Option<u64>;

    /// Encodes `data` into `num_pieces` equal-length pieces.
    fn encode(&self, data: &[u8]) -> Result<Vec<Vec<u8>>, ErasureError>;

    /// Recovers `n` bytes of logical data from the supplied pieces and
    /// writes them to `w`.
    ///
    /// `pieces` is indexed by piece number with `None` for missing pieces.
    /// For a partial coder the pieces may be aligned row slices rather than
    /// whole pieces; `n` then counts bytes of the recovered sub-range.
    fn recover(
        &self,
        pieces: &[Option<Vec<u8>>],
        n: u64,
        w: &mut dyn Write,
    ) -> Result<(), ErasureError>;
}

/// Reed-Solomon coder over GF(2^8).
///
/// Constructed either chunk-at-a-time ([`RsCode::new`]) or with segment
/// striping for partial-range recovery ([`RsCode::segmented`]).
pub struct RsCode {
    data: usize,
    parity: usize,
    segment_size: Option<u64>,
    inner: ReedSolomon,
}

impl RsCode {
    /// Creates a coder that recovers whole chunks only.
    pub fn new(data: usize, parity: usize) -> Result<Self, ErasureError> {
        let inner = ReedSolomon::new(data, parity)
            .map_err(|e| ErasureError::InvalidParameters(e.to_string()))?;
        Ok(Self {
            data,
            parity,
            segment_size: None,
            inner,
        })
    }

    /// Creates a coder that stripes chunks across pieces in `segment_size`
    /// rows, enabling partial-range recovery.
    pub fn segmented(data: usize, parity: usize, segment_size: u64) -> Result<Self, ErasureError> {
        if segment_size == 0 {
            return Err(ErasureError::InvalidParameters(
                "segment size must be non-zero".to_string(),
            ));
        }
        let mut code = Self::new(data, parity)?;
        code.segment_size = Some(segment_size);
        Ok(code)
    }

    /// Length each piece must have to encode `data_len` bytes of chunk data.
    pub fn piece_len_for(&self, data_len: usize) -> usize {
        let base = data_len.div_ceil(self.data);
        match self.segment_size {
            Some(seg) => {
                let seg = seg as usize;
                base.div_ceil(seg) * seg
            }
            None => base,
        }
    }

    fn check_geometry(&self, pieces: &[Option<Vec<u8>>]) -> Result<usize, ErasureError> {
        if pieces.len() != self.num_pieces() {
            return Err(ErasureError::WrongPieceCount {
                expected: self.num_pieces(),
                got: pieces.len(),
            });
        }
        let have = pieces.iter().filter(|p| p.is_some()).count();
        if have < self.data {
            return Err(ErasureError::NotEnoughPieces {
                needed: self.data,
                have,
            });
        }
        let mut len = None;
        for piece in pieces.iter().flatten() {
            match len {
                None => len = Some(piece.len()),
                Some(expected) if expected != piece.len() => {
                    return Err(ErasureError::PieceLength {
                        expected,
                        got: piece.len(),
                    });
                }
                Some(_) => {}
            }
        }
        // have >= data > 0, so at least one piece was present.
        Ok(len.unwrap_or(0))
    }
}

impl ErasureCoder for RsCode {
    fn min_pieces(&self) -> usize {
        self.data
    }

    fn num_pieces(&self) -> usize {
        self.data + self.parity
    }

    fn supports_partial_encoding(&self) -> Option<u64> {
        self.segment_size
    }

    fn encode(&self, data: &[u8]) -> Result<Vec<Vec<u8>>, ErasureError> {
        let piece_len = self.piece_len_for(data.len());
        if piece_len == 0 {
            return Err(ErasureError::InvalidParameters(
                "cannot encode empty data".to_string(),
            ));
        }
        let mut shards = vec![vec![0u8; piece_len]; self.num_pieces()];
        match self.segment_size {
            Some(seg) => {
                // Striped layout: logical data fills segment rows across the
                // data pieces in piece order.
                let seg = seg as usize;
                let rows = piece_len / seg;
                let mut src = 0;
                'fill: for row in 0..rows {
                    for shard in shards.iter_mut().take(self.data) {
                        if src >= data.len() {
                            break 'fill;
                        }
                        let take = seg.min(data.len() - src);
                        shard[row * seg..row * seg + take].copy_from_slice(&data[src..src + take]);
                        src += take;
                    }
                }
            }
            None => {
                // Contiguous layout: piece i holds bytes [i*len, (i+1)*len).
                for (i, shard) in shards.iter_mut().take(self.data).enumerate() {
                    let start = i * piece_len;
                    if start >= data.len() {
                        break;
                    }
                    let take = piece_len.min(data.len() - start);
                    shard[..take].copy_from_slice(&data[start..start + take]);
                }
            }
        }
        self.inner
            .encode(&mut shards)
            .map_err(|e| ErasureError::Codec(e.to_string()))?;
        Ok(shards)
    }

    fn recover(
        &self,
        pieces: &[Option<Vec<u8>>],
        n: u64,
        w: &mut dyn Write,
    ) -> Result<(), ErasureError> {
        let piece_len = self.check_geometry(pieces)?;
        let mut shards: Vec<Option<Vec<u8>>> = pieces.to_vec();
        self.inner
            .reconstruct_data(&mut shards)
            .map_err(|e| ErasureError::Codec(e.to_string()))?;

        let recovered = (piece_len * self.data) as u64;
        if n > recovered {
            return Err(ErasureError::ShortRecovery {
                requested: n,
                recovered,
            });
        }

        let mut remaining = n as usize;
        match self.segment_size {
            Some(seg) => {
                let seg = seg as usize;
                let rows = piece_len / seg;
                'rows: for row in 0..rows {
                    for shard in shards.iter().take(self.data) {
                        if remaining == 0 {
                            break 'rows;
                        }
                        let Some(shard) = shard else {
                            return Err(ErasureError::Codec(
                                "data shard missing after reconstruction".to_string(),
                            ));
                        };
                        let take = seg.min(remaining);
                        w.write_all(&shard[row * seg..row * seg + take])
                            .map_err(|e| ErasureError::Sink(e.to_string()))?;
                        remaining -= take;
                    }
                }
            }
            None => {
                for shard in shards.iter().take(self.data) {
                    if remaining == 0 {
                        break;
                    }
                    let Some(shard) = shard else {
                        return Err(ErasureError::Codec(
                            "data shard missing after reconstruction".to_string(),
                        ));
                    };
                    let take = shard.len().min(remaining);
                    w.write_all(&shard[..take])
                        .map_err(|e| ErasureError::Sink(e.to_string()))?;
                    remaining -= take;
                }
            }
        }
        Ok(())
    }
}
