//! Engine error types.
//!
//! Worker-level fetch errors are recoverable and stay inside the worker
//! module ([`crate::worker::HostError`]); the kinds here are the terminal
//! ones a chunk or a whole download can surface to the caller.

use thiserror::Error;

use crate::erasure::ErasureError;

/// Terminal error of a download or one of its chunks.
#[derive(Debug, Clone, Error)]
pub enum DownloadError {
    /// Too few workers remain to ever assemble the chunk.
    #[error("chunk {chunk}: {remaining} workers remaining and {completed} pieces completed, need {min_pieces}")]
    NotEnoughWorkers {
        chunk: u64,
        remaining: usize,
        completed: usize,
        min_pieces: usize,
    },

    /// The caller cancelled the download.
    #[error("download cancelled")]
    Cancelled,

    /// The engine is shutting down.
    #[error("engine is shutting down")]
    ShuttingDown,

    /// Recovery failed despite having enough pieces.
    #[error("chunk {chunk}: recovery failed")]
    Codec {
        chunk: u64,
        #[source]
        source: ErasureError,
    },

    /// The destination rejected recovered data. Fatal for the download:
    /// continuing would write garbage after a gap.
    #[error("chunk {chunk}: destination write failed: {message}")]
    Destination { chunk: u64, message: String },

    /// The request itself was malformed.
    #[error("invalid download parameters: {0}")]
    InvalidParams(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_includes_chunk_context() {
        let err = DownloadError::NotEnoughWorkers {
            chunk: 7,
            remaining: 1,
            completed: 1,
            min_pieces: 3,
        };
        let msg = err.to_string();
        assert!(msg.contains("chunk 7"));
        assert!(msg.contains("need 3"));
    }

    #[test]
    fn test_codec_error_carries_source() {
        use std::error::Error as _;
        let err = DownloadError::Codec {
            chunk: 0,
            source: ErasureError::NotEnoughPieces { needed: 3, have: 2 },
        };
        assert!(err.source().is_some());
    }
}
