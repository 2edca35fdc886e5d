//! Download destinations.
//!
//! A destination is the only component that sees recovered plaintext. The
//! engine hands it the completed pieces of a chunk together with the slice
//! geometry; the destination runs the erasure recovery and lands the bytes.
//!
//! Two variants cover the essential cases:
//!
//! - [`SeekableSink`] for targets that accept writes in any chunk order
//!   (a file, a pre-allocated buffer).
//! - [`OrderedSink`] for targets that must be written front to back (a
//!   streaming response body); recovered slices arriving out of order are
//!   buffered until their predecessors have been flushed.

use std::collections::BTreeMap;
use std::io::{Seek, SeekFrom, Write};

use parking_lot::Mutex;
use thiserror::Error;

use crate::erasure::{ErasureCoder, ErasureError};

/// Errors produced by destination writes.
#[derive(Debug, Error)]
pub enum DestinationError {
    #[error("i/o: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Recovery(#[from] ErasureError),
}

/// Where recovered chunk data is written.
pub trait Destination: Send + Sync + 'static {
    /// Recovers a chunk slice from `pieces` and writes it to the target.
    ///
    /// The recovered data begins `data_offset` bytes before the requested
    /// slice; `length` bytes starting there are written at `write_offset`
    /// within the destination.
    fn write_pieces(
        &self,
        codec: &dyn ErasureCoder,
        pieces: Vec<Option<Vec<u8>>>,
        data_offset: u64,
        write_offset: u64,
        length: u64,
    ) -> Result<(), DestinationError>;
}

/// Writer adapter that discards a prefix and bounds the total forwarded.
///
/// Erasure recovery always produces whole recovered segments; this adapter
/// trims them to the requested slice as they stream through.
struct SkipWriter<W> {
    inner: W,
    skip: u64,
    remaining: u64,
}

impl<W: Write> SkipWriter<W> {
    fn new(inner: W, skip: u64, length: u64) -> Self {
        Self {
            inner,
            skip,
            remaining: length,
        }
    }
}

impl<W: Write> Write for SkipWriter<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let len = buf.len();
        let mut buf = buf;
        if self.skip > 0 {
            let drop = (self.skip).min(buf.len() as u64) as usize;
            self.skip -= drop as u64;
            buf = &buf[drop..];
        }
        let take = (self.remaining).min(buf.len() as u64) as usize;
        if take > 0 {
            self.inner.write_all(&buf[..take])?;
            self.remaining -= take as u64;
        }
        // Trailing bytes beyond the slice are swallowed.
        Ok(len)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}

/// Destination over any seekable writer; chunk slices may land in any order.
pub struct SeekableSink<W> {
    inner: Mutex<W>,
}

impl<W: Write + Seek + Send + 'static> SeekableSink<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner: Mutex::new(inner),
        }
    }

    /// Consumes the sink and returns the underlying writer.
    pub fn into_inner(self) -> W {
        self.inner.into_inner()
    }

    /// Runs `f` with exclusive access to the underlying writer.
    pub fn with_inner<R>(&self, f: impl FnOnce(&mut W) -> R) -> R {
        f(&mut self.inner.lock())
    }
}

impl<W: Write + Seek + Send + 'static> Destination for SeekableSink<W> {
    fn write_pieces(
        &self,
        codec: &dyn ErasureCoder,
        pieces: Vec<Option<Vec<u8>>>,
        data_offset: u64,
        write_offset: u64,
        length: u64,
    ) -> Result<(), DestinationError> {
        let mut inner = self.inner.lock();
        inner.seek(SeekFrom::Start(write_offset))?;
        let mut writer = SkipWriter::new(&mut *inner, data_offset, length);
        codec.recover(&pieces, data_offset + length, &mut writer)?;
        writer.flush()?;
        Ok(())
    }
}

struct OrderedState<W> {
    inner: W,
    /// Next destination offset the underlying writer expects.
    next_offset: u64,
    /// Recovered slices waiting for their predecessors, keyed by offset.
    pending: BTreeMap<u64, Vec<u8>>,
}

/// Destination over a forward-only writer; out-of-order chunk slices are
/// buffered until all prior bytes have been flushed.
pub struct OrderedSink<W> {
    state: Mutex<OrderedState<W>>,
}

impl<W: Write + Send + 'static> OrderedSink<W> {
    pub fn new(inner: W) -> Self {
        Self {
            state: Mutex::new(OrderedState {
                inner,
                next_offset: 0,
                pending: BTreeMap::new(),
            }),
        }
    }

    /// Bytes currently buffered waiting for earlier chunks.
    pub fn buffered(&self) -> usize {
        self.state.lock().pending.values().map(Vec::len).sum()
    }

    pub fn into_inner(self) -> W {
        self.state.into_inner().inner
    }
}

impl<W: Write + Send + 'static> Destination for OrderedSink<W> {
    fn write_pieces(
        &self,
        codec: &dyn ErasureCoder,
        pieces: Vec<Option<Vec<u8>>>,
        data_offset: u64,
        write_offset: u64,
        length: u64,
    ) -> Result<(), DestinationError> {
        let mut slice = Vec::with_capacity(length as usize);
        {
            let mut writer = SkipWriter::new(&mut slice, data_offset, length);
            codec.recover(&pieces, data_offset + length, &mut writer)?;
        }

        let mut guard = self.state.lock();
        let state = &mut *guard;
        state.pending.insert(write_offset, slice);
        // Flush everything that is now contiguous with the write head.
        while let Some(entry) = state.pending.first_entry() {
            if *entry.key() != state.next_offset {
                break;
            }
            let buf = entry.remove();
            state.next_offset += buf.len() as u64;
            state.inner.write_all(&buf)?;
        }
        state.inner.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::erasure::RsCode;
    use std::io::Cursor;

    fn encoded(data: &[u8]) -> (RsCode, Vec<Option<Vec<u8>>>) {
        let code = RsCode::new(3, 2).unwrap();
        let pieces = code.encode(data).unwrap().into_iter().map(Some).collect();
        (code, pieces)
    }

    fn plaintext(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 256) as u8).collect()
    }

    #[test]
    fn test_skip_writer_trims_prefix_and_suffix() {
        let mut out = Vec::new();
        let mut w = SkipWriter::new(&mut out, 3, 4);
        w.write_all(&[0, 1, 2, 3, 4]).unwrap();
        w.write_all(&[5, 6, 7, 8, 9]).unwrap();
        assert_eq!(out, vec![3, 4, 5, 6]);
    }

    #[test]
    fn test_seekable_sink_writes_slice_at_offset() {
        let data = plaintext(120);
        let (code, pieces) = encoded(&data);
        let sink = SeekableSink::new(Cursor::new(vec![0u8; 50]));
        // Slice [10, 30) of the chunk written at destination offset 5.
        sink.write_pieces(&code, pieces, 10, 5, 20).unwrap();
        let out = sink.into_inner().into_inner();
        assert_eq!(&out[5..25], &data[10..30]);
    }

    #[test]
    fn test_seekable_sink_accepts_any_chunk_order() {
        let data = plaintext(120);
        let (code, pieces) = encoded(&data);
        let sink = SeekableSink::new(Cursor::new(vec![0u8; 240]));
        sink.write_pieces(&code, pieces.clone(), 0, 120, 120).unwrap();
        sink.write_pieces(&code, pieces, 0, 0, 120).unwrap();
        let out = sink.into_inner().into_inner();
        assert_eq!(&out[..120], &data[..]);
        assert_eq!(&out[120..], &data[..]);
    }

    #[test]
    fn test_ordered_sink_buffers_out_of_order_writes() {
        let data = plaintext(120);
        let (code, pieces) = encoded(&data);
        let sink = OrderedSink::new(Vec::new());

        // Second chunk arrives first: nothing may reach the writer yet.
        sink.write_pieces(&code, pieces.clone(), 0, 120, 120).unwrap();
        assert_eq!(sink.buffered(), 120);

        sink.write_pieces(&code, pieces, 0, 0, 120).unwrap();
        assert_eq!(sink.buffered(), 0);

        let out = sink.into_inner();
        assert_eq!(&out[..120], &data[..]);
        assert_eq!(&out[120..], &data[..]);
    }

    #[test]
    fn test_ordered_sink_flushes_contiguous_run() {
        let data = plaintext(120);
        let (code, pieces) = encoded(&data);
        let sink = OrderedSink::new(Vec::new());

        sink.write_pieces(&code, pieces.clone(), 0, 240, 120).unwrap();
        sink.write_pieces(&code, pieces.clone(), 0, 120, 120).unwrap();
        assert_eq!(sink.buffered(), 240);

        // The missing head arrives: the whole run flushes at once.
        sink.write_pieces(&code, pieces, 0, 0, 120).unwrap();
        assert_eq!(sink.buffered(), 0);
        assert_eq!(sink.into_inner().len(), 360);
    }
}
