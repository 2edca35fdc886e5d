//! User-visible downloads.
//!
//! A download is one logical fetch over a byte range of a file. It is split
//! into per-chunk work (see [`crate::chunk`]); this module owns the range
//! math, the aggregate progress/terminal state, and the handle returned to
//! callers.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::destination::Destination;
use crate::error::DownloadError;
use crate::memory::MemoryPriority;
use crate::snapshot::Snapshot;

/// Scheduling priority of a download.
///
/// Higher values are dispatched first. Any non-zero priority also puts the
/// download's memory requests in the memory manager's high class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DownloadPriority(pub u64);

impl DownloadPriority {
    /// Background fetches.
    pub const LOW: DownloadPriority = DownloadPriority(0);

    /// Interactive fetches a caller is blocked on.
    pub const HIGH: DownloadPriority = DownloadPriority(100);

    pub fn value(&self) -> u64 {
        self.0
    }

    pub(crate) fn memory_priority(&self) -> MemoryPriority {
        if self.0 > 0 {
            MemoryPriority::High
        } else {
            MemoryPriority::Low
        }
    }
}

impl Default for DownloadPriority {
    fn default() -> Self {
        Self::LOW
    }
}

/// Parameters of a download request.
pub struct DownloadParams {
    /// Metadata view of the file being fetched.
    pub snapshot: Snapshot,
    /// Byte offset within the file.
    pub offset: u64,
    /// Number of bytes to fetch.
    pub length: u64,
    /// Where recovered data is written.
    pub destination: Arc<dyn Destination>,
    /// Scheduling priority.
    pub priority: DownloadPriority,
    /// Extra pieces fetched beyond the minimum to absorb slow workers.
    pub overdrive: usize,
    /// Per-piece latency target; feeds the fetch deadline.
    pub latency_target: Duration,
    /// Skip locally cached sectors and always go to the network. Honored by
    /// deployments that layer a local sector store under their hosts; the
    /// engine itself treats all hosts uniformly.
    pub disable_disk_fetch: bool,
}

/// Per-chunk slice of a download's byte range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ChunkPlan {
    pub chunk_index: u64,
    /// Offset of the slice within the chunk.
    pub fetch_offset: u64,
    /// Length of the slice.
    pub fetch_length: u64,
    /// Offset within the destination where the slice lands.
    pub write_offset: u64,
}

/// Splits the byte range `[offset, offset + length)` into per-chunk fetches.
///
/// Callers validate the range against the file size first.
pub(crate) fn plan_chunks(snapshot: &Snapshot, offset: u64, length: u64) -> Vec<ChunkPlan> {
    let chunk_size = snapshot.chunk_size();
    let end = offset + length;
    let mut plans = Vec::new();
    let mut chunk_index = offset / chunk_size;
    while chunk_index * chunk_size < end {
        let chunk_start = chunk_index * chunk_size;
        let fetch_offset = offset.saturating_sub(chunk_start);
        let fetch_end = (end - chunk_start).min(snapshot.chunk_len(chunk_index));
        plans.push(ChunkPlan {
            chunk_index,
            fetch_offset,
            fetch_length: fetch_end - fetch_offset,
            write_offset: (chunk_start + fetch_offset) - offset,
        });
        chunk_index += 1;
    }
    plans
}

struct DownloadState {
    chunks_remaining: usize,
    bytes_written: u64,
    err: Option<DownloadError>,
    end_time: Option<Instant>,
}

/// Aggregate state of one logical download.
///
/// Chunks hold a non-owning reference back to their download for progress
/// updates; the download does not hold its chunks, which keeps the reference
/// graph acyclic.
pub(crate) struct Download {
    priority: DownloadPriority,
    start_time: Instant,
    cancel: CancellationToken,
    state: Mutex<DownloadState>,
    complete_tx: watch::Sender<bool>,
}

impl Download {
    pub(crate) fn new(
        num_chunks: usize,
        priority: DownloadPriority,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        let (complete_tx, _) = watch::channel(false);
        Arc::new(Self {
            priority,
            start_time: Instant::now(),
            cancel,
            state: Mutex::new(DownloadState {
                chunks_remaining: num_chunks,
                bytes_written: 0,
                err: None,
                end_time: None,
            }),
            complete_tx,
        })
    }

    pub(crate) fn priority(&self) -> DownloadPriority {
        self.priority
    }

    pub(crate) fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Records a recovered chunk. Marks the download complete when the last
    /// chunk lands.
    pub(crate) fn chunk_complete(&self, bytes: u64) {
        let mut state = self.state.lock();
        state.bytes_written += bytes;
        state.chunks_remaining = state.chunks_remaining.saturating_sub(1);
        if state.chunks_remaining == 0 && state.err.is_none() {
            state.end_time = Some(Instant::now());
            drop(state);
            let _ = self.complete_tx.send(true);
        }
    }

    /// Fails the download. The first error wins; later failures are logged
    /// and folded away rather than overwriting the primary cause.
    pub(crate) fn fail(&self, err: DownloadError) {
        let mut state = self.state.lock();
        if state.err.is_some() {
            debug!(error = %err, "additional failure after download already failed");
            return;
        }
        if state.chunks_remaining == 0 {
            // Already completed successfully; nothing to fail.
            return;
        }
        state.err = Some(err);
        state.end_time = Some(Instant::now());
        drop(state);
        // Wind down remaining work for this download.
        self.cancel.cancel();
        let _ = self.complete_tx.send(true);
    }

    pub(crate) fn terminal_error(&self) -> Option<DownloadError> {
        self.state.lock().err.clone()
    }

    pub(crate) fn is_terminal(&self) -> bool {
        let state = self.state.lock();
        state.err.is_some() || state.chunks_remaining == 0
    }

    fn progress(&self) -> DownloadProgress {
        let state = self.state.lock();
        DownloadProgress {
            bytes_written: state.bytes_written,
            chunks_remaining: state.chunks_remaining,
        }
    }
}

/// Progress snapshot of a download.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DownloadProgress {
    /// Bytes recovered and handed to the destination so far.
    pub bytes_written: u64,
    /// Chunks not yet recovered.
    pub chunks_remaining: usize,
}

/// Caller-facing handle to a running download.
#[derive(Clone)]
pub struct DownloadHandle {
    download: Arc<Download>,
}

impl std::fmt::Debug for DownloadHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DownloadHandle").finish()
    }
}

impl DownloadHandle {
    pub(crate) fn new(download: Arc<Download>) -> Self {
        Self { download }
    }

    /// Blocks until the download reaches a terminal state and returns its
    /// outcome.
    pub async fn wait(&self) -> Result<(), DownloadError> {
        let mut rx = self.download.complete_tx.subscribe();
        while !*rx.borrow_and_update() {
            if rx.changed().await.is_err() {
                break;
            }
        }
        match self.download.terminal_error() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Cancels the download. Idempotent; in-flight chunk recoveries may still
    /// land, everything else terminates with a cancellation error.
    pub fn cancel(&self) {
        self.download.fail(DownloadError::Cancelled);
    }

    /// Current progress.
    pub fn progress(&self) -> DownloadProgress {
        self.download.progress()
    }

    /// Time since submission, frozen at the terminal event.
    pub fn elapsed(&self) -> Duration {
        let end = self
            .download
            .state
            .lock()
            .end_time
            .unwrap_or_else(Instant::now);
        end.duration_since(self.download.start_time)
    }

    /// True once the download has succeeded, failed, or been cancelled.
    pub fn is_terminal(&self) -> bool {
        self.download.is_terminal()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::MasterKey;
    use crate::erasure::{ErasureCoder, RsCode};
    use crate::snapshot::ChunkMap;

    fn snapshot(file_size: u64) -> Snapshot {
        let erasure: Arc<dyn ErasureCoder> = Arc::new(RsCode::new(3, 2).unwrap());
        let num_chunks = file_size.div_ceil(120) as usize;
        Snapshot::new(
            "file",
            file_size,
            40,
            MasterKey::from_seed(b"k"),
            erasure,
            vec![ChunkMap::default(); num_chunks],
        )
    }

    #[test]
    fn test_plan_single_chunk_aligned() {
        let snap = snapshot(360);
        let plans = plan_chunks(&snap, 0, 120);
        assert_eq!(
            plans,
            vec![ChunkPlan {
                chunk_index: 0,
                fetch_offset: 0,
                fetch_length: 120,
                write_offset: 0,
            }]
        );
    }

    #[test]
    fn test_plan_straddles_chunk_boundary() {
        let snap = snapshot(360);
        let plans = plan_chunks(&snap, 100, 50);
        assert_eq!(plans.len(), 2);
        assert_eq!(
            plans[0],
            ChunkPlan {
                chunk_index: 0,
                fetch_offset: 100,
                fetch_length: 20,
                write_offset: 0,
            }
        );
        assert_eq!(
            plans[1],
            ChunkPlan {
                chunk_index: 1,
                fetch_offset: 0,
                fetch_length: 30,
                write_offset: 20,
            }
        );
    }

    #[test]
    fn test_plan_short_final_chunk() {
        let snap = snapshot(300); // chunk 2 holds 60 bytes
        let plans = plan_chunks(&snap, 240, 60);
        assert_eq!(
            plans,
            vec![ChunkPlan {
                chunk_index: 2,
                fetch_offset: 0,
                fetch_length: 60,
                write_offset: 0,
            }]
        );
    }

    #[test]
    fn test_plan_whole_file() {
        let snap = snapshot(300);
        let plans = plan_chunks(&snap, 0, 300);
        assert_eq!(plans.len(), 3);
        let total: u64 = plans.iter().map(|p| p.fetch_length).sum();
        assert_eq!(total, 300);
    }

    #[test]
    fn test_first_error_wins() {
        let d = Download::new(3, DownloadPriority::LOW, CancellationToken::new());
        d.fail(DownloadError::Cancelled);
        d.fail(DownloadError::ShuttingDown);
        assert!(matches!(d.terminal_error(), Some(DownloadError::Cancelled)));
        assert!(d.is_cancelled());
    }

    #[test]
    fn test_progress_accumulates() {
        let d = Download::new(2, DownloadPriority::LOW, CancellationToken::new());
        d.chunk_complete(120);
        let p = d.progress();
        assert_eq!(p.bytes_written, 120);
        assert_eq!(p.chunks_remaining, 1);
        assert!(!d.is_terminal());
        d.chunk_complete(60);
        assert!(d.is_terminal());
        assert!(d.terminal_error().is_none());
    }

    #[tokio::test]
    async fn test_wait_returns_after_completion() {
        let d = Download::new(1, DownloadPriority::LOW, CancellationToken::new());
        let handle = DownloadHandle::new(d.clone());
        let waiter = tokio::spawn({
            let handle = handle.clone();
            async move { handle.wait().await }
        });
        d.chunk_complete(10);
        waiter.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_cancel_is_idempotent_and_terminal() {
        let d = Download::new(5, DownloadPriority::LOW, CancellationToken::new());
        let handle = DownloadHandle::new(d);
        handle.cancel();
        handle.cancel();
        let err = handle.wait().await.unwrap_err();
        assert!(matches!(err, DownloadError::Cancelled));
    }

    #[test]
    fn test_memory_priority_mapping() {
        assert_eq!(
            DownloadPriority::LOW.memory_priority(),
            MemoryPriority::Low
        );
        assert_eq!(
            DownloadPriority::HIGH.memory_priority(),
            MemoryPriority::High
        );
        assert_eq!(
            DownloadPriority(1).memory_priority(),
            MemoryPriority::High
        );
    }
}
