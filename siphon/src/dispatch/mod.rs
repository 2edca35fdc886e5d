//! Chunk dispatch heap.
//!
//! Scheduled chunks wait in a heap ordered by download priority (higher
//! first), then chunk index, then insertion order. Idle workers scan the top
//! of the heap for a chunk whose piece they hold; chunks stay in the heap
//! until terminal so every eligible worker gets to look at them, and
//! terminal entries are dropped lazily as scans encounter them.
//!
//! The heap's [`Notify`] doubles as the dispatcher condvar: it is signalled
//! on every push and by chunks on piece completion and worker removal, so
//! sleeping workers re-scan exactly when new work can exist.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::chunk::UnfinishedChunk;
use crate::snapshot::HostKey;

/// Default number of heap entries an idle worker inspects per scan.
pub const DEFAULT_SCAN_LIMIT: usize = 32;

struct HeapEntry {
    priority: u64,
    chunk_index: u64,
    sequence: u64,
    chunk: Arc<UnfinishedChunk>,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority
            && self.chunk_index == other.chunk_index
            && self.sequence == other.sequence
    }
}

impl Eq for HeapEntry {}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap: higher priority first, then earlier
        // chunks, then FIFO within a chunk index.
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.chunk_index.cmp(&self.chunk_index))
            .then_with(|| other.sequence.cmp(&self.sequence))
    }
}

/// Priority heap of scheduled chunks shared by all workers.
pub(crate) struct ChunkHeap {
    inner: Mutex<BinaryHeap<HeapEntry>>,
    wake: Arc<Notify>,
    sequence: AtomicU64,
    scan_limit: usize,
}

impl ChunkHeap {
    pub(crate) fn new(scan_limit: usize) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(BinaryHeap::new()),
            wake: Arc::new(Notify::new()),
            sequence: AtomicU64::new(0),
            scan_limit: scan_limit.max(1),
        })
    }

    /// The condvar chunks signal their events on.
    pub(crate) fn wake_handle(&self) -> Arc<Notify> {
        Arc::clone(&self.wake)
    }

    /// Schedules a chunk and wakes idle workers.
    pub(crate) fn push(&self, chunk: Arc<UnfinishedChunk>) {
        let entry = HeapEntry {
            priority: chunk.priority().value(),
            chunk_index: chunk.chunk_index(),
            sequence: self.sequence.fetch_add(1, AtomicOrdering::Relaxed),
            chunk,
        };
        self.inner.lock().push(entry);
        self.wake.notify_waiters();
    }

    /// Resolves when new work may be available.
    pub(crate) async fn notified(&self) {
        self.wake.notified().await;
    }

    /// Finds the best-scored chunk this worker can serve, inspecting at most
    /// the configured number of entries. Terminal chunks encountered on the
    /// way are dropped from the heap.
    pub(crate) fn scan(&self, host: &HostKey) -> Option<Arc<UnfinishedChunk>> {
        let mut heap = self.inner.lock();
        let mut put_back = Vec::new();
        let mut found = None;
        for _ in 0..self.scan_limit {
            let Some(entry) = heap.pop() else {
                break;
            };
            if entry.chunk.is_terminal() {
                continue;
            }
            let wants = entry.chunk.wants_worker(host);
            if wants {
                found = Some(Arc::clone(&entry.chunk));
            }
            put_back.push(entry);
            if found.is_some() {
                break;
            }
        }
        for entry in put_back {
            heap.push(entry);
        }
        found
    }

    /// All chunks currently scheduled. Used when withdrawing a killed worker.
    pub(crate) fn chunks(&self) -> Vec<Arc<UnfinishedChunk>> {
        self.inner
            .lock()
            .iter()
            .map(|e| Arc::clone(&e.chunk))
            .collect()
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.inner.lock().len()
    }

    #[cfg(test)]
    pub(crate) fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
