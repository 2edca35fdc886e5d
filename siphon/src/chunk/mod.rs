//! Per-chunk download coordination.
//!
//! An [`UnfinishedChunk`] tracks one chunk of one download: which pieces are
//! registered and completed, the physical piece buffers, the workers still
//! able to serve it, and the memory charged against the chunk. All mutable
//! state sits behind a single mutex that is held only for field updates —
//! never across an await point or a call into the worker or memory manager.
//!
//! Every event (registration, completion, failure, worker removal, recovery)
//! funnels through [`UnfinishedChunk::clean_up`], which detects stalls,
//! returns surplus memory, and reinforces the fetch with standby workers
//! when registrations fall short of the overdrive target.

pub(crate) mod segments;

use std::collections::HashSet;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::crypto::merkle::{self, Hash};
use crate::destination::{Destination, DestinationError};
use crate::download::{Download, DownloadPriority};
use crate::erasure::{ErasureCoder, ErasureError};
use crate::error::DownloadError;
use crate::memory::MemoryManager;
use crate::snapshot::{ChunkMap, HostKey, Snapshot};
use crate::worker::Worker;

/// What a worker should do with a chunk it pulled.
#[derive(Debug)]
pub(crate) enum JobDecision {
    /// Fetch the described piece slice.
    Fetch(FetchTicket),
    /// Stay available for overdrive or replacement duty.
    Standby,
    /// Nothing to do; the worker's involvement with the chunk ends.
    Skip,
}

/// Everything a worker needs to fetch and verify one piece slice.
#[derive(Debug, Clone)]
pub(crate) struct FetchTicket {
    pub piece_index: usize,
    pub root: Hash,
    /// Byte range of the stored piece to request.
    pub piece_offset: u64,
    pub piece_length: u64,
    /// Merkle coordinates of the requested range.
    pub first_segment: usize,
    pub end_segment: usize,
    pub total_segments: usize,
    pub segment_size: u64,
}

/// Static per-chunk fetch instructions, fixed at creation.
pub(crate) struct ChunkParams {
    pub snapshot: Snapshot,
    pub chunk_index: u64,
    pub fetch_offset: u64,
    pub fetch_length: u64,
    pub write_offset: u64,
    pub priority: DownloadPriority,
    pub overdrive: usize,
    pub latency_target: Duration,
    pub needs_memory: bool,
}

struct ChunkState {
    /// Which pieces have completed, indexed by piece number.
    completed: Vec<bool>,
    /// Which piece slots are registered or consumed.
    usage: Vec<bool>,
    /// Fetched piece data awaiting recovery.
    physical: Vec<Option<Vec<u8>>>,
    pieces_completed: usize,
    pieces_registered: usize,
    /// Workers whose piece could still arrive.
    workers_remaining: usize,
    /// Workers currently counted in `workers_remaining`; guards against
    /// double removal.
    counted: HashSet<HostKey>,
    /// Workers that looked at this chunk via the heap already.
    visited: HashSet<HostKey>,
    standby: Vec<Arc<Worker>>,
    memory_allocated: u64,
    failed: bool,
    recovery_complete: bool,
    recovery_spawned: bool,
}

/// A chunk download in progress.
pub(crate) struct UnfinishedChunk {
    /// Self-reference handed to workers when the chunk re-enqueues itself.
    me: Weak<UnfinishedChunk>,
    chunk_index: u64,
    cache_id: String,
    snapshot: Snapshot,
    pieces: ChunkMap,
    fetch_offset: u64,
    fetch_length: u64,
    write_offset: u64,
    priority: DownloadPriority,
    overdrive: usize,
    latency_target: Duration,
    needs_memory: bool,
    memory: Arc<MemoryManager>,
    destination: Arc<dyn Destination>,
    download: Arc<Download>,
    /// Dispatcher condvar, shared with the chunk heap.
    wake: Arc<Notify>,
    state: Mutex<ChunkState>,
}

impl UnfinishedChunk {
    pub(crate) fn new(
        params: ChunkParams,
        download: Arc<Download>,
        memory: Arc<MemoryManager>,
        destination: Arc<dyn Destination>,
        wake: Arc<Notify>,
    ) -> Arc<Self> {
        let num_pieces = params.snapshot.erasure().num_pieces();
        let pieces = params
            .snapshot
            .chunk_map(params.chunk_index)
            .cloned()
            .unwrap_or_default();
        let cache_id = params.snapshot.cache_id(params.chunk_index);
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            chunk_index: params.chunk_index,
            cache_id,
            snapshot: params.snapshot,
            pieces,
            fetch_offset: params.fetch_offset,
            fetch_length: params.fetch_length,
            write_offset: params.write_offset,
            priority: params.priority,
            overdrive: params.overdrive,
            latency_target: params.latency_target,
            needs_memory: params.needs_memory,
            memory,
            destination,
            download,
            wake,
            state: Mutex::new(ChunkState {
                completed: vec![false; num_pieces],
                usage: vec![false; num_pieces],
                physical: vec![None; num_pieces],
                pieces_completed: 0,
                pieces_registered: 0,
                workers_remaining: 0,
                counted: HashSet::new(),
                visited: HashSet::new(),
                standby: Vec::new(),
                memory_allocated: 0,
                failed: false,
                recovery_complete: false,
                recovery_spawned: false,
            }),
        })
    }

    pub(crate) fn chunk_index(&self) -> u64 {
        self.chunk_index
    }

    pub(crate) fn cache_id(&self) -> &str {
        &self.cache_id
    }

    pub(crate) fn priority(&self) -> DownloadPriority {
        self.priority
    }

    pub(crate) fn latency_target(&self) -> Duration {
        self.latency_target
    }

    pub(crate) fn erasure(&self) -> &Arc<dyn ErasureCoder> {
        self.snapshot.erasure()
    }

    pub(crate) fn snapshot(&self) -> &Snapshot {
        &self.snapshot
    }

    pub(crate) fn cancel_token(&self) -> &CancellationToken {
        self.download.cancel_token()
    }

    /// True if this host stores a piece of the chunk.
    pub(crate) fn has_piece(&self, host: &HostKey) -> bool {
        self.pieces.piece_for(host).is_some()
    }

    /// False when the caller pre-allocated this chunk's buffers; the feeder
    /// then skips the memory manager.
    pub(crate) fn needs_memory(&self) -> bool {
        self.needs_memory
    }

    fn min_pieces(&self) -> usize {
        self.snapshot.erasure().min_pieces()
    }

    /// Records which workers can serve this chunk. Called once before the
    /// chunk is scheduled.
    pub(crate) fn set_eligible_workers(&self, workers: impl IntoIterator<Item = HostKey>) {
        let mut st = self.state.lock();
        st.counted = workers.into_iter().collect();
        st.workers_remaining = st.counted.len();
    }

    /// Records the memory charged to this chunk by the feeder.
    pub(crate) fn set_memory_allocated(&self, amount: u64) {
        self.state.lock().memory_allocated = amount;
    }

    /// True once the chunk can make no further progress.
    pub(crate) fn is_terminal(&self) -> bool {
        let st = self.state.lock();
        st.failed || st.recovery_complete
    }

    /// Cheap pre-filter for the heap scan: should this worker bother calling
    /// [`Self::plan_job`]? Direct enqueues bypass this check.
    pub(crate) fn wants_worker(&self, host: &HostKey) -> bool {
        if self.pieces.piece_for(host).is_none() {
            return false;
        }
        let st = self.state.lock();
        !st.failed
            && !st.recovery_spawned
            && st.pieces_completed < self.min_pieces()
            && !st.visited.contains(host)
    }

    /// Decides what the given worker should do for this chunk, registering
    /// the piece when a fetch is warranted.
    pub(crate) fn plan_job(&self, host: &HostKey) -> JobDecision {
        let Some(location) = self.pieces.piece_for(host).copied() else {
            return JobDecision::Skip;
        };
        if self.download.is_cancelled() {
            self.fail(DownloadError::Cancelled);
            return JobDecision::Skip;
        }

        let min = self.min_pieces();
        let mut st = self.state.lock();
        st.visited.insert(host.clone());
        if st.failed || st.recovery_spawned || st.pieces_completed >= min {
            return JobDecision::Skip;
        }

        let index = location.piece_index as usize;
        let desired = min + self.overdrive - st.pieces_completed;
        if st.usage[index] || st.pieces_registered >= desired {
            return JobDecision::Standby;
        }

        st.usage[index] = true;
        st.pieces_registered += 1;
        drop(st);

        let coder = self.snapshot.erasure();
        let range = segments::piece_range(
            self.fetch_offset,
            self.fetch_length,
            self.snapshot.piece_size(),
            &**coder,
        );
        let segment_size = self.snapshot.merkle_segment_size();
        let total_segments =
            merkle::segment_count(self.snapshot.piece_size(), segment_size) as usize;
        let first_segment = (range.offset / segment_size) as usize;
        let end_segment =
            ((range.offset + range.length).div_ceil(segment_size) as usize).min(total_segments);

        JobDecision::Fetch(FetchTicket {
            piece_index: index,
            root: location.root,
            piece_offset: range.offset,
            piece_length: range.length,
            first_segment,
            end_segment,
            total_segments,
            segment_size,
        })
    }

    /// Parks a worker for overdrive or replacement duty.
    pub(crate) fn add_standby(&self, worker: Arc<Worker>) {
        self.state.lock().standby.push(worker);
    }

    /// Stores a fetched, verified, decrypted piece and triggers recovery once
    /// enough pieces have landed.
    pub(crate) fn complete_piece(&self, host: &HostKey, piece_index: usize, data: Vec<u8>) {
        let min = self.min_pieces();
        let mut recovery_pieces = None;
        {
            let mut st = self.state.lock();
            st.pieces_registered = st.pieces_registered.saturating_sub(1);
            if !st.failed && !st.recovery_spawned {
                st.physical[piece_index] = Some(data);
                st.completed[piece_index] = true;
                st.pieces_completed += 1;
                debug_assert_eq!(
                    st.completed.iter().filter(|c| **c).count(),
                    st.pieces_completed,
                    "completed pieces out of sync with counter"
                );
                if st.pieces_completed >= min {
                    st.recovery_spawned = true;
                    recovery_pieces = Some(std::mem::take(&mut st.physical));
                }
            }
            Self::remove_worker_locked(&mut st, host);
        }

        debug!(
            chunk = %self.cache_id,
            piece = piece_index,
            worker = %host,
            "piece completed"
        );
        if let Some(pieces) = recovery_pieces {
            self.spawn_recovery(pieces);
        }
        self.clean_up();
        self.wake.notify_waiters();
    }

    /// Clears a failed registration so the piece can be retried elsewhere.
    pub(crate) fn fail_piece(&self, host: &HostKey, piece_index: usize) {
        {
            let mut st = self.state.lock();
            st.pieces_registered = st.pieces_registered.saturating_sub(1);
            if !st.completed[piece_index] {
                st.usage[piece_index] = false;
            }
            Self::remove_worker_locked(&mut st, host);
        }
        self.clean_up();
        self.wake.notify_waiters();
    }

    /// Ends a worker's involvement with this chunk.
    pub(crate) fn remove_worker(&self, host: &HostKey) {
        {
            let mut st = self.state.lock();
            Self::remove_worker_locked(&mut st, host);
        }
        self.clean_up();
        self.wake.notify_waiters();
    }

    fn remove_worker_locked(st: &mut ChunkState, host: &HostKey) {
        if st.counted.remove(host) {
            st.workers_remaining -= 1;
        }
    }

    /// Marks the chunk failed and propagates the error to the download.
    /// Idempotent; the first failure sticks.
    pub(crate) fn fail(&self, err: DownloadError) {
        let report = {
            let mut st = self.state.lock();
            Self::fail_locked(&mut st, err)
        };
        if let Some(err) = report {
            warn!(chunk = %self.cache_id, error = %err, "chunk failed");
            self.download.fail(err);
        }
    }

    fn fail_locked(st: &mut ChunkState, err: DownloadError) -> Option<DownloadError> {
        if st.failed {
            return None;
        }
        st.failed = true;
        st.recovery_complete = true;
        st.recovery_spawned = true;
        // Wipe the physical buffers; the memory accounting catches up in
        // clean_up as outstanding registrations resolve.
        for slot in st.physical.iter_mut() {
            *slot = None;
        }
        Some(err)
    }

    /// The bottleneck routine run after every event.
    ///
    /// Detects chunks that can no longer complete, returns surplus memory,
    /// and wakes standby workers when registrations fall short of the
    /// overdrive target.
    pub(crate) fn clean_up(&self) {
        let min = self.min_pieces();
        let mut standby = Vec::new();
        let mut newly_failed = None;
        let excess;
        {
            let mut st = self.state.lock();
            if !st.failed && st.workers_remaining + st.pieces_completed < min {
                let remaining = st.workers_remaining;
                let completed = st.pieces_completed;
                newly_failed = Self::fail_locked(
                    &mut st,
                    DownloadError::NotEnoughWorkers {
                        chunk: self.chunk_index,
                        remaining,
                        completed,
                        min_pieces: min,
                    },
                );
            }
            excess = self.reclaimable_memory_locked(&mut st);

            if !st.failed && st.pieces_completed < min {
                let desired = min + self.overdrive - st.pieces_completed;
                if st.pieces_registered < desired && !st.standby.is_empty() {
                    standby = std::mem::take(&mut st.standby);
                }
            }
        }

        if excess > 0 {
            self.memory.return_memory(excess);
        }
        if let Some(err) = newly_failed {
            warn!(chunk = %self.cache_id, error = %err, "chunk failed");
            self.download.fail(err);
        }
        if !standby.is_empty() {
            let Some(me) = self.me.upgrade() else {
                return;
            };
            // Wake the most promising workers first; enqueue failures mean the
            // worker died in the meantime and can no longer serve the chunk.
            standby.sort_by_key(|w| w.standby_score());
            for worker in standby {
                if !worker.enqueue(Arc::clone(&me)) {
                    self.remove_worker(worker.key());
                }
            }
        }
    }

    /// Memory beyond what the chunk can still use, per the three accounting
    /// regimes: before enough pieces have completed, after, and after
    /// recovery.
    fn reclaimable_memory_locked(&self, st: &mut ChunkState) -> u64 {
        let piece_size = self.snapshot.piece_size();
        let mut max = (st.workers_remaining + st.pieces_completed) as u64 * piece_size;
        if st.pieces_completed >= self.min_pieces() {
            max = (st.pieces_completed + st.pieces_registered) as u64 * piece_size;
        }
        if st.recovery_complete {
            max = st.pieces_registered as u64 * piece_size;
        }
        if st.memory_allocated > max {
            let excess = st.memory_allocated - max;
            st.memory_allocated = max;
            excess
        } else {
            0
        }
    }

    fn spawn_recovery(&self, pieces: Vec<Option<Vec<u8>>>) {
        let Some(chunk) = self.me.upgrade() else {
            return;
        };
        tokio::spawn(async move {
            let decode = Arc::clone(&chunk);
            let result = tokio::task::spawn_blocking(move || {
                let coder = Arc::clone(decode.erasure());
                let data_offset = segments::recovered_data_offset(decode.fetch_offset, &*coder);
                decode.destination.write_pieces(
                    &*coder,
                    pieces,
                    data_offset,
                    decode.write_offset,
                    decode.fetch_length,
                )
            })
            .await;

            match result {
                Ok(Ok(())) => chunk.finalize_recovery(),
                Ok(Err(DestinationError::Recovery(source))) => {
                    chunk.fail(DownloadError::Codec {
                        chunk: chunk.chunk_index,
                        source,
                    });
                    chunk.clean_up();
                }
                Ok(Err(DestinationError::Io(err))) => {
                    chunk.fail(DownloadError::Destination {
                        chunk: chunk.chunk_index,
                        message: err.to_string(),
                    });
                    chunk.clean_up();
                }
                Err(join_err) => {
                    chunk.fail(DownloadError::Codec {
                        chunk: chunk.chunk_index,
                        source: ErasureError::Codec(join_err.to_string()),
                    });
                    chunk.clean_up();
                }
            }
            chunk.wake.notify_waiters();
        });
    }

    fn finalize_recovery(&self) {
        {
            let mut st = self.state.lock();
            st.recovery_complete = true;
        }
        debug!(chunk = %self.cache_id, "chunk recovered");
        self.clean_up();
        self.download.chunk_complete(self.fetch_length);
    }

    #[cfg(test)]
    pub(crate) fn test_state(&self) -> (usize, usize, usize, u64, bool, bool) {
        let st = self.state.lock();
        (
            st.pieces_completed,
            st.pieces_registered,
            st.workers_remaining,
            st.memory_allocated,
            st.failed,
            st.recovery_complete,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::MasterKey;
    use crate::destination::SeekableSink;
    use crate::download::DownloadHandle;
    use crate::erasure::RsCode;
    use crate::snapshot::SnapshotBuilder;
    use std::io::Cursor;

    const CHUNK_SIZE: u64 = 120;

    fn hosts(n: usize) -> Vec<HostKey> {
        (0..n).map(|i| HostKey::new(format!("h{i}"))).collect()
    }

    struct Fixture {
        chunk: Arc<UnfinishedChunk>,
        download: Arc<Download>,
        memory: Arc<MemoryManager>,
        plaintext: Vec<u8>,
        /// Decrypted piece data as the workers would hand it over.
        pieces: Vec<Vec<u8>>,
        sink: Arc<SeekableSink<Cursor<Vec<u8>>>>,
    }

    fn fixture(overdrive: usize, fetch_offset: u64, fetch_length: u64) -> Fixture {
        let erasure: Arc<dyn ErasureCoder> = Arc::new(RsCode::segmented(3, 2, 8).unwrap());
        let plaintext: Vec<u8> = (0..CHUNK_SIZE).map(|i| (i % 256) as u8).collect();
        let built = SnapshotBuilder::new("f", MasterKey::from_seed(b"k"), erasure, CHUNK_SIZE)
            .hosts(hosts(5))
            .build(&plaintext)
            .unwrap();

        // Plain (decrypted) pieces, as a worker would produce them.
        let pieces = built
            .snapshot
            .erasure()
            .encode(&plaintext)
            .unwrap();

        let download = Download::new(1, DownloadPriority::LOW, CancellationToken::new());
        let memory = Arc::new(MemoryManager::new(1 << 20));
        let sink = Arc::new(SeekableSink::new(Cursor::new(vec![0u8; 200])));
        let chunk = UnfinishedChunk::new(
            ChunkParams {
                snapshot: built.snapshot,
                chunk_index: 0,
                fetch_offset,
                fetch_length,
                write_offset: 0,
                priority: DownloadPriority::LOW,
                overdrive,
                latency_target: Duration::from_millis(100),
                needs_memory: true,
            },
            Arc::clone(&download),
            Arc::clone(&memory),
            sink.clone() as Arc<dyn Destination>,
            Arc::new(Notify::new()),
        );
        chunk.set_eligible_workers(hosts(5));
        Fixture {
            chunk,
            download,
            memory,
            plaintext,
            pieces,
            sink,
        }
    }

    fn fetch_index(decision: JobDecision) -> (usize, FetchTicket) {
        match decision {
            JobDecision::Fetch(t) => (t.piece_index, t),
            other => panic!("expected fetch, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_registrations_stop_at_min_plus_overdrive() {
        let fx = fixture(1, 0, 120);
        let h = hosts(5);
        // With overdrive 1, four registrations are accepted; the fifth worker
        // goes on standby.
        for host in h.iter().take(4) {
            fetch_index(fx.chunk.plan_job(host));
        }
        assert!(matches!(fx.chunk.plan_job(&h[4]), JobDecision::Standby));
        let (_, registered, _, _, _, _) = fx.chunk.test_state();
        assert_eq!(registered, 4);
    }

    #[tokio::test]
    async fn test_completion_recovers_and_notifies_download() {
        let fx = fixture(0, 0, 120);
        let h = hosts(5);
        let handle = DownloadHandle::new(Arc::clone(&fx.download));

        for host in h.iter().take(3) {
            let (index, ticket) = fetch_index(fx.chunk.plan_job(host));
            let data = fx.pieces[index]
                [ticket.piece_offset as usize..(ticket.piece_offset + ticket.piece_length) as usize]
                .to_vec();
            fx.chunk.complete_piece(host, index, data);
        }

        handle.wait().await.unwrap();
        let (completed, _, remaining, _, failed, recovered) = fx.chunk.test_state();
        assert_eq!(completed, 3);
        assert!(recovered);
        assert!(!failed);
        // The two unused workers stay remaining.
        assert_eq!(remaining, 2);
        assert_eq!(handle.progress().bytes_written, 120);
    }

    #[tokio::test]
    async fn test_recovered_bytes_match_plaintext_slice() {
        let fx = fixture(0, 10, 20);
        let h = hosts(5);
        let handle = DownloadHandle::new(Arc::clone(&fx.download));

        for host in h.iter().take(3) {
            let (index, ticket) = fetch_index(fx.chunk.plan_job(host));
            // Partial fetch: only two 8-byte rows of each piece.
            assert_eq!(ticket.piece_length, 16);
            let data = fx.pieces[index]
                [ticket.piece_offset as usize..(ticket.piece_offset + ticket.piece_length) as usize]
                .to_vec();
            fx.chunk.complete_piece(host, index, data);
        }

        handle.wait().await.unwrap();
        let out = fx.sink.with_inner(|c| c.get_ref().clone());
        assert_eq!(&out[..20], &fx.plaintext[10..30]);
    }

    #[tokio::test]
    async fn test_worker_loss_below_min_fails_chunk() {
        let fx = fixture(0, 0, 120);
        let h = hosts(5);
        fx.memory
            .request(120, crate::memory::MemoryPriority::Low)
            .await;
        fx.chunk.set_memory_allocated(120);

        // Three workers lost: 2 remaining + 0 completed < 3.
        fx.chunk.remove_worker(&h[0]);
        fx.chunk.remove_worker(&h[1]);
        fx.chunk.remove_worker(&h[2]);

        let (_, _, remaining, allocated, failed, _) = fx.chunk.test_state();
        assert_eq!(remaining, 2);
        assert!(failed);
        // All memory returned on the failure path.
        assert_eq!(allocated, 0);
        assert_eq!(fx.memory.available(), 1 << 20);
        assert!(matches!(
            fx.download.terminal_error(),
            Some(DownloadError::NotEnoughWorkers { chunk: 0, .. })
        ));
    }

    #[tokio::test]
    async fn test_failed_fetch_frees_slot_for_retry() {
        let fx = fixture(0, 0, 120);
        let h = hosts(5);
        let (index, _) = fetch_index(fx.chunk.plan_job(&h[0]));
        fx.chunk.fail_piece(&h[0], index);

        let (_, registered, remaining, _, failed, _) = fx.chunk.test_state();
        assert_eq!(registered, 0);
        assert_eq!(remaining, 4);
        assert!(!failed);

        // Another worker holding the same piece index could register it now;
        // here we just confirm a different worker still registers fine.
        fetch_index(fx.chunk.plan_job(&h[1]));
    }

    #[tokio::test]
    async fn test_memory_returns_as_workers_resolve() {
        let fx = fixture(0, 0, 120);
        let h = hosts(5);
        let piece_size = 40u64;
        // Feeder granted min * piece_size.
        fx.memory
            .request(3 * piece_size, crate::memory::MemoryPriority::Low)
            .await;
        fx.chunk.set_memory_allocated(3 * piece_size);

        for host in h.iter().take(3) {
            let (index, ticket) = fetch_index(fx.chunk.plan_job(host));
            let data = fx.pieces[index]
                [ticket.piece_offset as usize..(ticket.piece_offset + ticket.piece_length) as usize]
                .to_vec();
            fx.chunk.complete_piece(host, index, data);
        }
        let handle = DownloadHandle::new(Arc::clone(&fx.download));
        handle.wait().await.unwrap();

        // After recovery with no registrations outstanding everything is
        // returned.
        let (_, _, _, allocated, _, _) = fx.chunk.test_state();
        assert_eq!(allocated, 0);
        assert_eq!(fx.memory.available(), 1 << 20);
    }

    #[tokio::test]
    async fn test_cancelled_download_fails_chunk_on_plan() {
        let fx = fixture(0, 0, 120);
        let h = hosts(5);
        fx.download.fail(DownloadError::Cancelled);
        assert!(matches!(fx.chunk.plan_job(&h[0]), JobDecision::Skip));
        let (_, _, _, _, failed, _) = fx.chunk.test_state();
        assert!(failed);
    }

    #[tokio::test]
    async fn test_late_completion_after_recovery_is_discarded() {
        let fx = fixture(1, 0, 120);
        let h = hosts(5);
        let handle = DownloadHandle::new(Arc::clone(&fx.download));

        // Register four (overdrive 1), complete three.
        let mut tickets = Vec::new();
        for host in h.iter().take(4) {
            tickets.push(fetch_index(fx.chunk.plan_job(host)));
        }
        for (i, host) in h.iter().take(3).enumerate() {
            let (index, ref ticket) = tickets[i];
            let data = fx.pieces[index]
                [ticket.piece_offset as usize..(ticket.piece_offset + ticket.piece_length) as usize]
                .to_vec();
            fx.chunk.complete_piece(host, index, data);
        }
        handle.wait().await.unwrap();

        // The overdrive worker reports afterwards.
        let (index, ref ticket) = tickets[3];
        let data = fx.pieces[index]
            [ticket.piece_offset as usize..(ticket.piece_offset + ticket.piece_length) as usize]
            .to_vec();
        fx.chunk.complete_piece(&h[3], index, data);

        let (completed, registered, _, _, failed, recovered) = fx.chunk.test_state();
        assert_eq!(completed, 3, "late piece is not counted");
        assert_eq!(registered, 0);
        assert!(recovered);
        assert!(!failed);
    }
}
