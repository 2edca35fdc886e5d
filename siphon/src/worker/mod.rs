//! Per-host download workers.
//!
//! One worker exists per host contract. It owns a direct job queue, a kill
//! switch, and a rolling latency estimate, and executes one piece fetch at a
//! time: pull a chunk, register a piece, fetch the slice under a deadline,
//! verify it against the host's Merkle commitment, decrypt, and hand the
//! bytes to the chunk.
//!
//! Fetch failures are recoverable: the registration is cleared so another
//! worker can pick the piece up, the failure counter and cooldown advance,
//! and a worker that keeps failing is killed. Integrity failures advance the
//! counter but never the cooldown — a host caught lying gets no grace.

pub mod host;
pub(crate) mod latency;

pub use self::host::{BoxFuture, HostClient, HostError, MemoryHost, PieceResponse};

use std::collections::VecDeque;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::chunk::{FetchTicket, JobDecision, UnfinishedChunk};
use crate::crypto::merkle;
use crate::dispatch::ChunkHeap;
use crate::snapshot::HostKey;
use self::latency::LatencyEstimate;

/// Consecutive failures before a worker is killed.
pub const DEFAULT_MAX_CONSECUTIVE_FAILURES: u32 = 5;

/// Capacity of a worker's direct job queue.
pub const DEFAULT_QUEUE_CAPACITY: usize = 64;

/// Latency assumed for a worker with no completed jobs yet.
pub const DEFAULT_INITIAL_LATENCY_ESTIMATE: Duration = Duration::from_millis(200);

/// Base cooldown after a transport failure; doubles per consecutive failure.
pub const DEFAULT_COOLDOWN_BASE: Duration = Duration::from_millis(500);

/// Upper bound on the failure cooldown.
pub const DEFAULT_COOLDOWN_MAX: Duration = Duration::from_secs(30);

/// How often an idle worker rescans the heap even without a wakeup.
const IDLE_RESCAN_INTERVAL: Duration = Duration::from_millis(100);

/// Tuning knobs for workers.
#[derive(Clone, Debug)]
pub struct WorkerConfig {
    pub max_consecutive_failures: u32,
    pub queue_capacity: usize,
    pub initial_latency_estimate: Duration,
    pub cooldown_base: Duration,
    pub cooldown_max: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            max_consecutive_failures: DEFAULT_MAX_CONSECUTIVE_FAILURES,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            initial_latency_estimate: DEFAULT_INITIAL_LATENCY_ESTIMATE,
            cooldown_base: DEFAULT_COOLDOWN_BASE,
            cooldown_max: DEFAULT_COOLDOWN_MAX,
        }
    }
}

struct WorkerState {
    queue: VecDeque<Arc<UnfinishedChunk>>,
    killed: bool,
    consecutive_failures: u32,
    cooldown_until: Option<Instant>,
}

enum FetchOutcome {
    Success(Vec<u8>),
    HostFailure(HostError),
    Cancelled,
    Killed,
}

/// Client-side proxy for one host contract; executes piece fetches serially.
pub struct Worker {
    me: Weak<Worker>,
    key: HostKey,
    host: Arc<dyn HostClient>,
    config: WorkerConfig,
    state: Mutex<WorkerState>,
    latency: Mutex<LatencyEstimate>,
    wake: Notify,
    killed: CancellationToken,
}

impl Worker {
    pub(crate) fn new(host: Arc<dyn HostClient>, config: WorkerConfig) -> Arc<Self> {
        let key = host.host_key();
        let initial = config.initial_latency_estimate;
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            key,
            host,
            config,
            state: Mutex::new(WorkerState {
                queue: VecDeque::new(),
                killed: false,
                consecutive_failures: 0,
                cooldown_until: None,
            }),
            latency: Mutex::new(LatencyEstimate::new(initial)),
            wake: Notify::new(),
            killed: CancellationToken::new(),
        })
    }

    pub(crate) fn key(&self) -> &HostKey {
        &self.key
    }

    /// Rolling estimate of this worker's job latency.
    pub fn estimated_latency(&self) -> Duration {
        self.latency.lock().estimate()
    }

    /// True once the worker has been killed.
    pub fn is_killed(&self) -> bool {
        self.killed.is_cancelled()
    }

    /// True while the worker is backing off after transport failures.
    pub fn on_cooldown(&self) -> bool {
        self.state
            .lock()
            .cooldown_until
            .is_some_and(|until| until > Instant::now())
    }

    /// Sort key for standby wakeups: healthy workers first, faster first.
    pub(crate) fn standby_score(&self) -> (bool, Duration) {
        (self.on_cooldown(), self.estimated_latency())
    }

    /// Adds a chunk to the worker's direct queue.
    ///
    /// Returns false if the worker is killed, its queue is full, or it holds
    /// no piece of the chunk.
    pub(crate) fn enqueue(&self, chunk: Arc<UnfinishedChunk>) -> bool {
        if !chunk.has_piece(&self.key) {
            return false;
        }
        {
            let mut st = self.state.lock();
            if st.killed || st.queue.len() >= self.config.queue_capacity {
                return false;
            }
            st.queue.push_back(chunk);
        }
        self.wake.notify_one();
        true
    }

    /// Kills the worker: the queue is drained with `remove_worker` on every
    /// pending chunk and any in-flight fetch is aborted.
    pub(crate) fn kill(&self) {
        let drained = {
            let mut st = self.state.lock();
            if st.killed {
                return;
            }
            st.killed = true;
            std::mem::take(&mut st.queue)
        };
        self.killed.cancel();
        warn!(worker = %self.key, "worker killed");
        for chunk in drained {
            chunk.remove_worker(&self.key);
        }
    }

    /// The worker's job loop. Runs until killed.
    pub(crate) async fn run(self: Arc<Self>, heap: Arc<ChunkHeap>) {
        debug!(worker = %self.key, "worker started");
        loop {
            if self.killed.is_cancelled() {
                break;
            }
            match self.next_job(&heap) {
                Some(chunk) => self.process(&heap, chunk).await,
                None => {
                    tokio::select! {
                        _ = self.killed.cancelled() => break,
                        _ = heap.notified() => {}
                        _ = self.wake.notified() => {}
                        _ = tokio::time::sleep(IDLE_RESCAN_INTERVAL) => {}
                    }
                }
            }
        }
        debug!(worker = %self.key, "worker stopped");
    }

    fn next_job(&self, heap: &ChunkHeap) -> Option<Arc<UnfinishedChunk>> {
        if let Some(chunk) = self.state.lock().queue.pop_front() {
            return Some(chunk);
        }
        heap.scan(&self.key)
    }

    async fn process(&self, heap: &Arc<ChunkHeap>, chunk: Arc<UnfinishedChunk>) {
        match chunk.plan_job(&self.key) {
            JobDecision::Fetch(ticket) => self.execute(heap, &chunk, ticket).await,
            JobDecision::Standby => {
                if let Some(me) = self.me.upgrade() {
                    chunk.add_standby(me);
                }
            }
            JobDecision::Skip => chunk.remove_worker(&self.key),
        }
    }

    /// Deadline for one piece fetch.
    fn job_deadline(&self, latency_target: Duration) -> Duration {
        latency_target.max(self.estimated_latency() * 3)
    }

    async fn execute(&self, heap: &Arc<ChunkHeap>, chunk: &Arc<UnfinishedChunk>, ticket: FetchTicket) {
        let deadline = self.job_deadline(chunk.latency_target());
        let cancel = chunk.cancel_token().clone();
        let start = Instant::now();

        let outcome = tokio::select! {
            biased;
            _ = self.killed.cancelled() => FetchOutcome::Killed,
            // Dropping the fetch future aborts the RPC at the transport layer.
            _ = cancel.cancelled() => FetchOutcome::Cancelled,
            fetched = tokio::time::timeout(
                deadline,
                self.host.fetch_piece(ticket.root, ticket.piece_offset, ticket.piece_length),
            ) => match fetched {
                Err(_) => FetchOutcome::HostFailure(HostError::Timeout(deadline)),
                Ok(Err(err)) => FetchOutcome::HostFailure(err),
                Ok(Ok(response)) => match self.verify_and_decrypt(chunk, &ticket, response) {
                    Ok(data) => FetchOutcome::Success(data),
                    Err(err) => FetchOutcome::HostFailure(err),
                },
            },
        };

        match outcome {
            FetchOutcome::Success(data) => {
                self.record_success(start.elapsed());
                chunk.complete_piece(&self.key, ticket.piece_index, data);
            }
            FetchOutcome::HostFailure(err) => {
                let integrity = matches!(err, HostError::Integrity);
                debug!(
                    worker = %self.key,
                    chunk = %chunk.cache_id(),
                    piece = ticket.piece_index,
                    error = %err,
                    "piece fetch failed"
                );
                let should_kill = self.record_failure(integrity);
                chunk.fail_piece(&self.key, ticket.piece_index);
                if should_kill {
                    self.kill_and_sweep(heap);
                }
            }
            FetchOutcome::Cancelled => {
                chunk.fail(crate::error::DownloadError::Cancelled);
                chunk.fail_piece(&self.key, ticket.piece_index);
            }
            FetchOutcome::Killed => {
                chunk.fail_piece(&self.key, ticket.piece_index);
            }
        }
    }

    fn verify_and_decrypt(
        &self,
        chunk: &Arc<UnfinishedChunk>,
        ticket: &FetchTicket,
        response: PieceResponse,
    ) -> Result<Vec<u8>, HostError> {
        if response.data.len() as u64 != ticket.piece_length {
            return Err(HostError::Integrity);
        }
        let verified = merkle::verify_range_proof(
            &ticket.root,
            &response.data,
            &response.proof,
            ticket.first_segment,
            ticket.end_segment,
            ticket.total_segments,
            ticket.segment_size,
        );
        if !verified {
            return Err(HostError::Integrity);
        }
        let mut data = response.data;
        let key = chunk
            .snapshot()
            .master_key()
            .derive_piece_key(chunk.chunk_index(), ticket.piece_index as u64);
        key.apply_at(ticket.piece_offset, &mut data);
        Ok(data)
    }

    fn record_success(&self, elapsed: Duration) {
        {
            let mut st = self.state.lock();
            st.consecutive_failures = 0;
            st.cooldown_until = None;
        }
        self.latency.lock().record(elapsed);
    }

    /// Advances the failure counter and cooldown. Returns true when the
    /// worker crossed its kill threshold.
    fn record_failure(&self, integrity: bool) -> bool {
        let mut st = self.state.lock();
        st.consecutive_failures += 1;
        if !integrity {
            let exp = st.consecutive_failures.saturating_sub(1).min(6);
            let cooldown = self
                .config
                .cooldown_base
                .saturating_mul(1 << exp)
                .min(self.config.cooldown_max);
            st.cooldown_until = Some(Instant::now() + cooldown);
        }
        st.consecutive_failures >= self.config.max_consecutive_failures
    }

    /// Kills the worker and withdraws it from every chunk still counting it.
    fn kill_and_sweep(&self, heap: &Arc<ChunkHeap>) {
        self.kill();
        for chunk in heap.chunks() {
            chunk.remove_worker(&self.key);
        }
    }

    #[cfg(test)]
    pub(crate) fn test_consecutive_failures(&self) -> u32 {
        self.state.lock().consecutive_failures
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::MasterKey;
    use crate::destination::{Destination, SeekableSink};
    use crate::download::{Download, DownloadPriority};
    use crate::erasure::{ErasureCoder, RsCode};
    use crate::memory::MemoryManager;
    use crate::snapshot::SnapshotBuilder;
    use crate::chunk::ChunkParams;
    use std::io::Cursor;

    fn test_worker() -> Arc<Worker> {
        let host = Arc::new(MemoryHost::new(HostKey::new("h0"), 64));
        Worker::new(host, WorkerConfig::default())
    }

    fn test_chunk() -> Arc<UnfinishedChunk> {
        let erasure: Arc<dyn ErasureCoder> = Arc::new(RsCode::new(3, 2).unwrap());
        let plaintext = vec![9u8; 120];
        let built = SnapshotBuilder::new("f", MasterKey::from_seed(b"k"), erasure, 120)
            .hosts(["h0", "h1", "h2", "h3", "h4"])
            .build(&plaintext)
            .unwrap();
        let download = Download::new(1, DownloadPriority::LOW, CancellationToken::new());
        let sink: Arc<dyn Destination> = Arc::new(SeekableSink::new(Cursor::new(vec![0u8; 120])));
        UnfinishedChunk::new(
            ChunkParams {
                snapshot: built.snapshot,
                chunk_index: 0,
                fetch_offset: 0,
                fetch_length: 120,
                write_offset: 0,
                priority: DownloadPriority::LOW,
                overdrive: 0,
                latency_target: Duration::from_millis(50),
                needs_memory: true,
            },
            download,
            Arc::new(MemoryManager::new(1 << 20)),
            sink,
            Arc::new(Notify::new()),
        )
    }

    #[tokio::test]
    async fn test_enqueue_rejects_foreign_chunk() {
        let host = Arc::new(MemoryHost::new(HostKey::new("stranger"), 64));
        let worker = Worker::new(host, WorkerConfig::default());
        assert!(!worker.enqueue(test_chunk()));
    }

    #[tokio::test]
    async fn test_enqueue_accepts_own_chunk() {
        let worker = test_worker();
        assert!(worker.enqueue(test_chunk()));
    }

    #[tokio::test]
    async fn test_killed_worker_rejects_enqueue_and_drains() {
        let worker = test_worker();
        let chunk = test_chunk();
        chunk.set_eligible_workers(["h0".into(), "h1".into(), "h2".into()]);
        assert!(worker.enqueue(Arc::clone(&chunk)));

        worker.kill();
        assert!(worker.is_killed());
        assert!(!worker.enqueue(Arc::clone(&chunk)));

        // The drained chunk saw remove_worker.
        let (_, _, remaining, _, _, _) = chunk.test_state();
        assert_eq!(remaining, 2);
    }

    #[tokio::test]
    async fn test_queue_capacity_bounds_enqueue() {
        let host = Arc::new(MemoryHost::new(HostKey::new("h0"), 64));
        let worker = Worker::new(
            host,
            WorkerConfig {
                queue_capacity: 1,
                ..WorkerConfig::default()
            },
        );
        assert!(worker.enqueue(test_chunk()));
        assert!(!worker.enqueue(test_chunk()));
    }

    #[tokio::test]
    async fn test_failure_counter_and_kill_threshold() {
        let host = Arc::new(MemoryHost::new(HostKey::new("h0"), 64));
        let worker = Worker::new(
            host,
            WorkerConfig {
                max_consecutive_failures: 2,
                ..WorkerConfig::default()
            },
        );
        assert!(!worker.record_failure(false));
        assert!(worker.on_cooldown());
        assert!(worker.record_failure(false));
        assert_eq!(worker.test_consecutive_failures(), 2);
    }

    #[tokio::test]
    async fn test_integrity_failures_skip_cooldown() {
        let worker = test_worker();
        worker.record_failure(true);
        assert!(!worker.on_cooldown());
        assert_eq!(worker.test_consecutive_failures(), 1);
    }

    #[tokio::test]
    async fn test_success_resets_failures() {
        let worker = test_worker();
        worker.record_failure(false);
        worker.record_success(Duration::from_millis(30));
        assert_eq!(worker.test_consecutive_failures(), 0);
        assert!(!worker.on_cooldown());
        assert_eq!(worker.estimated_latency(), Duration::from_millis(30));
    }

    #[tokio::test]
    async fn test_deadline_tracks_slow_estimate() {
        let worker = test_worker();
        // Seed estimate is 200ms; target dominates.
        assert_eq!(
            worker.job_deadline(Duration::from_secs(1)),
            Duration::from_secs(1)
        );
        // A slow worker pushes the deadline past the target.
        worker.record_success(Duration::from_secs(2));
        assert_eq!(
            worker.job_deadline(Duration::from_secs(1)),
            Duration::from_secs(6)
        );
    }
}
