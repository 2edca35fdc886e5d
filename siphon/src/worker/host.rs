//! Host capability consumed by workers.
//!
//! A [`HostClient`] is the narrow surface the engine needs from the contract
//! layer: "fetch this byte range of the sector you committed to with this
//! Merkle root". Connection management, payment, and the wire protocol all
//! live behind the trait.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use thiserror::Error;

use crate::crypto::merkle::{self, Hash, RangeProof};
use crate::snapshot::HostKey;

/// Boxed future type for dyn-compatible async methods.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Recoverable errors a piece fetch can produce.
#[derive(Debug, Error)]
pub enum HostError {
    /// The fetch exceeded its deadline.
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    /// Transport-level failure.
    #[error("network: {0}")]
    Network(String),

    /// The host no longer stores the requested sector.
    #[error("host does not store the requested sector")]
    UnknownSector,

    /// The returned bytes failed Merkle verification. The host is suspect.
    #[error("piece failed integrity verification")]
    Integrity,

    /// The worker was killed while the fetch was in flight.
    #[error("worker killed")]
    Killed,
}

/// One fetched piece slice plus the proof tying it to the sector root.
#[derive(Debug)]
pub struct PieceResponse {
    pub data: Vec<u8>,
    pub proof: RangeProof,
}

/// Client for a single remote host.
pub trait HostClient: Send + Sync + 'static {
    /// Public key of the host this client talks to.
    fn host_key(&self) -> HostKey;

    /// Fetches `length` bytes at `offset` of the sector committed to by
    /// `root`, together with a Merkle range proof for the slice.
    fn fetch_piece(&self, root: Hash, offset: u64, length: u64)
        -> BoxFuture<'_, Result<PieceResponse, HostError>>;
}

/// In-memory [`HostClient`] serving sectors from a map.
///
/// The reference implementation used by the test suite: latency, transport
/// failures, and corrupted responses can all be injected.
pub struct MemoryHost {
    key: HostKey,
    segment_size: u64,
    sectors: Mutex<HashMap<Hash, Vec<u8>>>,
    latency: Mutex<Duration>,
    fail_requests: AtomicBool,
    corrupt_responses: AtomicBool,
    fetches_started: AtomicUsize,
    fetches_completed: AtomicUsize,
    requests: Mutex<Vec<(u64, u64)>>,
}

impl MemoryHost {
    pub fn new(key: HostKey, segment_size: u64) -> Self {
        Self {
            key,
            segment_size,
            sectors: Mutex::new(HashMap::new()),
            latency: Mutex::new(Duration::ZERO),
            fail_requests: AtomicBool::new(false),
            corrupt_responses: AtomicBool::new(false),
            fetches_started: AtomicUsize::new(0),
            fetches_completed: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Loads sectors into the host, keyed by their Merkle roots.
    pub fn with_sectors(self, sectors: HashMap<Hash, Vec<u8>>) -> Self {
        *self.sectors.lock() = sectors;
        self
    }

    /// Artificial latency added to every fetch.
    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock() = latency;
    }

    /// Makes every subsequent fetch fail at the transport level.
    pub fn set_fail_requests(&self, fail: bool) {
        self.fail_requests.store(fail, Ordering::SeqCst);
    }

    /// Makes every subsequent response carry flipped bytes. The proof still
    /// matches the stored sector, so verification must fail.
    pub fn set_corrupt_responses(&self, corrupt: bool) {
        self.corrupt_responses.store(corrupt, Ordering::SeqCst);
    }

    pub fn fetches_started(&self) -> usize {
        self.fetches_started.load(Ordering::SeqCst)
    }

    pub fn fetches_completed(&self) -> usize {
        self.fetches_completed.load(Ordering::SeqCst)
    }

    /// `(offset, length)` of every fetch received so far.
    pub fn requested_ranges(&self) -> Vec<(u64, u64)> {
        self.requests.lock().clone()
    }
}

impl HostClient for MemoryHost {
    fn host_key(&self) -> HostKey {
        self.key.clone()
    }

    fn fetch_piece(
        &self,
        root: Hash,
        offset: u64,
        length: u64,
    ) -> BoxFuture<'_, Result<PieceResponse, HostError>> {
        Box::pin(async move {
            self.fetches_started.fetch_add(1, Ordering::SeqCst);
            self.requests.lock().push((offset, length));
            let latency = *self.latency.lock();
            if !latency.is_zero() {
                tokio::time::sleep(latency).await;
            }
            if self.fail_requests.load(Ordering::SeqCst) {
                return Err(HostError::Network("injected failure".to_string()));
            }

            let sector = self
                .sectors
                .lock()
                .get(&root)
                .cloned()
                .ok_or(HostError::UnknownSector)?;
            let end = offset + length;
            if end > sector.len() as u64 {
                return Err(HostError::Network(format!(
                    "requested range [{offset}, {end}) beyond sector of {} bytes",
                    sector.len()
                )));
            }

            let first = (offset / self.segment_size) as usize;
            let last = (end.div_ceil(self.segment_size) as usize)
                .min(merkle::segment_count(sector.len() as u64, self.segment_size) as usize);
            let proof = merkle::build_range_proof(&sector, first, last, self.segment_size);

            let mut data = sector[offset as usize..end as usize].to_vec();
            if self.corrupt_responses.load(Ordering::SeqCst) {
                if let Some(byte) = data.first_mut() {
                    *byte ^= 0xff;
                }
            }

            self.fetches_completed.fetch_add(1, Ordering::SeqCst);
            Ok(PieceResponse { data, proof })
        })
    }
}
