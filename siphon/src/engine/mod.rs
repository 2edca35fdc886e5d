//! Engine assembly.
//!
//! The [`Engine`] wires the pieces together: the memory manager (the single
//! backpressure valve), the dispatch heap, and the worker registry. A
//! download request is validated, split into per-chunk work, and fed onto
//! the heap by a background task that acquires each chunk's memory budget
//! first — when memory is saturated, new chunks simply wait their turn
//! before entering the heap.
//!
//! # Example
//!
//! ```ignore
//! use siphon::{Engine, EngineConfig, DownloadParams};
//!
//! let engine = Engine::new(EngineConfig::default());
//! engine.add_worker(host_client);
//!
//! let handle = engine.download(params)?;
//! handle.wait().await?;
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::chunk::{ChunkParams, UnfinishedChunk};
use crate::dispatch::{ChunkHeap, DEFAULT_SCAN_LIMIT};
use crate::download::{plan_chunks, Download, DownloadHandle, DownloadParams};
use crate::error::DownloadError;
use crate::memory::MemoryManager;
use crate::snapshot::HostKey;
use crate::worker::{HostClient, Worker, WorkerConfig};

/// Default byte budget for chunk buffers across all concurrent downloads.
pub const DEFAULT_MEMORY_BUDGET: u64 = 256 * 1024 * 1024;

/// Engine tuning knobs.
#[derive(Clone, Debug)]
pub struct EngineConfig {
    /// Byte budget handed to the memory manager.
    pub memory_budget: u64,
    /// Heap entries an idle worker inspects per scan.
    pub heap_scan_limit: usize,
    /// Configuration applied to every worker.
    pub worker: WorkerConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            memory_budget: DEFAULT_MEMORY_BUDGET,
            heap_scan_limit: DEFAULT_SCAN_LIMIT,
            worker: WorkerConfig::default(),
        }
    }
}

/// The renter-side download engine.
///
/// Must be created and used inside a tokio runtime: workers and per-download
/// feeders run as spawned tasks.
pub struct Engine {
    config: EngineConfig,
    memory: Arc<MemoryManager>,
    heap: Arc<ChunkHeap>,
    workers: Arc<Mutex<HashMap<HostKey, Arc<Worker>>>>,
    shutdown: CancellationToken,
}

impl Engine {
    pub fn new(config: EngineConfig) -> Self {
        info!(
            memory_budget = config.memory_budget,
            heap_scan_limit = config.heap_scan_limit,
            "download engine starting"
        );
        Self {
            memory: Arc::new(MemoryManager::new(config.memory_budget)),
            heap: ChunkHeap::new(config.heap_scan_limit),
            workers: Arc::new(Mutex::new(HashMap::new())),
            shutdown: CancellationToken::new(),
            config,
        }
    }

    /// The engine's memory manager.
    pub fn memory(&self) -> &Arc<MemoryManager> {
        &self.memory
    }

    /// Number of live workers.
    pub fn worker_count(&self) -> usize {
        self.workers.lock().len()
    }

    /// Registers a worker for the given host and starts its job loop.
    /// Replacing an existing worker for the same host kills the old one.
    pub fn add_worker(&self, host: Arc<dyn HostClient>) -> HostKey {
        let worker = Worker::new(host, self.config.worker.clone());
        let key = worker.key().clone();
        let replaced = self.workers.lock().insert(key.clone(), Arc::clone(&worker));
        if let Some(old) = replaced {
            old.kill();
            self.withdraw_worker(&key);
        }
        debug!(worker = %key, "worker registered");
        tokio::spawn(Arc::clone(&worker).run(Arc::clone(&self.heap)));
        key
    }

    /// Kills and deregisters a worker. Chunks counting on it observe the
    /// removal and re-plan or fail.
    pub fn remove_worker(&self, key: &HostKey) -> bool {
        let Some(worker) = self.workers.lock().remove(key) else {
            return false;
        };
        worker.kill();
        self.withdraw_worker(key);
        true
    }

    fn withdraw_worker(&self, key: &HostKey) {
        for chunk in self.heap.chunks() {
            chunk.remove_worker(key);
        }
    }

    /// Submits a download and returns its handle.
    pub fn download(&self, params: DownloadParams) -> Result<DownloadHandle, DownloadError> {
        if self.shutdown.is_cancelled() {
            return Err(DownloadError::ShuttingDown);
        }
        let snapshot = &params.snapshot;
        if params.length == 0 {
            return Err(DownloadError::InvalidParams(
                "length must be non-zero".to_string(),
            ));
        }
        let end = params.offset.checked_add(params.length).ok_or_else(|| {
            DownloadError::InvalidParams("offset + length overflows".to_string())
        })?;
        if end > snapshot.file_size() {
            return Err(DownloadError::InvalidParams(format!(
                "range [{}, {}) exceeds file size {}",
                params.offset,
                end,
                snapshot.file_size()
            )));
        }
        let min = snapshot.erasure().min_pieces();
        let max_overdrive = snapshot.erasure().num_pieces() - min;
        if params.overdrive > max_overdrive {
            return Err(DownloadError::InvalidParams(format!(
                "overdrive {} exceeds parity pieces {}",
                params.overdrive, max_overdrive
            )));
        }

        let plans = plan_chunks(snapshot, params.offset, params.length);
        let download = Download::new(
            plans.len(),
            params.priority,
            self.shutdown.child_token(),
        );
        debug!(
            offset = params.offset,
            length = params.length,
            chunks = plans.len(),
            priority = params.priority.value(),
            overdrive = params.overdrive,
            "download submitted"
        );

        let chunks: Vec<Arc<UnfinishedChunk>> = plans
            .iter()
            .map(|plan| {
                UnfinishedChunk::new(
                    ChunkParams {
                        snapshot: params.snapshot.clone(),
                        chunk_index: plan.chunk_index,
                        fetch_offset: plan.fetch_offset,
                        fetch_length: plan.fetch_length,
                        write_offset: plan.write_offset,
                        priority: params.priority,
                        overdrive: params.overdrive,
                        latency_target: params.latency_target,
                        needs_memory: true,
                    },
                    Arc::clone(&download),
                    Arc::clone(&self.memory),
                    Arc::clone(&params.destination),
                    self.heap.wake_handle(),
                )
            })
            .collect();

        // Memory per chunk covers the minimum pieces plus overdrive buffers.
        let memory_per_chunk = (min + params.overdrive) as u64 * snapshot.piece_size();
        let feeder = Feeder {
            memory: Arc::clone(&self.memory),
            heap: Arc::clone(&self.heap),
            workers: Arc::clone(&self.workers),
            shutdown: self.shutdown.clone(),
            download: Arc::clone(&download),
            memory_per_chunk,
        };
        tokio::spawn(feeder.run(chunks));

        Ok(DownloadHandle::new(download))
    }

    /// Shuts the engine down: running downloads terminate, workers exit.
    pub fn shutdown(&self) {
        info!("download engine shutting down");
        self.shutdown.cancel();
        let workers: Vec<Arc<Worker>> = self.workers.lock().drain().map(|(_, w)| w).collect();
        for worker in workers {
            worker.kill();
        }
        // With the workers gone, nobody is left to observe scheduled chunks;
        // fail them here so their memory drains.
        for chunk in self.heap.chunks() {
            chunk.fail(DownloadError::ShuttingDown);
            chunk.clean_up();
        }
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Feeds a download's chunks onto the heap, one memory grant at a time.
struct Feeder {
    memory: Arc<MemoryManager>,
    heap: Arc<ChunkHeap>,
    workers: Arc<Mutex<HashMap<HostKey, Arc<Worker>>>>,
    shutdown: CancellationToken,
    download: Arc<Download>,
    memory_per_chunk: u64,
}

impl Feeder {
    async fn run(self, chunks: Vec<Arc<UnfinishedChunk>>) {
        let priority = self.download.priority().memory_priority();
        for chunk in chunks {
            if chunk.needs_memory() {
                let granted = tokio::select! {
                    biased;
                    _ = self.download.cancel_token().cancelled() => false,
                    _ = self.memory.request(self.memory_per_chunk, priority) => true,
                };
                if !granted {
                    let err = if self.shutdown.is_cancelled() {
                        DownloadError::ShuttingDown
                    } else {
                        DownloadError::Cancelled
                    };
                    chunk.fail(err);
                    chunk.clean_up();
                    continue;
                }
                chunk.set_memory_allocated(self.memory_per_chunk);
            }

            let eligible: Vec<HostKey> = self
                .workers
                .lock()
                .values()
                .filter(|w| !w.is_killed() && chunk.has_piece(w.key()))
                .map(|w| w.key().clone())
                .collect();
            chunk.set_eligible_workers(eligible);

            self.heap.push(Arc::clone(&chunk));
            // Detects immediately-doomed chunks (not enough workers) and
            // returns any surplus memory.
            chunk.clean_up();
        }
    }
}
