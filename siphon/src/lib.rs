//! Siphon — renter-side parallel chunk download engine for erasure-coded
//! distributed storage.
//!
//! Files are stored as erasure-coded chunks spread across untrusted remote
//! hosts: each chunk is split into N pieces of which any `min_pieces`
//! reconstruct the original data. The engine fetches enough pieces of each
//! requested chunk from per-host workers, verifies and decrypts them,
//! erasure-decodes the requested byte range, and streams it into a
//! caller-supplied destination — while bounding memory use, absorbing slow
//! or failing hosts through overdrive and standby workers, and guaranteeing
//! forward progress whenever enough honest hosts remain.
//!
//! # Architecture
//!
//! - [`memory`] — priority-aware semaphore over a fixed byte budget; the
//!   engine's single backpressure valve.
//! - [`worker`] — one serial fetch loop per host contract, with rolling
//!   latency estimates and failure backoff.
//! - `chunk` (internal) — per-chunk state machine: piece registration,
//!   overdrive reinforcement, recovery.
//! - `dispatch` (internal) — priority heap idle workers pull from.
//! - [`download`] — range math, aggregate progress, the caller's handle.
//! - [`destination`] — seekable and ordered plaintext sinks.
//! - [`erasure`], [`crypto`], [`snapshot`] — the capability seams the engine
//!   consumes: codec, keys/Merkle commitments, and file metadata.
//! - [`engine`] — wiring: worker registry, download feeder, shutdown.

pub mod crypto;
pub mod destination;
pub mod download;
pub mod engine;
pub mod erasure;
pub mod error;
pub mod memory;
pub mod snapshot;
pub mod worker;

pub(crate) mod chunk;
pub(crate) mod dispatch;

pub use destination::{Destination, DestinationError, OrderedSink, SeekableSink};
pub use download::{DownloadHandle, DownloadParams, DownloadPriority, DownloadProgress};
pub use engine::{Engine, EngineConfig};
pub use erasure::{ErasureCoder, ErasureError, RsCode};
pub use error::DownloadError;
pub use memory::{MemoryManager, MemoryPriority};
pub use snapshot::{BuiltFile, HostKey, Snapshot, SnapshotBuilder};
pub use worker::{HostClient, HostError, MemoryHost, PieceResponse, WorkerConfig};

pub use crypto::MasterKey;
