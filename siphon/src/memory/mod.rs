//! Download memory management.
//!
//! The memory manager is the engine's single backpressure valve: every chunk
//! acquires its buffer budget here before it is allowed onto the dispatch
//! heap, which bounds how many chunks can be in flight at once.
//!
//! # Semantics
//!
//! Waiters queue FIFO per priority class. When memory is returned, the high
//! queue is served from its head until it empties or its head no longer
//! fits; only then is the low queue considered. A large high-priority
//! request therefore parks at the head and holds back later high-priority
//! requests until it is satisfied, which bounds worst-case latency for
//! priority work. Requests larger than the total budget are granted when the
//! manager is completely idle, so they still make progress.
//!
//! Requests never fail; callers cancel by dropping the pending future, and
//! the manager reclaims any budget granted to a dropped waiter.

use std::collections::VecDeque;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::debug;

/// Priority class of a memory request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryPriority {
    /// Interactive downloads; served strictly before low-priority waiters.
    High,
    /// Background work; served only when no high-priority waiter exists.
    Low,
}

struct Waiter {
    amount: u64,
    tx: oneshot::Sender<()>,
}

struct Inner {
    /// Remaining budget. Goes negative while an oversized request is out.
    available: i64,
    high: VecDeque<Waiter>,
    low: VecDeque<Waiter>,
}

/// Priority-aware semaphore over a fixed byte budget.
pub struct MemoryManager {
    total: u64,
    inner: Mutex<Inner>,
}

impl MemoryManager {
    /// Creates a manager with the given byte budget.
    pub fn new(total: u64) -> Self {
        Self {
            total,
            inner: Mutex::new(Inner {
                available: total as i64,
                high: VecDeque::new(),
                low: VecDeque::new(),
            }),
        }
    }

    /// Total byte budget.
    pub fn total(&self) -> u64 {
        self.total
    }

    /// Currently uncommitted bytes.
    pub fn available(&self) -> u64 {
        self.inner.lock().available.max(0) as u64
    }

    /// Blocks until `amount` bytes can be subtracted from the budget.
    ///
    /// Zero-byte requests return immediately. Dropping the returned future
    /// abandons the request without leaking budget, even when a grant lands
    /// in the same instant the future is dropped.
    pub async fn request(&self, amount: u64, priority: MemoryPriority) {
        if amount == 0 {
            return;
        }
        let rx = {
            let mut inner = self.inner.lock();
            if self.can_grant_now(&inner, amount, priority) {
                inner.available -= amount as i64;
                return;
            }
            let (tx, rx) = oneshot::channel();
            let waiter = Waiter { amount, tx };
            match priority {
                MemoryPriority::High => inner.high.push_back(waiter),
                MemoryPriority::Low => inner.low.push_back(waiter),
            }
            debug!(
                amount,
                ?priority,
                available = inner.available,
                "memory request parked"
            );
            rx
        };
        let mut pending = PendingRequest {
            manager: self,
            amount,
            rx,
            granted: false,
        };
        if (&mut pending.rx).await.is_ok() {
            pending.granted = true;
        }
    }

    /// Returns `amount` bytes to the budget and wakes eligible waiters.
    pub fn return_memory(&self, amount: u64) {
        if amount == 0 {
            return;
        }
        let mut inner = self.inner.lock();
        inner.available += amount as i64;
        debug_assert!(
            inner.available <= self.total as i64,
            "memory over-returned: {} > {}",
            inner.available,
            self.total
        );
        self.wake_waiters(&mut inner);
    }

    /// A request fits if it is covered by the available budget, or if it
    /// exceeds the total budget and the manager is completely idle.
    fn fits(&self, inner: &Inner, amount: u64) -> bool {
        inner.available >= amount as i64
            || (amount > self.total && inner.available == self.total as i64)
    }

    fn can_grant_now(&self, inner: &Inner, amount: u64, priority: MemoryPriority) -> bool {
        match priority {
            MemoryPriority::High => inner.high.is_empty() && self.fits(inner, amount),
            MemoryPriority::Low => {
                inner.high.is_empty() && inner.low.is_empty() && self.fits(inner, amount)
            }
        }
    }

    fn wake_waiters(&self, inner: &mut Inner) {
        loop {
            Self::prune_dropped(&mut inner.high);
            match inner.high.front().map(|w| self.fits(inner, w.amount)) {
                Some(true) => {
                    if let Some(waiter) = inner.high.pop_front() {
                        inner.available -= waiter.amount as i64;
                        if waiter.tx.send(()).is_err() {
                            inner.available += waiter.amount as i64;
                        }
                    }
                    continue;
                }
                // A blocked high-priority head also blocks the low queue.
                Some(false) => return,
                None => {}
            }

            Self::prune_dropped(&mut inner.low);
            match inner.low.front().map(|w| self.fits(inner, w.amount)) {
                Some(true) => {
                    if let Some(waiter) = inner.low.pop_front() {
                        inner.available -= waiter.amount as i64;
                        if waiter.tx.send(()).is_err() {
                            inner.available += waiter.amount as i64;
                        }
                    }
                }
                _ => return,
            }
        }
    }

    fn prune_dropped(queue: &mut VecDeque<Waiter>) {
        while queue.front().is_some_and(|w| w.tx.is_closed()) {
            queue.pop_front();
        }
    }
}

/// In-flight request; hands a granted-but-unconsumed budget back if the
/// request future is dropped after the grant fired.
struct PendingRequest<'a> {
    manager: &'a MemoryManager,
    amount: u64,
    rx: oneshot::Receiver<()>,
    granted: bool,
}

impl Drop for PendingRequest<'_> {
    fn drop(&mut self) {
        if self.granted {
            return;
        }
        self.rx.close();
        if self.rx.try_recv().is_ok() {
            self.manager.return_memory(self.amount);
        }
    }
}

impl std::fmt::Debug for MemoryManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("MemoryManager")
            .field("total", &self.total)
            .field("available", &inner.available)
            .field("high_waiters", &inner.high.len())
            .field("low_waiters", &inner.low.len())
            .finish()
    }
}
