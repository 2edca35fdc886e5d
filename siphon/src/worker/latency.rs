//! Rolling latency estimation.
//!
//! Each worker keeps an exponential moving average of its recent job
//! durations. The estimate feeds two decisions: the per-job deadline
//! (`max(latency_target, 3 * estimate)`) and the order in which standby
//! workers are woken.

use std::time::Duration;

/// Weight of the newest sample in the moving average.
const EMA_WEIGHT: f64 = 0.2;

/// Exponential moving average over observed job latencies.
#[derive(Debug, Clone)]
pub(crate) struct LatencyEstimate {
    ema_ms: f64,
    samples: u64,
}

impl LatencyEstimate {
    /// Creates an estimate seeded with `initial` until real samples arrive.
    pub(crate) fn new(initial: Duration) -> Self {
        Self {
            ema_ms: initial.as_secs_f64() * 1_000.0,
            samples: 0,
        }
    }

    /// Folds a new observation into the average.
    pub(crate) fn record(&mut self, sample: Duration) {
        let ms = sample.as_secs_f64() * 1_000.0;
        if self.samples == 0 {
            // First real observation replaces the seed entirely.
            self.ema_ms = ms;
        } else {
            self.ema_ms = EMA_WEIGHT * ms + (1.0 - EMA_WEIGHT) * self.ema_ms;
        }
        self.samples += 1;
    }

    /// Current latency estimate.
    pub(crate) fn estimate(&self) -> Duration {
        Duration::from_secs_f64(self.ema_ms.max(0.0) / 1_000.0)
    }
}
