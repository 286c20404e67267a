use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use nix::time::{clock_gettime, ClockId};

use crate::Error;

/// Time source of a token bucket.
///
/// Timestamps are microseconds as `f64`. Only differences between two
/// timestamps are meaningful, so the epoch is up to the implementation, but
/// all buckets sharing one storage must use clocks with the same epoch.
pub trait Clock: Send + Sync {
    /// Current time in microseconds.
    fn now_micros(&self) -> Result<f64, Error>;

    /// Block the calling thread for `duration`.
    fn sleep(&self, duration: Duration);
}

/// `CLOCK_MONOTONIC` based clock.
///
/// The monotonic clock has the same epoch (system boot) in all processes,
/// so timestamps can be shared through memory mapped storage.
#[derive(Clone, Copy, Debug, Default)]
pub struct MonotonicClock;

impl Clock for MonotonicClock {
    fn now_micros(&self) -> Result<f64, Error> {
        let now = clock_gettime(ClockId::CLOCK_MONOTONIC)?;
        Ok((now.tv_sec() as f64) * 1_000_000.0 + (now.tv_nsec() as f64) / 1_000.0)
    }

    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

/// Manually driven clock.
///
/// `sleep` does not block but advances the time, which makes timing of
/// blocking consumers exactly reproducible. Clones share the same time.
#[derive(Clone, Debug)]
pub struct ManualClock {
    micros: Arc<AtomicU64>,
    slept_nanos: Arc<AtomicU64>,
}

impl ManualClock {
    /// Creates a clock starting at `start_micros`.
    pub fn new(start_micros: f64) -> Self {
        Self {
            micros: Arc::new(AtomicU64::new(start_micros.to_bits())),
            slept_nanos: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Moves the time forward without counting it as sleep.
    pub fn advance(&self, duration: Duration) {
        let delta = duration.as_nanos() as f64 / 1_000.0;
        // fetch_update only fails if the closure returns None
        let _ = self
            .micros
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |bits| {
                Some((f64::from_bits(bits) + delta).to_bits())
            });
    }

    /// Total time passed in [`Clock::sleep`] so far.
    pub fn slept(&self) -> Duration {
        Duration::from_nanos(self.slept_nanos.load(Ordering::Acquire))
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new(0.0)
    }
}

impl Clock for ManualClock {
    fn now_micros(&self) -> Result<f64, Error> {
        Ok(f64::from_bits(self.micros.load(Ordering::Acquire)))
    }

    fn sleep(&self, duration: Duration) {
        let nanos = u64::try_from(duration.as_nanos()).unwrap_or(u64::MAX);
        self.slept_nanos.fetch_add(nanos, Ordering::AcqRel);
        self.advance(duration);
    }
}
