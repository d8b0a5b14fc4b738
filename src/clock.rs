//! Wall-clock capability.
//!
//! Every TTL comparison and back-off sleep in the disk and distributed tiers
//! goes through [`Clock`] so tests can drive time deterministically instead
//! of sleeping for real.

use async_trait::async_trait;
use std::time::{Duration, SystemTime};

/// Wall time plus a cancellable delay.
#[async_trait]
pub trait Clock: Send + Sync {
    /// Current wall time (UTC).
    fn now(&self) -> SystemTime;

    /// Suspend the calling task for `duration`. Cancelled by dropping the
    /// returned future.
    async fn sleep(&self, duration: Duration);
}

/// Production clock: `SystemTime::now` plus `tokio::time::sleep`.
#[derive(Debug, Default, Clone)]
pub struct SystemClock;

#[async_trait]
impl Clock for SystemClock {
    fn now(&self) -> SystemTime {
        SystemTime::now()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Manually driven clock for tests. `sleep` resolves once `advance` has
/// moved the clock past the deadline.
#[derive(Debug)]
pub struct ManualClock {
    now: parking_lot::Mutex<SystemTime>,
    tick: tokio::sync::Notify,
}

impl ManualClock {
    #[must_use]
    pub fn new(start: SystemTime) -> Self {
        Self {
            now: parking_lot::Mutex::new(start),
            tick: tokio::sync::Notify::new(),
        }
    }

    /// Move the clock forward and wake pending sleeps.
    pub fn advance(&self, by: Duration) {
        *self.now.lock() += by;
        self.tick.notify_waiters();
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new(SystemTime::UNIX_EPOCH + Duration::from_secs(1_700_000_000))
    }
}

#[async_trait]
impl Clock for ManualClock {
    fn now(&self) -> SystemTime {
        *self.now.lock()
    }

    async fn sleep(&self, duration: Duration) {
        let deadline = self.now() + duration;
        loop {
            // Register interest before re-checking so an advance between the
            // check and the await cannot be lost.
            let mut notified = std::pin::pin!(self.tick.notified());
            notified.as_mut().enable();
            if self.now() >= deadline {
                return;
            }
            notified.await;
        }
    }
}
