use crate::errors::{Error, Result};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Non-blocking token bucket.
///
/// Starts full with `capacity` tokens and gains one token per refill period,
/// never exceeding `capacity`. A caller that finds the bucket empty is turned
/// away immediately.
#[derive(Debug, Clone)]
pub struct RateLimiter {
    bucket: Arc<Bucket>,
}

#[derive(Debug)]
struct Bucket {
    tokens: Semaphore,
    capacity: usize,
}

impl RateLimiter {
    /// A bucket of `max_requests_per_second` tokens refilled once per
    /// second. Must be called inside a tokio runtime.
    pub fn new(max_requests_per_second: u32, shutdown: CancellationToken) -> Result<Self> {
        Self::with_refill_period(max_requests_per_second, Duration::from_secs(1), shutdown)
    }

    pub fn with_refill_period(capacity: u32, period: Duration, shutdown: CancellationToken) -> Result<Self> {
        if capacity == 0 {
            return Err(Error::Configuration(
                "rate limiter capacity must be at least 1".to_string(),
            ));
        }
        if period.is_zero() {
            return Err(Error::Configuration(
                "rate limiter refill period must be non-zero".to_string(),
            ));
        }

        let capacity = capacity as usize;
        let bucket = Arc::new(Bucket {
            tokens: Semaphore::new(capacity),
            capacity,
        });

        tokio::spawn(refill(Arc::downgrade(&bucket), period, shutdown));

        Ok(Self { bucket })
    }

    /// Takes one token if one is available.
    pub fn try_acquire(&self) -> bool {
        match self.bucket.tokens.try_acquire() {
            Ok(permit) => {
                permit.forget();
                true
            }
            Err(_) => false,
        }
    }

    pub fn available(&self) -> usize {
        self.bucket.tokens.available_permits()
    }

    pub fn capacity(&self) -> usize {
        self.bucket.capacity
    }
}

/// Adds one token per tick until shutdown or until every limiter handle is
/// dropped. Only this task adds tokens, so the capacity check cannot race.
async fn refill(bucket: Weak<Bucket>, period: Duration, shutdown: CancellationToken) {
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let Some(bucket) = bucket.upgrade() else {
            break;
        };
        if bucket.tokens.available_permits() < bucket.capacity {
            bucket.tokens.add_permits(1);
        }
    }

    debug!("Rate limiter refill task stopped");
}
