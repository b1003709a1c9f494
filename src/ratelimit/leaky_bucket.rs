//! Leaky bucket implemented as virtual scheduling (GCRA).
//!
//! Each key remembers when the service slot of its most recently admitted
//! request ends. A new request is placed one `rate` after that point; the
//! distance from now to its slot is the delay the caller may honor before
//! forwarding. Nothing is actually queued.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{debug, trace};

use super::backend::{Decision, RateLimiter};
use super::dispatcher::Algorithm;
use super::registry::PerKeyRegistry;
use crate::error::{Result, TurnstileError};

/// Default spacing between admitted requests.
pub const DEFAULT_RATE: Duration = Duration::from_millis(1000);

struct Schedule {
    /// End of the latest scheduled slot, `None` before the first request
    last: Option<Instant>,
}

/// Per-key virtual scheduler admitting one request per `rate`, with room for
/// `capacity - 1` requests waiting behind the current one.
pub struct LeakyBucketLimiter {
    rate: Duration,
    capacity: u64,
    schedules: PerKeyRegistry<Mutex<Schedule>>,
}

impl LeakyBucketLimiter {
    pub fn new(capacity: u64, rate: Duration) -> Result<Self> {
        if capacity == 0 {
            return Err(TurnstileError::Config(
                "leaky_bucket capacity must be greater than zero".to_string(),
            ));
        }
        if rate.is_zero() {
            return Err(TurnstileError::Config(
                "leaky_bucket rate must be greater than zero".to_string(),
            ));
        }

        Ok(Self {
            rate,
            capacity,
            schedules: PerKeyRegistry::new(),
        })
    }

    /// Schedule a request of `cost` slots for `key` arriving at `now`.
    ///
    /// The whole request is decided under the key's lock and nothing is
    /// committed unless it is admitted. Admitted decisions carry the wait
    /// until the request's last slot in `retry_after`.
    ///
    /// When the queue is already full, the rejection pushes the schedule to
    /// a full queue's length from now, so a stream of rejected arrivals
    /// cannot grow it further. A request rejected only because of its size
    /// leaves the schedule untouched.
    pub fn admit_at(&self, key: &str, cost: u64, now: Instant) -> Decision {
        let cost = cost.max(1);
        let schedule = self
            .schedules
            .get_or_insert_with(key, || Mutex::new(Schedule { last: None }));
        let mut schedule = schedule.lock();

        let first = match schedule.last {
            // Queue not empty: line up behind the last slot
            Some(last) if now < last => last + self.rate,
            // Queue empty but the previous slot started less than `rate` ago
            Some(last) => now + self.rate.saturating_sub(now - last),
            None => now,
        };

        let first_wait = first - now;
        if self.depth(first_wait) >= self.capacity {
            if let Some(reset) = now.checked_add(self.slots(self.capacity)) {
                schedule.last = Some(reset);
            }
            debug!(
                key = %key,
                depth = self.depth(first_wait),
                capacity = self.capacity,
                "Leaky bucket overflow"
            );
            return Decision::reject()
                .with_retry_after(first_wait)
                .with_rate(self.depth(first_wait) as f64);
        }

        let wait = first_wait.saturating_add(self.slots(cost - 1));
        let depth = self.depth(wait);
        let slot = now.checked_add(wait);
        let Some(slot) = slot.filter(|_| depth < self.capacity) else {
            // Fits only once the queue has drained far enough, or never
            let retry_after = if cost > self.capacity {
                Duration::MAX
            } else {
                wait.saturating_sub(self.slots(self.capacity - 1))
            };
            debug!(key = %key, cost = cost, depth = depth, "Leaky bucket request too large");
            return Decision::reject()
                .with_retry_after(retry_after)
                .with_rate(self.depth(first_wait) as f64);
        };
        schedule.last = Some(slot);

        trace!(
            key = %key,
            wait_ms = wait.as_millis() as u64,
            depth = depth,
            "Leaky bucket scheduled"
        );
        Decision::admit().with_retry_after(wait).with_rate(depth as f64)
    }

    /// Queue depth implied by waiting `wait` for a slot.
    fn depth(&self, wait: Duration) -> u64 {
        u64::try_from(wait.as_nanos().div_ceil(self.rate.as_nanos())).unwrap_or(u64::MAX)
    }

    /// Length of `n` consecutive slots.
    fn slots(&self, n: u64) -> Duration {
        self.rate.saturating_mul(u32::try_from(n).unwrap_or(u32::MAX))
    }

    /// Spacing between admitted requests.
    pub fn rate(&self) -> Duration {
        self.rate
    }

    /// Queue depth at which requests are rejected.
    pub fn capacity(&self) -> u64 {
        self.capacity
    }
}

#[async_trait]
impl RateLimiter for LeakyBucketLimiter {
    async fn admit(&self, key: &str, cost: u64) -> Result<Decision> {
        Ok(self.admit_at(key, cost, Instant::now()))
    }

    fn algorithm(&self) -> Algorithm {
        Algorithm::LeakyBucket
    }

    fn tracked_keys(&self) -> usize {
        self.schedules.len()
    }
}
