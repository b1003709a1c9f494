//! Lock-free token bucket.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, trace};

use super::backend::{Decision, RateLimiter};
use super::dispatcher::Algorithm;
use super::registry::PerKeyRegistry;
use super::task::PeriodicTask;
use crate::error::{Result, TurnstileError};

/// Default refill interval (10 refills per second).
pub const DEFAULT_REFILL_INTERVAL: Duration = Duration::from_millis(100);

/// Largest bucket: one token per nanosecond when spread over a second.
pub const MAX_CAPACITY: u64 = 1_000_000_000;

/// Smallest refill interval that still adds at least one token per tick.
fn even_refill_interval(capacity: u64) -> Duration {
    Duration::from_nanos((MAX_CAPACITY / capacity.max(1)).max(1))
}

/// A token reservoir updated only through compare-and-swap loops.
///
/// The bucket does not refill itself; its owner calls [`refill`](Self::refill)
/// once per `refill_interval`.
pub struct AtomicBucket {
    tokens: AtomicU64,
    capacity: u64,
    refill_amount: u64,
    refill_interval: Duration,
}

impl AtomicBucket {
    /// Create a full bucket.
    ///
    /// `refill_interval` is raised to `1/capacity` seconds when shorter, and
    /// each refill adds `capacity * refill_interval` tokens rounded half up,
    /// which spreads `capacity` tokens evenly over one second.
    pub fn new(capacity: u64, refill_interval: Duration) -> Self {
        let refill_interval = refill_interval.max(even_refill_interval(capacity));
        let refill_amount = (0.5 + capacity as f64 * refill_interval.as_secs_f64()).floor() as u64;

        Self {
            tokens: AtomicU64::new(capacity),
            capacity,
            refill_amount: refill_amount.max(1),
            refill_interval,
        }
    }

    /// Take up to `n` tokens. Returns how many were taken: `n` when enough
    /// were available, otherwise everything that was left.
    pub fn take(&self, n: u64) -> u64 {
        loop {
            let tokens = self.tokens.load(Ordering::Acquire);
            if tokens == 0 {
                return 0;
            }
            if n <= tokens {
                if self
                    .tokens
                    .compare_exchange_weak(tokens, tokens - n, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    return n;
                }
            } else if self
                .tokens
                .compare_exchange_weak(tokens, 0, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return tokens;
            }
        }
    }

    /// Add up to `n` tokens without exceeding capacity. Returns how many were
    /// added.
    pub fn put(&self, n: u64) -> u64 {
        loop {
            let tokens = self.tokens.load(Ordering::Acquire);
            if tokens >= self.capacity {
                return 0;
            }
            let room = self.capacity - tokens;
            if n <= room {
                if self
                    .tokens
                    .compare_exchange_weak(tokens, tokens + n, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    return n;
                }
            } else if self
                .tokens
                .compare_exchange_weak(tokens, self.capacity, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return room;
            }
        }
    }

    /// Add one refill's worth of tokens.
    pub fn refill(&self) -> u64 {
        self.put(self.refill_amount)
    }

    /// Minimum time for `n` tokens to accumulate, counting whole refills.
    /// Requests above capacity are treated as a full bucket.
    pub fn time_to_refill(&self, n: u64) -> Duration {
        let n = n.min(self.capacity);
        let ticks = n.div_ceil(self.refill_amount);
        self.refill_interval.saturating_mul(ticks as u32)
    }

    pub fn tokens(&self) -> u64 {
        self.tokens.load(Ordering::Acquire)
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    pub fn refill_amount(&self) -> u64 {
        self.refill_amount
    }

    pub fn refill_interval(&self) -> Duration {
        self.refill_interval
    }
}

/// Per-key token buckets refilled by one shared background task.
pub struct TokenBucketLimiter {
    capacity: u64,
    refill_interval: Duration,
    buckets: Arc<PerKeyRegistry<AtomicBucket>>,
    refill: PeriodicTask,
}

impl TokenBucketLimiter {
    /// Create a limiter whose buckets hold `capacity` tokens. Requires a
    /// Tokio runtime for the refill task.
    pub fn new(capacity: u64, refill_interval: Duration) -> Result<Self> {
        if capacity == 0 {
            return Err(TurnstileError::Config(
                "token_bucket capacity must be greater than zero".to_string(),
            ));
        }
        if capacity > MAX_CAPACITY {
            return Err(TurnstileError::Config(format!(
                "token_bucket capacity must not exceed {MAX_CAPACITY}"
            )));
        }
        if refill_interval.is_zero() {
            return Err(TurnstileError::Config(
                "token_bucket refill interval must be greater than zero".to_string(),
            ));
        }
        let refill_interval = refill_interval.max(even_refill_interval(capacity));

        let buckets = Arc::new(PerKeyRegistry::<AtomicBucket>::new());
        let refill = {
            let buckets = Arc::clone(&buckets);
            PeriodicTask::spawn("token-bucket-refill", refill_interval, move || {
                buckets.for_each(|_, bucket| {
                    bucket.refill();
                });
            })?
        };

        Ok(Self {
            capacity,
            refill_interval,
            buckets,
            refill,
        })
    }

    /// The bucket for `key`, created full on first use.
    pub fn bucket(&self, key: &str) -> Arc<AtomicBucket> {
        self.buckets.get_or_insert_with(key, || {
            AtomicBucket::new(self.capacity, self.refill_interval)
        })
    }

    /// Take `cost` tokens or none at all.
    pub fn try_acquire(&self, key: &str, cost: u64) -> Decision {
        let bucket = self.bucket(key);
        let taken = bucket.take(cost);
        if taken < cost {
            bucket.put(taken);
            let retry_after = bucket.time_to_refill(cost - taken);
            debug!(
                key = %key,
                cost = cost,
                available = taken,
                "Token bucket exhausted"
            );
            return Decision::reject()
                .with_retry_after(retry_after)
                .with_rate(taken as f64);
        }

        trace!(key = %key, remaining = bucket.tokens(), "Token bucket admitted");
        Decision::admit().with_rate(bucket.tokens() as f64)
    }

    /// Block until `n` tokens have been taken for `key`. Returns the total
    /// time slept.
    pub async fn wait(&self, key: &str, n: u64) -> Result<Duration> {
        self.wait_or_cancel(key, n, std::future::pending::<()>()).await
    }

    /// Like [`wait`](Self::wait), but gives up when `cancel` resolves. Tokens
    /// taken before cancellation are returned to the bucket.
    pub async fn wait_or_cancel<F>(&self, key: &str, n: u64, cancel: F) -> Result<Duration>
    where
        F: Future<Output = ()>,
    {
        let bucket = self.bucket(key);
        let mut taken = bucket.take(n);
        if taken == n {
            return Ok(Duration::ZERO);
        }

        tokio::pin!(cancel);
        let mut waited = Duration::ZERO;
        while taken < n {
            let sleep = bucket.time_to_refill(n - taken);
            tokio::select! {
                _ = tokio::time::sleep(sleep) => {}
                _ = &mut cancel => {
                    bucket.put(taken);
                    debug!(
                        key = %key,
                        waited_ms = waited.as_millis() as u64,
                        "Token wait cancelled"
                    );
                    return Err(TurnstileError::Cancelled { waited });
                }
            }
            waited += sleep;
            taken += bucket.take(n - taken);
        }

        trace!(key = %key, waited_ms = waited.as_millis() as u64, "Token wait complete");
        Ok(waited)
    }

    /// The refill interval after clamping.
    pub fn refill_interval(&self) -> Duration {
        self.refill_interval
    }
}

#[async_trait]
impl RateLimiter for TokenBucketLimiter {
    async fn admit(&self, key: &str, cost: u64) -> Result<Decision> {
        Ok(self.try_acquire(key, cost))
    }

    fn algorithm(&self) -> Algorithm {
        Algorithm::TokenBucket
    }

    fn tracked_keys(&self) -> usize {
        self.buckets.len()
    }

    fn shutdown(&self) {
        self.refill.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_bucket_construction() {
        let bucket = AtomicBucket::new(100, Duration::from_millis(25));
        assert_eq!(bucket.tokens(), 100);
        assert_eq!(bucket.refill_interval(), Duration::from_millis(25));
        // 100 * 0.025 = 2.5, rounded half up
        assert_eq!(bucket.refill_amount(), 3);
    }

    #[test]
    fn test_refill_interval_is_clamped() {
        let bucket = AtomicBucket::new(10, Duration::from_millis(1));
        assert_eq!(bucket.refill_interval(), Duration::from_millis(100));
        assert_eq!(bucket.refill_amount(), 1);
    }

    #[test]
    fn test_take_and_put() {
        let bucket = AtomicBucket::new(5, Duration::from_secs(1));

        assert_eq!(bucket.take(3), 3);
        assert_eq!(bucket.take(3), 2);
        assert_eq!(bucket.take(1), 0);

        assert_eq!(bucket.put(4), 4);
        assert_eq!(bucket.put(4), 1);
        assert_eq!(bucket.tokens(), 5);
    }

    #[test]
    fn test_time_to_refill() {
        let bucket = AtomicBucket::new(100, Duration::from_millis(25));
        assert_eq!(bucket.time_to_refill(1), Duration::from_millis(25));
        assert_eq!(bucket.time_to_refill(7), Duration::from_millis(75));
        // Capped at capacity: ceil(100 / 3) = 34 ticks
        assert_eq!(bucket.time_to_refill(1000), Duration::from_millis(850));
    }

    #[test]
    fn test_racing_takers_never_exceed_capacity() {
        let bucket = Arc::new(AtomicBucket::new(50, Duration::from_secs(1)));

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let bucket = Arc::clone(&bucket);
                thread::spawn(move || (0..20).map(|_| bucket.take(1)).sum::<u64>())
            })
            .collect();
        let taken: u64 = handles.into_iter().map(|h| h.join().unwrap()).sum();

        assert_eq!(taken, 50);
        assert_eq!(bucket.tokens(), 0);
    }

    #[test]
    fn test_concurrent_take_put_conserves_tokens() {
        let capacity = 64;
        let bucket = Arc::new(AtomicBucket::new(capacity, Duration::from_secs(1)));
        let taken = Arc::new(AtomicU64::new(0));
        let added = Arc::new(AtomicU64::new(0));

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let bucket = Arc::clone(&bucket);
                let taken = Arc::clone(&taken);
                let added = Arc::clone(&added);
                thread::spawn(move || {
                    for round in 0..2_000u64 {
                        let n = (round + i) % 5 + 1;
                        if round % 3 == 0 {
                            added.fetch_add(bucket.put(n), Ordering::SeqCst);
                        } else {
                            taken.fetch_add(bucket.take(n), Ordering::SeqCst);
                        }
                        assert!(bucket.tokens() <= capacity);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let taken = taken.load(Ordering::SeqCst);
        let added = added.load(Ordering::SeqCst);
        assert!(taken <= capacity + added);
        assert_eq!(bucket.tokens(), capacity + added - taken);
    }

    #[tokio::test(start_paused = true)]
    async fn test_refill_rate() {
        let limiter = TokenBucketLimiter::new(100, Duration::from_millis(25)).unwrap();
        let bucket = limiter.bucket("client");
        assert_eq!(bucket.take(100), 100);

        // Ten refill ticks
        tokio::time::sleep(Duration::from_millis(260)).await;

        assert_eq!(bucket.tokens(), (10 * bucket.refill_amount()).min(100));
        limiter.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn test_refill_caps_at_capacity() {
        let limiter = TokenBucketLimiter::new(10, Duration::from_millis(100)).unwrap();
        let bucket = limiter.bucket("client");
        bucket.take(5);

        tokio::time::sleep(Duration::from_secs(5)).await;

        assert_eq!(bucket.tokens(), 10);
    }

    #[tokio::test(start_paused = true)]
    async fn test_admit_rejects_without_partial_consumption() {
        let limiter = TokenBucketLimiter::new(5, Duration::from_millis(200)).unwrap();

        assert!(limiter.admit("a", 3).await.unwrap().admitted);
        let rejected = limiter.admit("a", 3).await.unwrap();
        assert!(!rejected.admitted);
        assert_eq!(rejected.retry_after, Some(Duration::from_millis(200)));
        assert_eq!(limiter.bucket("a").tokens(), 2);

        // Other keys have their own bucket
        assert!(limiter.admit("b", 5).await.unwrap().admitted);
        assert_eq!(limiter.tracked_keys(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_sleeps_for_missing_tokens() {
        let limiter = TokenBucketLimiter::new(10, Duration::from_millis(100)).unwrap();
        limiter.bucket("a").take(10);

        let waited = limiter.wait("a", 3).await.unwrap();

        assert!(waited >= Duration::from_millis(300));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_returns_immediately_when_available() {
        let limiter = TokenBucketLimiter::new(10, Duration::from_millis(100)).unwrap();
        assert_eq!(limiter.wait("a", 4).await.unwrap(), Duration::ZERO);
        assert_eq!(limiter.bucket("a").tokens(), 6);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_cancellation_returns_tokens() {
        let limiter = TokenBucketLimiter::new(10, Duration::from_millis(100)).unwrap();
        limiter.bucket("a").take(8);

        let result = limiter
            .wait_or_cancel("a", 10, tokio::time::sleep(Duration::from_millis(50)))
            .await;

        assert!(matches!(result, Err(TurnstileError::Cancelled { .. })));
        assert_eq!(limiter.bucket("a").tokens(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_stops_refill() {
        let limiter = TokenBucketLimiter::new(10, Duration::from_millis(100)).unwrap();
        let bucket = limiter.bucket("a");
        bucket.take(10);
        limiter.shutdown();

        tokio::time::sleep(Duration::from_secs(1)).await;

        assert_eq!(bucket.tokens(), 0);
    }

    #[test]
    fn test_huge_capacity_keeps_nonzero_interval() {
        let bucket = AtomicBucket::new((1 << 32) + 10, Duration::from_nanos(1));
        assert_eq!(bucket.refill_interval(), Duration::from_nanos(1));

        let bucket = AtomicBucket::new(MAX_CAPACITY * 4, Duration::ZERO);
        assert!(!bucket.refill_interval().is_zero());
    }

    #[tokio::test]
    async fn test_invalid_parameters() {
        assert!(TokenBucketLimiter::new(MAX_CAPACITY + 1, Duration::from_millis(100)).is_err());
        assert!(TokenBucketLimiter::new(MAX_CAPACITY, Duration::from_millis(100)).is_ok());
        assert!(TokenBucketLimiter::new(0, Duration::from_millis(100)).is_err());
        assert!(TokenBucketLimiter::new(10, Duration::ZERO).is_err());
    }
}
