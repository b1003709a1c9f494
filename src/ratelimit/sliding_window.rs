//! Approximated sliding window built from two adjacent fixed windows.
//!
//! The previous window's count is weighted by how much of it still overlaps
//! the trailing window, which gives O(1) memory per key at the cost of
//! assuming requests in the previous window were evenly spread.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, DurationRound, TimeDelta, Utc};
use tracing::{debug, trace};

use super::backend::{Decision, RateLimiter};
use super::dispatcher::Algorithm;
use super::store::{KeyedExpiringStore, WindowStore};
use crate::error::{Result, TurnstileError};

/// Default window size.
pub const DEFAULT_WINDOW: Duration = Duration::from_secs(1);
/// Default interval between store sweeps.
pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_millis(100);

/// Sliding window counter limiter.
pub struct SlidingWindowLimiter {
    window: Duration,
    window_delta: TimeDelta,
    max_amount: u64,
    store: Arc<dyn WindowStore>,
}

impl SlidingWindowLimiter {
    /// Create a limiter backed by a [`KeyedExpiringStore`].
    ///
    /// `expiration` must cover at least two windows, or the previous window
    /// could be evicted while it still weighs on the estimate.
    /// A `max_amount` of zero blocks every request.
    pub fn new(
        window: Duration,
        max_amount: u64,
        expiration: Duration,
        flush_interval: Duration,
    ) -> Result<Self> {
        if expiration < window.saturating_mul(2) {
            return Err(TurnstileError::Config(format!(
                "sliding_window expiration {:?} must be at least twice the window {:?}",
                expiration, window
            )));
        }
        let store = KeyedExpiringStore::new(expiration, flush_interval)?;
        Self::with_store(window, max_amount, Arc::new(store))
    }

    /// Create a limiter over any [`WindowStore`].
    pub fn with_store(
        window: Duration,
        max_amount: u64,
        store: Arc<dyn WindowStore>,
    ) -> Result<Self> {
        if window.is_zero() {
            return Err(TurnstileError::Config(
                "sliding_window window must be greater than zero".to_string(),
            ));
        }
        let window_delta = TimeDelta::from_std(window)
            .map_err(|e| TurnstileError::Config(format!("sliding_window window: {e}")))?;

        Ok(Self {
            window,
            window_delta,
            max_amount,
            store,
        })
    }

    /// Evaluate a request for `key` at wall-clock time `now`.
    pub fn admit_at(&self, key: &str, cost: u64, now: DateTime<Utc>) -> Result<Decision> {
        let current = now
            .duration_trunc(self.window_delta)
            .map_err(|e| TurnstileError::Store(format!("cannot align window: {e}")))?;
        let previous = current - self.window_delta;
        let elapsed = (now - current).to_std().unwrap_or_default();

        let (prev_count, curr_count) = self.store.counts(key, previous, current)?;
        let rate = estimate_rate(self.window, elapsed, prev_count, curr_count);
        if self.exceeds(rate, cost) {
            return Ok(self.rejection(key, cost, rate, prev_count, curr_count, elapsed));
        }

        // Reserve first so concurrent callers each see a distinct count,
        // then give the reservation back if it would not have fit.
        let delta = i64::try_from(cost).unwrap_or(i64::MAX);
        let reserved = self.store.add(key, current, delta)?;
        let curr_before = reserved - delta;
        let rate = estimate_rate(self.window, elapsed, prev_count, curr_before);
        if self.exceeds(rate, cost) {
            self.store.add(key, current, -delta)?;
            return Ok(self.rejection(key, cost, rate, prev_count, curr_before, elapsed));
        }

        trace!(key = %key, rate = rate, "Sliding window admitted");
        Ok(Decision::admit().with_rate(rate))
    }

    fn exceeds(&self, rate: f64, cost: u64) -> bool {
        rate + cost.saturating_sub(1) as f64 >= self.max_amount as f64
    }

    fn rejection(
        &self,
        key: &str,
        cost: u64,
        rate: f64,
        prev_count: i64,
        curr_count: i64,
        elapsed: Duration,
    ) -> Decision {
        let retry_after = block_duration(
            self.window,
            self.max_amount,
            cost,
            prev_count,
            curr_count,
            elapsed,
        );
        debug!(
            key = %key,
            rate = rate,
            max_amount = self.max_amount,
            retry_after_ms = retry_after.as_millis() as u64,
            "Sliding window limit exceeded"
        );
        Decision::reject().with_retry_after(retry_after).with_rate(rate)
    }
}

/// Interpolated request rate `elapsed` into the current window.
pub fn estimate_rate(window: Duration, elapsed: Duration, prev_count: i64, curr_count: i64) -> f64 {
    let window = window.as_secs_f64();
    let weight = (window - elapsed.as_secs_f64()) / window;
    weight * prev_count as f64 + curr_count as f64
}

/// How long a rejected key stays blocked for a request of `cost`.
///
/// Solves for the point at which the interpolated rate drops back to
/// `max_amount - (cost - 1)`, the highest rate at which the request still
/// fits, assuming no further requests are admitted. When the previous
/// window is empty the unblock point lies in the next window, where
/// today's count becomes the weighted one. A request larger than
/// `max_amount`, or any request with both windows empty (only possible
/// when `max_amount` is zero), never fits and gets `Duration::MAX`.
pub fn block_duration(
    window: Duration,
    max_amount: u64,
    cost: u64,
    prev_count: i64,
    curr_count: i64,
    elapsed: Duration,
) -> Duration {
    if cost.max(1) > max_amount {
        return Duration::MAX;
    }
    let window_secs = window.as_secs_f64();
    let elapsed_secs = elapsed.as_secs_f64();
    let max_amount = (max_amount - cost.saturating_sub(1)) as f64;

    let secs = if prev_count > 0 {
        let x = (max_amount - curr_count as f64) / prev_count as f64;
        window_secs * (1.0 - x) - elapsed_secs
    } else if curr_count > 0 {
        let until_next = window_secs - elapsed_secs;
        until_next + window_secs * (1.0 - max_amount / curr_count as f64)
    } else {
        return Duration::MAX;
    };

    Duration::try_from_secs_f64(secs.max(0.0)).unwrap_or(Duration::MAX)
}

#[async_trait]
impl RateLimiter for SlidingWindowLimiter {
    async fn admit(&self, key: &str, cost: u64) -> Result<Decision> {
        self.admit_at(key, cost, Utc::now())
    }

    fn algorithm(&self) -> Algorithm {
        Algorithm::SlidingWindow
    }

    fn tracked_keys(&self) -> usize {
        self.store.len()
    }

    fn shutdown(&self) {
        self.store.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    const TOLERANCE: f64 = 1e-6;

    fn window_start() -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000, 0).unwrap()
    }

    fn seeded(prev: i64, curr: i64) -> (SlidingWindowLimiter, Arc<KeyedExpiringStore>) {
        let store = Arc::new(KeyedExpiringStore::without_sweeper(Duration::from_secs(60)).unwrap());
        let current = window_start();
        if prev > 0 {
            store.add("k", current - TimeDelta::seconds(1), prev).unwrap();
        }
        if curr > 0 {
            store.add("k", current, curr).unwrap();
        }
        let limiter =
            SlidingWindowLimiter::with_store(Duration::from_secs(1), 10, store.clone()).unwrap();
        (limiter, store)
    }

    #[test]
    fn test_rate_halfway_through_window() {
        let rate = estimate_rate(Duration::from_secs(1), Duration::from_millis(500), 10, 0);
        assert!((rate - 5.0).abs() < TOLERANCE);

        let (limiter, _) = seeded(10, 0);
        let decision = limiter
            .admit_at("k", 1, window_start() + TimeDelta::milliseconds(500))
            .unwrap();
        assert!(decision.admitted);
        assert!((decision.current_rate.unwrap() - 5.0).abs() < TOLERANCE);
    }

    #[test]
    fn test_rate_early_in_window() {
        let rate = estimate_rate(Duration::from_secs(1), Duration::from_millis(50), 10, 0);
        assert!((rate - 9.5).abs() < TOLERANCE);

        let (limiter, store) = seeded(10, 0);
        let decision = limiter
            .admit_at("k", 1, window_start() + TimeDelta::milliseconds(50))
            .unwrap();
        assert!(decision.admitted);
        assert_eq!(
            store
                .counts("k", window_start() - TimeDelta::seconds(1), window_start())
                .unwrap(),
            (10, 1)
        );
    }

    #[test]
    fn test_block_duration_with_previous_window() {
        // weight 0.7: 0.7 * 20 + 8 = 22 >= 10
        let rate = estimate_rate(Duration::from_secs(1), Duration::from_millis(300), 20, 8);
        assert!((rate - 22.0).abs() < TOLERANCE);

        // x = (10 - 8) / 20 = 0.1, unblocks 0.9s into the window
        let retry =
            block_duration(Duration::from_secs(1), 10, 1, 20, 8, Duration::from_millis(300));
        assert!((retry.as_secs_f64() - 0.6).abs() < TOLERANCE);
    }

    #[test]
    fn test_block_duration_spills_into_next_window() {
        let retry =
            block_duration(Duration::from_secs(1), 10, 1, 0, 20, Duration::from_millis(250));
        assert!((retry.as_secs_f64() - 1.25).abs() < TOLERANCE);
    }

    #[test]
    fn test_block_duration_unbounded_when_nothing_counted() {
        let retry = block_duration(Duration::from_secs(1), 0, 1, 0, 0, Duration::from_millis(250));
        assert_eq!(retry, Duration::MAX);
    }

    #[test]
    fn test_block_duration_accounts_for_cost() {
        // prev 10, curr 0, halfway: rate 5 fits a single request but not 10
        let window = Duration::from_secs(1);
        let elapsed = Duration::from_millis(500);
        assert_eq!(block_duration(window, 10, 1, 10, 0, elapsed), Duration::ZERO);

        // A cost of 10 needs the rate down to 1, reached 0.9s in
        let retry = block_duration(window, 10, 10, 10, 0, elapsed);
        assert!((retry.as_secs_f64() - 0.4).abs() < TOLERANCE);

        assert_eq!(block_duration(window, 10, 11, 10, 0, elapsed), Duration::MAX);
    }

    #[test]
    fn test_costly_rejection_late_in_window_has_retry() {
        let (limiter, _) = seeded(10, 0);
        let decision = limiter
            .admit_at("k", 10, window_start() + TimeDelta::milliseconds(500))
            .unwrap();

        assert!(!decision.admitted);
        let retry = decision.retry_after.unwrap().as_secs_f64();
        assert!((retry - 0.4).abs() < TOLERANCE);
    }

    #[test]
    fn test_rejection_carries_retry_after() {
        let (limiter, store) = seeded(20, 8);
        let decision = limiter
            .admit_at("k", 1, window_start() + TimeDelta::milliseconds(300))
            .unwrap();

        assert!(!decision.admitted);
        let retry = decision.retry_after.unwrap().as_secs_f64();
        assert!((retry - 0.6).abs() < TOLERANCE);
        // Rejected requests are not counted
        assert_eq!(
            store
                .counts("k", window_start() - TimeDelta::seconds(1), window_start())
                .unwrap(),
            (20, 8)
        );
    }

    #[test]
    fn test_zero_max_blocks_everything() {
        let store = Arc::new(KeyedExpiringStore::without_sweeper(Duration::from_secs(60)).unwrap());
        let limiter = SlidingWindowLimiter::with_store(Duration::from_secs(1), 0, store).unwrap();

        let decision = limiter.admit_at("k", 1, window_start()).unwrap();
        assert!(!decision.admitted);
        assert_eq!(decision.retry_after, Some(Duration::MAX));
    }

    #[test]
    fn test_concurrent_admits_never_exceed_max() {
        let store = Arc::new(KeyedExpiringStore::without_sweeper(Duration::from_secs(60)).unwrap());
        let limiter = Arc::new(
            SlidingWindowLimiter::with_store(Duration::from_secs(1), 10, store).unwrap(),
        );
        let now = window_start() + TimeDelta::milliseconds(200);

        let handles: Vec<_> = (0..32)
            .map(|_| {
                let limiter = Arc::clone(&limiter);
                thread::spawn(move || {
                    (0..4)
                        .filter(|_| limiter.admit_at("k", 1, now).unwrap().admitted)
                        .count()
                })
            })
            .collect();
        let admitted: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();

        assert_eq!(admitted, 10);
    }

    #[tokio::test]
    async fn test_admit_uses_wall_clock() {
        let limiter = SlidingWindowLimiter::new(
            Duration::from_secs(60),
            2,
            Duration::from_secs(120),
            DEFAULT_FLUSH_INTERVAL,
        )
        .unwrap();

        assert!(limiter.admit("a", 1).await.unwrap().admitted);
        assert!(limiter.admit("b", 1).await.unwrap().admitted);
        assert!(limiter.tracked_keys() >= 2);
        limiter.shutdown();
    }

    #[tokio::test]
    async fn test_expiration_must_cover_two_windows() {
        let result = SlidingWindowLimiter::new(
            Duration::from_secs(1),
            10,
            Duration::from_millis(1500),
            DEFAULT_FLUSH_INTERVAL,
        );
        assert!(matches!(result, Err(TurnstileError::Config(_))));
    }
}
