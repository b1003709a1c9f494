//! Sliding log: exact per-key request accounting.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{debug, trace};

use super::backend::{Decision, RateLimiter};
use super::dispatcher::Algorithm;
use super::registry::PerKeyRegistry;
use crate::error::{Result, TurnstileError};

/// Default lookback interval.
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(10);

/// Keeps every admitted request's timestamp for the trailing `interval`.
///
/// The only variant that counts the true number of requests in the window,
/// at the cost of memory proportional to the requests in it.
pub struct SlidingLogLimiter {
    interval: Duration,
    max_requests: u64,
    logs: PerKeyRegistry<Mutex<VecDeque<Instant>>>,
}

impl SlidingLogLimiter {
    pub fn new(interval: Duration, max_requests: u64) -> Result<Self> {
        if max_requests == 0 {
            return Err(TurnstileError::Config(
                "sliding_log max_requests must be greater than zero".to_string(),
            ));
        }
        if interval.is_zero() {
            return Err(TurnstileError::Config(
                "sliding_log interval must be greater than zero".to_string(),
            ));
        }

        Ok(Self {
            interval,
            max_requests,
            logs: PerKeyRegistry::new(),
        })
    }

    /// Evaluate a request for `key` arriving at `now`.
    ///
    /// Timestamps passed for one key must be non-decreasing.
    pub fn admit_at(&self, key: &str, cost: u64, now: Instant) -> Decision {
        let log = self
            .logs
            .get_or_insert_with(key, || Mutex::new(VecDeque::new()));
        let mut log = log.lock();

        // Walk from the newest entry back; the log is ordered so the first
        // stale entry ends the scan and everything before it goes too.
        let threshold = now.checked_sub(self.interval);
        let in_window = match threshold {
            Some(threshold) => log.iter().rev().take_while(|t| **t >= threshold).count(),
            None => log.len(),
        };
        let stale = log.len() - in_window;
        log.drain(..stale);

        let count = in_window as u64;
        if count.saturating_add(cost) > self.max_requests {
            // The oldest retained entry is the next one to age out
            let retry_after = log
                .front()
                .map(|oldest| (*oldest + self.interval).saturating_duration_since(now))
                .unwrap_or_default();
            debug!(
                key = %key,
                count = count,
                max_requests = self.max_requests,
                "Sliding log limit exceeded"
            );
            return Decision::reject()
                .with_retry_after(retry_after)
                .with_rate(count as f64);
        }

        for _ in 0..cost {
            log.push_back(now);
        }
        trace!(key = %key, count = count + cost, "Sliding log admitted");
        Decision::admit().with_rate((count + cost) as f64)
    }

    /// Entries currently held for `key`.
    pub fn log_len(&self, key: &str) -> usize {
        self.logs.get(key).map_or(0, |log| log.lock().len())
    }
}

#[async_trait]
impl RateLimiter for SlidingLogLimiter {
    async fn admit(&self, key: &str, cost: u64) -> Result<Decision> {
        Ok(self.admit_at(key, cost, Instant::now()))
    }

    fn algorithm(&self) -> Algorithm {
        Algorithm::SlidingLog
    }

    fn tracked_keys(&self) -> usize {
        self.logs.len()
    }
}
