//! Fixed window counter.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{debug, trace};

use super::backend::{Decision, RateLimiter};
use super::dispatcher::Algorithm;
use crate::error::{Result, TurnstileError};

/// Default admissions per window.
pub const DEFAULT_LIMIT: u64 = 3;
/// Default window size.
pub const DEFAULT_WINDOW: Duration = Duration::from_millis(100);

struct WindowState {
    count: u64,
    window_start: Instant,
}

/// A single fixed window counter shared by every key.
///
/// The counter is global: all identities draw from the same `limit` per
/// window. A window opens on the first request after the previous one
/// expired, so two bursts straddling a boundary can admit up to twice the
/// limit within one window length.
pub struct FixedWindowLimiter {
    limit: u64,
    window: Duration,
    state: Mutex<WindowState>,
}

impl FixedWindowLimiter {
    pub fn new(limit: u64, window: Duration) -> Result<Self> {
        if limit == 0 {
            return Err(TurnstileError::Config(
                "fixed_window limit must be greater than zero".to_string(),
            ));
        }
        if window.is_zero() {
            return Err(TurnstileError::Config(
                "fixed_window window must be greater than zero".to_string(),
            ));
        }

        Ok(Self {
            limit,
            window,
            state: Mutex::new(WindowState {
                count: 0,
                window_start: Instant::now(),
            }),
        })
    }

    /// Evaluate a request arriving at `now`.
    pub fn admit_at(&self, cost: u64, now: Instant) -> Decision {
        let mut state = self.state.lock();

        if now.saturating_duration_since(state.window_start) > self.window {
            state.window_start = now;
            state.count = 0;
        }

        if state.count.saturating_add(cost) <= self.limit {
            state.count += cost;
            trace!(count = state.count, limit = self.limit, "Fixed window admitted");
            Decision::admit().with_rate(state.count as f64)
        } else {
            debug!(count = state.count, limit = self.limit, "Fixed window limit exceeded");
            Decision::reject().with_rate(state.count as f64)
        }
    }

    /// Requests counted in the current window.
    pub fn current_count(&self) -> u64 {
        self.state.lock().count
    }

    /// Requests admitted per window.
    pub fn limit(&self) -> u64 {
        self.limit
    }

    /// Window length.
    pub fn window(&self) -> Duration {
        self.window
    }
}

#[async_trait]
impl RateLimiter for FixedWindowLimiter {
    async fn admit(&self, _key: &str, cost: u64) -> Result<Decision> {
        Ok(self.admit_at(cost, Instant::now()))
    }

    fn algorithm(&self) -> Algorithm {
        Algorithm::FixedWindow
    }

    fn tracked_keys(&self) -> usize {
        1
    }
}
