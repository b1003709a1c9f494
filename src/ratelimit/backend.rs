//! Rate limiter trait shared by every admission algorithm.

use std::time::Duration;

use async_trait::async_trait;

use super::dispatcher::Algorithm;
use crate::error::Result;

/// Outcome of a single admission check.
#[derive(Debug, Clone, PartialEq)]
pub struct Decision {
    /// Whether the request may proceed
    pub admitted: bool,
    /// For rejections, how long until the key is expected to be admitted again.
    /// For admitted leaky bucket requests, the advisory pacing delay.
    /// `Duration::MAX` means time alone will not unblock the key.
    pub retry_after: Option<Duration>,
    /// The rate or count the algorithm observed while deciding
    pub current_rate: Option<f64>,
}

impl Decision {
    /// An admitted decision with no hints.
    pub fn admit() -> Self {
        Self {
            admitted: true,
            retry_after: None,
            current_rate: None,
        }
    }

    /// A rejected decision with no hints.
    pub fn reject() -> Self {
        Self {
            admitted: false,
            retry_after: None,
            current_rate: None,
        }
    }

    /// Attach a retry hint, or the pacing delay on an admitted decision.
    pub fn with_retry_after(mut self, retry_after: Duration) -> Self {
        self.retry_after = Some(retry_after);
        self
    }

    /// Attach the rate observed for the key.
    pub fn with_rate(mut self, rate: f64) -> Self {
        self.current_rate = Some(rate);
        self
    }

    /// HTTP status a fronting proxy should answer with.
    pub fn status_code(&self) -> u16 {
        if self.admitted {
            200
        } else {
            429
        }
    }
}

/// Trait implemented by every admission algorithm.
///
/// Implementations must be safe to call concurrently for any mix of keys and
/// must never block indefinitely. Checking and recording a request happens
/// atomically from the caller's point of view.
#[async_trait]
pub trait RateLimiter: Send + Sync {
    /// Decide whether a request of the given cost from `key` is admitted.
    ///
    /// Only a failing window store produces an `Err`.
    async fn admit(&self, key: &str, cost: u64) -> Result<Decision>;

    /// The algorithm this limiter implements.
    fn algorithm(&self) -> Algorithm;

    /// Number of keys (or key/window entries) currently holding state.
    fn tracked_keys(&self) -> usize;

    /// Stop any background maintenance task. Idempotent.
    fn shutdown(&self) {}
}
