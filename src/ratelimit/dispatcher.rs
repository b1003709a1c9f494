//! Algorithm selection and the admission front door used by the server.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{info, instrument, trace, warn};

use super::backend::{Decision, RateLimiter};
use super::fixed_window::{self, FixedWindowLimiter};
use super::key::IdentityKey;
use super::leaky_bucket::{self, LeakyBucketLimiter};
use super::sliding_log::{self, SlidingLogLimiter};
use super::sliding_window::{self, SlidingWindowLimiter};
use super::token_bucket::{self, TokenBucketLimiter};
use crate::config::RateLimitingConfig;
use crate::error::{Result, TurnstileError};

/// Admission algorithms a dispatcher can be configured with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Algorithm {
    FixedWindow,
    SlidingLog,
    SlidingWindow,
    #[default]
    TokenBucket,
    LeakyBucket,
}

impl Algorithm {
    /// Every algorithm, in configuration order.
    pub const ALL: [Algorithm; 5] = [
        Algorithm::FixedWindow,
        Algorithm::SlidingLog,
        Algorithm::SlidingWindow,
        Algorithm::TokenBucket,
        Algorithm::LeakyBucket,
    ];

    /// Name used in configuration and on the command line.
    pub fn as_str(&self) -> &'static str {
        match self {
            Algorithm::FixedWindow => "fixed_window",
            Algorithm::SlidingLog => "sliding_log",
            Algorithm::SlidingWindow => "sliding_window",
            Algorithm::TokenBucket => "token_bucket",
            Algorithm::LeakyBucket => "leaky_bucket",
        }
    }

    /// Window, interval, refill interval or rate used when none is configured.
    pub fn default_window(&self) -> Duration {
        match self {
            Algorithm::FixedWindow => fixed_window::DEFAULT_WINDOW,
            Algorithm::SlidingLog => sliding_log::DEFAULT_INTERVAL,
            Algorithm::SlidingWindow => sliding_window::DEFAULT_WINDOW,
            Algorithm::TokenBucket => token_bucket::DEFAULT_REFILL_INTERVAL,
            Algorithm::LeakyBucket => leaky_bucket::DEFAULT_RATE,
        }
    }
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Algorithm {
    type Err = TurnstileError;

    fn from_str(s: &str) -> Result<Self> {
        Algorithm::ALL
            .into_iter()
            .find(|algorithm| algorithm.as_str() == s)
            .ok_or_else(|| TurnstileError::Config(format!("unknown algorithm: {s}")))
    }
}

/// What to answer when the limiter itself fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Admit the request
    #[default]
    Open,
    /// Reject the request
    Closed,
}

/// Build the limiter named by `config.algorithm`.
///
/// `limit` is the per-window maximum for the window algorithms, the bucket
/// capacity for the token bucket and the queue depth for the leaky bucket.
/// Must be called inside a Tokio runtime for algorithms with background
/// maintenance.
pub fn build_limiter(config: &RateLimitingConfig) -> Result<Arc<dyn RateLimiter>> {
    let algorithm = config.algorithm;
    let window = config.window();

    let limiter: Arc<dyn RateLimiter> = match algorithm {
        Algorithm::FixedWindow => Arc::new(FixedWindowLimiter::new(config.limit, window)?),
        Algorithm::SlidingLog => Arc::new(SlidingLogLimiter::new(window, config.limit)?),
        Algorithm::SlidingWindow => Arc::new(SlidingWindowLimiter::new(
            window,
            config.limit,
            config.expiration(),
            config.flush_interval(),
        )?),
        Algorithm::TokenBucket => Arc::new(TokenBucketLimiter::new(config.limit, window)?),
        Algorithm::LeakyBucket => Arc::new(LeakyBucketLimiter::new(config.limit, window)?),
    };

    info!(
        algorithm = %algorithm,
        limit = config.limit,
        window_ms = window.as_millis() as u64,
        "Rate limiter built"
    );
    Ok(limiter)
}

/// Routes admissions to the configured limiter and turns limiter failures
/// into decisions according to the failure policy.
pub struct Dispatcher {
    /// `None` when rate limiting is disabled
    limiter: Option<Arc<dyn RateLimiter>>,
    failure_policy: FailurePolicy,
    honor_delay: bool,
}

impl Dispatcher {
    /// Front `limiter`, applying `failure_policy` when it errors.
    pub fn new(limiter: Arc<dyn RateLimiter>, failure_policy: FailurePolicy) -> Self {
        Self {
            limiter: Some(limiter),
            failure_policy,
            honor_delay: false,
        }
    }

    /// A dispatcher that admits everything.
    pub fn disabled() -> Self {
        Self {
            limiter: None,
            failure_policy: FailurePolicy::Open,
            honor_delay: false,
        }
    }

    /// Build the configured limiter, or a disabled dispatcher when rate
    /// limiting is turned off. Requires a Tokio runtime.
    pub fn from_config(config: &RateLimitingConfig) -> Result<Self> {
        if !config.enabled {
            info!("Rate limiting disabled, admitting all requests");
            return Ok(Self::disabled());
        }

        let limiter = build_limiter(config)?;
        Ok(Self::new(limiter, config.failure_policy).with_honor_delay(config.honor_delay))
    }

    /// Sleep out the leaky bucket's pacing delay before answering.
    pub fn with_honor_delay(mut self, honor_delay: bool) -> Self {
        self.honor_delay = honor_delay;
        self
    }

    /// Decide on a request of `cost` units from `key`.
    #[instrument(level = "trace", skip(self))]
    pub async fn admit(&self, key: &str, cost: u64) -> Decision {
        let Some(limiter) = &self.limiter else {
            return Decision::admit();
        };

        let decision = match limiter.admit(key, cost.max(1)).await {
            Ok(decision) => decision,
            Err(e) => {
                let admitted = self.failure_policy == FailurePolicy::Open;
                warn!(
                    key = %key,
                    error = %e,
                    policy = ?self.failure_policy,
                    "Rate limiter failed, applying failure policy"
                );
                return if admitted {
                    Decision::admit()
                } else {
                    Decision::reject()
                };
            }
        };

        if self.honor_delay && decision.admitted && limiter.algorithm() == Algorithm::LeakyBucket {
            if let Some(delay) = decision.retry_after.filter(|d| !d.is_zero()) {
                trace!(key = %key, delay_ms = delay.as_millis() as u64, "Honoring pacing delay");
                tokio::time::sleep(delay).await;
            }
        }

        decision
    }

    /// Decide on a single request from the client at `addr`.
    pub async fn admit_addr(&self, addr: &str) -> Decision {
        let key = IdentityKey::from_addr(addr);
        self.admit(key.as_str(), 1).await
    }

    /// False when every request is admitted without a limiter.
    pub fn is_enabled(&self) -> bool {
        self.limiter.is_some()
    }

    pub fn algorithm(&self) -> Option<Algorithm> {
        self.limiter.as_ref().map(|limiter| limiter.algorithm())
    }

    /// Keys held by the limiter, 0 when disabled.
    pub fn tracked_keys(&self) -> usize {
        self.limiter.as_ref().map_or(0, |limiter| limiter.tracked_keys())
    }

    /// Stop the limiter's background tasks.
    pub fn shutdown(&self) {
        if let Some(limiter) = &self.limiter {
            limiter.shutdown();
            info!(algorithm = %limiter.algorithm(), "Rate limiter shut down");
        }
    }
}
