//! Admission algorithms and the state they keep per identity key.

mod backend;
mod dispatcher;
mod key;
mod registry;
mod task;

pub mod fixed_window;
pub mod leaky_bucket;
pub mod sliding_log;
pub mod sliding_window;
pub mod store;
pub mod token_bucket;

pub use backend::{Decision, RateLimiter};
pub use dispatcher::{build_limiter, Algorithm, Dispatcher, FailurePolicy};
pub use fixed_window::FixedWindowLimiter;
pub use key::IdentityKey;
pub use leaky_bucket::LeakyBucketLimiter;
pub use registry::PerKeyRegistry;
pub use sliding_log::SlidingLogLimiter;
pub use sliding_window::SlidingWindowLimiter;
pub use store::{KeyedExpiringStore, WindowStore};
pub use task::PeriodicTask;
pub use token_bucket::{AtomicBucket, TokenBucketLimiter};
