//! Turnstile - per-client admission control
//!
//! This crate decides, for each incoming request, whether the client behind it
//! may proceed or must back off. Five interchangeable algorithms (fixed
//! window, sliding log, sliding window counter, token bucket and leaky
//! bucket) share one [`ratelimit::RateLimiter`] trait, and a small TCP
//! front end answers admission queries for a fronting proxy.

pub mod config;
pub mod error;
pub mod ratelimit;
pub mod wire;
