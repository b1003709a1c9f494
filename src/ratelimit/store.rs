//! Window counter storage for the sliding window limiter.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tracing::debug;

use super::task::PeriodicTask;
use crate::error::{Result, TurnstileError};

/// Storage of request counts per (identity key, window start).
///
/// Implementations may be remote or otherwise fallible; callers decide
/// whether a failure admits or rejects the request.
pub trait WindowStore: Send + Sync {
    /// Counts for the previous and current windows of `key`. Missing
    /// entries count as zero.
    fn counts(
        &self,
        key: &str,
        previous: DateTime<Utc>,
        current: DateTime<Utc>,
    ) -> Result<(i64, i64)>;

    /// Add `delta` (possibly negative) to the count of `key` in `window` and
    /// return the new count.
    fn add(&self, key: &str, window: DateTime<Utc>, delta: i64) -> Result<i64>;

    /// Number of (key, window) entries held.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stop background maintenance, if any.
    fn shutdown(&self) {}
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct WindowKey {
    key: String,
    window: DateTime<Utc>,
}

impl WindowKey {
    fn new(key: &str, window: DateTime<Utc>) -> Self {
        Self {
            key: key.to_string(),
            window,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct WindowCount {
    count: i64,
    last_update: Instant,
}

/// In-memory [`WindowStore`] that forgets entries not updated within
/// `expiration`.
///
/// A background sweep runs every `flush_interval`. Expiry bounds memory; it
/// does not depend on whether the entry's window has ended. The sweep walks
/// the map one shard at a time, so admissions on other shards proceed while
/// it runs.
pub struct KeyedExpiringStore {
    data: Arc<DashMap<WindowKey, WindowCount>>,
    expiration: Duration,
    sweeper: Option<PeriodicTask>,
}

impl KeyedExpiringStore {
    /// Create a store with a background sweep. Requires a Tokio runtime.
    pub fn new(expiration: Duration, flush_interval: Duration) -> Result<Self> {
        let mut store = Self::without_sweeper(expiration)?;

        let data = Arc::clone(&store.data);
        store.sweeper = Some(PeriodicTask::spawn(
            "window-store-sweep",
            flush_interval,
            move || {
                sweep(&data, expiration, Instant::now());
            },
        )?);

        Ok(store)
    }

    /// Create a store that only expires entries when [`sweep_expired`](Self::sweep_expired)
    /// is called.
    pub fn without_sweeper(expiration: Duration) -> Result<Self> {
        if expiration.is_zero() {
            return Err(TurnstileError::Config(
                "window store expiration must be greater than zero".to_string(),
            ));
        }

        Ok(Self {
            data: Arc::new(DashMap::new()),
            expiration,
            sweeper: None,
        })
    }

    /// How long an idle key's windows are kept.
    pub fn expiration(&self) -> Duration {
        self.expiration
    }

    /// Remove entries last updated more than `expiration` before `now`.
    /// Returns how many were removed.
    pub fn sweep_expired(&self, now: Instant) -> usize {
        sweep(&self.data, self.expiration, now)
    }
}

fn sweep(data: &DashMap<WindowKey, WindowCount>, expiration: Duration, now: Instant) -> usize {
    let before = data.len();
    data.retain(|_, entry| now.saturating_duration_since(entry.last_update) <= expiration);
    let removed = before.saturating_sub(data.len());
    if removed > 0 {
        debug!(removed = removed, remaining = data.len(), "Swept expired window entries");
    }
    removed
}

impl WindowStore for KeyedExpiringStore {
    fn counts(
        &self,
        key: &str,
        previous: DateTime<Utc>,
        current: DateTime<Utc>,
    ) -> Result<(i64, i64)> {
        let read = |window| {
            self.data
                .get(&WindowKey::new(key, window))
                .map_or(0, |entry| entry.count)
        };
        Ok((read(previous), read(current)))
    }

    fn add(&self, key: &str, window: DateTime<Utc>, delta: i64) -> Result<i64> {
        let now = Instant::now();
        let mut entry = self
            .data
            .entry(WindowKey::new(key, window))
            .or_insert(WindowCount {
                count: 0,
                last_update: now,
            });
        entry.count += delta;
        entry.last_update = now;
        Ok(entry.count)
    }

    fn len(&self) -> usize {
        self.data.len()
    }

    fn shutdown(&self) {
        if let Some(sweeper) = &self.sweeper {
            sweeper.stop();
        }
    }
}
