//! Owned, cancellable periodic background tasks.

use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info};

use crate::error::{Result, TurnstileError};

/// A repeating task owned by a limiter.
///
/// The task runs `tick` every `period`, first firing one period after spawn.
/// It stops when [`stop`](Self::stop) is called or when the handle is dropped.
pub struct PeriodicTask {
    name: &'static str,
    shutdown: watch::Sender<bool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl PeriodicTask {
    /// Spawn the task on the current Tokio runtime.
    pub fn spawn<F>(name: &'static str, period: Duration, mut tick: F) -> Result<Self>
    where
        F: FnMut() + Send + 'static,
    {
        if period.is_zero() {
            return Err(TurnstileError::Config(format!(
                "{name} period must be greater than zero"
            )));
        }
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| {
            TurnstileError::Config(format!("{name} must be started inside a Tokio runtime"))
        })?;

        let (shutdown, mut stopped) = watch::channel(false);

        let handle = runtime.spawn(async move {
            let mut interval = tokio::time::interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = interval.tick() => tick(),
                    // Also fires when the sender is dropped
                    _ = stopped.changed() => break,
                }
            }
            debug!(task = name, "Periodic task exited");
        });

        info!(task = name, period_ms = period.as_millis() as u64, "Periodic task started");

        Ok(Self {
            name,
            shutdown,
            handle: Mutex::new(Some(handle)),
        })
    }

    /// Signal the task to stop. Safe to call more than once.
    pub fn stop(&self) {
        if self.handle.lock().take().is_some() {
            let _ = self.shutdown.send(true);
            info!(task = self.name, "Periodic task stopping");
        }
    }

    /// Whether the task has been neither stopped nor finished.
    pub fn is_running(&self) -> bool {
        self.handle
            .lock()
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }
}

impl Drop for PeriodicTask {
    fn drop(&mut self) {
        self.stop();
    }
}
