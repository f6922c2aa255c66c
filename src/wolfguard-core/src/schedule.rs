//! Cancellable periodic tasks.

use std::future::Future;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::debug;

/// Handle to a spawned interval loop. Dropping it stops the loop.
#[derive(Debug)]
pub struct PeriodicTask {
    name: &'static str,
    handle: JoinHandle<()>,
}

impl PeriodicTask {
    /// Spawn `tick` every `period`, first run one period from now.
    ///
    /// Must be called from within a Tokio runtime. Slow ticks delay the next
    /// one instead of bursting to catch up.
    pub fn spawn<F, Fut>(name: &'static str, period: Duration, mut tick: F) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let period = period.max(Duration::from_millis(1));
        let handle = tokio::spawn(async move {
            let mut interval = interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                debug!(task = name, "PeriodicTask: tick");
                tick().await;
            }
        });
        debug!(task = name, period_secs = period.as_secs(), "PeriodicTask: started");
        Self { name, handle }
    }

    /// Task name.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Whether the loop is still running.
    pub fn is_running(&self) -> bool {
        !self.handle.is_finished()
    }

    /// Stop the loop.
    pub fn stop(self) {
        // Drop aborts.
    }
}

impl Drop for PeriodicTask {
    fn drop(&mut self) {
        self.handle.abort();
        debug!(task = self.name, "PeriodicTask: stopped");
    }
}
