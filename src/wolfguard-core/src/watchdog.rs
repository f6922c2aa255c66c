//! Delayed, non-cancellable termination.
//!
//! When a violation is confirmed the `ShutdownWatchdog` gives the host a
//! short window (two seconds by default) to show its notice, then calls the
//! host's [`TerminationHandler`].
//!
//! ## Security Properties
//!
//! - No override: once issued, a termination cannot be cancelled
//! - Single shot: later requests are logged and ignored
//! - Works without a runtime: falls back to a plain thread

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use tracing::{error, info, warn};

use crate::host::TerminationHandler;

/// A termination that has been issued.
#[derive(Debug, Clone)]
pub struct PendingShutdown {
    /// Why the app is being terminated.
    pub reason: String,
    /// When the request was issued.
    pub issued_at: Instant,
    /// Delay before the handler runs.
    pub delay: Duration,
}

/// Issues at most one delayed termination per process.
pub struct ShutdownWatchdog {
    handler: Arc<dyn TerminationHandler>,
    delay: Duration,
    pending: OnceLock<PendingShutdown>,
    fired: Arc<AtomicBool>,
}

impl ShutdownWatchdog {
    /// Create a watchdog that calls `handler` `delay` after a request.
    pub fn new(handler: Arc<dyn TerminationHandler>, delay: Duration) -> Self {
        Self {
            handler,
            delay,
            pending: OnceLock::new(),
            fired: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Schedule termination.
    ///
    /// Returns `true` if this call issued it, `false` if one was already
    /// pending.
    pub fn request_termination(&self, reason: &str) -> bool {
        let mut issued = false;
        self.pending.get_or_init(|| {
            issued = true;
            PendingShutdown {
                reason: reason.to_string(),
                issued_at: Instant::now(),
                delay: self.delay,
            }
        });

        if !issued {
            warn!(reason = %reason, "ShutdownWatchdog: termination already pending, ignoring");
            return false;
        }

        error!(reason = %reason, delay_ms = self.delay.as_millis() as u64, "ShutdownWatchdog: termination issued");

        let handler = self.handler.clone();
        let fired = self.fired.clone();
        let delay = self.delay;
        let reason = reason.to_string();
        let fire = move || {
            fired.store(true, Ordering::SeqCst);
            info!("ShutdownWatchdog: invoking termination handler");
            handler.terminate(&reason);
        };

        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    tokio::time::sleep(delay).await;
                    fire();
                });
            },
            Err(_) => {
                std::thread::spawn(move || {
                    std::thread::sleep(delay);
                    fire();
                });
            },
        }
        true
    }

    /// The issued termination, if any.
    pub fn pending(&self) -> Option<&PendingShutdown> {
        self.pending.get()
    }

    /// Whether a termination has been issued.
    pub fn is_issued(&self) -> bool {
        self.pending.get().is_some()
    }

    /// Whether the termination handler has been invoked.
    pub fn has_fired(&self) -> bool {
        self.fired.load(Ordering::SeqCst)
    }
}
