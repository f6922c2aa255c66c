//! Environment probes.
//!
//! ## Probes
//!
//! | Probe             | Rooted | Debugger                 | Emulator |
//! |-------------------|--------|--------------------------|----------|
//! | `PassiveProbe`    | never  | never                    | never    |
//! | `ProcStatusProbe` | never  | `TracerPid` (Linux only) | never    |
//!
//! Real root, jailbreak and emulator detection belongs to the host
//! application, which plugs its own [`EnvironmentProbe`] in. The probes here
//! only raise the bar against casual tampering.

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::error::GuardError;
use crate::host::EnvironmentProbe;

/// Probe that detects nothing.
///
/// Logs once that environment checks are not backed by real sensors, so a
/// deployment that forgot to plug in its own probe shows up in the logs.
#[derive(Debug, Default)]
pub struct PassiveProbe {
    announced: AtomicBool,
}

impl PassiveProbe {
    /// Create a passive probe.
    pub fn new() -> Self {
        Self::default()
    }

    fn announce(&self) {
        if !self.announced.swap(true, Ordering::Relaxed) {
            warn!("PassiveProbe: no environment sensors installed, root/debugger/emulator checks always pass");
        }
    }
}

#[async_trait]
impl EnvironmentProbe for PassiveProbe {
    fn name(&self) -> &'static str {
        "passive"
    }

    async fn is_rooted(&self) -> Result<bool, GuardError> {
        self.announce();
        Ok(false)
    }

    async fn is_debugger_attached(&self) -> Result<bool, GuardError> {
        self.announce();
        Ok(false)
    }

    async fn is_emulator(&self) -> Result<bool, GuardError> {
        self.announce();
        Ok(false)
    }
}

/// Probe reading the kernel's view of the current process.
///
/// On Linux and Android a non-zero `TracerPid` in `/proc/self/status` means
/// something is ptrace-attached. Other platforms report no debugger.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcStatusProbe;

impl ProcStatusProbe {
    /// Parse the tracer pid out of a `/proc/<pid>/status` document.
    pub fn tracer_pid(status: &str) -> Option<u32> {
        status
            .lines()
            .find_map(|line| line.strip_prefix("TracerPid:"))
            .and_then(|rest| rest.trim().parse().ok())
    }
}

#[async_trait]
impl EnvironmentProbe for ProcStatusProbe {
    fn name(&self) -> &'static str {
        "proc_status"
    }

    async fn is_rooted(&self) -> Result<bool, GuardError> {
        Ok(false)
    }

    #[cfg(any(target_os = "linux", target_os = "android"))]
    async fn is_debugger_attached(&self) -> Result<bool, GuardError> {
        let status = tokio::fs::read_to_string("/proc/self/status")
            .await
            .map_err(|e| GuardError::host("proc_status", e.to_string()))?;
        let tracer = Self::tracer_pid(&status)
            .ok_or_else(|| GuardError::host("proc_status", "TracerPid missing"))?;
        debug!(tracer_pid = tracer, "ProcStatusProbe: read tracer pid");
        Ok(tracer != 0)
    }

    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    async fn is_debugger_attached(&self) -> Result<bool, GuardError> {
        Ok(false)
    }

    async fn is_emulator(&self) -> Result<bool, GuardError> {
        Ok(false)
    }
}
