//! Host-backed device and application identity.
//!
//! Desktop and server builds have no platform SDK to ask for a device id or
//! a signing certificate, so these providers derive them from the machine:
//!
//! - device id: `WOLFGUARD_DEVICE_ID`, then `/etc/machine-id`, then
//!   `/var/lib/dbus/machine-id`
//! - model: DMI product name, else the CPU architecture
//! - signature: SHA-256 of the running executable

use std::path::PathBuf;

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::error::GuardError;
use crate::host::{AppIdentityProvider, DeviceInfoProvider};
use crate::types::{AppIdentity, DeviceIdentity};

/// Environment variable overriding the machine id.
pub const DEVICE_ID_ENV: &str = "WOLFGUARD_DEVICE_ID";

const MACHINE_ID_PATHS: [&str; 2] = ["/etc/machine-id", "/var/lib/dbus/machine-id"];
const PRODUCT_NAME_PATH: &str = "/sys/class/dmi/id/product_name";
const OS_RELEASE_PATH: &str = "/proc/sys/kernel/osrelease";

/// Device identity read from the local machine.
#[derive(Debug, Clone)]
pub struct HostDeviceInfo {
    app_version: String,
    build_number: String,
}

impl HostDeviceInfo {
    /// Report the given application version and build number.
    pub fn new(app_version: impl Into<String>, build_number: impl Into<String>) -> Self {
        Self {
            app_version: app_version.into(),
            build_number: build_number.into(),
        }
    }

    async fn machine_id() -> Option<String> {
        if let Ok(id) = std::env::var(DEVICE_ID_ENV) {
            if !id.trim().is_empty() {
                return Some(id.trim().to_string());
            }
        }
        for path in MACHINE_ID_PATHS {
            if let Some(id) = read_trimmed(path).await {
                return Some(id);
            }
        }
        None
    }
}

#[async_trait]
impl DeviceInfoProvider for HostDeviceInfo {
    async fn device_identity(&self) -> Result<DeviceIdentity, GuardError> {
        let uuid = Self::machine_id()
            .await
            .ok_or_else(|| GuardError::host("device_info", "no machine id available"))?;
        let model = read_trimmed(PRODUCT_NAME_PATH)
            .await
            .unwrap_or_else(|| std::env::consts::ARCH.to_string());
        let os_version = read_trimmed(OS_RELEASE_PATH)
            .await
            .unwrap_or_else(|| "unknown".to_string());

        Ok(DeviceIdentity {
            uuid,
            platform: std::env::consts::OS.to_string(),
            model,
            os_version,
            app_version: self.app_version.clone(),
            build_number: self.build_number.clone(),
        })
    }
}

/// Application identity derived from the running binary.
#[derive(Debug, Clone)]
pub struct ExecutableIdentity {
    package_id: String,
    version: String,
    path: Option<PathBuf>,
}

impl ExecutableIdentity {
    /// Identity of the current executable.
    pub fn new(package_id: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            package_id: package_id.into(),
            version: version.into(),
            path: None,
        }
    }

    /// Hash a specific file instead of the current executable.
    pub fn with_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.path = Some(path.into());
        self
    }

    async fn signature_hash(&self) -> Result<String, GuardError> {
        let path = match &self.path {
            Some(p) => p.clone(),
            None => std::env::current_exe()
                .map_err(|e| GuardError::host("app_identity", format!("current_exe: {e}")))?,
        };
        let bytes = tokio::fs::read(&path).await.map_err(|e| {
            GuardError::host("app_identity", format!("read {}: {e}", path.display()))
        })?;
        let digest = Sha256::digest(&bytes);
        debug!(path = %path.display(), size = bytes.len(), "ExecutableIdentity: hashed binary");
        Ok(hex::encode(digest))
    }
}

#[async_trait]
impl AppIdentityProvider for ExecutableIdentity {
    async fn app_identity(&self) -> Result<AppIdentity, GuardError> {
        Ok(AppIdentity {
            signature_hash: self.signature_hash().await?,
            package_id: self.package_id.clone(),
            version: self.version.clone(),
        })
    }
}

async fn read_trimmed(path: &str) -> Option<String> {
    let contents = tokio::fs::read_to_string(path).await.ok()?;
    let trimmed = contents.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}
