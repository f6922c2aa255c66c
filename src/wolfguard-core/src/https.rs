//! HTTPS transport for the license endpoint.
//!
//! ## Endpoint
//!
//! - `POST <license_endpoint>` with a [`LicenseRequest`] body, answered by a
//!   [`LicenseResponse`]
//!
//! Non-2xx answers, timeouts and unparseable bodies all surface as
//! [`GuardError::Network`], which the verifier treats as "offline".

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, ClientBuilder};
use tracing::{debug, info, instrument, warn};

use crate::error::GuardError;
use crate::license::{LicenseRequest, LicenseResponse};

/// Sends license verification requests.
#[async_trait]
pub trait LicenseTransport: Send + Sync {
    /// Ask the backend whether the license in `request` is valid.
    async fn verify(&self, request: &LicenseRequest) -> Result<LicenseResponse, GuardError>;
}

/// `reqwest`-backed [`LicenseTransport`].
pub struct HttpsLicenseClient {
    client: Client,
    endpoint: String,
    timeout: Duration,
}

impl HttpsLicenseClient {
    /// Create a client posting to `endpoint` with a per-request `timeout`.
    pub fn new(endpoint: &str, timeout: Duration) -> Result<Self, GuardError> {
        let connect_timeout = timeout.min(Duration::from_secs(3));

        let client = ClientBuilder::new()
            .timeout(timeout)
            .connect_timeout(connect_timeout)
            .pool_idle_timeout(Duration::from_secs(5))
            .pool_max_idle_per_host(1)
            .tcp_nodelay(true)
            .user_agent(format!("WolfGuard/{}", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| GuardError::network(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self {
            client,
            endpoint: endpoint.to_string(),
            timeout,
        })
    }

    /// Endpoint URL.
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn post(&self, request: &LicenseRequest) -> Result<LicenseResponse, GuardError> {
        let response = self
            .client
            .post(&self.endpoint)
            .json(request)
            .send()
            .await
            .map_err(|e| {
                warn!(url = %self.endpoint, error = %e, "HTTPS: license request failed");
                GuardError::network(format!("Request to {} failed: {e}", self.endpoint))
            })?;

        let status = response.status();
        debug!(url = %self.endpoint, status = %status, "HTTPS: response received");

        if !status.is_success() {
            warn!(url = %self.endpoint, status = %status, "HTTPS: non-success status");
            return Err(GuardError::network(format!("HTTP {status} from {}", self.endpoint)));
        }

        response.json::<LicenseResponse>().await.map_err(|e| {
            warn!(url = %self.endpoint, error = %e, "HTTPS: failed to parse license response");
            GuardError::network(format!("Failed to parse response from {}: {e}", self.endpoint))
        })
    }
}

#[async_trait]
impl LicenseTransport for HttpsLicenseClient {
    #[instrument(skip(self, request), fields(url = %self.endpoint))]
    async fn verify(&self, request: &LicenseRequest) -> Result<LicenseResponse, GuardError> {
        info!(platform = %request.device_info.platform, "HTTPS: verifying license");

        // reqwest's timeout does not cover a stalled DNS lookup on every platform.
        let outer = self.timeout + Duration::from_secs(1);
        let result = tokio::time::timeout(outer, self.post(request))
            .await
            .map_err(|_| GuardError::network(format!("License request timed out after {}s", outer.as_secs())))??;

        info!(is_valid = result.is_valid, "HTTPS: license response received");
        Ok(result)
    }
}
