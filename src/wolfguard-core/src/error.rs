//! Error types for the trust layer.

use thiserror::Error;

/// Errors that can occur across the trust layer.
#[derive(Debug, Error)]
pub enum GuardError {
    /// Encryption, decryption or key derivation failed.
    #[error("Crypto error: {0}")]
    Crypto(#[from] wolfguard_crypto::CryptoError),

    /// Input had the wrong shape (OTP code, recovery code, payload).
    #[error("Validation failed: {reason}")]
    Validation {
        /// Reason the input was rejected.
        reason: String,
    },

    /// License endpoint unreachable, timed out or answered garbage.
    #[error("Network error: {message}")]
    Network {
        /// Error message.
        message: String,
    },

    /// Tamper or signature mismatch detected.
    #[error("Integrity violation: {reason}")]
    IntegrityViolation {
        /// What was violated.
        reason: String,
    },

    /// Login or request threshold crossed.
    #[error("Rate limit exceeded for {subject}")]
    RateLimitExceeded {
        /// User id or endpoint that crossed the threshold.
        subject: String,
    },

    /// Persistent storage failed.
    #[error("Storage error: {0}")]
    Storage(#[from] wolfguard_keyring::KeyringError),

    /// A component was used before `initialize()` completed.
    #[error("{component} used before initialization")]
    NotInitialized {
        /// Component name.
        component: &'static str,
    },

    /// Configuration error.
    #[error("Configuration error: {message}")]
    Config {
        /// Error message.
        message: String,
    },

    /// A host capability (device info, time source, probe) failed.
    #[error("Host capability {capability} failed: {message}")]
    Host {
        /// Capability name.
        capability: &'static str,
        /// Error message.
        message: String,
    },
}

impl GuardError {
    /// Create a validation error.
    #[must_use]
    pub fn validation(reason: impl Into<String>) -> Self {
        Self::Validation {
            reason: reason.into(),
        }
    }

    /// Create a network error.
    #[must_use]
    pub fn network(message: impl Into<String>) -> Self {
        Self::Network {
            message: message.into(),
        }
    }

    /// Create a host capability error.
    #[must_use]
    pub fn host(capability: &'static str, message: impl Into<String>) -> Self {
        Self::Host {
            capability,
            message: message.into(),
        }
    }

    /// Check if this error must reach the violation handler.
    ///
    /// Only integrity violations propagate to the orchestrator; everything
    /// else is absorbed at the component boundary.
    #[must_use]
    pub fn is_violation(&self) -> bool {
        matches!(self, Self::IntegrityViolation { .. })
    }

    /// Check if this error degrades to a fallback (missing value, offline path).
    #[must_use]
    pub fn is_degradable(&self) -> bool {
        matches!(
            self,
            Self::Crypto(_) | Self::Network { .. } | Self::Storage(_) | Self::Host { .. }
        )
    }
}
