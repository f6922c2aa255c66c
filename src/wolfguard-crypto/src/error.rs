//! Cryptographic error types.

use thiserror::Error;

/// Errors that can occur during cryptographic operations.
#[derive(Debug, Error)]
pub enum CryptoError {
    /// Ciphertext is not valid base64 or is too short to hold an IV.
    #[error("Malformed ciphertext: {reason}")]
    MalformedCiphertext {
        /// Reason the ciphertext was rejected.
        reason: String,
    },

    /// Decryption failed (wrong key material or corrupted data).
    #[error("Decryption failed")]
    DecryptionFailed,

    /// Decrypted bytes are not valid UTF-8.
    #[error("Decrypted payload is not valid UTF-8")]
    InvalidPlaintext,

    /// Invalid key length handed to a cipher or MAC.
    #[error("Invalid key: {reason}")]
    InvalidKey {
        /// Reason the key is invalid.
        reason: String,
    },

    /// Secret is not valid Base32.
    #[error("Invalid Base32 secret")]
    InvalidBase32,

    /// Random number generator failure.
    #[error("Random generation failed: {reason}")]
    RandomFailed {
        /// Reason for the failure.
        reason: String,
    },
}

impl CryptoError {
    /// Create a malformed ciphertext error.
    #[must_use]
    pub fn malformed(reason: impl Into<String>) -> Self {
        Self::MalformedCiphertext {
            reason: reason.into(),
        }
    }

    /// Create an invalid key error.
    #[must_use]
    pub fn invalid_key(reason: impl Into<String>) -> Self {
        Self::InvalidKey {
            reason: reason.into(),
        }
    }
}
