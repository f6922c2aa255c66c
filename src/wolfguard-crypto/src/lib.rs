//! # wolfguard-crypto
//!
//! Cryptographic primitives for the WolfGuard trust layer.
//!
//! This crate is pure computation with no I/O:
//! - **Key derivation**: PBKDF2-HMAC-SHA256 from a device-bound secret
//! - **Sealing**: AES-256-CBC with PKCS#7 padding, `base64(iv || ciphertext)`
//! - **One-time passwords**: RFC 6238 TOTP (HMAC-SHA1, 30 s, 6 digits)
//! - **Secrets**: Base32 TOTP secrets and alphanumeric recovery codes
//!
//! ## Envelope
//!
//! ```text
//! key      = PBKDF2(device_secret, salt, 1000, 32)
//! envelope = base64( iv[16] || AES-256-CBC(key, iv, pkcs7(plaintext)) )
//! ```
//!
//! The envelope is not authenticated. Callers validate decrypted payloads
//! (for example by parsing JSON) before trusting them.

#![warn(missing_docs)]
#![warn(clippy::all)]

mod cipher;
mod error;
mod kdf;
mod secret;
mod totp;

pub use cipher::{open, open_bytes, seal, seal_bytes, IV_LEN};
pub use error::CryptoError;
pub use kdf::{KeyMaterial, DEFAULT_ITERATIONS, KEY_LEN};
pub use secret::{decode_base32, generate_alphanumeric, generate_base32_secret};
pub use totp::{
    hotp, totp, totp_at_counter, totp_base32, TotpParams, DEFAULT_DIGITS, DEFAULT_STEP_SECS,
};

/// Constant-time byte comparison.
///
/// Compares two byte slices in constant time to prevent timing attacks.
/// Returns `true` if the slices are equal, `false` otherwise.
///
/// # Security
///
/// Use this for every comparison of secret-derived values (OTP codes,
/// recovery codes, integrity hashes).
///
/// The length check still returns early, but length is typically not secret.
#[must_use]
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    use subtle::ConstantTimeEq;

    if a.len() != b.len() {
        return false;
    }
    a.ct_eq(b).into()
}
