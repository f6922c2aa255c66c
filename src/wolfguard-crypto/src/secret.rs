//! Random secrets and one-time codes.

use rand::distributions::{Alphanumeric, DistString};
use rand::rngs::OsRng;
use rand::RngCore;

use crate::error::CryptoError;

const BASE32: base32::Alphabet = base32::Alphabet::Rfc4648 { padding: false };

/// Generate `byte_len` random bytes and return them Base32-encoded (no padding).
pub fn generate_base32_secret(byte_len: usize) -> Result<String, CryptoError> {
    let mut bytes = vec![0u8; byte_len];
    OsRng
        .try_fill_bytes(&mut bytes)
        .map_err(|e| CryptoError::RandomFailed {
            reason: e.to_string(),
        })?;
    Ok(base32::encode(BASE32, &bytes))
}

/// Decode a Base32 secret.
///
/// Case-insensitive; spaces and `=` padding are ignored so that secrets
/// copied from authenticator apps decode.
pub fn decode_base32(secret: &str) -> Result<Vec<u8>, CryptoError> {
    let normalized: String = secret
        .chars()
        .filter(|c| !c.is_whitespace() && *c != '=')
        .map(|c| c.to_ascii_uppercase())
        .collect();
    if normalized.is_empty() {
        return Err(CryptoError::InvalidBase32);
    }
    base32::decode(BASE32, &normalized).ok_or(CryptoError::InvalidBase32)
}

/// Generate a random alphanumeric code (`[A-Za-z0-9]`).
#[must_use]
pub fn generate_alphanumeric(len: usize) -> String {
    Alphanumeric.sample_string(&mut OsRng, len)
}
