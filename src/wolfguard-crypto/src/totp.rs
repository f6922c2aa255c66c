//! RFC 6238 time-based one-time passwords.
//!
//! HMAC-SHA1 over the big-endian time-step counter, dynamic truncation
//! (RFC 4226 §5.3), reduced modulo `10^digits` and zero-padded.

use hmac::{Hmac, Mac};
use sha1::Sha1;

use crate::error::CryptoError;

type HmacSha1 = Hmac<Sha1>;

/// Default time step in seconds.
pub const DEFAULT_STEP_SECS: u64 = 30;

/// Default number of digits.
pub const DEFAULT_DIGITS: u32 = 6;

/// TOTP parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TotpParams {
    /// Time step in seconds.
    pub step_secs: u64,
    /// Output digits (1..=9).
    pub digits: u32,
}

impl Default for TotpParams {
    fn default() -> Self {
        Self {
            step_secs: DEFAULT_STEP_SECS,
            digits: DEFAULT_DIGITS,
        }
    }
}

impl TotpParams {
    /// Time-step counter for a Unix timestamp.
    #[must_use]
    pub fn counter_at(&self, unix_secs: i64) -> u64 {
        (unix_secs.max(0) as u64) / self.step_secs.max(1)
    }

    /// Whether `code` has the expected shape (exactly `digits` ASCII digits).
    #[must_use]
    pub fn is_well_formed(&self, code: &str) -> bool {
        code.len() == self.digits as usize && code.bytes().all(|b| b.is_ascii_digit())
    }
}

/// Compute the HOTP value for a raw key and counter.
pub fn hotp(key: &[u8], counter: u64, digits: u32) -> Result<String, CryptoError> {
    let mut mac =
        HmacSha1::new_from_slice(key).map_err(|e| CryptoError::invalid_key(e.to_string()))?;
    mac.update(&counter.to_be_bytes());
    let digest = mac.finalize().into_bytes();

    let offset = (digest[digest.len() - 1] & 0x0f) as usize;
    let binary = u32::from_be_bytes([
        digest[offset] & 0x7f,
        digest[offset + 1],
        digest[offset + 2],
        digest[offset + 3],
    ]);

    let digits = digits.clamp(1, 9);
    let code = binary % 10u32.pow(digits);
    Ok(format!("{:0width$}", code, width = digits as usize))
}

/// Compute the TOTP code for a raw key at a given counter.
pub fn totp_at_counter(
    key: &[u8],
    counter: u64,
    params: &TotpParams,
) -> Result<String, CryptoError> {
    hotp(key, counter, params.digits)
}

/// Compute the TOTP code for a raw key at a Unix timestamp.
pub fn totp(key: &[u8], unix_secs: i64, params: &TotpParams) -> Result<String, CryptoError> {
    totp_at_counter(key, params.counter_at(unix_secs), params)
}

/// Compute the TOTP code for a Base32 secret at a Unix timestamp.
pub fn totp_base32(secret: &str, unix_secs: i64, params: &TotpParams) -> Result<String, CryptoError> {
    let key = crate::secret::decode_base32(secret)?;
    totp(&key, unix_secs, params)
}
