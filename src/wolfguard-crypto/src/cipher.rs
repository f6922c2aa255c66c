//! AES-256-CBC sealing with PKCS#7 padding.
//!
//! Sealed output is `base64(iv || ciphertext)` with a fresh random IV per call.
//! CBC provides confidentiality only: a wrong key is detected by a padding or
//! UTF-8 failure in most cases, and callers must still validate the payload
//! shape after a successful open.

use aes::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use rand::rngs::OsRng;
use rand::RngCore;

use crate::error::CryptoError;
use crate::kdf::KeyMaterial;

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

/// AES block / IV size.
pub const IV_LEN: usize = 16;

/// Encrypt raw bytes, returning `iv || ciphertext`.
pub fn seal_bytes(key: &KeyMaterial, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let mut iv = [0u8; IV_LEN];
    OsRng
        .try_fill_bytes(&mut iv)
        .map_err(|e| CryptoError::RandomFailed {
            reason: e.to_string(),
        })?;

    let cipher = Aes256CbcEnc::new_from_slices(key.as_bytes(), &iv)
        .map_err(|e| CryptoError::invalid_key(e.to_string()))?;
    let ciphertext = cipher.encrypt_padded_vec_mut::<Pkcs7>(plaintext);

    let mut out = Vec::with_capacity(IV_LEN + ciphertext.len());
    out.extend_from_slice(&iv);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Decrypt `iv || ciphertext` produced by [`seal_bytes`].
pub fn open_bytes(key: &KeyMaterial, sealed: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if sealed.len() < IV_LEN * 2 || (sealed.len() - IV_LEN) % IV_LEN != 0 {
        return Err(CryptoError::malformed(format!(
            "length {} is not IV plus whole blocks",
            sealed.len()
        )));
    }

    let (iv, ciphertext) = sealed.split_at(IV_LEN);
    let cipher = Aes256CbcDec::new_from_slices(key.as_bytes(), iv)
        .map_err(|e| CryptoError::invalid_key(e.to_string()))?;

    cipher
        .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
        .map_err(|_| CryptoError::DecryptionFailed)
}

/// Encrypt a UTF-8 string into the base64 envelope.
pub fn seal(key: &KeyMaterial, plaintext: &str) -> Result<String, CryptoError> {
    seal_bytes(key, plaintext.as_bytes()).map(|sealed| STANDARD.encode(sealed))
}

/// Decrypt a base64 envelope back into a UTF-8 string.
pub fn open(key: &KeyMaterial, envelope: &str) -> Result<String, CryptoError> {
    let sealed = STANDARD
        .decode(envelope.trim())
        .map_err(|e| CryptoError::malformed(e.to_string()))?;
    let plaintext = open_bytes(key, &sealed)?;
    String::from_utf8(plaintext).map_err(|_| CryptoError::InvalidPlaintext)
}
