//! AES-256-GCM token codec.
//!
//! Encrypts a single device token into the hex record stored on one line of
//! `tokens.data`, and back.
//!
//! # Wire Format
//!
//! ```text
//! hex(ciphertext || tag)
//! ```
//!
//! Lowercase hex, no associated data, 16-byte GCM tag appended to the
//! ciphertext. Uppercase hex is accepted on decode.
//!
//! # Security
//!
//! Every record is sealed with the same key AND the same nonce. Encryption is
//! therefore deterministic, and nonce reuse under GCM leaks the XOR of
//! plaintexts and weakens tag forgery resistance. This matches the format of
//! existing token logs. A fixed format would store a fresh random nonce with
//! each record.

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Key, Nonce,
};
use data_encoding::{HEXLOWER, HEXLOWER_PERMISSIVE};
use thiserror::Error;

use crate::keys::KeyMaterial;

/// Errors decoding a single record.
///
/// Callers loading a log skip the offending record and continue.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    /// The record is not valid hex.
    #[error("record is not valid hex: {0}")]
    Decode(String),
    /// The authentication tag did not verify (corrupt record or wrong key).
    #[error("record failed authentication")]
    Authentication,
    /// The decrypted bytes are not valid UTF-8.
    #[error("decrypted record is not valid UTF-8")]
    Utf8,
    /// The cipher refused to seal the plaintext.
    #[error("encryption failed")]
    Encrypt,
}

fn cipher(keys: &KeyMaterial) -> Aes256Gcm {
    Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(keys.key()))
}

/// Encrypt a token identifier into a hex record.
pub fn encrypt(plaintext_id: &str, keys: &KeyMaterial) -> Result<String, CodecError> {
    let ciphertext = cipher(keys)
        .encrypt(Nonce::from_slice(keys.nonce()), plaintext_id.as_bytes())
        .map_err(|_aead| CodecError::Encrypt)?;

    Ok(HEXLOWER.encode(&ciphertext))
}

/// Decrypt a hex record back into the token identifier.
pub fn decrypt(hex_ciphertext: &str, keys: &KeyMaterial) -> Result<String, CodecError> {
    let ciphertext = HEXLOWER_PERMISSIVE
        .decode(hex_ciphertext.as_bytes())
        .map_err(|e| CodecError::Decode(e.to_string()))?;

    let plaintext = cipher(keys)
        .decrypt(Nonce::from_slice(keys.nonce()), ciphertext.as_ref())
        .map_err(|_aead| CodecError::Authentication)?;

    String::from_utf8(plaintext).map_err(|_utf8| CodecError::Utf8)
}
