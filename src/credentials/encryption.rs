//! AES-256-GCM secret codec for OAuth tokens at rest.
//!
//! Every call to [`SecretCodec::encrypt`] draws a fresh 96-bit nonce. The
//! stored blob is `base64(nonce || ciphertext)`, where the ciphertext carries
//! the GCM tag, so integrity is checked on every decrypt.

use crate::error::CodecError;
use aes_gcm::{
    aead::{Aead, AeadCore, KeyInit, OsRng},
    Aes256Gcm, Nonce,
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use std::fmt;

/// Size of the encryption key in bytes (256 bits)
const KEY_SIZE: usize = 32;

/// Size of the nonce in bytes (96 bits, standard for GCM)
const NONCE_SIZE: usize = 12;

/// Size of the GCM authentication tag in bytes
const TAG_SIZE: usize = 16;

/// Symmetric codec holding the master key.
///
/// The key lives in memory only. `Debug` is implemented by hand so the key
/// never ends up in logs.
#[derive(Clone)]
pub struct SecretCodec {
    cipher: Aes256Gcm,
}

impl fmt::Debug for SecretCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SecretCodec { key: <redacted> }")
    }
}

impl SecretCodec {
    /// Builds a codec from a base64-encoded 32-byte master key.
    pub fn from_base64_key(key_base64: &str) -> Result<Self, CodecError> {
        let key_bytes = BASE64
            .decode(key_base64.trim())
            .map_err(|_| CodecError::InvalidKey)?;
        Self::from_key_bytes(&key_bytes)
    }

    /// Builds a codec from raw key bytes (must be exactly 32 bytes).
    pub fn from_key_bytes(key: &[u8]) -> Result<Self, CodecError> {
        if key.len() != KEY_SIZE {
            return Err(CodecError::InvalidKey);
        }
        let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| CodecError::InvalidKey)?;
        Ok(Self { cipher })
    }

    /// Reads the key from an environment variable. Absent or invalid keys
    /// are both `CodecError::InvalidKey`.
    pub fn from_env(var: &str) -> Result<Self, CodecError> {
        let key = std::env::var(var).map_err(|_| CodecError::InvalidKey)?;
        Self::from_base64_key(&key)
    }

    /// Encrypts `plaintext` under a random nonce.
    pub fn encrypt(&self, plaintext: &str) -> Result<String, CodecError> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext.as_bytes())
            .map_err(|_| CodecError::Malformed)?;

        let mut blob = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        blob.extend_from_slice(&nonce);
        blob.extend_from_slice(&ciphertext);
        Ok(BASE64.encode(blob))
    }

    /// Decrypts a blob produced by [`encrypt`](Self::encrypt).
    ///
    /// Undecodable or truncated blobs are `Malformed`; anything that fails
    /// GCM authentication is `Tampered`. Corrupted plaintext is never returned.
    pub fn decrypt(&self, blob: &str) -> Result<String, CodecError> {
        let bytes = BASE64.decode(blob).map_err(|_| CodecError::Malformed)?;
        if bytes.len() < NONCE_SIZE + TAG_SIZE {
            return Err(CodecError::Malformed);
        }

        let (nonce, ciphertext) = bytes.split_at(NONCE_SIZE);
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| CodecError::Tampered)?;

        String::from_utf8(plaintext).map_err(|_| CodecError::Malformed)
    }
}
