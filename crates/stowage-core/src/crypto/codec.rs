//! The on-disk envelope format and the service that applies it.
//!
//! ```text
//! +---------+-------------+------------------------------+
//! | version |    nonce    |   ciphertext || GCM tag      |
//! | 1 byte  |  12 bytes   |   len(plaintext) + 16 bytes  |
//! +---------+-------------+------------------------------+
//! ```
//!
//! Buffers that are too short to hold the envelope, or whose first byte is
//! not [`VERSION_AES_256_GCM`], are legacy plaintext and pass through
//! [`decrypt_blob`] untouched.

use std::{fmt, str::FromStr};

use aes_gcm::{
    Aes256Gcm, Key, Nonce,
    aead::{Aead, KeyInit},
};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{error, trace};

use super::keys::StorageKey;
use crate::config::{ConfigError, EncryptionConfig};

/// Format marker for AES-256-GCM envelopes.
pub const VERSION_AES_256_GCM: u8 = 0x01;
pub const NONCE_SIZE: usize = 12;
pub const TAG_SIZE: usize = 16;
/// Version byte plus nonce.
pub const HEADER_SIZE: usize = 1 + NONCE_SIZE;
/// Bytes added to every encrypted file.
pub const OVERHEAD: usize = HEADER_SIZE + TAG_SIZE;

/// Decryption failed.
///
/// **[INTEGRITY VIOLATION]** Wrong key, tampered ciphertext and truncated
/// envelopes all map to this one value. The cause is logged, never returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("decryption failed")]
pub struct DecryptionError;

/// Encryption failed inside the AEAD implementation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("encryption failed")]
pub struct EncryptionError;

/// How a stored file is protected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EncryptionMethod {
    #[default]
    None,
    /// Server-side AES-256-GCM with a configured key.
    Server,
}

impl EncryptionMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            EncryptionMethod::None => "none",
            EncryptionMethod::Server => "server",
        }
    }
}

impl fmt::Display for EncryptionMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown encryption method {0:?} (expected \"none\" or \"server\")")]
pub struct UnknownMethod(pub String);

impl FromStr for EncryptionMethod {
    type Err = UnknownMethod;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "none" | "" => Ok(EncryptionMethod::None),
            "server" => Ok(EncryptionMethod::Server),
            other => Err(UnknownMethod(other.to_string())),
        }
    }
}

/// Whether `buf` starts like an envelope produced by [`encrypt_blob`].
#[inline]
pub fn is_encrypted(buf: &[u8]) -> bool {
    buf.len() >= OVERHEAD && buf[0] == VERSION_AES_256_GCM
}

/// Classify a buffer without decrypting it.
pub fn detect_encryption(buf: &[u8]) -> EncryptionMethod {
    if buf.first() == Some(&VERSION_AES_256_GCM) {
        EncryptionMethod::Server
    } else {
        EncryptionMethod::None
    }
}

/// Encrypt `plaintext` under `key` with a fresh random nonce.
pub fn encrypt_blob(plaintext: &[u8], key: &StorageKey) -> Result<Vec<u8>, EncryptionError> {
    let mut nonce = [0u8; NONCE_SIZE];
    rand::rng().fill_bytes(&mut nonce);

    let ciphertext = key.with_bytes(|k| {
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(k));
        cipher.encrypt(Nonce::from_slice(&nonce), plaintext)
    });
    let ciphertext = ciphertext.map_err(|e| {
        error!(error = %e, "AES-GCM encryption failed");
        EncryptionError
    })?;

    let mut out = Vec::with_capacity(HEADER_SIZE + ciphertext.len());
    out.push(VERSION_AES_256_GCM);
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Decrypt an envelope, passing legacy plaintext through unchanged.
pub fn decrypt_blob(blob: &[u8], key: &StorageKey) -> Result<Vec<u8>, DecryptionError> {
    if !is_encrypted(blob) {
        trace!(len = blob.len(), "no envelope header, treating as plaintext");
        return Ok(blob.to_vec());
    }

    let nonce = Nonce::from_slice(&blob[1..HEADER_SIZE]);
    let result = key.with_bytes(|k| {
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(k));
        cipher.decrypt(nonce, &blob[HEADER_SIZE..])
    });

    result.map_err(|e| {
        error!(error = %e, len = blob.len(), "AES-GCM authentication failed");
        DecryptionError
    })
}

/// Applies the configured encryption policy to file contents.
///
/// With method [`EncryptionMethod::None`] every operation is the identity and
/// no key material is held.
#[derive(Debug, Clone, Default)]
pub struct EncryptionService {
    method: EncryptionMethod,
    key: Option<StorageKey>,
    key_id: Option<String>,
}

impl EncryptionService {
    /// A service that stores plaintext.
    pub fn disabled() -> Self {
        Self::default()
    }

    /// Server-side encryption with an already-decoded key.
    pub fn with_key(key: StorageKey, key_id: impl Into<String>) -> Self {
        Self {
            method: EncryptionMethod::Server,
            key: Some(key),
            key_id: Some(key_id.into()),
        }
    }

    /// Build the service from configuration, validating the key once.
    pub fn from_config(config: &EncryptionConfig) -> Result<Self, ConfigError> {
        match config.method {
            EncryptionMethod::None => Ok(Self::disabled()),
            EncryptionMethod::Server => {
                let encoded = config.key.as_deref().ok_or(ConfigError::MissingKey)?;
                let key = StorageKey::from_base64(encoded)?;
                Ok(Self::with_key(key, config.key_id.clone()))
            }
        }
    }

    #[inline]
    pub fn is_enabled(&self) -> bool {
        self.method == EncryptionMethod::Server
    }

    #[inline]
    pub fn method(&self) -> EncryptionMethod {
        self.method
    }

    pub fn key_id(&self) -> Option<&str> {
        self.key_id.as_deref()
    }

    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, EncryptionError> {
        match &self.key {
            Some(key) if self.is_enabled() => encrypt_blob(plaintext, key),
            _ => Ok(plaintext.to_vec()),
        }
    }

    pub fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>, DecryptionError> {
        match &self.key {
            Some(key) if self.is_enabled() => decrypt_blob(data, key),
            _ => Ok(data.to_vec()),
        }
    }

    pub fn calculate_encrypted_size(&self, plaintext_len: u64) -> u64 {
        if self.is_enabled() {
            plaintext_len + OVERHEAD as u64
        } else {
            plaintext_len
        }
    }

    pub fn detect_encryption(&self, data: &[u8]) -> EncryptionMethod {
        detect_encryption(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn key() -> StorageKey {
        StorageKey::from_bytes([0x42; 32])
    }

    #[test]
    fn envelope_layout() {
        let blob = encrypt_blob(b"hello world!", &key()).unwrap();
        assert_eq!(blob.len(), 12 + OVERHEAD);
        assert_eq!(blob[0], VERSION_AES_256_GCM);
        assert_eq!(OVERHEAD, 29);
    }

    #[test]
    fn nonces_are_fresh() {
        let a = encrypt_blob(b"same", &key()).unwrap();
        let b = encrypt_blob(b"same", &key()).unwrap();
        assert_ne!(a, b);
        assert_ne!(a[1..HEADER_SIZE], b[1..HEADER_SIZE]);
    }

    #[test]
    fn tampering_is_detected() {
        let mut blob = encrypt_blob(b"attack at dawn", &key()).unwrap();
        blob[HEADER_SIZE + 2] ^= 0x01;
        assert_eq!(decrypt_blob(&blob, &key()), Err(DecryptionError));
    }

    #[test]
    fn wrong_key_fails_generically() {
        let blob = encrypt_blob(b"secret", &key()).unwrap();
        let other = StorageKey::from_bytes([0x24; 32]);
        let err = decrypt_blob(&blob, &other).unwrap_err();
        assert_eq!(err.to_string(), "decryption failed");
    }

    #[test]
    fn short_or_unmarked_buffers_are_plaintext() {
        let short = [VERSION_AES_256_GCM; 28];
        assert_eq!(decrypt_blob(&short, &key()).unwrap(), short.to_vec());

        let unmarked = vec![0x02u8; 64];
        assert_eq!(decrypt_blob(&unmarked, &key()).unwrap(), unmarked);
    }

    #[test]
    fn detect_uses_first_byte() {
        assert_eq!(detect_encryption(&[0x01, 0, 0]), EncryptionMethod::Server);
        assert_eq!(detect_encryption(b"plain"), EncryptionMethod::None);
        assert_eq!(detect_encryption(&[]), EncryptionMethod::None);
    }

    #[test]
    fn disabled_service_is_identity() {
        let svc = EncryptionService::disabled();
        assert!(!svc.is_enabled());
        assert_eq!(svc.key_id(), None);
        assert_eq!(svc.encrypt(b"abc").unwrap(), b"abc");
        let marked = encrypt_blob(b"abc", &key()).unwrap();
        assert_eq!(svc.decrypt(&marked).unwrap(), marked);
        assert_eq!(svc.calculate_encrypted_size(12), 12);
    }

    #[test]
    fn enabled_service_sizes() {
        let svc = EncryptionService::with_key(key(), "1");
        assert_eq!(svc.calculate_encrypted_size(12), 41);
        assert_eq!(svc.key_id(), Some("1"));
        assert_eq!(svc.method().as_str(), "server");
    }

    #[test]
    fn method_parsing() {
        assert_eq!("server".parse::<EncryptionMethod>(), Ok(EncryptionMethod::Server));
        assert_eq!("NONE".parse::<EncryptionMethod>(), Ok(EncryptionMethod::None));
        assert!("client".parse::<EncryptionMethod>().is_err());
    }

    proptest! {
        #[test]
        fn round_trip(plaintext in proptest::collection::vec(any::<u8>(), 0..2048)) {
            let k = key();
            let blob = encrypt_blob(&plaintext, &k).unwrap();
            prop_assert_eq!(blob.len(), plaintext.len() + OVERHEAD);
            prop_assert_eq!(decrypt_blob(&blob, &k).unwrap(), plaintext);
        }

        #[test]
        fn unmarked_buffers_pass_through(
            first in 0x02u8..=0xff,
            rest in proptest::collection::vec(any::<u8>(), 0..256),
        ) {
            let mut buf = vec![first];
            buf.extend(rest);
            prop_assert_eq!(decrypt_blob(&buf, &key()).unwrap(), buf);
        }
    }
}
