#![forbid(unsafe_code)]

use std::fmt;

use base64::{
    Engine as _, alphabet,
    engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig},
};
use rand::RngCore;
use secrecy::{ExposeSecret, SecretBox};
use thiserror::Error;
use zeroize::Zeroizing;

/// Size of a storage key in bytes (AES-256).
pub const KEY_SIZE: usize = 32;

/// URL-safe base64 that accepts keys with or without `=` padding and emits
/// padded output.
const KEY_ENCODING: GeneralPurpose = GeneralPurpose::new(
    &alphabet::URL_SAFE,
    GeneralPurposeConfig::new()
        .with_encode_padding(true)
        .with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

/// Reasons a configured key could not be loaded.
///
/// **[CONFIGURATION ERROR]** All variants are fatal at startup.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum KeyError {
    #[error("encryption key is not valid base64url")]
    InvalidEncoding,

    #[error("encryption key must decode to {KEY_SIZE} bytes, got {actual}")]
    InvalidLength { actual: usize },
}

/// A 256-bit symmetric key for file-content encryption.
///
/// The key bytes live in a [`SecretBox`] and are zeroized on drop. Callers
/// only ever see them inside [`StorageKey::with_bytes`].
pub struct StorageKey {
    bytes: SecretBox<[u8; KEY_SIZE]>,
}

impl StorageKey {
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self {
            bytes: SecretBox::new(Box::new(bytes)),
        }
    }

    /// Decode a base64url key as found in configuration.
    pub fn from_base64(encoded: &str) -> Result<Self, KeyError> {
        let decoded = Zeroizing::new(
            KEY_ENCODING
                .decode(encoded.trim())
                .map_err(|_| KeyError::InvalidEncoding)?,
        );
        let bytes: [u8; KEY_SIZE] = decoded
            .as_slice()
            .try_into()
            .map_err(|_| KeyError::InvalidLength {
                actual: decoded.len(),
            })?;
        Ok(Self::from_bytes(bytes))
    }

    /// Generate a fresh key from the thread-local CSPRNG.
    pub fn generate() -> Self {
        let mut bytes = [0u8; KEY_SIZE];
        rand::rng().fill_bytes(&mut bytes);
        Self::from_bytes(bytes)
    }

    /// Run `f` with the raw key bytes.
    pub fn with_bytes<R>(&self, f: impl FnOnce(&[u8; KEY_SIZE]) -> R) -> R {
        f(self.bytes.expose_secret())
    }

    /// Padded base64url encoding, as accepted by [`StorageKey::from_base64`].
    pub fn to_base64(&self) -> Zeroizing<String> {
        Zeroizing::new(self.with_bytes(|b| KEY_ENCODING.encode(b)))
    }
}

impl Clone for StorageKey {
    fn clone(&self) -> Self {
        self.with_bytes(|b| Self::from_bytes(*b))
    }
}

impl fmt::Debug for StorageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("StorageKey([REDACTED])")
    }
}
