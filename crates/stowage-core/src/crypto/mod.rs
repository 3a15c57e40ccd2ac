//! Envelope encryption for stored file contents.

pub mod codec;
pub mod keys;

pub use codec::{
    DecryptionError, EncryptionError, EncryptionMethod, EncryptionService, OVERHEAD,
    decrypt_blob, detect_encryption, encrypt_blob, is_encrypted,
};
pub use keys::{KeyError, StorageKey};
