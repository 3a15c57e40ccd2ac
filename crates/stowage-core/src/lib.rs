//! Symlink-safe file storage with a reconcilable metadata index.
//!
//! The crate is layered bottom-up:
//!
//! - [`path`] turns untrusted input into normalized [`path::VirtualPath`]s.
//! - [`crypto`] seals file contents in a versioned AES-256-GCM envelope.
//! - [`fs`] provides `rmtree`, move, copy and open that never follow symlinks.
//! - [`storage`] exposes a per-owner [`storage::StorageBackend`] on top of those.
//! - [`index`] mirrors storage in SQLite; [`sync`] reconciles the two.
//! - [`bulk`] and [`migrate`] are the batch services built on storage and index.
#![deny(unsafe_code)]

#[cfg(not(unix))]
compile_error!("stowage-core requires a Unix platform with openat(2) and O_NOFOLLOW");

pub mod bulk;
pub mod config;
pub mod crypto;
pub mod effects;
pub mod error;
pub mod fs;
pub mod index;
pub mod migrate;
pub mod owner;
pub mod path;
pub mod storage;
pub mod sync;

pub use config::StowageConfig;
pub use owner::{Owner, OwnerKind};
pub use path::{VirtualPath, normalize};
pub use storage::{FileMeta, LocalStorage, StorageBackend, StorageLayout};
