//! Filesystem primitives that never follow symlinks.

pub mod safe;
pub(crate) mod sys;

pub use safe::{
    CopyStats, RemoveStats, SafeFsError, ensure_platform_support, safe_copy, safe_move,
    safe_open_nofollow, safe_rmtree,
};
