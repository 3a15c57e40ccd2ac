//! Process exit codes.
//!
//! Scripts and schedulers key off these, so the values are stable.

/// Command completed.
pub const SUCCESS: u8 = 0;

/// Any failure without a more specific code.
pub const GENERAL_ERROR: u8 = 1;

/// Bad arguments or configuration (clap uses the same code for parse errors).
pub const USAGE_ERROR: u8 = 2;

/// An owner, path or file does not exist.
pub const NOT_FOUND: u8 = 3;

/// A destructive mode was requested without `--force`.
pub const FORCE_REQUIRED: u8 = 4;

/// A symlink or an escaping path was refused.
pub const SECURITY_VIOLATION: u8 = 5;
