//! Normalized, root-relative paths.
//!
//! Every path that reaches the storage layer goes through [`normalize`] first.
//! The resulting [`VirtualPath`] is slash-separated, has no leading, trailing
//! or repeated slashes, and never contains a `.` or `..` segment or a control
//! byte.
//! The empty path names the storage root.

use std::fmt;

use serde::{Serialize, Serializer};
use thiserror::Error;

/// Why a path or filename was rejected.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PathError {
    /// The path contains a `..` segment.
    #[error("invalid path {path:?}: parent directory references are not allowed")]
    Traversal { path: String },

    /// The path contains a NUL byte or another C0 control character.
    #[error("invalid path {path:?}: control character 0x{byte:02x} is not allowed")]
    ControlCharacter { path: String, byte: u8 },

    /// A filename was empty.
    #[error("invalid filename: name is empty")]
    EmptyName,

    /// A filename contained a path separator.
    #[error("invalid filename {name:?}: path separators are not allowed")]
    Separator { name: String },

    /// A filename was `.` or `..`.
    #[error("invalid filename {name:?}: reserved name")]
    Reserved { name: String },
}

fn first_control_byte(s: &str) -> Option<u8> {
    s.bytes().find(|b| *b < 0x20)
}

/// Normalize a caller-supplied relative path.
///
/// Leading and trailing slashes are stripped, repeated slashes collapse to
/// one and `.` segments are dropped. Empty or all-slash input yields the root
/// path.
///
/// # Examples
///
/// ```
/// use stowage_core::path::normalize;
///
/// assert_eq!(normalize("//docs///a.txt/").unwrap().as_str(), "docs/a.txt");
/// assert!(normalize("///").unwrap().is_root());
/// assert_eq!(normalize("./docs/.").unwrap().as_str(), "docs");
/// assert!(normalize("docs/../../etc/passwd").is_err());
/// ```
pub fn normalize(raw: &str) -> Result<VirtualPath, PathError> {
    if let Some(byte) = first_control_byte(raw) {
        return Err(PathError::ControlCharacter {
            path: raw.escape_debug().to_string(),
            byte,
        });
    }

    let mut segments = Vec::new();
    for segment in raw.split('/').filter(|s| !s.is_empty() && *s != ".") {
        if segment == ".." {
            return Err(PathError::Traversal {
                path: raw.to_string(),
            });
        }
        segments.push(segment);
    }

    Ok(VirtualPath(segments.join("/")))
}

/// Validate a single path component supplied by a caller (e.g. a rename
/// target or an explicit copy name).
pub fn validate_filename(name: &str) -> Result<&str, PathError> {
    if name.is_empty() {
        return Err(PathError::EmptyName);
    }
    if name.contains('/') || name.contains('\\') {
        return Err(PathError::Separator {
            name: name.to_string(),
        });
    }
    if name == "." || name == ".." {
        return Err(PathError::Reserved {
            name: name.to_string(),
        });
    }
    if let Some(byte) = first_control_byte(name) {
        return Err(PathError::ControlCharacter {
            path: name.escape_debug().to_string(),
            byte,
        });
    }
    Ok(name)
}

/// A normalized path relative to a storage root.
///
/// Only [`normalize`] and [`VirtualPath::join`] construct values, so every
/// instance upholds the normalization invariants.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct VirtualPath(String);

impl VirtualPath {
    /// The storage root.
    #[inline]
    pub fn root() -> Self {
        VirtualPath(String::new())
    }

    #[inline]
    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    #[inline]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Append a validated filename.
    pub fn join(&self, name: &str) -> Result<Self, PathError> {
        let name = validate_filename(name)?;
        if self.is_root() {
            Ok(VirtualPath(name.to_string()))
        } else {
            Ok(VirtualPath(format!("{}/{name}", self.0)))
        }
    }

    /// The containing directory, or `None` for the root.
    pub fn parent(&self) -> Option<VirtualPath> {
        self.split().map(|(parent, _)| parent)
    }

    /// The final component, or `None` for the root.
    pub fn file_name(&self) -> Option<&str> {
        self.split().map(|(_, name)| name)
    }

    pub fn components(&self) -> impl Iterator<Item = &str> {
        self.0.split('/').filter(|s| !s.is_empty())
    }

    /// Split into `(parent, file_name)`; `None` for the root.
    pub fn split(&self) -> Option<(VirtualPath, &str)> {
        if self.is_root() {
            return None;
        }
        match self.0.rsplit_once('/') {
            Some((parent, name)) => Some((VirtualPath(parent.to_string()), name)),
            None => Some((VirtualPath::root(), self.0.as_str())),
        }
    }

    /// Parent path as stored on index records: `""` for top-level entries.
    pub fn parent_path(&self) -> String {
        self.parent().map(|p| p.0).unwrap_or_default()
    }

    /// Whether `self` is `ancestor` or lies beneath it.
    pub fn starts_with(&self, ancestor: &VirtualPath) -> bool {
        if ancestor.is_root() {
            return true;
        }
        self.0 == ancestor.0
            || (self.0.starts_with(&ancestor.0) && self.0.as_bytes().get(ancestor.0.len()) == Some(&b'/'))
    }

    /// Re-root `self` from `from` onto `to`.
    ///
    /// Returns `None` when `self` is not under `from`.
    pub fn rebase(&self, from: &VirtualPath, to: &VirtualPath) -> Option<VirtualPath> {
        if !self.starts_with(from) {
            return None;
        }
        let rest = self.0[from.0.len()..].trim_start_matches('/');
        Some(match (to.is_root(), rest.is_empty()) {
            (_, true) => to.clone(),
            (true, false) => VirtualPath(rest.to_string()),
            (false, false) => VirtualPath(format!("{}/{rest}", to.0)),
        })
    }
}

impl AsRef<str> for VirtualPath {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for VirtualPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_root() {
            write!(f, "/")
        } else {
            write!(f, "{}", self.0)
        }
    }
}

impl Serialize for VirtualPath {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

impl TryFrom<&str> for VirtualPath {
    type Error = PathError;

    fn try_from(raw: &str) -> Result<Self, Self::Error> {
        normalize(raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn strips_and_collapses_slashes() {
        assert_eq!(normalize("/a//b///c/").unwrap().as_str(), "a/b/c");
    }

    #[test]
    fn current_dir_segments_are_dropped() {
        assert_eq!(normalize("a/./b").unwrap().as_str(), "a/b");
        assert_eq!(normalize("./a/./b/.").unwrap().as_str(), "a/b");
        assert_eq!(normalize("a/."), normalize("a"));
        assert!(normalize(".").unwrap().is_root());
        assert!(normalize("/././/").unwrap().is_root());
        assert_eq!(normalize(".hidden/..x").unwrap().as_str(), ".hidden/..x");
    }

    #[test]
    fn empty_and_slashes_are_root() {
        assert!(normalize("").unwrap().is_root());
        assert!(normalize("////").unwrap().is_root());
    }

    #[test]
    fn rejects_traversal_anywhere() {
        for raw in ["..", "../x", "a/..", "a/../b", "/a/b/../../.."] {
            assert!(
                matches!(normalize(raw), Err(PathError::Traversal { .. })),
                "{raw} should be rejected"
            );
        }
        // Dots inside a name are fine
        assert_eq!(normalize("a..b/..c").unwrap().as_str(), "a..b/..c");
    }

    #[test]
    fn rejects_control_bytes() {
        assert!(matches!(
            normalize("a\0b"),
            Err(PathError::ControlCharacter { byte: 0, .. })
        ));
        assert!(matches!(
            normalize("a\nb"),
            Err(PathError::ControlCharacter { byte: 0x0a, .. })
        ));
        assert!(normalize("tab\there").is_err());
    }

    #[test]
    fn filename_rules() {
        assert_eq!(validate_filename("report.txt"), Ok("report.txt"));
        assert_eq!(validate_filename(""), Err(PathError::EmptyName));
        assert!(matches!(validate_filename("a/b"), Err(PathError::Separator { .. })));
        assert!(matches!(validate_filename("a\\b"), Err(PathError::Separator { .. })));
        assert!(matches!(validate_filename("."), Err(PathError::Reserved { .. })));
        assert!(matches!(validate_filename(".."), Err(PathError::Reserved { .. })));
        assert!(validate_filename("bell\x07").is_err());
    }

    #[test]
    fn split_and_parent() {
        let p = normalize("docs/2024/report.txt").unwrap();
        assert_eq!(p.file_name(), Some("report.txt"));
        assert_eq!(p.parent_path(), "docs/2024");
        assert_eq!(normalize("top.txt").unwrap().parent_path(), "");
        assert_eq!(VirtualPath::root().split(), None);
    }

    #[test]
    fn prefix_checks_respect_segment_boundaries() {
        let docs = normalize("docs").unwrap();
        assert!(normalize("docs/a").unwrap().starts_with(&docs));
        assert!(docs.starts_with(&docs));
        assert!(!normalize("docs2/a").unwrap().starts_with(&docs));
        assert!(docs.starts_with(&VirtualPath::root()));
    }

    #[test]
    fn rebase_moves_descendants() {
        let from = normalize("a/b").unwrap();
        let to = normalize("c").unwrap();
        assert_eq!(
            normalize("a/b/x/y").unwrap().rebase(&from, &to),
            Some(normalize("c/x/y").unwrap())
        );
        assert_eq!(from.rebase(&from, &to), Some(to.clone()));
        assert_eq!(normalize("a/bb").unwrap().rebase(&from, &to), None);
    }

    proptest! {
        #[test]
        fn normalize_is_idempotent(raw in "[a-z./]{0,40}") {
            if let Ok(once) = normalize(&raw) {
                let twice = normalize(once.as_str()).unwrap();
                prop_assert_eq!(once, twice);
            }
        }

        #[test]
        fn parent_segments_always_fail(
            prefix in "[a-z]{1,5}(/[a-z]{1,5}){0,3}",
            suffix in "(/[a-z]{1,5}){0,3}",
        ) {
            let raw = format!("{prefix}/..{suffix}");
            prop_assert!(normalize(&raw).is_err());
        }
    }
}
