//! Recursive delete, move and copy that cannot be redirected by symlinks.
//!
//! Each operation opens its `boundary` once and walks down to the target one
//! component at a time with `O_NOFOLLOW`. From then on every step is relative
//! to a held directory descriptor, so swapping a directory for a symlink
//! mid-operation makes the next lookup fail instead of escaping the tree.

use std::{
    ffi::{OsStr, OsString},
    fs::{File, OpenOptions},
    io,
    os::unix::fs::{OpenOptionsExt, PermissionsExt},
    path::{Component, Path, PathBuf},
    sync::OnceLock,
};

use rustix::io::Errno;
use thiserror::Error;
use tracing::{debug, error, instrument, trace, warn};

use super::sys::{self, DirFd, EntryKind};

/// Errors from the symlink-safe primitives.
#[derive(Debug, Error)]
pub enum SafeFsError {
    /// A symlink was found where a real file or directory was expected.
    ///
    /// **[SECURITY VIOLATION]** Either the tree contains a link or one was
    /// planted while the operation ran. Nothing beyond the link was touched.
    #[error("refusing to follow symlink at {path}")]
    SymlinkAttack { path: PathBuf },

    #[error("{path} is outside of {boundary}")]
    PathOutsideBoundary { path: PathBuf, boundary: PathBuf },

    #[error("no such file or directory: {path}")]
    NotFound { path: PathBuf },

    #[error("destination already exists: {path}")]
    AlreadyExists { path: PathBuf },

    #[error("not a directory: {path}")]
    NotADirectory { path: PathBuf },

    #[error("cannot place {source_path} inside itself at {dest}")]
    IntoItself { source_path: PathBuf, dest: PathBuf },

    /// **[FATAL]** The kernel does not honour `O_NOFOLLOW` on directories.
    #[error("platform cannot guarantee symlink-safe tree operations: {reason}")]
    PlatformUnsupported { reason: String },

    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl SafeFsError {
    pub(crate) fn symlink(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        error!(path = %path.display(), "symlink encountered, aborting filesystem operation");
        SafeFsError::SymlinkAttack { path }
    }

    pub(crate) fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        SafeFsError::Io {
            path: path.into(),
            source,
        }
    }

    /// Classify an error from a lookup of `name` inside `dir`.
    pub(crate) fn from_lookup(dir: &DirFd, name: &OsStr, path: &Path, err: io::Error) -> Self {
        if sys::is_symlink_refusal(&err) {
            return Self::symlink(path);
        }
        match sys::errno(&err) {
            Some(e) if e == Errno::NOENT => SafeFsError::NotFound {
                path: path.to_path_buf(),
            },
            Some(e) if e == Errno::EXIST => SafeFsError::AlreadyExists {
                path: path.to_path_buf(),
            },
            // Linux reports ENOTDIR for O_DIRECTORY|O_NOFOLLOW on a link
            Some(e) if e == Errno::NOTDIR => match dir.stat(name) {
                Ok(st) if st.kind == EntryKind::Symlink => Self::symlink(path),
                _ => SafeFsError::NotADirectory {
                    path: path.to_path_buf(),
                },
            },
            _ => Self::io(path, err),
        }
    }
}

/// Counts from [`safe_rmtree`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RemoveStats {
    pub files_removed: u64,
    pub dirs_removed: u64,
}

/// Counts from [`safe_copy`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CopyStats {
    pub files_copied: u64,
    pub dirs_copied: u64,
    pub bytes_copied: u64,
}

/// Verify once per process that the kernel refuses symlinks under `O_NOFOLLOW`.
pub fn ensure_platform_support() -> Result<(), SafeFsError> {
    static PROBE: OnceLock<Result<(), String>> = OnceLock::new();

    let result = PROBE.get_or_init(|| match sys::probe_nofollow() {
        Ok(true) => {
            debug!("O_NOFOLLOW directory probe passed");
            Ok(())
        }
        Ok(false) => Err("O_NOFOLLOW opened a symlinked directory".to_string()),
        Err(e) => Err(format!("probe failed: {e}")),
    });

    result
        .clone()
        .map_err(|reason| SafeFsError::PlatformUnsupported { reason })
}

fn outside(path: &Path, boundary: &Path) -> SafeFsError {
    SafeFsError::PathOutsideBoundary {
        path: path.to_path_buf(),
        boundary: boundary.to_path_buf(),
    }
}

/// Components of `target` below `boundary`, checked lexically.
fn relative_components(target: &Path, boundary: &Path) -> Result<Vec<OsString>, SafeFsError> {
    let rel = target
        .strip_prefix(boundary)
        .map_err(|_| outside(target, boundary))?;

    let mut out = Vec::new();
    for component in rel.components() {
        match component {
            Component::Normal(name) => out.push(name.to_os_string()),
            Component::CurDir => {}
            _ => return Err(outside(target, boundary)),
        }
    }
    if out.is_empty() {
        // The boundary itself is never a valid target
        return Err(outside(target, boundary));
    }
    Ok(out)
}

/// Walk `names` from `start`, refusing any symlinked component.
pub(crate) fn walk<S: AsRef<OsStr>>(start: DirFd, base: &Path, names: &[S]) -> Result<DirFd, SafeFsError> {
    let mut dir = start;
    let mut path = base.to_path_buf();
    for name in names {
        let name = name.as_ref();
        path.push(name);
        dir = dir
            .open_dir(name)
            .map_err(|e| SafeFsError::from_lookup(&dir, name, &path, e))?;
    }
    Ok(dir)
}

/// Open the directory containing `target` and return it with the final name.
fn resolve_parent(target: &Path, boundary: &Path) -> Result<(DirFd, OsString), SafeFsError> {
    let mut names = relative_components(target, boundary)?;
    let name = names.pop().ok_or_else(|| outside(target, boundary))?;
    let root = DirFd::open_root(boundary).map_err(|e| SafeFsError::io(boundary, e))?;
    let parent = walk(root, boundary, &names)?;
    Ok((parent, name))
}

/// Fail with `SymlinkAttack` if anything under `dir` is a symlink.
fn scan_for_symlinks(dir: &DirFd, path: &Path) -> Result<(), SafeFsError> {
    for name in dir.entries().map_err(|e| SafeFsError::io(path, e))? {
        let child = path.join(&name);
        let st = dir.stat(&name).map_err(|e| SafeFsError::io(&child, e))?;
        match st.kind {
            EntryKind::Symlink => return Err(SafeFsError::symlink(child)),
            EntryKind::Directory => {
                let sub = dir
                    .open_dir(&name)
                    .map_err(|e| SafeFsError::from_lookup(dir, &name, &child, e))?;
                scan_for_symlinks(&sub, &child)?;
            }
            EntryKind::File | EntryKind::Other => {}
        }
    }
    Ok(())
}

fn remove_contents(dir: &DirFd, path: &Path, stats: &mut RemoveStats) -> Result<(), SafeFsError> {
    for name in dir.entries().map_err(|e| SafeFsError::io(path, e))? {
        let child = path.join(&name);
        let st = match dir.stat(&name) {
            Ok(st) => st,
            Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
            Err(e) => return Err(SafeFsError::io(&child, e)),
        };
        match st.kind {
            EntryKind::Symlink => return Err(SafeFsError::symlink(child)),
            EntryKind::Directory => {
                let sub = dir
                    .open_dir(&name)
                    .map_err(|e| SafeFsError::from_lookup(dir, &name, &child, e))?;
                remove_contents(&sub, &child, stats)?;
                dir.remove_dir(&name)
                    .map_err(|e| SafeFsError::from_lookup(dir, &name, &child, e))?;
                stats.dirs_removed += 1;
            }
            EntryKind::File | EntryKind::Other => {
                dir.unlink(&name)
                    .map_err(|e| SafeFsError::from_lookup(dir, &name, &child, e))?;
                stats.files_removed += 1;
                trace!(path = %child.display(), "removed file");
            }
        }
    }
    Ok(())
}

/// Recursively delete the directory `target`, which must lie under `boundary`.
///
/// A missing target is a no-op. The tree is scanned for symlinks before the
/// first unlink, and every entry is re-checked during removal, so a link
/// planted mid-walk aborts the operation without following it.
#[instrument(level = "debug", skip_all, fields(target = %target.display()))]
pub fn safe_rmtree(target: &Path, boundary: &Path) -> Result<RemoveStats, SafeFsError> {
    ensure_platform_support()?;

    let (parent, name) = match resolve_parent(target, boundary) {
        Ok(resolved) => resolved,
        Err(SafeFsError::NotFound { .. }) => return Ok(RemoveStats::default()),
        Err(e) => return Err(e),
    };

    let st = match parent.stat(&name) {
        Ok(st) => st,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(RemoveStats::default()),
        Err(e) => return Err(SafeFsError::io(target, e)),
    };
    match st.kind {
        EntryKind::Symlink => return Err(SafeFsError::symlink(target)),
        EntryKind::Directory => {}
        EntryKind::File | EntryKind::Other => {
            return Err(SafeFsError::NotADirectory {
                path: target.to_path_buf(),
            });
        }
    }

    let dir = parent
        .open_dir(&name)
        .map_err(|e| SafeFsError::from_lookup(&parent, &name, target, e))?;
    scan_for_symlinks(&dir, target)?;

    let mut stats = RemoveStats::default();
    remove_contents(&dir, target, &mut stats)?;
    parent
        .remove_dir(&name)
        .map_err(|e| SafeFsError::from_lookup(&parent, &name, target, e))?;
    stats.dirs_removed += 1;

    debug!(
        files = stats.files_removed,
        dirs = stats.dirs_removed,
        "removed tree"
    );
    Ok(stats)
}

fn check_absent(dir: &DirFd, name: &OsStr, path: &Path) -> Result<(), SafeFsError> {
    match dir.stat(name) {
        Ok(_) => Err(SafeFsError::AlreadyExists {
            path: path.to_path_buf(),
        }),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(SafeFsError::io(path, e)),
    }
}

fn stat_source(dir: &DirFd, name: &OsStr, path: &Path) -> Result<EntryKind, SafeFsError> {
    let st = dir
        .stat(name)
        .map_err(|e| SafeFsError::from_lookup(dir, name, path, e))?;
    if st.kind == EntryKind::Symlink {
        return Err(SafeFsError::symlink(path));
    }
    Ok(st.kind)
}

fn check_not_into_itself(source: &Path, dest: &Path) -> Result<(), SafeFsError> {
    if dest.starts_with(source) {
        return Err(SafeFsError::IntoItself {
            source_path: source.to_path_buf(),
            dest: dest.to_path_buf(),
        });
    }
    Ok(())
}

/// Rename `source` to `dest` with a single rename between pinned parents.
///
/// `dest` is the full new path, not its directory, and must not exist. Where
/// the kernel supports `RENAME_NOREPLACE` the existence check is part of the
/// rename itself; elsewhere it is a separate `fstatat` just before it.
#[instrument(level = "debug", skip_all, fields(source = %source.display(), dest = %dest.display()))]
pub fn safe_move(source: &Path, dest: &Path, boundary: &Path) -> Result<(), SafeFsError> {
    ensure_platform_support()?;
    check_not_into_itself(source, dest)?;

    let (src_parent, src_name) = resolve_parent(source, boundary)?;
    let (dst_parent, dst_name) = resolve_parent(dest, boundary)?;

    stat_source(&src_parent, &src_name, source)?;

    match src_parent.rename_noreplace(&src_name, &dst_parent, &dst_name) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::Unsupported => {
            trace!("RENAME_NOREPLACE unavailable, checking destination first");
            check_absent(&dst_parent, &dst_name, dest)?;
            src_parent
                .rename(&src_name, &dst_parent, &dst_name)
                .map_err(|e| SafeFsError::from_lookup(&src_parent, &src_name, source, e))?;
        }
        Err(e) if sys::errno(&e) == Some(Errno::EXIST) => {
            return Err(SafeFsError::AlreadyExists {
                path: dest.to_path_buf(),
            });
        }
        Err(e) => return Err(SafeFsError::from_lookup(&src_parent, &src_name, source, e)),
    }
    debug!("moved");
    Ok(())
}

fn copy_file(
    src_dir: &DirFd,
    src_name: &OsStr,
    src_path: &Path,
    dst_dir: &DirFd,
    dst_name: &OsStr,
    dst_path: &Path,
    stats: &mut CopyStats,
) -> Result<(), SafeFsError> {
    let mut src = src_dir
        .open_read(src_name)
        .map_err(|e| SafeFsError::from_lookup(src_dir, src_name, src_path, e))?;
    let meta = src.metadata().map_err(|e| SafeFsError::io(src_path, e))?;
    let mode = meta.permissions().mode() & 0o777;

    let mut dst = dst_dir
        .create_new(dst_name, mode)
        .map_err(|e| SafeFsError::from_lookup(dst_dir, dst_name, dst_path, e))?;
    let written = io::copy(&mut src, &mut dst).and_then(|bytes| {
        if let Ok(modified) = meta.modified() {
            dst.set_modified(modified)?;
        }
        Ok(bytes)
    });
    let bytes = match written {
        Ok(bytes) => bytes,
        Err(e) => {
            // The file was created above, so it is ours to remove
            if let Err(cleanup) = dst_dir.unlink(dst_name) {
                warn!(path = %dst_path.display(), error = %cleanup, "could not remove partial copy");
            }
            return Err(SafeFsError::io(dst_path, e));
        }
    };

    stats.files_copied += 1;
    stats.bytes_copied += bytes;
    Ok(())
}

fn copy_tree(
    src: &DirFd,
    src_path: &Path,
    dst: &DirFd,
    dst_path: &Path,
    stats: &mut CopyStats,
) -> Result<(), SafeFsError> {
    for name in src.entries().map_err(|e| SafeFsError::io(src_path, e))? {
        let src_child = src_path.join(&name);
        let dst_child = dst_path.join(&name);
        match stat_source(src, &name, &src_child)? {
            EntryKind::Directory => {
                let sub_src = src
                    .open_dir(&name)
                    .map_err(|e| SafeFsError::from_lookup(src, &name, &src_child, e))?;
                dst.mkdir(&name, 0o755)
                    .map_err(|e| SafeFsError::from_lookup(dst, &name, &dst_child, e))?;
                let sub_dst = dst
                    .open_dir(&name)
                    .map_err(|e| SafeFsError::from_lookup(dst, &name, &dst_child, e))?;
                stats.dirs_copied += 1;
                copy_tree(&sub_src, &src_child, &sub_dst, &dst_child, stats)?;
            }
            EntryKind::File => copy_file(src, &name, &src_child, dst, &name, &dst_child, stats)?,
            EntryKind::Symlink | EntryKind::Other => {
                return Err(SafeFsError::io(
                    &src_child,
                    io::Error::new(io::ErrorKind::Unsupported, "unsupported file type"),
                ));
            }
        }
    }
    Ok(())
}

/// Remove a destination tree that a failed copy left half populated.
///
/// Only the directory this copy created is touched, through its held
/// descriptor. A symlink planted inside it stops the cleanup, which is then
/// logged rather than retried.
fn discard_partial_tree(parent: &DirFd, name: &OsStr, dir: &DirFd, path: &Path) {
    let mut stats = RemoveStats::default();
    let result = remove_contents(dir, path, &mut stats).and_then(|()| {
        parent
            .remove_dir(name)
            .map_err(|e| SafeFsError::from_lookup(parent, name, path, e))
    });
    match result {
        Ok(()) => debug!(path = %path.display(), files = stats.files_removed, "removed partial copy"),
        Err(e) => warn!(path = %path.display(), error = %e, "could not remove partial copy"),
    }
}

/// Copy `source` to the new path `dest`, recursing into directories.
///
/// Every source entry is opened with `O_NOFOLLOW`. Directory sources are
/// scanned for symlinks before the destination is created, and a copy that
/// fails partway removes what it had created.
#[instrument(level = "debug", skip_all, fields(source = %source.display(), dest = %dest.display()))]
pub fn safe_copy(source: &Path, dest: &Path, boundary: &Path) -> Result<CopyStats, SafeFsError> {
    ensure_platform_support()?;
    check_not_into_itself(source, dest)?;

    let (src_parent, src_name) = resolve_parent(source, boundary)?;
    let (dst_parent, dst_name) = resolve_parent(dest, boundary)?;

    let kind = stat_source(&src_parent, &src_name, source)?;
    check_absent(&dst_parent, &dst_name, dest)?;

    let mut stats = CopyStats::default();
    match kind {
        EntryKind::File => copy_file(
            &src_parent,
            &src_name,
            source,
            &dst_parent,
            &dst_name,
            dest,
            &mut stats,
        )?,
        EntryKind::Directory => {
            let src_dir = src_parent
                .open_dir(&src_name)
                .map_err(|e| SafeFsError::from_lookup(&src_parent, &src_name, source, e))?;
            scan_for_symlinks(&src_dir, source)?;

            dst_parent
                .mkdir(&dst_name, 0o755)
                .map_err(|e| SafeFsError::from_lookup(&dst_parent, &dst_name, dest, e))?;
            let dst_dir = dst_parent
                .open_dir(&dst_name)
                .map_err(|e| SafeFsError::from_lookup(&dst_parent, &dst_name, dest, e))?;
            stats.dirs_copied += 1;
            if let Err(e) = copy_tree(&src_dir, source, &dst_dir, dest, &mut stats) {
                discard_partial_tree(&dst_parent, &dst_name, &dst_dir, dest);
                return Err(e);
            }
        }
        EntryKind::Symlink | EntryKind::Other => {
            return Err(SafeFsError::io(
                source,
                io::Error::new(io::ErrorKind::Unsupported, "unsupported file type"),
            ));
        }
    }

    debug!(
        files = stats.files_copied,
        dirs = stats.dirs_copied,
        bytes = stats.bytes_copied,
        "copied"
    );
    Ok(stats)
}

/// Open `path` with `options`, failing in the `open` call itself if the final
/// component is a symlink.
pub fn safe_open_nofollow(path: &Path, options: &OpenOptions) -> Result<File, SafeFsError> {
    let mut options = options.clone();
    options.custom_flags(sys::nofollow_open_flags());
    options.open(path).map_err(|e| {
        if sys::is_symlink_refusal(&e) {
            SafeFsError::symlink(path)
        } else if e.kind() == io::ErrorKind::NotFound {
            SafeFsError::NotFound {
                path: path.to_path_buf(),
            }
        } else {
            SafeFsError::io(path, e)
        }
    })
}
