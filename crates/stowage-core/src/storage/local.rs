use std::{
    ffi::OsStr,
    fs::{self, File},
    io::{self, Read, Write},
    path::{Path, PathBuf},
    sync::Arc,
};

use chrono::{DateTime, Utc};
use globset::{Glob, GlobMatcher};
use rustix::io::Errno;
use tracing::{debug, instrument, trace, warn};
use uuid::Uuid;

use super::{FileMeta, FileReader, Listing, StorageBackend, StorageContext, StorageError};
use crate::{
    crypto::{EncryptionMethod, EncryptionService, OVERHEAD, codec::VERSION_AES_256_GCM},
    fs::{
        RemoveStats, SafeFsError, ensure_platform_support, safe_copy, safe_move, safe_rmtree,
        safe::walk,
        sys::{self, DirFd, EntryKind, EntryStat},
    },
    path::{VirtualPath, normalize, validate_filename},
};

/// Infix used for in-flight writes; such entries are never listed.
const TEMP_MARKER: &str = ".stowage-tmp-";

fn is_temp_name(name: &str) -> bool {
    name.starts_with('.') && name.contains(TEMP_MARKER)
}

fn guess_content_type(name: &str) -> Option<String> {
    mime_guess::from_path(name).first_raw().map(str::to_owned)
}

/// `report.txt` -> `report (copy).txt`, `report (copy 2).txt`, ...
fn copy_candidate(name: &str, is_directory: bool, counter: u32) -> String {
    let path = Path::new(name);
    let split = if is_directory {
        None
    } else {
        path.file_stem()
            .and_then(OsStr::to_str)
            .zip(path.extension().and_then(OsStr::to_str))
    };
    let (stem, ext) = match split {
        Some((stem, ext)) => (stem, format!(".{ext}")),
        None => (name, String::new()),
    };
    if counter == 1 {
        format!("{stem} (copy){ext}")
    } else {
        format!("{stem} (copy {counter}){ext}")
    }
}

/// A [`StorageBackend`] over one directory on the local filesystem.
///
/// Every operation opens the root and descends with `O_NOFOLLOW`, so a
/// symlink anywhere below the root fails with [`StorageError::SymlinkAttack`].
#[derive(Debug, Clone)]
pub struct LocalStorage {
    root: PathBuf,
    encryption: Arc<EncryptionService>,
}

impl LocalStorage {
    /// Open (creating if needed) a storage root.
    ///
    /// Fails with [`StorageError::PlatformUnsupported`] when the host cannot
    /// guarantee symlink-safe operations.
    pub fn new(root: impl Into<PathBuf>, encryption: Arc<EncryptionService>) -> Result<Self, StorageError> {
        ensure_platform_support().map_err(|e| StorageError::from_safe(e, StorageContext::new()))?;

        let root = root.into();
        let ctx = || StorageContext::new().with_root(&root);
        fs::create_dir_all(&root).map_err(|e| StorageError::io(e, ctx()))?;
        let root = fs::canonicalize(&root).map_err(|e| StorageError::io(e, ctx()))?;

        debug!(root = %root.display(), encrypted = encryption.is_enabled(), "opened local storage");
        Ok(Self { root, encryption })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn encryption(&self) -> &EncryptionService {
        &self.encryption
    }

    fn ctx(&self, operation: &'static str, path: &VirtualPath) -> StorageContext {
        StorageContext::new()
            .with_operation(operation)
            .with_path(path.as_str())
    }

    fn absolute(&self, path: &VirtualPath) -> PathBuf {
        self.root.join(path.as_str())
    }

    fn open_root(&self, ctx: &StorageContext) -> Result<DirFd, StorageError> {
        DirFd::open_root(&self.root).map_err(|e| StorageError::io(e, ctx.clone()))
    }

    /// Open the directory at `path` without following any symlink.
    fn open_dir(&self, path: &VirtualPath, ctx: &StorageContext) -> Result<DirFd, StorageError> {
        let names: Vec<&str> = path.components().collect();
        walk(self.open_root(ctx)?, &self.root, &names)
            .map_err(|e| StorageError::from_safe(e, ctx.clone()))
    }

    /// Open the parent of `path` and return it with the final name.
    fn locate<'p>(
        &self,
        path: &'p VirtualPath,
        operation: &'static str,
    ) -> Result<(DirFd, &'p str), StorageError> {
        let (parent, name) = path.split().ok_or(StorageError::RootPath { operation })?;
        let dir = self.open_dir(&parent, &self.ctx(operation, path))?;
        Ok((dir, name))
    }

    /// `lstat` a child, mapping absence to `NotFound` and links to `SymlinkAttack`.
    fn stat_entry(&self, dir: &DirFd, name: &str, ctx: &StorageContext) -> Result<EntryStat, StorageError> {
        let st = dir.stat(OsStr::new(name)).map_err(|e| {
            if e.kind() == io::ErrorKind::NotFound {
                StorageError::NotFound { context: ctx.clone() }
            } else {
                StorageError::io(e, ctx.clone())
            }
        })?;
        if st.kind == EntryKind::Symlink {
            warn!(context = %ctx, "symlink found inside storage root");
            return Err(StorageError::SymlinkAttack { context: ctx.clone() });
        }
        Ok(st)
    }

    fn meta_for(&self, dir: &DirFd, name: &str, path: VirtualPath) -> Result<FileMeta, StorageError> {
        let ctx = self.ctx("stat", &path);
        let st = self.stat_entry(dir, name, &ctx)?;
        let modified_at = DateTime::<Utc>::from(st.modified);

        if st.kind == EntryKind::Directory {
            return Ok(FileMeta {
                path,
                name: name.to_string(),
                size: 0,
                is_directory: true,
                modified_at,
                content_type: None,
                encryption_method: EncryptionMethod::None,
                encryption_key_id: None,
                encrypted_size: None,
            });
        }

        // With encryption off, `open` returns the raw bytes, so a leading
        // version byte is just content.
        let encrypted = self.encryption.is_enabled() && {
            // Only the version byte is read; contents stay on disk
            let mut first = [0u8; 1];
            let read = dir
                .open_read(OsStr::new(name))
                .and_then(|mut f| f.read(&mut first))
                .map_err(|e| StorageError::from_safe(SafeFsError::from_lookup(dir, OsStr::new(name), &self.absolute(&path), e), ctx.clone()))?;
            read == 1 && first[0] == VERSION_AES_256_GCM && st.size >= OVERHEAD as u64
        };

        let (size, method, key_id, encrypted_size) = if encrypted {
            (
                st.size - OVERHEAD as u64,
                EncryptionMethod::Server,
                self.encryption.key_id().map(str::to_owned),
                Some(st.size),
            )
        } else {
            (st.size, EncryptionMethod::None, None, None)
        };

        Ok(FileMeta {
            content_type: guess_content_type(name),
            name: name.to_string(),
            path,
            size,
            is_directory: false,
            modified_at,
            encryption_method: method,
            encryption_key_id: key_id,
            encrypted_size,
        })
    }

    fn root_meta(&self) -> Result<FileMeta, StorageError> {
        let ctx = StorageContext::new().with_path("").with_operation("stat");
        let st = self
            .open_root(&ctx)?
            .stat_self()
            .map_err(|e| StorageError::io(e, ctx))?;
        Ok(FileMeta {
            path: VirtualPath::root(),
            name: String::new(),
            size: 0,
            is_directory: true,
            modified_at: DateTime::<Utc>::from(st.modified),
            content_type: None,
            encryption_method: EncryptionMethod::None,
            encryption_key_id: None,
            encrypted_size: None,
        })
    }

    fn info_at(&self, path: &VirtualPath) -> Result<FileMeta, StorageError> {
        match self.locate(path, "info") {
            Ok((dir, name)) => self.meta_for(&dir, name, path.clone()),
            Err(StorageError::RootPath { .. }) => self.root_meta(),
            Err(e) => Err(e),
        }
    }

    /// Open `path` and check it is a directory, for move/copy destinations.
    fn require_dir(&self, path: &VirtualPath, operation: &'static str) -> Result<DirFd, StorageError> {
        self.open_dir(path, &self.ctx(operation, path))
    }

    fn entry_exists(dir: &DirFd, name: &str) -> bool {
        dir.stat(OsStr::new(name)).is_ok()
    }

    fn write_atomic(&self, dir: &DirFd, name: &str, payload: &[u8], ctx: &StorageContext) -> Result<File, StorageError> {
        let tmp = format!(".{name}{TEMP_MARKER}{}", Uuid::new_v4().simple());
        let tmp = OsStr::new(&tmp);

        let mut file = dir
            .create_new(tmp, 0o644)
            .map_err(|e| StorageError::io(e, ctx.clone()))?;
        let result = file
            .write_all(payload)
            .and_then(|()| file.sync_data())
            .and_then(|()| dir.rename(tmp, dir, OsStr::new(name)));
        if let Err(e) = result {
            if let Err(cleanup) = dir.unlink(tmp) {
                warn!(error = %cleanup, "failed to remove temporary file");
            }
            return Err(StorageError::io(e, ctx.clone()));
        }
        Ok(file)
    }
}

impl StorageBackend for LocalStorage {
    #[instrument(level = "debug", skip(self, content), fields(len = content.len()))]
    fn save(&self, path: &str, content: &[u8]) -> Result<FileMeta, StorageError> {
        let path = normalize(path)?;
        let ctx = self.ctx("save", &path);
        let Some((parent, name)) = path.split() else {
            return Err(StorageError::IsADirectory { context: ctx });
        };

        let dir = self.open_dir(&parent, &ctx).map_err(|e| match e {
            StorageError::NotFound { context } => StorageError::ParentNotFound { context },
            other => other,
        })?;
        match self.stat_entry(&dir, name, &ctx) {
            Ok(st) if st.kind == EntryKind::Directory => {
                return Err(StorageError::IsADirectory { context: ctx });
            }
            Ok(_) | Err(StorageError::NotFound { .. }) => {}
            Err(e) => return Err(e),
        }

        let payload = self.encryption.encrypt(content)?;
        let file = self.write_atomic(&dir, name, &payload, &ctx)?;
        let modified_at = file
            .metadata()
            .and_then(|m| m.modified())
            .map_or_else(|_| Utc::now(), DateTime::<Utc>::from);

        debug!(path = %path, size = content.len(), stored = payload.len(), "saved file");
        Ok(FileMeta {
            name: name.to_string(),
            content_type: guess_content_type(name),
            path: path.clone(),
            size: content.len() as u64,
            is_directory: false,
            modified_at,
            encryption_method: self.encryption.method(),
            encryption_key_id: self.encryption.key_id().map(str::to_owned),
            encrypted_size: self.encryption.is_enabled().then_some(payload.len() as u64),
        })
    }

    #[instrument(level = "debug", skip(self))]
    fn open(&self, path: &str) -> Result<FileReader, StorageError> {
        let mut raw = self.open_raw(path)?;
        let mut data = Vec::new();
        raw.read_to_end(&mut data).map_err(|e| {
            StorageError::io(e, StorageContext::new().with_operation("open").with_path(path))
        })?;
        let plaintext = self.encryption.decrypt(&data)?;
        Ok(io::Cursor::new(plaintext))
    }

    fn open_raw(&self, path: &str) -> Result<File, StorageError> {
        let path = normalize(path)?;
        let ctx = self.ctx("open", &path);
        let (dir, name) = match self.locate(&path, "open") {
            Ok(found) => found,
            Err(StorageError::RootPath { .. }) => {
                return Err(StorageError::IsADirectory { context: ctx });
            }
            Err(e) => return Err(e),
        };

        if self.stat_entry(&dir, name, &ctx)?.kind == EntryKind::Directory {
            return Err(StorageError::IsADirectory { context: ctx });
        }
        dir.open_read(OsStr::new(name)).map_err(|e| {
            StorageError::from_safe(
                SafeFsError::from_lookup(&dir, OsStr::new(name), &self.absolute(&path), e),
                ctx,
            )
        })
    }

    #[instrument(level = "debug", skip(self))]
    fn delete(&self, path: &str) -> Result<(), StorageError> {
        let path = normalize(path)?;
        let ctx = self.ctx("delete", &path);
        let (dir, name) = self.locate(&path, "delete")?;
        let name_os = OsStr::new(name);

        match self.stat_entry(&dir, name, &ctx)?.kind {
            EntryKind::Directory => dir.remove_dir(name_os).map_err(|e| {
                if matches!(sys::errno(&e), Some(errno) if errno == Errno::NOTEMPTY || errno == Errno::EXIST) {
                    StorageError::DirectoryNotEmpty { context: ctx.clone() }
                } else {
                    StorageError::io(e, ctx.clone())
                }
            })?,
            _ => dir.unlink(name_os).map_err(|e| StorageError::io(e, ctx.clone()))?,
        }
        debug!(path = %path, "deleted");
        Ok(())
    }

    fn exists(&self, path: &str) -> bool {
        let Ok(path) = normalize(path) else {
            return false;
        };
        match self.locate(&path, "exists") {
            Ok((dir, name)) => dir
                .stat(OsStr::new(name))
                .is_ok_and(|st| st.kind != EntryKind::Symlink),
            Err(StorageError::RootPath { .. }) => true,
            Err(_) => false,
        }
    }

    #[instrument(level = "debug", skip(self))]
    fn list(&self, path: &str, glob: Option<&str>) -> Result<Listing, StorageError> {
        let matcher: Option<GlobMatcher> = glob
            .map(|pattern| {
                Glob::new(pattern)
                    .map(|g| g.compile_matcher())
                    .map_err(|source| StorageError::InvalidGlob {
                        pattern: pattern.to_string(),
                        source,
                    })
            })
            .transpose()?;

        let path = normalize(path)?;
        let ctx = self.ctx("list", &path);
        let dir = self.open_dir(&path, &ctx)?;
        let names = dir.entries().map_err(|e| StorageError::io(e, ctx.clone()))?;

        let mut entries = Vec::with_capacity(names.len());
        for name in names {
            let Some(name) = name.to_str() else {
                warn!(dir = %path, name = ?name, "skipping entry with non UTF-8 name");
                continue;
            };
            if is_temp_name(name) {
                continue;
            }
            if let Some(ref m) = matcher
                && !m.is_match(name)
            {
                continue;
            }
            let child = match path.join(name) {
                Ok(child) => child,
                Err(e) => {
                    warn!(dir = %path, error = %e, "skipping entry with unsupported name");
                    continue;
                }
            };
            match self.meta_for(&dir, name, child) {
                Ok(meta) => entries.push(meta),
                // Raced with a delete
                Err(StorageError::NotFound { .. }) => {}
                Err(StorageError::SymlinkAttack { context }) => {
                    warn!(%context, "symlink excluded from listing");
                }
                Err(e) => return Err(e),
            }
        }

        trace!(dir = %path, count = entries.len(), "listed directory");
        Ok(Listing::new(entries))
    }

    fn info(&self, path: &str) -> Result<FileMeta, StorageError> {
        self.info_at(&normalize(path)?)
    }

    #[instrument(level = "debug", skip(self))]
    fn mkdir(&self, path: &str) -> Result<FileMeta, StorageError> {
        let path = normalize(path)?;
        let ctx = self.ctx("mkdir", &path);
        let mut dir = self.open_root(&ctx)?;
        let mut current = self.root.clone();

        for name in path.components() {
            let name_os = OsStr::new(name);
            current.push(name);
            dir = match dir.open_dir(name_os) {
                Ok(next) => next,
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    match dir.mkdir(name_os, 0o755) {
                        Ok(()) => trace!(path = %current.display(), "created directory"),
                        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {}
                        Err(e) => return Err(StorageError::io(e, ctx)),
                    }
                    dir.open_dir(name_os).map_err(|e| {
                        StorageError::from_safe(SafeFsError::from_lookup(&dir, name_os, &current, e), ctx.clone())
                    })?
                }
                Err(e) => {
                    return Err(match SafeFsError::from_lookup(&dir, name_os, &current, e) {
                        // A file is in the way
                        SafeFsError::NotADirectory { .. } => StorageError::AlreadyExists { context: ctx },
                        other => StorageError::from_safe(other, ctx),
                    });
                }
            };
        }

        self.info_at(&path)
    }

    #[instrument(level = "debug", skip(self))]
    fn move_to(&self, source: &str, dest_dir: &str) -> Result<FileMeta, StorageError> {
        let source = normalize(source)?;
        let dest_dir = normalize(dest_dir)?;
        let Some(name) = source.file_name() else {
            return Err(StorageError::RootPath { operation: "move" });
        };

        let (src_parent, _) = self.locate(&source, "move")?;
        self.stat_entry(&src_parent, name, &self.ctx("move", &source))?;
        let dest = self.require_dir(&dest_dir, "move")?;

        let target = dest_dir.join(name)?;
        if dest_dir.starts_with(&source) {
            return Err(StorageError::IntoItself {
                context: self.ctx("move", &target),
            });
        }
        if Self::entry_exists(&dest, name) {
            return Err(StorageError::AlreadyExists {
                context: self.ctx("move", &target),
            });
        }

        safe_move(&self.absolute(&source), &self.absolute(&target), &self.root)
            .map_err(|e| StorageError::from_safe(e, self.ctx("move", &source)))?;
        debug!(from = %source, to = %target, "moved");
        self.info_at(&target)
    }

    #[instrument(level = "debug", skip(self))]
    fn copy(
        &self,
        source: &str,
        dest_dir: &str,
        new_name: Option<&str>,
    ) -> Result<FileMeta, StorageError> {
        let source = normalize(source)?;
        let dest_dir = normalize(dest_dir)?;
        let Some(name) = source.file_name() else {
            return Err(StorageError::RootPath { operation: "copy" });
        };

        let (src_parent, _) = self.locate(&source, "copy")?;
        let is_directory =
            self.stat_entry(&src_parent, name, &self.ctx("copy", &source))?.kind == EntryKind::Directory;
        let dest = self.require_dir(&dest_dir, "copy")?;

        let final_name = match new_name {
            Some(explicit) => {
                let explicit = validate_filename(explicit)?;
                if Self::entry_exists(&dest, explicit) {
                    return Err(StorageError::AlreadyExists {
                        context: self.ctx("copy", &dest_dir.join(explicit)?),
                    });
                }
                explicit.to_string()
            }
            None if !Self::entry_exists(&dest, name) => name.to_string(),
            None => {
                let mut counter = 1;
                loop {
                    let candidate = copy_candidate(name, is_directory, counter);
                    if !Self::entry_exists(&dest, &candidate) {
                        break candidate;
                    }
                    counter += 1;
                }
            }
        };

        let target = dest_dir.join(&final_name)?;
        if is_directory && dest_dir.starts_with(&source) {
            return Err(StorageError::IntoItself {
                context: self.ctx("copy", &target),
            });
        }

        safe_copy(&self.absolute(&source), &self.absolute(&target), &self.root)
            .map_err(|e| StorageError::from_safe(e, self.ctx("copy", &source)))?;
        debug!(from = %source, to = %target, "copied");
        self.info_at(&target)
    }

    #[instrument(level = "debug", skip(self))]
    fn remove_tree(&self, path: &str) -> Result<RemoveStats, StorageError> {
        let path = normalize(path)?;
        if path.is_root() {
            return Err(StorageError::RootPath {
                operation: "remove",
            });
        }
        safe_rmtree(&self.absolute(&path), &self.root)
            .map_err(|e| StorageError::from_safe(e, self.ctx("remove", &path)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn copy_names() {
        assert_eq!(copy_candidate("report.txt", false, 1), "report (copy).txt");
        assert_eq!(copy_candidate("report.txt", false, 2), "report (copy 2).txt");
        assert_eq!(copy_candidate("archive.tar.gz", false, 1), "archive.tar (copy).gz");
        assert_eq!(copy_candidate("Makefile", false, 3), "Makefile (copy 3)");
        assert_eq!(copy_candidate(".bashrc", false, 1), ".bashrc (copy)");
        assert_eq!(copy_candidate("v1.2", true, 1), "v1.2 (copy)");
    }

    #[test]
    fn temp_names_are_hidden() {
        assert!(is_temp_name(".a.txt.stowage-tmp-0123"));
        assert!(!is_temp_name("a.stowage-tmp-0123"));
        assert!(!is_temp_name(".hidden"));
    }

    #[test]
    fn content_type_guess() {
        assert_eq!(guess_content_type("a.txt").as_deref(), Some("text/plain"));
        assert_eq!(guess_content_type("noext"), None);
    }
}
