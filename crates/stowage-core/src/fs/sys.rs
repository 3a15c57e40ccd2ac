//! Descriptor-relative filesystem calls.
//!
//! Every lookup below goes through `openat`/`fstatat`/`unlinkat`/`renameat`
//! against an already-open directory descriptor, with `O_NOFOLLOW` or
//! `AT_SYMLINK_NOFOLLOW` on the final component. Nothing re-resolves a string
//! path from the filesystem root once a [`DirFd`] is held.

use std::{
    ffi::{OsStr, OsString},
    fs::File,
    io,
    os::{fd::OwnedFd, unix::ffi::OsStrExt},
    path::Path,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use rustix::{
    fs::{AtFlags, Dir, FileType, Mode, OFlags, Stat},
    io::Errno,
};

/// File type as reported by `lstat`-style calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Directory,
    Symlink,
    Other,
}

/// The subset of `struct stat` the storage layer uses.
#[derive(Debug, Clone, Copy)]
pub struct EntryStat {
    pub kind: EntryKind,
    pub size: u64,
    pub modified: SystemTime,
}

impl From<Stat> for EntryStat {
    fn from(st: Stat) -> Self {
        let kind = match FileType::from_raw_mode(st.st_mode) {
            FileType::Directory => EntryKind::Directory,
            FileType::RegularFile => EntryKind::File,
            FileType::Symlink => EntryKind::Symlink,
            _ => EntryKind::Other,
        };

        let secs = i64::try_from(st.st_mtime).unwrap_or(0);
        let nanos = u32::try_from(st.st_mtime_nsec).unwrap_or(0);
        let modified = match u64::try_from(secs) {
            Ok(secs) => UNIX_EPOCH + Duration::new(secs, nanos),
            Err(_) => UNIX_EPOCH - Duration::from_secs(secs.unsigned_abs()),
        };

        Self {
            kind,
            size: u64::try_from(st.st_size).unwrap_or(0),
            modified,
        }
    }
}

/// Permission bits from a `u32`, truncated to what the platform's mode holds.
fn mode(bits: u32) -> Mode {
    Mode::from_bits_truncate((bits & 0o7777).try_into().unwrap_or_default())
}

/// The errno behind an I/O error, if it came from a syscall.
pub fn errno(err: &io::Error) -> Option<Errno> {
    Errno::from_io_error(err)
}

/// Whether an error came from `O_NOFOLLOW` refusing a symlink.
pub fn is_symlink_refusal(err: &io::Error) -> bool {
    errno(err) == Some(Errno::LOOP)
}

/// `O_NOFOLLOW | O_CLOEXEC` in the form `OpenOptionsExt::custom_flags` takes.
pub fn nofollow_open_flags() -> i32 {
    i32::from_ne_bytes((OFlags::NOFOLLOW | OFlags::CLOEXEC).bits().to_ne_bytes())
}

/// An open directory used as the anchor for relative operations.
#[derive(Debug)]
pub struct DirFd(OwnedFd);

impl DirFd {
    /// Open a trusted root directory.
    ///
    /// Symlinks in `path` are followed here. Only configured storage roots go
    /// through this call; everything beneath them uses [`DirFd::open_dir`].
    pub fn open_root(path: &Path) -> io::Result<Self> {
        let fd = rustix::fs::open(
            path,
            OFlags::RDONLY | OFlags::DIRECTORY | OFlags::CLOEXEC,
            Mode::empty(),
        )?;
        Ok(Self(fd))
    }

    fn openat(&self, name: &OsStr, flags: OFlags, create_mode: Mode) -> io::Result<OwnedFd> {
        Ok(rustix::fs::openat(
            &self.0,
            name,
            flags | OFlags::NOFOLLOW | OFlags::CLOEXEC,
            create_mode,
        )?)
    }

    /// Open a child directory, refusing symlinks.
    pub fn open_dir(&self, name: &OsStr) -> io::Result<DirFd> {
        self.openat(name, OFlags::RDONLY | OFlags::DIRECTORY, Mode::empty())
            .map(DirFd)
    }

    /// Open a child file for reading, refusing symlinks.
    pub fn open_read(&self, name: &OsStr) -> io::Result<File> {
        self.openat(name, OFlags::RDONLY, Mode::empty()).map(File::from)
    }

    /// Create a new child file for writing. Fails if the name exists.
    pub fn create_new(&self, name: &OsStr, bits: u32) -> io::Result<File> {
        self.openat(
            name,
            OFlags::WRONLY | OFlags::CREATE | OFlags::EXCL,
            mode(bits),
        )
        .map(File::from)
    }

    /// `lstat` a child entry.
    pub fn stat(&self, name: &OsStr) -> io::Result<EntryStat> {
        let st = rustix::fs::statat(&self.0, name, AtFlags::SYMLINK_NOFOLLOW)?;
        Ok(st.into())
    }

    /// `fstat` the directory itself.
    pub fn stat_self(&self) -> io::Result<EntryStat> {
        Ok(rustix::fs::fstat(&self.0)?.into())
    }

    /// Remove a non-directory child. A symlink is removed, never followed.
    pub fn unlink(&self, name: &OsStr) -> io::Result<()> {
        Ok(rustix::fs::unlinkat(&self.0, name, AtFlags::empty())?)
    }

    /// Remove an empty child directory. Fails with `ENOTDIR` on a symlink.
    pub fn remove_dir(&self, name: &OsStr) -> io::Result<()> {
        Ok(rustix::fs::unlinkat(&self.0, name, AtFlags::REMOVEDIR)?)
    }

    pub fn mkdir(&self, name: &OsStr, bits: u32) -> io::Result<()> {
        Ok(rustix::fs::mkdirat(&self.0, name, mode(bits))?)
    }

    /// Rename `from` (relative to `self`) to `to` (relative to `to_dir`).
    ///
    /// Neither name is followed if it is a symlink; the link itself is the
    /// object renamed or replaced.
    pub fn rename(&self, from: &OsStr, to_dir: &DirFd, to: &OsStr) -> io::Result<()> {
        Ok(rustix::fs::renameat(&self.0, from, &to_dir.0, to)?)
    }

    /// Like [`DirFd::rename`], but fails with `EEXIST` instead of replacing `to`.
    ///
    /// Returns `Unsupported` where the kernel or filesystem has no
    /// `RENAME_NOREPLACE`; callers then check and rename separately.
    #[cfg(any(target_os = "linux", target_os = "android", target_vendor = "apple"))]
    pub fn rename_noreplace(&self, from: &OsStr, to_dir: &DirFd, to: &OsStr) -> io::Result<()> {
        use rustix::fs::RenameFlags;

        match rustix::fs::renameat_with(&self.0, from, &to_dir.0, to, RenameFlags::NOREPLACE) {
            Ok(()) => Ok(()),
            Err(e) if e == Errno::INVAL || e == Errno::NOSYS || e == Errno::NOTSUP => Err(
                io::Error::new(io::ErrorKind::Unsupported, "RENAME_NOREPLACE not supported"),
            ),
            Err(e) => Err(e.into()),
        }
    }

    #[cfg(not(any(target_os = "linux", target_os = "android", target_vendor = "apple")))]
    pub fn rename_noreplace(&self, _from: &OsStr, _to_dir: &DirFd, _to: &OsStr) -> io::Result<()> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "RENAME_NOREPLACE not supported",
        ))
    }

    /// Names of all entries except `.` and `..`.
    pub fn entries(&self) -> io::Result<Vec<OsString>> {
        // Reads through a fresh descriptor for "."; the offset of `self` is untouched
        let mut dir = Dir::read_from(&self.0)?;
        let mut names = Vec::new();
        while let Some(entry) = dir.read() {
            let entry = entry?;
            let name = entry.file_name().to_bytes();
            if name != b"." && name != b".." {
                names.push(OsStr::from_bytes(name).to_os_string());
            }
        }
        Ok(names)
    }
}

/// Check that `O_NOFOLLOW` refuses a symlinked directory on this system.
pub fn probe_nofollow() -> io::Result<bool> {
    let scratch = tempfile::tempdir()?;
    std::fs::create_dir(scratch.path().join("target"))?;
    std::os::unix::fs::symlink("target", scratch.path().join("link"))?;

    let root = DirFd::open_root(scratch.path())?;
    let link = OsStr::new("link");
    match root.open_dir(link) {
        Ok(_) => Ok(false),
        Err(_) => Ok(root.stat(link)?.kind == EntryKind::Symlink),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};

    #[test]
    fn open_dir_refuses_symlink() {
        let temp = tempfile::tempdir().unwrap();
        std::fs::create_dir(temp.path().join("real")).unwrap();
        std::os::unix::fs::symlink(temp.path().join("real"), temp.path().join("link")).unwrap();

        let root = DirFd::open_root(temp.path()).unwrap();
        assert!(root.open_dir(OsStr::new("real")).is_ok());
        assert!(root.open_dir(OsStr::new("link")).is_err());
        assert_eq!(root.stat(OsStr::new("link")).unwrap().kind, EntryKind::Symlink);
    }

    #[test]
    fn create_read_rename_unlink() {
        let temp = tempfile::tempdir().unwrap();
        let root = DirFd::open_root(temp.path()).unwrap();

        let mut f = root.create_new(OsStr::new("a"), 0o644).unwrap();
        f.write_all(b"data").unwrap();
        drop(f);
        assert!(root.create_new(OsStr::new("a"), 0o644).is_err());

        root.mkdir(OsStr::new("sub"), 0o755).unwrap();
        let sub = root.open_dir(OsStr::new("sub")).unwrap();
        root.rename(OsStr::new("a"), &sub, OsStr::new("b")).unwrap();

        let mut contents = String::new();
        sub.open_read(OsStr::new("b"))
            .unwrap()
            .read_to_string(&mut contents)
            .unwrap();
        assert_eq!(contents, "data");

        let stat = sub.stat(OsStr::new("b")).unwrap();
        assert_eq!(stat.kind, EntryKind::File);
        assert_eq!(stat.size, 4);

        sub.unlink(OsStr::new("b")).unwrap();
        root.remove_dir(OsStr::new("sub")).unwrap();
        assert!(root.entries().unwrap().is_empty());
    }

    #[test]
    fn rename_noreplace_keeps_existing_target() {
        let temp = tempfile::tempdir().unwrap();
        std::fs::write(temp.path().join("src"), b"new").unwrap();
        std::fs::write(temp.path().join("dst"), b"old").unwrap();
        let root = DirFd::open_root(temp.path()).unwrap();

        match root.rename_noreplace(OsStr::new("src"), &root, OsStr::new("dst")) {
            Err(e) if e.kind() == io::ErrorKind::Unsupported => {}
            Err(e) => assert_eq!(errno(&e), Some(Errno::EXIST)),
            Ok(()) => panic!("rename replaced an existing entry"),
        }
        assert_eq!(std::fs::read(temp.path().join("dst")).unwrap(), b"old");
        assert_eq!(std::fs::read(temp.path().join("src")).unwrap(), b"new");
    }

    #[test]
    fn entries_can_be_listed_twice() {
        let temp = tempfile::tempdir().unwrap();
        std::fs::write(temp.path().join("x"), b"").unwrap();
        std::fs::write(temp.path().join("y"), b"").unwrap();
        let root = DirFd::open_root(temp.path()).unwrap();

        let mut first = root.entries().unwrap();
        let mut second = root.entries().unwrap();
        first.sort();
        second.sort();
        assert_eq!(first, vec![OsString::from("x"), OsString::from("y")]);
        assert_eq!(first, second);
    }

    #[test]
    fn platform_probe_passes() {
        assert!(probe_nofollow().unwrap());
    }
}
