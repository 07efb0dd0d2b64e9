//! Forwarding of ordinary paths to the base directory
//!
//! Mounted paths are mapped onto the base directory by prefix substitution.
//! Anything that could climb out of it (`..`, a second root, a Windows-style
//! prefix) is rejected before touching the disk. Errors from the underlying
//! filesystem are returned as-is so their OS error codes reach the caller.

use std::ffi::{OsStr, OsString};
use std::fs::{self, DirBuilder, File, Metadata, OpenOptions};
use std::io;
use std::os::unix::fs::{DirBuilderExt, FileExt, FileTypeExt, OpenOptionsExt, PermissionsExt};
use std::path::{Component, Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use rustix::fs::{AtFlags, Timespec, Timestamps, XattrFlags, CWD};

#[derive(Debug, thiserror::Error)]
pub enum PassthroughError {
    #[error("path escapes the base directory: {0}")]
    PathEscape(PathBuf),
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl From<rustix::io::Errno> for PassthroughError {
    fn from(errno: rustix::io::Errno) -> Self {
        PassthroughError::Io(errno.into())
    }
}

pub type Result<T> = std::result::Result<T, PassthroughError>;

/// Kind of a directory entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Directory,
    Symlink,
    NamedPipe,
    Socket,
    CharDevice,
    BlockDevice,
}

impl From<fs::FileType> for EntryKind {
    fn from(file_type: fs::FileType) -> Self {
        if file_type.is_dir() {
            EntryKind::Directory
        } else if file_type.is_symlink() {
            EntryKind::Symlink
        } else if file_type.is_fifo() {
            EntryKind::NamedPipe
        } else if file_type.is_socket() {
            EntryKind::Socket
        } else if file_type.is_char_device() {
            EntryKind::CharDevice
        } else if file_type.is_block_device() {
            EntryKind::BlockDevice
        } else {
            EntryKind::File
        }
    }
}

/// Filesystem statistics of the base directory's volume
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatFs {
    pub blocks: u64,
    pub blocks_free: u64,
    pub blocks_available: u64,
    pub files: u64,
    pub files_free: u64,
    pub block_size: u32,
    pub name_max: u32,
    pub fragment_size: u32,
}

/// Direct delegation of filesystem primitives to a base directory
#[derive(Debug, Clone)]
pub struct PassthroughBridge {
    base: PathBuf,
}

impl PassthroughBridge {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self { base: base.into() }
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    /// Map a mounted path (`/a/b` or `a/b`) to its location in the base directory
    pub fn resolve(&self, path: &Path) -> Result<PathBuf> {
        let mut resolved = self.base.clone();
        for component in path.components() {
            match component {
                Component::RootDir | Component::CurDir => {}
                Component::Normal(part) => resolved.push(part),
                Component::ParentDir | Component::Prefix(_) => {
                    return Err(PassthroughError::PathEscape(path.to_path_buf()))
                }
            }
        }
        Ok(resolved)
    }

    /// Metadata without following a final symlink
    pub fn getattr(&self, path: &Path) -> Result<Metadata> {
        Ok(fs::symlink_metadata(self.resolve(path)?)?)
    }

    /// Open with POSIX `open(2)` flags
    pub fn open(&self, path: &Path, flags: i32) -> Result<File> {
        let mut options = access_options(flags);
        if flags & libc::O_TRUNC != 0 {
            options.truncate(true);
        }
        Ok(options.open(self.resolve(path)?)?)
    }

    /// Create (or open, unless `O_EXCL`) a regular file
    pub fn create(&self, path: &Path, mode: u32, flags: i32) -> Result<File> {
        let mut options = access_options(flags);
        options.write(true).mode(mode);
        if flags & libc::O_EXCL != 0 {
            options.create_new(true);
        } else {
            options.create(true);
        }
        if flags & libc::O_TRUNC != 0 {
            options.truncate(true);
        }
        Ok(options.open(self.resolve(path)?)?)
    }

    /// Read up to `size` bytes at `offset`; shorter only at end of file
    pub fn read(&self, file: &File, offset: u64, size: usize) -> Result<Vec<u8>> {
        Ok(read_full_at(file, offset, size)?)
    }

    pub fn write(&self, file: &File, offset: u64, data: &[u8]) -> Result<usize> {
        file.write_all_at(data, offset)?;
        Ok(data.len())
    }

    /// Open, read and close in one step
    pub fn read_path(&self, path: &Path, offset: u64, size: usize) -> Result<Vec<u8>> {
        let file = self.open(path, libc::O_RDONLY)?;
        self.read(&file, offset, size)
    }

    /// Open, write and close in one step
    pub fn write_path(&self, path: &Path, offset: u64, data: &[u8]) -> Result<usize> {
        let file = self.open(path, libc::O_WRONLY)?;
        self.write(&file, offset, data)
    }

    pub fn truncate(&self, path: &Path, len: u64) -> Result<()> {
        let file = OpenOptions::new().write(true).open(self.resolve(path)?)?;
        file.set_len(len)?;
        Ok(())
    }

    /// Entries of a directory, without `.` and `..`
    pub fn readdir(&self, path: &Path) -> Result<Vec<(OsString, EntryKind)>> {
        let mut entries = Vec::new();
        for entry in fs::read_dir(self.resolve(path)?)? {
            let entry = entry?;
            let kind = entry.file_type().map(EntryKind::from)?;
            entries.push((entry.file_name(), kind));
        }
        Ok(entries)
    }

    pub fn unlink(&self, path: &Path) -> Result<()> {
        Ok(fs::remove_file(self.resolve(path)?)?)
    }

    pub fn mkdir(&self, path: &Path, mode: u32) -> Result<()> {
        Ok(DirBuilder::new().mode(mode).create(self.resolve(path)?)?)
    }

    pub fn rmdir(&self, path: &Path) -> Result<()> {
        Ok(fs::remove_dir(self.resolve(path)?)?)
    }

    /// `renameat2(2)`; `flags` takes `RENAME_NOREPLACE`, `RENAME_EXCHANGE`
    /// and `RENAME_WHITEOUT`, anything else is `EINVAL`
    #[cfg(target_os = "linux")]
    pub fn rename(&self, from: &Path, to: &Path, flags: u32) -> Result<()> {
        let flags = rustix::fs::RenameFlags::from_bits(flags)
            .ok_or_else(|| io::Error::from_raw_os_error(libc::EINVAL))?;
        rustix::fs::renameat_with(CWD, self.resolve(from)?, CWD, self.resolve(to)?, flags)?;
        Ok(())
    }

    #[cfg(not(target_os = "linux"))]
    pub fn rename(&self, from: &Path, to: &Path, flags: u32) -> Result<()> {
        if flags != 0 {
            return Err(io::Error::from_raw_os_error(libc::EINVAL).into());
        }
        Ok(fs::rename(self.resolve(from)?, self.resolve(to)?)?)
    }

    /// Create a symlink at `path` holding `target` verbatim
    pub fn symlink(&self, path: &Path, target: &Path) -> Result<()> {
        Ok(std::os::unix::fs::symlink(target, self.resolve(path)?)?)
    }

    /// Hard link `to` onto the existing `from`
    pub fn link(&self, from: &Path, to: &Path) -> Result<()> {
        Ok(fs::hard_link(self.resolve(from)?, self.resolve(to)?)?)
    }

    /// `mknod(2)`: `mode` carries the file type bits as well as permissions
    pub fn mknod(&self, path: &Path, mode: u32, rdev: u64) -> Result<()> {
        rustix::fs::mknodat(
            CWD,
            self.resolve(path)?,
            rustix::fs::FileType::from_raw_mode(mode as _),
            rustix::fs::Mode::from_raw_mode(mode as _),
            rdev as _,
        )?;
        Ok(())
    }

    pub fn readlink(&self, path: &Path) -> Result<PathBuf> {
        Ok(fs::read_link(self.resolve(path)?)?)
    }

    pub fn set_mode(&self, path: &Path, mode: u32) -> Result<()> {
        Ok(fs::set_permissions(
            self.resolve(path)?,
            fs::Permissions::from_mode(mode),
        )?)
    }

    pub fn set_owner(&self, path: &Path, uid: Option<u32>, gid: Option<u32>) -> Result<()> {
        Ok(std::os::unix::fs::lchown(self.resolve(path)?, uid, gid)?)
    }

    pub fn set_times(
        &self,
        path: &Path,
        accessed: Option<SystemTime>,
        modified: Option<SystemTime>,
    ) -> Result<()> {
        // By path, so FIFOs and devices are never opened
        let times = Timestamps {
            last_access: timespec(accessed),
            last_modification: timespec(modified),
        };
        rustix::fs::utimensat(CWD, self.resolve(path)?, &times, AtFlags::SYMLINK_NOFOLLOW)?;
        Ok(())
    }

    /// `access(2)` against the real file; `mask` takes `F_OK`/`R_OK`/`W_OK`/`X_OK`
    pub fn access(&self, path: &Path, mask: i32) -> Result<()> {
        let access = rustix::fs::Access::from_bits_truncate(mask as _);
        rustix::fs::accessat(CWD, self.resolve(path)?, access, AtFlags::empty())?;
        Ok(())
    }

    pub fn statfs(&self, path: &Path) -> Result<StatFs> {
        let stat = rustix::fs::statvfs(self.resolve(path)?)?;
        Ok(StatFs {
            blocks: stat.f_blocks,
            blocks_free: stat.f_bfree,
            blocks_available: stat.f_bavail,
            files: stat.f_files,
            files_free: stat.f_ffree,
            block_size: stat.f_bsize as u32,
            name_max: stat.f_namemax as u32,
            fragment_size: stat.f_frsize as u32,
        })
    }

    /// Value of an extended attribute of the entry itself, not a link target
    pub fn getxattr(&self, path: &Path, name: &OsStr) -> Result<Vec<u8>> {
        let resolved = self.resolve(path)?;
        loop {
            let len = rustix::fs::lgetxattr(&resolved, name, &mut [])?;
            let mut value = vec![0u8; len];
            match rustix::fs::lgetxattr(&resolved, name, &mut value) {
                Ok(len) => {
                    value.truncate(len);
                    return Ok(value);
                }
                // Grew between the two calls
                Err(rustix::io::Errno::RANGE) => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Attribute names as the kernel lists them, each NUL-terminated
    pub fn listxattr(&self, path: &Path) -> Result<Vec<u8>> {
        let resolved = self.resolve(path)?;
        loop {
            let len = rustix::fs::llistxattr(&resolved, &mut [])?;
            let mut names: Vec<u8> = vec![0; len];
            match rustix::fs::llistxattr(&resolved, &mut names) {
                Ok(len) => {
                    names.truncate(len);
                    return Ok(names.into_iter().map(|c| c as u8).collect());
                }
                Err(rustix::io::Errno::RANGE) => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// `flags` takes `XATTR_CREATE` or `XATTR_REPLACE`
    pub fn setxattr(&self, path: &Path, name: &OsStr, value: &[u8], flags: i32) -> Result<()> {
        let flags = XattrFlags::from_bits(flags as _)
            .ok_or_else(|| io::Error::from_raw_os_error(libc::EINVAL))?;
        rustix::fs::lsetxattr(self.resolve(path)?, name, value, flags)?;
        Ok(())
    }

    pub fn removexattr(&self, path: &Path, name: &OsStr) -> Result<()> {
        rustix::fs::lremovexattr(self.resolve(path)?, name)?;
        Ok(())
    }
}

/// `None` leaves the timestamp as it is
fn timespec(time: Option<SystemTime>) -> Timespec {
    let Some(time) = time else {
        return Timespec {
            tv_sec: 0,
            tv_nsec: libc::UTIME_OMIT as _,
        };
    };
    match time.duration_since(UNIX_EPOCH) {
        Ok(since) => Timespec {
            tv_sec: since.as_secs() as _,
            tv_nsec: since.subsec_nanos() as _,
        },
        Err(before) => {
            let before = before.duration();
            // Normalized so that tv_nsec stays in 0..1e9
            let (secs, nanos) = match before.subsec_nanos() {
                0 => (-(before.as_secs() as i64), 0),
                n => (-(before.as_secs() as i64) - 1, 1_000_000_000 - n),
            };
            Timespec {
                tv_sec: secs as _,
                tv_nsec: nanos as _,
            }
        }
    }
}

/// Positional read that only comes up short at end of file
pub fn read_full_at(file: &File, offset: u64, size: usize) -> io::Result<Vec<u8>> {
    let mut buf = vec![0u8; size];
    let mut filled = 0;
    while filled < size {
        match file.read_at(&mut buf[filled..], offset + filled as u64) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    buf.truncate(filled);
    Ok(buf)
}

fn access_options(flags: i32) -> OpenOptions {
    let mut options = OpenOptions::new();
    match flags & libc::O_ACCMODE {
        libc::O_WRONLY => {
            options.write(true);
        }
        libc::O_RDWR => {
            options.read(true).write(true);
        }
        _ => {
            options.read(true);
        }
    }
    if flags & libc::O_APPEND != 0 {
        options.append(true);
    }
    options
}
