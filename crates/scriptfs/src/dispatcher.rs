//! Per-path routing between the base directory and virtual files
//!
//! Virtual files live next to the config file that defines them. A path is
//! virtual when its last component is present in the `VirtualFileTable` of
//! its parent directory; everything else goes to the `PassthroughBridge`
//! untouched.
//!
//! Virtual files only support read-class operations. Their reported size is
//! a placeholder `0`, since the real length is unknown until the script has
//! run; readers get the full output from `read` (the FUSE adapter opens them
//! with direct I/O so the kernel does not trust the size).

use std::ffi::{OsStr, OsString};
use std::fs::{File, Metadata};
use std::os::unix::fs::{FileExt, MetadataExt};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::cache::{CacheConfig, Caller, ContentCache};
use crate::config::{ConfigEntry, ConfigStore, VirtualFileTable};
use crate::error::FsError;
use crate::passthrough::{read_full_at, EntryKind, PassthroughBridge, StatFs};
use crate::script::{RunnerConfig, ScriptRunner};

/// Permission bits of every virtual file
pub const VIRTUAL_FILE_MODE: u16 = 0o444;

/// Runtime options for the dispatcher
#[derive(Debug, Clone, Default)]
pub struct DispatcherConfig {
    /// Kill scripts that run longer than this. `None` never times out.
    pub timeout: Option<Duration>,
    /// Shell override, `/bin/sh` when unset
    pub shell: Option<PathBuf>,
    pub cache: CacheConfig,
}

/// Attributes of a file as seen through the mount
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attr {
    pub kind: EntryKind,
    pub size: u64,
    pub blocks: u64,
    pub perm: u16,
    pub nlink: u32,
    pub uid: u32,
    pub gid: u32,
    pub rdev: u32,
    pub blksize: u32,
    pub atime: SystemTime,
    pub mtime: SystemTime,
    pub ctime: SystemTime,
    pub is_virtual: bool,
}

impl Attr {
    fn from_metadata(meta: &Metadata) -> Self {
        Self {
            kind: EntryKind::from(meta.file_type()),
            size: meta.size(),
            blocks: meta.blocks(),
            perm: (meta.mode() & 0o7777) as u16,
            nlink: meta.nlink() as u32,
            uid: meta.uid(),
            gid: meta.gid(),
            rdev: meta.rdev() as u32,
            blksize: meta.blksize() as u32,
            atime: unix_time(meta.atime(), meta.atime_nsec()),
            mtime: unix_time(meta.mtime(), meta.mtime_nsec()),
            ctime: unix_time(meta.ctime(), meta.ctime_nsec()),
            is_virtual: false,
        }
    }
}

fn unix_time(secs: i64, nsecs: i64) -> SystemTime {
    if secs >= 0 {
        UNIX_EPOCH + Duration::new(secs as u64, nsecs as u32)
    } else {
        UNIX_EPOCH - Duration::from_secs(secs.unsigned_abs())
    }
}

/// Attribute changes requested by `setattr`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SetAttr {
    pub mode: Option<u32>,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    pub size: Option<u64>,
    pub atime: Option<SystemTime>,
    pub mtime: Option<SystemTime>,
}

impl SetAttr {
    pub fn is_empty(&self) -> bool {
        *self == SetAttr::default()
    }
}

/// One entry of a merged directory listing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub name: OsString,
    pub kind: EntryKind,
}

/// An opened file: a snapshot of script output, or a real file
#[derive(Debug)]
pub enum OpenFile {
    Virtual {
        filename: String,
        content: Arc<Vec<u8>>,
    },
    Real(File),
}

impl OpenFile {
    pub fn is_virtual(&self) -> bool {
        matches!(self, OpenFile::Virtual { .. })
    }

    /// Up to `size` bytes at `offset`, empty past the end
    pub fn read(&self, offset: u64, size: usize) -> Result<Vec<u8>, FsError> {
        match self {
            OpenFile::Virtual { content, .. } => {
                let start = usize::try_from(offset).unwrap_or(usize::MAX).min(content.len());
                let end = start.saturating_add(size).min(content.len());
                Ok(content[start..end].to_vec())
            }
            OpenFile::Real(file) => Ok(read_full_at(file, offset, size)?),
        }
    }

    pub fn write(&self, offset: u64, data: &[u8]) -> Result<usize, FsError> {
        match self {
            OpenFile::Virtual { filename, .. } => Err(FsError::PermissionDenied(filename.clone())),
            OpenFile::Real(file) => {
                file.write_all_at(data, offset)?;
                Ok(data.len())
            }
        }
    }

    pub fn sync(&self, datasync: bool) -> Result<(), FsError> {
        match self {
            OpenFile::Virtual { .. } => Ok(()),
            OpenFile::Real(file) if datasync => Ok(file.sync_data()?),
            OpenFile::Real(file) => Ok(file.sync_all()?),
        }
    }
}

/// Routes every filesystem operation to passthrough or script generation
#[derive(Debug)]
pub struct FilesystemDispatcher {
    config: ConfigStore,
    cache: ContentCache,
    bridge: PassthroughBridge,
    uid: u32,
    gid: u32,
    mounted_at: SystemTime,
}

impl FilesystemDispatcher {
    /// Load the config and prepare the runner. A bad config is fatal.
    pub fn new(basedir: &Path, mountpoint: &Path, options: DispatcherConfig) -> Result<Self, FsError> {
        let basedir = basedir.canonicalize()?;
        let mountpoint = mountpoint.canonicalize()?;

        let config = ConfigStore::load(&basedir, &mountpoint)?;

        let mut runner_config = RunnerConfig::new(&basedir);
        runner_config.root = Some(mountpoint.clone());
        runner_config.timeout = options.timeout;
        if let Some(shell) = options.shell {
            runner_config.shell = shell;
        }
        let runner = ScriptRunner::new(runner_config)?;
        let cache = ContentCache::new(runner, &basedir, options.cache);

        tracing::info!(
            "Dispatching {} -> {} ({} virtual file(s))",
            mountpoint.display(),
            basedir.display(),
            config.table().len()
        );

        Ok(Self {
            config,
            cache,
            bridge: PassthroughBridge::new(basedir),
            // SAFETY: getuid/getgid cannot fail and have no preconditions
            uid: unsafe { libc::getuid() },
            gid: unsafe { libc::getgid() },
            mounted_at: SystemTime::now(),
        })
    }

    pub fn table(&self) -> Arc<VirtualFileTable> {
        self.config.table()
    }

    pub fn config_store(&self) -> &ConfigStore {
        &self.config
    }

    pub fn cache(&self) -> &ContentCache {
        &self.cache
    }

    pub fn bridge(&self) -> &PassthroughBridge {
        &self.bridge
    }

    /// The definition behind `path`, if it names a virtual file. The
    /// parent directory's config is reloaded first if it changed.
    pub fn virtual_entry(&self, path: &Path) -> Option<Arc<ConfigEntry>> {
        let (dir, name) = split_virtual(path)?;
        self.config.table_for(&dir).get(name).cloned()
    }

    pub fn is_virtual(&self, path: &Path) -> bool {
        self.virtual_entry(path).is_some()
    }

    pub fn getattr(&self, path: &Path) -> Result<Attr, FsError> {
        match self.virtual_entry(path) {
            Some(entry) => Ok(self.virtual_attr(&entry)),
            None => Ok(Attr::from_metadata(&self.bridge.getattr(path)?)),
        }
    }

    /// Open with `open(2)` flags. Virtual files run their script here.
    pub fn open(&self, path: &Path, flags: i32, caller: &Caller) -> Result<OpenFile, FsError> {
        match self.virtual_entry(path) {
            Some(entry) => self.open_virtual(&entry, flags, caller),
            None => self.open_real(path, flags),
        }
    }

    /// Run the script of an already classified virtual file
    pub fn open_virtual(
        &self,
        entry: &ConfigEntry,
        flags: i32,
        caller: &Caller,
    ) -> Result<OpenFile, FsError> {
        let filename = entry.key().display().to_string();
        if flags & libc::O_ACCMODE != libc::O_RDONLY || flags & libc::O_TRUNC != 0 {
            return Err(FsError::PermissionDenied(filename));
        }

        tracing::debug!("Generating {} for {:?}", filename, caller);
        let content = self.cache.get_or_generate(entry, caller)?;
        Ok(OpenFile::Virtual { filename, content })
    }

    /// Open a path already known not to be virtual
    pub fn open_real(&self, path: &Path, flags: i32) -> Result<OpenFile, FsError> {
        Ok(OpenFile::Real(self.bridge.open(path, flags)?))
    }

    /// Open, read and release in one step
    pub fn read(
        &self,
        path: &Path,
        offset: u64,
        size: usize,
        caller: &Caller,
    ) -> Result<Vec<u8>, FsError> {
        self.open(path, libc::O_RDONLY, caller)?.read(offset, size)
    }

    pub fn create(&self, path: &Path, mode: u32, flags: i32) -> Result<OpenFile, FsError> {
        self.deny_virtual(path)?;
        Ok(OpenFile::Real(self.bridge.create(path, mode, flags)?))
    }

    pub fn write(&self, path: &Path, offset: u64, data: &[u8]) -> Result<usize, FsError> {
        self.deny_virtual(path)?;
        Ok(self.bridge.write_path(path, offset, data)?)
    }

    pub fn truncate(&self, path: &Path, len: u64) -> Result<(), FsError> {
        self.deny_virtual(path)?;
        Ok(self.bridge.truncate(path, len)?)
    }

    /// Apply attribute changes and return the resulting attributes
    pub fn setattr(&self, path: &Path, changes: &SetAttr) -> Result<Attr, FsError> {
        if changes.is_empty() {
            return self.getattr(path);
        }
        self.deny_virtual(path)?;

        if let Some(size) = changes.size {
            self.bridge.truncate(path, size)?;
        }
        if let Some(mode) = changes.mode {
            self.bridge.set_mode(path, mode)?;
        }
        if changes.uid.is_some() || changes.gid.is_some() {
            self.bridge.set_owner(path, changes.uid, changes.gid)?;
        }
        if changes.atime.is_some() || changes.mtime.is_some() {
            self.bridge.set_times(path, changes.atime, changes.mtime)?;
        }
        self.getattr(path)
    }

    /// Directory listing; virtual names defined for this directory replace
    /// same-named real entries
    pub fn readdir(&self, path: &Path) -> Result<Vec<DirEntry>, FsError> {
        let real = self.bridge.readdir(path)?;
        let table = self.config.table_for(path);
        let mut entries: Vec<DirEntry> = real
            .into_iter()
            .filter(|(name, _)| !name.to_str().is_some_and(|name| table.contains(name)))
            .map(|(name, kind)| DirEntry { name, kind })
            .collect();
        entries.extend(table.names().into_iter().map(|name| DirEntry {
            name: OsString::from(name),
            kind: EntryKind::File,
        }));
        Ok(entries)
    }

    pub fn unlink(&self, path: &Path) -> Result<(), FsError> {
        self.deny_virtual(path)?;
        Ok(self.bridge.unlink(path)?)
    }

    pub fn mkdir(&self, path: &Path, mode: u32) -> Result<(), FsError> {
        self.deny_virtual(path)?;
        Ok(self.bridge.mkdir(path, mode)?)
    }

    pub fn rmdir(&self, path: &Path) -> Result<(), FsError> {
        self.deny_virtual(path)?;
        Ok(self.bridge.rmdir(path)?)
    }

    /// `flags` are `renameat2(2)` flags and reach the base directory as-is
    pub fn rename(&self, from: &Path, to: &Path, flags: u32) -> Result<(), FsError> {
        self.deny_virtual(from)?;
        self.deny_virtual(to)?;
        Ok(self.bridge.rename(from, to, flags)?)
    }

    pub fn symlink(&self, path: &Path, target: &Path) -> Result<(), FsError> {
        self.deny_virtual(path)?;
        Ok(self.bridge.symlink(path, target)?)
    }

    /// Hard link; virtual files can be neither source nor destination
    pub fn link(&self, from: &Path, to: &Path) -> Result<(), FsError> {
        self.deny_virtual(from)?;
        self.deny_virtual(to)?;
        Ok(self.bridge.link(from, to)?)
    }

    pub fn mknod(&self, path: &Path, mode: u32, rdev: u64) -> Result<(), FsError> {
        self.deny_virtual(path)?;
        Ok(self.bridge.mknod(path, mode, rdev)?)
    }

    /// Virtual files carry no extended attributes
    pub fn getxattr(&self, path: &Path, name: &OsStr) -> Result<Vec<u8>, FsError> {
        if self.is_virtual(path) {
            return Err(std::io::Error::from_raw_os_error(libc::ENODATA).into());
        }
        Ok(self.bridge.getxattr(path, name)?)
    }

    /// NUL-terminated attribute names, empty for virtual files
    pub fn listxattr(&self, path: &Path) -> Result<Vec<u8>, FsError> {
        if self.is_virtual(path) {
            return Ok(Vec::new());
        }
        Ok(self.bridge.listxattr(path)?)
    }

    pub fn setxattr(
        &self,
        path: &Path,
        name: &OsStr,
        value: &[u8],
        flags: i32,
    ) -> Result<(), FsError> {
        self.deny_virtual(path)?;
        Ok(self.bridge.setxattr(path, name, value, flags)?)
    }

    pub fn removexattr(&self, path: &Path, name: &OsStr) -> Result<(), FsError> {
        self.deny_virtual(path)?;
        Ok(self.bridge.removexattr(path, name)?)
    }

    pub fn readlink(&self, path: &Path) -> Result<PathBuf, FsError> {
        if self.is_virtual(path) {
            return Err(std::io::Error::from_raw_os_error(libc::EINVAL).into());
        }
        Ok(self.bridge.readlink(path)?)
    }

    pub fn statfs(&self, path: &Path) -> Result<StatFs, FsError> {
        let target = if self.is_virtual(path) {
            Path::new("/")
        } else {
            path
        };
        Ok(self.bridge.statfs(target)?)
    }

    /// Permission check; virtual files are only ever readable
    pub fn access(&self, path: &Path, mask: i32) -> Result<(), FsError> {
        match self.virtual_entry(path) {
            Some(entry) if mask & (libc::W_OK | libc::X_OK) != 0 => {
                Err(FsError::PermissionDenied(entry.key().display().to_string()))
            }
            Some(_) => Ok(()),
            None => Ok(self.bridge.access(path, mask)?),
        }
    }

    fn deny_virtual(&self, path: &Path) -> Result<(), FsError> {
        match self.virtual_entry(path) {
            Some(entry) => {
                let name = entry.key().display().to_string();
                tracing::debug!("Refusing mutation of virtual file {}", name);
                Err(FsError::PermissionDenied(name))
            }
            None => Ok(()),
        }
    }

    fn virtual_attr(&self, entry: &ConfigEntry) -> Attr {
        let stamp = self
            .cache
            .generated_at(entry.key())
            .unwrap_or(self.mounted_at);
        Attr {
            kind: EntryKind::File,
            size: 0,
            blocks: 0,
            perm: VIRTUAL_FILE_MODE,
            nlink: 1,
            uid: self.uid,
            gid: self.gid,
            rdev: 0,
            blksize: 4096,
            atime: stamp,
            mtime: stamp,
            ctime: stamp,
            is_virtual: true,
        }
    }
}

/// Parent directory and final name of a path that could be virtual.
/// Paths with `..` and names that are not UTF-8 never are.
fn split_virtual(path: &Path) -> Option<(PathBuf, &str)> {
    let mut dir = PathBuf::new();
    let mut last: Option<&OsStr> = None;
    for component in path.components() {
        match component {
            Component::RootDir | Component::CurDir => {}
            Component::Normal(part) => {
                if let Some(previous) = last.replace(part) {
                    dir.push(previous);
                }
            }
            Component::ParentDir | Component::Prefix(_) => return None,
        }
    }
    Some((dir, last?.to_str()?))
}
