//! `fuser::Filesystem` binding for the dispatcher
//!
//! The session loop calls into this type one request at a time. Passthrough
//! requests are answered inline. Opening a virtual file may run a script for
//! an unbounded time, so it is moved to its own thread and answered from
//! there; this keeps the loop free to serve other files, including requests
//! made by the running script itself.

use std::ffi::{OsStr, OsString};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use fuser::consts::FOPEN_DIRECT_IO;
use fuser::{
    FileAttr, FileType, KernelConfig, ReplyAttr, ReplyCreate, ReplyData, ReplyDirectory,
    ReplyEmpty, ReplyEntry, ReplyOpen, ReplyStatfs, ReplyWrite, ReplyXattr, Request, TimeOrNow,
};
use libc::c_int;

use super::handles::HandleTable;
use super::inode_table::InodeTable;
use crate::cache::Caller;
use crate::dispatcher::{Attr, FilesystemDispatcher, SetAttr};
use crate::error::FsError;
use crate::passthrough::EntryKind;

/// How long the kernel may cache attributes and entries
const TTL: Duration = Duration::from_secs(1);

/// `RENAME_EXCHANGE` from `renameat2(2)`
const RENAME_EXCHANGE: u32 = 1 << 1;

/// FUSE filesystem serving a `FilesystemDispatcher`
pub struct ScriptFs {
    dispatcher: Arc<FilesystemDispatcher>,
    inodes: InodeTable,
    handles: Arc<HandleTable>,
}

impl ScriptFs {
    pub fn new(dispatcher: Arc<FilesystemDispatcher>) -> Self {
        Self {
            dispatcher,
            inodes: InodeTable::new(),
            handles: Arc::new(HandleTable::new()),
        }
    }

    fn path(&self, ino: u64) -> Result<PathBuf, c_int> {
        self.inodes
            .get_path(ino)
            .map(Path::to_path_buf)
            .ok_or(libc::ENOENT)
    }

    fn child_path(&self, parent: u64, name: &OsStr) -> Result<PathBuf, c_int> {
        let parent = self.path(parent)?;
        Ok(InodeTable::child_path(&parent, name))
    }

    fn entry_reply(&mut self, path: &Path, reply: ReplyEntry) {
        match self.dispatcher.getattr(path) {
            Ok(attr) => {
                let ino = self.inodes.lookup(path);
                reply.entry(&TTL, &file_attr(ino, &attr), 0);
            }
            Err(e) => reply.error(e.errno()),
        }
    }
}

fn file_type(kind: EntryKind) -> FileType {
    match kind {
        EntryKind::Directory => FileType::Directory,
        EntryKind::Symlink => FileType::Symlink,
        EntryKind::File => FileType::RegularFile,
        EntryKind::NamedPipe => FileType::NamedPipe,
        EntryKind::Socket => FileType::Socket,
        EntryKind::CharDevice => FileType::CharDevice,
        EntryKind::BlockDevice => FileType::BlockDevice,
    }
}

fn file_attr(ino: u64, attr: &Attr) -> FileAttr {
    FileAttr {
        ino,
        size: attr.size,
        blocks: attr.blocks,
        atime: attr.atime,
        mtime: attr.mtime,
        ctime: attr.ctime,
        crtime: attr.ctime,
        kind: file_type(attr.kind),
        perm: attr.perm,
        nlink: attr.nlink,
        uid: attr.uid,
        gid: attr.gid,
        rdev: attr.rdev,
        blksize: attr.blksize,
        flags: 0,
    }
}

fn system_time(time: TimeOrNow) -> SystemTime {
    match time {
        TimeOrNow::SpecificTime(time) => time,
        TimeOrNow::Now => SystemTime::now(),
    }
}

fn log_failure(op: &str, path: &Path, e: &FsError) {
    tracing::debug!("{} {} failed: {}", op, path.display(), e);
}

/// Answer to an xattr query with a caller buffer of `size` bytes
#[derive(Debug, PartialEq, Eq)]
enum XattrReply<'a> {
    /// `size` was 0: report the length needed
    Size(u32),
    Data(&'a [u8]),
}

fn xattr_reply(value: &[u8], size: u32) -> Result<XattrReply<'_>, c_int> {
    let len = u32::try_from(value.len()).map_err(|_| libc::E2BIG)?;
    if size == 0 {
        Ok(XattrReply::Size(len))
    } else if len <= size {
        Ok(XattrReply::Data(value))
    } else {
        Err(libc::ERANGE)
    }
}

fn send_xattr(result: Result<Vec<u8>, FsError>, size: u32, reply: ReplyXattr) {
    let value = match result {
        Ok(value) => value,
        Err(e) => return reply.error(e.errno()),
    };
    match xattr_reply(&value, size) {
        Ok(XattrReply::Size(len)) => reply.size(len),
        Ok(XattrReply::Data(data)) => reply.data(data),
        Err(errno) => reply.error(errno),
    }
}

impl fuser::Filesystem for ScriptFs {
    fn init(&mut self, _req: &Request<'_>, _config: &mut KernelConfig) -> Result<(), c_int> {
        tracing::info!("scriptfs session started");
        Ok(())
    }

    fn destroy(&mut self) {
        tracing::info!(
            "scriptfs session ended ({} open handle(s) dropped)",
            self.handles.len()
        );
    }

    fn lookup(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        match self.child_path(parent, name) {
            Ok(path) => {
                tracing::debug!("lookup {}", path.display());
                self.entry_reply(&path, reply)
            }
            Err(errno) => reply.error(errno),
        }
    }

    fn forget(&mut self, _req: &Request<'_>, ino: u64, nlookup: u64) {
        self.inodes.forget(ino, nlookup);
    }

    fn getattr(&mut self, _req: &Request<'_>, ino: u64, _fh: Option<u64>, reply: ReplyAttr) {
        let path = match self.path(ino) {
            Ok(path) => path,
            Err(errno) => return reply.error(errno),
        };
        match self.dispatcher.getattr(&path) {
            Ok(attr) => reply.attr(&TTL, &file_attr(ino, &attr)),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn setattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        size: Option<u64>,
        atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        _fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        let path = match self.path(ino) {
            Ok(path) => path,
            Err(errno) => return reply.error(errno),
        };
        let changes = SetAttr {
            mode,
            uid,
            gid,
            size,
            atime: atime.map(system_time),
            mtime: mtime.map(system_time),
        };
        tracing::debug!("setattr {}: {:?}", path.display(), changes);
        match self.dispatcher.setattr(&path, &changes) {
            Ok(attr) => reply.attr(&TTL, &file_attr(ino, &attr)),
            Err(e) => {
                log_failure("setattr", &path, &e);
                reply.error(e.errno())
            }
        }
    }

    fn readlink(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyData) {
        use std::os::unix::ffi::OsStrExt;

        let path = match self.path(ino) {
            Ok(path) => path,
            Err(errno) => return reply.error(errno),
        };
        match self.dispatcher.readlink(&path) {
            Ok(target) => reply.data(target.as_os_str().as_bytes()),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn mkdir(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        reply: ReplyEntry,
    ) {
        let path = match self.child_path(parent, name) {
            Ok(path) => path,
            Err(errno) => return reply.error(errno),
        };
        tracing::debug!("mkdir {}", path.display());
        match self.dispatcher.mkdir(&path, mode & !umask) {
            Ok(()) => self.entry_reply(&path, reply),
            Err(e) => {
                log_failure("mkdir", &path, &e);
                reply.error(e.errno())
            }
        }
    }

    fn unlink(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let path = match self.child_path(parent, name) {
            Ok(path) => path,
            Err(errno) => return reply.error(errno),
        };
        tracing::debug!("unlink {}", path.display());
        match self.dispatcher.unlink(&path) {
            Ok(()) => {
                self.inodes.remove_by_path(&path);
                reply.ok()
            }
            Err(e) => {
                log_failure("unlink", &path, &e);
                reply.error(e.errno())
            }
        }
    }

    fn rmdir(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let path = match self.child_path(parent, name) {
            Ok(path) => path,
            Err(errno) => return reply.error(errno),
        };
        tracing::debug!("rmdir {}", path.display());
        match self.dispatcher.rmdir(&path) {
            Ok(()) => {
                self.inodes.remove_by_path(&path);
                reply.ok()
            }
            Err(e) => {
                log_failure("rmdir", &path, &e);
                reply.error(e.errno())
            }
        }
    }

    fn rename(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        flags: u32,
        reply: ReplyEmpty,
    ) {
        let (from, to) = match (
            self.child_path(parent, name),
            self.child_path(newparent, newname),
        ) {
            (Ok(from), Ok(to)) => (from, to),
            (Err(errno), _) | (_, Err(errno)) => return reply.error(errno),
        };
        tracing::debug!("rename {} -> {} (flags {:#x})", from.display(), to.display(), flags);
        match self.dispatcher.rename(&from, &to, flags) {
            Ok(()) => {
                if flags & RENAME_EXCHANGE != 0 {
                    self.inodes.exchange(&from, &to);
                } else {
                    self.inodes.rename(&from, &to);
                }
                reply.ok()
            }
            Err(e) => {
                log_failure("rename", &from, &e);
                reply.error(e.errno())
            }
        }
    }

    fn open(&mut self, req: &Request<'_>, ino: u64, flags: i32, reply: ReplyOpen) {
        let path = match self.path(ino) {
            Ok(path) => path,
            Err(errno) => return reply.error(errno),
        };

        tracing::debug!("open {} (flags {:#o}, pid {})", path.display(), flags, req.pid());
        let Some(entry) = self.dispatcher.virtual_entry(&path) else {
            return match self.dispatcher.open_real(&path, flags) {
                Ok(file) => reply.opened(self.handles.insert(file), 0),
                Err(e) => {
                    log_failure("open", &path, &e);
                    reply.error(e.errno())
                }
            };
        };

        let dispatcher = self.dispatcher.clone();
        let handles = self.handles.clone();
        let caller = Caller::process(req.pid());
        let spawned = std::thread::Builder::new()
            .name(format!("scriptfs-open-{}", ino))
            .spawn(move || {
                match dispatcher.open_virtual(&entry, flags, &caller) {
                    Ok(file) => reply.opened(handles.insert(file), FOPEN_DIRECT_IO),
                    Err(e) => {
                        tracing::warn!("Reading virtual file {} failed: {}", path.display(), e);
                        reply.error(e.errno())
                    }
                }
            });
        // A reply dropped with the closure answers EIO
        if let Err(e) = spawned {
            tracing::error!("Failed to start open worker: {}", e);
        }
    }

    fn read(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        let Some(file) = self.handles.get(fh) else {
            return reply.error(libc::EBADF);
        };
        let offset = u64::try_from(offset).unwrap_or(0);
        match file.read(offset, size as usize) {
            Ok(data) => reply.data(&data),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn write(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        let Some(file) = self.handles.get(fh) else {
            return reply.error(libc::EBADF);
        };
        let offset = u64::try_from(offset).unwrap_or(0);
        match file.write(offset, data) {
            Ok(written) => reply.written(written as u32),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn flush(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        _fh: u64,
        _lock_owner: u64,
        reply: ReplyEmpty,
    ) {
        reply.ok();
    }

    fn fsync(&mut self, _req: &Request<'_>, _ino: u64, fh: u64, datasync: bool, reply: ReplyEmpty) {
        let Some(file) = self.handles.get(fh) else {
            return reply.error(libc::EBADF);
        };
        match file.sync(datasync) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn release(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        self.handles.remove(fh);
        reply.ok();
    }

    fn opendir(&mut self, _req: &Request<'_>, ino: u64, _flags: i32, reply: ReplyOpen) {
        match self.path(ino) {
            Ok(_) => reply.opened(0, 0),
            Err(errno) => reply.error(errno),
        }
    }

    fn readdir(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        let path = match self.path(ino) {
            Ok(path) => path,
            Err(errno) => return reply.error(errno),
        };
        tracing::debug!("readdir {} from offset {}", path.display(), offset);
        let entries = match self.dispatcher.readdir(&path) {
            Ok(entries) => entries,
            Err(e) => return reply.error(e.errno()),
        };

        // Listing reports inode numbers without allocating table entries
        let parent_ino = self
            .inodes
            .get_inode(InodeTable::parent_path(&path))
            .unwrap_or(InodeTable::ROOT_INODE);
        let mut listing = vec![
            (ino, FileType::Directory, OsString::from(".")),
            (parent_ino, FileType::Directory, OsString::from("..")),
        ];
        for entry in entries {
            let child_ino = self
                .inodes
                .inode_for_listing(InodeTable::child_path(&path, &entry.name));
            listing.push((child_ino, file_type(entry.kind), entry.name));
        }

        let skip = usize::try_from(offset).unwrap_or(0);
        for (i, (entry_ino, kind, name)) in listing.into_iter().enumerate().skip(skip) {
            if reply.add(entry_ino, (i + 1) as i64, kind, name) {
                break;
            }
        }
        reply.ok();
    }

    fn releasedir(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        _fh: u64,
        _flags: i32,
        reply: ReplyEmpty,
    ) {
        reply.ok();
    }

    fn access(&mut self, _req: &Request<'_>, ino: u64, mask: i32, reply: ReplyEmpty) {
        let path = match self.path(ino) {
            Ok(path) => path,
            Err(errno) => return reply.error(errno),
        };
        match self.dispatcher.access(&path, mask) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn statfs(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyStatfs) {
        let path = self.path(ino).unwrap_or_else(|_| PathBuf::from("/"));
        match self.dispatcher.statfs(&path) {
            Ok(stat) => reply.statfs(
                stat.blocks,
                stat.blocks_free,
                stat.blocks_available,
                stat.files,
                stat.files_free,
                stat.block_size,
                stat.name_max,
                stat.fragment_size,
            ),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn create(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        flags: i32,
        reply: ReplyCreate,
    ) {
        let path = match self.child_path(parent, name) {
            Ok(path) => path,
            Err(errno) => return reply.error(errno),
        };
        tracing::debug!("create {}", path.display());
        let file = match self.dispatcher.create(&path, mode & !umask, flags) {
            Ok(file) => file,
            Err(e) => {
                log_failure("create", &path, &e);
                return reply.error(e.errno());
            }
        };
        match self.dispatcher.getattr(&path) {
            Ok(attr) => {
                let ino = self.inodes.lookup(&path);
                let fh = self.handles.insert(file);
                reply.created(&TTL, &file_attr(ino, &attr), 0, fh, 0);
            }
            Err(e) => reply.error(e.errno()),
        }
    }

    fn symlink(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        link_name: &OsStr,
        target: &Path,
        reply: ReplyEntry,
    ) {
        let path = match self.child_path(parent, link_name) {
            Ok(path) => path,
            Err(errno) => return reply.error(errno),
        };
        tracing::debug!("symlink {} -> {}", path.display(), target.display());
        match self.dispatcher.symlink(&path, target) {
            Ok(()) => self.entry_reply(&path, reply),
            Err(e) => {
                log_failure("symlink", &path, &e);
                reply.error(e.errno())
            }
        }
    }

    fn link(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        newparent: u64,
        newname: &OsStr,
        reply: ReplyEntry,
    ) {
        let (from, to) = match (self.path(ino), self.child_path(newparent, newname)) {
            (Ok(from), Ok(to)) => (from, to),
            (Err(errno), _) | (_, Err(errno)) => return reply.error(errno),
        };
        tracing::debug!("link {} -> {}", to.display(), from.display());
        match self.dispatcher.link(&from, &to) {
            Ok(()) => self.entry_reply(&to, reply),
            Err(e) => {
                log_failure("link", &to, &e);
                reply.error(e.errno())
            }
        }
    }

    fn mknod(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        rdev: u32,
        reply: ReplyEntry,
    ) {
        let path = match self.child_path(parent, name) {
            Ok(path) => path,
            Err(errno) => return reply.error(errno),
        };
        tracing::debug!("mknod {} (mode {:#o})", path.display(), mode);
        match self.dispatcher.mknod(&path, mode & !umask, u64::from(rdev)) {
            Ok(()) => self.entry_reply(&path, reply),
            Err(e) => {
                log_failure("mknod", &path, &e);
                reply.error(e.errno())
            }
        }
    }

    fn setxattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        name: &OsStr,
        value: &[u8],
        flags: i32,
        _position: u32,
        reply: ReplyEmpty,
    ) {
        let path = match self.path(ino) {
            Ok(path) => path,
            Err(errno) => return reply.error(errno),
        };
        match self.dispatcher.setxattr(&path, name, value, flags) {
            Ok(()) => reply.ok(),
            Err(e) => {
                log_failure("setxattr", &path, &e);
                reply.error(e.errno())
            }
        }
    }

    fn getxattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        name: &OsStr,
        size: u32,
        reply: ReplyXattr,
    ) {
        match self.path(ino) {
            Ok(path) => send_xattr(self.dispatcher.getxattr(&path, name), size, reply),
            Err(errno) => reply.error(errno),
        }
    }

    fn listxattr(&mut self, _req: &Request<'_>, ino: u64, size: u32, reply: ReplyXattr) {
        match self.path(ino) {
            Ok(path) => send_xattr(self.dispatcher.listxattr(&path), size, reply),
            Err(errno) => reply.error(errno),
        }
    }

    fn removexattr(&mut self, _req: &Request<'_>, ino: u64, name: &OsStr, reply: ReplyEmpty) {
        let path = match self.path(ino) {
            Ok(path) => path,
            Err(errno) => return reply.error(errno),
        };
        match self.dispatcher.removexattr(&path, name) {
            Ok(()) => reply.ok(),
            Err(e) => {
                log_failure("removexattr", &path, &e);
                reply.error(e.errno())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_type_mapping() {
        assert_eq!(file_type(EntryKind::Directory), FileType::Directory);
        assert_eq!(file_type(EntryKind::Symlink), FileType::Symlink);
        assert_eq!(file_type(EntryKind::File), FileType::RegularFile);
        assert_eq!(file_type(EntryKind::NamedPipe), FileType::NamedPipe);
        assert_eq!(file_type(EntryKind::Socket), FileType::Socket);
        assert_eq!(file_type(EntryKind::CharDevice), FileType::CharDevice);
        assert_eq!(file_type(EntryKind::BlockDevice), FileType::BlockDevice);
    }

    #[test]
    fn test_xattr_reply_sizes() {
        assert_eq!(xattr_reply(b"value", 0), Ok(XattrReply::Size(5)));
        assert_eq!(xattr_reply(b"value", 5), Ok(XattrReply::Data(&b"value"[..])));
        assert_eq!(xattr_reply(b"value", 64), Ok(XattrReply::Data(&b"value"[..])));
        assert_eq!(xattr_reply(b"value", 4), Err(libc::ERANGE));
        assert_eq!(xattr_reply(b"", 0), Ok(XattrReply::Size(0)));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_rename_exchange_flag() {
        assert_eq!(RENAME_EXCHANGE, libc::RENAME_EXCHANGE);
    }

    #[test]
    fn test_file_attr_carries_virtual_mode() {
        let now = SystemTime::now();
        let attr = Attr {
            kind: EntryKind::File,
            size: 0,
            blocks: 0,
            perm: 0o444,
            nlink: 1,
            uid: 1000,
            gid: 1000,
            rdev: 0,
            blksize: 4096,
            atime: now,
            mtime: now,
            ctime: now,
            is_virtual: true,
        };

        let fattr = file_attr(7, &attr);
        assert_eq!(fattr.ino, 7);
        assert_eq!(fattr.perm, 0o444);
        assert_eq!(fattr.kind, FileType::RegularFile);
        assert_eq!(fattr.uid, 1000);
    }
}
