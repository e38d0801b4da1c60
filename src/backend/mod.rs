pub mod clock;
pub mod loopback;

use std::ffi::OsStr;
use std::fs;
use std::os::unix::fs::{FileTypeExt, MetadataExt};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use bytes::Bytes;

use crate::dirent::{DirCursor, DirSink};
use crate::error::{FsError, Result};
use crate::handle::FileHandle;
use crate::xattr::XattrReply;

/// Kind of a filesystem node
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    Directory,
    RegularFile,
    Symlink,
    NamedPipe,
    CharDevice,
    BlockDevice,
    Socket,
}

impl From<fs::FileType> for FileKind {
    fn from(ft: fs::FileType) -> Self {
        if ft.is_dir() {
            FileKind::Directory
        } else if ft.is_symlink() {
            FileKind::Symlink
        } else if ft.is_fifo() {
            FileKind::NamedPipe
        } else if ft.is_char_device() {
            FileKind::CharDevice
        } else if ft.is_block_device() {
            FileKind::BlockDevice
        } else if ft.is_socket() {
            FileKind::Socket
        } else {
            FileKind::RegularFile
        }
    }
}

/// Attributes of a node, recomputed on every request
#[derive(Debug, Clone)]
pub struct Metadata {
    pub kind: FileKind,
    pub size: u64,
    pub blocks: u64,
    pub atime: SystemTime,
    pub mtime: SystemTime,
    pub ctime: SystemTime,
    pub crtime: SystemTime,
    /// POSIX permission bits (lower 12 bits of st_mode)
    pub perm: u16,
    pub nlink: u32,
    /// Owner to report; None means the mounting user
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    pub rdev: u32,
    pub blksize: u32,
    pub flags: u32,
}

impl Metadata {
    fn synthetic(kind: FileKind, size: u64, perm: u16, nlink: u32, time: SystemTime) -> Self {
        Self {
            kind,
            size,
            blocks: size.div_ceil(512),
            atime: time,
            mtime: time,
            ctime: time,
            crtime: time,
            perm,
            nlink,
            uid: None,
            gid: None,
            rdev: 0,
            blksize: 4096,
            flags: 0,
        }
    }

    pub fn directory(perm: u16, time: SystemTime) -> Self {
        Self::synthetic(FileKind::Directory, 0, perm, 2, time)
    }

    pub fn file(size: u64, perm: u16, time: SystemTime) -> Self {
        Self::synthetic(FileKind::RegularFile, size, perm, 1, time)
    }

    /// Project an `lstat` result
    pub fn from_std(md: &fs::Metadata) -> Self {
        let ctime = system_time(md.ctime(), md.ctime_nsec());
        Self {
            kind: md.file_type().into(),
            size: md.size(),
            blocks: md.blocks(),
            atime: system_time(md.atime(), md.atime_nsec()),
            mtime: system_time(md.mtime(), md.mtime_nsec()),
            ctime,
            crtime: md.created().unwrap_or(ctime),
            perm: (md.mode() & 0o7777) as u16,
            nlink: md.nlink() as u32,
            uid: Some(md.uid()),
            gid: Some(md.gid()),
            rdev: md.rdev() as u32,
            blksize: md.blksize() as u32,
            flags: st_flags(md),
        }
    }

    pub fn is_dir(&self) -> bool {
        self.kind == FileKind::Directory
    }
}

#[cfg(target_os = "macos")]
fn st_flags(md: &fs::Metadata) -> u32 {
    use std::os::macos::fs::MetadataExt as _;
    md.st_flags()
}

#[cfg(not(target_os = "macos"))]
fn st_flags(_md: &fs::Metadata) -> u32 {
    0
}

/// Build a SystemTime from a (possibly pre-epoch) timespec
pub(crate) fn system_time(secs: i64, nsecs: i64) -> SystemTime {
    let nanos = Duration::from_nanos(nsecs.clamp(0, 999_999_999) as u64);
    if secs >= 0 {
        UNIX_EPOCH + Duration::from_secs(secs as u64) + nanos
    } else {
        UNIX_EPOCH - Duration::from_secs(secs.unsigned_abs()) + nanos
    }
}

/// New access/modification time for `set_times`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeSpec {
    Now,
    At(SystemTime),
}

/// Filesystem statistics
#[derive(Debug, Clone, Copy, Default)]
pub struct StatFs {
    pub blocks: u64,
    pub bfree: u64,
    pub bavail: u64,
    pub files: u64,
    pub ffree: u64,
    pub bsize: u32,
    pub namelen: u32,
    pub frsize: u32,
}

/// Optional platform features a backend has switched on
#[derive(Debug, Clone, Copy, Default)]
pub struct Capabilities {
    /// Name lookups ignore case
    pub case_insensitive: bool,
    /// Volume can be renamed
    pub volname: bool,
    /// Backup and creation times are reported
    pub xtimes: bool,
}

/// Access-mode bits of open(2) flags
pub fn access_mode(flags: i32) -> i32 {
    flags & libc::O_ACCMODE
}

/// Join a child name onto a mount-relative directory path
pub fn child_path(parent: &Path, name: &OsStr) -> PathBuf {
    parent.join(name)
}

fn unsupported<T>(op: &str) -> Result<T> {
    Err(FsError::NotSupported(format!("{op} not supported")))
}

/// Capability interface between the dispatcher and a backing store
///
/// Paths are absolute within the mount (`/` is the root). Handles returned
/// by `open`/`create`/`opendir` are valid until the matching release.
/// Operations a store does not implement report `NotSupported`.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Platform features this store has enabled
    fn capabilities(&self) -> Capabilities {
        Capabilities::default()
    }

    /// Resolve `name` inside `parent`
    ///
    /// Fails `NotFound` unless `parent` is a directory holding `name`.
    async fn lookup(&self, parent: &Path, name: &OsStr) -> Result<Metadata> {
        let parent_meta = self
            .getattr(parent)
            .await
            .map_err(|_| FsError::NotFound(parent.display().to_string()))?;
        if !parent_meta.is_dir() {
            return Err(FsError::NotFound(parent.display().to_string()));
        }
        self.getattr(&child_path(parent, name)).await
    }

    /// Get attributes of a node
    async fn getattr(&self, path: &Path) -> Result<Metadata>;

    /// Open a file; `flags` are open(2) flags
    async fn open(&self, path: &Path, flags: i32) -> Result<FileHandle>;

    /// Read up to `size` bytes at `offset`; short at end of file
    async fn read(&self, fh: FileHandle, offset: u64, size: u32) -> Result<Bytes>;

    /// Write at `offset`, returning how many bytes the store accepted
    async fn write(&self, _fh: FileHandle, _offset: u64, _data: &[u8]) -> Result<u32> {
        unsupported("write")
    }

    /// Surface deferred write errors without closing the handle
    async fn flush(&self, _fh: FileHandle) -> Result<()> {
        Ok(())
    }

    async fn fsync(&self, _fh: FileHandle, _datasync: bool) -> Result<()> {
        Ok(())
    }

    /// Close the resource behind a file handle
    async fn release(&self, fh: FileHandle) -> Result<()>;

    /// Create and open a regular file
    async fn create(
        &self,
        _path: &Path,
        _mode: u32,
        _flags: i32,
    ) -> Result<(Metadata, FileHandle)> {
        unsupported("create")
    }

    async fn opendir(&self, path: &Path) -> Result<FileHandle>;

    /// Append entries following `cursor` to `sink` until it is full
    async fn readdir(
        &self,
        fh: FileHandle,
        cursor: DirCursor,
        sink: &mut (dyn DirSink + Send),
    ) -> Result<()>;

    async fn releasedir(&self, fh: FileHandle) -> Result<()>;

    async fn readlink(&self, _path: &Path) -> Result<PathBuf> {
        unsupported("readlink")
    }

    async fn mknod(&self, _path: &Path, _mode: u32, _rdev: u32) -> Result<()> {
        unsupported("mknod")
    }

    async fn mkdir(&self, _path: &Path, _mode: u32) -> Result<()> {
        unsupported("mkdir")
    }

    async fn unlink(&self, _path: &Path) -> Result<()> {
        unsupported("unlink")
    }

    async fn rmdir(&self, _path: &Path) -> Result<()> {
        unsupported("rmdir")
    }

    /// Create `link` pointing at `target`
    async fn symlink(&self, _target: &Path, _link: &Path) -> Result<()> {
        unsupported("symlink")
    }

    async fn rename(&self, _from: &Path, _to: &Path) -> Result<()> {
        unsupported("rename")
    }

    /// Create hard link `link` to `existing`
    async fn link(&self, _existing: &Path, _link: &Path) -> Result<()> {
        unsupported("link")
    }

    async fn chmod(&self, _path: &Path, _mode: u32) -> Result<()> {
        unsupported("chmod")
    }

    async fn chown(&self, _path: &Path, _uid: Option<u32>, _gid: Option<u32>) -> Result<()> {
        unsupported("chown")
    }

    /// Change file size; uses the open handle when one is given
    async fn truncate(&self, _path: &Path, _fh: Option<FileHandle>, _size: u64) -> Result<()> {
        unsupported("truncate")
    }

    async fn set_times(
        &self,
        _path: &Path,
        _atime: Option<TimeSpec>,
        _mtime: Option<TimeSpec>,
    ) -> Result<()> {
        unsupported("set_times")
    }

    /// Set BSD file flags
    async fn chflags(&self, _path: &Path, _flags: u32) -> Result<()> {
        unsupported("chflags")
    }

    async fn statfs(&self, _path: &Path) -> Result<StatFs> {
        unsupported("statfs")
    }

    async fn setxattr(
        &self,
        _path: &Path,
        _name: &OsStr,
        _value: &[u8],
        _flags: i32,
        _position: u32,
    ) -> Result<()> {
        unsupported("setxattr")
    }

    /// Get an attribute value, or its size when `size` is 0
    async fn getxattr(&self, _path: &Path, _name: &OsStr, _size: u32) -> Result<XattrReply> {
        unsupported("getxattr")
    }

    /// List attribute names, or the list size when `size` is 0
    async fn listxattr(&self, _path: &Path, _size: u32) -> Result<XattrReply> {
        unsupported("listxattr")
    }

    async fn removexattr(&self, _path: &Path, _name: &OsStr) -> Result<()> {
        unsupported("removexattr")
    }

    async fn set_volume_name(&self, _name: &OsStr) -> Result<()> {
        unsupported("set_volume_name")
    }

    /// Atomically swap two paths
    async fn exchange(&self, _a: &Path, _b: &Path, _options: u64) -> Result<()> {
        unsupported("exchange")
    }

    /// Backup and creation times
    async fn get_xtimes(&self, _path: &Path) -> Result<(SystemTime, SystemTime)> {
        unsupported("get_xtimes")
    }
}
