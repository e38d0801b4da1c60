//! Passthrough backend mirroring a directory of the host filesystem

use std::ffi::{CStr, CString, OsStr, OsString};
use std::fs::{self, DirBuilder, File, OpenOptions, Permissions};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::{DirBuilderExt, FileExt, OpenOptionsExt, PermissionsExt};
use std::os::unix::io::{AsRawFd, IntoRawFd};
use std::path::{Component, Path, PathBuf};
use std::ptr::NonNull;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tracing::{debug, error};

use super::{
    access_mode, Backend, Capabilities, FileKind, Metadata, StatFs, TimeSpec,
};
use crate::dirent::{DirCursor, DirEnumerator, DirSink, DirSource, RawDirEntry};
use crate::error::{FsError, Result};
use crate::handle::{FileHandle, HandleTable, DEFAULT_MAX_HANDLES};
use crate::xattr::{OsXattrStore, XattrReply, XattrVirtualizer};

/// Optional behaviour of a loopback mount
#[derive(Debug, Clone, Copy)]
pub struct LoopbackOptions {
    /// Fall back to a case-insensitive match when a path component is missing
    pub case_insensitive: bool,
    pub volname: bool,
    pub xtimes: bool,
    pub max_handles: usize,
}

impl Default for LoopbackOptions {
    fn default() -> Self {
        Self {
            case_insensitive: false,
            volname: false,
            xtimes: false,
            max_handles: DEFAULT_MAX_HANDLES,
        }
    }
}

fn cpath(path: &Path) -> Result<CString> {
    CString::new(path.as_os_str().as_bytes()).map_err(|_| FsError::Underlying(libc::EINVAL))
}

fn check(ret: libc::c_int) -> Result<()> {
    if ret == -1 {
        Err(FsError::last_os_error())
    } else {
        Ok(())
    }
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn errno_location() -> *mut libc::c_int {
    unsafe { libc::__errno_location() }
}

#[cfg(any(target_os = "macos", target_os = "ios", target_os = "freebsd"))]
fn errno_location() -> *mut libc::c_int {
    unsafe { libc::__error() }
}

fn clear_errno() {
    unsafe { *errno_location() = 0 }
}

fn dirent_kind(d_type: u8) -> Option<FileKind> {
    match d_type {
        libc::DT_DIR => Some(FileKind::Directory),
        libc::DT_REG => Some(FileKind::RegularFile),
        libc::DT_LNK => Some(FileKind::Symlink),
        libc::DT_FIFO => Some(FileKind::NamedPipe),
        libc::DT_CHR => Some(FileKind::CharDevice),
        libc::DT_BLK => Some(FileKind::BlockDevice),
        libc::DT_SOCK => Some(FileKind::Socket),
        _ => None,
    }
}

/// Host directory stream (`opendir(3)` family)
pub struct OsDirStream {
    dir: NonNull<libc::DIR>,
    path: PathBuf,
    /// Cleared once `close` has run
    open: bool,
}

// The stream is only touched through `&mut self` behind the handle's mutex
unsafe impl Send for OsDirStream {}

impl OsDirStream {
    pub fn open(path: &Path) -> Result<Self> {
        let c = cpath(path)?;
        let dir = unsafe { libc::opendir(c.as_ptr()) };
        match NonNull::new(dir) {
            Some(dir) => Ok(Self {
                dir,
                path: path.to_path_buf(),
                open: true,
            }),
            None => Err(FsError::last_os_error()),
        }
    }

    /// Close the stream and report a `closedir(3)` failure
    pub fn close(mut self) -> Result<()> {
        self.open = false;
        check(unsafe { libc::closedir(self.dir.as_ptr()) })
    }

    /// Descriptor backing the stream
    pub fn fd(&self) -> libc::c_int {
        unsafe { libc::dirfd(self.dir.as_ptr()) }
    }
}

impl DirSource for OsDirStream {
    fn rewind(&mut self) -> Result<()> {
        unsafe { libc::rewinddir(self.dir.as_ptr()) };
        Ok(())
    }

    fn seek(&mut self, pos: u64) -> Result<()> {
        unsafe { libc::seekdir(self.dir.as_ptr(), pos as libc::c_long) };
        Ok(())
    }

    fn tell(&mut self) -> Result<u64> {
        let pos = unsafe { libc::telldir(self.dir.as_ptr()) };
        if pos == -1 {
            return Err(FsError::last_os_error());
        }
        Ok(pos as u64)
    }

    fn next_entry(&mut self) -> Result<Option<RawDirEntry>> {
        // readdir signals errors only through errno
        clear_errno();
        let dent = unsafe { libc::readdir(self.dir.as_ptr()) };
        if dent.is_null() {
            let errno = unsafe { *errno_location() };
            return if errno == 0 {
                Ok(None)
            } else {
                Err(FsError::Underlying(errno))
            };
        }

        let (name, d_type) = unsafe {
            let name = CStr::from_ptr((*dent).d_name.as_ptr());
            (OsStr::from_bytes(name.to_bytes()).to_os_string(), (*dent).d_type)
        };
        let kind = match dirent_kind(d_type) {
            Some(kind) => kind,
            None => fs::symlink_metadata(self.path.join(&name))
                .map(|md| md.file_type().into())
                .unwrap_or(FileKind::RegularFile),
        };
        Ok(Some(RawDirEntry { name, kind }))
    }
}

impl Drop for OsDirStream {
    fn drop(&mut self) {
        if !self.open {
            return;
        }
        if unsafe { libc::closedir(self.dir.as_ptr()) } == -1 {
            error!(
                "closedir failed for {}: {}",
                self.path.display(),
                std::io::Error::last_os_error()
            );
        }
    }
}

enum LoopbackHandle {
    File(File),
    Dir(Mutex<DirEnumerator<OsDirStream>>),
}

pub struct LoopbackBackend {
    root: PathBuf,
    options: LoopbackOptions,
    handles: HandleTable<LoopbackHandle>,
    xattrs: XattrVirtualizer<OsXattrStore>,
}

impl LoopbackBackend {
    pub fn new(root: impl Into<PathBuf>, options: LoopbackOptions) -> Self {
        Self {
            root: root.into(),
            handles: HandleTable::with_limit(options.max_handles),
            options,
            xattrs: XattrVirtualizer::new(OsXattrStore),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Number of file and directory handles currently open
    pub fn open_handles(&self) -> usize {
        self.handles.len()
    }

    /// Map a mount path onto the backing tree
    pub fn resolve(&self, path: &Path) -> PathBuf {
        let mut resolved = self.root.clone();
        for component in path.components() {
            let Component::Normal(name) = component else {
                continue;
            };
            let exact = resolved.join(name);
            if !self.options.case_insensitive || fs::symlink_metadata(&exact).is_ok() {
                resolved = exact;
                continue;
            }
            resolved = match Self::find_ignoring_case(&resolved, name) {
                Some(found) => resolved.join(found),
                None => exact,
            };
        }
        resolved
    }

    fn find_ignoring_case(dir: &Path, name: &OsStr) -> Option<OsString> {
        fs::read_dir(dir)
            .ok()?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.file_name())
            .find(|candidate| candidate.eq_ignore_ascii_case(name))
    }

    /// Run `f` on the file behind a handle
    fn with_file<R>(&self, fh: FileHandle, f: impl FnOnce(&File) -> Result<R>) -> Result<R> {
        let handle = self.handles.get(fh)?;
        match &*handle {
            LoopbackHandle::File(file) => f(file),
            LoopbackHandle::Dir(_) => {
                Err(FsError::IsADirectory(format!("handle {:#x}", fh.raw())))
            }
        }
    }

    fn open_options(flags: i32) -> OpenOptions {
        let mut options = OpenOptions::new();
        match access_mode(flags) {
            libc::O_WRONLY => options.write(true),
            libc::O_RDWR => options.read(true).write(true),
            _ => options.read(true),
        };
        options.custom_flags(flags & !libc::O_ACCMODE);
        options
    }

    /// Close a descriptor and report the close(2) result
    fn close(handle: Arc<LoopbackHandle>) -> Result<()> {
        match Arc::try_unwrap(handle) {
            Ok(LoopbackHandle::File(file)) => check(unsafe { libc::close(file.into_raw_fd()) }),
            Ok(LoopbackHandle::Dir(enumerator)) => {
                enumerator.into_inner().into_source().close()
            }
            // Still in use by a concurrent request; closed when that finishes
            Err(_) => {
                debug!("deferring close of handle still in use");
                Ok(())
            }
        }
    }
}

fn timespec(time: Option<TimeSpec>) -> libc::timespec {
    let (tv_sec, tv_nsec) = match time {
        None => (0, libc::UTIME_OMIT),
        Some(TimeSpec::Now) => (0, libc::UTIME_NOW),
        Some(TimeSpec::At(t)) => match t.duration_since(UNIX_EPOCH) {
            Ok(d) => (d.as_secs() as libc::time_t, d.subsec_nanos() as _),
            Err(e) => {
                let d = e.duration();
                let mut secs = -(d.as_secs() as libc::time_t);
                let mut nanos = d.subsec_nanos() as i64;
                if nanos > 0 {
                    secs -= 1;
                    nanos = 1_000_000_000 - nanos;
                }
                (secs, nanos as _)
            }
        },
    };
    libc::timespec { tv_sec, tv_nsec }
}

#[async_trait]
impl Backend for LoopbackBackend {
    fn capabilities(&self) -> Capabilities {
        Capabilities {
            case_insensitive: self.options.case_insensitive,
            volname: self.options.volname,
            xtimes: self.options.xtimes,
        }
    }

    async fn getattr(&self, path: &Path) -> Result<Metadata> {
        let md = fs::symlink_metadata(self.resolve(path))?;
        Ok(Metadata::from_std(&md))
    }

    async fn open(&self, path: &Path, flags: i32) -> Result<FileHandle> {
        let resolved = self.resolve(path);
        let file = Self::open_options(flags).open(&resolved)?;
        if file.metadata()?.is_dir() {
            return Err(FsError::IsADirectory(resolved.display().to_string()));
        }
        self.handles.insert(LoopbackHandle::File(file))
    }

    async fn read(&self, fh: FileHandle, offset: u64, size: u32) -> Result<Bytes> {
        self.with_file(fh, |file| {
            let mut buf = vec![0u8; size as usize];
            let mut filled = 0;
            while filled < buf.len() {
                match file.read_at(&mut buf[filled..], offset + filled as u64) {
                    Ok(0) => break,
                    Ok(n) => filled += n,
                    Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                    Err(e) => return Err(e.into()),
                }
            }
            buf.truncate(filled);
            Ok(Bytes::from(buf))
        })
    }

    async fn write(&self, fh: FileHandle, offset: u64, data: &[u8]) -> Result<u32> {
        self.with_file(fh, |file| Ok(file.write_at(data, offset)? as u32))
    }

    async fn flush(&self, fh: FileHandle) -> Result<()> {
        self.with_file(fh, |file| {
            // Closing a duplicate surfaces deferred write errors (e.g. NFS)
            let dup = unsafe { libc::dup(file.as_raw_fd()) };
            if dup == -1 {
                return Err(FsError::last_os_error());
            }
            check(unsafe { libc::close(dup) })
        })
    }

    async fn fsync(&self, fh: FileHandle, datasync: bool) -> Result<()> {
        self.with_file(fh, |file| {
            if datasync {
                file.sync_data()?;
            } else {
                file.sync_all()?;
            }
            Ok(())
        })
    }

    async fn release(&self, fh: FileHandle) -> Result<()> {
        let handle = self.handles.remove(fh)?;
        Self::close(handle)
    }

    async fn create(&self, path: &Path, mode: u32, flags: i32) -> Result<(Metadata, FileHandle)> {
        let file = Self::open_options(flags | libc::O_CREAT)
            .mode(mode)
            .open(self.resolve(path))?;
        let md = Metadata::from_std(&file.metadata()?);
        let fh = self.handles.insert(LoopbackHandle::File(file))?;
        Ok((md, fh))
    }

    async fn opendir(&self, path: &Path) -> Result<FileHandle> {
        let stream = OsDirStream::open(&self.resolve(path))?;
        self.handles
            .insert(LoopbackHandle::Dir(Mutex::new(DirEnumerator::new(stream))))
    }

    async fn readdir(
        &self,
        fh: FileHandle,
        cursor: DirCursor,
        sink: &mut (dyn DirSink + Send),
    ) -> Result<()> {
        let handle = self.handles.get(fh)?;
        match &*handle {
            LoopbackHandle::Dir(enumerator) => enumerator.lock().fill(cursor, sink),
            LoopbackHandle::File(_) => {
                Err(FsError::NotADirectory(format!("handle {:#x}", fh.raw())))
            }
        }
    }

    async fn releasedir(&self, fh: FileHandle) -> Result<()> {
        let handle = self.handles.remove(fh)?;
        Self::close(handle)
    }

    async fn readlink(&self, path: &Path) -> Result<PathBuf> {
        Ok(fs::read_link(self.resolve(path))?)
    }

    async fn mknod(&self, path: &Path, mode: u32, rdev: u32) -> Result<()> {
        let c = cpath(&self.resolve(path))?;
        if (mode & libc::S_IFMT as u32) == libc::S_IFIFO as u32 {
            check(unsafe { libc::mkfifo(c.as_ptr(), (mode & 0o7777) as libc::mode_t) })
        } else {
            check(unsafe { libc::mknod(c.as_ptr(), mode as libc::mode_t, rdev as libc::dev_t) })
        }
    }

    async fn mkdir(&self, path: &Path, mode: u32) -> Result<()> {
        DirBuilder::new().mode(mode).create(self.resolve(path))?;
        Ok(())
    }

    async fn unlink(&self, path: &Path) -> Result<()> {
        Ok(fs::remove_file(self.resolve(path))?)
    }

    async fn rmdir(&self, path: &Path) -> Result<()> {
        Ok(fs::remove_dir(self.resolve(path))?)
    }

    async fn symlink(&self, target: &Path, link: &Path) -> Result<()> {
        // The target is stored verbatim, not mapped into the backing tree
        Ok(std::os::unix::fs::symlink(target, self.resolve(link))?)
    }

    async fn rename(&self, from: &Path, to: &Path) -> Result<()> {
        Ok(fs::rename(self.resolve(from), self.resolve(to))?)
    }

    async fn link(&self, existing: &Path, link: &Path) -> Result<()> {
        Ok(fs::hard_link(self.resolve(existing), self.resolve(link))?)
    }

    async fn chmod(&self, path: &Path, mode: u32) -> Result<()> {
        Ok(fs::set_permissions(
            self.resolve(path),
            Permissions::from_mode(mode & 0o7777),
        )?)
    }

    async fn chown(&self, path: &Path, uid: Option<u32>, gid: Option<u32>) -> Result<()> {
        Ok(std::os::unix::fs::chown(self.resolve(path), uid, gid)?)
    }

    async fn truncate(&self, path: &Path, fh: Option<FileHandle>, size: u64) -> Result<()> {
        if let Some(fh) = fh {
            return self.with_file(fh, |file| Ok(file.set_len(size)?));
        }
        let c = cpath(&self.resolve(path))?;
        check(unsafe { libc::truncate(c.as_ptr(), size as libc::off_t) })
    }

    async fn set_times(
        &self,
        path: &Path,
        atime: Option<TimeSpec>,
        mtime: Option<TimeSpec>,
    ) -> Result<()> {
        let c = cpath(&self.resolve(path))?;
        let times = [timespec(atime), timespec(mtime)];
        check(unsafe { libc::utimensat(libc::AT_FDCWD, c.as_ptr(), times.as_ptr(), 0) })
    }

    #[cfg(target_os = "macos")]
    async fn chflags(&self, path: &Path, flags: u32) -> Result<()> {
        let c = cpath(&self.resolve(path))?;
        check(unsafe { libc::chflags(c.as_ptr(), flags as libc::c_uint) })
    }

    async fn statfs(&self, path: &Path) -> Result<StatFs> {
        let c = cpath(&self.resolve(path))?;
        let mut st: libc::statvfs = unsafe { std::mem::zeroed() };
        check(unsafe { libc::statvfs(c.as_ptr(), &mut st) })?;
        Ok(StatFs {
            blocks: st.f_blocks as u64,
            bfree: st.f_bfree as u64,
            bavail: st.f_bavail as u64,
            files: st.f_files as u64,
            ffree: st.f_ffree as u64,
            bsize: st.f_bsize as u32,
            namelen: st.f_namemax as u32,
            frsize: st.f_frsize as u32,
        })
    }

    async fn setxattr(
        &self,
        path: &Path,
        name: &OsStr,
        value: &[u8],
        flags: i32,
        position: u32,
    ) -> Result<()> {
        self.xattrs
            .set(&self.resolve(path), name, value, flags, position)
    }

    async fn getxattr(&self, path: &Path, name: &OsStr, size: u32) -> Result<XattrReply> {
        self.xattrs.get(&self.resolve(path), name, size)
    }

    async fn listxattr(&self, path: &Path, size: u32) -> Result<XattrReply> {
        self.xattrs.list(&self.resolve(path), size)
    }

    async fn removexattr(&self, path: &Path, name: &OsStr) -> Result<()> {
        self.xattrs.remove(&self.resolve(path), name)
    }

    async fn set_volume_name(&self, name: &OsStr) -> Result<()> {
        if !self.options.volname {
            return Err(FsError::Unavailable("volume renaming is disabled".into()));
        }
        debug!("volume name set to {:?}", name);
        Ok(())
    }

    async fn exchange(&self, a: &Path, b: &Path, options: u64) -> Result<()> {
        if options >> 32 != 0 {
            debug!("exchange options {:#x} truncated to 32 bits", options);
        }
        let a = cpath(&self.resolve(a))?;
        let b = cpath(&self.resolve(b))?;
        swap_paths(&a, &b)
    }

    async fn get_xtimes(&self, path: &Path) -> Result<(SystemTime, SystemTime)> {
        if !self.options.xtimes {
            return Err(FsError::Unavailable("extended times are disabled".into()));
        }
        let md = self.getattr(path).await?;
        // No backup time is tracked by the host
        Ok((UNIX_EPOCH, md.crtime))
    }
}

#[cfg(target_os = "linux")]
fn swap_paths(a: &CStr, b: &CStr) -> Result<()> {
    check(unsafe {
        libc::renameat2(
            libc::AT_FDCWD,
            a.as_ptr(),
            libc::AT_FDCWD,
            b.as_ptr(),
            libc::RENAME_EXCHANGE,
        )
    })
}

#[cfg(target_os = "macos")]
fn swap_paths(a: &CStr, b: &CStr) -> Result<()> {
    check(unsafe { libc::renamex_np(a.as_ptr(), b.as_ptr(), libc::RENAME_SWAP) })
}

#[cfg(not(any(target_os = "linux", target_os = "macos")))]
fn swap_paths(_a: &CStr, _b: &CStr) -> Result<()> {
    Err(FsError::NotSupported("exchange not supported".into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dirent::DirBuffer;

    fn backend(options: LoopbackOptions) -> (tempfile::TempDir, LoopbackBackend) {
        let dir = tempfile::tempdir().unwrap();
        let lb = LoopbackBackend::new(dir.path(), options);
        (dir, lb)
    }

    #[test]
    fn test_resolve_maps_into_root() {
        let (dir, lb) = backend(LoopbackOptions::default());
        assert_eq!(lb.resolve(Path::new("/")), dir.path());
        assert_eq!(lb.resolve(Path::new("/a/b")), dir.path().join("a/b"));
    }

    #[test]
    fn test_resolve_case_insensitive() {
        let (dir, lb) = backend(LoopbackOptions {
            case_insensitive: true,
            ..Default::default()
        });
        fs::create_dir(dir.path().join("Docs")).unwrap();
        fs::write(dir.path().join("Docs/ReadMe.md"), b"x").unwrap();

        assert_eq!(
            lb.resolve(Path::new("/docs/README.MD")),
            dir.path().join("Docs/ReadMe.md")
        );
        // Missing names resolve literally so create() lands where asked
        assert_eq!(
            lb.resolve(Path::new("/docs/new.txt")),
            dir.path().join("Docs/new.txt")
        );
    }

    #[test]
    fn test_resolve_case_sensitive_by_default() {
        let (dir, lb) = backend(LoopbackOptions::default());
        fs::create_dir(dir.path().join("Docs")).unwrap();
        assert_eq!(lb.resolve(Path::new("/docs")), dir.path().join("docs"));
    }

    #[tokio::test]
    async fn test_create_write_read() {
        let (_dir, lb) = backend(LoopbackOptions::default());
        let (md, fh) = lb
            .create(Path::new("/new.txt"), 0o644, libc::O_RDWR)
            .await
            .unwrap();
        assert_eq!(md.kind, FileKind::RegularFile);
        assert_eq!(md.size, 0);

        assert_eq!(lb.write(fh, 0, b"hello world").await.unwrap(), 11);
        lb.flush(fh).await.unwrap();
        lb.fsync(fh, true).await.unwrap();
        assert_eq!(&lb.read(fh, 6, 100).await.unwrap()[..], b"world");
        assert!(lb.read(fh, 50, 10).await.unwrap().is_empty());
        lb.release(fh).await.unwrap();
        assert_eq!(lb.open_handles(), 0);
    }

    #[tokio::test]
    async fn test_read_on_dir_handle() {
        let (_dir, lb) = backend(LoopbackOptions::default());
        let dh = lb.opendir(Path::new("/")).await.unwrap();
        assert!(matches!(lb.read(dh, 0, 1).await, Err(FsError::IsADirectory(_))));
        lb.releasedir(dh).await.unwrap();
    }

    #[tokio::test]
    async fn test_open_directory_is_refused() {
        let (dir, lb) = backend(LoopbackOptions::default());
        fs::create_dir(dir.path().join("sub")).unwrap();

        for path in ["/", "/sub"] {
            let err = lb.open(Path::new(path), libc::O_RDONLY).await.unwrap_err();
            assert!(matches!(err, FsError::IsADirectory(_)), "{}: {}", path, err);
            assert_eq!(err.to_errno(), libc::EISDIR);
        }
        assert_eq!(lb.open_handles(), 0);
    }

    #[test]
    fn test_dir_stream_close() {
        let dir = tempfile::tempdir().unwrap();
        let stream = OsDirStream::open(dir.path()).unwrap();
        assert!(stream.fd() >= 0);
        stream.close().unwrap();
    }

    #[tokio::test]
    async fn test_releasedir_reports_close_failure() {
        let (_dir, lb) = backend(LoopbackOptions::default());
        let dh = lb.opendir(Path::new("/")).await.unwrap();

        // Pull the descriptor out from under the stream so closedir fails
        {
            let handle = lb.handles.get(dh).unwrap();
            let LoopbackHandle::Dir(enumerator) = &*handle else {
                panic!("expected a directory handle");
            };
            let fd = enumerator.lock().source().fd();
            assert_eq!(unsafe { libc::close(fd) }, 0);
        }

        let err = lb.releasedir(dh).await.unwrap_err();
        assert_eq!(err.to_errno(), libc::EBADF);
        // The slot is gone even though closing failed
        assert_eq!(lb.open_handles(), 0);
        assert!(matches!(
            lb.releasedir(dh).await,
            Err(FsError::BadHandle(_))
        ));
    }

    #[tokio::test]
    async fn test_readdir_skips_backing_dots() {
        let (dir, lb) = backend(LoopbackOptions::default());
        fs::write(dir.path().join("a"), b"").unwrap();
        fs::create_dir(dir.path().join("sub")).unwrap();

        let dh = lb.opendir(Path::new("/")).await.unwrap();
        let mut buf = DirBuffer::new(4096);
        lb.readdir(dh, DirCursor::START, &mut buf).await.unwrap();
        lb.releasedir(dh).await.unwrap();

        let mut names: Vec<_> = buf.entries().iter().map(|e| e.name.clone()).collect();
        assert_eq!(&names[..2], &[OsString::from("."), OsString::from("..")]);
        names.drain(..2);
        names.sort();
        assert_eq!(names, vec![OsString::from("a"), OsString::from("sub")]);

        let sub = buf.entries().iter().find(|e| e.name == "sub").unwrap();
        assert_eq!(sub.kind, FileKind::Directory);
    }

    #[tokio::test]
    async fn test_namespace_operations() {
        let (dir, lb) = backend(LoopbackOptions::default());
        lb.mkdir(Path::new("/d"), 0o750).await.unwrap();
        assert!(lb.getattr(Path::new("/d")).await.unwrap().is_dir());

        fs::write(dir.path().join("d/f"), b"abc").unwrap();
        lb.rename(Path::new("/d/f"), Path::new("/g")).await.unwrap();
        lb.link(Path::new("/g"), Path::new("/h")).await.unwrap();
        assert_eq!(lb.getattr(Path::new("/g")).await.unwrap().nlink, 2);

        lb.symlink(Path::new("g"), Path::new("/s")).await.unwrap();
        assert_eq!(lb.readlink(Path::new("/s")).await.unwrap(), PathBuf::from("g"));
        assert_eq!(
            lb.getattr(Path::new("/s")).await.unwrap().kind,
            FileKind::Symlink
        );

        lb.truncate(Path::new("/g"), None, 1).await.unwrap();
        assert_eq!(lb.getattr(Path::new("/h")).await.unwrap().size, 1);

        lb.chmod(Path::new("/g"), 0o600).await.unwrap();
        assert_eq!(lb.getattr(Path::new("/g")).await.unwrap().perm, 0o600);

        lb.unlink(Path::new("/s")).await.unwrap();
        lb.unlink(Path::new("/h")).await.unwrap();
        lb.rmdir(Path::new("/d")).await.unwrap();
        assert!(lb.getattr(Path::new("/d")).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_mknod_fifo() {
        let (_dir, lb) = backend(LoopbackOptions::default());
        lb.mknod(Path::new("/p"), libc::S_IFIFO as u32 | 0o644, 0)
            .await
            .unwrap();
        assert_eq!(
            lb.getattr(Path::new("/p")).await.unwrap().kind,
            FileKind::NamedPipe
        );
    }

    #[tokio::test]
    async fn test_set_times() {
        let (dir, lb) = backend(LoopbackOptions::default());
        fs::write(dir.path().join("t"), b"").unwrap();
        let when = UNIX_EPOCH + std::time::Duration::from_secs(1_000_000);
        lb.set_times(Path::new("/t"), None, Some(TimeSpec::At(when)))
            .await
            .unwrap();
        assert_eq!(lb.getattr(Path::new("/t")).await.unwrap().mtime, when);
    }

    #[tokio::test]
    async fn test_statfs() {
        let (_dir, lb) = backend(LoopbackOptions::default());
        let st = lb.statfs(Path::new("/")).await.unwrap();
        assert!(st.bsize > 0);
        assert!(st.namelen > 0);
    }

    #[tokio::test]
    async fn test_platform_features_disabled() {
        let (_dir, lb) = backend(LoopbackOptions::default());
        assert!(matches!(
            lb.set_volume_name(OsStr::new("vol")).await,
            Err(FsError::Unavailable(_))
        ));
        assert!(matches!(
            lb.get_xtimes(Path::new("/")).await,
            Err(FsError::Unavailable(_))
        ));

        let (_dir, lb) = backend(LoopbackOptions {
            volname: true,
            xtimes: true,
            ..Default::default()
        });
        lb.set_volume_name(OsStr::new("vol")).await.unwrap();
        let (bkuptime, _crtime) = lb.get_xtimes(Path::new("/")).await.unwrap();
        assert_eq!(bkuptime, UNIX_EPOCH);
    }

    #[tokio::test]
    async fn test_handle_limit() {
        let (dir, lb) = backend(LoopbackOptions {
            max_handles: 1,
            ..Default::default()
        });
        fs::write(dir.path().join("f"), b"").unwrap();
        let fh = lb.open(Path::new("/f"), libc::O_RDONLY).await.unwrap();
        assert!(matches!(
            lb.open(Path::new("/f"), libc::O_RDONLY).await,
            Err(FsError::OutOfMemory)
        ));
        lb.release(fh).await.unwrap();
        assert!(matches!(lb.release(fh).await, Err(FsError::BadHandle(_))));
    }

    #[test]
    fn test_timespec_encoding() {
        let ts = timespec(None);
        assert_eq!(ts.tv_nsec, libc::UTIME_OMIT);
        let ts = timespec(Some(TimeSpec::Now));
        assert_eq!(ts.tv_nsec, libc::UTIME_NOW);
        let ts = timespec(Some(TimeSpec::At(
            UNIX_EPOCH - std::time::Duration::from_millis(1500),
        )));
        assert_eq!(ts.tv_sec, -2);
        assert_eq!(ts.tv_nsec, 500_000_000);
    }
}
