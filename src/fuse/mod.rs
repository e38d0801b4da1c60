pub mod inode;

use std::ffi::OsStr;
use std::mem::ManuallyDrop;
use std::os::raw::c_int;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use fuser::{
    FileAttr, FileType as FuseFileType, Filesystem, KernelConfig, ReplyAttr, ReplyCreate,
    ReplyData, ReplyDirectory, ReplyEmpty, ReplyEntry, ReplyOpen, ReplyStatfs, ReplyWrite,
    ReplyXattr, Request, TimeOrNow,
};
use tracing::{debug, error, trace};

use crate::backend::{Backend, FileKind, Metadata, TimeSpec};
use crate::dirent::{DirCursor, DirEntry, DirSink};
use crate::error::{FsError, Result};
use crate::handle::FileHandle;
use crate::publisher::ShutdownSignal;
use crate::xattr::XattrReply;

use self::inode::{InodeTable, ROOT_INODE};

/// Generation number (not used, always 0)
const GENERATION: u64 = 0;

const DEFAULT_TTL: Duration = Duration::from_secs(1);

/// Convert our FileKind to FUSE FileType
fn to_fuse_file_type(kind: FileKind) -> FuseFileType {
    match kind {
        FileKind::Directory => FuseFileType::Directory,
        FileKind::RegularFile => FuseFileType::RegularFile,
        FileKind::Symlink => FuseFileType::Symlink,
        FileKind::NamedPipe => FuseFileType::NamedPipe,
        FileKind::CharDevice => FuseFileType::CharDevice,
        FileKind::BlockDevice => FuseFileType::BlockDevice,
        FileKind::Socket => FuseFileType::Socket,
    }
}

/// Convert Metadata to FileAttr, filling in the mounting user where the
/// backend reports no owner
fn metadata_to_attr(ino: u64, meta: &Metadata, uid: u32, gid: u32) -> FileAttr {
    FileAttr {
        ino,
        size: meta.size,
        blocks: meta.blocks,
        atime: meta.atime,
        mtime: meta.mtime,
        ctime: meta.ctime,
        crtime: meta.crtime,
        kind: to_fuse_file_type(meta.kind),
        perm: meta.perm,
        nlink: meta.nlink,
        uid: meta.uid.unwrap_or(uid),
        gid: meta.gid.unwrap_or(gid),
        rdev: meta.rdev,
        blksize: meta.blksize,
        flags: meta.flags,
    }
}

fn to_time_spec(time: TimeOrNow) -> TimeSpec {
    match time {
        TimeOrNow::Now => TimeSpec::Now,
        TimeOrNow::SpecificTime(t) => TimeSpec::At(t),
    }
}

/// Log a failed operation and return its errno
fn report(op: &str, path: &Path, e: FsError) -> c_int {
    if e.is_not_found() {
        debug!("{} {:?}: {}", op, path, e);
    } else {
        error!("{} error for {:?}: {}", op, path, e);
    }
    e.to_errno()
}

/// Adapts a kernel readdir reply to the enumeration sink
struct ReplySink<'a> {
    reply: &'a mut ReplyDirectory,
    inodes: &'a InodeTable,
    dir: &'a Path,
    dir_ino: u64,
    parent_ino: u64,
}

impl DirSink for ReplySink<'_> {
    fn push(&mut self, entry: &DirEntry) -> bool {
        let reply = &mut *self.reply;
        place_entry(
            self.inodes,
            self.dir,
            self.dir_ino,
            self.parent_ino,
            entry,
            |ino| {
                // add() reports true when the buffer is full
                !reply.add(
                    ino,
                    entry.next.raw() as i64,
                    to_fuse_file_type(entry.kind),
                    &entry.name,
                )
            },
        )
    }
}

/// Resolve an entry's inode and hand it to `add`; an inode allocated for an
/// entry that did not fit is dropped again
fn place_entry(
    inodes: &InodeTable,
    dir: &Path,
    dir_ino: u64,
    parent_ino: u64,
    entry: &DirEntry,
    add: impl FnOnce(u64) -> bool,
) -> bool {
    if entry.is_dot() {
        return add(dir_ino);
    }
    if entry.is_dotdot() {
        return add(parent_ino);
    }

    let path = dir.join(&entry.name);
    let known = inodes.get_inode(&path);
    let ino = known.unwrap_or_else(|| inodes.get_or_create_inode(&path));
    let fitted = add(ino);
    if !fitted && known.is_none() {
        inodes.remove_path(&path);
    }
    fitted
}

/// Per-mount options of the dispatcher
#[derive(Debug, Clone)]
pub struct AdapterOptions {
    /// User ID for nodes without an owner (defaults to process uid)
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    /// TTL of lookup/create/mkdir replies
    pub entry_timeout: Duration,
    /// TTL of getattr/setattr replies
    pub attr_timeout: Duration,
    /// Paths with fixed inode numbers
    pub reserved_inodes: Vec<(PathBuf, u64)>,
}

impl Default for AdapterOptions {
    fn default() -> Self {
        Self {
            uid: None,
            gid: None,
            entry_timeout: DEFAULT_TTL,
            attr_timeout: DEFAULT_TTL,
            reserved_inodes: Vec::new(),
        }
    }
}

/// FUSE filesystem implementation that delegates to a Backend
pub struct FuseAdapter {
    backend: Arc<dyn Backend>,
    inodes: InodeTable,
    /// Dedicated runtime for backend calls
    runtime: ManuallyDrop<tokio::runtime::Runtime>,
    uid: u32,
    gid: u32,
    entry_ttl: Duration,
    attr_ttl: Duration,
    /// Triggered when the kernel ends the session
    shutdown: Option<ShutdownSignal>,
}

impl FuseAdapter {
    pub fn new(backend: Arc<dyn Backend>, options: AdapterOptions) -> std::io::Result<Self> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name("fuse-backend")
            .enable_all()
            .build()?;

        let uid = options.uid.unwrap_or_else(|| unsafe { libc::getuid() });
        let gid = options.gid.unwrap_or_else(|| unsafe { libc::getgid() });

        Ok(Self {
            backend,
            inodes: InodeTable::with_reserved(
                options
                    .reserved_inodes
                    .iter()
                    .map(|(path, ino)| (path.as_path(), *ino)),
            ),
            runtime: ManuallyDrop::new(runtime),
            uid,
            gid,
            entry_ttl: options.entry_timeout,
            attr_ttl: options.attr_timeout,
            shutdown: None,
        })
    }

    /// Signal to trigger when the session is destroyed
    pub fn with_shutdown(mut self, signal: ShutdownSignal) -> Self {
        self.shutdown = Some(signal);
        self
    }

    /// Get path for inode, NotFound if the kernel sent an unknown inode
    fn inode_to_path(&self, ino: u64) -> Result<PathBuf> {
        self.inodes
            .get_path(ino)
            .ok_or_else(|| FsError::NotFound(format!("inode {}", ino)))
    }

    fn child_path(&self, parent: u64, name: &OsStr) -> Result<PathBuf> {
        Ok(self.inode_to_path(parent)?.join(name))
    }

    fn attr(&self, ino: u64, meta: &Metadata) -> FileAttr {
        metadata_to_attr(ino, meta, self.uid, self.gid)
    }

    /// Run an async operation on the dedicated runtime and wait for it
    fn run_async<F, T>(&self, future: F) -> T
    where
        F: std::future::Future<Output = T>,
    {
        self.runtime.block_on(future)
    }

    /// Register a freshly created node and reply with its entry
    fn reply_new_entry(&self, op: &str, path: &Path, reply: ReplyEntry) {
        match self.run_async(self.backend.getattr(path)) {
            Ok(meta) => {
                let ino = self.inodes.get_or_create_inode(path);
                reply.entry(&self.entry_ttl, &self.attr(ino, &meta), GENERATION);
            }
            Err(e) => reply.error(report(op, path, e)),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn apply_setattr(
        &self,
        path: &Path,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        size: Option<u64>,
        fh: Option<u64>,
        atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
        flags: Option<u32>,
    ) -> Result<Metadata> {
        let backend = &self.backend;
        self.run_async(async move {
            if let Some(mode) = mode {
                backend.chmod(path, mode & 0o7777).await?;
            }
            if uid.is_some() || gid.is_some() {
                backend.chown(path, uid, gid).await?;
            }
            if let Some(size) = size {
                backend
                    .truncate(path, fh.map(FileHandle::from_raw), size)
                    .await?;
            }
            if atime.is_some() || mtime.is_some() {
                backend
                    .set_times(path, atime.map(to_time_spec), mtime.map(to_time_spec))
                    .await?;
            }
            if let Some(flags) = flags {
                backend.chflags(path, flags).await?;
            }
            backend.getattr(path).await
        })
    }
}

impl Drop for FuseAdapter {
    fn drop(&mut self) {
        // May run on an async thread when spawn_mount2 fails
        // SAFETY: the runtime is not used after this point
        let runtime = unsafe { ManuallyDrop::take(&mut self.runtime) };
        runtime.shutdown_background();
    }
}

impl Filesystem for FuseAdapter {
    fn init(
        &mut self,
        _req: &Request<'_>,
        config: &mut KernelConfig,
    ) -> std::result::Result<(), c_int> {
        let caps = self.backend.capabilities();
        debug!("init: capabilities {:?}", caps);

        #[cfg(target_os = "macos")]
        {
            let mut wanted = 0;
            if caps.case_insensitive {
                wanted |= fuser::consts::FUSE_CASE_INSENSITIVE;
            }
            if caps.volname {
                wanted |= fuser::consts::FUSE_VOL_RENAME;
            }
            if caps.xtimes {
                wanted |= fuser::consts::FUSE_XTIMES;
            }
            if let Err(unsupported) = config.add_capabilities(wanted) {
                error!("kernel lacks capabilities {:#x}", unsupported);
            }
        }

        #[cfg(not(target_os = "macos"))]
        let _ = config;

        Ok(())
    }

    fn destroy(&mut self) {
        debug!("destroy: session ended");
        if let Some(signal) = &self.shutdown {
            signal.trigger();
        }
    }

    fn lookup(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let parent_path = match self.inode_to_path(parent) {
            Ok(p) => p,
            Err(e) => {
                reply.error(e.to_errno());
                return;
            }
        };
        let path = parent_path.join(name);
        trace!("lookup: {:?}", path);

        match self.run_async(self.backend.lookup(&parent_path, name)) {
            Ok(meta) => {
                let ino = self.inodes.get_or_create_inode(&path);
                reply.entry(&self.entry_ttl, &self.attr(ino, &meta), GENERATION);
            }
            Err(e) => reply.error(report("lookup", &path, e)),
        }
    }

    fn getattr(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyAttr) {
        let path = match self.inode_to_path(ino) {
            Ok(p) => p,
            Err(e) => {
                reply.error(e.to_errno());
                return;
            }
        };
        trace!("getattr: {:?} (ino={})", path, ino);

        match self.run_async(self.backend.getattr(&path)) {
            Ok(meta) => reply.attr(&self.attr_ttl, &self.attr(ino, &meta)),
            Err(e) => reply.error(report("getattr", &path, e)),
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
        fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        let path = match self.inode_to_path(ino) {
            Ok(p) => p,
            Err(e) => {
                reply.error(e.to_errno());
                return;
            }
        };
        debug!(
            "setattr: {:?} mode={:?} uid={:?} gid={:?} size={:?} flags={:?}",
            path, mode, uid, gid, size, flags
        );

        match self.apply_setattr(&path, mode, uid, gid, size, fh, atime, mtime, flags) {
            Ok(meta) => reply.attr(&self.attr_ttl, &self.attr(ino, &meta)),
            Err(e) => reply.error(report("setattr", &path, e)),
        }
    }

    fn readlink(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyData) {
        let path = match self.inode_to_path(ino) {
            Ok(p) => p,
            Err(e) => {
                reply.error(e.to_errno());
                return;
            }
        };
        trace!("readlink: {:?}", path);

        match self.run_async(self.backend.readlink(&path)) {
            Ok(target) => reply.data(target.as_os_str().as_bytes()),
            Err(e) => reply.error(report("readlink", &path, e)),
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
            Ok(p) => p,
            Err(e) => {
                reply.error(e.to_errno());
                return;
            }
        };
        // Keep the file-type bits, mask only permissions
        let effective_mode = mode & !(umask & 0o7777);
        debug!("mknod: {:?} mode={:o} rdev={}", path, effective_mode, rdev);

        match self.run_async(self.backend.mknod(&path, effective_mode, rdev)) {
            Ok(()) => self.reply_new_entry("mknod", &path, reply),
            Err(e) => reply.error(report("mknod", &path, e)),
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
            Ok(p) => p,
            Err(e) => {
                reply.error(e.to_errno());
                return;
            }
        };
        let effective_mode = (mode & !umask) & 0o7777;
        debug!("mkdir: {:?} mode={:o}", path, effective_mode);

        match self.run_async(self.backend.mkdir(&path, effective_mode)) {
            Ok(()) => self.reply_new_entry("mkdir", &path, reply),
            Err(e) => reply.error(report("mkdir", &path, e)),
        }
    }

    fn unlink(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let path = match self.child_path(parent, name) {
            Ok(p) => p,
            Err(e) => {
                reply.error(e.to_errno());
                return;
            }
        };
        debug!("unlink: {:?}", path);

        match self.run_async(self.backend.unlink(&path)) {
            Ok(()) => {
                self.inodes.remove_path(&path);
                reply.ok();
            }
            Err(e) => reply.error(report("unlink", &path, e)),
        }
    }

    fn rmdir(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let path = match self.child_path(parent, name) {
            Ok(p) => p,
            Err(e) => {
                reply.error(e.to_errno());
                return;
            }
        };
        debug!("rmdir: {:?}", path);

        match self.run_async(self.backend.rmdir(&path)) {
            Ok(()) => {
                self.inodes.remove_path(&path);
                reply.ok();
            }
            Err(e) => reply.error(report("rmdir", &path, e)),
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
            Ok(p) => p,
            Err(e) => {
                reply.error(e.to_errno());
                return;
            }
        };
        debug!("symlink: {:?} -> {:?}", path, target);

        match self.run_async(self.backend.symlink(target, &path)) {
            Ok(()) => self.reply_new_entry("symlink", &path, reply),
            Err(e) => reply.error(report("symlink", &path, e)),
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
        let (old_path, new_path) = match (
            self.child_path(parent, name),
            self.child_path(newparent, newname),
        ) {
            (Ok(old), Ok(new)) => (old, new),
            (Err(e), _) | (_, Err(e)) => {
                reply.error(e.to_errno());
                return;
            }
        };
        debug!("rename: {:?} -> {:?} flags={:#x}", old_path, new_path, flags);

        if flags != 0 {
            reply.error(libc::EINVAL);
            return;
        }

        match self.run_async(self.backend.rename(&old_path, &new_path)) {
            Ok(()) => {
                self.inodes.rename_path(&old_path, &new_path);
                reply.ok();
            }
            Err(e) => reply.error(report("rename", &old_path, e)),
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
        let (existing, link) = match (self.inode_to_path(ino), self.child_path(newparent, newname))
        {
            (Ok(existing), Ok(link)) => (existing, link),
            (Err(e), _) | (_, Err(e)) => {
                reply.error(e.to_errno());
                return;
            }
        };
        debug!("link: {:?} -> {:?}", link, existing);

        match self.run_async(self.backend.link(&existing, &link)) {
            Ok(()) => self.reply_new_entry("link", &link, reply),
            Err(e) => reply.error(report("link", &link, e)),
        }
    }

    fn open(&mut self, _req: &Request<'_>, ino: u64, flags: i32, reply: ReplyOpen) {
        let path = match self.inode_to_path(ino) {
            Ok(p) => p,
            Err(e) => {
                reply.error(e.to_errno());
                return;
            }
        };
        trace!("open: {:?} flags={:#x}", path, flags);

        match self.run_async(self.backend.open(&path, flags)) {
            Ok(fh) => reply.opened(fh.raw(), 0),
            Err(e) => reply.error(report("open", &path, e)),
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
            Ok(p) => p,
            Err(e) => {
                reply.error(e.to_errno());
                return;
            }
        };
        let effective_mode = (mode & !umask) & 0o7777;
        debug!("create: {:?} mode={:o} flags={:#x}", path, effective_mode, flags);

        match self.run_async(self.backend.create(&path, effective_mode, flags)) {
            Ok((meta, fh)) => {
                let ino = self.inodes.get_or_create_inode(&path);
                reply.created(
                    &self.entry_ttl,
                    &self.attr(ino, &meta),
                    GENERATION,
                    fh.raw(),
                    0,
                );
            }
            Err(e) => reply.error(report("create", &path, e)),
        }
    }

    fn read(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        trace!("read: ino={} fh={:#x} offset={} size={}", ino, fh, offset, size);
        if offset < 0 {
            reply.error(libc::EINVAL);
            return;
        }

        match self.run_async(
            self.backend
                .read(FileHandle::from_raw(fh), offset as u64, size),
        ) {
            Ok(data) => reply.data(&data),
            Err(e) => {
                error!("read error for ino {}: {}", ino, e);
                reply.error(e.to_errno());
            }
        }
    }

    fn write(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        trace!("write: ino={} fh={:#x} offset={} size={}", ino, fh, offset, data.len());
        if offset < 0 {
            reply.error(libc::EINVAL);
            return;
        }

        match self.run_async(
            self.backend
                .write(FileHandle::from_raw(fh), offset as u64, data),
        ) {
            Ok(written) => reply.written(written),
            Err(e) => {
                error!("write error for ino {}: {}", ino, e);
                reply.error(e.to_errno());
            }
        }
    }

    fn flush(&mut self, _req: &Request<'_>, ino: u64, fh: u64, _lock_owner: u64, reply: ReplyEmpty) {
        trace!("flush: ino={} fh={:#x}", ino, fh);
        match self.run_async(self.backend.flush(FileHandle::from_raw(fh))) {
            Ok(()) => reply.ok(),
            Err(e) => {
                error!("flush error for ino {}: {}", ino, e);
                reply.error(e.to_errno());
            }
        }
    }

    fn release(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        trace!("release: ino={} fh={:#x}", ino, fh);
        match self.run_async(self.backend.release(FileHandle::from_raw(fh))) {
            Ok(()) => reply.ok(),
            Err(e) => {
                error!("release error for ino {}: {}", ino, e);
                reply.error(e.to_errno());
            }
        }
    }

    fn fsync(&mut self, _req: &Request<'_>, ino: u64, fh: u64, datasync: bool, reply: ReplyEmpty) {
        trace!("fsync: ino={} fh={:#x} datasync={}", ino, fh, datasync);
        match self.run_async(self.backend.fsync(FileHandle::from_raw(fh), datasync)) {
            Ok(()) => reply.ok(),
            Err(e) => {
                error!("fsync error for ino {}: {}", ino, e);
                reply.error(e.to_errno());
            }
        }
    }

    fn opendir(&mut self, _req: &Request<'_>, ino: u64, _flags: i32, reply: ReplyOpen) {
        let path = match self.inode_to_path(ino) {
            Ok(p) => p,
            Err(e) => {
                reply.error(e.to_errno());
                return;
            }
        };
        trace!("opendir: {:?}", path);

        match self.run_async(self.backend.opendir(&path)) {
            Ok(fh) => reply.opened(fh.raw(), 0),
            Err(e) => reply.error(report("opendir", &path, e)),
        }
    }

    fn readdir(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        let path = match self.inode_to_path(ino) {
            Ok(p) => p,
            Err(e) => {
                reply.error(e.to_errno());
                return;
            }
        };
        trace!("readdir: {:?} offset={}", path, offset);

        let parent_ino = if ino == ROOT_INODE {
            ROOT_INODE
        } else {
            self.inodes.parent_inode(&path)
        };
        let mut sink = ReplySink {
            reply: &mut reply,
            inodes: &self.inodes,
            dir: &path,
            dir_ino: ino,
            parent_ino,
        };
        let cursor = DirCursor::from_raw(offset as u64);
        let result = self.run_async(
            self.backend
                .readdir(FileHandle::from_raw(fh), cursor, &mut sink),
        );

        match result {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(report("readdir", &path, e)),
        }
    }

    fn releasedir(&mut self, _req: &Request<'_>, ino: u64, fh: u64, _flags: i32, reply: ReplyEmpty) {
        trace!("releasedir: ino={} fh={:#x}", ino, fh);
        match self.run_async(self.backend.releasedir(FileHandle::from_raw(fh))) {
            Ok(()) => reply.ok(),
            Err(e) => {
                error!("releasedir error for ino {}: {}", ino, e);
                reply.error(e.to_errno());
            }
        }
    }

    fn statfs(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyStatfs) {
        let path = match self.inode_to_path(ino) {
            Ok(p) => p,
            Err(e) => {
                reply.error(e.to_errno());
                return;
            }
        };

        match self.run_async(self.backend.statfs(&path)) {
            Ok(st) => reply.statfs(
                st.blocks, st.bfree, st.bavail, st.files, st.ffree, st.bsize, st.namelen,
                st.frsize,
            ),
            // Synthetic trees have no capacity to report
            Err(FsError::NotSupported(_)) => reply.statfs(0, 0, 0, 0, 0, 512, 255, 0),
            Err(e) => reply.error(report("statfs", &path, e)),
        }
    }

    fn setxattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        name: &OsStr,
        value: &[u8],
        flags: i32,
        position: u32,
        reply: ReplyEmpty,
    ) {
        let path = match self.inode_to_path(ino) {
            Ok(p) => p,
            Err(e) => {
                reply.error(e.to_errno());
                return;
            }
        };
        debug!("setxattr: {:?} {:?} ({} bytes)", path, name, value.len());

        match self.run_async(self.backend.setxattr(&path, name, value, flags, position)) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(report("setxattr", &path, e)),
        }
    }

    fn getxattr(&mut self, _req: &Request<'_>, ino: u64, name: &OsStr, size: u32, reply: ReplyXattr) {
        let path = match self.inode_to_path(ino) {
            Ok(p) => p,
            Err(e) => {
                reply.error(e.to_errno());
                return;
            }
        };
        trace!("getxattr: {:?} {:?} size={}", path, name, size);

        match self.run_async(self.backend.getxattr(&path, name, size)) {
            Ok(XattrReply::Size(len)) => reply.size(len),
            Ok(XattrReply::Data(data)) => reply.data(&data),
            // Missing attributes are routine
            Err(e) => {
                trace!("getxattr {:?} {:?}: {}", path, name, e);
                reply.error(e.to_errno());
            }
        }
    }

    fn listxattr(&mut self, _req: &Request<'_>, ino: u64, size: u32, reply: ReplyXattr) {
        let path = match self.inode_to_path(ino) {
            Ok(p) => p,
            Err(e) => {
                reply.error(e.to_errno());
                return;
            }
        };
        trace!("listxattr: {:?} size={}", path, size);

        match self.run_async(self.backend.listxattr(&path, size)) {
            Ok(XattrReply::Size(len)) => reply.size(len),
            Ok(XattrReply::Data(data)) => reply.data(&data),
            Err(e) => reply.error(report("listxattr", &path, e)),
        }
    }

    fn removexattr(&mut self, _req: &Request<'_>, ino: u64, name: &OsStr, reply: ReplyEmpty) {
        let path = match self.inode_to_path(ino) {
            Ok(p) => p,
            Err(e) => {
                reply.error(e.to_errno());
                return;
            }
        };
        debug!("removexattr: {:?} {:?}", path, name);

        match self.run_async(self.backend.removexattr(&path, name)) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(report("removexattr", &path, e)),
        }
    }

    fn access(&mut self, _req: &Request<'_>, ino: u64, _mask: i32, reply: ReplyEmpty) {
        // Permission checks are left to the host; only existence is checked
        let path = match self.inode_to_path(ino) {
            Ok(p) => p,
            Err(e) => {
                reply.error(e.to_errno());
                return;
            }
        };

        match self.run_async(self.backend.getattr(&path)) {
            Ok(_) => reply.ok(),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    #[cfg(target_os = "macos")]
    fn setvolname(&mut self, _req: &Request<'_>, name: &OsStr, reply: ReplyEmpty) {
        debug!("setvolname: {:?}", name);
        match self.run_async(self.backend.set_volume_name(name)) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(report("setvolname", Path::new("/"), e)),
        }
    }

    #[cfg(target_os = "macos")]
    fn exchange(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        options: u64,
        reply: ReplyEmpty,
    ) {
        let (a, b) = match (
            self.child_path(parent, name),
            self.child_path(newparent, newname),
        ) {
            (Ok(a), Ok(b)) => (a, b),
            (Err(e), _) | (_, Err(e)) => {
                reply.error(e.to_errno());
                return;
            }
        };
        debug!("exchange: {:?} <-> {:?}", a, b);

        match self.run_async(self.backend.exchange(&a, &b, options)) {
            Ok(()) => {
                self.inodes.exchange_paths(&a, &b);
                reply.ok();
            }
            Err(e) => reply.error(report("exchange", &a, e)),
        }
    }

    #[cfg(target_os = "macos")]
    fn getxtimes(&mut self, _req: &Request<'_>, ino: u64, reply: fuser::ReplyXTimes) {
        let path = match self.inode_to_path(ino) {
            Ok(p) => p,
            Err(e) => {
                reply.error(e.to_errno());
                return;
            }
        };

        match self.run_async(self.backend.get_xtimes(&path)) {
            Ok((bkuptime, crtime)) => reply.xtimes(bkuptime, crtime),
            Err(e) => reply.error(report("getxtimes", &path, e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::UNIX_EPOCH;

    #[test]
    fn test_attr_defaults_owner() {
        let meta = Metadata::file(27, 0o444, UNIX_EPOCH);
        let attr = metadata_to_attr(2, &meta, 501, 20);
        assert_eq!(attr.ino, 2);
        assert_eq!(attr.uid, 501);
        assert_eq!(attr.gid, 20);
        assert_eq!(attr.perm, 0o444);
        assert_eq!(attr.kind, FuseFileType::RegularFile);
        assert_eq!(attr.size, 27);
    }

    #[test]
    fn test_attr_keeps_backend_owner() {
        let mut meta = Metadata::directory(0o755, UNIX_EPOCH);
        meta.uid = Some(0);
        meta.gid = Some(0);
        let attr = metadata_to_attr(1, &meta, 501, 20);
        assert_eq!(attr.uid, 0);
        assert_eq!(attr.gid, 0);
        assert_eq!(attr.nlink, 2);
        assert_eq!(attr.kind, FuseFileType::Directory);
    }

    #[test]
    fn test_file_kind_mapping() {
        assert_eq!(to_fuse_file_type(FileKind::Symlink), FuseFileType::Symlink);
        assert_eq!(to_fuse_file_type(FileKind::NamedPipe), FuseFileType::NamedPipe);
        assert_eq!(to_fuse_file_type(FileKind::Socket), FuseFileType::Socket);
    }

    #[test]
    fn test_time_spec_conversion() {
        assert_eq!(to_time_spec(TimeOrNow::Now), TimeSpec::Now);
        assert_eq!(
            to_time_spec(TimeOrNow::SpecificTime(UNIX_EPOCH)),
            TimeSpec::At(UNIX_EPOCH)
        );
    }

    #[test]
    fn test_adapter_reserves_inodes() {
        let backend: Arc<dyn Backend> = Arc::new(crate::backend::clock::ClockBackend::default());
        let adapter = FuseAdapter::new(
            backend,
            AdapterOptions {
                reserved_inodes: vec![(PathBuf::from("/clock.txt"), 2)],
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(adapter.inode_to_path(2).unwrap(), PathBuf::from("/clock.txt"));
        assert!(adapter.inode_to_path(99).unwrap_err().is_not_found());
    }

    fn entry(name: &str, next: u64) -> DirEntry {
        DirEntry {
            name: name.into(),
            kind: FileKind::RegularFile,
            next: DirCursor::from_raw(next),
        }
    }

    #[test]
    fn test_place_entry_keeps_inode_when_it_fits() {
        let inodes = InodeTable::new();
        let mut added = None;
        let root = Path::new("/");
        let fitted = place_entry(&inodes, root, ROOT_INODE, ROOT_INODE, &entry("a", 3), |ino| {
            added = Some(ino);
            true
        });
        assert!(fitted);
        let ino = added.unwrap();
        assert_eq!(inodes.get_inode(Path::new("/a")), Some(ino));
    }

    #[test]
    fn test_place_entry_drops_inode_when_full() {
        let inodes = InodeTable::new();
        let before = inodes.len();
        let root = Path::new("/");
        let fitted = place_entry(&inodes, root, ROOT_INODE, ROOT_INODE, &entry("a", 3), |_| false);
        assert!(!fitted);
        assert!(inodes.get_inode(Path::new("/a")).is_none());
        assert_eq!(inodes.len(), before);
    }

    #[test]
    fn test_place_entry_keeps_known_inode_when_full() {
        let inodes = InodeTable::new();
        let known = inodes.get_or_create_inode(Path::new("/d/a"));
        let dir = Path::new("/d");
        let fitted = place_entry(&inodes, dir, 7, ROOT_INODE, &entry("a", 3), |ino| {
            assert_eq!(ino, known);
            false
        });
        assert!(!fitted);
        assert_eq!(inodes.get_inode(Path::new("/d/a")), Some(known));
    }

    #[test]
    fn test_place_entry_dots_use_directory_inodes() {
        let inodes = InodeTable::new();
        let dot = DirEntry {
            name: ".".into(),
            kind: FileKind::Directory,
            next: DirCursor::AFTER_DOT,
        };
        let dotdot = DirEntry {
            name: "..".into(),
            kind: FileKind::Directory,
            next: DirCursor::AFTER_DOTDOT,
        };
        assert!(place_entry(&inodes, Path::new("/d"), 7, 1, &dot, |ino| ino == 7));
        assert!(place_entry(&inodes, Path::new("/d"), 7, 1, &dotdot, |ino| ino == 1));
        assert_eq!(inodes.len(), 1);
    }
}
