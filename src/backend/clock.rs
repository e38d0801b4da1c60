//! Synthetic single-file tree whose file holds the current time

use std::ffi::{OsStr, OsString};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tracing::warn;

use super::{access_mode, Backend, FileKind, Metadata};
use crate::dirent::{DirCursor, DirEnumerator, DirSink, RawDirEntry, VecDirSource};
use crate::error::{FsError, Result};
use crate::handle::{FileHandle, HandleTable};
use crate::publisher::ContentBuffer;

/// Fixed inode of the clock file
pub const CLOCK_INODE: u64 = 2;

pub const DEFAULT_FILE_NAME: &str = "clock.txt";

const ROOT_PERM: u16 = 0o755;
const FILE_PERM: u16 = 0o444;

enum ClockHandle {
    File,
    Dir(Mutex<DirEnumerator<VecDirSource>>),
}

pub struct ClockBackend {
    file_name: OsString,
    content: Arc<ContentBuffer>,
    handles: HandleTable<ClockHandle>,
    mounted_at: SystemTime,
}

impl ClockBackend {
    pub fn new(file_name: impl Into<OsString>) -> Self {
        let content = Arc::new(ContentBuffer::new());
        content.publish_now();
        Self {
            file_name: file_name.into(),
            content,
            handles: HandleTable::new(),
            mounted_at: SystemTime::now(),
        }
    }

    /// Buffer the publisher writes into
    pub fn content(&self) -> Arc<ContentBuffer> {
        Arc::clone(&self.content)
    }

    pub fn file_name(&self) -> &OsStr {
        &self.file_name
    }

    /// Mount-relative path of the clock file
    pub fn file_path(&self) -> PathBuf {
        Path::new("/").join(&self.file_name)
    }

    fn is_root(path: &Path) -> bool {
        path == Path::new("/")
    }

    fn is_file(&self, path: &Path) -> bool {
        path.parent() == Some(Path::new("/"))
            && path.file_name() == Some(self.file_name.as_os_str())
    }

    fn file_metadata(&self) -> Metadata {
        let snapshot = self.content.snapshot();
        Metadata::file(snapshot.data.len() as u64, FILE_PERM, snapshot.modified)
    }

    fn not_found(path: &Path) -> FsError {
        FsError::NotFound(path.display().to_string())
    }
}

impl Default for ClockBackend {
    fn default() -> Self {
        Self::new(DEFAULT_FILE_NAME)
    }
}

#[async_trait]
impl Backend for ClockBackend {
    async fn lookup(&self, parent: &Path, name: &OsStr) -> Result<Metadata> {
        if Self::is_root(parent) && name == self.file_name {
            Ok(self.file_metadata())
        } else {
            Err(Self::not_found(&parent.join(name)))
        }
    }

    async fn getattr(&self, path: &Path) -> Result<Metadata> {
        if Self::is_root(path) {
            Ok(Metadata::directory(ROOT_PERM, self.mounted_at))
        } else if self.is_file(path) {
            Ok(self.file_metadata())
        } else {
            Err(Self::not_found(path))
        }
    }

    async fn open(&self, path: &Path, flags: i32) -> Result<FileHandle> {
        if Self::is_root(path) {
            return Err(FsError::IsADirectory(path.display().to_string()));
        }
        if !self.is_file(path) {
            return Err(Self::not_found(path));
        }
        if access_mode(flags) != libc::O_RDONLY {
            return Err(FsError::PermissionDenied(format!(
                "{} is read-only",
                path.display()
            )));
        }
        self.handles.insert(ClockHandle::File)
    }

    async fn read(&self, fh: FileHandle, offset: u64, size: u32) -> Result<Bytes> {
        match *self.handles.get(fh)? {
            ClockHandle::File => {}
            ClockHandle::Dir(_) => {
                return Err(FsError::IsADirectory(format!("handle {:#x}", fh.raw())))
            }
        }

        let data = self.content.snapshot().data;
        let len = data.len() as u64;
        if offset >= len {
            warn!("read at offset {} past end of clock file ({} bytes)", offset, len);
            return Ok(Bytes::new());
        }
        let end = offset.saturating_add(size as u64).min(len);
        Ok(data.slice(offset as usize..end as usize))
    }

    async fn release(&self, fh: FileHandle) -> Result<()> {
        self.handles.remove(fh).map(|_| ())
    }

    async fn opendir(&self, path: &Path) -> Result<FileHandle> {
        if self.is_file(path) {
            return Err(FsError::NotADirectory(path.display().to_string()));
        }
        if !Self::is_root(path) {
            return Err(Self::not_found(path));
        }
        let listing = VecDirSource::new(vec![RawDirEntry::new(
            self.file_name.clone(),
            FileKind::RegularFile,
        )]);
        self.handles
            .insert(ClockHandle::Dir(Mutex::new(DirEnumerator::new(listing))))
    }

    async fn readdir(
        &self,
        fh: FileHandle,
        cursor: DirCursor,
        sink: &mut (dyn DirSink + Send),
    ) -> Result<()> {
        let handle = self.handles.get(fh)?;
        match &*handle {
            ClockHandle::Dir(enumerator) => enumerator.lock().fill(cursor, sink),
            ClockHandle::File => {
                Err(FsError::NotADirectory(format!("handle {:#x}", fh.raw())))
            }
        }
    }

    async fn releasedir(&self, fh: FileHandle) -> Result<()> {
        self.handles.remove(fh).map(|_| ())
    }
}
