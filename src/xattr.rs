//! Extended-attribute namespace virtualization
//!
//! The OS refuses to let user space set `com.apple.system.Security` because
//! the kernel populates it. The loopback mount stores it under a fixed alias
//! instead and hides the alias from listings, so callers see the reserved
//! name behave like any other attribute and never see the alias.

use std::ffi::{CString, OsStr, OsString};
use std::os::unix::ffi::OsStrExt;
use std::path::Path;

use crate::error::{FsError, Result};

/// Attribute name the OS will not accept from user space
pub const RESERVED_NAME: &str = "com.apple.system.Security";

/// Name the reserved attribute is actually stored under
#[cfg(target_os = "macos")]
pub const ALIAS_NAME: &str = "pseudo.com.apple.system.Security";

/// Name the reserved attribute is actually stored under
#[cfg(not(target_os = "macos"))]
pub const ALIAS_NAME: &str = "user.pseudo.com.apple.system.Security";

/// Option bits only the kernel may pass (XATTR_NOSECURITY | XATTR_NODEFAULT)
#[cfg(target_os = "macos")]
pub const KERNEL_ONLY_OPTIONS: i32 = 0x0008 | 0x0010;

#[cfg(not(target_os = "macos"))]
pub const KERNEL_ONLY_OPTIONS: i32 = 0;

const APPLE_PREFIX: &[u8] = b"com.apple.";

/// errno for a missing attribute
#[cfg(target_os = "linux")]
pub const ENOATTR: i32 = libc::ENODATA;

#[cfg(not(target_os = "linux"))]
pub const ENOATTR: i32 = libc::ENOATTR;

/// Reply to a size-probing xattr request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum XattrReply {
    /// Caller passed size 0 and wants the required buffer length
    Size(u32),
    Data(Vec<u8>),
}

/// Raw extended-attribute primitives of a backing store
///
/// `buf: None` asks for the required length, mirroring the OS calls.
pub trait XattrStore: Send + Sync {
    fn get(&self, path: &Path, name: &OsStr, buf: Option<&mut [u8]>) -> Result<usize>;

    fn set(&self, path: &Path, name: &OsStr, value: &[u8], flags: i32, position: u32)
        -> Result<()>;

    /// NUL-separated name list
    fn list(&self, path: &Path, buf: Option<&mut [u8]>) -> Result<usize>;

    fn remove(&self, path: &Path, name: &OsStr) -> Result<()>;
}

/// Strip option bits the OS only accepts from the kernel
pub fn sanitize_flags(name: &OsStr, flags: i32) -> i32 {
    if name.as_bytes().starts_with(APPLE_PREFIX) {
        flags & !KERNEL_ONLY_OPTIONS
    } else {
        flags
    }
}

/// Remove the first occurrence of `name` from a NUL-separated list
pub fn splice_name(list: &mut Vec<u8>, name: &OsStr) -> bool {
    let name = name.as_bytes();
    let mut start = 0;
    while start < list.len() {
        let end = list[start..]
            .iter()
            .position(|&b| b == 0)
            .map_or(list.len(), |i| start + i);
        if &list[start..end] == name {
            let stop = (end + 1).min(list.len());
            list.drain(start..stop);
            return true;
        }
        start = end + 1;
    }
    false
}

/// Xattr front end that shadows the reserved name with its alias
pub struct XattrVirtualizer<S> {
    store: S,
    reserved: OsString,
    alias: OsString,
}

impl<S: XattrStore> XattrVirtualizer<S> {
    pub fn new(store: S) -> Self {
        Self::with_names(store, RESERVED_NAME, ALIAS_NAME)
    }

    pub fn with_names(store: S, reserved: impl Into<OsString>, alias: impl Into<OsString>) -> Self {
        Self {
            store,
            reserved: reserved.into(),
            alias: alias.into(),
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    fn map_name<'a>(&'a self, name: &'a OsStr) -> &'a OsStr {
        if name == self.reserved {
            &self.alias
        } else {
            name
        }
    }

    pub fn get(&self, path: &Path, name: &OsStr, size: u32) -> Result<XattrReply> {
        let name = self.map_name(name);
        if size == 0 {
            let len = self.store.get(path, name, None)?;
            return Ok(XattrReply::Size(len as u32));
        }

        let mut buf = vec![0u8; size as usize];
        let len = self.store.get(path, name, Some(&mut buf))?;
        buf.truncate(len);
        Ok(XattrReply::Data(buf))
    }

    pub fn set(
        &self,
        path: &Path,
        name: &OsStr,
        value: &[u8],
        flags: i32,
        position: u32,
    ) -> Result<()> {
        let flags = sanitize_flags(name, flags);
        self.store
            .set(path, self.map_name(name), value, flags, position)
    }

    pub fn remove(&self, path: &Path, name: &OsStr) -> Result<()> {
        self.store.remove(path, self.map_name(name))
    }

    /// List names with the alias hidden
    ///
    /// A size probe is answered from two separate store calls (list length,
    /// then alias presence) and can miss either way if the alias appears or
    /// disappears in between. A short answer makes the caller's buffered
    /// call fail with ERANGE, after which it probes again.
    pub fn list(&self, path: &Path, size: u32) -> Result<XattrReply> {
        if size == 0 {
            let mut len = self.store.list(path, None)?;
            if len > 0 && self.store.get(path, &self.alias, None).is_ok() {
                len = len.saturating_sub(self.alias.len() + 1);
            }
            return Ok(XattrReply::Size(len as u32));
        }

        let mut names = self.read_list(path)?;
        splice_name(&mut names, &self.alias);
        if names.len() > size as usize {
            return Err(FsError::Underlying(libc::ERANGE));
        }
        Ok(XattrReply::Data(names))
    }

    /// Read the unfiltered name list, growing the buffer if it changed size
    fn read_list(&self, path: &Path) -> Result<Vec<u8>> {
        loop {
            let len = self.store.list(path, None)?;
            if len == 0 {
                return Ok(Vec::new());
            }
            let mut buf = vec![0u8; len];
            match self.store.list(path, Some(&mut buf)) {
                Ok(n) => {
                    buf.truncate(n);
                    return Ok(buf);
                }
                Err(FsError::Underlying(libc::ERANGE)) => continue,
                Err(e) => return Err(e),
            }
        }
    }
}

fn cstring(bytes: &[u8]) -> Result<CString> {
    CString::new(bytes).map_err(|_| FsError::Underlying(libc::EINVAL))
}

fn buf_parts(buf: Option<&mut [u8]>) -> (*mut libc::c_void, usize) {
    match buf {
        Some(b) => (b.as_mut_ptr().cast(), b.len()),
        None => (std::ptr::null_mut(), 0),
    }
}

fn check_len(ret: isize) -> Result<usize> {
    if ret < 0 {
        Err(FsError::last_os_error())
    } else {
        Ok(ret as usize)
    }
}

fn check_status(ret: libc::c_int) -> Result<()> {
    if ret != 0 {
        Err(FsError::last_os_error())
    } else {
        Ok(())
    }
}

/// Extended attributes of the host filesystem; never follows symlinks on
/// get, list or remove
#[derive(Debug, Default, Clone, Copy)]
pub struct OsXattrStore;

#[cfg(target_os = "linux")]
impl XattrStore for OsXattrStore {
    fn get(&self, path: &Path, name: &OsStr, buf: Option<&mut [u8]>) -> Result<usize> {
        let path = cstring(path.as_os_str().as_bytes())?;
        let name = cstring(name.as_bytes())?;
        let (ptr, len) = buf_parts(buf);
        check_len(unsafe { libc::lgetxattr(path.as_ptr(), name.as_ptr(), ptr, len) })
    }

    fn set(
        &self,
        path: &Path,
        name: &OsStr,
        value: &[u8],
        flags: i32,
        position: u32,
    ) -> Result<()> {
        // Resource-fork offsets only exist on macOS
        if position != 0 {
            return Err(FsError::Underlying(libc::EINVAL));
        }
        let path = cstring(path.as_os_str().as_bytes())?;
        let name = cstring(name.as_bytes())?;
        check_status(unsafe {
            libc::setxattr(
                path.as_ptr(),
                name.as_ptr(),
                value.as_ptr().cast(),
                value.len(),
                flags,
            )
        })
    }

    fn list(&self, path: &Path, buf: Option<&mut [u8]>) -> Result<usize> {
        let path = cstring(path.as_os_str().as_bytes())?;
        let (ptr, len) = buf_parts(buf);
        check_len(unsafe { libc::llistxattr(path.as_ptr(), ptr.cast(), len) })
    }

    fn remove(&self, path: &Path, name: &OsStr) -> Result<()> {
        let path = cstring(path.as_os_str().as_bytes())?;
        let name = cstring(name.as_bytes())?;
        check_status(unsafe { libc::lremovexattr(path.as_ptr(), name.as_ptr()) })
    }
}

#[cfg(target_os = "macos")]
impl XattrStore for OsXattrStore {
    fn get(&self, path: &Path, name: &OsStr, buf: Option<&mut [u8]>) -> Result<usize> {
        let path = cstring(path.as_os_str().as_bytes())?;
        let name = cstring(name.as_bytes())?;
        let (ptr, len) = buf_parts(buf);
        check_len(unsafe {
            libc::getxattr(
                path.as_ptr(),
                name.as_ptr(),
                ptr,
                len,
                0,
                libc::XATTR_NOFOLLOW,
            )
        })
    }

    fn set(
        &self,
        path: &Path,
        name: &OsStr,
        value: &[u8],
        flags: i32,
        position: u32,
    ) -> Result<()> {
        let path = cstring(path.as_os_str().as_bytes())?;
        let name = cstring(name.as_bytes())?;
        check_status(unsafe {
            libc::setxattr(
                path.as_ptr(),
                name.as_ptr(),
                value.as_ptr().cast(),
                value.len(),
                position,
                flags,
            )
        })
    }

    fn list(&self, path: &Path, buf: Option<&mut [u8]>) -> Result<usize> {
        let path = cstring(path.as_os_str().as_bytes())?;
        let (ptr, len) = buf_parts(buf);
        check_len(unsafe {
            libc::listxattr(path.as_ptr(), ptr.cast(), len, libc::XATTR_NOFOLLOW)
        })
    }

    fn remove(&self, path: &Path, name: &OsStr) -> Result<()> {
        let path = cstring(path.as_os_str().as_bytes())?;
        let name = cstring(name.as_bytes())?;
        check_status(unsafe {
            libc::removexattr(path.as_ptr(), name.as_ptr(), libc::XATTR_NOFOLLOW)
        })
    }
}
