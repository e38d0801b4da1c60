//! Loopback backend tests against a real host directory
//!
//! Covers:
//! - Entry and attribute resolution
//! - Handle lifecycle
//! - Paginated directory listing with small buffers
//! - Extended attributes (skipped where the host filesystem lacks them)

use std::collections::HashSet;
use std::ffi::{OsStr, OsString};
use std::fs;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use tempfile::TempDir;
use vfs_adapter::backend::loopback::{LoopbackBackend, LoopbackOptions};
use vfs_adapter::backend::{Backend, FileKind};
use vfs_adapter::dirent::{DirBuffer, DirCursor};
use vfs_adapter::xattr::{XattrReply, ALIAS_NAME, RESERVED_NAME};
use vfs_adapter::FsError;

fn xattrs_unsupported(e: &FsError) -> bool {
    e.to_errno() == libc::ENOTSUP || e.to_errno() == libc::EOPNOTSUPP
}

fn list_names(reply: XattrReply) -> Vec<Vec<u8>> {
    match reply {
        XattrReply::Data(list) => list
            .split(|b| *b == 0)
            .filter(|n| !n.is_empty())
            .map(|n| n.to_vec())
            .collect(),
        other => panic!("expected data, got {:?}", other),
    }
}

fn setup() -> (TempDir, LoopbackBackend) {
    let dir = tempfile::tempdir().unwrap();
    let file = dir.path().join("a.txt");
    fs::write(&file, b"hello").unwrap();
    fs::set_permissions(&file, fs::Permissions::from_mode(0o644)).unwrap();
    let lb = LoopbackBackend::new(dir.path(), LoopbackOptions::default());
    (dir, lb)
}

// =============================================================================
// Resolution
// =============================================================================

/// A plain file resolves with its host size and mode
#[tokio::test]
async fn test_lookup_regular_file() {
    let (_dir, lb) = setup();

    let meta = lb.lookup(Path::new("/"), OsStr::new("a.txt")).await.unwrap();
    assert_eq!(meta.kind, FileKind::RegularFile);
    assert_eq!(meta.size, 5);
    assert_eq!(meta.perm, 0o644);
    assert_eq!(meta.nlink, 1);
}

/// Missing names surface as not-found, not as a generic failure
#[tokio::test]
async fn test_lookup_missing() {
    let (_dir, lb) = setup();
    let err = lb
        .lookup(Path::new("/"), OsStr::new("missing"))
        .await
        .unwrap_err();
    assert!(err.is_not_found());
    assert_eq!(err.to_errno(), libc::ENOENT);
}

// =============================================================================
// Handles
// =============================================================================

/// Open, read, release, then the handle is dead
#[tokio::test]
async fn test_handle_lifecycle() {
    let (_dir, lb) = setup();

    let fh = lb.open(Path::new("/a.txt"), libc::O_RDONLY).await.unwrap();
    assert_eq!(lb.open_handles(), 1);
    assert_eq!(&lb.read(fh, 0, 4096).await.unwrap()[..], b"hello");
    assert_eq!(&lb.read(fh, 1, 3).await.unwrap()[..], b"ell");
    assert!(lb.read(fh, 5, 10).await.unwrap().is_empty());

    lb.release(fh).await.unwrap();
    assert_eq!(lb.open_handles(), 0);
    assert!(matches!(lb.read(fh, 0, 1).await, Err(FsError::BadHandle(_))));
    assert_eq!(
        lb.release(fh).await.unwrap_err().to_errno(),
        libc::EBADF
    );
}

/// Two opens of the same file get independent handles
#[tokio::test]
async fn test_independent_handles() {
    let (_dir, lb) = setup();

    let a = lb.open(Path::new("/a.txt"), libc::O_RDONLY).await.unwrap();
    let b = lb.open(Path::new("/a.txt"), libc::O_RDONLY).await.unwrap();
    assert_ne!(a, b);

    lb.release(a).await.unwrap();
    assert_eq!(&lb.read(b, 0, 5).await.unwrap()[..], b"hello");
    lb.release(b).await.unwrap();
}

/// Writes through a created handle land in the host file
#[tokio::test]
async fn test_create_and_write() {
    let (dir, lb) = setup();

    let (meta, fh) = lb
        .create(Path::new("/new.txt"), 0o600, libc::O_WRONLY)
        .await
        .unwrap();
    assert_eq!(meta.kind, FileKind::RegularFile);
    assert_eq!(lb.write(fh, 0, b"written").await.unwrap(), 7);
    lb.flush(fh).await.unwrap();
    lb.release(fh).await.unwrap();

    assert_eq!(fs::read(dir.path().join("new.txt")).unwrap(), b"written");
}

// =============================================================================
// Directory listing
// =============================================================================

/// Reading a large directory through tiny buffers yields every entry once
#[tokio::test]
async fn test_paginated_readdir() {
    let (dir, lb) = setup();
    for i in 0..40 {
        fs::write(dir.path().join(format!("file-{:02}", i)), b"").unwrap();
    }

    let dh = lb.opendir(Path::new("/")).await.unwrap();
    let mut seen: Vec<OsString> = Vec::new();
    let mut cursor = DirCursor::START;
    loop {
        let mut buf = DirBuffer::new(128);
        lb.readdir(dh, cursor, &mut buf).await.unwrap();
        let Some(next) = buf.last_cursor() else {
            break;
        };
        seen.extend(buf.into_entries().into_iter().map(|e| e.name));
        cursor = next;
    }
    lb.releasedir(dh).await.unwrap();

    let unique: HashSet<&OsString> = seen.iter().collect();
    assert_eq!(unique.len(), seen.len(), "duplicate entries: {:?}", seen);
    assert_eq!(seen.len(), 2 + 1 + 40);
    assert_eq!(seen[0], ".");
    assert_eq!(seen[1], "..");
    assert!(unique.contains(&OsString::from("a.txt")));
    assert!(unique.contains(&OsString::from("file-39")));
}

/// Restarting from the start cursor rewinds the listing
#[tokio::test]
async fn test_readdir_restart() {
    let (_dir, lb) = setup();
    let dh = lb.opendir(Path::new("/")).await.unwrap();

    let mut first = DirBuffer::new(4096);
    lb.readdir(dh, DirCursor::START, &mut first).await.unwrap();
    let mut again = DirBuffer::new(4096);
    lb.readdir(dh, DirCursor::START, &mut again).await.unwrap();

    assert_eq!(first.entries(), again.entries());
    lb.releasedir(dh).await.unwrap();
}

/// opendir on a file is refused
#[tokio::test]
async fn test_opendir_on_file() {
    let (_dir, lb) = setup();
    let err = lb.opendir(Path::new("/a.txt")).await.unwrap_err();
    assert_eq!(err.to_errno(), libc::ENOTDIR);
}

// =============================================================================
// Extended attributes
// =============================================================================

/// Set, probe, fetch, list and remove a user attribute
#[tokio::test]
async fn test_xattr_round_trip() {
    let (_dir, lb) = setup();
    let path = Path::new("/a.txt");
    let name = OsStr::new("user.vfs-test");

    match lb.setxattr(path, name, b"value", 0, 0).await {
        Ok(()) => {}
        Err(e) if xattrs_unsupported(&e) => {
            eprintln!("skipping: host filesystem has no user xattrs");
            return;
        }
        Err(e) => panic!("setxattr failed: {}", e),
    }

    assert_eq!(lb.getxattr(path, name, 0).await.unwrap(), XattrReply::Size(5));
    assert_eq!(
        lb.getxattr(path, name, 64).await.unwrap(),
        XattrReply::Data(b"value".to_vec())
    );

    let names = list_names(lb.listxattr(path, 4096).await.unwrap());
    assert!(names.contains(&b"user.vfs-test".to_vec()));

    lb.removexattr(path, name).await.unwrap();
    assert!(lb.getxattr(path, name, 0).await.is_err());
}

/// The reserved security attribute is stored under its alias on the host,
/// and neither name shows up in listings
#[tokio::test]
async fn test_reserved_xattr_is_virtualized() {
    let (dir, lb) = setup();
    let path = Path::new("/a.txt");
    let reserved = OsStr::new(RESERVED_NAME);

    match lb.setxattr(path, reserved, b"acl", 0, 0).await {
        Ok(()) => {}
        Err(e) if xattrs_unsupported(&e) => {
            eprintln!("skipping: host filesystem has no user xattrs");
            return;
        }
        Err(e) => panic!("setxattr failed: {}", e),
    }

    let names = list_names(lb.listxattr(path, 4096).await.unwrap());
    assert!(!names.contains(&RESERVED_NAME.as_bytes().to_vec()), "{:?}", names);
    assert!(!names.contains(&ALIAS_NAME.as_bytes().to_vec()), "{:?}", names);

    assert_eq!(
        lb.getxattr(path, reserved, 64).await.unwrap(),
        XattrReply::Data(b"acl".to_vec())
    );

    // On the host it lives under the alias
    let host = dir.path().join("a.txt");
    let c_path = std::ffi::CString::new(host.as_os_str().as_bytes()).unwrap();
    let c_alias = std::ffi::CString::new(ALIAS_NAME).unwrap();
    assert_eq!(host_getxattr_len(&c_path, &c_alias), 3);

    lb.removexattr(path, reserved).await.unwrap();
    assert!(lb.getxattr(path, reserved, 0).await.is_err());
}

#[cfg(target_os = "linux")]
fn host_getxattr_len(path: &std::ffi::CStr, name: &std::ffi::CStr) -> isize {
    unsafe { libc::lgetxattr(path.as_ptr(), name.as_ptr(), std::ptr::null_mut(), 0) }
}

#[cfg(target_os = "macos")]
fn host_getxattr_len(path: &std::ffi::CStr, name: &std::ffi::CStr) -> isize {
    unsafe {
        libc::getxattr(
            path.as_ptr(),
            name.as_ptr(),
            std::ptr::null_mut(),
            0,
            0,
            libc::XATTR_NOFOLLOW,
        )
    }
}
