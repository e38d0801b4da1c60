//! Inode management for path <-> inode mapping
//!
//! The kernel addresses nodes by inode number while backends work with
//! mount-relative paths. Inodes are handed out on first sight of a path and
//! stay stable until the path is removed. Some backends publish fixed inode
//! numbers (the clock file is always 2); those are reserved up front so
//! allocation starts above them.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;

/// Root directory inode (always 1 in FUSE)
pub const ROOT_INODE: u64 = 1;

/// Manages bidirectional inode <-> path mapping
pub struct InodeTable {
    inode_to_path: DashMap<u64, PathBuf>,
    path_to_inode: DashMap<PathBuf, u64>,
    next_inode: AtomicU64,
}

impl InodeTable {
    /// Create a new inode table with root directory pre-registered
    pub fn new() -> Self {
        let table = Self {
            inode_to_path: DashMap::new(),
            path_to_inode: DashMap::new(),
            next_inode: AtomicU64::new(ROOT_INODE + 1),
        };
        table.insert(Path::new("/"), ROOT_INODE);
        table
    }

    /// Create a table with fixed inode numbers registered up front
    pub fn with_reserved<'a>(reserved: impl IntoIterator<Item = (&'a Path, u64)>) -> Self {
        let table = Self::new();
        for (path, ino) in reserved {
            table.insert(&normalize_path(path), ino);
            table.next_inode.fetch_max(ino + 1, Ordering::SeqCst);
        }
        table
    }

    fn insert(&self, path: &Path, ino: u64) {
        self.inode_to_path.insert(ino, path.to_path_buf());
        self.path_to_inode.insert(path.to_path_buf(), ino);
    }

    /// Get inode for a path, creating one if it doesn't exist
    pub fn get_or_create_inode(&self, path: &Path) -> u64 {
        let normalized = normalize_path(path);
        if let Some(inode) = self.path_to_inode.get(&normalized) {
            return *inode;
        }

        // The entry lock decides the winner if two threads race here
        *self
            .path_to_inode
            .entry(normalized.clone())
            .or_insert_with(|| {
                let inode = self.next_inode.fetch_add(1, Ordering::SeqCst);
                self.inode_to_path.insert(inode, normalized);
                inode
            })
    }

    pub fn get_path(&self, inode: u64) -> Option<PathBuf> {
        self.inode_to_path.get(&inode).map(|p| p.clone())
    }

    /// Get inode for a path (without creating)
    pub fn get_inode(&self, path: &Path) -> Option<u64> {
        self.path_to_inode.get(&normalize_path(path)).map(|i| *i)
    }

    /// Inode of the directory holding `path`; the root is its own parent
    pub fn parent_inode(&self, path: &Path) -> u64 {
        path.parent()
            .and_then(|p| self.get_inode(p))
            .unwrap_or(ROOT_INODE)
    }

    /// Forget a path and everything below it
    pub fn remove_path(&self, path: &Path) {
        let normalized = normalize_path(path);
        let doomed: Vec<PathBuf> = self
            .path_to_inode
            .iter()
            .filter(|e| e.key().starts_with(&normalized))
            .map(|e| e.key().clone())
            .collect();
        for p in doomed {
            if let Some((_, inode)) = self.path_to_inode.remove(&p) {
                if inode != ROOT_INODE {
                    self.inode_to_path.remove(&inode);
                }
            }
        }
    }

    /// Move a path and its descendants, keeping their inode numbers
    pub fn rename_path(&self, old: &Path, new: &Path) {
        let old = normalize_path(old);
        let new = normalize_path(new);
        if old == new {
            return;
        }
        // Whatever was at the destination has been replaced
        self.remove_path(&new);

        let moved: Vec<(PathBuf, u64)> = self
            .path_to_inode
            .iter()
            .filter(|e| e.key().starts_with(&old))
            .map(|e| (e.key().clone(), *e.value()))
            .collect();
        for (path, inode) in moved {
            self.path_to_inode.remove(&path);
            let Ok(rest) = path.strip_prefix(&old) else {
                continue;
            };
            let target = if rest.as_os_str().is_empty() {
                new.clone()
            } else {
                new.join(rest)
            };
            self.insert(&target, inode);
        }
    }

    /// Swap the subtrees of two paths
    pub fn exchange_paths(&self, a: &Path, b: &Path) {
        let a = normalize_path(a);
        let b = normalize_path(b);
        // Not a name any real path can have
        let parked = PathBuf::from("/\0exchange");
        self.rename_path(&a, &parked);
        self.rename_path(&b, &a);
        self.rename_path(&parked, &b);
    }

    pub fn len(&self) -> usize {
        self.inode_to_path.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inode_to_path.is_empty()
    }
}

impl Default for InodeTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Normalize a path for consistent mapping
fn normalize_path(path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        PathBuf::from("/").join(path)
    }
}
