//! Open handle registry
//!
//! Backends hand out opaque `FileHandle` values from `open`/`opendir` and get
//! them back on every following call until `release`. Handles index into an
//! arena of slots; each slot carries a generation counter that is bumped on
//! release, so a handle that was never issued or has already been released
//! is rejected instead of resolving to whatever occupies the slot now.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{FsError, Result};

/// Default upper bound on simultaneously open handles per backend
pub const DEFAULT_MAX_HANDLES: usize = 1 << 16;

/// Opaque handle value exchanged with the kernel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FileHandle(u64);

impl FileHandle {
    fn new(index: u32, generation: u32) -> Self {
        Self(((generation as u64) << 32) | index as u64)
    }

    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub fn raw(self) -> u64 {
        self.0
    }

    fn index(self) -> usize {
        (self.0 & 0xffff_ffff) as usize
    }

    fn generation(self) -> u32 {
        (self.0 >> 32) as u32
    }
}

struct Slot<T> {
    generation: u32,
    value: Option<Arc<T>>,
}

struct Slots<T> {
    slots: Vec<Slot<T>>,
    free: Vec<u32>,
    live: usize,
}

/// Generation-checked arena of open resources
pub struct HandleTable<T> {
    inner: Mutex<Slots<T>>,
    limit: usize,
}

impl<T> HandleTable<T> {
    pub fn new() -> Self {
        Self::with_limit(DEFAULT_MAX_HANDLES)
    }

    /// Create a table that refuses to hold more than `limit` open handles
    pub fn with_limit(limit: usize) -> Self {
        Self {
            inner: Mutex::new(Slots {
                slots: Vec::new(),
                free: Vec::new(),
                live: 0,
            }),
            limit: limit.min(u32::MAX as usize),
        }
    }

    /// Register a resource and return the handle that names it
    pub fn insert(&self, value: T) -> Result<FileHandle> {
        let mut inner = self.inner.lock();
        if inner.live >= self.limit {
            return Err(FsError::OutOfMemory);
        }

        let index = match inner.free.pop() {
            Some(index) => index,
            None => {
                inner
                    .slots
                    .try_reserve(1)
                    .map_err(|_| FsError::OutOfMemory)?;
                inner.slots.push(Slot {
                    // Generation 0 is never handed out so a zero fh is always invalid
                    generation: 1,
                    value: None,
                });
                (inner.slots.len() - 1) as u32
            }
        };

        let slot = &mut inner.slots[index as usize];
        slot.value = Some(Arc::new(value));
        let handle = FileHandle::new(index, slot.generation);
        inner.live += 1;
        Ok(handle)
    }

    /// Resolve a handle to its resource
    ///
    /// The table lock is released before the caller uses the resource, so
    /// operations on different handles never serialize on the table.
    pub fn get(&self, handle: FileHandle) -> Result<Arc<T>> {
        let inner = self.inner.lock();
        match inner.slots.get(handle.index()) {
            Some(slot) if slot.generation == handle.generation() => slot
                .value
                .clone()
                .ok_or(FsError::BadHandle(handle.raw())),
            _ => Err(FsError::BadHandle(handle.raw())),
        }
    }

    /// Detach a resource from the table
    ///
    /// The slot is recycled before the resource is handed back, so whatever
    /// happens while the caller closes it the slot is not leaked.
    pub fn remove(&self, handle: FileHandle) -> Result<Arc<T>> {
        let mut inner = self.inner.lock();
        let index = handle.index();
        let value = match inner.slots.get_mut(index) {
            Some(slot) if slot.generation == handle.generation() => {
                let value = slot.value.take().ok_or(FsError::BadHandle(handle.raw()))?;
                slot.generation = match slot.generation.wrapping_add(1) {
                    0 => 1,
                    g => g,
                };
                value
            }
            _ => return Err(FsError::BadHandle(handle.raw())),
        };
        inner.free.push(index as u32);
        inner.live -= 1;
        Ok(value)
    }

    /// Number of currently open handles
    pub fn len(&self) -> usize {
        self.inner.lock().live
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T> Default for HandleTable<T> {
    fn default() -> Self {
        Self::new()
    }
}
