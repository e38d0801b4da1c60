//! Directory enumeration protocol
//!
//! The kernel lists a directory through repeated readdir calls, each with a
//! byte budget and the cursor returned alongside the last entry it accepted.
//! A `DirEnumerator` keeps one open backing stream per directory handle and
//! resumes it from any cursor it previously produced:
//!
//! - `.` and `..` are synthesized first; the backing stream's own copies are
//!   skipped.
//! - A cursor that differs from the remembered position repositions the
//!   backing stream and drops the cached entry.
//! - An entry that does not fit in the sink is cached and produced first on
//!   the next call.
//!
//! If the backing directory is mutated between calls the OS may skip or
//! repeat entries; nothing here tries to hide that.

use std::ffi::{OsStr, OsString};

use crate::backend::FileKind;
use crate::error::Result;

/// Size of the fixed part of a kernel dirent record (ino, off, namelen, type)
const DIRENT_HEADER_LEN: usize = 24;

/// Dirent records are padded to 8-byte boundaries
const DIRENT_ALIGN: usize = 8;

/// Number of cursor values reserved before backing stream positions start
const RESERVED_CURSORS: u64 = 3;

/// Opaque resumption token for directory enumeration
///
/// 0 is the start of the listing, 1 follows `.`, 2 follows `..`; larger
/// values encode a position in the backing stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct DirCursor(u64);

/// Decoded view of a cursor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CursorPosition {
    Start,
    AfterDot,
    AfterDotDot,
    Stream(u64),
}

impl DirCursor {
    pub const START: DirCursor = DirCursor(0);
    pub const AFTER_DOT: DirCursor = DirCursor(1);
    pub const AFTER_DOTDOT: DirCursor = DirCursor(2);

    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// Cursor for the point just after a backing stream position
    pub fn stream(pos: u64) -> Self {
        Self(pos.wrapping_add(RESERVED_CURSORS))
    }

    pub fn raw(self) -> u64 {
        self.0
    }

    pub fn position(self) -> CursorPosition {
        match self.0 {
            0 => CursorPosition::Start,
            1 => CursorPosition::AfterDot,
            2 => CursorPosition::AfterDotDot,
            raw => CursorPosition::Stream(raw.wrapping_sub(RESERVED_CURSORS)),
        }
    }
}

/// One listing entry with the cursor that resumes after it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub name: OsString,
    pub kind: FileKind,
    pub next: DirCursor,
}

impl DirEntry {
    pub fn is_dot(&self) -> bool {
        self.name == "."
    }

    pub fn is_dotdot(&self) -> bool {
        self.name == ".."
    }
}

/// Encoded length of a dirent record carrying `name`
pub fn record_len(name: &OsStr) -> usize {
    let unpadded = DIRENT_HEADER_LEN + name.len();
    (unpadded + DIRENT_ALIGN - 1) & !(DIRENT_ALIGN - 1)
}

/// Destination for listing entries
pub trait DirSink {
    /// Append an entry; returns false, writing nothing, if it does not fit
    fn push(&mut self, entry: &DirEntry) -> bool;
}

/// Byte-budgeted sink that keeps the entries it accepted
#[derive(Debug)]
pub struct DirBuffer {
    max_bytes: usize,
    used: usize,
    entries: Vec<DirEntry>,
}

impl DirBuffer {
    pub fn new(max_bytes: usize) -> Self {
        Self {
            max_bytes,
            used: 0,
            entries: Vec::new(),
        }
    }

    pub fn entries(&self) -> &[DirEntry] {
        &self.entries
    }

    pub fn into_entries(self) -> Vec<DirEntry> {
        self.entries
    }

    /// Bytes consumed by the accepted records
    pub fn used(&self) -> usize {
        self.used
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Cursor following the last accepted entry
    pub fn last_cursor(&self) -> Option<DirCursor> {
        self.entries.last().map(|e| e.next)
    }
}

impl DirSink for DirBuffer {
    fn push(&mut self, entry: &DirEntry) -> bool {
        let len = record_len(&entry.name);
        if self.used + len > self.max_bytes {
            return false;
        }
        self.used += len;
        self.entries.push(entry.clone());
        true
    }
}

/// Entry as read from a backing directory stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawDirEntry {
    pub name: OsString,
    pub kind: FileKind,
}

impl RawDirEntry {
    pub fn new(name: impl Into<OsString>, kind: FileKind) -> Self {
        Self {
            name: name.into(),
            kind,
        }
    }
}

/// A resumable backing directory stream
pub trait DirSource {
    /// Return to the first entry
    fn rewind(&mut self) -> Result<()>;

    /// Reposition to a value previously returned by `tell`
    fn seek(&mut self, pos: u64) -> Result<()>;

    /// Position just after the entry most recently returned by `next_entry`
    fn tell(&mut self) -> Result<u64>;

    /// Read the next entry, `None` at end of stream
    fn next_entry(&mut self) -> Result<Option<RawDirEntry>>;
}

/// In-memory listing; positions are entry indices
#[derive(Debug, Clone, Default)]
pub struct VecDirSource {
    entries: Vec<RawDirEntry>,
    pos: usize,
}

impl VecDirSource {
    pub fn new(entries: Vec<RawDirEntry>) -> Self {
        Self { entries, pos: 0 }
    }
}

impl DirSource for VecDirSource {
    fn rewind(&mut self) -> Result<()> {
        self.pos = 0;
        Ok(())
    }

    fn seek(&mut self, pos: u64) -> Result<()> {
        self.pos = usize::try_from(pos).unwrap_or(usize::MAX);
        Ok(())
    }

    fn tell(&mut self) -> Result<u64> {
        Ok(self.pos as u64)
    }

    fn next_entry(&mut self) -> Result<Option<RawDirEntry>> {
        let entry = self.entries.get(self.pos).cloned();
        if entry.is_some() {
            self.pos += 1;
        }
        Ok(entry)
    }
}

/// Per-handle enumeration state over a backing stream
#[derive(Debug)]
pub struct DirEnumerator<S> {
    source: S,
    /// Cursor that the next produced entry follows
    position: DirCursor,
    /// Entry already read from `source` that did not fit last time
    pending: Option<DirEntry>,
}

impl<S: DirSource> DirEnumerator<S> {
    pub fn new(source: S) -> Self {
        Self {
            source,
            position: DirCursor::START,
            pending: None,
        }
    }

    /// Cursor the enumerator currently sits at
    pub fn position(&self) -> DirCursor {
        self.position
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    /// Give back the backing stream, e.g. to close it
    pub fn into_source(self) -> S {
        self.source
    }

    /// Append entries following `cursor` until the sink is full or the
    /// listing ends
    pub fn fill<K: DirSink + ?Sized>(&mut self, cursor: DirCursor, sink: &mut K) -> Result<()> {
        if cursor != self.position {
            self.reposition(cursor)?;
        }

        loop {
            let entry = match self.pending.take() {
                Some(entry) => entry,
                None => match self.produce()? {
                    Some(entry) => entry,
                    None => return Ok(()),
                },
            };

            if !sink.push(&entry) {
                self.pending = Some(entry);
                return Ok(());
            }
            self.position = entry.next;
        }
    }

    fn reposition(&mut self, cursor: DirCursor) -> Result<()> {
        self.pending = None;
        match cursor.position() {
            CursorPosition::Start | CursorPosition::AfterDot | CursorPosition::AfterDotDot => {
                self.source.rewind()?
            }
            CursorPosition::Stream(pos) => self.source.seek(pos)?,
        }
        self.position = cursor;
        Ok(())
    }

    fn produce(&mut self) -> Result<Option<DirEntry>> {
        match self.position.position() {
            CursorPosition::Start => Ok(Some(DirEntry {
                name: OsString::from("."),
                kind: FileKind::Directory,
                next: DirCursor::AFTER_DOT,
            })),
            CursorPosition::AfterDot => Ok(Some(DirEntry {
                name: OsString::from(".."),
                kind: FileKind::Directory,
                next: DirCursor::AFTER_DOTDOT,
            })),
            CursorPosition::AfterDotDot | CursorPosition::Stream(_) => loop {
                let Some(raw) = self.source.next_entry()? else {
                    return Ok(None);
                };
                if raw.name == "." || raw.name == ".." {
                    continue;
                }
                let next = DirCursor::stream(self.source.tell()?);
                return Ok(Some(DirEntry {
                    name: raw.name,
                    kind: raw.kind,
                    next,
                }));
            },
        }
    }
}
