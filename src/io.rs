//! Collaborators the cache core consumes but does not own: positioned I/O
//! and the opaque file identifier. See spec.md §6 "Collaborators".

use crate::error::{CacheError, Result};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Opaque, equality-comparable, hashable file handle. The core never
/// interprets its value; it only uses it as a map key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FileId(pub u64);

static NEXT_FILE_ID: AtomicU64 = AtomicU64::new(1);

impl FileId {
    pub fn next() -> Self {
        FileId(NEXT_FILE_ID.fetch_add(1, Ordering::Relaxed))
    }
}

/// Positioned I/O contract consumed by the controller. A short read/write
/// (partial transfer) is always surfaced as `CacheError::ShortTransfer`,
/// never silently retried by the collaborator.
pub trait PositionedIo: Send + Sync {
    /// Read `buf.len()` bytes starting at `offset`. Returns the number of
    /// bytes actually transferred.
    fn pread(&self, file: FileId, buf: &mut [u8], offset: u64) -> Result<usize>;

    /// Write `buf` at `offset`. `wait_if_full` mirrors the collaborator
    /// contract in spec.md §6 (a hook for callers backed by a bounded
    /// temporary-file stream); plain file-backed implementations ignore it.
    fn pwrite(&self, file: FileId, buf: &[u8], offset: u64, wait_if_full: bool) -> Result<usize>;

    /// Byte length of the file, when known. Used only for bookkeeping/
    /// diagnostics, never required for correctness.
    fn file_len(&self, file: FileId) -> Result<u64>;
}

/// Registry of real on-disk files behind a `FileId`, backed by `std::fs`.
/// This is the production collaborator; each file is opened once and
/// positioned I/O is serialized per-file with a mutex, matching the
/// "thread-safe `pread`/`pwrite`" contract the core assumes.
pub struct FileRegistry {
    files: Mutex<HashMap<FileId, Arc<Mutex<File>>>>,
}

impl FileRegistry {
    pub fn new() -> Self {
        Self {
            files: Mutex::new(HashMap::new()),
        }
    }

    pub fn register(&self, file: FileId, handle: File) {
        self.files.lock().insert(file, Arc::new(Mutex::new(handle)));
    }

    fn handle(&self, file: FileId) -> Result<Arc<Mutex<File>>> {
        self.files
            .lock()
            .get(&file)
            .cloned()
            .ok_or_else(|| CacheError::InvalidArgument(format!("unknown file id {:?}", file)))
    }
}

impl Default for FileRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl PositionedIo for FileRegistry {
    fn pread(&self, file: FileId, buf: &mut [u8], offset: u64) -> Result<usize> {
        let handle = self.handle(file)?;
        let mut f = handle.lock();
        f.seek(SeekFrom::Start(offset))?;
        let mut read = 0;
        while read < buf.len() {
            match f.read(&mut buf[read..])? {
                0 => break,
                n => read += n,
            }
        }
        Ok(read)
    }

    fn pwrite(&self, file: FileId, buf: &[u8], offset: u64, _wait_if_full: bool) -> Result<usize> {
        let handle = self.handle(file)?;
        let mut f = handle.lock();
        f.seek(SeekFrom::Start(offset))?;
        f.write_all(buf)?;
        f.flush()?;
        Ok(buf.len())
    }

    fn file_len(&self, file: FileId) -> Result<u64> {
        let handle = self.handle(file)?;
        Ok(handle.lock().metadata()?.len())
    }
}

/// In-memory collaborator used by tests that need to control I/O timing
/// (e.g. making a read "hang" until a latch opens) without touching a
/// real filesystem.
pub struct MemoryIo {
    files: Mutex<HashMap<FileId, Vec<u8>>>,
}

impl MemoryIo {
    pub fn new() -> Self {
        Self {
            files: Mutex::new(HashMap::new()),
        }
    }

    pub fn seed(&self, file: FileId, data: Vec<u8>) {
        self.files.lock().insert(file, data);
    }

    pub fn snapshot(&self, file: FileId) -> Vec<u8> {
        self.files.lock().get(&file).cloned().unwrap_or_default()
    }
}

impl Default for MemoryIo {
    fn default() -> Self {
        Self::new()
    }
}

impl PositionedIo for MemoryIo {
    fn pread(&self, file: FileId, buf: &mut [u8], offset: u64) -> Result<usize> {
        let files = self.files.lock();
        let data = files.get(&file).map(|v| v.as_slice()).unwrap_or(&[]);
        let offset = offset as usize;
        if offset >= data.len() {
            return Ok(0);
        }
        let n = buf.len().min(data.len() - offset);
        buf[..n].copy_from_slice(&data[offset..offset + n]);
        Ok(n)
    }

    fn pwrite(&self, file: FileId, buf: &[u8], offset: u64, _wait_if_full: bool) -> Result<usize> {
        let mut files = self.files.lock();
        let data = files.entry(file).or_default();
        let offset = offset as usize;
        if data.len() < offset + buf.len() {
            data.resize(offset + buf.len(), 0);
        }
        data[offset..offset + buf.len()].copy_from_slice(buf);
        Ok(buf.len())
    }

    fn file_len(&self, file: FileId) -> Result<u64> {
        Ok(self.files.lock().get(&file).map(|v| v.len()).unwrap_or(0) as u64)
    }
}
