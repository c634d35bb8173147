//! Page cache: the key cache controller plus the pin/lock extensions
//! named in spec.md §4.8 — `make_lock_and_pin`, `delete_page`, and write
//! modes `delay`/`now`/`done`.
//!
//! Unlike the plain key cache API, a locked-and-pinned page stays resident
//! across several calls instead of being reserved for the lifetime of one
//! `read`/`write`. That needs a block to stay checked out of the
//! replacement engine between calls, so this module drives
//! [`crate::keycache::KeyCache`] through its `pub(crate)` pin primitives
//! rather than through `read`/`write`/`insert` directly.

pub mod lock;

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Condvar, Mutex, MutexGuard};
use tracing::trace;

use crate::context::CacheContext;
use crate::error::{CacheError, Result};
use crate::io::{FileId, PositionedIo};
use crate::keycache::block::BlockId;
use crate::keycache::hashlink::HashLinkId;
use crate::keycache::KeyCache;
use lock::{LockMode, LockState, PinMode};

struct PageEntry {
    hash_link_id: HashLinkId,
    block_id: BlockId,
    state: LockState,
}

/// How a page write should reach disk (spec.md §4.8).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    /// populate the cached copy and mark it dirty; a later flush writes it back.
    Delay,
    /// write the modified bytes through to disk immediately.
    Now,
    /// treat the page as already durable (e.g. the caller already wrote
    /// it via another path); just refresh the cached copy.
    Done,
}

pub struct PageCache<IO: PositionedIo> {
    inner: Arc<KeyCache<IO>>,
    pages: Mutex<HashMap<(FileId, u64), PageEntry>>,
    unlocked: Condvar,
}

impl<IO: PositionedIo> PageCache<IO> {
    pub fn new(inner: Arc<KeyCache<IO>>) -> Self {
        PageCache {
            inner,
            pages: Mutex::new(HashMap::new()),
            unlocked: Condvar::new(),
        }
    }

    fn cond_wait(&self, guard: &mut MutexGuard<'_, HashMap<(FileId, u64), PageEntry>>, ctx: &CacheContext) -> Result<()> {
        match ctx.debug_timeout {
            Some(d) => {
                if self.unlocked.wait_for(guard, d).timed_out() {
                    return Err(CacheError::WaitTimeout(d));
                }
                Ok(())
            }
            None => {
                self.unlocked.wait(guard);
                Ok(())
            }
        }
    }

    /// spec.md §4.8: acquire `mode` on `(file, offset)`, adjusting the pin
    /// count per `pin`. Fetches the page into the cache on first access.
    /// Blocks (respecting `ctx`'s debug timeout) while the requested mode
    /// conflicts with the current holder.
    pub fn make_lock_and_pin(
        &self,
        ctx: &CacheContext,
        file: FileId,
        offset: u64,
        mode: LockMode,
        pin: PinMode,
    ) -> Result<()> {
        let mut guard = self.pages.lock();
        loop {
            if !guard.contains_key(&(file, offset)) {
                let fetched = MutexGuard::unlocked(&mut guard, || self.inner.pin_fetch(ctx, file, offset))?;
                guard.insert(
                    (file, offset),
                    PageEntry {
                        hash_link_id: fetched.0,
                        block_id: fetched.1,
                        state: LockState::default(),
                    },
                );
            }

            let blocked = guard.get(&(file, offset)).expect("just inserted").state.blocks(mode);
            if blocked {
                self.cond_wait(&mut guard, ctx)?;
                continue;
            }
            break;
        }

        let block_id = guard.get(&(file, offset)).unwrap().block_id;
        {
            let entry = guard.get_mut(&(file, offset)).unwrap();
            match (entry.state.mode, mode) {
                (_, LockMode::Free) => {
                    match entry.state.mode {
                        LockMode::Read => {
                            entry.state.readers = entry.state.readers.saturating_sub(1);
                            if entry.state.readers == 0 {
                                entry.state.mode = LockMode::Free;
                            }
                        }
                        LockMode::Write => {
                            entry.state.mode = LockMode::Free;
                            self.inner.end_wrlock(block_id);
                        }
                        LockMode::Free => {}
                    }
                }
                (_, LockMode::Write) => {
                    // `blocks()` above only lets us reach here from `Free`.
                    self.inner.begin_wrlock(ctx, block_id)?;
                    entry.state.mode = LockMode::Write;
                    #[cfg(debug_assertions)]
                    {
                        entry.state.last_holder = Some(ctx.thread_id);
                    }
                }
                (_, LockMode::Read) => {
                    entry.state.mode = LockMode::Read;
                    entry.state.readers += 1;
                }
            }

            match pin {
                PinMode::Pin => {
                    entry.state.pins += 1;
                    self.inner.adjust_pins(block_id, 1);
                }
                PinMode::Unpin => {
                    entry.state.pins = entry.state.pins.saturating_sub(1);
                    self.inner.adjust_pins(block_id, -1);
                }
                PinMode::LeaveUnchanged => {}
            }
        }

        let idle = guard.get(&(file, offset)).unwrap().state.is_idle();
        if idle {
            let entry = guard.remove(&(file, offset)).unwrap();
            self.inner.pin_release(ctx, entry.hash_link_id, entry.block_id, true)?;
        }
        self.unlocked.notify_all();
        Ok(())
    }

    /// Convenience: pin `(file, offset)` without taking a lock.
    pub fn pin(&self, ctx: &CacheContext, file: FileId, offset: u64) -> Result<()> {
        self.make_lock_and_pin(ctx, file, offset, LockMode::Free, PinMode::Pin)
    }

    /// Convenience: drop a pin taken by [`Self::pin`].
    pub fn unpin(&self, ctx: &CacheContext, file: FileId, offset: u64) -> Result<()> {
        self.make_lock_and_pin(ctx, file, offset, LockMode::Free, PinMode::Unpin)
    }

    /// Read from a page that the caller already holds locked (for read or
    /// write) via [`Self::make_lock_and_pin`].
    pub fn read(&self, file: FileId, offset: u64, dest: &mut [u8]) -> Result<()> {
        let block_id = self.locked_block(file, offset)?;
        self.inner.with_buffer(block_id, |buf| {
            let n = dest.len().min(buf.len());
            dest[..n].copy_from_slice(&buf[..n]);
        });
        Ok(())
    }

    /// Apply a write to a page the caller already holds locked for write.
    pub fn write(&self, file: FileId, offset: u64, src: &[u8], mode: WriteMode) -> Result<()> {
        let block_id = self.locked_block(file, offset)?;
        self.inner.with_buffer(block_id, |buf| {
            let n = src.len().min(buf.len());
            buf[..n].copy_from_slice(&src[..n]);
        });
        match mode {
            WriteMode::Delay => {
                self.inner.mark_dirty(file, block_id);
                Ok(())
            }
            WriteMode::Now => self.inner.write_through_block(file, offset, block_id),
            WriteMode::Done => Ok(()),
        }
    }

    fn locked_block(&self, file: FileId, offset: u64) -> Result<BlockId> {
        let guard = self.pages.lock();
        guard
            .get(&(file, offset))
            .map(|e| e.block_id)
            .ok_or_else(|| CacheError::InvalidArgument(format!("page ({file:?}, {offset}) is not locked")))
    }

    /// spec.md §4.8: remove `(file, offset)`'s cached copy. Refuses to
    /// remove a page pinned by anyone else. `flush_first` writes back a
    /// dirty page before discarding it.
    pub fn delete_page(&self, file: FileId, offset: u64, flush_first: bool) -> Result<()> {
        let mut guard = self.pages.lock();
        let Some(entry) = guard.get(&(file, offset)) else {
            return Ok(());
        };
        if entry.state.pins > 0 {
            return Err(CacheError::InvalidArgument(format!(
                "page ({file:?}, {offset}) is pinned, cannot delete"
            )));
        }
        let (hash_link_id, block_id) = (entry.hash_link_id, entry.block_id);
        if flush_first {
            MutexGuard::unlocked(&mut guard, || self.inner.write_through_block(file, offset, block_id))?;
        }
        guard.remove(&(file, offset));
        self.inner.delete_block(file, hash_link_id, block_id);
        trace!(?file, offset, "page deleted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::MemoryIo;
    use crate::keycache::{KeyCache, KeyCacheConfig};

    fn fixture() -> (Arc<KeyCache<MemoryIo>>, PageCache<MemoryIo>, FileId) {
        let io = Arc::new(MemoryIo::new());
        let file = FileId::next();
        io.seed(file, vec![7u8; 4096]);
        let cache = Arc::new(
            KeyCache::init(
                io,
                KeyCacheConfig {
                    block_size: 512,
                    memory_size: 512 * 16,
                    ..Default::default()
                },
            )
            .unwrap(),
        );
        let pc = PageCache::new(cache.clone());
        (cache, pc, file)
    }

    #[test]
    fn read_lock_then_read_is_consistent() {
        let (_cache, pc, file) = fixture();
        let ctx = CacheContext::current();
        pc.make_lock_and_pin(&ctx, file, 0, LockMode::Read, PinMode::Pin).unwrap();
        let mut buf = [0u8; 512];
        pc.read(file, 0, &mut buf).unwrap();
        assert_eq!(buf, [7u8; 512]);
        pc.make_lock_and_pin(&ctx, file, 0, LockMode::Free, PinMode::Unpin).unwrap();
    }

    #[test]
    fn write_delay_marks_dirty_without_touching_disk() {
        let (cache, pc, file) = fixture();
        let ctx = CacheContext::current();
        pc.make_lock_and_pin(&ctx, file, 0, LockMode::Write, PinMode::Pin).unwrap();
        pc.write(file, 0, &[9u8; 512], WriteMode::Delay).unwrap();
        pc.make_lock_and_pin(&ctx, file, 0, LockMode::Free, PinMode::Unpin).unwrap();
        assert_eq!(cache.stats().blocks_changed, 1);
    }

    #[test]
    fn delete_refuses_while_pinned() {
        let (_cache, pc, file) = fixture();
        let ctx = CacheContext::current();
        pc.make_lock_and_pin(&ctx, file, 0, LockMode::Read, PinMode::Pin).unwrap();
        assert!(pc.delete_page(file, 0, false).is_err());
        pc.make_lock_and_pin(&ctx, file, 0, LockMode::Free, PinMode::Unpin).unwrap();
        assert!(pc.delete_page(file, 0, false).is_ok());
    }
}
