//! The key cache controller (spec.md §2-§5): lookup-or-assign, flush and
//! resize on top of the building blocks in the sibling modules.
//!
//! The cache mutex (`Inner`) is the only lock; every wait queue is a
//! `Condvar` parked against it. Several steps need to drop the mutex for
//! real I/O and reacquire it afterward (mirroring the plain
//! `pthread_mutex_unlock`/`lock` pairs in `mf_keycache.c`); the idiomatic
//! Rust rendition of that shape is `parking_lot::MutexGuard::unlocked`.
//! Debug timeout mode (spec.md §5, `keycache_timeout`) applies to every
//! wait below: with a [`CacheContext::debug_timeout`] set, a wait that
//! outlives it surfaces `CacheError::WaitTimeout` instead of blocking
//! forever.

pub mod block;
pub mod hashlink;
pub mod lru;
pub mod waitqueue;

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Condvar, Mutex, MutexGuard};
use tracing::{info, trace, warn};

use crate::context::CacheContext;
use crate::error::{CacheError, Result};
use crate::io::{FileId, PositionedIo};
use block::{Block, BlockId, Phase};
use hashlink::{HashIndex, HashLinkId};
use lru::LruRing;
use waitqueue::WaitingForBlock;

/// Minimum number of blocks a usable cache must have, matching
/// `mf_keycache.c`'s refusal to run a key cache with fewer than a handful
/// of blocks.
pub const MIN_BLOCKS: usize = 8;

#[derive(Debug, Clone, Copy)]
pub struct KeyCacheConfig {
    pub block_size: usize,
    pub memory_size: usize,
    /// percentage of blocks reserved as the warm-chain floor.
    pub division_limit: u32,
    /// percentage of blocks defining the hot-block age threshold.
    pub age_threshold: u32,
}

impl Default for KeyCacheConfig {
    fn default() -> Self {
        KeyCacheConfig {
            block_size: 1024,
            memory_size: 8 * 1024 * 1024,
            division_limit: 100,
            age_threshold: 300,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushType {
    /// write dirty blocks back, keep them cached.
    Keep,
    /// write dirty blocks back, then evict them.
    Release,
    /// drop dirty blocks without writing (crash/discard path).
    IgnoreChanged,
    /// like `Keep`, but do not wait on a flush already in progress.
    ForceWrite,
}

#[derive(Debug, Default, Clone)]
pub struct CacheStats {
    pub blocks_total: usize,
    pub blocks_used: usize,
    pub blocks_unused: usize,
    pub blocks_changed: usize,
    pub blocks_warm: usize,
    pub blocks_hot: usize,
    pub read_requests: u64,
    pub reads: u64,
    pub write_requests: u64,
    pub writes: u64,
}

#[derive(Default)]
struct FileChain {
    head: Option<BlockId>,
    tail: Option<BlockId>,
    count: usize,
}

#[derive(Default)]
struct FileChains {
    changed: FileChain,
    clean: FileChain,
}

fn chain_push_back(blocks: &mut [Block], chain: &mut FileChain, id: BlockId) {
    blocks[id].chain_prev = chain.tail;
    blocks[id].chain_next = None;
    match chain.tail {
        Some(t) => blocks[t].chain_next = Some(id),
        None => chain.head = Some(id),
    }
    chain.tail = Some(id);
    chain.count += 1;
}

fn chain_unlink(blocks: &mut [Block], chain: &mut FileChain, id: BlockId) {
    let (prev, next) = (blocks[id].chain_prev, blocks[id].chain_next);
    match prev {
        Some(p) => blocks[p].chain_next = next,
        None => chain.head = next,
    }
    match next {
        Some(n) => blocks[n].chain_prev = prev,
        None => chain.tail = prev,
    }
    blocks[id].chain_prev = None;
    blocks[id].chain_next = None;
    chain.count = chain.count.saturating_sub(1);
}

fn link_clean(files: &mut HashMap<FileId, FileChains>, blocks: &mut [Block], file: FileId, id: BlockId) {
    let entry = files.entry(file).or_default();
    chain_push_back(blocks, &mut entry.clean, id);
    blocks[id].on_changed_chain = false;
}

fn link_changed(files: &mut HashMap<FileId, FileChains>, blocks: &mut [Block], file: FileId, id: BlockId) {
    let entry = files.entry(file).or_default();
    chain_push_back(blocks, &mut entry.changed, id);
    blocks[id].on_changed_chain = true;
}

fn unlink_current(files: &mut HashMap<FileId, FileChains>, blocks: &mut [Block], file: FileId, id: BlockId) {
    let on_changed = blocks[id].on_changed_chain;
    if let Some(entry) = files.get_mut(&file) {
        if on_changed {
            chain_unlink(blocks, &mut entry.changed, id);
        } else {
            chain_unlink(blocks, &mut entry.clean, id);
        }
    }
}

#[derive(Default)]
struct CacheStatsInner {
    read_requests: u64,
    reads: u64,
    write_requests: u64,
    writes: u64,
}

struct Inner {
    config: KeyCacheConfig,
    blocks: Vec<Block>,
    free_blocks: Vec<BlockId>,
    hash_index: HashIndex,
    lru: LruRing,
    clock: u64,
    can_be_used: bool,
    in_resize: bool,
    cnt_for_resize_op: u32,
    waiting_for_block: WaitingForBlock,
    files: HashMap<FileId, FileChains>,
    stats: CacheStatsInner,
}

impl Inner {
    fn layout(config: &KeyCacheConfig) -> Option<usize> {
        if config.block_size == 0 || config.memory_size == 0 {
            return None;
        }
        Some(config.memory_size / config.block_size)
    }

    fn rebuild(config: KeyCacheConfig, num_blocks: usize) -> Self {
        let blocks = (0..num_blocks).map(|_| Block::new(config.block_size)).collect::<Vec<_>>();
        let free_blocks = (0..num_blocks).rev().collect();
        let hash_index = HashIndex::new(num_blocks.max(1) * 2);
        let lru = LruRing::new(num_blocks, config.division_limit, config.age_threshold);
        Inner {
            config,
            blocks,
            free_blocks,
            hash_index,
            lru,
            clock: 0,
            can_be_used: num_blocks >= MIN_BLOCKS,
            in_resize: false,
            cnt_for_resize_op: 0,
            waiting_for_block: WaitingForBlock::default(),
            files: HashMap::new(),
            stats: CacheStatsInner::default(),
        }
    }
}

/// Outcome of a single `lookup_or_assign` call (spec.md §4.3 cases A-E).
enum LookupOutcome {
    /// cache disabled or mid-resize with no existing entry: caller performs
    /// uncached, direct I/O.
    Bypass,
    /// block already holds valid data.
    Read(BlockId),
    /// block just bound (fresh or by eviction); caller is the primary
    /// reader and must perform the actual disk read.
    ToBeRead(BlockId),
    /// block bound but another thread is already reading it in; caller
    /// must wait on its `requested` queue.
    WaitToBeRead(BlockId),
}

enum WaitQueue {
    Saved,
    Requested,
    Readers,
}

pub struct KeyCache<IO: PositionedIo> {
    io: Arc<IO>,
    inner: Mutex<Inner>,
    hash_link_freed: Condvar,
    block_freed: Condvar,
    binding_done: Condvar,
    resize_done: Condvar,
}

impl<IO: PositionedIo> KeyCache<IO> {
    pub fn init(io: Arc<IO>, config: KeyCacheConfig) -> Result<Self> {
        let num_blocks = Inner::layout(&config).ok_or_else(|| {
            CacheError::InvalidConfig("block_size and memory_size must be non-zero".into())
        })?;
        if num_blocks < MIN_BLOCKS {
            return Err(CacheError::InvalidConfig(format!(
                "memory_size {} / block_size {} yields {} blocks, below the minimum of {}",
                config.memory_size, config.block_size, num_blocks, MIN_BLOCKS
            )));
        }
        info!(num_blocks, block_size = config.block_size, "key cache initialised");
        Ok(KeyCache {
            io,
            inner: Mutex::new(Inner::rebuild(config, num_blocks)),
            hash_link_freed: Condvar::new(),
            block_freed: Condvar::new(),
            binding_done: Condvar::new(),
            resize_done: Condvar::new(),
        })
    }

    pub fn change_param(&self, division_limit: u32, age_threshold: u32) {
        let mut g = self.inner.lock();
        let n = g.blocks.len();
        g.lru.change_param(n, division_limit, age_threshold);
        if division_limit > 0 {
            g.config.division_limit = division_limit;
        }
        if age_threshold > 0 {
            g.config.age_threshold = age_threshold;
        }
    }

    pub fn reset_counters(&self) {
        self.inner.lock().stats = CacheStatsInner::default();
    }

    pub fn end(&self, _cleanup: bool) {
        let mut g = self.inner.lock();
        g.blocks.clear();
        g.free_blocks.clear();
        g.hash_index = HashIndex::new(0);
        g.files.clear();
        g.can_be_used = false;
    }

    pub fn stats(&self) -> CacheStats {
        let g = self.inner.lock();
        let blocks_total = g.blocks.len();
        let blocks_used = blocks_total - g.free_blocks.len();
        let blocks_changed = g.blocks.iter().filter(|b| b.status.is_changed()).count();
        CacheStats {
            blocks_total,
            blocks_used,
            blocks_unused: blocks_total - blocks_used,
            blocks_changed,
            blocks_warm: g.lru.warm_blocks,
            blocks_hot: g.lru.hot_blocks,
            read_requests: g.stats.read_requests,
            reads: g.stats.reads,
            write_requests: g.stats.write_requests,
            writes: g.stats.writes,
        }
    }

    /// Two-phase resize (spec.md §4.6): flush everything, drain in-flight
    /// resize-bypass I/O, then rebuild with the new geometry. Dropping
    /// below [`MIN_BLOCKS`] disables the cache instead of failing.
    pub fn resize(
        &self,
        new_block_size: usize,
        new_memory_size: usize,
        division_limit: u32,
        age_threshold: u32,
    ) -> Result<usize> {
        {
            let mut g = self.inner.lock();
            if g.in_resize {
                return Err(CacheError::ResizeInProgress);
            }
            g.in_resize = true;
        }

        let files: Vec<FileId> = self.inner.lock().files.keys().copied().collect();
        for file in files {
            self.flush(file, FlushType::Keep)?;
        }

        let mut g = self.inner.lock();
        while g.cnt_for_resize_op > 0 {
            self.resize_done.wait(&mut g);
        }

        let new_config = KeyCacheConfig {
            block_size: new_block_size,
            memory_size: new_memory_size,
            division_limit,
            age_threshold,
        };
        let num_blocks = Inner::layout(&new_config).unwrap_or(0);
        if num_blocks < MIN_BLOCKS {
            *g = Inner::rebuild(new_config, 0);
            g.can_be_used = false;
            self.resize_done.notify_all();
            warn!(num_blocks, "key cache disabled: below minimum block count after resize");
            return Ok(0);
        }

        *g = Inner::rebuild(new_config, num_blocks);
        self.resize_done.notify_all();
        info!(num_blocks, "key cache resized");
        Ok(num_blocks)
    }

    fn direct_read(&self, file: FileId, offset: u64, buf: &mut [u8]) -> Result<()> {
        let n = self.io.pread(file, buf, offset)?;
        if n != buf.len() {
            return Err(CacheError::ShortTransfer { file, offset, expected: buf.len(), actual: n });
        }
        Ok(())
    }

    fn direct_write(&self, file: FileId, offset: u64, buf: &[u8]) -> Result<()> {
        let n = self.io.pwrite(file, buf, offset, false)?;
        if n != buf.len() {
            return Err(CacheError::ShortTransfer { file, offset, expected: buf.len(), actual: n });
        }
        Ok(())
    }

    /// Wait on `cv`, respecting `ctx`'s debug timeout if set.
    fn cond_wait(&self, cv: &Condvar, guard: &mut MutexGuard<'_, Inner>, ctx: &CacheContext) -> Result<()> {
        match ctx.debug_timeout {
            Some(d) => {
                if cv.wait_for(guard, d).timed_out() {
                    return Err(CacheError::WaitTimeout(d));
                }
                Ok(())
            }
            None => {
                cv.wait(guard);
                Ok(())
            }
        }
    }

    fn wait_on(
        &self,
        guard: &mut MutexGuard<'_, Inner>,
        block_id: BlockId,
        which: WaitQueue,
        ctx: &CacheContext,
    ) -> Result<()> {
        let cv = match which {
            WaitQueue::Saved => guard.blocks[block_id].wqueues.saved.clone(),
            WaitQueue::Requested => guard.blocks[block_id].wqueues.requested.clone(),
            WaitQueue::Readers => guard.blocks[block_id].wqueues.readers.clone(),
        };
        self.cond_wait(&cv, guard, ctx)
    }

    /// spec.md §4.3: resolve `(file, offset)` to a block, creating and/or
    /// evicting as necessary. Returns with the hash-link's and (if any)
    /// block's request counters already incremented on behalf of the
    /// caller; the caller must eventually call [`Self::unreserve`].
    fn lookup_or_assign(
        &self,
        guard: &mut MutexGuard<'_, Inner>,
        ctx: &CacheContext,
        file: FileId,
        offset: u64,
        wrmode: bool,
    ) -> Result<(HashLinkId, LookupOutcome)> {
        'acquire: loop {
            let hash_link_id = loop {
                if let Some(id) = guard.hash_index.find_or_create(file, offset) {
                    break id;
                }
                self.cond_wait(&self.hash_link_freed, guard, ctx)?;
            };
            guard.hash_index.get_mut(hash_link_id).requests += 1;

            if guard.in_resize {
                self.drop_reservation(guard, hash_link_id);
                return Ok((hash_link_id, LookupOutcome::Bypass));
            }

            'block: loop {
                let existing_block = guard.hash_index.get(hash_link_id).block;
                match existing_block {
                    Some(block_id) => match guard.blocks[block_id].status.phase() {
                        Phase::Read => {
                            if wrmode && guard.blocks[block_id].status.is_in_flush() {
                                self.wait_on(guard, block_id, WaitQueue::Saved, ctx)?;
                                continue 'block;
                            }
                            guard.lru.unlink_if_present(&mut guard.blocks, block_id);
                            guard.blocks[block_id].requests += 1;
                            return Ok((hash_link_id, LookupOutcome::Read(block_id)));
                        }
                        Phase::ToBeRead => {
                            // `requests == 0` means `unreserve` handed this block off
                            // asynchronously and nobody has claimed the read yet; the
                            // first thread to observe that becomes the primary reader.
                            if guard.blocks[block_id].requests == 0 {
                                guard.blocks[block_id].requests += 1;
                                return Ok((hash_link_id, LookupOutcome::ToBeRead(block_id)));
                            }
                            guard.blocks[block_id].requests += 1;
                            return Ok((hash_link_id, LookupOutcome::WaitToBeRead(block_id)));
                        }
                        Phase::InSwitch => {
                            if !wrmode {
                                guard.blocks[block_id].requests += 1;
                                return Ok((hash_link_id, LookupOutcome::Read(block_id)));
                            }
                            self.drop_reservation(guard, hash_link_id);
                            self.wait_on(guard, block_id, WaitQueue::Saved, ctx)?;
                            continue 'acquire;
                        }
                        Phase::Reassigned => {
                            self.drop_reservation(guard, hash_link_id);
                            self.wait_on(guard, block_id, WaitQueue::Saved, ctx)?;
                            continue 'acquire;
                        }
                        Phase::Free => unreachable!("bound block cannot be Free"),
                    },
                    None => {
                        if guard.hash_index.get(hash_link_id).binding_in_progress {
                            self.cond_wait(&self.binding_done, guard, ctx)?;
                            continue 'block;
                        }
                        guard.hash_index.get_mut(hash_link_id).binding_in_progress = true;

                        if let Some(block_id) = guard.free_blocks.pop() {
                            self.bind_fresh(guard, hash_link_id, block_id, file);
                            return Ok((hash_link_id, LookupOutcome::ToBeRead(block_id)));
                        } else if let Some(victim) = guard.lru.take_oldest_warm(&mut guard.blocks) {
                            let block_id = self.reassign(guard, ctx, victim, hash_link_id, file)?;
                            return Ok((hash_link_id, LookupOutcome::ToBeRead(block_id)));
                        } else {
                            guard.waiting_for_block.push(hash_link_id);
                            let wait_res = self.cond_wait(&self.block_freed, guard, ctx);
                            guard.waiting_for_block.remove(hash_link_id);
                            wait_res?;
                            continue 'block;
                        }
                    }
                }
            }
        }
    }

    fn drop_reservation(&self, guard: &mut MutexGuard<'_, Inner>, hash_link_id: HashLinkId) {
        let hl = guard.hash_index.get_mut(hash_link_id);
        hl.requests -= 1;
        if hl.requests == 0 && hl.block.is_none() && !hl.binding_in_progress {
            guard.hash_index.release(hash_link_id);
            self.hash_link_freed.notify_all();
        }
    }

    fn bind_fresh(&self, guard: &mut MutexGuard<'_, Inner>, hash_link_id: HashLinkId, block_id: BlockId, file: FileId) {
        let block = &mut guard.blocks[block_id];
        block.hash_link = Some(hash_link_id);
        block.status = block::BlockStatus::to_be_read();
        block.requests = 1;
        link_clean(&mut guard.files, &mut guard.blocks, file, block_id);
        guard.hash_index.get_mut(hash_link_id).block = Some(block_id);
        guard.hash_index.get_mut(hash_link_id).binding_in_progress = false;
        self.binding_done.notify_all();
    }

    /// Evict `victim` (already unlinked from the LRU ring) in favour of
    /// `hash_link_id`'s `(file, offset)`: write back if dirty, drain
    /// readers of the old position, then rebind.
    fn reassign(
        &self,
        guard: &mut MutexGuard<'_, Inner>,
        ctx: &CacheContext,
        victim: BlockId,
        hash_link_id: HashLinkId,
        file: FileId,
    ) -> Result<BlockId> {
        let old_hash_link = guard.blocks[victim].hash_link.expect("ring block must be bound");
        guard.blocks[victim].status.begin_switch();

        if guard.blocks[victim].status.is_changed() {
            let old_file = guard.hash_index.get(old_hash_link).file;
            let old_offset = guard.hash_index.get(old_hash_link).offset;
            let len = guard.blocks[victim].length;
            let buf = guard.blocks[victim].buffer[..len].to_vec();
            MutexGuard::unlocked(guard, || self.direct_write(old_file, old_offset, &buf))?;
            guard.blocks[victim].status.clear_changed();
            unlink_current(&mut guard.files, &mut guard.blocks, old_file, victim);
        }

        guard.blocks[victim].status.mark_reassigned();
        while guard.hash_index.get(old_hash_link).requests > 0 {
            self.wait_on(guard, victim, WaitQueue::Readers, ctx)?;
        }

        let old_file = guard.hash_index.get(old_hash_link).file;
        if guard.blocks[victim].on_changed_chain || guard.blocks[victim].chain_prev.is_some() {
            unlink_current(&mut guard.files, &mut guard.blocks, old_file, victim);
        }
        guard.hash_index.release(old_hash_link);
        self.hash_link_freed.notify_all();

        guard.blocks[victim].hash_link = Some(hash_link_id);
        guard.blocks[victim].status.rebind_to_be_read();
        guard.blocks[victim].requests = 1;
        link_clean(&mut guard.files, &mut guard.blocks, file, victim);
        guard.hash_index.get_mut(hash_link_id).block = Some(victim);
        guard.hash_index.get_mut(hash_link_id).binding_in_progress = false;
        self.binding_done.notify_all();
        Ok(victim)
    }

    /// Release one logical user of `block_id`/`hash_link_id`. When the
    /// block's request count drops to zero, either hand it straight to a
    /// waiting hash-link (spec.md §4.3 step 5c) or return it to the LRU
    /// ring.
    fn unreserve(&self, guard: &mut MutexGuard<'_, Inner>, hash_link_id: HashLinkId, block_id: BlockId, at_end: bool, ctx: &CacheContext) -> Result<()> {
        guard.hash_index.get_mut(hash_link_id).requests -= 1;
        guard.blocks[block_id].requests -= 1;
        if guard.blocks[block_id].requests > 0 {
            return Ok(());
        }
        guard.blocks[block_id].wqueues.readers.notify_all();

        if let Some(waiter) = guard.waiting_for_block.pop_front() {
            // Same switch protocol as `reassign`: write the old content
            // back if dirty, drain any reader that slipped in during the
            // unlocked write, then rebind. Unlike `reassign`, the thread
            // doing this work is not the one that will read the new
            // content in, so the rebound block is left at `requests == 0`:
            // the first thread to observe it at `Phase::ToBeRead` with no
            // requests outstanding becomes the primary reader (see the
            // `lookup_or_assign` `Phase::ToBeRead` arm).
            guard.blocks[block_id].status.begin_switch();

            if guard.blocks[block_id].status.is_changed() {
                let old_file = guard.hash_index.get(hash_link_id).file;
                let old_offset = guard.hash_index.get(hash_link_id).offset;
                let len = guard.blocks[block_id].length;
                let buf = guard.blocks[block_id].buffer[..len].to_vec();
                MutexGuard::unlocked(guard, || self.direct_write(old_file, old_offset, &buf))?;
                guard.blocks[block_id].status.clear_changed();
                unlink_current(&mut guard.files, &mut guard.blocks, old_file, block_id);
            }

            guard.blocks[block_id].status.mark_reassigned();
            while guard.hash_index.get(hash_link_id).requests > 0 {
                self.wait_on(guard, block_id, WaitQueue::Readers, ctx)?;
            }

            let old_file = guard.hash_index.get(hash_link_id).file;
            if guard.blocks[block_id].on_changed_chain || guard.blocks[block_id].chain_prev.is_some() {
                unlink_current(&mut guard.files, &mut guard.blocks, old_file, block_id);
            }
            guard.hash_index.get_mut(hash_link_id).block = None;
            guard.hash_index.release(hash_link_id);
            self.hash_link_freed.notify_all();

            let new_file = guard.hash_index.get(waiter).file;
            guard.blocks[block_id].status = block::BlockStatus::to_be_read();
            guard.blocks[block_id].hash_link = Some(waiter);
            guard.blocks[block_id].requests = 0;
            link_clean(&mut guard.files, &mut guard.blocks, new_file, block_id);
            guard.hash_index.get_mut(waiter).block = Some(block_id);
            guard.hash_index.get_mut(waiter).binding_in_progress = false;
            self.binding_done.notify_all();
            self.block_freed.notify_all();
            Ok(())
        } else {
            guard.clock += 1;
            let clock = guard.clock;
            guard.lru.release(&mut guard.blocks, block_id, at_end, clock);
            Ok(())
        }
    }

    /// A block errored out mid-read: detach it from its hash-link and
    /// return it to the free pool once the last waiter has noticed.
    fn release_errored(&self, guard: &mut MutexGuard<'_, Inner>, hash_link_id: HashLinkId, block_id: BlockId) {
        guard.hash_index.get_mut(hash_link_id).requests -= 1;
        guard.blocks[block_id].requests -= 1;
        if guard.blocks[block_id].requests == 0 {
            let file = guard.hash_index.get(hash_link_id).file;
            unlink_current(&mut guard.files, &mut guard.blocks, file, block_id);
            guard.blocks[block_id].status = block::BlockStatus::free();
            guard.blocks[block_id].hash_link = None;
            guard.free_blocks.push(block_id);
        }
        let hl = guard.hash_index.get(hash_link_id);
        if hl.requests == 0 && hl.block.is_none() {
            guard.hash_index.release(hash_link_id);
            self.hash_link_freed.notify_all();
        }
    }

    /// Read `dest.len()` bytes of `file` at `offset` through the cache,
    /// splitting on `block_size` boundaries.
    pub fn read(&self, file: FileId, offset: u64, dest: &mut [u8]) -> Result<()> {
        self.read_with(&CacheContext::current(), file, offset, dest)
    }

    pub fn read_with(&self, ctx: &CacheContext, file: FileId, offset: u64, dest: &mut [u8]) -> Result<()> {
        let block_size = { self.inner.lock().config.block_size.max(1) };
        let mut done = 0;
        while done < dest.len() {
            let piece_offset = offset + done as u64;
            let piece_len = block_size.min(dest.len() - done);
            self.read_piece(ctx, file, piece_offset, &mut dest[done..done + piece_len])?;
            done += piece_len;
        }
        Ok(())
    }

    fn read_piece(&self, ctx: &CacheContext, file: FileId, piece_offset: u64, dest: &mut [u8]) -> Result<()> {
        let mut guard = self.inner.lock();
        loop {
            if !guard.can_be_used {
                drop(guard);
                return self.direct_read(file, piece_offset, dest);
            }

            if guard.in_resize && guard.hash_index.lookup(file, piece_offset).is_none() {
                guard.cnt_for_resize_op += 1;
                drop(guard);
                let res = self.direct_read(file, piece_offset, dest);
                let mut g = self.inner.lock();
                g.cnt_for_resize_op -= 1;
                if g.cnt_for_resize_op == 0 {
                    self.resize_done.notify_all();
                }
                return res;
            }

            let (hash_link_id, outcome) = self.lookup_or_assign(&mut guard, ctx, file, piece_offset, false)?;
            match outcome {
                LookupOutcome::Bypass => {
                    drop(guard);
                    return self.direct_read(file, piece_offset, dest);
                }
                LookupOutcome::Read(block_id) => {
                    let n = dest.len().min(guard.blocks[block_id].buffer.len());
                    dest[..n].copy_from_slice(&guard.blocks[block_id].buffer[..n]);
                    guard.stats.read_requests += 1;
                    self.unreserve(&mut guard, hash_link_id, block_id, true, ctx)?;
                    return Ok(());
                }
                LookupOutcome::ToBeRead(block_id) => {
                    let block_size = guard.blocks[block_id].buffer.len();
                    drop(guard);
                    let mut buf = vec![0u8; block_size];
                    let io_res = self.direct_read(file, piece_offset, &mut buf);
                    let mut g = self.inner.lock();
                    match io_res {
                        Ok(()) => {
                            g.blocks[block_id].buffer.copy_from_slice(&buf);
                            g.blocks[block_id].status.mark_read();
                            g.blocks[block_id].wqueues.requested.notify_all();
                            let n = dest.len().min(buf.len());
                            dest[..n].copy_from_slice(&buf[..n]);
                            g.stats.read_requests += 1;
                            g.stats.reads += 1;
                            self.unreserve(&mut g, hash_link_id, block_id, true, ctx)?;
                            return Ok(());
                        }
                        Err(e) => {
                            g.blocks[block_id].status.mark_error();
                            g.hash_index.get_mut(hash_link_id).block = None;
                            g.blocks[block_id].wqueues.requested.notify_all();
                            self.release_errored(&mut g, hash_link_id, block_id);
                            return Err(e);
                        }
                    }
                }
                LookupOutcome::WaitToBeRead(block_id) => loop {
                    self.wait_on(&mut guard, block_id, WaitQueue::Requested, ctx)?;
                    let status = guard.blocks[block_id].status;
                    if status.is_error() {
                        self.release_errored(&mut guard, hash_link_id, block_id);
                        return Err(CacheError::BlockError { file, offset: piece_offset });
                    }
                    if status.is_read() {
                        let n = dest.len().min(guard.blocks[block_id].buffer.len());
                        dest[..n].copy_from_slice(&guard.blocks[block_id].buffer[..n]);
                        guard.stats.read_requests += 1;
                        self.unreserve(&mut guard, hash_link_id, block_id, true, ctx)?;
                        return Ok(());
                    }
                    // spurious wake, still ToBeRead: loop and wait again.
                },
            }
        }
    }

    /// Register freshly-produced block content without reading the old
    /// value from disk first (spec.md's `insert`): used when a page is
    /// written for the first time.
    pub fn insert(&self, file: FileId, offset: u64, src: &[u8]) -> Result<()> {
        self.insert_with(&CacheContext::current(), file, offset, src)
    }

    pub fn insert_with(&self, ctx: &CacheContext, file: FileId, offset: u64, src: &[u8]) -> Result<()> {
        let mut guard = self.inner.lock();
        if !guard.can_be_used {
            drop(guard);
            return self.direct_write(file, offset, src);
        }
        let (hash_link_id, outcome) = self.lookup_or_assign(&mut guard, ctx, file, offset, true)?;
        match outcome {
            LookupOutcome::Bypass => {
                drop(guard);
                self.direct_write(file, offset, src)
            }
            LookupOutcome::ToBeRead(block_id) => {
                let n = src.len().min(guard.blocks[block_id].buffer.len());
                guard.blocks[block_id].buffer[..n].copy_from_slice(&src[..n]);
                guard.blocks[block_id].status.mark_read();
                guard.blocks[block_id].status.mark_changed();
                link_changed(&mut guard.files, &mut guard.blocks, file, block_id);
                guard.blocks[block_id].wqueues.requested.notify_all();
                guard.stats.write_requests += 1;
                self.unreserve(&mut guard, hash_link_id, block_id, true, ctx)?;
                Ok(())
            }
            LookupOutcome::Read(block_id) | LookupOutcome::WaitToBeRead(block_id) => {
                let n = src.len().min(guard.blocks[block_id].buffer.len());
                guard.blocks[block_id].buffer[..n].copy_from_slice(&src[..n]);
                if !guard.blocks[block_id].status.is_changed() {
                    guard.blocks[block_id].status.mark_changed();
                    unlink_current(&mut guard.files, &mut guard.blocks, file, block_id);
                    link_changed(&mut guard.files, &mut guard.blocks, file, block_id);
                }
                guard.stats.write_requests += 1;
                self.unreserve(&mut guard, hash_link_id, block_id, true, ctx)?;
                Ok(())
            }
        }
    }

    /// Overlay `src` onto the cached page at `offset` (spec.md's `write`).
    /// `dont_write`: defer the write-through and just mark the block dirty;
    /// otherwise write the modified bytes through to disk immediately.
    pub fn write(&self, file: FileId, offset: u64, src: &[u8], dont_write: bool) -> Result<()> {
        self.write_with(&CacheContext::current(), file, offset, src, dont_write)
    }

    pub fn write_with(
        &self,
        ctx: &CacheContext,
        file: FileId,
        offset: u64,
        src: &[u8],
        dont_write: bool,
    ) -> Result<()> {
        let mut guard = self.inner.lock();
        if !guard.can_be_used {
            drop(guard);
            return self.direct_write(file, offset, src);
        }
        let (hash_link_id, outcome) = self.lookup_or_assign(&mut guard, ctx, file, offset, true)?;
        let block_id = match outcome {
            LookupOutcome::Bypass => {
                drop(guard);
                return self.direct_write(file, offset, src);
            }
            LookupOutcome::Read(id) => id,
            LookupOutcome::ToBeRead(id) => {
                // a whole-block overwrite never needs the stale content.
                if src.len() < guard.blocks[id].buffer.len() {
                    let block_size = guard.blocks[id].buffer.len();
                    drop(guard);
                    let mut buf = vec![0u8; block_size];
                    let io_res = self.direct_read(file, offset, &mut buf);
                    let mut g = self.inner.lock();
                    match io_res {
                        Ok(()) => g.blocks[id].buffer.copy_from_slice(&buf),
                        Err(e) => {
                            g.blocks[id].status.mark_error();
                            g.hash_index.get_mut(hash_link_id).block = None;
                            g.blocks[id].wqueues.requested.notify_all();
                            self.release_errored(&mut g, hash_link_id, id);
                            return Err(e);
                        }
                    }
                    guard = g;
                }
                guard.blocks[id].status.mark_read();
                guard.blocks[id].wqueues.requested.notify_all();
                id
            }
            LookupOutcome::WaitToBeRead(id) => {
                loop {
                    self.wait_on(&mut guard, id, WaitQueue::Requested, ctx)?;
                    let status = guard.blocks[id].status;
                    if status.is_error() {
                        self.release_errored(&mut guard, hash_link_id, id);
                        return Err(CacheError::BlockError { file, offset });
                    }
                    if status.is_read() {
                        break;
                    }
                }
                id
            }
        };

        let n = src.len().min(guard.blocks[block_id].buffer.len());
        guard.blocks[block_id].buffer[..n].copy_from_slice(&src[..n]);
        guard.stats.write_requests += 1;

        if dont_write {
            if !guard.blocks[block_id].status.is_changed() {
                guard.blocks[block_id].status.mark_changed();
                unlink_current(&mut guard.files, &mut guard.blocks, file, block_id);
                link_changed(&mut guard.files, &mut guard.blocks, file, block_id);
            }
            self.unreserve(&mut guard, hash_link_id, block_id, true, ctx)?;
            Ok(())
        } else {
            let buf = guard.blocks[block_id].buffer[..n].to_vec();
            MutexGuard::unlocked(&mut guard, || self.direct_write(file, offset, &buf))?;
            if guard.blocks[block_id].status.is_changed() {
                guard.blocks[block_id].status.clear_changed();
                unlink_current(&mut guard.files, &mut guard.blocks, file, block_id);
                link_clean(&mut guard.files, &mut guard.blocks, file, block_id);
            }
            guard.stats.writes += 1;
            self.unreserve(&mut guard, hash_link_id, block_id, true, ctx)?;
            Ok(())
        }
    }

    /// Flush `file`'s changed chain (spec.md §4.5). Aborts after 5
    /// consecutive identical I/O errors, surfacing `FlushAborted`.
    pub fn flush(&self, file: FileId, mode: FlushType) -> Result<()> {
        self.flush_with(&CacheContext::current(), file, mode)
    }

    pub fn flush_with(&self, ctx: &CacheContext, file: FileId, mode: FlushType) -> Result<()> {
        const MAX_CONSECUTIVE_ERRORS: u32 = 5;
        let mut consecutive_errors = 0u32;
        loop {
            let mut guard = self.inner.lock();
            let block_id = match guard.files.get(&file).and_then(|c| c.changed.head) {
                Some(id) => id,
                None => return Ok(()),
            };

            if mode == FlushType::IgnoreChanged {
                guard.blocks[block_id].status.clear_changed();
                unlink_current(&mut guard.files, &mut guard.blocks, file, block_id);
                link_clean(&mut guard.files, &mut guard.blocks, file, block_id);
                continue;
            }

            if mode != FlushType::Keep {
                while guard.blocks[block_id].status.is_in_flush() {
                    self.wait_on(&mut guard, block_id, WaitQueue::Saved, ctx)?;
                }
            }
            if !guard.blocks[block_id].status.is_changed() {
                continue; // someone else flushed it while we waited
            }

            guard.blocks[block_id].status.begin_flush();
            guard.blocks[block_id].status.begin_flushwrite();
            let len = guard.blocks[block_id].length;
            let page_offset = guard.blocks[block_id]
                .hash_link
                .map(|hl| guard.hash_index.get(hl).offset)
                .unwrap_or(0);
            let buf = guard.blocks[block_id].buffer[..len].to_vec();

            let write_res = MutexGuard::unlocked(&mut guard, || self.direct_write(file, page_offset, &buf));
            guard.blocks[block_id].status.end_flushwrite();
            guard.blocks[block_id].status.end_flush();

            match write_res {
                Ok(()) => {
                    consecutive_errors = 0;
                    guard.blocks[block_id].status.clear_changed();
                    guard.blocks[block_id].wqueues.saved.notify_all();
                    unlink_current(&mut guard.files, &mut guard.blocks, file, block_id);
                    guard.stats.writes += 1;

                    if mode == FlushType::Release && guard.blocks[block_id].requests == 0 {
                        let hash_link_id = guard.blocks[block_id]
                            .hash_link
                            .expect("changed block must be bound");
                        guard.lru.unlink_if_present(&mut guard.blocks, block_id);
                        guard.blocks[block_id].status = block::BlockStatus::free();
                        guard.blocks[block_id].hash_link = None;
                        guard.hash_index.get_mut(hash_link_id).block = None;
                        if guard.hash_index.get(hash_link_id).requests == 0 {
                            guard.hash_index.release(hash_link_id);
                            self.hash_link_freed.notify_all();
                        }
                        guard.free_blocks.push(block_id);
                    } else {
                        link_clean(&mut guard.files, &mut guard.blocks, file, block_id);
                    }
                }
                Err(e) => {
                    guard.blocks[block_id].wqueues.saved.notify_all();
                    consecutive_errors += 1;
                    trace!(?e, consecutive_errors, "flush write failed");
                    if consecutive_errors >= MAX_CONSECUTIVE_ERRORS {
                        return Err(CacheError::FlushAborted { attempts: consecutive_errors });
                    }
                }
            }
        }
    }

    // -- Page-cache support (spec.md §4.8) ---------------------------------
    //
    // The plain key cache API (`read`/`write`/`insert`) only ever holds a
    // block reserved for the duration of one call. The page cache needs to
    // keep a block resident and pinned across several logical lock/unlock
    // calls, so it reaches into these `pub(crate)` primitives instead of
    // going through `lookup_or_assign` itself.

    /// Resolve `(file, offset)` to a block, reading it in if necessary, and
    /// leave it reserved (`requests` incremented) rather than releasing it.
    /// Caller must eventually call [`Self::pin_release`].
    pub(crate) fn pin_fetch(&self, ctx: &CacheContext, file: FileId, offset: u64) -> Result<(HashLinkId, BlockId)> {
        let mut guard = self.inner.lock();
        if !guard.can_be_used {
            return Err(CacheError::CacheDisabled);
        }
        loop {
            let (hash_link_id, outcome) = self.lookup_or_assign(&mut guard, ctx, file, offset, false)?;
            match outcome {
                LookupOutcome::Bypass => return Err(CacheError::CacheDisabled),
                LookupOutcome::Read(block_id) => return Ok((hash_link_id, block_id)),
                LookupOutcome::ToBeRead(block_id) => {
                    let block_size = guard.blocks[block_id].buffer.len();
                    drop(guard);
                    let mut buf = vec![0u8; block_size];
                    let io_res = self.direct_read(file, offset, &mut buf);
                    let mut g = self.inner.lock();
                    match io_res {
                        Ok(()) => {
                            g.blocks[block_id].buffer.copy_from_slice(&buf);
                            g.blocks[block_id].status.mark_read();
                            g.blocks[block_id].wqueues.requested.notify_all();
                            return Ok((hash_link_id, block_id));
                        }
                        Err(e) => {
                            g.blocks[block_id].status.mark_error();
                            g.hash_index.get_mut(hash_link_id).block = None;
                            g.blocks[block_id].wqueues.requested.notify_all();
                            self.release_errored(&mut g, hash_link_id, block_id);
                            return Err(e);
                        }
                    }
                }
                LookupOutcome::WaitToBeRead(block_id) => loop {
                    self.wait_on(&mut guard, block_id, WaitQueue::Requested, ctx)?;
                    let status = guard.blocks[block_id].status;
                    if status.is_error() {
                        self.release_errored(&mut guard, hash_link_id, block_id);
                        return Err(CacheError::BlockError { file, offset });
                    }
                    if status.is_read() {
                        return Ok((hash_link_id, block_id));
                    }
                },
            }
        }
    }

    /// Release a reservation taken by [`Self::pin_fetch`].
    pub(crate) fn pin_release(&self, ctx: &CacheContext, hash_link_id: HashLinkId, block_id: BlockId, at_end: bool) -> Result<()> {
        let mut guard = self.inner.lock();
        self.unreserve(&mut guard, hash_link_id, block_id, at_end, ctx)
    }

    /// Forcibly detach a block from its hash-link and return it to the
    /// free pool, regardless of changed/clean chain membership. Used by
    /// `PageCache::delete_page`.
    pub(crate) fn delete_block(&self, file: FileId, hash_link_id: HashLinkId, block_id: BlockId) {
        let mut guard = self.inner.lock();
        unlink_current(&mut guard.files, &mut guard.blocks, file, block_id);
        guard.lru.unlink_if_present(&mut guard.blocks, block_id);
        guard.blocks[block_id].status = block::BlockStatus::free();
        guard.blocks[block_id].hash_link = None;
        if let Some(bid) = guard.hash_index.get_mut(hash_link_id).block.take() {
            debug_assert_eq!(bid, block_id);
        }
        if guard.hash_index.get(hash_link_id).requests == 0 {
            guard.hash_index.release(hash_link_id);
            self.hash_link_freed.notify_all();
        }
        guard.free_blocks.push(block_id);
    }

    pub(crate) fn with_buffer<R>(&self, block_id: BlockId, f: impl FnOnce(&mut [u8]) -> R) -> R {
        let mut guard = self.inner.lock();
        f(&mut guard.blocks[block_id].buffer)
    }

    /// Mark a pinned block dirty and move it onto `file`'s changed chain,
    /// without going through a full `write`/`insert` call.
    pub(crate) fn mark_dirty(&self, file: FileId, block_id: BlockId) {
        let mut guard = self.inner.lock();
        if !guard.blocks[block_id].status.is_changed() {
            guard.blocks[block_id].status.mark_changed();
            unlink_current(&mut guard.files, &mut guard.blocks, file, block_id);
            link_changed(&mut guard.files, &mut guard.blocks, file, block_id);
        }
    }

    /// Write a pinned block's current buffer contents through to disk
    /// immediately, clearing its dirty bit on success.
    pub(crate) fn write_through_block(&self, file: FileId, offset: u64, block_id: BlockId) -> Result<()> {
        let mut guard = self.inner.lock();
        let len = guard.blocks[block_id].length;
        let buf = guard.blocks[block_id].buffer[..len].to_vec();
        MutexGuard::unlocked(&mut guard, || self.direct_write(file, offset, &buf))?;
        if guard.blocks[block_id].status.is_changed() {
            guard.blocks[block_id].status.clear_changed();
            unlink_current(&mut guard.files, &mut guard.blocks, file, block_id);
            link_clean(&mut guard.files, &mut guard.blocks, file, block_id);
        }
        guard.stats.writes += 1;
        Ok(())
    }

    pub(crate) fn adjust_pins(&self, block_id: BlockId, delta: i32) {
        let mut guard = self.inner.lock();
        let pins = &mut guard.blocks[block_id].pins;
        *pins = (*pins as i32 + delta).max(0) as u32;
    }

    /// Acquire the block's exclusive write-lock bit (spec.md §4.8), waiting
    /// out any current holder first.
    pub(crate) fn begin_wrlock(&self, ctx: &CacheContext, block_id: BlockId) -> Result<()> {
        let mut guard = self.inner.lock();
        while guard.blocks[block_id].status.is_wrlocked() {
            let cv = guard.blocks[block_id].wqueues.wrlock.clone();
            self.cond_wait(&cv, &mut guard, ctx)?;
        }
        guard.blocks[block_id].status.begin_wrlock();
        Ok(())
    }

    pub(crate) fn end_wrlock(&self, block_id: BlockId) {
        let mut guard = self.inner.lock();
        guard.blocks[block_id].status.end_wrlock();
        guard.blocks[block_id].wqueues.wrlock.notify_all();
    }
}
