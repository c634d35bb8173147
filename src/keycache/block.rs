//! Block headers and the block-status state machine (spec.md §3, §4.3).
//!
//! Raw MySQL `mf_keycache.c` represents status as an `int` bitmask
//! (`BLOCK_READ`, `BLOCK_IN_SWITCH`, ...). Per DESIGN NOTES we replace the
//! bitmask with a small struct whose constructors enforce the legal
//! combinations from the §4.3 state table, so an illegal combination (e.g.
//! `for_update` set while the block is still unread) cannot be built.

use parking_lot::Condvar;
use std::sync::Arc;

use crate::keycache::hashlink::HashLinkId;

pub type BlockId = usize;

/// Mutually exclusive lifecycle phase of a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Not bound to any `(file, offset)`; sitting in the LRU ring or free.
    Free,
    /// Bound to a hash-link, buffer contents not yet valid
    /// (`PAGE_TO_BE_READ`).
    ToBeRead,
    /// Bound and fully read; buffer contents valid (`PAGE_READ`).
    Read,
    /// Selected for eviction, draining in-flight requests/readers
    /// (`BLOCK_IN_SWITCH`).
    InSwitch,
    /// Readers drained; no longer answers requests for the old file
    /// position, awaiting rebind (`BLOCK_REASSIGNED`).
    Reassigned,
}

/// Temperature used by the replacement engine's midpoint-insertion policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Temperature {
    Cold,
    Warm,
    Hot,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockStatus {
    phase: Phase,
    changed: bool,
    in_flush: bool,
    in_flushwrite: bool,
    in_eviction: bool,
    for_update: bool,
    error: bool,
    /// page-cache extension only: an exclusive lock is held
    wrlock: bool,
}

impl BlockStatus {
    pub fn free() -> Self {
        BlockStatus {
            phase: Phase::Free,
            changed: false,
            in_flush: false,
            in_flushwrite: false,
            in_eviction: false,
            for_update: false,
            error: false,
            wrlock: false,
        }
    }

    pub fn to_be_read() -> Self {
        BlockStatus {
            phase: Phase::ToBeRead,
            ..BlockStatus::free()
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn is_read(&self) -> bool {
        self.phase == Phase::Read
    }

    pub fn is_changed(&self) -> bool {
        self.changed
    }

    pub fn is_in_flush(&self) -> bool {
        self.in_flush
    }

    pub fn is_in_flushwrite(&self) -> bool {
        self.in_flushwrite
    }

    pub fn is_in_switch(&self) -> bool {
        self.phase == Phase::InSwitch
    }

    pub fn is_reassigned(&self) -> bool {
        self.phase == Phase::Reassigned
    }

    pub fn is_in_eviction(&self) -> bool {
        self.in_eviction
    }

    pub fn is_for_update(&self) -> bool {
        self.for_update
    }

    pub fn is_error(&self) -> bool {
        self.error
    }

    pub fn is_wrlocked(&self) -> bool {
        self.wrlock
    }

    /// Transition: I/O completed, buffer now holds valid data.
    pub fn mark_read(&mut self) {
        debug_assert_eq!(self.phase, Phase::ToBeRead);
        self.phase = Phase::Read;
    }

    /// Transition: first writer dirties a clean, fully-read block.
    /// Please do never set/clear `changed` outside of this helper and
    /// [`BlockStatus::clear_changed`] — callers must also update the
    /// controller's changed/clean chain membership atomically with this.
    pub fn mark_changed(&mut self) {
        debug_assert_eq!(self.phase, Phase::Read);
        self.changed = true;
    }

    pub fn clear_changed(&mut self) {
        debug_assert!(!self.in_flush);
        self.changed = false;
    }

    pub fn begin_flush(&mut self) {
        debug_assert!(self.changed && !self.in_flush);
        self.in_flush = true;
    }

    pub fn begin_flushwrite(&mut self) {
        debug_assert!(self.in_flush && !self.in_flushwrite);
        self.in_flushwrite = true;
    }

    pub fn end_flushwrite(&mut self) {
        self.in_flushwrite = false;
    }

    pub fn end_flush(&mut self) {
        self.in_flush = false;
    }

    pub fn begin_for_update(&mut self) {
        self.for_update = true;
    }

    pub fn end_for_update(&mut self) {
        self.for_update = false;
    }

    pub fn begin_switch(&mut self) {
        debug_assert_eq!(self.phase, Phase::Read);
        self.phase = Phase::InSwitch;
    }

    /// Eviction: readers have drained, block stops answering requests for
    /// its old file position.
    pub fn mark_reassigned(&mut self) {
        debug_assert_eq!(self.phase, Phase::InSwitch);
        self.phase = Phase::Reassigned;
    }

    /// Rebind: free this header for reuse under a new `(file, offset)`.
    pub fn rebind_to_be_read(&mut self) {
        *self = BlockStatus::to_be_read();
    }

    pub fn begin_eviction_claim(&mut self) {
        self.in_eviction = true;
    }

    pub fn end_eviction_claim(&mut self) {
        self.in_eviction = false;
    }

    pub fn mark_error(&mut self) {
        self.error = true;
    }

    pub fn begin_wrlock(&mut self) {
        self.wrlock = true;
    }

    pub fn end_wrlock(&mut self) {
        self.wrlock = false;
    }
}

/// Per-block wait queues. MySQL implements these as intrusive, per-block
/// singly/doubly linked lists of waiting threads; here each queue is a
/// `Condvar` tied to the controller's single cache mutex; `notify_all`
/// plays the role of "broadcast and let every waiter re-check its own
/// predicate", which spec.md §5 requires regardless of queue
/// implementation ("Queues are discipline-specific ... waiting waiters to
/// unlink themselves" maps directly onto "every waiter re-checks on
/// wake").
/// Each queue is an `Arc<Condvar>` rather than a bare `Condvar` so callers
/// can clone the handle out from under the cache mutex before waiting,
/// instead of holding a borrow of the block alongside the `&mut MutexGuard`
/// the wait itself needs.
#[derive(Debug, Default)]
pub struct BlockWaitQueues {
    pub requested: Arc<Condvar>,
    pub saved: Arc<Condvar>,
    pub readers: Arc<Condvar>,
    /// page-cache extension
    pub wrlock: Arc<Condvar>,
    /// page-cache extension: WAL/copy hand-off
    pub copy: Arc<Condvar>,
}

/// Fixed-size buffer plus header, the unit the replacement engine moves
/// through the LRU ring.
pub struct Block {
    pub buffer: Vec<u8>,
    pub hash_link: Option<HashLinkId>,
    pub status: BlockStatus,
    /// count of active logical users; `>0` => not in the LRU ring.
    pub requests: u32,
    pub temperature: Temperature,
    pub hits_left: u32,
    pub last_hit_time: u64,
    /// modified sub-range, for partial dirty writes.
    pub offset: usize,
    pub length: usize,
    pub wqueues: BlockWaitQueues,
    /// page-cache extension: pin count preventing flush/eviction.
    pub pins: u32,
    /// index into the previous/next warm-or-hot ring slot; `None` when the
    /// block is not currently linked into the ring (requests > 0, or the
    /// block has never been used).
    pub ring_prev: Option<BlockId>,
    pub ring_next: Option<BlockId>,
    /// per-file changed/clean chain links.
    pub chain_prev: Option<BlockId>,
    pub chain_next: Option<BlockId>,
    pub on_changed_chain: bool,
}

impl Block {
    pub fn new(block_size: usize) -> Self {
        Block {
            buffer: vec![0; block_size],
            hash_link: None,
            status: BlockStatus::free(),
            requests: 0,
            temperature: Temperature::Cold,
            hits_left: 1,
            last_hit_time: 0,
            offset: 0,
            length: block_size,
            wqueues: BlockWaitQueues::default(),
            pins: 0,
            ring_prev: None,
            ring_next: None,
            chain_prev: None,
            chain_next: None,
            on_changed_chain: false,
        }
    }

    pub fn is_free(&self) -> bool {
        self.status.phase() == Phase::Free
    }
}
