//! Cache-wide (not per-block) wait queues: spec.md §4.3 step 1
//! (`waiting_for_hash_link`) and step 5c (`waiting_for_block`).
//!
//! Per-block queues (`REQUESTED`/`SAVED`/`READERS`) live on
//! [`crate::keycache::block::BlockWaitQueues`] instead, since their
//! identity is tied to one block.

use parking_lot::Condvar;
use std::collections::VecDeque;

use crate::keycache::hashlink::HashLinkId;

/// FIFO of hash-links waiting for a block to become free, keyed by
/// hash-link id so the releaser can hand the newly-freed block straight
/// to the first waiter (spec.md: "atomically assigns the newly free
/// block to the first waiting hash-link, marking it IN_EVICTION").
#[derive(Default)]
pub struct WaitingForBlock {
    pub queue: VecDeque<HashLinkId>,
    pub condvar: Condvar,
}

impl WaitingForBlock {
    pub fn push(&mut self, id: HashLinkId) {
        self.queue.push_back(id);
    }

    pub fn pop_front(&mut self) -> Option<HashLinkId> {
        self.queue.pop_front()
    }

    pub fn remove(&mut self, id: HashLinkId) {
        self.queue.retain(|&x| x != id);
    }
}
