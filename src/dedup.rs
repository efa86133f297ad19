//! Bounded recency window of operation ids.
//!
//! The window is the mesh's only defence against relay loops: a message
//! entering at any peer is re-broadcast at most once per peer, because
//! each peer records the operation id the first time it sees it.
//!
//! Memory is bounded by evicting the oldest id once the window is full.
//! A very old duplicate arriving after its id was evicted would re-apply;
//! that staleness risk is accepted.

use std::collections::{HashSet, VecDeque};

use crate::protocol::OpId;

/// Default window capacity.
pub const DEFAULT_DEDUP_CAPACITY: usize = 1024;

/// Fixed-capacity sliding window of seen [`OpId`]s, oldest evicted first.
#[derive(Debug)]
pub struct DedupWindow {
    order: VecDeque<OpId>,
    seen: HashSet<OpId>,
    capacity: usize,
}

impl DedupWindow {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "dedup window needs a positive capacity");
        Self {
            order: VecDeque::with_capacity(capacity.min(4096)),
            seen: HashSet::with_capacity(capacity.min(4096)),
            capacity,
        }
    }

    /// Record an id. Returns `false` if it was already in the window
    /// (a duplicate), `true` if it is new. Inserting at capacity evicts
    /// the oldest recorded id.
    pub fn insert(&mut self, id: OpId) -> bool {
        if self.seen.contains(&id) {
            return false;
        }
        if self.order.len() == self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.seen.remove(&oldest);
            }
        }
        self.order.push_back(id);
        self.seen.insert(id);
        true
    }

    pub fn contains(&self, id: &OpId) -> bool {
        self.seen.contains(id)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Default for DedupWindow {
    fn default() -> Self {
        Self::new(DEFAULT_DEDUP_CAPACITY)
    }
}
