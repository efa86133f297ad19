//! Newcomer bootstrap: snapshot building and the outgoing replay buffer.
//!
//! A newcomer sends `Load` on its first outbound channel; the serving
//! peer answers with a full document + membership snapshot on the same
//! channel, then replays its recent outgoing batches so edits broadcast
//! during the sync window are not lost. The buffer is iterated, not
//! drained, so successive newcomers each get the recent tail.

use std::collections::{BTreeSet, VecDeque};

use crate::protocol::{Operation, PeerAddr};

/// Replay buffer capacity: the most recent locally produced batches.
pub const DEFAULT_REPLAY_CAPACITY: usize = 40;

/// Fixed-capacity FIFO of encoded relayable batches this replica
/// produced, oldest dropped first.
#[derive(Debug)]
pub struct ReplayBuffer {
    frames: VecDeque<Vec<u8>>,
    capacity: usize,
}

impl ReplayBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            frames: VecDeque::with_capacity(capacity.min(256)),
            capacity,
        }
    }

    /// Append an encoded batch, dropping the oldest at capacity.
    pub fn push(&mut self, frame: Vec<u8>) {
        if self.frames.len() == self.capacity {
            self.frames.pop_front();
        }
        self.frames.push_back(frame);
    }

    /// Buffered frames, oldest first.
    pub fn iter(&self) -> impl Iterator<Item = &Vec<u8>> {
        self.frames.iter()
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Default for ReplayBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_REPLAY_CAPACITY)
    }
}

/// Build the bootstrap reply for a `Load` from `requester`: the current
/// document plus every known member except the requester itself (it is
/// already connected to us, and the view never contains the local peer).
pub fn build_snapshot(
    document: String,
    view: &BTreeSet<PeerAddr>,
    requester: &PeerAddr,
) -> Operation {
    Operation::Snapshot {
        document,
        members: view.iter().filter(|a| *a != requester).cloned().collect(),
    }
}
