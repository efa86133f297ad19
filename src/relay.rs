//! Gossip relay gate: dedup + re-broadcast.
//!
//! Every incoming batch passes through one gate. The first operation id
//! in the batch keys the whole batch: seen before means the batch took
//! another mesh path and is dropped entirely, neither re-applied nor
//! re-relayed. A fresh id is recorded and the encoded batch goes out
//! verbatim to every other open channel before the operations are
//! applied locally. This single gate turns point-to-point sends into
//! mesh-wide delivery, exactly once per peer, without unbounded
//! duplication.

use crate::dedup::DedupWindow;
use crate::protocol::{first_op_id, Operation};
use crate::registry::ChannelRegistry;
use crate::transport::Channel;

/// Relay health counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayStats {
    /// Fresh batches admitted and fanned out.
    pub admitted: u64,
    /// Batches dropped as duplicates.
    pub duplicates: u64,
    /// Control batches (no id, never relayed).
    pub control: u64,
    /// Frames written during fan-out, across all channels.
    pub frames_relayed: u64,
}

/// Gate verdict for one incoming batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// New id: relay, then apply.
    Fresh,
    /// Seen id: drop the batch entirely.
    Duplicate,
    /// No id: pure control traffic, apply without relaying.
    Control,
}

/// Dedup window plus counters; the mesh loop owns exactly one.
#[derive(Debug, Default)]
pub struct RelayGate {
    window: DedupWindow,
    stats: RelayStats,
}

impl RelayGate {
    pub fn new(window: DedupWindow) -> Self {
        Self {
            window,
            stats: RelayStats::default(),
        }
    }

    /// Decide what to do with an incoming batch. Fresh batches have all
    /// their ids recorded (the first gates, the rest guard against the
    /// same operations arriving re-batched).
    pub fn admit(&mut self, batch: &[Operation]) -> Verdict {
        let Some(first) = first_op_id(batch) else {
            self.stats.control += 1;
            return Verdict::Control;
        };
        if self.window.contains(&first) {
            self.stats.duplicates += 1;
            log::trace!("dropping duplicate batch {first}");
            return Verdict::Duplicate;
        }
        for op in batch {
            if let Some(id) = op.op_id() {
                self.window.insert(id);
            }
        }
        self.stats.admitted += 1;
        Verdict::Fresh
    }

    /// Record ids of a locally produced batch so its echo off the mesh
    /// is dropped on return.
    pub fn note_local(&mut self, batch: &[Operation]) {
        for op in batch {
            if let Some(id) = op.op_id() {
                self.window.insert(id);
            }
        }
    }

    pub fn stats(&self) -> RelayStats {
        self.stats
    }

    fn count_relayed(&mut self, n: u64) {
        self.stats.frames_relayed += n;
    }
}

/// Re-broadcast an encoded frame to every given channel. Returns how
/// many channels took it; closed channels are skipped (their close
/// events are already in flight).
pub fn fan_out<'a>(channels: impl Iterator<Item = &'a Channel>, frame: &[u8]) -> u64 {
    let mut sent = 0;
    for channel in channels {
        if channel.send_frame(frame.to_vec()).is_ok() {
            sent += 1;
        }
    }
    sent
}

/// Fan a fresh incoming frame out to every channel except the arrival
/// address, updating the gate's counters.
pub fn relay_frame(
    gate: &mut RelayGate,
    registry: &ChannelRegistry,
    from: &crate::protocol::PeerAddr,
    frame: &[u8],
) {
    let sent = fan_out(registry.channels_except(from), frame);
    gate.count_relayed(sent);
}
