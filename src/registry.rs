//! Channel registry: the two owned channel collections plus the derived
//! membership view.
//!
//! The registry is the single source of truth for "channels I have";
//! the membership view ("peers I think exist") is derived from channel
//! lifecycle plus gossiped membership facts, never mutated independently
//! of them. Liveness is channel-derived: an address leaves the view when
//! its last channel closes or a remove fact arrives.

use std::collections::{BTreeSet, HashMap};

use crate::protocol::PeerAddr;
use crate::transport::{Channel, ChannelId, Direction};

/// Outcome of removing a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Removal {
    /// A channel was actually removed (the id matched).
    pub removed: bool,
    /// No channel in either direction remains to the address, and its
    /// membership entry was evicted with it.
    pub evicted: bool,
}

/// Tracks live inbound/outbound channels and the peer-address view.
#[derive(Debug, Default)]
pub struct ChannelRegistry {
    inbound: HashMap<PeerAddr, Channel>,
    outbound: HashMap<PeerAddr, Channel>,
    view: BTreeSet<PeerAddr>,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an inbound channel. Idempotent per address: a duplicate
    /// is dropped (closing it), guarding against simultaneous
    /// bidirectional dial races. Returns `false` for a duplicate.
    pub fn add_inbound(&mut self, channel: Channel) -> bool {
        self.add(Direction::Inbound, channel)
    }

    /// Register an outbound channel; same idempotence as inbound.
    pub fn add_outbound(&mut self, channel: Channel) -> bool {
        self.add(Direction::Outbound, channel)
    }

    fn add(&mut self, direction: Direction, channel: Channel) -> bool {
        let addr = channel.addr().clone();
        let map = match direction {
            Direction::Inbound => &mut self.inbound,
            Direction::Outbound => &mut self.outbound,
        };
        if map.contains_key(&addr) {
            log::debug!("duplicate {direction:?} channel to {addr}, closing it");
            drop(channel);
            return false;
        }
        log::debug!("registered {direction:?} channel {} to {addr}", channel.id());
        map.insert(addr.clone(), channel);
        self.view.insert(addr);
        true
    }

    /// Remove the channel with the given identity. The id check means a
    /// stale close from an already-dropped duplicate is a no-op.
    pub fn remove(&mut self, addr: &PeerAddr, direction: Direction, id: ChannelId) -> Removal {
        let map = match direction {
            Direction::Inbound => &mut self.inbound,
            Direction::Outbound => &mut self.outbound,
        };
        let removed = match map.get(addr) {
            Some(existing) if existing.id() == id => {
                map.remove(addr);
                true
            }
            _ => false,
        };
        let evicted = removed
            && !self.inbound.contains_key(addr)
            && !self.outbound.contains_key(addr)
            && self.view.remove(addr);
        Removal { removed, evicted }
    }

    /// Any live channel to `addr`, preferring the inbound one (replies
    /// to a dialer go back the way its traffic came).
    pub fn channel_to(&self, addr: &PeerAddr) -> Option<&Channel> {
        self.inbound.get(addr).or_else(|| self.outbound.get(addr))
    }

    pub fn outbound_to(&self, addr: &PeerAddr) -> Option<&Channel> {
        self.outbound.get(addr)
    }

    pub fn is_connected(&self, addr: &PeerAddr) -> bool {
        self.inbound.contains_key(addr) || self.outbound.contains_key(addr)
    }

    /// All open channels, inbound then outbound.
    pub fn channels(&self) -> impl Iterator<Item = &Channel> {
        self.inbound.values().chain(self.outbound.values())
    }

    /// All open channels except those to `skip`: the relay fan-out set.
    pub fn channels_except<'a>(&'a self, skip: &'a PeerAddr) -> impl Iterator<Item = &'a Channel> {
        self.channels().filter(move |ch| ch.addr() != skip)
    }

    /// Addresses of outbound channels, the forward targets for join requests.
    pub fn outbound_addrs(&self) -> impl Iterator<Item = &PeerAddr> {
        self.outbound.keys()
    }

    /// Open channel count, inbound + outbound.
    pub fn degree(&self) -> usize {
        self.inbound.len() + self.outbound.len()
    }

    /// Record a peer address learned from gossip rather than from a
    /// channel. Returns `true` if it was new.
    pub fn add_view(&mut self, addr: PeerAddr) -> bool {
        self.view.insert(addr)
    }

    /// Drop a peer address from the view. Returns `true` if it was there.
    pub fn remove_view(&mut self, addr: &PeerAddr) -> bool {
        self.view.remove(addr)
    }

    /// The membership view: addresses believed to be part of the mesh.
    /// Derived, not authoritative; may include addresses never dialed.
    pub fn view(&self) -> &BTreeSet<PeerAddr> {
        &self.view
    }

    pub fn view_len(&self) -> usize {
        self.view.len()
    }
}
