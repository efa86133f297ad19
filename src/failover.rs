//! Rendezvous failover.
//!
//! One peer address is published out-of-band (an invitation link) as the
//! mesh entry point. When the channel to that peer closes, each survivor
//! independently elects a replacement from its own membership view.
//! Best-effort only: two survivors may elect different replacements;
//! convergence relies on the invitation being refreshed, which is out of
//! this crate's hands.

use std::collections::BTreeSet;

use crate::protocol::PeerAddr;

/// Tracks the current rendezvous address for one replica.
#[derive(Debug)]
pub struct Failover {
    local: PeerAddr,
    rendezvous: PeerAddr,
}

impl Failover {
    /// A replica starts as its own rendezvous until it joins somewhere.
    pub fn new(local: PeerAddr) -> Self {
        let rendezvous = local.clone();
        Self { local, rendezvous }
    }

    pub fn rendezvous(&self) -> &PeerAddr {
        &self.rendezvous
    }

    pub fn set(&mut self, addr: PeerAddr) {
        self.rendezvous = addr;
    }

    pub fn is_rendezvous(&self, addr: &PeerAddr) -> bool {
        self.rendezvous == *addr
    }

    /// Elect a replacement after losing `lost`: the first remaining
    /// known address, or the local address when the view is empty (the
    /// replica becomes the rendezvous of a possibly singleton mesh).
    pub fn elect(&self, view: &BTreeSet<PeerAddr>, lost: &PeerAddr) -> PeerAddr {
        view.iter()
            .find(|addr| *addr != lost)
            .cloned()
            .unwrap_or_else(|| self.local.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn view(addrs: &[&str]) -> BTreeSet<PeerAddr> {
        addrs.iter().map(|a| PeerAddr::new(*a)).collect()
    }

    #[test]
    fn test_starts_as_own_rendezvous() {
        let failover = Failover::new(PeerAddr::new("me"));
        assert!(failover.is_rendezvous(&PeerAddr::new("me")));
    }

    #[test]
    fn test_elect_prefers_remaining_view() {
        let failover = Failover::new(PeerAddr::new("me"));
        let candidate = failover.elect(&view(&["b", "c"]), &PeerAddr::new("a"));
        assert_eq!(candidate, PeerAddr::new("b"));
    }

    #[test]
    fn test_elect_never_returns_lost_peer() {
        let failover = Failover::new(PeerAddr::new("me"));
        // The lost address may linger in the view briefly; it must not win.
        let candidate = failover.elect(&view(&["a", "c"]), &PeerAddr::new("a"));
        assert_eq!(candidate, PeerAddr::new("c"));
    }

    #[test]
    fn test_elect_falls_back_to_local() {
        let failover = Failover::new(PeerAddr::new("me"));
        let candidate = failover.elect(&view(&[]), &PeerAddr::new("a"));
        assert_eq!(candidate, PeerAddr::new("me"));
    }

    #[test]
    fn test_set_and_query() {
        let mut failover = Failover::new(PeerAddr::new("me"));
        failover.set(PeerAddr::new("hub"));
        assert_eq!(failover.rendezvous(), &PeerAddr::new("hub"));
        assert!(!failover.is_rendezvous(&PeerAddr::new("me")));
    }
}
