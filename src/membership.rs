//! Join admission: accept, or forward when over the degree cap.
//!
//! A join request travels the mesh until some peer has room for it.
//! Forwarding picks one outbound neighbour uniformly at random (never
//! the requester), bounding any single peer's fan-out while still
//! letting the mesh absorb new members via indirection. Rejection has
//! no wire form; silence/close is the only failure signal.

use rand::seq::SliceRandom;
use rand::Rng;

use crate::protocol::PeerAddr;
use crate::registry::ChannelRegistry;

/// Floor on the degree cap. Small meshes always accept directly.
pub const MIN_DEGREE: usize = 5;

/// Degree cap for a mesh of `mesh_size` replicas (the local replica
/// counts itself): `max(ceil(mesh_size / 2), MIN_DEGREE)`.
pub fn max_degree(mesh_size: usize) -> usize {
    mesh_size.div_ceil(2).max(MIN_DEGREE)
}

/// What to do with an incoming join request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JoinDecision {
    /// Dial back, register, announce the new peer.
    Accept,
    /// Over the cap: relay the request verbatim to this neighbour.
    Forward(PeerAddr),
}

/// Evaluate a join request against the current degree.
///
/// Over the cap the request is forwarded to a random outbound peer
/// other than the requester; with no such peer the decision degrades to
/// accept, since a mesh without forward targets is too small for the
/// cap to matter.
pub fn evaluate_join<R: Rng + ?Sized>(
    registry: &ChannelRegistry,
    requester: &PeerAddr,
    rng: &mut R,
) -> JoinDecision {
    let mesh_size = registry.view_len() + 1;
    if registry.degree() <= max_degree(mesh_size) {
        return JoinDecision::Accept;
    }

    let candidates: Vec<&PeerAddr> = registry
        .outbound_addrs()
        .filter(|addr| *addr != requester)
        .collect();
    match candidates.choose(rng) {
        Some(target) => JoinDecision::Forward((*target).clone()),
        None => JoinDecision::Accept,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{Channel, Direction};
    use tokio::sync::mpsc;

    fn stuffed_registry(inbound: usize, outbound: usize) -> ChannelRegistry {
        let mut reg = ChannelRegistry::new();
        for i in 0..inbound {
            let (tx, rx) = mpsc::channel(1);
            std::mem::forget(rx);
            reg.add_inbound(Channel::new(
                PeerAddr::new(format!("in-{i}")),
                Direction::Inbound,
                tx,
            ));
        }
        for i in 0..outbound {
            let (tx, rx) = mpsc::channel(1);
            std::mem::forget(rx);
            reg.add_outbound(Channel::new(
                PeerAddr::new(format!("out-{i}")),
                Direction::Outbound,
                tx,
            ));
        }
        reg
    }

    #[test]
    fn test_max_degree_formula() {
        assert_eq!(max_degree(1), MIN_DEGREE);
        assert_eq!(max_degree(10), MIN_DEGREE);
        assert_eq!(max_degree(11), 6);
        assert_eq!(max_degree(12), 6);
        assert_eq!(max_degree(20), 10);
        assert_eq!(max_degree(21), 11);
    }

    #[test]
    fn test_small_mesh_accepts() {
        let reg = stuffed_registry(1, 2);
        let requester = PeerAddr::new("newcomer");
        assert_eq!(
            evaluate_join(&reg, &requester, &mut rand::thread_rng()),
            JoinDecision::Accept
        );
    }

    #[test]
    fn test_over_cap_forwards() {
        // View 8, mesh size 9, cap max(ceil(9/2), 5) = 5; degree 8 is over.
        let reg = stuffed_registry(4, 4);
        assert_eq!(reg.degree(), 8);
        let requester = PeerAddr::new("newcomer");

        match evaluate_join(&reg, &requester, &mut rand::thread_rng()) {
            JoinDecision::Forward(target) => {
                assert!(target.as_str().starts_with("out-"));
                assert_ne!(target, requester);
            }
            JoinDecision::Accept => panic!("expected forward over the cap"),
        }
    }

    #[test]
    fn test_forward_never_targets_requester() {
        let reg = stuffed_registry(6, 1);
        let requester = PeerAddr::new("out-0"); // the only outbound peer

        // Only candidate excluded: degrades to accept.
        assert_eq!(
            evaluate_join(&reg, &requester, &mut rand::thread_rng()),
            JoinDecision::Accept
        );
    }

    #[test]
    fn test_no_outbound_degrades_to_accept() {
        let reg = stuffed_registry(7, 0);
        let requester = PeerAddr::new("newcomer");
        assert_eq!(
            evaluate_join(&reg, &requester, &mut rand::thread_rng()),
            JoinDecision::Accept
        );
    }

    #[test]
    fn test_at_cap_still_accepts() {
        // Cap is a strict bound: forwarding starts above it, not at it.
        let reg = stuffed_registry(3, 2);
        assert_eq!(reg.degree(), max_degree(reg.view_len() + 1));
        let requester = PeerAddr::new("newcomer");
        assert_eq!(
            evaluate_join(&reg, &requester, &mut rand::thread_rng()),
            JoinDecision::Accept
        );
    }
}
