//! In-process transport: a hub of bound replicas wired by mpsc pipes.
//!
//! Deterministic and loopback-free, which makes it the transport of
//! choice for tests and single-process simulations. Each `connect`
//! builds two byte pipes (one per direction) and hands the callee an
//! inbound [`Channel`] through its funnel.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use futures_util::future::BoxFuture;
use tokio::sync::mpsc;

use super::{Channel, ChannelId, Direction, NetEvent, Transport, CHANNEL_QUEUE_DEPTH};
use crate::protocol::{MeshError, PeerAddr};

type Funnel = mpsc::Sender<NetEvent>;

/// Shared address book of bound replicas. Cloning shares the book.
#[derive(Clone, Default)]
pub struct MemoryHub {
    peers: Arc<Mutex<HashMap<PeerAddr, Funnel>>>,
}

impl MemoryHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a replica under `addr` and get its dialing transport.
    /// Inbound channels and their traffic arrive through `funnel`.
    pub fn bind(&self, addr: PeerAddr, funnel: Funnel) -> MemoryTransport {
        self.peers
            .lock()
            .expect("hub lock poisoned")
            .insert(addr.clone(), funnel);
        MemoryTransport {
            hub: self.clone(),
            local: addr,
        }
    }

    /// Make `addr` unreachable for future dials. Channels already open
    /// are unaffected.
    pub fn unbind(&self, addr: &PeerAddr) {
        self.peers.lock().expect("hub lock poisoned").remove(addr);
    }

    fn funnel_of(&self, addr: &PeerAddr) -> Option<Funnel> {
        self.peers
            .lock()
            .expect("hub lock poisoned")
            .get(addr)
            .cloned()
    }
}

/// Dialer handle for one bound replica.
pub struct MemoryTransport {
    hub: MemoryHub,
    local: PeerAddr,
}

impl MemoryTransport {
    pub fn local_addr(&self) -> &PeerAddr {
        &self.local
    }
}

impl Transport for MemoryTransport {
    fn connect(&self, addr: PeerAddr) -> BoxFuture<'static, Result<Channel, MeshError>> {
        let hub = self.hub.clone();
        let local = self.local.clone();
        Box::pin(async move {
            let Some(remote_funnel) = hub.funnel_of(&addr) else {
                return Err(MeshError::Unreachable(addr));
            };
            let Some(local_funnel) = hub.funnel_of(&local) else {
                return Err(MeshError::ChannelClosed);
            };

            // One pipe per direction; each end's Channel handle feeds the
            // pipe, a pump task feeds the other end's funnel.
            let (to_remote, from_local) = mpsc::channel(CHANNEL_QUEUE_DEPTH);
            let (to_local, from_remote) = mpsc::channel(CHANNEL_QUEUE_DEPTH);

            let outbound = Channel::new(addr.clone(), Direction::Outbound, to_remote);
            let inbound = Channel::new(local.clone(), Direction::Inbound, to_local);

            // When the dialer drops its outbound handle, the callee sees
            // its inbound channel close, and vice versa.
            pump(
                from_local,
                remote_funnel.clone(),
                local.clone(),
                Direction::Inbound,
                inbound.id(),
            );
            pump(
                from_remote,
                local_funnel,
                addr.clone(),
                Direction::Outbound,
                outbound.id(),
            );

            if remote_funnel.send(NetEvent::Inbound(inbound)).await.is_err() {
                return Err(MeshError::Unreachable(addr));
            }
            log::debug!("{local}: memory channel to {addr} established");
            Ok(outbound)
        })
    }
}

/// Forward frames from one pipe end into a funnel, then report the close.
fn pump(
    mut frames: mpsc::Receiver<Vec<u8>>,
    funnel: Funnel,
    from: PeerAddr,
    direction: Direction,
    id: ChannelId,
) {
    tokio::spawn(async move {
        while let Some(bytes) = frames.recv().await {
            let event = NetEvent::Frame {
                from: from.clone(),
                bytes,
            };
            if funnel.send(event).await.is_err() {
                break;
            }
        }
        let _ = funnel.send(NetEvent::Closed { from, direction, id }).await;
    });
}
