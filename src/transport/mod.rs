//! Transport seam: how the mesh reaches other replicas.
//!
//! A transport owns the sockets; the mesh core never touches them. All
//! inbound activity (new channels, frames, closes) is funnelled
//! into one mpsc of [`NetEvent`]s, which the single mesh task consumes.
//! Outbound frames go through [`Channel`] handles, fire-and-forget.
//!
//! Two implementations ship with the crate: [`memory`] (in-process hub,
//! deterministic, used by the integration tests) and [`ws`]
//! (`tokio-tungstenite` over TCP).

pub mod memory;
pub mod ws;

use std::sync::atomic::{AtomicU64, Ordering};

use futures_util::future::BoxFuture;
use tokio::sync::mpsc;

use crate::protocol::{encode_batch, MeshError, Operation, PeerAddr};

/// Per-channel outbound frame queue depth. A slow peer that falls this
/// far behind starts losing frames rather than blocking the mesh loop.
pub const CHANNEL_QUEUE_DEPTH: usize = 256;

static NEXT_CHANNEL_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique channel identity. Close notifications carry it so the
/// registry never removes a live channel on behalf of a dead duplicate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChannelId(u64);

impl ChannelId {
    fn next() -> Self {
        Self(NEXT_CHANNEL_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl std::fmt::Display for ChannelId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ch{}", self.0)
    }
}

/// Which side dialed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Inbound,
    Outbound,
}

/// Handle to one reliable, ordered, duplex byte stream to exactly one
/// peer. Owned by the channel registry from creation to close; dropping
/// the handle closes the underlying stream.
#[derive(Debug)]
pub struct Channel {
    id: ChannelId,
    addr: PeerAddr,
    direction: Direction,
    frames: mpsc::Sender<Vec<u8>>,
}

impl Channel {
    /// Build a channel handle around an outbound frame queue. Transports
    /// call this; the mesh core only consumes channels.
    pub fn new(addr: PeerAddr, direction: Direction, frames: mpsc::Sender<Vec<u8>>) -> Self {
        Self {
            id: ChannelId::next(),
            addr,
            direction,
            frames,
        }
    }

    pub fn id(&self) -> ChannelId {
        self.id
    }

    pub fn addr(&self) -> &PeerAddr {
        &self.addr
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Queue an already-encoded frame, fire-and-forget. A full queue
    /// drops the frame (bounded, drop-newest on this edge); a closed
    /// queue means the peer is gone.
    pub fn send_frame(&self, frame: Vec<u8>) -> Result<(), MeshError> {
        match self.frames.try_send(frame) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                log::warn!("outbound queue full for {}, dropping frame", self.addr);
                Ok(())
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(MeshError::ChannelClosed),
        }
    }

    /// Encode and queue one batch.
    pub fn send(&self, batch: &[Operation]) -> Result<(), MeshError> {
        self.send_frame(encode_batch(batch)?)
    }
}

/// Everything a transport can tell the mesh, in arrival order.
#[derive(Debug)]
pub enum NetEvent {
    /// A remote peer opened a channel to us.
    Inbound(Channel),
    /// A frame arrived on some channel to `from`.
    Frame { from: PeerAddr, bytes: Vec<u8> },
    /// A channel closed. `id` names the exact channel so a duplicate's
    /// close cannot evict its surviving twin.
    Closed {
        from: PeerAddr,
        direction: Direction,
        id: ChannelId,
    },
}

/// Dialing side of a transport. `connect` resolves to an outbound
/// [`Channel`] or [`MeshError::Unreachable`]; incoming traffic for the
/// new channel flows through the funnel the transport was bound with.
pub trait Transport: Send + Sync + 'static {
    fn connect(&self, addr: PeerAddr) -> BoxFuture<'static, Result<Channel, MeshError>>;
}
