//! Serverless peer mesh and operation relay for collaborative plaintext
//! editing.
//!
//! Replicas connect directly to each other over duplex channels, with no
//! coordinating server. Edits, presence and membership facts travel as
//! identified operations through a gossip relay: each replica forwards a
//! fresh batch to every other open channel and drops duplicates through
//! a bounded dedup window. A bounded-degree membership protocol keeps
//! per-peer fan-out sub-linear in mesh size, newcomers bootstrap from a
//! document + membership snapshot, and a rendezvous failover keeps the
//! mesh joinable when the published entry point disappears.
//!
//! The [`mesh`] module is the front door: spawn a [`mesh::Mesh`] with a
//! transport and a [`document::DocumentHost`], then drive it through the
//! returned [`mesh::MeshHandle`] and [`mesh::MeshEvent`] stream.

pub mod dedup;
pub mod document;
pub mod failover;
pub mod membership;
pub mod mesh;
pub mod protocol;
pub mod registry;
pub mod relay;
pub mod sync;
pub mod transport;

pub use document::{DocumentHost, SharedDocument};
pub use mesh::{Mesh, MeshConfig, MeshEvent, MeshHandle, MeshStats};
pub use protocol::{MeshError, OpId, Operation, PeerAddr, SelectionRange, SiteId};
pub use transport::Transport;
