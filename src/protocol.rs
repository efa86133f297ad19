//! Wire protocol for the peer mesh.
//!
//! Every channel send carries one **batch**: a bincode-encoded
//! `Vec<Operation>`. Batches exist because a text replace is a delete
//! plus an insert that must travel together.
//!
//! Relayable operations (`AddPeer`, `RemovePeer`, `Insert`, `Delete`,
//! `Cursor`, `Selection`) carry an [`OpId`] and pass through the gossip
//! gate; control operations (`JoinRequest`, `Load`, `Snapshot`) are
//! point-to-point and never relayed.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Opaque reachable endpoint of one replica. Unique per live peer and
/// stable for the lifetime of one session; transports decide what the
/// string means (a hub key, a `ws://` URL, ...).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerAddr(String);

impl PeerAddr {
    pub fn new(addr: impl Into<String>) -> Self {
        Self(addr.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for PeerAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerAddr {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Stable origin tag for operations, generated once per replica at
/// startup. Survives address churn: transports may reuse addresses,
/// site ids are never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SiteId(Uuid);

impl SiteId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    /// Build from a known UUID (tests).
    pub fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for SiteId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Identifier of one relayable operation: (origin site, local counter).
/// Strictly increasing per site, never reused. This is what the dedup
/// window keys on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OpId {
    pub site: SiteId,
    pub seq: u64,
}

impl std::fmt::Display for OpId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}#{}", self.site, self.seq)
    }
}

/// Half-open selection range in character offsets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectionRange {
    pub start: usize,
    pub end: usize,
}

/// One protocol message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Operation {
    /// Connection request from a peer that wants to join the mesh.
    /// Evaluated by the membership protocol: accept, or forward to a
    /// random neighbour when over the degree cap.
    JoinRequest { addr: PeerAddr, site: SiteId },

    /// Bootstrap request: "send me the document and the membership".
    Load,

    /// Bootstrap reply, sent on the same channel `Load` arrived on.
    Snapshot {
        document: String,
        members: Vec<PeerAddr>,
    },

    /// A peer joined the mesh.
    AddPeer { id: OpId, addr: PeerAddr },

    /// A peer left the mesh (all channels to it closed somewhere).
    RemovePeer { id: OpId, addr: PeerAddr },

    /// Text inserted at a character index.
    Insert {
        id: OpId,
        index: usize,
        text: String,
    },

    /// Text deleted at a character index.
    Delete { id: OpId, index: usize, len: usize },

    /// Cursor moved; `None` hides the cursor.
    Cursor {
        id: OpId,
        peer: PeerAddr,
        offset: Option<usize>,
    },

    /// Selection changed; `None` clears it.
    Selection {
        id: OpId,
        peer: PeerAddr,
        range: Option<SelectionRange>,
    },
}

impl Operation {
    /// The operation's id, if it is relayable.
    pub fn op_id(&self) -> Option<OpId> {
        match self {
            Operation::JoinRequest { .. } | Operation::Load | Operation::Snapshot { .. } => None,
            Operation::AddPeer { id, .. }
            | Operation::RemovePeer { id, .. }
            | Operation::Insert { id, .. }
            | Operation::Delete { id, .. }
            | Operation::Cursor { id, .. }
            | Operation::Selection { id, .. } => Some(*id),
        }
    }

    /// Whether this operation travels through the gossip relay.
    pub fn is_relayable(&self) -> bool {
        self.op_id().is_some()
    }
}

/// First operation id present in a batch, the dedup key for the whole
/// batch. `None` means the batch is pure control traffic.
pub fn first_op_id(batch: &[Operation]) -> Option<OpId> {
    batch.iter().find_map(Operation::op_id)
}

/// Serialize a batch to the wire format.
pub fn encode_batch(batch: &[Operation]) -> Result<Vec<u8>, MeshError> {
    bincode::serde::encode_to_vec(batch, bincode::config::standard())
        .map_err(|e| MeshError::Encode(e.to_string()))
}

/// Deserialize a batch from the wire format.
pub fn decode_batch(bytes: &[u8]) -> Result<Vec<Operation>, MeshError> {
    let (batch, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| MeshError::Decode(e.to_string()))?;
    Ok(batch)
}

/// Mesh errors. None of these are fatal to the replica: dial failures
/// degrade to failover, codec failures skip the frame, and a closed
/// channel abandons that peer.
#[derive(Debug, Clone)]
pub enum MeshError {
    /// Dial/connect failure; triggers the "find new target" path.
    Unreachable(PeerAddr),
    Encode(String),
    Decode(String),
    ChannelClosed,
}

impl std::fmt::Display for MeshError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unreachable(addr) => write!(f, "peer unreachable: {addr}"),
            Self::Encode(e) => write!(f, "encode error: {e}"),
            Self::Decode(e) => write!(f, "decode error: {e}"),
            Self::ChannelClosed => write!(f, "channel closed"),
        }
    }
}

impl std::error::Error for MeshError {}

#[cfg(test)]
mod tests {
    use super::*;

    fn op_id(seq: u64) -> OpId {
        OpId {
            site: SiteId::from_uuid(Uuid::parse_str("550e8400-e29b-41d4-a716-446655440000").unwrap()),
            seq,
        }
    }

    #[test]
    fn test_batch_roundtrip_edits() {
        let batch = vec![
            Operation::Delete {
                id: op_id(4),
                index: 2,
                len: 3,
            },
            Operation::Insert {
                id: op_id(5),
                index: 2,
                text: "hello".into(),
            },
        ];

        let encoded = encode_batch(&batch).unwrap();
        let decoded = decode_batch(&encoded).unwrap();
        assert_eq!(decoded, batch);
    }

    #[test]
    fn test_batch_roundtrip_control() {
        let batch = vec![
            Operation::JoinRequest {
                addr: PeerAddr::new("peer-b"),
                site: SiteId::generate(),
            },
            Operation::Load,
        ];

        let encoded = encode_batch(&batch).unwrap();
        let decoded = decode_batch(&encoded).unwrap();
        assert_eq!(decoded, batch);
    }

    #[test]
    fn test_snapshot_roundtrip() {
        let batch = vec![Operation::Snapshot {
            document: "shared text".into(),
            members: vec![PeerAddr::new("a"), PeerAddr::new("b")],
        }];

        let encoded = encode_batch(&batch).unwrap();
        match &decode_batch(&encoded).unwrap()[0] {
            Operation::Snapshot { document, members } => {
                assert_eq!(document, "shared text");
                assert_eq!(members.len(), 2);
            }
            other => panic!("expected Snapshot, got {other:?}"),
        }
    }

    #[test]
    fn test_presence_roundtrip() {
        let batch = vec![
            Operation::Cursor {
                id: op_id(1),
                peer: PeerAddr::new("a"),
                offset: Some(7),
            },
            Operation::Selection {
                id: op_id(2),
                peer: PeerAddr::new("a"),
                range: Some(SelectionRange { start: 3, end: 9 }),
            },
        ];

        let encoded = encode_batch(&batch).unwrap();
        assert_eq!(decode_batch(&encoded).unwrap(), batch);
    }

    #[test]
    fn test_presence_clear_roundtrip() {
        let batch = vec![Operation::Selection {
            id: op_id(9),
            peer: PeerAddr::new("a"),
            range: None,
        }];

        let encoded = encode_batch(&batch).unwrap();
        assert_eq!(decode_batch(&encoded).unwrap(), batch);
    }

    #[test]
    fn test_first_op_id_skips_control() {
        let batch = vec![
            Operation::Load,
            Operation::Insert {
                id: op_id(3),
                index: 0,
                text: "x".into(),
            },
        ];
        assert_eq!(first_op_id(&batch), Some(op_id(3)));
    }

    #[test]
    fn test_control_batch_has_no_id() {
        let batch = vec![Operation::Load];
        assert_eq!(first_op_id(&batch), None);
        assert!(!batch[0].is_relayable());
    }

    #[test]
    fn test_relayable_classification() {
        let site = SiteId::generate();
        assert!(!Operation::JoinRequest {
            addr: PeerAddr::new("a"),
            site,
        }
        .is_relayable());
        assert!(!Operation::Snapshot {
            document: String::new(),
            members: vec![],
        }
        .is_relayable());
        assert!(Operation::AddPeer {
            id: op_id(0),
            addr: PeerAddr::new("a"),
        }
        .is_relayable());
        assert!(Operation::RemovePeer {
            id: op_id(1),
            addr: PeerAddr::new("a"),
        }
        .is_relayable());
    }

    #[test]
    fn test_op_id_monotone_distinct() {
        assert_ne!(op_id(1), op_id(2));
        let other = OpId {
            site: SiteId::generate(),
            seq: 1,
        };
        assert_ne!(op_id(1), other);
    }

    #[test]
    fn test_decode_garbage_fails() {
        let garbage = vec![0xFF, 0xFE, 0xFD];
        assert!(decode_batch(&garbage).is_err());
    }

    #[test]
    fn test_small_edit_is_compact() {
        let batch = vec![Operation::Insert {
            id: op_id(1),
            index: 42,
            text: "a".into(),
        }];
        let encoded = encode_batch(&batch).unwrap();
        // One char edit: tag + 16-byte site + varint seq + index + text.
        assert!(
            encoded.len() < 64,
            "single-char insert took {} bytes",
            encoded.len()
        );
    }
}
