//! Identity types and the binary envelope for overlay messaging.
//!
//! Wire format (bincode-encoded):
//! ```text
//! ┌────────────┬──────────────────┬──────┬──────────┐
//! │ network_id │ original_sender  │ kind │ payload  │
//! │ variable   │ variable         │ tag  │ variable │
//! └────────────┴──────────────────┴──────┴──────────┘
//! ```
//!
//! Envelopes only travel between a spoke and its hub (or hub and spoke);
//! the `original_sender` field is what lets the hub relay a message without
//! losing the true sender identity.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identity of a participant's transport endpoint.
///
/// Opaque and stable for the lifetime of a connection; never reused.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeerId(String);

impl PeerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for PeerId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Identity of one logical overlay network.
///
/// Many networks may be multiplexed over the same set of direct connections
/// between the same peers; the envelope carries the network id so receivers
/// can route to the right [`StarNetwork`](crate::overlay::StarNetwork).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NetworkId(String);

impl NetworkId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for NetworkId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NetworkId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// A participant's identity within a portal.
///
/// The host always holds [`HOST_SITE_ID`]; guests receive server-assigned
/// values greater than 1 on join. Unique within a portal's lifetime.
pub type SiteId = u32;

/// Reserved site id held by the portal host.
pub const HOST_SITE_ID: SiteId = 1;

/// Identity of one collaborative session.
pub type PortalId = Uuid;

/// Identity of one shared editor (document) within a portal.
pub type EditorId = Uuid;

/// Routing behavior of an [`Envelope`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum EnvelopeKind {
    /// Membership handshake from a spoke to its hub. Carries no payload and
    /// is never surfaced to the application layer.
    Join,
    /// Point-to-point delivery to the receiving peer.
    Direct,
    /// Spoke asking the hub to forward the payload to one member.
    RelayUnicast { target: PeerId },
    /// Spoke asking the hub to forward the payload to every other member.
    RelayBroadcast,
}

/// One overlay message on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub network_id: NetworkId,
    /// The peer that originated this message. Preserved across relays so
    /// receivers never observe the hub's identity for a relayed message.
    pub original_sender: PeerId,
    pub kind: EnvelopeKind,
    pub payload: Vec<u8>,
}

impl Envelope {
    /// Membership handshake sent by a spoke right after connecting to a hub.
    pub fn join(network_id: NetworkId, sender: PeerId) -> Self {
        Self {
            network_id,
            original_sender: sender,
            kind: EnvelopeKind::Join,
            payload: Vec::new(),
        }
    }

    /// Point-to-point message delivered as-is.
    pub fn direct(network_id: NetworkId, sender: PeerId, payload: Vec<u8>) -> Self {
        Self {
            network_id,
            original_sender: sender,
            kind: EnvelopeKind::Direct,
            payload,
        }
    }

    /// Spoke-to-hub request to forward to a single member.
    pub fn relay_unicast(
        network_id: NetworkId,
        sender: PeerId,
        target: PeerId,
        payload: Vec<u8>,
    ) -> Self {
        Self {
            network_id,
            original_sender: sender,
            kind: EnvelopeKind::RelayUnicast { target },
            payload,
        }
    }

    /// Spoke-to-hub request to forward to every other member.
    pub fn relay_broadcast(network_id: NetworkId, sender: PeerId, payload: Vec<u8>) -> Self {
        Self {
            network_id,
            original_sender: sender,
            kind: EnvelopeKind::RelayBroadcast,
            payload,
        }
    }

    /// Serialize to binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, WireError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| WireError::Encode(e.to_string()))
    }

    /// Deserialize from binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, WireError> {
        let (envelope, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| WireError::Decode(e.to_string()))?;
        Ok(envelope)
    }
}

/// Envelope serialization errors.
#[derive(Debug, Clone)]
pub enum WireError {
    Encode(String),
    Decode(String),
}

impl std::fmt::Display for WireError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Encode(e) => write!(f, "Envelope encode error: {e}"),
            Self::Decode(e) => write!(f, "Envelope decode error: {e}"),
        }
    }
}

impl std::error::Error for WireError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_direct_roundtrip() {
        let envelope = Envelope::direct(
            NetworkId::new("network-a"),
            PeerId::new("peer-1"),
            b"hello".to_vec(),
        );
        let encoded = envelope.encode().unwrap();
        let decoded = Envelope::decode(&encoded).unwrap();

        assert_eq!(decoded, envelope);
        assert_eq!(decoded.kind, EnvelopeKind::Direct);
        assert_eq!(decoded.payload, b"hello");
    }

    #[test]
    fn test_relay_unicast_preserves_target_and_sender() {
        let envelope = Envelope::relay_unicast(
            NetworkId::new("network-a"),
            PeerId::new("peer-2"),
            PeerId::new("peer-3"),
            b"spoke-to-spoke".to_vec(),
        );
        let decoded = Envelope::decode(&envelope.encode().unwrap()).unwrap();

        assert_eq!(decoded.original_sender, PeerId::new("peer-2"));
        match decoded.kind {
            EnvelopeKind::RelayUnicast { target } => assert_eq!(target, PeerId::new("peer-3")),
            other => panic!("Expected RelayUnicast, got {other:?}"),
        }
    }

    #[test]
    fn test_join_has_empty_payload() {
        let envelope = Envelope::join(NetworkId::new("network-a"), PeerId::new("peer-2"));
        let decoded = Envelope::decode(&envelope.encode().unwrap()).unwrap();

        assert_eq!(decoded.kind, EnvelopeKind::Join);
        assert!(decoded.payload.is_empty());
    }

    #[test]
    fn test_decode_invalid_bytes() {
        let garbage = vec![0xFF, 0xFE, 0xFD];
        assert!(Envelope::decode(&garbage).is_err());
    }

    #[test]
    fn test_peer_id_display() {
        let id = PeerId::new("peer-42");
        assert_eq!(id.to_string(), "peer-42");
        assert_eq!(id.as_str(), "peer-42");
    }

    #[test]
    fn test_network_ids_distinguish_envelopes() {
        let a = Envelope::relay_broadcast(NetworkId::new("network-a"), PeerId::new("p"), vec![1]);
        let b = Envelope::relay_broadcast(NetworkId::new("network-b"), PeerId::new("p"), vec![1]);
        assert_ne!(a.network_id, b.network_id);
    }
}
