//! Wire protocol — handshake and routed-packet envelopes.
//!
//! Every frame on a connection is one of two kinds:
//!
//! ```json
//! {"type": "handshake", "data": {"nodeId": "..."}}
//! {"type": "message",   "data": {"id": "...", "ttl": 255, "type": "broadcast", "message": ..., "origin": "..."}}
//! ```
//!
//! Direct packets additionally carry a `destination`. Unknown kinds are
//! rejected at deserialization time. Any JSON number is accepted as a ttl;
//! fractions are floored so the router, not the parser, decides what an
//! exhausted ttl means.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Number, Value};

use crate::identity::{NodeId, PacketId};

/// A frame exchanged between two directly connected nodes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum WireMessage {
    /// Announces the sender's node identity. Sent once per connection.
    Handshake(Handshake),
    /// Carries a routed packet between neighbors.
    Message(RoutedPacket),
}

impl WireMessage {
    /// Parse a decoded frame into a typed message.
    pub fn from_value(value: Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value(value)
    }
}

/// Payload of a handshake frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Handshake {
    #[serde(rename = "nodeId")]
    pub node_id: NodeId,
}

/// How a routed packet is addressed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PacketKind {
    /// Delivered to every node the flood reaches.
    Broadcast,
    /// Delivered only to `destination`; every other node just forwards.
    Direct { destination: NodeId },
}

/// A packet flooded through the overlay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutedPacket {
    /// Same for every copy of the packet.
    pub id: PacketId,
    /// Remaining hop budget. May arrive zero or negative.
    #[serde(deserialize_with = "lenient_ttl")]
    pub ttl: i64,
    #[serde(flatten)]
    pub kind: PacketKind,
    /// Opaque application payload.
    pub message: Value,
    /// Node that originated the packet.
    pub origin: NodeId,
}

impl RoutedPacket {
    /// Originate a broadcast packet with a fresh id.
    pub fn broadcast(origin: NodeId, message: Value, ttl: i64) -> Self {
        Self {
            id: PacketId::generate(),
            ttl,
            kind: PacketKind::Broadcast,
            message,
            origin,
        }
    }

    /// Originate a direct packet with a fresh id.
    pub fn direct(origin: NodeId, destination: NodeId, message: Value, ttl: i64) -> Self {
        Self {
            id: PacketId::generate(),
            ttl,
            kind: PacketKind::Direct { destination },
            message,
            origin,
        }
    }

    /// The copy re-emitted at the next hop: identical except for the ttl.
    pub fn next_hop(&self) -> Self {
        Self {
            ttl: self.ttl.saturating_sub(1),
            ..self.clone()
        }
    }

    /// The destination of a direct packet.
    pub fn destination(&self) -> Option<&NodeId> {
        match &self.kind {
            PacketKind::Broadcast => None,
            PacketKind::Direct { destination } => Some(destination),
        }
    }
}

fn lenient_ttl<'de, D: Deserializer<'de>>(deserializer: D) -> Result<i64, D::Error> {
    let number = Number::deserialize(deserializer)?;
    if let Some(ttl) = number.as_i64() {
        return Ok(ttl);
    }
    if number.is_u64() {
        return Ok(i64::MAX);
    }
    // Float to int casts saturate.
    Ok(number.as_f64().map_or(0, |ttl| ttl.floor() as i64))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_handshake_wire_shape() {
        let msg = WireMessage::Handshake(Handshake {
            node_id: NodeId::from_string("node-a"),
        });
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value, json!({"type": "handshake", "data": {"nodeId": "node-a"}}));
    }

    #[test]
    fn test_broadcast_wire_shape() {
        let packet = RoutedPacket {
            id: PacketId::from_string("p1"),
            ttl: 255,
            kind: PacketKind::Broadcast,
            message: json!({"text": "hi"}),
            origin: NodeId::from_string("node-a"),
        };
        let value = serde_json::to_value(WireMessage::Message(packet)).unwrap();
        assert_eq!(
            value,
            json!({
                "type": "message",
                "data": {
                    "id": "p1",
                    "ttl": 255,
                    "type": "broadcast",
                    "message": {"text": "hi"},
                    "origin": "node-a"
                }
            })
        );
    }

    #[test]
    fn test_direct_parses_from_wire() {
        let value = json!({
            "type": "message",
            "data": {
                "id": "p2",
                "ttl": 3,
                "type": "direct",
                "message": "payload",
                "origin": "node-a",
                "destination": "node-c"
            }
        });
        let WireMessage::Message(packet) = WireMessage::from_value(value).unwrap() else {
            panic!("expected a routed packet");
        };
        assert_eq!(packet.ttl, 3);
        assert_eq!(packet.destination(), Some(&NodeId::from_string("node-c")));
        assert_eq!(packet.message, json!("payload"));
    }

    #[test]
    fn test_unknown_kinds_are_rejected() {
        assert!(WireMessage::from_value(json!({"type": "gossip", "data": {}})).is_err());
        let bad_packet = json!({
            "type": "message",
            "data": {"id": "p", "ttl": 1, "type": "multicast", "message": 1, "origin": "a"}
        });
        assert!(WireMessage::from_value(bad_packet).is_err());
    }

    #[test]
    fn test_direct_without_destination_is_rejected() {
        let value = json!({
            "type": "message",
            "data": {"id": "p", "ttl": 1, "type": "direct", "message": 1, "origin": "a"}
        });
        assert!(WireMessage::from_value(value).is_err());
    }

    fn packet_with_ttl(ttl: Value) -> Result<WireMessage, serde_json::Error> {
        WireMessage::from_value(json!({
            "type": "message",
            "data": {"id": "p", "ttl": ttl, "type": "broadcast", "message": 1, "origin": "a"}
        }))
    }

    fn parsed_ttl(ttl: Value) -> i64 {
        match packet_with_ttl(ttl).unwrap() {
            WireMessage::Message(packet) => packet.ttl,
            other => panic!("unexpected frame {other:?}"),
        }
    }

    #[test]
    fn test_any_numeric_ttl_parses() {
        assert_eq!(parsed_ttl(json!(0)), 0);
        assert_eq!(parsed_ttl(json!(-3)), -3);
        assert_eq!(parsed_ttl(json!(2.7)), 2);
        assert_eq!(parsed_ttl(json!(0.5)), 0);
        assert_eq!(parsed_ttl(json!(-0.5)), -1);
        assert_eq!(parsed_ttl(json!(u64::MAX)), i64::MAX);
        assert_eq!(parsed_ttl(json!(1e300)), i64::MAX);
    }

    #[test]
    fn test_non_numeric_ttl_is_rejected() {
        assert!(packet_with_ttl(json!("3")).is_err());
        assert!(packet_with_ttl(json!(null)).is_err());
    }

    #[test]
    fn test_next_hop_preserves_identity() {
        let packet = RoutedPacket::direct(
            NodeId::from_string("a"),
            NodeId::from_string("c"),
            json!(1),
            5,
        );
        let next = packet.next_hop();
        assert_eq!(next.id, packet.id);
        assert_eq!(next.origin, packet.origin);
        assert_eq!(next.kind, packet.kind);
        assert_eq!(next.ttl, 4);
    }
}
