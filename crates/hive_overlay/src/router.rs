//! Packet router — flooding broadcast and directed delivery.
//!
//! The router is pure bookkeeping: it decides what an arriving packet means
//! for this node and what (if anything) should be re-emitted to neighbors.
//! The node's event loop does the actual sending.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use serde_json::Value;
use tracing::{debug, trace};

use crate::event::NodeEvent;
use crate::identity::{NodeId, PacketId};
use crate::message::{PacketKind, RoutedPacket};

/// Packets arriving with a smaller ttl are dropped, and a packet is only
/// re-emitted while its decremented ttl stays at or above this floor.
pub const MIN_FORWARDABLE_TTL: i64 = 1;

/// Packet ids already processed, remembered for a limited time.
pub struct SeenCache {
    entries: HashMap<PacketId, Instant>,
    ttl: Duration,
}

impl SeenCache {
    /// Create a cache that forgets ids after `ttl`.
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: HashMap::new(),
            ttl,
        }
    }

    /// Record `id`. Returns `false` if it was already present.
    pub fn insert(&mut self, id: PacketId, now: Instant) -> bool {
        if self.entries.contains_key(&id) {
            return false;
        }
        self.entries.insert(id, now);
        true
    }

    /// Whether `id` has been seen.
    pub fn contains(&self, id: &PacketId) -> bool {
        self.entries.contains_key(id)
    }

    /// Drop ids older than the cache ttl. Returns how many were removed.
    pub fn prune(&mut self, now: Instant) -> usize {
        let before = self.entries.len();
        let ttl = self.ttl;
        self.entries
            .retain(|_, inserted| now.saturating_duration_since(*inserted) < ttl);
        before - self.entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// What to do with an arriving packet.
#[derive(Debug, Default, PartialEq)]
pub struct Verdict {
    /// Event to raise locally.
    pub deliver: Option<NodeEvent>,
    /// Copy to send to every neighbor.
    pub forward: Option<RoutedPacket>,
}

/// Routing state for one node.
pub struct Router {
    local_id: NodeId,
    max_ttl: i64,
    seen: SeenCache,
}

impl Router {
    pub fn new(local_id: NodeId, max_ttl: u32, seen_ttl: Duration) -> Self {
        Self {
            local_id,
            max_ttl: i64::from(max_ttl),
            seen: SeenCache::new(seen_ttl),
        }
    }

    /// Build a new broadcast packet originating here.
    pub fn originate_broadcast(&mut self, message: Value) -> RoutedPacket {
        let packet = RoutedPacket::broadcast(self.local_id.clone(), message, self.max_ttl);
        self.seen.insert(packet.id.clone(), Instant::now());
        packet
    }

    /// Build a new direct packet originating here.
    pub fn originate_direct(&mut self, destination: NodeId, message: Value) -> RoutedPacket {
        let packet =
            RoutedPacket::direct(self.local_id.clone(), destination, message, self.max_ttl);
        self.seen.insert(packet.id.clone(), Instant::now());
        packet
    }

    /// Process a packet received from a neighbor.
    pub fn handle(&mut self, packet: RoutedPacket, now: Instant) -> Verdict {
        if packet.ttl < MIN_FORWARDABLE_TTL {
            trace!("Dropping expired packet {}", packet.id);
            return Verdict::default();
        }
        if !self.seen.insert(packet.id.clone(), now) {
            trace!("Dropping duplicate packet {}", packet.id);
            return Verdict::default();
        }

        let forward = packet.next_hop();
        let forward = (forward.ttl >= MIN_FORWARDABLE_TTL).then_some(forward);

        match &packet.kind {
            PacketKind::Broadcast => {
                debug!("Broadcast {} from {} (ttl {})", packet.id, packet.origin, packet.ttl);
                Verdict {
                    deliver: Some(NodeEvent::Broadcast {
                        origin: packet.origin,
                        message: packet.message,
                    }),
                    forward,
                }
            }
            PacketKind::Direct { destination } if *destination == self.local_id => {
                debug!("Direct {} from {} delivered", packet.id, packet.origin);
                Verdict {
                    deliver: Some(NodeEvent::Direct {
                        origin: packet.origin,
                        message: packet.message,
                    }),
                    forward: None,
                }
            }
            PacketKind::Direct { destination } => {
                trace!("Forwarding direct {} towards {destination}", packet.id);
                Verdict {
                    deliver: None,
                    forward,
                }
            }
        }
    }

    /// Expire old entries from the seen cache.
    pub fn prune(&mut self, now: Instant) -> usize {
        let removed = self.seen.prune(now);
        if removed > 0 {
            debug!("Pruned {removed} seen packet ids ({} left)", self.seen.len());
        }
        removed
    }

    /// The seen-message cache.
    pub fn seen(&self) -> &SeenCache {
        &self.seen
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::WireMessage;
    use serde_json::json;

    fn router(id: &str) -> Router {
        Router::new(NodeId::from_string(id), 255, Duration::from_secs(60))
    }

    fn incoming_broadcast(ttl: i64) -> RoutedPacket {
        RoutedPacket::broadcast(NodeId::from_string("origin"), json!({"text": "hi"}), ttl)
    }

    #[test]
    fn test_broadcast_delivers_and_forwards() {
        let mut r = router("me");
        let packet = incoming_broadcast(5);
        let verdict = r.handle(packet.clone(), Instant::now());

        assert_eq!(
            verdict.deliver,
            Some(NodeEvent::Broadcast {
                origin: NodeId::from_string("origin"),
                message: json!({"text": "hi"}),
            })
        );
        let forward = verdict.forward.unwrap();
        assert_eq!(forward.id, packet.id);
        assert_eq!(forward.origin, packet.origin);
        assert_eq!(forward.ttl, 4);
    }

    #[test]
    fn test_duplicate_is_dropped() {
        let mut r = router("me");
        let packet = incoming_broadcast(5);
        let now = Instant::now();

        assert!(r.handle(packet.clone(), now).deliver.is_some());
        let again = r.handle(packet.next_hop(), now);
        assert_eq!(again, Verdict::default());
    }

    #[test]
    fn test_ttl_floor() {
        let mut r = router("me");
        let now = Instant::now();

        // Expired on arrival.
        assert_eq!(r.handle(incoming_broadcast(0), now), Verdict::default());

        // Last hop: delivered but not re-emitted.
        let verdict = r.handle(incoming_broadcast(1), now);
        assert!(verdict.deliver.is_some());
        assert!(verdict.forward.is_none());
    }

    #[test]
    fn test_negative_and_fractional_ttls_from_the_wire() {
        let mut r = router("me");
        let now = Instant::now();
        let from_wire = |ttl: serde_json::Value| {
            let value = json!({
                "type": "message",
                "data": {"id": ttl.to_string(), "ttl": ttl, "type": "broadcast", "message": 1, "origin": "a"}
            });
            match WireMessage::from_value(value).unwrap() {
                WireMessage::Message(packet) => packet,
                other => panic!("unexpected frame {other:?}"),
            }
        };

        assert_eq!(r.handle(from_wire(json!(-1)), now), Verdict::default());
        assert_eq!(r.handle(from_wire(json!(0.9)), now), Verdict::default());

        // 1.5 floors to the last hop.
        let verdict = r.handle(from_wire(json!(1.5)), now);
        assert!(verdict.deliver.is_some());
        assert!(verdict.forward.is_none());
    }

    #[test]
    fn test_expired_packet_is_not_marked_seen() {
        let mut r = router("me");
        let packet = incoming_broadcast(0);
        r.handle(packet.clone(), Instant::now());
        assert!(!r.seen().contains(&packet.id));
    }

    #[test]
    fn test_direct_for_us_stops() {
        let mut r = router("me");
        let packet = RoutedPacket::direct(
            NodeId::from_string("a"),
            NodeId::from_string("me"),
            json!("secret"),
            10,
        );
        let verdict = r.handle(packet, Instant::now());
        assert_eq!(
            verdict.deliver,
            Some(NodeEvent::Direct {
                origin: NodeId::from_string("a"),
                message: json!("secret"),
            })
        );
        assert!(verdict.forward.is_none());
    }

    #[test]
    fn test_direct_for_someone_else_is_forwarded() {
        let mut r = router("me");
        let packet = RoutedPacket::direct(
            NodeId::from_string("a"),
            NodeId::from_string("c"),
            json!("secret"),
            10,
        );
        let verdict = r.handle(packet.clone(), Instant::now());
        assert!(verdict.deliver.is_none());
        let forward = verdict.forward.unwrap();
        assert_eq!(forward.ttl, 9);
        assert_eq!(forward.destination(), packet.destination());
    }

    #[test]
    fn test_originated_packets_are_seen() {
        let mut r = router("me");
        let packet = r.originate_broadcast(json!(1));
        assert_eq!(packet.ttl, 255);
        assert_eq!(packet.origin, NodeId::from_string("me"));

        // The echo coming back from a neighbor is ignored.
        assert_eq!(r.handle(packet.next_hop(), Instant::now()), Verdict::default());

        let direct = r.originate_direct(NodeId::from_string("c"), json!(2));
        assert!(r.seen().contains(&direct.id));
    }

    #[test]
    fn test_seen_cache_prunes_old_ids() {
        let mut cache = SeenCache::new(Duration::from_secs(10));
        let start = Instant::now();
        cache.insert(PacketId::from_string("old"), start);
        cache.insert(PacketId::from_string("new"), start + Duration::from_secs(8));

        assert_eq!(cache.prune(start + Duration::from_secs(12)), 1);
        assert!(!cache.contains(&PacketId::from_string("old")));
        assert!(cache.contains(&PacketId::from_string("new")));
        assert!(!cache.insert(PacketId::from_string("new"), start));
        assert_eq!(cache.len(), 1);
    }
}
