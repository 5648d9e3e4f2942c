//! Inbound classification and relay admission
//!
//! Every received frame is classified once, in a fixed priority order:
//!
//! ```text
//! RREQ / RREP ──► discovery
//! source == me ──► overheard own transmission, discard
//! destination == me ──► local delivery (DATA) or ACK matching
//! destination == BROADCAST ──► routing beacon
//! via == me, or flooded with relaying on ──► relay candidate
//! anything else ──► overheard unicast, discard
//! ```
//!
//! Relay candidates then pass through [`ForwardingEngine::admit`]: TTL
//! expiry first, then the forwarding policy, then duplicate suppression,
//! and only then the bounded forward queue. An expired duplicate is thus
//! counted once, as expired, and a full buffer is only reported for
//! packets that passed every other check.

use super::config::{MeshConfig, RoutingMetric};
use super::dedup::DuplicateCache;
use super::packet::{MeshPacket, MessageKind, NodeId, PacketIdentity};
use std::collections::VecDeque;
use tracing::debug;

/// Classification of a received frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Inbound {
    /// Route request
    Rreq,
    /// Route reply addressed to or routed through this node
    Rrep,
    /// Route reply meant for other nodes
    UnrelatedRrep,
    /// Own transmission echoed back
    FromMe,
    /// Final destination reached
    ForMe,
    /// Broadcast-addressed traffic (routing beacons)
    Broadcast,
    /// This node should consider relaying it
    Relay,
    /// Unicast for a different next hop
    Overheard,
}

/// Outcome of offering a relay candidate to the forward queue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// TTL exhausted
    Expired,
    /// Forwarding disabled by the routing metric
    Disabled,
    /// Already forwarded or already queued
    Duplicate,
    /// Forward queue at capacity
    BufferFull,
    /// Queued with TTL decremented
    Accepted,
}

/// Relay state: forward queue plus forwarded history
#[derive(Debug, Clone)]
pub struct ForwardingEngine {
    me: NodeId,
    relay_broadcast: bool,
    enabled: bool,
    queue: VecDeque<MeshPacket>,
    /// 0 = unbounded
    capacity: usize,
    history: DuplicateCache,
    peak_len: usize,
}

impl ForwardingEngine {
    pub fn new(me: NodeId, config: &MeshConfig) -> Self {
        Self {
            me,
            relay_broadcast: config.relays_broadcast(),
            enabled: config.metric != RoutingMetric::NoForwarding,
            queue: VecDeque::new(),
            capacity: config.forward_buffer_capacity,
            history: DuplicateCache::new(config.forwarded_history_capacity),
            peak_len: 0,
        }
    }

    pub fn classify(&self, packet: &MeshPacket) -> Inbound {
        match packet.kind() {
            MessageKind::Rreq => return Inbound::Rreq,
            MessageKind::Rrep => {
                return if packet.destination == self.me || packet.via == self.me {
                    Inbound::Rrep
                } else {
                    Inbound::UnrelatedRrep
                };
            }
            MessageKind::Data | MessageKind::Ack | MessageKind::Routing => {}
        }

        if packet.source == self.me {
            Inbound::FromMe
        } else if packet.destination == self.me {
            Inbound::ForMe
        } else if packet.destination.is_broadcast() {
            Inbound::Broadcast
        } else if packet.via == self.me || (packet.is_flooded() && self.relay_broadcast) {
            Inbound::Relay
        } else {
            Inbound::Overheard
        }
    }

    /// Offer a relay candidate. On acceptance the queued copy has its TTL
    /// decremented and `last_hop` set to this node.
    pub fn admit(&mut self, packet: &MeshPacket) -> Admission {
        let identity = packet.identity();

        if packet.ttl <= 1 {
            debug!(node = %self.me, %identity, "relay dropped: ttl expired");
            return Admission::Expired;
        }
        if !self.enabled {
            return Admission::Disabled;
        }
        if self.history.contains(&identity) || self.is_queued(&identity) {
            debug!(node = %self.me, %identity, "relay dropped: duplicate");
            return Admission::Duplicate;
        }
        if self.capacity != 0 && self.queue.len() >= self.capacity {
            debug!(node = %self.me, %identity, capacity = self.capacity, "relay dropped: buffer full");
            return Admission::BufferFull;
        }

        self.queue.push_back(packet.relayed_by(self.me));
        self.peak_len = self.peak_len.max(self.queue.len());
        debug!(node = %self.me, %identity, ttl = packet.ttl - 1, queued = self.queue.len(), "relay accepted");
        Admission::Accepted
    }

    fn is_queued(&self, identity: &PacketIdentity) -> bool {
        self.queue.iter().any(|p| p.identity() == *identity)
    }

    /// Pop the next packet to relay, discarding any already forwarded.
    /// Returns the packet (if any) and how many stale entries were skipped.
    pub fn next_to_forward(&mut self) -> (Option<MeshPacket>, usize) {
        let mut skipped = 0;
        while let Some(packet) = self.queue.pop_front() {
            if self.history.contains(&packet.identity()) {
                skipped += 1;
                continue;
            }
            return (Some(packet), skipped);
        }
        (None, skipped)
    }

    /// Remember that `identity` went out as a relay
    pub fn record_forwarded(&mut self, identity: PacketIdentity) {
        self.history.record(identity);
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    pub fn has_queued(&self) -> bool {
        !self.queue.is_empty()
    }

    /// Longest the forward queue has been
    pub fn peak_queue_len(&self) -> usize {
        self.peak_len
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(n: u32) -> NodeId {
        NodeId::new(n)
    }

    fn engine(config: MeshConfig) -> ForwardingEngine {
        ForwardingEngine::new(id(5), &config.resolved(8))
    }

    fn data(ttl: u8) -> MeshPacket {
        MeshPacket::data(id(1), id(9), 4, 20, ttl).with_via(id(5))
    }

    #[test]
    fn test_classification_order() {
        let fwd = engine(MeshConfig::default());
        let me = id(5);

        let own = MeshPacket::data(me, id(9), 1, 20, 3).with_via(me);
        assert_eq!(fwd.classify(&own), Inbound::FromMe);

        let for_me = MeshPacket::data(id(1), me, 1, 20, 3).with_via(me);
        assert_eq!(fwd.classify(&for_me), Inbound::ForMe);

        let beacon = MeshPacket::routing(id(2), 1, 255, vec![]);
        assert_eq!(fwd.classify(&beacon), Inbound::Broadcast);

        assert_eq!(fwd.classify(&data(3)), Inbound::Relay);

        let other = data(3).with_via(id(6));
        assert_eq!(fwd.classify(&other), Inbound::Overheard);

        let flooded = data(3).with_via(NodeId::BROADCAST);
        assert_eq!(fwd.classify(&flooded), Inbound::Overheard);
        let relaying = engine(MeshConfig::default().with_route_discovery(true));
        assert_eq!(relaying.classify(&flooded), Inbound::Relay);
    }

    #[test]
    fn test_discovery_classified_first() {
        let fwd = engine(MeshConfig::default());
        let rreq = MeshPacket::rreq(id(5), id(9), 1, 8, 4);
        assert_eq!(fwd.classify(&rreq), Inbound::Rreq);

        let rrep_for_me = MeshPacket::rrep(id(9), id(5), 1, id(5), 8, 4);
        assert_eq!(fwd.classify(&rrep_for_me), Inbound::Rrep);
        let rrep_via_me = MeshPacket::rrep(id(9), id(1), 1, id(5), 8, 4);
        assert_eq!(fwd.classify(&rrep_via_me), Inbound::Rrep);
        let rrep_elsewhere = MeshPacket::rrep(id(9), id(1), 1, id(3), 8, 4);
        assert_eq!(fwd.classify(&rrep_elsewhere), Inbound::UnrelatedRrep);
    }

    #[test]
    fn test_ttl_checked_before_duplicate() {
        let mut fwd = engine(MeshConfig::default());
        fwd.record_forwarded(data(1).identity());
        assert_eq!(fwd.admit(&data(1)), Admission::Expired);
        assert_eq!(fwd.admit(&data(2)), Admission::Duplicate);
    }

    #[test]
    fn test_accept_decrements_ttl() {
        let mut fwd = engine(MeshConfig::default());
        assert_eq!(fwd.admit(&data(4)), Admission::Accepted);
        assert_eq!(fwd.admit(&data(4)), Admission::Duplicate);

        let (queued, skipped) = fwd.next_to_forward();
        let queued = queued.unwrap();
        assert_eq!(skipped, 0);
        assert_eq!(queued.ttl, 3);
        assert_eq!(queued.last_hop, id(5));
    }

    #[test]
    fn test_buffer_full_after_other_checks() {
        let mut fwd = engine(MeshConfig::default().with_forward_buffer_capacity(1));
        assert_eq!(fwd.admit(&data(4)), Admission::Accepted);

        let mut second = data(4);
        second.seq = 99;
        assert_eq!(fwd.admit(&second), Admission::BufferFull);
        // expired and duplicate outcomes win over a full buffer
        assert_eq!(fwd.admit(&data(1)), Admission::Expired);
        assert_eq!(fwd.admit(&data(4)), Admission::Duplicate);
        assert_eq!(fwd.peak_queue_len(), 1);
    }

    #[test]
    fn test_no_forwarding_metric() {
        let mut fwd = engine(MeshConfig::default().with_metric(RoutingMetric::NoForwarding));
        assert_eq!(fwd.admit(&data(4)), Admission::Disabled);
        assert_eq!(fwd.admit(&data(1)), Admission::Expired);
    }

    #[test]
    fn test_next_to_forward_skips_forwarded() {
        let mut fwd = engine(MeshConfig::default());
        let mut other = data(4);
        other.seq = 7;
        fwd.admit(&data(4));
        fwd.admit(&other);
        fwd.record_forwarded(data(4).identity());

        let (next, skipped) = fwd.next_to_forward();
        assert_eq!(next.unwrap().seq, 7);
        assert_eq!(skipped, 1);
        assert!(!fwd.has_queued());
    }
}
