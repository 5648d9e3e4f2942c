//! Mesh packet types
//!
//! Every frame exchanged between nodes is a [`MeshPacket`]: a common
//! addressing header plus a [`PacketBody`] that is a closed enum over the
//! five message kinds. Handlers match the body exhaustively, so adding a
//! kind is a compile error everywhere it is not yet handled.
//!
//! ## Addressing
//!
//! ```text
//! ┌──────────┬─────────────┬──────────┬──────────┬─────┬─────┐
//! │ source   │ destination │ via      │ last_hop │ ttl │ seq │
//! │ origin   │ final hop   │ next hop │ sender   │     │     │
//! └──────────┴─────────────┴──────────┴──────────┴─────┴─────┘
//! ```
//!
//! `via == NodeId::BROADCAST` means the frame is flooded; any node with
//! broadcast forwarding enabled may relay it.

use super::time::SimTime;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Node identifier
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeId(u32);

impl NodeId {
    /// Reserved flood address (24-bit all-ones)
    pub const BROADCAST: NodeId = NodeId(0x00FF_FFFF);

    pub const fn new(value: u32) -> Self {
        NodeId(value)
    }

    pub const fn as_u32(&self) -> u32 {
        self.0
    }

    /// Index form, for nodes numbered from zero
    pub fn index(&self) -> usize {
        self.0 as usize
    }

    pub fn is_broadcast(&self) -> bool {
        *self == Self::BROADCAST
    }
}

impl From<u32> for NodeId {
    fn from(value: u32) -> Self {
        NodeId(value)
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_broadcast() {
            write!(f, "NodeId(BROADCAST)")
        } else {
            write!(f, "NodeId({})", self.0)
        }
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_broadcast() {
            write!(f, "*")
        } else {
            write!(f, "{}", self.0)
        }
    }
}

/// Message kind, the discriminant of [`PacketBody`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageKind {
    Data = 0,
    Ack = 1,
    Routing = 2,
    Rreq = 3,
    Rrep = 4,
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MessageKind::Data => "DATA",
            MessageKind::Ack => "ACK",
            MessageKind::Routing => "ROUTING",
            MessageKind::Rreq => "RREQ",
            MessageKind::Rrep => "RREP",
        };
        f.write_str(name)
    }
}

/// Cost carried by an advertised route
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AdvertisedMetric {
    Single(u32),
    Dual { primary: u32, secondary: u32 },
}

/// One entry of a routing beacon
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteAdvert {
    pub destination: NodeId,
    pub metric: AdvertisedMetric,
}

impl RouteAdvert {
    pub fn single(destination: NodeId, metric: u32) -> Self {
        Self {
            destination,
            metric: AdvertisedMetric::Single(metric),
        }
    }

    pub fn dual(destination: NodeId, primary: u32, secondary: u32) -> Self {
        Self {
            destination,
            metric: AdvertisedMetric::Dual { primary, secondary },
        }
    }
}

/// Kind-specific packet contents
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PacketBody {
    /// Application payload (only its length matters to the engine)
    Data,
    /// End-to-end acknowledgement, echoing the data packet's `seq`.
    /// Carries the receiver's running totals for traffic from the
    /// acknowledged source.
    Ack {
        rx_total_packets: u32,
        rx_total_bytes: u64,
    },
    /// Periodic route advertisement
    Routing { routes: Vec<RouteAdvert> },
    /// Route request
    Rreq { broadcast_id: u32, hop_count: u8 },
    /// Route reply, answering the request `broadcast_id`
    Rrep { broadcast_id: u32, hop_count: u8 },
}

impl PacketBody {
    pub fn kind(&self) -> MessageKind {
        match self {
            PacketBody::Data => MessageKind::Data,
            PacketBody::Ack { .. } => MessageKind::Ack,
            PacketBody::Routing { .. } => MessageKind::Routing,
            PacketBody::Rreq { .. } => MessageKind::Rreq,
            PacketBody::Rrep { .. } => MessageKind::Rrep,
        }
    }
}

/// Structural packet identity used for duplicate suppression and ACK
/// correlation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PacketIdentity {
    pub kind: MessageKind,
    pub seq: u32,
    pub source: NodeId,
    pub destination: NodeId,
}

impl fmt::Display for PacketIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}#{} {}->{}",
            self.kind, self.seq, self.source, self.destination
        )
    }
}

/// A mesh frame
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeshPacket {
    /// Originating node
    pub source: NodeId,
    /// Final destination (`BROADCAST` for beacons and requests)
    pub destination: NodeId,
    /// Intended next hop (`BROADCAST` to flood)
    pub via: NodeId,
    /// Node that transmitted this copy
    pub last_hop: NodeId,
    /// Remaining hop budget
    pub ttl: u8,
    /// Per-source sequence number
    pub seq: u32,
    /// Application byte length used for airtime
    pub length: u16,
    /// Destination should answer with an ACK
    pub ack_requested: bool,
    /// Time the source first transmitted the packet
    pub departure: SimTime,
    /// Spreading factor chosen by the transmitter
    pub spreading_factor: u8,
    pub body: PacketBody,
}

impl MeshPacket {
    fn new(source: NodeId, destination: NodeId, seq: u32, length: u16, body: PacketBody) -> Self {
        Self {
            source,
            destination,
            via: NodeId::BROADCAST,
            last_hop: source,
            ttl: 1,
            seq,
            length,
            ack_requested: false,
            departure: SimTime::ZERO,
            spreading_factor: 7,
            body,
        }
    }

    /// Application data addressed to `destination`
    pub fn data(source: NodeId, destination: NodeId, seq: u32, length: u16, ttl: u8) -> Self {
        Self::new(source, destination, seq, length, PacketBody::Data).with_ttl(ttl)
    }

    /// Acknowledgement for the data packet `seq` that `data_source` sent
    pub fn ack(
        me: NodeId,
        data_source: NodeId,
        seq: u32,
        length: u16,
        ttl: u8,
        rx_total_packets: u32,
        rx_total_bytes: u64,
    ) -> Self {
        let body = PacketBody::Ack {
            rx_total_packets,
            rx_total_bytes,
        };
        Self::new(me, data_source, seq, length, body).with_ttl(ttl)
    }

    /// Routing beacon. Beacons are single-hop, so `via` is the sender.
    pub fn routing(me: NodeId, beacon_seq: u32, length: u16, routes: Vec<RouteAdvert>) -> Self {
        let mut packet = Self::new(
            me,
            NodeId::BROADCAST,
            beacon_seq,
            length,
            PacketBody::Routing { routes },
        );
        packet.via = me;
        packet
    }

    /// Route request flooded in search of `target`
    pub fn rreq(me: NodeId, target: NodeId, broadcast_id: u32, length: u16, ttl: u8) -> Self {
        let body = PacketBody::Rreq {
            broadcast_id,
            hop_count: 0,
        };
        Self::new(me, target, broadcast_id, length, body).with_ttl(ttl)
    }

    /// Route reply from `me` (the requested destination) back to `origin`
    pub fn rrep(
        me: NodeId,
        origin: NodeId,
        broadcast_id: u32,
        next_hop: NodeId,
        length: u16,
        ttl: u8,
    ) -> Self {
        let body = PacketBody::Rrep {
            broadcast_id,
            hop_count: 0,
        };
        Self::new(me, origin, broadcast_id, length, body)
            .with_ttl(ttl)
            .with_via(next_hop)
    }

    pub fn with_via(mut self, via: NodeId) -> Self {
        self.via = via;
        self
    }

    pub fn with_ttl(mut self, ttl: u8) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn with_ack_requested(mut self, requested: bool) -> Self {
        self.ack_requested = requested;
        self
    }

    pub fn kind(&self) -> MessageKind {
        self.body.kind()
    }

    pub fn identity(&self) -> PacketIdentity {
        PacketIdentity {
            kind: self.kind(),
            seq: self.seq,
            source: self.source,
            destination: self.destination,
        }
    }

    /// Whether this copy is flooded rather than unicast
    pub fn is_flooded(&self) -> bool {
        self.via.is_broadcast()
    }

    /// The copy a relay transmits: one hop less, re-addressed from `me`
    /// (and hop count bumped for discovery packets).
    pub fn relayed_by(&self, me: NodeId) -> Self {
        let mut next = self.clone();
        next.ttl = self.ttl.saturating_sub(1);
        next.last_hop = me;
        match &mut next.body {
            PacketBody::Rreq { hop_count, .. } | PacketBody::Rrep { hop_count, .. } => {
                *hop_count = hop_count.saturating_add(1);
            }
            PacketBody::Data | PacketBody::Ack { .. } | PacketBody::Routing { .. } => {}
        }
        next
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_id_display() {
        assert_eq!(NodeId::new(7).to_string(), "7");
        assert_eq!(NodeId::BROADCAST.to_string(), "*");
        assert_eq!(NodeId::BROADCAST.as_u32(), 16_777_215);
        assert!(NodeId::BROADCAST.is_broadcast());
    }

    #[test]
    fn test_identity_is_structural() {
        let a = MeshPacket::data(NodeId::new(1), NodeId::new(2), 9, 20, 5);
        let mut b = a.clone();
        b.ttl = 2;
        b.via = NodeId::new(4);
        b.last_hop = NodeId::new(4);
        assert_eq!(a.identity(), b.identity());

        let ack = MeshPacket::ack(NodeId::new(1), NodeId::new(2), 9, 8, 5, 0, 0);
        assert_ne!(a.identity(), ack.identity());
    }

    #[test]
    fn test_relayed_copy() {
        let me = NodeId::new(3);
        let rreq = MeshPacket::rreq(NodeId::new(1), NodeId::new(5), 4, 8, 6);
        let relayed = rreq.relayed_by(me);
        assert_eq!(relayed.ttl, 5);
        assert_eq!(relayed.last_hop, me);
        assert_eq!(relayed.source, NodeId::new(1));
        assert!(matches!(
            relayed.body,
            PacketBody::Rreq {
                broadcast_id: 4,
                hop_count: 1
            }
        ));
        assert!(relayed.is_flooded());
    }

    #[test]
    fn test_routing_beacon_addressing() {
        let me = NodeId::new(2);
        let beacon = MeshPacket::routing(me, 3, 255, vec![RouteAdvert::single(NodeId::new(8), 2)]);
        assert_eq!(beacon.destination, NodeId::BROADCAST);
        assert_eq!(beacon.via, me);
        assert_eq!(beacon.kind(), MessageKind::Routing);
    }
}
