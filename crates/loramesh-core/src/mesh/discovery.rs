//! On-demand route discovery (AODV-lite)
//!
//! ```text
//!   A (requester)            B (relay)              C (destination)
//!   ── RREQ(A→C, id) ──────► seen? no
//!                            reverse route A via A
//!                            ── RREQ ttl-1 ─────────► seen? no
//!                                                     reverse route A via B
//!                            ◄──────── RREP(C→A) ──── only C replies
//!                            forward route C via C
//!   ◄── RREP via best route to A
//!   forward route C via B
//!   lock next hop C = B, release buffered data
//! ```
//!
//! Requests are deduplicated by `(origin, broadcast_id)` for the whole run.
//! Only the requested destination answers; intermediate nodes never reply
//! on its behalf. A reply that cannot be routed back is dropped, never
//! flooded.

use super::packet::{MeshPacket, NodeId, PacketBody};
use super::routing::RouteTable;
use super::time::SimTime;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// First hop frozen for a flow after discovery
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockedHop {
    pub next_hop: NodeId,
    pub expires: SimTime,
}

#[derive(Debug, Clone, Copy)]
struct ReverseParent {
    broadcast_id: u32,
    next_hop: NodeId,
    expires: SimTime,
}

#[derive(Debug, Clone, Copy)]
struct Attempt {
    broadcast_id: u32,
    started: SimTime,
    attempts: u32,
}

/// Discovery counters
#[derive(Debug, Clone, Default, Serialize)]
pub struct DiscoveryStats {
    /// RREQs originated (including retries)
    pub rreq_originated: u64,
    /// RREQs rebroadcast for others
    pub rreq_relayed: u64,
    /// RREQs already seen
    pub rreq_duplicates: u64,
    /// RREQs that arrived with no hop budget left
    pub rreq_expired: u64,
    /// RREPs originated as the requested destination
    pub rrep_originated: u64,
    /// RREPs relayed toward a requester
    pub rrep_relayed: u64,
    /// RREPs dropped for lack of a reverse route
    pub rrep_no_route: u64,
    /// RREPs dropped because the best next hop was this node
    pub rrep_self_loop: u64,
    /// RREPs that arrived with no hop budget left
    pub rrep_expired: u64,
    /// Discoveries completed at this node
    pub resolved: u64,
    /// Discoveries abandoned after the last retry
    pub failed: u64,
}

/// What to do with a received RREQ
#[derive(Debug, Clone, PartialEq)]
pub enum RreqOutcome {
    /// Already handled this `(origin, broadcast_id)`
    Duplicate,
    /// This node is the destination: send the reply
    Reply(MeshPacket),
    /// Rebroadcast this copy
    Relay(MeshPacket),
    /// Not for us and no hop budget left
    Expired,
}

/// What to do with a received RREP
#[derive(Debug, Clone, PartialEq)]
pub enum RrepOutcome {
    /// Discovery for `destination` finished here
    Resolved {
        destination: NodeId,
        next_hop: NodeId,
        /// Buffered data, re-addressed to the locked next hop
        released: Vec<MeshPacket>,
    },
    /// Reply for a discovery that already finished
    AlreadyResolved,
    /// Forward this copy
    Relay(MeshPacket),
    /// No route toward the requester; dropped
    NoRoute,
    /// Best next hop resolved to this node; dropped
    SelfLoop,
    /// No hop budget left
    Expired,
}

/// A discovery that ran out of retries
#[derive(Debug, Clone, PartialEq)]
pub struct FailedDiscovery {
    pub destination: NodeId,
    pub dropped: Vec<MeshPacket>,
}

#[derive(Debug, Clone)]
pub struct DiscoveryEngine {
    me: NodeId,
    ttl: u8,
    packet_length: u16,
    route_timeout: Duration,
    retry_interval: Duration,
    max_attempts: u32,
    rreq_seq: u32,
    seen_requests: HashSet<(NodeId, u32)>,
    reverse_parent: HashMap<NodeId, ReverseParent>,
    locked: HashMap<NodeId, LockedHop>,
    in_progress: BTreeMap<NodeId, Attempt>,
    buffered: HashMap<NodeId, Vec<MeshPacket>>,
    stats: DiscoveryStats,
}

impl DiscoveryEngine {
    pub fn new(
        me: NodeId,
        ttl: u8,
        packet_length: u16,
        route_timeout: Duration,
        retry_interval: Duration,
        max_attempts: u32,
    ) -> Self {
        Self {
            me,
            ttl: ttl.max(2),
            packet_length,
            route_timeout,
            retry_interval,
            max_attempts: max_attempts.max(1),
            rreq_seq: 0,
            seen_requests: HashSet::new(),
            reverse_parent: HashMap::new(),
            locked: HashMap::new(),
            in_progress: BTreeMap::new(),
            buffered: HashMap::new(),
            stats: DiscoveryStats::default(),
        }
    }

    /// Buffer `packet` until a route to its destination is known. Returns
    /// the RREQ to send when no discovery is running for that destination.
    pub fn request_route(&mut self, packet: MeshPacket, now: SimTime) -> Option<MeshPacket> {
        let destination = packet.destination;
        self.buffered.entry(destination).or_default().push(packet);

        if self.in_progress.contains_key(&destination) {
            debug!(node = %self.me, %destination, "discovery already running, data buffered");
            return None;
        }
        let rreq = self.originate_rreq(destination);
        let broadcast_id = rreq.seq;
        self.in_progress.insert(
            destination,
            Attempt {
                broadcast_id,
                started: now,
                attempts: 1,
            },
        );
        Some(rreq)
    }

    fn originate_rreq(&mut self, destination: NodeId) -> MeshPacket {
        self.rreq_seq += 1;
        let broadcast_id = self.rreq_seq;
        self.seen_requests.insert((self.me, broadcast_id));
        self.stats.rreq_originated += 1;
        debug!(node = %self.me, %destination, broadcast_id, ttl = self.ttl, "RREQ originated");
        MeshPacket::rreq(self.me, destination, broadcast_id, self.packet_length, self.ttl)
    }

    pub fn on_rreq(&mut self, packet: &MeshPacket, routes: &mut RouteTable, now: SimTime) -> RreqOutcome {
        let (broadcast_id, hop_count) = match packet.body {
            PacketBody::Rreq {
                broadcast_id,
                hop_count,
            } => (broadcast_id, hop_count),
            _ => return RreqOutcome::Duplicate,
        };
        let origin = packet.source;

        if !self.seen_requests.insert((origin, broadcast_id)) {
            self.stats.rreq_duplicates += 1;
            return RreqOutcome::Duplicate;
        }

        let sender = packet.last_hop;
        routes.install_discovered(
            origin,
            sender,
            u32::from(hop_count) + 1,
            packet.spreading_factor,
            now,
            self.route_timeout,
        );
        let parent = self.reverse_parent.entry(origin).or_insert(ReverseParent {
            broadcast_id,
            next_hop: sender,
            expires: now + self.route_timeout,
        });
        if parent.broadcast_id != broadcast_id || parent.expires < now {
            *parent = ReverseParent {
                broadcast_id,
                next_hop: sender,
                expires: now + self.route_timeout,
            };
        }
        let parent_hop = parent.next_hop;

        if packet.destination == self.me {
            self.stats.rrep_originated += 1;
            debug!(node = %self.me, %origin, broadcast_id, via = %parent_hop, "RREP originated");
            let reply = MeshPacket::rrep(
                self.me,
                origin,
                broadcast_id,
                parent_hop,
                self.packet_length,
                self.ttl,
            );
            return RreqOutcome::Reply(reply);
        }

        if packet.ttl > 1 {
            self.stats.rreq_relayed += 1;
            RreqOutcome::Relay(packet.relayed_by(self.me))
        } else {
            self.stats.rreq_expired += 1;
            RreqOutcome::Expired
        }
    }

    pub fn on_rrep(&mut self, packet: &MeshPacket, routes: &mut RouteTable, now: SimTime) -> RrepOutcome {
        let hop_count = match packet.body {
            PacketBody::Rrep { hop_count, .. } => hop_count,
            _ => return RrepOutcome::NoRoute,
        };
        let target = packet.source;
        let sender = packet.last_hop;
        routes.install_discovered(
            target,
            sender,
            u32::from(hop_count) + 1,
            packet.spreading_factor,
            now,
            self.route_timeout,
        );

        if packet.destination == self.me {
            return self.resolve(target, sender, now);
        }

        if packet.ttl <= 1 {
            self.stats.rrep_expired += 1;
            return RrepOutcome::Expired;
        }
        let Some(next) = routes.next_hop_to(packet.destination, now) else {
            self.stats.rrep_no_route += 1;
            warn!(node = %self.me, requester = %packet.destination, "RREP dropped: no reverse route");
            return RrepOutcome::NoRoute;
        };
        if next.node == self.me {
            self.stats.rrep_self_loop += 1;
            error!(node = %self.me, requester = %packet.destination, "RREP next hop resolved to self");
            return RrepOutcome::SelfLoop;
        }

        self.stats.rrep_relayed += 1;
        RrepOutcome::Relay(packet.relayed_by(self.me).with_via(next.node))
    }

    fn resolve(&mut self, destination: NodeId, next_hop: NodeId, now: SimTime) -> RrepOutcome {
        if self.in_progress.remove(&destination).is_none() {
            return RrepOutcome::AlreadyResolved;
        }
        self.locked.insert(
            destination,
            LockedHop {
                next_hop,
                expires: now + self.route_timeout,
            },
        );
        let released: Vec<MeshPacket> = self
            .buffered
            .remove(&destination)
            .unwrap_or_default()
            .into_iter()
            .map(|p| p.with_via(next_hop))
            .collect();
        self.stats.resolved += 1;
        info!(node = %self.me, %destination, %next_hop, released = released.len(), "route discovered");
        RrepOutcome::Resolved {
            destination,
            next_hop,
            released,
        }
    }

    /// Re-issue unanswered requests and give up on exhausted ones
    pub fn poll_retries(&mut self, now: SimTime) -> (Vec<MeshPacket>, Vec<FailedDiscovery>) {
        let due: Vec<NodeId> = self
            .in_progress
            .iter()
            .filter(|(_, a)| a.started + self.retry_interval <= now)
            .map(|(d, _)| *d)
            .collect();

        let mut rreqs = Vec::new();
        let mut failed = Vec::new();
        for destination in due {
            let attempts = self.in_progress.get(&destination).map_or(0, |a| a.attempts);
            if attempts < self.max_attempts {
                let rreq = self.originate_rreq(destination);
                self.in_progress.insert(
                    destination,
                    Attempt {
                        broadcast_id: rreq.seq,
                        started: now,
                        attempts: attempts + 1,
                    },
                );
                rreqs.push(rreq);
            } else {
                self.in_progress.remove(&destination);
                let dropped = self.buffered.remove(&destination).unwrap_or_default();
                self.stats.failed += 1;
                warn!(node = %self.me, %destination, dropped = dropped.len(), "route discovery failed");
                failed.push(FailedDiscovery {
                    destination,
                    dropped,
                });
            }
        }
        (rreqs, failed)
    }

    /// Earliest pending retry
    pub fn next_retry_at(&self) -> Option<SimTime> {
        self.in_progress
            .values()
            .map(|a| a.started + self.retry_interval)
            .min()
    }

    /// Forget reverse parents and locks whose wave has expired
    pub fn expire(&mut self, now: SimTime) {
        self.reverse_parent.retain(|_, p| p.expires >= now);
        self.locked.retain(|_, l| l.expires >= now);
    }

    /// Locked first hop for `destination`, if still valid
    pub fn locked_next_hop(&self, destination: NodeId, now: SimTime) -> Option<NodeId> {
        self.locked
            .get(&destination)
            .filter(|l| l.expires >= now)
            .map(|l| l.next_hop)
    }

    pub fn is_discovering(&self, destination: NodeId) -> bool {
        self.in_progress.contains_key(&destination)
    }

    pub fn buffered_len(&self, destination: NodeId) -> usize {
        self.buffered.get(&destination).map_or(0, Vec::len)
    }

    pub fn stats(&self) -> &DiscoveryStats {
        &self.stats
    }
}
