//! Discrete-event mesh simulation
//!
//! Drives a set of [`MeshNode`]s over a static [`Topology`]. The harness
//! owns the clock, the channel and the event queue; nodes only see frames
//! and wake-ups.
//!
//! ```text
//!  BinaryHeap<ScheduledEvent>   (time, seq) min-ordered
//!       │
//!       ├─ Wakeup { node }        ──► MeshNode::handle_wakeup
//!       ├─ Deliver { to, packet } ──► MeshNode::handle_packet
//!       └─ TransmitEnd { node }   ──► channel bookkeeping
//!
//!  NodeEvent::Transmit ──► one Deliver per neighbor at now + airtime
//! ```
//!
//! A node's medium is busy while it or any neighbor is transmitting. With
//! collisions enabled, receptions that overlap at a receiver are all lost,
//! as is anything arriving while the receiver transmits.
//!
//! ## Example
//!
//! ```ignore
//! use loramesh_core::mesh::{MeshConfig, MeshSimulator, SimConfig, Topology};
//!
//! let mut sim = MeshSimulator::new(Topology::chain(5), &MeshConfig::default(), SimConfig::default())?;
//! let report = sim.run()?;
//! println!("{}", report);
//! ```

use super::config::MeshConfig;
use super::coordinator::{ConvergenceCoordinator, GlobalConvergence};
use super::error::{MeshError, MeshResult};
use super::node::{MeshNode, NodeEvent, Transmission};
use super::packet::{MeshPacket, NodeId};
use super::stats::NodeStats;
use super::time::SimTime;
use super::topology::Topology;
use super::traits::{MediumState, NodeActivity, NodeRegistry};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, trace};

/// Simulation configuration
#[derive(Debug, Clone)]
pub struct SimConfig {
    /// Simulated run length
    pub duration: Duration,
    /// Random seed for reproducibility
    pub seed: u64,
    /// Drop receptions that overlap at a receiver
    pub collisions: bool,
    /// Independent per-reception loss probability
    pub link_loss: f64,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            duration: Duration::from_secs(3600), // 1 hour
            seed: 42,
            collisions: false,
            link_loss: 0.0,
        }
    }
}

impl SimConfig {
    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration = duration;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_collisions(mut self, collisions: bool) -> Self {
        self.collisions = collisions;
        self
    }

    pub fn with_link_loss(mut self, loss: f64) -> Self {
        self.link_loss = loss.clamp(0.0, 1.0);
        self
    }
}

/// Unique sequence number for deterministic ordering of same-time events
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct SequenceNumber(u64);

#[derive(Debug, Clone)]
enum SimEvent {
    /// `at` is the wake-up time the node asked for
    Wakeup { node: usize, at: SimTime },
    Deliver {
        to: usize,
        packet: MeshPacket,
        rssi: f32,
        tx_id: u64,
    },
    TransmitEnd { node: usize },
}

#[derive(Debug, Clone)]
struct ScheduledEvent {
    time: SimTime,
    seq: SequenceNumber,
    event: SimEvent,
}

impl PartialEq for ScheduledEvent {
    fn eq(&self, other: &Self) -> bool {
        self.time == other.time && self.seq == other.seq
    }
}

impl Eq for ScheduledEvent {}

impl PartialOrd for ScheduledEvent {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ScheduledEvent {
    // reversed: BinaryHeap is a max-heap
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .time
            .cmp(&self.time)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// A reception in progress at some receiver
#[derive(Debug, Clone, Copy)]
struct Reception {
    tx_id: u64,
    end: SimTime,
}

/// Busy/idle view of the shared channel
#[derive(Debug)]
struct Channel {
    transmitting_until: Vec<SimTime>,
    neighbors: Vec<Vec<usize>>,
}

impl Channel {
    fn is_transmitting(&self, node: usize, now: SimTime) -> bool {
        self.transmitting_until[node] > now
    }
}

impl MediumState for Channel {
    fn is_idle(&self, node: NodeId, now: SimTime) -> bool {
        let idx = node.index();
        if idx >= self.transmitting_until.len() {
            return true;
        }
        !self.is_transmitting(idx, now)
            && self.neighbors[idx]
                .iter()
                .all(|&n| !self.is_transmitting(n, now))
    }
}

/// Activity snapshot of every node, refreshed after each node call
#[derive(Debug)]
struct ActivityBoard {
    activity: Vec<NodeActivity>,
}

impl NodeRegistry for ActivityBoard {
    fn nodes(&self) -> Vec<NodeId> {
        (0..self.activity.len() as u32).map(NodeId::new).collect()
    }

    fn activity(&self, node: NodeId) -> Option<NodeActivity> {
        self.activity.get(node.index()).copied()
    }
}

/// Per-node summary
#[derive(Debug, Clone, Serialize)]
pub struct NodeReport {
    pub id: NodeId,
    /// Fraction of elapsed time spent transmitting
    pub duty_cycle_used: f64,
    pub routes: usize,
    pub stats: NodeStats,
}

/// Run summary
#[derive(Debug, Clone, Default, Serialize)]
pub struct SimReport {
    /// Simulated time covered (seconds)
    pub elapsed_secs: f64,
    pub nodes: usize,
    /// Frames put on the air
    pub transmissions: u64,
    /// Frames handed to a receiver
    pub receptions: u64,
    /// Receptions lost to overlap or half-duplex
    pub collisions: u64,
    /// Receptions lost to random link loss
    pub lost: u64,
    /// Own data packets generated across the network
    pub data_generated: u64,
    /// Distinct data packets delivered to their destination
    pub data_delivered: u64,
    pub delivery_ratio: f64,
    pub mean_latency_secs: Option<f64>,
    pub acks_received: u64,
    pub mean_rtt_secs: Option<f64>,
    pub ack_failures: u64,
    pub discovery_failures: u64,
    /// Last node to converge did so at this time
    pub all_converged_at: Option<SimTime>,
    pub per_node: Vec<NodeReport>,
}

impl fmt::Display for SimReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "=== Mesh Simulation Summary ===")?;
        writeln!(f, "Simulated: {:.1}s, nodes: {}", self.elapsed_secs, self.nodes)?;
        writeln!(f)?;
        writeln!(f, "Data:")?;
        writeln!(f, "  Generated: {}", self.data_generated)?;
        writeln!(f, "  Delivered: {}", self.data_delivered)?;
        writeln!(f, "  Delivery ratio: {:.1}%", self.delivery_ratio * 100.0)?;
        if let Some(latency) = self.mean_latency_secs {
            writeln!(f, "  Mean latency: {:.3}s", latency)?;
        }
        if self.acks_received > 0 || self.ack_failures > 0 {
            writeln!(f, "  ACKs: {} received, {} abandoned", self.acks_received, self.ack_failures)?;
        }
        if let Some(rtt) = self.mean_rtt_secs {
            writeln!(f, "  Mean RTT: {:.3}s", rtt)?;
        }
        writeln!(f)?;
        writeln!(f, "Channel:")?;
        writeln!(f, "  Transmissions: {}", self.transmissions)?;
        writeln!(f, "  Receptions: {}", self.receptions)?;
        writeln!(f, "  Collisions: {}", self.collisions)?;
        writeln!(f, "  Lost: {}", self.lost)?;
        if let Some(at) = self.all_converged_at {
            writeln!(f, "  All nodes converged at {}", at)?;
        }
        writeln!(f)?;
        writeln!(f, "Per-node:")?;
        for node in &self.per_node {
            writeln!(
                f,
                "  Node {:3}: TX={} RX={} fwd={} routes={} duty={:.3}%",
                node.id,
                node.stats.total_sent(),
                node.stats.received_packets,
                node.stats.forwarded_packets,
                node.routes,
                node.duty_cycle_used * 100.0
            )?;
        }
        Ok(())
    }
}

/// Multi-node mesh network simulator
pub struct MeshSimulator {
    config: SimConfig,
    topology: Topology,
    nodes: Vec<MeshNode>,
    coordinator: Arc<ConvergenceCoordinator>,
    queue: BinaryHeap<ScheduledEvent>,
    next_seq: u64,
    /// Wake-up currently in the queue per node
    armed: Vec<Option<SimTime>>,
    channel: Channel,
    board: ActivityBoard,
    receiving: Vec<Vec<Reception>>,
    corrupted: HashSet<(usize, u64)>,
    next_tx_id: u64,
    rng: StdRng,
    now: SimTime,
    started: bool,
    report: SimReport,
    rtt_sum_secs: f64,
}

impl MeshSimulator {
    /// Build one node per topology slot, all with the same configuration
    pub fn new(topology: Topology, mesh: &MeshConfig, config: SimConfig) -> MeshResult<Self> {
        let size = topology.size();
        if size == 0 {
            return Err(MeshError::InvalidTopology("no nodes".to_string()));
        }

        let coordinator = Arc::new(ConvergenceCoordinator::new());
        let nodes = topology
            .node_ids()
            .map(|id| {
                let seed = config.seed.wrapping_add(u64::from(id.as_u32()) * 12345);
                MeshNode::new(id, mesh, size, Arc::clone(&coordinator), seed)
            })
            .collect::<MeshResult<Vec<_>>>()?;

        let neighbors = topology
            .node_ids()
            .map(|id| topology.neighbors(id).into_iter().map(|(n, _)| n.index()).collect())
            .collect();

        info!(nodes = size, links = topology.link_count(), metric = %mesh.metric, "simulator created");

        Ok(Self {
            rng: StdRng::seed_from_u64(config.seed),
            config,
            nodes,
            coordinator,
            queue: BinaryHeap::new(),
            next_seq: 0,
            armed: vec![None; size],
            channel: Channel {
                transmitting_until: vec![SimTime::ZERO; size],
                neighbors,
            },
            board: ActivityBoard {
                activity: vec![NodeActivity::default(); size],
            },
            receiving: vec![Vec::new(); size],
            corrupted: HashSet::new(),
            next_tx_id: 0,
            now: SimTime::ZERO,
            started: false,
            report: SimReport {
                nodes: size,
                ..SimReport::default()
            },
            rtt_sum_secs: 0.0,
            topology,
        })
    }

    fn schedule(&mut self, time: SimTime, event: SimEvent) {
        let seq = SequenceNumber(self.next_seq);
        self.next_seq += 1;
        self.queue.push(ScheduledEvent { time, seq, event });
    }

    /// Queue the node's pending wake-up unless the same one is queued
    fn sync_wakeup(&mut self, idx: usize) {
        let wanted = self.nodes[idx].next_wakeup();
        if wanted != self.armed[idx] {
            self.armed[idx] = wanted;
            if let Some(at) = wanted {
                self.schedule(at.max(self.now), SimEvent::Wakeup { node: idx, at });
            }
        }
    }

    /// Start every operational node at the current time
    pub fn start(&mut self) -> MeshResult<()> {
        if self.started {
            return Ok(());
        }
        for idx in 0..self.nodes.len() {
            if self.nodes[idx].is_operational() {
                self.nodes[idx].start(self.now)?;
                self.sync_wakeup(idx);
            }
        }
        self.started = true;
        Ok(())
    }

    /// Start and run for the configured duration
    pub fn run(&mut self) -> MeshResult<SimReport> {
        self.start()?;
        let end = SimTime::ZERO + self.config.duration;
        self.run_until(end);
        Ok(self.report())
    }

    /// Process events up to and including `end`
    pub fn run_until(&mut self, end: SimTime) {
        while let Some(next) = self.queue.peek() {
            if next.time > end {
                break;
            }
            self.step();
        }
        self.now = self.now.max(end);
    }

    /// Process one event. Returns false when the queue is empty.
    pub fn step(&mut self) -> bool {
        let Some(scheduled) = self.queue.pop() else {
            return false;
        };
        self.now = scheduled.time;
        let now = self.now;

        match scheduled.event {
            SimEvent::Wakeup { node, at } => {
                if self.armed[node] != Some(at) || self.nodes[node].next_wakeup() != Some(at) {
                    trace!(node, %now, "stale wake-up skipped");
                    return true;
                }
                self.armed[node] = None;
                let events = self.nodes[node].handle_wakeup(now, &self.channel, &self.board);
                self.after_node_call(node, events);
            }
            SimEvent::Deliver {
                to,
                packet,
                rssi,
                tx_id,
            } => {
                self.receiving[to].retain(|r| r.tx_id != tx_id);
                if self.corrupted.remove(&(to, tx_id)) {
                    self.report.collisions += 1;
                    trace!(to, tx_id, "reception lost to collision");
                    return true;
                }
                if self.config.link_loss > 0.0 && self.rng.gen_bool(self.config.link_loss) {
                    self.report.lost += 1;
                    return true;
                }
                self.report.receptions += 1;
                let events = self.nodes[to].handle_packet(packet, rssi, now);
                self.after_node_call(to, events);
            }
            SimEvent::TransmitEnd { node } => {
                trace!(node, %now, "transmission ended");
            }
        }
        true
    }

    fn after_node_call(&mut self, idx: usize, events: Vec<NodeEvent>) {
        for event in events {
            self.apply_event(idx, event);
        }
        self.board.activity[idx] = self.nodes[idx].activity();
        self.sync_wakeup(idx);
    }

    fn apply_event(&mut self, idx: usize, event: NodeEvent) {
        match event {
            NodeEvent::Transmit(tx) => self.put_on_air(idx, tx),
            NodeEvent::Delivered {
                packet,
                latency,
                unique,
            } => {
                trace!(to = idx, source = %packet.source, seq = packet.seq, ?latency, unique, "delivered");
            }
            NodeEvent::AckReceived { rtt, .. } => {
                self.rtt_sum_secs += rtt.as_secs_f64();
            }
            NodeEvent::AckAbandoned { destination, seq } => {
                debug!(node = idx, %destination, seq, "delivery abandoned");
            }
            NodeEvent::RouteResolved {
                destination,
                next_hop,
            } => {
                debug!(node = idx, %destination, %next_hop, "route resolved");
            }
            NodeEvent::DiscoveryFailed {
                destination,
                dropped,
            } => {
                debug!(node = idx, %destination, dropped, "discovery failed");
            }
            NodeEvent::Converged { at, global } => {
                if global {
                    info!(%at, "network converged");
                }
            }
            NodeEvent::RoutingStopped { at } => {
                debug!(node = idx, %at, "beacons stopped");
            }
        }
    }

    fn put_on_air(&mut self, idx: usize, tx: Transmission) {
        let now = self.now;
        let end = now + tx.airtime;
        let tx_id = self.next_tx_id;
        self.next_tx_id += 1;
        self.report.transmissions += 1;
        self.channel.transmitting_until[idx] = end;
        self.schedule(end, SimEvent::TransmitEnd { node: idx });

        if self.config.collisions {
            // half-duplex: anything this node was receiving is lost
            for reception in self.receiving[idx].iter().filter(|r| r.end > now) {
                self.corrupted.insert((idx, reception.tx_id));
            }
        }

        let sender = self.nodes[idx].id();
        for (neighbor, rssi) in self.topology.neighbors(sender) {
            let to = neighbor.index();
            if self.config.collisions {
                self.receiving[to].retain(|r| r.end > now);
                if self.channel.is_transmitting(to, now) {
                    self.corrupted.insert((to, tx_id));
                }
                if !self.receiving[to].is_empty() {
                    self.corrupted.insert((to, tx_id));
                    for other in &self.receiving[to] {
                        self.corrupted.insert((to, other.tx_id));
                    }
                }
                self.receiving[to].push(Reception { tx_id, end });
            }
            self.schedule(
                end,
                SimEvent::Deliver {
                    to,
                    packet: tx.packet.clone(),
                    rssi,
                    tx_id,
                },
            );
        }
    }

    /// Queue an application packet at `from` for `to`. Returns its
    /// sequence number.
    pub fn inject(&mut self, from: NodeId, to: NodeId, length: u16) -> MeshResult<u32> {
        let idx = from.index();
        if idx >= self.nodes.len() {
            return Err(MeshError::UnknownNode(from));
        }
        if to.index() >= self.nodes.len() {
            return Err(MeshError::UnknownNode(to));
        }
        let seq = self.nodes[idx].enqueue_data(to, length, self.now);
        self.sync_wakeup(idx);
        Ok(seq)
    }

    /// Take a node down or bring it back before the run starts
    pub fn set_operational(&mut self, node: NodeId, operational: bool) -> MeshResult<()> {
        let target = self
            .nodes
            .get_mut(node.index())
            .ok_or(MeshError::UnknownNode(node))?;
        target.set_operational(operational);
        Ok(())
    }

    /// Summarize the run so far
    pub fn report(&self) -> SimReport {
        let mut report = self.report.clone();
        report.elapsed_secs = self.now.as_secs_f64();
        report.per_node = self
            .nodes
            .iter()
            .map(|node| {
                let stats = node.stats();
                let elapsed = self.now.as_secs_f64();
                NodeReport {
                    id: node.id(),
                    duty_cycle_used: if elapsed > 0.0 {
                        stats.airtime_secs / elapsed
                    } else {
                        0.0
                    },
                    routes: node.routes().len(),
                    stats,
                }
            })
            .collect();

        let mut latency_sum = 0.0;
        for node in &report.per_node {
            report.data_generated += node.stats.data_generated;
            report.data_delivered += node.stats.delivered_unique;
            report.acks_received += node.stats.acks_received;
            report.ack_failures += node.stats.ack_failures;
            report.discovery_failures += node.stats.discovery.failed;
            latency_sum += node.stats.latency_sum_secs;
        }
        if report.data_generated > 0 {
            report.delivery_ratio = report.data_delivered as f64 / report.data_generated as f64;
        }
        if report.data_delivered > 0 {
            report.mean_latency_secs = Some(latency_sum / report.data_delivered as f64);
        }
        if report.acks_received > 0 {
            report.mean_rtt_secs = Some(self.rtt_sum_secs / report.acks_received as f64);
        }
        report.all_converged_at = self.coordinator.query_global_state().all_converged_at;
        report
    }

    pub fn now(&self) -> SimTime {
        self.now
    }

    pub fn node(&self, id: NodeId) -> Option<&MeshNode> {
        self.nodes.get(id.index())
    }

    pub fn nodes(&self) -> &[MeshNode] {
        &self.nodes
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    pub fn convergence(&self) -> GlobalConvergence {
        self.coordinator.query_global_state()
    }

    /// Events still queued
    pub fn pending_events(&self) -> usize {
        self.queue.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mesh::config::RoutingMetric;

    fn id(n: u32) -> NodeId {
        NodeId::new(n)
    }

    fn scheduled(time: u64, seq: u64) -> ScheduledEvent {
        ScheduledEvent {
            time: SimTime::from_secs(time),
            seq: SequenceNumber(seq),
            event: SimEvent::Wakeup {
                node: 0,
                at: SimTime::from_secs(time),
            },
        }
    }

    #[test]
    fn test_event_ordering() {
        let mut heap = BinaryHeap::new();
        heap.push(scheduled(10, 1));
        heap.push(scheduled(5, 3));
        heap.push(scheduled(5, 2));

        let order: Vec<(SimTime, u64)> = std::iter::from_fn(|| heap.pop())
            .map(|e| (e.time, e.seq.0))
            .collect();
        assert_eq!(
            order,
            vec![
                (SimTime::from_secs(5), 2),
                (SimTime::from_secs(5), 3),
                (SimTime::from_secs(10), 1)
            ]
        );
    }

    #[test]
    fn test_medium_busy_near_transmitter() {
        let channel = Channel {
            transmitting_until: vec![SimTime::from_secs(2), SimTime::ZERO, SimTime::ZERO],
            neighbors: vec![vec![1], vec![0, 2], vec![1]],
        };
        let now = SimTime::from_secs(1);
        assert!(!channel.is_idle(id(0), now));
        assert!(!channel.is_idle(id(1), now));
        assert!(channel.is_idle(id(2), now));
        assert!(channel.is_idle(id(1), SimTime::from_secs(2)));
    }

    #[test]
    fn test_empty_topology_rejected() {
        assert!(matches!(
            MeshSimulator::new(Topology::new(0), &MeshConfig::default(), SimConfig::default()),
            Err(MeshError::InvalidTopology(_))
        ));
    }

    #[test]
    fn test_non_operational_node_skipped_at_start() {
        let mut sim =
            MeshSimulator::new(Topology::chain(2), &MeshConfig::default(), SimConfig::default()).unwrap();
        sim.set_operational(id(1), false).unwrap();
        assert!(sim.start().is_ok());
        assert!(sim.node(id(1)).unwrap().next_wakeup().is_none());
        assert!(matches!(
            sim.set_operational(id(5), true),
            Err(MeshError::UnknownNode(_))
        ));
    }

    #[test]
    fn test_full_mesh_delivers() {
        let mesh = MeshConfig::default()
            .with_metric(RoutingMetric::HopCount)
            .with_traffic(2, 0);
        let sim_config = SimConfig::default().with_duration(Duration::from_secs(1800));
        let mut sim = MeshSimulator::new(Topology::full(3), &mesh, sim_config).unwrap();
        let report = sim.run().unwrap();

        assert_eq!(report.nodes, 3);
        assert_eq!(report.data_generated, 12);
        assert_eq!(report.data_delivered, 12);
        assert!((report.delivery_ratio - 1.0).abs() < 1e-9);
        assert!(report.transmissions >= 12);
        assert!(report.to_string().contains("Delivery ratio: 100.0%"));
    }
}
