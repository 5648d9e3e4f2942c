//! Mesh node
//!
//! A [`MeshNode`] owns every per-node component and exposes two entry
//! points to whatever drives it:
//!
//! - [`MeshNode::handle_packet`] for each frame the radio received
//! - [`MeshNode::handle_wakeup`] when the node's single pending timer fires
//!
//! Both return the [`NodeEvent`]s produced, including the transmissions the
//! driver must put on the air. The node never reads a clock or touches the
//! channel itself.

use super::ack::{AckKey, PendingAckTracker};
use super::airtime::RadioSettings;
use super::config::MeshConfig;
use super::coordinator::ConvergenceCoordinator;
use super::discovery::{DiscoveryEngine, RreqOutcome, RrepOutcome};
use super::error::{MeshError, MeshResult};
use super::forwarding::{Admission, ForwardingEngine, Inbound};
use super::packet::{MeshPacket, MessageKind, NodeId, PacketBody};
use super::routing::{LinkObservation, RoutePolicy, RouteTable};
use super::scheduler::{Backlog, TrafficClass, TransmitScheduler, RESOLVED_DATA_DELAY};
use super::stats::NodeStats;
use super::time::SimTime;
use super::traffic;
use super::traits::{MediumState, NodeActivity, NodeRegistry};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, trace, warn};

/// Earliest first data, beacon or forward after start
const MIN_STARTUP_DELAY: Duration = Duration::from_secs(5);

/// A frame handed to the radio
#[derive(Debug, Clone, PartialEq)]
pub struct Transmission {
    pub packet: MeshPacket,
    pub radio: RadioSettings,
    pub airtime: Duration,
    pub class: TrafficClass,
}

/// Something that happened inside a node
#[derive(Debug, Clone, PartialEq)]
pub enum NodeEvent {
    /// Put this frame on the air now
    Transmit(Transmission),
    /// A data packet reached its destination here
    Delivered {
        packet: MeshPacket,
        latency: Duration,
        /// First copy of this packet
        unique: bool,
    },
    /// An ACK matched one of our packets
    AckReceived {
        destination: NodeId,
        seq: u32,
        rtt: Duration,
    },
    /// Gave up waiting for an ACK
    AckAbandoned { destination: NodeId, seq: u32 },
    /// Discovery locked a next hop
    RouteResolved { destination: NodeId, next_hop: NodeId },
    /// Discovery ran out of retries
    DiscoveryFailed { destination: NodeId, dropped: usize },
    /// The route table reached the convergence threshold
    Converged {
        at: SimTime,
        /// This report completed network-wide convergence
        global: bool,
    },
    /// Periodic routing beacons stopped
    RoutingStopped { at: SimTime },
}

/// One mesh node
#[derive(Debug)]
pub struct MeshNode {
    id: NodeId,
    config: MeshConfig,
    network_size: usize,
    operational: bool,
    routes: RouteTable,
    forwarding: ForwardingEngine,
    discovery: DiscoveryEngine,
    acks: PendingAckTracker,
    scheduler: TransmitScheduler,
    to_send: VecDeque<MeshPacket>,
    control_outbox: VecDeque<MeshPacket>,
    coordinator: Arc<ConvergenceCoordinator>,
    rng: StdRng,
    next_seq: u32,
    beacon_seq: u32,
    delivered: HashSet<(NodeId, u32)>,
    /// Distinct packets and bytes received per source
    rx_totals: HashMap<NodeId, (u32, u64)>,
    activity: NodeActivity,
    routing_stopped: bool,
    converged: bool,
    stats: NodeStats,
}

impl MeshNode {
    /// Build a node for a network of `network_size` nodes. Derived config
    /// values (TTLs, window size) are resolved here.
    pub fn new(
        id: NodeId,
        config: &MeshConfig,
        network_size: usize,
        coordinator: Arc<ConvergenceCoordinator>,
        seed: u64,
    ) -> MeshResult<Self> {
        config.validate()?;
        let config = config.resolved(network_size);

        let policy = if config.store_best_routes_only {
            RoutePolicy::BestOnly
        } else {
            RoutePolicy::KeepAll
        };
        if config.convergence_threshold > 0 && config.sends_beacons() {
            coordinator.register_participant(id);
        }

        Ok(Self {
            id,
            routes: RouteTable::new(config.metric, policy, config.window_size),
            forwarding: ForwardingEngine::new(id, &config),
            discovery: DiscoveryEngine::new(
                id,
                config.discovery_ttl,
                config.control_packet_size,
                config.route_timeout(),
                config.discovery_retry(),
                config.max_discovery_attempts,
            ),
            acks: PendingAckTracker::new(),
            scheduler: TransmitScheduler::new(&config),
            to_send: VecDeque::new(),
            control_outbox: VecDeque::new(),
            coordinator,
            rng: StdRng::seed_from_u64(seed),
            next_seq: 0,
            beacon_seq: 0,
            delivered: HashSet::new(),
            rx_totals: HashMap::new(),
            activity: NodeActivity::default(),
            routing_stopped: !config.sends_beacons(),
            converged: false,
            stats: NodeStats::default(),
            network_size,
            operational: true,
            config,
        })
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    /// Resolved configuration in use
    pub fn config(&self) -> &MeshConfig {
        &self.config
    }

    pub fn set_operational(&mut self, operational: bool) {
        self.operational = operational;
    }

    pub fn is_operational(&self) -> bool {
        self.operational
    }

    /// Generate the first traffic batch and arm the first wake-up
    pub fn start(&mut self, now: SimTime) -> MeshResult<()> {
        if !self.operational {
            return Err(MeshError::NotOperational(self.id));
        }
        self.generate_traffic();

        let first_data = now + self.startup_delay(self.config.time_to_first_data_secs)
            + self.config.data_interval.sample(&mut self.rng);
        let first_routing = now + self.startup_delay(self.config.time_to_first_routing_secs)
            + self.config.routing_interval.sample(&mut self.rng);
        let first_forward = now + self.startup_delay(self.config.time_to_first_forward_secs)
            + self.config.forward_interval.sample(&mut self.rng);
        self.scheduler.start(first_data, first_routing, first_forward);

        debug!(
            node = %self.id,
            queued = self.to_send.len(),
            %first_data,
            %first_routing,
            "node started"
        );
        Ok(())
    }

    fn startup_delay(&self, secs: f64) -> Duration {
        Duration::try_from_secs_f64(secs.max(0.0))
            .unwrap_or(Duration::MAX)
            .max(MIN_STARTUP_DELAY)
    }

    fn generate_traffic(&mut self) {
        let batch = traffic::generate_batch(
            self.id,
            self.network_size,
            &self.config,
            &mut self.next_seq,
            &mut self.rng,
        );
        self.stats.data_generated += batch.len() as u64;
        self.to_send.extend(batch);
    }

    /// Queue one application packet for `destination`. Returns its sequence
    /// number.
    pub fn enqueue_data(&mut self, destination: NodeId, length: u16, now: SimTime) -> u32 {
        let seq = self.next_seq;
        self.next_seq = self.next_seq.wrapping_add(1);
        let packet = MeshPacket::data(self.id, destination, seq, length, self.config.packet_ttl)
            .with_ack_requested(self.config.request_ack);
        self.to_send.push_back(packet);
        self.stats.data_generated += 1;
        let at = self.scheduler.earliest_send(now).max(self.scheduler.next_data());
        self.scheduler.arm_no_later_than(at);
        seq
    }

    /// Process a received frame
    pub fn handle_packet(&mut self, packet: MeshPacket, rssi: f32, now: SimTime) -> Vec<NodeEvent> {
        let mut events = Vec::new();
        if !self.operational {
            return events;
        }
        self.stats.received_packets += 1;
        self.activity.last_reception = Some(now);

        let class = self.forwarding.classify(&packet);
        trace!(node = %self.id, identity = %packet.identity(), ?class, "frame received");
        match class {
            Inbound::Rreq => self.on_rreq(&packet, now),
            Inbound::Rrep => self.on_rrep(&packet, now, &mut events),
            Inbound::UnrelatedRrep => self.stats.unrelated_rrep_drops += 1,
            Inbound::FromMe => {
                self.stats.received_from_me += 1;
                self.activity.last_data_reception = Some(now);
            }
            Inbound::ForMe => match packet.kind() {
                MessageKind::Data => self.deliver(packet, now, &mut events),
                MessageKind::Ack => self.on_ack(&packet, now, &mut events),
                _ => {}
            },
            Inbound::Broadcast => {
                if let PacketBody::Routing { .. } = packet.body {
                    self.on_beacon(&packet, rssi, now, &mut events);
                }
            }
            Inbound::Relay => {
                self.activity.last_data_reception = Some(now);
                self.offer_relay(&packet, now);
            }
            Inbound::Overheard => {
                self.activity.last_data_reception = Some(now);
                self.stats.unicast_wrong_next_hop_drops += 1;
            }
        }
        events
    }

    fn on_rreq(&mut self, packet: &MeshPacket, now: SimTime) {
        match self.discovery.on_rreq(packet, &mut self.routes, now) {
            RreqOutcome::Reply(reply) | RreqOutcome::Relay(reply) => self.push_control(reply, now),
            RreqOutcome::Duplicate | RreqOutcome::Expired => {}
        }
    }

    fn on_rrep(&mut self, packet: &MeshPacket, now: SimTime, events: &mut Vec<NodeEvent>) {
        match self.discovery.on_rrep(packet, &mut self.routes, now) {
            RrepOutcome::Resolved {
                destination,
                next_hop,
                released,
            } => {
                self.to_send.extend(released);
                let at = now + RESOLVED_DATA_DELAY;
                self.scheduler.defer_data(at);
                self.scheduler
                    .arm_no_later_than(self.scheduler.earliest_send(now).max(at));
                events.push(NodeEvent::RouteResolved {
                    destination,
                    next_hop,
                });
            }
            RrepOutcome::Relay(copy) => self.push_control(copy, now),
            RrepOutcome::AlreadyResolved
            | RrepOutcome::NoRoute
            | RrepOutcome::SelfLoop
            | RrepOutcome::Expired => {}
        }
    }

    fn deliver(&mut self, packet: MeshPacket, now: SimTime, events: &mut Vec<NodeEvent>) {
        self.activity.last_data_reception = Some(now);
        self.stats.delivered_packets += 1;

        let unique = self.delivered.insert((packet.source, packet.seq));
        let latency = now.saturating_since(packet.departure);
        if unique {
            self.stats.delivered_unique += 1;
            self.stats.delivered_bytes += u64::from(packet.length);
            self.stats.record_latency(latency);
            let totals = self.rx_totals.entry(packet.source).or_insert((0, 0));
            totals.0 += 1;
            totals.1 += u64::from(packet.length);
        }
        debug!(node = %self.id, source = %packet.source, seq = packet.seq, unique, "data delivered");

        if packet.ack_requested {
            let (rx_packets, rx_bytes) = self.rx_totals.get(&packet.source).copied().unwrap_or_default();
            let ack = MeshPacket::ack(
                self.id,
                packet.source,
                packet.seq,
                self.config.ack_packet_size,
                self.config.packet_ttl,
                rx_packets,
                rx_bytes,
            );
            let via = self.resolve_next_hop(packet.source, now).unwrap_or(NodeId::BROADCAST);
            self.push_control(ack.with_via(via), now);
        }

        events.push(NodeEvent::Delivered {
            packet,
            latency,
            unique,
        });
    }

    fn on_ack(&mut self, packet: &MeshPacket, now: SimTime, events: &mut Vec<NodeEvent>) {
        match self.acks.on_ack_received(self.id, packet.source, packet.seq, now) {
            Some(rtt) => {
                self.stats.record_rtt(rtt);
                debug!(node = %self.id, from = %packet.source, seq = packet.seq, ?rtt, "ack matched");
                events.push(NodeEvent::AckReceived {
                    destination: packet.source,
                    seq: packet.seq,
                    rtt,
                });
            }
            None => self.stats.acks_unmatched += 1,
        }
    }

    fn on_beacon(&mut self, packet: &MeshPacket, rssi: f32, now: SimTime, events: &mut Vec<NodeEvent>) {
        self.stats.routing_packets_received += 1;
        let observation = LinkObservation::new(rssi, packet.seq, packet.spreading_factor);
        let timeout = self.config.route_timeout();

        self.routes
            .refresh_or_insert_neighbor(packet.source, &observation, now, timeout);
        if let PacketBody::Routing { routes } = &packet.body {
            for advert in routes.iter().filter(|a| a.destination != self.id) {
                self.routes
                    .merge_advertised_route(advert, packet.source, &observation, now, timeout);
            }
        }
        self.check_convergence(now, events);
    }

    fn check_convergence(&mut self, now: SimTime, events: &mut Vec<NodeEvent>) {
        let threshold = self.config.convergence_threshold;
        if self.converged || threshold == 0 || !self.config.sends_beacons() {
            return;
        }
        if self.routes.unique_destinations() < threshold {
            return;
        }
        self.converged = true;
        self.stats.converged_at = Some(now);
        let global = self.coordinator.register_convergence(self.id, now);
        if self.config.freeze_routing_at_threshold && !self.routes.is_frozen() {
            self.routes.freeze(now, self.config.freeze_validity_horizon());
            info!(node = %self.id, %now, "route table frozen");
        }
        events.push(NodeEvent::Converged { at: now, global });
    }

    fn offer_relay(&mut self, packet: &MeshPacket, now: SimTime) {
        match self.forwarding.admit(packet) {
            Admission::Accepted => {
                let at = self
                    .scheduler
                    .earliest_send(now)
                    .max(self.scheduler.next_forward());
                self.scheduler.arm_no_later_than(at);
            }
            Admission::Expired => self.stats.ttl_expired_drops += 1,
            Admission::Disabled => self.stats.forwarding_disabled_drops += 1,
            Admission::Duplicate => self.stats.duplicate_drops += 1,
            Admission::BufferFull => self.stats.buffer_full_drops += 1,
        }
    }

    fn push_control(&mut self, packet: MeshPacket, now: SimTime) {
        self.control_outbox.push_back(packet);
        let at = self.scheduler.earliest_send(now);
        self.scheduler.arm_no_later_than(at);
    }

    /// Locked next hop, else best route. `None` when neither exists.
    fn resolve_next_hop(&mut self, destination: NodeId, now: SimTime) -> Option<NodeId> {
        self.resolve_hop_and_sf(destination, now).map(|(hop, _)| hop)
    }

    fn resolve_hop_and_sf(&mut self, destination: NodeId, now: SimTime) -> Option<(NodeId, Option<u8>)> {
        let found = match self.discovery.locked_next_hop(destination, now) {
            Some(hop) if self.config.metric.is_dual() => {
                let sf = self
                    .routes
                    .spreading_factor_to(destination, self.config.min_sf, self.config.max_sf);
                Some((hop, Some(sf)))
            }
            Some(hop) => Some((hop, None)),
            None => self
                .routes
                .next_hop_to(destination, now)
                .map(|next| (next.node, next.spreading_factor)),
        };
        match found {
            Some((hop, _)) if hop == self.id => {
                warn!(node = %self.id, %destination, "next hop resolved to self, treating as no route");
                self.stats.self_next_hop_drops += 1;
                None
            }
            other => other,
        }
    }

    /// Timer expiry: housekeeping, then at most one transmission
    pub fn handle_wakeup(
        &mut self,
        now: SimTime,
        medium: &dyn MediumState,
        registry: &dyn NodeRegistry,
    ) -> Vec<NodeEvent> {
        let mut events = Vec::new();
        self.scheduler.take_wakeup();
        if !self.operational {
            return events;
        }
        if !medium.is_idle(self.id, now) {
            let at = self.scheduler.backoff(now);
            trace!(node = %self.id, %at, "medium busy, backing off");
            return events;
        }
        if self.scheduler.in_off_period(now) {
            self.scheduler
                .arm_no_later_than(self.scheduler.earliest_send(now));
            return events;
        }

        self.housekeeping(now, registry, &mut events);

        let backlog = self.backlog();
        let due = self.scheduler.due(backlog, now);
        let sent = match self.scheduler.choose(due, &mut self.rng) {
            Some(class) => self.transmit(class, now, &mut events),
            None => None,
        };

        let deadlines = self.deadlines();
        let backlog = self.backlog();
        self.scheduler.rearm(now, sent, backlog, deadlines);
        events
    }

    fn housekeeping(&mut self, now: SimTime, registry: &dyn NodeRegistry, events: &mut Vec<NodeEvent>) {
        self.routes.sanitize(now);
        self.discovery.expire(now);

        if let Some(timeout) = self.config.ack_timeout() {
            let sweep = self
                .acks
                .sweep(now, timeout, self.config.max_send_attempts);
            self.stats.data_retransmissions += sweep.retry.len() as u64;
            self.to_send.extend(sweep.retry);
            for key in sweep.abandoned {
                self.stats.ack_failures += 1;
                debug!(node = %self.id, destination = %key.destination, seq = key.seq, "ack abandoned");
                events.push(NodeEvent::AckAbandoned {
                    destination: key.destination,
                    seq: key.seq,
                });
            }
        }

        if self.config.discovers_on_demand() {
            let (rreqs, failed) = self.discovery.poll_retries(now);
            self.control_outbox.extend(rreqs);
            for failure in failed {
                for packet in failure.dropped.iter().filter(|p| p.ack_requested) {
                    let key = AckKey::new(packet.source, packet.destination, packet.seq);
                    if let Some(attempts) = self.acks.abandon(key) {
                        self.stats.ack_failures += 1;
                        debug!(node = %self.id, destination = %key.destination, seq = key.seq, attempts, "ack abandoned, no route");
                        events.push(NodeEvent::AckAbandoned {
                            destination: key.destination,
                            seq: key.seq,
                        });
                    }
                }
                events.push(NodeEvent::DiscoveryFailed {
                    destination: failure.destination,
                    dropped: failure.dropped.len(),
                });
            }
        }

        if !self.routing_stopped && self.should_stop_routing(now, registry) {
            self.routing_stopped = true;
            self.stats.routing_stopped_at = Some(now);
            info!(node = %self.id, %now, "routing beacons stopped");
            events.push(NodeEvent::RoutingStopped { at: now });
        }
    }

    fn should_stop_routing(&self, now: SimTime, registry: &dyn NodeRegistry) -> bool {
        if self.config.stop_routing_when_all_converged && self.coordinator.all_converged() {
            return true;
        }
        if self.config.send_packets_continuously {
            return false;
        }
        let nodes = registry.nodes();
        if nodes.is_empty() {
            return false;
        }
        let grace = self.config.stop_routing_after_data_done();
        let quiet = |t: Option<SimTime>| t.map_or(true, |t| t + grace < now);
        nodes.iter().all(|&node| match registry.activity(node) {
            Some(activity) => {
                activity.last_data_transmission.is_some()
                    && quiet(activity.last_data_transmission)
                    && quiet(activity.last_data_reception)
            }
            None => false,
        })
    }

    fn backlog(&self) -> Backlog {
        Backlog {
            routing: !self.routing_stopped,
            control: !self.control_outbox.is_empty(),
            own_data: !self.to_send.is_empty(),
            forward: self.forwarding.has_queued(),
        }
    }

    fn deadlines(&self) -> Vec<SimTime> {
        let mut deadlines = Vec::new();
        if let Some(timeout) = self.config.ack_timeout() {
            deadlines.extend(self.acks.next_deadline(timeout));
        }
        if self.config.discovers_on_demand() {
            deadlines.extend(self.discovery.next_retry_at());
        }
        deadlines
    }

    /// Send one packet of `class`. Returns its airtime, or `None` when
    /// nothing went out.
    fn transmit(&mut self, class: TrafficClass, now: SimTime, events: &mut Vec<NodeEvent>) -> Option<Duration> {
        let (packet, spacing) = match class {
            TrafficClass::Routing => (self.next_beacon(now), self.config.routing_interval.sample(&mut self.rng)),
            TrafficClass::Control => {
                let mut packet = self.control_outbox.pop_front()?;
                packet.spreading_factor = self.config.radio.spreading_factor;
                (packet, Duration::ZERO)
            }
            TrafficClass::OwnData => (self.next_own_data(now)?, self.config.data_interval.sample(&mut self.rng)),
            TrafficClass::Forward => (self.next_forward(now)?, self.config.forward_interval.sample(&mut self.rng)),
        };

        let radio = self.config.radio.with_spreading_factor(packet.spreading_factor);
        let airtime = radio.airtime(packet.length);
        self.scheduler.record_transmission(class, now, airtime, spacing);
        self.activity.last_transmission = Some(now);
        self.stats.record_airtime(airtime);

        match packet.body {
            PacketBody::Routing { .. } => self.stats.routing_packets_sent += 1,
            PacketBody::Rreq { .. } => self.stats.rreq_sent += 1,
            PacketBody::Rrep { .. } => self.stats.rrep_sent += 1,
            PacketBody::Ack { .. } if class == TrafficClass::Control => self.stats.acks_sent += 1,
            _ => {}
        }
        debug!(
            node = %self.id,
            %class,
            identity = %packet.identity(),
            via = %packet.via,
            ttl = packet.ttl,
            sf = packet.spreading_factor,
            ?airtime,
            "transmit"
        );

        if class == TrafficClass::OwnData
            && self.to_send.is_empty()
            && self.config.send_packets_continuously
        {
            self.generate_traffic();
        }

        events.push(NodeEvent::Transmit(Transmission {
            packet,
            radio,
            airtime,
            class,
        }));
        Some(airtime)
    }

    fn next_beacon(&mut self, now: SimTime) -> MeshPacket {
        self.beacon_seq = self.beacon_seq.wrapping_add(1);
        let adverts = self.routes.export(now);
        let mut beacon = MeshPacket::routing(
            self.id,
            self.beacon_seq,
            self.config.routing_packet_max_size,
            adverts,
        );
        beacon.spreading_factor = if self.config.metric.is_dual() {
            self.draw_cad_spreading_factor()
        } else {
            self.config.radio.spreading_factor
        };
        beacon
    }

    /// Uniform draw in `[min_sf, max_sf]`, accepted with probability
    /// `0.5^(sf - min_sf + 1)`
    fn draw_cad_spreading_factor(&mut self) -> u8 {
        let (min_sf, max_sf) = (self.config.min_sf, self.config.max_sf);
        loop {
            let sf = self.rng.gen_range(min_sf..=max_sf);
            let accept = 0.5f64.powi(i32::from(sf - min_sf) + 1);
            if self.rng.gen_bool(accept) {
                return sf;
            }
        }
    }

    fn next_own_data(&mut self, now: SimTime) -> Option<MeshPacket> {
        let mut packet = self.to_send.pop_front()?;
        let destination = packet.destination;

        let hop = if self.config.metric.always_floods() {
            Some((NodeId::BROADCAST, None))
        } else {
            self.resolve_hop_and_sf(destination, now)
        };
        let (via, sf) = match hop {
            Some(found) => found,
            None if self.config.discovers_on_demand() => {
                self.stats.data_buffered_for_discovery += 1;
                debug!(
                    node = %self.id,
                    %destination,
                    seq = packet.seq,
                    running = self.discovery.is_discovering(destination),
                    buffered = self.discovery.buffered_len(destination),
                    "no route, buffering for discovery"
                );
                if let Some(rreq) = self.discovery.request_route(packet, now) {
                    self.control_outbox.push_back(rreq);
                }
                return None;
            }
            None => {
                self.stats.broadcast_data_packets += 1;
                (NodeId::BROADCAST, None)
            }
        };

        packet.via = via;
        packet.last_hop = self.id;
        packet.spreading_factor = sf.unwrap_or(self.config.radio.spreading_factor);
        // ZERO until first transmitted; retries keep the original departure
        if packet.departure == SimTime::ZERO {
            packet.departure = now;
        }
        if packet.ack_requested {
            self.acks.track_packet(&packet, now);
        }
        self.stats.data_sent += 1;
        self.activity.last_data_transmission = Some(now);
        Some(packet)
    }

    fn next_forward(&mut self, now: SimTime) -> Option<MeshPacket> {
        let (next, skipped) = self.forwarding.next_to_forward();
        self.stats.forwarded_history_skips += skipped as u64;
        let mut packet = next?;

        let hop = if self.config.metric.always_floods() {
            None
        } else {
            self.resolve_hop_and_sf(packet.destination, now)
        };
        match hop {
            Some((via, sf)) => {
                packet.via = via;
                packet.spreading_factor = sf.unwrap_or(self.config.radio.spreading_factor);
            }
            None => {
                self.stats.broadcast_forwarded_packets += 1;
                packet.via = NodeId::BROADCAST;
                packet.spreading_factor = self.config.radio.spreading_factor;
            }
        }
        self.forwarding.record_forwarded(packet.identity());
        self.stats.forwarded_packets += 1;
        Some(packet)
    }

    /// Pending wake-up, if any
    pub fn next_wakeup(&self) -> Option<SimTime> {
        self.scheduler.next_wakeup()
    }

    pub fn activity(&self) -> NodeActivity {
        self.activity
    }

    /// Counter snapshot
    pub fn stats(&self) -> NodeStats {
        let mut stats = self.stats.clone();
        stats.discovery = self.discovery.stats().clone();
        stats.deleted_routes = self.routes.deleted_routes();
        stats.max_forward_queue = self.forwarding.peak_queue_len();
        stats
    }

    pub fn routes(&self) -> &RouteTable {
        &self.routes
    }

    pub fn locked_next_hop(&self, destination: NodeId, now: SimTime) -> Option<NodeId> {
        self.discovery.locked_next_hop(destination, now)
    }

    pub fn is_routing_stopped(&self) -> bool {
        self.routing_stopped
    }

    pub fn has_converged(&self) -> bool {
        self.converged
    }

    /// Own packets waiting to be sent
    pub fn send_queue_len(&self) -> usize {
        self.to_send.len()
    }

    pub fn forward_queue_len(&self) -> usize {
        self.forwarding.queue_len()
    }

    pub fn pending_acks(&self) -> usize {
        self.acks.len()
    }

    /// Total airtime transmitted
    pub fn airtime_used(&self) -> Duration {
        self.scheduler.airtime_used()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mesh::config::{InterArrival, RoutingMetric};
    use crate::mesh::packet::RouteAdvert;
    use crate::mesh::traits::{EmptyRegistry, IdleMedium};

    fn id(n: u32) -> NodeId {
        NodeId::new(n)
    }

    fn node_with(me: u32, config: MeshConfig) -> MeshNode {
        MeshNode::new(id(me), &config, 4, Arc::new(ConvergenceCoordinator::new()), 42).unwrap()
    }

    fn quiet_config() -> MeshConfig {
        // no own traffic unless enqueued explicitly
        MeshConfig::default()
            .with_selected_pair(Some(99), None)
            .with_duty_cycle(None)
            .with_routing_interval(InterArrival::uniform(500.0, 500.0))
    }

    fn transmissions(events: &[NodeEvent]) -> Vec<&Transmission> {
        events
            .iter()
            .filter_map(|e| match e {
                NodeEvent::Transmit(t) => Some(t),
                _ => None,
            })
            .collect()
    }

    struct BusyMedium;

    impl MediumState for BusyMedium {
        fn is_idle(&self, _node: NodeId, _now: SimTime) -> bool {
            false
        }
    }

    #[test]
    fn test_start_requires_operational() {
        let mut node = node_with(0, MeshConfig::default());
        node.set_operational(false);
        assert!(matches!(
            node.start(SimTime::ZERO),
            Err(MeshError::NotOperational(n)) if n == id(0)
        ));
    }

    #[test]
    fn test_start_arms_after_startup_floor() {
        let mut node = node_with(0, MeshConfig::default());
        node.start(SimTime::ZERO).unwrap();
        assert_eq!(node.send_queue_len(), 1);
        assert!(node.next_wakeup().unwrap() > SimTime::from_secs(5));
    }

    #[test]
    fn test_busy_medium_backs_off() {
        let mut node = node_with(0, MeshConfig::default());
        node.start(SimTime::ZERO).unwrap();
        let now = SimTime::from_secs(100);
        let events = node.handle_wakeup(now, &BusyMedium, &EmptyRegistry);
        assert!(events.is_empty());
        assert_eq!(node.next_wakeup(), Some(now + Duration::from_micros(20)));
    }

    #[test]
    fn test_no_route_broadcasts_without_discovery() {
        let mut node = node_with(0, quiet_config().with_metric(RoutingMetric::NoForwarding));
        node.start(SimTime::ZERO).unwrap();
        node.enqueue_data(id(3), 20, SimTime::from_secs(60));

        let events = node.handle_wakeup(SimTime::from_secs(60), &IdleMedium, &EmptyRegistry);
        let sent = transmissions(&events);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].packet.via, NodeId::BROADCAST);
        assert_eq!(sent[0].packet.departure, SimTime::from_secs(60));
        assert_eq!(node.stats().broadcast_data_packets, 1);
    }

    #[test]
    fn test_beacon_builds_routes_and_unicasts() {
        let mut node = node_with(0, quiet_config());
        let now = SimTime::from_secs(10);
        let beacon = MeshPacket::routing(id(1), 1, 255, vec![RouteAdvert::single(id(3), 1)]);
        node.handle_packet(beacon, -80.0, now);

        assert_eq!(node.routes().best_route_to(id(3)).unwrap().metric, 2);
        assert_eq!(node.routes().best_route_to(id(1)).unwrap().metric, 1);

        node.start(SimTime::ZERO).unwrap();
        node.enqueue_data(id(3), 20, SimTime::from_secs(60));
        let events = node.handle_wakeup(SimTime::from_secs(60), &IdleMedium, &EmptyRegistry);
        let data: Vec<_> = transmissions(&events)
            .into_iter()
            .filter(|t| t.class == TrafficClass::OwnData)
            .collect();
        assert_eq!(data.len(), 1);
        assert_eq!(data[0].packet.via, id(1));
    }

    #[test]
    fn test_delivery_sends_ack_with_totals() {
        let mut node = node_with(2, quiet_config());
        node.start(SimTime::ZERO).unwrap();
        let now = SimTime::from_secs(30);
        let mut data = MeshPacket::data(id(0), id(2), 5, 20, 3)
            .with_via(id(2))
            .with_ack_requested(true);
        data.departure = SimTime::from_secs(29);

        let events = node.handle_packet(data.clone(), -90.0, now);
        assert!(matches!(
            events.as_slice(),
            [NodeEvent::Delivered { unique: true, latency, .. }] if *latency == Duration::from_secs(1)
        ));
        let again = node.handle_packet(data, -90.0, now);
        assert!(matches!(again.as_slice(), [NodeEvent::Delivered { unique: false, .. }]));

        let events = node.handle_wakeup(SimTime::from_secs(31), &IdleMedium, &EmptyRegistry);
        let sent = transmissions(&events);
        assert_eq!(sent.len(), 1);
        let ack = &sent[0].packet;
        assert_eq!(ack.destination, id(0));
        assert_eq!(ack.seq, 5);
        assert!(matches!(
            ack.body,
            PacketBody::Ack { rx_total_packets: 1, rx_total_bytes: 20 }
        ));
        assert_eq!(node.stats().delivered_unique, 1);
        assert_eq!(node.stats().delivered_packets, 2);
    }

    #[test]
    fn test_ack_matches_pending_packet() {
        let config = quiet_config()
            .with_request_ack(true)
            .with_metric(RoutingMetric::NoForwarding);
        let mut node = node_with(0, config);
        node.start(SimTime::ZERO).unwrap();
        let seq = node.enqueue_data(id(2), 20, SimTime::from_secs(60));
        node.handle_wakeup(SimTime::from_secs(60), &IdleMedium, &EmptyRegistry);
        assert_eq!(node.pending_acks(), 1);

        let ack = MeshPacket::ack(id(2), id(0), seq, 8, 3, 1, 20).with_via(id(0));
        let events = node.handle_packet(ack.clone(), -70.0, SimTime::from_secs(62));
        assert!(matches!(
            events.as_slice(),
            [NodeEvent::AckReceived { rtt, .. }] if *rtt == Duration::from_secs(2)
        ));
        assert_eq!(node.pending_acks(), 0);

        node.handle_packet(ack, -70.0, SimTime::from_secs(63));
        assert_eq!(node.stats().acks_unmatched, 1);
    }

    #[test]
    fn test_overheard_unicast_dropped() {
        let mut node = node_with(1, quiet_config());
        let data = MeshPacket::data(id(0), id(3), 1, 20, 3).with_via(id(2));
        node.handle_packet(data, -70.0, SimTime::from_secs(1));
        assert_eq!(node.stats().unicast_wrong_next_hop_drops, 1);
        assert_eq!(node.forward_queue_len(), 0);
    }

    #[test]
    fn test_relay_forwards_once() {
        let mut node = node_with(1, quiet_config());
        node.start(SimTime::ZERO).unwrap();
        let data = MeshPacket::data(id(0), id(3), 1, 20, 3).with_via(id(1));
        node.handle_packet(data.clone(), -70.0, SimTime::from_secs(1));
        node.handle_packet(data, -70.0, SimTime::from_secs(1));
        assert_eq!(node.forward_queue_len(), 1);
        assert_eq!(node.stats().duplicate_drops, 1);

        let events = node.handle_wakeup(SimTime::from_secs(10), &IdleMedium, &EmptyRegistry);
        let sent: Vec<_> = transmissions(&events)
            .into_iter()
            .filter(|t| t.class == TrafficClass::Forward)
            .collect();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].packet.ttl, 2);
        assert_eq!(sent[0].packet.via, NodeId::BROADCAST);
        assert_eq!(node.stats().broadcast_forwarded_packets, 1);
    }

    struct FixedRegistry(Vec<NodeActivity>);

    impl NodeRegistry for FixedRegistry {
        fn nodes(&self) -> Vec<NodeId> {
            (0..self.0.len() as u32).map(NodeId::new).collect()
        }

        fn activity(&self, node: NodeId) -> Option<NodeActivity> {
            self.0.get(node.index()).copied()
        }
    }

    #[test]
    fn test_relay_traffic_keeps_beacons_running() {
        let mut node = node_with(1, quiet_config());
        node.start(SimTime::ZERO).unwrap();
        node.enqueue_data(id(3), 20, SimTime::from_secs(60));
        node.handle_wakeup(SimTime::from_secs(60), &IdleMedium, &EmptyRegistry);
        assert_eq!(node.activity().last_data_transmission, Some(SimTime::from_secs(60)));

        // still relaying for node 0 after its own data went out
        let relayed = MeshPacket::data(id(0), id(3), 1, 20, 3).with_via(id(1));
        node.handle_packet(relayed, -70.0, SimTime::from_secs(100));
        assert_eq!(node.activity().last_data_reception, Some(SimTime::from_secs(100)));

        let sender = NodeActivity {
            last_data_transmission: Some(SimTime::ZERO),
            ..NodeActivity::default()
        };
        // own data is past the grace window, the relayed frame is not
        let registry = FixedRegistry(vec![sender, node.activity()]);
        node.handle_wakeup(SimTime::from_secs(150), &IdleMedium, &registry);
        assert!(!node.is_routing_stopped());

        let registry = FixedRegistry(vec![sender, node.activity()]);
        node.handle_wakeup(SimTime::from_secs(200), &IdleMedium, &registry);
        assert!(node.is_routing_stopped());
        assert_eq!(node.stats().routing_stopped_at, Some(SimTime::from_secs(200)));
    }

    #[test]
    fn test_echoes_and_overheard_frames_count_as_data_activity() {
        let mut node = node_with(1, quiet_config());
        let echo = MeshPacket::data(id(1), id(3), 1, 20, 2).with_via(id(2));
        node.handle_packet(echo, -70.0, SimTime::from_secs(5));
        assert_eq!(node.activity().last_data_reception, Some(SimTime::from_secs(5)));

        let overheard = MeshPacket::data(id(0), id(3), 1, 20, 3).with_via(id(2));
        node.handle_packet(overheard, -70.0, SimTime::from_secs(9));
        assert_eq!(node.activity().last_data_reception, Some(SimTime::from_secs(9)));

        let beacon = MeshPacket::routing(id(2), 1, 255, vec![]);
        node.handle_packet(beacon, -70.0, SimTime::from_secs(12));
        assert_eq!(node.activity().last_data_reception, Some(SimTime::from_secs(9)));
    }

    #[test]
    fn test_route_through_self_is_not_used() {
        let mut node = node_with(1, quiet_config());
        node.start(SimTime::ZERO).unwrap();
        node.routes
            .install_discovered(id(3), id(1), 1, 7, SimTime::ZERO, Duration::from_secs(100));
        node.enqueue_data(id(3), 20, SimTime::from_secs(60));

        let events = node.handle_wakeup(SimTime::from_secs(60), &IdleMedium, &EmptyRegistry);
        let sent = transmissions(&events);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].packet.via, NodeId::BROADCAST);
        assert_eq!(node.stats().self_next_hop_drops, 1);
        assert_eq!(node.stats().broadcast_data_packets, 1);
    }

    #[test]
    fn test_discovered_dual_hop_sends_on_heard_sf() {
        let config = quiet_config()
            .with_metric(RoutingMetric::TimeOnAirHopCount)
            .with_aodv(true);
        let mut node = node_with(0, config);
        node.start(SimTime::ZERO).unwrap();
        node.enqueue_data(id(2), 20, SimTime::from_secs(60));
        node.handle_wakeup(SimTime::from_secs(60), &IdleMedium, &EmptyRegistry);
        assert!(node.discovery.is_discovering(id(2)));

        let mut rrep = MeshPacket::rrep(id(2), id(0), 1, id(0), 8, 4).relayed_by(id(1));
        rrep.spreading_factor = 10;
        node.handle_packet(rrep, -90.0, SimTime::from_secs(61));

        let mut data = None;
        let mut now = SimTime::from_secs(62);
        while data.is_none() && now < SimTime::from_secs(70) {
            let events = node.handle_wakeup(now, &IdleMedium, &EmptyRegistry);
            data = transmissions(&events)
                .into_iter()
                .find(|t| t.packet.kind() == MessageKind::Data)
                .map(|t| t.packet.clone());
            now += Duration::from_secs(1);
        }
        let data = data.expect("buffered data released");
        assert_eq!(data.via, id(1));
        assert_eq!(data.spreading_factor, 10);
    }

    #[test]
    fn test_convergence_freezes_table() {
        let coordinator = Arc::new(ConvergenceCoordinator::new());
        let config = quiet_config().with_convergence(2, true, 0.0);
        let mut node = MeshNode::new(id(0), &config, 3, coordinator.clone(), 1).unwrap();
        assert_eq!(coordinator.query_global_state().expected, 1);

        let beacon = MeshPacket::routing(id(1), 1, 255, vec![RouteAdvert::single(id(2), 1)]);
        let events = node.handle_packet(beacon, -60.0, SimTime::from_secs(20));
        assert!(events.contains(&NodeEvent::Converged {
            at: SimTime::from_secs(20),
            global: true
        }));
        assert!(node.routes().is_frozen());
        assert!(coordinator.all_converged());
        assert_eq!(node.stats().converged_at, Some(SimTime::from_secs(20)));
    }

    #[test]
    fn test_duty_cycle_off_period_defers() {
        let config = MeshConfig::default()
            .with_selected_pair(Some(99), None)
            .with_metric(RoutingMetric::NoForwarding)
            .with_duty_cycle(Some(0.01))
            .with_data_interval(InterArrival::uniform(0.0, 0.0));
        let mut node = node_with(0, config);
        node.start(SimTime::ZERO).unwrap();
        node.enqueue_data(id(1), 20, SimTime::from_secs(60));
        node.enqueue_data(id(2), 20, SimTime::from_secs(60));

        let first = node.handle_wakeup(SimTime::from_secs(60), &IdleMedium, &EmptyRegistry);
        let airtime = transmissions(&first)[0].airtime;
        let next = node.next_wakeup().unwrap();
        assert!(next >= SimTime::from_secs(60) + airtime * 100);

        // an early wake-up inside the off period sends nothing
        let early = node.handle_wakeup(SimTime::from_secs(61), &IdleMedium, &EmptyRegistry);
        assert!(transmissions(&early).is_empty());
        assert_eq!(node.next_wakeup(), Some(next));
    }
}
