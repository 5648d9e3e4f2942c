//! Engine configuration
//!
//! A [`MeshConfig`] is consumed when a node is built and never mutated
//! afterwards. All fields have defaults, so a JSON file only needs the
//! values it overrides:
//!
//! ```json
//! { "metric": "etx", "duty_cycle": 0.01, "request_ack": true }
//! ```

use super::airtime::RadioSettings;
use super::error::{MeshError, MeshResult};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

/// Size of the ETX sliding window storage
pub const MAX_WINDOW_SIZE: usize = 32;

/// Route cost scheme
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoutingMetric {
    /// Never relay anything
    NoForwarding,
    /// Every packet is flooded
    FloodingBroadcast,
    /// Unicast when a route is known, flood otherwise (forces broadcast relaying)
    SmartBroadcast,
    /// Hop count
    #[default]
    HopCount,
    /// Sum of |RSSI| along the path
    RssiSum,
    /// Product of |RSSI| along the path
    RssiProduct,
    /// Expected transmission count from beacon loss
    Etx,
    /// Time-on-air primary, hop count secondary
    TimeOnAirHopCount,
    /// Time-on-air primary, spreading-factor secondary
    TimeOnAirSpreadingFactor,
}

impl RoutingMetric {
    pub const ALL: [RoutingMetric; 9] = [
        RoutingMetric::NoForwarding,
        RoutingMetric::FloodingBroadcast,
        RoutingMetric::SmartBroadcast,
        RoutingMetric::HopCount,
        RoutingMetric::RssiSum,
        RoutingMetric::RssiProduct,
        RoutingMetric::Etx,
        RoutingMetric::TimeOnAirHopCount,
        RoutingMetric::TimeOnAirSpreadingFactor,
    ];

    /// Uses the dual-metric route table
    pub fn is_dual(&self) -> bool {
        matches!(
            self,
            RoutingMetric::TimeOnAirHopCount | RoutingMetric::TimeOnAirSpreadingFactor
        )
    }

    /// Builds its table from periodic routing beacons
    pub fn uses_beacons(&self) -> bool {
        !matches!(
            self,
            RoutingMetric::NoForwarding
                | RoutingMetric::FloodingBroadcast
                | RoutingMetric::SmartBroadcast
        )
    }

    /// Own data always goes out flooded
    pub fn always_floods(&self) -> bool {
        matches!(self, RoutingMetric::FloodingBroadcast)
    }

    fn as_str(&self) -> &'static str {
        match self {
            RoutingMetric::NoForwarding => "no-forwarding",
            RoutingMetric::FloodingBroadcast => "flooding",
            RoutingMetric::SmartBroadcast => "smart-broadcast",
            RoutingMetric::HopCount => "hop-count",
            RoutingMetric::RssiSum => "rssi-sum",
            RoutingMetric::RssiProduct => "rssi-product",
            RoutingMetric::Etx => "etx",
            RoutingMetric::TimeOnAirHopCount => "toa-hop-count",
            RoutingMetric::TimeOnAirSpreadingFactor => "toa-sf",
        }
    }
}

impl fmt::Display for RoutingMetric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RoutingMetric {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase().replace('_', "-");
        RoutingMetric::ALL
            .iter()
            .copied()
            .find(|m| m.as_str() == wanted)
            .ok_or_else(|| {
                let names: Vec<_> = RoutingMetric::ALL.iter().map(|m| m.as_str()).collect();
                format!("unknown metric '{}' (expected one of {})", s, names.join(", "))
            })
    }
}

/// Inter-arrival time distribution
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "distribution", rename_all = "snake_case")]
pub enum InterArrival {
    Uniform { min_secs: f64, max_secs: f64 },
    Exponential { mean_secs: f64 },
}

impl InterArrival {
    pub fn uniform(min_secs: f64, max_secs: f64) -> Self {
        InterArrival::Uniform { min_secs, max_secs }
    }

    pub fn exponential(mean_secs: f64) -> Self {
        InterArrival::Exponential { mean_secs }
    }

    /// Draw one inter-arrival time
    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> Duration {
        let secs = match *self {
            InterArrival::Uniform { min_secs, max_secs } => {
                if max_secs > min_secs {
                    rng.gen_range(min_secs..max_secs)
                } else {
                    min_secs
                }
            }
            InterArrival::Exponential { mean_secs } => {
                let u: f64 = rng.gen();
                -mean_secs * (1.0 - u).ln()
            }
        };
        Duration::from_secs_f64(secs.max(0.0))
    }

    fn validate(&self, name: &str) -> MeshResult<()> {
        let ok = match *self {
            InterArrival::Uniform { min_secs, max_secs } => {
                min_secs >= 0.0 && max_secs >= min_secs && max_secs.is_finite()
            }
            InterArrival::Exponential { mean_secs } => mean_secs > 0.0 && mean_secs.is_finite(),
        };
        if ok {
            Ok(())
        } else {
            Err(MeshError::InvalidConfig(format!(
                "{} has an invalid distribution: {:?}",
                name, self
            )))
        }
    }
}

/// Per-node engine configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MeshConfig {
    /// Route cost scheme
    pub metric: RoutingMetric,
    /// Relay flooded (via = broadcast) packets
    pub route_discovery: bool,
    /// On-demand RREQ/RREP discovery instead of periodic beacons
    pub use_aodv: bool,
    /// Route validity after the last refresh (seconds)
    pub route_timeout_secs: f64,
    /// Keep only the best route per destination
    pub store_best_routes_only: bool,
    /// Probability of sending a due beacon ahead of due data
    pub routing_priority: f64,
    /// Probability of sending own data ahead of due forward traffic
    pub own_data_priority: f64,
    /// Pace transmissions by the duty-cycle budget
    pub enforce_duty_cycle: bool,
    /// Fraction of time the radio may transmit
    pub duty_cycle: f64,
    /// Hop budget for originated data (0 = derive from network size)
    pub packet_ttl: u8,
    /// Forward queue capacity (0 = unbounded)
    pub forward_buffer_capacity: usize,
    /// Identities remembered after forwarding
    pub forwarded_history_capacity: usize,
    /// Ask destinations to acknowledge originated data
    pub request_ack: bool,
    /// Resend unacknowledged data after this many seconds (None = never)
    pub ack_timeout_secs: Option<f64>,
    /// Total send attempts per acknowledged packet
    pub max_send_attempts: u32,
    /// Hop budget for RREQ/RREP (0 = max(2, packet_ttl))
    pub discovery_ttl: u8,
    /// Re-issue an unanswered RREQ after this many seconds
    pub discovery_retry_secs: f64,
    /// RREQs per destination before buffered data is dropped
    pub max_discovery_attempts: u32,
    /// Distinct destinations that count as converged (0 = disabled)
    pub convergence_threshold: usize,
    /// Freeze the table on convergence
    pub freeze_routing_at_threshold: bool,
    /// Validity extension applied when freezing (seconds)
    pub freeze_validity_horizon_secs: f64,
    /// Stop beacons once every node has converged
    pub stop_routing_when_all_converged: bool,
    /// ETX window length (clamped to 1..=32)
    pub window_size: usize,
    /// Radio parameters for own transmissions
    pub radio: RadioSettings,
    /// Lowest spreading factor usable for dual-metric routing
    pub min_sf: u8,
    /// Highest spreading factor usable for dual-metric routing
    pub max_sf: u8,
    /// Gap between own data packets
    pub data_interval: InterArrival,
    /// Gap between forwarded packets
    pub forward_interval: InterArrival,
    /// Gap between routing beacons
    pub routing_interval: InterArrival,
    /// Earliest first data packet (seconds, floored at 5)
    pub time_to_first_data_secs: f64,
    /// Earliest first beacon (seconds, floored at 5)
    pub time_to_first_routing_secs: f64,
    /// Earliest first forward (seconds, floored at 5)
    pub time_to_first_forward_secs: f64,
    /// Bytes of application payload per data packet
    pub data_packet_size: u16,
    /// Bytes of a routing beacon
    pub routing_packet_max_size: u16,
    /// Bytes of an ACK
    pub ack_packet_size: u16,
    /// Bytes of an RREQ or RREP
    pub control_packet_size: u16,
    /// Packets generated per destination in one batch
    pub packets_per_destination: u32,
    /// Destinations per batch (0 = every other node)
    pub number_of_destinations: usize,
    /// Generate a new batch whenever the send queue drains
    pub send_packets_continuously: bool,
    /// Only node 0 originates traffic
    pub only_node0_sends: bool,
    /// Only this node originates traffic
    pub selected_tx: Option<u32>,
    /// All traffic goes to this node
    pub selected_rx: Option<u32>,
    /// Quiet period after the last data exchange before beacons stop (seconds)
    pub stop_routing_after_data_done_secs: f64,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            metric: RoutingMetric::HopCount,
            route_discovery: false,
            use_aodv: false,
            route_timeout_secs: 100.0,
            store_best_routes_only: true,
            routing_priority: 0.5,
            own_data_priority: 0.5,
            enforce_duty_cycle: true,
            duty_cycle: 0.01, // EU868 sub-band
            packet_ttl: 0,
            forward_buffer_capacity: 0,
            forwarded_history_capacity: 40,
            request_ack: false,
            ack_timeout_secs: None,
            max_send_attempts: 3,
            discovery_ttl: 0,
            discovery_retry_secs: 30.0,
            max_discovery_attempts: 3,
            convergence_threshold: 0,
            freeze_routing_at_threshold: false,
            freeze_validity_horizon_secs: 0.0,
            stop_routing_when_all_converged: true,
            window_size: MAX_WINDOW_SIZE,
            radio: RadioSettings::default(),
            min_sf: 7,
            max_sf: 12,
            data_interval: InterArrival::uniform(10.0, 20.0),
            forward_interval: InterArrival::uniform(0.5, 1.0),
            routing_interval: InterArrival::uniform(30.0, 60.0),
            time_to_first_data_secs: 5.0,
            time_to_first_routing_secs: 5.0,
            time_to_first_forward_secs: 5.0,
            data_packet_size: 20,
            routing_packet_max_size: 255,
            ack_packet_size: 8,
            control_packet_size: 8,
            packets_per_destination: 1,
            number_of_destinations: 1,
            send_packets_continuously: false,
            only_node0_sends: false,
            selected_tx: None,
            selected_rx: None,
            stop_routing_after_data_done_secs: 60.0,
        }
    }
}

impl MeshConfig {
    pub fn with_metric(mut self, metric: RoutingMetric) -> Self {
        self.metric = metric;
        self
    }

    pub fn with_route_discovery(mut self, enabled: bool) -> Self {
        self.route_discovery = enabled;
        self
    }

    /// On-demand discovery; also enables broadcast relaying so RREQs spread
    pub fn with_aodv(mut self, enabled: bool) -> Self {
        self.use_aodv = enabled;
        if enabled {
            self.route_discovery = true;
        }
        self
    }

    /// `None` disables duty-cycle pacing
    pub fn with_duty_cycle(mut self, duty_cycle: Option<f64>) -> Self {
        match duty_cycle {
            Some(d) => {
                self.enforce_duty_cycle = true;
                self.duty_cycle = d;
            }
            None => self.enforce_duty_cycle = false,
        }
        self
    }

    pub fn with_packet_ttl(mut self, ttl: u8) -> Self {
        self.packet_ttl = ttl;
        self
    }

    pub fn with_request_ack(mut self, request: bool) -> Self {
        self.request_ack = request;
        self
    }

    pub fn with_ack_retries(mut self, timeout_secs: f64, max_send_attempts: u32) -> Self {
        self.ack_timeout_secs = Some(timeout_secs);
        self.max_send_attempts = max_send_attempts;
        self
    }

    pub fn with_forward_buffer_capacity(mut self, capacity: usize) -> Self {
        self.forward_buffer_capacity = capacity;
        self
    }

    pub fn with_route_timeout(mut self, secs: f64) -> Self {
        self.route_timeout_secs = secs;
        self
    }

    pub fn with_priorities(mut self, routing: f64, own_data: f64) -> Self {
        self.routing_priority = routing;
        self.own_data_priority = own_data;
        self
    }

    pub fn with_convergence(mut self, threshold: usize, freeze: bool, horizon_secs: f64) -> Self {
        self.convergence_threshold = threshold;
        self.freeze_routing_at_threshold = freeze;
        self.freeze_validity_horizon_secs = horizon_secs;
        self
    }

    pub fn with_traffic(mut self, packets_per_destination: u32, destinations: usize) -> Self {
        self.packets_per_destination = packets_per_destination;
        self.number_of_destinations = destinations;
        self
    }

    pub fn with_data_interval(mut self, interval: InterArrival) -> Self {
        self.data_interval = interval;
        self
    }

    pub fn with_routing_interval(mut self, interval: InterArrival) -> Self {
        self.routing_interval = interval;
        self
    }

    pub fn with_selected_pair(mut self, tx: Option<u32>, rx: Option<u32>) -> Self {
        self.selected_tx = tx;
        self.selected_rx = rx;
        self
    }

    pub fn route_timeout(&self) -> Duration {
        secs(self.route_timeout_secs)
    }

    pub fn freeze_validity_horizon(&self) -> Duration {
        secs(self.freeze_validity_horizon_secs)
    }

    pub fn discovery_retry(&self) -> Duration {
        secs(self.discovery_retry_secs)
    }

    pub fn stop_routing_after_data_done(&self) -> Duration {
        secs(self.stop_routing_after_data_done_secs)
    }

    pub fn ack_timeout(&self) -> Option<Duration> {
        self.ack_timeout_secs.map(secs)
    }

    /// Broadcast relaying is on (forced by smart broadcast)
    pub fn relays_broadcast(&self) -> bool {
        self.route_discovery || self.metric == RoutingMetric::SmartBroadcast
    }

    /// On-demand discovery runs when a unicast send finds no route
    pub fn discovers_on_demand(&self) -> bool {
        self.use_aodv && self.relays_broadcast()
    }

    /// Periodic routing beacons are sent
    pub fn sends_beacons(&self) -> bool {
        !self.use_aodv && self.metric.uses_beacons()
    }

    /// Copy with derived values filled in for a network of `network_size` nodes
    pub fn resolved(&self, network_size: usize) -> MeshConfig {
        let mut config = self.clone();
        if config.metric == RoutingMetric::SmartBroadcast {
            config.route_discovery = true;
        }
        if config.packet_ttl == 0 {
            let n = network_size.max(2) as f64;
            let ttl = if config.metric.uses_beacons() {
                n - 1.0
            } else {
                2.0 * n.sqrt()
            };
            config.packet_ttl = ttl.clamp(1.0, f64::from(u8::MAX)) as u8;
        }
        if config.discovery_ttl == 0 {
            config.discovery_ttl = config.packet_ttl.max(2);
        }
        config.window_size = config.window_size.clamp(1, MAX_WINDOW_SIZE);
        config
    }

    /// Reject out-of-range values
    pub fn validate(&self) -> MeshResult<()> {
        fn check(ok: bool, msg: &str) -> MeshResult<()> {
            if ok {
                Ok(())
            } else {
                Err(MeshError::InvalidConfig(msg.to_string()))
            }
        }

        check(
            (0.0..=1.0).contains(&self.routing_priority),
            "routing_priority must be within [0, 1]",
        )?;
        check(
            (0.0..=1.0).contains(&self.own_data_priority),
            "own_data_priority must be within [0, 1]",
        )?;
        check(
            !self.enforce_duty_cycle || (self.duty_cycle > 0.0 && self.duty_cycle <= 1.0),
            "duty_cycle must be within (0, 1]",
        )?;
        check(
            self.route_timeout_secs > 0.0 && self.route_timeout_secs.is_finite(),
            "route_timeout_secs must be positive",
        )?;
        check(
            (7..=12).contains(&self.min_sf)
                && (7..=12).contains(&self.max_sf)
                && self.min_sf <= self.max_sf,
            "spreading factors must satisfy 7 <= min_sf <= max_sf <= 12",
        )?;
        check(
            (7..=12).contains(&self.radio.spreading_factor),
            "radio.spreading_factor must be within 7..=12",
        )?;
        check(self.radio.bandwidth_hz > 0, "radio.bandwidth_hz must be positive")?;
        check(
            (1..=4).contains(&self.radio.coding_rate),
            "radio.coding_rate must be within 1..=4",
        )?;
        check(
            self.forwarded_history_capacity > 0,
            "forwarded_history_capacity must be positive",
        )?;
        check(
            self.ack_timeout_secs.map_or(true, |t| t > 0.0),
            "ack_timeout_secs must be positive",
        )?;
        check(self.max_send_attempts > 0, "max_send_attempts must be positive")?;
        check(
            self.max_discovery_attempts > 0 && self.discovery_retry_secs > 0.0,
            "discovery retries need a positive interval and attempt count",
        )?;
        check(
            self.freeze_validity_horizon_secs >= 0.0,
            "freeze_validity_horizon_secs must not be negative",
        )?;
        self.data_interval.validate("data_interval")?;
        self.forward_interval.validate("forward_interval")?;
        self.routing_interval.validate("routing_interval")?;
        Ok(())
    }

    pub fn from_json_str(json: &str) -> MeshResult<Self> {
        let config: MeshConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> MeshResult<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    pub fn to_json(&self) -> MeshResult<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

fn secs(value: f64) -> Duration {
    Duration::try_from_secs_f64(value.max(0.0)).unwrap_or(Duration::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_default_config_is_valid() {
        assert!(MeshConfig::default().validate().is_ok());
    }

    #[test]
    fn test_invalid_priority_rejected() {
        let config = MeshConfig::default().with_priorities(1.5, 0.5);
        assert!(matches!(
            config.validate(),
            Err(MeshError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config =
            MeshConfig::from_json_str(r#"{ "metric": "etx", "request_ack": true }"#).unwrap();
        assert_eq!(config.metric, RoutingMetric::Etx);
        assert!(config.request_ack);
        assert_eq!(config.forwarded_history_capacity, 40);
    }

    #[test]
    fn test_json_interval_tags() {
        let json = r#"{ "data_interval": { "distribution": "exponential", "mean_secs": 30.0 } }"#;
        let config = MeshConfig::from_json_str(json).unwrap();
        assert_eq!(config.data_interval, InterArrival::exponential(30.0));
    }

    #[test]
    fn test_resolved_ttl() {
        let hop = MeshConfig::default().resolved(10);
        assert_eq!(hop.packet_ttl, 9);
        assert_eq!(hop.discovery_ttl, 9);

        let flood = MeshConfig::default()
            .with_metric(RoutingMetric::FloodingBroadcast)
            .resolved(16);
        assert_eq!(flood.packet_ttl, 8);

        let fixed = MeshConfig::default().with_packet_ttl(3).resolved(50);
        assert_eq!(fixed.packet_ttl, 3);
    }

    #[test]
    fn test_smart_broadcast_forces_relaying() {
        let config = MeshConfig::default()
            .with_metric(RoutingMetric::SmartBroadcast)
            .resolved(4);
        assert!(config.route_discovery);
        assert!(!config.sends_beacons());
    }

    #[test]
    fn test_metric_parse_roundtrip() {
        for metric in RoutingMetric::ALL {
            assert_eq!(metric.to_string().parse::<RoutingMetric>(), Ok(metric));
        }
        assert!("bogus".parse::<RoutingMetric>().is_err());
    }

    #[test]
    fn test_interarrival_sampling_bounds() {
        let mut rng = StdRng::seed_from_u64(7);
        let uniform = InterArrival::uniform(2.0, 4.0);
        for _ in 0..100 {
            let s = uniform.sample(&mut rng).as_secs_f64();
            assert!((2.0..4.0).contains(&s));
        }
        let fixed = InterArrival::uniform(3.0, 3.0);
        assert_eq!(fixed.sample(&mut rng), Duration::from_secs(3));
    }
}
