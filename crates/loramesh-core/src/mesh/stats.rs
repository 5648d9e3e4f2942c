//! Per-node counters
//!
//! Every routine protocol outcome (drops, duplicates, fallbacks to
//! flooding) is counted here rather than reported as an error.

use super::discovery::DiscoveryStats;
use super::time::SimTime;
use serde::Serialize;
use std::time::Duration;

/// Node statistics
#[derive(Debug, Clone, Default, Serialize)]
pub struct NodeStats {
    /// Own data packets generated
    pub data_generated: u64,
    /// Own data transmissions (retries included)
    pub data_sent: u64,
    /// Own data retransmissions after an ACK timeout
    pub data_retransmissions: u64,
    /// Own data flooded for lack of a route
    pub broadcast_data_packets: u64,
    /// Own data parked waiting for route discovery
    pub data_buffered_for_discovery: u64,
    /// Packets transmitted as a relay
    pub forwarded_packets: u64,
    /// Relayed packets flooded for lack of a route
    pub broadcast_forwarded_packets: u64,
    /// Queued relays skipped because they were already forwarded
    pub forwarded_history_skips: u64,
    /// Routing beacons transmitted
    pub routing_packets_sent: u64,
    /// RREQs transmitted (originated or relayed)
    pub rreq_sent: u64,
    /// RREPs transmitted (originated or relayed)
    pub rrep_sent: u64,
    /// ACKs transmitted
    pub acks_sent: u64,
    /// ACKs that matched a pending packet
    pub acks_received: u64,
    /// ACKs with no pending packet
    pub acks_unmatched: u64,
    /// Packets abandoned after the last send attempt
    pub ack_failures: u64,
    /// Frames received of any kind
    pub received_packets: u64,
    /// Routing beacons received
    pub routing_packets_received: u64,
    /// Own transmissions heard back
    pub received_from_me: u64,
    /// Data packets delivered here (duplicates included)
    pub delivered_packets: u64,
    /// Distinct data packets delivered here
    pub delivered_unique: u64,
    /// Data bytes delivered here (distinct packets only)
    pub delivered_bytes: u64,
    /// Unicast frames addressed to another next hop
    pub unicast_wrong_next_hop_drops: u64,
    /// Relay candidates with no hop budget left
    pub ttl_expired_drops: u64,
    /// Relay candidates dropped by the `NoForwarding` metric
    pub forwarding_disabled_drops: u64,
    /// Relay candidates already forwarded or queued
    pub duplicate_drops: u64,
    /// Relay candidates dropped on a full forward queue
    pub buffer_full_drops: u64,
    /// RREPs overheard for other nodes
    pub unrelated_rrep_drops: u64,
    /// Lookups whose next hop came back as this node
    pub self_next_hop_drops: u64,
    /// Route discovery counters
    pub discovery: DiscoveryStats,
    /// Routes purged on expiry
    pub deleted_routes: u64,
    /// Longest forward queue observed
    pub max_forward_queue: usize,
    /// Total airtime transmitted (seconds)
    pub airtime_secs: f64,
    /// Sum of ACK round-trip times (seconds)
    pub rtt_sum_secs: f64,
    /// Sum of end-to-end latencies of distinct deliveries (seconds)
    pub latency_sum_secs: f64,
    /// First time the table reached the convergence threshold
    pub converged_at: Option<SimTime>,
    /// When periodic beacons stopped
    pub routing_stopped_at: Option<SimTime>,
}

impl NodeStats {
    pub fn record_rtt(&mut self, rtt: Duration) {
        self.acks_received += 1;
        self.rtt_sum_secs += rtt.as_secs_f64();
    }

    pub fn record_latency(&mut self, latency: Duration) {
        self.latency_sum_secs += latency.as_secs_f64();
    }

    pub fn record_airtime(&mut self, airtime: Duration) {
        self.airtime_secs += airtime.as_secs_f64();
    }

    /// Mean ACK round-trip time
    pub fn mean_rtt(&self) -> Option<Duration> {
        mean(self.rtt_sum_secs, self.acks_received)
    }

    /// Mean latency of distinct deliveries
    pub fn mean_latency(&self) -> Option<Duration> {
        mean(self.latency_sum_secs, self.delivered_unique)
    }

    /// All transmissions of any kind
    pub fn total_sent(&self) -> u64 {
        self.data_sent
            + self.forwarded_packets
            + self.routing_packets_sent
            + self.rreq_sent
            + self.rrep_sent
            + self.acks_sent
    }
}

fn mean(sum_secs: f64, count: u64) -> Option<Duration> {
    if count == 0 {
        return None;
    }
    Duration::try_from_secs_f64(sum_secs / count as f64).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_means() {
        let mut stats = NodeStats::default();
        assert_eq!(stats.mean_rtt(), None);

        stats.record_rtt(Duration::from_secs(2));
        stats.record_rtt(Duration::from_secs(4));
        assert_eq!(stats.acks_received, 2);
        assert_eq!(stats.mean_rtt(), Some(Duration::from_secs(3)));

        stats.delivered_unique = 1;
        stats.record_latency(Duration::from_millis(500));
        assert_eq!(stats.mean_latency(), Some(Duration::from_millis(500)));
    }
}
