//! Own-traffic generation
//!
//! A batch is `packets_per_destination` rounds over a set of distinct
//! random destinations. Every packet of one round shares the round's
//! sequence number, so sequence numbers stay contiguous per source.

use super::config::MeshConfig;
use super::packet::{MeshPacket, NodeId};
use rand::seq::SliceRandom;
use rand::Rng;

/// Whether `me` originates traffic at all
pub fn is_sender(me: NodeId, config: &MeshConfig) -> bool {
    match config.selected_tx {
        Some(tx) => me.as_u32() == tx,
        None => !config.only_node0_sends || me.as_u32() == 0,
    }
}

/// Pick the destinations for one batch
pub fn pick_destinations<R: Rng + ?Sized>(
    me: NodeId,
    network_size: usize,
    config: &MeshConfig,
    rng: &mut R,
) -> Vec<NodeId> {
    if let Some(rx) = config.selected_rx {
        let rx = NodeId::new(rx);
        return if rx == me { Vec::new() } else { vec![rx] };
    }

    let mut others: Vec<NodeId> = (0..network_size as u32)
        .map(NodeId::new)
        .filter(|&n| n != me)
        .collect();
    let wanted = match config.number_of_destinations {
        0 => others.len(),
        n => n.min(others.len()),
    };
    others.shuffle(rng);
    others.truncate(wanted);
    others
}

/// Generate one batch for `me`. `next_seq` is advanced once per round.
pub fn generate_batch<R: Rng + ?Sized>(
    me: NodeId,
    network_size: usize,
    config: &MeshConfig,
    next_seq: &mut u32,
    rng: &mut R,
) -> Vec<MeshPacket> {
    if !is_sender(me, config) {
        return Vec::new();
    }
    let destinations = pick_destinations(me, network_size, config, rng);
    if destinations.is_empty() {
        return Vec::new();
    }

    let mut batch = Vec::with_capacity(destinations.len() * config.packets_per_destination as usize);
    for _ in 0..config.packets_per_destination {
        let seq = *next_seq;
        *next_seq = next_seq.wrapping_add(1);
        for &destination in &destinations {
            batch.push(
                MeshPacket::data(me, destination, seq, config.data_packet_size, config.packet_ttl)
                    .with_ack_requested(config.request_ack),
            );
        }
    }
    batch
}
