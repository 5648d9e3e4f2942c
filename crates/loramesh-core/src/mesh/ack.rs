//! Pending acknowledgement tracking
//!
//! Every originated data packet that requests an ACK is tracked under its
//! `(source, destination, seq)` key until the matching ACK arrives. The
//! round-trip time is measured from the most recent transmission.
//!
//! Without a retry timeout, an entry that is never acknowledged simply
//! stays in the map. With one, [`PendingAckTracker::sweep`] hands timed-out
//! packets back for retransmission until the attempt budget is spent.

use super::packet::{MeshPacket, NodeId};
use super::time::SimTime;
use serde::Serialize;
use std::collections::BTreeMap;
use std::time::Duration;

/// Correlation key for a data packet and its ACK
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct AckKey {
    pub source: NodeId,
    pub destination: NodeId,
    pub seq: u32,
}

impl AckKey {
    pub fn new(source: NodeId, destination: NodeId, seq: u32) -> Self {
        Self {
            source,
            destination,
            seq,
        }
    }
}

#[derive(Debug, Clone)]
struct PendingEntry {
    first_departure: SimTime,
    /// Last transmission; `None` while a retransmission is queued
    departure: Option<SimTime>,
    attempts: u32,
    packet: Option<MeshPacket>,
}

/// Result of a timeout sweep
#[derive(Debug, Default)]
pub struct AckSweep {
    /// Packets to transmit again
    pub retry: Vec<MeshPacket>,
    /// Keys whose attempt budget is exhausted
    pub abandoned: Vec<AckKey>,
}

#[derive(Debug, Clone, Default)]
pub struct PendingAckTracker {
    pending: BTreeMap<AckKey, PendingEntry>,
}

impl PendingAckTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a transmission of `seq` from `source` to `destination`.
    /// A repeated call for the same key counts as another attempt.
    pub fn track(&mut self, source: NodeId, destination: NodeId, seq: u32, departure: SimTime) {
        self.pending
            .entry(AckKey::new(source, destination, seq))
            .and_modify(|e| {
                e.departure = Some(departure);
                e.attempts += 1;
            })
            .or_insert(PendingEntry {
                first_departure: departure,
                departure: Some(departure),
                attempts: 1,
                packet: None,
            });
    }

    /// Track a packet, keeping a copy for retransmission
    pub fn track_packet(&mut self, packet: &MeshPacket, departure: SimTime) {
        self.track(packet.source, packet.destination, packet.seq, departure);
        let key = AckKey::new(packet.source, packet.destination, packet.seq);
        if let Some(entry) = self.pending.get_mut(&key) {
            entry.packet = Some(packet.clone());
        }
    }

    /// Match an ACK. Returns the round-trip time, or `None` when nothing was
    /// pending (already acknowledged or never tracked).
    pub fn on_ack_received(
        &mut self,
        source: NodeId,
        destination: NodeId,
        seq: u32,
        arrival: SimTime,
    ) -> Option<Duration> {
        let entry = self.pending.remove(&AckKey::new(source, destination, seq))?;
        let sent = entry.departure.unwrap_or(entry.first_departure);
        Some(arrival.saturating_since(sent))
    }

    /// Collect entries whose last transmission is at least `timeout` old.
    /// Entries with attempts left are returned for retransmission; the rest
    /// are removed and reported as abandoned.
    pub fn sweep(&mut self, now: SimTime, timeout: Duration, max_attempts: u32) -> AckSweep {
        let mut sweep = AckSweep::default();
        for (key, entry) in self.pending.iter_mut() {
            let Some(sent) = entry.departure else { continue };
            if sent + timeout > now {
                continue;
            }
            match &entry.packet {
                Some(packet) if entry.attempts < max_attempts => {
                    entry.departure = None;
                    sweep.retry.push(packet.clone());
                }
                _ => sweep.abandoned.push(*key),
            }
        }
        for key in &sweep.abandoned {
            self.pending.remove(key);
        }
        sweep
    }

    /// Earliest time a sweep could find something to do
    pub fn next_deadline(&self, timeout: Duration) -> Option<SimTime> {
        self.pending
            .values()
            .filter_map(|e| e.departure)
            .min()
            .map(|sent| sent + timeout)
    }

    /// Drop the entry for a packet that will not be sent again. Returns the
    /// attempts made, or `None` if nothing was pending.
    pub fn abandon(&mut self, key: AckKey) -> Option<u32> {
        self.pending.remove(&key).map(|e| e.attempts)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(n: u32) -> NodeId {
        NodeId::new(n)
    }

    #[test]
    fn test_round_trip() {
        let mut tracker = PendingAckTracker::new();
        let t0 = SimTime::from_millis(1_000);
        let t1 = SimTime::from_millis(3_500);
        tracker.track(id(1), id(2), 7, t0);

        assert_eq!(
            tracker.on_ack_received(id(1), id(2), 7, t1),
            Some(Duration::from_millis(2_500))
        );
        assert!(tracker.is_empty());
        assert_eq!(tracker.on_ack_received(id(1), id(2), 7, t1), None);
    }

    #[test]
    fn test_unmatched_ack_ignored() {
        let mut tracker = PendingAckTracker::new();
        tracker.track(id(1), id(2), 7, SimTime::ZERO);
        assert_eq!(
            tracker.on_ack_received(id(1), id(2), 8, SimTime::from_secs(1)),
            None
        );
        assert_eq!(tracker.len(), 1);
    }

    #[test]
    fn test_entries_without_retry_stay_pending() {
        let mut tracker = PendingAckTracker::new();
        tracker.track(id(1), id(2), 7, SimTime::ZERO);
        // never acknowledged: the entry stays until an ACK or a sweep
        assert_eq!(tracker.len(), 1);
        assert_eq!(tracker.next_deadline(Duration::from_secs(10)), Some(SimTime::from_secs(10)));
    }

    #[test]
    fn test_sweep_retries_then_abandons() {
        let mut tracker = PendingAckTracker::new();
        let packet = MeshPacket::data(id(1), id(2), 3, 20, 4).with_ack_requested(true);
        let timeout = Duration::from_secs(10);
        tracker.track_packet(&packet, SimTime::ZERO);

        let early = tracker.sweep(SimTime::from_secs(5), timeout, 2);
        assert!(early.retry.is_empty() && early.abandoned.is_empty());
        assert_eq!(tracker.next_deadline(timeout), Some(SimTime::from_secs(10)));

        let first = tracker.sweep(SimTime::from_secs(10), timeout, 2);
        assert_eq!(first.retry, vec![packet.clone()]);
        // queued for resend: not swept again until transmitted
        assert!(tracker.sweep(SimTime::from_secs(30), timeout, 2).retry.is_empty());

        tracker.track_packet(&packet, SimTime::from_secs(31));

        let second = tracker.sweep(SimTime::from_secs(41), timeout, 2);
        assert!(second.retry.is_empty());
        assert_eq!(second.abandoned, vec![AckKey::new(id(1), id(2), 3)]);
        assert!(tracker.is_empty());
    }

    #[test]
    fn test_abandon_queued_retry() {
        let mut tracker = PendingAckTracker::new();
        let packet = MeshPacket::data(id(1), id(2), 3, 20, 4).with_ack_requested(true);
        let timeout = Duration::from_secs(10);
        tracker.track_packet(&packet, SimTime::ZERO);

        // retry handed out but never transmitted: no deadline left to sweep
        assert_eq!(tracker.sweep(SimTime::from_secs(10), timeout, 3).retry.len(), 1);
        assert_eq!(tracker.next_deadline(timeout), None);

        let key = AckKey::new(id(1), id(2), 3);
        assert_eq!(tracker.abandon(key), Some(1));
        assert!(tracker.is_empty());
        assert_eq!(tracker.abandon(key), None);
    }
}
