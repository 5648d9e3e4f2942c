//! Forwarded-packet history
//!
//! A relay remembers the identities of the packets it has transmitted as a
//! forwarder and refuses to relay them again. The history is a fixed
//! capacity FIFO: once full, the oldest identity is evicted, so suppression
//! only holds within that window.

use super::packet::PacketIdentity;
use std::collections::{HashMap, VecDeque};

/// Bounded duplicate-suppression cache
#[derive(Debug, Clone)]
pub struct DuplicateCache {
    /// Identities in insertion order
    order: VecDeque<PacketIdentity>,
    /// Occurrence count per identity, for O(1) lookup
    counts: HashMap<PacketIdentity, usize>,
    capacity: usize,
}

impl DuplicateCache {
    /// Create a cache holding at most `capacity` identities
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            order: VecDeque::with_capacity(capacity),
            counts: HashMap::with_capacity(capacity),
            capacity,
        }
    }

    /// Whether `identity` is within the window
    pub fn contains(&self, identity: &PacketIdentity) -> bool {
        self.counts.contains_key(identity)
    }

    /// Record `identity`, evicting the oldest entry when full.
    /// Returns the evicted identity, if any.
    pub fn record(&mut self, identity: PacketIdentity) -> Option<PacketIdentity> {
        self.order.push_back(identity);
        *self.counts.entry(identity).or_insert(0) += 1;

        if self.order.len() <= self.capacity {
            return None;
        }
        let evicted = self.order.pop_front()?;
        if let Some(count) = self.counts.get_mut(&evicted) {
            *count -= 1;
            if *count == 0 {
                self.counts.remove(&evicted);
            }
        }
        Some(evicted)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mesh::packet::{MessageKind, NodeId};

    fn ident(seq: u32) -> PacketIdentity {
        PacketIdentity {
            kind: MessageKind::Data,
            seq,
            source: NodeId::new(1),
            destination: NodeId::new(2),
        }
    }

    #[test]
    fn test_duplicate_detection() {
        let mut cache = DuplicateCache::new(4);
        assert!(!cache.contains(&ident(1)));
        cache.record(ident(1));
        assert!(cache.contains(&ident(1)));
        cache.record(ident(2));
        assert_eq!(cache.len(), 2);
        assert!(!cache.is_empty());
    }

    #[test]
    fn test_fifo_eviction() {
        let mut cache = DuplicateCache::new(3);
        for seq in 1..=3 {
            assert!(cache.record(ident(seq)).is_none());
        }
        assert_eq!(cache.record(ident(4)), Some(ident(1)));
        assert!(!cache.contains(&ident(1)));
        assert!(cache.contains(&ident(2)));
        assert_eq!(cache.len(), 3);
    }

    #[test]
    fn test_kind_is_part_of_identity() {
        let mut cache = DuplicateCache::new(4);
        cache.record(ident(1));
        let ack = PacketIdentity {
            kind: MessageKind::Ack,
            ..ident(1)
        };
        assert!(!cache.contains(&ack));
    }

    #[test]
    fn test_repeated_records_counted() {
        let mut cache = DuplicateCache::new(2);
        cache.record(ident(1));
        cache.record(ident(1));
        cache.record(ident(2));
        // one copy of ident(1) evicted, the other still in the window
        assert!(cache.contains(&ident(1)));
        cache.record(ident(3));
        assert!(!cache.contains(&ident(1)));
    }
}
