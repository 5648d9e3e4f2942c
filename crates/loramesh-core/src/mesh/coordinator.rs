//! Network-wide convergence coordination
//!
//! Nodes using a proactive metric report the first moment their route
//! table reaches the convergence threshold. Once every participating node
//! has reported, routing beacons stop across the network.
//!
//! The coordinator is the only state shared between nodes. One instance is
//! created per run and handed to every node as an `Arc` at construction.

use super::packet::NodeId;
use super::time::SimTime;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use tracing::{info, trace};

const UNSET: u64 = u64::MAX;

/// Snapshot returned by [`ConvergenceCoordinator::query_global_state`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct GlobalConvergence {
    /// Nodes expected to converge
    pub expected: usize,
    /// Nodes that have converged
    pub converged: usize,
    /// When the last expected node converged
    pub all_converged_at: Option<SimTime>,
}

impl GlobalConvergence {
    pub fn is_complete(&self) -> bool {
        self.all_converged_at.is_some()
    }
}

#[derive(Debug)]
pub struct ConvergenceCoordinator {
    expected: AtomicUsize,
    converged: AtomicUsize,
    fired: AtomicBool,
    all_converged_at: AtomicU64,
}

impl ConvergenceCoordinator {
    pub fn new() -> Self {
        Self {
            expected: AtomicUsize::new(0),
            converged: AtomicUsize::new(0),
            fired: AtomicBool::new(false),
            all_converged_at: AtomicU64::new(UNSET),
        }
    }

    /// Count a node that will report convergence
    pub fn register_participant(&self, node: NodeId) {
        let expected = self.expected.fetch_add(1, Ordering::SeqCst) + 1;
        trace!(%node, expected, "convergence participant registered");
    }

    /// Report that `node` converged at `now`. Each node reports once.
    /// Returns true when this report completed global convergence.
    pub fn register_convergence(&self, node: NodeId, now: SimTime) -> bool {
        let converged = self.converged.fetch_add(1, Ordering::SeqCst) + 1;
        let expected = self.expected.load(Ordering::SeqCst);
        info!(%node, converged, expected, %now, "node converged");

        if expected == 0 || converged < expected {
            return false;
        }
        if self
            .fired
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return false;
        }
        self.all_converged_at
            .store(now.as_micros(), Ordering::SeqCst);
        info!(%now, nodes = expected, "all nodes converged, stopping routing beacons");
        true
    }

    pub fn query_global_state(&self) -> GlobalConvergence {
        let at = self.all_converged_at.load(Ordering::SeqCst);
        GlobalConvergence {
            expected: self.expected.load(Ordering::SeqCst),
            converged: self.converged.load(Ordering::SeqCst),
            all_converged_at: (at != UNSET).then(|| SimTime::from_micros(at)),
        }
    }

    pub fn all_converged(&self) -> bool {
        self.fired.load(Ordering::SeqCst)
    }
}

impl Default for ConvergenceCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_fires_once_all_report() {
        let coord = Arc::new(ConvergenceCoordinator::new());
        for n in 0..3 {
            coord.register_participant(NodeId::new(n));
        }

        assert!(!coord.register_convergence(NodeId::new(0), SimTime::from_secs(10)));
        assert!(!coord.register_convergence(NodeId::new(2), SimTime::from_secs(12)));
        assert!(!coord.all_converged());
        assert!(coord.register_convergence(NodeId::new(1), SimTime::from_secs(15)));

        let state = coord.query_global_state();
        assert_eq!(state.expected, 3);
        assert_eq!(state.converged, 3);
        assert_eq!(state.all_converged_at, Some(SimTime::from_secs(15)));
        assert!(state.is_complete());
    }

    #[test]
    fn test_no_participants_never_fires() {
        let coord = ConvergenceCoordinator::new();
        assert!(!coord.register_convergence(NodeId::new(0), SimTime::ZERO));
        assert!(!coord.query_global_state().is_complete());
    }
}
