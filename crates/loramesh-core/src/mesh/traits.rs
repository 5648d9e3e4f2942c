//! Collaborator traits
//!
//! The engine does not model the radio channel or keep a view of other
//! nodes. Whatever drives it (the bundled simulator, a test, or a hardware
//! bridge) supplies these two collaborators on every scheduler wake-up.

use super::packet::NodeId;
use super::time::SimTime;
use serde::Serialize;

/// Link-layer busy/idle state
pub trait MediumState {
    /// Whether `node`'s radio may start a transmission at `now`
    fn is_idle(&self, node: NodeId, now: SimTime) -> bool;
}

/// Per-node activity timestamps
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct NodeActivity {
    /// Last transmission of any kind
    pub last_transmission: Option<SimTime>,
    /// Last reception of any kind
    pub last_reception: Option<SimTime>,
    /// Last own data packet transmitted
    pub last_data_transmission: Option<SimTime>,
    /// Last non-routing frame heard: delivered here, relayed, overheard, or
    /// one of our own echoed back
    pub last_data_reception: Option<SimTime>,
}

/// Read access to sibling nodes' activity, used only to decide when
/// beaconing can stop in non-continuous mode
pub trait NodeRegistry {
    /// Every node participating in the run
    fn nodes(&self) -> Vec<NodeId>;

    /// Activity of one node, `None` if unknown
    fn activity(&self, node: NodeId) -> Option<NodeActivity>;
}

/// Medium that is always idle
#[derive(Debug, Clone, Copy, Default)]
pub struct IdleMedium;

impl MediumState for IdleMedium {
    fn is_idle(&self, _node: NodeId, _now: SimTime) -> bool {
        true
    }
}

/// Registry with no nodes, for single-node use
#[derive(Debug, Clone, Copy, Default)]
pub struct EmptyRegistry;

impl NodeRegistry for EmptyRegistry {
    fn nodes(&self) -> Vec<NodeId> {
        Vec::new()
    }

    fn activity(&self, _node: NodeId) -> Option<NodeActivity> {
        None
    }
}
