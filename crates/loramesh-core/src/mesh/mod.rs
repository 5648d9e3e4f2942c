//! LoRa Mesh Routing Engine
//!
//! Per-node protocol state machine for duty-cycle-limited LoRa meshes:
//! proactive route advertisement under interchangeable metrics, on-demand
//! AODV-style discovery, relay with loop and duplicate suppression, and
//! acknowledged delivery with round-trip tracking.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                 Driver (MeshSimulator, tests, HW bridge)                │
//! │        frames + RSSI ──►                    ◄── Transmission events     │
//! └─────────────────────────────────────────────────────────────────────────┘
//!                                  │
//!                                  ▼
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                              MeshNode                                   │
//! │  ┌──────────────────┐  ┌──────────────────┐  ┌──────────────────────┐   │
//! │  │ ForwardingEngine │  │ DiscoveryEngine  │  │ PendingAckTracker    │   │
//! │  │ classify / admit │  │ RREQ / RREP      │  │ RTT, retries         │   │
//! │  └────────┬─────────┘  └────────┬─────────┘  └──────────────────────┘   │
//! │           │                     │                                       │
//! │           ▼                     ▼                                       │
//! │  ┌──────────────────────────────────────┐  ┌──────────────────────┐     │
//! │  │ RouteTable (single / dual metric)    │  │ TransmitScheduler    │     │
//! │  │ upsert, sanitize, export, freeze     │  │ priorities, duty     │     │
//! │  └──────────────────────────────────────┘  └──────────────────────┘     │
//! └─────────────────────────────────────────────────────────────────────────┘
//!                                  │
//!                                  ▼
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │     Collaborators: MediumState, NodeRegistry, ConvergenceCoordinator    │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```rust,ignore
//! use loramesh_core::mesh::{MeshConfig, MeshSimulator, RoutingMetric, SimConfig, Topology};
//!
//! let config = MeshConfig::default()
//!     .with_metric(RoutingMetric::HopCount)
//!     .with_request_ack(true);
//! let mut sim = MeshSimulator::new(Topology::grid(4, 4), &config, SimConfig::default())?;
//! let report = sim.run()?;
//! println!("delivery ratio {:.2}", report.delivery_ratio);
//! ```

pub mod ack;
pub mod airtime;
pub mod config;
pub mod coordinator;
pub mod dedup;
pub mod discovery;
pub mod error;
pub mod forwarding;
pub mod node;
pub mod packet;
pub mod routing;
pub mod scheduler;
pub mod simulation;
pub mod stats;
pub mod time;
pub mod topology;
pub mod traffic;
pub mod traits;

// Re-export main types
pub use ack::{AckKey, PendingAckTracker};
pub use airtime::{time_on_air, RadioSettings};
pub use config::{InterArrival, MeshConfig, RoutingMetric};
pub use coordinator::{ConvergenceCoordinator, GlobalConvergence};
pub use dedup::DuplicateCache;
pub use discovery::{DiscoveryEngine, DiscoveryStats};
pub use error::{MeshError, MeshResult};
pub use forwarding::{Admission, ForwardingEngine, Inbound};
pub use node::{MeshNode, NodeEvent, Transmission};
pub use packet::{MeshPacket, MessageKind, NodeId, PacketBody, PacketIdentity, RouteAdvert};
pub use routing::{DualRoute, LinkObservation, NextHop, Route, RoutePolicy, RouteTable};
pub use scheduler::{TrafficClass, TransmitScheduler};
pub use simulation::{MeshSimulator, NodeReport, SimConfig, SimReport};
pub use stats::NodeStats;
pub use time::SimTime;
pub use topology::Topology;
pub use traits::{MediumState, NodeActivity, NodeRegistry};
