//! # LoRa Mesh Core
//!
//! Multihop routing and reliable-delivery engine for LoRa mesh networks,
//! plus a discrete-event harness to run it.
//!
//! ## Overview
//!
//! Each node independently decides whether to originate, forward or
//! discard a packet. The engine covers:
//!
//! - **Routing**: periodic beacons with hop-count, RSSI, ETX and
//!   time-on-air metrics, or on-demand RREQ/RREP discovery
//! - **Forwarding**: TTL, duplicate suppression, bounded relay queue
//! - **Scheduling**: one transmission per wake-up under a duty-cycle budget
//! - **Reliability**: end-to-end ACKs with RTT tracking and retries
//!
//! Everything runs on a logical clock ([`mesh::SimTime`]) supplied by the
//! caller, so runs are reproducible.
//!
//! ## Example
//!
//! ```rust,no_run
//! use loramesh_core::mesh::{MeshConfig, MeshSimulator, SimConfig, Topology};
//!
//! let mut sim = MeshSimulator::new(Topology::chain(5), &MeshConfig::default(), SimConfig::default())
//!     .expect("valid configuration");
//! let report = sim.run().expect("nodes start");
//! println!("{}", report);
//! ```

pub mod mesh;

pub use mesh::{MeshConfig, MeshError, MeshNode, MeshResult, MeshSimulator, NodeId, SimTime};
