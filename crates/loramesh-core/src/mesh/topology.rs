//! Static link graph for the simulator
//!
//! Connectivity is symmetric and fixed for a run. Each link carries the
//! RSSI a receiver observes, which feeds the RSSI-based metrics.

use super::error::{MeshError, MeshResult};
use super::packet::NodeId;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::BTreeMap;

/// RSSI used by the regular layouts (dBm)
pub const DEFAULT_LINK_RSSI: f32 = -90.0;

/// Node position in 2D space (meters)
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Position {
    pub x: f64,
    pub y: f64,
}

impl Position {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    /// Distance to another node in meters
    pub fn distance_to(&self, other: &Position) -> f64 {
        let dx = self.x - other.x;
        let dy = self.y - other.y;
        (dx * dx + dy * dy).sqrt()
    }
}

/// Log-distance RSSI at `distance_m` for a 14 dBm transmitter
pub fn rssi_at(distance_m: f64) -> f32 {
    const TX_POWER_DBM: f64 = 14.0;
    const REFERENCE_LOSS_DB: f64 = 40.0; // at 1 m
    const PATH_LOSS_EXPONENT: f64 = 2.8; // suburban
    let d = distance_m.max(1.0);
    (TX_POWER_DBM - REFERENCE_LOSS_DB - 10.0 * PATH_LOSS_EXPONENT * d.log10()) as f32
}

#[derive(Debug, Clone, PartialEq)]
pub struct Topology {
    size: usize,
    /// Stored in both directions
    links: BTreeMap<(NodeId, NodeId), f32>,
}

impl Topology {
    /// `size` nodes, no links
    pub fn new(size: usize) -> Self {
        Self {
            size,
            links: BTreeMap::new(),
        }
    }

    /// Connect `a` and `b` in both directions
    pub fn add_link(&mut self, a: NodeId, b: NodeId, rssi: f32) -> MeshResult<()> {
        for node in [a, b] {
            if node.index() >= self.size {
                return Err(MeshError::UnknownNode(node));
            }
        }
        if a == b {
            return Err(MeshError::InvalidTopology(format!("self link on node {}", a)));
        }
        self.links.insert((a, b), rssi);
        self.links.insert((b, a), rssi);
        Ok(())
    }

    /// Builder form of [`Topology::add_link`]
    pub fn with_link(mut self, a: u32, b: u32, rssi: f32) -> MeshResult<Self> {
        self.add_link(NodeId::new(a), NodeId::new(b), rssi)?;
        Ok(self)
    }

    /// 0 - 1 - 2 - ... - (n-1)
    pub fn chain(size: usize) -> Self {
        let mut topo = Self::new(size);
        for i in 1..size as u32 {
            topo.insert_pair(i - 1, i, DEFAULT_LINK_RSSI);
        }
        topo
    }

    /// `width` x `height` lattice, 4-neighborhood, row-major ids
    pub fn grid(width: usize, height: usize) -> Self {
        let mut topo = Self::new(width * height);
        for row in 0..height {
            for col in 0..width {
                let id = (row * width + col) as u32;
                if col + 1 < width {
                    topo.insert_pair(id, id + 1, DEFAULT_LINK_RSSI);
                }
                if row + 1 < height {
                    topo.insert_pair(id, id + width as u32, DEFAULT_LINK_RSSI);
                }
            }
        }
        topo
    }

    /// Every node hears every other node
    pub fn full(size: usize) -> Self {
        let mut topo = Self::new(size);
        for a in 0..size as u32 {
            for b in (a + 1)..size as u32 {
                topo.insert_pair(a, b, DEFAULT_LINK_RSSI);
            }
        }
        topo
    }

    /// Nodes placed uniformly in a square of side `area_m`; pairs closer
    /// than `range_m` are linked with log-distance RSSI
    pub fn random_geometric(size: usize, area_m: f64, range_m: f64, seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let positions: Vec<Position> = (0..size)
            .map(|_| Position::new(rng.gen_range(0.0..=area_m), rng.gen_range(0.0..=area_m)))
            .collect();

        let mut topo = Self::new(size);
        for (i, a) in positions.iter().enumerate() {
            for (j, b) in positions.iter().enumerate().skip(i + 1) {
                let d = a.distance_to(b);
                if d <= range_m {
                    topo.insert_pair(i as u32, j as u32, rssi_at(d));
                }
            }
        }
        topo
    }

    fn insert_pair(&mut self, a: u32, b: u32, rssi: f32) {
        let (a, b) = (NodeId::new(a), NodeId::new(b));
        self.links.insert((a, b), rssi);
        self.links.insert((b, a), rssi);
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn node_ids(&self) -> impl Iterator<Item = NodeId> {
        (0..self.size as u32).map(NodeId::new)
    }

    /// RSSI on the link `from` -> `to`
    pub fn rssi(&self, from: NodeId, to: NodeId) -> Option<f32> {
        self.links.get(&(from, to)).copied()
    }

    /// Nodes that hear `node`, with the RSSI they observe
    pub fn neighbors(&self, node: NodeId) -> Vec<(NodeId, f32)> {
        self.links
            .range((node, NodeId::new(0))..=(node, NodeId::new(u32::MAX)))
            .map(|(&(_, to), &rssi)| (to, rssi))
            .collect()
    }

    /// Undirected link count
    pub fn link_count(&self) -> usize {
        self.links.len() / 2
    }

    /// Every node reachable from node 0
    pub fn is_connected(&self) -> bool {
        if self.size == 0 {
            return true;
        }
        let mut visited = vec![false; self.size];
        let mut stack = vec![NodeId::new(0)];

        while let Some(node) = stack.pop() {
            if visited[node.index()] {
                continue;
            }
            visited[node.index()] = true;

            for (neighbor, _) in self.neighbors(node) {
                if !visited[neighbor.index()] {
                    stack.push(neighbor);
                }
            }
        }

        visited.iter().all(|&v| v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(n: u32) -> NodeId {
        NodeId::new(n)
    }

    #[test]
    fn test_chain_links() {
        let topo = Topology::chain(4);
        assert_eq!(topo.link_count(), 3);
        assert_eq!(topo.neighbors(id(1)), vec![(id(0), DEFAULT_LINK_RSSI), (id(2), DEFAULT_LINK_RSSI)]);
        assert!(topo.rssi(id(0), id(2)).is_none());
        assert!(topo.is_connected());
    }

    #[test]
    fn test_grid_and_full() {
        let grid = Topology::grid(3, 2);
        assert_eq!(grid.size(), 6);
        assert_eq!(grid.link_count(), 7);
        assert_eq!(grid.neighbors(id(4)).len(), 3);

        let full = Topology::full(5);
        assert_eq!(full.link_count(), 10);
    }

    #[test]
    fn test_explicit_links_validated() {
        let topo = Topology::new(3).with_link(0, 2, -70.0).unwrap();
        assert_eq!(topo.rssi(id(2), id(0)), Some(-70.0));
        assert!(!topo.is_connected());

        assert!(matches!(
            Topology::new(3).with_link(0, 3, -70.0),
            Err(MeshError::UnknownNode(_))
        ));
        assert!(matches!(
            Topology::new(3).with_link(1, 1, -70.0),
            Err(MeshError::InvalidTopology(_))
        ));
    }

    #[test]
    fn test_random_geometric_reproducible() {
        let a = Topology::random_geometric(12, 2000.0, 800.0, 7);
        let b = Topology::random_geometric(12, 2000.0, 800.0, 7);
        assert_eq!(a, b);
        for node in a.node_ids() {
            for (_, rssi) in a.neighbors(node) {
                assert!(rssi <= rssi_at(1.0));
            }
        }
    }

    #[test]
    fn test_rssi_falls_with_distance() {
        assert!(rssi_at(100.0) > rssi_at(1000.0));
        assert!((rssi_at(1.0) - (-26.0)).abs() < 1e-3);
    }
}
