//! Route table
//!
//! Routes are learned from routing beacons (proactive metrics) and from
//! discovery packets (on-demand mode), and age out by absolute validity
//! time. Two table shapes exist:
//!
//! - **Single-metric**: one integer cost (hop count, aggregated RSSI or
//!   ETX). At most one entry per `(destination, next_hop)`.
//! - **Dual-metric**: time-on-air primary cost, secondary tie-breaker and
//!   the spreading factor the route was learned on. At most one entry per
//!   `(destination, next_hop, spreading_factor)`.
//!
//! With [`RoutePolicy::BestOnly`] either table keeps at most one entry per
//! destination. Lower cost always wins; equal cost goes to the entry valid
//! for longer.
//!
//! Callers run [`RouteTable::sanitize`] before every lookup or export so
//! expired entries are never returned.

use super::config::{RoutingMetric, MAX_WINDOW_SIZE};
use super::packet::{AdvertisedMetric, NodeId, RouteAdvert};
use super::time::SimTime;
use serde::Serialize;
use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::time::Duration;
use tracing::trace;

/// Replacement policy for [`RouteTable::upsert`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoutePolicy {
    /// Keep only the best route per destination
    BestOnly,
    /// Keep one route per next hop
    KeepAll,
}

/// What an update did to the table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    Replaced,
    Refreshed,
    Discarded,
    /// Table is frozen; nothing changed
    Frozen,
}

/// Link measurements for the packet a route was learned from
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LinkObservation {
    /// Received signal strength (dBm)
    pub rssi: f32,
    /// Sequence number of the beacon (ETX)
    pub beacon_seq: u32,
    /// Spreading factor the packet arrived on
    pub spreading_factor: u8,
}

impl LinkObservation {
    pub fn new(rssi: f32, beacon_seq: u32, spreading_factor: u8) -> Self {
        Self {
            rssi,
            beacon_seq,
            spreading_factor,
        }
    }

    fn rssi_cost(&self) -> u32 {
        self.rssi.abs().round() as u32
    }
}

/// Single-metric route
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Route {
    pub destination: NodeId,
    pub next_hop: NodeId,
    pub metric: u32,
    pub valid_until: SimTime,
    /// Recent beacon sequence numbers from `next_hop`, newest first (ETX)
    #[serde(skip)]
    pub window: [u32; MAX_WINDOW_SIZE],
}

impl Route {
    pub fn new(destination: NodeId, next_hop: NodeId, metric: u32, valid_until: SimTime) -> Self {
        Self {
            destination,
            next_hop,
            metric,
            valid_until,
            window: [0; MAX_WINDOW_SIZE],
        }
    }

    /// Single-hop route to a neighbor
    pub fn direct(neighbor: NodeId, metric: u32, valid_until: SimTime) -> Self {
        Self::new(neighbor, neighbor, metric, valid_until)
    }
}

/// Dual-metric route
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DualRoute {
    pub destination: NodeId,
    pub next_hop: NodeId,
    pub spreading_factor: u8,
    pub primary: u32,
    pub secondary: u32,
    pub valid_until: SimTime,
}

/// Resolved next hop for a destination
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NextHop {
    pub node: NodeId,
    /// Spreading factor to use (dual-metric only)
    pub spreading_factor: Option<u8>,
}

/// Common view over both route shapes
trait RouteEntry {
    fn destination(&self) -> NodeId;
    fn valid_until(&self) -> SimTime;
    fn set_valid_until(&mut self, t: SimTime);
    /// Cost key, lower is better
    fn cost(&self) -> (u32, u32);
    /// Whether `other` occupies the same keep-all slot
    fn same_slot(&self, other: &Self) -> bool;

    /// Ordering used by lookup and best-only replacement
    fn better_than(&self, other: &Self) -> bool {
        match self.cost().cmp(&other.cost()) {
            Ordering::Less => true,
            Ordering::Greater => false,
            Ordering::Equal => self.valid_until() > other.valid_until(),
        }
    }
}

impl RouteEntry for Route {
    fn destination(&self) -> NodeId {
        self.destination
    }
    fn valid_until(&self) -> SimTime {
        self.valid_until
    }
    fn set_valid_until(&mut self, t: SimTime) {
        self.valid_until = t;
    }
    fn cost(&self) -> (u32, u32) {
        (self.metric, 0)
    }
    fn same_slot(&self, other: &Self) -> bool {
        self.destination == other.destination && self.next_hop == other.next_hop
    }
}

impl RouteEntry for DualRoute {
    fn destination(&self) -> NodeId {
        self.destination
    }
    fn valid_until(&self) -> SimTime {
        self.valid_until
    }
    fn set_valid_until(&mut self, t: SimTime) {
        self.valid_until = t;
    }
    fn cost(&self) -> (u32, u32) {
        (self.primary, self.secondary)
    }
    fn same_slot(&self, other: &Self) -> bool {
        self.destination == other.destination
            && self.next_hop == other.next_hop
            && self.spreading_factor == other.spreading_factor
    }
}

/// Best entry for `destination`; equal cost and validity go to the later entry
fn best_of<T: RouteEntry>(entries: &[T], destination: NodeId) -> Option<&T> {
    entries
        .iter()
        .filter(|r| r.destination() == destination)
        .fold(None, |best: Option<&T>, r| match best {
            Some(b) if b.better_than(r) => Some(b),
            _ => Some(r),
        })
}

fn upsert_entry<T: RouteEntry>(entries: &mut Vec<T>, candidate: T, policy: RoutePolicy) -> UpsertOutcome {
    match policy {
        RoutePolicy::BestOnly => match best_of(entries, candidate.destination()) {
            None => {
                entries.push(candidate);
                UpsertOutcome::Inserted
            }
            Some(best) if candidate.better_than(best) => {
                let destination = candidate.destination();
                entries.retain(|r| r.destination() != destination);
                entries.push(candidate);
                UpsertOutcome::Replaced
            }
            Some(_) => UpsertOutcome::Discarded,
        },
        RoutePolicy::KeepAll => {
            if let Some(slot) = entries.iter_mut().find(|r| r.same_slot(&candidate)) {
                *slot = candidate;
                UpsertOutcome::Replaced
            } else {
                entries.push(candidate);
                UpsertOutcome::Inserted
            }
        }
    }
}

/// Per-node route table
#[derive(Debug, Clone)]
pub struct RouteTable {
    metric: RoutingMetric,
    policy: RoutePolicy,
    window_size: usize,
    single: Vec<Route>,
    dual: Vec<DualRoute>,
    frozen: bool,
    deleted: u64,
}

impl RouteTable {
    pub fn new(metric: RoutingMetric, policy: RoutePolicy, window_size: usize) -> Self {
        Self {
            metric,
            policy,
            window_size: window_size.clamp(1, MAX_WINDOW_SIZE),
            single: Vec::new(),
            dual: Vec::new(),
            frozen: false,
            deleted: 0,
        }
    }

    pub fn metric(&self) -> RoutingMetric {
        self.metric
    }

    pub fn policy(&self) -> RoutePolicy {
        self.policy
    }

    /// Best single-metric route to `destination`
    pub fn best_route_to(&self, destination: NodeId) -> Option<&Route> {
        best_of(&self.single, destination)
    }

    /// Best dual-metric route to `destination`
    pub fn best_dual_route_to(&self, destination: NodeId) -> Option<&DualRoute> {
        best_of(&self.dual, destination)
    }

    /// Sanitize, then resolve the next hop toward `destination`
    pub fn next_hop_to(&mut self, destination: NodeId, now: SimTime) -> Option<NextHop> {
        self.sanitize(now);
        if self.metric.is_dual() {
            self.best_dual_route_to(destination).map(|r| NextHop {
                node: r.next_hop,
                spreading_factor: Some(r.spreading_factor),
            })
        } else {
            self.best_route_to(destination).map(|r| NextHop {
                node: r.next_hop,
                spreading_factor: None,
            })
        }
    }

    /// Insert a single-metric candidate under `policy`
    pub fn upsert(&mut self, candidate: Route, policy: RoutePolicy) -> UpsertOutcome {
        if self.frozen {
            return UpsertOutcome::Frozen;
        }
        let outcome = upsert_entry(&mut self.single, candidate, policy);
        trace!(?outcome, "single-metric upsert");
        outcome
    }

    /// Insert a dual-metric candidate under `policy`
    pub fn upsert_dual(&mut self, candidate: DualRoute, policy: RoutePolicy) -> UpsertOutcome {
        if self.frozen {
            return UpsertOutcome::Frozen;
        }
        upsert_entry(&mut self.dual, candidate, policy)
    }

    /// Remove every entry whose validity ended before `now`
    pub fn sanitize(&mut self, now: SimTime) -> usize {
        let before = self.single.len() + self.dual.len();
        self.single.retain(|r| r.valid_until >= now);
        self.dual.retain(|r| r.valid_until >= now);
        let removed = before - (self.single.len() + self.dual.len());
        if removed > 0 {
            trace!(removed, %now, "expired routes purged");
        }
        self.deleted += removed as u64;
        removed
    }

    /// Direct route bootstrap from any routing packet heard from `peer`
    pub fn refresh_or_insert_neighbor(
        &mut self,
        peer: NodeId,
        observation: &LinkObservation,
        now: SimTime,
        timeout: Duration,
    ) -> UpsertOutcome {
        if self.frozen {
            return UpsertOutcome::Frozen;
        }
        let valid_until = now + timeout;

        if self.metric.is_dual() {
            let sf = observation.spreading_factor;
            let candidate = DualRoute {
                destination: peer,
                next_hop: peer,
                spreading_factor: sf,
                primary: 1 << sf.saturating_sub(7),
                secondary: self.dual_neighbor_secondary(sf),
                valid_until,
            };
            return self.refresh_or_upsert_dual(candidate);
        }

        let window_size = self.window_size;
        let metric = self.metric;
        if let Some(route) = self
            .single
            .iter_mut()
            .find(|r| r.destination == peer && r.next_hop == peer)
        {
            route.valid_until = valid_until;
            match metric {
                RoutingMetric::RssiSum | RoutingMetric::RssiProduct => {
                    route.metric = observation.rssi_cost();
                }
                RoutingMetric::Etx => {
                    let seq = i64::from(observation.beacon_seq);
                    let losses: i64 = (0..window_size)
                        .map(|i| seq - (i64::from(route.window[i]) + i as i64 + 1))
                        .sum();
                    route.metric = (1 + losses).clamp(1, i64::from(u32::MAX)) as u32;
                    route.window.copy_within(0..window_size - 1, 1);
                    route.window[0] = observation.beacon_seq;
                }
                _ => {}
            }
            return UpsertOutcome::Refreshed;
        }

        let mut candidate = Route::direct(peer, 1, valid_until);
        match metric {
            RoutingMetric::RssiSum | RoutingMetric::RssiProduct => {
                candidate.metric = observation.rssi_cost();
            }
            RoutingMetric::Etx => candidate.window[0] = observation.beacon_seq,
            _ => {}
        }
        self.upsert(candidate, self.policy)
    }

    /// Merge one route entry carried in `via`'s beacon
    pub fn merge_advertised_route(
        &mut self,
        advert: &RouteAdvert,
        via: NodeId,
        observation: &LinkObservation,
        now: SimTime,
        timeout: Duration,
    ) -> UpsertOutcome {
        if self.frozen {
            return UpsertOutcome::Frozen;
        }
        let valid_until = now + timeout;
        let (adv_primary, adv_secondary) = match advert.metric {
            AdvertisedMetric::Single(m) => (m, 0),
            AdvertisedMetric::Dual { primary, secondary } => (primary, secondary),
        };

        if self.metric.is_dual() {
            let sf = observation.spreading_factor;
            let candidate = DualRoute {
                destination: advert.destination,
                next_hop: via,
                spreading_factor: sf,
                primary: adv_primary.saturating_add(1 << sf),
                secondary: adv_secondary.saturating_add(self.dual_hop_secondary(sf)),
                valid_until,
            };
            return self.refresh_or_upsert_dual(candidate);
        }

        let metric = match self.metric {
            RoutingMetric::RssiSum => adv_primary.saturating_add(observation.rssi_cost()),
            RoutingMetric::RssiProduct => adv_primary.saturating_mul(observation.rssi_cost()),
            RoutingMetric::Etx => {
                let link = self
                    .single
                    .iter()
                    .find(|r| r.destination == via && r.next_hop == via)
                    .map_or(1, |r| r.metric);
                link.saturating_add(adv_primary)
            }
            _ => adv_primary.saturating_add(1),
        };

        if let Some(route) = self
            .single
            .iter_mut()
            .find(|r| r.destination == advert.destination && r.next_hop == via)
        {
            route.metric = metric;
            route.valid_until = valid_until;
            return UpsertOutcome::Refreshed;
        }
        self.upsert(Route::new(advert.destination, via, metric, valid_until), self.policy)
    }

    fn refresh_or_upsert_dual(&mut self, candidate: DualRoute) -> UpsertOutcome {
        if let Some(route) = self.dual.iter_mut().find(|r| r.same_slot(&candidate)) {
            route.primary = candidate.primary;
            route.secondary = candidate.secondary;
            route.set_valid_until(candidate.valid_until);
            return UpsertOutcome::Refreshed;
        }
        self.upsert_dual(candidate, self.policy)
    }

    fn dual_neighbor_secondary(&self, sf: u8) -> u32 {
        match self.metric {
            RoutingMetric::TimeOnAirSpreadingFactor => u32::from(sf.saturating_sub(7)),
            _ => 1,
        }
    }

    fn dual_hop_secondary(&self, sf: u8) -> u32 {
        self.dual_neighbor_secondary(sf)
    }

    /// Lowest spreading factor among routes to `destination`, clamped to the
    /// allowed range; `min_sf` without a route
    pub fn spreading_factor_to(&self, destination: NodeId, min_sf: u8, max_sf: u8) -> u8 {
        self.dual
            .iter()
            .filter(|r| r.destination == destination)
            .map(|r| r.spreading_factor)
            .min()
            .map_or(min_sf, |sf| sf.clamp(min_sf, max_sf))
    }

    /// Sanitize, then list what this node advertises in its beacon
    pub fn export(&mut self, now: SimTime) -> Vec<RouteAdvert> {
        self.sanitize(now);
        if self.metric.is_dual() {
            return self
                .dual
                .iter()
                .map(|r| RouteAdvert::dual(r.destination, r.primary, r.secondary))
                .collect();
        }
        self.destinations()
            .into_iter()
            .filter_map(|d| self.best_route_to(d))
            .map(|r| RouteAdvert::single(r.destination, r.metric))
            .collect()
    }

    /// Distinct destinations present in the table
    pub fn destinations(&self) -> BTreeSet<NodeId> {
        self.single
            .iter()
            .map(|r| r.destination)
            .chain(self.dual.iter().map(|r| r.destination))
            .collect()
    }

    pub fn unique_destinations(&self) -> usize {
        self.destinations().len()
    }

    /// Extend every validity to at least `now + horizon` (forever for a zero
    /// horizon) and reject further learning
    pub fn freeze(&mut self, now: SimTime, horizon: Duration) {
        let until = if horizon.is_zero() {
            SimTime::MAX
        } else {
            now + horizon
        };
        for route in &mut self.single {
            route.valid_until = route.valid_until.max(until);
        }
        for route in &mut self.dual {
            route.valid_until = route.valid_until.max(until);
        }
        self.frozen = true;
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    /// Install a discovery-learned route, bypassing the beacon metrics.
    /// `spreading_factor` is the one the RREQ/RREP was heard on.
    pub fn install_discovered(
        &mut self,
        destination: NodeId,
        next_hop: NodeId,
        hops: u32,
        spreading_factor: u8,
        now: SimTime,
        timeout: Duration,
    ) -> UpsertOutcome {
        let valid_until = now + timeout;
        if self.metric.is_dual() {
            let candidate = DualRoute {
                destination,
                next_hop,
                spreading_factor,
                primary: hops,
                secondary: hops,
                valid_until,
            };
            return self.upsert_dual(candidate, self.policy);
        }
        if self.frozen {
            return UpsertOutcome::Frozen;
        }
        if let Some(route) = self
            .single
            .iter_mut()
            .find(|r| r.destination == destination && r.next_hop == next_hop)
        {
            route.metric = hops;
            route.valid_until = valid_until;
            return UpsertOutcome::Refreshed;
        }
        self.upsert(Route::new(destination, next_hop, hops, valid_until), self.policy)
    }

    pub fn routes(&self) -> &[Route] {
        &self.single
    }

    pub fn len(&self) -> usize {
        self.single.len() + self.dual.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Entries removed by `sanitize` so far
    pub fn deleted_routes(&self) -> u64 {
        self.deleted
    }
}
