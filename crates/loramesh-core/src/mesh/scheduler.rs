//! Transmit scheduler
//!
//! Each node has a single pending wake-up. On every wake-up the scheduler
//! picks at most one traffic class to serve, records the airtime spent and
//! computes when the node should wake next.
//!
//! ```text
//!            ┌──────────────┐   busy    ┌─────────────────────┐
//!  wake-up ─►│ medium idle? │──────────►│ re-arm now + 20 µs  │
//!            └──────┬───────┘           └─────────────────────┘
//!                   │ idle
//!                   ▼
//!  routing due ─┬─ and data/forward due ─► Bernoulli(routing_priority)
//!               └─ alone ─────────────────► routing
//!  control outbox non-empty ──────────────► control
//!  own data and forward due ──────────────► Bernoulli(own_data_priority)
//!                   │
//!                   ▼
//!  next class time = now + max(sample, airtime / duty_cycle)
//!  wake-up = min(active class times) ≥ now + airtime, ≥ duty-cycle end
//! ```

use super::config::MeshConfig;
use super::time::{stretch, SimTime};
use rand::Rng;
use serde::Serialize;
use std::fmt;
use std::time::Duration;

/// Added to every computed wake-up so timers fire strictly after the
/// instant they were computed for
pub const REARM_EPSILON: Duration = Duration::from_micros(10);

/// Retry delay while the medium is busy
pub const BUSY_BACKOFF: Duration = Duration::from_micros(20);

/// A non-empty control outbox counts as due this far ahead
pub const CONTROL_LOOKAHEAD: Duration = Duration::from_millis(100);

/// Used when the computed wake-up is not in the future
pub const IDLE_FALLBACK: Duration = Duration::from_secs(1);

/// Delay before sending data released by a completed discovery
pub const RESOLVED_DATA_DELAY: Duration = Duration::from_millis(500);

/// Class of outbound traffic served by one wake-up
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum TrafficClass {
    Routing,
    Control,
    OwnData,
    Forward,
}

impl fmt::Display for TrafficClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TrafficClass::Routing => "routing",
            TrafficClass::Control => "control",
            TrafficClass::OwnData => "own-data",
            TrafficClass::Forward => "forward",
        };
        write!(f, "{}", name)
    }
}

/// What the node has waiting, as seen by the scheduler
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Backlog {
    /// Periodic beacons are still running
    pub routing: bool,
    /// Control outbox non-empty
    pub control: bool,
    /// `to_send` non-empty
    pub own_data: bool,
    /// Forward queue non-empty
    pub forward: bool,
}

/// Classes eligible at a given instant
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Due {
    pub routing: bool,
    pub control: bool,
    pub own_data: bool,
    pub forward: bool,
}

impl Due {
    pub fn any(&self) -> bool {
        self.routing || self.control || self.own_data || self.forward
    }
}

#[derive(Debug, Clone)]
pub struct TransmitScheduler {
    routing_priority: f64,
    own_data_priority: f64,
    /// `None` when duty cycle is not enforced
    duty_cycle: Option<f64>,
    next_data: SimTime,
    next_forward: SimTime,
    next_routing: SimTime,
    duty_cycle_end: SimTime,
    next_wakeup: Option<SimTime>,
    airtime_used: Duration,
}

impl TransmitScheduler {
    pub fn new(config: &MeshConfig) -> Self {
        Self {
            routing_priority: config.routing_priority,
            own_data_priority: config.own_data_priority,
            duty_cycle: config.enforce_duty_cycle.then_some(config.duty_cycle),
            next_data: SimTime::ZERO,
            next_forward: SimTime::ZERO,
            next_routing: SimTime::ZERO,
            duty_cycle_end: SimTime::ZERO,
            next_wakeup: None,
            airtime_used: Duration::ZERO,
        }
    }

    /// Set the first eligible time of each class and arm the earliest
    pub fn start(&mut self, first_data: SimTime, first_routing: SimTime, first_forward: SimTime) {
        self.next_data = first_data;
        self.next_routing = first_routing;
        self.next_forward = first_forward;
        let first = first_data.min(first_routing).min(first_forward);
        self.next_wakeup = Some(first + REARM_EPSILON);
    }

    pub fn due(&self, backlog: Backlog, now: SimTime) -> Due {
        Due {
            routing: backlog.routing && now >= self.next_routing,
            control: backlog.control,
            own_data: backlog.own_data && now >= self.next_data,
            forward: backlog.forward && now >= self.next_forward,
        }
    }

    /// Pick the class to serve. `None` when nothing is due.
    pub fn choose<R: Rng + ?Sized>(&self, due: Due, rng: &mut R) -> Option<TrafficClass> {
        if due.routing {
            if !(due.own_data || due.forward) || rng.gen_bool(self.routing_priority) {
                return Some(TrafficClass::Routing);
            }
        }
        if due.control {
            return Some(TrafficClass::Control);
        }
        match (due.own_data, due.forward) {
            (true, true) => {
                if rng.gen_bool(self.own_data_priority) {
                    Some(TrafficClass::OwnData)
                } else {
                    Some(TrafficClass::Forward)
                }
            }
            (true, false) => Some(TrafficClass::OwnData),
            (false, true) => Some(TrafficClass::Forward),
            (false, false) => None,
        }
    }

    /// Minimum spacing a transmission of `airtime` imposes
    pub fn off_time(&self, airtime: Duration) -> Duration {
        match self.duty_cycle {
            Some(duty) => stretch(airtime, duty),
            None => airtime,
        }
    }

    /// Account for a transmission of `class` starting at `now`. `spacing`
    /// is the class's inter-arrival sample.
    pub fn record_transmission(
        &mut self,
        class: TrafficClass,
        now: SimTime,
        airtime: Duration,
        spacing: Duration,
    ) {
        let off = self.off_time(airtime);
        let next = now.saturating_add(spacing.max(off));
        match class {
            TrafficClass::Routing => self.next_routing = next,
            TrafficClass::OwnData => self.next_data = next,
            TrafficClass::Forward => self.next_forward = next,
            TrafficClass::Control => {}
        }
        self.duty_cycle_end = now.saturating_add(off);
        self.airtime_used += airtime;
    }

    /// Compute and arm the next wake-up. `sent` is the airtime of the
    /// packet sent by this wake-up, if any. `deadlines` are extra
    /// node-level timers (ACK retries, discovery retries).
    pub fn rearm(
        &mut self,
        now: SimTime,
        sent: Option<Duration>,
        backlog: Backlog,
        deadlines: impl IntoIterator<Item = SimTime>,
    ) -> Option<SimTime> {
        let mut candidates: Vec<SimTime> = deadlines.into_iter().collect();
        if backlog.routing {
            candidates.push(self.next_routing);
        }
        if backlog.control {
            candidates.push(now + CONTROL_LOOKAHEAD);
        }
        if backlog.own_data {
            candidates.push(self.next_data);
        }
        if backlog.forward {
            candidates.push(self.next_forward);
        }

        let Some(mut at) = candidates.into_iter().min() else {
            self.next_wakeup = None;
            return None;
        };
        if let Some(airtime) = sent {
            at = at.max(now + airtime);
        }
        at = at.max(self.duty_cycle_end) + REARM_EPSILON;
        if at <= now {
            at = now + IDLE_FALLBACK;
        }
        self.next_wakeup = Some(at);
        Some(at)
    }

    /// Medium busy: retry shortly, nothing else changes
    pub fn backoff(&mut self, now: SimTime) -> SimTime {
        let at = now + BUSY_BACKOFF;
        self.next_wakeup = Some(at);
        at
    }

    /// Earliest instant new work arriving at `now` may go out
    pub fn earliest_send(&self, now: SimTime) -> SimTime {
        (now + REARM_EPSILON).max(self.duty_cycle_end + REARM_EPSILON)
    }

    /// Arm at `at`, or keep the pending wake-up if it is sooner
    pub fn arm_no_later_than(&mut self, at: SimTime) {
        self.next_wakeup = Some(self.next_wakeup.map_or(at, |t| t.min(at)));
    }

    /// Hold own data until `at`
    pub fn defer_data(&mut self, at: SimTime) {
        self.next_data = at;
    }

    /// Consume the pending wake-up
    pub fn take_wakeup(&mut self) -> Option<SimTime> {
        self.next_wakeup.take()
    }

    pub fn next_wakeup(&self) -> Option<SimTime> {
        self.next_wakeup
    }

    /// Radio is in its duty-cycle off period at `now`
    pub fn in_off_period(&self, now: SimTime) -> bool {
        now < self.duty_cycle_end
    }

    pub fn duty_cycle_end(&self) -> SimTime {
        self.duty_cycle_end
    }

    pub fn next_routing(&self) -> SimTime {
        self.next_routing
    }

    pub fn next_data(&self) -> SimTime {
        self.next_data
    }

    pub fn next_forward(&self) -> SimTime {
        self.next_forward
    }

    /// Total airtime transmitted
    pub fn airtime_used(&self) -> Duration {
        self.airtime_used
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn scheduler(config: MeshConfig) -> TransmitScheduler {
        TransmitScheduler::new(&config)
    }

    fn all_due() -> Due {
        Due {
            routing: true,
            control: true,
            own_data: true,
            forward: true,
        }
    }

    #[test]
    fn test_routing_alone_always_served() {
        let sched = scheduler(MeshConfig::default().with_priorities(0.0, 0.5));
        let mut rng = StdRng::seed_from_u64(1);
        let due = Due {
            routing: true,
            control: true,
            ..Due::default()
        };
        assert_eq!(sched.choose(due, &mut rng), Some(TrafficClass::Routing));
    }

    #[test]
    fn test_priorities_are_respected() {
        let mut rng = StdRng::seed_from_u64(7);

        let routing_first = scheduler(MeshConfig::default().with_priorities(1.0, 0.0));
        assert_eq!(routing_first.choose(all_due(), &mut rng), Some(TrafficClass::Routing));

        let control_next = scheduler(MeshConfig::default().with_priorities(0.0, 1.0));
        assert_eq!(control_next.choose(all_due(), &mut rng), Some(TrafficClass::Control));

        let data = Due {
            own_data: true,
            forward: true,
            ..Due::default()
        };
        assert_eq!(control_next.choose(data, &mut rng), Some(TrafficClass::OwnData));
        assert_eq!(routing_first.choose(data, &mut rng), Some(TrafficClass::Forward));
        assert_eq!(routing_first.choose(Due::default(), &mut rng), None);
    }

    #[test]
    fn test_due_requires_backlog_and_time() {
        let mut sched = scheduler(MeshConfig::default());
        sched.start(SimTime::from_secs(5), SimTime::from_secs(8), SimTime::from_secs(5));
        let backlog = Backlog {
            routing: true,
            control: false,
            own_data: true,
            forward: false,
        };

        let early = sched.due(backlog, SimTime::from_secs(6));
        assert!(early.own_data && !early.routing && !early.forward);
        assert!(sched.due(backlog, SimTime::from_secs(8)).routing);
        assert_eq!(sched.next_wakeup(), Some(SimTime::from_secs(5) + REARM_EPSILON));
    }

    #[test]
    fn test_duty_cycle_spacing() {
        let mut sched = scheduler(MeshConfig::default().with_duty_cycle(Some(0.01)));
        let now = SimTime::from_secs(10);
        let airtime = Duration::from_millis(50);

        sched.record_transmission(TrafficClass::OwnData, now, airtime, Duration::from_secs(1));
        // 50 ms at 1% forces 5 s of silence, longer than the 1 s sample
        assert_eq!(sched.next_data(), SimTime::from_secs(15));
        assert_eq!(sched.duty_cycle_end(), SimTime::from_secs(15));
        assert!(sched.in_off_period(SimTime::from_secs(12)));

        let backlog = Backlog {
            control: true,
            ..Backlog::default()
        };
        let at = sched.rearm(now, Some(airtime), backlog, None).unwrap();
        assert_eq!(at, SimTime::from_secs(15) + REARM_EPSILON);
    }

    #[test]
    fn test_without_duty_cycle_uses_sample() {
        let mut sched = scheduler(MeshConfig::default().with_duty_cycle(None));
        let now = SimTime::from_secs(10);
        sched.record_transmission(
            TrafficClass::Forward,
            now,
            Duration::from_millis(50),
            Duration::from_secs(2),
        );
        assert_eq!(sched.next_forward(), SimTime::from_secs(12));
        assert_eq!(sched.duty_cycle_end(), now + Duration::from_millis(50));
    }

    #[test]
    fn test_rearm_nothing_pending() {
        let mut sched = scheduler(MeshConfig::default());
        sched.arm_no_later_than(SimTime::from_secs(3));
        assert_eq!(sched.rearm(SimTime::from_secs(3), None, Backlog::default(), None), None);
        assert_eq!(sched.next_wakeup(), None);
    }

    #[test]
    fn test_rearm_respects_airtime_floor() {
        let mut sched = scheduler(MeshConfig::default().with_duty_cycle(None));
        let now = SimTime::from_secs(1);
        let backlog = Backlog {
            own_data: true,
            ..Backlog::default()
        };
        // next_data is in the past: the airtime floor applies
        let at = sched
            .rearm(now, Some(Duration::from_millis(40)), backlog, None)
            .unwrap();
        assert_eq!(at, now + Duration::from_millis(40) + REARM_EPSILON);
    }

    #[test]
    fn test_extra_deadlines_and_arming() {
        let mut sched = scheduler(MeshConfig::default());
        let now = SimTime::from_secs(1);
        let at = sched
            .rearm(now, None, Backlog::default(), Some(SimTime::from_secs(4)))
            .unwrap();
        assert_eq!(at, SimTime::from_secs(4) + REARM_EPSILON);

        sched.arm_no_later_than(SimTime::from_secs(9));
        assert_eq!(sched.next_wakeup(), Some(at));
        sched.arm_no_later_than(SimTime::from_secs(2));
        assert_eq!(sched.next_wakeup(), Some(SimTime::from_secs(2)));
        assert_eq!(sched.take_wakeup(), Some(SimTime::from_secs(2)));
        assert_eq!(sched.next_wakeup(), None);

        assert_eq!(sched.backoff(now), now + BUSY_BACKOFF);
    }
}
