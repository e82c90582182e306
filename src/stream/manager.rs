//! The path set of one connection.
//!
//! Paths live in an arena keyed by [`PathId`]; the connection refers to them
//! only by id. The manager keeps the active subset chosen by [`PathPolicy`],
//! spreads outbound units over it, and runs the liveness probes that feed each
//! [`PathState`].

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tracing::{debug, info, trace};

use super::config::{SelectionStrategy, StreamConfig};
use crate::core::{IsdAs, MAX_TRACKED_PATHS};
use crate::extensions::PathProbe;
use crate::path::{
    Liveness, Path, PathCandidate, PathConstraints, PathId, PathPolicy, PathState,
    PathStateConfig, PathStateSnapshot, Transition,
};

/// A probe waiting for its reply.
#[derive(Debug, Clone, Copy)]
struct OutstandingProbe {
    id: u32,
    sent_at: Instant,
    deadline: Instant,
}

#[derive(Debug)]
struct TrackedPath {
    /// Outbound direction.
    path: Path,
    state: PathState,
    learned: bool,
    probe: Option<OutstandingProbe>,
    next_probe: Option<Instant>,
}

/// Per-path statistics.
#[derive(Debug, Clone, PartialEq)]
pub struct PathStats {
    /// Liveness, RTT and counters.
    pub state: PathStateSnapshot,
    /// (AS, interface) pairs crossed.
    pub interfaces: Vec<(IsdAs, u16)>,
    /// Path MTU.
    pub mtu: u16,
    /// Learned from inbound traffic rather than from the lookup.
    pub learned: bool,
    /// Currently in the active set.
    pub active: bool,
}

/// Owns the path set of a connection.
#[derive(Debug)]
pub struct ConnectionManager {
    paths: HashMap<PathId, TrackedPath>,
    policy: PathPolicy,
    strategy: SelectionStrategy,
    state_config: PathStateConfig,
    probe_interval: Duration,
    probing: bool,
    next_probe_id: u32,
    active: Vec<PathId>,
    cursor: usize,
    min_active_paths: usize,
    refresh_interval: Duration,
    next_refresh: Instant,
    refresh_allowed: Instant,
    refresh_forced: bool,
}

impl ConnectionManager {
    /// Empty path set.
    pub fn new(config: &StreamConfig, now: Instant) -> Self {
        Self {
            paths: HashMap::new(),
            policy: PathPolicy::new(config.constraints.clone()),
            strategy: config.strategy,
            state_config: config.path_state_config(),
            probe_interval: config.probe_interval,
            probing: false,
            next_probe_id: 1,
            active: Vec::new(),
            cursor: 0,
            min_active_paths: config.min_active_paths,
            refresh_interval: config.path_refresh_interval,
            next_refresh: now + config.path_refresh_interval,
            refresh_allowed: now,
            refresh_forced: false,
        }
    }

    /// Add candidates from the lookup. Known paths keep their state; new ones
    /// start UNCONFIRMED. Returns how many were added.
    pub fn add_candidates(&mut self, paths: Vec<Path>, now: Instant) -> usize {
        let mut added = 0;
        for path in paths {
            if self.insert(path, false, now) {
                added += 1;
            }
        }
        if added > 0 {
            self.reselect();
        }
        added
    }

    /// Track the reverse of a path inbound traffic arrived on.
    pub fn learn(&mut self, inbound: &Path, now: Instant) -> bool {
        let added = self.insert(inbound.reverse(), true, now);
        if added {
            debug!(path = %inbound.id(), "learned reply path");
            self.reselect();
        }
        added
    }

    fn insert(&mut self, path: Path, learned: bool, now: Instant) -> bool {
        let id = path.id();
        if self.paths.contains_key(&id) || self.paths.len() >= MAX_TRACKED_PATHS {
            return false;
        }
        let next_probe = self.probing.then_some(now);
        self.paths.insert(
            id,
            TrackedPath {
                path,
                state: PathState::new(id, self.state_config),
                learned,
                probe: None,
                next_probe,
            },
        );
        true
    }

    /// Whether `id` is tracked.
    pub fn contains(&self, id: PathId) -> bool {
        self.paths.contains_key(&id)
    }

    /// A tracked path, outbound direction.
    pub fn path(&self, id: PathId) -> Option<&Path> {
        self.paths.get(&id).map(|t| &t.path)
    }

    /// Liveness of a tracked path.
    pub fn liveness(&self, id: PathId) -> Option<Liveness> {
        self.paths.get(&id).map(|t| t.state.liveness())
    }

    /// Current RTO of a tracked path.
    pub fn rto(&self, id: PathId) -> Option<Duration> {
        self.paths.get(&id).map(|t| t.state.rto())
    }

    /// The active subset, best first.
    pub fn active(&self) -> &[PathId] {
        &self.active
    }

    /// Number of tracked paths.
    pub fn len(&self) -> usize {
        self.paths.len()
    }

    /// Whether no path is tracked.
    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }

    /// Whether no admissible path is left at all.
    pub fn is_exhausted(&self) -> bool {
        let constraints = self.policy.constraints();
        !self
            .paths
            .values()
            .any(|t| t.state.liveness() != Liveness::Expired && constraints.admits(&t.path))
    }

    /// Replace the constraints and reselect. A refresh is requested so that
    /// paths excluded so far can be reconsidered.
    pub fn set_constraints(&mut self, constraints: PathConstraints) {
        self.policy.set_constraints(constraints);
        self.refresh_forced = true;
        self.reselect();
    }

    /// Current constraints.
    pub fn constraints(&self) -> &PathConstraints {
        self.policy.constraints()
    }

    /// Recompute the active subset.
    pub fn reselect(&mut self) {
        let candidates: Vec<PathCandidate<'_>> = self
            .paths
            .values()
            .map(|t| PathCandidate {
                path: &t.path,
                state: t.state.snapshot(),
            })
            .collect();
        let active = self.policy.select(&candidates);
        if active != self.active {
            debug!(paths = active.len(), "active path set changed");
            self.active = active;
            self.cursor = 0;
        }
    }

    /// Path for the next outbound unit.
    pub fn next_path(&mut self) -> Option<PathId> {
        if self.active.is_empty() {
            return None;
        }
        match self.strategy {
            SelectionStrategy::PrimaryStandby => Some(self.active[0]),
            SelectionStrategy::RoundRobin => {
                let id = self.active[self.cursor % self.active.len()];
                self.cursor = self.cursor.wrapping_add(1);
                Some(id)
            }
        }
    }

    /// Count a transmission on `id`.
    pub fn on_sent(&mut self, id: PathId, retransmission: bool) {
        if let Some(t) = self.paths.get_mut(&id) {
            t.state.on_sent(retransmission);
        }
    }

    /// Count a received segment on `id`.
    pub fn on_received(&mut self, id: PathId) {
        if let Some(t) = self.paths.get_mut(&id) {
            t.state.on_received();
        }
    }

    /// A unit sent on `id` was acknowledged.
    pub fn on_ack(&mut self, id: PathId, now: Instant, sample: Option<Duration>) -> Option<Transition> {
        let transition = self.paths.get_mut(&id)?.state.on_ack(now, sample);
        self.after(transition)
    }

    /// A retransmission timer on `id` fired.
    pub fn on_miss(&mut self, id: PathId, now: Instant) -> Option<Transition> {
        let transition = self.paths.get_mut(&id)?.state.on_miss(now);
        self.after(transition)
    }

    fn after(&mut self, transition: Option<Transition>) -> Option<Transition> {
        if transition.is_some() {
            self.reselect();
        }
        transition
    }

    /// Begin probing every tracked path.
    pub fn start_probing(&mut self, now: Instant) {
        if self.probing {
            return;
        }
        self.probing = true;
        for t in self.paths.values_mut() {
            t.next_probe = Some(now);
        }
    }

    /// Stop probing and forget outstanding probes.
    pub fn stop_probing(&mut self) {
        self.probing = false;
        for t in self.paths.values_mut() {
            t.probe = None;
            t.next_probe = None;
        }
    }

    /// Next probe that is due, with the path to send it on.
    pub fn poll_probe(&mut self, now: Instant) -> Option<(PathId, PathProbe)> {
        if !self.probing {
            return None;
        }
        let constraints = self.policy.constraints();
        let (id, t) = self.paths.iter_mut().find(|(_, t)| {
            t.probe.is_none()
                && t.next_probe.is_some_and(|at| at <= now)
                && constraints.admits(&t.path)
        })?;

        let probe_id = self.next_probe_id;
        self.next_probe_id = self.next_probe_id.wrapping_add(1);
        t.probe = Some(OutstandingProbe {
            id: probe_id,
            sent_at: now,
            deadline: now + t.state.rto(),
        });
        t.next_probe = Some(now + self.probe_interval);
        trace!(path = %id, probe = probe_id, "probe due");
        Some((*id, PathProbe::request(probe_id)))
    }

    /// A probe reply arrived on `id`.
    pub fn on_probe_reply(&mut self, id: PathId, probe: PathProbe, now: Instant) -> Option<Transition> {
        let t = self.paths.get_mut(&id)?;
        let outstanding = t.probe.filter(|p| p.id == probe.id)?;
        t.probe = None;
        let sample = now.saturating_duration_since(outstanding.sent_at);
        let transition = t.state.on_probe_reply(now, sample);
        self.after(transition)
    }

    /// Count unanswered probes as misses and evict expired paths.
    pub fn poll_timers(&mut self, now: Instant) -> Vec<Transition> {
        let mut transitions = Vec::new();
        for t in self.paths.values_mut() {
            if t.probe.is_some_and(|p| p.deadline <= now) {
                t.probe = None;
                transitions.extend(t.state.on_miss(now));
            }
            transitions.extend(t.state.poll_expiry(now));
        }
        let before = self.paths.len();
        self.paths
            .retain(|_, t| t.state.liveness() != Liveness::Expired);
        if self.paths.len() < before {
            info!(evicted = before - self.paths.len(), "expired paths evicted");
        }
        if !transitions.is_empty() {
            self.reselect();
        }
        transitions
    }

    /// Earliest probe, probe deadline, expiry or refresh instant.
    pub fn next_timeout(&self) -> Option<Instant> {
        let mut next = Some(self.next_refresh.max(self.refresh_allowed));
        for t in self.paths.values() {
            let candidates = [
                t.probe.map(|p| p.deadline),
                if t.probe.is_none() { t.next_probe } else { None },
                t.state.expiry_deadline(),
            ];
            for at in candidates.into_iter().flatten() {
                next = Some(next.map_or(at, |n: Instant| n.min(at)));
            }
        }
        next
    }

    /// Whether the lookup should be asked for paths again.
    pub fn needs_refresh(&self, now: Instant) -> bool {
        if now < self.refresh_allowed {
            return false;
        }
        self.refresh_forced
            || now >= self.next_refresh
            || self.active.len() < self.min_active_paths
    }

    /// Record a lookup. The next one is not sooner than one probe interval.
    pub fn mark_refreshed(&mut self, now: Instant) {
        self.refresh_forced = false;
        self.next_refresh = now + self.refresh_interval;
        self.refresh_allowed = now + self.probe_interval;
    }

    /// Per-path statistics, active paths first.
    pub fn stats(&self) -> Vec<PathStats> {
        let mut stats: Vec<PathStats> = self
            .paths
            .values()
            .map(|t| PathStats {
                state: t.state.snapshot(),
                interfaces: t.path.interfaces(),
                mtu: t.path.mtu(),
                learned: t.learned,
                active: self.active.contains(&t.path.id()),
            })
            .collect();
        stats.sort_by_key(|s| (!s.active, s.state.id));
        stats
    }
}
