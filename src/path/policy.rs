//! Declarative path selection.
//!
//! Candidates are filtered by ISD-AS lists, ranked by liveness and latency,
//! and cut to the `k` best. Ties fall back to the path id so that selection is
//! deterministic.

use std::collections::HashSet;
use std::time::Duration;

use super::state::{Liveness, PathStateSnapshot};
use super::{Path, PathId};
use crate::core::{DEFAULT_MAX_PATHS, IsdAs};

/// Score penalty of a path that has never been confirmed.
const UNCONFIRMED_PENALTY_MS: f64 = 1000.0;

/// RTT assumed for a path without samples.
const UNKNOWN_RTT: Duration = Duration::from_millis(1000);

/// What the application asks of its paths.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathConstraints {
    /// How many paths may be used concurrently.
    pub max_paths: usize,
    /// If non-empty, every AS on the path must match an entry. AS `0` entries
    /// admit a whole ISD.
    pub isd_as_whitelist: HashSet<IsdAs>,
    /// No AS on the path may match an entry.
    pub isd_as_blacklist: HashSet<IsdAs>,
    /// Rank by measured RTT instead of hop count.
    pub prefer_lowest_latency: bool,
}

impl Default for PathConstraints {
    fn default() -> Self {
        Self {
            max_paths: DEFAULT_MAX_PATHS,
            isd_as_whitelist: HashSet::new(),
            isd_as_blacklist: HashSet::new(),
            prefer_lowest_latency: true,
        }
    }
}

impl PathConstraints {
    /// Whether the path passes the ISD-AS lists.
    pub fn admits(&self, path: &Path) -> bool {
        let listed = |list: &HashSet<IsdAs>, ia: IsdAs| list.iter().any(|entry| entry.matches(ia));
        path.hops().iter().all(|hop| {
            !listed(&self.isd_as_blacklist, hop.isd_as)
                && (self.isd_as_whitelist.is_empty() || listed(&self.isd_as_whitelist, hop.isd_as))
        })
    }
}

/// A path together with its observed state.
#[derive(Debug, Clone, Copy)]
pub struct PathCandidate<'a> {
    /// The path.
    pub path: &'a Path,
    /// Its current state.
    pub state: PathStateSnapshot,
}

/// Ranks candidate paths according to [`PathConstraints`].
#[derive(Debug, Clone, Default)]
pub struct PathPolicy {
    constraints: PathConstraints,
}

impl PathPolicy {
    /// Create a policy.
    pub fn new(constraints: PathConstraints) -> Self {
        Self { constraints }
    }

    /// Current constraints.
    pub fn constraints(&self) -> &PathConstraints {
        &self.constraints
    }

    /// Replace the constraints; takes effect on the next selection.
    pub fn set_constraints(&mut self, constraints: PathConstraints) {
        self.constraints = constraints;
    }

    /// Up to `max_paths` usable candidates, best first.
    pub fn select(&self, candidates: &[PathCandidate<'_>]) -> Vec<PathId> {
        select(candidates, &self.constraints, self.constraints.max_paths)
    }
}

/// Up to `k` usable candidates that satisfy `constraints`, best first.
///
/// DOWN and EXPIRED paths are never returned. With an empty candidate set the
/// result is empty.
pub fn select(
    candidates: &[PathCandidate<'_>],
    constraints: &PathConstraints,
    k: usize,
) -> Vec<PathId> {
    let mut ranked: Vec<(f64, usize, PathId)> = candidates
        .iter()
        .filter(|c| c.state.liveness.is_usable() && constraints.admits(c.path))
        .map(|c| {
            (
                score(&c.state, constraints.prefer_lowest_latency),
                c.path.hops().len(),
                c.path.id(),
            )
        })
        .collect();

    ranked.sort_by(|a, b| {
        a.0.total_cmp(&b.0)
            .then_with(|| a.1.cmp(&b.1))
            .then_with(|| a.2.cmp(&b.2))
    });
    ranked.into_iter().take(k).map(|(_, _, id)| id).collect()
}

/// Lower is better.
fn score(state: &PathStateSnapshot, prefer_lowest_latency: bool) -> f64 {
    let liveness = match state.liveness {
        Liveness::Up => 0.0,
        _ => UNCONFIRMED_PENALTY_MS,
    };
    if prefer_lowest_latency {
        let rtt = state.srtt.unwrap_or(UNKNOWN_RTT);
        liveness + rtt.as_secs_f64() * 1000.0
    } else {
        liveness
    }
}
