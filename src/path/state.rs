//! Per-path liveness and latency.
//!
//! ```text
//!  UNCONFIRMED ──ack/probe reply──▶ UP ◀──probe reply──┐
//!       │                           │                  │
//!       └──────N misses─────────────┴──N misses──▶ DOWN ──expiry window──▶ EXPIRED
//! ```
//!
//! A miss is a probe that went unanswered or a retransmission timeout on the
//! path. EXPIRED is terminal; the owner evicts the path.

use std::time::{Duration, Instant};

use tracing::debug;

use super::PathId;
use super::timing::RttEstimator;
use crate::core::{PATH_EXPIRY_WINDOW, PROBE_MISS_THRESHOLD};

/// Liveness of one path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Liveness {
    /// Known, never confirmed.
    Unconfirmed,
    /// Confirmed working.
    Up,
    /// Stopped answering; may still recover.
    Down,
    /// Down for longer than the expiry window. Terminal.
    Expired,
}

impl Liveness {
    /// Whether the path may carry traffic.
    pub fn is_usable(self) -> bool {
        matches!(self, Self::Unconfirmed | Self::Up)
    }
}

/// A liveness change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    /// Path that changed.
    pub path: PathId,
    /// State before.
    pub from: Liveness,
    /// State after.
    pub to: Liveness,
}

/// Thresholds of the liveness state machine.
#[derive(Debug, Clone, Copy)]
pub struct PathStateConfig {
    /// Consecutive misses that take a path DOWN.
    pub miss_threshold: u32,
    /// Time a path may stay DOWN before it expires.
    pub expiry_window: Duration,
    /// Lower RTO bound.
    pub min_rto: Duration,
    /// Upper RTO bound.
    pub max_rto: Duration,
}

impl Default for PathStateConfig {
    fn default() -> Self {
        Self {
            miss_threshold: PROBE_MISS_THRESHOLD,
            expiry_window: PATH_EXPIRY_WINDOW,
            min_rto: super::timing::MIN_RTO,
            max_rto: super::timing::MAX_RTO,
        }
    }
}

/// Liveness, RTT and counters of one path.
#[derive(Debug, Clone)]
pub struct PathState {
    id: PathId,
    liveness: Liveness,
    rtt: RttEstimator,
    misses: u32,
    down_since: Option<Instant>,
    last_confirmed: Option<Instant>,
    config: PathStateConfig,
    counters: PathCounters,
}

/// Packet counters of one path.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PathCounters {
    /// Segments sent, retransmissions included.
    pub sent: u64,
    /// Segments received.
    pub received: u64,
    /// Data units acknowledged.
    pub acked: u64,
    /// Retransmissions.
    pub retransmitted: u64,
}

impl PathCounters {
    /// Fraction of sent segments that had to be retransmitted.
    pub fn loss_rate(&self) -> f64 {
        if self.sent == 0 {
            0.0
        } else {
            self.retransmitted as f64 / self.sent as f64
        }
    }
}

/// Copy of a path state, readable outside the connection lock.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PathStateSnapshot {
    /// Path id.
    pub id: PathId,
    /// Liveness.
    pub liveness: Liveness,
    /// Smoothed RTT, if sampled.
    pub srtt: Option<Duration>,
    /// Current RTO.
    pub rto: Duration,
    /// Consecutive misses.
    pub misses: u32,
    /// Counters.
    pub counters: PathCounters,
}

impl PathState {
    /// New path, UNCONFIRMED.
    pub fn new(id: PathId, config: PathStateConfig) -> Self {
        Self {
            id,
            liveness: Liveness::Unconfirmed,
            rtt: RttEstimator::with_bounds(config.min_rto, config.max_rto),
            misses: 0,
            down_since: None,
            last_confirmed: None,
            config,
            counters: PathCounters::default(),
        }
    }

    /// Current liveness.
    pub fn liveness(&self) -> Liveness {
        self.liveness
    }

    /// Current RTO, including backoff.
    pub fn rto(&self) -> Duration {
        self.rtt.rto()
    }

    /// Smoothed RTT, if sampled.
    pub fn srtt(&self) -> Option<Duration> {
        self.rtt.srtt()
    }

    /// When the path last answered.
    pub fn last_confirmed(&self) -> Option<Instant> {
        self.last_confirmed
    }

    /// Counters.
    pub fn counters(&self) -> &PathCounters {
        &self.counters
    }

    /// Snapshot of the current state.
    pub fn snapshot(&self) -> PathStateSnapshot {
        PathStateSnapshot {
            id: self.id,
            liveness: self.liveness,
            srtt: self.rtt.srtt(),
            rto: self.rtt.rto(),
            misses: self.misses,
            counters: self.counters,
        }
    }

    /// Count a transmission.
    pub fn on_sent(&mut self, retransmission: bool) {
        self.counters.sent += 1;
        if retransmission {
            self.counters.retransmitted += 1;
        }
    }

    /// Count a received segment.
    pub fn on_received(&mut self) {
        self.counters.received += 1;
    }

    /// A data unit sent on this path was acknowledged. `sample` is absent for
    /// retransmitted units.
    pub fn on_ack(&mut self, now: Instant, sample: Option<Duration>) -> Option<Transition> {
        self.counters.acked += 1;
        self.confirm(now, sample)
    }

    /// A probe sent on this path was answered.
    pub fn on_probe_reply(&mut self, now: Instant, sample: Duration) -> Option<Transition> {
        self.confirm(now, Some(sample))
    }

    fn confirm(&mut self, now: Instant, sample: Option<Duration>) -> Option<Transition> {
        if self.liveness == Liveness::Expired {
            return None;
        }
        match sample {
            Some(sample) => self.rtt.update(sample),
            None => self.rtt.reset_backoff(),
        }
        self.misses = 0;
        self.down_since = None;
        self.last_confirmed = Some(now);
        self.transition(Liveness::Up)
    }

    /// A probe went unanswered or a retransmission timer fired.
    pub fn on_miss(&mut self, now: Instant) -> Option<Transition> {
        if matches!(self.liveness, Liveness::Down | Liveness::Expired) {
            return None;
        }
        self.misses += 1;
        self.rtt.backoff();
        if self.misses >= self.config.miss_threshold {
            self.down_since = Some(now);
            return self.transition(Liveness::Down);
        }
        None
    }

    /// Expire the path once it has been DOWN for the whole expiry window.
    pub fn poll_expiry(&mut self, now: Instant) -> Option<Transition> {
        match self.down_since {
            Some(since)
                if self.liveness == Liveness::Down
                    && now.saturating_duration_since(since) >= self.config.expiry_window =>
            {
                self.transition(Liveness::Expired)
            }
            _ => None,
        }
    }

    /// When a DOWN path will expire.
    pub fn expiry_deadline(&self) -> Option<Instant> {
        match (self.liveness, self.down_since) {
            (Liveness::Down, Some(since)) => Some(since + self.config.expiry_window),
            _ => None,
        }
    }

    fn transition(&mut self, to: Liveness) -> Option<Transition> {
        let from = self.liveness;
        if from == to {
            return None;
        }
        self.liveness = to;
        debug!(path = %self.id, ?from, ?to, "path liveness changed");
        Some(Transition {
            path: self.id,
            from,
            to,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state() -> PathState {
        PathState::new(PathId::from_u64(1), PathStateConfig::default())
    }

    #[test]
    fn test_first_ack_confirms() {
        let mut s = state();
        let now = Instant::now();
        let t = s.on_ack(now, Some(Duration::from_millis(20))).unwrap();
        assert_eq!((t.from, t.to), (Liveness::Unconfirmed, Liveness::Up));
        assert_eq!(s.srtt(), Some(Duration::from_millis(20)));
        assert_eq!(s.last_confirmed(), Some(now));
        assert!(s.on_ack(now, None).is_none());
    }

    #[test]
    fn test_misses_take_path_down() {
        let mut s = state();
        let now = Instant::now();
        s.on_ack(now, Some(Duration::from_millis(20)));

        assert!(s.on_miss(now).is_none());
        assert!(s.on_miss(now).is_none());
        let t = s.on_miss(now).unwrap();
        assert_eq!((t.from, t.to), (Liveness::Up, Liveness::Down));
        assert!(!s.liveness().is_usable());
        // Further misses do not count while DOWN.
        assert!(s.on_miss(now).is_none());
    }

    #[test]
    fn test_unconfirmed_can_go_down() {
        let mut s = state();
        let now = Instant::now();
        for _ in 0..2 {
            assert!(s.on_miss(now).is_none());
        }
        assert_eq!(s.on_miss(now).unwrap().to, Liveness::Down);
    }

    #[test]
    fn test_probe_revives_within_window() {
        let mut s = state();
        let now = Instant::now();
        for _ in 0..3 {
            s.on_miss(now);
        }
        let later = now + Duration::from_secs(1);
        let t = s.on_probe_reply(later, Duration::from_millis(30)).unwrap();
        assert_eq!((t.from, t.to), (Liveness::Down, Liveness::Up));
        assert_eq!(s.expiry_deadline(), None);
    }

    #[test]
    fn test_down_expires_after_window() {
        let mut s = state();
        let now = Instant::now();
        for _ in 0..3 {
            s.on_miss(now);
        }
        assert_eq!(s.expiry_deadline(), Some(now + PATH_EXPIRY_WINDOW));
        assert!(s.poll_expiry(now + Duration::from_secs(1)).is_none());

        let t = s.poll_expiry(now + PATH_EXPIRY_WINDOW).unwrap();
        assert_eq!(t.to, Liveness::Expired);
        // Expired is terminal.
        assert!(s.on_probe_reply(now + PATH_EXPIRY_WINDOW, Duration::from_millis(1)).is_none());
        assert_eq!(s.liveness(), Liveness::Expired);
    }

    #[test]
    fn test_loss_rate() {
        let mut s = state();
        for i in 0..4 {
            s.on_sent(i == 3);
        }
        assert!((s.counters().loss_rate() - 0.25).abs() < f64::EPSILON);
    }
}
