//! Stream configuration.

use std::time::Duration;

use crate::core::{
    CLOSE_LINGER, DEFAULT_ACCEPT_BACKLOG, DEFAULT_INBOX_CAPACITY, DEFAULT_RECV_WINDOW,
    HANDSHAKE_MAX_RETRIES, HANDSHAKE_TIMEOUT, MAX_RETRANSMITS, PATH_EXPIRY_WINDOW,
    PATH_REFRESH_INTERVAL, PROBE_INTERVAL, PROBE_MISS_THRESHOLD,
};
use crate::extensions::PathReservation;
use crate::path::{MAX_RTO, MIN_RTO, PathConstraints, PathStateConfig};

/// How outbound units are spread over the active paths.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SelectionStrategy {
    /// Rotate over every active path.
    #[default]
    RoundRobin,
    /// Send everything on the best path; the others stand by for failover.
    PrimaryStandby,
}

/// Per-connection tunables.
#[derive(Debug, Clone)]
pub struct StreamConfig {
    /// Receive window in data units. Also bounds the units queued for
    /// sending.
    pub recv_window: usize,
    /// Upper bound on the data unit size; path MTUs may lower it further.
    pub max_unit_size: Option<usize>,
    /// Retransmissions of one unit before the connection fails.
    pub max_retransmits: u32,
    /// First handshake retransmission timeout.
    pub handshake_timeout: Duration,
    /// Handshake retransmissions before the connect fails.
    pub handshake_retries: u32,
    /// Lower RTO bound.
    pub min_rto: Duration,
    /// Upper RTO bound.
    pub max_rto: Duration,
    /// Interval between liveness probes on each path.
    pub probe_interval: Duration,
    /// Consecutive misses that take a path DOWN.
    pub miss_threshold: u32,
    /// Time a DOWN path may recover before it expires.
    pub path_expiry: Duration,
    /// Path spreading strategy.
    pub strategy: SelectionStrategy,
    /// Path constraints.
    pub constraints: PathConstraints,
    /// Below this many usable paths, ask the lookup for more.
    pub min_active_paths: usize,
    /// Interval between routine path lookups.
    pub path_refresh_interval: Duration,
    /// After our FIN is acknowledged, wait this long for the peer FIN.
    pub close_linger: Duration,
    /// Inbound queue per connection and per dispatcher registration.
    pub inbox_capacity: usize,
    /// Established connections waiting in a listener.
    pub accept_backlog: usize,
    /// Timeout for blocking socket operations.
    pub timeout: Option<Duration>,
    /// Reservation requested on the handshake.
    pub reservation: Option<PathReservation>,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            recv_window: DEFAULT_RECV_WINDOW,
            max_unit_size: None,
            max_retransmits: MAX_RETRANSMITS,
            handshake_timeout: HANDSHAKE_TIMEOUT,
            handshake_retries: HANDSHAKE_MAX_RETRIES,
            min_rto: MIN_RTO,
            max_rto: MAX_RTO,
            probe_interval: PROBE_INTERVAL,
            miss_threshold: PROBE_MISS_THRESHOLD,
            path_expiry: PATH_EXPIRY_WINDOW,
            strategy: SelectionStrategy::default(),
            constraints: PathConstraints::default(),
            min_active_paths: 1,
            path_refresh_interval: PATH_REFRESH_INTERVAL,
            close_linger: CLOSE_LINGER,
            inbox_capacity: DEFAULT_INBOX_CAPACITY,
            accept_backlog: DEFAULT_ACCEPT_BACKLOG,
            timeout: None,
            reservation: None,
        }
    }
}

impl StreamConfig {
    /// Start a builder.
    pub fn builder() -> StreamConfigBuilder {
        StreamConfigBuilder::new()
    }

    /// Thresholds for the per-path state machines.
    pub fn path_state_config(&self) -> PathStateConfig {
        PathStateConfig {
            miss_threshold: self.miss_threshold.max(1),
            expiry_window: self.path_expiry,
            min_rto: self.min_rto,
            max_rto: self.max_rto,
        }
    }
}

/// Builder for [`StreamConfig`].
#[derive(Debug, Default)]
pub struct StreamConfigBuilder {
    config: StreamConfig,
}

impl StreamConfigBuilder {
    /// Builder with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the receive window in units.
    pub fn recv_window(mut self, units: usize) -> Self {
        self.config.recv_window = units.max(1);
        self
    }

    /// Cap the data unit size.
    pub fn max_unit_size(mut self, bytes: usize) -> Self {
        self.config.max_unit_size = Some(bytes.max(1));
        self
    }

    /// Set the retransmission limit.
    pub fn max_retransmits(mut self, limit: u32) -> Self {
        self.config.max_retransmits = limit;
        self
    }

    /// Set the initial handshake timeout and retry count.
    pub fn handshake(mut self, timeout: Duration, retries: u32) -> Self {
        self.config.handshake_timeout = timeout;
        self.config.handshake_retries = retries;
        self
    }

    /// Set the RTO bounds.
    pub fn rto_bounds(mut self, min: Duration, max: Duration) -> Self {
        self.config.min_rto = min;
        self.config.max_rto = max.max(min);
        self
    }

    /// Set the probe interval and miss threshold.
    pub fn probing(mut self, interval: Duration, miss_threshold: u32) -> Self {
        self.config.probe_interval = interval;
        self.config.miss_threshold = miss_threshold;
        self
    }

    /// Set the path expiry window.
    pub fn path_expiry(mut self, window: Duration) -> Self {
        self.config.path_expiry = window;
        self
    }

    /// Set the spreading strategy.
    pub fn strategy(mut self, strategy: SelectionStrategy) -> Self {
        self.config.strategy = strategy;
        self
    }

    /// Set the path constraints.
    pub fn constraints(mut self, constraints: PathConstraints) -> Self {
        self.config.constraints = constraints;
        self
    }

    /// Set the minimum number of usable paths before a refresh.
    pub fn min_active_paths(mut self, paths: usize) -> Self {
        self.config.min_active_paths = paths;
        self
    }

    /// Set the routine path refresh interval.
    pub fn path_refresh_interval(mut self, interval: Duration) -> Self {
        self.config.path_refresh_interval = interval;
        self
    }

    /// Set the close linger.
    pub fn close_linger(mut self, linger: Duration) -> Self {
        self.config.close_linger = linger;
        self
    }

    /// Set the inbox capacity.
    pub fn inbox_capacity(mut self, capacity: usize) -> Self {
        self.config.inbox_capacity = capacity.max(1);
        self
    }

    /// Set the accept backlog.
    pub fn accept_backlog(mut self, backlog: usize) -> Self {
        self.config.accept_backlog = backlog.max(1);
        self
    }

    /// Set the blocking-operation timeout.
    pub fn timeout(mut self, timeout: Option<Duration>) -> Self {
        self.config.timeout = timeout;
        self
    }

    /// Request a reservation on the handshake.
    pub fn reservation(mut self, reservation: PathReservation) -> Self {
        self.config.reservation = Some(reservation);
        self
    }

    /// Build the configuration.
    pub fn build(self) -> StreamConfig {
        self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_overrides() {
        let config = StreamConfig::builder()
            .recv_window(0)
            .probing(Duration::from_millis(200), 2)
            .rto_bounds(Duration::from_millis(50), Duration::from_millis(10))
            .strategy(SelectionStrategy::PrimaryStandby)
            .build();

        assert_eq!(config.recv_window, 1);
        assert_eq!(config.probe_interval, Duration::from_millis(200));
        assert_eq!(config.max_rto, Duration::from_millis(50));
        assert_eq!(config.strategy, SelectionStrategy::PrimaryStandby);

        let states = config.path_state_config();
        assert_eq!(states.miss_threshold, 2);
        assert_eq!(states.min_rto, Duration::from_millis(50));
    }
}
