//! Round-trip estimation for one path.
//!
//! Smoothed RTT and retransmission timeout after RFC 6298, kept in
//! [`Duration`] arithmetic. Each path owns one estimator, so a slow path
//! never inflates the timers of a fast one.

use std::time::Duration;

/// RTO used until a path produced its first sample.
pub const INITIAL_RTO: Duration = Duration::from_secs(1);

/// Default lower RTO bound.
pub const MIN_RTO: Duration = Duration::from_millis(100);

/// Default upper RTO bound.
pub const MAX_RTO: Duration = Duration::from_secs(60);

/// Clock granularity term added to the variance.
pub const CLOCK_GRANULARITY: Duration = Duration::from_millis(10);

/// Per-path RTT estimator.
#[derive(Debug, Clone)]
pub struct RttEstimator {
    smoothed: Option<Smoothed>,
    rto: Duration,
    bounds: (Duration, Duration),
    backoffs: u32,
}

#[derive(Debug, Clone, Copy)]
struct Smoothed {
    srtt: Duration,
    rttvar: Duration,
}

impl Smoothed {
    fn rto(self) -> Duration {
        self.srtt + CLOCK_GRANULARITY.max(self.rttvar * 4)
    }
}

impl Default for RttEstimator {
    fn default() -> Self {
        Self::with_bounds(MIN_RTO, MAX_RTO)
    }
}

impl RttEstimator {
    /// Estimator with the RTO kept inside `[min_rto, max_rto]`.
    pub fn with_bounds(min_rto: Duration, max_rto: Duration) -> Self {
        let max_rto = max_rto.max(min_rto);
        Self {
            smoothed: None,
            rto: INITIAL_RTO.clamp(min_rto, max_rto),
            bounds: (min_rto, max_rto),
            backoffs: 0,
        }
    }

    /// Feed one RTT sample. Clears any backoff.
    pub fn update(&mut self, sample: Duration) {
        let next = match self.smoothed {
            None => Smoothed {
                srtt: sample,
                rttvar: sample / 2,
            },
            Some(Smoothed { srtt, rttvar }) => {
                let deviation = srtt.abs_diff(sample);
                Smoothed {
                    srtt: (srtt * 7 + sample) / 8,
                    rttvar: (rttvar * 3 + deviation) / 4,
                }
            }
        };
        self.smoothed = Some(next);
        self.backoffs = 0;
        self.rto = self.clamp(next.rto());
    }

    fn clamp(&self, rto: Duration) -> Duration {
        rto.clamp(self.bounds.0, self.bounds.1)
    }

    /// Smoothed RTT, `None` before the first sample.
    pub fn srtt(&self) -> Option<Duration> {
        self.smoothed.map(|s| s.srtt)
    }

    /// RTT variance, `None` before the first sample.
    pub fn rttvar(&self) -> Option<Duration> {
        self.smoothed.map(|s| s.rttvar)
    }

    /// Current retransmission timeout, backoff included.
    pub fn rto(&self) -> Duration {
        self.rto
    }

    /// Consecutive backoffs since the last sample or reset.
    pub fn backoffs(&self) -> u32 {
        self.backoffs
    }

    /// Double the RTO after a timeout on this path.
    pub fn backoff(&mut self) -> Duration {
        self.backoffs = self.backoffs.saturating_add(1);
        self.rto = self.clamp(self.rto.saturating_mul(2));
        self.rto
    }

    /// Drop accumulated backoff, e.g. when the path answers a probe
    /// without yielding a usable sample.
    pub fn reset_backoff(&mut self) {
        self.backoffs = 0;
        self.rto = match self.smoothed {
            Some(s) => self.clamp(s.rto()),
            None => self.clamp(INITIAL_RTO),
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(v: u64) -> Duration {
        Duration::from_millis(v)
    }

    #[test]
    fn test_unsampled_path_uses_initial_rto() {
        let rtt = RttEstimator::default();
        assert_eq!(rtt.srtt(), None);
        assert_eq!(rtt.rttvar(), None);
        assert_eq!(rtt.rto(), INITIAL_RTO);
    }

    #[test]
    fn test_first_sample_seeds_variance() {
        let mut rtt = RttEstimator::default();
        rtt.update(ms(100));
        assert_eq!(rtt.srtt(), Some(ms(100)));
        assert_eq!(rtt.rttvar(), Some(ms(50)));
        assert_eq!(rtt.rto(), ms(300));
    }

    #[test]
    fn test_later_samples_are_smoothed() {
        let mut rtt = RttEstimator::default();
        rtt.update(ms(100));
        rtt.update(ms(180));
        assert_eq!(rtt.srtt(), Some(ms(110)));
        assert_eq!(rtt.rttvar(), Some(ms(57) + Duration::from_micros(500)));
    }

    #[test]
    fn test_backoff_doubles_until_cap() {
        let mut rtt = RttEstimator::default();
        rtt.update(ms(100));
        assert_eq!(rtt.backoff(), ms(600));
        for _ in 0..20 {
            rtt.backoff();
        }
        assert_eq!(rtt.rto(), MAX_RTO);
        assert_eq!(rtt.backoffs(), 21);

        rtt.reset_backoff();
        assert_eq!(rtt.rto(), ms(300));
        assert_eq!(rtt.backoffs(), 0);
    }

    #[test]
    fn test_sample_clears_backoff() {
        let mut rtt = RttEstimator::default();
        rtt.backoff();
        assert_eq!(rtt.rto(), ms(2000));
        rtt.update(ms(40));
        assert_eq!(rtt.backoffs(), 0);
        assert_eq!(rtt.rto(), ms(120));
    }

    #[test]
    fn test_custom_bounds_clamp() {
        let mut rtt = RttEstimator::with_bounds(ms(50), ms(400));
        assert_eq!(rtt.rto(), ms(400));
        rtt.update(Duration::from_micros(100));
        assert_eq!(rtt.rto(), ms(50));
    }
}
