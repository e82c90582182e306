//! Send-side bookkeeping of data units.
//!
//! Every unit stays here from the moment the application hands it over until
//! it is acknowledged, cumulatively or selectively. Units waiting for a first
//! transmission or for a retransmission sit in the ready queue; retransmissions
//! are queued in front of new data.

use std::collections::{BTreeMap, VecDeque};
use std::time::{Duration, Instant};

use crate::core::ConnectionError;
use crate::packet::SackBlock;
use crate::path::PathId;

/// Transmission state of one unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum UnitState {
    /// Waiting in the ready queue.
    Queued,
    /// On the wire.
    InFlight {
        path: PathId,
        sent_at: Instant,
        deadline: Instant,
    },
    /// Selectively acknowledged; only the cumulative ack removes it.
    Sacked,
}

/// A sequenced chunk of the application stream.
#[derive(Debug, Clone)]
pub struct DataUnit {
    /// Sequence number.
    pub seq: u64,
    /// Data. Empty for the FIN.
    pub payload: Vec<u8>,
    /// Last unit of the stream.
    pub fin: bool,
    /// Transmissions so far.
    pub transmissions: u32,
    /// Timeouts so far.
    pub retries: u32,
    state: UnitState,
}

impl DataUnit {
    fn new(seq: u64, payload: Vec<u8>, fin: bool) -> Self {
        Self {
            seq,
            payload,
            fin,
            transmissions: 0,
            retries: 0,
            state: UnitState::Queued,
        }
    }

    /// Path the unit was last sent on, while in flight.
    pub fn path(&self) -> Option<PathId> {
        match self.state {
            UnitState::InFlight { path, .. } => Some(path),
            _ => None,
        }
    }

    /// Whether the next transmission is a retransmission.
    pub fn is_retransmission(&self) -> bool {
        self.transmissions > 0
    }
}

/// An acknowledged unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Acked {
    /// Sequence number.
    pub seq: u64,
    /// Path of the last transmission.
    pub path: PathId,
    /// RTT sample; only for units sent exactly once.
    pub sample: Option<Duration>,
}

/// A unit whose deadline passed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Expired {
    /// Sequence number.
    pub seq: u64,
    /// Path the unit was lost on.
    pub path: PathId,
}

/// Units not yet acknowledged, keyed by sequence number.
#[derive(Debug)]
pub struct RetransmitQueue {
    units: BTreeMap<u64, DataUnit>,
    ready: VecDeque<u64>,
    queued_bytes: usize,
    max_retransmits: u32,
    max_rto: Duration,
}

impl RetransmitQueue {
    /// Empty queue.
    pub fn new(max_retransmits: u32, max_rto: Duration) -> Self {
        Self {
            units: BTreeMap::new(),
            ready: VecDeque::new(),
            queued_bytes: 0,
            max_retransmits,
            max_rto,
        }
    }

    /// Append a new unit behind everything already queued.
    pub fn push(&mut self, seq: u64, payload: Vec<u8>, fin: bool) {
        self.queued_bytes += payload.len();
        self.units.insert(seq, DataUnit::new(seq, payload, fin));
        self.ready.push_back(seq);
    }

    /// Units held, in flight or not.
    pub fn len(&self) -> usize {
        self.units.len()
    }

    /// Whether every unit has been acknowledged.
    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    /// Payload bytes held.
    pub fn queued_bytes(&self) -> usize {
        self.queued_bytes
    }

    /// Next unit to transmit, without removing it from the ready queue.
    pub fn peek_ready(&self) -> Option<&DataUnit> {
        self.ready.front().and_then(|seq| self.units.get(seq))
    }

    /// Record the transmission of the unit at the head of the ready queue.
    ///
    /// The deadline is the sending path's `rto`, capped at the maximum RTO.
    /// Backoff lives in the path's estimator, which doubles on every timeout
    /// the path takes.
    pub fn mark_sent(&mut self, path: PathId, now: Instant, rto: Duration) -> Option<&DataUnit> {
        let seq = self.ready.pop_front()?;
        let timeout = rto.min(self.max_rto);
        let unit = self.units.get_mut(&seq)?;
        unit.transmissions += 1;
        unit.state = UnitState::InFlight {
            path,
            sent_at: now,
            deadline: now + timeout,
        };
        Some(&*unit)
    }

    /// Remove every unit below `ack`.
    pub fn on_cumulative_ack(&mut self, ack: u64, now: Instant) -> Vec<Acked> {
        let mut acked = Vec::new();
        let below: Vec<u64> = self.units.range(..ack).map(|(seq, _)| *seq).collect();
        for seq in below {
            if let Some(unit) = self.units.remove(&seq) {
                self.queued_bytes -= unit.payload.len();
                if let Some(a) = acked_record(&unit, now) {
                    acked.push(a);
                }
            }
        }
        let units = &self.units;
        self.ready.retain(|seq| units.contains_key(seq));
        acked
    }

    /// Mark the units inside `block` as received by the peer.
    pub fn on_sack(&mut self, block: SackBlock, now: Instant) -> Vec<Acked> {
        let mut acked = Vec::new();
        if block.end <= block.start {
            return acked;
        }
        for (_, unit) in self.units.range_mut(block.start..block.end) {
            if unit.state == UnitState::Sacked {
                continue;
            }
            if let Some(a) = acked_record(unit, now) {
                acked.push(a);
            }
            unit.state = UnitState::Sacked;
        }
        let units = &self.units;
        self.ready
            .retain(|seq| units.get(seq).is_some_and(|u| u.state != UnitState::Sacked));
        acked
    }

    /// Requeue every unit whose deadline has passed.
    ///
    /// Fails once a unit has timed out more often than the retransmission
    /// limit allows.
    pub fn poll_expired(&mut self, now: Instant) -> Result<Vec<Expired>, ConnectionError> {
        let mut expired = Vec::new();
        for unit in self.units.values_mut() {
            if let UnitState::InFlight { path, deadline, .. } = unit.state {
                if deadline <= now {
                    unit.retries += 1;
                    if unit.retries > self.max_retransmits {
                        return Err(ConnectionError::RetransmissionExhausted {
                            seq: unit.seq,
                            retries: unit.retries,
                        });
                    }
                    unit.state = UnitState::Queued;
                    expired.push(Expired {
                        seq: unit.seq,
                        path,
                    });
                }
            }
        }
        self.requeue_front(expired.iter().map(|e| e.seq).collect());
        Ok(expired)
    }

    /// Requeue the in-flight units sent on `path` ahead of all other data,
    /// without waiting for their deadlines. Returns how many were requeued.
    pub fn requeue_path(&mut self, path: PathId) -> usize {
        let mut seqs = Vec::new();
        for unit in self.units.values_mut() {
            if unit.path() == Some(path) {
                unit.state = UnitState::Queued;
                seqs.push(unit.seq);
            }
        }
        let count = seqs.len();
        self.requeue_front(seqs);
        count
    }

    /// Earliest retransmission deadline.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.units
            .values()
            .filter_map(|u| match u.state {
                UnitState::InFlight { deadline, .. } => Some(deadline),
                _ => None,
            })
            .min()
    }

    /// Whether any unit was sent on `path` and is still unacknowledged.
    pub fn in_flight_on(&self, path: PathId) -> bool {
        self.units.values().any(|u| u.path() == Some(path))
    }

    /// Drop everything.
    pub fn clear(&mut self) {
        self.units.clear();
        self.ready.clear();
        self.queued_bytes = 0;
    }

    // `seqs` ascending; the lowest ends up at the very front.
    fn requeue_front(&mut self, seqs: Vec<u64>) {
        if seqs.is_empty() {
            return;
        }
        self.ready.retain(|seq| !seqs.contains(seq));
        for seq in seqs.into_iter().rev() {
            self.ready.push_front(seq);
        }
    }
}

fn acked_record(unit: &DataUnit, now: Instant) -> Option<Acked> {
    match unit.state {
        UnitState::InFlight { path, sent_at, .. } => Some(Acked {
            seq: unit.seq,
            path,
            // Karn: ambiguous samples from retransmitted units are discarded.
            sample: (unit.transmissions == 1).then(|| now.saturating_duration_since(sent_at)),
        }),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const P1: PathId = PathId::from_u64(1);
    const P2: PathId = PathId::from_u64(2);
    const RTO: Duration = Duration::from_millis(100);

    fn queue_with(n: u64) -> RetransmitQueue {
        let mut q = RetransmitQueue::new(3, Duration::from_secs(1));
        for seq in 1..=n {
            q.push(seq, vec![seq as u8; 10], false);
        }
        q
    }

    #[test]
    fn test_cumulative_ack_samples_rtt() {
        let mut q = queue_with(3);
        let t0 = Instant::now();
        for _ in 0..3 {
            q.mark_sent(P1, t0, RTO);
        }
        let acked = q.on_cumulative_ack(3, t0 + Duration::from_millis(40));
        assert_eq!(acked.len(), 2);
        assert_eq!(acked[0].sample, Some(Duration::from_millis(40)));
        assert_eq!(q.len(), 1);
        assert_eq!(q.queued_bytes(), 10);
    }

    #[test]
    fn test_timeout_requeues_in_front() {
        let mut q = queue_with(3);
        let t0 = Instant::now();
        q.mark_sent(P1, t0, RTO);
        q.mark_sent(P1, t0, RTO);

        let expired = q.poll_expired(t0 + RTO).unwrap();
        assert_eq!(expired, vec![Expired { seq: 1, path: P1 }, Expired { seq: 2, path: P1 }]);
        assert_eq!(q.peek_ready().map(|u| u.seq), Some(1));

        // The deadline follows the RTO handed in, already backed off by the
        // path; it is not scaled a second time per retry.
        let t1 = t0 + RTO;
        let unit = q.mark_sent(P2, t1, RTO * 2).unwrap();
        assert!(unit.is_retransmission());
        assert_eq!(unit.retries, 1);
        assert_eq!(q.next_deadline(), Some(t1 + RTO * 2));

        // Retransmitted units give no RTT sample.
        let acked = q.on_cumulative_ack(2, t1 + Duration::from_millis(10));
        assert_eq!(acked[0].sample, None);
        assert_eq!(acked[0].path, P2);
    }

    #[test]
    fn test_deadline_capped_at_max_rto() {
        let mut q = queue_with(1);
        let t0 = Instant::now();
        q.mark_sent(P1, t0, Duration::from_secs(30));
        assert_eq!(q.next_deadline(), Some(t0 + Duration::from_secs(1)));
    }

    #[test]
    fn test_retry_limit() {
        let mut q = queue_with(1);
        let mut now = Instant::now();
        for _ in 0..3 {
            q.mark_sent(P1, now, RTO);
            now += Duration::from_secs(1);
            assert!(q.poll_expired(now).is_ok());
        }
        q.mark_sent(P1, now, RTO);
        now += Duration::from_secs(1);
        assert_eq!(
            q.poll_expired(now),
            Err(ConnectionError::RetransmissionExhausted { seq: 1, retries: 4 })
        );
    }

    #[test]
    fn test_sacked_units_never_retransmitted() {
        let mut q = queue_with(4);
        let t0 = Instant::now();
        for _ in 0..4 {
            q.mark_sent(P1, t0, RTO);
        }
        let acked = q.on_sack(SackBlock { start: 3, end: 5 }, t0);
        assert_eq!(acked.len(), 2);
        // A repeated block is not counted twice.
        assert!(q.on_sack(SackBlock { start: 3, end: 5 }, t0).is_empty());

        let expired = q.poll_expired(t0 + RTO).unwrap();
        assert_eq!(expired.iter().map(|e| e.seq).collect::<Vec<_>>(), vec![1, 2]);
        assert_eq!(q.on_cumulative_ack(5, t0 + RTO).len(), 0);
        assert!(q.is_empty());
    }

    #[test]
    fn test_requeue_path_moves_units_ahead_of_new_data() {
        let mut q = queue_with(4);
        let t0 = Instant::now();
        q.mark_sent(P1, t0, RTO);
        q.mark_sent(P2, t0, RTO);
        q.mark_sent(P1, t0, RTO);

        assert_eq!(q.requeue_path(P1), 2);
        assert!(!q.in_flight_on(P1));
        assert!(q.in_flight_on(P2));

        let order: Vec<u64> = std::iter::from_fn(|| q.mark_sent(P2, t0, RTO).map(|u| u.seq))
            .collect();
        assert_eq!(order, vec![1, 3, 4]);
    }
}
