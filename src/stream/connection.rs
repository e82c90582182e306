//! Connection state machine.
//!
//! The connection never touches a socket or a clock. The caller feeds it
//! segments and time and drains the segments it wants sent:
//!
//! - [`Connection::handle_segment`] for every inbound segment of the flow
//! - [`Connection::handle_timeout`] once [`Connection::poll_timeout`] passed
//! - [`Connection::poll_transmit`] until it returns `None`
//!
//! ```text
//!             connect                        accept
//!   ─────────────────▶ SynSent     ─────────────────▶ SynRcvd
//!                        │ SYN-ACK                      │ ACK
//!                        └───────────▶ Established ◀────┘
//!                       close │                 │ peer FIN
//!                             ▼                 ▼
//!                          FinWait          CloseWait
//!   FIN acked and peer FIN    │                 │ close
//!   (or linger elapsed)       ▼                 ▼
//!                           Closed ◀─────────  LastAck
//!                                   FIN acked
//! ```

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use tracing::{debug, info, trace, warn};

use super::config::StreamConfig;
use super::manager::{ConnectionManager, PathStats};
use super::reorder::{InsertOutcome, ReorderBuffer};
use super::retransmit::{Acked, RetransmitQueue};
use crate::core::{ConnectionError, MAX_SACK_BLOCKS, RETRANSMIT_BACKOFF, ScionSocketAddr};
use crate::extensions::{ExtensionBuf, PathProbe, PathReservation};
use crate::packet::{
    HandshakeInfo, SACK_BLOCK_LEN, SSP_HEADER_LEN, SspFlags, SspHeader, SspSegment,
    header_overhead,
};
use crate::path::{Liveness, Path, PathConstraints, PathId, Transition};

/// Smallest data unit, whatever the path MTU.
const MIN_UNIT_SIZE: usize = 64;

/// Connection lifecycle phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionPhase {
    /// SYN sent, waiting for SYN-ACK.
    SynSent,
    /// SYN answered, waiting for the final ACK.
    SynRcvd,
    /// Data flows both ways.
    Established,
    /// Our FIN is queued or in flight.
    FinWait,
    /// The peer finished; we may still send.
    CloseWait,
    /// Both sides finished; our FIN is in flight.
    LastAck,
    /// Terminal.
    Closed,
}

impl ConnectionPhase {
    /// Handshake completed and not yet closed.
    pub fn is_synchronized(self) -> bool {
        matches!(
            self,
            Self::Established | Self::FinWait | Self::CloseWait | Self::LastAck
        )
    }

    /// Terminal phase.
    pub fn is_closed(self) -> bool {
        self == Self::Closed
    }
}

/// Which side opened the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Sent the SYN.
    Initiator,
    /// Answered a SYN.
    Responder,
}

/// A segment ready to be put on the wire.
#[derive(Debug, Clone)]
pub struct Transmit {
    /// Forwarding path, outbound direction.
    pub path: Path,
    /// The segment.
    pub segment: SspSegment,
    /// End-to-end extensions to attach.
    pub extensions: Vec<ExtensionBuf>,
}

/// Connection statistics.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionStats {
    /// Current phase.
    pub phase: ConnectionPhase,
    /// Flow identifier.
    pub flow_id: u64,
    /// Payload bytes put on the wire, retransmissions not counted.
    pub bytes_sent: u64,
    /// Payload bytes delivered in order.
    pub bytes_received: u64,
    /// Segments handed to the caller.
    pub segments_sent: u64,
    /// Segments accepted for this flow.
    pub segments_received: u64,
    /// Data units sent again.
    pub retransmissions: u64,
    /// Data units received twice.
    pub duplicates: u64,
    /// Data units dropped for lying beyond the receive window.
    pub out_of_window: u64,
    /// Paths that went DOWN with data in flight.
    pub failovers: u64,
    /// Every tracked path, active first.
    pub paths: Vec<PathStats>,
}

#[derive(Debug, Default, Clone, Copy)]
struct Counters {
    bytes_sent: u64,
    bytes_received: u64,
    segments_sent: u64,
    segments_received: u64,
    retransmissions: u64,
    duplicates: u64,
    out_of_window: u64,
    failovers: u64,
}

#[derive(Debug, Clone, Copy)]
struct Handshake {
    attempts: u32,
    timeout: Duration,
    deadline: Instant,
    sent_at: Instant,
    /// Responder: the path the SYN arrived on.
    reply_path: Option<PathId>,
}

/// Zero-window probing.
#[derive(Debug, Clone, Copy)]
struct Persist {
    interval: Duration,
    deadline: Instant,
}

/// One multipath stream connection.
#[derive(Debug)]
pub struct Connection {
    role: Role,
    phase: ConnectionPhase,
    error: Option<ConnectionError>,
    app_closed: bool,
    flow_id: u64,
    local: ScionSocketAddr,
    remote: ScionSocketAddr,
    config: StreamConfig,
    manager: ConnectionManager,

    isn: u64,
    /// Lowest unacknowledged sequence number.
    snd_una: u64,
    /// Next sequence number to assign.
    snd_nxt: u64,
    retx: RetransmitQueue,
    fin_seq: Option<u64>,
    local_mss: usize,
    peer_mss: usize,
    peer_window: u32,
    /// The application has data the peer's window refused.
    send_blocked: bool,
    handshake: Option<Handshake>,

    reorder: ReorderBuffer,
    recv_queue: VecDeque<u8>,
    peer_fin: Option<u64>,
    eof: bool,
    ack_pending: Option<PathId>,
    window_update: bool,
    last_window: u32,

    persist: Option<Persist>,
    linger: Option<Instant>,
    control: VecDeque<Transmit>,

    peer_paths: Vec<PathId>,
    peer_reservation: Option<PathReservation>,
    counters: Counters,
}

impl Connection {
    fn new(
        role: Role,
        now: Instant,
        flow_id: u64,
        local: ScionSocketAddr,
        remote: ScionSocketAddr,
        config: StreamConfig,
    ) -> Self {
        let isn = u64::from(rand::random::<u32>());
        Self {
            role,
            phase: ConnectionPhase::Closed,
            error: None,
            app_closed: false,
            flow_id,
            local,
            remote,
            manager: ConnectionManager::new(&config, now),
            isn,
            snd_una: isn + 1,
            snd_nxt: isn + 1,
            retx: RetransmitQueue::new(config.max_retransmits, config.max_rto),
            fin_seq: None,
            local_mss: 0,
            peer_mss: 0,
            peer_window: 0,
            send_blocked: false,
            handshake: None,
            reorder: ReorderBuffer::new(0, config.recv_window),
            recv_queue: VecDeque::new(),
            peer_fin: None,
            eof: false,
            ack_pending: None,
            window_update: false,
            last_window: 0,
            persist: None,
            linger: None,
            control: VecDeque::new(),
            peer_paths: Vec::new(),
            peer_reservation: None,
            counters: Counters::default(),
            config,
        }
    }

    /// Open a connection over `candidates` and queue the SYN.
    ///
    /// Fails with [`ConnectionError::NoPathAvailable`] before anything is sent
    /// when no candidate passes the path constraints.
    pub fn connect(
        now: Instant,
        flow_id: u64,
        local: ScionSocketAddr,
        remote: ScionSocketAddr,
        candidates: Vec<Path>,
        config: StreamConfig,
    ) -> Result<Self, ConnectionError> {
        let mut conn = Self::new(Role::Initiator, now, flow_id, local, remote, config);
        conn.manager.add_candidates(candidates, now);
        conn.manager.mark_refreshed(now);
        if conn.manager.active().is_empty() {
            debug!(remote = %remote, "no admissible path");
            return Err(ConnectionError::NoPathAvailable);
        }
        conn.local_mss = conn.active_unit_size();
        conn.peer_mss = conn.local_mss;
        conn.phase = ConnectionPhase::SynSent;
        conn.send_handshake(now);
        debug!(
            flow = flow_id,
            remote = %remote,
            paths = conn.manager.active().len(),
            mss = conn.local_mss,
            "connecting"
        );
        Ok(conn)
    }

    /// Answer a SYN that arrived on `via` and queue the SYN-ACK on the reverse
    /// path.
    pub fn accept(
        now: Instant,
        local: ScionSocketAddr,
        remote: ScionSocketAddr,
        syn: &SspSegment,
        via: &Path,
        extensions: &[ExtensionBuf],
        config: StreamConfig,
    ) -> Result<Self, ConnectionError> {
        let h = &syn.header;
        if !h.flags.contains(SspFlags::SYN) || h.flags.contains(SspFlags::ACK) {
            return Err(ConnectionError::InvalidState("expected a SYN"));
        }
        let mut conn = Self::new(Role::Responder, now, h.flow_id, local, remote, config);
        conn.manager.learn(via, now);
        conn.manager.mark_refreshed(now);
        if conn.manager.active().is_empty() {
            return Err(ConnectionError::NoPathAvailable);
        }
        conn.local_mss = conn.active_unit_size();
        conn.apply_handshake_info(&syn.payload);
        conn.reorder.reset(h.seq.saturating_add(1));
        conn.peer_window = h.window;
        conn.peer_reservation = extensions.iter().find_map(PathReservation::decode_buf);
        if let Some(r) = &conn.peer_reservation {
            info!(
                flow = h.flow_id,
                priority = r.priority,
                bandwidth_kbps = r.bandwidth_kbps,
                "peer requested a path reservation"
            );
        }
        conn.manager.on_received(via.id());
        conn.counters.segments_received += 1;
        conn.phase = ConnectionPhase::SynRcvd;
        conn.handshake = Some(Handshake {
            attempts: 0,
            timeout: conn.config.handshake_timeout,
            deadline: now,
            sent_at: now,
            reply_path: Some(via.id()),
        });
        conn.send_handshake(now);
        debug!(flow = h.flow_id, remote = %remote, "accepted");
        Ok(conn)
    }

    /// Current phase.
    pub fn phase(&self) -> ConnectionPhase {
        self.phase
    }

    /// Which side opened the connection.
    pub fn role(&self) -> Role {
        self.role
    }

    /// Flow identifier.
    pub fn flow_id(&self) -> u64 {
        self.flow_id
    }

    /// Local endpoint.
    pub fn local(&self) -> ScionSocketAddr {
        self.local
    }

    /// Remote endpoint.
    pub fn remote(&self) -> ScionSocketAddr {
        self.remote
    }

    /// The error that ended the connection, if any.
    pub fn error(&self) -> Option<&ConnectionError> {
        self.error.as_ref()
    }

    /// Whether the connection reached its terminal phase.
    pub fn is_closed(&self) -> bool {
        self.phase.is_closed()
    }

    /// Path ids the peer announced on the handshake.
    pub fn peer_paths(&self) -> &[PathId] {
        &self.peer_paths
    }

    /// Reservation the peer requested on its SYN.
    pub fn peer_reservation(&self) -> Option<&PathReservation> {
        self.peer_reservation.as_ref()
    }

    /// Largest payload of one data unit.
    pub fn local_mss(&self) -> usize {
        self.local_mss
    }

    /// The path set.
    pub fn manager(&self) -> &ConnectionManager {
        &self.manager
    }

    /// Bytes ready for [`Connection::recv`].
    pub fn readable_bytes(&self) -> usize {
        self.recv_queue.len()
    }

    /// Whether `recv` would return something other than "nothing yet".
    pub fn is_readable(&self) -> bool {
        !self.recv_queue.is_empty() || self.eof || self.error.is_some() || self.is_closed()
    }

    /// Units that [`Connection::send`] would still accept: what is left of
    /// the peer's advertised window, bounded by the local send queue.
    pub fn send_capacity(&self) -> usize {
        let queue_room = self.config.recv_window.saturating_sub(self.retx.len());
        usize::try_from(self.window_room())
            .unwrap_or(usize::MAX)
            .min(queue_room)
    }

    /// Whether every sent byte has been acknowledged.
    pub fn is_flushed(&self) -> bool {
        self.retx.is_empty()
    }

    /// Queue application data. Returns how many bytes were accepted, which is
    /// less than `data.len()` once the peer's advertised window is used up
    /// (assigned but unacknowledged units count against it) or the send
    /// queue is full. `Ok(0)` means the caller has to wait for an ack or a
    /// window update.
    pub fn send(&mut self, data: &[u8]) -> Result<usize, ConnectionError> {
        if let Some(err) = &self.error {
            return Err(err.clone());
        }
        if self.app_closed {
            return Err(ConnectionError::Closed);
        }
        match self.phase {
            ConnectionPhase::Established | ConnectionPhase::CloseWait => {}
            ConnectionPhase::SynSent | ConnectionPhase::SynRcvd => {
                return Err(ConnectionError::InvalidState("handshake in progress"));
            }
            _ => return Err(ConnectionError::Closed),
        }
        let mss = self.local_mss.max(1);
        let mut accepted = 0;
        self.send_blocked = false;
        for chunk in data.chunks(mss) {
            if self.window_room() == 0 {
                self.send_blocked = true;
                break;
            }
            if self.send_capacity() == 0 {
                break;
            }
            self.retx.push(self.snd_nxt, chunk.to_vec(), false);
            self.snd_nxt += 1;
            accepted += chunk.len();
        }
        Ok(accepted)
    }

    /// Read in-order data.
    ///
    /// `Ok(None)` means nothing is available yet; `Ok(Some(0))` means the peer
    /// finished sending.
    pub fn recv(&mut self, buf: &mut [u8]) -> Result<Option<usize>, ConnectionError> {
        if let Some(err) = &self.error {
            return Err(err.clone());
        }
        if self.app_closed {
            return Err(ConnectionError::Closed);
        }
        if !self.recv_queue.is_empty() {
            let n = buf.len().min(self.recv_queue.len());
            for (slot, byte) in buf.iter_mut().zip(self.recv_queue.drain(..n)) {
                *slot = byte;
            }
            self.maybe_window_update();
            return Ok(Some(n));
        }
        if self.eof {
            return Ok(Some(0));
        }
        if self.phase.is_closed() {
            return Err(ConnectionError::Closed);
        }
        Ok(None)
    }

    /// Close the connection.
    ///
    /// A graceful close queues a FIN behind the pending data; an abrupt close
    /// discards everything and resets the peer. Either way further reads and
    /// writes fail with [`ConnectionError::Closed`].
    pub fn close(&mut self, graceful: bool) {
        self.app_closed = true;
        self.recv_queue.clear();
        match self.phase {
            ConnectionPhase::Closed => {}
            ConnectionPhase::Established | ConnectionPhase::CloseWait if graceful => {
                let seq = self.snd_nxt;
                self.snd_nxt += 1;
                self.fin_seq = Some(seq);
                self.retx.push(seq, Vec::new(), true);
                self.phase = if self.phase == ConnectionPhase::Established {
                    ConnectionPhase::FinWait
                } else {
                    ConnectionPhase::LastAck
                };
                debug!(flow = self.flow_id, phase = ?self.phase, "closing");
            }
            ConnectionPhase::FinWait | ConnectionPhase::LastAck if graceful => {}
            ConnectionPhase::SynSent => self.terminate(ConnectionError::Closed, false),
            _ => self.terminate(ConnectionError::Closed, true),
        }
    }

    /// Add paths from a lookup refresh. Paths whose MTU cannot carry the
    /// negotiated unit size are skipped.
    pub fn update_paths(&mut self, now: Instant, paths: Vec<Path>) -> usize {
        self.manager.mark_refreshed(now);
        let fitting: Vec<Path> = paths.into_iter().filter(|p| self.fits(p)).collect();
        let added = self.manager.add_candidates(fitting, now);
        if added > 0 {
            debug!(flow = self.flow_id, added, "path set refreshed");
        }
        added
    }

    /// Whether the caller should run a path lookup.
    pub fn needs_path_refresh(&self, now: Instant) -> bool {
        !self.phase.is_closed() && self.manager.needs_refresh(now)
    }

    /// Replace the path constraints. The active set is recomputed at once.
    pub fn set_policy(&mut self, constraints: PathConstraints) {
        self.manager.set_constraints(constraints);
    }

    /// Statistics snapshot.
    pub fn stats(&self) -> ConnectionStats {
        let c = self.counters;
        ConnectionStats {
            phase: self.phase,
            flow_id: self.flow_id,
            bytes_sent: c.bytes_sent,
            bytes_received: c.bytes_received,
            segments_sent: c.segments_sent,
            segments_received: c.segments_received,
            retransmissions: c.retransmissions,
            duplicates: c.duplicates,
            out_of_window: c.out_of_window,
            failovers: c.failovers,
            paths: self.manager.stats(),
        }
    }

    /// Process one inbound segment that arrived on `via`.
    pub fn handle_segment(
        &mut self,
        now: Instant,
        segment: &SspSegment,
        via: &Path,
        extensions: &[ExtensionBuf],
    ) {
        let h = &segment.header;
        if self.phase.is_closed() || h.flow_id != self.flow_id {
            return;
        }
        let path_id = via.id();
        if !self.manager.contains(path_id) && self.fits(via) {
            self.manager.learn(via, now);
        }
        self.manager.on_received(path_id);
        self.counters.segments_received += 1;

        if h.flags.contains(SspFlags::RST) {
            self.terminate(ConnectionError::Reset, false);
            return;
        }

        match self.phase {
            ConnectionPhase::SynSent => {
                if h.flags.contains(SspFlags::SYN | SspFlags::ACK) && h.ack == self.isn + 1 {
                    self.on_syn_ack(now, segment, path_id);
                }
                return;
            }
            ConnectionPhase::SynRcvd => {
                if h.flags.contains(SspFlags::SYN) {
                    // Our SYN-ACK was lost.
                    self.queue_handshake_segment(path_id);
                    return;
                }
                if !h.flags.contains(SspFlags::ACK) || h.ack != self.isn + 1 {
                    return;
                }
                let sample = self
                    .handshake
                    .filter(|hs| hs.attempts == 1)
                    .map(|hs| now.saturating_duration_since(hs.sent_at));
                let t = self.manager.on_ack(path_id, now, sample);
                self.establish(now);
                self.apply_transition(t);
            }
            _ => {
                if h.flags.contains(SspFlags::SYN) {
                    // Duplicate SYN-ACK: our final ACK was lost.
                    if self.role == Role::Initiator && h.flags.contains(SspFlags::ACK) {
                        self.ack_pending = Some(path_id);
                    }
                    return;
                }
            }
        }

        if h.flags.contains(SspFlags::ACK) {
            self.process_ack(now, segment);
        }
        if h.flags.contains(SspFlags::PROBE) {
            self.process_probe(now, path_id, extensions);
        }
        if h.flags.contains(SspFlags::WINDOW_PROBE) {
            self.ack_pending = Some(path_id);
        }
        if !segment.payload.is_empty() || h.flags.contains(SspFlags::FIN) {
            self.process_data(segment, path_id);
        }
        self.check_close_progress(now);
    }

    /// Run the timers that expired at `now`.
    pub fn handle_timeout(&mut self, now: Instant) {
        if self.phase.is_closed() {
            return;
        }
        if let Some(mut hs) = self.handshake {
            if hs.deadline <= now {
                if hs.attempts > self.config.handshake_retries {
                    self.terminate(
                        ConnectionError::HandshakeTimeout {
                            attempts: hs.attempts,
                        },
                        false,
                    );
                    return;
                }
                hs.timeout = hs
                    .timeout
                    .saturating_mul(RETRANSMIT_BACKOFF)
                    .min(self.config.max_rto);
                self.handshake = Some(hs);
                debug!(
                    flow = self.flow_id,
                    attempt = hs.attempts + 1,
                    "retransmitting handshake"
                );
                self.send_handshake(now);
            }
        }
        if !self.phase.is_synchronized() {
            return;
        }

        // Probe misses first: a path that goes DOWN now hands its units over
        // before their own deadlines fire.
        for t in self.manager.poll_timers(now) {
            self.apply_transition(Some(t));
        }
        match self.retx.poll_expired(now) {
            Ok(expired) => {
                let mut lossy: Vec<PathId> = expired.iter().map(|e| e.path).collect();
                lossy.sort();
                lossy.dedup();
                for path in lossy {
                    trace!(path = %path, "retransmission timeout");
                    let t = self.manager.on_miss(path, now);
                    self.apply_transition(t);
                }
            }
            Err(err) => {
                self.terminate(err, true);
                return;
            }
        }
        if self.manager.is_exhausted() {
            self.terminate(ConnectionError::NoPathAvailable, false);
            return;
        }

        while let Some((path_id, probe)) = self.manager.poll_probe(now) {
            self.queue_probe(path_id, probe);
        }
        self.poll_persist(now);

        if self.phase == ConnectionPhase::FinWait && self.linger.is_some_and(|at| at <= now) {
            debug!(flow = self.flow_id, "close linger elapsed");
            self.finish();
        }
    }

    /// Earliest instant [`Connection::handle_timeout`] has work to do.
    pub fn poll_timeout(&self) -> Option<Instant> {
        if self.phase.is_closed() {
            return None;
        }
        let mut deadlines = vec![
            self.handshake.map(|hs| hs.deadline),
            self.persist.map(|p| p.deadline),
            self.linger,
        ];
        if self.phase.is_synchronized() {
            deadlines.push(self.retx.next_deadline());
            deadlines.push(self.manager.next_timeout());
        }
        deadlines.into_iter().flatten().min()
    }

    /// Next segment to send.
    ///
    /// Control segments go first, then data within the peer's window, then a
    /// pure acknowledgment if one is owed.
    pub fn poll_transmit(&mut self, now: Instant) -> Option<Transmit> {
        if let Some(t) = self.control.pop_front() {
            return Some(self.sent(t, false));
        }
        if !self.phase.is_synchronized() {
            return None;
        }
        if let Some(t) = self.next_data(now) {
            return Some(t);
        }
        if self.window_blocked() {
            self.arm_persist(now);
        }
        self.pure_ack().map(|t| self.sent(t, false))
    }

    fn sent(&mut self, t: Transmit, retransmission: bool) -> Transmit {
        self.manager.on_sent(t.segment.header.path_id, retransmission);
        self.counters.segments_sent += 1;
        t
    }

    fn next_data(&mut self, now: Instant) -> Option<Transmit> {
        let (seq, retransmission) = {
            let unit = self.retx.peek_ready()?;
            (unit.seq, unit.is_retransmission())
        };
        if !retransmission && !self.window_admits(seq) {
            self.arm_persist(now);
            return None;
        }
        let path_id = self.manager.next_path()?;
        let path = self.manager.path(path_id)?.clone();
        let rto = self.manager.rto(path_id)?;
        let unit = self.retx.mark_sent(path_id, now, rto)?;
        let payload = unit.payload.clone();
        let flags = if unit.fin {
            SspFlags::ACK | SspFlags::FIN
        } else {
            SspFlags::ACK
        };
        if retransmission {
            self.counters.retransmissions += 1;
            trace!(seq, path = %path_id, "retransmitting");
        } else {
            self.counters.bytes_sent += payload.len() as u64;
        }
        self.ack_pending = None;
        self.window_update = false;
        let segment = self.segment(flags, seq, path_id, payload);
        let t = Transmit {
            path,
            segment,
            extensions: Vec::new(),
        };
        Some(self.sent(t, retransmission))
    }

    fn pure_ack(&mut self) -> Option<Transmit> {
        if self.ack_pending.is_none() && !self.window_update {
            return None;
        }
        let pending = self
            .ack_pending
            .take()
            .filter(|id| self.manager.contains(*id));
        self.window_update = false;
        let path_id = pending.or_else(|| self.manager.next_path())?;
        let path = self.manager.path(path_id)?.clone();
        let segment = self.segment(SspFlags::ACK, self.snd_nxt, path_id, Vec::new());
        Some(Transmit {
            path,
            segment,
            extensions: Vec::new(),
        })
    }

    fn segment(&mut self, flags: SspFlags, seq: u64, path_id: PathId, payload: Vec<u8>) -> SspSegment {
        let acking = flags.contains(SspFlags::ACK);
        let window = self.advertised_window();
        self.last_window = window;
        SspSegment {
            header: SspHeader {
                src_port: self.local.port,
                dst_port: self.remote.port,
                flags,
                flow_id: self.flow_id,
                seq,
                ack: if acking { self.reorder.next_expected() } else { 0 },
                path_id,
                window,
            },
            sacks: if acking {
                self.reorder.sack_blocks(MAX_SACK_BLOCKS)
            } else {
                Vec::new()
            },
            payload,
        }
    }

    /// Receive window in bytes: free reorder slots less what the application
    /// has not read yet.
    fn advertised_window(&self) -> u32 {
        let room = self
            .reorder
            .free_slots()
            .saturating_mul(self.peer_mss.max(1))
            .saturating_sub(self.recv_queue.len());
        u32::try_from(room).unwrap_or(u32::MAX)
    }

    fn maybe_window_update(&mut self) {
        let threshold = u32::try_from(self.peer_mss.max(1)).unwrap_or(u32::MAX);
        if self.phase.is_synchronized()
            && self.last_window < threshold
            && self.advertised_window() >= threshold
        {
            self.window_update = true;
        }
    }

    /// First sequence number past the peer's advertised window.
    fn window_end(&self) -> u64 {
        let units = u64::from(self.peer_window) / self.local_mss.max(1) as u64;
        self.snd_una.saturating_add(units)
    }

    fn window_admits(&self, seq: u64) -> bool {
        seq < self.window_end()
    }

    /// Units the window still has room for beyond those already assigned.
    fn window_room(&self) -> u64 {
        self.window_end().saturating_sub(self.snd_nxt)
    }

    /// Nothing can move until the peer reports a larger window: either the
    /// next queued unit lies outside it, or the application is waiting on it
    /// with nothing in flight whose ack would carry an update.
    fn window_blocked(&self) -> bool {
        let unit_blocked = self
            .retx
            .peek_ready()
            .is_some_and(|u| !u.is_retransmission() && !self.window_admits(u.seq));
        unit_blocked || (self.send_blocked && self.window_room() == 0 && self.retx.is_empty())
    }

    fn unit_size(&self, path: &Path) -> usize {
        let overhead = header_overhead(&self.local.addr, &self.remote.addr, path)
            + SSP_HEADER_LEN
            + MAX_SACK_BLOCKS * SACK_BLOCK_LEN;
        let room = usize::from(path.mtu())
            .saturating_sub(overhead)
            .max(MIN_UNIT_SIZE);
        self.config
            .max_unit_size
            .map_or(room, |cap| room.min(cap))
    }

    fn active_unit_size(&self) -> usize {
        self.manager
            .active()
            .iter()
            .filter_map(|id| self.manager.path(*id))
            .map(|p| self.unit_size(p))
            .min()
            .unwrap_or(MIN_UNIT_SIZE)
    }

    /// Paths added after the handshake must carry a full unit.
    fn fits(&self, path: &Path) -> bool {
        self.local_mss == 0 || self.unit_size(path) >= self.local_mss
    }

    fn apply_handshake_info(&mut self, payload: &[u8]) {
        match HandshakeInfo::decode(payload) {
            Ok(info) => {
                self.peer_mss = if info.mss > 0 {
                    usize::from(info.mss)
                } else {
                    self.local_mss
                };
                self.peer_paths = info.path_ids;
            }
            Err(err) => {
                debug!(%err, "handshake without parameters");
                self.peer_mss = self.local_mss;
            }
        }
    }

    fn send_handshake(&mut self, now: Instant) {
        let (attempts, timeout, reply_path) = match self.handshake {
            Some(hs) => (hs.attempts, hs.timeout, hs.reply_path),
            None => (0, self.config.handshake_timeout, None),
        };
        let path_id = reply_path
            .filter(|id| self.manager.contains(*id))
            .or_else(|| {
                // Retries rotate over the candidates.
                let active = self.manager.active();
                (!active.is_empty()).then(|| active[attempts as usize % active.len()])
            });
        if let Some(path_id) = path_id {
            self.queue_handshake_segment(path_id);
        }
        self.handshake = Some(Handshake {
            attempts: attempts + 1,
            timeout,
            deadline: now + timeout,
            sent_at: now,
            reply_path,
        });
    }

    fn queue_handshake_segment(&mut self, path_id: PathId) {
        let Some(path) = self.manager.path(path_id).cloned() else {
            return;
        };
        let info = HandshakeInfo {
            mss: u16::try_from(self.local_mss).unwrap_or(u16::MAX),
            path_ids: self.manager.active().to_vec(),
        };
        let (flags, extensions) = match self.role {
            Role::Initiator => (SspFlags::SYN, self.reservation_extension()),
            Role::Responder => (SspFlags::SYN | SspFlags::ACK, Vec::new()),
        };
        let segment = self.segment(flags, self.isn, path_id, info.encode());
        self.control.push_back(Transmit {
            path,
            segment,
            extensions,
        });
    }

    fn reservation_extension(&self) -> Vec<ExtensionBuf> {
        let Some(reservation) = &self.config.reservation else {
            return Vec::new();
        };
        match reservation.encode() {
            Ok(ext) => vec![ext],
            Err(err) => {
                warn!(%err, "reservation not encodable");
                Vec::new()
            }
        }
    }

    fn on_syn_ack(&mut self, now: Instant, segment: &SspSegment, path_id: PathId) {
        let h = &segment.header;
        let sample = self
            .handshake
            .filter(|hs| hs.attempts == 1)
            .map(|hs| now.saturating_duration_since(hs.sent_at));
        self.apply_handshake_info(&segment.payload);
        self.reorder.reset(h.seq.saturating_add(1));
        self.peer_window = h.window;
        let t = self.manager.on_ack(path_id, now, sample);
        self.establish(now);
        self.apply_transition(t);
        self.ack_pending = Some(path_id);
    }

    fn establish(&mut self, now: Instant) {
        self.handshake = None;
        self.phase = ConnectionPhase::Established;
        self.manager.start_probing(now);
        info!(
            flow = self.flow_id,
            remote = %self.remote,
            role = ?self.role,
            paths = self.manager.active().len(),
            "connection established"
        );
    }

    fn process_ack(&mut self, now: Instant, segment: &SspSegment) {
        let h = &segment.header;
        let mut acked = Vec::new();
        if h.ack > self.snd_una && h.ack <= self.snd_nxt {
            acked.extend(self.retx.on_cumulative_ack(h.ack, now));
            self.snd_una = h.ack;
        }
        for block in &segment.sacks {
            if block.start >= self.snd_una && block.end <= self.snd_nxt {
                acked.extend(self.retx.on_sack(*block, now));
            }
        }
        // Reordered acks below the current point carry a stale window.
        if h.ack >= self.snd_una {
            self.peer_window = h.window;
            if h.window > 0 {
                self.persist = None;
            }
            if self.window_room() > 0 {
                self.send_blocked = false;
            }
        }
        self.on_units_acked(now, acked);
    }

    fn on_units_acked(&mut self, now: Instant, acked: Vec<Acked>) {
        for a in acked {
            let t = self.manager.on_ack(a.path, now, a.sample);
            self.apply_transition(t);
        }
    }

    fn process_probe(&mut self, now: Instant, path_id: PathId, extensions: &[ExtensionBuf]) {
        let Some(probe) = extensions.iter().find_map(PathProbe::decode_buf) else {
            return;
        };
        if probe.reply {
            let t = self.manager.on_probe_reply(path_id, probe, now);
            self.apply_transition(t);
        } else {
            self.queue_probe(path_id, probe.to_reply());
        }
    }

    fn queue_probe(&mut self, path_id: PathId, probe: PathProbe) {
        let Some(path) = self.manager.path(path_id).cloned() else {
            return;
        };
        let ext = match probe.encode() {
            Ok(ext) => ext,
            Err(err) => {
                warn!(%err, "probe not encodable");
                return;
            }
        };
        let segment = self.segment(
            SspFlags::ACK | SspFlags::PROBE,
            self.snd_nxt,
            path_id,
            Vec::new(),
        );
        self.control.push_back(Transmit {
            path,
            segment,
            extensions: vec![ext],
        });
    }

    fn process_data(&mut self, segment: &SspSegment, path_id: PathId) {
        let h = &segment.header;
        self.ack_pending = Some(path_id);
        match self.reorder.insert(h.seq, segment.payload.clone()) {
            Ok(InsertOutcome::Accepted) => {}
            Ok(InsertOutcome::Duplicate) => self.counters.duplicates += 1,
            Err(err) => {
                self.counters.out_of_window += 1;
                debug!(%err, "unit dropped");
                return;
            }
        }
        if h.flags.contains(SspFlags::FIN) && self.peer_fin.is_none() {
            self.peer_fin = Some(h.seq);
        }
        for (seq, data) in self.reorder.drain() {
            self.counters.bytes_received += data.len() as u64;
            if !self.app_closed {
                self.recv_queue.extend(data);
            }
            if self.peer_fin == Some(seq) {
                self.on_peer_fin();
            }
        }
    }

    fn on_peer_fin(&mut self) {
        self.eof = true;
        if self.phase == ConnectionPhase::Established {
            self.phase = ConnectionPhase::CloseWait;
            debug!(flow = self.flow_id, "peer finished sending");
        }
    }

    fn check_close_progress(&mut self, now: Instant) {
        let fin_acked = self.fin_seq.is_some_and(|seq| self.snd_una > seq);
        match self.phase {
            ConnectionPhase::FinWait if fin_acked => {
                if self.eof {
                    self.finish();
                } else if self.linger.is_none() {
                    self.linger = Some(now + self.config.close_linger);
                }
            }
            ConnectionPhase::LastAck if fin_acked => self.finish(),
            _ => {}
        }
    }

    fn apply_transition(&mut self, transition: Option<Transition>) {
        let Some(t) = transition else {
            return;
        };
        match t.to {
            Liveness::Down => {
                let moved = self.retx.requeue_path(t.path);
                if moved > 0 {
                    self.counters.failovers += 1;
                    info!(
                        flow = self.flow_id,
                        path = %t.path,
                        units = moved,
                        "path down, failing over"
                    );
                }
            }
            Liveness::Expired => debug!(flow = self.flow_id, path = %t.path, "path expired"),
            _ => {}
        }
    }

    fn arm_persist(&mut self, now: Instant) {
        if self.persist.is_some() {
            return;
        }
        let interval = self
            .manager
            .active()
            .first()
            .and_then(|id| self.manager.rto(*id))
            .unwrap_or(self.config.min_rto);
        self.persist = Some(Persist {
            interval,
            deadline: now + interval,
        });
    }

    fn poll_persist(&mut self, now: Instant) {
        let Some(mut persist) = self.persist else {
            return;
        };
        if !self.window_blocked() {
            self.persist = None;
            return;
        }
        if persist.deadline > now {
            return;
        }
        if let Some(path_id) = self.manager.next_path() {
            if let Some(path) = self.manager.path(path_id).cloned() {
                trace!(path = %path_id, "probing zero window");
                let segment = self.segment(
                    SspFlags::ACK | SspFlags::WINDOW_PROBE,
                    self.snd_nxt,
                    path_id,
                    Vec::new(),
                );
                self.control.push_back(Transmit {
                    path,
                    segment,
                    extensions: Vec::new(),
                });
            }
        }
        persist.interval = persist
            .interval
            .saturating_mul(RETRANSMIT_BACKOFF)
            .min(self.config.max_rto);
        persist.deadline = now + persist.interval;
        self.persist = Some(persist);
    }

    /// Orderly end: both FINs exchanged, or the linger ran out.
    fn finish(&mut self) {
        // The ack for the peer FIN may still be owed.
        if let Some(t) = self.pure_ack() {
            self.control.push_back(t);
        }
        self.shut_down();
        info!(flow = self.flow_id, "connection closed");
    }

    fn terminate(&mut self, err: ConnectionError, notify_peer: bool) {
        if self.phase.is_closed() {
            return;
        }
        if notify_peer {
            self.queue_reset();
        }
        match &err {
            ConnectionError::Closed => debug!(flow = self.flow_id, "connection aborted"),
            _ => warn!(flow = self.flow_id, error = %err, "connection failed"),
        }
        self.error = Some(err);
        self.shut_down();
    }

    fn queue_reset(&mut self) {
        let Some(path_id) = self.manager.next_path() else {
            return;
        };
        let Some(path) = self.manager.path(path_id).cloned() else {
            return;
        };
        let segment = self.segment(SspFlags::RST, self.snd_nxt, path_id, Vec::new());
        self.control.push_back(Transmit {
            path,
            segment,
            extensions: Vec::new(),
        });
    }

    fn shut_down(&mut self) {
        self.phase = ConnectionPhase::Closed;
        self.retx.clear();
        self.manager.stop_probing();
        self.handshake = None;
        self.persist = None;
        self.linger = None;
        self.ack_pending = None;
        self.window_update = false;
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;
    use crate::core::{IsdAs, ScionAddr};
    use crate::path::Hop;
    use crate::stream::SelectionStrategy;

    fn endpoint(as_id: u32, host: &str, port: u16) -> ScionSocketAddr {
        ScionSocketAddr::new(
            ScionAddr::new(IsdAs::new(1, as_id), host.parse().unwrap()),
            port,
        )
    }

    fn client() -> ScionSocketAddr {
        endpoint(10, "10.0.0.1", 40000)
    }

    fn server() -> ScionSocketAddr {
        endpoint(20, "10.0.0.2", 8000)
    }

    fn path(transit: u32) -> Path {
        Path::new(
            vec![
                Hop::new(IsdAs::new(1, 10), 0, transit as u16),
                Hop::new(IsdAs::new(1, transit), 1, 2),
                Hop::new(IsdAs::new(1, 20), 3, 0),
            ],
            1400,
        )
    }

    fn paths() -> Vec<Path> {
        vec![path(11), path(12), path(13)]
    }

    fn deliver(to: &mut Connection, t: &Transmit, now: Instant) {
        to.handle_segment(now, &t.segment, &t.path, &t.extensions);
    }

    /// Move segments both ways until both sides are quiet. Returns what `a`
    /// sent, lost or not.
    fn exchange(
        a: &mut Connection,
        b: &mut Connection,
        now: Instant,
        lost: impl Fn(&Transmit) -> bool,
    ) -> Vec<Transmit> {
        let mut sent = Vec::new();
        loop {
            let mut moved = false;
            while let Some(t) = a.poll_transmit(now) {
                moved = true;
                if !lost(&t) {
                    deliver(b, &t, now);
                }
                sent.push(t);
            }
            while let Some(t) = b.poll_transmit(now) {
                moved = true;
                if !lost(&t) {
                    deliver(a, &t, now);
                }
            }
            if !moved {
                return sent;
            }
        }
    }

    fn open(config: StreamConfig) -> (Connection, Connection, Instant) {
        open_with(config.clone(), config)
    }

    fn open_with(
        initiator: StreamConfig,
        responder: StreamConfig,
    ) -> (Connection, Connection, Instant) {
        let now = Instant::now();
        let mut a = Connection::connect(now, 7, client(), server(), paths(), initiator).unwrap();
        let syn = a.poll_transmit(now).unwrap();
        let mut b = Connection::accept(
            now,
            server(),
            client(),
            &syn.segment,
            &syn.path,
            &syn.extensions,
            responder,
        )
        .unwrap();
        exchange(&mut a, &mut b, now, |_| false);
        assert_eq!(a.phase(), ConnectionPhase::Established);
        assert_eq!(b.phase(), ConnectionPhase::Established);
        (a, b, now)
    }

    fn read_all(conn: &mut Connection) -> Vec<u8> {
        let mut out = Vec::new();
        let mut buf = [0u8; 256];
        while let Ok(Some(n)) = conn.recv(&mut buf) {
            if n == 0 {
                break;
            }
            out.extend_from_slice(&buf[..n]);
        }
        out
    }

    fn data_seqs(sent: &[Transmit]) -> Vec<u64> {
        sent.iter()
            .filter(|t| !t.segment.payload.is_empty() || t.segment.header.flags.contains(SspFlags::FIN))
            .map(|t| t.segment.header.seq)
            .collect()
    }

    #[test]
    fn test_handshake_and_transfer() {
        let (mut a, mut b, now) = open(StreamConfig::default());
        assert_eq!(b.peer_paths().len(), 3);
        assert_eq!(b.role(), Role::Responder);
        assert!(b.stats().paths.iter().all(|p| p.learned));

        assert_eq!(a.send(b"hello over three paths").unwrap(), 22);
        exchange(&mut a, &mut b, now, |_| false);
        assert_eq!(read_all(&mut b), b"hello over three paths");
        assert!(a.is_flushed());
        assert_eq!(a.stats().retransmissions, 0);
        assert_eq!(a.stats().bytes_sent, 22);
        assert_eq!(b.stats().bytes_received, 22);
    }

    #[test]
    fn test_round_robin_spreads_units() {
        let config = StreamConfig::builder().max_unit_size(8).build();
        let (mut a, mut b, now) = open(config);
        a.send(&[7u8; 40]).unwrap();
        let sent = exchange(&mut a, &mut b, now, |_| false);
        let used: HashSet<PathId> = sent
            .iter()
            .filter(|t| !t.segment.payload.is_empty())
            .map(|t| t.segment.header.path_id)
            .collect();
        assert!(used.len() > 1);
        assert_eq!(read_all(&mut b), vec![7u8; 40]);
    }

    #[test]
    fn test_reordered_units_delivered_in_order() {
        let config = StreamConfig::builder().max_unit_size(4).build();
        let (mut a, mut b, now) = open(config);
        a.send(b"aaaabbbbcccc").unwrap();
        let segs: Vec<Transmit> = std::iter::from_fn(|| a.poll_transmit(now)).collect();
        assert_eq!(segs.len(), 3);

        deliver(&mut b, &segs[2], now);
        assert!(read_all(&mut b).is_empty());
        deliver(&mut b, &segs[0], now);
        assert_eq!(read_all(&mut b), b"aaaa");
        deliver(&mut b, &segs[1], now);
        deliver(&mut b, &segs[1], now);
        assert_eq!(read_all(&mut b), b"bbbbcccc");
        assert_eq!(b.stats().duplicates, 1);
    }

    #[test]
    fn test_sack_limits_retransmission_to_lost_unit() {
        let config = StreamConfig::builder().max_unit_size(4).build();
        let (mut a, mut b, mut now) = open(config);
        a.send(b"aaaabbbbcccc").unwrap();
        let first = a.snd_una;
        exchange(&mut a, &mut b, now, |t| {
            !t.segment.payload.is_empty() && t.segment.header.seq == first
        });
        assert_eq!(b.readable_bytes(), 0);

        let mut resent = Vec::new();
        while b.readable_bytes() == 0 {
            now = a.poll_timeout().unwrap();
            a.handle_timeout(now);
            resent.extend(data_seqs(&exchange(&mut a, &mut b, now, |_| false)));
        }
        assert_eq!(resent, vec![first]);
        assert_eq!(read_all(&mut b), b"aaaabbbbcccc");
        assert_eq!(a.stats().retransmissions, 1);
        assert!(a.is_flushed());
    }

    #[test]
    fn test_failover_requeues_before_retransmission_deadline() {
        let config = StreamConfig::builder()
            .strategy(SelectionStrategy::PrimaryStandby)
            .probing(Duration::from_millis(50), 3)
            .rto_bounds(Duration::from_millis(10), Duration::from_secs(60))
            .build();
        let (mut a, mut b, mut now) = open(config);
        let primary = a.manager().active()[0];
        let broken = |t: &Transmit| t.segment.header.path_id == primary;
        let primary_stats = |c: &Connection| {
            c.manager()
                .stats()
                .into_iter()
                .find(|s| s.state.id == primary)
                .unwrap()
        };

        // The standby paths answer their probes; the primary stops working.
        while primary_stats(&a).state.misses < 2 {
            now = a.poll_timeout().unwrap();
            a.handle_timeout(now);
            exchange(&mut a, &mut b, now, &broken);
        }
        assert_eq!(a.manager().active()[0], primary);

        // Send right after the next probe left on the primary.
        let probes_sent = primary_stats(&a).state.counters.sent;
        while primary_stats(&a).state.counters.sent == probes_sent {
            now = a.poll_timeout().unwrap();
            a.handle_timeout(now);
            exchange(&mut a, &mut b, now, &broken);
        }
        now += Duration::from_millis(1);
        a.send(b"must survive").unwrap();
        let sent = exchange(&mut a, &mut b, now, &broken);
        assert_eq!(data_seqs(&sent).len(), 1);
        assert!(a.retx.in_flight_on(primary));
        let unit_deadline = a.retx.next_deadline().unwrap();

        while a.manager().liveness(primary) != Some(Liveness::Down) {
            now = a.poll_timeout().unwrap();
            assert!(now < unit_deadline);
            a.handle_timeout(now);
            exchange(&mut a, &mut b, now, &broken);
        }
        assert_eq!(a.stats().failovers, 1);
        assert_ne!(a.manager().active()[0], primary);
        assert_eq!(read_all(&mut b), b"must survive");
        assert!(a.is_flushed());
    }

    #[test]
    fn test_connect_without_admissible_path() {
        let now = Instant::now();
        let empty = Connection::connect(now, 1, client(), server(), Vec::new(), StreamConfig::default());
        assert!(matches!(empty, Err(ConnectionError::NoPathAvailable)));

        let mut constraints = PathConstraints::default();
        constraints.isd_as_blacklist.insert(IsdAs::new(1, 12));
        constraints.isd_as_blacklist.insert(IsdAs::new(1, 11));
        constraints.isd_as_blacklist.insert(IsdAs::new(1, 13));
        let config = StreamConfig::builder().constraints(constraints).build();
        let filtered = Connection::connect(now, 1, client(), server(), paths(), config);
        assert!(matches!(filtered, Err(ConnectionError::NoPathAvailable)));
    }

    #[test]
    fn test_handshake_timeout() {
        let config = StreamConfig::builder()
            .handshake(Duration::from_millis(100), 2)
            .build();
        let mut now = Instant::now();
        let mut a = Connection::connect(now, 1, client(), server(), paths(), config).unwrap();
        let mut syn_paths = Vec::new();
        while let Some(deadline) = a.poll_timeout() {
            while let Some(t) = a.poll_transmit(now) {
                assert!(t.segment.header.flags.contains(SspFlags::SYN));
                syn_paths.push(t.segment.header.path_id);
            }
            now = deadline;
            a.handle_timeout(now);
        }
        assert_eq!(
            a.error(),
            Some(&ConnectionError::HandshakeTimeout { attempts: 3 })
        );
        assert_eq!(syn_paths.len(), 3);
        assert_eq!(syn_paths.iter().collect::<HashSet<_>>().len(), 3);
        assert!(matches!(
            a.send(b"x"),
            Err(ConnectionError::HandshakeTimeout { .. })
        ));
    }

    #[test]
    fn test_lost_syn_ack_recovered() {
        let now = Instant::now();
        let config = StreamConfig::default();
        let mut a = Connection::connect(now, 9, client(), server(), paths(), config.clone()).unwrap();
        let syn = a.poll_transmit(now).unwrap();
        let mut b = Connection::accept(
            now,
            server(),
            client(),
            &syn.segment,
            &syn.path,
            &syn.extensions,
            config,
        )
        .unwrap();
        assert!(b.poll_transmit(now).is_some());

        let later = a.poll_timeout().unwrap();
        a.handle_timeout(later);
        exchange(&mut a, &mut b, later, |_| false);
        assert_eq!(a.phase(), ConnectionPhase::Established);
        assert_eq!(b.phase(), ConnectionPhase::Established);
    }

    #[test]
    fn test_reservation_carried_on_syn() {
        let reservation = PathReservation {
            priority: 3,
            bandwidth_kbps: 1000,
            duration: Duration::from_secs(60),
        };
        let config = StreamConfig::builder().reservation(reservation).build();
        let (a, b, _) = open(config);
        assert_eq!(b.peer_reservation(), Some(&reservation));
        assert_eq!(a.peer_reservation(), None);
    }

    #[test]
    fn test_graceful_close() {
        let (mut a, mut b, now) = open(StreamConfig::default());
        a.send(b"bye").unwrap();
        a.close(true);
        assert_eq!(a.phase(), ConnectionPhase::FinWait);
        assert_eq!(a.send(b"more"), Err(ConnectionError::Closed));

        exchange(&mut a, &mut b, now, |_| false);
        assert_eq!(b.phase(), ConnectionPhase::CloseWait);
        assert_eq!(read_all(&mut b), b"bye");
        let mut buf = [0u8; 8];
        assert_eq!(b.recv(&mut buf), Ok(Some(0)));

        // Half-closed: the other direction still works.
        b.send(b"ok").unwrap();
        b.close(true);
        assert_eq!(b.phase(), ConnectionPhase::LastAck);
        exchange(&mut a, &mut b, now, |_| false);

        assert_eq!(a.phase(), ConnectionPhase::Closed);
        assert_eq!(b.phase(), ConnectionPhase::Closed);
        assert_eq!(a.error(), None);
        assert_eq!(b.error(), None);
        assert_eq!(a.poll_timeout(), None);
        assert_eq!(b.recv(&mut buf), Err(ConnectionError::Closed));
    }

    #[test]
    fn test_close_linger_without_peer_fin() {
        let config = StreamConfig::builder()
            .close_linger(Duration::from_millis(500))
            .build();
        let (mut a, mut b, mut now) = open(config);
        a.close(true);
        exchange(&mut a, &mut b, now, |_| false);
        assert_eq!(a.phase(), ConnectionPhase::FinWait);
        assert_eq!(b.phase(), ConnectionPhase::CloseWait);

        while !a.is_closed() {
            now = a.poll_timeout().unwrap();
            a.handle_timeout(now);
            exchange(&mut a, &mut b, now, |_| false);
        }
        assert_eq!(a.error(), None);
    }

    #[test]
    fn test_abrupt_close_resets_peer() {
        let (mut a, mut b, now) = open(StreamConfig::default());
        a.close(false);
        assert_eq!(a.error(), Some(&ConnectionError::Closed));
        let sent = exchange(&mut a, &mut b, now, |_| false);
        assert!(sent[0].segment.header.flags.contains(SspFlags::RST));
        assert_eq!(b.error(), Some(&ConnectionError::Reset));
        let mut buf = [0u8; 4];
        assert_eq!(b.recv(&mut buf), Err(ConnectionError::Reset));
    }

    #[test]
    fn test_retransmission_exhausted_resets() {
        let config = StreamConfig::builder()
            .max_retransmits(2)
            .probing(Duration::from_secs(60), 10)
            .build();
        let (mut a, _b, mut now) = open(config);
        a.send(b"lost").unwrap();
        let mut last = None;
        while a.error().is_none() {
            now = a.poll_timeout().unwrap();
            a.handle_timeout(now);
            while let Some(t) = a.poll_transmit(now) {
                last = Some(t);
            }
        }
        assert!(matches!(
            a.error(),
            Some(ConnectionError::RetransmissionExhausted { retries: 3, .. })
        ));
        assert!(last.unwrap().segment.header.flags.contains(SspFlags::RST));
    }

    #[test]
    fn test_zero_window_probe_reopens() {
        let config = StreamConfig::builder()
            .recv_window(2)
            .max_unit_size(4)
            .build();
        let (mut a, mut b, mut now) = open(config);
        assert_eq!(a.send(b"aaaabbbbcccc").unwrap(), 8);
        exchange(&mut a, &mut b, now, |_| false);
        assert_eq!(a.peer_window, 0);
        assert!(a.is_flushed());

        // Nothing is in flight, so only a window probe can learn the update.
        assert_eq!(a.send(b"cccc").unwrap(), 0);
        assert!(a.poll_transmit(now).is_none());
        assert!(a.persist.is_some());

        let mut window_probes = 0;
        while window_probes == 0 {
            now = a.poll_timeout().unwrap();
            a.handle_timeout(now);
            window_probes += exchange(&mut a, &mut b, now, |_| false)
                .iter()
                .filter(|t| t.segment.header.flags.contains(SspFlags::WINDOW_PROBE))
                .count();
        }
        assert_eq!(read_all(&mut b), b"aaaabbbb");

        // Reading reopens the window and the update lets the data in.
        exchange(&mut a, &mut b, now, |_| false);
        assert_eq!(a.peer_window, 8);
        assert_eq!(a.send(b"cccc").unwrap(), 4);
        exchange(&mut a, &mut b, now, |_| false);
        assert_eq!(read_all(&mut b), b"cccc");
        assert!(a.is_flushed());
        assert!(a.persist.is_none());
    }

    #[test]
    fn test_send_stops_at_advertised_window() {
        let (mut a, mut b, now) = open_with(
            StreamConfig::builder().recv_window(16).max_unit_size(4).build(),
            StreamConfig::builder().recv_window(2).max_unit_size(4).build(),
        );
        assert_eq!(a.peer_window, 8);
        let data = [7u8; 64];

        // Two units fit the peer's window; the larger local queue does not matter.
        assert_eq!(a.send(&data).unwrap(), 8);
        assert_eq!(a.send_capacity(), 0);
        assert_eq!(a.send(&data[8..]).unwrap(), 0);
        assert_eq!(a.retx.len(), 2);

        // Acked but unread: the window stays closed.
        exchange(&mut a, &mut b, now, |_| false);
        assert!(a.is_flushed());
        assert_eq!(a.send(&data[8..]).unwrap(), 0);

        assert_eq!(read_all(&mut b).len(), 8);
        exchange(&mut a, &mut b, now, |_| false);
        assert_eq!(a.send_capacity(), 2);
        assert_eq!(a.send(&data[8..]).unwrap(), 8);
        assert_eq!(a.retx.len(), 2);
    }

    #[test]
    fn test_retransmission_backs_off_once_per_timeout() {
        let config = StreamConfig::builder()
            .strategy(SelectionStrategy::PrimaryStandby)
            .probing(Duration::from_secs(60), 10)
            .build();
        let (mut a, _b, now) = open(config);
        a.send(b"lost").unwrap();
        let first = a.poll_transmit(now).unwrap();
        let path = first.segment.header.path_id;
        let rto = a.manager().rto(path).unwrap();
        assert_eq!(a.poll_timeout(), Some(now + rto));

        let t1 = now + rto;
        a.handle_timeout(t1);
        let again = a.poll_transmit(t1).unwrap();
        assert_eq!(again.segment.header.path_id, path);
        assert_eq!(again.segment.header.seq, first.segment.header.seq);
        assert_eq!(a.poll_timeout(), Some(t1 + rto * 2));
    }

    #[test]
    fn test_final_ack_must_acknowledge_syn_ack() {
        let now = Instant::now();
        let config = StreamConfig::default();
        let mut a = Connection::connect(now, 7, client(), server(), paths(), config.clone()).unwrap();
        let syn = a.poll_transmit(now).unwrap();
        let mut b = Connection::accept(
            now,
            server(),
            client(),
            &syn.segment,
            &syn.path,
            &syn.extensions,
            config,
        )
        .unwrap();
        let syn_ack = b.poll_transmit(now).unwrap();
        deliver(&mut a, &syn_ack, now);
        let final_ack = a.poll_transmit(now).unwrap();
        assert_eq!(final_ack.segment.header.ack, b.isn + 1);

        let mut wrong = final_ack.clone();
        wrong.segment.header.ack = b.isn + 5;
        deliver(&mut b, &wrong, now);
        assert_eq!(b.phase(), ConnectionPhase::SynRcvd);

        deliver(&mut b, &final_ack, now);
        assert_eq!(b.phase(), ConnectionPhase::Established);
    }
}
