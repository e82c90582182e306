//! Receive-side reordering of data units.
//!
//! Units arrive over several paths and therefore out of order. The buffer
//! holds everything above the next expected sequence number and releases the
//! contiguous prefix.

use std::collections::BTreeMap;

use thiserror::Error;

use crate::packet::SackBlock;

/// Reorder buffer errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ReorderError {
    /// The unit lies beyond the receive window.
    #[error("reorder buffer full: sequence {seq} beyond window end {window_end}")]
    BufferFull {
        /// Rejected sequence number.
        seq: u64,
        /// First sequence number outside the window.
        window_end: u64,
    },
}

/// Result of an insert that was not rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    /// Stored for delivery.
    Accepted,
    /// Already delivered or already buffered; nothing changed.
    Duplicate,
}

/// Bounded reorder buffer keyed by sequence number.
#[derive(Debug, Clone)]
pub struct ReorderBuffer {
    next_expected: u64,
    capacity: usize,
    entries: BTreeMap<u64, Vec<u8>>,
    buffered_bytes: usize,
}

impl ReorderBuffer {
    /// Buffer accepting `capacity` units starting at `next_expected`.
    pub fn new(next_expected: u64, capacity: usize) -> Self {
        Self {
            next_expected,
            capacity: capacity.max(1),
            entries: BTreeMap::new(),
            buffered_bytes: 0,
        }
    }

    /// Next sequence number to be delivered.
    pub fn next_expected(&self) -> u64 {
        self.next_expected
    }

    /// Move the delivery point. Only valid while empty (handshake).
    pub fn reset(&mut self, next_expected: u64) {
        self.entries.clear();
        self.buffered_bytes = 0;
        self.next_expected = next_expected;
    }

    /// Window size in units.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// First sequence number outside the window.
    pub fn window_end(&self) -> u64 {
        self.next_expected.saturating_add(self.capacity as u64)
    }

    /// Units held.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no unit is held.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Bytes held.
    pub fn buffered_bytes(&self) -> usize {
        self.buffered_bytes
    }

    /// Free slots in the window.
    pub fn free_slots(&self) -> usize {
        self.capacity.saturating_sub(self.entries.len())
    }

    /// Store a unit.
    ///
    /// Units below the delivery point and units already held are duplicates
    /// and leave the buffer unchanged.
    pub fn insert(&mut self, seq: u64, data: Vec<u8>) -> Result<InsertOutcome, ReorderError> {
        if seq < self.next_expected || self.entries.contains_key(&seq) {
            return Ok(InsertOutcome::Duplicate);
        }
        let window_end = self.window_end();
        if seq >= window_end {
            return Err(ReorderError::BufferFull { seq, window_end });
        }
        self.buffered_bytes += data.len();
        self.entries.insert(seq, data);
        Ok(InsertOutcome::Accepted)
    }

    /// Remove and return the contiguous prefix starting at the delivery
    /// point, in order.
    pub fn drain(&mut self) -> Vec<(u64, Vec<u8>)> {
        let mut out = Vec::new();
        while let Some(data) = self.entries.remove(&self.next_expected) {
            self.buffered_bytes -= data.len();
            out.push((self.next_expected, data));
            self.next_expected += 1;
        }
        out
    }

    /// Ranges held above the delivery point, lowest first, at most `max`.
    pub fn sack_blocks(&self, max: usize) -> Vec<SackBlock> {
        let mut blocks: Vec<SackBlock> = Vec::new();
        for &seq in self.entries.keys() {
            match blocks.last_mut() {
                Some(last) if last.end == seq => last.end = seq + 1,
                _ => {
                    if blocks.len() == max {
                        break;
                    }
                    blocks.push(SackBlock {
                        start: seq,
                        end: seq + 1,
                    });
                }
            }
        }
        blocks
    }
}
