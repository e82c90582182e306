//! Hop-by-hop traceroute extension.
//!
//! Payload layout after the sub-header:
//!
//! ```text
//! +0  hop count (1 byte)
//! +1  reserved (4 bytes)
//! +5  hop records, 8 bytes each: ISD-AS (4) | interface id (2) | timestamp (2)
//! ```
//!
//! The sender reserves room for a fixed number of records; every forwarding
//! point appends one while room remains.

use super::codec::{ExtClass, Extension, ExtensionBuf, ExtensionError};
use crate::core::{EXT_SUBHEADER_LEN, EXT_TRACEROUTE, IsdAs, TRACEROUTE_HOP_LEN};

const HOPS_OFFSET: usize = 5;

/// One recorded hop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TracerouteHop {
    /// AS that recorded the hop.
    pub isd_as: IsdAs,
    /// Interface the packet left through.
    pub ifid: u16,
    /// Forwarding-point timestamp, milliseconds modulo 2^16.
    pub timestamp: u16,
}

impl TracerouteHop {
    fn to_bytes(self) -> [u8; TRACEROUTE_HOP_LEN] {
        let mut out = [0u8; TRACEROUTE_HOP_LEN];
        out[0..4].copy_from_slice(&self.isd_as.to_bytes());
        out[4..6].copy_from_slice(&self.ifid.to_be_bytes());
        out[6..8].copy_from_slice(&self.timestamp.to_be_bytes());
        out
    }

    fn from_bytes(b: &[u8]) -> Self {
        Self {
            isd_as: IsdAs::from_bytes([b[0], b[1], b[2], b[3]]),
            ifid: u16::from_be_bytes([b[4], b[5]]),
            timestamp: u16::from_be_bytes([b[6], b[7]]),
        }
    }
}

/// Typed view of a traceroute extension.
pub struct Traceroute;

impl Traceroute {
    /// An empty traceroute with room for `capacity` hops.
    pub fn with_capacity(capacity: usize) -> Result<ExtensionBuf, ExtensionError> {
        let payload = vec![0u8; HOPS_OFFSET + capacity * TRACEROUTE_HOP_LEN];
        ExtensionBuf::new(ExtClass::HopByHop, EXT_TRACEROUTE, payload)
    }

    /// Recorded hops, or `None` when the payload is not a traceroute.
    pub fn hops(ext: &Extension<'_>) -> Option<Vec<TracerouteHop>> {
        if !ext.is(ExtClass::HopByHop, EXT_TRACEROUTE) {
            return None;
        }
        Self::decode(ext.payload())
    }

    fn decode(payload: &[u8]) -> Option<Vec<TracerouteHop>> {
        let count = usize::from(*payload.first()?);
        let records = payload.get(HOPS_OFFSET..)?;
        if count * TRACEROUTE_HOP_LEN > records.len() {
            return None;
        }
        Some(
            records
                .chunks_exact(TRACEROUTE_HOP_LEN)
                .take(count)
                .map(TracerouteHop::from_bytes)
                .collect(),
        )
    }

    /// Append a hop to the traceroute sub-header starting at `subheader` in a
    /// packet buffer. Returns `false` when no room is left.
    pub fn append(subheader: &mut [u8], hop: TracerouteHop) -> bool {
        let Some(payload) = subheader.get_mut(EXT_SUBHEADER_LEN..) else {
            return false;
        };
        let Some(&count) = payload.first() else {
            return false;
        };
        let start = HOPS_OFFSET + usize::from(count) * TRACEROUTE_HOP_LEN;
        let Some(slot) = payload.get_mut(start..start + TRACEROUTE_HOP_LEN) else {
            return false;
        };
        slot.copy_from_slice(&hop.to_bytes());
        payload[0] = count + 1;
        true
    }
}
