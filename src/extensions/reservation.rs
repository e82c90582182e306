//! End-to-end path reservation extension.
//!
//! Requests bandwidth with a priority for the paths a connection uses. The
//! stack carries it on the opening handshake and records the peer's request;
//! admission is up to the network.

use std::time::Duration;

use super::codec::{ExtClass, Extension, ExtensionBuf, ExtensionError};
use crate::core::EXT_PATH_RESERVATION;

const PAYLOAD_LEN: usize = 13;

/// Reservation metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PathReservation {
    /// Relative priority, higher first.
    pub priority: u8,
    /// Requested bandwidth in kbit/s.
    pub bandwidth_kbps: u32,
    /// How long the reservation should last.
    pub duration: Duration,
}

impl PathReservation {
    /// Encode as a two-line extension.
    pub fn encode(&self) -> Result<ExtensionBuf, ExtensionError> {
        let secs = u32::try_from(self.duration.as_secs()).unwrap_or(u32::MAX);
        let mut payload = Vec::with_capacity(PAYLOAD_LEN);
        payload.push(self.priority);
        payload.extend_from_slice(&self.bandwidth_kbps.to_be_bytes());
        payload.extend_from_slice(&secs.to_be_bytes());
        payload.extend_from_slice(&[0u8; 4]);
        ExtensionBuf::new(ExtClass::EndToEnd, EXT_PATH_RESERVATION, payload)
    }

    /// Decode from a parsed extension.
    pub fn decode(ext: &Extension<'_>) -> Option<Self> {
        if !ext.is(ExtClass::EndToEnd, EXT_PATH_RESERVATION) {
            return None;
        }
        Self::from_payload(ext.payload())
    }

    /// Decode from an owned extension.
    pub fn decode_buf(ext: &ExtensionBuf) -> Option<Self> {
        if !ext.is(ExtClass::EndToEnd, EXT_PATH_RESERVATION) {
            return None;
        }
        Self::from_payload(ext.payload())
    }

    fn from_payload(p: &[u8]) -> Option<Self> {
        let p = p.get(..9)?;
        Some(Self {
            priority: p[0],
            bandwidth_kbps: u32::from_be_bytes([p[1], p[2], p[3], p[4]]),
            duration: Duration::from_secs(u64::from(u32::from_be_bytes([p[5], p[6], p[7], p[8]]))),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reservation_is_two_lines() {
        let res = PathReservation {
            priority: 5,
            bandwidth_kbps: 1000,
            duration: Duration::from_secs(60),
        };
        let ext = res.encode().unwrap();
        assert_eq!(ext.lines(), 2);
        assert_eq!(hex::encode(ext.payload()), "05000003e80000003c00000000");
        assert_eq!(PathReservation::decode_buf(&ext), Some(res));
    }
}
