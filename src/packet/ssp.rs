//! SSP segment format.
//!
//! Wire format (44-byte header):
//! ```text
//! +0   Source port (2)       +2  Destination port (2)
//! +4   Flags (1)             +5  SACK block count (1)    +6 Reserved (2)
//! +8   Flow id (8)
//! +16  Sequence number (8)
//! +24  Cumulative ack: next expected sequence number (8)
//! +32  Path id the segment was sent on (8)
//! +40  Receive window in bytes (4)
//! +44  SACK blocks, 16 bytes each: start (8) | end, exclusive (8)
//!      Payload
//! ```

use std::ops::BitOr;

use super::PacketError;
use crate::path::PathId;

/// Segment header size.
pub const SSP_HEADER_LEN: usize = 44;

/// SACK block size.
pub const SACK_BLOCK_LEN: usize = 16;

/// Segment flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct SspFlags(u8);

impl SspFlags {
    /// No flags set.
    pub const NONE: Self = Self(0);
    /// Opens a connection.
    pub const SYN: Self = Self(0x01);
    /// The ack field is valid.
    pub const ACK: Self = Self(0x02);
    /// Last unit of the sender's stream.
    pub const FIN: Self = Self(0x04);
    /// Aborts the connection.
    pub const RST: Self = Self(0x08);
    /// Carries a path probe extension.
    pub const PROBE: Self = Self(0x10);
    /// Asks the receiver for a window update.
    pub const WINDOW_PROBE: Self = Self(0x20);

    const RESERVED: u8 = 0xC0;

    /// Create flags from a raw byte.
    pub fn from_byte(byte: u8) -> Self {
        Self(byte)
    }

    /// Raw byte value.
    pub fn as_byte(self) -> u8 {
        self.0
    }

    /// Whether every flag in `other` is set.
    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Reserved bits must be zero.
    pub fn is_valid(self) -> bool {
        self.0 & Self::RESERVED == 0
    }
}

impl BitOr for SspFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// A selectively acknowledged range `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SackBlock {
    /// First sequence number.
    pub start: u64,
    /// One past the last sequence number.
    pub end: u64,
}

/// Fixed part of a segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SspHeader {
    /// Sender port.
    pub src_port: u16,
    /// Receiver port.
    pub dst_port: u16,
    /// Flags.
    pub flags: SspFlags,
    /// Connection identifier chosen by the initiator.
    pub flow_id: u64,
    /// Sequence number of the unit carried (or next to be sent).
    pub seq: u64,
    /// Next sequence number expected from the peer.
    pub ack: u64,
    /// Path the segment was sent on.
    pub path_id: PathId,
    /// Receive window in bytes.
    pub window: u32,
}

/// A full segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SspSegment {
    /// Header.
    pub header: SspHeader,
    /// Selective acknowledgments.
    pub sacks: Vec<SackBlock>,
    /// Data.
    pub payload: Vec<u8>,
}

impl SspSegment {
    /// Encoded length.
    pub fn wire_len(&self) -> usize {
        SSP_HEADER_LEN + self.sacks.len() * SACK_BLOCK_LEN + self.payload.len()
    }

    /// Serialize.
    pub fn encode(&self) -> Vec<u8> {
        let h = &self.header;
        let mut buf = Vec::with_capacity(self.wire_len());
        buf.extend_from_slice(&h.src_port.to_be_bytes());
        buf.extend_from_slice(&h.dst_port.to_be_bytes());
        buf.push(h.flags.as_byte());
        buf.push(self.sacks.len().min(u8::MAX as usize) as u8);
        buf.extend_from_slice(&[0u8; 2]);
        buf.extend_from_slice(&h.flow_id.to_be_bytes());
        buf.extend_from_slice(&h.seq.to_be_bytes());
        buf.extend_from_slice(&h.ack.to_be_bytes());
        buf.extend_from_slice(&h.path_id.as_u64().to_be_bytes());
        buf.extend_from_slice(&h.window.to_be_bytes());
        for sack in self.sacks.iter().take(u8::MAX as usize) {
            buf.extend_from_slice(&sack.start.to_be_bytes());
            buf.extend_from_slice(&sack.end.to_be_bytes());
        }
        buf.extend_from_slice(&self.payload);
        buf
    }

    /// Parse.
    pub fn decode(bytes: &[u8]) -> Result<Self, PacketError> {
        if bytes.len() < SSP_HEADER_LEN {
            return Err(PacketError::TooShort {
                expected: SSP_HEADER_LEN,
                actual: bytes.len(),
            });
        }
        let flags = SspFlags::from_byte(bytes[4]);
        if !flags.is_valid() {
            return Err(PacketError::InvalidFlags(bytes[4]));
        }
        let sack_count = usize::from(bytes[5]);
        let sack_end = SSP_HEADER_LEN + sack_count * SACK_BLOCK_LEN;
        if bytes.len() < sack_end {
            return Err(PacketError::TooShort {
                expected: sack_end,
                actual: bytes.len(),
            });
        }

        let header = SspHeader {
            src_port: be_u16(bytes, 0),
            dst_port: be_u16(bytes, 2),
            flags,
            flow_id: be_u64(bytes, 8),
            seq: be_u64(bytes, 16),
            ack: be_u64(bytes, 24),
            path_id: PathId::from_u64(be_u64(bytes, 32)),
            window: u32::from_be_bytes([bytes[40], bytes[41], bytes[42], bytes[43]]),
        };
        let sacks = bytes[SSP_HEADER_LEN..sack_end]
            .chunks_exact(SACK_BLOCK_LEN)
            .map(|b| SackBlock {
                start: be_u64(b, 0),
                end: be_u64(b, 8),
            })
            .collect();

        Ok(Self {
            header,
            sacks,
            payload: bytes[sack_end..].to_vec(),
        })
    }
}

fn be_u16(b: &[u8], at: usize) -> u16 {
    u16::from_be_bytes([b[at], b[at + 1]])
}

fn be_u64(b: &[u8], at: usize) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&b[at..at + 8]);
    u64::from_be_bytes(raw)
}

/// Handshake parameters carried in SYN and SYN-ACK payloads.
///
/// ```text
/// +0 Max unit size (2) | +2 Path count (1) | +3 Reserved (1) | +4 Path ids (8 each)
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeInfo {
    /// Largest data unit the sender will emit.
    pub mss: u16,
    /// Paths the sender intends to use.
    pub path_ids: Vec<PathId>,
}

impl HandshakeInfo {
    /// Serialize.
    pub fn encode(&self) -> Vec<u8> {
        let count = self.path_ids.len().min(u8::MAX as usize);
        let mut buf = Vec::with_capacity(4 + count * 8);
        buf.extend_from_slice(&self.mss.to_be_bytes());
        buf.push(count as u8);
        buf.push(0);
        for id in self.path_ids.iter().take(count) {
            buf.extend_from_slice(&id.as_u64().to_be_bytes());
        }
        buf
    }

    /// Parse.
    pub fn decode(bytes: &[u8]) -> Result<Self, PacketError> {
        if bytes.len() < 4 {
            return Err(PacketError::TooShort {
                expected: 4,
                actual: bytes.len(),
            });
        }
        let count = usize::from(bytes[2]);
        let needed = 4 + count * 8;
        if bytes.len() < needed {
            return Err(PacketError::TooShort {
                expected: needed,
                actual: bytes.len(),
            });
        }
        Ok(Self {
            mss: be_u16(bytes, 0),
            path_ids: bytes[4..needed]
                .chunks_exact(8)
                .map(|c| PathId::from_u64(be_u64(c, 0)))
                .collect(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_segment_layout() {
        let seg = SspSegment {
            header: SspHeader {
                src_port: 1,
                dst_port: 2,
                flags: SspFlags::ACK | SspFlags::FIN,
                flow_id: 3,
                seq: 4,
                ack: 5,
                path_id: PathId::from_u64(6),
                window: 7,
            },
            sacks: vec![SackBlock { start: 9, end: 11 }],
            payload: b"hi".to_vec(),
        };
        let bytes = seg.encode();
        assert_eq!(bytes.len(), seg.wire_len());
        assert_eq!(hex::encode(&bytes[..8]), "0001000206010000");
        assert_eq!(SspSegment::decode(&bytes).unwrap(), seg);
    }

    #[test]
    fn test_sack_count_past_end() {
        let mut bytes = vec![0u8; SSP_HEADER_LEN];
        bytes[5] = 1;
        assert!(matches!(
            SspSegment::decode(&bytes),
            Err(PacketError::TooShort { expected: 60, .. })
        ));
    }

    #[test]
    fn test_reserved_flags_rejected() {
        let mut bytes = vec![0u8; SSP_HEADER_LEN];
        bytes[4] = 0x80;
        assert_eq!(
            SspSegment::decode(&bytes),
            Err(PacketError::InvalidFlags(0x80))
        );
    }

    #[test]
    fn test_handshake_info() {
        let info = HandshakeInfo {
            mss: 1200,
            path_ids: vec![PathId::from_u64(1), PathId::from_u64(2)],
        };
        let bytes = info.encode();
        assert_eq!(bytes.len(), 20);
        assert_eq!(HandshakeInfo::decode(&bytes).unwrap(), info);
        assert!(HandshakeInfo::decode(&bytes[..10]).is_err());
    }
}
