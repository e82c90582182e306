//! Packet format: common header, addresses, path header, and L4 headers.
//!
//! ```text
//! ┌──────────────────────────────┐
//! │ Common header (8)            │
//! │ Address block                │  header lines
//! │ Path header                  │
//! ├──────────────────────────────┤
//! │ Extension chain              │  extension lines
//! ├──────────────────────────────┤
//! │ L4 header + payload          │  payload length
//! └──────────────────────────────┘
//! ```

mod header;
#[allow(clippy::module_inception)]
mod packet;
mod ssp;
mod udp;

use thiserror::Error;

use crate::core::{L4_SCMP, L4_SSP, L4_UDP};
use crate::extensions::ExtensionError;

pub use header::CommonHeader;
pub use packet::{Packet, PacketBuilder, header_overhead};
pub use ssp::{
    HandshakeInfo, SACK_BLOCK_LEN, SSP_HEADER_LEN, SackBlock, SspFlags, SspHeader, SspSegment,
};
pub use udp::{UDP_HEADER_LEN, UdpHeader};

/// Packet parse and build errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PacketError {
    /// Buffer shorter than a header requires.
    #[error("packet too short: expected {expected}, got {actual}")]
    TooShort {
        /// Bytes required.
        expected: usize,
        /// Bytes available.
        actual: usize,
    },

    /// Unknown format version.
    #[error("unsupported version: {0}")]
    UnsupportedVersion(u8),

    /// Host address type is neither IPv4 nor IPv6.
    #[error("invalid host address type: {0}")]
    InvalidHostType(u8),

    /// Header length cannot hold the address block and path info.
    #[error("header length {declared} below minimum {minimum}")]
    HeaderLength {
        /// Declared header length.
        declared: usize,
        /// Smallest valid header length.
        minimum: usize,
    },

    /// Path header is inconsistent.
    #[error("malformed path header")]
    BadPath,

    /// Extension chain is malformed.
    #[error("extension chain: {0}")]
    Extension(#[from] ExtensionError),

    /// Payload length exceeds the buffer.
    #[error("payload length {declared} exceeds {available} available bytes")]
    PayloadLength {
        /// Declared length.
        declared: usize,
        /// Bytes available.
        available: usize,
    },

    /// Reserved flag bits are set.
    #[error("invalid flags: 0x{0:02x}")]
    InvalidFlags(u8),

    /// A field overflowed while building.
    #[error("packet too large: {0} bytes")]
    TooLarge(usize),
}

/// L4 protocols the end host understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum L4Protocol {
    /// Inter-host control messages.
    Scmp,
    /// Datagrams.
    Udp,
    /// Reliable multipath stream.
    Ssp,
}

impl L4Protocol {
    /// Map a protocol id; `None` for protocols without a handler.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            L4_SCMP => Some(Self::Scmp),
            L4_UDP => Some(Self::Udp),
            L4_SSP => Some(Self::Ssp),
            _ => None,
        }
    }

    /// Protocol id.
    pub fn as_u8(self) -> u8 {
        match self {
            Self::Scmp => L4_SCMP,
            Self::Udp => L4_UDP,
            Self::Ssp => L4_SSP,
        }
    }

    /// Destination port of an L4 payload. Control messages have no port and
    /// are keyed on port 0.
    pub fn dst_port(self, payload: &[u8]) -> Option<u16> {
        match self {
            Self::Scmp => Some(0),
            // UDP and SSP both start with source and destination port.
            Self::Udp | Self::Ssp => payload.get(2..4).map(|p| u16::from_be_bytes([p[0], p[1]])),
        }
    }
}
