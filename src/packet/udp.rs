//! UDP header.

use super::PacketError;

/// UDP header size.
pub const UDP_HEADER_LEN: usize = 8;

/// UDP header. The checksum is not used over SCION and is sent as zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UdpHeader {
    /// Sender port.
    pub src_port: u16,
    /// Receiver port.
    pub dst_port: u16,
}

impl UdpHeader {
    /// Encode the header followed by `payload`.
    pub fn encode(&self, payload: &[u8]) -> Result<Vec<u8>, PacketError> {
        let len = UDP_HEADER_LEN + payload.len();
        let len_field = u16::try_from(len).map_err(|_| PacketError::TooLarge(len))?;
        let mut buf = Vec::with_capacity(len);
        buf.extend_from_slice(&self.src_port.to_be_bytes());
        buf.extend_from_slice(&self.dst_port.to_be_bytes());
        buf.extend_from_slice(&len_field.to_be_bytes());
        buf.extend_from_slice(&[0u8; 2]);
        buf.extend_from_slice(payload);
        Ok(buf)
    }

    /// Parse, returning the header and the datagram payload.
    pub fn decode(bytes: &[u8]) -> Result<(Self, &[u8]), PacketError> {
        if bytes.len() < UDP_HEADER_LEN {
            return Err(PacketError::TooShort {
                expected: UDP_HEADER_LEN,
                actual: bytes.len(),
            });
        }
        let len = usize::from(u16::from_be_bytes([bytes[4], bytes[5]]));
        if len < UDP_HEADER_LEN || len > bytes.len() {
            return Err(PacketError::PayloadLength {
                declared: len,
                available: bytes.len(),
            });
        }
        let header = Self {
            src_port: u16::from_be_bytes([bytes[0], bytes[1]]),
            dst_port: u16::from_be_bytes([bytes[2], bytes[3]]),
        };
        Ok((header, &bytes[UDP_HEADER_LEN..len]))
    }
}
