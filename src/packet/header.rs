//! Common header and address block.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use super::PacketError;
use crate::core::{
    COMMON_HEADER_LEN, HOST_TYPE_IPV4, HOST_TYPE_IPV6, ISD_AS_LEN, IsdAs, LINE_LEN,
    PROTOCOL_VERSION, ScionAddr,
};

/// Common header.
///
/// Wire format (8 bytes):
/// ```text
/// +-----------------------+-------------+------------+-----------+-------------+----------+
/// | ver(4)|src(2)|dst(2)  | Next header | Hdr lines  | Ext lines | Payload len | Reserved |
/// | 1 byte                | 1 byte      | 1 byte     | 1 byte    | 2 bytes BE  | 2 bytes  |
/// +-----------------------+-------------+------------+-----------+-------------+----------+
/// ```
///
/// Header lines cover the common header, address block and path header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommonHeader {
    /// Format version.
    pub version: u8,
    /// Source host address type.
    pub src_type: u8,
    /// Destination host address type.
    pub dst_type: u8,
    /// First extension class, or the L4 protocol.
    pub next_header: u8,
    /// Header length in lines.
    pub header_lines: u8,
    /// Extension chain length in lines.
    pub ext_lines: u8,
    /// L4 payload length in bytes.
    pub payload_len: u16,
}

impl CommonHeader {
    /// Serialize to bytes.
    pub fn to_bytes(&self) -> [u8; COMMON_HEADER_LEN] {
        let mut buf = [0u8; COMMON_HEADER_LEN];
        buf[0] = (self.version << 4) | ((self.src_type & 0x3) << 2) | (self.dst_type & 0x3);
        buf[1] = self.next_header;
        buf[2] = self.header_lines;
        buf[3] = self.ext_lines;
        buf[4..6].copy_from_slice(&self.payload_len.to_be_bytes());
        buf
    }

    /// Parse from bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, PacketError> {
        if bytes.len() < COMMON_HEADER_LEN {
            return Err(PacketError::TooShort {
                expected: COMMON_HEADER_LEN,
                actual: bytes.len(),
            });
        }
        let version = bytes[0] >> 4;
        if version != PROTOCOL_VERSION {
            return Err(PacketError::UnsupportedVersion(version));
        }
        Ok(Self {
            version,
            src_type: (bytes[0] >> 2) & 0x3,
            dst_type: bytes[0] & 0x3,
            next_header: bytes[1],
            header_lines: bytes[2],
            ext_lines: bytes[3],
            payload_len: u16::from_be_bytes([bytes[4], bytes[5]]),
        })
    }

    /// Header length in bytes.
    pub fn header_len(&self) -> usize {
        usize::from(self.header_lines) * LINE_LEN
    }

    /// Extension chain length in bytes.
    pub fn ext_len(&self) -> usize {
        usize::from(self.ext_lines) * LINE_LEN
    }
}

/// Type code of a host address.
pub fn host_type(host: &IpAddr) -> u8 {
    match host {
        IpAddr::V4(_) => HOST_TYPE_IPV4,
        IpAddr::V6(_) => HOST_TYPE_IPV6,
    }
}

fn host_len(host_type: u8) -> Result<usize, PacketError> {
    match host_type {
        HOST_TYPE_IPV4 => Ok(4),
        HOST_TYPE_IPV6 => Ok(16),
        other => Err(PacketError::InvalidHostType(other)),
    }
}

/// Length of the address block, padded to a line.
pub fn address_block_len(src_type: u8, dst_type: u8) -> Result<usize, PacketError> {
    let raw = 2 * ISD_AS_LEN + host_len(src_type)? + host_len(dst_type)?;
    Ok(raw.next_multiple_of(LINE_LEN))
}

/// Append the address block for `src` and `dst`.
pub fn write_addresses(src: &ScionAddr, dst: &ScionAddr, out: &mut Vec<u8>) {
    let start = out.len();
    for addr in [src, dst] {
        out.extend_from_slice(&addr.isd_as.to_bytes());
        match addr.host {
            IpAddr::V4(ip) => out.extend_from_slice(&ip.octets()),
            IpAddr::V6(ip) => out.extend_from_slice(&ip.octets()),
        }
    }
    let padded = (out.len() - start).next_multiple_of(LINE_LEN);
    out.resize(start + padded, 0);
}

/// Read the address block. `block` must be at least
/// [`address_block_len`] bytes.
pub fn read_addresses(
    block: &[u8],
    src_type: u8,
    dst_type: u8,
) -> Result<(ScionAddr, ScionAddr), PacketError> {
    let needed = address_block_len(src_type, dst_type)?;
    if block.len() < needed {
        return Err(PacketError::TooShort {
            expected: needed,
            actual: block.len(),
        });
    }
    let (src, used) = read_one(block, src_type)?;
    let (dst, _) = read_one(&block[used..], dst_type)?;
    Ok((src, dst))
}

fn read_one(bytes: &[u8], host_type: u8) -> Result<(ScionAddr, usize), PacketError> {
    let isd_as = IsdAs::from_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
    let host = &bytes[ISD_AS_LEN..];
    let (host, len) = match host_type {
        HOST_TYPE_IPV4 => {
            let octets: [u8; 4] = [host[0], host[1], host[2], host[3]];
            (IpAddr::V4(Ipv4Addr::from(octets)), 4)
        }
        HOST_TYPE_IPV6 => {
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&host[..16]);
            (IpAddr::V6(Ipv6Addr::from(octets)), 16)
        }
        other => return Err(PacketError::InvalidHostType(other)),
    };
    Ok((ScionAddr::new(isd_as, host), ISD_AS_LEN + len))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_common_header_layout() {
        let hdr = CommonHeader {
            version: 0,
            src_type: HOST_TYPE_IPV4,
            dst_type: HOST_TYPE_IPV6,
            next_header: 17,
            header_lines: 7,
            ext_lines: 1,
            payload_len: 300,
        };
        let bytes = hdr.to_bytes();
        assert_eq!(hex::encode(bytes), "06110701012c0000");
        assert_eq!(CommonHeader::from_bytes(&bytes).unwrap(), hdr);
    }

    #[test]
    fn test_rejects_unknown_version() {
        let mut bytes = [0u8; 8];
        bytes[0] = 0x15;
        assert_eq!(
            CommonHeader::from_bytes(&bytes),
            Err(PacketError::UnsupportedVersion(1))
        );
    }

    #[test]
    fn test_mixed_family_block_is_padded() {
        assert_eq!(address_block_len(HOST_TYPE_IPV4, HOST_TYPE_IPV4).unwrap(), 16);
        assert_eq!(address_block_len(HOST_TYPE_IPV4, HOST_TYPE_IPV6).unwrap(), 32);
        assert!(address_block_len(3, HOST_TYPE_IPV4).is_err());

        let src = ScionAddr::new(IsdAs::new(1, 11), "10.0.0.1".parse().unwrap());
        let dst = ScionAddr::new(IsdAs::new(2, 22), "2001:db8::1".parse().unwrap());
        let mut out = Vec::new();
        write_addresses(&src, &dst, &mut out);
        assert_eq!(out.len(), 32);
        assert_eq!(
            read_addresses(&out, HOST_TYPE_IPV4, HOST_TYPE_IPV6).unwrap(),
            (src, dst)
        );
    }
}
