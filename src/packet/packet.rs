//! Zero-copy packet view and packet builder.

use std::ops::Range;

use super::PacketError;
use super::header::{
    CommonHeader, address_block_len, host_type, read_addresses, write_addresses,
};
use crate::core::{
    COMMON_HEADER_LEN, LINE_LEN, MAX_HEADER_LEN, PATH_INFO_LEN, PROTOCOL_VERSION, ScionAddr,
};
use crate::extensions::{
    ExtClass, Extension, ExtensionBuf, ExtensionError, ExtensionIter, encode_chain, total_length,
};
use crate::path::Path;

/// A parsed packet borrowing its buffer.
///
/// Parsing validates every length against the buffer and the extension chain
/// against the declared chain length; accessors never fail afterwards.
#[derive(Debug, Clone)]
pub struct Packet<'a> {
    buf: &'a [u8],
    header: CommonHeader,
    src: ScionAddr,
    dst: ScionAddr,
    path: Path,
    ext: Range<usize>,
    payload: Range<usize>,
    l4_protocol: u8,
}

impl<'a> Packet<'a> {
    /// Parse and validate a packet.
    pub fn parse(buf: &'a [u8]) -> Result<Self, PacketError> {
        let header = CommonHeader::from_bytes(buf)?;
        let addr_len = address_block_len(header.src_type, header.dst_type)?;
        let path_start = COMMON_HEADER_LEN + addr_len;
        let header_len = header.header_len();
        if header_len < path_start + PATH_INFO_LEN {
            return Err(PacketError::HeaderLength {
                declared: header_len,
                minimum: path_start + PATH_INFO_LEN,
            });
        }
        if buf.len() < header_len {
            return Err(PacketError::TooShort {
                expected: header_len,
                actual: buf.len(),
            });
        }

        let (src, dst) = read_addresses(
            &buf[COMMON_HEADER_LEN..path_start],
            header.src_type,
            header.dst_type,
        )?;
        let path = Path::decode_header(&buf[path_start..header_len]).ok_or(PacketError::BadPath)?;

        let ext = header_len..header_len + header.ext_len();
        let chain = buf.get(ext.clone()).ok_or(PacketError::TooShort {
            expected: ext.end,
            actual: buf.len(),
        })?;
        let (chain_len, l4_protocol) = total_length(chain, header.next_header)?;
        if chain_len != chain.len() {
            return Err(ExtensionError::ChainLengthMismatch {
                declared: chain.len(),
                actual: chain_len,
            }
            .into());
        }

        let payload = ext.end..ext.end + usize::from(header.payload_len);
        if buf.len() < payload.end {
            return Err(PacketError::PayloadLength {
                declared: payload.len(),
                available: buf.len() - ext.end,
            });
        }

        Ok(Self {
            buf,
            header,
            src,
            dst,
            path,
            ext,
            payload,
            l4_protocol,
        })
    }

    /// Common header.
    pub fn header(&self) -> &CommonHeader {
        &self.header
    }

    /// Source address.
    pub fn src(&self) -> ScionAddr {
        self.src
    }

    /// Destination address.
    pub fn dst(&self) -> ScionAddr {
        self.dst
    }

    /// Path the packet travelled, in forwarding direction.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// L4 protocol id that ends the extension chain.
    pub fn l4_protocol(&self) -> u8 {
        self.l4_protocol
    }

    /// Extension chain bytes.
    pub fn extension_bytes(&self) -> &'a [u8] {
        &self.buf[self.ext.clone()]
    }

    /// Offset of the extension chain inside the packet.
    pub fn extension_offset(&self) -> usize {
        self.ext.start
    }

    /// Lazily iterate the extensions. Already validated, so items are `Ok`.
    pub fn extensions(&self) -> ExtensionIter<'a> {
        ExtensionIter::new(self.extension_bytes(), self.header.next_header)
    }

    /// First extension of the given class and type.
    pub fn find_extension(&self, class: ExtClass, ext_type: u8) -> Option<Extension<'a>> {
        crate::extensions::find(self.extension_bytes(), self.header.next_header, class, ext_type)
    }

    /// L4 header and payload.
    pub fn payload(&self) -> &'a [u8] {
        &self.buf[self.payload.clone()]
    }
}

/// Builds a packet from its parts.
#[derive(Debug, Clone)]
pub struct PacketBuilder<'a> {
    src: ScionAddr,
    dst: ScionAddr,
    path: &'a Path,
    l4_protocol: u8,
    extensions: Vec<ExtensionBuf>,
}

impl<'a> PacketBuilder<'a> {
    /// Start a packet from `src` to `dst` over `path`.
    pub fn new(src: ScionAddr, dst: ScionAddr, path: &'a Path, l4_protocol: u8) -> Self {
        Self {
            src,
            dst,
            path,
            l4_protocol,
            extensions: Vec::new(),
        }
    }

    /// Append an extension.
    pub fn extension(mut self, ext: ExtensionBuf) -> Self {
        self.extensions.push(ext);
        self
    }

    /// Append several extensions.
    pub fn extensions(mut self, exts: impl IntoIterator<Item = ExtensionBuf>) -> Self {
        self.extensions.extend(exts);
        self
    }

    /// Encode the packet around `payload` (the L4 header and data).
    pub fn build(self, payload: &[u8]) -> Result<Vec<u8>, PacketError> {
        let src_type = host_type(&self.src.host);
        let dst_type = host_type(&self.dst.host);
        let header_len =
            COMMON_HEADER_LEN + address_block_len(src_type, dst_type)? + self.path.header_len();
        if header_len > MAX_HEADER_LEN {
            return Err(PacketError::TooLarge(header_len));
        }
        let (next_header, chain) = encode_chain(&self.extensions, self.l4_protocol);
        let ext_lines = chain.len() / LINE_LEN;
        let ext_lines = u8::try_from(ext_lines).map_err(|_| PacketError::TooLarge(chain.len()))?;
        let payload_len =
            u16::try_from(payload.len()).map_err(|_| PacketError::TooLarge(payload.len()))?;

        let header = CommonHeader {
            version: PROTOCOL_VERSION,
            src_type,
            dst_type,
            next_header,
            header_lines: (header_len / LINE_LEN) as u8,
            ext_lines,
            payload_len,
        };

        let mut out = Vec::with_capacity(header_len + chain.len() + payload.len());
        out.extend_from_slice(&header.to_bytes());
        write_addresses(&self.src, &self.dst, &mut out);
        self.path.encode_header(&mut out);
        out.extend_from_slice(&chain);
        out.extend_from_slice(payload);
        Ok(out)
    }
}

/// Bytes a packet over `path` spends before the L4 payload, extensions
/// excluded.
pub fn header_overhead(src: &ScionAddr, dst: &ScionAddr, path: &Path) -> usize {
    let block = address_block_len(host_type(&src.host), host_type(&dst.host)).unwrap_or(40);
    COMMON_HEADER_LEN + block + path.header_len()
}
