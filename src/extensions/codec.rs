//! Extension chain codec.
//!
//! An extension chain is a sequence of sub-headers between the path header
//! and the L4 header. Each sub-header is:
//!
//! ```text
//! +-------------+--------+----------------+---------------------------+
//! | Next header | Type   | Length (lines) | Payload (length*8 - 3)    |
//! | 1 byte      | 1 byte | 1 byte         |                           |
//! +-------------+--------+----------------+---------------------------+
//! ```
//!
//! The class of a sub-header is announced by the next-header byte that
//! precedes it (the common header for the first one). The chain ends at the
//! first next-header value that is not an extension class; that value is the
//! L4 protocol id.
//!
//! Parsing never copies payloads: [`Extension`] borrows from the packet
//! buffer.

use thiserror::Error;

use crate::core::{END_TO_END, EXT_SUBHEADER_LEN, HOP_BY_HOP, LINE_LEN, MAX_EXTENSION_LEN};

/// Structural violations of an extension chain.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ExtensionError {
    /// Fewer than three bytes remain where a sub-header is expected.
    #[error("truncated extension sub-header at offset {offset}")]
    TruncatedHeader {
        /// Offset of the sub-header inside the chain.
        offset: usize,
    },

    /// A sub-header declares zero lines.
    #[error("zero-length extension at offset {offset}")]
    ZeroLength {
        /// Offset of the sub-header inside the chain.
        offset: usize,
    },

    /// A sub-header runs past the declared chain or the buffer.
    #[error("extension at offset {offset} declares {declared} bytes, {remaining} remain")]
    LengthExceedsChain {
        /// Offset of the sub-header inside the chain.
        offset: usize,
        /// Bytes declared by the sub-header.
        declared: usize,
        /// Bytes left in the chain.
        remaining: usize,
    },

    /// The sum of sub-header lengths differs from the declared chain length.
    #[error("extension chain is {actual} bytes, header declares {declared}")]
    ChainLengthMismatch {
        /// Chain length from the common header.
        declared: usize,
        /// Sum of the sub-header lengths.
        actual: usize,
    },

    /// A payload does not fit the one-byte length field.
    #[error("extension payload of {0} bytes is too large")]
    PayloadTooLarge(usize),
}

/// Extension class, taken from the preceding next-header value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExtClass {
    /// Processed by every forwarding point.
    HopByHop,
    /// Processed only by the destination host.
    EndToEnd,
}

impl ExtClass {
    /// Interpret a next-header value. `None` means the chain ends here.
    pub fn from_next_header(value: u8) -> Option<Self> {
        match value {
            HOP_BY_HOP => Some(Self::HopByHop),
            END_TO_END => Some(Self::EndToEnd),
            _ => None,
        }
    }

    /// The next-header value announcing this class.
    pub fn as_u8(self) -> u8 {
        match self {
            Self::HopByHop => HOP_BY_HOP,
            Self::EndToEnd => END_TO_END,
        }
    }
}

/// One parsed sub-header, borrowing its payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Extension<'a> {
    class: ExtClass,
    ext_type: u8,
    next_header: u8,
    lines: u8,
    offset: usize,
    payload: &'a [u8],
}

impl<'a> Extension<'a> {
    /// Extension class.
    pub fn class(&self) -> ExtClass {
        self.class
    }

    /// Type within the class.
    pub fn ext_type(&self) -> u8 {
        self.ext_type
    }

    /// Next-header value following this sub-header.
    pub fn next_header(&self) -> u8 {
        self.next_header
    }

    /// Declared length in lines.
    pub fn lines(&self) -> u8 {
        self.lines
    }

    /// Total length in bytes, sub-header included.
    pub fn len_bytes(&self) -> usize {
        usize::from(self.lines) * LINE_LEN
    }

    /// Offset of the sub-header inside the chain.
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Payload including any padding up to the line boundary.
    pub fn payload(&self) -> &'a [u8] {
        self.payload
    }

    /// Whether this is the given (class, type).
    pub fn is(&self, class: ExtClass, ext_type: u8) -> bool {
        self.class == class && self.ext_type == ext_type
    }

    /// Copy into an owned extension.
    pub fn to_buf(&self) -> ExtensionBuf {
        ExtensionBuf {
            class: self.class,
            ext_type: self.ext_type,
            payload: self.payload.to_vec(),
        }
    }
}

/// Reads the sub-header at `offset`, checking it against the chain bound.
fn read_subheader(buf: &[u8], offset: usize) -> Result<(u8, u8, u8), ExtensionError> {
    let remaining = buf.len().saturating_sub(offset);
    if remaining < EXT_SUBHEADER_LEN {
        return Err(ExtensionError::TruncatedHeader { offset });
    }
    let next_header = buf[offset];
    let ext_type = buf[offset + 1];
    let lines = buf[offset + 2];
    if lines == 0 {
        return Err(ExtensionError::ZeroLength { offset });
    }
    let declared = usize::from(lines) * LINE_LEN;
    if declared > remaining {
        return Err(ExtensionError::LengthExceedsChain {
            offset,
            declared,
            remaining,
        });
    }
    Ok((next_header, ext_type, lines))
}

/// Lazy, restartable iterator over an extension chain.
///
/// Yields one `Err` on the first structural violation and then stops.
/// Cloning the iterator restarts nothing; use [`ExtensionIter::restart`] to
/// walk the chain again from the beginning.
#[derive(Debug, Clone)]
pub struct ExtensionIter<'a> {
    buf: &'a [u8],
    first_header: u8,
    next_header: u8,
    offset: usize,
    failed: bool,
}

impl<'a> ExtensionIter<'a> {
    /// Iterate the chain in `buf`, whose first sub-header's class is given by
    /// `next_header`.
    pub fn new(buf: &'a [u8], next_header: u8) -> Self {
        Self {
            buf,
            first_header: next_header,
            next_header,
            offset: 0,
            failed: false,
        }
    }

    /// Rewind to the first sub-header.
    pub fn restart(&mut self) {
        self.next_header = self.first_header;
        self.offset = 0;
        self.failed = false;
    }

    /// Bytes consumed so far.
    pub fn consumed(&self) -> usize {
        self.offset
    }

    /// The next-header value reached so far; after exhaustion without error
    /// this is the L4 protocol id.
    pub fn current_next_header(&self) -> u8 {
        self.next_header
    }
}

impl<'a> Iterator for ExtensionIter<'a> {
    type Item = Result<Extension<'a>, ExtensionError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        let class = ExtClass::from_next_header(self.next_header)?;
        let offset = self.offset;
        match read_subheader(self.buf, offset) {
            Ok((next_header, ext_type, lines)) => {
                let end = offset + usize::from(lines) * LINE_LEN;
                self.offset = end;
                self.next_header = next_header;
                Some(Ok(Extension {
                    class,
                    ext_type,
                    next_header,
                    lines,
                    offset,
                    payload: &self.buf[offset + EXT_SUBHEADER_LEN..end],
                }))
            }
            Err(e) => {
                self.failed = true;
                Some(Err(e))
            }
        }
    }
}

/// A fully parsed chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtensionChain<'a> {
    /// Sub-headers in wire order.
    pub extensions: Vec<Extension<'a>>,
    /// Sum of sub-header lengths in bytes.
    pub total_len: usize,
    /// Protocol id that terminated the chain.
    pub l4_protocol: u8,
}

/// Iterate the chain lazily.
pub fn iter(buf: &[u8], next_header: u8) -> ExtensionIter<'_> {
    ExtensionIter::new(buf, next_header)
}

/// Parse the whole chain.
///
/// `buf` is bounded by the declared chain length; bytes after the terminating
/// sub-header are ignored.
pub fn parse_chain(buf: &[u8], next_header: u8) -> Result<ExtensionChain<'_>, ExtensionError> {
    let mut it = ExtensionIter::new(buf, next_header);
    let mut extensions = Vec::new();
    for ext in it.by_ref() {
        extensions.push(ext?);
    }
    Ok(ExtensionChain {
        extensions,
        total_len: it.consumed(),
        l4_protocol: it.current_next_header(),
    })
}

/// First extension matching `(class, ext_type)`.
///
/// A single scan that stops at the first structural violation.
pub fn find(buf: &[u8], next_header: u8, class: ExtClass, ext_type: u8) -> Option<Extension<'_>> {
    ExtensionIter::new(buf, next_header)
        .map_while(Result::ok)
        .find(|ext| ext.is(class, ext_type))
}

/// Chain length in bytes and the terminating L4 protocol id, reading only
/// sub-headers.
pub fn total_length(buf: &[u8], next_header: u8) -> Result<(usize, u8), ExtensionError> {
    let mut offset = 0;
    let mut next = next_header;
    while ExtClass::from_next_header(next).is_some() {
        let (following, _, lines) = read_subheader(buf, offset)?;
        offset += usize::from(lines) * LINE_LEN;
        next = following;
    }
    Ok((offset, next))
}

/// An owned extension, used when building packets or retaining metadata
/// beyond the lifetime of a receive buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtensionBuf {
    class: ExtClass,
    ext_type: u8,
    payload: Vec<u8>,
}

impl ExtensionBuf {
    /// Create an extension; the payload is padded to a line boundary when
    /// encoded.
    pub fn new(class: ExtClass, ext_type: u8, payload: Vec<u8>) -> Result<Self, ExtensionError> {
        if EXT_SUBHEADER_LEN + payload.len() > MAX_EXTENSION_LEN {
            return Err(ExtensionError::PayloadTooLarge(payload.len()));
        }
        Ok(Self {
            class,
            ext_type,
            payload,
        })
    }

    /// Extension class.
    pub fn class(&self) -> ExtClass {
        self.class
    }

    /// Type within the class.
    pub fn ext_type(&self) -> u8 {
        self.ext_type
    }

    /// Payload as given (unpadded unless it came from the wire).
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Whether this is the given (class, type).
    pub fn is(&self, class: ExtClass, ext_type: u8) -> bool {
        self.class == class && self.ext_type == ext_type
    }

    /// Encoded length in lines.
    pub fn lines(&self) -> usize {
        (EXT_SUBHEADER_LEN + self.payload.len()).div_ceil(LINE_LEN)
    }

    /// Encoded length in bytes.
    pub fn wire_len(&self) -> usize {
        self.lines() * LINE_LEN
    }

    fn encode_into(&self, next_header: u8, out: &mut Vec<u8>) {
        let start = out.len();
        out.push(next_header);
        out.push(self.ext_type);
        out.push(self.lines() as u8);
        out.extend_from_slice(&self.payload);
        out.resize(start + self.wire_len(), 0);
    }
}

/// Encode `extensions` in order, ending the chain with `l4_protocol`.
///
/// Returns the next-header value for the common header and the chain bytes.
pub fn encode_chain(extensions: &[ExtensionBuf], l4_protocol: u8) -> (u8, Vec<u8>) {
    let len = extensions.iter().map(ExtensionBuf::wire_len).sum();
    let mut out = Vec::with_capacity(len);
    for (i, ext) in extensions.iter().enumerate() {
        let next = extensions
            .get(i + 1)
            .map(|following| following.class.as_u8())
            .unwrap_or(l4_protocol);
        ext.encode_into(next, &mut out);
    }
    let first = extensions
        .first()
        .map(|ext| ext.class.as_u8())
        .unwrap_or(l4_protocol);
    (first, out)
}
