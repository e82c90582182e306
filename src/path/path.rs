//! Forwarding paths and their identity.

use std::fmt;

use sha2::{Digest, Sha256};

use crate::core::{DEFAULT_PATH_MTU, HOP_ENTRY_LEN, IsdAs, PATH_INFO_LEN};

/// Stable path identifier.
///
/// Fingerprint of the interface list taken in canonical direction, so a path
/// and its reverse share the same id. Both endpoints of a connection therefore
/// name a path identically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PathId(u64);

impl PathId {
    /// Wrap a raw identifier.
    pub const fn from_u64(raw: u64) -> Self {
        Self(raw)
    }

    /// Raw identifier as carried in segment headers.
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for PathId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// One AS crossing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Hop {
    /// AS crossed.
    pub isd_as: IsdAs,
    /// Interface the packet enters through (0 at the source AS).
    pub ingress: u16,
    /// Interface the packet leaves through (0 at the destination AS).
    pub egress: u16,
}

impl Hop {
    /// Create a hop.
    pub fn new(isd_as: IsdAs, ingress: u16, egress: u16) -> Self {
        Self {
            isd_as,
            ingress,
            egress,
        }
    }

    fn reversed(self) -> Self {
        Self {
            isd_as: self.isd_as,
            ingress: self.egress,
            egress: self.ingress,
        }
    }

    fn write(self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.isd_as.to_bytes());
        out.extend_from_slice(&self.ingress.to_be_bytes());
        out.extend_from_slice(&self.egress.to_be_bytes());
    }
}

/// A pre-validated forwarding path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Path {
    id: PathId,
    hops: Vec<Hop>,
    mtu: u16,
}

impl Path {
    /// Build a path from its hops.
    pub fn new(hops: Vec<Hop>, mtu: u16) -> Self {
        let id = fingerprint(&hops);
        Self { id, hops, mtu }
    }

    /// Path inside a single AS.
    pub fn local(mtu: u16) -> Self {
        Self::new(Vec::new(), mtu)
    }

    /// Identifier.
    pub fn id(&self) -> PathId {
        self.id
    }

    /// Hops in forwarding order.
    pub fn hops(&self) -> &[Hop] {
        &self.hops
    }

    /// Path MTU.
    pub fn mtu(&self) -> u16 {
        self.mtu
    }

    /// First AS, if the path leaves the local AS.
    pub fn src(&self) -> Option<IsdAs> {
        self.hops.first().map(|h| h.isd_as)
    }

    /// Last AS, if the path leaves the local AS.
    pub fn dst(&self) -> Option<IsdAs> {
        self.hops.last().map(|h| h.isd_as)
    }

    /// (AS, interface) pairs the path crosses, in order.
    pub fn interfaces(&self) -> Vec<(IsdAs, u16)> {
        let mut out = Vec::with_capacity(self.hops.len() * 2);
        for hop in &self.hops {
            if hop.ingress != 0 {
                out.push((hop.isd_as, hop.ingress));
            }
            if hop.egress != 0 {
                out.push((hop.isd_as, hop.egress));
            }
        }
        out
    }

    /// The same path in the opposite direction. Id and MTU are kept.
    pub fn reverse(&self) -> Self {
        Self {
            id: self.id,
            hops: self.hops.iter().rev().map(|h| h.reversed()).collect(),
            mtu: self.mtu,
        }
    }

    /// Encoded path header length.
    pub fn header_len(&self) -> usize {
        PATH_INFO_LEN + self.hops.len() * HOP_ENTRY_LEN
    }

    /// Encode the path header: info line, then one line per hop.
    pub fn encode_header(&self, out: &mut Vec<u8>) {
        out.push(self.hops.len() as u8);
        out.push(0);
        out.extend_from_slice(&self.mtu.to_be_bytes());
        out.extend_from_slice(&[0u8; 4]);
        for hop in &self.hops {
            hop.write(out);
        }
    }

    /// Decode a path header. `None` if the hop count disagrees with the length.
    pub fn decode_header(bytes: &[u8]) -> Option<Self> {
        let info = bytes.get(..PATH_INFO_LEN)?;
        let count = usize::from(info[0]);
        let mtu = match u16::from_be_bytes([info[2], info[3]]) {
            0 => DEFAULT_PATH_MTU,
            mtu => mtu,
        };
        let entries = &bytes[PATH_INFO_LEN..];
        if entries.len() != count * HOP_ENTRY_LEN {
            return None;
        }
        let hops = entries
            .chunks_exact(HOP_ENTRY_LEN)
            .map(|e| Hop {
                isd_as: IsdAs::from_bytes([e[0], e[1], e[2], e[3]]),
                ingress: u16::from_be_bytes([e[4], e[5]]),
                egress: u16::from_be_bytes([e[6], e[7]]),
            })
            .collect();
        Some(Self::new(hops, mtu))
    }
}

fn fingerprint(hops: &[Hop]) -> PathId {
    let mut forward = Vec::with_capacity(hops.len() * HOP_ENTRY_LEN);
    for hop in hops {
        hop.write(&mut forward);
    }
    let mut backward = Vec::with_capacity(forward.len());
    for hop in hops.iter().rev() {
        hop.reversed().write(&mut backward);
    }
    let canonical = forward.min(backward);

    let digest = Sha256::digest(&canonical);
    let mut id = [0u8; 8];
    id.copy_from_slice(&digest[..8]);
    PathId(u64::from_be_bytes(id))
}
