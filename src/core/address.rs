//! SCION addressing: ISD-AS identifiers, host addresses and socket addresses.

use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use thiserror::Error;

/// Errors produced while parsing addresses from text.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AddressError {
    /// Input is not of the form `<isd>-<as>`.
    #[error("invalid ISD-AS: {0}")]
    InvalidIsdAs(String),

    /// ISD or AS number does not fit its field.
    #[error("ISD-AS component out of range: {0}")]
    OutOfRange(String),

    /// Host part is not an IP address.
    #[error("invalid host address: {0}")]
    InvalidHost(String),

    /// Input is not of the form `<isd>-<as>,[<host>]:<port>`.
    #[error("invalid socket address: {0}")]
    InvalidSocketAddr(String),
}

/// Isolation domain and autonomous system, packed as 12 + 20 bits.
///
/// An AS number of `0` is treated as "any AS in this ISD" by
/// [`IsdAs::matches`], which is how policy whitelists name a whole ISD.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct IsdAs(u32);

impl IsdAs {
    /// Bits used by the AS number.
    pub const AS_BITS: u32 = 20;
    /// Largest ISD number.
    pub const MAX_ISD: u16 = (1 << 12) - 1;
    /// Largest AS number.
    pub const MAX_AS: u32 = (1 << Self::AS_BITS) - 1;

    /// Pack an ISD and AS number. Out-of-range parts are masked.
    pub fn new(isd: u16, as_id: u32) -> Self {
        let isd = u32::from(isd & Self::MAX_ISD);
        Self((isd << Self::AS_BITS) | (as_id & Self::MAX_AS))
    }

    /// A whole-ISD wildcard.
    pub fn any_in(isd: u16) -> Self {
        Self::new(isd, 0)
    }

    /// Reinterpret a packed value.
    pub fn from_u32(raw: u32) -> Self {
        Self(raw)
    }

    /// Packed representation as carried on the wire.
    pub fn as_u32(self) -> u32 {
        self.0
    }

    /// ISD number.
    pub fn isd(self) -> u16 {
        (self.0 >> Self::AS_BITS) as u16
    }

    /// AS number.
    pub fn as_id(self) -> u32 {
        self.0 & Self::MAX_AS
    }

    /// Whether this is a whole-ISD wildcard.
    pub fn is_wildcard(self) -> bool {
        self.as_id() == 0
    }

    /// Whether `other` is this identifier or falls inside this wildcard.
    pub fn matches(self, other: IsdAs) -> bool {
        if self.is_wildcard() {
            self.isd() == other.isd()
        } else {
            self == other
        }
    }

    pub(crate) fn to_bytes(self) -> [u8; 4] {
        self.0.to_be_bytes()
    }

    pub(crate) fn from_bytes(bytes: [u8; 4]) -> Self {
        Self(u32::from_be_bytes(bytes))
    }
}

impl fmt::Display for IsdAs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.isd(), self.as_id())
    }
}

impl FromStr for IsdAs {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (isd, as_id) = s
            .split_once('-')
            .ok_or_else(|| AddressError::InvalidIsdAs(s.to_string()))?;
        let isd: u16 = isd
            .parse()
            .map_err(|_| AddressError::InvalidIsdAs(s.to_string()))?;
        let as_id: u32 = as_id
            .parse()
            .map_err(|_| AddressError::InvalidIsdAs(s.to_string()))?;
        if isd > Self::MAX_ISD || as_id > Self::MAX_AS {
            return Err(AddressError::OutOfRange(s.to_string()));
        }
        Ok(Self::new(isd, as_id))
    }
}

/// A host inside an AS.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ScionAddr {
    /// AS the host lives in.
    pub isd_as: IsdAs,
    /// Host address inside the AS.
    pub host: IpAddr,
}

impl ScionAddr {
    /// Create a new address.
    pub fn new(isd_as: IsdAs, host: IpAddr) -> Self {
        Self { isd_as, host }
    }
}

impl fmt::Display for ScionAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},[{}]", self.isd_as, self.host)
    }
}

/// A transport endpoint: SCION address plus L4 port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ScionSocketAddr {
    /// Host address.
    pub addr: ScionAddr,
    /// L4 port.
    pub port: u16,
}

impl ScionSocketAddr {
    /// Create a new socket address.
    pub fn new(addr: ScionAddr, port: u16) -> Self {
        Self { addr, port }
    }

    /// AS of the endpoint.
    pub fn isd_as(&self) -> IsdAs {
        self.addr.isd_as
    }
}

impl fmt::Display for ScionSocketAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.addr, self.port)
    }
}

impl FromStr for ScionSocketAddr {
    type Err = AddressError;

    /// Parses `1-11,[10.0.0.1]:8000`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || AddressError::InvalidSocketAddr(s.to_string());
        let (ia, rest) = s.split_once(',').ok_or_else(invalid)?;
        let rest = rest.strip_prefix('[').ok_or_else(invalid)?;
        let (host, port) = rest.rsplit_once("]:").ok_or_else(invalid)?;
        let host: IpAddr = host
            .parse()
            .map_err(|_| AddressError::InvalidHost(host.to_string()))?;
        let port: u16 = port.parse().map_err(|_| invalid())?;
        Ok(Self::new(ScionAddr::new(ia.parse()?, host), port))
    }
}
