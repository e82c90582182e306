//! Extension header codec.
//!
//! - [`codec`]: structural parsing and encoding of extension chains
//! - [`Traceroute`]: hop-by-hop hop recording
//! - [`PathProbe`]: end-to-end liveness probes
//! - [`PathReservation`]: end-to-end bandwidth reservation metadata
//!
//! The codec only checks structure (lengths and bounds). Typed decoders check
//! their own payloads and return `None` for anything they do not understand.

pub mod codec;
mod probe;
mod reservation;
mod traceroute;

pub use codec::{
    ExtClass, Extension, ExtensionBuf, ExtensionChain, ExtensionError, ExtensionIter,
    encode_chain, find, parse_chain, total_length,
};
pub use probe::PathProbe;
pub use reservation::PathReservation;
pub use traceroute::{Traceroute, TracerouteHop};
