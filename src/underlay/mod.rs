//! Underlay networks carrying encoded packets.
//!
//! [`MemoryNetwork`] connects end hosts inside one process; [`UdpUnderlay`]
//! talks to a first-hop router over UDP/IP.

mod memory;
mod udp;

pub use memory::{MemoryNetwork, MemoryStats, MemoryUnderlay};
pub use udp::{DEFAULT_RECV_BUFFER_SIZE, UdpUnderlay, UdpUnderlayBuilder};
