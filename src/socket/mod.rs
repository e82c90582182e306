//! Socket API on top of the dispatcher.
//!
//! - [`EndHost`]: owns the dispatcher, the underlay and the path lookup
//! - [`SspSocket`] / [`SspListener`] / [`SspStream`]: reliable streams
//! - [`DatagramSocket`]: SCION/UDP datagrams

mod datagram;
mod driver;
mod host;
mod stream;

pub use datagram::{Datagram, DatagramSocket};
pub use host::EndHost;
pub use stream::{SspListener, SspSocket, SspStream};
