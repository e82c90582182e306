//! The reliable multipath stream protocol.
//!
//! - [`Connection`]: handshake, windows, retransmission and close, sans-IO
//! - [`ConnectionManager`]: the path set of one connection
//! - [`RetransmitQueue`] / [`ReorderBuffer`]: send and receive bookkeeping
//! - [`StreamConfig`]: tunables

mod config;
mod connection;
mod manager;
mod reorder;
mod retransmit;

pub use config::{SelectionStrategy, StreamConfig, StreamConfigBuilder};
pub use connection::{Connection, ConnectionPhase, ConnectionStats, Role, Transmit};
pub use manager::{ConnectionManager, PathStats};
pub use reorder::{InsertOutcome, ReorderBuffer, ReorderError};
pub use retransmit::{Acked, DataUnit, Expired, RetransmitQueue};
