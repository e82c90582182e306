//! # SCION SSP
//!
//! End-host data plane for a path-aware network: the extension header codec,
//! per-path liveness and selection, and **SSP**, a reliable multipath stream
//! transport, plus the local dispatcher that demultiplexes inbound packets.
//!
//! - **Multipath**: data units spread over every admissible path, with
//!   failover the moment a path goes down
//! - **Path-aware**: whitelist, blacklist and latency preference per stream,
//!   changeable while the stream runs
//! - **Sans-IO core**: [`stream::Connection`] is a pure state machine driven
//!   by explicit time; the runtime layers only move bytes and run timers
//!
//! ## Feature Flags
//!
//! - `runtime` (default): tokio-based dispatcher, sockets, and underlays
//!
//! ## Modules
//!
//! - [`core`]: addresses, constants, collaborator traits, errors (always included)
//! - [`extensions`]: extension chain codec and typed extensions
//! - [`packet`]: packet, SSP segment, and UDP header formats
//! - [`path`]: paths, liveness, and path policy
//! - [`stream`]: the stream protocol engine
//! - [`dispatcher`]: local demultiplexing (requires `runtime`)
//! - [`socket`]: stream and datagram sockets (requires `runtime`)
//! - [`underlay`]: in-memory and UDP networks (requires `runtime`)
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use scion_ssp::prelude::*;
//!
//! # async fn example() -> SspResult<()> {
//! let net = MemoryNetwork::new();
//! let lookup = Arc::new(StaticPathLookup::new());
//!
//! let a_addr = ScionAddr::new("1-10".parse()?, "10.0.0.1".parse().unwrap());
//! let b_addr = ScionAddr::new("1-10".parse()?, "10.0.0.2".parse().unwrap());
//! let (a_underlay, a_inbound) = net.attach(a_addr, 1024);
//! let (b_underlay, b_inbound) = net.attach(b_addr, 1024);
//! let a = EndHost::new(a_addr, a_underlay, a_inbound, lookup.clone());
//! let b = EndHost::new(b_addr, b_underlay, b_inbound, lookup);
//!
//! let listener = b.listen(8000, StreamConfig::default())?;
//! let client = a.connect(ScionSocketAddr::new(b_addr, 8000), StreamConfig::default()).await?;
//! let server = listener.accept().await?;
//!
//! client.send_all(b"hello").await?;
//! let mut buf = [0u8; 5];
//! server.recv_exact(&mut buf).await?;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

// Pure layers (always included)
pub mod core;
pub mod extensions;
pub mod packet;
pub mod path;
pub mod stream;

// Runtime layers (feature-gated)
#[cfg(feature = "runtime")]
#[cfg_attr(docsrs, doc(cfg(feature = "runtime")))]
pub mod dispatcher;

#[cfg(feature = "runtime")]
#[cfg_attr(docsrs, doc(cfg(feature = "runtime")))]
pub mod socket;

#[cfg(feature = "runtime")]
#[cfg_attr(docsrs, doc(cfg(feature = "runtime")))]
pub mod underlay;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::core::{
        ConnectionError, DispatchError, IsdAs, PathLookup, ScionAddr, ScionSocketAddr, SspError,
        SspResult, Underlay,
    };
    pub use crate::extensions::{PathReservation, Traceroute, TracerouteHop};
    pub use crate::path::{Hop, Path, PathConstraints, PathId, StaticPathLookup};
    pub use crate::stream::{ConnectionPhase, SelectionStrategy, StreamConfig};

    #[cfg(feature = "runtime")]
    pub use crate::dispatcher::{ControlHandler, Delivery, Dispatcher};
    #[cfg(feature = "runtime")]
    pub use crate::socket::{Datagram, DatagramSocket, EndHost, SspListener, SspSocket, SspStream};
    #[cfg(feature = "runtime")]
    pub use crate::underlay::{MemoryNetwork, UdpUnderlay, UdpUnderlayBuilder};
}

// Re-export commonly used items at crate root
pub use crate::core::{ConnectionError, IsdAs, ScionAddr, ScionSocketAddr, SspError, SspResult};
pub use crate::path::{Path, PathConstraints, PathId};
pub use crate::stream::{Connection, StreamConfig};

#[cfg(feature = "runtime")]
pub use crate::socket::{DatagramSocket, EndHost, SspListener, SspStream};
