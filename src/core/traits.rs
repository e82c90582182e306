//! Collaborator interfaces of the end-host stack.
//!
//! Path discovery and the physical network are outside this crate. The stack
//! talks to them only through these traits.

use std::io;

use super::address::IsdAs;
use crate::path::Path;

/// Source of candidate paths between two ASes.
///
/// Paths returned here are already validated (signatures, expiry); the stack
/// only ranks and monitors them.
pub trait PathLookup: Send + Sync {
    /// Candidate paths from `src` to `dst`. An empty vector means no path is
    /// known.
    fn paths(&self, src: IsdAs, dst: IsdAs) -> Vec<Path>;
}

/// The underlying network channel towards the first-hop router.
///
/// Sends never block: a full channel is reported as an error and the packet
/// counts as lost, which the transport recovers from like any other loss.
pub trait Underlay: Send + Sync {
    /// Hand a fully encoded packet to the network.
    fn send(&self, packet: &[u8]) -> io::Result<()>;
}
