//! Paths, their liveness, and path selection.
//!
//! - [`Path`] / [`PathId`]: a forwarding path and its direction-independent id
//! - [`PathState`]: UNCONFIRMED / UP / DOWN / EXPIRED with per-path RTT
//! - [`PathPolicy`]: filtering and ranking by [`PathConstraints`]
//! - [`StaticPathLookup`]: a fixed [`PathLookup`](crate::core::PathLookup)

mod lookup;
#[allow(clippy::module_inception)]
mod path;
mod policy;
mod state;
mod timing;

pub use lookup::StaticPathLookup;
pub use path::{Hop, Path, PathId};
pub use policy::{PathCandidate, PathConstraints, PathPolicy, select};
pub use state::{
    Liveness, PathCounters, PathState, PathStateConfig, PathStateSnapshot, Transition,
};
pub use timing::{INITIAL_RTO, MAX_RTO, MIN_RTO, RttEstimator};
