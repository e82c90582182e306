//! Core addressing, constants, collaborator traits and error types.
//!
//! This module has no runtime dependencies and is always compiled.

mod address;
mod constants;
mod error;
mod traits;

pub use address::*;
pub use constants::*;
pub use error::*;
pub use traits::*;
