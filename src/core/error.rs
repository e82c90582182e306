//! Error types shared across the stack.
//!
//! Layer-local errors (`ExtensionError`, `PacketError`, `ReorderError`) live
//! next to the code that raises them; [`SspError`] wraps all of them.

use thiserror::Error;

use super::address::{AddressError, ScionAddr};
use crate::extensions::ExtensionError;
use crate::packet::PacketError;
use crate::stream::ReorderError;

/// Terminal and operational errors of one connection.
///
/// `Clone` so that the same terminal error can be handed to every suspended
/// operation of the connection.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConnectionError {
    /// The path set is empty, or every path expired.
    #[error("no path available to the remote endpoint")]
    NoPathAvailable,

    /// The handshake was not answered within its retry budget.
    #[error("handshake timed out after {attempts} attempts")]
    HandshakeTimeout {
        /// Handshake transmissions made.
        attempts: u32,
    },

    /// A data unit was retransmitted too often without being acknowledged.
    #[error("retransmission exhausted for unit {seq} after {retries} retries")]
    RetransmissionExhausted {
        /// Sequence number of the unit that gave up.
        seq: u64,
        /// Retransmissions made.
        retries: u32,
    },

    /// The peer aborted the connection.
    #[error("connection reset by peer")]
    Reset,

    /// The connection was closed locally.
    #[error("connection closed")]
    Closed,

    /// A blocking operation exceeded the socket timeout.
    #[error("operation timed out")]
    TimedOut,

    /// The operation is not valid in the current phase.
    #[error("invalid state: {0}")]
    InvalidState(&'static str),
}

impl ConnectionError {
    /// Whether the error ends the connection.
    ///
    /// Only [`ConnectionError::TimedOut`] leaves the connection usable.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::TimedOut | Self::InvalidState(_))
    }
}

/// Registration errors of the local dispatcher.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DispatchError {
    /// The key is already registered.
    #[error("{addr} port {port} protocol {protocol} is already bound")]
    AlreadyBound {
        /// Local address.
        addr: ScionAddr,
        /// Local port.
        port: u16,
        /// L4 protocol id.
        protocol: u8,
    },

    /// The key is not registered.
    #[error("{addr} port {port} protocol {protocol} is not bound")]
    NotBound {
        /// Local address.
        addr: ScionAddr,
        /// Local port.
        port: u16,
        /// L4 protocol id.
        protocol: u8,
    },

    /// No ephemeral port is free.
    #[error("ephemeral ports exhausted")]
    PortsExhausted,

    /// The dispatcher has been shut down.
    #[error("dispatcher shut down")]
    Shutdown,
}

/// Top-level errors.
#[derive(Debug, Error)]
pub enum SspError {
    /// An extension chain violated its structural bounds.
    #[error("malformed extension: {0}")]
    MalformedExtension(#[from] ExtensionError),

    /// A packet could not be parsed or built.
    #[error("packet error: {0}")]
    Packet(#[from] PacketError),

    /// The receive reorder buffer rejected a unit.
    #[error("reorder error: {0}")]
    Reorder(#[from] ReorderError),

    /// Dispatcher registration failed.
    #[error("dispatch error: {0}")]
    Dispatch(#[from] DispatchError),

    /// Connection-level failure.
    #[error("connection error: {0}")]
    Connection(#[from] ConnectionError),

    /// Address parsing failed.
    #[error("address error: {0}")]
    Address(#[from] AddressError),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// I/O error.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl SspError {
    /// Errors on the receive path that are handled by dropping the packet.
    pub fn is_silent_drop(&self) -> bool {
        matches!(
            self,
            Self::MalformedExtension(_) | Self::Packet(_) | Self::Reorder(_)
        )
    }

    /// The connection error, if this is one.
    pub fn connection_error(&self) -> Option<&ConnectionError> {
        match self {
            Self::Connection(e) => Some(e),
            _ => None,
        }
    }
}

/// Result type for stack operations.
pub type SspResult<T> = Result<T, SspError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_error_fatality() {
        assert!(ConnectionError::NoPathAvailable.is_fatal());
        assert!(ConnectionError::Reset.is_fatal());
        assert!(
            ConnectionError::RetransmissionExhausted { seq: 1, retries: 10 }.is_fatal()
        );
        assert!(!ConnectionError::TimedOut.is_fatal());
    }

    #[test]
    fn test_silent_drop_classification() {
        let err = SspError::from(ExtensionError::ZeroLength { offset: 0 });
        assert!(err.is_silent_drop());

        let err = SspError::from(ConnectionError::Closed);
        assert!(!err.is_silent_drop());
        assert_eq!(err.connection_error(), Some(&ConnectionError::Closed));
    }
}
