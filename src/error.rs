//! Error taxonomy for the protocol engine.
//!
//! None of these errors is fatal to the server process. Each layer recovers
//! locally: corrupt input is resynchronized, rejected commands are no-ops,
//! unknown connections are ignored, and transport failures tear down only
//! the affected connection.

use crate::runtime::ConnectionId;
use std::fmt;
use std::io;

/// Why a buffer could not be decoded into a frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// More bytes are needed. Not an error from the peer's point of view.
    Incomplete,
    /// Structurally invalid or failed the checksum.
    Corrupt(Corruption),
    /// Payload too large for the 32-bit length field.
    PayloadTooLarge(usize),
}

/// The specific way a frame was found to be corrupt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Corruption {
    /// Declared length cannot hold the command and checksum fields.
    BadLength(u32),
    /// Declared length exceeds the configured maximum.
    LengthExceedsLimit { length: u32, limit: u32 },
    /// Checksum recomputed over the payload does not match the trailer.
    ChecksumMismatch { expected: u16, actual: u16 },
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolError::Incomplete => write!(f, "incomplete frame"),
            ProtocolError::Corrupt(c) => write!(f, "corrupt frame: {c}"),
            ProtocolError::PayloadTooLarge(len) => {
                write!(f, "payload of {len} bytes does not fit in a frame")
            }
        }
    }
}

impl fmt::Display for Corruption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Corruption::BadLength(len) => write!(f, "declared length {len} is below 4"),
            Corruption::LengthExceedsLimit { length, limit } => {
                write!(f, "declared length {length} exceeds limit {limit}")
            }
            Corruption::ChecksumMismatch { expected, actual } => write!(
                f,
                "checksum mismatch (declared {expected:#06x}, computed {actual:#06x})"
            ),
        }
    }
}

impl std::error::Error for ProtocolError {}

/// Why a valid frame was refused by its command handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RejectReason {
    EmptyPayload,
    EmptyFilename,
    UnknownCommand(u16),
    PayloadTooLarge,
    /// A frame could not be built or parsed for a reason other than size.
    Malformed,
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectReason::EmptyPayload => write!(f, "empty message"),
            RejectReason::EmptyFilename => write!(f, "empty filename"),
            RejectReason::UnknownCommand(_) => write!(f, "unknown command"),
            RejectReason::PayloadTooLarge => write!(f, "payload too large"),
            RejectReason::Malformed => write!(f, "malformed frame"),
        }
    }
}

/// Dispatch failure for a single frame. Affects no other connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchError {
    Rejected(RejectReason),
}

impl fmt::Display for DispatchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DispatchError::Rejected(reason) => write!(f, "rejected: {reason}"),
        }
    }
}

impl std::error::Error for DispatchError {}

impl From<ProtocolError> for DispatchError {
    fn from(e: ProtocolError) -> Self {
        match e {
            ProtocolError::PayloadTooLarge(_) => {
                DispatchError::Rejected(RejectReason::PayloadTooLarge)
            }
            ProtocolError::Incomplete | ProtocolError::Corrupt(_) => {
                DispatchError::Rejected(RejectReason::Malformed)
            }
        }
    }
}

/// An operation referenced a connection the registry does not know.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistryError {
    NotFound(ConnectionId),
}

impl fmt::Display for RegistryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegistryError::NotFound(id) => write!(f, "connection {id} not found"),
        }
    }
}

impl std::error::Error for RegistryError {}

/// A read or write on a connection failed; the connection must be torn down.
#[derive(Debug)]
pub enum TransportError {
    /// The peer or handle is gone.
    Closed,
    Io(io::Error),
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportError::Closed => write!(f, "connection closed"),
            TransportError::Io(e) => write!(f, "transport I/O error: {e}"),
        }
    }
}

impl std::error::Error for TransportError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            TransportError::Io(e) => Some(e),
            TransportError::Closed => None,
        }
    }
}

impl From<io::Error> for TransportError {
    fn from(e: io::Error) -> Self {
        TransportError::Io(e)
    }
}
