//! Protocol error types

use thiserror::Error;

/// Errors that can occur during protocol operations
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// Length prefix never produced a terminal byte within the read bound
    #[error("Malformed length prefix: no terminal byte within {0} bytes")]
    UnterminatedLength(usize),

    /// Frame body exceeds the maximum size
    #[error("Frame too large: {size} bytes exceeds maximum of {max} bytes")]
    FrameTooLarge { size: u64, max: usize },

    /// A message variant that is not valid at the current protocol state
    #[error("Unexpected message: expected {expected}, got {got}")]
    UnexpectedMessage {
        expected: &'static str,
        got: &'static str,
    },

    /// Peer announced a protocol version newer than we support
    #[error("Unsupported protocol version: {0}")]
    UnsupportedVersion(u32),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
