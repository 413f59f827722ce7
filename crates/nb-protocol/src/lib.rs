//! nb-protocol: Wire protocol for natbridge control connections
//!
//! This crate defines the length-prefixed binary framing and the closed
//! message set exchanged between the broker and client agents.

pub mod codec;
pub mod error;
pub mod frame;
pub mod message;

pub use codec::{FramedReader, FramedWriter, SharedWriter};
pub use error::ProtocolError;
pub use frame::{MAX_FRAME_SIZE, MAX_LENGTH_PREFIX_BYTES};
pub use message::{check_protocol_version, Message, MAX_PROTOCOL_VERSION, PROTOCOL_VERSION};
