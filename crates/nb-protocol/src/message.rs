//! Message types for the natbridge control protocol
//!
//! The message set is a closed tagged union exchanged between the broker
//! and client agents over a framed control connection. Bodies are
//! bincode-serialized; the variant tag plus ordered typed fields make the
//! format self-describing across variants and stable within a deployment.
//!
//! # Message Flow
//!
//! 1. Agent connects and sends `Hello` with its name and protocol version
//! 2. Broker answers `NotInterested` (nothing pending, agent retries later)
//!    or `CreateTunnel` with the local port the agent must dial
//! 3. Once the external caller's stream is in hand the broker sends
//!    `Connect`; from then on both sides exchange `Payload` chunks
//! 4. `Disconnect` tears the relay down from either side
//! 5. `Error` reports a fatal per-connection failure before the broker
//!    closes the stream

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;

/// Protocol version announced in `Hello`.
pub const PROTOCOL_VERSION: u32 = 1;

/// Highest protocol version the broker accepts.
pub const MAX_PROTOCOL_VERSION: u32 = 1;

/// Protocol messages
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Message {
    /// Client identifies itself and opens the handshake
    Hello {
        /// Client name, the key into the broker's pending-request table
        name: String,
        /// Protocol version the client speaks
        protocol_version: u32,
    },

    /// Broker has no pending work for this client
    NotInterested,

    /// Broker tells the client which local port to dial
    CreateTunnel {
        /// Port of the service on the client's machine
        port: u16,
    },

    /// Tunnel is ready; relay starts after this message
    Connect {
        /// External caller's address, carried for agent-side logging
        original_client_address: String,
    },

    /// Orderly relay tear-down, sent by either side
    Disconnect,

    /// One chunk of raw tunneled data
    Payload(Bytes),

    /// Broker reports a fatal per-connection error
    Error {
        /// Human-readable description
        message: String,
    },
}

impl Message {
    /// Variant name, for logging and protocol-state errors
    pub fn name(&self) -> &'static str {
        match self {
            Message::Hello { .. } => "HELLO",
            Message::NotInterested => "NOT_INTERESTED",
            Message::CreateTunnel { .. } => "CREATE_TUNNEL",
            Message::Connect { .. } => "CONNECT",
            Message::Disconnect => "DISCONNECT",
            Message::Payload(_) => "PAYLOAD",
            Message::Error { .. } => "ERROR",
        }
    }
}

/// Reject protocol versions newer than we support.
pub fn check_protocol_version(version: u32) -> Result<(), ProtocolError> {
    if version > MAX_PROTOCOL_VERSION {
        return Err(ProtocolError::UnsupportedVersion(version));
    }
    Ok(())
}
