//! nb-agent: Client tunnel agent for natbridge
//!
//! The agent runs on a machine behind NAT and polls the broker over
//! outbound, mutually-authenticated control connections. When the broker
//! has a pending request it relays one TCP conversation between the
//! broker and a local service.

pub mod tunnel;

pub use tunnel::{ConnectionError, CycleOutcome, TunnelConnector};
