//! nb-broker: Publicly reachable broker for natbridge tunnels
//!
//! The broker accepts mutually-authenticated control connections from
//! client agents, matches them against the pending-request table, accepts
//! external callers on forward listeners, and relays bytes between the two.

pub mod admin;
pub mod forward;
pub mod requests;
pub mod server;
pub mod state;

pub use state::BrokerState;
