//! Outbound control connection and tunnel lifecycle

mod connector;

pub use connector::{run_control_cycle, ConnectionError, CycleOutcome, TunnelConnector};
