//! Shared broker state

use std::collections::HashMap;
use std::sync::Arc;

use nb_core::config::BrokerConfig;

use crate::forward::PermanentForward;
use crate::requests::RequestTable;

/// State shared by the control listener, handshake handlers, forward
/// listeners, and the administrative channel.
pub struct BrokerState {
    /// Configuration
    pub config: BrokerConfig,
    /// Pending-request table
    pub requests: Arc<RequestTable>,
    /// Permanent forward listeners, keyed by configured listen port
    pub forwards: HashMap<u16, Arc<PermanentForward>>,
}

impl BrokerState {
    pub fn new(
        config: BrokerConfig,
        requests: Arc<RequestTable>,
        forwards: HashMap<u16, Arc<PermanentForward>>,
    ) -> Self {
        Self {
            config,
            requests,
            forwards,
        }
    }

    /// Permanent forward owning this listen port, if any
    pub fn permanent_forward(&self, port: u16) -> Option<&Arc<PermanentForward>> {
        self.forwards.get(&port)
    }
}
