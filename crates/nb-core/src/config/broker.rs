//! Broker configuration

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;

use crate::error::ConfigError;

/// Configuration for the broker daemon
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// Address to bind the mutually-authenticated control listener to
    pub bind_address: String,

    /// Broker certificate chain (PEM)
    pub cert_path: PathBuf,

    /// Broker private key (PEM)
    pub key_path: PathBuf,

    /// CA bundle used to verify client certificates (PEM)
    pub ca_path: PathBuf,

    /// Optional certificate revocation list (PEM)
    pub crl_path: Option<PathBuf>,

    /// Address for the administrative command channel; disabled when unset
    pub admin_bind_address: Option<String>,

    /// Permanent forwarding services, keyed by service name
    #[serde(default)]
    pub services: HashMap<String, ServiceConfig>,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        let config_dir = super::default_config_dir();

        Self {
            bind_address: "0.0.0.0:4430".to_string(),
            cert_path: config_dir.join("broker.crt"),
            key_path: config_dir.join("broker.key"),
            ca_path: config_dir.join("ca.crt"),
            crl_path: None,
            admin_bind_address: None,
            services: HashMap::new(),
        }
    }
}

impl BrokerConfig {
    /// Reject service maps that cannot coexist on one broker.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut seen_ports = HashSet::new();
        for (name, service) in &self.services {
            if service.client.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "service {:?} has an empty client name",
                    name
                )));
            }
            if !seen_ports.insert(service.listen_port) {
                return Err(ConfigError::Invalid(format!(
                    "service {:?} reuses listen port {}",
                    name, service.listen_port
                )));
            }
        }
        Ok(())
    }
}

/// One permanent forwarding service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Port the broker listens on for external callers
    pub listen_port: u16,

    /// Client name whose machine hosts the target service
    pub client: String,

    /// Port the client dials on its own machine
    pub target_port: u16,
}
