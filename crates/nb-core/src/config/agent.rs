//! Agent configuration

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use super::serde_utils::duration_secs;
use crate::error::ConfigError;

/// Configuration for the client tunnel agent
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Client name announced in `Hello` (defaults to the hostname)
    pub name: Option<String>,

    /// Broker address to connect to, as `host:port`
    pub broker_address: String,

    /// TLS server name to verify; defaults to the host part of
    /// `broker_address`
    pub server_name: Option<String>,

    /// Agent certificate chain (PEM)
    pub cert_path: PathBuf,

    /// Agent private key (PEM)
    pub key_path: PathBuf,

    /// CA bundle used to verify the broker certificate (PEM)
    pub ca_path: PathBuf,

    /// Delay between polling cycles
    #[serde(with = "duration_secs")]
    pub retry_interval: Duration,

    /// Keep polling forever instead of stopping after one cycle
    pub infinite: bool,

    /// Connection timeout
    #[serde(with = "duration_secs")]
    pub connect_timeout: Duration,
}

impl Default for AgentConfig {
    fn default() -> Self {
        let config_dir = super::default_config_dir();

        Self {
            name: None,
            broker_address: "localhost:4430".to_string(),
            server_name: None,
            cert_path: config_dir.join("agent.crt"),
            key_path: config_dir.join("agent.key"),
            ca_path: config_dir.join("ca.crt"),
            retry_interval: Duration::from_secs(60),
            infinite: false,
            connect_timeout: Duration::from_secs(30),
        }
    }
}

impl AgentConfig {
    /// Get the client name, falling back to the hostname
    pub fn client_name(&self) -> String {
        self.name
            .clone()
            .unwrap_or_else(|| gethostname::gethostname().to_string_lossy().into_owned())
    }

    /// TLS server name to present during the handshake
    pub fn tls_server_name(&self) -> Result<String, ConfigError> {
        if let Some(name) = &self.server_name {
            return Ok(name.clone());
        }
        let host = self
            .broker_address
            .rsplit_once(':')
            .map(|(host, _)| host)
            .unwrap_or(self.broker_address.as_str());
        if host.is_empty() {
            return Err(ConfigError::Invalid(format!(
                "cannot derive a TLS server name from broker address {:?}",
                self.broker_address
            )));
        }
        Ok(host.to_string())
    }
}
