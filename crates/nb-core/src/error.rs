//! Core error types for natbridge

use std::path::PathBuf;
use thiserror::Error;

/// Configuration-related errors
///
/// These are fatal at startup: a daemon that cannot load its configuration
/// or certificate material never proceeds to accept connections.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Config file not found
    #[error("Config file not found: {0}")]
    NotFound(PathBuf),

    /// Invalid configuration
    #[error("Invalid config: {0}")]
    Invalid(String),

    /// TOML parse error
    #[error("TOML parse error: {0}")]
    Parse(#[from] toml::de::Error),

    /// Unusable certificate, key, or CA material
    #[error("Could not load certificate material from {path}: {detail}")]
    BadCertificate { path: PathBuf, detail: String },

    /// TLS context construction failure
    #[error("TLS setup error: {0}")]
    Tls(String),
}
