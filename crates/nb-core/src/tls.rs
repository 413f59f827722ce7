//! TLS context construction for control connections
//!
//! Both directions of the control plane are mutually authenticated: the
//! broker verifies client certificates against its configured CA (with
//! revocation lists when provided), and the agent verifies the broker
//! against its own CA file. rustls only ever negotiates TLS 1.2/1.3, so
//! the legacy SSL revisions are unavailable by construction.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use rustls::pki_types::{
    CertificateDer, CertificateRevocationListDer, PrivateKeyDer, ServerName,
};
use rustls::server::WebPkiClientVerifier;
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use tokio_rustls::{TlsAcceptor, TlsConnector};

use crate::error::ConfigError;

static CRYPTO_PROVIDER_INIT: std::sync::Once = std::sync::Once::new();

fn ensure_crypto_provider() {
    CRYPTO_PROVIDER_INIT.call_once(|| {
        if rustls::crypto::ring::default_provider()
            .install_default()
            .is_err()
        {
            tracing::debug!("Rustls crypto provider already installed");
        }
    });
}

/// Load a PEM certificate chain
pub fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, ConfigError> {
    let file = File::open(path).map_err(|e| ConfigError::BadCertificate {
        path: path.to_path_buf(),
        detail: e.to_string(),
    })?;
    let mut reader = BufReader::new(file);

    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| ConfigError::BadCertificate {
            path: path.to_path_buf(),
            detail: format!("failed to parse certificates: {}", e),
        })?;

    if certs.is_empty() {
        return Err(ConfigError::BadCertificate {
            path: path.to_path_buf(),
            detail: "no certificates found".to_string(),
        });
    }
    Ok(certs)
}

/// Load a PEM private key
pub fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>, ConfigError> {
    let file = File::open(path).map_err(|e| ConfigError::BadCertificate {
        path: path.to_path_buf(),
        detail: e.to_string(),
    })?;
    let mut reader = BufReader::new(file);

    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| ConfigError::BadCertificate {
            path: path.to_path_buf(),
            detail: format!("failed to parse key: {}", e),
        })?
        .ok_or_else(|| ConfigError::BadCertificate {
            path: path.to_path_buf(),
            detail: "no private key found".to_string(),
        })
}

/// Load a PEM CA bundle into a root store
pub fn load_root_store(path: &Path) -> Result<RootCertStore, ConfigError> {
    let mut roots = RootCertStore::empty();
    for cert in load_certs(path)? {
        roots.add(cert).map_err(|e| ConfigError::BadCertificate {
            path: path.to_path_buf(),
            detail: format!("rejected CA certificate: {}", e),
        })?;
    }
    Ok(roots)
}

/// Load PEM certificate revocation lists
pub fn load_crls(
    path: &Path,
) -> Result<Vec<CertificateRevocationListDer<'static>>, ConfigError> {
    let file = File::open(path).map_err(|e| ConfigError::BadCertificate {
        path: path.to_path_buf(),
        detail: e.to_string(),
    })?;
    let mut reader = BufReader::new(file);

    rustls_pemfile::crls(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| ConfigError::BadCertificate {
            path: path.to_path_buf(),
            detail: format!("failed to parse CRLs: {}", e),
        })
}

/// Build the broker-side acceptor: present `cert_path`/`key_path`, require
/// and verify client certificates against `ca_path`.
pub fn build_acceptor(
    cert_path: &Path,
    key_path: &Path,
    ca_path: &Path,
    crl_path: Option<&Path>,
) -> Result<TlsAcceptor, ConfigError> {
    ensure_crypto_provider();

    let roots = Arc::new(load_root_store(ca_path)?);
    let mut verifier_builder = WebPkiClientVerifier::builder(roots);
    if let Some(crl_path) = crl_path {
        verifier_builder = verifier_builder.with_crls(load_crls(crl_path)?);
    }
    let verifier = verifier_builder
        .build()
        .map_err(|e| ConfigError::Tls(format!("client verifier: {}", e)))?;

    let certs = load_certs(cert_path)?;
    let key = load_private_key(key_path)?;

    let server_config = ServerConfig::builder()
        .with_client_cert_verifier(verifier)
        .with_single_cert(certs, key)
        .map_err(|e| ConfigError::Tls(format!("invalid cert/key pair: {}", e)))?;

    Ok(TlsAcceptor::from(Arc::new(server_config)))
}

/// Build the agent-side connector: verify the broker against `ca_path` and
/// present `cert_path`/`key_path` as the client identity.
pub fn build_connector(
    cert_path: &Path,
    key_path: &Path,
    ca_path: &Path,
) -> Result<TlsConnector, ConfigError> {
    ensure_crypto_provider();

    let roots = load_root_store(ca_path)?;
    let certs = load_certs(cert_path)?;
    let key = load_private_key(key_path)?;

    let client_config = ClientConfig::builder()
        .with_root_certificates(roots)
        .with_client_auth_cert(certs, key)
        .map_err(|e| ConfigError::Tls(format!("invalid cert/key pair: {}", e)))?;

    Ok(TlsConnector::from(Arc::new(client_config)))
}

/// Parse a host into the `ServerName` rustls expects.
pub fn server_name(host: &str) -> Result<ServerName<'static>, ConfigError> {
    ServerName::try_from(host.to_string())
        .map_err(|_| ConfigError::Invalid(format!("invalid TLS server name: {:?}", host)))
}
