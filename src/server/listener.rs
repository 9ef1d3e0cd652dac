// ────────────────────────────────
// src/server/listener.rs
// Low-level bind plus the TLS acceptor for https virtual servers.
// ────────────────────────────────
use std::fs::File;
use std::io::{self, BufReader};
use std::path::Path;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_rustls::rustls::crypto::ring;
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tokio_rustls::rustls::ServerConfig;
use tokio_rustls::TlsAcceptor;

use crate::balancer::LifecycleError;

/// Binds a listener. A bare `:port` address listens on every interface.
pub async fn bind_tcp(address: &str) -> io::Result<TcpListener> {
    TcpListener::bind(normalize_address(address)).await
}

pub fn normalize_address(address: &str) -> String {
    if address.starts_with(':') {
        format!("0.0.0.0{}", address)
    } else {
        address.to_string()
    }
}

/// Reads the certificate chain and private key and builds the acceptor
/// shared by every connection of one enabled period.
pub fn load_tls_acceptor(cert_path: &Path, key_path: &Path) -> Result<TlsAcceptor, LifecycleError> {
    let certificates = load_certificates(cert_path)?;
    let private_key = load_private_key(key_path)?;

    let mut config = ServerConfig::builder_with_provider(Arc::new(ring::default_provider()))
        .with_safe_default_protocol_versions()
        .map_err(|e| tls_error(cert_path, e))?
        .with_no_client_auth()
        .with_single_cert(certificates, private_key)
        .map_err(|e| tls_error(cert_path, e))?;
    config.alpn_protocols = vec![b"http/1.1".to_vec()];

    tracing::debug!(cert = %cert_path.display(), "TLS material loaded");
    Ok(TlsAcceptor::from(Arc::new(config)))
}

fn load_certificates(path: &Path) -> Result<Vec<CertificateDer<'static>>, LifecycleError> {
    let file = File::open(path).map_err(|e| tls_error(path, e))?;
    let mut reader = BufReader::new(file);

    let certificates = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| tls_error(path, e))?;
    if certificates.is_empty() {
        return Err(tls_error(path, "no certificates found in file"));
    }
    Ok(certificates)
}

fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>, LifecycleError> {
    let file = File::open(path).map_err(|e| tls_error(path, e))?;
    let mut reader = BufReader::new(file);

    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| tls_error(path, e))?
        .ok_or_else(|| tls_error(path, "no private key found in file"))
}

fn tls_error(path: &Path, message: impl ToString) -> LifecycleError {
    LifecycleError::Tls {
        path: path.to_path_buf(),
        message: message.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_normalize_address() {
        assert_eq!(normalize_address(":8080"), "0.0.0.0:8080");
        assert_eq!(normalize_address("127.0.0.1:8080"), "127.0.0.1:8080");
    }

    #[tokio::test]
    async fn test_bind_reports_port_in_use() {
        let first = bind_tcp("127.0.0.1:0").await.unwrap();
        let address = first.local_addr().unwrap().to_string();
        assert!(bind_tcp(&address).await.is_err());
    }

    #[test]
    fn test_load_tls_acceptor() {
        let generated = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
        let mut cert = tempfile::NamedTempFile::new().unwrap();
        let mut key = tempfile::NamedTempFile::new().unwrap();
        cert.write_all(generated.cert.pem().as_bytes()).unwrap();
        key.write_all(generated.key_pair.serialize_pem().as_bytes()).unwrap();

        assert!(load_tls_acceptor(cert.path(), key.path()).is_ok());
    }

    #[test]
    fn test_load_tls_rejects_empty_files() {
        let cert = tempfile::NamedTempFile::new().unwrap();
        let key = tempfile::NamedTempFile::new().unwrap();

        let err = load_tls_acceptor(cert.path(), key.path()).err().expect("expected load_tls_acceptor to fail");
        assert!(err.to_string().contains("no certificates found"));
    }
}
