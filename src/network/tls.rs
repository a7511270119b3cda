//! TLS Setup
//!
//! Builds rustls client and server configurations from PEM files.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use tokio_rustls::{TlsAcceptor, TlsConnector};

use crate::checkpoint::TlsOptions;
use crate::error::{Error, Result};

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let file = File::open(path)
        .map_err(|e| Error::Tls(format!("cannot read {}: {}", path.display(), e)))?;
    let certs = rustls_pemfile::certs(&mut BufReader::new(file))
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| Error::Tls(format!("failed to parse {}: {}", path.display(), e)))?;
    if certs.is_empty() {
        return Err(Error::Tls(format!("no certificates in {}", path.display())));
    }
    Ok(certs)
}

fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    let file = File::open(path)
        .map_err(|e| Error::Tls(format!("cannot read {}: {}", path.display(), e)))?;
    rustls_pemfile::private_key(&mut BufReader::new(file))
        .map_err(|e| Error::Tls(format!("failed to parse {}: {}", path.display(), e)))?
        .ok_or_else(|| Error::Tls(format!("no private key in {}", path.display())))
}

/// Acceptor for the dump service listener
pub fn server_acceptor(cert: &Path, key: &Path) -> Result<TlsAcceptor> {
    let config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(load_certs(cert)?, load_key(key)?)
        .map_err(|e| Error::Tls(format!("invalid certificate/key pair: {}", e)))?;
    Ok(TlsAcceptor::from(Arc::new(config)))
}

/// Connector for an I/O worker, verifying the primary against the CA bundle
pub fn client_connector(options: &TlsOptions) -> Result<TlsConnector> {
    let ca = options
        .ca
        .as_ref()
        .ok_or_else(|| Error::Config("TLS is enabled but no CA bundle is configured".into()))?;

    let mut roots = RootCertStore::empty();
    for cert in load_certs(ca)? {
        roots
            .add(cert)
            .map_err(|e| Error::Tls(format!("failed to add root CA: {}", e)))?;
    }

    let builder = ClientConfig::builder().with_root_certificates(roots);
    let config = match (&options.cert, &options.key) {
        (Some(cert), Some(key)) => builder
            .with_client_auth_cert(load_certs(cert)?, load_key(key)?)
            .map_err(|e| Error::Tls(format!("invalid client cert/key: {}", e)))?,
        (None, None) => builder.with_no_client_auth(),
        _ => {
            return Err(Error::Config(
                "TLS client certificate and key must be set together".into(),
            ))
        }
    };
    Ok(TlsConnector::from(Arc::new(config)))
}

pub(crate) fn server_name(host: &str) -> Result<ServerName<'static>> {
    ServerName::try_from(host.to_string())
        .map_err(|_| Error::Tls(format!("invalid server name: {}", host)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_tls_without_ca_is_a_config_error() {
        let options = TlsOptions {
            enabled: true,
            ..Default::default()
        };
        assert!(matches!(client_connector(&options), Err(Error::Config(_))));
    }

    #[test]
    fn test_missing_pem_files_are_tls_errors() {
        let missing = PathBuf::from("/nonexistent/wolfrelay.pem");
        assert!(matches!(server_acceptor(&missing, &missing), Err(Error::Tls(_))));
    }

    #[test]
    fn test_server_name_accepts_hosts_and_ips() {
        assert!(server_name("db-primary.internal").is_ok());
        assert!(server_name("10.0.0.7").is_ok());
        assert!(server_name("not a host").is_err());
    }
}
