//! Server-side TLS credentials.
//!
//! The RPC core treats credentials as inert configuration: an opaque object
//! attached to the listen call, never inspected.

use crate::error::ServerError;
use crate::stream::ServerStream;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::WebPkiClientVerifier;
use rustls::RootCertStore;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio_rustls::TlsAcceptor;

/// Opaque TLS credentials for the listening side.
#[derive(Clone)]
pub struct ServerCredentials {
    acceptor: TlsAcceptor,
}

impl ServerCredentials {
    /// Builds credentials from PEM-encoded certificate chain and key.
    pub fn from_pem(
        cert_path: impl AsRef<Path>,
        key_path: impl AsRef<Path>,
    ) -> Result<Self, ServerError> {
        let certs = load_certs(cert_path.as_ref())?;
        let key = load_private_key(key_path.as_ref())?;
        let config = rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .map_err(|e| ServerError::TlsConfig(format!("invalid cert/key: {}", e)))?;
        Ok(Self {
            acceptor: TlsAcceptor::from(Arc::new(config)),
        })
    }

    /// Builds mTLS credentials that require a client certificate signed by
    /// the given CA.
    pub fn from_pem_with_client_auth(
        cert_path: impl AsRef<Path>,
        key_path: impl AsRef<Path>,
        client_ca_path: impl AsRef<Path>,
    ) -> Result<Self, ServerError> {
        let certs = load_certs(cert_path.as_ref())?;
        let key = load_private_key(key_path.as_ref())?;

        let mut roots = RootCertStore::empty();
        for cert in load_certs(client_ca_path.as_ref())? {
            roots
                .add(cert)
                .map_err(|e| ServerError::TlsConfig(format!("invalid client CA cert: {}", e)))?;
        }
        let verifier = WebPkiClientVerifier::builder(Arc::new(roots))
            .build()
            .map_err(|e| ServerError::TlsConfig(format!("client verifier: {}", e)))?;

        let config = rustls::ServerConfig::builder()
            .with_client_cert_verifier(verifier)
            .with_single_cert(certs, key)
            .map_err(|e| ServerError::TlsConfig(format!("invalid cert/key: {}", e)))?;
        Ok(Self {
            acceptor: TlsAcceptor::from(Arc::new(config)),
        })
    }

    /// Runs the handshake on an accepted TCP stream.
    pub async fn accept(&self, stream: TcpStream) -> Result<ServerStream, ServerError> {
        let tls = self
            .acceptor
            .accept(stream)
            .await
            .map_err(|e| ServerError::TlsHandshake(e.to_string()))?;
        Ok(ServerStream::Tls { stream: tls })
    }
}

impl std::fmt::Debug for ServerCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerCredentials").finish_non_exhaustive()
    }
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, ServerError> {
    let file = File::open(path)
        .map_err(|e| ServerError::TlsConfig(format!("cannot open cert file {:?}: {}", path, e)))?;
    let mut reader = BufReader::new(file);
    rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| ServerError::TlsConfig(format!("invalid cert file {:?}: {}", path, e)))
}

fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>, ServerError> {
    let file = File::open(path)
        .map_err(|e| ServerError::TlsConfig(format!("cannot open key file {:?}: {}", path, e)))?;
    let mut reader = BufReader::new(file);

    loop {
        match rustls_pemfile::read_one(&mut reader)
            .map_err(|e| ServerError::TlsConfig(format!("invalid key file {:?}: {}", path, e)))?
        {
            Some(rustls_pemfile::Item::Pkcs1Key(key)) => return Ok(key.into()),
            Some(rustls_pemfile::Item::Pkcs8Key(key)) => return Ok(key.into()),
            Some(rustls_pemfile::Item::Sec1Key(key)) => return Ok(key.into()),
            None => {
                return Err(ServerError::TlsConfig(format!(
                    "no private key found in {:?}",
                    path
                )))
            }
            _ => continue,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_cert_file() {
        let result = ServerCredentials::from_pem("/nonexistent/cert.pem", "/nonexistent/key.pem");
        assert!(matches!(result, Err(ServerError::TlsConfig(_))));
    }
}
