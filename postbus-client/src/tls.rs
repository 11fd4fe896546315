//! Client-side TLS credentials.
//!
//! An opaque connector + server-name pair attached to the connect call;
//! the RPC core never inspects it.

use crate::error::ClientError;
use crate::stream::ClientStream;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::RootCertStore;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;

/// Opaque TLS credentials for the connecting side.
#[derive(Clone)]
pub struct ClientCredentials {
    connector: TlsConnector,
    server_name: ServerName<'static>,
}

impl ClientCredentials {
    /// Credentials trusting the system root store.
    pub fn system_roots(server_name: &str) -> Result<Self, ClientError> {
        let mut roots = RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        Self::build(roots, None, server_name)
    }

    /// Credentials trusting a PEM CA bundle instead of the system roots.
    pub fn from_ca_pem(ca_path: impl AsRef<Path>, server_name: &str) -> Result<Self, ClientError> {
        let mut roots = RootCertStore::empty();
        for cert in load_certs(ca_path.as_ref())? {
            roots
                .add(cert)
                .map_err(|e| ClientError::TlsConfig(format!("invalid CA cert: {}", e)))?;
        }
        Self::build(roots, None, server_name)
    }

    /// mTLS credentials: a CA bundle plus a client certificate and key.
    pub fn from_ca_pem_with_client_cert(
        ca_path: impl AsRef<Path>,
        cert_path: impl AsRef<Path>,
        key_path: impl AsRef<Path>,
        server_name: &str,
    ) -> Result<Self, ClientError> {
        let mut roots = RootCertStore::empty();
        for cert in load_certs(ca_path.as_ref())? {
            roots
                .add(cert)
                .map_err(|e| ClientError::TlsConfig(format!("invalid CA cert: {}", e)))?;
        }
        let certs = load_certs(cert_path.as_ref())?;
        let key = load_private_key(key_path.as_ref())?;
        Self::build(roots, Some((certs, key)), server_name)
    }

    fn build(
        roots: RootCertStore,
        client_auth: Option<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)>,
        server_name: &str,
    ) -> Result<Self, ClientError> {
        let builder = rustls::ClientConfig::builder().with_root_certificates(roots);
        let config = match client_auth {
            Some((certs, key)) => builder
                .with_client_auth_cert(certs, key)
                .map_err(|e| ClientError::TlsConfig(format!("invalid client cert/key: {}", e)))?,
            None => builder.with_no_client_auth(),
        };
        let server_name = ServerName::try_from(server_name.to_string())
            .map_err(|_| ClientError::TlsConfig(format!("invalid server name: {}", server_name)))?;
        Ok(Self {
            connector: TlsConnector::from(Arc::new(config)),
            server_name,
        })
    }

    /// Runs the handshake over a connected TCP stream.
    pub async fn connect(&self, stream: TcpStream) -> Result<ClientStream, ClientError> {
        let tls = self
            .connector
            .connect(self.server_name.clone(), stream)
            .await
            .map_err(|e| ClientError::TlsHandshake(e.to_string()))?;
        Ok(ClientStream::Tls { stream: tls })
    }
}

impl std::fmt::Debug for ClientCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientCredentials")
            .field("server_name", &self.server_name)
            .finish_non_exhaustive()
    }
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, ClientError> {
    let file = File::open(path)
        .map_err(|e| ClientError::TlsConfig(format!("cannot open cert file {:?}: {}", path, e)))?;
    let mut reader = BufReader::new(file);
    rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| ClientError::TlsConfig(format!("invalid cert file {:?}: {}", path, e)))
}

fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>, ClientError> {
    let file = File::open(path)
        .map_err(|e| ClientError::TlsConfig(format!("cannot open key file {:?}: {}", path, e)))?;
    let mut reader = BufReader::new(file);

    loop {
        match rustls_pemfile::read_one(&mut reader)
            .map_err(|e| ClientError::TlsConfig(format!("invalid key file {:?}: {}", path, e)))?
        {
            Some(rustls_pemfile::Item::Pkcs1Key(key)) => return Ok(key.into()),
            Some(rustls_pemfile::Item::Pkcs8Key(key)) => return Ok(key.into()),
            Some(rustls_pemfile::Item::Sec1Key(key)) => return Ok(key.into()),
            None => {
                return Err(ClientError::TlsConfig(format!(
                    "no private key found in {:?}",
                    path
                )))
            }
            _ => continue,
        }
    }
}
