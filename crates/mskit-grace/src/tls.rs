//! TLS wrapping for tracked listeners.
//!
//! The encrypted listener delegates accepting, closing and descriptor
//! extraction to its inner plain listener; only the handshake is its own, and
//! that runs on the connection task so a slow client cannot stall accepts.

use std::fs::File;
use std::io::{self, BufReader};
use std::net::SocketAddr;
use std::os::unix::io::OwnedFd;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures::future::BoxFuture;
use rustls_pemfile::{certs, private_key};
use rustls::pki_types::CertificateDer;
use rustls::server::WebPkiClientVerifier;
use rustls::{RootCertStore, ServerConfig};
use tokio_rustls::TlsAcceptor;

use crate::connection::{Connection, ConnectionTracker, TrackedStream};
use crate::error::{GraceError, Result};
use crate::listener::{AcceptError, Listener, TrackedListener};

/// PEM files for serving TLS, optionally requiring client certificates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsOptions {
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
    /// When set, clients must present a certificate signed by one of these CAs.
    pub client_ca_path: Option<PathBuf>,
}

impl TlsOptions {
    pub fn new(cert_path: impl Into<PathBuf>, key_path: impl Into<PathBuf>) -> Self {
        Self {
            cert_path: cert_path.into(),
            key_path: key_path.into(),
            client_ca_path: None,
        }
    }

    /// Require and verify client certificates against `ca_path`.
    pub fn with_client_ca(mut self, ca_path: impl Into<PathBuf>) -> Self {
        self.client_ca_path = Some(ca_path.into());
        self
    }

    /// Load the certificate chain and key and build an acceptor.
    pub fn acceptor(&self) -> Result<TlsAcceptor> {
        let provider = Arc::new(rustls::crypto::ring::default_provider());

        let chain = load_certs(&self.cert_path)?;
        let key = {
            let file = open(&self.key_path)?;
            private_key(&mut BufReader::new(file))
                .map_err(|e| {
                    GraceError::tls(format!("Failed to read key {}: {}", self.key_path.display(), e))
                })?
                .ok_or_else(|| {
                    GraceError::tls(format!("No private key found in {}", self.key_path.display()))
                })?
        };

        let builder = ServerConfig::builder_with_provider(Arc::clone(&provider))
            .with_safe_default_protocol_versions()
            .map_err(|e| GraceError::tls(format!("TLS config error: {}", e)))?;

        let builder = match &self.client_ca_path {
            Some(ca_path) => {
                let mut roots = RootCertStore::empty();
                for cert in load_certs(ca_path)? {
                    roots
                        .add(cert)
                        .map_err(|e| GraceError::tls(format!("Invalid client CA: {}", e)))?;
                }
                let verifier = WebPkiClientVerifier::builder_with_provider(Arc::new(roots), provider)
                    .build()
                    .map_err(|e| GraceError::tls(format!("Client verifier error: {}", e)))?;
                builder.with_client_cert_verifier(verifier)
            }
            None => builder.with_no_client_auth(),
        };

        let mut config = builder
            .with_single_cert(chain, key)
            .map_err(|e| GraceError::tls(format!("TLS config error: {}", e)))?;
        config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];

        Ok(TlsAcceptor::from(Arc::new(config)))
    }
}

fn open(path: &Path) -> Result<File> {
    File::open(path)
        .map_err(|e| GraceError::tls(format!("Failed to open {}: {}", path.display(), e)))
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let file = open(path)?;
    let chain = certs(&mut BufReader::new(file))
        .collect::<io::Result<Vec<_>>>()
        .map_err(|e| GraceError::tls(format!("Failed to read {}: {}", path.display(), e)))?;
    if chain.is_empty() {
        return Err(GraceError::tls(format!(
            "No certificates found in {}",
            path.display()
        )));
    }
    Ok(chain)
}

/// A tracked listener whose connections are TLS-terminated.
pub struct TlsListener {
    inner: TrackedListener,
    acceptor: TlsAcceptor,
}

impl TlsListener {
    pub fn new(inner: TrackedListener, acceptor: TlsAcceptor) -> Self {
        Self { inner, acceptor }
    }

    pub fn inner(&self) -> &TrackedListener {
        &self.inner
    }
}

impl Listener for TlsListener {
    fn accept(&self) -> BoxFuture<'_, std::result::Result<TrackedStream, AcceptError>> {
        self.inner.accept()
    }

    fn establish(&self, stream: TrackedStream) -> BoxFuture<'static, io::Result<Connection>> {
        let acceptor = self.acceptor.clone();
        Box::pin(async move {
            let tls = acceptor.accept(stream).await?;
            Ok(Connection::Tls(Box::new(tls)))
        })
    }

    fn close(&self) {
        self.inner.close()
    }

    fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    fn extract_descriptor(&self) -> io::Result<OwnedFd> {
        self.inner.extract_descriptor()
    }

    fn active_count(&self) -> usize {
        self.inner.active_count()
    }

    fn tracker(&self) -> &ConnectionTracker {
        self.inner.tracker()
    }

    fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr()
    }
}

impl std::fmt::Debug for TlsListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsListener")
            .field("inner", &self.inner)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_temp(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_acceptor_from_self_signed() {
        let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
        let cert_file = write_temp(&cert.cert.pem());
        let key_file = write_temp(&cert.key_pair.serialize_pem());

        let options = TlsOptions::new(cert_file.path(), key_file.path());
        assert!(options.acceptor().is_ok());

        let mutual = options.with_client_ca(cert_file.path());
        assert!(mutual.acceptor().is_ok());
    }

    #[test]
    fn test_missing_files_reported() {
        let options = TlsOptions::new("/nonexistent/cert.pem", "/nonexistent/key.pem");
        let err = options.acceptor().err().unwrap();
        assert!(matches!(err, GraceError::Tls(_)));
    }

    #[test]
    fn test_empty_key_file_reported() {
        let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
        let cert_file = write_temp(&cert.cert.pem());
        let key_file = write_temp("");

        let err = TlsOptions::new(cert_file.path(), key_file.path())
            .acceptor()
            .err().unwrap();
        assert!(err.to_string().contains("No private key"));
    }
}
