//! Shared helpers for lifecycle integration tests.

#![allow(dead_code)]

use std::io::Write;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use mskit_grace::{Connection, Grace, GraceArgs, GraceConfig, LifecycleState, ServeOptions, Service};
use rcgen::{generate_simple_self_signed, CertifiedKey};
use rustls::pki_types::ServerName;
use rustls::{ClientConfig, RootCertStore};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;

/// Default timeout for test operations.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// A runtime for a fresh (non-restarted) process.
pub fn parent(config: GraceConfig) -> Grace {
    Grace::new(&GraceArgs::default(), config)
}

/// Echo every byte back until the peer closes.
pub async fn echo(mut conn: Connection) -> std::io::Result<()> {
    let mut buf = [0u8; 1024];
    loop {
        let n = conn.read(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        conn.write_all(&buf[..n]).await?;
        conn.flush().await?;
    }
}

/// Poll until `address` has a running service, and return it.
pub async fn running_service(grace: &Grace, address: &str) -> Arc<Service> {
    tokio::time::timeout(DEFAULT_TIMEOUT, async {
        loop {
            let found = grace
                .registry()
                .services()
                .into_iter()
                .find(|s| s.address() == address && s.state() == LifecycleState::Running);
            if let Some(service) = found {
                return service;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("service did not start in time")
}

/// Start an echo service on an ephemeral loopback port and wait until it runs.
pub async fn serve_echo(grace: &Grace) -> Arc<Service> {
    let address = "127.0.0.1:0";
    let serving = grace.clone();
    tokio::spawn(async move { serving.serve(address, echo, ServeOptions::default()).await });
    running_service(grace, address).await
}

pub fn local_addr(service: &Service) -> SocketAddr {
    service.listener().local_addr()
}

/// Send `msg` and read back the same number of bytes.
pub async fn round_trip<S>(stream: &mut S, msg: &[u8]) -> Vec<u8>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    stream.write_all(msg).await.unwrap();
    let mut buf = vec![0u8; msg.len()];
    tokio::time::timeout(DEFAULT_TIMEOUT, stream.read_exact(&mut buf))
        .await
        .expect("echo timed out")
        .unwrap();
    buf
}

/// A self-signed localhost certificate written to PEM files.
pub struct TestCert {
    pub certified: CertifiedKey,
    pub cert_file: tempfile::NamedTempFile,
    pub key_file: tempfile::NamedTempFile,
}

impl TestCert {
    pub fn generate() -> Self {
        let certified = generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
        let mut cert_file = tempfile::NamedTempFile::new().unwrap();
        cert_file.write_all(certified.cert.pem().as_bytes()).unwrap();
        let mut key_file = tempfile::NamedTempFile::new().unwrap();
        key_file
            .write_all(certified.key_pair.serialize_pem().as_bytes())
            .unwrap();
        Self {
            certified,
            cert_file,
            key_file,
        }
    }

    /// TLS connector trusting only this certificate.
    pub fn connector(&self) -> TlsConnector {
        let mut roots = RootCertStore::empty();
        roots.add(self.certified.cert.der().clone()).unwrap();
        let config = ClientConfig::builder_with_provider(Arc::new(
            rustls::crypto::ring::default_provider(),
        ))
        .with_safe_default_protocol_versions()
        .unwrap()
        .with_root_certificates(roots)
        .with_no_client_auth();
        TlsConnector::from(Arc::new(config))
    }

    pub async fn connect(&self, addr: SocketAddr) -> std::io::Result<TlsStream<TcpStream>> {
        let tcp = TcpStream::connect(addr).await?;
        let name = ServerName::try_from("localhost").unwrap();
        self.connector().connect(name, tcp).await
    }
}
