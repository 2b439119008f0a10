//! Tracked listeners: counted accepts, prompt close, and descriptor hand-off.
//!
//! A [`TrackedListener`] owns one listening TCP socket. It can be bound fresh
//! or adopted from a descriptor inherited from the parent process, and it can
//! duplicate its descriptor for a child without disturbing its own.

use std::future::poll_fn;
use std::io;
use std::net::SocketAddr;
use std::os::unix::io::{AsFd, FromRawFd, OwnedFd, RawFd};
use std::str::FromStr;
use std::task::{Context, Poll};

use futures::future::BoxFuture;
use futures::task::AtomicWaker;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::net::TcpListener;
use tracing::{debug, info};

use crate::connection::{Connection, ConnectionTracker, StreamTimeouts, TrackedStream};
use crate::error::{GraceError, Result};

/// First descriptor number used for inherited listeners (after stdin/stdout/stderr).
pub const INHERITED_FD_START: RawFd = 3;

/// Failure from [`Listener::accept`].
#[derive(Debug, Error)]
pub enum AcceptError {
    /// The listener was closed; the accept loop should exit.
    #[error("listener closed")]
    Closed,
    /// A transient transport error; the accept loop should keep going.
    #[error("accept failed: {0}")]
    Io(#[from] io::Error),
}

/// Which address families a service may bind.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Network {
    /// Any family.
    #[default]
    Tcp,
    /// IPv4 only.
    Tcp4,
    /// IPv6 only.
    Tcp6,
}

impl Network {
    pub fn as_str(self) -> &'static str {
        match self {
            Network::Tcp => "tcp",
            Network::Tcp4 => "tcp4",
            Network::Tcp6 => "tcp6",
        }
    }

    pub fn admits(self, addr: &SocketAddr) -> bool {
        match self {
            Network::Tcp => true,
            Network::Tcp4 => addr.is_ipv4(),
            Network::Tcp6 => addr.is_ipv6(),
        }
    }
}

impl FromStr for Network {
    type Err = GraceError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "tcp" => Ok(Network::Tcp),
            "tcp4" => Ok(Network::Tcp4),
            "tcp6" => Ok(Network::Tcp6),
            other => Err(GraceError::UnsupportedNetwork(other.to_string())),
        }
    }
}

impl std::fmt::Display for Network {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Capability shared by the plain and the TLS listener.
pub trait Listener: Send + Sync + 'static {
    /// Wait for the next connection. The live-connection count is already
    /// incremented when this returns `Ok`.
    fn accept(&self) -> BoxFuture<'_, std::result::Result<TrackedStream, AcceptError>>;

    /// Turn an accepted stream into a handler-ready connection (TLS handshake
    /// for encrypted listeners). Runs on the connection task.
    fn establish(&self, stream: TrackedStream) -> BoxFuture<'static, io::Result<Connection>>;

    /// Stop accepting. Idempotent; does not wait for live connections.
    fn close(&self);

    fn is_closed(&self) -> bool;

    /// Duplicate the listening descriptor for a child process.
    fn extract_descriptor(&self) -> io::Result<OwnedFd>;

    /// Connections accepted and not yet finished.
    fn active_count(&self) -> usize;

    fn tracker(&self) -> &ConnectionTracker;

    fn local_addr(&self) -> SocketAddr;
}

/// A listening socket whose accepted connections are counted.
pub struct TrackedListener {
    inner: Mutex<Option<TcpListener>>,
    waker: AtomicWaker,
    tracker: ConnectionTracker,
    timeouts: StreamTimeouts,
    local_addr: SocketAddr,
}

impl TrackedListener {
    /// Wrap an already-bound tokio listener.
    pub fn new(listener: TcpListener, timeouts: StreamTimeouts) -> io::Result<Self> {
        let local_addr = listener.local_addr()?;
        Ok(Self {
            inner: Mutex::new(Some(listener)),
            waker: AtomicWaker::new(),
            tracker: ConnectionTracker::new(),
            timeouts,
            local_addr,
        })
    }

    /// Bind a fresh socket on `address` restricted to `network`.
    pub async fn bind(address: &str, network: Network, timeouts: StreamTimeouts) -> Result<Self> {
        let candidates: Vec<SocketAddr> = tokio::net::lookup_host(address)
            .await
            .map_err(|source| GraceError::Bind {
                address: address.to_string(),
                source,
            })?
            .filter(|addr| network.admits(addr))
            .collect();

        if candidates.is_empty() {
            return Err(GraceError::Resolve {
                address: address.to_string(),
                network: network.to_string(),
            });
        }

        let mut last_err = None;
        for candidate in candidates {
            match TcpListener::bind(candidate).await {
                Ok(listener) => {
                    info!(address, %network, local = %candidate, "Bound listener");
                    return Ok(Self::new(listener, timeouts)?);
                }
                Err(e) => {
                    debug!(address, local = %candidate, error = %e, "Bind attempt failed");
                    last_err = Some(e);
                }
            }
        }

        Err(GraceError::Bind {
            address: address.to_string(),
            source: last_err.unwrap_or_else(|| io::Error::other("no bind attempt made")),
        })
    }

    /// Adopt a listening socket inherited from the parent process at `fd`.
    ///
    /// The descriptor is validated with `fstat` before ownership is taken, and
    /// marked close-on-exec so it does not leak into unrelated children.
    pub fn from_inherited(address: &str, fd: RawFd, timeouts: StreamTimeouts) -> Result<Self> {
        if !validate_fd(fd) {
            return Err(GraceError::inherit(address, fd, "not an open socket"));
        }
        set_cloexec(fd).map_err(|e| GraceError::inherit(address, fd, e.to_string()))?;

        // SAFETY: fd is an open socket (checked above) passed to us by the parent
        // and not owned by anything else in this process.
        let std_listener = unsafe { std::net::TcpListener::from_raw_fd(fd) };
        std_listener
            .set_nonblocking(true)
            .map_err(|e| GraceError::inherit(address, fd, e.to_string()))?;
        let listener = TcpListener::from_std(std_listener)
            .map_err(|e| GraceError::inherit(address, fd, e.to_string()))?;

        let tracked = Self::new(listener, timeouts)
            .map_err(|e| GraceError::inherit(address, fd, e.to_string()))?;
        info!(fd, address, local = %tracked.local_addr, "Inherited listener from parent process");
        Ok(tracked)
    }

    fn poll_accept(&self, cx: &mut Context<'_>) -> Poll<std::result::Result<TrackedStream, AcceptError>> {
        self.waker.register(cx.waker());
        // Accepts happen under the same lock that close() takes, so once close()
        // returns no further connection can be accepted here.
        let guard = self.inner.lock();
        let Some(listener) = guard.as_ref() else {
            return Poll::Ready(Err(AcceptError::Closed));
        };
        match listener.poll_accept(cx) {
            Poll::Ready(Ok((stream, peer))) => Poll::Ready(Ok(TrackedStream::new(
                stream,
                peer,
                self.tracker.guard(),
                self.timeouts,
            ))),
            Poll::Ready(Err(e)) => Poll::Ready(Err(AcceptError::Io(e))),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Listener for TrackedListener {
    fn accept(&self) -> BoxFuture<'_, std::result::Result<TrackedStream, AcceptError>> {
        Box::pin(poll_fn(move |cx| self.poll_accept(cx)))
    }

    fn establish(&self, stream: TrackedStream) -> BoxFuture<'static, io::Result<Connection>> {
        Box::pin(async move { Ok(Connection::Plain(stream)) })
    }

    fn close(&self) {
        let taken = self.inner.lock().take();
        if let Some(listener) = taken {
            drop(listener);
            info!(address = %self.local_addr, active = self.tracker.active(), "Listener closed");
        }
        self.waker.wake();
    }

    fn is_closed(&self) -> bool {
        self.inner.lock().is_none()
    }

    fn extract_descriptor(&self) -> io::Result<OwnedFd> {
        let guard = self.inner.lock();
        match guard.as_ref() {
            Some(listener) => listener.as_fd().try_clone_to_owned(),
            None => Err(io::Error::new(
                io::ErrorKind::NotConnected,
                format!("listener on {} is closed", self.local_addr),
            )),
        }
    }

    fn active_count(&self) -> usize {
        self.tracker.active()
    }

    fn tracker(&self) -> &ConnectionTracker {
        &self.tracker
    }

    fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

impl std::fmt::Debug for TrackedListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrackedListener")
            .field("local_addr", &self.local_addr)
            .field("active", &self.tracker.active())
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Validate that a file descriptor is a valid socket using fstat.
pub(crate) fn validate_fd(fd: RawFd) -> bool {
    if fd < 0 {
        return false;
    }
    let mut stat: libc::stat = unsafe { std::mem::zeroed() };
    let result = unsafe { libc::fstat(fd, &mut stat) };
    if result != 0 {
        return false;
    }
    (stat.st_mode & libc::S_IFMT) == libc::S_IFSOCK
}

fn set_cloexec(fd: RawFd) -> io::Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFD) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    if unsafe { libc::fcntl(fd, libc::F_SETFD, flags | libc::FD_CLOEXEC) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::io::{AsRawFd, IntoRawFd};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::net::TcpStream;

    async fn loopback() -> TrackedListener {
        TrackedListener::bind("127.0.0.1:0", Network::Tcp, StreamTimeouts::default())
            .await
            .unwrap()
    }

    #[test]
    fn test_network_parsing() {
        assert_eq!("tcp".parse::<Network>().unwrap(), Network::Tcp);
        assert_eq!("TCP4".parse::<Network>().unwrap(), Network::Tcp4);
        assert_eq!("tcp6".parse::<Network>().unwrap(), Network::Tcp6);
        assert!(matches!(
            "udp".parse::<Network>(),
            Err(GraceError::UnsupportedNetwork(_))
        ));
    }

    #[tokio::test]
    async fn test_bind_respects_network_family() {
        let err = TrackedListener::bind("127.0.0.1:0", Network::Tcp6, StreamTimeouts::default())
            .await
            .unwrap_err();
        assert!(matches!(err, GraceError::Resolve { .. }));

        let v4 = TrackedListener::bind("127.0.0.1:0", Network::Tcp4, StreamTimeouts::default())
            .await
            .unwrap();
        assert!(v4.local_addr().is_ipv4());
    }

    #[tokio::test]
    async fn test_accept_counts_and_release() {
        let listener = loopback().await;
        let addr = listener.local_addr();

        let _c1 = TcpStream::connect(addr).await.unwrap();
        let s1 = listener.accept().await.unwrap();
        let _c2 = TcpStream::connect(addr).await.unwrap();
        let s2 = listener.accept().await.unwrap();
        assert_eq!(listener.active_count(), 2);

        drop(s1);
        assert_eq!(listener.active_count(), 1);
        drop(s2);
        assert_eq!(listener.active_count(), 0);
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_terminal() {
        let listener = loopback().await;
        listener.close();
        listener.close();
        assert!(listener.is_closed());
        assert!(matches!(listener.accept().await, Err(AcceptError::Closed)));
        assert!(listener.extract_descriptor().is_err());
    }

    #[tokio::test]
    async fn test_close_wakes_pending_accept() {
        let listener = Arc::new(loopback().await);
        let pending = {
            let listener = Arc::clone(&listener);
            tokio::spawn(async move { listener.accept().await.map(|_| ()) })
        };
        tokio::task::yield_now().await;

        listener.close();
        let result = tokio::time::timeout(Duration::from_secs(1), pending)
            .await
            .expect("accept should wake on close")
            .unwrap();
        assert!(matches!(result, Err(AcceptError::Closed)));
    }

    #[tokio::test]
    async fn test_no_accept_after_close_returns() {
        let listener = Arc::new(loopback().await);
        let addr = listener.local_addr();

        let acceptor = {
            let listener = Arc::clone(&listener);
            tokio::spawn(async move {
                let mut held = Vec::new();
                while let Ok(stream) = listener.accept().await {
                    held.push(stream);
                }
                held.len()
            })
        };

        let clients: Vec<_> = (0..16)
            .map(|_| tokio::spawn(async move { TcpStream::connect(addr).await.ok() }))
            .collect();
        tokio::task::yield_now().await;

        listener.close();
        let accepted_at_close = listener.active_count();

        for client in clients {
            let _ = client.await;
        }
        let accepted = acceptor.await.unwrap();
        assert_eq!(accepted, accepted_at_close);
        assert!(TcpStream::connect(addr).await.is_err());
    }

    /// fd inheritance round-trip: bind → dup → adopt → connect.
    #[tokio::test]
    async fn test_fd_inheritance_round_trip() {
        let listener = loopback().await;
        let addr = listener.local_addr();

        let dup = listener.extract_descriptor().unwrap();
        assert!(validate_fd(dup.as_raw_fd()));
        let fd = dup.into_raw_fd();

        let adopted =
            TrackedListener::from_inherited("127.0.0.1", fd, StreamTimeouts::default()).unwrap();
        assert_eq!(adopted.local_addr(), addr);

        // Closing the original leaves the duplicate listening.
        listener.close();
        let _client = TcpStream::connect(addr).await.unwrap();
        let stream = adopted.accept().await.unwrap();
        assert_eq!(adopted.active_count(), 1);
        drop(stream);
    }

    #[test]
    fn test_invalid_fd_detection() {
        assert!(!validate_fd(9999));
        assert!(!validate_fd(-1));
    }

    #[test]
    fn test_from_inherited_rejects_non_socket() {
        let file = tempfile::tempfile().unwrap();
        let err = TrackedListener::from_inherited(
            "127.0.0.1:1",
            file.as_raw_fd(),
            StreamTimeouts::default(),
        )
        .unwrap_err();
        assert!(matches!(err, GraceError::Inherit { .. }));
    }
}
