//! Live-connection accounting and the accepted-stream wrappers.
//!
//! Every accepted stream carries a [`ConnectionGuard`]. The guard increments the
//! tracker when it is created and decrements it exactly once when the stream is
//! dropped, whether the handler finished, failed, or was aborted.

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio::sync::Notify;
use tokio::time::Sleep;

/// Counts connections that were accepted and have not finished yet.
#[derive(Clone, Default)]
pub struct ConnectionTracker {
    count: Arc<AtomicUsize>,
    idle: Arc<Notify>,
}

impl ConnectionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new connection. The returned guard must live as long as the connection.
    pub fn guard(&self) -> ConnectionGuard {
        self.count.fetch_add(1, Ordering::SeqCst);
        ConnectionGuard {
            count: Arc::clone(&self.count),
            idle: Arc::clone(&self.idle),
        }
    }

    /// Current number of live connections.
    pub fn active(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }

    /// Wait until no connections are live.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            tokio::pin!(notified);
            // Register before checking so a release between the load and the
            // await cannot be missed.
            notified.as_mut().enable();
            if self.active() == 0 {
                return;
            }
            notified.await;
        }
    }
}

impl std::fmt::Debug for ConnectionTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionTracker")
            .field("active", &self.active())
            .finish()
    }
}

/// Decrements its tracker once, on drop.
pub struct ConnectionGuard {
    count: Arc<AtomicUsize>,
    idle: Arc<Notify>,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        let prev = self.count.fetch_sub(1, Ordering::SeqCst);
        assert!(prev > 0, "connection counter underflow");
        if prev == 1 {
            self.idle.notify_waiters();
        }
    }
}

impl std::fmt::Debug for ConnectionGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionGuard").finish_non_exhaustive()
    }
}

/// Per-direction I/O timeouts applied to every accepted stream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StreamTimeouts {
    pub read: Option<Duration>,
    pub write: Option<Duration>,
}

impl StreamTimeouts {
    /// Zero durations are treated as "no timeout".
    pub fn new(read: Option<Duration>, write: Option<Duration>) -> Self {
        Self {
            read: read.filter(|d| !d.is_zero()),
            write: write.filter(|d| !d.is_zero()),
        }
    }
}

/// Fires when an I/O direction has been stalled for its whole timeout.
struct Deadline {
    timeout: Option<Duration>,
    sleep: Option<Pin<Box<Sleep>>>,
}

impl Deadline {
    fn new(timeout: Option<Duration>) -> Self {
        Self {
            timeout,
            sleep: None,
        }
    }

    fn reset(&mut self) {
        self.sleep = None;
    }

    fn poll_stalled(&mut self, cx: &mut Context<'_>, op: &'static str) -> Poll<io::Error> {
        let Some(timeout) = self.timeout else {
            return Poll::Pending;
        };
        let sleep = self
            .sleep
            .get_or_insert_with(|| Box::pin(tokio::time::sleep(timeout)));
        match sleep.as_mut().poll(cx) {
            Poll::Ready(()) => {
                self.sleep = None;
                Poll::Ready(io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("{op} timed out after {timeout:?}"),
                ))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

/// An accepted TCP stream that holds its connection slot until dropped.
pub struct TrackedStream {
    inner: TcpStream,
    peer_addr: SocketAddr,
    read_deadline: Deadline,
    write_deadline: Deadline,
    _guard: ConnectionGuard,
}

impl TrackedStream {
    pub(crate) fn new(
        inner: TcpStream,
        peer_addr: SocketAddr,
        guard: ConnectionGuard,
        timeouts: StreamTimeouts,
    ) -> Self {
        Self {
            inner,
            peer_addr,
            read_deadline: Deadline::new(timeouts.read),
            write_deadline: Deadline::new(timeouts.write),
            _guard: guard,
        }
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn get_ref(&self) -> &TcpStream {
        &self.inner
    }
}

impl std::fmt::Debug for TrackedStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrackedStream")
            .field("peer_addr", &self.peer_addr)
            .finish_non_exhaustive()
    }
}

impl AsyncRead for TrackedStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        match Pin::new(&mut this.inner).poll_read(cx, buf) {
            Poll::Ready(result) => {
                this.read_deadline.reset();
                Poll::Ready(result)
            }
            Poll::Pending => this.read_deadline.poll_stalled(cx, "read").map(Err),
        }
    }
}

impl AsyncWrite for TrackedStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        match Pin::new(&mut this.inner).poll_write(cx, buf) {
            Poll::Ready(result) => {
                this.write_deadline.reset();
                Poll::Ready(result)
            }
            Poll::Pending => this.write_deadline.poll_stalled(cx, "write").map(Err),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        match Pin::new(&mut this.inner).poll_flush(cx) {
            Poll::Ready(result) => {
                this.write_deadline.reset();
                Poll::Ready(result)
            }
            Poll::Pending => this.write_deadline.poll_stalled(cx, "flush").map(Err),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }

    fn poll_write_vectored(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        match Pin::new(&mut this.inner).poll_write_vectored(cx, bufs) {
            Poll::Ready(result) => {
                this.write_deadline.reset();
                Poll::Ready(result)
            }
            Poll::Pending => this.write_deadline.poll_stalled(cx, "write").map(Err),
        }
    }

    fn is_write_vectored(&self) -> bool {
        self.inner.is_write_vectored()
    }
}

/// A connection handed to a [`ConnectionHandler`], after any TLS handshake.
pub enum Connection {
    Plain(TrackedStream),
    Tls(Box<tokio_rustls::server::TlsStream<TrackedStream>>),
}

impl Connection {
    pub fn peer_addr(&self) -> SocketAddr {
        match self {
            Connection::Plain(stream) => stream.peer_addr(),
            Connection::Tls(stream) => stream.get_ref().0.peer_addr(),
        }
    }

    pub fn is_tls(&self) -> bool {
        matches!(self, Connection::Tls(_))
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("peer_addr", &self.peer_addr())
            .field("tls", &self.is_tls())
            .finish()
    }
}

impl AsyncRead for Connection {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Connection::Plain(stream) => Pin::new(stream).poll_read(cx, buf),
            Connection::Tls(stream) => Pin::new(stream.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Connection {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Connection::Plain(stream) => Pin::new(stream).poll_write(cx, buf),
            Connection::Tls(stream) => Pin::new(stream.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Connection::Plain(stream) => Pin::new(stream).poll_flush(cx),
            Connection::Tls(stream) => Pin::new(stream.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Connection::Plain(stream) => Pin::new(stream).poll_shutdown(cx),
            Connection::Tls(stream) => Pin::new(stream.as_mut()).poll_shutdown(cx),
        }
    }
}

/// Serves one accepted connection.
///
/// Implemented for any `Fn(Connection) -> impl Future<Output = io::Result<()>>`.
pub trait ConnectionHandler: Send + Sync + 'static {
    fn handle(&self, conn: Connection) -> BoxFuture<'static, io::Result<()>>;
}

impl<F, Fut> ConnectionHandler for F
where
    F: Fn(Connection) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = io::Result<()>> + Send + 'static,
{
    fn handle(&self, conn: Connection) -> BoxFuture<'static, io::Result<()>> {
        Box::pin(self(conn))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[test]
    fn test_guard_counting() {
        let tracker = ConnectionTracker::new();
        assert_eq!(tracker.active(), 0);

        let mut guards: Vec<_> = (0..10).map(|_| tracker.guard()).collect();
        assert_eq!(tracker.active(), 10);

        guards.truncate(5);
        assert_eq!(tracker.active(), 5);

        drop(guards);
        assert_eq!(tracker.active(), 0);
    }

    #[tokio::test]
    async fn test_wait_idle_returns_immediately_when_empty() {
        let tracker = ConnectionTracker::new();
        tokio::time::timeout(Duration::from_secs(1), tracker.wait_idle())
            .await
            .expect("idle tracker should not block");
    }

    #[tokio::test]
    async fn test_wait_idle_wakes_on_last_release() {
        let tracker = ConnectionTracker::new();
        let first = tracker.guard();
        let second = tracker.guard();

        let waiter = {
            let tracker = tracker.clone();
            tokio::spawn(async move { tracker.wait_idle().await })
        };

        tokio::task::yield_now().await;
        drop(first);
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        drop(second);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should wake")
            .unwrap();
    }

    #[test]
    fn test_zero_timeouts_mean_none() {
        let timeouts = StreamTimeouts::new(Some(Duration::ZERO), Some(Duration::from_secs(2)));
        assert_eq!(timeouts.read, None);
        assert_eq!(timeouts.write, Some(Duration::from_secs(2)));
    }

    async fn tracked_pair(
        timeouts: StreamTimeouts,
    ) -> (ConnectionTracker, TrackedStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, peer) = listener.accept().await.unwrap();
        let tracker = ConnectionTracker::new();
        let stream = TrackedStream::new(server, peer, tracker.guard(), timeouts);
        (tracker, stream, client)
    }

    #[tokio::test]
    async fn test_stream_releases_slot_on_drop() {
        let (tracker, mut stream, mut client) = tracked_pair(StreamTimeouts::default()).await;
        assert_eq!(tracker.active(), 1);

        client.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        drop(stream);
        assert_eq!(tracker.active(), 0);
    }

    #[tokio::test]
    async fn test_read_timeout_fires_on_stalled_peer() {
        let timeouts = StreamTimeouts::new(Some(Duration::from_millis(50)), None);
        let (_tracker, mut stream, _client) = tracked_pair(timeouts).await;

        let mut buf = [0u8; 8];
        let err = stream.read(&mut buf).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
    }
}
