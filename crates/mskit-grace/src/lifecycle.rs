//! Per-service lifecycle: `Initializing → Running → Draining → Terminated`.
//!
//! The controller owns one listener and its accept loop. A stop trigger closes
//! the listener (no new accepts) and arms the drain watchdog; the service is
//! terminated once the accept loop has exited and every live connection has
//! finished, or when the watchdog expires. On expiry the watchdog cancels the
//! connection tasks, which drops their streams and releases each connection slot
//! through its own guard. The counter is never decremented on anyone's behalf.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::connection::{ConnectionHandler, TrackedStream};
use crate::listener::{AcceptError, Listener};

const MIN_ACCEPT_BACKOFF: Duration = Duration::from_millis(5);
const MAX_ACCEPT_BACKOFF: Duration = Duration::from_secs(1);

/// Lifecycle state of one service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Initializing,
    Running,
    Draining,
    Terminated,
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LifecycleState::Initializing => write!(f, "initializing"),
            LifecycleState::Running => write!(f, "running"),
            LifecycleState::Draining => write!(f, "draining"),
            LifecycleState::Terminated => write!(f, "terminated"),
        }
    }
}

/// Drives one listener through its lifecycle.
pub struct LifecycleController {
    listener: Arc<dyn Listener>,
    state: watch::Sender<LifecycleState>,
    drain_timeout: Option<Duration>,
    /// Cancelled by the watchdog to abort every in-flight connection task.
    hammer: CancellationToken,
}

impl LifecycleController {
    /// A controller in `Initializing`. `drain_timeout` of `None` waits forever.
    pub fn new(listener: Arc<dyn Listener>, drain_timeout: Option<Duration>) -> Self {
        let (state, _) = watch::channel(LifecycleState::Initializing);
        Self {
            listener,
            state,
            drain_timeout: drain_timeout.filter(|d| !d.is_zero()),
            hammer: CancellationToken::new(),
        }
    }

    pub fn state(&self) -> LifecycleState {
        *self.state.borrow()
    }

    pub fn listener(&self) -> &Arc<dyn Listener> {
        &self.listener
    }

    pub fn active_count(&self) -> usize {
        self.listener.active_count()
    }

    pub fn drain_timeout(&self) -> Option<Duration> {
        self.drain_timeout
    }

    /// Watch state changes.
    pub fn subscribe(&self) -> watch::Receiver<LifecycleState> {
        self.state.subscribe()
    }

    /// Resolve once the controller is `Terminated`.
    pub async fn wait_terminated(&self) {
        let mut rx = self.state.subscribe();
        let _ = rx.wait_for(|s| *s == LifecycleState::Terminated).await;
    }

    fn transition(&self, from: &[LifecycleState], to: LifecycleState) -> bool {
        self.state.send_if_modified(|state| {
            if from.contains(state) {
                *state = to;
                true
            } else {
                false
            }
        })
    }

    /// `Initializing → Running`. Returns `false` if the controller has moved on.
    pub fn start(&self) -> bool {
        let started = self.transition(&[LifecycleState::Initializing], LifecycleState::Running);
        if started {
            info!(
                address = %self.listener.local_addr(),
                pid = std::process::id(),
                "Service running"
            );
        }
        started
    }

    /// `Running → Draining`: close the listener and arm the watchdog.
    ///
    /// A second call while already draining (or terminated) is a no-op.
    pub fn shutdown(self: &Arc<Self>) -> bool {
        if !self.transition(
            &[LifecycleState::Initializing, LifecycleState::Running],
            LifecycleState::Draining,
        ) {
            debug!(state = %self.state(), "Shutdown requested again, ignoring");
            return false;
        }

        self.listener.close();
        info!(
            address = %self.listener.local_addr(),
            active_connections = self.listener.active_count(),
            drain_timeout = ?self.drain_timeout,
            "Stopped accepting, draining connections"
        );

        if let Some(timeout) = self.drain_timeout {
            self.spawn_watchdog(timeout);
        }
        true
    }

    fn spawn_watchdog(self: &Arc<Self>, timeout: Duration) {
        let controller = Arc::clone(self);
        tokio::spawn(async move {
            tokio::select! {
                _ = controller.wait_terminated() => {
                    debug!("Drain finished before the watchdog fired");
                }
                _ = tokio::time::sleep(timeout) => {
                    controller.force_terminate(timeout);
                }
            }
        });
    }

    fn force_terminate(&self, timeout: Duration) {
        if self.state() != LifecycleState::Draining {
            return;
        }
        warn!(
            address = %self.listener.local_addr(),
            remaining_connections = self.listener.active_count(),
            timeout_secs = timeout.as_secs(),
            "Drain timeout expired, force-closing connections"
        );
        self.hammer.cancel();
        self.terminate();
    }

    fn terminate(&self) {
        if self.transition(&[LifecycleState::Draining], LifecycleState::Terminated) {
            info!(
                address = %self.listener.local_addr(),
                pid = std::process::id(),
                "Service terminated"
            );
        }
    }

    /// Run the accept loop until the listener closes, then drain.
    ///
    /// Returns once the controller is `Terminated`.
    pub async fn run(self: &Arc<Self>, handler: Arc<dyn ConnectionHandler>) {
        self.start();
        let address = self.listener.local_addr();
        let mut backoff = MIN_ACCEPT_BACKOFF;

        loop {
            match self.listener.accept().await {
                Ok(stream) => {
                    backoff = MIN_ACCEPT_BACKOFF;
                    self.spawn_connection(stream, &handler);
                }
                Err(AcceptError::Closed) => break,
                Err(AcceptError::Io(e)) => {
                    warn!(%address, error = %e, retry_in = ?backoff, "Accept failed, retrying");
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(MAX_ACCEPT_BACKOFF);
                }
            }
        }

        // The listener can also be closed directly; treat that as a stop trigger.
        self.shutdown();
        self.drain().await;
    }

    async fn drain(&self) {
        let active = self.listener.active_count();
        if active > 0 {
            info!(
                address = %self.listener.local_addr(),
                active_connections = active,
                "Waiting for connections to finish"
            );
        }

        tokio::select! {
            _ = self.listener.tracker().wait_idle() => {
                info!(address = %self.listener.local_addr(), "All connections drained cleanly");
            }
            _ = self.hammer.cancelled() => {}
        }
        self.terminate();
    }

    fn spawn_connection(&self, stream: TrackedStream, handler: &Arc<dyn ConnectionHandler>) {
        let span = info_span!(
            "grace.connection",
            address = %self.listener.local_addr(),
            peer = %stream.peer_addr(),
        );
        let establish = self.listener.establish(stream);
        let handler = Arc::clone(handler);
        let hammer = self.hammer.clone();

        tokio::spawn(
            async move {
                let serve = async move {
                    let conn = establish.await?;
                    handler.handle(conn).await
                };
                tokio::select! {
                    biased;
                    _ = hammer.cancelled() => {
                        debug!("Connection force-closed by drain watchdog");
                    }
                    result = serve => {
                        if let Err(e) = result {
                            debug!(error = %e, "Connection ended with error");
                        }
                    }
                }
            }
            .instrument(span),
        );
    }
}

impl fmt::Debug for LifecycleController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LifecycleController")
            .field("address", &self.listener.local_addr())
            .field("state", &self.state())
            .field("active", &self.listener.active_count())
            .field("drain_timeout", &self.drain_timeout)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{Connection, StreamTimeouts};
    use crate::listener::{Network, TrackedListener};
    use std::io;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;
    use tokio::task::JoinHandle;

    async fn echo(mut conn: Connection) -> io::Result<()> {
        let mut buf = [0u8; 64];
        loop {
            let n = conn.read(&mut buf).await?;
            if n == 0 {
                return Ok(());
            }
            conn.write_all(&buf[..n]).await?;
        }
    }

    async fn started(
        drain_timeout: Option<Duration>,
    ) -> (Arc<LifecycleController>, JoinHandle<()>) {
        let listener =
            TrackedListener::bind("127.0.0.1:0", Network::Tcp, StreamTimeouts::default())
                .await
                .unwrap();
        let controller = Arc::new(LifecycleController::new(Arc::new(listener), drain_timeout));
        let task = {
            let controller = Arc::clone(&controller);
            tokio::spawn(async move { controller.run(Arc::new(echo)).await })
        };
        wait_for(|| controller.state() == LifecycleState::Running).await;
        (controller, task)
    }

    async fn connect_echo(controller: &LifecycleController) -> TcpStream {
        let mut client = TcpStream::connect(controller.listener().local_addr())
            .await
            .unwrap();
        client.write_all(b"hi").await.unwrap();
        let mut buf = [0u8; 2];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hi");
        client
    }

    async fn wait_for(mut condition: impl FnMut() -> bool) {
        for _ in 0..500 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn test_initial_state() {
        let listener =
            TrackedListener::bind("127.0.0.1:0", Network::Tcp, StreamTimeouts::default())
                .await
                .unwrap();
        let controller = LifecycleController::new(Arc::new(listener), Some(Duration::ZERO));
        assert_eq!(controller.state(), LifecycleState::Initializing);
        assert_eq!(controller.drain_timeout(), None);
        assert!(controller.start());
        assert!(!controller.start());
    }

    #[tokio::test]
    async fn test_drain_waits_for_live_connections() {
        let (controller, task) = started(Some(Duration::from_secs(30))).await;
        let first = connect_echo(&controller).await;
        let second = connect_echo(&controller).await;
        assert_eq!(controller.active_count(), 2);

        assert!(controller.shutdown());
        assert!(!controller.shutdown());
        assert_eq!(controller.state(), LifecycleState::Draining);
        assert!(controller.listener().is_closed());

        drop(first);
        wait_for(|| controller.active_count() == 1).await;
        assert_eq!(controller.state(), LifecycleState::Draining);

        drop(second);
        tokio::time::timeout(Duration::from_secs(5), controller.wait_terminated())
            .await
            .expect("controller should terminate once idle");
        task.await.unwrap();
        assert_eq!(controller.active_count(), 0);
    }

    #[tokio::test]
    async fn test_idle_service_terminates_immediately() {
        let (controller, task) = started(None).await;
        controller.shutdown();
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .expect("idle drain should complete")
            .unwrap();
        assert_eq!(controller.state(), LifecycleState::Terminated);
    }

    #[tokio::test]
    async fn test_disabled_watchdog_waits_indefinitely() {
        let (controller, task) = started(None).await;
        let client = connect_echo(&controller).await;

        tokio::time::pause();
        controller.shutdown();
        tokio::time::sleep(Duration::from_secs(7 * 24 * 3600)).await;
        assert_eq!(controller.state(), LifecycleState::Draining);
        assert_eq!(controller.active_count(), 1);
        tokio::time::resume();

        drop(client);
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .expect("drain should finish once the client leaves")
            .unwrap();
        assert_eq!(controller.state(), LifecycleState::Terminated);
        assert_eq!(controller.active_count(), 0);
    }

    #[tokio::test]
    async fn test_watchdog_forces_termination() {
        let timeout = Duration::from_secs(30);
        let (controller, task) = started(Some(timeout)).await;
        let _first = connect_echo(&controller).await;
        let _second = connect_echo(&controller).await;

        tokio::time::pause();
        let began = tokio::time::Instant::now();
        controller.shutdown();
        controller.wait_terminated().await;
        assert!(began.elapsed() >= timeout);
        assert_eq!(controller.state(), LifecycleState::Terminated);
        tokio::time::resume();

        // Aborted tasks release their own slots; the count settles at zero.
        wait_for(|| controller.active_count() == 0).await;
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .expect("run should return after forced termination")
            .unwrap();
    }

    #[tokio::test]
    async fn test_direct_listener_close_drains() {
        let (controller, task) = started(None).await;
        controller.listener().close();
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .expect("closing the listener should end the service")
            .unwrap();
        assert_eq!(controller.state(), LifecycleState::Terminated);
    }
}
