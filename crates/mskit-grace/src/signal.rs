//! Lifecycle signals and the queue that serializes their delivery.
//!
//! - `SIGHUP` → restart (spawn a child with the listeners; drain once it takes over)
//! - `SIGINT` → interrupt (drain and exit)
//! - `SIGTERM` → terminate (drain and exit)
//!
//! OS signals and programmatic triggers are pushed into one unbounded channel
//! that a single task consumes, so lifecycle transitions never race each other.

use std::fmt;

use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::error::GraceError;

/// A signal the lifecycle runtime knows how to handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LifecycleSignal {
    /// SIGHUP: hand the listeners to a new process, then drain.
    Restart,
    /// SIGINT: drain and exit.
    Interrupt,
    /// SIGTERM: drain and exit.
    Terminate,
}

impl LifecycleSignal {
    pub const ALL: [LifecycleSignal; 3] = [
        LifecycleSignal::Restart,
        LifecycleSignal::Interrupt,
        LifecycleSignal::Terminate,
    ];

    /// Raw signal number.
    pub fn as_raw(self) -> i32 {
        match self {
            LifecycleSignal::Restart => libc::SIGHUP,
            LifecycleSignal::Interrupt => libc::SIGINT,
            LifecycleSignal::Terminate => libc::SIGTERM,
        }
    }

    fn kind(self) -> SignalKind {
        SignalKind::from_raw(self.as_raw())
    }

    /// Whether this signal stops the process (as opposed to restarting it).
    pub fn is_stop(self) -> bool {
        matches!(self, LifecycleSignal::Interrupt | LifecycleSignal::Terminate)
    }
}

impl TryFrom<i32> for LifecycleSignal {
    type Error = GraceError;

    fn try_from(raw: i32) -> Result<Self, Self::Error> {
        match raw {
            libc::SIGHUP => Ok(LifecycleSignal::Restart),
            libc::SIGINT => Ok(LifecycleSignal::Interrupt),
            libc::SIGTERM => Ok(LifecycleSignal::Terminate),
            other => Err(GraceError::UnsupportedSignal(other)),
        }
    }
}

impl From<LifecycleSignal> for i32 {
    fn from(signal: LifecycleSignal) -> Self {
        signal.as_raw()
    }
}

impl fmt::Display for LifecycleSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LifecycleSignal::Restart => write!(f, "SIGHUP"),
            LifecycleSignal::Interrupt => write!(f, "SIGINT"),
            LifecycleSignal::Terminate => write!(f, "SIGTERM"),
        }
    }
}

/// What the runtime did with a delivered signal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalOutcome {
    /// A replacement process was spawned with the listeners attached.
    Restarted { pid: u32 },
    /// A restart was already in progress; nothing was done.
    RestartSkipped,
    /// Spawning the replacement failed; the restart guard was cleared.
    RestartFailed { reason: String },
    /// All services were told to drain.
    Stopping,
    /// The signal number is not one the runtime handles.
    Ignored,
}

/// One entry in the signal queue.
pub(crate) struct Dispatch {
    pub(crate) signal: i32,
    pub(crate) reply: Option<oneshot::Sender<SignalOutcome>>,
}

pub(crate) type DispatchSender = mpsc::UnboundedSender<Dispatch>;
pub(crate) type DispatchReceiver = mpsc::UnboundedReceiver<Dispatch>;

pub(crate) fn dispatch_channel() -> (DispatchSender, DispatchReceiver) {
    mpsc::unbounded_channel()
}

/// Forward SIGHUP, SIGINT and SIGTERM into the dispatch queue.
///
/// Registration happens before this returns, so a signal sent after the call
/// is never delivered with the default (process-killing) disposition.
pub(crate) fn forward_os_signals(tx: DispatchSender) -> std::io::Result<JoinHandle<()>> {
    let mut hup = signal(LifecycleSignal::Restart.kind())?;
    let mut int = signal(LifecycleSignal::Interrupt.kind())?;
    let mut term = signal(LifecycleSignal::Terminate.kind())?;
    info!(pid = std::process::id(), "Listening for SIGHUP, SIGINT and SIGTERM");

    Ok(tokio::spawn(async move {
        loop {
            let received = tokio::select! {
                Some(()) = hup.recv() => LifecycleSignal::Restart,
                Some(()) = int.recv() => LifecycleSignal::Interrupt,
                Some(()) = term.recv() => LifecycleSignal::Terminate,
                else => break,
            };
            debug!(signal = %received, "OS signal received");
            let dispatch = Dispatch {
                signal: received.as_raw(),
                reply: None,
            };
            if tx.send(dispatch).is_err() {
                debug!("Signal queue closed, no longer forwarding OS signals");
                break;
            }
        }
    }))
}
