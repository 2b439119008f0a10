//! Error types for listener handoff and lifecycle control.

use std::os::unix::io::RawFd;

use thiserror::Error;

/// Errors reported by the lifecycle runtime.
#[derive(Debug, Error)]
pub enum GraceError {
    /// IO error (socket, descriptor or process plumbing)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A fresh listener could not be bound.
    #[error("failed to bind {address}: {source}")]
    Bind {
        address: String,
        #[source]
        source: std::io::Error,
    },

    /// An inherited descriptor could not be turned into a listener.
    #[error("failed to inherit listener for {address} from fd {fd}: {reason}")]
    Inherit {
        address: String,
        fd: RawFd,
        reason: String,
    },

    /// The process was restarted but this address was not handed over by the parent.
    #[error("address {address} (ordinal {ordinal}) was not inherited from the parent process")]
    NotInherited { address: String, ordinal: usize },

    /// The address already has a running service in this process.
    #[error("address {0} is already being served")]
    AlreadyServing(String),

    /// The address did not resolve to anything usable for the requested network.
    #[error("no {network} address resolved for {address}")]
    Resolve { address: String, network: String },

    /// Hook registration for a signal the runtime does not handle.
    #[error("signal {0} is not supported (expected SIGHUP, SIGINT or SIGTERM)")]
    UnsupportedSignal(i32),

    /// Unknown network kind string.
    #[error("unsupported network {0:?} (expected tcp, tcp4 or tcp6)")]
    UnsupportedNetwork(String),

    /// TLS material could not be loaded.
    #[error("TLS configuration error: {0}")]
    Tls(String),

    /// No open listener was left to hand to a replacement process.
    #[error("no open listeners to hand over")]
    NoListeners,

    /// Spawning the replacement process failed.
    #[error("restart failed: {0}")]
    Restart(#[source] std::io::Error),

    /// A stop signal was already processed; no new services may start.
    #[error("process is shutting down")]
    ShuttingDown,

    /// The signal-processing task is gone.
    #[error("lifecycle runtime has shut down")]
    RuntimeClosed,
}

impl GraceError {
    /// Create a new TLS configuration error.
    pub fn tls(msg: impl Into<String>) -> Self {
        Self::Tls(msg.into())
    }

    /// Create a new inheritance error.
    pub fn inherit(address: impl Into<String>, fd: RawFd, reason: impl Into<String>) -> Self {
        Self::Inherit {
            address: address.into(),
            fd,
            reason: reason.into(),
        }
    }
}

/// Result alias for lifecycle operations.
pub type Result<T> = std::result::Result<T, GraceError>;
