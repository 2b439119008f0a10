//! # mskit-grace
//!
//! Zero-downtime restarts and graceful shutdown for mskit services.
//!
//! ## Overview
//!
//! A restart hands every listening socket to a new process without closing it:
//! 1. The running process duplicates its listener descriptors and spawns its
//!    own binary again with the descriptors at fd 3, 4, ... and a hidden
//!    `--graceful` marker (plus `--socket-order` when there is more than one)
//! 2. The new process adopts the inherited sockets and starts accepting
//! 3. Once every inherited socket is live it sends `SIGTERM` to its parent
//! 4. The parent stops accepting, drains in-flight connections and exits
//!
//! The new process must serve every address it inherited. The parent is only
//! told to drain after the last one is adopted, so a replacement configured
//! with fewer addresses leaves the parent running. It logs a warning naming
//! the missing addresses after [`ADOPTION_WARNING_DELAY`], and
//! [`Grace::pending_adoptions`] reports them at any time.
//!
//! ## Signal Conventions
//!
//! - `SIGHUP`: Graceful restart (spawn a replacement with the listeners)
//! - `SIGINT`: Graceful shutdown
//! - `SIGTERM`: Graceful shutdown
//!
//! Hooks can be registered to run before and after each of these.
//!
//! ## Environment Variables
//!
//! - `MSKIT_DRAIN_TIMEOUT_SECS`: Drain timeout in seconds (default: 60, `0` waits forever)
//!
//! ## Platform
//!
//! This crate requires Unix (Linux / macOS). It will not compile on other platforms.

#[cfg(not(unix))]
compile_error!("mskit-grace requires a Unix platform (Linux or macOS)");

mod args;
mod config;
mod connection;
mod error;
mod grace;
mod hooks;
mod lifecycle;
mod listener;
mod registry;
pub mod restart;
mod service;
mod signal;
mod tls;

pub use args::{GraceArgs, ProcessRole};
pub use config::{GraceConfig, DEFAULT_DRAIN_TIMEOUT, DRAIN_TIMEOUT_ENV};
pub use connection::{
    Connection, ConnectionGuard, ConnectionHandler, ConnectionTracker, StreamTimeouts,
    TrackedStream,
};
pub use error::{GraceError, Result};
pub use grace::{Grace, ADOPTION_WARNING_DELAY};
pub use hooks::{HookPhase, SignalHooks};
pub use lifecycle::{LifecycleController, LifecycleState};
pub use listener::{AcceptError, Listener, Network, TrackedListener, INHERITED_FD_START};
pub use registry::{ServiceRegistry, SnapshotEntry};
pub use service::{ServeOptions, Service};
pub use signal::{LifecycleSignal, SignalOutcome};
pub use tls::{TlsListener, TlsOptions};
