//! Command-line markers passed from a restarting process to its replacement.
//!
//! Embedding binaries flatten [`GraceArgs`] into their own clap parser. Both
//! flags are hidden: operators never set them by hand.

use std::fmt;

use clap::Args;

/// Restart markers parsed from the command line.
#[derive(Args, Debug, Clone, Default, PartialEq, Eq)]
pub struct GraceArgs {
    /// Set when this process was spawned by a restart and inherits listeners.
    #[arg(long = "graceful", hide = true)]
    pub graceful: bool,

    /// Addresses of the inherited listeners, in descriptor order.
    #[arg(long = "socket-order", hide = true, value_delimiter = ',')]
    pub socket_order: Vec<String>,
}

impl GraceArgs {
    /// Markers for a process spawned by a restart.
    pub fn inherited<I, S>(socket_order: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            graceful: true,
            socket_order: socket_order.into_iter().map(Into::into).collect(),
        }
    }

    pub fn role(&self) -> ProcessRole {
        if self.graceful {
            ProcessRole::Child
        } else {
            ProcessRole::Parent
        }
    }

    /// Number of descriptors the parent handed over.
    ///
    /// A single listener is passed without an order, so a graceful start with
    /// no order still means one descriptor at fd 3.
    pub fn inherited_count(&self) -> usize {
        match self.role() {
            ProcessRole::Parent => 0,
            ProcessRole::Child => self.socket_order.len().max(1),
        }
    }
}

/// Whether the process bound its own listeners or inherited them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessRole {
    Parent,
    Child,
}

impl fmt::Display for ProcessRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProcessRole::Parent => write!(f, "parent"),
            ProcessRole::Child => write!(f, "child"),
        }
    }
}
