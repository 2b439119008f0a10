//! Spawning the replacement process with the listeners attached.
//!
//! The parent duplicates every open listener descriptor, then spawns its own
//! binary again with `--graceful` (and `--socket-order` when more than one
//! listener is handed over). In the child, between fork and exec, the
//! descriptors are moved into the contiguous range `3..3+N` in snapshot order
//! with CLOEXEC cleared, so descriptor `3 + i` is the listener for the i-th
//! address of the order.
//!
//! The child signals its parent with `SIGTERM` once every inherited listener
//! is accepting again; the parent then drains as for any other stop.

use std::ffi::OsString;
use std::io;
use std::os::unix::io::{AsRawFd, OwnedFd, RawFd};

use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

use crate::listener::INHERITED_FD_START;
use crate::registry::SnapshotEntry;

/// Marks a process spawned by a restart.
pub const RESTART_FLAG: &str = "--graceful";

/// Carries the inherited listener addresses in descriptor order.
pub const SOCKET_ORDER_FLAG: &str = "--socket-order";

/// Descriptors and their address order, ready to hand to a child.
#[derive(Debug)]
pub struct RestartPlan {
    /// Address of descriptor `3 + i` at position `i`.
    pub order: Vec<String>,
    pub descriptors: Vec<OwnedFd>,
}

impl RestartPlan {
    /// Lay out a registry snapshot. Positions follow the snapshot's ordinal order,
    /// so they become the child's ordinals.
    pub fn from_snapshot(entries: Vec<SnapshotEntry>) -> Self {
        let mut order = Vec::with_capacity(entries.len());
        let mut descriptors = Vec::with_capacity(entries.len());
        for entry in entries {
            debug!(
                address = %entry.address,
                parent_ordinal = entry.ordinal,
                child_fd = INHERITED_FD_START + order.len() as RawFd,
                "Planned descriptor handoff"
            );
            order.push(entry.address);
            descriptors.push(entry.descriptor);
        }
        Self { order, descriptors }
    }

    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }
}

/// Arguments for the child: `base` without any earlier restart markers, then
/// the restart marker and, for more than one listener, the address order.
pub fn child_args(base: &[OsString], order: &[String]) -> Vec<OsString> {
    let order_prefix = format!("{}=", SOCKET_ORDER_FLAG);
    let mut args = Vec::with_capacity(base.len() + 2);
    let mut iter = base.iter();
    while let Some(arg) = iter.next() {
        match arg.to_str() {
            Some(RESTART_FLAG) => {}
            Some(SOCKET_ORDER_FLAG) => {
                // Separate value form: `--socket-order a,b`.
                iter.next();
            }
            Some(s) if s.starts_with(&order_prefix) => {}
            _ => args.push(arg.clone()),
        }
    }

    args.push(OsString::from(RESTART_FLAG));
    if order.len() > 1 {
        args.push(OsString::from(format!("{}{}", order_prefix, order.join(","))));
    }
    args
}

/// Spawn `command` with `descriptors` placed at fd 3, 4, ... in order.
///
/// The descriptors stay open in this process until the spawn returns and are
/// closed afterwards; the listeners they were duplicated from are unaffected.
pub fn spawn_with_descriptors(mut command: Command, descriptors: Vec<OwnedFd>) -> io::Result<Child> {
    let sources: Vec<RawFd> = descriptors.iter().map(AsRawFd::as_raw_fd).collect();
    let mut staged: Vec<RawFd> = vec![-1; sources.len()];
    let floor = INHERITED_FD_START + sources.len() as RawFd;

    // SAFETY: the closure only calls async-signal-safe libc functions and
    // writes into buffers allocated before the fork.
    unsafe {
        command.pre_exec(move || {
            // Stage every source above the target range first, so placing one
            // descriptor never overwrites a source that is still to be moved.
            for (slot, &fd) in staged.iter_mut().zip(sources.iter()) {
                let high = libc::fcntl(fd, libc::F_DUPFD, floor);
                if high < 0 {
                    return Err(io::Error::last_os_error());
                }
                *slot = high;
            }
            for (i, &fd) in staged.iter().enumerate() {
                // dup2 leaves CLOEXEC clear on the target.
                if libc::dup2(fd, INHERITED_FD_START + i as RawFd) < 0 {
                    return Err(io::Error::last_os_error());
                }
                libc::close(fd);
            }
            Ok(())
        });
    }

    let child = command.spawn();
    drop(descriptors);
    child
}

/// Tell the parent that this process has taken over its listeners.
///
/// Returns the parent pid, or `None` when the process has already been
/// reparented and there is nobody to notify.
pub fn notify_parent() -> io::Result<Option<u32>> {
    let ppid = unsafe { libc::getppid() };
    if ppid <= 1 {
        warn!("Parent process is gone, nothing to notify");
        return Ok(None);
    }
    if unsafe { libc::kill(ppid, libc::SIGTERM) } < 0 {
        return Err(io::Error::last_os_error());
    }
    info!(parent_pid = ppid, "Notified parent to drain");
    Ok(Some(ppid as u32))
}
