//! The process-wide lifecycle handle.
//!
//! [`Grace`] owns the service registry, the hook table and the single task
//! that processes lifecycle signals one at a time. Embedding code creates one
//! per process, forwards OS signals into it and calls [`Grace::serve`] once per
//! address.

use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::process::{Child, Command};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::args::{GraceArgs, ProcessRole};
use crate::config::GraceConfig;
use crate::connection::ConnectionHandler;
use crate::error::{GraceError, Result};
use crate::hooks::{HookPhase, SignalHooks};
use crate::listener::{Listener, TrackedListener, INHERITED_FD_START};
use crate::registry::ServiceRegistry;
use crate::restart::{self, child_args, RestartPlan};
use crate::service::{ServeOptions, Service};
use crate::signal::{
    dispatch_channel, forward_os_signals, Dispatch, DispatchReceiver, DispatchSender,
    LifecycleSignal, SignalOutcome,
};
use crate::tls::{TlsListener, TlsOptions};

/// How long a restarted process waits before warning about inherited
/// listeners it has not adopted.
pub const ADOPTION_WARNING_DELAY: Duration = Duration::from_secs(30);

/// Handle to the lifecycle runtime. Cheap to clone.
#[derive(Clone)]
pub struct Grace {
    inner: Arc<GraceInner>,
}

struct GraceInner {
    role: ProcessRole,
    config: GraceConfig,
    registry: ServiceRegistry,
    hooks: Mutex<SignalHooks>,
    queue: DispatchSender,
    /// Descriptors handed over by the parent; zero for a fresh start.
    inherited: usize,
    adopted: AtomicUsize,
    /// Set once a stop signal has been processed.
    stopping: AtomicBool,
    os_signals: Mutex<Option<JoinHandle<()>>>,
}

impl Grace {
    /// Create the runtime and start its signal-processing task.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(args: &GraceArgs, config: GraceConfig) -> Self {
        let role = args.role();
        let registry = match role {
            ProcessRole::Parent => ServiceRegistry::new(),
            ProcessRole::Child => ServiceRegistry::with_order(args.socket_order.iter().cloned()),
        };
        let (queue, rx) = dispatch_channel();

        let inner = Arc::new(GraceInner {
            role,
            config,
            registry,
            hooks: Mutex::new(SignalHooks::new()),
            queue,
            inherited: args.inherited_count(),
            adopted: AtomicUsize::new(0),
            stopping: AtomicBool::new(false),
            os_signals: Mutex::new(None),
        });

        tokio::spawn(process_signals(Arc::downgrade(&inner), rx));
        if role == ProcessRole::Child {
            tokio::spawn(warn_unadopted(Arc::downgrade(&inner)));
        }
        info!(
            pid = std::process::id(),
            role = %role,
            inherited = inner.inherited,
            "Lifecycle runtime started"
        );

        Self { inner }
    }

    /// Forward SIGHUP, SIGINT and SIGTERM into the signal queue.
    ///
    /// Calling this more than once has no further effect.
    pub fn handle_os_signals(&self) -> Result<()> {
        let mut slot = self.inner.os_signals.lock();
        if slot.is_some() {
            return Ok(());
        }
        *slot = Some(forward_os_signals(self.inner.queue.clone())?);
        Ok(())
    }

    /// Register a callback to run before or after the built-in handling of `signal`.
    ///
    /// Only SIGHUP, SIGINT and SIGTERM are accepted. Hooks run on the signal
    /// task and must not register further hooks.
    pub fn register_signal_hook<F>(&self, phase: HookPhase, signal: i32, hook: F) -> Result<()>
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.inner.hooks.lock().register(phase, signal, hook)
    }

    /// Deliver `signal` through the same queue as OS signals and wait for the result.
    pub async fn trigger(&self, signal: impl Into<i32>) -> Result<SignalOutcome> {
        let (reply, outcome) = oneshot::channel();
        self.inner
            .queue
            .send(Dispatch {
                signal: signal.into(),
                reply: Some(reply),
            })
            .map_err(|_| GraceError::RuntimeClosed)?;
        outcome.await.map_err(|_| GraceError::RuntimeClosed)
    }

    /// Serve `address` until its service terminates.
    ///
    /// A fresh process binds the address; a restarted one adopts the listener
    /// its parent handed over for the address's ordinal. Returns once the
    /// service has drained.
    pub async fn serve<H>(&self, address: &str, handler: H, options: ServeOptions) -> Result<()>
    where
        H: ConnectionHandler,
    {
        let inner = &self.inner;
        if inner.stopping.load(Ordering::SeqCst) {
            return Err(GraceError::ShuttingDown);
        }

        let ordinal = inner.registry.reserve(address)?;
        let listener = match inner.open_listener(address, ordinal, &options).await {
            Ok(listener) => listener,
            Err(e) => {
                inner.registry.release(ordinal);
                return Err(e);
            }
        };

        let service = Arc::new(Service::new(
            address.to_string(),
            options,
            listener,
            Arc::new(handler),
            inner.config.drain_timeout,
        ));
        inner.registry.attach(ordinal, Arc::clone(&service))?;
        service.controller().start();
        info!(address, ordinal, pid = std::process::id(), "Serving");

        if inner.role == ProcessRole::Child {
            inner.record_adoption();
        }

        // A stop processed while this service was starting did not see it.
        if inner.stopping.load(Ordering::SeqCst) {
            service.controller().shutdown();
        }

        service.run().await;
        Ok(())
    }

    pub fn role(&self) -> ProcessRole {
        self.inner.role
    }

    pub fn registry(&self) -> &ServiceRegistry {
        &self.inner.registry
    }

    pub fn config(&self) -> &GraceConfig {
        &self.inner.config
    }

    pub fn restart_in_progress(&self) -> bool {
        self.inner.registry.restart_in_progress()
    }

    /// Inherited addresses this process has not started serving yet.
    ///
    /// The parent is told to drain only once this is empty. Always empty for
    /// a fresh start.
    pub fn pending_adoptions(&self) -> Vec<String> {
        self.inner.pending_adoptions()
    }

    /// Whether a stop signal has been processed.
    pub fn is_stopping(&self) -> bool {
        self.inner.stopping.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for Grace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Grace")
            .field("role", &self.inner.role)
            .field("registry", &self.inner.registry)
            .field("stopping", &self.is_stopping())
            .finish_non_exhaustive()
    }
}

/// Warn once if the parent is still waiting on listeners this process never adopted.
async fn warn_unadopted(inner: Weak<GraceInner>) {
    tokio::time::sleep(ADOPTION_WARNING_DELAY).await;
    let Some(inner) = inner.upgrade() else {
        return;
    };
    let adopted = inner.adopted.load(Ordering::SeqCst);
    if adopted >= inner.inherited || inner.stopping.load(Ordering::SeqCst) {
        return;
    }
    warn!(
        adopted,
        inherited = inner.inherited,
        pending = ?inner.pending_adoptions(),
        "Inherited listeners not served; parent process keeps running until they are"
    );
}

async fn process_signals(inner: Weak<GraceInner>, mut rx: DispatchReceiver) {
    while let Some(dispatch) = rx.recv().await {
        let Some(inner) = inner.upgrade() else {
            break;
        };
        let outcome = inner.handle_signal(dispatch.signal);
        if let Some(reply) = dispatch.reply {
            let _ = reply.send(outcome);
        }
    }
    debug!("Signal processing stopped");
}

impl GraceInner {
    fn handle_signal(self: &Arc<Self>, raw: i32) -> SignalOutcome {
        let signal = match LifecycleSignal::try_from(raw) {
            Ok(signal) => signal,
            Err(_) => {
                warn!(signal = raw, "Ignoring unsupported signal");
                return SignalOutcome::Ignored;
            }
        };
        info!(%signal, pid = std::process::id(), "Received signal");

        self.hooks.lock().run(HookPhase::Before, signal);
        let outcome = match signal {
            LifecycleSignal::Restart => self.restart(),
            LifecycleSignal::Interrupt | LifecycleSignal::Terminate => self.stop(signal),
        };
        self.hooks.lock().run(HookPhase::After, signal);

        debug!(%signal, ?outcome, "Signal handled");
        outcome
    }

    fn restart(self: &Arc<Self>) -> SignalOutcome {
        if self.stopping.load(Ordering::SeqCst) {
            info!("Already stopping, ignoring restart");
            return SignalOutcome::RestartSkipped;
        }
        if !self.registry.try_begin_restart() {
            info!("Restart already in progress, ignoring");
            return SignalOutcome::RestartSkipped;
        }

        match self.spawn_replacement() {
            Ok(child) => {
                let pid = child.id().unwrap_or_default();
                info!(child_pid = pid, "Replacement process started");
                self.supervise(child, pid);
                SignalOutcome::Restarted { pid }
            }
            Err(e) => {
                error!(error = %e, "Restart failed, continuing to serve");
                self.registry.clear_restart();
                SignalOutcome::RestartFailed {
                    reason: e.to_string(),
                }
            }
        }
    }

    fn spawn_replacement(&self) -> Result<Child> {
        let plan = RestartPlan::from_snapshot(self.registry.snapshot()?);
        if plan.is_empty() {
            return Err(GraceError::NoListeners);
        }
        let program = self.config.program().map_err(GraceError::Restart)?;
        let args = child_args(&self.config.base_args(), &plan.order);

        info!(
            program = %program.display(),
            listeners = plan.len(),
            order = ?plan.order,
            "Spawning replacement process"
        );

        let mut command = Command::new(&program);
        command.args(&args);
        restart::spawn_with_descriptors(command, plan.descriptors).map_err(GraceError::Restart)
    }

    /// Watch the child. If it exits while this process is still serving, it
    /// never took over, so the guard is cleared for the next attempt.
    fn supervise(self: &Arc<Self>, mut child: Child, pid: u32) {
        let inner = Arc::downgrade(self);
        tokio::spawn(async move {
            let status = child.wait().await;
            let Some(inner) = inner.upgrade() else {
                return;
            };
            if inner.stopping.load(Ordering::SeqCst) {
                debug!(child_pid = pid, ?status, "Replacement process exited");
                return;
            }
            error!(
                child_pid = pid,
                ?status,
                "Replacement process exited before taking over, restart guard cleared"
            );
            inner.registry.clear_restart();
        });
    }

    fn stop(&self, signal: LifecycleSignal) -> SignalOutcome {
        if self.stopping.swap(true, Ordering::SeqCst) {
            debug!(%signal, "Already stopping");
        }
        let services = self.registry.services();
        info!(%signal, services = services.len(), "Stopping all services");
        for service in services {
            service.controller().shutdown();
        }
        SignalOutcome::Stopping
    }

    async fn open_listener(
        &self,
        address: &str,
        ordinal: usize,
        options: &ServeOptions,
    ) -> Result<Arc<dyn Listener>> {
        // Load TLS material first so a bad certificate never leaves a bound socket behind.
        let acceptor = options.tls.as_ref().map(TlsOptions::acceptor).transpose()?;
        let timeouts = options.timeouts();

        let plain = match self.role {
            ProcessRole::Parent => TrackedListener::bind(address, options.network, timeouts).await?,
            ProcessRole::Child => {
                if ordinal >= self.inherited {
                    return Err(GraceError::NotInherited {
                        address: address.to_string(),
                        ordinal,
                    });
                }
                let fd = INHERITED_FD_START + ordinal as RawFd;
                TrackedListener::from_inherited(address, fd, timeouts)?
            }
        };

        Ok(match acceptor {
            Some(acceptor) => Arc::new(TlsListener::new(plain, acceptor)),
            None => Arc::new(plain),
        })
    }

    fn pending_adoptions(&self) -> Vec<String> {
        if self.role == ProcessRole::Parent {
            return Vec::new();
        }
        self.registry
            .unattached()
            .into_iter()
            .filter(|(ordinal, _)| *ordinal < self.inherited)
            .map(|(_, address)| address)
            .collect()
    }

    /// Count one adopted listener; the last one tells the parent to drain.
    fn record_adoption(&self) {
        let adopted = self.adopted.fetch_add(1, Ordering::SeqCst) + 1;
        if adopted != self.inherited {
            debug!(
                adopted,
                inherited = self.inherited,
                pending = ?self.pending_adoptions(),
                "Waiting for remaining inherited listeners"
            );
            return;
        }
        if let Err(e) = restart::notify_parent() {
            error!(error = %e, "Failed to notify parent process");
        }
    }
}
