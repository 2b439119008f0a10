//! A service: one bind address, its listener, handler and lifecycle.

use std::sync::Arc;
use std::time::Duration;

use crate::connection::{ConnectionHandler, StreamTimeouts};
use crate::lifecycle::{LifecycleController, LifecycleState};
use crate::listener::{Listener, Network};
use crate::tls::TlsOptions;

/// How a service listens and treats its connections.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServeOptions {
    pub network: Network,
    pub read_timeout: Option<Duration>,
    pub write_timeout: Option<Duration>,
    pub tls: Option<TlsOptions>,
}

impl ServeOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_network(mut self, network: Network) -> Self {
        self.network = network;
        self
    }

    /// Apply the same timeout to reads and writes, like a server-wide I/O timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = Some(timeout);
        self.write_timeout = Some(timeout);
        self
    }

    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = Some(timeout);
        self
    }

    pub fn with_write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = Some(timeout);
        self
    }

    pub fn with_tls(mut self, tls: TlsOptions) -> Self {
        self.tls = Some(tls);
        self
    }

    pub fn timeouts(&self) -> StreamTimeouts {
        StreamTimeouts::new(self.read_timeout, self.write_timeout)
    }
}

/// One running service, owned by the process that started it.
pub struct Service {
    address: String,
    options: ServeOptions,
    handler: Arc<dyn ConnectionHandler>,
    controller: Arc<LifecycleController>,
}

impl Service {
    pub fn new(
        address: String,
        options: ServeOptions,
        listener: Arc<dyn Listener>,
        handler: Arc<dyn ConnectionHandler>,
        drain_timeout: Option<Duration>,
    ) -> Self {
        Self {
            address,
            options,
            handler,
            controller: Arc::new(LifecycleController::new(listener, drain_timeout)),
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn options(&self) -> &ServeOptions {
        &self.options
    }

    pub fn controller(&self) -> &Arc<LifecycleController> {
        &self.controller
    }

    pub fn listener(&self) -> &Arc<dyn Listener> {
        self.controller.listener()
    }

    pub fn state(&self) -> LifecycleState {
        self.controller.state()
    }

    /// Serve until terminated.
    pub async fn run(&self) {
        self.controller.run(Arc::clone(&self.handler)).await
    }
}

impl std::fmt::Debug for Service {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Service")
            .field("address", &self.address)
            .field("network", &self.options.network)
            .field("tls", &self.options.tls.is_some())
            .field("controller", &self.controller)
            .finish()
    }
}
