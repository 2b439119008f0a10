//! User callbacks run around built-in signal handling.

use std::collections::HashMap;
use std::fmt;

use tracing::debug;

use crate::error::Result;
use crate::signal::LifecycleSignal;

/// When a hook runs relative to the built-in handling of its signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HookPhase {
    Before,
    After,
}

impl fmt::Display for HookPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HookPhase::Before => write!(f, "before"),
            HookPhase::After => write!(f, "after"),
        }
    }
}

type Hook = Box<dyn Fn() + Send + Sync>;

/// Ordered hook lists keyed by (phase, signal).
#[derive(Default)]
pub struct SignalHooks {
    hooks: HashMap<(HookPhase, LifecycleSignal), Vec<Hook>>,
}

impl SignalHooks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a hook for `signal` in `phase`.
    ///
    /// Signals other than SIGHUP, SIGINT and SIGTERM are rejected here rather
    /// than silently never firing.
    pub fn register<F>(&mut self, phase: HookPhase, signal: i32, hook: F) -> Result<()>
    where
        F: Fn() + Send + Sync + 'static,
    {
        let signal = LifecycleSignal::try_from(signal)?;
        self.hooks
            .entry((phase, signal))
            .or_default()
            .push(Box::new(hook));
        Ok(())
    }

    /// Run every hook registered for (phase, signal), in registration order.
    pub fn run(&self, phase: HookPhase, signal: LifecycleSignal) {
        let Some(hooks) = self.hooks.get(&(phase, signal)) else {
            return;
        };
        debug!(%phase, %signal, count = hooks.len(), "Running signal hooks");
        for hook in hooks {
            hook();
        }
    }

    /// Number of hooks registered for (phase, signal).
    pub fn len(&self, phase: HookPhase, signal: LifecycleSignal) -> usize {
        self.hooks.get(&(phase, signal)).map_or(0, Vec::len)
    }

    pub fn is_empty(&self) -> bool {
        self.hooks.values().all(Vec::is_empty)
    }
}

impl fmt::Debug for SignalHooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let counts: HashMap<_, _> = self.hooks.iter().map(|(k, v)| (*k, v.len())).collect();
        f.debug_struct("SignalHooks").field("hooks", &counts).finish()
    }
}
