//! Runtime configuration for the lifecycle controller.
//!
//! # Environment Variables
//!
//! - `MSKIT_DRAIN_TIMEOUT_SECS`: how long a draining service waits for open
//!   connections before forcing termination. `0` disables the watchdog so the
//!   drain waits indefinitely. Default: `60`

use std::ffi::OsString;
use std::path::PathBuf;
use std::time::Duration;

use tracing::{info, warn};

/// Default drain watchdog timeout.
pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(60);

/// Environment variable holding the drain timeout in seconds.
pub const DRAIN_TIMEOUT_ENV: &str = "MSKIT_DRAIN_TIMEOUT_SECS";

/// Process-level lifecycle settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GraceConfig {
    /// `None` waits for connections to finish no matter how long they take.
    pub drain_timeout: Option<Duration>,
    /// Executable for the replacement process. Defaults to the running binary.
    pub program: Option<PathBuf>,
    /// Arguments for the replacement process, before the restart markers are
    /// applied. Defaults to this process's own arguments.
    pub args: Option<Vec<OsString>>,
}

impl Default for GraceConfig {
    fn default() -> Self {
        Self {
            drain_timeout: Some(DEFAULT_DRAIN_TIMEOUT),
            program: None,
            args: None,
        }
    }
}

impl GraceConfig {
    /// Load configuration from the process environment.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let drain_timeout = match lookup(DRAIN_TIMEOUT_ENV) {
            Some(raw) => match raw.trim().parse::<u64>() {
                Ok(0) => None,
                Ok(secs) => Some(Duration::from_secs(secs)),
                Err(e) => {
                    warn!(value = %raw, error = %e, "Invalid {}, using default", DRAIN_TIMEOUT_ENV);
                    Some(DEFAULT_DRAIN_TIMEOUT)
                }
            },
            None => Some(DEFAULT_DRAIN_TIMEOUT),
        };

        Self {
            drain_timeout,
            ..Self::default()
        }
    }

    /// Set the drain timeout. A zero duration disables the watchdog.
    pub fn with_drain_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.drain_timeout = timeout.filter(|t| !t.is_zero());
        self
    }

    pub fn with_program(mut self, program: impl Into<PathBuf>) -> Self {
        self.program = Some(program.into());
        self
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args = Some(args.into_iter().map(Into::into).collect());
        self
    }

    pub(crate) fn program(&self) -> std::io::Result<PathBuf> {
        match &self.program {
            Some(program) => Ok(program.clone()),
            None => std::env::current_exe(),
        }
    }

    pub(crate) fn base_args(&self) -> Vec<OsString> {
        match &self.args {
            Some(args) => args.clone(),
            None => std::env::args_os().skip(1).collect(),
        }
    }

    /// Log the effective configuration.
    pub fn log_config(&self) {
        match self.drain_timeout {
            Some(timeout) => info!("Drain timeout: {}s", timeout.as_secs()),
            None => info!("Drain timeout: disabled"),
        }
        if let Some(program) = &self.program {
            info!("Restart program: {}", program.display());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default() {
        let config = GraceConfig::default();
        assert_eq!(config.drain_timeout, Some(Duration::from_secs(60)));
        assert!(config.program.is_none());
        assert!(config.args.is_none());
    }

    #[test]
    fn test_from_env_values() {
        let unset = GraceConfig::from_lookup(|_| None);
        assert_eq!(unset.drain_timeout, Some(DEFAULT_DRAIN_TIMEOUT));

        let custom = GraceConfig::from_lookup(|_| Some("5".to_string()));
        assert_eq!(custom.drain_timeout, Some(Duration::from_secs(5)));

        let disabled = GraceConfig::from_lookup(|_| Some("0".to_string()));
        assert_eq!(disabled.drain_timeout, None);

        let garbage = GraceConfig::from_lookup(|_| Some("soon".to_string()));
        assert_eq!(garbage.drain_timeout, Some(DEFAULT_DRAIN_TIMEOUT));
    }

    #[test]
    fn test_builders() {
        let config = GraceConfig::default()
            .with_drain_timeout(Some(Duration::ZERO))
            .with_program("/bin/true")
            .with_args(["--listen", "127.0.0.1:0"]);

        assert_eq!(config.drain_timeout, None);
        assert_eq!(config.program().unwrap(), PathBuf::from("/bin/true"));
        assert_eq!(
            config.base_args(),
            vec![OsString::from("--listen"), OsString::from("127.0.0.1:0")]
        );
    }
}
