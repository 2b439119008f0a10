//! Logging setup for mskit-server.
//!
//! Console output through `tracing-subscriber`, filtered by `RUST_LOG`
//! (default: `info,mskit_grace=debug,mskit_server=debug`).

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const DEFAULT_FILTER: &str = "info,mskit_grace=debug,mskit_server=debug";

fn filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))
}

/// Initialize tracing with compact console output.
pub fn init() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_thread_ids(false)
        .with_file(true)
        .with_line_number(true);

    tracing_subscriber::registry()
        .with(filter())
        .with(fmt_layer)
        .try_init()?;

    tracing::info!("Telemetry initialized");
    Ok(())
}

/// Initialize tracing with multi-line output for local development.
pub fn init_local() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_thread_ids(false)
        .with_file(true)
        .with_line_number(true)
        .pretty();

    tracing_subscriber::registry()
        .with(filter())
        .with(fmt_layer)
        .try_init()?;

    tracing::info!("Local telemetry initialized");
    Ok(())
}

/// Flush logging before exit.
pub fn shutdown() {
    tracing::info!("Telemetry shutdown complete");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_filter_parses() {
        assert!(EnvFilter::try_new(DEFAULT_FILTER).is_ok());
    }
}
