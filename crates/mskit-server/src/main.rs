use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use futures::future::try_join_all;
use mskit_grace::{
    Grace, GraceArgs, GraceConfig, HookPhase, LifecycleSignal, Network, ServeOptions, TlsOptions,
};
use tracing::info;

mod http;
mod telemetry;

/// HTTP service that can be upgraded in place with SIGHUP.
#[derive(Parser, Debug)]
#[command(name = "mskit-server", version, about)]
struct Cli {
    /// Address to serve (repeat for several)
    #[arg(long = "listen", value_name = "ADDR", required = true)]
    listen: Vec<String>,

    /// Address family: tcp, tcp4 or tcp6
    #[arg(long, default_value = "tcp")]
    network: Network,

    /// Read and write timeout per connection, in seconds (0 disables)
    #[arg(long, value_name = "SECS", default_value_t = 0)]
    timeout: u64,

    /// PEM certificate chain; enables TLS
    #[arg(long, requires = "tls_key")]
    tls_cert: Option<PathBuf>,

    /// PEM private key for --tls-cert
    #[arg(long, requires = "tls_cert")]
    tls_key: Option<PathBuf>,

    /// PEM CA bundle; requires and verifies client certificates
    #[arg(long, requires = "tls_cert")]
    tls_client_ca: Option<PathBuf>,

    /// Log with multi-line pretty output
    #[arg(long)]
    pretty_logs: bool,

    #[command(flatten)]
    grace: GraceArgs,
}

impl Cli {
    fn serve_options(&self) -> ServeOptions {
        let mut options = ServeOptions::new().with_network(self.network);
        if self.timeout > 0 {
            options = options.with_timeout(Duration::from_secs(self.timeout));
        }
        if let (Some(cert), Some(key)) = (&self.tls_cert, &self.tls_key) {
            let mut tls = TlsOptions::new(cert, key);
            if let Some(ca) = &self.tls_client_ca {
                tls = tls.with_client_ca(ca);
            }
            options = options.with_tls(tls);
        }
        options
    }
}

/// Log the pid around restarts and stops.
fn register_log_hooks(grace: &Grace) -> Result<()> {
    for signal in LifecycleSignal::ALL {
        grace.register_signal_hook(HookPhase::Before, signal.into(), move || {
            info!(%signal, pid = std::process::id(), "Handling signal");
        })?;
        grace.register_signal_hook(HookPhase::After, signal.into(), move || {
            info!(%signal, pid = std::process::id(), "Signal handled");
        })?;
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if cli.pretty_logs {
        telemetry::init_local()
            .map_err(|e| anyhow::anyhow!("Failed to init local telemetry: {}", e))?;
    } else {
        telemetry::init().map_err(|e| anyhow::anyhow!("Failed to init telemetry: {}", e))?;
    }

    info!("mskit-server starting...");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));
    info!(pid = std::process::id(), role = %cli.grace.role(), "Process started");

    let config = GraceConfig::from_env();
    config.log_config();

    let grace = Grace::new(&cli.grace, config);
    grace
        .handle_os_signals()
        .context("Failed to install signal handlers")?;
    register_log_hooks(&grace)?;

    let options = cli.serve_options();
    let services = cli.listen.iter().map(|address| {
        let grace = grace.clone();
        let options = options.clone();
        let address = address.clone();
        async move {
            let handler = http::handler(address.clone(), grace.role());
            grace
                .serve(&address, handler, options)
                .await
                .with_context(|| format!("Failed to serve {}", address))
        }
    });
    try_join_all(services).await?;

    info!(pid = std::process::id(), "All services terminated");
    telemetry::shutdown();

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parses_tls_and_markers() {
        let cli = Cli::try_parse_from([
            "mskit-server",
            "--listen",
            "127.0.0.1:8443",
            "--listen",
            "127.0.0.1:8080",
            "--network",
            "tcp4",
            "--timeout",
            "30",
            "--tls-cert",
            "cert.pem",
            "--tls-key",
            "key.pem",
            "--graceful",
            "--socket-order=127.0.0.1:8443,127.0.0.1:8080",
        ])
        .unwrap();

        assert_eq!(cli.listen.len(), 2);
        assert_eq!(cli.grace.socket_order, cli.listen);

        let options = cli.serve_options();
        assert_eq!(options.network, Network::Tcp4);
        assert_eq!(options.read_timeout, Some(Duration::from_secs(30)));
        assert_eq!(options.write_timeout, Some(Duration::from_secs(30)));
        assert_eq!(options.tls, Some(TlsOptions::new("cert.pem", "key.pem")));
    }

    #[test]
    fn test_cli_requires_listen_and_key_pair() {
        assert!(Cli::try_parse_from(["mskit-server"]).is_err());
        assert!(Cli::try_parse_from([
            "mskit-server",
            "--listen",
            "127.0.0.1:8080",
            "--tls-cert",
            "cert.pem",
        ])
        .is_err());
    }

    #[test]
    fn test_plain_defaults() {
        let cli = Cli::try_parse_from(["mskit-server", "--listen", "[::1]:8080"]).unwrap();
        let options = cli.serve_options();
        assert_eq!(options, ServeOptions::default());
    }
}
