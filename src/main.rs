use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use turnstile::config::TurnstileConfig;
use turnstile::ratelimit::{Algorithm, Dispatcher};
use turnstile::wire::AdmissionServer;

/// Per-client admission control server.
#[derive(Debug, Parser)]
#[command(name = "turnstile", version, about)]
struct Cli {
    /// YAML configuration file
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Address to listen on
    #[arg(long, value_name = "ADDR")]
    listen: Option<SocketAddr>,

    /// fixed_window, sliding_log, sliding_window, token_bucket or leaky_bucket
    #[arg(long)]
    algorithm: Option<Algorithm>,

    /// Requests per window, bucket capacity or queue depth
    #[arg(long)]
    limit: Option<u64>,

    /// Window, refill interval or leak rate in milliseconds
    #[arg(long, value_name = "MS")]
    window_ms: Option<u64>,

    /// Admit every request
    #[arg(long)]
    disable: bool,

    /// Emit logs as JSON
    #[arg(long)]
    log_json: bool,
}

impl Cli {
    fn apply(&self, config: &mut TurnstileConfig) {
        if let Some(listen) = self.listen {
            config.server.listen_addr = listen;
        }
        let limits = &mut config.rate_limiting;
        if let Some(algorithm) = self.algorithm {
            limits.algorithm = algorithm;
        }
        if let Some(limit) = self.limit {
            limits.limit = limit;
        }
        if self.window_ms.is_some() {
            limits.window_ms = self.window_ms;
        }
        if self.disable {
            limits.enabled = false;
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    info!("Starting Turnstile admission service");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let mut config = TurnstileConfig::load(cli.config.as_deref())?;
    cli.apply(&mut config);
    config.server.validate()?;
    config.rate_limiting.validate()?;
    info!(
        listen_addr = %config.server.listen_addr,
        enabled = config.rate_limiting.enabled,
        algorithm = %config.rate_limiting.algorithm,
        "Configuration loaded"
    );

    let dispatcher = Arc::new(Dispatcher::from_config(&config.rate_limiting)?);
    let server = AdmissionServer::new(config.server.listen_addr, Arc::clone(&dispatcher))
        .with_max_line_bytes(config.server.max_line_bytes);

    let result = server.serve_with_shutdown(shutdown_signal()).await;
    dispatcher.shutdown();
    result?;

    info!("Turnstile admission service stopped");
    Ok(())
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true);

    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
