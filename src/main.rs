use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{fmt, EnvFilter};

use netwatch::agent::ServerAgent;
use netwatch::config::{AgentConfig, ConfigError, DcConfig, RackConfig};
use netwatch::dc::DcController;
use netwatch::export::metrics::Metrics;
use netwatch::rack::RackController;

/// Spectral network-health monitoring: sine-wave agents, FFT-analyzing
/// rack controllers, and a datacenter aggregator.
#[derive(Parser)]
#[command(name = "netwatch", about)]
struct Cli {
    /// Logging verbosity level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a server agent: emit a sinusoidal carrier toward a rack controller.
    Agent,
    /// Run a rack controller: ingest carriers, analyze, report to the DC.
    Rack,
    /// Run the DC controller: aggregate rack reports.
    Dc,
    /// Print version information and exit.
    Version,
}

/// Build-time version info.
mod version {
    /// Release version string (set at build time).
    pub const RELEASE: &str = env!("CARGO_PKG_VERSION");

    /// Git commit hash (set at build time via env, or "unknown").
    pub fn git_commit() -> &'static str {
        option_env!("GIT_COMMIT").unwrap_or("unknown")
    }

    /// Full version string with platform info.
    pub fn full() -> String {
        format!(
            "{} (commit: {}, {}/{})",
            RELEASE,
            git_commit(),
            std::env::consts::OS,
            std::env::consts::ARCH,
        )
    }
}

/// Failure classes with distinct exit codes: configuration errors exit 1
/// before any socket opens; unrecoverable I/O (bind/listen) exits 2.
enum RunError {
    Config(ConfigError),
    Fatal(anyhow::Error),
}

impl From<ConfigError> for RunError {
    fn from(e: ConfigError) -> Self {
        Self::Config(e)
    }
}

impl From<anyhow::Error> for RunError {
    fn from(e: anyhow::Error) -> Self {
        Self::Fatal(e)
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    // Handle version subcommand before anything else.
    if let Command::Version = cli.command {
        println!("netwatch {}", version::full());
        return ExitCode::SUCCESS;
    }

    let filter = match EnvFilter::try_new(&cli.log_level) {
        Ok(filter) => filter,
        Err(e) => {
            eprintln!("invalid log level {:?}: {e}", cli.log_level);
            return ExitCode::from(1);
        }
    };
    fmt().with_env_filter(filter).with_target(true).init();

    tracing::info!(version = version::RELEASE, "starting netwatch");

    let rt = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building tokio runtime")
    {
        Ok(rt) => rt,
        Err(e) => {
            tracing::error!(error = %e, "runtime setup failed");
            return ExitCode::from(2);
        }
    };

    match rt.block_on(run(cli.command)) {
        Ok(()) => {
            tracing::info!("netwatch stopped");
            ExitCode::SUCCESS
        }
        Err(RunError::Config(e)) => {
            tracing::error!(error = %e, "configuration error");
            ExitCode::from(1)
        }
        Err(RunError::Fatal(e)) => {
            tracing::error!(error = %e, "fatal error");
            ExitCode::from(2)
        }
    }
}

async fn run(command: Command) -> Result<(), RunError> {
    let cancel = shutdown_token();

    match command {
        Command::Agent => {
            let cfg = AgentConfig::from_env()?;
            ServerAgent::new(cfg).run(cancel).await?;
        }

        Command::Rack => {
            let cfg = RackConfig::from_env()?;

            let metrics = Arc::new(Metrics::new(cfg.metrics_port).context("creating metrics")?);
            metrics.start().await.context("starting metrics server")?;

            let controller = Arc::new(RackController::new(cfg, metrics.clone()));
            let result = controller.run(cancel).await;
            metrics.stop();
            result?;
        }

        Command::Dc => {
            let cfg = DcConfig::from_env()?;

            let metrics = Arc::new(Metrics::new(cfg.metrics_port).context("creating metrics")?);
            metrics.start().await.context("starting metrics server")?;

            let controller = Arc::new(DcController::new(cfg, metrics.clone()));
            let result = controller.run(cancel).await;
            metrics.stop();
            result?;
        }

        Command::Version => unreachable!("handled before runtime setup"),
    }

    Ok(())
}

/// Cancellation token cancelled on SIGINT or SIGTERM.
fn shutdown_token() -> CancellationToken {
    let cancel = CancellationToken::new();

    let trigger = cancel.clone();
    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to register SIGTERM handler");

        tokio::select! {
            _ = ctrl_c => {
                tracing::info!("received SIGINT, shutting down");
            }
            _ = sigterm.recv() => {
                tracing::info!("received SIGTERM, shutting down");
            }
        }

        trigger.cancel();
    });

    cancel
}
