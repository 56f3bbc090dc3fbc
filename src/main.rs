// Use the library crate
use static_netd::cli::Cli;
use static_netd::config::ConfigSource;
use static_netd::daemon::{self, Daemon, DaemonOptions};
use static_netd::network::IpWrapper;
use static_netd::runner::ShellRunner;
use static_netd::signals::SignalLatch;

use anyhow::Context;
use clap::Parser;
use std::fs::OpenOptions;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer, Registry};

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = init_logging(&cli.logs) {
        eprintln!("Failed to set up logging: {:#}", e);
        return ExitCode::FAILURE;
    }
    tracing::info!("Starting static-netd...");

    let source = ConfigSource {
        path: cli.config_path(),
        interface_override: cli.interface_override(),
    };
    let options = DaemonOptions {
        dry_run: cli.dry_run,
        keep_on_exit: cli.keep_on_exit,
        flush_on_boot: cli.flush,
    };

    let mut daemon = match Daemon::boot(IpWrapper::new(ShellRunner), source, options) {
        Ok(daemon) => daemon,
        Err(e) => {
            tracing::error!("{}", e);
            return ExitCode::FAILURE;
        }
    };

    let mut latch = SignalLatch::new();
    latch.listen();

    match daemon::run(&mut daemon, &mut latch).await {
        Ok(()) => {
            tracing::info!("Shutdown complete.");
            ExitCode::SUCCESS
        }
        Err(e) => {
            tracing::error!("{}", e);
            ExitCode::FAILURE
        }
    }
}

/// Logs to stdout plus every file given with `--log`, filtered through
/// `RUST_LOG` (default `info`).
fn init_logging(files: &[PathBuf]) -> anyhow::Result<()> {
    let mut layers: Vec<Box<dyn Layer<Registry> + Send + Sync>> = vec![fmt::layer().boxed()];

    for path in files {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("Log file {:?} is not writable", path))?;
        layers.push(
            fmt::layer()
                .with_ansi(false)
                .with_writer(Arc::new(file))
                .boxed(),
        );
    }

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(layers)
        .with(filter)
        .try_init()
        .context("Failed to install the tracing subscriber")?;

    Ok(())
}
