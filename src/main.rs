//! # Starling Broker - Main Entry Point
//!
//! Wires together configuration, logging, and the TCP server shell:
//! 1. Parse CLI arguments.
//! 2. Layer them over an optional config file and `STARLING_*` environment
//!    variables to produce a [`Config`].
//! 3. Initialize structured logging at the configured verbosity.
//! 4. Build the [`Server`] (which opens/replays every existing queue log
//!    under `Config::path` lazily, on first reference) and serve until a
//!    `shutdown` command is received on any connection.

use anyhow::{Context, Result};
use clap::Parser;
use starling_broker::cli::Args;
use starling_broker::config::Config;
use starling_broker::server::Server;
use tracing::{error, info};
use tracing_subscriber::{filter::LevelFilter, prelude::*, Layer};

mod logging;
use logging::ColorizedFormatter;

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = Config::load(args.config.as_deref(), &args).context("failed to load configuration")?;

    // The guard must stay alive for the whole process: dropping it stops
    // the non-blocking file writer from flushing.
    let _log_guard = init_logging(&config);

    if config.daemonize {
        info!("daemonize requested; running in foreground (no fork support in this build)");
    }
    if let Some(ref pid_file) = config.pid_file {
        if let Err(err) = std::fs::write(pid_file, std::process::id().to_string()) {
            error!(error = %err, path = %pid_file.display(), "failed to write pid file");
        }
    }

    info!(
        host = %config.host,
        port = config.port,
        path = %config.path.display(),
        "starting starling broker"
    );

    let server = Server::new(&config).context("failed to initialize server")?;
    server.run(&config).await.context("server exited with an error")?;

    info!("starling broker stopped cleanly");
    Ok(())
}

/// Configures stdout + optional file logging, following the same layered
/// `tracing_subscriber` setup used throughout this project's other
/// command-line tools: a colorized, clean layer for interactive use and a
/// plain, rotating layer for the log file.
fn init_logging(config: &Config) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let log_level = match config.log_level.as_str() {
        "trace" => LevelFilter::TRACE,
        "debug" => LevelFilter::DEBUG,
        "warn" => LevelFilter::WARN,
        "error" => LevelFilter::ERROR,
        _ => LevelFilter::INFO,
    };

    let guard;
    let detailed_log_layer;

    match config.log_file.as_deref() {
        Some("stderr") | None => {
            detailed_log_layer = tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_filter(log_level)
                .boxed();
            guard = None;
        }
        Some(path_str) => {
            let log_path = std::path::Path::new(path_str);
            let log_dir = log_path
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .unwrap_or_else(|| std::path::Path::new("."));
            let log_filename = log_path
                .file_name()
                .unwrap_or_else(|| std::ffi::OsStr::new("starling.log"));
            let file_appender = tracing_appender::rolling::daily(log_dir, log_filename);
            let (non_blocking_writer, file_guard) = tracing_appender::non_blocking(file_appender);
            detailed_log_layer = tracing_subscriber::fmt::layer()
                .with_writer(non_blocking_writer)
                .with_ansi(false)
                .with_filter(log_level)
                .boxed();
            guard = Some(file_guard);
        }
    }

    let stdout_log = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stdout)
        .event_format(ColorizedFormatter)
        .with_filter(log_level);

    tracing_subscriber::registry()
        .with(detailed_log_layer)
        .with(stdout_log)
        .init();

    guard
}
