//! # Command-Line Interface
//!
//! `clap`-derived argument parsing for the broker binary. Every option maps
//! directly to a [`crate::config::Config`] field and, when present on the
//! command line, overrides both the config file and environment layers (see
//! `config.rs`).

use clap::{
    builder::styling::{AnsiColor, Styles},
    Parser,
};
use std::path::PathBuf;

/// Defines the help-text color scheme, matching the house style used across
/// this project's command-line tools.
fn styles() -> Styles {
    Styles::styled()
        .header(AnsiColor::Yellow.on_default())
        .usage(AnsiColor::Yellow.on_default())
        .literal(AnsiColor::Green.on_default())
        .placeholder(AnsiColor::Green.on_default())
}

/// A durable, multi-queue message broker speaking the memcache text
/// protocol.
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None, styles = styles())]
pub struct Args {
    /// Path to a TOML config file (lowest-precedence layer after defaults)
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Bind address for the TCP listener
    #[arg(long)]
    pub host: Option<String>,

    /// Bind port for the TCP listener
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Root directory for queue transaction logs
    #[arg(long)]
    pub path: Option<PathBuf>,

    /// Default item expiry in seconds (0 = never); informational only, the
    /// queue engine always honors the per-item expiry set on each SET
    #[arg(long)]
    pub timeout: Option<u64>,

    /// Server log destination ("stderr" or a file path)
    #[arg(long)]
    pub log_file: Option<String>,

    /// Explicit log verbosity ("trace", "debug", "info", "warn", "error")
    #[arg(long)]
    pub log_level: Option<String>,

    /// Increase log verbosity (-v for debug, -vv for trace)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Pidfile location to write when daemonized
    #[arg(long)]
    pub pid_file: Option<PathBuf>,

    /// Background the process after startup
    #[arg(long)]
    pub daemonize: bool,
}
