//! # Configuration
//!
//! Builds a [`Config`] by layering, lowest precedence first: built-in
//! defaults, an optional TOML file, `STARLING_*` environment variables,
//! and finally CLI flags. This mirrors the split the historical broker kept
//! between its file-based `Options` and its CLI wrapper, made concrete here
//! since the distilled specification treats the config loader as an
//! external collaborator whose effects still need a real implementation.

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::cli::Args;
use crate::error::ConfigError;

/// Default item expiry / "default timeout" (seconds; informational only -
/// the core never enforces it, item expiry is always per-item).
pub const DEFAULT_TIMEOUT: u64 = 60;
pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 22122;
pub const DEFAULT_PATH: &str = "/tmp/starling-rs";

#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub path: PathBuf,
    pub timeout: u64,
    pub log_file: Option<String>,
    pub log_level: String,
    pub pid_file: Option<PathBuf>,
    pub daemonize: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            path: PathBuf::from(DEFAULT_PATH),
            timeout: DEFAULT_TIMEOUT,
            log_file: None,
            log_level: "info".to_string(),
            pid_file: None,
            daemonize: false,
        }
    }
}

/// Mirrors the TOML file layout; every field optional so a config file only
/// needs to mention the options it wants to override.
#[derive(Debug, Default, Deserialize)]
struct FileConfig {
    host: Option<String>,
    port: Option<u16>,
    path: Option<PathBuf>,
    timeout: Option<u64>,
    log_file: Option<String>,
    log_level: Option<String>,
    pid_file: Option<PathBuf>,
    daemonize: Option<bool>,
}

impl Config {
    /// Loads a config file (if `config_path` is `Some`), then applies
    /// `STARLING_*` environment overrides, then applies any CLI flags the
    /// user actually supplied.
    pub fn load(config_path: Option<&Path>, args: &Args) -> Result<Self, ConfigError> {
        let mut config = Config::default();

        if let Some(path) = config_path {
            let file = read_file_config(path)?;
            apply_file(&mut config, file);
        }

        apply_env(&mut config);
        apply_args(&mut config, args);
        Ok(config)
    }
}

fn read_file_config(path: &Path) -> Result<FileConfig, ConfigError> {
    let contents =
        std::fs::read_to_string(path).map_err(|err| ConfigError::Read(path.to_path_buf(), err))?;
    toml::from_str(&contents).map_err(|err| ConfigError::Parse(path.to_path_buf(), err))
}

fn apply_file(config: &mut Config, file: FileConfig) {
    if let Some(host) = file.host {
        config.host = host;
    }
    if let Some(port) = file.port {
        config.port = port;
    }
    if let Some(path) = file.path {
        config.path = path;
    }
    if let Some(timeout) = file.timeout {
        config.timeout = timeout;
    }
    if let Some(log_file) = file.log_file {
        config.log_file = Some(log_file);
    }
    if let Some(log_level) = file.log_level {
        config.log_level = log_level;
    }
    if let Some(pid_file) = file.pid_file {
        config.pid_file = Some(pid_file);
    }
    if let Some(daemonize) = file.daemonize {
        config.daemonize = daemonize;
    }
}

fn apply_env(config: &mut Config) {
    if let Ok(v) = std::env::var("STARLING_HOST") {
        config.host = v;
    }
    if let Ok(v) = std::env::var("STARLING_PORT") {
        if let Ok(port) = v.parse() {
            config.port = port;
        }
    }
    if let Ok(v) = std::env::var("STARLING_PATH") {
        config.path = PathBuf::from(v);
    }
    if let Ok(v) = std::env::var("STARLING_TIMEOUT") {
        if let Ok(timeout) = v.parse() {
            config.timeout = timeout;
        }
    }
    if let Ok(v) = std::env::var("STARLING_LOG_FILE") {
        config.log_file = Some(v);
    }
    if let Ok(v) = std::env::var("STARLING_LOG_LEVEL") {
        config.log_level = v;
    }
    if let Ok(v) = std::env::var("STARLING_PID_FILE") {
        config.pid_file = Some(PathBuf::from(v));
    }
    if let Ok(v) = std::env::var("STARLING_DAEMONIZE") {
        config.daemonize = v == "1" || v.eq_ignore_ascii_case("true");
    }
}

fn apply_args(config: &mut Config, args: &Args) {
    if let Some(ref host) = args.host {
        config.host = host.clone();
    }
    if let Some(port) = args.port {
        config.port = port;
    }
    if let Some(ref path) = args.path {
        config.path = path.clone();
    }
    if let Some(timeout) = args.timeout {
        config.timeout = timeout;
    }
    if let Some(ref log_file) = args.log_file {
        config.log_file = Some(log_file.clone());
    }
    if let Some(ref log_level) = args.log_level {
        config.log_level = log_level.clone();
    }
    if args.verbose > 0 {
        config.log_level = match args.verbose {
            1 => "debug".to_string(),
            _ => "trace".to_string(),
        };
    }
    if let Some(ref pid_file) = args.pid_file {
        config.pid_file = Some(pid_file.clone());
    }
    if args.daemonize {
        config.daemonize = true;
    }
}
