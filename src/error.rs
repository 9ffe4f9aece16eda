//! Error taxonomy for the queue engine and protocol handler.
//!
//! Internal errors never reach a client as anything other than a documented
//! protocol reply (see `protocol.rs`); this module exists so the boundary
//! between "operation failed, return a reply" and "process cannot continue"
//! stays explicit.

use thiserror::Error;

/// Raised when a `PersistentQueue`'s transaction log cannot be used.
#[derive(Debug, Error)]
pub enum TransactionLogError {
    #[error("transaction log for queue '{0}' is not open")]
    NotOpen(String),

    #[error("transaction log I/O error for queue '{name}': {source}")]
    Io {
        name: String,
        #[source]
        source: std::io::Error,
    },
}

/// Raised when the `QueueCollection`'s root directory is unusable.
#[derive(Debug, Error)]
pub enum QueueCollectionError {
    #[error("queue path '{0}' is inaccessible: {1}")]
    PathInaccessible(std::path::PathBuf, std::io::Error),

    #[error("failed to load existing queue '{0}' at startup: {1}")]
    LoadFailed(String, #[source] TransactionLogError),
}

/// A malformed or oversized command line.
#[derive(Debug, Error)]
#[error("bad command line format")]
pub struct ProtocolError;

/// A SET body that did not arrive as framed (short read, missing trailer).
#[derive(Debug, Error)]
#[error("bad data chunk")]
pub struct SetBodyError;

/// Raised when configuration cannot be loaded or parsed.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {0}: {1}")]
    Read(std::path::PathBuf, std::io::Error),

    #[error("failed to parse config file {0}: {1}")]
    Parse(std::path::PathBuf, #[source] toml::de::Error),
}
