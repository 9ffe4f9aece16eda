//! # Starling Broker
//!
//! A lightweight, durable, multi-queue message broker speaking the memcache
//! text protocol over TCP. Producers enqueue opaque byte payloads under a
//! queue name; consumers dequeue them in FIFO order. Each queue is backed
//! by an append-only transaction log so queue contents survive a server
//! restart.

pub mod cli;
pub mod collection;
pub mod config;
pub mod error;
pub mod protocol;
pub mod queue;
pub mod server;
pub mod stats;

pub use collection::QueueCollection;
pub use config::Config;
pub use protocol::{Input, ProtocolHandler, ReplySink};
pub use queue::PersistentQueue;
pub use server::Server;
pub use stats::Statistics;

/// The current version of the broker.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
