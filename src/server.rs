//! # Server shell
//!
//! The TCP accept loop: binds a listener, frames each connection's input
//! into command lines and raw body bytes, and drives one [`ProtocolHandler`]
//! per connection. Generalizes the benchmark harness's `TcpSocketTransport`
//! accept-loop pattern from a request/response benchmark exchange to a
//! persistent, line-oriented broker protocol.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use socket2::{Domain, Socket, Type};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use crate::collection::QueueCollection;
use crate::config::Config;
use crate::protocol::{Input, ProtocolHandler, ReplySink};
use crate::stats::Statistics;

struct TcpSink {
    writer: OwnedWriteHalf,
    stats: Arc<Statistics>,
    exited: Arc<AtomicBool>,
    shutdown: Arc<Notify>,
}

#[async_trait::async_trait]
impl ReplySink for TcpSink {
    async fn send(&mut self, data: &[u8]) {
        if self.writer.write_all(data).await.is_ok() {
            self.stats
                .bytes_written
                .fetch_add(data.len() as u64, Ordering::Relaxed);
        }
    }

    async fn exit(&mut self) {
        self.exited.store(true, Ordering::Release);
        self.shutdown.notify_waiters();
    }
}

/// Owns the listener and the shared queue collection / statistics for the
/// lifetime of the process.
pub struct Server {
    collection: Arc<QueueCollection>,
    stats: Arc<Statistics>,
    shutdown: Arc<Notify>,
}

impl Server {
    pub fn new(config: &Config) -> Result<Self> {
        let collection = QueueCollection::new(&config.path)
            .context("failed to initialize queue collection")?;
        Ok(Self {
            collection: Arc::new(collection),
            stats: Arc::new(Statistics::new()),
            shutdown: Arc::new(Notify::new()),
        })
    }

    /// Binds and serves until a `shutdown` command is received on any
    /// connection, draining in-flight connections before closing every
    /// queue.
    pub async fn run(&self, config: &Config) -> Result<()> {
        let listener = bind_listener(&config.host, config.port)?;
        info!(host = %config.host, port = config.port, "listening");

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, peer) = accepted.context("accept failed")?;
                    debug!(%peer, "client connected");
                    self.stats.connections.fetch_add(1, Ordering::Relaxed);
                    self.stats.total_connections.fetch_add(1, Ordering::Relaxed);

                    let collection = self.collection.clone();
                    let stats = self.stats.clone();
                    let shutdown = self.shutdown.clone();
                    tokio::spawn(async move {
                        handle_connection(stream, collection, stats.clone(), shutdown).await;
                        stats.connections.fetch_sub(1, Ordering::Relaxed);
                        debug!(%peer, "client disconnected");
                    });
                }
                _ = self.shutdown.notified() => {
                    info!("shutdown requested, draining connections");
                    break;
                }
            }
        }

        self.collection.close();
        Ok(())
    }

    pub fn collection(&self) -> &Arc<QueueCollection> {
        &self.collection
    }

    pub fn stats(&self) -> &Arc<Statistics> {
        &self.stats
    }
}

fn bind_listener(host: &str, port: u16) -> Result<TcpListener> {
    let addr = format!("{host}:{port}")
        .parse::<std::net::SocketAddr>()
        .with_context(|| format!("invalid bind address {host}:{port}"))?;
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, None)
        .context("failed to create listening socket")?;
    socket.set_reuse_address(true)?;
    socket.bind(&addr.into())?;
    socket.listen(1024)?;
    socket.set_nonblocking(true)?;
    TcpListener::from_std(socket.into()).context("failed to adopt listening socket into tokio")
}

async fn handle_connection(
    stream: TcpStream,
    collection: Arc<QueueCollection>,
    stats: Arc<Statistics>,
    shutdown: Arc<Notify>,
) {
    let _ = stream.set_nodelay(true);
    let (read_half, write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);
    let exited = Arc::new(AtomicBool::new(false));
    let mut sink = TcpSink {
        writer: write_half,
        stats: stats.clone(),
        exited: exited.clone(),
        shutdown,
    };
    let mut handler = ProtocolHandler::new();

    loop {
        if let Some(remaining) = handler.awaiting_body() {
            let mut body = vec![0u8; remaining];
            if reader.read_exact(&mut body).await.is_err() {
                break;
            }
            stats
                .bytes_read
                .fetch_add(body.len() as u64, Ordering::Relaxed);
            handler
                .process(Input::Body(body), &collection, &stats, &mut sink)
                .await;
        } else {
            // Read the next command line as raw bytes rather than through
            // `read_line`: a key only has to avoid whitespace and control
            // bytes, not be valid UTF-8, so framing must not fail the whole
            // connection on a line that happens to contain an invalid byte
            // sequence.
            let mut raw = Vec::new();
            match reader.read_until(b'\n', &mut raw).await {
                Ok(0) => break, // peer closed
                Ok(n) => {
                    stats.bytes_read.fetch_add(n as u64, Ordering::Relaxed);
                    while matches!(raw.last(), Some(b'\r') | Some(b'\n')) {
                        raw.pop();
                    }
                    handler
                        .process(Input::Line(raw), &collection, &stats, &mut sink)
                        .await;
                }
                Err(err) => {
                    warn!(error = %err, "connection read error");
                    break;
                }
            }
        }

        // A SET (including a zero-length one finalized straight from its
        // command line) just completed; consume the trailing \r\n some
        // memcache clients send unconditionally after the body.
        if handler.take_set_just_completed() {
            let mut trailer = [0u8; 2];
            if reader.read_exact(&mut trailer).await.is_ok() {
                stats.bytes_read.fetch_add(2, Ordering::Relaxed);
            }
        }

        if exited.load(Ordering::Acquire) {
            break;
        }
    }
}
