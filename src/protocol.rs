//! # ProtocolHandler — the memcache-dialect state machine
//!
//! A pure request/reply transformer: it never touches a socket directly.
//! The transport hands it whole command lines (terminator already
//! stripped) and, while a SET is pending, raw body bytes; replies go out
//! through the [`ReplySink`] trait so the handler stays unit-testable
//! without a socket, mirroring the callback-continuation split the
//! historical broker used between its handler and its Twisted protocol
//! class.

use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use tracing::debug;

use crate::collection::QueueCollection;
use crate::stats::Statistics;

/// A whole input handed to the handler: either a stripped command line, or
/// raw body bytes while a SET is in progress.
///
/// Lines are raw bytes, not `String`: a key is only required to avoid
/// whitespace and control bytes (SPEC_FULL §6), not to be valid UTF-8, and
/// framing must not depend on the transport successfully decoding one.
pub enum Input {
    Line(Vec<u8>),
    Body(Vec<u8>),
}

/// The transport-side continuations the handler drives replies through.
#[async_trait]
pub trait ReplySink: Send {
    async fn send(&mut self, data: &[u8]);
    async fn exit(&mut self);
}

struct PendingSet {
    key: String,
    flags: u32,
    expiry: u32,
    length: usize,
    buffer: Vec<u8>,
}

/// Per-connection protocol state. One instance per TCP connection.
pub struct ProtocolHandler {
    pending_set: Option<PendingSet>,
    expirations: HashMap<String, u64>,
    start_time: u64,
    set_just_completed: bool,
}

const UNKNOWN_COMMAND: &[u8] = b"CLIENT_ERROR bad command line format\r\n";
const STORED: &[u8] = b"STORED\r\n";
const NOT_STORED: &[u8] = b"NOT STORED\r\n";
const BAD_DATA_CHUNK: &[u8] = b"CLIENT_ERROR bad data chunk\r\nERROR\r\n";
const END: &[u8] = b"END\r\n";

impl Default for ProtocolHandler {
    fn default() -> Self {
        Self::new()
    }
}

impl ProtocolHandler {
    pub fn new() -> Self {
        Self {
            pending_set: None,
            expirations: HashMap::new(),
            start_time: unix_now(),
            set_just_completed: false,
        }
    }

    /// True while a SET body is being accumulated; the transport should
    /// read exactly the remaining body bytes (plus a trailing `\r\n`) next,
    /// not another command line.
    pub fn awaiting_body(&self) -> Option<usize> {
        self.pending_set
            .as_ref()
            .map(|p| p.length - p.buffer.len())
    }

    /// True exactly once, immediately after a SET has just been finalized
    /// (STORED or NOT STORED replied) by the most recent `process` call -
    /// including a zero-length SET finalized inline from its command line,
    /// not just one completed via a body input. Clears itself on read.
    /// The transport should consume and discard a trailing `\r\n` whenever
    /// this fires, since some memcache clients send one unconditionally,
    /// even after a zero-length value.
    pub fn take_set_just_completed(&mut self) -> bool {
        std::mem::take(&mut self.set_just_completed)
    }

    /// Processes one input against the shared queue collection and server
    /// statistics, driving replies through `sink`.
    pub async fn process(
        &mut self,
        input: Input,
        collection: &QueueCollection,
        stats: &Statistics,
        sink: &mut dyn ReplySink,
    ) {
        match input {
            Input::Line(line) => self.process_line(&line, collection, stats, sink).await,
            Input::Body(bytes) => self.process_body(bytes, collection, sink).await,
        }
    }

    async fn process_line(
        &mut self,
        line: &[u8],
        collection: &QueueCollection,
        stats: &Statistics,
        sink: &mut dyn ReplySink,
    ) {
        if self.pending_set.is_some() {
            // A command line arrived while a body was expected: the framing
            // contract was violated by the caller. Reset and report it.
            self.pending_set = None;
            sink.send(BAD_DATA_CHUNK).await;
            return;
        }

        let tokens: Vec<&[u8]> = line.split(|&b| b == b' ').filter(|t| !t.is_empty()).collect();
        match tokens.as_slice() {
            [b"get", key] if valid_key(key) => {
                let Some(key) = as_utf8_key(key) else {
                    sink.send(UNKNOWN_COMMAND).await;
                    return;
                };
                stats.get_requests.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                self.handle_get(key, collection, sink).await;
            }
            [b"set", key, flags, expiry, length] if valid_key(key) => {
                let Some(key) = as_utf8_key(key) else {
                    sink.send(UNKNOWN_COMMAND).await;
                    return;
                };
                stats.set_requests.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                match (parse_uint::<u32>(flags), parse_uint::<u32>(expiry), parse_uint::<usize>(length)) {
                    (Some(flags), Some(expiry), Some(length)) => {
                        debug!(key, flags, expiry, length, "received SET");
                        self.pending_set = Some(PendingSet {
                            key: key.to_string(),
                            flags,
                            expiry,
                            length,
                            buffer: Vec::with_capacity(length),
                        });
                        if length == 0 {
                            self.finalize_set(collection, sink).await;
                        }
                    }
                    _ => sink.send(UNKNOWN_COMMAND).await,
                }
            }
            [b"delete", key, n] if valid_key(key) && parse_uint::<u64>(n).is_some() => {
                let Some(key) = as_utf8_key(key) else {
                    sink.send(UNKNOWN_COMMAND).await;
                    return;
                };
                stats
                    .delete_requests
                    .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                collection.delete(key);
                sink.send(END).await;
            }
            [b"stats"] => {
                let body = self.render_stats(collection, stats);
                sink.send(body.as_bytes()).await;
            }
            [b"quit"] => {
                stats.clean_exits.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                sink.send(END).await;
            }
            [b"shutdown"] => {
                sink.send(END).await;
                sink.exit().await;
            }
            _ => sink.send(UNKNOWN_COMMAND).await,
        }
    }

    async fn process_body(
        &mut self,
        mut bytes: Vec<u8>,
        collection: &QueueCollection,
        sink: &mut dyn ReplySink,
    ) {
        let Some(pending) = self.pending_set.as_mut() else {
            sink.send(BAD_DATA_CHUNK).await;
            return;
        };
        pending.buffer.append(&mut bytes);
        if pending.buffer.len() >= pending.length {
            self.finalize_set(collection, sink).await;
        }
    }

    async fn finalize_set(&mut self, collection: &QueueCollection, sink: &mut dyn ReplySink) {
        let Some(pending) = self.pending_set.take() else {
            return;
        };
        // A trailing `\r\n` follows the body regardless of its length, even
        // a zero-length one finalized inline from the SET command line
        // itself; the transport consumes it once this fires.
        self.set_just_completed = true;
        if pending.buffer.len() != pending.length {
            sink.send(BAD_DATA_CHUNK).await;
            return;
        }
        let mut record = Vec::with_capacity(8 + pending.buffer.len());
        record.extend_from_slice(&pending.flags.to_be_bytes());
        record.extend_from_slice(&pending.expiry.to_be_bytes());
        record.extend_from_slice(&pending.buffer);

        if collection.put(&pending.key, record).await {
            sink.send(STORED).await;
        } else {
            sink.send(NOT_STORED).await;
        }
    }

    async fn handle_get(&mut self, key: &str, collection: &QueueCollection, sink: &mut dyn ReplySink) {
        let now = unix_now();
        loop {
            let Some(record) = collection.get(key).await else {
                sink.send(END).await;
                return;
            };
            match unpack_record(&record) {
                Some((flags, expiry, body)) if expiry == 0 || expiry as u64 >= now => {
                    let header = format!("VALUE {} {} {}\r\n", key, flags, body.len());
                    let mut reply = Vec::with_capacity(header.len() + body.len() + 2 + END.len());
                    reply.extend_from_slice(header.as_bytes());
                    reply.extend_from_slice(body);
                    reply.extend_from_slice(b"\r\n");
                    reply.extend_from_slice(END);
                    sink.send(&reply).await;
                    return;
                }
                Some(_) => {
                    *self.expirations.entry(key.to_string()).or_insert(0) += 1;
                    continue;
                }
                None => {
                    // Malformed stored record (shorter than the 8-byte
                    // header); drop it and keep draining.
                    continue;
                }
            }
        }
    }

    fn render_stats(&self, collection: &QueueCollection, stats: &Statistics) -> String {
        let now = unix_now();
        let uptime = now.saturating_sub(self.start_time);
        let (user, system) = rusage_seconds();
        let current_size = collection.get_statistic("current_size").unwrap_or(0);
        let total_items = collection.get_statistic("total_items").unwrap_or(0);
        let current_bytes = collection.get_statistic("current_bytes").unwrap_or(0);
        let get_hits = collection.get_statistic("get_hits").unwrap_or(0);
        let get_misses = collection.get_statistic("get_misses").unwrap_or(0);

        let mut out = String::new();
        out.push_str(&format!("STAT pid {}\r\n", std::process::id()));
        out.push_str(&format!("STAT uptime {}\r\n", uptime));
        out.push_str(&format!("STAT time {}\r\n", now));
        out.push_str(&format!("STAT version {}\r\n", env!("CARGO_PKG_VERSION")));
        out.push_str(&format!("STAT rusage_user {:.6}\r\n", user));
        out.push_str(&format!("STAT rusage_system {:.6}\r\n", system));
        out.push_str(&format!("STAT curr_items {}\r\n", current_size));
        out.push_str(&format!("STAT total_items {}\r\n", total_items));
        out.push_str(&format!("STAT bytes {}\r\n", current_bytes));
        out.push_str(&format!(
            "STAT curr_connections {}\r\n",
            stats.get_named("connections")
        ));
        out.push_str(&format!(
            "STAT total_connections {}\r\n",
            stats.get_named("total_connections")
        ));
        out.push_str(&format!("STAT cmd_get {}\r\n", stats.get_named("get_requests")));
        out.push_str(&format!("STAT cmd_set {}\r\n", stats.get_named("set_requests")));
        out.push_str(&format!("STAT get_hits {}\r\n", get_hits));
        out.push_str(&format!("STAT get_misses {}\r\n", get_misses));
        out.push_str(&format!("STAT bytes_read {}\r\n", stats.get_named("bytes_read")));
        out.push_str(&format!(
            "STAT bytes_written {}\r\n",
            stats.get_named("bytes_written")
        ));
        out.push_str("STAT limit_maxbytes 0\r\n");

        for queue in collection.queues_snapshot() {
            let name = queue.name();
            let expired = self.expirations.get(name).copied().unwrap_or(0);
            out.push_str(&format!("STAT queue_{}_items {}\r\n", name, queue.qsize()));
            out.push_str(&format!(
                "STAT queue_{}_total_items {}\r\n",
                name,
                queue.total_items()
            ));
            out.push_str(&format!("STAT queue_{}_logsize {}\r\n", name, queue.log_size()));
            out.push_str(&format!("STAT queue_{}_expired_items {}\r\n", name, expired));
        }
        out.push_str("END\r\n");
        out
    }
}

/// Byte-level key validation (SPEC_FULL §6): 1..250 bytes, no whitespace, no
/// control characters. Deliberately operates on raw bytes rather than `&str`
/// so a key is never rejected for failing to be valid UTF-8 - only for
/// violating the documented byte-level constraints.
fn valid_key(key: &[u8]) -> bool {
    let len = key.len();
    (1..=250).contains(&len) && !key.iter().any(|b| b.is_ascii_whitespace() || b.is_ascii_control())
}

/// Decodes an already-`valid_key`-checked key as UTF-8. Queue names are
/// stored and looked up as `String`, so a key that is valid per the wire
/// grammar but not valid UTF-8 (e.g. a lone high byte) cannot be served;
/// callers treat `None` the same as any other malformed command line.
fn as_utf8_key(key: &[u8]) -> Option<&str> {
    std::str::from_utf8(key).ok()
}

/// Parses an ASCII non-negative integer token. Any byte outside `0-9`,
/// including non-UTF-8 bytes that would make `from_utf8` itself fail, is
/// simply an invalid number rather than a decoding error.
fn parse_uint<T: std::str::FromStr>(token: &[u8]) -> Option<T> {
    std::str::from_utf8(token).ok()?.parse().ok()
}

/// Unpacks `[flags(4), expiry(4), body]`; returns `None` if shorter than the
/// fixed 8-byte header.
fn unpack_record(record: &[u8]) -> Option<(u32, u32, &[u8])> {
    if record.len() < 8 {
        return None;
    }
    let flags = u32::from_be_bytes(record[0..4].try_into().ok()?);
    let expiry = u32::from_be_bytes(record[4..8].try_into().ok()?);
    Some((flags, expiry, &record[8..]))
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// User/system CPU time for this process, in seconds, via `getrusage(2)` —
/// the nearest idiomatic equivalent to the historical broker's use of
/// Python's `resource.getrusage`.
fn rusage_seconds() -> (f64, f64) {
    unsafe {
        let mut usage: libc::rusage = std::mem::zeroed();
        if libc::getrusage(libc::RUSAGE_SELF, &mut usage) != 0 {
            return (0.0, 0.0);
        }
        let user = usage.ru_utime.tv_sec as f64 + usage.ru_utime.tv_usec as f64 / 1_000_000.0;
        let system = usage.ru_stime.tv_sec as f64 + usage.ru_stime.tv_usec as f64 / 1_000_000.0;
        (user, system)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[derive(Default)]
    struct RecordingSink {
        sent: Vec<Vec<u8>>,
        exited: bool,
    }

    #[async_trait]
    impl ReplySink for RecordingSink {
        async fn send(&mut self, data: &[u8]) {
            self.sent.push(data.to_vec());
        }
        async fn exit(&mut self) {
            self.exited = true;
        }
    }

    fn collection() -> (tempfile::TempDir, QueueCollection) {
        let dir = tempdir().unwrap();
        let collection = QueueCollection::new(dir.path()).unwrap();
        (dir, collection)
    }

    #[allow(clippy::too_many_arguments)]
    async fn set(
        handler: &mut ProtocolHandler,
        collection: &QueueCollection,
        stats: &Statistics,
        sink: &mut RecordingSink,
        key: &str,
        flags: u32,
        expiry: u32,
        body: &[u8],
    ) {
        handler
            .process(
                Input::Line(format!("set {} {} {} {}", key, flags, expiry, body.len()).into_bytes()),
                collection,
                stats,
                sink,
            )
            .await;
        handler
            .process(Input::Body(body.to_vec()), collection, stats, sink)
            .await;
    }

    #[tokio::test]
    async fn roundtrip_set_then_get() {
        let (_dir, collection) = collection();
        let stats = Statistics::new();
        let mut handler = ProtocolHandler::new();
        let mut sink = RecordingSink::default();

        set(&mut handler, &collection, &stats, &mut sink, "foo", 0, 0, b"hello").await;
        assert_eq!(sink.sent.last().unwrap(), STORED);

        handler
            .process(Input::Line("get foo".as_bytes().to_vec()), &collection, &stats, &mut sink)
            .await;
        assert_eq!(
            sink.sent.last().unwrap(),
            b"VALUE foo 0 5\r\nhello\r\nEND\r\n"
        );

        handler
            .process(Input::Line("get foo".as_bytes().to_vec()), &collection, &stats, &mut sink)
            .await;
        assert_eq!(sink.sent.last().unwrap(), END);
    }

    #[tokio::test]
    async fn flags_are_echoed() {
        let (_dir, collection) = collection();
        let stats = Statistics::new();
        let mut handler = ProtocolHandler::new();
        let mut sink = RecordingSink::default();

        set(&mut handler, &collection, &stats, &mut sink, "baz", 42, 0, b"ok").await;
        handler
            .process(Input::Line("get baz".as_bytes().to_vec()), &collection, &stats, &mut sink)
            .await;
        assert_eq!(sink.sent.last().unwrap(), b"VALUE baz 42 2\r\nok\r\nEND\r\n");
    }

    #[tokio::test]
    async fn expired_item_is_skipped_and_counted() {
        let (_dir, collection) = collection();
        let stats = Statistics::new();
        let mut handler = ProtocolHandler::new();
        let mut sink = RecordingSink::default();

        set(&mut handler, &collection, &stats, &mut sink, "bar", 7, 1, b"abc").await;
        handler
            .process(Input::Line("get bar".as_bytes().to_vec()), &collection, &stats, &mut sink)
            .await;
        assert_eq!(sink.sent.last().unwrap(), END);
        assert_eq!(*handler.expirations.get("bar").unwrap(), 1);

        let rendered = handler.render_stats(&collection, &stats);
        assert!(rendered.contains("STAT queue_bar_expired_items 1\r\n"));
    }

    #[tokio::test]
    async fn unknown_command_leaves_connection_usable() {
        let (_dir, collection) = collection();
        let stats = Statistics::new();
        let mut handler = ProtocolHandler::new();
        let mut sink = RecordingSink::default();

        handler
            .process(Input::Line("frobnicate".as_bytes().to_vec()), &collection, &stats, &mut sink)
            .await;
        assert_eq!(sink.sent.last().unwrap(), UNKNOWN_COMMAND);

        handler
            .process(Input::Line("stats".as_bytes().to_vec()), &collection, &stats, &mut sink)
            .await;
        assert!(sink.sent.last().unwrap().ends_with(b"END\r\n"));
    }

    #[tokio::test]
    async fn non_utf8_key_is_a_client_error_not_a_dropped_connection() {
        let (_dir, collection) = collection();
        let stats = Statistics::new();
        let mut handler = ProtocolHandler::new();
        let mut sink = RecordingSink::default();

        // A lone high byte is a valid key per the byte-level wire grammar
        // (no whitespace, no control chars) but not valid UTF-8; it must
        // reply CLIENT_ERROR rather than panicking or hanging, and the
        // connection must stay usable afterwards.
        let mut line = b"get ".to_vec();
        line.push(0xFF);
        handler
            .process(Input::Line(line), &collection, &stats, &mut sink)
            .await;
        assert_eq!(sink.sent.last().unwrap(), UNKNOWN_COMMAND);

        handler
            .process(Input::Line("get foo".as_bytes().to_vec()), &collection, &stats, &mut sink)
            .await;
        assert_eq!(sink.sent.last().unwrap(), END);
    }

    #[tokio::test]
    async fn zero_length_set_finalizes_inline_and_marks_itself_complete() {
        let (_dir, collection) = collection();
        let stats = Statistics::new();
        let mut handler = ProtocolHandler::new();
        let mut sink = RecordingSink::default();

        handler
            .process(
                Input::Line("set k 0 0 0".as_bytes().to_vec()),
                &collection,
                &stats,
                &mut sink,
            )
            .await;
        assert_eq!(sink.sent.last().unwrap(), STORED);
        assert!(handler.awaiting_body().is_none());
        // The transport is responsible for consuming the trailing \r\n;
        // the handler just needs to say one completed.
        assert!(handler.take_set_just_completed());
        assert!(!handler.take_set_just_completed(), "flag should clear on read");
    }

    #[tokio::test]
    async fn shutdown_sends_end_then_exits() {
        let (_dir, collection) = collection();
        let stats = Statistics::new();
        let mut handler = ProtocolHandler::new();
        let mut sink = RecordingSink::default();

        handler
            .process(Input::Line("shutdown".as_bytes().to_vec()), &collection, &stats, &mut sink)
            .await;
        assert_eq!(sink.sent.last().unwrap(), END);
        assert!(sink.exited);
    }

    #[tokio::test]
    async fn delete_replies_end_even_for_unknown_queue() {
        let (_dir, collection) = collection();
        let stats = Statistics::new();
        let mut handler = ProtocolHandler::new();
        let mut sink = RecordingSink::default();

        handler
            .process(Input::Line("delete ghost 0".as_bytes().to_vec()), &collection, &stats, &mut sink)
            .await;
        assert_eq!(sink.sent.last().unwrap(), END);
    }

    #[tokio::test]
    async fn stats_fields_appear_in_documented_order() {
        let (_dir, collection) = collection();
        let stats = Statistics::new();
        let handler = ProtocolHandler::new();
        let rendered = handler.render_stats(&collection, &stats);
        let expected_order = [
            "pid", "uptime", "time", "version", "rusage_user", "rusage_system", "curr_items",
            "total_items", "bytes", "curr_connections", "total_connections", "cmd_get",
            "cmd_set", "get_hits", "get_misses", "bytes_read", "bytes_written", "limit_maxbytes",
        ];
        let mut last_pos = 0usize;
        for field in expected_order {
            let needle = format!("STAT {} ", field);
            let pos = rendered.find(&needle).unwrap_or_else(|| panic!("missing {needle}"));
            assert!(pos >= last_pos, "field {field} out of order");
            last_pos = pos;
        }
        assert!(rendered.ends_with("END\r\n"));
    }
}
