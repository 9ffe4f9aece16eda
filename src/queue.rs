//! # PersistentQueue
//!
//! A single named, durable FIFO. Items are opaque byte strings (already
//! packed by the protocol layer into `[flags(4), expiry(4), body]`); this
//! module never interprets their contents, only their length.
//!
//! Every in-memory mutation that also touches the log file is serialized
//! through one [`parking_lot::Mutex`] per queue so that log records are
//! written in exactly the order their effects become visible to `get()`.

use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::error::TransactionLogError;

const MAX_LOG_SIZE: u64 = 16 * 1024 * 1024;
const OPCODE_PUSH: u8 = 0x00;
const OPCODE_POP: u8 = 0x01;

struct Inner {
    items: VecDeque<Vec<u8>>,
    total_items: u64,
    log_size: u64,
    file: Option<File>,
}

/// A durable FIFO backed by an append-only transaction log.
pub struct PersistentQueue {
    name: String,
    log_path: PathBuf,
    rotation_threshold: u64,
    inner: Mutex<Inner>,
}

impl PersistentQueue {
    /// Opens (creating if necessary) the queue's log at `<root>/<name>`,
    /// replaying it to reconstruct in-memory state. Returns the queue along
    /// with `initial_bytes`, the net body-byte delta the collection should
    /// apply to its own `current_bytes` counter.
    pub fn open(root: &Path, name: &str) -> Result<(Self, i64), TransactionLogError> {
        let log_path = root.join(name);
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&log_path)
            .map_err(|source| TransactionLogError::Io {
                name: name.to_string(),
                source,
            })?;

        let mut items = VecDeque::new();
        let mut total_items: u64 = 0;
        let mut initial_bytes: i64 = 0;

        file.seek(SeekFrom::Start(0))
            .map_err(|source| TransactionLogError::Io {
                name: name.to_string(),
                source,
            })?;

        debug!(queue = name, "replaying transaction log");
        loop {
            let mut opcode = [0u8; 1];
            match file.read(&mut opcode) {
                Ok(0) => break,
                Ok(_) => {}
                Err(source) => {
                    return Err(TransactionLogError::Io {
                        name: name.to_string(),
                        source,
                    })
                }
            }
            match opcode[0] {
                OPCODE_PUSH => {
                    let mut len_buf = [0u8; 4];
                    if file.read_exact(&mut len_buf).is_err() {
                        break;
                    }
                    let len = u32::from_le_bytes(len_buf) as usize;
                    let mut data = vec![0u8; len];
                    if file.read_exact(&mut data).is_err() {
                        break;
                    }
                    initial_bytes += data.len() as i64;
                    total_items += 1;
                    items.push_back(data);
                }
                OPCODE_POP => {
                    if let Some(popped) = items.pop_front() {
                        initial_bytes -= popped.len() as i64;
                    }
                }
                other => {
                    warn!(queue = name, opcode = other, "invalid command in transaction log");
                    break;
                }
            }
        }
        debug!(queue = name, "finished replaying transaction log");

        let log_size = file
            .seek(SeekFrom::End(0))
            .map_err(|source| TransactionLogError::Io {
                name: name.to_string(),
                source,
            })?;

        let queue = Self {
            name: name.to_string(),
            log_path,
            rotation_threshold: MAX_LOG_SIZE,
            inner: Mutex::new(Inner {
                items,
                total_items,
                log_size,
                file: Some(file),
            }),
        };
        Ok((queue, initial_bytes))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current number of items resident in memory.
    pub fn qsize(&self) -> usize {
        self.inner.lock().items.len()
    }

    pub fn total_items(&self) -> u64 {
        self.inner.lock().total_items
    }

    pub fn log_size(&self) -> u64 {
        self.inner.lock().log_size
    }

    /// Appends `value` to the tail of the queue. When `log` is true, the
    /// push is also durably recorded before this call returns.
    pub fn put(&self, value: Vec<u8>, log: bool) -> Result<(), TransactionLogError> {
        let mut inner = self.inner.lock();
        if log {
            Self::write_record(&mut inner, &self.name, OPCODE_PUSH, Some(&value))?;
        }
        inner.total_items += 1;
        inner.items.push_back(value);
        if log {
            Self::maybe_rotate(&mut inner, &self.name, &self.log_path, self.rotation_threshold);
        }
        Ok(())
    }

    /// Removes and returns the head of the queue, or `None` if empty.
    pub fn get(&self, log: bool) -> Result<Option<Vec<u8>>, TransactionLogError> {
        let mut inner = self.inner.lock();
        let value = inner.items.pop_front();
        if value.is_some() && log {
            Self::write_record(&mut inner, &self.name, OPCODE_POP, None)?;
            Self::maybe_rotate(&mut inner, &self.name, &self.log_path, self.rotation_threshold);
        }
        Ok(value)
    }

    /// Overrides the rotation size threshold. Test-only: exercising the real
    /// 16MiB threshold would mean writing that much data per test.
    #[cfg(test)]
    fn set_rotation_threshold_for_test(&mut self, threshold: u64) {
        self.rotation_threshold = threshold;
    }

    /// Flushes and closes the log. Subsequent logged `put`/`get` calls fail.
    pub fn close(&self) {
        let mut inner = self.inner.lock();
        debug!(queue = %self.name, "closing queue");
        inner.file = None;
    }

    /// Closes the log and unlinks its file. Idempotent.
    pub fn purge(&self) {
        self.close();
        debug!(queue = %self.name, "purging queue log");
        let _ = std::fs::remove_file(&self.log_path);
    }

    fn write_record(
        inner: &mut Inner,
        name: &str,
        opcode: u8,
        payload: Option<&[u8]>,
    ) -> Result<(), TransactionLogError> {
        let file = inner
            .file
            .as_mut()
            .ok_or_else(|| TransactionLogError::NotOpen(name.to_string()))?;

        let mut written = 1u64;
        file.write_all(&[opcode])
            .map_err(|source| TransactionLogError::Io {
                name: name.to_string(),
                source,
            })?;
        if let Some(data) = payload {
            let len = data.len() as u32;
            file.write_all(&len.to_le_bytes())
                .map_err(|source| TransactionLogError::Io {
                    name: name.to_string(),
                    source,
                })?;
            file.write_all(data)
                .map_err(|source| TransactionLogError::Io {
                    name: name.to_string(),
                    source,
                })?;
            written += 4 + data.len() as u64;
        }
        file.flush().map_err(|source| TransactionLogError::Io {
            name: name.to_string(),
            source,
        })?;
        inner.log_size += written;
        Ok(())
    }

    /// Rotates the log file if it has grown past the size threshold and the
    /// queue is currently empty; rotation on a non-empty queue would discard
    /// state the new empty log could not reconstruct.
    fn maybe_rotate(inner: &mut Inner, name: &str, log_path: &Path, threshold: u64) {
        if inner.log_size <= threshold || !inner.items.is_empty() {
            return;
        }
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        let rotated = log_path.with_file_name(format!(
            "{}.{}",
            log_path.file_name().unwrap_or_default().to_string_lossy(),
            timestamp
        ));
        debug!(queue = name, rotated = %rotated.display(), "rotating log");
        inner.file = None;
        if let Err(err) = std::fs::rename(log_path, &rotated) {
            warn!(queue = name, error = %err, "failed to rotate log");
        }
        match OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(log_path)
        {
            Ok(file) => {
                inner.file = Some(file);
                inner.log_size = 0;
            }
            Err(err) => warn!(queue = name, error = %err, "failed to reopen log after rotation"),
        }
    }
}
