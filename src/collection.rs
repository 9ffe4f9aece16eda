//! # QueueCollection
//!
//! Owns every [`PersistentQueue`] under a root directory, lazily creating
//! them on first reference and guaranteeing that concurrent first-references
//! to the same name rendezvous on a single instance rather than racing to
//! create two.
//!
//! The historical broker this crate descends from serialized creation with
//! a per-key lock it deleted right after use - a known race (two callers can
//! both pass the `is_locked` check before either acquires). Here, creation
//! is single-flighted through a `tokio::sync::OnceCell` stored per name, so
//! there is no window where the cell can be observed as "not yet created"
//! by two callers who then both proceed to create it.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::{Mutex as AsyncMutex, OnceCell};
use tracing::debug;

use crate::error::QueueCollectionError;
use crate::queue::PersistentQueue;

type CreationCell = Arc<OnceCell<Option<Arc<PersistentQueue>>>>;

/// Lists the queue names with a primary log file directly under `root`,
/// skipping rotated backups (`<name>.<unix_timestamp>`).
fn existing_queue_names(root: &Path) -> Result<Vec<String>, QueueCollectionError> {
    let mut names = Vec::new();
    let entries = std::fs::read_dir(root)
        .map_err(|err| QueueCollectionError::PathInaccessible(root.to_path_buf(), err))?;
    for entry in entries {
        let entry = entry.map_err(|err| QueueCollectionError::PathInaccessible(root.to_path_buf(), err))?;
        if !entry.file_type().map(|ft| ft.is_file()).unwrap_or(false) {
            continue;
        }
        let file_name = entry.file_name();
        let Some(name) = file_name.to_str() else {
            continue;
        };
        let is_rotated_backup = name
            .rsplit_once('.')
            .is_some_and(|(_, suffix)| suffix.parse::<u64>().is_ok());
        if !is_rotated_backup {
            names.push(name.to_string());
        }
    }
    Ok(names)
}

/// Aggregate statistics tracked across all queues in a collection.
#[derive(Debug, Default)]
pub struct CollectionStats {
    pub current_bytes: AtomicI64,
    pub total_items: AtomicU64,
    pub get_hits: AtomicU64,
    pub get_misses: AtomicU64,
}

pub struct QueueCollection {
    root: PathBuf,
    queues: RwLock<HashMap<String, Arc<PersistentQueue>>>,
    creating: AsyncMutex<HashMap<String, CreationCell>>,
    shutdown: AtomicBool,
    pub stats: CollectionStats,
}

impl QueueCollection {
    /// Creates the root directory if it does not already exist, then opens
    /// and replays every existing queue log found in it. `get` never
    /// creates a queue on its own, so a queue that survived a previous
    /// process has to already be in the registry by the time a client can
    /// reference it - this is what lets a plain `get` after a restart see
    /// durable contents without ever having been `put` to in this process.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, QueueCollectionError> {
        let root = root.into();
        if !root.is_dir() {
            std::fs::create_dir_all(&root)
                .map_err(|err| QueueCollectionError::PathInaccessible(root.clone(), err))?;
        }

        let mut queues = HashMap::new();
        let mut current_bytes: i64 = 0;
        for name in existing_queue_names(&root)? {
            let (queue, initial_bytes) = PersistentQueue::open(&root, &name)
                .map_err(|err| QueueCollectionError::LoadFailed(name.clone(), err))?;
            debug!(queue = %name, "loaded existing queue log");
            current_bytes += initial_bytes;
            queues.insert(name, Arc::new(queue));
        }

        Ok(Self {
            root,
            queues: RwLock::new(queues),
            creating: AsyncMutex::new(HashMap::new()),
            shutdown: AtomicBool::new(false),
            stats: CollectionStats {
                current_bytes: AtomicI64::new(current_bytes),
                ..CollectionStats::default()
            },
        })
    }

    fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    /// Enqueues `value` under `key`, creating the queue if it does not yet
    /// exist. Returns `false` if the collection is shut down or the queue
    /// could not be created/used.
    pub async fn put(&self, key: &str, value: Vec<u8>) -> bool {
        let Some(queue) = self.get_or_create(key).await else {
            return false;
        };
        let len = value.len();
        let result = tokio::task::spawn_blocking(move || queue.put(value, true)).await;
        match result {
            Ok(Ok(())) => {
                self.stats.current_bytes.fetch_add(len as i64, Ordering::Relaxed);
                self.stats.total_items.fetch_add(1, Ordering::Relaxed);
                true
            }
            _ => false,
        }
    }

    /// Dequeues the head value under `key`. Never creates a queue; a
    /// reference to an unknown name is simply a miss.
    pub async fn get(&self, key: &str) -> Option<Vec<u8>> {
        if self.is_shutdown() {
            return None;
        }
        let queue = self.queues.read().get(key).cloned();
        let Some(queue) = queue else {
            self.stats.get_misses.fetch_add(1, Ordering::Relaxed);
            return None;
        };
        let result = tokio::task::spawn_blocking(move || queue.get(true))
            .await
            .ok()
            .and_then(|r| r.ok())
            .flatten();
        match result {
            Some(value) => {
                self.stats
                    .current_bytes
                    .fetch_sub(value.len() as i64, Ordering::Relaxed);
                self.stats.get_hits.fetch_add(1, Ordering::Relaxed);
                Some(value)
            }
            None => {
                self.stats.get_misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Purges and removes the named queue, if present.
    pub fn delete(&self, key: &str) -> bool {
        let removed = self.queues.write().remove(key);
        match removed {
            Some(queue) => {
                queue.purge();
                true
            }
            None => false,
        }
    }

    /// Returns the existing queue named `key`, or `None` for an unknown
    /// name. Never creates a queue - use [`Self::get_or_create`] for that.
    pub fn queue(&self, key: &str) -> Option<Arc<PersistentQueue>> {
        self.queues.read().get(key).cloned()
    }

    /// Returns every live queue, keyed by name.
    pub fn queues_snapshot(&self) -> Vec<Arc<PersistentQueue>> {
        self.queues.read().values().cloned().collect()
    }

    /// Returns the queue named `key`, creating it (and any ancestors in the
    /// single-flight map) if this is the first reference. Returns `None`
    /// if the collection is shut down.
    pub async fn get_or_create(&self, key: &str) -> Option<Arc<PersistentQueue>> {
        if self.is_shutdown() {
            return None;
        }
        if let Some(existing) = self.queues.read().get(key).cloned() {
            return Some(existing);
        }

        let cell: CreationCell = {
            let mut creating = self.creating.lock().await;
            creating
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(OnceCell::new()))
                .clone()
        };

        let root = self.root.clone();
        let name = key.to_string();
        let result = cell
            .get_or_init(|| async move {
                if self.is_shutdown() {
                    return None;
                }
                if let Some(existing) = self.queues.read().get(&name).cloned() {
                    return Some(existing);
                }
                let name_for_blocking = name.clone();
                let opened = tokio::task::spawn_blocking(move || {
                    PersistentQueue::open(&root, &name_for_blocking)
                })
                .await
                .ok()?
                .ok()?;
                let (queue, initial_bytes) = opened;
                debug!(queue = %name, "created new queue");
                let queue = Arc::new(queue);
                self.queues.write().insert(name.clone(), queue.clone());
                self.stats
                    .current_bytes
                    .fetch_add(initial_bytes, Ordering::Relaxed);
                Some(queue)
            })
            .await
            .clone();

        self.creating.lock().await.remove(key);
        result
    }

    /// Returns the named counter, the synthetic `current_size`, or `None`
    /// for an unrecognized name.
    pub fn get_statistic(&self, name: &str) -> Option<i64> {
        match name {
            "current_bytes" => Some(self.stats.current_bytes.load(Ordering::Relaxed)),
            "total_items" => Some(self.stats.total_items.load(Ordering::Relaxed) as i64),
            "get_hits" => Some(self.stats.get_hits.load(Ordering::Relaxed) as i64),
            "get_misses" => Some(self.stats.get_misses.load(Ordering::Relaxed) as i64),
            "current_size" => Some(
                self.queues
                    .read()
                    .values()
                    .map(|q| q.qsize() as i64)
                    .sum(),
            ),
            _ => None,
        }
    }

    /// Transitions to shutdown and closes every queue. Once shut down, no
    /// further creations or mutations are possible.
    pub fn close(&self) {
        self.shutdown.store(true, Ordering::Release);
        let mut queues = self.queues.write();
        for (_, queue) in queues.drain() {
            queue.close();
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}
