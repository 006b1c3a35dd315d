use std::collections::HashMap;
use std::hash::{DefaultHasher, Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::backend::{epoch_seconds, StorageBackend};
use crate::errors::{RateThrottleError, Result};

const SHARD_COUNT: usize = 32;
const SWEEP_INTERVAL: Duration = Duration::from_secs(1);
const SWEEP_WRITE_THRESHOLD: u64 = 1000;

#[derive(Debug, Clone)]
enum Stored {
    Bytes(Vec<u8>),
    Counter(i64),
    Timestamps(Vec<f64>),
}

#[derive(Debug, Clone)]
struct Entry {
    value: Stored,
    expires_at: Option<f64>,
}

impl Entry {
    fn expired(&self, now: f64) -> bool {
        matches!(self.expires_at, Some(at) if at <= now)
    }
}

struct Shard {
    entries: Mutex<HashMap<String, Entry>>,
}

/// Entry counts reported by [`MemoryBackend::stats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryStats {
    pub total_keys: usize,
    pub expired_keys: usize,
}

/// In-process storage backend.
///
/// The key space is split across 32 shards, each guarded by its own
/// mutex. Expired entries are evicted by a background task every
/// second, by an inline sweep every 1 000 writes (whichever comes
/// first), and lazily whenever a read observes them.
pub struct MemoryBackend {
    shards: Arc<Vec<Shard>>,
    writes: AtomicU64,
    sweeper: Option<JoinHandle<()>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        let shards: Arc<Vec<Shard>> = Arc::new(
            (0..SHARD_COUNT)
                .map(|_| Shard {
                    entries: Mutex::new(HashMap::new()),
                })
                .collect(),
        );

        // The periodic sweeper needs a runtime; without one, expiry
        // still happens lazily and on the write-count trigger.
        let sweeper = tokio::runtime::Handle::try_current().ok().map(|handle| {
            let shards = Arc::clone(&shards);
            handle.spawn(async move {
                let mut tick = tokio::time::interval(SWEEP_INTERVAL);
                loop {
                    tick.tick().await;
                    sweep(&shards);
                }
            })
        });

        Self {
            shards,
            writes: AtomicU64::new(0),
            sweeper,
        }
    }

    fn shard(&self, key: &str) -> &Shard {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        &self.shards[(hasher.finish() as usize) % SHARD_COUNT]
    }

    fn note_write(&self) {
        let writes = self.writes.fetch_add(1, Ordering::Relaxed) + 1;
        if writes % SWEEP_WRITE_THRESHOLD == 0 {
            sweep(&self.shards);
        }
    }

    /// Drop every entry. Primarily useful for tests.
    pub fn clear(&self) {
        for shard in self.shards.iter() {
            shard.entries.lock().unwrap().clear();
        }
    }

    /// Entry counts across all shards.
    pub fn stats(&self) -> MemoryStats {
        let now = epoch_seconds();
        let mut total = 0;
        let mut expired = 0;
        for shard in self.shards.iter() {
            let entries = shard.entries.lock().unwrap();
            total += entries.len();
            expired += entries.values().filter(|e| e.expired(now)).count();
        }
        MemoryStats {
            total_keys: total,
            expired_keys: expired,
        }
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for MemoryBackend {
    fn drop(&mut self) {
        if let Some(handle) = self.sweeper.take() {
            handle.abort();
        }
    }
}

fn sweep(shards: &[Shard]) {
    let now = epoch_seconds();
    let mut removed = 0usize;
    for shard in shards {
        let mut entries = shard.entries.lock().unwrap();
        let before = entries.len();
        entries.retain(|_, entry| !entry.expired(now));
        removed += before - entries.len();
    }
    if removed > 0 {
        debug!("Swept {} expired entries", removed);
    }
}

fn expiry_for(ttl: f64, now: f64) -> Option<f64> {
    (ttl > 0.0).then_some(now + ttl)
}

fn type_error(key: &str, op: &str) -> RateThrottleError {
    RateThrottleError::BackendUnavailable(format!(
        "{} on '{}' holds a value of the wrong type",
        op, key
    ))
}

#[async_trait]
impl StorageBackend for MemoryBackend {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let now = epoch_seconds();
        let mut entries = self.shard(key).entries.lock().unwrap();
        match entries.get(key) {
            Some(entry) if entry.expired(now) => {
                entries.remove(key);
                Ok(None)
            }
            Some(entry) => match &entry.value {
                Stored::Bytes(bytes) => Ok(Some(bytes.clone())),
                Stored::Counter(n) => Ok(Some(n.to_string().into_bytes())),
                Stored::Timestamps(_) => Err(type_error(key, "get")),
            },
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: &[u8], ttl: f64) -> Result<()> {
        let now = epoch_seconds();
        let mut entries = self.shard(key).entries.lock().unwrap();
        entries.insert(
            key.to_string(),
            Entry {
                value: Stored::Bytes(value.to_vec()),
                expires_at: expiry_for(ttl, now),
            },
        );
        drop(entries);
        self.note_write();
        Ok(())
    }

    async fn increment(&self, key: &str, delta: i64, ttl: f64) -> Result<i64> {
        let now = epoch_seconds();
        let mut entries = self.shard(key).entries.lock().unwrap();

        let live = entries.get_mut(key).filter(|entry| !entry.expired(now));
        let new_value = match live {
            Some(entry) => match &mut entry.value {
                Stored::Counter(n) => {
                    *n += delta;
                    *n
                }
                _ => return Err(type_error(key, "increment")),
            },
            None => {
                entries.insert(
                    key.to_string(),
                    Entry {
                        value: Stored::Counter(delta),
                        expires_at: expiry_for(ttl, now),
                    },
                );
                delta
            }
        };
        drop(entries);
        self.note_write();
        Ok(new_value)
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&[u8]>,
        new: &[u8],
        ttl: f64,
    ) -> Result<bool> {
        let now = epoch_seconds();
        let mut entries = self.shard(key).entries.lock().unwrap();

        let current = entries
            .get(key)
            .filter(|entry| !entry.expired(now))
            .map(|entry| match &entry.value {
                Stored::Bytes(bytes) => bytes.clone(),
                Stored::Counter(n) => n.to_string().into_bytes(),
                Stored::Timestamps(_) => Vec::new(),
            });

        let matches = match (current.as_deref(), expected) {
            (None, None) => true,
            (Some(current), Some(expected)) => current == expected,
            _ => false,
        };

        if matches {
            entries.insert(
                key.to_string(),
                Entry {
                    value: Stored::Bytes(new.to_vec()),
                    expires_at: expiry_for(ttl, now),
                },
            );
            drop(entries);
            self.note_write();
        }
        Ok(matches)
    }

    async fn append_timestamp(&self, key: &str, ts: f64, ttl: f64) -> Result<()> {
        let now = epoch_seconds();
        let mut entries = self.shard(key).entries.lock().unwrap();

        let entry = entries
            .entry(key.to_string())
            .and_modify(|entry| {
                if entry.expired(now) {
                    entry.value = Stored::Timestamps(Vec::new());
                    entry.expires_at = None;
                }
            })
            .or_insert_with(|| Entry {
                value: Stored::Timestamps(Vec::new()),
                expires_at: None,
            });

        match &mut entry.value {
            Stored::Timestamps(series) => {
                // Appends are usually monotonic; fall back to an ordered
                // insert when the caller hands us an older timestamp.
                let at = series.partition_point(|existing| *existing <= ts);
                series.insert(at, ts);
            }
            _ => return Err(type_error(key, "append_timestamp")),
        }
        entry.expires_at = expiry_for(ttl, now).or(entry.expires_at);
        drop(entries);
        self.note_write();
        Ok(())
    }

    async fn trim_before(&self, key: &str, cutoff: f64) -> Result<()> {
        let now = epoch_seconds();
        let mut entries = self.shard(key).entries.lock().unwrap();
        if let Some(entry) = entries.get_mut(key) {
            if entry.expired(now) {
                entries.remove(key);
                return Ok(());
            }
            match &mut entry.value {
                Stored::Timestamps(series) => {
                    series.retain(|ts| *ts > cutoff);
                    if series.is_empty() {
                        entries.remove(key);
                    }
                }
                _ => return Err(type_error(key, "trim_before")),
            }
        }
        Ok(())
    }

    async fn count_after(&self, key: &str, cutoff: f64) -> Result<u64> {
        let now = epoch_seconds();
        let mut entries = self.shard(key).entries.lock().unwrap();
        match entries.get(key) {
            Some(entry) if entry.expired(now) => {
                entries.remove(key);
                Ok(0)
            }
            Some(entry) => match &entry.value {
                Stored::Timestamps(series) => {
                    Ok(series.iter().filter(|ts| **ts > cutoff).count() as u64)
                }
                _ => Err(type_error(key, "count_after")),
            },
            None => Ok(0),
        }
    }

    async fn oldest_timestamp(&self, key: &str) -> Result<Option<f64>> {
        let now = epoch_seconds();
        let entries = self.shard(key).entries.lock().unwrap();
        match entries.get(key) {
            Some(entry) if entry.expired(now) => Ok(None),
            Some(entry) => match &entry.value {
                Stored::Timestamps(series) => Ok(series.first().copied()),
                _ => Err(type_error(key, "oldest_timestamp")),
            },
            None => Ok(None),
        }
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let now = epoch_seconds();
        let entries = self.shard(key).entries.lock().unwrap();
        Ok(entries.get(key).is_some_and(|entry| !entry.expired(now)))
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let now = epoch_seconds();
        let mut entries = self.shard(key).entries.lock().unwrap();
        let removed = entries
            .remove(key)
            .is_some_and(|entry| !entry.expired(now));
        drop(entries);
        self.note_write();
        Ok(removed)
    }

    async fn health_check(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_set_get_delete() {
        let backend = MemoryBackend::new();

        assert_eq!(backend.get("k").await.unwrap(), None);
        backend.set("k", b"value", 0.0).await.unwrap();
        assert_eq!(backend.get("k").await.unwrap(), Some(b"value".to_vec()));
        assert!(backend.exists("k").await.unwrap());
        assert!(backend.delete("k").await.unwrap());
        assert!(!backend.delete("k").await.unwrap());
        assert!(!backend.exists("k").await.unwrap());
    }

    #[tokio::test]
    async fn test_ttl_expiry() {
        let backend = MemoryBackend::new();

        backend.set("k", b"value", 0.05).await.unwrap();
        assert!(backend.exists("k").await.unwrap());

        std::thread::sleep(Duration::from_millis(80));
        assert_eq!(backend.get("k").await.unwrap(), None);
        assert!(!backend.exists("k").await.unwrap());
    }

    #[tokio::test]
    async fn test_increment_applies_ttl_on_creation_only() {
        let backend = MemoryBackend::new();

        assert_eq!(backend.increment("c", 1, 0.05).await.unwrap(), 1);
        assert_eq!(backend.increment("c", 2, 100.0).await.unwrap(), 3);

        // The second call must not have extended the original TTL.
        std::thread::sleep(Duration::from_millis(80));
        assert_eq!(backend.increment("c", 1, 0.0).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_counter_readable_as_bytes() {
        let backend = MemoryBackend::new();
        backend.increment("c", 41, 0.0).await.unwrap();
        backend.increment("c", 1, 0.0).await.unwrap();
        assert_eq!(backend.get("c").await.unwrap(), Some(b"42".to_vec()));
    }

    #[tokio::test]
    async fn test_compare_and_swap() {
        let backend = MemoryBackend::new();

        // Create-if-absent succeeds once.
        assert!(backend
            .compare_and_swap("k", None, b"first", 0.0)
            .await
            .unwrap());
        assert!(!backend
            .compare_and_swap("k", None, b"other", 0.0)
            .await
            .unwrap());

        // Swap succeeds only against the live value.
        assert!(!backend
            .compare_and_swap("k", Some(b"stale"), b"second", 0.0)
            .await
            .unwrap());
        assert!(backend
            .compare_and_swap("k", Some(b"first"), b"second", 0.0)
            .await
            .unwrap());
        assert_eq!(backend.get("k").await.unwrap(), Some(b"second".to_vec()));
    }

    #[tokio::test]
    async fn test_timestamp_series_ops() {
        let backend = MemoryBackend::new();

        for ts in [10.0, 11.0, 11.0, 12.5] {
            backend.append_timestamp("s", ts, 0.0).await.unwrap();
        }
        assert_eq!(backend.count_after("s", 0.0).await.unwrap(), 4);
        assert_eq!(backend.count_after("s", 11.0).await.unwrap(), 1);
        assert_eq!(backend.oldest_timestamp("s").await.unwrap(), Some(10.0));

        backend.trim_before("s", 11.0).await.unwrap();
        assert_eq!(backend.count_after("s", 0.0).await.unwrap(), 1);
        assert_eq!(backend.oldest_timestamp("s").await.unwrap(), Some(12.5));

        backend.trim_before("s", 100.0).await.unwrap();
        assert!(!backend.exists("s").await.unwrap());
        assert_eq!(backend.oldest_timestamp("s").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_out_of_order_append_keeps_series_sorted() {
        let backend = MemoryBackend::new();
        backend.append_timestamp("s", 5.0, 0.0).await.unwrap();
        backend.append_timestamp("s", 3.0, 0.0).await.unwrap();
        assert_eq!(backend.oldest_timestamp("s").await.unwrap(), Some(3.0));
    }

    #[tokio::test]
    async fn test_type_mismatch_is_an_error() {
        let backend = MemoryBackend::new();
        backend.set("k", b"bytes", 0.0).await.unwrap();
        assert!(backend.increment("k", 1, 0.0).await.is_err());
        assert!(backend.count_after("k", 0.0).await.is_err());
    }

    #[tokio::test]
    async fn test_clear_and_stats() {
        let backend = MemoryBackend::new();
        backend.set("a", b"1", 0.0).await.unwrap();
        backend.set("b", b"2", 0.0).await.unwrap();
        assert_eq!(backend.stats().total_keys, 2);

        backend.clear();
        assert_eq!(backend.stats().total_keys, 0);
    }

    #[tokio::test]
    async fn test_concurrent_increments_are_atomic() {
        use std::sync::Arc;

        let backend = Arc::new(MemoryBackend::new());
        let handles: Vec<_> = (0..100)
            .map(|_| {
                let backend = Arc::clone(&backend);
                tokio::spawn(async move { backend.increment("c", 1, 0.0).await.unwrap() })
            })
            .collect();
        futures::future::join_all(handles).await;

        assert_eq!(backend.increment("c", 0, 0.0).await.unwrap(), 100);
    }
}
