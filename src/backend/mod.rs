pub mod memory;
pub mod pool;
pub mod redis;

use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;

use crate::errors::Result;

/// Current wall-clock time as fractional epoch seconds.
pub fn epoch_seconds() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// Atomic key/value and ordered-timestamp store consumed by the
/// strategies and the engine.
///
/// All mutations of a single key are linearizable. A `ttl` of 0 means
/// no expiry. Implementations surface failures as
/// [`crate::errors::RateThrottleError::BackendUnavailable`].
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Fetch the raw bytes stored under `key`, if any.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Store raw bytes under `key`, replacing any previous value.
    async fn set(&self, key: &str, value: &[u8], ttl: f64) -> Result<()>;

    /// Atomically add `delta` to the integer counter at `key` and return
    /// the new value. An absent key is initialized to 0 before the
    /// increment and `ttl` is applied on that creation only.
    async fn increment(&self, key: &str, delta: i64, ttl: f64) -> Result<i64>;

    /// Replace the value at `key` only if the current value matches
    /// `expected` (`None` means "only if the key is absent"). Returns
    /// whether the swap happened.
    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&[u8]>,
        new: &[u8],
        ttl: f64,
    ) -> Result<bool>;

    /// Append `ts` to the ordered-timestamp set at `key`. Equal
    /// timestamps may coexist. `ttl` refreshes the key's expiry.
    async fn append_timestamp(&self, key: &str, ts: f64, ttl: f64) -> Result<()>;

    /// Drop every timestamp `<= cutoff` from the set at `key`.
    async fn trim_before(&self, key: &str, cutoff: f64) -> Result<()>;

    /// Count the timestamps `> cutoff` in the set at `key`.
    async fn count_after(&self, key: &str, cutoff: f64) -> Result<u64>;

    /// Smallest timestamp currently stored at `key`, if any.
    async fn oldest_timestamp(&self, key: &str) -> Result<Option<f64>>;

    /// Whether a live (unexpired) value exists at `key`.
    async fn exists(&self, key: &str) -> Result<bool>;

    /// Remove `key`. Returns whether a live value was removed.
    async fn delete(&self, key: &str) -> Result<bool>;

    /// Check that the backing store is reachable.
    async fn health_check(&self) -> Result<()>;
}
