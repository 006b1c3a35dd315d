use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use deadpool_redis::{Connection, Pool};
use redis::Script;
use tokio::time::timeout;
use tracing::{debug, error};

use crate::backend::pool::create_redis_pool;
use crate::backend::StorageBackend;
use crate::config::RedisConfig;
use crate::errors::{RateThrottleError, Result};

/// INCRBY that applies the TTL only when the increment created the key.
const INCREMENT_SCRIPT: &str = r#"
local value = redis.call('INCRBY', KEYS[1], ARGV[1])
local ttl = tonumber(ARGV[2])
if ttl > 0 and value == tonumber(ARGV[1]) then
    redis.call('PEXPIRE', KEYS[1], ttl)
end
return value
"#;

/// SET gated on the current value matching the caller's expectation.
/// ARGV[1] is '1' when a concrete expected value is supplied in ARGV[2];
/// otherwise the swap requires the key to be absent.
const CAS_SCRIPT: &str = r#"
local current = redis.call('GET', KEYS[1])
local matches
if ARGV[1] == '1' then
    matches = current == ARGV[2]
else
    matches = current == false
end
if matches then
    local ttl = tonumber(ARGV[4])
    if ttl > 0 then
        redis.call('SET', KEYS[1], ARGV[3], 'PX', ttl)
    else
        redis.call('SET', KEYS[1], ARGV[3])
    end
    return 1
end
return 0
"#;

/// Redis storage backend for distributed rate limiting.
///
/// The ordered-timestamp set maps onto a sorted set with
/// score = timestamp; members carry a process-unique suffix so equal
/// timestamps coexist. Multi-step mutations run as Lua scripts. Every
/// command is bounded by the configured timeout and surfaces as
/// `BackendUnavailable` on failure.
pub struct RedisBackend {
    pool: Pool,
    key_prefix: String,
    command_timeout: Duration,
    increment_script: Script,
    cas_script: Script,
    member_seq: AtomicU64,
}

impl RedisBackend {
    /// Wrap an existing connection pool.
    pub fn new(pool: Pool, config: &RedisConfig) -> Self {
        Self {
            pool,
            key_prefix: config.key_prefix.clone(),
            command_timeout: config.command_timeout,
            increment_script: Script::new(INCREMENT_SCRIPT),
            cas_script: Script::new(CAS_SCRIPT),
            member_seq: AtomicU64::new(0),
        }
    }

    /// Create a pool from `config` and wrap it.
    pub async fn connect(config: &RedisConfig) -> Result<Self> {
        let pool = create_redis_pool(config).await?;
        Ok(Self::new(pool, config))
    }

    fn prefixed(&self, key: &str) -> String {
        if self.key_prefix.is_empty() {
            key.to_string()
        } else {
            format!("{}{}", self.key_prefix, key)
        }
    }

    async fn conn(&self) -> Result<Connection> {
        self.pool.get().await.map_err(|e| {
            error!("Failed to get Redis connection: {}", e);
            RateThrottleError::BackendUnavailable(format!("connection pool: {}", e))
        })
    }

    async fn run<T>(
        &self,
        label: &str,
        fut: impl Future<Output = redis::RedisResult<T>>,
    ) -> Result<T> {
        match timeout(self.command_timeout, fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => {
                error!("Redis {} failed: {}", label, e);
                Err(RateThrottleError::BackendUnavailable(format!(
                    "{}: {}",
                    label, e
                )))
            }
            Err(_) => {
                error!(
                    "Redis {} timed out after {:?}",
                    label, self.command_timeout
                );
                Err(RateThrottleError::BackendUnavailable(format!(
                    "{}: timed out",
                    label
                )))
            }
        }
    }
}

fn ttl_millis(ttl: f64) -> i64 {
    if ttl > 0.0 {
        (ttl * 1000.0).round() as i64
    } else {
        0
    }
}

#[async_trait]
impl StorageBackend for RedisBackend {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let key = self.prefixed(key);
        let mut conn = self.conn().await?;
        let mut cmd = redis::cmd("GET");
        cmd.arg(&key);
        self.run("GET", cmd.query_async(&mut *conn)).await
    }

    async fn set(&self, key: &str, value: &[u8], ttl: f64) -> Result<()> {
        let key = self.prefixed(key);
        let mut conn = self.conn().await?;
        let mut cmd = redis::cmd("SET");
        cmd.arg(&key).arg(value);
        let ttl = ttl_millis(ttl);
        if ttl > 0 {
            cmd.arg("PX").arg(ttl);
        }
        self.run("SET", cmd.query_async(&mut *conn)).await
    }

    async fn increment(&self, key: &str, delta: i64, ttl: f64) -> Result<i64> {
        let key = self.prefixed(key);
        let mut conn = self.conn().await?;
        let value: i64 = self
            .run(
                "INCRBY script",
                self.increment_script
                    .key(&key)
                    .arg(delta)
                    .arg(ttl_millis(ttl))
                    .invoke_async(&mut *conn),
            )
            .await?;
        debug!("Redis INCR key '{}' by {} to {}", key, delta, value);
        Ok(value)
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&[u8]>,
        new: &[u8],
        ttl: f64,
    ) -> Result<bool> {
        let key = self.prefixed(key);
        let mut conn = self.conn().await?;
        let swapped: i64 = self
            .run(
                "CAS script",
                self.cas_script
                    .key(&key)
                    .arg(if expected.is_some() { "1" } else { "0" })
                    .arg(expected.unwrap_or_default())
                    .arg(new)
                    .arg(ttl_millis(ttl))
                    .invoke_async(&mut *conn),
            )
            .await?;
        Ok(swapped == 1)
    }

    async fn append_timestamp(&self, key: &str, ts: f64, ttl: f64) -> Result<()> {
        let key = self.prefixed(key);
        // Unique member suffix so equal timestamps remain distinct set
        // members.
        let member = format!(
            "{:.6}:{}",
            ts,
            self.member_seq.fetch_add(1, Ordering::Relaxed)
        );
        let mut conn = self.conn().await?;
        let mut pipe = redis::pipe();
        pipe.atomic();
        pipe.cmd("ZADD").arg(&key).arg(ts).arg(&member).ignore();
        let ttl = ttl_millis(ttl);
        if ttl > 0 {
            pipe.cmd("PEXPIRE").arg(&key).arg(ttl).ignore();
        }
        let _: () = self.run("ZADD", pipe.query_async(&mut *conn)).await?;
        Ok(())
    }

    async fn trim_before(&self, key: &str, cutoff: f64) -> Result<()> {
        let key = self.prefixed(key);
        let mut conn = self.conn().await?;
        let mut cmd = redis::cmd("ZREMRANGEBYSCORE");
        cmd.arg(&key).arg("-inf").arg(cutoff);
        let _removed: i64 = self
            .run("ZREMRANGEBYSCORE", cmd.query_async(&mut *conn))
            .await?;
        Ok(())
    }

    async fn count_after(&self, key: &str, cutoff: f64) -> Result<u64> {
        let key = self.prefixed(key);
        let mut conn = self.conn().await?;
        let mut cmd = redis::cmd("ZCOUNT");
        cmd.arg(&key).arg(format!("({}", cutoff)).arg("+inf");
        self.run("ZCOUNT", cmd.query_async(&mut *conn)).await
    }

    async fn oldest_timestamp(&self, key: &str) -> Result<Option<f64>> {
        let key = self.prefixed(key);
        let mut conn = self.conn().await?;
        let mut cmd = redis::cmd("ZRANGE");
        cmd.arg(&key).arg(0).arg(0).arg("WITHSCORES");
        let entries: Vec<(String, f64)> =
            self.run("ZRANGE", cmd.query_async(&mut *conn)).await?;
        Ok(entries.first().map(|(_, score)| *score))
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let key = self.prefixed(key);
        let mut conn = self.conn().await?;
        let mut cmd = redis::cmd("EXISTS");
        cmd.arg(&key);
        self.run("EXISTS", cmd.query_async(&mut *conn)).await
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let key = self.prefixed(key);
        let mut conn = self.conn().await?;
        let mut cmd = redis::cmd("DEL");
        cmd.arg(&key);
        let removed: i64 = self.run("DEL", cmd.query_async(&mut *conn)).await?;
        Ok(removed > 0)
    }

    async fn health_check(&self) -> Result<()> {
        let mut conn = self.conn().await?;
        let cmd = redis::cmd("PING");
        let response: String = self.run("PING", cmd.query_async(&mut *conn)).await?;
        if response != "PONG" {
            return Err(RateThrottleError::BackendUnavailable(format!(
                "Unexpected PING response: {}",
                response
            )));
        }
        Ok(())
    }
}
