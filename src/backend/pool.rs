use deadpool::managed::PoolConfig as DeadpoolPoolConfig;
use deadpool_redis::{Config as DeadpoolRedisConfig, Pool, Runtime};
use tracing::{debug, info};

use crate::config::{validate_redis_config, RedisConfig};
use crate::errors::{RateThrottleError, Result};

/// Build a verified connection pool for the Redis backend.
///
/// The configuration is validated up front and a PING round-trip must
/// succeed before the pool is handed out, so a misconfigured or
/// unreachable server fails at startup rather than on the first check.
pub async fn create_redis_pool(config: &RedisConfig) -> Result<Pool> {
    validate_redis_config(config)?;

    let mut pool_config = DeadpoolRedisConfig::from_url(config.url.clone());
    pool_config.pool = Some(DeadpoolPoolConfig::new(config.max_connections));

    let pool = pool_config.create_pool(Some(Runtime::Tokio1)).map_err(|e| {
        RateThrottleError::ConfigurationError(format!("cannot build Redis pool: {}", e))
    })?;
    debug!("Redis pool sized at {} connections", config.max_connections);

    verify_connection(&pool).await?;
    info!("Redis pool ready");

    Ok(pool)
}

async fn verify_connection(pool: &Pool) -> Result<()> {
    let mut conn = pool.get().await.map_err(|e| {
        RateThrottleError::BackendUnavailable(format!("no connection for PING probe: {}", e))
    })?;

    let reply: String = redis::cmd("PING")
        .query_async(&mut *conn)
        .await
        .map_err(|e| RateThrottleError::BackendUnavailable(format!("PING probe: {}", e)))?;

    if reply != "PONG" {
        return Err(RateThrottleError::BackendUnavailable(format!(
            "unexpected PING reply: {}",
            reply
        )));
    }
    Ok(())
}

/// Point-in-time pool occupancy.
#[derive(Debug, Clone, Copy)]
pub struct PoolStatus {
    /// Connections currently held by the pool.
    pub connections: usize,
    /// Connections idle and ready to lend out.
    pub idle: usize,
    /// Upper bound the pool may grow to.
    pub capacity: usize,
}

/// Snapshot how busy the pool is right now.
pub fn pool_status(pool: &Pool) -> PoolStatus {
    let status = pool.status();
    PoolStatus {
        connections: status.size,
        idle: status.available,
        capacity: status.max_size,
    }
}
