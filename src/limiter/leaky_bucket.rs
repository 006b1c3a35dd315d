use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::{ceil_retry, state_ttl, Decision};
use crate::backend::StorageBackend;
use crate::errors::{RateThrottleError, Result};
use crate::rule::Rule;

/// Persisted bucket state, MessagePack-encoded.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct LeakyBucketState {
    level: f64,
    last_drain: f64,
}

/// Leaky bucket: each request raises the level by one; the level drains
/// at `limit / window` per second. A request that would raise the level
/// above `limit` is rejected.
pub async fn check(
    rule: &Rule,
    key: &str,
    now: f64,
    backend: &dyn StorageBackend,
) -> Result<Decision> {
    let capacity = rule.limit as f64;
    let drain_rate = rule.limit as f64 / rule.window;

    let raw = backend.get(key).await?;
    let mut state = decode_state(raw.as_deref(), key, now);

    let elapsed = (now - state.last_drain).max(0.0);
    state.level = (state.level - elapsed * drain_rate).max(0.0);
    state.last_drain = state.last_drain.max(now);

    let decision = if state.level + 1.0 <= capacity {
        state.level += 1.0;
        Decision {
            allowed: true,
            remaining: (capacity - state.level).floor() as u64,
            reset_time: now + state.level / drain_rate,
            retry_after: 0,
        }
    } else {
        let retry_after = ceil_retry((state.level + 1.0 - capacity) / drain_rate);
        Decision {
            allowed: false,
            remaining: 0,
            reset_time: now + retry_after as f64,
            retry_after,
        }
    };

    backend
        .set(key, &encode_state(&state)?, state_ttl(rule))
        .await?;

    debug!(
        "Leaky bucket '{}': allowed={}, level {:.2}/{}",
        key, decision.allowed, state.level, capacity
    );
    Ok(decision)
}

fn decode_state(raw: Option<&[u8]>, key: &str, now: f64) -> LeakyBucketState {
    let empty = LeakyBucketState {
        level: 0.0,
        last_drain: now,
    };
    match raw {
        Some(bytes) => rmp_serde::from_slice(bytes).unwrap_or_else(|e| {
            warn!("Invalid leaky bucket state at '{}', reinitializing: {}", key, e);
            empty
        }),
        None => empty,
    }
}

fn encode_state(state: &LeakyBucketState) -> Result<Vec<u8>> {
    rmp_serde::to_vec(state)
        .map_err(|e| RateThrottleError::SerializationError(format!("leaky bucket state: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::memory::MemoryBackend;

    fn rule() -> Rule {
        Rule {
            strategy: crate::rule::StrategyKind::LeakyBucket,
            block_duration: 0.0,
            ..Rule::new("api", 10, 10.0)
        }
    }

    #[tokio::test]
    async fn test_fills_then_rejects() {
        let backend = MemoryBackend::new();
        let rule = rule();

        for i in 0..10 {
            let decision = check(&rule, "k", 0.0, &backend).await.unwrap();
            assert!(decision.allowed);
            assert_eq!(decision.remaining, 9 - i);
        }

        // Bucket full; one slot drains per second.
        let decision = check(&rule, "k", 0.0, &backend).await.unwrap();
        assert!(!decision.allowed);
        assert_eq!(decision.retry_after, 1);

        let decision = check(&rule, "k", 1.0, &backend).await.unwrap();
        assert!(decision.allowed);
    }

    #[tokio::test]
    async fn test_drain_rate_bounds_throughput() {
        // Once past the initial fill, admissions cannot outpace
        // limit/window per second.
        let backend = MemoryBackend::new();
        let rule = rule();

        // Saturate at t=0.
        for _ in 0..10 {
            check(&rule, "k", 0.0, &backend).await.unwrap();
        }

        // Hammer for 20 s at 10 calls per second.
        let mut allowed = 0;
        let mut t = 0.1;
        while t <= 20.0 {
            if check(&rule, "k", t, &backend).await.unwrap().allowed {
                allowed += 1;
            }
            t += 0.1;
        }
        // 20 s of drainage at 1/s admits at most ~20 requests.
        assert!(allowed <= 21, "{} admissions outpace the drain rate", allowed);
    }

    #[tokio::test]
    async fn test_idle_bucket_fully_drains() {
        let backend = MemoryBackend::new();
        let rule = rule();

        for _ in 0..10 {
            check(&rule, "k", 0.0, &backend).await.unwrap();
        }
        let decision = check(&rule, "k", 10.0, &backend).await.unwrap();
        assert!(decision.allowed);
        assert_eq!(decision.remaining, 9);
    }

    #[tokio::test]
    async fn test_denied_request_does_not_raise_level() {
        let backend = MemoryBackend::new();
        let rule = rule();

        for _ in 0..10 {
            check(&rule, "k", 0.0, &backend).await.unwrap();
        }
        // Several rejected attempts must not push recovery further out.
        for _ in 0..5 {
            let decision = check(&rule, "k", 0.0, &backend).await.unwrap();
            assert!(!decision.allowed);
            assert_eq!(decision.retry_after, 1);
        }
        let decision = check(&rule, "k", 1.0, &backend).await.unwrap();
        assert!(decision.allowed);
    }
}
