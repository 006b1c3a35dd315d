use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::{ceil_retry, state_ttl, Decision};
use crate::backend::StorageBackend;
use crate::errors::{RateThrottleError, Result};
use crate::rule::Rule;

/// Attempts before giving up on compare-and-swap and letting the last
/// writer win.
const CAS_ATTEMPTS: u32 = 4;

/// Persisted bucket state, MessagePack-encoded.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct TokenBucketState {
    tokens: f64,
    last_refill: f64,
}

/// Token bucket: tokens refill continuously at `limit / window` per
/// second up to the burst capacity; each admitted request consumes one.
pub async fn check(
    rule: &Rule,
    key: &str,
    now: f64,
    backend: &dyn StorageBackend,
) -> Result<Decision> {
    let burst = rule.burst_capacity() as f64;
    let refill_rate = rule.limit as f64 / rule.window;
    let ttl = state_ttl(rule);

    let mut attempt = 0;
    loop {
        attempt += 1;
        let raw = backend.get(key).await?;
        let mut state = decode_state(raw.as_deref(), key, burst, now);

        // A clock running backwards is clamped to the stored timestamp.
        let elapsed = (now - state.last_refill).max(0.0);
        state.tokens = (state.tokens + elapsed * refill_rate).min(burst);
        state.last_refill = state.last_refill.max(now);

        let decision = if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            Decision {
                allowed: true,
                remaining: state.tokens.floor() as u64,
                reset_time: now + (burst - state.tokens) / refill_rate,
                retry_after: 0,
            }
        } else {
            Decision {
                allowed: false,
                remaining: 0,
                reset_time: now + (burst - state.tokens) / refill_rate,
                retry_after: ceil_retry((1.0 - state.tokens) / refill_rate),
            }
        };

        let encoded = encode_state(&state)?;
        let stored = if attempt > CAS_ATTEMPTS {
            backend.set(key, &encoded, ttl).await?;
            true
        } else {
            backend
                .compare_and_swap(key, raw.as_deref(), &encoded, ttl)
                .await?
        };

        if stored {
            debug!(
                "Token bucket '{}': allowed={}, {:.2} tokens left",
                key, decision.allowed, state.tokens
            );
            return Ok(decision);
        }
        debug!("Token bucket CAS conflict on '{}' (attempt {})", key, attempt);
    }
}

fn decode_state(raw: Option<&[u8]>, key: &str, burst: f64, now: f64) -> TokenBucketState {
    match raw {
        Some(bytes) => rmp_serde::from_slice(bytes).unwrap_or_else(|e| {
            warn!("Invalid token bucket state at '{}', reinitializing: {}", key, e);
            full_bucket(burst, now)
        }),
        None => full_bucket(burst, now),
    }
}

fn full_bucket(burst: f64, now: f64) -> TokenBucketState {
    TokenBucketState {
        tokens: burst,
        last_refill: now,
    }
}

fn encode_state(state: &TokenBucketState) -> Result<Vec<u8>> {
    rmp_serde::to_vec(state)
        .map_err(|e| RateThrottleError::SerializationError(format!("token bucket state: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::memory::MemoryBackend;

    fn rule() -> Rule {
        Rule {
            strategy: crate::rule::StrategyKind::TokenBucket,
            burst: Some(10),
            block_duration: 0.0,
            ..Rule::new("api", 5, 10.0)
        }
    }

    #[tokio::test]
    async fn test_burst_then_starve() {
        let backend = MemoryBackend::new();
        let rule = rule();

        // Full bucket admits the whole burst at once.
        for i in 0..10 {
            let decision = check(&rule, "k", 0.0, &backend).await.unwrap();
            assert!(decision.allowed, "call {} should be allowed", i + 1);
            assert_eq!(decision.remaining, 9 - i);
        }

        // Bucket empty: refill rate is 0.5 tokens/s, so the next token
        // is 2 s away.
        let decision = check(&rule, "k", 0.0, &backend).await.unwrap();
        assert!(!decision.allowed);
        assert_eq!(decision.retry_after, 2);

        // One token has accumulated by t=2.
        let decision = check(&rule, "k", 2.0, &backend).await.unwrap();
        assert!(decision.allowed);

        // Twenty seconds of idle refill restores the full burst.
        for _ in 0..10 {
            let decision = check(&rule, "k", 22.0, &backend).await.unwrap();
            assert!(decision.allowed);
        }
        let decision = check(&rule, "k", 22.0, &backend).await.unwrap();
        assert!(!decision.allowed);
    }

    #[tokio::test]
    async fn test_admissions_bounded_by_burst_plus_refill() {
        // In any interval of length T, allowed <= burst + T * limit/window.
        let backend = MemoryBackend::new();
        let rule = rule();

        let mut allowed = 0;
        let mut t = 0.0;
        while t < 40.0 {
            if check(&rule, "k", t, &backend).await.unwrap().allowed {
                allowed += 1;
            }
            t += 0.1;
        }
        assert!(
            allowed <= 10 + 40 / 2,
            "{} admissions exceed burst + refill",
            allowed
        );
    }

    #[tokio::test]
    async fn test_clock_regression_is_clamped() {
        let backend = MemoryBackend::new();
        let rule = rule();

        check(&rule, "k", 100.0, &backend).await.unwrap();
        // An earlier timestamp must not mint tokens or panic.
        let decision = check(&rule, "k", 50.0, &backend).await.unwrap();
        assert!(decision.allowed);
        assert!(decision.remaining <= 9);
    }

    #[tokio::test]
    async fn test_corrupt_state_reinitializes() {
        let backend = MemoryBackend::new();
        let rule = rule();

        backend.set("k", b"not messagepack", 0.0).await.unwrap();
        let decision = check(&rule, "k", 0.0, &backend).await.unwrap();
        assert!(decision.allowed);
        assert_eq!(decision.remaining, 9);
    }
}
