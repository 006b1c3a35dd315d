use tracing::debug;

use super::{ceil_retry, Decision};
use crate::backend::StorageBackend;
use crate::errors::Result;
use crate::rule::Rule;

/// Fixed window: an atomic counter per aligned window. The window id is
/// part of the storage key, so stale windows expire with their TTL.
pub async fn check(
    rule: &Rule,
    key: &str,
    now: f64,
    backend: &dyn StorageBackend,
) -> Result<Decision> {
    let window = rule.window;
    let window_id = (now / window).floor() as i64;
    let window_key = format!("{}:{}", key, window_id);

    let count = backend.increment(&window_key, 1, window).await?;
    let count = count.max(0) as u64;
    let reset_time = (window_id + 1) as f64 * window;

    let decision = if count <= rule.limit {
        Decision {
            allowed: true,
            remaining: rule.limit - count,
            reset_time,
            retry_after: 0,
        }
    } else {
        Decision {
            allowed: false,
            remaining: 0,
            reset_time,
            retry_after: ceil_retry(reset_time - now),
        }
    };

    debug!(
        "Fixed window '{}': count {}/{}, resets at {:.1}",
        window_key, count, rule.limit, reset_time
    );
    Ok(decision)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::memory::MemoryBackend;

    fn rule(limit: u64, window: f64) -> Rule {
        Rule {
            strategy: crate::rule::StrategyKind::FixedWindow,
            block_duration: 0.0,
            ..Rule::new("api", limit, window)
        }
    }

    #[tokio::test]
    async fn test_window_boundary_resets_the_count() {
        let backend = MemoryBackend::new();
        let rule = rule(100, 60.0);

        // The tail of one window and the head of the next each admit a
        // full quota.
        for _ in 0..100 {
            assert!(check(&rule, "k", 59.9, &backend).await.unwrap().allowed);
        }
        assert!(!check(&rule, "k", 59.9, &backend).await.unwrap().allowed);

        for _ in 0..100 {
            assert!(check(&rule, "k", 60.0, &backend).await.unwrap().allowed);
        }
        assert!(!check(&rule, "k", 60.0, &backend).await.unwrap().allowed);
    }

    #[tokio::test]
    async fn test_remaining_and_reset() {
        let backend = MemoryBackend::new();
        let rule = rule(3, 10.0);

        let decision = check(&rule, "k", 12.0, &backend).await.unwrap();
        assert!(decision.allowed);
        assert_eq!(decision.remaining, 2);
        assert_eq!(decision.reset_time, 20.0);

        check(&rule, "k", 13.0, &backend).await.unwrap();
        check(&rule, "k", 14.0, &backend).await.unwrap();

        let decision = check(&rule, "k", 14.5, &backend).await.unwrap();
        assert!(!decision.allowed);
        assert_eq!(decision.remaining, 0);
        // 5.5 s to the boundary, reported as whole seconds.
        assert_eq!(decision.retry_after, 6);
    }

    #[tokio::test]
    async fn test_allowed_per_window_never_exceeds_limit() {
        let backend = MemoryBackend::new();
        let rule = rule(5, 10.0);

        let mut allowed = 0;
        let mut t = 10.0;
        while t < 20.0 {
            if check(&rule, "k", t, &backend).await.unwrap().allowed {
                allowed += 1;
            }
            t += 0.5;
        }
        assert_eq!(allowed, 5);
    }

    #[tokio::test]
    async fn test_distinct_keys_do_not_interfere() {
        let backend = MemoryBackend::new();
        let rule = rule(1, 10.0);

        assert!(check(&rule, "a", 0.0, &backend).await.unwrap().allowed);
        assert!(!check(&rule, "a", 0.0, &backend).await.unwrap().allowed);
        assert!(check(&rule, "b", 0.0, &backend).await.unwrap().allowed);
    }
}
