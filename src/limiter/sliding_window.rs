use tracing::debug;

use super::{ceil_retry, Decision};
use crate::backend::StorageBackend;
use crate::errors::Result;
use crate::rule::Rule;

/// Safety margin added to the log's TTL beyond the window itself.
const TTL_SAFETY_SECS: f64 = 2.0;

/// Sliding window log: a timestamp per admitted request over the last
/// `window` seconds. Exact, at the cost of storing every admission.
pub async fn check(
    rule: &Rule,
    key: &str,
    now: f64,
    backend: &dyn StorageBackend,
) -> Result<Decision> {
    let window = rule.window;
    let cutoff = now - window;

    backend.trim_before(key, cutoff).await?;
    let count = backend.count_after(key, cutoff).await?;

    let decision = if count < rule.limit {
        backend
            .append_timestamp(key, now, window + TTL_SAFETY_SECS)
            .await?;
        let oldest = backend.oldest_timestamp(key).await?.unwrap_or(now);
        Decision {
            allowed: true,
            remaining: rule.limit - count - 1,
            reset_time: oldest + window,
            retry_after: 0,
        }
    } else {
        let oldest = backend.oldest_timestamp(key).await?.unwrap_or(now);
        Decision {
            allowed: false,
            remaining: 0,
            reset_time: oldest + window,
            retry_after: ceil_retry(oldest + window - now),
        }
    };

    debug!(
        "Sliding window '{}': {} of {} in window, allowed={}",
        key, count, rule.limit, decision.allowed
    );
    Ok(decision)
}
