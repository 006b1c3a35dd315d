pub mod fixed_window;
pub mod leaky_bucket;
pub mod sliding_window;
pub mod token_bucket;

use crate::backend::StorageBackend;
use crate::errors::Result;
use crate::rule::{Rule, StrategyKind};

/// Raw outcome of a strategy evaluation, before the engine layers
/// access control and block state on top.
#[derive(Debug, Clone, PartialEq)]
pub struct Decision {
    /// Whether the request is admitted.
    pub allowed: bool,

    /// Requests left in the current logical window.
    pub remaining: u64,

    /// Absolute epoch time at which the bucket is fully restored.
    pub reset_time: f64,

    /// Whole seconds until a retry can succeed; 0 when allowed.
    pub retry_after: u64,
}

/// Dispatch to the rule's admission algorithm.
pub async fn evaluate(
    rule: &Rule,
    key: &str,
    now: f64,
    backend: &dyn StorageBackend,
) -> Result<Decision> {
    match rule.strategy {
        StrategyKind::TokenBucket => token_bucket::check(rule, key, now, backend).await,
        StrategyKind::LeakyBucket => leaky_bucket::check(rule, key, now, backend).await,
        StrategyKind::FixedWindow => fixed_window::check(rule, key, now, backend).await,
        StrategyKind::SlidingWindow => sliding_window::check(rule, key, now, backend).await,
    }
}

/// Bucket-state TTL: the window plus any block tail plus a safety
/// margin.
pub(crate) fn state_ttl(rule: &Rule) -> f64 {
    rule.window + rule.block_duration + 2.0
}

/// Round a wait up to whole seconds, never reporting less than one.
pub(crate) fn ceil_retry(seconds: f64) -> u64 {
    (seconds.ceil() as i64).max(1) as u64
}
