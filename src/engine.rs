use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::access::{AccessControl, DenyEntry};
use crate::analyzer::{TrafficAnalyzer, TrafficPattern};
use crate::backend::{epoch_seconds, StorageBackend};
use crate::config::{validate_analyzer_config, AnalyzerConfig, EngineConfig};
use crate::errors::{RateThrottleError, Result};
use crate::limiter;
use crate::metrics::{
    Metrics, MetricsSnapshot, ObserverRegistry, Violation, ViolationKind, ViolationObserver,
};
use crate::rule::{block_key, bucket_key, violation_key, RequestMetadata, Rule, RuleRegistry};

/// Retry horizon reported for deny entries with no expiry.
const PERMANENT_DENY_RETRY_SECS: u64 = 86_400;

/// Outcome of a single admission check.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Verdict {
    pub allowed: bool,
    /// Requests left in the current logical window.
    pub remaining: u64,
    pub limit: u64,
    /// Absolute epoch time at which the limit fully resets.
    pub reset_time: f64,
    /// Whole seconds until a retry can succeed; 0 when allowed.
    pub retry_after: u64,
    pub rule_name: String,
    /// Whether the denial came from (or opened) a block rather than a
    /// transient strategy rejection.
    pub blocked: bool,
}

impl Verdict {
    /// JSON rendering for adapters that relay the verdict verbatim.
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

/// The rate-limiting engine.
///
/// Orchestrates the admission pipeline: access-control gate, block-state
/// gate, strategy evaluation, then violation and metric bookkeeping.
/// Thread-safe; share it behind an `Arc`.
pub struct RateThrottle {
    backend: Arc<dyn StorageBackend>,
    rules: RuleRegistry,
    access: Arc<AccessControl>,
    metrics: Arc<Metrics>,
    observers: Arc<ObserverRegistry>,
    analyzer: Arc<TrafficAnalyzer>,
    config: EngineConfig,
}

impl RateThrottle {
    pub fn new(backend: Arc<dyn StorageBackend>) -> Self {
        Self::with_config(backend, EngineConfig::default(), AnalyzerConfig::default())
    }

    pub fn with_config(
        backend: Arc<dyn StorageBackend>,
        config: EngineConfig,
        analyzer_config: AnalyzerConfig,
    ) -> Self {
        let analyzer_config = match validate_analyzer_config(&analyzer_config) {
            Ok(()) => analyzer_config,
            Err(e) => {
                warn!("Analyzer configuration rejected, using defaults: {}", e);
                AnalyzerConfig::default()
            }
        };

        let access = Arc::new(AccessControl::new());
        let metrics = Arc::new(Metrics::with_capacity(config.violation_capacity));
        let observers = Arc::new(ObserverRegistry::new());
        let analyzer = Arc::new(TrafficAnalyzer::new(
            analyzer_config,
            Arc::clone(&access),
            Arc::clone(&observers),
            Arc::clone(&metrics),
        ));

        info!(
            "Rate throttle engine initialized (fail_open: {})",
            config.fail_open
        );

        Self {
            backend,
            rules: RuleRegistry::new(),
            access,
            metrics,
            observers,
            analyzer,
            config,
        }
    }

    /// Check whether `identifier` may proceed under the named rule.
    pub async fn check(
        &self,
        identifier: &str,
        rule_name: &str,
        metadata: Option<&RequestMetadata>,
    ) -> Result<Verdict> {
        self.check_at(identifier, rule_name, metadata, epoch_seconds())
            .await
    }

    /// Deterministic-time variant of [`check`](Self::check) for callers
    /// that drive their own clock.
    pub async fn check_at(
        &self,
        identifier: &str,
        rule_name: &str,
        metadata: Option<&RequestMetadata>,
        now: f64,
    ) -> Result<Verdict> {
        let identifier = if identifier.is_empty() {
            warn!("Empty identifier provided to check");
            "unknown"
        } else {
            identifier
        };

        let rule = self
            .rules
            .get(rule_name)
            .ok_or_else(|| RateThrottleError::RuleNotFound(rule_name.to_string()))?;

        // A request the rule's condition does not match bypasses every
        // gate without accounting.
        if let Some(condition) = &rule.condition {
            let default_metadata = RequestMetadata::default();
            if !condition(metadata.unwrap_or(&default_metadata)) {
                debug!(
                    "Bypassed (condition not matched): {} under rule '{}'",
                    identifier, rule.name
                );
                return Ok(bypass_verdict(&rule, now));
            }
        }

        // Allow-set membership wins over everything, including the deny
        // set.
        if self.access.is_allowed(identifier) {
            debug!("Allowed (allow list): {}", identifier);
            return Ok(bypass_verdict(&rule, now));
        }

        if let Some(entry) = self.access.deny_state(identifier, now) {
            let retry_after = match entry.expires_at {
                Some(expiry) => ((expiry - now).ceil() as i64).max(1) as u64,
                None => PERMANENT_DENY_RETRY_SECS,
            };
            self.metrics.record_blocked();
            debug!("Blocked (deny list): {}", identifier);
            self.record_denylist_violation(identifier, &rule, metadata, now, retry_after, &entry)
                .await;
            return Ok(Verdict {
                allowed: false,
                remaining: 0,
                limit: rule.limit,
                reset_time: now + retry_after as f64,
                retry_after,
                rule_name: rule.name.clone(),
                blocked: true,
            });
        }

        // Honor an active block record before consulting the strategy.
        match self.read_block(&rule, identifier, now).await {
            Ok(Some(blocked_until)) => {
                let retry_after = ((blocked_until - now).ceil() as i64).max(1) as u64;
                self.metrics.record_blocked();
                debug!(
                    "Blocked (active block): {} under rule '{}', retry after {}s",
                    identifier, rule.name, retry_after
                );
                return Ok(Verdict {
                    allowed: false,
                    remaining: 0,
                    limit: rule.limit,
                    reset_time: blocked_until,
                    retry_after,
                    rule_name: rule.name.clone(),
                    blocked: true,
                });
            }
            Ok(None) => {}
            Err(e) => return Ok(self.apply_fail_policy(e, &rule, now)),
        }

        let key = bucket_key(&rule, identifier, metadata)?;
        let decision = match limiter::evaluate(&rule, &key, now, self.backend.as_ref()).await {
            Ok(decision) => decision,
            Err(e @ RateThrottleError::BackendUnavailable(_)) => {
                return Ok(self.apply_fail_policy(e, &rule, now))
            }
            Err(e) => return Err(e),
        };

        let verdict = if decision.allowed {
            self.metrics.record_allowed();
            debug!(
                "Allowed: {} under rule '{}' ({} remaining)",
                identifier, rule.name, decision.remaining
            );
            Verdict {
                allowed: true,
                remaining: decision.remaining,
                limit: rule.limit,
                reset_time: decision.reset_time,
                retry_after: 0,
                rule_name: rule.name.clone(),
                blocked: false,
            }
        } else {
            self.metrics.record_blocked();
            info!(
                "Rate limit exceeded: {} under rule '{}'",
                identifier, rule.name
            );
            if rule.block_duration > 0.0 {
                let blocked_until = now + rule.block_duration;
                self.establish_block(identifier, &rule, metadata, now, blocked_until)
                    .await;
                Verdict {
                    allowed: false,
                    remaining: 0,
                    limit: rule.limit,
                    reset_time: blocked_until,
                    retry_after: (rule.block_duration.ceil() as i64).max(1) as u64,
                    rule_name: rule.name.clone(),
                    blocked: true,
                }
            } else {
                Verdict {
                    allowed: false,
                    remaining: 0,
                    limit: rule.limit,
                    reset_time: decision.reset_time,
                    retry_after: decision.retry_after,
                    rule_name: rule.name.clone(),
                    blocked: false,
                }
            }
        };

        self.trigger_analyzer(identifier, metadata, now);
        Ok(verdict)
    }

    /// Like [`check`](Self::check), but a denial is returned as
    /// [`RateThrottleError::RateLimitExceeded`] for adapters that prefer
    /// raising.
    pub async fn enforce(
        &self,
        identifier: &str,
        rule_name: &str,
        metadata: Option<&RequestMetadata>,
    ) -> Result<Verdict> {
        let verdict = self.check(identifier, rule_name, metadata).await?;
        if verdict.allowed {
            Ok(verdict)
        } else {
            Err(RateThrottleError::RateLimitExceeded {
                rule_name: verdict.rule_name,
                limit: verdict.limit,
                remaining: verdict.remaining,
                reset_time: verdict.reset_time,
                retry_after: verdict.retry_after,
            })
        }
    }

    fn apply_fail_policy(&self, error: RateThrottleError, rule: &Rule, now: f64) -> Verdict {
        self.metrics.record_backend_error();
        error!("Backend error during check for rule '{}': {}", rule.name, error);

        if self.config.fail_open {
            warn!("Failing open: admitting request under rule '{}'", rule.name);
            self.metrics.record_allowed();
            Verdict {
                allowed: true,
                remaining: rule.limit,
                limit: rule.limit,
                reset_time: now + rule.window,
                retry_after: 0,
                rule_name: rule.name.clone(),
                blocked: false,
            }
        } else {
            self.metrics.record_blocked();
            Verdict {
                allowed: false,
                remaining: 0,
                limit: rule.limit,
                reset_time: now + 1.0,
                retry_after: 1,
                rule_name: rule.name.clone(),
                blocked: false,
            }
        }
    }

    async fn read_block(&self, rule: &Rule, identifier: &str, now: f64) -> Result<Option<f64>> {
        let key = block_key(&rule.name, identifier);
        let Some(raw) = self.backend.get(&key).await? else {
            return Ok(None);
        };

        let blocked_until = std::str::from_utf8(&raw)
            .ok()
            .and_then(|s| s.parse::<f64>().ok());
        match blocked_until {
            Some(until) if until > now => Ok(Some(until)),
            Some(_) => {
                // The TTL missed an expired record; clear it eagerly.
                if let Err(e) = self.backend.delete(&key).await {
                    debug!("Failed to delete expired block record '{}': {}", key, e);
                }
                info!("Block expired: {}", identifier);
                Ok(None)
            }
            None => {
                warn!("Unreadable block record at '{}', ignoring", key);
                Ok(None)
            }
        }
    }

    /// Open a block and record its violation exactly once per interval.
    async fn establish_block(
        &self,
        identifier: &str,
        rule: &Rule,
        metadata: Option<&RequestMetadata>,
        now: f64,
        blocked_until: f64,
    ) {
        // The marker increment atomically claims the right to record
        // this block interval.
        let marker = violation_key(&rule.name, identifier);
        let first_claim = match self
            .backend
            .increment(&marker, 1, rule.block_duration)
            .await
        {
            Ok(count) => count == 1,
            Err(e) => {
                self.metrics.record_backend_error();
                error!("Failed to claim violation marker '{}': {}", marker, e);
                false
            }
        };
        if !first_claim {
            return;
        }

        let key = block_key(&rule.name, identifier);
        let value = format!("{:.6}", blocked_until);
        if let Err(e) = self
            .backend
            .set(&key, value.as_bytes(), rule.block_duration)
            .await
        {
            self.metrics.record_backend_error();
            error!("Failed to write block record '{}': {}", key, e);
        }

        let violation = Violation {
            identifier: identifier.to_string(),
            rule_name: rule.name.clone(),
            timestamp: now,
            observed_count: rule.limit,
            limit: rule.limit,
            scope: rule.scope,
            retry_after: (rule.block_duration.ceil() as i64).max(1) as u64,
            blocked_until: Some(blocked_until),
            kind: ViolationKind::RateLimit,
            metadata: metadata.cloned().unwrap_or_default(),
        };
        self.metrics.record_violation(violation.clone());
        self.observers.notify(&violation);
    }

    async fn record_denylist_violation(
        &self,
        identifier: &str,
        rule: &Rule,
        metadata: Option<&RequestMetadata>,
        now: f64,
        retry_after: u64,
        entry: &DenyEntry,
    ) {
        let marker = violation_key(&rule.name, identifier);
        let first_claim = match self
            .backend
            .increment(&marker, 1, retry_after as f64)
            .await
        {
            Ok(count) => count == 1,
            Err(e) => {
                self.metrics.record_backend_error();
                debug!("Failed to claim violation marker '{}': {}", marker, e);
                false
            }
        };
        if !first_claim {
            return;
        }

        let violation = Violation {
            identifier: identifier.to_string(),
            rule_name: rule.name.clone(),
            timestamp: now,
            observed_count: 0,
            limit: rule.limit,
            scope: rule.scope,
            retry_after,
            blocked_until: entry.expires_at,
            kind: ViolationKind::Denylist,
            metadata: metadata.cloned().unwrap_or_default(),
        };
        self.metrics.record_violation(violation.clone());
        self.observers.notify(&violation);
    }

    fn trigger_analyzer(&self, identifier: &str, metadata: Option<&RequestMetadata>, now: f64) {
        let endpoint = metadata.and_then(|m| m.endpoint.clone());
        if self.config.inline_analyzer {
            self.analyzer.analyze_at(identifier, endpoint.as_deref(), now);
        } else {
            let analyzer = Arc::clone(&self.analyzer);
            let identifier = identifier.to_string();
            tokio::spawn(async move {
                analyzer.analyze_at(&identifier, endpoint.as_deref(), now);
            });
        }
    }

    // Rule administration

    pub fn add_rule(&self, rule: Rule) -> Result<()> {
        self.rules.add(rule)
    }

    pub fn remove_rule(&self, name: &str) -> bool {
        self.rules.remove(name)
    }

    pub fn get_rule(&self, name: &str) -> Option<Rule> {
        self.rules.get(name)
    }

    pub fn list_rules(&self) -> Vec<String> {
        self.rules.list()
    }

    // Access-control administration

    pub fn add_allow(&self, identifier: &str) {
        self.access.add_allow(identifier)
    }

    pub fn remove_allow(&self, identifier: &str) -> bool {
        self.access.remove_allow(identifier)
    }

    pub fn is_allowed(&self, identifier: &str) -> bool {
        self.access.is_allowed(identifier)
    }

    /// Deny an identifier outright; a `ttl` of 0 denies permanently.
    pub fn add_deny(&self, identifier: &str, ttl: f64) {
        self.access.add_deny(identifier, ttl)
    }

    pub fn remove_deny(&self, identifier: &str) -> bool {
        self.access.remove_deny(identifier)
    }

    pub fn is_denied(&self, identifier: &str) -> bool {
        self.access.is_denied(identifier).is_some()
    }

    /// Active deny-list membership with its expiry, if any.
    pub fn deny_entry(&self, identifier: &str) -> Option<DenyEntry> {
        self.access.is_denied(identifier)
    }

    // Observation

    /// Register an observer invoked once per recorded violation.
    pub fn register_observer<F>(&self, observer: F)
    where
        F: Fn(&Violation) + Send + Sync + 'static,
    {
        self.observers.register(Arc::new(observer) as ViolationObserver);
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    pub fn recent_violations(&self, n: usize) -> Vec<Violation> {
        self.metrics.recent_violations(n)
    }

    pub fn reset_metrics(&self) {
        self.metrics.reset()
    }

    /// Force a traffic-analyzer pass for `identifier`.
    pub fn analyze(&self, identifier: &str, endpoint: Option<&str>) -> TrafficPattern {
        self.analyzer.analyze(identifier, endpoint)
    }

    pub fn analyzer(&self) -> &TrafficAnalyzer {
        &self.analyzer
    }

    /// Check that the storage backend is reachable.
    pub async fn health_check(&self) -> Result<()> {
        self.backend.health_check().await
    }
}

fn bypass_verdict(rule: &Rule, now: f64) -> Verdict {
    Verdict {
        allowed: true,
        remaining: rule.limit,
        limit: rule.limit,
        reset_time: now + rule.window,
        retry_after: 0,
        rule_name: rule.name.clone(),
        blocked: false,
    }
}
