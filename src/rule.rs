use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::errors::{RateThrottleError, Result};

/// The admission algorithm a rule dispatches to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    TokenBucket,
    LeakyBucket,
    FixedWindow,
    SlidingWindow,
}

impl StrategyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StrategyKind::TokenBucket => "token_bucket",
            StrategyKind::LeakyBucket => "leaky_bucket",
            StrategyKind::FixedWindow => "fixed_window",
            StrategyKind::SlidingWindow => "sliding_window",
        }
    }
}

impl fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The dimension along which request counts aggregate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scope {
    Ip,
    User,
    Endpoint,
    Global,
    Custom,
}

impl Scope {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scope::Ip => "ip",
            Scope::User => "user",
            Scope::Endpoint => "endpoint",
            Scope::Global => "global",
            Scope::Custom => "custom",
        }
    }
}

/// Typed request metadata recognized by the scope resolver and the
/// traffic analyzer. `custom` entries pass through to observers
/// untouched.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RequestMetadata {
    pub endpoint: Option<String>,
    pub method: Option<String>,
    pub user_id: Option<String>,
    pub api_key: Option<String>,
    #[serde(default)]
    pub custom: HashMap<String, String>,
}

impl RequestMetadata {
    pub fn with_endpoint(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: Some(endpoint.into()),
            ..Self::default()
        }
    }
}

/// Predicate deciding whether a rule applies to a request at all.
pub type RuleCondition = Arc<dyn Fn(&RequestMetadata) -> bool + Send + Sync>;

/// A named admission policy.
#[derive(Clone)]
pub struct Rule {
    /// Unique rule name.
    pub name: String,

    /// Maximum number of requests allowed per window.
    pub limit: u64,

    /// Window length in seconds.
    pub window: f64,

    pub strategy: StrategyKind,

    pub scope: Scope,

    /// Burst allowance for the token bucket; defaults to `limit`.
    pub burst: Option<u64>,

    /// Seconds an identifier stays blocked after exceeding the limit.
    /// 0 disables blocking.
    pub block_duration: f64,

    /// Optional predicate; a non-matching request bypasses the rule.
    pub condition: Option<RuleCondition>,
}

impl Rule {
    /// Create a rule with the default strategy (sliding window), `ip`
    /// scope and a 300 s block duration.
    pub fn new(name: impl Into<String>, limit: u64, window: f64) -> Self {
        Self {
            name: name.into(),
            limit,
            window,
            strategy: StrategyKind::SlidingWindow,
            scope: Scope::Ip,
            burst: None,
            block_duration: 300.0,
            condition: None,
        }
    }

    pub fn burst_capacity(&self) -> u64 {
        self.burst.unwrap_or(self.limit)
    }

    /// Validate rule parameters
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(RateThrottleError::InvalidRule(
                "Rule name must be a non-empty string".to_string(),
            ));
        }

        if self.limit == 0 {
            return Err(RateThrottleError::InvalidRule(
                "Limit must be positive".to_string(),
            ));
        }

        if self.window <= 0.0 || !self.window.is_finite() {
            return Err(RateThrottleError::InvalidRule(format!(
                "Window must be positive, got {}",
                self.window
            )));
        }

        if self.block_duration < 0.0 || !self.block_duration.is_finite() {
            return Err(RateThrottleError::InvalidRule(format!(
                "Block duration cannot be negative, got {}",
                self.block_duration
            )));
        }

        if let Some(burst) = self.burst {
            if burst < self.limit {
                return Err(RateThrottleError::InvalidRule(format!(
                    "Burst ({}) cannot be less than limit ({})",
                    burst, self.limit
                )));
            }
        }

        Ok(())
    }
}

impl fmt::Debug for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Rule")
            .field("name", &self.name)
            .field("limit", &self.limit)
            .field("window", &self.window)
            .field("strategy", &self.strategy)
            .field("scope", &self.scope)
            .field("burst", &self.burst)
            .field("block_duration", &self.block_duration)
            .field("condition", &self.condition.as_ref().map(|_| "<fn>"))
            .finish()
    }
}

/// Resolve the composite bucket key for `(identifier, rule, metadata)`.
pub fn bucket_key(
    rule: &Rule,
    identifier: &str,
    metadata: Option<&RequestMetadata>,
) -> Result<String> {
    let scope_value = match rule.scope {
        Scope::Ip | Scope::User | Scope::Custom => identifier,
        Scope::Global => "*",
        Scope::Endpoint => metadata
            .and_then(|m| m.endpoint.as_deref())
            .ok_or_else(|| RateThrottleError::MissingScopeData(rule.name.clone()))?,
    };
    Ok(format!(
        "rt:{}:{}:{}",
        rule.name,
        rule.scope.as_str(),
        scope_value
    ))
}

/// Key of the block record for `(rule, identifier)`.
pub fn block_key(rule_name: &str, identifier: &str) -> String {
    format!("rt:block:{}:{}", rule_name, identifier)
}

/// Key of the once-per-block-interval violation marker.
pub fn violation_key(rule_name: &str, identifier: &str) -> String {
    format!("rt:violated:{}:{}", rule_name, identifier)
}

/// Named-rule registry.
pub struct RuleRegistry {
    rules: RwLock<HashMap<String, Rule>>,
}

impl RuleRegistry {
    pub fn new() -> Self {
        Self {
            rules: RwLock::new(HashMap::new()),
        }
    }

    /// Validate and register a rule, replacing any rule of the same name.
    pub fn add(&self, rule: Rule) -> Result<()> {
        rule.validate()?;
        info!(
            "Added rule '{}': {} requests per {}s using {} strategy",
            rule.name, rule.limit, rule.window, rule.strategy
        );
        self.rules.write().unwrap().insert(rule.name.clone(), rule);
        Ok(())
    }

    pub fn remove(&self, name: &str) -> bool {
        let removed = self.rules.write().unwrap().remove(name).is_some();
        if removed {
            info!("Removed rule: {}", name);
        } else {
            warn!("Attempted to remove non-existent rule: {}", name);
        }
        removed
    }

    pub fn get(&self, name: &str) -> Option<Rule> {
        self.rules.read().unwrap().get(name).cloned()
    }

    pub fn list(&self) -> Vec<String> {
        self.rules.read().unwrap().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.rules.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for RuleRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rule_validation() {
        assert!(Rule::new("api", 100, 60.0).validate().is_ok());
        assert!(Rule::new("", 100, 60.0).validate().is_err());
        assert!(Rule::new("api", 0, 60.0).validate().is_err());
        assert!(Rule::new("api", 100, 0.0).validate().is_err());

        let rule = Rule {
            block_duration: -1.0,
            ..Rule::new("api", 100, 60.0)
        };
        assert!(rule.validate().is_err());

        let rule = Rule {
            burst: Some(50),
            ..Rule::new("api", 100, 60.0)
        };
        assert!(rule.validate().is_err());

        let rule = Rule {
            burst: Some(150),
            ..Rule::new("api", 100, 60.0)
        };
        assert!(rule.validate().is_ok());
    }

    #[test]
    fn test_burst_defaults_to_limit() {
        assert_eq!(Rule::new("api", 100, 60.0).burst_capacity(), 100);
        let rule = Rule {
            burst: Some(150),
            ..Rule::new("api", 100, 60.0)
        };
        assert_eq!(rule.burst_capacity(), 150);
    }

    #[test]
    fn test_bucket_key_resolution() {
        let rule = Rule::new("api", 100, 60.0);
        assert_eq!(
            bucket_key(&rule, "1.2.3.4", None).unwrap(),
            "rt:api:ip:1.2.3.4"
        );

        let rule = Rule {
            scope: Scope::Global,
            ..Rule::new("api", 100, 60.0)
        };
        assert_eq!(bucket_key(&rule, "1.2.3.4", None).unwrap(), "rt:api:global:*");

        let rule = Rule {
            scope: Scope::Endpoint,
            ..Rule::new("api", 100, 60.0)
        };
        let metadata = RequestMetadata::with_endpoint("/search");
        assert_eq!(
            bucket_key(&rule, "1.2.3.4", Some(&metadata)).unwrap(),
            "rt:api:endpoint:/search"
        );
        assert!(matches!(
            bucket_key(&rule, "1.2.3.4", None),
            Err(RateThrottleError::MissingScopeData(_))
        ));
    }

    #[test]
    fn test_registry_lifecycle() {
        let registry = RuleRegistry::new();
        assert!(registry.is_empty());

        registry.add(Rule::new("api", 100, 60.0)).unwrap();
        registry.add(Rule::new("login", 5, 60.0)).unwrap();
        assert_eq!(registry.len(), 2);
        assert!(registry.get("api").is_some());

        let mut names = registry.list();
        names.sort();
        assert_eq!(names, vec!["api", "login"]);

        assert!(registry.remove("api"));
        assert!(!registry.remove("api"));
        assert!(registry.get("api").is_none());
    }

    #[test]
    fn test_registry_rejects_invalid_rule() {
        let registry = RuleRegistry::new();
        assert!(registry.add(Rule::new("bad", 0, 60.0)).is_err());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_strategy_kind_serde_names() {
        let kind: StrategyKind = serde_json::from_str("\"token_bucket\"").unwrap();
        assert_eq!(kind, StrategyKind::TokenBucket);
        assert_eq!(
            serde_json::to_string(&StrategyKind::SlidingWindow).unwrap(),
            "\"sliding_window\""
        );
    }
}
