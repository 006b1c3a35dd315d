use thiserror::Error;

#[derive(Error, Debug)]
pub enum RateThrottleError {
    #[error("Rule not found: {0}")]
    RuleNotFound(String),

    #[error("Invalid rule: {0}")]
    InvalidRule(String),

    #[error("Missing scope data: rule '{0}' requires endpoint metadata")]
    MissingScopeData(String),

    #[error("Invalid rate expression: {0}")]
    InvalidRate(String),

    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    #[error("Backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Rate limit exceeded for rule '{rule_name}': retry after {retry_after}s")]
    RateLimitExceeded {
        rule_name: String,
        limit: u64,
        remaining: u64,
        reset_time: f64,
        retry_after: u64,
    },
}

/// Result type alias for rate limiter operations
pub type Result<T> = std::result::Result<T, RateThrottleError>;
