pub mod access;
pub mod analyzer;
pub mod backend;
pub mod config;
pub mod engine;
pub mod errors;
pub mod limiter;
pub mod metrics;
pub mod rate;
pub mod rule;

// Re-export commonly used types
pub use access::{AccessControl, DenyEntry};
pub use analyzer::{AnalyzerStatistics, TrafficAnalyzer, TrafficPattern};
pub use backend::memory::MemoryBackend;
pub use backend::redis::RedisBackend;
pub use backend::StorageBackend;
pub use config::{AnalyzerConfig, EngineConfig, RedisConfig, SignalWeights};
pub use engine::{RateThrottle, Verdict};
pub use errors::{RateThrottleError, Result};
pub use metrics::{Metrics, MetricsSnapshot, Violation, ViolationKind, ViolationObserver};
pub use rate::{format_rate, parse_rate, Rate};
pub use rule::{RequestMetadata, Rule, RuleRegistry, Scope, StrategyKind};
