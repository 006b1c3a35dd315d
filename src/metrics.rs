use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use arc_swap::ArcSwap;
use serde::Serialize;
use tracing::{error, info};

use crate::rule::{RequestMetadata, Scope};

/// Default capacity of the recent-violations ring.
pub const DEFAULT_VIOLATION_CAPACITY: usize = 1000;

/// What kind of event produced a violation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationKind {
    /// A strategy denial that opened a block.
    RateLimit,
    /// A request from a deny-listed identifier.
    Denylist,
    /// A synthetic violation raised by the traffic analyzer.
    Ddos,
}

/// A recorded rate-limit violation with its context.
#[derive(Debug, Clone, Serialize)]
pub struct Violation {
    pub identifier: String,
    pub rule_name: String,
    /// Epoch seconds at which the violation occurred.
    pub timestamp: f64,
    /// Requests observed in the window that triggered the violation.
    pub observed_count: u64,
    pub limit: u64,
    pub scope: Scope,
    pub retry_after: u64,
    /// Absolute end of the resulting block, if one was opened.
    pub blocked_until: Option<f64>,
    pub kind: ViolationKind,
    /// Caller-supplied metadata snapshot.
    pub metadata: RequestMetadata,
}

impl Violation {
    /// JSON rendering for logs and export.
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

/// Point-in-time view of the engine counters.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    pub total_requests: u64,
    pub allowed_requests: u64,
    pub blocked_requests: u64,
    pub total_violations: u64,
    pub backend_errors: u64,
    /// blocked / total; 0 when no requests were seen.
    pub block_rate: f64,
}

/// Engine-owned request counters and the bounded ring of recent
/// violations.
pub struct Metrics {
    total_requests: AtomicU64,
    allowed_requests: AtomicU64,
    blocked_requests: AtomicU64,
    total_violations: AtomicU64,
    backend_errors: AtomicU64,
    violations: Mutex<VecDeque<Violation>>,
    capacity: usize,
}

impl Metrics {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_VIOLATION_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            total_requests: AtomicU64::new(0),
            allowed_requests: AtomicU64::new(0),
            blocked_requests: AtomicU64::new(0),
            total_violations: AtomicU64::new(0),
            backend_errors: AtomicU64::new(0),
            violations: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
            capacity,
        }
    }

    pub(crate) fn record_allowed(&self) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        self.allowed_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_blocked(&self) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        self.blocked_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_backend_error(&self) {
        self.backend_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_violation(&self, violation: Violation) {
        self.total_violations.fetch_add(1, Ordering::Relaxed);
        let mut ring = self.violations.lock().unwrap();
        while ring.len() >= self.capacity.max(1) {
            ring.pop_front();
        }
        ring.push_back(violation);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let total = self.total_requests.load(Ordering::Relaxed);
        let blocked = self.blocked_requests.load(Ordering::Relaxed);
        MetricsSnapshot {
            total_requests: total,
            allowed_requests: self.allowed_requests.load(Ordering::Relaxed),
            blocked_requests: blocked,
            total_violations: self.total_violations.load(Ordering::Relaxed),
            backend_errors: self.backend_errors.load(Ordering::Relaxed),
            block_rate: if total > 0 {
                blocked as f64 / total as f64
            } else {
                0.0
            },
        }
    }

    /// The newest `n` violations, oldest first.
    pub fn recent_violations(&self, n: usize) -> Vec<Violation> {
        let ring = self.violations.lock().unwrap();
        ring.iter()
            .skip(ring.len().saturating_sub(n))
            .cloned()
            .collect()
    }

    /// Zero every counter and clear the ring.
    pub fn reset(&self) {
        self.total_requests.store(0, Ordering::Relaxed);
        self.allowed_requests.store(0, Ordering::Relaxed);
        self.blocked_requests.store(0, Ordering::Relaxed);
        self.total_violations.store(0, Ordering::Relaxed);
        self.backend_errors.store(0, Ordering::Relaxed);
        self.violations.lock().unwrap().clear();
        info!("Metrics reset");
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Callback invoked for every recorded violation.
pub type ViolationObserver = Arc<dyn Fn(&Violation) + Send + Sync>;

/// Copy-on-write observer list: registration swaps in a fresh vector,
/// the hot path iterates an immutable snapshot without locking.
pub struct ObserverRegistry {
    observers: ArcSwap<Vec<ViolationObserver>>,
}

impl ObserverRegistry {
    pub fn new() -> Self {
        Self {
            observers: ArcSwap::from_pointee(Vec::new()),
        }
    }

    pub fn register(&self, observer: ViolationObserver) {
        self.observers.rcu(|current| {
            let mut next = Vec::clone(current);
            next.push(Arc::clone(&observer));
            next
        });
    }

    /// Invoke every observer; a panicking observer is isolated and
    /// logged.
    pub fn notify(&self, violation: &Violation) {
        let observers = self.observers.load();
        for observer in observers.iter() {
            if catch_unwind(AssertUnwindSafe(|| observer(violation))).is_err() {
                error!(
                    "Violation observer panicked (identifier: {}, rule: {})",
                    violation.identifier, violation.rule_name
                );
            }
        }
    }

    pub fn len(&self) -> usize {
        self.observers.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for ObserverRegistry {
    fn default() -> Self {
        Self::new()
    }
}
