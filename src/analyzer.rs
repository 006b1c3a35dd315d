use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tracing::{debug, warn};

use crate::access::AccessControl;
use crate::backend::epoch_seconds;
use crate::config::AnalyzerConfig;
use crate::metrics::{Metrics, ObserverRegistry, Violation, ViolationKind};
use crate::rule::{RequestMetadata, Scope};

/// Traffic-shape summary for one identifier over the rolling window.
#[derive(Debug, Clone, PartialEq)]
pub struct TrafficPattern {
    pub identifier: String,
    /// Requests per second over the analysis window.
    pub request_rate: f64,
    /// Distinct endpoints seen in the window.
    pub unique_endpoints: usize,
    /// Smallest gap between consecutive requests; `None` below two
    /// samples.
    pub min_interarrival: Option<f64>,
    /// Largest request count within any burst-window-sized slice.
    pub burst_count: u64,
    /// Weighted signal sum in [0, 1].
    pub suspicion_score: f64,
    pub is_suspicious: bool,
    /// Analysis window length in seconds.
    pub window: f64,
    pub timestamp: f64,
}

/// Analyzer counters since construction or the last reset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AnalyzerStatistics {
    pub monitored_identifiers: usize,
    pub total_analyzed: u64,
    pub suspicious_detected: u64,
    pub auto_blocked: u64,
}

struct Sample {
    ts: f64,
    endpoint: Option<String>,
}

struct IdentifierWindow {
    samples: VecDeque<Sample>,
}

/// Per-identifier sliding-window traffic analysis with autonomous
/// blocking.
///
/// The analyzer holds no engine reference: blocks go through the shared
/// deny-set, and detections fan out through the shared observer
/// registry and violation ring.
pub struct TrafficAnalyzer {
    config: AnalyzerConfig,
    history: DashMap<String, IdentifierWindow>,
    access: Arc<AccessControl>,
    observers: Arc<ObserverRegistry>,
    metrics: Arc<Metrics>,
    total_analyzed: AtomicU64,
    suspicious_detected: AtomicU64,
    auto_blocked: AtomicU64,
}

impl TrafficAnalyzer {
    pub fn new(
        config: AnalyzerConfig,
        access: Arc<AccessControl>,
        observers: Arc<ObserverRegistry>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            config,
            history: DashMap::new(),
            access,
            observers,
            metrics,
            total_analyzed: AtomicU64::new(0),
            suspicious_detected: AtomicU64::new(0),
            auto_blocked: AtomicU64::new(0),
        }
    }

    /// Record a request and analyze the identifier's recent traffic.
    pub fn analyze(&self, identifier: &str, endpoint: Option<&str>) -> TrafficPattern {
        self.analyze_at(identifier, endpoint, epoch_seconds())
    }

    /// Deterministic-time variant of [`analyze`](Self::analyze).
    pub fn analyze_at(&self, identifier: &str, endpoint: Option<&str>, now: f64) -> TrafficPattern {
        if !self.config.enabled {
            return self.idle_pattern(identifier, now);
        }

        self.total_analyzed.fetch_add(1, Ordering::Relaxed);

        let pattern = {
            let mut window = self
                .history
                .entry(identifier.to_string())
                .or_insert_with(|| IdentifierWindow {
                    samples: VecDeque::new(),
                });

            window.samples.push_back(Sample {
                ts: now,
                endpoint: endpoint.map(str::to_string),
            });
            let cutoff = now - self.config.window;
            while window
                .samples
                .front()
                .is_some_and(|sample| sample.ts <= cutoff)
            {
                window.samples.pop_front();
            }
            while window.samples.len() > self.config.max_samples {
                window.samples.pop_front();
            }

            self.measure(identifier, &window.samples, now)
        };

        if pattern.is_suspicious {
            self.suspicious_detected.fetch_add(1, Ordering::Relaxed);
            warn!(
                "Suspicious traffic from '{}' (score {:.2}, {:.2} req/s, {} endpoints)",
                identifier, pattern.suspicion_score, pattern.request_rate, pattern.unique_endpoints
            );
            if self.config.auto_block && self.access.deny_state(identifier, now).is_none() {
                self.auto_block(identifier, endpoint, &pattern, now);
            }
        }

        pattern
    }

    fn measure(&self, identifier: &str, samples: &VecDeque<Sample>, now: f64) -> TrafficPattern {
        let timestamps: Vec<f64> = samples.iter().map(|sample| sample.ts).collect();

        let request_rate = timestamps.len() as f64 / self.config.window;

        let unique_endpoints = samples
            .iter()
            .filter_map(|sample| sample.endpoint.as_deref())
            .collect::<HashSet<_>>()
            .len();

        let min_interarrival = timestamps
            .windows(2)
            .map(|pair| pair[1] - pair[0])
            .fold(None, |acc: Option<f64>, gap| {
                Some(acc.map_or(gap, |m| m.min(gap)))
            });

        let burst_count = max_burst(&timestamps, self.config.burst_window);

        let weights = &self.config.weights;
        let mut score = 0.0;

        let rate_threshold = self.config.threshold as f64 / self.config.window;
        if request_rate > rate_threshold {
            score += weights.rate;
            debug!(
                "{}: high rate {:.2} req/s (threshold {:.2})",
                identifier, request_rate, rate_threshold
            );
        }

        if unique_endpoints > self.config.max_unique_endpoints {
            score += weights.endpoints;
            debug!(
                "{}: scanning behavior, {} unique endpoints",
                identifier, unique_endpoints
            );
        }

        if burst_count > self.config.burst_threshold {
            score += weights.burst;
            debug!(
                "{}: burst of {} requests in {}s",
                identifier, burst_count, self.config.burst_window
            );
        }

        if min_interarrival.is_some_and(|gap| gap < self.config.min_interval_threshold) {
            score += weights.interarrival;
            debug!("{}: bot-like request regularity", identifier);
        }

        let suspicion_score = score.min(1.0);

        TrafficPattern {
            identifier: identifier.to_string(),
            request_rate,
            unique_endpoints,
            min_interarrival,
            burst_count,
            suspicion_score,
            is_suspicious: suspicion_score >= self.config.suspicious_threshold,
            window: self.config.window,
            timestamp: now,
        }
    }

    fn auto_block(
        &self,
        identifier: &str,
        endpoint: Option<&str>,
        pattern: &TrafficPattern,
        now: f64,
    ) {
        // Anchor the deny expiry to the caller's clock so deterministic
        // runs see the same instant the violation reports.
        let expires_at = (self.config.block_duration > 0.0).then(|| now + self.config.block_duration);
        self.access.deny_until(identifier, expires_at);
        self.auto_blocked.fetch_add(1, Ordering::Relaxed);
        warn!(
            "Auto-blocked '{}' for {}s (score {:.2})",
            identifier, self.config.block_duration, pattern.suspicion_score
        );

        let violation = Violation {
            identifier: identifier.to_string(),
            rule_name: "ddos".to_string(),
            timestamp: now,
            observed_count: (pattern.request_rate * self.config.window).round() as u64,
            limit: self.config.threshold,
            scope: Scope::Ip,
            retry_after: self.config.block_duration.ceil() as u64,
            blocked_until: expires_at,
            kind: ViolationKind::Ddos,
            metadata: endpoint
                .map(RequestMetadata::with_endpoint)
                .unwrap_or_default(),
        };
        self.metrics.record_violation(violation.clone());
        self.observers.notify(&violation);
    }

    fn idle_pattern(&self, identifier: &str, now: f64) -> TrafficPattern {
        TrafficPattern {
            identifier: identifier.to_string(),
            request_rate: 0.0,
            unique_endpoints: 0,
            min_interarrival: None,
            burst_count: 0,
            suspicion_score: 0.0,
            is_suspicious: false,
            window: self.config.window,
            timestamp: now,
        }
    }

    pub fn statistics(&self) -> AnalyzerStatistics {
        AnalyzerStatistics {
            monitored_identifiers: self.history.len(),
            total_analyzed: self.total_analyzed.load(Ordering::Relaxed),
            suspicious_detected: self.suspicious_detected.load(Ordering::Relaxed),
            auto_blocked: self.auto_blocked.load(Ordering::Relaxed),
        }
    }

    /// Zero the counters, keeping history and any active blocks.
    pub fn reset_statistics(&self) {
        self.total_analyzed.store(0, Ordering::Relaxed);
        self.suspicious_detected.store(0, Ordering::Relaxed);
        self.auto_blocked.store(0, Ordering::Relaxed);
    }

    /// Drop recorded samples for one identifier, or for all of them.
    pub fn clear_history(&self, identifier: Option<&str>) {
        match identifier {
            Some(identifier) => {
                self.history.remove(identifier);
            }
            None => self.history.clear(),
        }
    }

    /// Whether the identifier currently sits on the deny list.
    pub fn is_blocked(&self, identifier: &str) -> bool {
        self.access.is_denied(identifier).is_some()
    }

    /// Manually deny an identifier; a duration of 0 blocks permanently.
    pub fn block(&self, identifier: &str, duration: f64) {
        self.access.add_deny(identifier, duration);
    }

    pub fn unblock(&self, identifier: &str) -> bool {
        self.access.remove_deny(identifier)
    }
}

/// Largest number of timestamps falling inside any window of
/// `burst_window` seconds. Expects `timestamps` sorted ascending.
fn max_burst(timestamps: &[f64], burst_window: f64) -> u64 {
    let mut max = 0usize;
    let mut head = 0usize;
    for tail in 0..timestamps.len() {
        while timestamps[tail] - timestamps[head] > burst_window {
            head += 1;
        }
        max = max.max(tail - head + 1);
    }
    max as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn analyzer(config: AnalyzerConfig) -> (TrafficAnalyzer, Arc<ObserverRegistry>) {
        let observers = Arc::new(ObserverRegistry::new());
        let analyzer = TrafficAnalyzer::new(
            config,
            Arc::new(AccessControl::new()),
            Arc::clone(&observers),
            Arc::new(Metrics::new()),
        );
        (analyzer, observers)
    }

    fn flood_config() -> AnalyzerConfig {
        AnalyzerConfig {
            threshold: 100,
            window: 10.0,
            block_duration: 300.0,
            ..AnalyzerConfig::default()
        }
    }

    #[test]
    fn test_quiet_traffic_is_not_suspicious() {
        let (analyzer, _) = analyzer(flood_config());

        for i in 0..20 {
            let pattern = analyzer.analyze_at("1.2.3.4", Some("/home"), i as f64 * 0.4);
            assert!(!pattern.is_suspicious);
        }
        assert!(!analyzer.is_blocked("1.2.3.4"));
    }

    #[test]
    fn test_flood_across_endpoints_escalates_to_block() {
        let (analyzer, observers) = analyzer(flood_config());

        let ddos_seen = Arc::new(AtomicUsize::new(0));
        let blocked_until = Arc::new(std::sync::Mutex::new(None));
        let counter = Arc::clone(&ddos_seen);
        let expiry = Arc::clone(&blocked_until);
        observers.register(Arc::new(move |violation| {
            if violation.kind == ViolationKind::Ddos {
                counter.fetch_add(1, Ordering::SeqCst);
                *expiry.lock().unwrap() = violation.blocked_until;
            }
        }));

        // 150 requests in one second across 80 distinct endpoints. The
        // synthetic clock is anchored to the wall clock so the deny
        // expiry it produces is observable through `is_blocked`.
        let base = epoch_seconds();
        for i in 0..150 {
            let endpoint = format!("/api/{}", i % 80);
            analyzer.analyze_at("6.6.6.6", Some(&endpoint), base + i as f64 / 150.0);
        }

        assert!(analyzer.is_blocked("6.6.6.6"));
        assert_eq!(ddos_seen.load(Ordering::SeqCst), 1);

        // The deny expiry sits one block duration past the detection
        // instant on the caller's clock.
        let until = blocked_until.lock().unwrap().expect("ddos violation carries an expiry");
        assert!(until > base + 300.0 && until <= base + 301.0);

        let stats = analyzer.statistics();
        assert_eq!(stats.auto_blocked, 1);
        assert!(stats.suspicious_detected >= 1);
    }

    #[test]
    fn test_signal_contributions() {
        let config = AnalyzerConfig {
            auto_block: false,
            ..flood_config()
        };
        let (analyzer, _) = analyzer(config);

        // Slow scan: endpoint diversity alone (+0.25) stays under the
        // suspicion threshold.
        let mut last = None;
        for i in 0..60 {
            let endpoint = format!("/probe/{}", i);
            last = Some(analyzer.analyze_at("scanner", Some(&endpoint), i as f64 * 0.15));
        }
        let pattern = last.unwrap();
        assert!(pattern.unique_endpoints > 50);
        assert!(pattern.suspicion_score < 0.5);
        assert!(!pattern.is_suspicious);
    }

    #[test]
    fn test_burst_and_interarrival_measurement() {
        let config = AnalyzerConfig {
            auto_block: false,
            burst_window: 1.0,
            ..flood_config()
        };
        let (analyzer, _) = analyzer(config);

        // Two spaced clusters of 5 requests 0.01 s apart.
        let mut last = None;
        for cluster in 0..2 {
            let base = cluster as f64 * 5.0;
            for i in 0..5 {
                last = Some(analyzer.analyze_at("burster", Some("/x"), base + i as f64 * 0.01));
            }
        }

        let pattern = last.unwrap();
        assert_eq!(pattern.burst_count, 5);
        assert!(pattern.min_interarrival.unwrap() < 0.1);
    }

    #[test]
    fn test_disabled_analyzer_records_nothing() {
        let config = AnalyzerConfig {
            enabled: false,
            ..flood_config()
        };
        let (analyzer, _) = analyzer(config);

        for i in 0..200 {
            let pattern = analyzer.analyze_at("9.9.9.9", Some("/x"), i as f64 * 0.001);
            assert!(!pattern.is_suspicious);
        }
        assert_eq!(analyzer.statistics().total_analyzed, 0);
        assert!(!analyzer.is_blocked("9.9.9.9"));
    }

    #[test]
    fn test_manual_block_and_unblock() {
        let (analyzer, _) = analyzer(flood_config());

        analyzer.block("5.5.5.5", 60.0);
        assert!(analyzer.is_blocked("5.5.5.5"));
        assert!(analyzer.unblock("5.5.5.5"));
        assert!(!analyzer.is_blocked("5.5.5.5"));
    }

    #[test]
    fn test_samples_age_out_of_the_window() {
        let config = AnalyzerConfig {
            auto_block: false,
            ..flood_config()
        };
        let (analyzer, _) = analyzer(config);

        for i in 0..50 {
            analyzer.analyze_at("ager", Some("/x"), i as f64 * 0.01);
        }
        // Far beyond the window, only the new sample remains.
        let pattern = analyzer.analyze_at("ager", Some("/x"), 100.0);
        assert!(pattern.request_rate <= 0.11);
        assert_eq!(pattern.burst_count, 1);
    }

    #[test]
    fn test_clear_history_and_reset_statistics() {
        let (analyzer, _) = analyzer(flood_config());

        analyzer.analyze_at("a", Some("/x"), 0.0);
        analyzer.analyze_at("b", Some("/x"), 0.0);
        assert_eq!(analyzer.statistics().monitored_identifiers, 2);

        analyzer.clear_history(Some("a"));
        assert_eq!(analyzer.statistics().monitored_identifiers, 1);
        analyzer.clear_history(None);
        assert_eq!(analyzer.statistics().monitored_identifiers, 0);

        analyzer.reset_statistics();
        assert_eq!(analyzer.statistics().total_analyzed, 0);
    }
}
