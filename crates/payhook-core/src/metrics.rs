//! Metrics collection and threshold alerting.
//!
//! Components never touch global counters: each receives an injected
//! [`MetricsSink`] so it stays independently testable. The in-memory sink
//! keeps bounded sample windows for latency percentiles and exposes the
//! derived figures (error rate, queue depth, pool utilization) that
//! [`AlertPolicy::check`] evaluates. Alert delivery itself is an external
//! collaborator behind [`AlertNotifier`].

use std::{collections::HashMap, fmt, sync::Arc, time::Duration};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Components that report metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Component {
    /// Signature verification at the ingress boundary.
    Verifier,
    /// Webhook routing and handler invocation.
    Router,
    /// Retry sweep processing.
    Retry,
    /// Batch item execution.
    Batch,
    /// Connection pool.
    Pool,
}

impl Component {
    /// Returns the component name used in metric labels and alerts.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Verifier => "verifier",
            Self::Router => "router",
            Self::Retry => "retry",
            Self::Batch => "batch",
            Self::Pool => "pool",
        }
    }
}

impl fmt::Display for Component {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Metric identifiers recorded across the system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Metric {
    /// Operation latency in milliseconds.
    Latency(Component),
    /// Operations attempted.
    Requests(Component),
    /// Operations that failed.
    Errors(Component),
    /// Pending + processing webhook events.
    QueueDepth,
    /// Connections currently handed out.
    PoolInUse,
    /// Connections sitting idle.
    PoolIdle,
    /// Cumulative acquire timeouts.
    PoolExhaustions,
}

/// Sink for metric observations, injected into every component.
pub trait MetricsSink: Send + Sync + std::fmt::Debug {
    /// Records one observation of `metric`.
    fn record(&self, metric: Metric, value: f64);
}

/// Sink that discards all observations.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn record(&self, _metric: Metric, _value: f64) {}
}

const SAMPLE_WINDOW: usize = 1024;

#[derive(Debug, Default)]
struct Series {
    count: u64,
    samples: Vec<f64>,
    last: f64,
}

impl Series {
    fn observe(&mut self, value: f64) {
        self.count += 1;
        self.last = value;
        if self.samples.len() == SAMPLE_WINDOW {
            // Overwrite oldest; order does not matter for percentiles.
            let slot = (self.count as usize) % SAMPLE_WINDOW;
            self.samples[slot] = value;
        } else {
            self.samples.push(value);
        }
    }
}

/// In-memory metrics store with bounded sample windows.
#[derive(Debug, Default)]
pub struct InMemoryMetrics {
    series: Mutex<HashMap<Metric, Series>>,
}

impl InMemoryMetrics {
    /// Creates an empty metrics store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Total observations recorded for `metric`.
    pub fn count(&self, metric: Metric) -> u64 {
        self.series.lock().get(&metric).map_or(0, |s| s.count)
    }

    /// Most recent observation, used for gauges.
    pub fn last(&self, metric: Metric) -> Option<f64> {
        self.series.lock().get(&metric).map(|s| s.last)
    }

    /// Percentile over the retained sample window, `pct` in `(0, 100]`.
    pub fn percentile(&self, metric: Metric, pct: f64) -> Option<f64> {
        let series = self.series.lock();
        let samples = &series.get(&metric)?.samples;
        if samples.is_empty() {
            return None;
        }
        let mut sorted = samples.clone();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        let rank = ((pct / 100.0) * sorted.len() as f64).ceil() as usize;
        Some(sorted[rank.clamp(1, sorted.len()) - 1])
    }

    /// Failed fraction of attempted operations for a component.
    pub fn error_rate(&self, component: Component) -> f64 {
        let requests = self.count(Metric::Requests(component));
        if requests == 0 {
            return 0.0;
        }
        self.count(Metric::Errors(component)) as f64 / requests as f64
    }
}

impl MetricsSink for InMemoryMetrics {
    fn record(&self, metric: Metric, value: f64) {
        self.series.lock().entry(metric).or_default().observe(value);
    }
}

/// What tripped an alert.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AlertKind {
    /// A component's error rate exceeded the policy threshold.
    ErrorRate(Component),
    /// The webhook backlog exceeded the policy threshold.
    QueueDepth,
    /// Callers timed out waiting for pooled connections.
    PoolExhaustion,
}

/// A threshold breach raised toward the notification collaborator.
#[derive(Debug, Clone)]
pub struct Alert {
    /// Which threshold was breached.
    pub kind: AlertKind,
    /// Human-readable description.
    pub message: String,
    /// Observed value.
    pub value: f64,
    /// Configured threshold.
    pub threshold: f64,
}

/// Alerting thresholds.
#[derive(Debug, Clone)]
pub struct AlertPolicy {
    /// Maximum tolerated error rate per component.
    pub max_error_rate: f64,
    /// Maximum tolerated pending + processing backlog.
    pub max_queue_depth: f64,
}

impl Default for AlertPolicy {
    fn default() -> Self {
        Self { max_error_rate: 0.05, max_queue_depth: 1000.0 }
    }
}

impl AlertPolicy {
    /// Evaluates all thresholds against current metrics.
    ///
    /// `exhaustions_since_last_check` is the pool acquire-timeout delta the
    /// caller observed since its previous evaluation; any exhaustion raises
    /// an alert.
    pub fn check(
        &self,
        metrics: &InMemoryMetrics,
        exhaustions_since_last_check: u64,
    ) -> Vec<Alert> {
        let mut alerts = Vec::new();

        for component in [
            Component::Verifier,
            Component::Router,
            Component::Retry,
            Component::Batch,
        ] {
            let rate = metrics.error_rate(component);
            if rate > self.max_error_rate && metrics.count(Metric::Requests(component)) > 0 {
                alerts.push(Alert {
                    kind: AlertKind::ErrorRate(component),
                    message: format!("{component} error rate {:.1}% over threshold", rate * 100.0),
                    value: rate,
                    threshold: self.max_error_rate,
                });
            }
        }

        if let Some(depth) = metrics.last(Metric::QueueDepth) {
            if depth > self.max_queue_depth {
                alerts.push(Alert {
                    kind: AlertKind::QueueDepth,
                    message: format!("webhook backlog at {depth} events"),
                    value: depth,
                    threshold: self.max_queue_depth,
                });
            }
        }

        if exhaustions_since_last_check > 0 {
            alerts.push(Alert {
                kind: AlertKind::PoolExhaustion,
                message: format!(
                    "{exhaustions_since_last_check} pool acquire timeouts since last check"
                ),
                value: exhaustions_since_last_check as f64,
                threshold: 0.0,
            });
        }

        alerts
    }
}

/// Delivery channel for raised alerts (email, chat, paging — out of scope;
/// only the trigger contract lives here).
#[async_trait]
pub trait AlertNotifier: Send + Sync + std::fmt::Debug {
    /// Delivers one alert.
    async fn notify(&self, alert: &Alert);
}

/// Notifier that writes alerts to the log.
#[derive(Debug, Default)]
pub struct LogNotifier;

#[async_trait]
impl AlertNotifier for LogNotifier {
    async fn notify(&self, alert: &Alert) {
        warn!(
            kind = ?alert.kind,
            value = alert.value,
            threshold = alert.threshold,
            "alert: {}",
            alert.message
        );
    }
}

/// Notifier that discards alerts.
#[derive(Debug, Default)]
pub struct NullNotifier;

#[async_trait]
impl AlertNotifier for NullNotifier {
    async fn notify(&self, _alert: &Alert) {}
}

/// Periodic threshold evaluation loop.
pub struct Monitor {
    metrics: Arc<InMemoryMetrics>,
    policy: AlertPolicy,
    notifier: Arc<dyn AlertNotifier>,
    interval: Duration,
    last_exhaustions: Mutex<u64>,
}

impl Monitor {
    /// Creates a monitor over the given metrics store.
    pub fn new(
        metrics: Arc<InMemoryMetrics>,
        policy: AlertPolicy,
        notifier: Arc<dyn AlertNotifier>,
        interval: Duration,
    ) -> Self {
        Self { metrics, policy, notifier, interval, last_exhaustions: Mutex::new(0) }
    }

    /// Runs one evaluation, notifying for every breach. Returns the alerts
    /// raised so tests and health endpoints can inspect them.
    pub async fn check_thresholds(&self) -> Vec<Alert> {
        let total = self.metrics.last(Metric::PoolExhaustions).unwrap_or(0.0) as u64;
        let delta = {
            let mut last = self.last_exhaustions.lock();
            let delta = total.saturating_sub(*last);
            *last = total;
            delta
        };

        let alerts = self.policy.check(&self.metrics, delta);
        for alert in &alerts {
            self.notifier.notify(alert).await;
        }
        alerts
    }

    /// Evaluates thresholds on a fixed cadence until cancelled.
    pub async fn run(&self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    self.check_thresholds().await;
                },
            }
        }
    }
}

impl fmt::Debug for Monitor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Monitor").field("interval", &self.interval).finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_rate_needs_requests() {
        let metrics = InMemoryMetrics::new();
        assert_eq!(metrics.error_rate(Component::Router), 0.0);

        for _ in 0..10 {
            metrics.record(Metric::Requests(Component::Router), 1.0);
        }
        metrics.record(Metric::Errors(Component::Router), 1.0);
        assert!((metrics.error_rate(Component::Router) - 0.1).abs() < f64::EPSILON);
    }

    #[test]
    fn percentile_over_window() {
        let metrics = InMemoryMetrics::new();
        for v in 1..=100 {
            metrics.record(Metric::Latency(Component::Batch), f64::from(v));
        }
        let p50 = metrics.percentile(Metric::Latency(Component::Batch), 50.0);
        let p95 = metrics.percentile(Metric::Latency(Component::Batch), 95.0);
        assert_eq!(p50, Some(50.0));
        assert_eq!(p95, Some(95.0));
    }

    #[test]
    fn policy_flags_error_rate_breach() {
        let metrics = InMemoryMetrics::new();
        for _ in 0..10 {
            metrics.record(Metric::Requests(Component::Router), 1.0);
        }
        metrics.record(Metric::Errors(Component::Router), 1.0);

        let alerts = AlertPolicy::default().check(&metrics, 0);
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].kind, AlertKind::ErrorRate(Component::Router));
    }

    #[test]
    fn policy_flags_queue_depth_and_exhaustion() {
        let metrics = InMemoryMetrics::new();
        metrics.record(Metric::QueueDepth, 5000.0);

        let alerts = AlertPolicy::default().check(&metrics, 3);
        let kinds: Vec<_> = alerts.iter().map(|a| a.kind.clone()).collect();
        assert!(kinds.contains(&AlertKind::QueueDepth));
        assert!(kinds.contains(&AlertKind::PoolExhaustion));
    }

    #[tokio::test]
    async fn monitor_reports_exhaustion_delta_once() {
        let metrics = Arc::new(InMemoryMetrics::new());
        metrics.record(Metric::PoolExhaustions, 2.0);

        let monitor = Monitor::new(
            Arc::clone(&metrics),
            AlertPolicy::default(),
            Arc::new(NullNotifier),
            Duration::from_secs(60),
        );

        let first = monitor.check_thresholds().await;
        assert!(first.iter().any(|a| a.kind == AlertKind::PoolExhaustion));

        // Unchanged counter: no repeat alert.
        let second = monitor.check_thresholds().await;
        assert!(second.iter().all(|a| a.kind != AlertKind::PoolExhaustion));
    }
}
