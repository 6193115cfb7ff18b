//! Operational metrics and the funnel tracker.
//!
//! [`MetricsSink`] is handed to every component that reports; the daemon
//! uses the Prometheus-backed [`MetricsCollector`], tests use [`MemorySink`].
//! [`MetricsTracker`] persists one funnel record per ticket run.

use crate::store::TicketStore;
use chrono::{Duration as ChronoDuration, Utc};
use prometheus::{
    register_histogram_vec_with_registry, register_int_counter_vec_with_registry,
    register_int_counter_with_registry, Encoder, HistogramVec, IntCounter, IntCounterVec, Registry, TextEncoder,
};
use remedy_common::error::RemedyResult;
use remedy_common::funnel::{DiagnosisMetricsRecord, SuccessRateMetrics};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tracing::{debug, error};

/// Samples kept per latency series and for recent errors
pub const MAX_SAMPLES: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LatencyKind {
    /// Store insert of an automation event
    Insert,
    /// Applying fix instructions
    Autofix,
    /// A whole dispatch run
    Dispatch,
}

impl LatencyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Insert => "insert",
            Self::Autofix => "autofix",
            Self::Dispatch => "dispatch",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ErrorSample {
    pub component: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ticket_id: Option<String>,
    pub at: chrono::DateTime<Utc>,
}

/// Structured view served by `/v1/metrics`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    pub tickets_processed: u64,
    pub autopatch_success: u64,
    pub autopatch_failed: u64,
    pub autopatch_success_rate: f64,
    pub error_count: u64,
    /// Errors per processed ticket
    pub error_rate: f64,
    pub average_insert_latency_ms: f64,
    pub average_autofix_duration_ms: f64,
    pub average_dispatch_duration_ms: f64,
    pub recent_errors: Vec<ErrorSample>,
}

pub trait MetricsSink: Send + Sync {
    fn record_ticket_processed(&self);
    fn record_autopatch(&self, success: bool);
    fn record_latency(&self, kind: LatencyKind, ms: f64);
    fn record_error(&self, component: &str, message: &str, ticket_id: Option<&str>);
    fn snapshot(&self) -> MetricsSnapshot;

    /// Flat text exposition
    fn render_text(&self) -> String {
        let s = self.snapshot();
        let mut out = String::new();
        for (name, value) in [
            ("remedy_tickets_processed_total", s.tickets_processed as f64),
            ("remedy_autopatch_success_total", s.autopatch_success as f64),
            ("remedy_autopatch_failed_total", s.autopatch_failed as f64),
            ("remedy_errors_total", s.error_count as f64),
            ("remedy_insert_latency_ms_avg", s.average_insert_latency_ms),
            ("remedy_autofix_duration_ms_avg", s.average_autofix_duration_ms),
            ("remedy_dispatch_duration_ms_avg", s.average_dispatch_duration_ms),
        ] {
            out.push_str(&format!("{} {}\n", name, value));
        }
        out
    }
}

// ============================================================================
// Bounded sample windows
// ============================================================================

#[derive(Debug, Default)]
struct Samples {
    tickets_processed: u64,
    autopatch_success: u64,
    autopatch_failed: u64,
    error_count: u64,
    insert: VecDeque<f64>,
    autofix: VecDeque<f64>,
    dispatch: VecDeque<f64>,
    errors: VecDeque<ErrorSample>,
}

fn push_bounded<T>(queue: &mut VecDeque<T>, value: T) {
    if queue.len() >= MAX_SAMPLES {
        queue.pop_front();
    }
    queue.push_back(value);
}

fn mean(values: &VecDeque<f64>) -> f64 {
    if values.is_empty() {
        0.0
    } else {
        values.iter().sum::<f64>() / values.len() as f64
    }
}

fn rate(numerator: u64, denominator: u64) -> f64 {
    if denominator == 0 {
        0.0
    } else {
        numerator as f64 / denominator as f64
    }
}

impl Samples {
    fn latency(&mut self, kind: LatencyKind, ms: f64) {
        let queue = match kind {
            LatencyKind::Insert => &mut self.insert,
            LatencyKind::Autofix => &mut self.autofix,
            LatencyKind::Dispatch => &mut self.dispatch,
        };
        push_bounded(queue, ms);
    }

    fn error(&mut self, component: &str, message: &str, ticket_id: Option<&str>) {
        self.error_count += 1;
        push_bounded(
            &mut self.errors,
            ErrorSample {
                component: component.to_string(),
                message: message.to_string(),
                ticket_id: ticket_id.map(str::to_string),
                at: Utc::now(),
            },
        );
    }

    fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            tickets_processed: self.tickets_processed,
            autopatch_success: self.autopatch_success,
            autopatch_failed: self.autopatch_failed,
            autopatch_success_rate: rate(
                self.autopatch_success,
                self.autopatch_success + self.autopatch_failed,
            ),
            error_count: self.error_count,
            error_rate: rate(self.error_count, self.tickets_processed),
            average_insert_latency_ms: mean(&self.insert),
            average_autofix_duration_ms: mean(&self.autofix),
            average_dispatch_duration_ms: mean(&self.dispatch),
            recent_errors: self.errors.iter().cloned().collect(),
        }
    }
}

// ============================================================================
// In-memory sink
// ============================================================================

#[derive(Debug, Default)]
pub struct MemorySink {
    samples: Mutex<Samples>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    fn with<F: FnOnce(&mut Samples)>(&self, f: F) {
        if let Ok(mut samples) = self.samples.lock() {
            f(&mut samples);
        }
    }
}

impl MetricsSink for MemorySink {
    fn record_ticket_processed(&self) {
        self.with(|s| s.tickets_processed += 1);
    }

    fn record_autopatch(&self, success: bool) {
        self.with(|s| {
            if success {
                s.autopatch_success += 1
            } else {
                s.autopatch_failed += 1
            }
        });
    }

    fn record_latency(&self, kind: LatencyKind, ms: f64) {
        self.with(|s| s.latency(kind, ms));
    }

    fn record_error(&self, component: &str, message: &str, ticket_id: Option<&str>) {
        self.with(|s| s.error(component, message, ticket_id));
    }

    fn snapshot(&self) -> MetricsSnapshot {
        self.samples
            .lock()
            .map(|s| s.snapshot())
            .unwrap_or_else(|_| Samples::default().snapshot())
    }
}

// ============================================================================
// Prometheus collector
// ============================================================================

pub struct MetricsCollector {
    samples: MemorySink,
    tickets_processed: IntCounter,
    autopatch_total: IntCounterVec,
    errors_total: IntCounterVec,
    duration_ms: HistogramVec,
    registry: Registry,
}

impl MetricsCollector {
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new();

        let tickets_processed = register_int_counter_with_registry!(
            "remedy_tickets_processed_total",
            "Tickets that went through a dispatch run",
            registry
        )?;

        let autopatch_total = register_int_counter_vec_with_registry!(
            "remedy_autopatch_total",
            "Autopatch runs by result",
            &["result"],
            registry
        )?;

        let errors_total = register_int_counter_vec_with_registry!(
            "remedy_errors_total",
            "Errors by component",
            &["component"],
            registry
        )?;

        let duration_ms = register_histogram_vec_with_registry!(
            "remedy_operation_duration_ms",
            "Duration of store inserts, autofix runs and dispatches in milliseconds",
            &["operation"],
            vec![5.0, 25.0, 100.0, 250.0, 1000.0, 5000.0, 30000.0],
            registry
        )?;

        Ok(Self {
            samples: MemorySink::new(),
            tickets_processed,
            autopatch_total,
            errors_total,
            duration_ms,
            registry,
        })
    }
}

impl MetricsSink for MetricsCollector {
    fn record_ticket_processed(&self) {
        self.tickets_processed.inc();
        self.samples.record_ticket_processed();
    }

    fn record_autopatch(&self, success: bool) {
        let result = if success { "success" } else { "failed" };
        self.autopatch_total.with_label_values(&[result]).inc();
        self.samples.record_autopatch(success);
    }

    fn record_latency(&self, kind: LatencyKind, ms: f64) {
        self.duration_ms.with_label_values(&[kind.as_str()]).observe(ms);
        self.samples.record_latency(kind, ms);
    }

    fn record_error(&self, component: &str, message: &str, ticket_id: Option<&str>) {
        self.errors_total.with_label_values(&[component]).inc();
        self.samples.record_error(component, message, ticket_id);
    }

    fn snapshot(&self) -> MetricsSnapshot {
        self.samples.snapshot()
    }

    fn render_text(&self) -> String {
        let mut buffer = Vec::new();
        let encoder = TextEncoder::new();
        if let Err(e) = encoder.encode(&self.registry.gather(), &mut buffer) {
            error!("[METRICS] Prometheus encoding failed: {}", e);
            return String::new();
        }
        String::from_utf8(buffer).unwrap_or_default()
    }
}

// ============================================================================
// Funnel tracker
// ============================================================================

/// Persists funnel records and aggregates them
pub struct MetricsTracker {
    store: Arc<dyn TicketStore>,
}

impl MetricsTracker {
    pub fn new(store: Arc<dyn TicketStore>) -> Self {
        Self { store }
    }

    /// Store failures are logged; a lost record never fails a dispatch
    pub async fn track(&self, record: &DiagnosisMetricsRecord) {
        match self.store.insert_metrics(record).await {
            Ok(()) => debug!("[METRICS] Funnel record stored for {}", record.ticket_id),
            Err(e) => error!("[METRICS] Funnel record for {} lost: {}", record.ticket_id, e),
        }
    }

    pub async fn success_rate(&self, days: i64) -> RemedyResult<SuccessRateMetrics> {
        let since = Utc::now() - ChronoDuration::days(days);
        let records = self.store.list_metrics(since).await?;
        Ok(SuccessRateMetrics::for_last_days(&records, days))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use approx::assert_relative_eq;

    #[test]
    fn test_latency_windows_are_bounded_fifo() {
        let sink = MemorySink::new();
        for i in 0..=MAX_SAMPLES {
            sink.record_latency(LatencyKind::Insert, i as f64);
        }
        let samples = sink.samples.lock().unwrap();
        assert_eq!(samples.insert.len(), MAX_SAMPLES);
        assert_eq!(samples.insert.front().copied(), Some(1.0));
        assert_eq!(samples.insert.back().copied(), Some(MAX_SAMPLES as f64));
    }

    #[test]
    fn test_snapshot_rates_and_averages() {
        let sink = MemorySink::new();
        assert_eq!(sink.snapshot().autopatch_success_rate, 0.0);

        sink.record_autopatch(true);
        sink.record_autopatch(true);
        sink.record_autopatch(false);
        sink.record_latency(LatencyKind::Dispatch, 50.0);
        sink.record_latency(LatencyKind::Dispatch, 75.0);
        for _ in 0..4 {
            sink.record_ticket_processed();
        }
        sink.record_error("router", "boom", Some("t-1"));

        let snapshot = sink.snapshot();
        assert_relative_eq!(snapshot.autopatch_success_rate, 2.0 / 3.0);
        assert_relative_eq!(snapshot.average_dispatch_duration_ms, 62.5);
        assert_relative_eq!(snapshot.error_rate, 0.25);
        assert_eq!(snapshot.recent_errors[0].ticket_id.as_deref(), Some("t-1"));
    }

    #[test]
    fn test_prometheus_exposition() {
        let collector = MetricsCollector::new().unwrap();
        collector.record_ticket_processed();
        collector.record_autopatch(false);
        collector.record_latency(LatencyKind::Autofix, 120.0);
        let text = collector.render_text();
        assert!(text.contains("remedy_tickets_processed_total 1"));
        assert!(text.contains("remedy_autopatch_total{result=\"failed\"} 1"));
        assert!(text.contains("remedy_operation_duration_ms_count{operation=\"autofix\"} 1"));
        assert_eq!(collector.snapshot().autopatch_failed, 1);
    }

    #[test]
    fn test_flat_text_for_memory_sink() {
        let sink = MemorySink::new();
        sink.record_ticket_processed();
        assert!(sink.render_text().contains("remedy_tickets_processed_total 1\n"));
    }

    #[tokio::test]
    async fn test_tracker_round_trips_through_store() {
        let store = Arc::new(MemoryStore::new());
        let tracker = MetricsTracker::new(store.clone());
        let mut record = DiagnosisMetricsRecord::new("t-1");
        record.problem_detected = true;
        tracker.track(&record).await;
        tracker.track(&DiagnosisMetricsRecord::new("t-2")).await;

        let rates = tracker.success_rate(7).await.unwrap();
        assert_eq!(rates.total_tickets, 2);
        assert_relative_eq!(rates.problem_detection_rate, 0.5);
    }
}
