//! Metrics registry
//!
//! Named counters, gauges and histograms. Every update goes through the
//! `metrics` facade into a Prometheus recorder owned by the registry, which
//! renders the text exposition. Alongside, the registry keeps the latest
//! counter and gauge values and a running count/sum/min/max per histogram
//! so callers can query them directly. Nothing grows with the number of
//! observations.

use metrics::with_local_recorder;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle, PrometheusRecorder};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// Streams that had a delay applied
pub const STREAMS_DELAYED_TOTAL: &str = "qtop_streams_delayed_total";
/// Distribution of applied delays in milliseconds
pub const STREAM_DELAY_MS: &str = "qtop_stream_delay_ms";
/// Circuits with recorded phase state
pub const ACTIVE_CIRCUITS: &str = "qtop_active_circuits";

/// Histogram observations buffered by the recorder before they are folded
/// into its summaries
const UPKEEP_INTERVAL: u64 = 1024;

/// Running summary of one histogram's observations
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct HistogramSummary {
    pub count: usize,
    pub sum: f64,
    pub min: f64,
    pub max: f64,
}

impl HistogramSummary {
    fn first(value: f64) -> Self {
        Self {
            count: 1,
            sum: value,
            min: value,
            max: value,
        }
    }

    fn record(&mut self, value: f64) {
        self.count += 1;
        self.sum += value;
        self.min = self.min.min(value);
        self.max = self.max.max(value);
    }

    pub fn mean(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.sum / self.count as f64
        }
    }
}

pub struct MetricsRegistry {
    recorder: PrometheusRecorder,
    handle: PrometheusHandle,
    counters: RwLock<BTreeMap<String, u64>>,
    gauges: RwLock<BTreeMap<String, f64>>,
    histograms: RwLock<BTreeMap<String, HistogramSummary>>,
    pending_observations: AtomicU64,
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsRegistry {
    pub fn new() -> Self {
        let recorder = PrometheusBuilder::new().build_recorder();
        let handle = recorder.handle();
        Self {
            recorder,
            handle,
            counters: RwLock::new(BTreeMap::new()),
            gauges: RwLock::new(BTreeMap::new()),
            histograms: RwLock::new(BTreeMap::new()),
            pending_observations: AtomicU64::new(0),
        }
    }

    /// Increment a counter, creating it at zero first
    pub fn inc_counter(&self, name: &str, amount: u64) {
        *self.counters.write().entry(name.to_string()).or_insert(0) += amount;
        with_local_recorder(&self.recorder, || {
            metrics::counter!(name.to_string()).increment(amount)
        });
    }

    pub fn counter(&self, name: &str) -> u64 {
        self.counters.read().get(name).copied().unwrap_or(0)
    }

    pub fn set_gauge(&self, name: &str, value: f64) {
        self.gauges.write().insert(name.to_string(), value);
        with_local_recorder(&self.recorder, || {
            metrics::gauge!(name.to_string()).set(value)
        });
    }

    pub fn add_gauge(&self, name: &str, delta: f64) {
        *self.gauges.write().entry(name.to_string()).or_insert(0.0) += delta;
        with_local_recorder(&self.recorder, || {
            metrics::gauge!(name.to_string()).increment(delta)
        });
    }

    pub fn gauge(&self, name: &str) -> f64 {
        self.gauges.read().get(name).copied().unwrap_or(0.0)
    }

    pub fn observe(&self, name: &str, value: f64) {
        self.histograms
            .write()
            .entry(name.to_string())
            .and_modify(|summary| summary.record(value))
            .or_insert_with(|| HistogramSummary::first(value));
        with_local_recorder(&self.recorder, || {
            metrics::histogram!(name.to_string()).record(value)
        });

        if self.pending_observations.fetch_add(1, Ordering::Relaxed) + 1 >= UPKEEP_INTERVAL {
            self.pending_observations.store(0, Ordering::Relaxed);
            self.handle.run_upkeep();
        }
    }

    /// Summary of a histogram, `None` if it has never been observed
    pub fn histogram(&self, name: &str) -> Option<HistogramSummary> {
        self.histograms.read().get(name).copied()
    }

    /// Record one applied stream delay
    pub fn record_stream_delay(&self, delay_ms: f64, tracked_circuits: usize) {
        self.inc_counter(STREAMS_DELAYED_TOTAL, 1);
        self.observe(STREAM_DELAY_MS, delay_ms);
        self.set_gauge(ACTIVE_CIRCUITS, tracked_circuits as f64);
    }

    /// Prometheus text exposition of every metric
    pub fn render_prometheus(&self) -> String {
        self.handle.run_upkeep();
        self.pending_observations.store(0, Ordering::Relaxed);
        self.handle.render()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter_defaults_to_zero() {
        let metrics = MetricsRegistry::new();
        assert_eq!(metrics.counter("missing"), 0);
        metrics.inc_counter("hits", 1);
        metrics.inc_counter("hits", 2);
        assert_eq!(metrics.counter("hits"), 3);
    }

    #[test]
    fn test_gauge_set_and_add() {
        let metrics = MetricsRegistry::new();
        metrics.set_gauge("g", 2.5);
        metrics.add_gauge("g", 1.0);
        metrics.add_gauge("g", -0.5);
        assert_eq!(metrics.gauge("g"), 3.0);
        assert_eq!(metrics.gauge("other"), 0.0);
    }

    #[test]
    fn test_histogram_summary() {
        let metrics = MetricsRegistry::new();
        assert!(metrics.histogram("h").is_none());
        for v in [1.0, 4.0, 2.5] {
            metrics.observe("h", v);
        }
        let summary = metrics.histogram("h").unwrap();
        assert_eq!(summary.count, 3);
        assert_eq!(summary.sum, 7.5);
        assert_eq!(summary.min, 1.0);
        assert_eq!(summary.max, 4.0);
        assert_eq!(summary.mean(), 2.5);
    }

    #[test]
    fn test_record_stream_delay() {
        let metrics = MetricsRegistry::new();
        metrics.record_stream_delay(0.5, 1);
        metrics.record_stream_delay(1.5, 2);
        assert_eq!(metrics.counter(STREAMS_DELAYED_TOTAL), 2);
        assert_eq!(metrics.gauge(ACTIVE_CIRCUITS), 2.0);
        assert_eq!(metrics.histogram(STREAM_DELAY_MS).unwrap().count, 2);
    }

    #[test]
    fn test_long_running_histogram_keeps_running_summary() {
        let metrics = MetricsRegistry::new();
        for i in 0..100_000u32 {
            metrics.record_stream_delay(f64::from(i % 10) + 0.5, 1);
        }
        let summary = metrics.histogram(STREAM_DELAY_MS).unwrap();
        assert_eq!(summary.count, 100_000);
        assert_eq!(summary.min, 0.5);
        assert_eq!(summary.max, 9.5);
        assert!((summary.mean() - 5.0).abs() < 1e-9);
        assert!(metrics
            .render_prometheus()
            .contains("qtop_stream_delay_ms_count 100000"));
    }

    #[test]
    fn test_registries_are_independent() {
        let a = MetricsRegistry::new();
        let b = MetricsRegistry::new();
        a.inc_counter("only_a", 1);
        assert!(a.render_prometheus().contains("only_a 1"));
        assert!(!b.render_prometheus().contains("only_a"));
    }

    #[test]
    fn test_render_prometheus() {
        let metrics = MetricsRegistry::new();
        metrics.record_stream_delay(2.0, 3);
        let text = metrics.render_prometheus();
        assert!(text.contains("# TYPE qtop_streams_delayed_total counter"));
        assert!(text.contains("qtop_streams_delayed_total 1"));
        assert!(text.contains("qtop_active_circuits 3"));
        assert!(text.contains("qtop_stream_delay_ms_sum 2"));
        assert!(text.contains("qtop_stream_delay_ms_count 1"));
    }
}
