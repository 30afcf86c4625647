//! Observability infrastructure
//!
//! Provides:
//! - Prometheus metrics (tick latency, fit latency, counters for
//!   samples, anomalies, drops and persistence failures)
//! - Structured logging for significant engine events

use crate::models::{AnomalyRecord, EngineState};
use prometheus::{
    register_histogram, register_int_counter, register_int_gauge, Histogram, IntCounter, IntGauge,
};
use std::sync::OnceLock;
use tracing::{info, warn};

/// Histogram buckets for latency measurements (in seconds)
const LATENCY_BUCKETS: &[f64] = &[
    0.0001, 0.0005, 0.001, 0.0025, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0,
];

/// Global metrics instance (registered once)
static GLOBAL_METRICS: OnceLock<EngineMetricsInner> = OnceLock::new();

struct EngineMetricsInner {
    tick_latency_seconds: Histogram,
    fit_latency_seconds: Histogram,
    samples_collected: IntCounter,
    anomalies_reported: IntCounter,
    subscriber_dropped_events: IntCounter,
    persist_failures: IntCounter,
    buffered_samples: IntGauge,
    model_trained_at_seconds: IntGauge,
}

impl EngineMetricsInner {
    fn new() -> Self {
        Self {
            tick_latency_seconds: register_histogram!(
                "hostwatch_tick_latency_seconds",
                "Time spent on one sample-score-classify tick",
                LATENCY_BUCKETS.to_vec()
            )
            .expect("Failed to register tick_latency_seconds"),

            fit_latency_seconds: register_histogram!(
                "hostwatch_fit_latency_seconds",
                "Time spent fitting the anomaly model",
                LATENCY_BUCKETS.to_vec()
            )
            .expect("Failed to register fit_latency_seconds"),

            samples_collected: register_int_counter!(
                "hostwatch_samples_collected_total",
                "Total metric samples collected"
            )
            .expect("Failed to register samples_collected_total"),

            anomalies_reported: register_int_counter!(
                "hostwatch_anomalies_reported_total",
                "Total anomalies persisted and broadcast"
            )
            .expect("Failed to register anomalies_reported_total"),

            subscriber_dropped_events: register_int_counter!(
                "hostwatch_subscriber_dropped_events_total",
                "Events dropped from full subscriber queues"
            )
            .expect("Failed to register subscriber_dropped_events_total"),

            persist_failures: register_int_counter!(
                "hostwatch_persist_failures_total",
                "Failed writes to the append-only logs"
            )
            .expect("Failed to register persist_failures_total"),

            buffered_samples: register_int_gauge!(
                "hostwatch_buffered_samples",
                "Samples currently held in the rolling buffer"
            )
            .expect("Failed to register buffered_samples"),

            model_trained_at_seconds: register_int_gauge!(
                "hostwatch_model_trained_at_seconds",
                "Unix timestamp of the last successful model fit"
            )
            .expect("Failed to register model_trained_at_seconds"),
        }
    }
}

/// Cheap cloneable handle to the global metrics instance
#[derive(Clone)]
pub struct EngineMetrics {
    _private: (),
}

impl Default for EngineMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl EngineMetrics {
    pub fn new() -> Self {
        GLOBAL_METRICS.get_or_init(EngineMetricsInner::new);
        Self { _private: () }
    }

    fn inner(&self) -> &EngineMetricsInner {
        GLOBAL_METRICS.get().expect("Metrics not initialized")
    }

    pub fn observe_tick_latency(&self, duration_secs: f64) {
        self.inner().tick_latency_seconds.observe(duration_secs);
    }

    pub fn observe_fit_latency(&self, duration_secs: f64) {
        self.inner().fit_latency_seconds.observe(duration_secs);
    }

    pub fn inc_samples_collected(&self) {
        self.inner().samples_collected.inc();
    }

    pub fn inc_anomalies_reported(&self) {
        self.inner().anomalies_reported.inc();
    }

    pub fn inc_subscriber_dropped_events(&self) {
        self.inner().subscriber_dropped_events.inc();
    }

    pub fn inc_persist_failures(&self) {
        self.inner().persist_failures.inc();
    }

    pub fn set_buffered_samples(&self, count: i64) {
        self.inner().buffered_samples.set(count);
    }

    pub fn set_model_trained_at(&self, unix_seconds: i64) {
        self.inner().model_trained_at_seconds.set(unix_seconds);
    }
}

/// Consistent structured logging for engine lifecycle events
#[derive(Clone)]
pub struct EngineLogger {
    host: String,
}

impl EngineLogger {
    pub fn new(host: impl Into<String>) -> Self {
        Self { host: host.into() }
    }

    pub fn log_startup(&self, version: &str, replay: bool) {
        info!(
            event = "engine_started",
            host = %self.host,
            version = %version,
            replay = replay,
            "Telemetry engine started"
        );
    }

    pub fn log_shutdown(&self, reason: &str) {
        info!(
            event = "engine_shutdown",
            host = %self.host,
            reason = %reason,
            "Telemetry engine shutting down"
        );
    }

    pub fn log_state_change(&self, state: EngineState) {
        info!(
            event = "state_change",
            host = %self.host,
            state = %state,
            "Engine state changed"
        );
    }

    pub fn log_anomaly(&self, record: &AnomalyRecord) {
        warn!(
            event = "anomaly_reported",
            host = %self.host,
            severity = %record.severity,
            raw_score = record.raw_score,
            reasons = ?record.reasons,
            cpu_percent = record.sample.cpu_percent,
            memory_percent = record.sample.memory_percent,
            disk_read_mb_per_s = record.sample.disk_read_mb_per_s,
            disk_write_mb_per_s = record.sample.disk_write_mb_per_s,
            network_sent_mb_per_s = record.sample.network_sent_mb_per_s,
            network_recv_mb_per_s = record.sample.network_recv_mb_per_s,
            "Anomaly reported"
        );
    }

    pub fn log_model_fit(&self, training_samples: usize, elapsed_secs: f64, retrain: bool) {
        info!(
            event = "model_fit",
            host = %self.host,
            training_samples = training_samples,
            elapsed_secs = elapsed_secs,
            retrain = retrain,
            "Model fit completed"
        );
    }

    pub fn log_fit_failure(&self, error: &str) {
        warn!(
            event = "model_fit_failed",
            host = %self.host,
            error = %error,
            "Model fit failed, keeping previous model"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_handle() {
        let metrics = EngineMetrics::new();
        metrics.observe_tick_latency(0.001);
        metrics.observe_fit_latency(0.1);
        metrics.inc_samples_collected();
        metrics.inc_anomalies_reported();
        metrics.inc_subscriber_dropped_events();
        metrics.inc_persist_failures();
        metrics.set_buffered_samples(42);
        metrics.set_model_trained_at(1_700_000_000);
    }

    #[test]
    fn test_logger_clones() {
        let logger = EngineLogger::new("test-host");
        let clone = logger.clone();
        assert_eq!(clone.host, "test-host");
    }
}
