//! Engine lifecycle and task wiring
//!
//! The engine owns every component explicitly; dropping it tears the
//! whole pipeline down. Two long-lived tasks cooperate:
//!
//! - the sampling loop: sample, derive, store, score, classify, then
//!   hand the tick to the output task through a bounded channel
//! - the output task: append to the samples log, broadcast the sample
//!   event, append any reported anomaly, broadcast the anomaly event
//!
//! Model fits run in their own short-lived task so the sampling loop
//! never waits on them; during replay they run inline so a table always
//! produces the same verdicts.

use crate::bus::{EventBus, Subscription};
use crate::classifier;
use crate::config::EngineConfig;
use crate::detector::Detector;
use crate::models::{
    AnomalyRecord, EngineEvent, EngineSnapshot, EngineState, EngineStats, MetricSample, Severity,
    SeverityCounts,
};
use crate::observability::{EngineLogger, EngineMetrics};
use crate::persist::{AnomaliesLog, SamplesLog};
use crate::sampler::{ReplaySource, SampleSource, SystemSampler};
use crate::store::RollingStore;
use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Instant;
use tokio::sync::{broadcast, mpsc, watch};
use tracing::{error, info, warn};

/// Capacity of the channel between the sampling loop and the output
/// task; a full channel drops the write rather than stalling the loop
const OUTPUT_CHANNEL_CAPACITY: usize = 1024;

const ENGINE_VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Default)]
struct SeverityCounters {
    critical: AtomicU64,
    high: AtomicU64,
    medium: AtomicU64,
    normal: AtomicU64,
}

impl SeverityCounters {
    fn record(&self, severity: Severity) {
        match severity {
            Severity::Critical => self.critical.fetch_add(1, Ordering::Relaxed),
            Severity::High => self.high.fetch_add(1, Ordering::Relaxed),
            Severity::Medium => self.medium.fetch_add(1, Ordering::Relaxed),
            Severity::Normal => self.normal.fetch_add(1, Ordering::Relaxed),
        };
    }

    fn snapshot(&self) -> SeverityCounts {
        SeverityCounts {
            critical: self.critical.load(Ordering::Relaxed),
            high: self.high.load(Ordering::Relaxed),
            medium: self.medium.load(Ordering::Relaxed),
            normal: self.normal.load(Ordering::Relaxed),
        }
    }
}

struct EngineCore {
    config: EngineConfig,
    store: RollingStore,
    detector: Detector,
    bus: EventBus,
    state: RwLock<EngineState>,
    started_at: DateTime<Utc>,
    severity_counters: SeverityCounters,
    metrics: EngineMetrics,
    logger: EngineLogger,
    shutdown_tx: broadcast::Sender<()>,
    /// true whenever no pipeline is running; flips back on completion
    done_tx: watch::Sender<bool>,
}

impl EngineCore {
    fn state(&self) -> EngineState {
        *self.state.read().unwrap()
    }

    fn set_state(&self, state: EngineState) {
        {
            let mut current = self.state.write().unwrap();
            if *current == state {
                return;
            }
            *current = state;
        }
        self.logger.log_state_change(state);
        self.bus.publish(&EngineEvent::StateUpdate { state });
    }

    fn mark_done(&self) {
        self.done_tx.send_replace(true);
    }
}

/// One tick's result handed from the sampling loop to the output task
struct TickOutput {
    sample: MetricSample,
    is_anomaly: bool,
    raw_score: Option<f64>,
    record: Option<AnomalyRecord>,
}

/// The detection engine: sampling, model lifecycle, classification,
/// persistence and live fan-out behind one owned value
pub struct Engine {
    core: Arc<EngineCore>,
    started: AtomicBool,
}

impl Engine {
    /// Build an engine from validated configuration
    pub fn new(config: EngineConfig) -> Result<Self> {
        config.validate()?;

        let detector = Detector::new(
            config.contamination,
            config.model_seed,
            config.min_training_samples(),
            config.retrain_interval_seconds,
        );
        let store = RollingStore::new(config.samples_buffer_size, config.anomalies_buffer_size);
        let host = sysinfo::System::host_name().unwrap_or_else(|| "unknown".to_string());
        let (shutdown_tx, _) = broadcast::channel(4);
        let (done_tx, _) = watch::channel(true);

        Ok(Self {
            core: Arc::new(EngineCore {
                config,
                store,
                detector,
                bus: EventBus::default(),
                state: RwLock::new(EngineState::Cold),
                started_at: Utc::now(),
                severity_counters: SeverityCounters::default(),
                metrics: EngineMetrics::new(),
                logger: EngineLogger::new(host),
                shutdown_tx,
                done_tx,
            }),
            started: AtomicBool::new(false),
        })
    }

    /// Spawn the sampling and output tasks.
    ///
    /// With `replay_input_path` configured the engine drives the replay
    /// table through the identical pipeline and finishes when the table
    /// is exhausted; otherwise it samples live OS counters until
    /// shutdown.
    pub fn start(&self) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            bail!("engine already started");
        }
        let core = self.core.clone();

        let samples_log = SamplesLog::open(&core.config.samples_log_path)
            .context("Failed to open samples log")?;
        let anomalies_log = AnomaliesLog::open(&core.config.anomalies_log_path)
            .context("Failed to open anomalies log")?;

        let (source, replay_report, replay): (Box<dyn SampleSource>, Option<SamplesLog>, bool) =
            match &core.config.replay_input_path {
                Some(input) => {
                    let source = ReplaySource::from_path(input, core.config.sample_period())?;
                    info!(
                        rows = source.len(),
                        input = %input.display(),
                        "Replaying historical table"
                    );
                    let report = core
                        .config
                        .replay_output_path
                        .as_ref()
                        .map(SamplesLog::open)
                        .transpose()
                        .context("Failed to open replay report")?;
                    (Box::new(source), report, true)
                }
                None => (
                    Box::new(SystemSampler::new(core.config.sample_period())),
                    None,
                    false,
                ),
            };

        core.done_tx.send_replace(false);
        core.logger.log_startup(ENGINE_VERSION, replay);

        let (output_tx, output_rx) = mpsc::channel(OUTPUT_CHANNEL_CAPACITY);
        let shutdown_rx = core.shutdown_tx.subscribe();

        tokio::spawn(output_loop(
            core.clone(),
            output_rx,
            samples_log,
            anomalies_log,
            replay_report,
        ));
        tokio::spawn(sampling_loop(core, source, output_tx, shutdown_rx, replay));
        Ok(())
    }

    /// Register a live subscriber with the default queue capacity
    pub fn subscribe(&self) -> Subscription {
        self.core.bus.subscribe()
    }

    /// Register a live subscriber with an explicit queue capacity
    pub fn subscribe_with_capacity(&self, capacity: usize) -> Subscription {
        self.core.bus.subscribe_with_capacity(capacity)
    }

    pub fn state(&self) -> EngineState {
        self.core.state()
    }

    /// Current statistics
    pub fn stats(&self) -> EngineStats {
        let core = &self.core;
        EngineStats {
            state: core.state(),
            sample_count: core.store.sample_count(),
            anomaly_count: core.store.anomaly_count(),
            uptime_seconds: (Utc::now() - core.started_at).num_seconds().max(0) as u64,
            trained_at: core.detector.trained_at(),
            model_training_samples: core.detector.model_training_samples(),
            severity_counts: core.severity_counters.snapshot(),
        }
    }

    /// Point-in-time view for a newly connected client; `samples` and
    /// `anomalies` are capped by the configured buffer sizes
    pub fn snapshot(&self, samples: usize, anomalies: usize) -> EngineSnapshot {
        let core = &self.core;
        EngineSnapshot {
            samples: core
                .store
                .recent_samples(samples.min(core.config.samples_buffer_size)),
            anomalies: core
                .store
                .recent_anomalies(anomalies.min(core.config.anomalies_buffer_size)),
            stats: self.stats(),
        }
    }

    /// Wait until the pipeline has finished (replay exhausted, fatal
    /// failure, or shutdown) and return the final state
    pub async fn wait(&self) -> EngineState {
        self.wait_done().await;
        self.state()
    }

    /// Signal shutdown and wait for the pipeline to flush, bounded by
    /// the configured deadline
    pub async fn shutdown(&self) {
        self.core.logger.log_shutdown("shutdown requested");
        let _ = self.core.shutdown_tx.send(());

        let deadline = self.core.config.shutdown_deadline();
        if tokio::time::timeout(deadline, self.wait_done()).await.is_err() {
            warn!(
                deadline_secs = deadline.as_secs(),
                "Shutdown deadline exceeded, dropping outstanding work"
            );
        }
    }

    async fn wait_done(&self) {
        let mut done_rx = self.core.done_tx.subscribe();
        // wait_for checks the current value first, so completion between
        // subscribing and awaiting is never missed
        let _ = done_rx.wait_for(|done| *done).await;
    }
}

async fn sampling_loop(
    core: Arc<EngineCore>,
    mut source: Box<dyn SampleSource>,
    output_tx: mpsc::Sender<TickOutput>,
    mut shutdown_rx: broadcast::Receiver<()>,
    replay: bool,
) {
    info!(
        period_secs = core.config.sample_period_seconds,
        replay = replay,
        "Starting sampling loop"
    );

    loop {
        if core.state() == EngineState::Error {
            break;
        }
        tokio::select! {
            next = source.next_sample() => match next {
                Ok(Some(sample)) => {
                    let now = if replay { sample.timestamp } else { Utc::now() };
                    process_sample(&core, sample, &output_tx);
                    maybe_fit(&core, now, replay);
                }
                Ok(None) => {
                    info!("Sample source exhausted");
                    break;
                }
                Err(e) => {
                    error!(error = %e, "Fatal sampler failure");
                    core.set_state(EngineState::Error);
                    break;
                }
            },
            _ = shutdown_rx.recv() => {
                info!("Shutting down sampling loop");
                break;
            }
        }
    }
    // Dropping the sender lets the output task drain and finalize
}

/// One pass of the hot path: store, score, classify, hand off
fn process_sample(core: &Arc<EngineCore>, sample: MetricSample, output_tx: &mpsc::Sender<TickOutput>) {
    let tick_start = Instant::now();

    core.store.append_sample(sample.clone());
    core.metrics.inc_samples_collected();
    core.metrics
        .set_buffered_samples(core.store.buffered_samples() as i64);

    let mut is_anomaly = false;
    let mut raw_score = None;
    let mut record = None;

    if let Some(verdict) = core.detector.score(&sample) {
        is_anomaly = verdict.is_anomaly;
        raw_score = Some(verdict.raw_score);

        let (severity, reported) = classifier::classify(&sample, verdict.raw_score);
        core.severity_counters.record(severity);

        if let Some(reported) = reported {
            core.store.append_anomaly(reported.clone());
            core.metrics.inc_anomalies_reported();
            core.logger.log_anomaly(&reported);
            record = Some(reported);
        }
    }

    let output = TickOutput {
        sample,
        is_anomaly,
        raw_score,
        record,
    };
    if output_tx.try_send(output).is_err() {
        warn!("Output channel full, dropping sample write");
    }

    core.metrics
        .observe_tick_latency(tick_start.elapsed().as_secs_f64());
}

/// Schedule the initial fit or a retrain when due. Live fits run in
/// their own task; replay fits run inline for reproducible verdicts.
fn maybe_fit(core: &Arc<EngineCore>, now: DateTime<Utc>, inline: bool) {
    let sample_count = core.store.sample_count();
    let initial = core.detector.needs_initial_fit(sample_count);
    if !initial && !core.detector.should_retrain(now, sample_count) {
        return;
    }
    if !core.detector.begin_fit() {
        return;
    }

    let window = if initial {
        // First fit uses the full current buffer
        core.config.samples_buffer_size
    } else {
        core.config.retrain_window_samples()
    };
    let samples = core.store.recent_samples(window);

    if initial {
        core.set_state(EngineState::Training);
    }

    if inline {
        run_fit(core, &samples, now, initial);
    } else {
        let core = core.clone();
        tokio::spawn(async move {
            run_fit(&core, &samples, now, initial);
        });
    }
}

fn run_fit(core: &Arc<EngineCore>, samples: &[MetricSample], now: DateTime<Utc>, initial: bool) {
    let fit_start = Instant::now();
    let result = core.detector.fit(samples, now);
    let elapsed = fit_start.elapsed().as_secs_f64();
    core.metrics.observe_fit_latency(elapsed);

    match result {
        Ok(model) => {
            core.metrics.set_model_trained_at(model.trained_at.timestamp());
            core.logger
                .log_model_fit(model.sample_count_at_fit, elapsed, !initial);
            if initial {
                core.set_state(EngineState::Ready);
            }

            let soft_deadline = core.config.retrain_interval_seconds as f64 / 2.0;
            if elapsed > soft_deadline {
                warn!(
                    elapsed_secs = elapsed,
                    soft_deadline_secs = soft_deadline,
                    "Model fit exceeded its soft deadline"
                );
            }
        }
        Err(e) => {
            core.logger.log_fit_failure(&e.to_string());
            if initial {
                core.set_state(EngineState::Cold);
            }
        }
    }
    core.detector.finish_fit();
}

async fn output_loop(
    core: Arc<EngineCore>,
    mut output_rx: mpsc::Receiver<TickOutput>,
    mut samples_log: SamplesLog,
    mut anomalies_log: AnomaliesLog,
    mut replay_report: Option<SamplesLog>,
) {
    let mut consecutive_failures: u32 = 0;

    while let Some(output) = output_rx.recv().await {
        let mut failed = false;

        // The log write always precedes the matching broadcast, so a
        // client that reads the file and then subscribes misses nothing
        if let Err(e) = samples_log.append(&output.sample, output.is_anomaly, output.raw_score) {
            core.metrics.inc_persist_failures();
            error!(error = %e, "Failed to persist sample row");
            failed = true;
        }
        if let Some(report) = replay_report.as_mut() {
            if let Err(e) = report.append(&output.sample, output.is_anomaly, output.raw_score) {
                core.metrics.inc_persist_failures();
                error!(error = %e, "Failed to write replay report row");
                failed = true;
            }
        }

        core.bus.publish(&EngineEvent::SampleUpdate {
            sample: output.sample,
            is_anomaly: output.is_anomaly,
            raw_score: output.raw_score,
        });

        if let Some(record) = output.record {
            if let Err(e) = anomalies_log.append(&record) {
                core.metrics.inc_persist_failures();
                error!(error = %e, "Failed to persist anomaly record");
                failed = true;
            }
            core.bus.publish(&EngineEvent::AnomalyReport { record });
        }

        if failed {
            consecutive_failures += 1;
            if consecutive_failures >= core.config.max_persist_failures {
                error!(
                    failures = consecutive_failures,
                    "Persistence failing persistently, halting the engine"
                );
                core.set_state(EngineState::Error);
            }
        } else {
            consecutive_failures = 0;
        }
    }

    if let Err(e) = samples_log.flush() {
        error!(error = %e, "Failed to flush samples log on shutdown");
    }
    if let Some(report) = replay_report.as_mut() {
        if let Err(e) = report.flush() {
            error!(error = %e, "Failed to flush replay report on shutdown");
        }
    }

    if core.state() != EngineState::Error {
        core.set_state(EngineState::Stopped);
    }
    core.mark_done();
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config(dir: &std::path::Path) -> EngineConfig {
        EngineConfig {
            samples_log_path: dir.join("metrics_history.csv"),
            anomalies_log_path: dir.join("anomalies.jsonl"),
            ..EngineConfig::default()
        }
    }

    #[test]
    fn test_new_rejects_invalid_config() {
        let mut config = EngineConfig::default();
        config.contamination = 0.9;
        assert!(Engine::new(config).is_err());
    }

    #[tokio::test]
    async fn test_fresh_engine_is_cold_and_empty() {
        let dir = tempfile::tempdir().unwrap();
        let engine = Engine::new(test_config(dir.path())).unwrap();

        assert_eq!(engine.state(), EngineState::Cold);

        let stats = engine.stats();
        assert_eq!(stats.sample_count, 0);
        assert_eq!(stats.anomaly_count, 0);
        assert!(stats.trained_at.is_none());

        let snapshot = engine.snapshot(100, 100);
        assert!(snapshot.samples.is_empty());
        assert!(snapshot.anomalies.is_empty());
    }

    #[tokio::test]
    async fn test_snapshot_caps_at_buffer_sizes() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(dir.path());
        config.samples_buffer_size = 10;
        config.anomalies_buffer_size = 5;
        let engine = Engine::new(config).unwrap();

        // Asking for more than the buffers hold is capped, not an error
        let snapshot = engine.snapshot(usize::MAX, usize::MAX);
        assert!(snapshot.samples.is_empty());
        assert!(snapshot.anomalies.is_empty());
    }

    #[tokio::test]
    async fn test_double_start_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(dir.path());
        config.replay_input_path = Some(write_replay(dir.path(), 3));
        let engine = Engine::new(config).unwrap();

        engine.start().unwrap();
        assert!(engine.start().is_err());
        engine.wait().await;
    }

    #[tokio::test]
    async fn test_shutdown_without_start_returns_immediately() {
        let dir = tempfile::tempdir().unwrap();
        let engine = Engine::new(test_config(dir.path())).unwrap();
        engine.shutdown().await;
        assert_eq!(engine.state(), EngineState::Cold);
    }

    fn write_replay(dir: &std::path::Path, rows: usize) -> std::path::PathBuf {
        let path = dir.join("replay.csv");
        let mut content = String::from("cpu_percent,memory_percent\n");
        for i in 0..rows {
            content.push_str(&format!("{},{}\n", 10 + i % 5, 20 + i % 5));
        }
        std::fs::write(&path, content).unwrap();
        path
    }
}
