//! Anomaly detector lifecycle
//!
//! Holds the current trained model behind a lock that is taken only for
//! the pointer clone, decides when the first fit is due and when a
//! retrain should be scheduled. Fits are heavy and run off the hot
//! path; a successful fit swaps the model atomically while the previous
//! model keeps serving scores.

mod forest;

pub use forest::{FeatureRow, IsolationForest, MAX_SUBSAMPLE, TREE_COUNT};

use crate::models::MetricSample;
use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

/// Scoring outcome for a single sample
#[derive(Debug, Clone, Copy)]
pub struct Verdict {
    pub is_anomaly: bool,
    pub raw_score: f64,
}

/// Model produced by one successful fit
pub struct TrainedModel {
    forest: IsolationForest,
    pub trained_at: DateTime<Utc>,
    pub sample_count_at_fit: usize,
}

impl TrainedModel {
    /// Score one sample; deterministic for a given model
    pub fn score(&self, sample: &MetricSample) -> Verdict {
        let raw_score = self.forest.decision_score(&sample.features());
        Verdict {
            is_anomaly: raw_score < 0.0,
            raw_score,
        }
    }
}

/// Detector state machine: cold until the baseline window fills, ready
/// once a fit succeeds, periodically retrained on recent samples
pub struct Detector {
    contamination: f64,
    seed: u64,
    min_training_samples: usize,
    retrain_interval: Duration,
    model: RwLock<Option<Arc<TrainedModel>>>,
    fit_in_progress: AtomicBool,
}

impl Detector {
    pub fn new(
        contamination: f64,
        seed: u64,
        min_training_samples: usize,
        retrain_interval_seconds: u64,
    ) -> Self {
        Self {
            contamination,
            seed,
            min_training_samples,
            retrain_interval: Duration::seconds(retrain_interval_seconds as i64),
            model: RwLock::new(None),
            fit_in_progress: AtomicBool::new(false),
        }
    }

    /// True once a model exists
    pub fn is_ready(&self) -> bool {
        self.model.read().unwrap().is_some()
    }

    /// Clone of the current model pointer; no lock is held across the
    /// model's own scoring work
    pub fn current_model(&self) -> Option<Arc<TrainedModel>> {
        self.model.read().unwrap().clone()
    }

    /// Score a sample against the current model, if any
    pub fn score(&self, sample: &MetricSample) -> Option<Verdict> {
        self.current_model().map(|model| model.score(sample))
    }

    /// True when the baseline window has filled and no model exists yet
    pub fn needs_initial_fit(&self, sample_count: u64) -> bool {
        !self.is_ready()
            && !self.fit_in_progress.load(Ordering::SeqCst)
            && sample_count >= self.min_training_samples as u64
    }

    /// True when the current model is stale enough to retrain and the
    /// store holds enough samples to fit on
    pub fn should_retrain(&self, now: DateTime<Utc>, available_samples: u64) -> bool {
        if self.fit_in_progress.load(Ordering::SeqCst) {
            return false;
        }
        if available_samples < self.min_training_samples as u64 {
            return false;
        }
        match self.current_model() {
            Some(model) => now - model.trained_at > self.retrain_interval,
            None => false,
        }
    }

    /// Claim the single in-flight fit slot; returns false if a fit is
    /// already running
    pub fn begin_fit(&self) -> bool {
        !self.fit_in_progress.swap(true, Ordering::SeqCst)
    }

    /// Release the fit slot
    pub fn finish_fit(&self) {
        self.fit_in_progress.store(false, Ordering::SeqCst);
    }

    /// Fit a new model on a training window and install it.
    ///
    /// On failure the previous model (or cold state) is retained and the
    /// error is returned for the caller to log.
    pub fn fit(&self, samples: &[MetricSample], now: DateTime<Utc>) -> Result<Arc<TrainedModel>> {
        let rows: Vec<FeatureRow> = samples.iter().map(|s| s.features()).collect();
        let forest = IsolationForest::fit(&rows, self.contamination, self.seed)?;

        let model = Arc::new(TrainedModel {
            forest,
            trained_at: now,
            sample_count_at_fit: samples.len(),
        });
        *self.model.write().unwrap() = Some(model.clone());
        Ok(model)
    }

    pub fn trained_at(&self) -> Option<DateTime<Utc>> {
        self.current_model().map(|m| m.trained_at)
    }

    pub fn model_training_samples(&self) -> Option<usize> {
        self.current_model().map(|m| m.sample_count_at_fit)
    }

    pub fn min_training_samples(&self) -> usize {
        self.min_training_samples
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn baseline_samples(count: usize) -> Vec<MetricSample> {
        let base = Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap();
        (0..count)
            .map(|i| {
                let jitter = (i % 10) as f64 * 0.05;
                MetricSample {
                    timestamp: base + Duration::seconds(i as i64),
                    cpu_percent: 10.0 + jitter,
                    cpu_frequency_mhz: 2400.0,
                    memory_percent: 20.0 + jitter,
                    memory_available_gb: 12.0,
                    disk_read_mb_per_s: 0.5 + jitter * 0.1,
                    disk_write_mb_per_s: 0.5 + jitter * 0.1,
                    network_sent_mb_per_s: 0.5 + jitter * 0.1,
                    network_recv_mb_per_s: 0.5 + jitter * 0.1,
                }
            })
            .collect()
    }

    fn spike_sample() -> MetricSample {
        MetricSample {
            cpu_percent: 99.0,
            memory_percent: 95.0,
            disk_read_mb_per_s: 200.0,
            disk_write_mb_per_s: 150.0,
            network_sent_mb_per_s: 200.0,
            network_recv_mb_per_s: 180.0,
            ..baseline_samples(1)[0].clone()
        }
    }

    #[test]
    fn test_cold_until_first_fit() {
        let detector = Detector::new(0.05, 42, 60, 300);
        assert!(!detector.is_ready());
        assert!(detector.score(&spike_sample()).is_none());
        assert!(detector.trained_at().is_none());

        assert!(!detector.needs_initial_fit(59));
        assert!(detector.needs_initial_fit(60));
    }

    #[test]
    fn test_fit_transitions_to_ready() {
        let detector = Detector::new(0.05, 42, 60, 300);
        let samples = baseline_samples(120);
        let now = samples.last().unwrap().timestamp;

        detector.fit(&samples, now).unwrap();
        assert!(detector.is_ready());
        assert_eq!(detector.trained_at(), Some(now));
        assert_eq!(detector.model_training_samples(), Some(120));
        assert!(!detector.needs_initial_fit(1000));
    }

    #[test]
    fn test_spike_flagged_after_fit() {
        let detector = Detector::new(0.05, 42, 60, 300);
        let samples = baseline_samples(120);
        detector
            .fit(&samples, samples.last().unwrap().timestamp)
            .unwrap();

        let verdict = detector.score(&spike_sample()).unwrap();
        assert!(verdict.is_anomaly);
        assert!(verdict.raw_score < -0.5);

        // Property: identical sample, identical model, identical result
        let again = detector.score(&spike_sample()).unwrap();
        assert_eq!(verdict.raw_score, again.raw_score);
    }

    #[test]
    fn test_failed_fit_retains_previous_model() {
        let detector = Detector::new(0.05, 42, 60, 300);
        let samples = baseline_samples(120);
        let first_at = samples.last().unwrap().timestamp;
        detector.fit(&samples, first_at).unwrap();

        // All-constant window is a degenerate fit
        let constant: Vec<MetricSample> = (0..120)
            .map(|i| MetricSample {
                timestamp: first_at + Duration::seconds(i + 1),
                cpu_percent: 5.0,
                cpu_frequency_mhz: 2400.0,
                memory_percent: 5.0,
                memory_available_gb: 12.0,
                disk_read_mb_per_s: 0.0,
                disk_write_mb_per_s: 0.0,
                network_sent_mb_per_s: 0.0,
                network_recv_mb_per_s: 0.0,
            })
            .collect();

        let result = detector.fit(&constant, first_at + Duration::seconds(600));
        assert!(result.is_err());
        assert_eq!(detector.trained_at(), Some(first_at));
    }

    #[test]
    fn test_retrain_policy() {
        let detector = Detector::new(0.05, 42, 60, 300);
        let samples = baseline_samples(120);
        let fit_at = samples.last().unwrap().timestamp;
        detector.fit(&samples, fit_at).unwrap();

        // Too soon
        assert!(!detector.should_retrain(fit_at + Duration::seconds(60), 1000));
        // Stale but not enough samples
        assert!(!detector.should_retrain(fit_at + Duration::seconds(301), 10));
        // Stale with enough samples
        assert!(detector.should_retrain(fit_at + Duration::seconds(301), 1000));
    }

    #[test]
    fn test_fit_slot_is_exclusive() {
        let detector = Detector::new(0.05, 42, 60, 300);
        assert!(detector.begin_fit());
        assert!(!detector.begin_fit());
        assert!(!detector.needs_initial_fit(1000));

        detector.finish_fit();
        assert!(detector.begin_fit());
    }

    #[test]
    fn test_retrain_advances_trained_at() {
        let detector = Detector::new(0.05, 42, 60, 300);
        let samples = baseline_samples(120);
        let first_at = samples.last().unwrap().timestamp;
        detector.fit(&samples, first_at).unwrap();

        let later = first_at + Duration::seconds(400);
        detector.fit(&samples[60..], later).unwrap();
        assert_eq!(detector.trained_at(), Some(later));
        assert_eq!(detector.model_training_samples(), Some(60));
    }
}
