//! Engine configuration
//!
//! All fields carry defaults so an empty configuration source yields a
//! working engine. `validate` is called before any sampling starts and
//! refuses impossible values.

use anyhow::{bail, Result};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Multiplier applied to the minimum training window when selecting the
/// retrain window, so the model drifts with recent behavior.
pub const RETRAIN_WINDOW_FACTOR: usize = 4;

/// Engine configuration
#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    /// Expected anomaly fraction the model is fitted with, in (0, 0.5]
    #[serde(default = "default_contamination")]
    pub contamination: f64,

    /// Steady-state training window duration in seconds
    #[serde(default = "default_window_size")]
    pub window_size_seconds: u64,

    /// Baseline duration before the first fit is attempted
    #[serde(default = "default_training_window")]
    pub training_window_seconds: u64,

    /// Minimum time between fits once the model is ready
    #[serde(default = "default_retrain_interval")]
    pub retrain_interval_seconds: u64,

    /// Lower bound on samples needed to fit; defaults to one training
    /// window at the configured sample period
    #[serde(default)]
    pub min_training_samples: Option<usize>,

    /// Sampling period in seconds
    #[serde(default = "default_sample_period")]
    pub sample_period_seconds: f64,

    /// Capacity of the rolling sample buffer
    #[serde(default = "default_samples_buffer")]
    pub samples_buffer_size: usize,

    /// Capacity of the rolling anomaly buffer
    #[serde(default = "default_anomalies_buffer")]
    pub anomalies_buffer_size: usize,

    /// Append-only CSV log of every sample
    #[serde(default = "default_samples_log_path")]
    pub samples_log_path: PathBuf,

    /// Append-only JSON Lines log of reported anomalies
    #[serde(default = "default_anomalies_log_path")]
    pub anomalies_log_path: PathBuf,

    /// Historical CSV to replay instead of sampling live
    #[serde(default)]
    pub replay_input_path: Option<PathBuf>,

    /// Per-row analysis report written during replay
    #[serde(default)]
    pub replay_output_path: Option<PathBuf>,

    /// Deadline for graceful shutdown before outstanding work is dropped
    #[serde(default = "default_shutdown_deadline")]
    pub shutdown_deadline_seconds: u64,

    /// Consecutive persistence failures tolerated before the engine
    /// transitions to the error state
    #[serde(default = "default_max_persist_failures")]
    pub max_persist_failures: u32,

    /// Seed for the detector's random tree construction
    #[serde(default = "default_model_seed")]
    pub model_seed: u64,
}

fn default_contamination() -> f64 {
    0.05
}

fn default_window_size() -> u64 {
    120
}

fn default_training_window() -> u64 {
    60
}

fn default_retrain_interval() -> u64 {
    300
}

fn default_sample_period() -> f64 {
    1.0
}

fn default_samples_buffer() -> usize {
    1000
}

fn default_anomalies_buffer() -> usize {
    100
}

fn default_samples_log_path() -> PathBuf {
    PathBuf::from("./logs/metrics_history.csv")
}

fn default_anomalies_log_path() -> PathBuf {
    PathBuf::from("./logs/anomalies.jsonl")
}

fn default_shutdown_deadline() -> u64 {
    5
}

fn default_max_persist_failures() -> u32 {
    10
}

fn default_model_seed() -> u64 {
    42
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            contamination: default_contamination(),
            window_size_seconds: default_window_size(),
            training_window_seconds: default_training_window(),
            retrain_interval_seconds: default_retrain_interval(),
            min_training_samples: None,
            sample_period_seconds: default_sample_period(),
            samples_buffer_size: default_samples_buffer(),
            anomalies_buffer_size: default_anomalies_buffer(),
            samples_log_path: default_samples_log_path(),
            anomalies_log_path: default_anomalies_log_path(),
            replay_input_path: None,
            replay_output_path: None,
            shutdown_deadline_seconds: default_shutdown_deadline(),
            max_persist_failures: default_max_persist_failures(),
            model_seed: default_model_seed(),
        }
    }
}

impl EngineConfig {
    /// Refuse invalid configuration before any sampling begins
    pub fn validate(&self) -> Result<()> {
        if !(self.contamination > 0.0 && self.contamination <= 0.5) {
            bail!(
                "contamination must be in (0, 0.5], got {}",
                self.contamination
            );
        }
        if !(self.sample_period_seconds > 0.0 && self.sample_period_seconds.is_finite()) {
            bail!(
                "sample_period_seconds must be positive, got {}",
                self.sample_period_seconds
            );
        }
        if self.training_window_seconds == 0 {
            bail!("training_window_seconds must be positive");
        }
        if self.window_size_seconds == 0 {
            bail!("window_size_seconds must be positive");
        }
        if self.samples_buffer_size == 0 || self.anomalies_buffer_size == 0 {
            bail!("buffer sizes must be positive");
        }
        if self.min_training_samples == Some(0) {
            bail!("min_training_samples must be positive");
        }
        if self.replay_output_path.is_some() && self.replay_input_path.is_none() {
            bail!("replay_output_path requires replay_input_path");
        }
        Ok(())
    }

    /// Sampling period as a duration
    pub fn sample_period(&self) -> Duration {
        Duration::from_secs_f64(self.sample_period_seconds)
    }

    /// Samples required before the first fit: one training window at the
    /// configured period unless overridden
    pub fn min_training_samples(&self) -> usize {
        self.min_training_samples.unwrap_or_else(|| {
            let per_window = self.training_window_seconds as f64 / self.sample_period_seconds;
            (per_window.round() as usize).max(2)
        })
    }

    /// Number of recent samples a retrain fits on, capped by the buffer
    pub fn retrain_window_samples(&self) -> usize {
        let window = (self.window_size_seconds as f64 / self.sample_period_seconds).round() as usize;
        (self.min_training_samples() * RETRAIN_WINDOW_FACTOR)
            .max(window)
            .min(self.samples_buffer_size)
    }

    /// Graceful shutdown deadline
    pub fn shutdown_deadline(&self) -> Duration {
        Duration::from_secs(self.shutdown_deadline_seconds)
    }
}
