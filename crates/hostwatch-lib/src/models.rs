//! Core data models for the telemetry engine

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Number of features fed to the detector
pub const FEATURE_COUNT: usize = 7;

/// One snapshot of host counters at a single tick
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricSample {
    pub timestamp: DateTime<Utc>,
    pub cpu_percent: f64,
    pub cpu_frequency_mhz: f64,
    pub memory_percent: f64,
    pub memory_available_gb: f64,
    pub disk_read_mb_per_s: f64,
    pub disk_write_mb_per_s: f64,
    pub network_sent_mb_per_s: f64,
    pub network_recv_mb_per_s: f64,
}

impl MetricSample {
    /// Feature vector for model fit and score, in the fixed order the
    /// detector was calibrated for; `memory_available_gb` stays out of
    /// the vector.
    pub fn features(&self) -> [f64; FEATURE_COUNT] {
        [
            self.cpu_percent,
            self.memory_percent,
            self.disk_read_mb_per_s,
            self.disk_write_mb_per_s,
            self.network_sent_mb_per_s,
            self.network_recv_mb_per_s,
            self.cpu_frequency_mhz,
        ]
    }

    /// Returns true if every numeric field is finite
    pub fn is_finite(&self) -> bool {
        self.features().iter().all(|v| v.is_finite()) && self.memory_available_gb.is_finite()
    }
}

/// Severity band assigned to a scored sample
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Critical,
    High,
    Medium,
    Normal,
}

impl Severity {
    /// Only critical and high anomalies are persisted and broadcast
    pub fn is_reportable(&self) -> bool {
        matches!(self, Severity::Critical | Severity::High)
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Severity::Critical => write!(f, "critical"),
            Severity::High => write!(f, "high"),
            Severity::Medium => write!(f, "medium"),
            Severity::Normal => write!(f, "normal"),
        }
    }
}

/// A reported anomaly: the originating sample plus the detector verdict
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnomalyRecord {
    pub timestamp: DateTime<Utc>,
    pub raw_score: f64,
    pub severity: Severity,
    pub reasons: Vec<String>,
    pub sample: MetricSample,
}

/// Lifecycle state of the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineState {
    /// Collecting the baseline window, no model yet
    Cold,
    /// Initial fit in progress
    Training,
    /// Model available, scoring every tick
    Ready,
    /// Fatal failure, pipeline halted
    Error,
    /// Graceful shutdown completed
    Stopped,
}

impl std::fmt::Display for EngineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineState::Cold => write!(f, "cold"),
            EngineState::Training => write!(f, "training"),
            EngineState::Ready => write!(f, "ready"),
            EngineState::Error => write!(f, "error"),
            EngineState::Stopped => write!(f, "stopped"),
        }
    }
}

/// Event delivered to live subscribers
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    /// Emitted for every sample once it has been persisted
    SampleUpdate {
        sample: MetricSample,
        is_anomaly: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        raw_score: Option<f64>,
    },
    /// Emitted for every reported (critical or high) anomaly
    AnomalyReport { record: AnomalyRecord },
    /// Emitted whenever the engine lifecycle state changes
    StateUpdate { state: EngineState },
}

/// Per-band counters for classified scores
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct SeverityCounts {
    pub critical: u64,
    pub high: u64,
    pub medium: u64,
    pub normal: u64,
}

/// Engine statistics served with snapshots
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineStats {
    pub state: EngineState,
    pub sample_count: u64,
    pub anomaly_count: u64,
    pub uptime_seconds: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trained_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_training_samples: Option<usize>,
    pub severity_counts: SeverityCounts,
}

/// Point-in-time view handed to a newly connected client
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineSnapshot {
    pub samples: Vec<MetricSample>,
    pub anomalies: Vec<AnomalyRecord>,
    pub stats: EngineStats,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> MetricSample {
        MetricSample {
            timestamp: Utc::now(),
            cpu_percent: 12.5,
            cpu_frequency_mhz: 2400.0,
            memory_percent: 48.0,
            memory_available_gb: 8.3,
            disk_read_mb_per_s: 0.5,
            disk_write_mb_per_s: 0.25,
            network_sent_mb_per_s: 0.1,
            network_recv_mb_per_s: 0.2,
        }
    }

    #[test]
    fn test_feature_order() {
        let s = sample();
        let f = s.features();
        assert_eq!(f[0], 12.5);
        assert_eq!(f[1], 48.0);
        assert_eq!(f[2], 0.5);
        assert_eq!(f[3], 0.25);
        assert_eq!(f[4], 0.1);
        assert_eq!(f[5], 0.2);
        assert_eq!(f[6], 2400.0);
    }

    #[test]
    fn test_non_finite_sample_detected() {
        let mut s = sample();
        assert!(s.is_finite());
        s.disk_read_mb_per_s = f64::NAN;
        assert!(!s.is_finite());
    }

    #[test]
    fn test_severity_reportable() {
        assert!(Severity::Critical.is_reportable());
        assert!(Severity::High.is_reportable());
        assert!(!Severity::Medium.is_reportable());
        assert!(!Severity::Normal.is_reportable());
    }

    #[test]
    fn test_event_serialization_tags() {
        let event = EngineEvent::StateUpdate {
            state: EngineState::Ready,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "state_update");
        assert_eq!(json["state"], "ready");

        let event = EngineEvent::SampleUpdate {
            sample: sample(),
            is_anomaly: false,
            raw_score: None,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "sample_update");
        assert!(json.get("raw_score").is_none());
    }
}
