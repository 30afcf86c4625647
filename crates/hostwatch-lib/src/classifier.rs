//! Severity classification of raw detector scores
//!
//! Translates a signed score into a severity band, attaches rule-based
//! reason labels, and decides whether the anomaly is worth reporting.
//! The band thresholds are calibrated to the detector's score scale and
//! are independent of the configured contamination.

use crate::models::{AnomalyRecord, MetricSample, Severity};

/// Scores below this are critical
pub const CRITICAL_THRESHOLD: f64 = -0.7;
/// Scores in [-0.7, -0.5) are high
pub const HIGH_THRESHOLD: f64 = -0.5;
/// Scores in [-0.5, -0.3) are medium; anything above is normal
pub const MEDIUM_THRESHOLD: f64 = -0.3;

/// CPU utilization above this contributes a reason label
const CPU_PERCENT_LIMIT: f64 = 80.0;
/// Memory utilization above this contributes a reason label
const MEMORY_PERCENT_LIMIT: f64 = 80.0;
/// Combined disk throughput above this contributes a reason label
const DISK_MB_LIMIT: f64 = 50.0;
/// Combined network throughput above this contributes a reason label
const NETWORK_MB_LIMIT: f64 = 50.0;

pub const REASON_HIGH_CPU: &str = "high CPU";
pub const REASON_HIGH_MEMORY: &str = "high memory";
pub const REASON_DISK_BURST: &str = "disk burst";
pub const REASON_NETWORK_BURST: &str = "network burst";
/// Marker used when no rule predicate fired
pub const REASON_MODEL_ONLY: &str = "model-only";

/// Map a raw score to its severity band (lower score = worse)
pub fn severity_for_score(raw_score: f64) -> Severity {
    if raw_score < CRITICAL_THRESHOLD {
        Severity::Critical
    } else if raw_score < HIGH_THRESHOLD {
        Severity::High
    } else if raw_score < MEDIUM_THRESHOLD {
        Severity::Medium
    } else {
        Severity::Normal
    }
}

/// Evaluate the rule predicates against a sample and collect their
/// labels in fixed order; falls back to the model-only marker
pub fn reasons_for_sample(sample: &MetricSample) -> Vec<String> {
    let mut reasons = Vec::new();

    if sample.cpu_percent > CPU_PERCENT_LIMIT {
        reasons.push(REASON_HIGH_CPU.to_string());
    }
    if sample.memory_percent > MEMORY_PERCENT_LIMIT {
        reasons.push(REASON_HIGH_MEMORY.to_string());
    }
    if sample.disk_read_mb_per_s + sample.disk_write_mb_per_s > DISK_MB_LIMIT {
        reasons.push(REASON_DISK_BURST.to_string());
    }
    if sample.network_sent_mb_per_s + sample.network_recv_mb_per_s > NETWORK_MB_LIMIT {
        reasons.push(REASON_NETWORK_BURST.to_string());
    }

    if reasons.is_empty() {
        reasons.push(REASON_MODEL_ONLY.to_string());
    }
    reasons
}

/// Classify a scored sample; returns a record only for reportable
/// (critical or high) severities
pub fn classify(sample: &MetricSample, raw_score: f64) -> (Severity, Option<AnomalyRecord>) {
    let severity = severity_for_score(raw_score);
    if !severity.is_reportable() {
        return (severity, None);
    }

    let record = AnomalyRecord {
        timestamp: sample.timestamp,
        raw_score,
        severity,
        reasons: reasons_for_sample(sample),
        sample: sample.clone(),
    };
    (severity, Some(record))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn quiet_sample() -> MetricSample {
        MetricSample {
            timestamp: Utc::now(),
            cpu_percent: 10.0,
            cpu_frequency_mhz: 2400.0,
            memory_percent: 20.0,
            memory_available_gb: 12.0,
            disk_read_mb_per_s: 0.5,
            disk_write_mb_per_s: 0.5,
            network_sent_mb_per_s: 0.5,
            network_recv_mb_per_s: 0.5,
        }
    }

    #[test]
    fn test_severity_bands() {
        assert_eq!(severity_for_score(-0.8), Severity::Critical);
        assert_eq!(severity_for_score(-0.6), Severity::High);
        assert_eq!(severity_for_score(-0.4), Severity::Medium);
        assert_eq!(severity_for_score(-0.1), Severity::Normal);
    }

    #[test]
    fn test_band_boundaries() {
        assert_eq!(severity_for_score(-0.7), Severity::High);
        assert_eq!(severity_for_score(-0.5), Severity::Medium);
        assert_eq!(severity_for_score(-0.3), Severity::Normal);
        assert_eq!(severity_for_score(0.2), Severity::Normal);
    }

    #[test]
    fn test_only_critical_and_high_reported() {
        let sample = quiet_sample();

        let (severity, record) = classify(&sample, -0.8);
        assert_eq!(severity, Severity::Critical);
        assert!(record.is_some());

        let (severity, record) = classify(&sample, -0.6);
        assert_eq!(severity, Severity::High);
        assert!(record.is_some());

        let (severity, record) = classify(&sample, -0.4);
        assert_eq!(severity, Severity::Medium);
        assert!(record.is_none());

        let (severity, record) = classify(&sample, -0.1);
        assert_eq!(severity, Severity::Normal);
        assert!(record.is_none());
    }

    #[test]
    fn test_reported_records_are_below_high_threshold() {
        let sample = quiet_sample();
        for score in [-0.95, -0.71, -0.69, -0.51] {
            let (_, record) = classify(&sample, score);
            let record = record.unwrap();
            assert!(record.raw_score < HIGH_THRESHOLD);
            assert!(record.severity.is_reportable());
        }
    }

    #[test]
    fn test_reason_predicates_fire_independently() {
        let mut sample = quiet_sample();
        sample.cpu_percent = 85.0;
        assert_eq!(reasons_for_sample(&sample), vec![REASON_HIGH_CPU]);

        let mut sample = quiet_sample();
        sample.memory_percent = 92.0;
        assert_eq!(reasons_for_sample(&sample), vec![REASON_HIGH_MEMORY]);

        let mut sample = quiet_sample();
        sample.disk_read_mb_per_s = 30.0;
        sample.disk_write_mb_per_s = 25.0;
        assert_eq!(reasons_for_sample(&sample), vec![REASON_DISK_BURST]);

        let mut sample = quiet_sample();
        sample.network_sent_mb_per_s = 60.0;
        assert_eq!(reasons_for_sample(&sample), vec![REASON_NETWORK_BURST]);
    }

    #[test]
    fn test_reasons_in_fixed_order() {
        let mut sample = quiet_sample();
        sample.cpu_percent = 99.0;
        sample.memory_percent = 95.0;
        sample.disk_read_mb_per_s = 200.0;
        sample.network_sent_mb_per_s = 200.0;

        assert_eq!(
            reasons_for_sample(&sample),
            vec![
                REASON_HIGH_CPU,
                REASON_HIGH_MEMORY,
                REASON_DISK_BURST,
                REASON_NETWORK_BURST
            ]
        );
    }

    #[test]
    fn test_model_only_marker_when_nothing_fires() {
        let sample = quiet_sample();
        assert_eq!(reasons_for_sample(&sample), vec![REASON_MODEL_ONLY]);

        let (_, record) = classify(&sample, -0.9);
        assert_eq!(record.unwrap().reasons, vec![REASON_MODEL_ONLY]);
    }
}
