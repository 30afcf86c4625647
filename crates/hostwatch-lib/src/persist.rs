//! Append-only persistence
//!
//! Two durable targets: a tabular CSV log with one row per sample and a
//! JSON Lines log with one record per reported anomaly. Rows are
//! written strictly in sample order by a single writer, so a client can
//! read the file and then subscribe without a gap.

use crate::models::{AnomalyRecord, MetricSample};
use anyhow::{Context, Result};
use chrono::SecondsFormat;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

/// Stable header of the samples log; field order is part of the format
pub const SAMPLES_LOG_HEADER: &str = "timestamp,cpu_percent,cpu_frequency_mhz,memory_percent,\
memory_available_gb,disk_read_mb_per_s,disk_write_mb_per_s,network_sent_mb_per_s,\
network_recv_mb_per_s,is_anomaly,raw_score";

/// Sample rows buffered between flushes
const FLUSH_EVERY_ROWS: u64 = 20;

fn open_append(path: &Path) -> Result<(File, bool)> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory {:?}", parent))?;
        }
    }

    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("Failed to open {:?}", path))?;
    let fresh = file
        .metadata()
        .map(|meta| meta.len() == 0)
        .unwrap_or(true);
    Ok((file, fresh))
}

/// Append-only CSV log of every sample (also used for replay reports)
pub struct SamplesLog {
    writer: BufWriter<File>,
    path: PathBuf,
    rows_since_flush: u64,
}

impl SamplesLog {
    /// Open for appending, writing the header on a fresh file
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let (file, fresh) = open_append(&path)?;
        let mut writer = BufWriter::new(file);

        if fresh {
            writeln!(writer, "{}", SAMPLES_LOG_HEADER)
                .with_context(|| format!("Failed to write header to {:?}", path))?;
            writer.flush().context("Failed to flush samples log header")?;
        }

        Ok(Self {
            writer,
            path,
            rows_since_flush: 0,
        })
    }

    /// Append one row; the score column stays blank while the detector
    /// is cold
    pub fn append(
        &mut self,
        sample: &MetricSample,
        is_anomaly: bool,
        raw_score: Option<f64>,
    ) -> Result<()> {
        let score = raw_score.map(|s| s.to_string()).unwrap_or_default();
        writeln!(
            self.writer,
            "{},{},{},{},{},{},{},{},{},{},{}",
            sample.timestamp.to_rfc3339_opts(SecondsFormat::Micros, true),
            sample.cpu_percent,
            sample.cpu_frequency_mhz,
            sample.memory_percent,
            sample.memory_available_gb,
            sample.disk_read_mb_per_s,
            sample.disk_write_mb_per_s,
            sample.network_sent_mb_per_s,
            sample.network_recv_mb_per_s,
            if is_anomaly { "True" } else { "False" },
            score,
        )
        .with_context(|| format!("Failed to append to {:?}", self.path))?;

        self.rows_since_flush += 1;
        if self.rows_since_flush >= FLUSH_EVERY_ROWS {
            self.flush()?;
        }
        Ok(())
    }

    pub fn flush(&mut self) -> Result<()> {
        self.writer
            .flush()
            .with_context(|| format!("Failed to flush {:?}", self.path))?;
        self.rows_since_flush = 0;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Append-only JSON Lines log of reported anomalies
pub struct AnomaliesLog {
    writer: BufWriter<File>,
    path: PathBuf,
}

impl AnomaliesLog {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let (file, _) = open_append(&path)?;
        Ok(Self {
            writer: BufWriter::new(file),
            path,
        })
    }

    /// Append one record and flush immediately
    pub fn append(&mut self, record: &AnomalyRecord) -> Result<()> {
        let line = serde_json::to_string(record).context("Failed to serialize anomaly record")?;
        writeln!(self.writer, "{}", line)
            .with_context(|| format!("Failed to append to {:?}", self.path))?;
        self.writer
            .flush()
            .with_context(|| format!("Failed to flush {:?}", self.path))?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Severity;
    use chrono::{Duration, TimeZone, Utc};

    fn sample_at(offset_secs: i64) -> MetricSample {
        let base = Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap();
        MetricSample {
            timestamp: base + Duration::seconds(offset_secs),
            cpu_percent: 12.345,
            cpu_frequency_mhz: 2400.0,
            memory_percent: 48.25,
            memory_available_gb: 8.5,
            disk_read_mb_per_s: 0.5,
            disk_write_mb_per_s: 0.25,
            network_sent_mb_per_s: 0.125,
            network_recv_mb_per_s: 0.0625,
        }
    }

    #[test]
    fn test_header_written_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("metrics_history.csv");

        {
            let mut log = SamplesLog::open(&path).unwrap();
            log.append(&sample_at(0), false, None).unwrap();
            log.flush().unwrap();
        }
        {
            let mut log = SamplesLog::open(&path).unwrap();
            log.append(&sample_at(1), false, None).unwrap();
            log.flush().unwrap();
        }

        let content = std::fs::read_to_string(&path).unwrap();
        let headers = content
            .lines()
            .filter(|line| line.starts_with("timestamp,"))
            .count();
        assert_eq!(headers, 1);
        assert_eq!(content.lines().count(), 3);
        assert!(content.starts_with(SAMPLES_LOG_HEADER));
    }

    #[test]
    fn test_row_format() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("metrics_history.csv");

        let mut log = SamplesLog::open(&path).unwrap();
        log.append(&sample_at(0), false, None).unwrap();
        log.append(&sample_at(1), true, Some(-0.625)).unwrap();
        log.append(&sample_at(2), false, Some(0.125)).unwrap();
        log.flush().unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        let rows: Vec<&str> = content.lines().skip(1).collect();

        // Cold rows carry a blank score
        assert!(rows[0].ends_with(",False,"));
        assert!(rows[1].ends_with(",True,-0.625"));
        assert!(rows[2].ends_with(",False,0.125"));

        let fields: Vec<&str> = rows[0].split(',').collect();
        assert_eq!(fields.len(), 11);
        assert_eq!(fields[1], "12.345");
        assert_eq!(fields[9], "False");
    }

    #[test]
    fn test_rows_ordered_by_byte_offset() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("metrics_history.csv");

        let mut log = SamplesLog::open(&path).unwrap();
        for i in 0..50 {
            log.append(&sample_at(i), false, None).unwrap();
        }
        log.flush().unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        let mut last_offset = 0usize;
        for i in 0..50 {
            let stamp = sample_at(i)
                .timestamp
                .to_rfc3339_opts(SecondsFormat::Micros, true);
            let offset = content.find(&stamp).unwrap();
            assert!(offset > last_offset || i == 0);
            last_offset = offset;
        }
    }

    #[test]
    fn test_anomalies_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("anomalies.jsonl");

        let sample = sample_at(0);
        let record = AnomalyRecord {
            timestamp: sample.timestamp,
            raw_score: -0.75,
            severity: Severity::Critical,
            reasons: vec!["high CPU".to_string(), "disk burst".to_string()],
            sample,
        };

        let mut log = AnomaliesLog::open(&path).unwrap();
        log.append(&record).unwrap();
        log.append(&record).unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);

        let parsed: AnomalyRecord = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(parsed.raw_score, -0.75);
        assert_eq!(parsed.severity, Severity::Critical);
        assert_eq!(parsed.reasons, vec!["high CPU", "disk burst"]);
        assert_eq!(parsed.sample.cpu_percent, 12.345);
    }

    #[test]
    fn test_creates_missing_log_directory() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("logs/nested/metrics_history.csv");

        let mut log = SamplesLog::open(&path).unwrap();
        log.append(&sample_at(0), false, None).unwrap();
        log.flush().unwrap();

        assert!(path.exists());
    }
}
