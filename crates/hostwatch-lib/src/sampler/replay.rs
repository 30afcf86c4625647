//! Replay of historical metric tables
//!
//! Accepts the engine's own samples log as well as externally produced
//! tables (which may name rate columns without the per-second suffix
//! and may omit columns entirely). Rows are yielded in order without
//! tick pacing; rates are taken as-is from the input.

use super::SampleSource;
use crate::models::MetricSample;
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, NaiveDateTime, TimeZone, Utc};
use std::path::Path;
use std::time::Duration;

/// Replay source yielding parsed rows in table order
pub struct ReplaySource {
    rows: std::vec::IntoIter<MetricSample>,
    total: usize,
}

impl ReplaySource {
    /// Parse a CSV table from disk
    pub fn from_path(path: impl AsRef<Path>, period: Duration) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read replay input {:?}", path))?;
        Self::from_csv(&content, period)
            .with_context(|| format!("Failed to parse replay input {:?}", path))
    }

    /// Parse CSV content; `period` spaces synthesized timestamps when
    /// the table carries none
    pub fn from_csv(content: &str, period: Duration) -> Result<Self> {
        let mut lines = content.lines();
        let header = match lines.next() {
            Some(line) if !line.trim().is_empty() => line,
            _ => bail!("replay input is empty"),
        };

        let columns = Columns::from_header(header)?;
        let period = ChronoDuration::from_std(period).unwrap_or(ChronoDuration::seconds(1));
        let start = Utc::now();

        let mut rows = Vec::new();
        let mut prev_timestamp: Option<DateTime<Utc>> = None;
        for (index, line) in lines.enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let fields: Vec<&str> = line.split(',').collect();

            let mut timestamp = columns
                .timestamp
                .and_then(|col| fields.get(col))
                .and_then(|raw| parse_timestamp(raw))
                .unwrap_or(start + period * index as i32);
            // Emitted timestamps are strictly increasing even when the
            // table repeats or reorders them
            if let Some(prev) = prev_timestamp {
                if timestamp <= prev {
                    timestamp = prev + ChronoDuration::microseconds(1);
                }
            }
            prev_timestamp = Some(timestamp);

            rows.push(MetricSample {
                timestamp,
                cpu_percent: columns.value(&fields, columns.cpu_percent),
                cpu_frequency_mhz: columns.value(&fields, columns.cpu_frequency),
                memory_percent: columns.value(&fields, columns.memory_percent),
                memory_available_gb: columns.value(&fields, columns.memory_available),
                disk_read_mb_per_s: columns.value(&fields, columns.disk_read),
                disk_write_mb_per_s: columns.value(&fields, columns.disk_write),
                network_sent_mb_per_s: columns.value(&fields, columns.network_sent),
                network_recv_mb_per_s: columns.value(&fields, columns.network_recv),
            });
        }

        let total = rows.len();
        Ok(Self {
            rows: rows.into_iter(),
            total,
        })
    }

    /// Wrap an already-built sample sequence (used by tests and the
    /// replay report round trip)
    pub fn from_samples(samples: Vec<MetricSample>) -> Self {
        let total = samples.len();
        Self {
            rows: samples.into_iter(),
            total,
        }
    }

    /// Total rows parsed from the table
    pub fn len(&self) -> usize {
        self.total
    }

    pub fn is_empty(&self) -> bool {
        self.total == 0
    }
}

#[async_trait]
impl SampleSource for ReplaySource {
    async fn next_sample(&mut self) -> Result<Option<MetricSample>> {
        Ok(self.rows.next())
    }
}

/// Header column positions; `None` means the field defaults to zero
struct Columns {
    timestamp: Option<usize>,
    cpu_percent: Option<usize>,
    cpu_frequency: Option<usize>,
    memory_percent: Option<usize>,
    memory_available: Option<usize>,
    disk_read: Option<usize>,
    disk_write: Option<usize>,
    network_sent: Option<usize>,
    network_recv: Option<usize>,
}

impl Columns {
    fn from_header(header: &str) -> Result<Self> {
        let names: Vec<String> = header
            .split(',')
            .map(|name| name.trim().to_ascii_lowercase())
            .collect();

        let find = |aliases: &[&str]| -> Option<usize> {
            names
                .iter()
                .position(|name| aliases.iter().any(|alias| name == alias))
        };

        let columns = Self {
            timestamp: find(&["timestamp"]),
            cpu_percent: find(&["cpu_percent"]),
            cpu_frequency: find(&["cpu_frequency_mhz", "cpu_frequency"]),
            memory_percent: find(&["memory_percent"]),
            memory_available: find(&["memory_available_gb"]),
            disk_read: find(&["disk_read_mb_per_s", "disk_read_mb"]),
            disk_write: find(&["disk_write_mb_per_s", "disk_write_mb"]),
            network_sent: find(&["network_sent_mb_per_s", "network_sent_mb"]),
            network_recv: find(&["network_recv_mb_per_s", "network_recv_mb"]),
        };

        if columns.cpu_percent.is_none() && columns.memory_percent.is_none() {
            bail!("replay header has no recognizable metric columns: {}", header);
        }
        Ok(columns)
    }

    fn value(&self, fields: &[&str], column: Option<usize>) -> f64 {
        column
            .and_then(|col| fields.get(col))
            .and_then(|raw| raw.trim().parse::<f64>().ok())
            .filter(|v| v.is_finite())
            .unwrap_or(0.0)
    }
}

fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return Some(parsed.with_timezone(&Utc));
    }
    // Space-separated naive format written by older exporters
    if let Ok(naive) = NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S%.f") {
        return Some(Utc.from_utc_datetime(&naive));
    }
    // Plain Unix seconds
    if let Ok(epoch) = raw.parse::<f64>() {
        if epoch.is_finite() && epoch >= 0.0 {
            let secs = epoch.trunc() as i64;
            let micros = (epoch.fract() * 1e6) as u32;
            return Utc
                .timestamp_opt(secs, micros * 1000)
                .single();
        }
    }
    None
}
