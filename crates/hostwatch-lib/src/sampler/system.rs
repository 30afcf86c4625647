//! Live host counter sampling
//!
//! CPU utilization, frequency, memory and network counters come from
//! sysinfo; block I/O counters are read from /proc/diskstats directly
//! since sysinfo exposes no system-wide disk throughput. Cumulative
//! counters are differenced into MB/s rates per tick.

use super::rates::RateTracker;
use super::SampleSource;
use crate::models::MetricSample;
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::path::PathBuf;
use std::time::Duration;
use sysinfo::{CpuRefreshKind, Networks, System};
use tokio::time::{interval, Interval, MissedTickBehavior};
use tracing::warn;

const BYTES_PER_GB: f64 = 1024.0 * 1024.0 * 1024.0;
const SECTOR_SIZE: u64 = 512;

/// Sampler reading live OS counters at a fixed period
pub struct SystemSampler {
    sys: System,
    networks: Networks,
    diskstats_path: PathBuf,
    ticker: Interval,
    disk_read: RateTracker,
    disk_write: RateTracker,
    net_sent: RateTracker,
    net_recv: RateTracker,
    last_timestamp: Option<DateTime<Utc>>,
}

impl SystemSampler {
    pub fn new(period: Duration) -> Self {
        let mut sys = System::new();
        sys.refresh_cpu_specifics(CpuRefreshKind::everything());
        sys.refresh_memory();

        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        Self {
            sys,
            networks: Networks::new_with_refreshed_list(),
            diskstats_path: PathBuf::from("/proc/diskstats"),
            ticker,
            disk_read: RateTracker::new(),
            disk_write: RateTracker::new(),
            net_sent: RateTracker::new(),
            net_recv: RateTracker::new(),
            last_timestamp: None,
        }
    }

    /// Use an alternate diskstats file (for testing)
    pub fn with_diskstats_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.diskstats_path = path.into();
        self
    }

    fn collect(&mut self) -> MetricSample {
        let mut timestamp = Utc::now();
        // Timestamps are strictly increasing within a run
        if let Some(prev) = self.last_timestamp {
            if timestamp <= prev {
                timestamp = prev + ChronoDuration::microseconds(1);
            }
        }
        let elapsed = match self.last_timestamp {
            Some(prev) => (timestamp - prev).num_microseconds().unwrap_or(0) as f64 / 1e6,
            None => 0.0,
        };
        self.last_timestamp = Some(timestamp);

        self.sys
            .refresh_cpu_specifics(CpuRefreshKind::everything());
        self.sys.refresh_memory();
        self.networks.refresh();

        let cpu_percent = (self.sys.global_cpu_info().cpu_usage() as f64).clamp(0.0, 100.0);
        let cpu_frequency_mhz = self
            .sys
            .cpus()
            .first()
            .map(|cpu| cpu.frequency() as f64)
            .unwrap_or(0.0);

        let total_memory = self.sys.total_memory();
        let memory_percent = if total_memory > 0 {
            self.sys.used_memory() as f64 / total_memory as f64 * 100.0
        } else {
            0.0
        };
        let memory_available_gb = self.sys.available_memory() as f64 / BYTES_PER_GB;

        let (sent_total, recv_total) = self.network_totals();
        let network_sent_mb_per_s = self.net_sent.update(sent_total, elapsed);
        let network_recv_mb_per_s = self.net_recv.update(recv_total, elapsed);

        let (disk_read_mb_per_s, disk_write_mb_per_s) = match self.read_disk_counters() {
            Ok((read_bytes, written_bytes)) => (
                self.disk_read.update(read_bytes, elapsed),
                self.disk_write.update(written_bytes, elapsed),
            ),
            Err(e) => {
                // Transient counter failure: zero the field, keep the sample
                warn!(error = %e, "Failed to read disk counters");
                (0.0, 0.0)
            }
        };

        MetricSample {
            timestamp,
            cpu_percent,
            cpu_frequency_mhz,
            memory_percent,
            memory_available_gb,
            disk_read_mb_per_s,
            disk_write_mb_per_s,
            network_sent_mb_per_s,
            network_recv_mb_per_s,
        }
    }

    fn network_totals(&self) -> (u64, u64) {
        let mut sent = 0u64;
        let mut recv = 0u64;
        for (_name, data) in self.networks.iter() {
            sent = sent.saturating_add(data.total_transmitted());
            recv = recv.saturating_add(data.total_received());
        }
        (sent, recv)
    }

    fn read_disk_counters(&self) -> Result<(u64, u64)> {
        let content = std::fs::read_to_string(&self.diskstats_path)
            .with_context(|| format!("Failed to read {:?}", self.diskstats_path))?;
        Ok(parse_diskstats(&content))
    }
}

#[async_trait]
impl SampleSource for SystemSampler {
    async fn next_sample(&mut self) -> Result<Option<MetricSample>> {
        self.ticker.tick().await;
        Ok(Some(self.collect()))
    }
}

/// Sum cumulative (read_bytes, written_bytes) over physical block
/// devices in /proc/diskstats content
fn parse_diskstats(content: &str) -> (u64, u64) {
    let mut read_bytes = 0u64;
    let mut written_bytes = 0u64;

    for line in content.lines() {
        let fields: Vec<&str> = line.split_whitespace().collect();
        // major minor name reads _ sectors_read _ writes _ sectors_written ...
        if fields.len() < 10 {
            continue;
        }
        let name = fields[2];
        if !is_physical_device(name) {
            continue;
        }
        let sectors_read: u64 = fields[5].parse().unwrap_or(0);
        let sectors_written: u64 = fields[9].parse().unwrap_or(0);
        read_bytes = read_bytes.saturating_add(sectors_read.saturating_mul(SECTOR_SIZE));
        written_bytes = written_bytes.saturating_add(sectors_written.saturating_mul(SECTOR_SIZE));
    }

    (read_bytes, written_bytes)
}

/// Whole-device filter: partitions and virtual devices would double
/// count the throughput of their backing disk
fn is_physical_device(name: &str) -> bool {
    if name.starts_with("loop") || name.starts_with("ram") || name.starts_with("zram") {
        return false;
    }
    if let Some(rest) = name.strip_prefix("nvme") {
        return !rest.contains('p');
    }
    if let Some(rest) = name.strip_prefix("mmcblk") {
        return !rest.contains('p');
    }
    if (name.starts_with("sd") || name.starts_with("hd") || name.starts_with("vd"))
        && name.ends_with(|c: char| c.is_ascii_digit())
    {
        return false;
    }
    true
}
