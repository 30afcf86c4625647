//! Bounded in-memory storage for recent samples and anomalies
//!
//! Both buffers live behind a single mutex held only for the duration of
//! a push or snapshot. Snapshots copy out, so readers always see a
//! consistent point-in-time view regardless of concurrent appends.

use crate::models::{AnomalyRecord, MetricSample};
use std::collections::VecDeque;
use std::sync::Mutex;

/// Rolling buffers of recent samples and reported anomalies
pub struct RollingStore {
    inner: Mutex<StoreInner>,
    samples_capacity: usize,
    anomalies_capacity: usize,
}

struct StoreInner {
    samples: VecDeque<MetricSample>,
    anomalies: VecDeque<AnomalyRecord>,
    /// Total samples appended since start, monotonic
    total_samples: u64,
    /// Total anomalies appended since start, monotonic
    total_anomalies: u64,
}

impl RollingStore {
    /// Create a store with the given buffer capacities
    pub fn new(samples_capacity: usize, anomalies_capacity: usize) -> Self {
        Self {
            inner: Mutex::new(StoreInner {
                samples: VecDeque::with_capacity(samples_capacity.min(10_000)),
                anomalies: VecDeque::with_capacity(anomalies_capacity.min(1_000)),
                total_samples: 0,
                total_anomalies: 0,
            }),
            samples_capacity,
            anomalies_capacity,
        }
    }

    /// Append a sample, evicting the oldest at capacity
    pub fn append_sample(&self, sample: MetricSample) {
        let mut inner = self.inner.lock().unwrap();
        while inner.samples.len() >= self.samples_capacity {
            inner.samples.pop_front();
        }
        inner.samples.push_back(sample);
        inner.total_samples += 1;
    }

    /// Append a reported anomaly, evicting the oldest at capacity
    pub fn append_anomaly(&self, record: AnomalyRecord) {
        let mut inner = self.inner.lock().unwrap();
        while inner.anomalies.len() >= self.anomalies_capacity {
            inner.anomalies.pop_front();
        }
        inner.anomalies.push_back(record);
        inner.total_anomalies += 1;
    }

    /// Copy of the last `k` samples, oldest first
    pub fn recent_samples(&self, k: usize) -> Vec<MetricSample> {
        let inner = self.inner.lock().unwrap();
        let skip = inner.samples.len().saturating_sub(k);
        inner.samples.iter().skip(skip).cloned().collect()
    }

    /// Copy of the last `k` reported anomalies, oldest first
    pub fn recent_anomalies(&self, k: usize) -> Vec<AnomalyRecord> {
        let inner = self.inner.lock().unwrap();
        let skip = inner.anomalies.len().saturating_sub(k);
        inner.anomalies.iter().skip(skip).cloned().collect()
    }

    /// Total samples appended since start (not the buffer length)
    pub fn sample_count(&self) -> u64 {
        self.inner.lock().unwrap().total_samples
    }

    /// Total anomalies appended since start
    pub fn anomaly_count(&self) -> u64 {
        self.inner.lock().unwrap().total_anomalies
    }

    /// Current number of buffered samples
    pub fn buffered_samples(&self) -> usize {
        self.inner.lock().unwrap().samples.len()
    }

    /// Configured sample buffer capacity
    pub fn samples_capacity(&self) -> usize {
        self.samples_capacity
    }

    /// Configured anomaly buffer capacity
    pub fn anomalies_capacity(&self) -> usize {
        self.anomalies_capacity
    }
}
