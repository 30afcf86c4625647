//! Conversion of cumulative byte counters to per-second rates

/// Bytes per mebibyte
const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

/// Derives MB/s rates from a monotonically increasing byte counter.
///
/// Counter wraps and resets read as a zero rate rather than a negative
/// one; a duplicate timestamp repeats the previous rate.
#[derive(Debug, Clone, Default)]
pub struct RateTracker {
    prev_bytes: Option<u64>,
    prev_rate: f64,
}

impl RateTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed the current counter reading and the seconds elapsed since
    /// the previous one; returns the instantaneous rate in MB/s.
    pub fn update(&mut self, curr_bytes: u64, elapsed_seconds: f64) -> f64 {
        let rate = match self.prev_bytes {
            // No prior snapshot to difference against
            None => 0.0,
            Some(_) if elapsed_seconds == 0.0 => self.prev_rate,
            Some(prev) => curr_bytes.saturating_sub(prev) as f64 / elapsed_seconds / BYTES_PER_MB,
        };

        self.prev_bytes = Some(curr_bytes);
        self.prev_rate = rate;
        rate
    }
}
