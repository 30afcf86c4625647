//! Metric sampling sources
//!
//! Two interchangeable sources feed the engine: live host counters and
//! replay of a historical table. Both emit one `MetricSample` per call,
//! with the live source blocking on its tick timer and the replay
//! source yielding rows as fast as the pipeline consumes them.

mod rates;
mod replay;
mod system;

pub use rates::RateTracker;
pub use replay::ReplaySource;
pub use system::SystemSampler;

use crate::models::MetricSample;
use anyhow::Result;
use async_trait::async_trait;

/// A source of metric samples
#[async_trait]
pub trait SampleSource: Send {
    /// Wait for the next tick boundary and yield one sample.
    ///
    /// `Ok(None)` means the source is exhausted (end of a replay table);
    /// an error is fatal to the sampling subsystem.
    async fn next_sample(&mut self) -> Result<Option<MetricSample>>;
}
