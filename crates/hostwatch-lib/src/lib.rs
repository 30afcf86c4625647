//! Core library for the host telemetry anomaly engine
//!
//! This crate provides:
//! - Metric sampling from live OS counters or historical replay
//! - Bounded rolling storage of recent samples and anomalies
//! - An isolation-forest detector with online retraining
//! - Severity classification of raw anomaly scores
//! - Append-only persistence and live event fan-out

pub mod bus;
pub mod classifier;
pub mod config;
pub mod detector;
pub mod engine;
pub mod models;
pub mod observability;
pub mod persist;
pub mod sampler;
pub mod store;

pub use bus::{EventBus, Subscription};
pub use config::EngineConfig;
pub use engine::Engine;
pub use models::*;
pub use observability::{EngineLogger, EngineMetrics};
