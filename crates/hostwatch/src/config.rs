//! Agent configuration
//!
//! Everything is read from `HOSTWATCH_*` environment variables; unset
//! variables fall back to the engine defaults.

use anyhow::{Context, Result};
use hostwatch_lib::EngineConfig;

/// Configuration of the agent shell around the engine
#[derive(Debug, Clone)]
pub struct ShellConfig {
    /// Port for the health/snapshot/metrics API
    pub api_port: u16,
    /// Core engine configuration
    pub engine: EngineConfig,
}

const DEFAULT_API_PORT: u16 = 8080;

impl ShellConfig {
    /// Load configuration from the environment
    pub fn load() -> Result<Self> {
        let source = config::Config::builder()
            .add_source(config::Environment::with_prefix("HOSTWATCH").try_parsing(true))
            .build()
            .context("Failed to read environment configuration")?;

        let engine: EngineConfig = source
            .clone()
            .try_deserialize()
            .context("Invalid engine configuration")?;

        let api_port = match source.get::<u16>("api_port") {
            Ok(port) => port,
            Err(config::ConfigError::NotFound(_)) => DEFAULT_API_PORT,
            Err(e) => return Err(e).context("Invalid api_port"),
        };

        Ok(Self { api_port, engine })
    }
}
