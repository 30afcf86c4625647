//! hostwatch - host telemetry anomaly detection agent
//!
//! Samples OS performance counters at a fixed cadence, learns a model
//! of normal behavior online, and reports deviations through persistent
//! logs, a snapshot API and live subscribers.

use hostwatch_lib::{Engine, EngineState};
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod api;
mod config;

/// Exit codes: 0 normal shutdown, 1 unrecoverable error, 2 invalid
/// configuration
#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().json())
        .init();

    std::process::exit(run().await);
}

async fn run() -> i32 {
    info!("Starting hostwatch");

    let shell = match config::ShellConfig::load() {
        Ok(shell) => shell,
        Err(e) => {
            error!(error = %format!("{e:#}"), "Invalid configuration");
            return 2;
        }
    };

    let engine = match Engine::new(shell.engine.clone()) {
        Ok(engine) => Arc::new(engine),
        Err(e) => {
            error!(error = %format!("{e:#}"), "Invalid configuration");
            return 2;
        }
    };

    if let Err(e) = engine.start() {
        error!(error = %format!("{e:#}"), "Failed to start engine");
        return 1;
    }

    // Replay mode runs the table to completion and exits
    if shell.engine.replay_input_path.is_some() {
        return match engine.wait().await {
            EngineState::Error => 1,
            _ => {
                let stats = engine.stats();
                info!(
                    rows = stats.sample_count,
                    anomalies = stats.anomaly_count,
                    "Replay analysis complete"
                );
                0
            }
        };
    }

    let app_state = Arc::new(api::AppState::new(engine.clone()));
    let api_handle = tokio::spawn(api::serve(shell.api_port, app_state));

    tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            if let Err(e) = signal {
                error!(error = %e, "Failed to listen for shutdown signal");
            }
            info!("SIGINT received");
            engine.shutdown().await;
            0
        }
        state = engine_finished(engine.clone()) => {
            // The engine only finishes on its own when something fatal
            // happened
            error!(state = %state, "Engine stopped unexpectedly");
            1
        }
        result = api_handle => {
            match result {
                Ok(Err(e)) => error!(error = %format!("{e:#}"), "API server failed"),
                Err(e) => error!(error = %e, "API server task panicked"),
                Ok(Ok(())) => {}
            }
            engine.shutdown().await;
            1
        }
    }
}

async fn engine_finished(engine: Arc<Engine>) -> EngineState {
    engine.wait().await
}
