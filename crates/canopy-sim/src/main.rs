//! canopy-sim - replay an activation scenario
//!
//! Usage:
//!   canopy-sim <scenario.json>
//!
//! Events are printed to stdout as JSON lines, followed by a summary.
//! Logs go to stderr; set RUST_LOG to change the filter.
//!
//! Environment:
//!   CANOPY_CONFIG            Path to a TOML engine configuration
//!   CANOPY_CURRENCY          Currency code of every reserve
//!   CANOPY_STORE_TIMEOUT_MS  Per-call store timeout
//!   CANOPY_SWEEPOVER_DEPTH   Ancestor walk cap

mod scenario;

use std::process::ExitCode;
use std::sync::Arc;

use canopy_engine::{Engine, EngineConfig};
use canopy_store::MemoryStore;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::scenario::{replay, Scenario, SimError};

fn print_usage() {
    eprintln!("canopy-sim - Replay an activation scenario against the engine");
    eprintln!();
    eprintln!("Usage:");
    eprintln!("  canopy-sim <scenario.json>");
    eprintln!();
    eprintln!("Environment:");
    eprintln!("  CANOPY_CONFIG            TOML engine configuration");
    eprintln!("  CANOPY_CURRENCY          Currency code (default: USD)");
    eprintln!("  CANOPY_STORE_TIMEOUT_MS  Store call timeout in milliseconds");
    eprintln!("  CANOPY_SWEEPOVER_DEPTH   Maximum ancestor walk");
}

async fn run(path: &str) -> Result<bool, SimError> {
    let config = EngineConfig::from_env()?;
    let store = Arc::new(MemoryStore::new(config.currency));
    let engine = Engine::new(store, config)?;
    let scenario = Scenario::load(path)?;
    tracing::info!("Replaying {} activations from {}", scenario.activations.len(), path);

    let summary = replay(&engine, &scenario, |line| match serde_json::to_string(&line) {
        Ok(json) => println!("{}", json),
        Err(e) => tracing::warn!("Unprintable event: {}", e),
    })
    .await?;

    println!("{}", serde_json::to_string_pretty(&summary)?);
    if !summary.conserved {
        tracing::error!("Reserve journal does not match balances");
    }
    Ok(summary.conserved)
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "canopy_sim=info,canopy=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let Some(path) = std::env::args().nth(1) else {
        print_usage();
        return ExitCode::from(2);
    };

    match run(&path).await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            tracing::error!("{}", e);
            ExitCode::FAILURE
        }
    }
}
