//! # Strata Engine
//!
//! Entry point that drives the world persistence pipeline:
//! - Loads the persistence config (`strata.toml`, or the path given as the
//!   first argument)
//! - Opens and registers a world
//! - Simulates block edits and requests saves while the world keeps changing
//! - Shuts the save worker down and waits for the drain to finish

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(clippy::unwrap_used)]

mod session;

use anyhow::Result;
use std::path::PathBuf;
use strata_world::{PersistenceConfig, CONFIG_FILE};
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Main entry point.
fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive("strata=info".parse()?))
        .init();

    info!("Strata starting...");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let config_path = std::env::args()
        .nth(1)
        .map_or_else(|| PathBuf::from(CONFIG_FILE), PathBuf::from);
    let config = PersistenceConfig::load_or_default(&config_path);

    let report = session::run(&config, session::SessionPlan::default())?;
    info!(
        "Saved {} chunks ({} failed, {} written after shutdown)",
        report.stats.saved, report.stats.failed, report.stats.direct
    );

    info!("Strata shutdown complete");
    Ok(())
}
