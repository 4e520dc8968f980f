//! Tracing setup
//!
//! The engine only emits `tracing` events and spans; installing a
//! subscriber is left to the embedding process, which can call
//! `init_tracing` once at startup.

use crate::config::LogConfig;
use tracing_subscriber::EnvFilter;

pub type InitError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Filter from `RUST_LOG`, falling back to the configured level
pub fn env_filter(config: &LogConfig) -> Result<EnvFilter, InitError> {
    match EnvFilter::try_from_default_env() {
        Ok(filter) => Ok(filter),
        Err(_) => Ok(EnvFilter::try_new(&config.level)?),
    }
}

/// Install the global fmt subscriber
///
/// Fails if the level does not parse or a global subscriber is already set.
pub fn init_tracing(config: &LogConfig) -> Result<(), InitError> {
    let filter = env_filter(config)?;
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true);

    if config.json {
        builder.json().with_current_span(true).try_init()
    } else {
        builder.try_init()
    }
}
