//! Logging setup.
//!
//! Libraries log through the `log` facade. Those records are bridged into `tracing` and printed by
//! a `fmt` subscriber filtered by `RUST_LOG`, or by the configured directive when it is unset.

use anyhow::Context;
use tracing::subscriber;
use tracing_log::LogTracer;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, fmt};

/// Installs the global subscriber. Fails if one is already installed.
pub fn init(default_filter: &str) -> anyhow::Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(default_filter)
            .with_context(|| format!("invalid log filter {default_filter:?}"))?,
    };
    let subscriber = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_thread_names(true).with_target(false));
    subscriber::set_global_default(subscriber).context("a tracing subscriber is already set")?;
    LogTracer::init().context("a log implementation is already set")?;
    Ok(())
}
