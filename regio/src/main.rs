//! The `regio` server binary.

use std::path::Path;

use anyhow::Context;
use regio::RegioServer;
use regio::config::{CONFIG_PATH, RegioConfig};
use regio::logger;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = RegioConfig::load_or_create(Path::new(CONFIG_PATH))
        .with_context(|| format!("failed to load {CONFIG_PATH}"))?;
    logger::init(&config.log_filter)?;

    let server = RegioServer::new(&config)?;
    server.start().await;
    Ok(())
}
