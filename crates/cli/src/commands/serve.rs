//! `agentwire serve`: Start the WebSocket gateway.

use anyhow::Context;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use agentwire_config::AppConfig;
use agentwire_session::SessionManager;

use crate::loopback::{LoopbackModel, demo_tools};

pub async fn run(
    port_override: Option<u16>,
    config_path: Option<PathBuf>,
    word_delay_ms: u64,
    verbose: bool,
) -> anyhow::Result<()> {
    let mut config = match &config_path {
        Some(path) => AppConfig::load_from(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => AppConfig::load().context("Failed to load config")?,
    };
    if let Some(port) = port_override {
        config.gateway.port = port;
    }
    crate::init_tracing(verbose, &config.log_level);

    println!("agentwire gateway");
    println!(
        "   Listening: ws://{}:{}/v1/ws",
        config.gateway.host, config.gateway.port
    );
    println!("   Model:     loopback (echo)");

    let tools = demo_tools();
    info!(
        tools = ?tools.names(),
        context = ?config.context.strategy,
        heartbeat = config.heartbeat.enabled,
        "Starting gateway"
    );
    let model = Arc::new(LoopbackModel::new(Duration::from_millis(word_delay_ms)));
    let manager = SessionManager::new(config, model, tools);

    agentwire_gateway::serve(Arc::new(manager))
        .await
        .context("Gateway failed")?;
    Ok(())
}
