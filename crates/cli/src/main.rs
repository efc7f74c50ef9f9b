//! agentwire CLI: the main entry point.
//!
//! Commands:
//! - `serve`: Run the WebSocket gateway backed by the loopback model
//! - `config`: Print the default configuration or its path

use clap::{Parser, Subcommand};
use std::path::PathBuf;

mod commands;
mod loopback;

#[derive(Parser)]
#[command(
    name = "agentwire",
    about = "agentwire: bidirectional streaming agent sessions",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the WebSocket gateway
    Serve {
        /// Override the port
        #[arg(short, long)]
        port: Option<u16>,

        /// Read configuration from this file instead of ~/.agentwire/config.toml
        #[arg(short, long, env = "AGENTWIRE_CONFIG")]
        config: Option<PathBuf>,

        /// Pause between words streamed by the loopback model
        #[arg(long, default_value_t = 40)]
        word_delay_ms: u64,
    },

    /// Print the default configuration
    Config {
        /// Print the config file location instead
        #[arg(long)]
        path: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve {
            port,
            config,
            word_delay_ms,
        } => commands::serve::run(port, config, word_delay_ms, cli.verbose).await?,
        Commands::Config { path } => commands::config_cmd::run(path),
    }

    Ok(())
}

/// Install the global subscriber. `RUST_LOG` wins, then `-v`, then the
/// configured filter.
pub(crate) fn init_tracing(verbose: bool, configured: &str) {
    let fallback = if verbose { "debug" } else { configured };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(fallback)),
        )
        .with_target(false)
        .init();
}
