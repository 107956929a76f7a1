//! Standalone relay for scribe sessions.
//!
//! This handles only the CLI and config file loading; the relay itself
//! lives in [`scribe_sync::server`].

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use scribe_sync::{RelayServer, ScribeConfig};

/// A publish/subscribe relay for collaborative documents.
#[derive(Parser, Debug, Clone)]
#[clap(version, about, long_about = None)]
struct Cli {
    /// Path to a TOML config file. Only the `[relay]` table is used.
    #[clap(long, short)]
    config_path: Option<PathBuf>,
    /// Address to listen on, overriding the config file.
    #[clap(long, short)]
    bind: Option<String>,
    /// Per-topic broadcast backlog, overriding the config file.
    #[clap(long)]
    topic_capacity: Option<usize>,
}

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    let mut config = match &cli.config_path {
        Some(path) => match ScribeConfig::load(path) {
            Ok(config) => config.relay,
            Err(e) => {
                log::error!("{e}");
                return ExitCode::FAILURE;
            }
        },
        None => Default::default(),
    };
    if let Some(bind) = cli.bind {
        config.bind_addr = bind;
    }
    if let Some(capacity) = cli.topic_capacity {
        config.topic_capacity = capacity;
    }

    let server = RelayServer::new(config);
    log::info!("Starting relay on {}", server.bind_addr());
    match server.run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("Relay stopped: {e}");
            ExitCode::FAILURE
        }
    }
}
