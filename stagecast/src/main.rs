mod server;

use anyhow::Result;
use clap::Parser;
use std::sync::Arc;
use tracing::info;

use stagecast_api::Coordinator;
use stagecast_core::{logging, Config};
use stagecast_sfu::LocalEngine;

use server::StagecastServer;

#[derive(Debug, Parser)]
#[command(name = "stagecast", version, about = "Media session coordinator with HLS transcode bridge")]
struct Args {
    /// Configuration file (yaml, toml or json)
    #[arg(short, long, env = "STAGECAST_CONFIG")]
    config: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // 1. Load configuration
    let config = Config::load(args.config.as_deref())?;

    // 2. Validate configuration (fail fast on misconfigurations)
    if let Err(errors) = config.validate() {
        for e in &errors {
            eprintln!("Config validation error: {e}");
        }
        anyhow::bail!(
            "Configuration validation failed with {} error(s)",
            errors.len()
        );
    }

    // 3. Initialize logging
    logging::init_logging(&config.logging)?;
    info!("Stagecast server starting...");
    info!("HTTP address: {}", config.http_address());

    // 4. Media engine and coordinator
    let engine = LocalEngine::new(&config.media);
    let coordinator = Coordinator::new(&config, Arc::new(engine));
    if config.transcode.enabled {
        info!(
            program = %config.transcode.program,
            output_dir = %config.transcode.output_dir,
            "Transcode bridge enabled"
        );
    } else {
        info!("Transcode bridge disabled");
    }

    // 5. Serve until shutdown
    StagecastServer::new(config, coordinator).start().await
}
