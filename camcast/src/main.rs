mod server;

use anyhow::Result;
use clap::Parser;
use std::sync::Arc;
use tracing::info;

use camcast_api::Gateway;
use camcast_core::{logging, Config};
use camcast_sfu::engine::{loopback::LoopbackEngine, MediaEngine};
use camcast_sfu::{Recorder, RoomRegistry, SfuConfig, WorkerPool};

use server::{CamcastServer, ShutdownReason};

#[derive(Parser, Debug)]
#[command(name = "camcast")]
#[command(about = "camcast SFU signaling and recording server", long_about = None)]
struct Args {
    /// Configuration file (YAML or TOML)
    #[arg(long, env = "CAMCAST_CONFIG_PATH")]
    config: Option<String>,

    /// Number of media workers (overrides sfu.num_workers)
    #[arg(long)]
    workers: Option<usize>,

    /// HTTP listen port (overrides server.http_port)
    #[arg(long)]
    http_port: Option<u16>,
}

/// Load configuration, falling back to `config.yaml` in the working directory
fn load_config(args: &Args) -> Result<Config> {
    let path = args.config.clone().or_else(|| {
        std::path::Path::new("config.yaml")
            .exists()
            .then(|| "config.yaml".to_string())
    });

    let mut config = match path {
        Some(path) => {
            eprintln!("Loading config from {path}");
            Config::from_file(&path)?
        }
        None => Config::from_env()?,
    };

    if let Some(workers) = args.workers {
        config.sfu.num_workers = workers;
    }
    if let Some(port) = args.http_port {
        config.server.http_port = port;
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // 1. Load configuration
    let config = load_config(&args)?;

    // 1.5. Validate configuration (fail fast on misconfigurations)
    if let Err(errors) = config.validate() {
        for e in &errors {
            eprintln!("Config validation error: {e}");
        }
        return Err(anyhow::anyhow!(
            "Configuration validation failed with {} error(s)",
            errors.len()
        ));
    }

    // 2. Initialize logging
    logging::init_logging(&config.logging)?;
    info!("camcast server starting...");
    info!("HTTP address: {}", config.http_address());

    // 3. Media workers; the server cannot do anything without them
    let sfu_config = SfuConfig::from_settings(&config.sfu)?;
    let engine: Arc<dyn MediaEngine> = Arc::new(LoopbackEngine::new());
    let pool = WorkerPool::initialize(engine, &sfu_config).await?;
    info!("Worker pool ready with {} worker(s)", pool.workers().len());

    // 4. Rooms, recording and signaling
    let registry = Arc::new(RoomRegistry::new(Arc::clone(&pool), sfu_config.max_rooms));
    let recorder = Arc::new(Recorder::from_config(
        config.recording.clone(),
        sfu_config.request_timeout,
    )?);
    let gateway = Arc::new(Gateway::new(registry, recorder, sfu_config));

    // 5. Serve until shutdown
    let reason = CamcastServer::new(config, gateway).start().await?;
    if let ShutdownReason::WorkerDied(death) = reason {
        eprintln!("Media worker {} died: {}", death.worker_id, death.reason);
        std::process::exit(1);
    }

    info!("camcast server stopped");
    Ok(())
}
