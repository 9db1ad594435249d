//! leafscan prediction server
//!
//! HTTP API serving a trained leafscan checkpoint: single-image upload,
//! batch prediction over server-side paths, and a health check.

mod routes;
mod state;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use leafscan::utils::config::AppConfig;
use leafscan::utils::logging::{init_logging, LogConfig};
use tracing::{info, warn};

use crate::state::{AppState, ClassifierService, ServerConfig};

/// leafscan prediction server
#[derive(Parser, Debug)]
#[command(name = "leafscan-server")]
#[command(version)]
#[command(about = "HTTP API serving a leafscan classifier")]
struct Cli {
    /// Checkpoint directory to serve
    #[arg(short, long, env = "LEAFSCAN_MODEL")]
    model: PathBuf,

    /// Host to bind to (overrides the config file)
    #[arg(long, env = "LEAFSCAN_HOST")]
    host: Option<String>,

    /// Port to listen on (overrides the config file)
    #[arg(short, long, env = "LEAFSCAN_PORT")]
    port: Option<u16>,

    /// TOML configuration file
    #[arg(short, long, env = "LEAFSCAN_CONFIG")]
    config: Option<PathBuf>,

    /// Load the model on the first request instead of at startup
    #[arg(long, default_value = "false")]
    lazy: bool,

    /// Enable verbose logging
    #[arg(short, long, default_value = "false")]
    verbose: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    init_logging(&LogConfig::from_verbosity(cli.verbose))?;

    let app_config = AppConfig::load_or_default(cli.config.as_deref())?;
    let host = cli.host.unwrap_or_else(|| app_config.server.host.clone());
    let port = cli.port.unwrap_or(app_config.server.port);

    let config = ServerConfig {
        checkpoint_dir: cli.model,
        resize_margin: app_config.data.resize_margin,
        top_k: app_config.server.top_k,
    };

    info!("leafscan server v{}", leafscan::VERSION);
    info!("  Model:  {:?}", config.checkpoint_dir);
    info!("  Top-k:  {}", config.top_k);

    let service = ClassifierService::new(config);
    if cli.lazy {
        warn!("Lazy loading enabled; the model loads on the first request");
    } else {
        service.predictor().await?;
    }

    let app = routes::router(Arc::new(AppState::new(service)));

    let addr: SocketAddr = format!("{}:{}", host, port).parse()?;
    info!("Starting server on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
