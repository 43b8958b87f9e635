//! HTTP ingestion collector
//!
//! Wraps posted feed payloads as Reports and sends them into the pipeline
//! named by the `ingest` section of the deployment file. The pipeline must
//! use the nats backend so the bot processes see the reports. `PORT` selects
//! the listening port (default 8080).

use std::net::SocketAddr;
use std::process;
use std::sync::Arc;

use intelflow::config::RuntimeConfig;
use intelflow::harmonization;
use intelflow::ingest::{self, IngestState};
use intelflow::pipeline;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    if let Err(e) = serve().await {
        eprintln!("Error: {}", e);
        process::exit(1);
    }
}

async fn serve() -> Result<(), String> {
    let config_path = RuntimeConfig::config_path();
    let config = RuntimeConfig::load_from_file(&config_path).map_err(|e| e.to_string())?;
    let ingest_config = config
        .ingest_config()
        .map_err(|e| format!("{}: {}", config_path.display(), e))?
        .clone();

    let registry = config
        .load_registry()
        .map_err(|e| format!("Failed to load harmonization schema: {}", e))?;
    let registry = harmonization::install(registry).map_err(|e| e.to_string())?;

    let pipeline = pipeline::connect(&config.pipeline, "intelflow-ingest", None)
        .await
        .map_err(|e| format!("Failed to connect pipeline: {}", e))?;

    let destinations = ingest_config.destination_queues.clone();
    let state = Arc::new(IngestState::new(pipeline, registry, ingest_config));
    let app = ingest::router(state);

    let port: u16 = std::env::var("PORT")
        .unwrap_or_else(|_| "8080".to_string())
        .parse()
        .map_err(|e| format!("Invalid PORT: {}", e))?;
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    tracing::info!("intelflow-ingest listening on {}", addr);
    tracing::info!("Sending reports to {:?}", destinations);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| format!("Failed to bind {}: {}", addr, e))?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            tokio::signal::ctrl_c().await.ok();
        })
        .await
        .map_err(|e| e.to_string())
}
