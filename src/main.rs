//! Upload Gateway - streaming uploads to S3-compatible storage

use anyhow::Context;
use clap::{Parser, ValueEnum};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use upload_gateway::config::Config;
use upload_gateway::metrics::server::{MetricsServer, MetricsServerConfig};
use upload_gateway::s3::{BucketInitializer, ObjectStore, S3Client};
use upload_gateway::server::{AppState, HttpServer};
use upload_gateway::upload::{UploadService, UploadSettings};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormat {
    Json,
    Pretty,
}

/// Upload Gateway - streaming file uploads to S3-compatible storage
#[derive(Parser, Debug)]
#[command(name = "upload-gateway")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "config.yaml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error); RUST_LOG takes precedence
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Log output format
    #[arg(long, value_enum, default_value = "json")]
    log_format: LogFormat,
}

fn init_logging(args: &Args) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&args.log_level))
        .context("invalid log level")?;

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true);

    let result = match args.log_format {
        LogFormat::Json => builder.json().with_thread_ids(true).try_init(),
        LogFormat::Pretty => builder.pretty().try_init(),
    };
    result.map_err(|e| anyhow::anyhow!("failed to initialize logging: {}", e))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging(&args)?;

    info!("Starting Upload Gateway v{}", upload_gateway::VERSION);

    let config = Config::load(&args.config)
        .with_context(|| format!("failed to load configuration from {:?}", args.config))?;
    info!(path = ?args.config, "Loaded configuration");

    let client = S3Client::new(&config.storage).context("failed to create S3 client")?;
    info!(
        endpoint = %client.endpoint(),
        region = %client.region(),
        bucket = %client.bucket(),
        "Object store configured"
    );
    let store: Arc<dyn ObjectStore> = Arc::new(client);

    BucketInitializer::new(
        store.clone(),
        config.storage.init_attempts,
        Duration::from_millis(config.storage.init_retry_delay_ms),
    )
    .ensure_bucket()
    .await
    .context("failed to initialize bucket")?;

    let mut metrics_server = if config.metrics.enabled {
        let mut server = MetricsServer::new(MetricsServerConfig::for_port(config.metrics.port));
        let addr = server.start().await.context("failed to start metrics server")?;
        info!(address = %addr, "Metrics server listening");
        Some(server)
    } else {
        None
    };

    let service = UploadService::new(store, UploadSettings::from(&config.upload));
    let server = HttpServer::bind(&config.server.address, AppState::new(service)).await?;

    server
        .run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "Failed to listen for shutdown signal");
                std::future::pending::<()>().await;
            }
            info!("Shutdown signal received");
        })
        .await?;

    if let Some(metrics_server) = metrics_server.as_mut() {
        metrics_server.shutdown().await;
    }

    info!("Upload Gateway stopped");
    Ok(())
}
