use anyhow::Result;
use clap::Parser;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use iptv_gateway::{
    config::Config,
    database::Database,
    repositories::{CatalogRepository, HistoryRepository, UserRepository},
    streaming::{SessionRegistry, StreamGateway},
    web::{AppState, WebServer},
};

#[derive(Parser)]
#[command(name = "iptv-gateway")]
#[command(version = "0.1.0")]
#[command(about = "IPTV gateway with shared stream sessions and variant failover")]
#[command(long_about = None)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    /// Listening IP address
    #[arg(short = 'H', long, value_name = "IP")]
    host: Option<String>,

    /// Listening port
    #[arg(short, long, value_name = "PORT")]
    port: Option<u16>,

    /// Database URL (overrides config file)
    #[arg(short = 'd', long, value_name = "URL")]
    database_url: Option<String>,

    /// Log level
    #[arg(short = 'v', long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_filter = format!("iptv_gateway={}", cli.log_level);
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| log_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting IPTV Gateway v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration from specified file
    std::env::set_var("CONFIG_FILE", &cli.config);
    let mut config = Config::load()?;
    info!("Configuration loaded from: {}", cli.config);

    // Override config with CLI arguments
    if let Some(host) = cli.host {
        config.web.host = host;
    }
    if let Some(port) = cli.port {
        config.web.port = port;
    }
    if let Some(database_url) = cli.database_url {
        config.database.url = database_url;
    }

    info!("Using database: {}", config.database.url);

    let database = Database::new(&config.database).await?;
    database.migrate().await?;
    info!("Database connection established and migrations applied");

    let catalog = CatalogRepository::new(database.pool().clone());
    let users = UserRepository::new(database.pool().clone());
    let history = HistoryRepository::new(database.pool().clone());

    let registry = SessionRegistry::new();
    let gateway = Arc::new(StreamGateway::new(
        catalog.clone(),
        history,
        registry.clone(),
        config.streaming.clone(),
    )?);
    info!(
        "Stream gateway initialized (pre-buffer {}s, {} reconnects)",
        config.streaming.pre_buffer_seconds, config.streaming.max_reconnects
    );

    let web_server = WebServer::new(AppState {
        config: config.clone(),
        catalog,
        users,
        gateway: gateway.clone(),
    })?;

    info!(
        "Starting web server on {}:{}",
        web_server.host(),
        web_server.port()
    );

    tokio::select! {
        result = web_server.serve() => result?,
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received; destroying live sessions");
            registry.shutdown_all().await;
        }
    }

    Ok(())
}
