//! WolfRelay - Primary/Replica Log Replication
//!
//! Runs a node: the optional primary role (source log plus dump service),
//! the configured replication links, and the HTTP admin API.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use wolfrelay::api::{AppState, HttpServer};
use wolfrelay::binlog::{EventLog, LogKind, LogOptions};
use wolfrelay::config::{ExecutorConfig, LoggingConfig, WolfRelayConfig};
use wolfrelay::dump::DumpServer;
use wolfrelay::error::{Error, Result};
use wolfrelay::link::LinkRegistry;
use wolfrelay::network::tls;

/// WolfRelay - Primary/Replica Log Replication
#[derive(Parser)]
#[command(name = "wolfrelay")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "wolfrelay.toml")]
    config: PathBuf,

    /// Log level override (trace, debug, info, warn, error)
    #[arg(short, long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the node
    Start,

    /// Show link status of a running node
    Status {
        /// Node API address to query
        #[arg(short, long, default_value = "localhost:8080")]
        address: String,
    },

    /// Initialize a new configuration file
    Init {
        /// Output path for configuration file
        #[arg(short, long, default_value = "wolfrelay.toml")]
        output: PathBuf,

        /// Server id of the new node
        #[arg(long, default_value_t = 1)]
        server_id: u32,
    },

    /// Validate configuration file
    Validate,

    /// Show node information
    Info,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let logging = WolfRelayConfig::from_file(&cli.config)
        .map(|c| c.logging)
        .unwrap_or_default();
    init_logging(
        cli.log_level.as_deref().unwrap_or(&logging.level),
        &logging,
    );

    match cli.command {
        Commands::Start => run_start(cli.config).await,
        Commands::Status { address } => run_status(address).await,
        Commands::Init { output, server_id } => run_init(output, server_id),
        Commands::Validate => run_validate(cli.config),
        Commands::Info => run_info(cli.config),
    }
}

/// Initialize logging
fn init_logging(level: &str, logging: &LoggingConfig) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| level.into());

    let registry = tracing_subscriber::registry().with(env_filter);
    if logging.format == "json" {
        registry
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

/// Start the node
async fn run_start(config_path: PathBuf) -> Result<()> {
    tracing::info!("Starting WolfRelay node...");

    let config = match WolfRelayConfig::from_file(&config_path) {
        Ok(c) => c,
        Err(e) => {
            tracing::error!("Failed to load configuration from {:?}: {}", config_path, e);
            return Err(e);
        }
    };
    tracing::info!("Loaded configuration for server id {}", config.node.server_id);

    if let Err(e) = std::fs::create_dir_all(config.data_dir()) {
        tracing::error!("Failed to create data directory {:?}: {}", config.data_dir(), e);
        return Err(e.into());
    }

    // Primary role
    let primary = if config.primary.enabled {
        let log = EventLog::open(
            config.binlog_dir(),
            LogOptions {
                basename: config.primary.log_basename.clone(),
                max_segment_size: config.primary.segment_size_mb * 1024 * 1024,
                fsync: config.primary.fsync,
                server_id: config.node.server_id,
                kind: LogKind::Source,
            },
        )?;
        tracing::info!("Source log open, end at {}", log.end());

        let acceptor = match (&config.primary.tls_cert, &config.primary.tls_key) {
            (Some(cert), Some(key)) => Some(tls::server_acceptor(cert, key)?),
            _ => None,
        };
        let server = Arc::new(DumpServer::new(
            config.node.server_id,
            Arc::new(log),
            acceptor,
        ));
        let listener = tokio::net::TcpListener::bind(&config.primary.bind_address).await?;
        let serving = Arc::clone(&server);
        tokio::spawn(async move {
            if let Err(e) = serving.serve(listener).await {
                tracing::error!("Dump service error: {}", e);
            }
        });
        Some(server)
    } else {
        None
    };

    // Replication links
    let links = Arc::new(LinkRegistry::open(&config).await?);
    links.start_configured().await;

    // Admin API
    let shutdown = CancellationToken::new();
    let http = HttpServer::new(
        config.api.clone(),
        AppState {
            server_id: config.node.server_id,
            links: Arc::clone(&links),
            primary: primary.clone(),
            started: Instant::now(),
        },
    );
    let http_shutdown = shutdown.clone();
    let http_handle = tokio::spawn(async move {
        if let Err(e) = http.start(http_shutdown).await {
            tracing::error!("HTTP server error: {}", e);
        }
    });

    tokio::signal::ctrl_c()
        .await
        .map_err(|e| Error::Internal(format!("signal handler: {}", e)))?;
    tracing::info!("Received shutdown signal");

    shutdown.cancel();
    links.shutdown().await;
    if let Some(server) = primary {
        server.shutdown();
        server.log().close(true).await?;
    }
    if let Err(e) = http_handle.await {
        tracing::warn!("HTTP task ended abnormally: {}", e);
    }

    tracing::info!("WolfRelay shutdown complete");
    Ok(())
}

/// Print link status from a running node
async fn run_status(address: String) -> Result<()> {
    let url = format!("http://{}/links", address);

    match reqwest::get(&url).await {
        Ok(response) => {
            let status: serde_json::Value = response
                .json()
                .await
                .map_err(|e| Error::Network(e.to_string()))?;
            println!("{}", serde_json::to_string_pretty(&status)?);
            Ok(())
        }
        Err(e) => {
            eprintln!("Failed to get status: {}", e);
            Err(Error::Network(e.to_string()))
        }
    }
}

/// Initialize configuration file
fn run_init(output: PathBuf, server_id: u32) -> Result<()> {
    let config_content = format!(
        r#"# WolfRelay Configuration
# Generated configuration file

[node]
server_id = {server_id}
data_dir = "/var/lib/wolfrelay"
replicate_same_server_id = false

[primary]
enabled = true
bind_address = "0.0.0.0:7700"
log_basename = "wolfrelay-bin"
segment_size_mb = 64
fsync = true
# tls_cert = "/etc/wolfrelay/server.pem"
# tls_key = "/etc/wolfrelay/server.key"

[relay_log]
segment_size_mb = 64
space_limit_mb = 0
purge = true
checkpoint_every = 1

[apply]
max_group_retries = 10
retry_backoff_ms = 1000
retry_backoff_max_ms = 5000

# [[links]]
# name = "upstream"
# host = "primary.example.com"
# port = 7700
# connect_retry_secs = 60
# heartbeat_period_ms = 30000
# ignore_server_ids = []
#
# [links.executor]
# kind = "mariadb"
# host = "localhost"
# user = "wolfrelay"
# password = "changeme"
#
# [links.filter]
# do_db = ["app"]
# rewrite_db = ["app->app_copy"]

[api]
enabled = true
bind_address = "0.0.0.0:8080"
cors_enabled = false

[logging]
level = "info"
format = "pretty"
"#
    );

    std::fs::write(&output, config_content)?;
    println!("Configuration file created: {}", output.display());
    println!("\nEdit the file to configure the primary role and replication links.");
    println!("Then start with: wolfrelay --config {} start", output.display());

    Ok(())
}

/// Validate configuration file
fn run_validate(config_path: PathBuf) -> Result<()> {
    match WolfRelayConfig::from_file(&config_path) {
        Ok(config) => {
            println!("✓ Configuration is valid");
            println!("  Server ID: {}", config.node.server_id);
            if config.primary.enabled {
                println!("  Primary: {}", config.primary.bind_address);
            }
            println!("  Links: {}", config.links.len());
            Ok(())
        }
        Err(e) => {
            eprintln!("✗ Configuration error: {}", e);
            Err(e)
        }
    }
}

/// Show node information
fn run_info(config_path: PathBuf) -> Result<()> {
    let config = WolfRelayConfig::from_file(&config_path)?;

    println!("WolfRelay Node Information");
    println!("==========================");
    println!();
    println!("Server ID:        {}", config.node.server_id);
    println!("Data Directory:   {}", config.data_dir().display());
    println!();
    println!("Primary Role:");
    if config.primary.enabled {
        println!("  Dump Service:   {}", config.primary.bind_address);
        println!("  Log Basename:   {}", config.primary.log_basename);
        println!("  Segment Size:   {} MB", config.primary.segment_size_mb);
        println!("  Fsync:          {}", config.primary.fsync);
        println!(
            "  TLS:            {}",
            config.primary.tls_cert.is_some() && config.primary.tls_key.is_some()
        );
    } else {
        println!("  (disabled)");
    }
    println!();
    println!("Relay Log:");
    println!("  Segment Size:   {} MB", config.relay_log.segment_size_mb);
    println!("  Space Limit:    {} MB", config.relay_log.space_limit_mb);
    println!("  Purge:          {}", config.relay_log.purge);
    println!();
    println!("Links:");
    for link in &config.links {
        let executor = match &link.executor {
            ExecutorConfig::Recording => "recording".to_string(),
            ExecutorConfig::Mariadb(db) => format!("mariadb {}:{}", db.host, db.port),
        };
        println!(
            "  {:<14}  {}:{}  auto_start={}  executor={}",
            link.name, link.host, link.port, link.auto_start, executor
        );
    }

    Ok(())
}
