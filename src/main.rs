//! LedgerMirror - Peer-to-peer replication for self-hosted ledgers
//!
//! Runs one instance: the federation and management API plus the
//! scheduled sync rounds with registered mirrors.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use ledgermirror::api::HttpServer;
use ledgermirror::config::{LedgerMirrorConfig, LoggingConfig};
use ledgermirror::error::Result;
use ledgermirror::replication::{HttpTransport, ReplicationConfig, ReplicationService, SyncOrchestrator};
use ledgermirror::signing::InstanceKey;
use ledgermirror::store::Store;

/// LedgerMirror - Peer-to-peer replication for self-hosted ledgers
#[derive(Parser)]
#[command(name = "ledgermirror")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "ledgermirror.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error); overrides the config file
    #[arg(short, long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the instance
    Start,

    /// Initialize a new configuration file
    Init {
        /// Output path for configuration file
        #[arg(short, long, default_value = "ledgermirror.toml")]
        output: PathBuf,

        /// Public instance identifier
        #[arg(long, default_value = "finance.example.com")]
        instance_id: String,
    },

    /// Validate configuration file
    Validate,

    /// Show instance information
    Info,

    /// Create the instance key if missing and print the public key
    Keygen,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let logging = LedgerMirrorConfig::from_file(&cli.config)
        .map(|c| c.logging)
        .unwrap_or_default();
    init_logging(cli.log_level.as_deref().unwrap_or(&logging.level), &logging);

    match cli.command {
        Commands::Start => run_start(cli.config).await,
        Commands::Init { output, instance_id } => run_init(output, instance_id),
        Commands::Validate => run_validate(cli.config),
        Commands::Info => run_info(cli.config),
        Commands::Keygen => run_keygen(cli.config),
    }
}

/// Initialize the logging system
fn init_logging(level: &str, logging: &LoggingConfig) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| level.into());

    let registry = tracing_subscriber::registry().with(env_filter);
    match logging.format.as_str() {
        "compact" => registry.with(tracing_subscriber::fmt::layer().compact()).init(),
        _ => registry.with(tracing_subscriber::fmt::layer()).init(),
    }
}

/// Start the instance
async fn run_start(config_path: PathBuf) -> Result<()> {
    tracing::info!("Starting LedgerMirror instance...");

    // Load configuration
    let config = match LedgerMirrorConfig::from_file(&config_path) {
        Ok(c) => c,
        Err(e) => {
            tracing::error!("Failed to load configuration from {:?}: {}", config_path, e);
            return Err(e);
        }
    };
    tracing::info!("Loaded configuration for instance: {}", config.instance.id);

    let store = Arc::new(Store::open(&config.database_path())?);
    tracing::info!("Ledger database: {}", config.database_path().display());

    let key = match InstanceKey::load_or_generate(&config.key_path()) {
        Ok(k) => Arc::new(k),
        Err(e) => {
            tracing::error!("Cannot use instance key: {}", e);
            return Err(e);
        }
    };
    tracing::info!("Instance public key: {}", key.public_key_base64());

    let service = Arc::new(ReplicationService::new(
        ReplicationConfig::from_config(&config),
        store,
        key,
    ));
    let transport = Arc::new(HttpTransport::new(config.request_timeout())?);
    let orchestrator = Arc::new(SyncOrchestrator::new(service.clone(), transport));

    let scheduler = match config.sync_interval() {
        Some(period) => Some(orchestrator.clone().spawn_scheduler(period)),
        None => {
            tracing::info!("Scheduled sync disabled; rounds run on demand only");
            None
        }
    };

    let server = HttpServer::new(config.api.clone(), service, orchestrator);

    let result = tokio::select! {
        result = server.start() => result,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Received shutdown signal");
            Ok(())
        }
    };

    if let Some(handle) = scheduler {
        handle.abort();
    }
    tracing::info!("LedgerMirror shutdown complete");
    result
}

/// Initialize a new configuration file
fn run_init(output: PathBuf, instance_id: String) -> Result<()> {
    let config_content = format!(
        r#"# LedgerMirror Configuration
# Generated configuration file

[instance]
id = "{instance_id}"
data_dir = "/var/lib/ledgermirror"
# key_file = "/var/lib/ledgermirror/secrets/instance.key"
# Rank under the primary_wins strategy (1 = primary). Leave unset to let
# priority 1 mirrors win and keep local data against all others.
# priority = 2

[replication]
# 0 disables scheduled sync-all rounds
sync_interval_secs = 300
request_timeout_secs = 30
first_sync_lookback_days = 7
require_known_peer = true

[replication.default_strategy]
# last_write_wins | primary_wins | manual
strategy = "last_write_wins"
# primary_instance_id = "hq.example.com"

[api]
enabled = true
bind_address = "0.0.0.0:8080"
cors_enabled = false
# admin_token = "change-me"

[logging]
level = "info"
format = "pretty"
"#
    );

    std::fs::write(&output, config_content)?;
    println!("Configuration file created: {}", output.display());
    println!("\nEdit the file to set your instance id and API token.");
    println!("Then create the instance key with: ledgermirror keygen --config {}", output.display());

    Ok(())
}

/// Validate configuration
fn run_validate(config_path: PathBuf) -> Result<()> {
    match LedgerMirrorConfig::from_file(&config_path) {
        Ok(config) => {
            println!("✓ Configuration is valid");
            println!("  Instance ID: {}", config.instance.id);
            println!("  Priority: {}", priority_label(config.instance.priority));
            println!("  API: {}", config.api.bind_address);
            println!("  Default strategy: {}", config.replication.default_strategy.name());
            Ok(())
        }
        Err(e) => {
            eprintln!("✗ Configuration error: {}", e);
            Err(e)
        }
    }
}

fn priority_label(priority: Option<i32>) -> String {
    priority.map_or_else(|| "unset".to_string(), |p| p.to_string())
}

/// Show instance information
fn run_info(config_path: PathBuf) -> Result<()> {
    let config = LedgerMirrorConfig::from_file(&config_path)?;

    println!("LedgerMirror Instance Information");
    println!("=================================");
    println!();
    println!("Instance ID:      {}", config.instance.id);
    println!("Priority:         {}", priority_label(config.instance.priority));
    println!("Data Directory:   {}", config.data_dir().display());
    println!("Database:         {}", config.database_path().display());
    println!("Key File:         {}", config.key_path().display());
    println!();
    println!("Replication:");
    match config.sync_interval() {
        Some(period) => println!("  Sync Interval:  {} s", period.as_secs()),
        None => println!("  Sync Interval:  disabled"),
    }
    println!("  Timeout:        {} s", config.replication.request_timeout_secs);
    println!("  First Lookback: {} days", config.replication.first_sync_lookback_days);
    println!("  Known Peers:    {}", if config.replication.require_known_peer { "required" } else { "optional" });
    println!("  Strategy:       {}", config.replication.default_strategy.name());
    println!();
    println!("API:");
    println!("  Enabled:        {}", config.api.enabled);
    println!("  Bind Address:   {}", config.api.bind_address);
    println!("  Admin Token:    {}", if config.api.admin_token.is_some() { "set" } else { "not set" });

    Ok(())
}

/// Print the public key peers need to register this instance
fn run_keygen(config_path: PathBuf) -> Result<()> {
    let config = LedgerMirrorConfig::from_file(&config_path)?;
    let key = InstanceKey::load_or_generate(&config.key_path())?;

    println!("Instance ID: {}", config.instance.id);
    println!("Public key:  {}", key.public_key_base64());
    Ok(())
}
