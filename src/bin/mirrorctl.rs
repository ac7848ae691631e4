//! MirrorCtl - Command line tool for managing LedgerMirror instances
//!
//! Usage:
//!   mirrorctl status              - Show round state for every mirror
//!   mirrorctl mirrors list        - List registered mirrors
//!   mirrorctl sync <id>           - Run a sync round with one mirror
//!   mirrorctl conflicts           - Show conflicts awaiting an operator

use clap::{Parser, Subcommand};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::json;
use std::path::PathBuf;

use ledgermirror::model::{ConflictPolicy, LogSummary, MirrorInstance, SyncLogEntry};

/// LedgerMirror Control Tool
#[derive(Parser)]
#[command(name = "mirrorctl")]
#[command(about = "Control and monitor LedgerMirror instances", long_about = None)]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "ledgermirror.toml")]
    config: PathBuf,

    /// API endpoint to connect to (overrides config)
    #[arg(short, long)]
    endpoint: Option<String>,

    /// Admin token (overrides config)
    #[arg(short, long)]
    token: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show round state for every mirror
    Status,
    /// Show this instance's id and public key
    Identity,
    /// Manage registered mirrors
    Mirrors {
        #[command(subcommand)]
        action: MirrorAction,
    },
    /// Run a sync round with one mirror
    Sync {
        /// Mirror id
        id: i64,
    },
    /// Run sync rounds with every enabled mirror
    SyncAll,
    /// Show recent sync log entries of a mirror
    Logs {
        /// Mirror id
        id: i64,
        #[arg(short, long, default_value_t = 100)]
        limit: u32,
    },
    /// Show outcome counts of a mirror
    Summary {
        /// Mirror id
        id: i64,
    },
    /// Show conflicts awaiting an operator
    Conflicts {
        #[arg(short, long, default_value_t = 50)]
        limit: u32,
    },
    /// Show or change conflict policies
    Policy {
        #[command(subcommand)]
        action: PolicyAction,
    },
}

#[derive(Subcommand)]
enum MirrorAction {
    /// List registered mirrors
    List,
    /// Register a mirror
    Add {
        /// Peer instance id (e.g. finance.example.com)
        #[arg(long)]
        instance_id: String,
        /// Peer base URL
        #[arg(long)]
        url: String,
        /// Peer public key (base64)
        #[arg(long)]
        public_key: String,
        /// push, pull or bidirectional
        #[arg(long, default_value = "bidirectional")]
        direction: String,
        /// Rank under primary-wins (1 = primary)
        #[arg(long, default_value_t = 2)]
        priority: i32,
    },
    /// Change a mirror's direction or priority
    Set {
        id: i64,
        #[arg(long)]
        direction: Option<String>,
        #[arg(long)]
        priority: Option<i32>,
        #[arg(long)]
        url: Option<String>,
    },
    /// Include a mirror in sync-all
    Enable { id: i64 },
    /// Exclude a mirror from sync-all
    Disable { id: i64 },
    /// Remove a mirror and its sync log
    Remove { id: i64 },
}

#[derive(Subcommand)]
enum PolicyAction {
    /// Show the policy for transaction or account
    Get { entity_type: String },
    /// Set the policy for transaction or account
    Set {
        entity_type: String,
        /// last_write_wins, primary_wins or manual
        strategy: String,
        /// Explicit primary for primary_wins
        #[arg(long)]
        primary: Option<String>,
    },
}

// ============ API Response Types ============

#[derive(Debug, Deserialize)]
struct StatusResponse {
    #[serde(default)]
    instance_id: String,
    #[serde(default)]
    mirrors: Vec<MirrorStatus>,
}

#[derive(Debug, Deserialize)]
struct MirrorStatus {
    #[serde(default)]
    mirror_id: i64,
    #[serde(default)]
    instance_id: String,
    #[serde(default)]
    sync_enabled: bool,
    #[serde(default)]
    state: String,
    #[serde(default)]
    last_sync: Option<String>,
}

#[derive(Debug, Deserialize)]
struct IdentityResponse {
    instance_id: String,
    public_key: String,
}

#[derive(Debug, Deserialize)]
struct RoundResult {
    #[serde(default)]
    instance_id: String,
    #[serde(default)]
    state: String,
    #[serde(default)]
    pushed: u64,
    #[serde(default)]
    pulled: Option<PulledStats>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct PulledStats {
    #[serde(default)]
    created: u64,
    #[serde(default)]
    updated: u64,
    #[serde(default)]
    took_remote: u64,
    #[serde(default)]
    kept_local: u64,
    #[serde(default)]
    conflicts: u64,
    #[serde(default)]
    failed: u64,
}

#[derive(Debug, Deserialize)]
struct SyncAllResult {
    #[serde(default)]
    synced_count: usize,
    #[serde(default)]
    failed_count: usize,
    #[serde(default)]
    skipped: Vec<String>,
    #[serde(default)]
    results: Vec<RoundResult>,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: String,
    code: String,
}

// ============ Config ============

#[derive(Debug, Deserialize)]
struct Config {
    #[serde(default)]
    api: ApiConfig,
}

#[derive(Debug, Deserialize, Default)]
struct ApiConfig {
    #[serde(default = "default_api_bind")]
    bind_address: String,
    #[serde(default)]
    admin_token: Option<String>,
}

fn default_api_bind() -> String {
    "0.0.0.0:8080".to_string()
}

// ============ API Client ============

type CmdResult = Result<(), Box<dyn std::error::Error>>;

struct Api {
    endpoint: String,
    token: Option<String>,
    client: reqwest::Client,
}

impl Api {
    async fn call<T: DeserializeOwned>(
        &self,
        method: reqwest::Method,
        path: &str,
        body: Option<serde_json::Value>,
    ) -> Result<Option<T>, Box<dyn std::error::Error>> {
        let url = format!("{}{}", self.endpoint, path);
        let mut request = self.client.request(method, &url);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }
        if let Some(body) = body {
            request = request.json(&body);
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(match serde_json::from_str::<ErrorBody>(&text) {
                Ok(err) => format!("{} ({}): {}", status, err.code, err.error).into(),
                Err(_) => format!("API error: {} {}", status, text).into(),
            });
        }
        if status == reqwest::StatusCode::NO_CONTENT {
            return Ok(None);
        }
        Ok(Some(response.json().await?))
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, Box<dyn std::error::Error>> {
        self.call(reqwest::Method::GET, path, None)
            .await?
            .ok_or_else(|| "empty response".into())
    }

    async fn send<T: DeserializeOwned>(
        &self,
        method: reqwest::Method,
        path: &str,
        body: Option<serde_json::Value>,
    ) -> Result<T, Box<dyn std::error::Error>> {
        self.call(method, path, body)
            .await?
            .ok_or_else(|| "empty response".into())
    }
}

// ============ Main ============

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let config = std::fs::read_to_string(&cli.config)
        .ok()
        .and_then(|content| toml::from_str::<Config>(&content).ok());

    // Determine API endpoint
    let endpoint = match &cli.endpoint {
        Some(e) => e.trim_end_matches('/').to_string(),
        None => match &config {
            Some(config) => {
                // Convert bind address to localhost if it's 0.0.0.0
                let addr = &config.api.bind_address;
                if addr.starts_with("0.0.0.0") {
                    format!("http://127.0.0.1:{}", addr.split(':').nth(1).unwrap_or("8080"))
                } else {
                    format!("http://{}", addr)
                }
            }
            None => "http://127.0.0.1:8080".to_string(),
        },
    };
    let token = cli
        .token
        .clone()
        .or_else(|| config.and_then(|c| c.api.admin_token));

    let api = Api {
        endpoint,
        token,
        client: reqwest::Client::new(),
    };

    let result = match cli.command {
        Commands::Status => show_status(&api).await,
        Commands::Identity => show_identity(&api).await,
        Commands::Mirrors { action } => match action {
            MirrorAction::List => list_mirrors(&api).await,
            MirrorAction::Add { instance_id, url, public_key, direction, priority } => {
                add_mirror(&api, instance_id, url, public_key, direction, priority).await
            }
            MirrorAction::Set { id, direction, priority, url } => {
                let mut patch = serde_json::Map::new();
                if let Some(direction) = direction {
                    patch.insert("sync_direction".into(), json!(direction));
                }
                if let Some(priority) = priority {
                    patch.insert("priority".into(), json!(priority));
                }
                if let Some(url) = url {
                    patch.insert("instance_url".into(), json!(url));
                }
                update_mirror(&api, id, serde_json::Value::Object(patch)).await
            }
            MirrorAction::Enable { id } => update_mirror(&api, id, json!({"sync_enabled": true})).await,
            MirrorAction::Disable { id } => update_mirror(&api, id, json!({"sync_enabled": false})).await,
            MirrorAction::Remove { id } => remove_mirror(&api, id).await,
        },
        Commands::Sync { id } => sync_mirror(&api, id).await,
        Commands::SyncAll => sync_all(&api).await,
        Commands::Logs { id, limit } => show_logs(&api, id, limit).await,
        Commands::Summary { id } => show_summary(&api, id).await,
        Commands::Conflicts { limit } => show_conflicts(&api, limit).await,
        Commands::Policy { action } => match action {
            PolicyAction::Get { entity_type } => show_policy(&api, &entity_type).await,
            PolicyAction::Set { entity_type, strategy, primary } => {
                set_policy(&api, &entity_type, strategy, primary).await
            }
        },
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

// ============ Commands ============

async fn show_status(api: &Api) -> CmdResult {
    let status: StatusResponse = api.get("/replication/status").await?;

    println!();
    println!("LedgerMirror Status (mirrorctl v{})", env!("CARGO_PKG_VERSION"));
    println!("========================================");
    println!();
    println!("Instance: {}", status.instance_id);
    println!();
    println!("{:<6} {:<30} {:<10} {:<10} {}", "ID", "INSTANCE", "ENABLED", "STATE", "LAST SYNC");
    println!("{}", "-".repeat(80));

    for mirror in &status.mirrors {
        // Pad state to fixed width BEFORE adding color codes
        let state_padded = format!("{:<10}", mirror.state);
        let state_colored = match mirror.state.as_str() {
            "done" => format!("\x1b[32m{}\x1b[0m", state_padded),
            "pushing" | "pulling" => format!("\x1b[33m{}\x1b[0m", state_padded),
            "failed" => format!("\x1b[31m{}\x1b[0m", state_padded),
            _ => state_padded,
        };
        println!(
            "{:<6} {:<30} {:<10} {} {}",
            mirror.mirror_id,
            mirror.instance_id,
            if mirror.sync_enabled { "yes" } else { "no" },
            state_colored,
            mirror.last_sync.as_deref().unwrap_or("never")
        );
    }
    println!();

    Ok(())
}

async fn show_identity(api: &Api) -> CmdResult {
    let identity: IdentityResponse = api.get("/replication/identity").await?;
    println!("Instance ID: {}", identity.instance_id);
    println!("Public key:  {}", identity.public_key);
    Ok(())
}

async fn list_mirrors(api: &Api) -> CmdResult {
    let mirrors: Vec<MirrorInstance> = api.get("/replication/mirrors").await?;

    println!();
    println!("{:<6} {:<30} {:<35} {:<14} {:<8} {}", "ID", "INSTANCE", "URL", "DIRECTION", "PRIO", "ENABLED");
    println!("{}", "-".repeat(105));
    for m in &mirrors {
        println!(
            "{:<6} {:<30} {:<35} {:<14} {:<8} {}",
            m.id,
            m.instance_id,
            m.instance_url,
            m.sync_direction.as_str(),
            m.priority,
            if m.sync_enabled { "yes" } else { "no" }
        );
    }
    println!();
    println!("{} mirror(s)", mirrors.len());

    Ok(())
}

async fn add_mirror(
    api: &Api,
    instance_id: String,
    url: String,
    public_key: String,
    direction: String,
    priority: i32,
) -> CmdResult {
    let mirror: MirrorInstance = api
        .send(
            reqwest::Method::POST,
            "/replication/mirrors",
            Some(json!({
                "instance_id": instance_id,
                "instance_url": url,
                "public_key": public_key,
                "sync_direction": direction,
                "priority": priority,
            })),
        )
        .await?;
    println!("✓ Registered {} as mirror {}", mirror.instance_id, mirror.id);
    Ok(())
}

async fn update_mirror(api: &Api, id: i64, patch: serde_json::Value) -> CmdResult {
    let mirror: MirrorInstance = api
        .send(reqwest::Method::PATCH, &format!("/replication/mirrors/{}", id), Some(patch))
        .await?;
    println!(
        "✓ Mirror {} ({}): direction {}, priority {}, {}",
        mirror.id,
        mirror.instance_id,
        mirror.sync_direction.as_str(),
        mirror.priority,
        if mirror.sync_enabled { "enabled" } else { "disabled" }
    );
    Ok(())
}

async fn remove_mirror(api: &Api, id: i64) -> CmdResult {
    api.call::<serde_json::Value>(reqwest::Method::DELETE, &format!("/replication/mirrors/{}", id), None)
        .await?;
    println!("✓ Mirror {} removed", id);
    Ok(())
}

fn print_round(round: &RoundResult) {
    let marker = if round.state == "done" { "✓" } else { "✗" };
    println!("{} {} [{}]", marker, round.instance_id, round.state);
    println!("    pushed:   {}", round.pushed);
    if let Some(pulled) = &round.pulled {
        println!(
            "    pulled:   {} created, {} updated, {} took remote, {} kept local",
            pulled.created, pulled.updated, pulled.took_remote, pulled.kept_local
        );
        println!("    conflicts: {}, failed: {}", pulled.conflicts, pulled.failed);
    }
    if let Some(error) = &round.error {
        println!("    error:    {}", error);
    }
}

async fn sync_mirror(api: &Api, id: i64) -> CmdResult {
    let round: RoundResult = api
        .send(reqwest::Method::POST, &format!("/replication/mirrors/{}/sync", id), None)
        .await?;
    print_round(&round);
    if round.state != "done" {
        return Err("sync round failed".into());
    }
    Ok(())
}

async fn sync_all(api: &Api) -> CmdResult {
    let report: SyncAllResult = api
        .send(reqwest::Method::POST, "/replication/sync-all", None)
        .await?;
    for round in &report.results {
        print_round(round);
    }
    for skipped in &report.skipped {
        println!("- {} skipped (round already running)", skipped);
    }
    println!();
    println!(
        "{} synced, {} failed, {} skipped",
        report.synced_count,
        report.failed_count,
        report.skipped.len()
    );
    Ok(())
}

fn print_logs(logs: &[SyncLogEntry]) {
    println!(
        "{:<8} {:<8} {:<6} {:<12} {:<8} {:<8} {:<10} {:<12} {}",
        "ID", "MIRROR", "DIR", "ENTITY", "ENT ID", "OP", "STATUS", "RESOLUTION", "AT"
    );
    println!("{}", "-".repeat(110));
    for log in logs {
        println!(
            "{:<8} {:<8} {:<6} {:<12} {:<8} {:<8} {:<10} {:<12} {}",
            log.id,
            log.mirror_id,
            log.direction.as_str(),
            log.entity_type.as_str(),
            log.entity_id,
            log.operation.as_str(),
            log.status.as_str(),
            log.resolution.map(|r| r.as_str()).unwrap_or("-"),
            log.synced_at.format("%Y-%m-%d %H:%M:%S")
        );
        if let Some(error) = &log.error_message {
            println!("         error: {}", error);
        }
    }
}

async fn show_logs(api: &Api, id: i64, limit: u32) -> CmdResult {
    let logs: Vec<SyncLogEntry> = api
        .get(&format!("/replication/mirrors/{}/logs?limit={}", id, limit))
        .await?;
    print_logs(&logs);
    Ok(())
}

async fn show_summary(api: &Api, id: i64) -> CmdResult {
    let summary: LogSummary = api
        .get(&format!("/replication/mirrors/{}/summary", id))
        .await?;
    println!("Mirror {}", summary.mirror_id);
    println!("  success:  {}", summary.success);
    println!("  failed:   {}", summary.failed);
    println!("  conflict: {}", summary.conflict);
    match summary.last_entry_at {
        Some(at) => println!("  last:     {}", at.format("%Y-%m-%d %H:%M:%S")),
        None => println!("  last:     never"),
    }
    Ok(())
}

async fn show_conflicts(api: &Api, limit: u32) -> CmdResult {
    let logs: Vec<SyncLogEntry> = api
        .get(&format!("/replication/logs/conflicts?limit={}", limit))
        .await?;
    if logs.is_empty() {
        println!("No pending conflicts");
        return Ok(());
    }
    for log in &logs {
        println!(
            "#{} mirror {} {} {}",
            log.id,
            log.mirror_id,
            log.entity_type.as_str(),
            log.entity_id
        );
        if let Some(snapshot) = &log.conflict_data {
            println!("    local:  {}", snapshot.local);
            println!("    remote: {}", snapshot.remote);
        }
    }
    Ok(())
}

async fn show_policy(api: &Api, entity_type: &str) -> CmdResult {
    let policy: ConflictPolicy = api
        .get(&format!("/replication/conflict-resolution/{}", entity_type))
        .await?;
    println!("{}: {}", policy.entity_type.as_str(), policy.strategy.name());
    if let Some(primary) = policy.strategy.primary_instance_id() {
        println!("  primary: {}", primary);
    }
    if policy.updated_at.is_none() {
        println!("  (configured default)");
    }
    Ok(())
}

async fn set_policy(api: &Api, entity_type: &str, strategy: String, primary: Option<String>) -> CmdResult {
    let mut body = json!({ "strategy": strategy });
    if let Some(primary) = primary {
        body["primary_instance_id"] = json!(primary);
    }
    let policy: ConflictPolicy = api
        .send(
            reqwest::Method::PUT,
            &format!("/replication/conflict-resolution/{}", entity_type),
            Some(body),
        )
        .await?;
    println!("✓ {} now uses {}", policy.entity_type.as_str(), policy.strategy.name());
    Ok(())
}
