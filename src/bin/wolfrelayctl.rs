//! WolfRelayCtl - Command line tool for managing WolfRelay nodes
//!
//! Usage:
//!   wolfrelayctl links                  - Show every link
//!   wolfrelayctl status <link>          - Show one link in detail
//!   wolfrelayctl start <link>           - Start a link's workers
//!   wolfrelayctl stop <link>            - Stop a link's workers
//!   wolfrelayctl binlog                 - Show the primary's source log

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use serde::Deserialize;
use serde_json::{json, Value};

/// WolfRelay Control Tool
#[derive(Parser)]
#[command(name = "wolfrelayctl")]
#[command(about = "Control and monitor WolfRelay replication", long_about = None)]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "/etc/wolfrelay/config.toml")]
    config: PathBuf,

    /// API endpoint to connect to (overrides config)
    #[arg(short, long)]
    endpoint: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum Workers {
    Both,
    Io,
    Apply,
}

impl Workers {
    fn as_str(self) -> &'static str {
        match self {
            Workers::Both => "both",
            Workers::Io => "io",
            Workers::Apply => "apply",
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// List replication links
    Links,
    /// Show the full status of one link
    Status { link: String },
    /// Start a link's workers
    Start {
        link: String,
        #[arg(long, value_enum, default_value = "both")]
        workers: Workers,
        /// Stop the apply worker at this source file ...
        #[arg(long, requires = "until_offset")]
        until_file: Option<String>,
        /// ... and offset
        #[arg(long, requires = "until_file")]
        until_offset: Option<u64>,
    },
    /// Stop a link's workers
    Stop {
        link: String,
        #[arg(long, value_enum, default_value = "both")]
        workers: Workers,
    },
    /// Point a stopped link at a new primary or position
    Change {
        link: String,
        #[arg(long)]
        host: Option<String>,
        #[arg(long)]
        port: Option<u16>,
        #[arg(long)]
        user: Option<String>,
        #[arg(long)]
        password: Option<String>,
        /// Source log file to resume from
        #[arg(long)]
        file: Option<String>,
        #[arg(long, requires = "file")]
        offset: Option<u64>,
    },
    /// Forget a stopped link's progress (DESTRUCTIVE)
    Reset {
        link: String,
        /// Skip confirmation prompt
        #[arg(long)]
        force: bool,
    },
    /// Skip the next N groups on a link's apply worker
    Skip { link: String, count: u32 },
    /// Show the primary's source log and connected replicas
    Binlog,
    /// Rotate the primary's source log
    Rotate,
    /// Check configuration file for errors
    CheckConfig {
        /// Path to config file to check (defaults to --config path)
        #[arg(short, long)]
        file: Option<PathBuf>,
    },
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
}

fn default_api_bind() -> String {
    "0.0.0.0:8080".to_string()
}

fn endpoint_from_config(path: &PathBuf) -> String {
    let fallback = "http://127.0.0.1:8080".to_string();
    let Ok(content) = std::fs::read_to_string(path) else {
        return fallback;
    };
    match toml::from_str::<Config>(&content) {
        Ok(config) => {
            let addr = config.api.bind_address;
            if addr.starts_with("0.0.0.0") {
                format!("http://127.0.0.1:{}", addr.split(':').nth(1).unwrap_or("8080"))
            } else {
                format!("http://{}", addr)
            }
        }
        Err(_) => fallback,
    }
}

// ============ Main ============

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let endpoint = cli
        .endpoint
        .clone()
        .unwrap_or_else(|| endpoint_from_config(&cli.config));
    let api = Api::new(endpoint);

    let result = match cli.command {
        Commands::Links => list_links(&api).await,
        Commands::Status { link } => show_link(&api, &link).await,
        Commands::Start {
            link,
            workers,
            until_file,
            until_offset,
        } => {
            let mut body = json!({ "workers": workers.as_str() });
            if let (Some(file), Some(offset)) = (until_file, until_offset) {
                body["until_source"] = json!({ "file": file, "offset": offset });
            }
            command(&api, &format!("/links/{}/start", link), body).await
        }
        Commands::Stop { link, workers } => {
            let body = json!({ "workers": workers.as_str() });
            command(&api, &format!("/links/{}/stop", link), body).await
        }
        Commands::Change {
            link,
            host,
            port,
            user,
            password,
            file,
            offset,
        } => {
            let body = json!({
                "host": host,
                "port": port,
                "user": user,
                "password": password,
                "start_file": file,
                "start_offset": offset,
            });
            command(&api, &format!("/links/{}/change", link), body).await
        }
        Commands::Reset { link, force } => reset_link(&api, &link, force).await,
        Commands::Skip { link, count } => {
            command(&api, &format!("/links/{}/skip", link), json!({ "count": count })).await
        }
        Commands::Binlog => show_binlog(&api).await,
        Commands::Rotate => rotate(&api).await,
        Commands::CheckConfig { file } => {
            let path = file.unwrap_or_else(|| cli.config.clone());
            check_config(&path)
        }
    };

    if let Err(e) = result {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

// ============ HTTP ============

struct Api {
    endpoint: String,
    client: reqwest::Client,
}

impl Api {
    fn new(endpoint: String) -> Self {
        Self {
            endpoint: endpoint.trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
        }
    }

    async fn get(&self, path: &str) -> Result<Value> {
        let response = self
            .client
            .get(format!("{}{}", self.endpoint, path))
            .send()
            .await
            .with_context(|| format!("cannot reach {}", self.endpoint))?;
        Self::decode(response).await
    }

    async fn post(&self, path: &str, body: Value) -> Result<Value> {
        let response = self
            .client
            .post(format!("{}{}", self.endpoint, path))
            .json(&body)
            .send()
            .await
            .with_context(|| format!("cannot reach {}", self.endpoint))?;
        Self::decode(response).await
    }

    async fn decode(response: reqwest::Response) -> Result<Value> {
        let status = response.status();
        let body: Value = response.json().await.context("invalid API response")?;
        if !status.is_success() {
            let message = body["error"].as_str().unwrap_or("unknown error");
            let code = body["code"].as_str().unwrap_or("?");
            bail!("{} ({}, HTTP {})", message, code, status.as_u16());
        }
        Ok(body)
    }
}

// ============ Commands ============

async fn list_links(api: &Api) -> Result<()> {
    let links = api.get("/links").await?;
    let links = links.as_array().cloned().unwrap_or_default();

    println!();
    println!("WolfRelay Links (wolfrelayctl v{})", env!("CARGO_PKG_VERSION"));
    println!("====================================");
    println!();
    println!(
        "{:<14} {:<22} {:<11} {:<8} {:<30} {:<30}",
        "LINK", "PRIMARY", "I/O", "APPLY", "REQUESTED", "APPLIED"
    );
    println!("{}", "-".repeat(118));

    for link in &links {
        let io = link["io_state"].as_str().unwrap_or("?");
        let io_padded = format!("{:<11}", io);
        let io_colored = match io {
            "connected" => format!("\x1b[32m{}\x1b[0m", io_padded),
            "connecting" => format!("\x1b[33m{}\x1b[0m", io_padded),
            _ => io_padded,
        };
        println!(
            "{:<14} {:<22} {} {:<8} {:<30} {:<30}",
            link["name"].as_str().unwrap_or("?"),
            format!(
                "{}:{}",
                link["source_host"].as_str().unwrap_or("?"),
                link["source_port"]
            ),
            io_colored,
            link["apply_state"].as_str().unwrap_or("?"),
            coordinate(&link["requested"]),
            coordinate(&link["source_applied"]),
        );
        for (worker, key) in [("I/O", "last_io_error"), ("apply", "last_apply_error")] {
            if let Some(msg) = link[key]["message"].as_str() {
                println!("  \x1b[31m{} error:\x1b[0m {}", worker, msg);
            }
        }
    }
    println!();
    Ok(())
}

async fn show_link(api: &Api, link: &str) -> Result<()> {
    let status = api.get(&format!("/links/{}/status", link)).await?;
    println!("{}", serde_json::to_string_pretty(&status)?);
    Ok(())
}

async fn command(api: &Api, path: &str, body: Value) -> Result<()> {
    let result = api.post(path, body).await?;
    for warning in result["warnings"].as_array().into_iter().flatten() {
        if let Some(w) = warning.as_str() {
            println!("\x1b[33mWarning:\x1b[0m {}", w);
        }
    }
    println!("OK");
    Ok(())
}

async fn reset_link(api: &Api, link: &str, force: bool) -> Result<()> {
    if !force {
        println!(
            "This deletes the relay log and checkpoints of link '{}'. Type 'yes' to continue:",
            link
        );
        let mut answer = String::new();
        std::io::stdin().read_line(&mut answer)?;
        if answer.trim() != "yes" {
            println!("Aborted");
            return Ok(());
        }
    }
    command(api, &format!("/links/{}/reset", link), json!({})).await
}

async fn show_binlog(api: &Api) -> Result<()> {
    let status = api.get("/binlog/status").await?;

    println!();
    println!("Source Log");
    println!("==========");
    println!();
    println!("Server ID:    {}", status["server_id"]);
    println!("End:          {}", coordinate(&status["end"]));
    println!("Total Size:   {} bytes", status["total_size"]);
    let segments = status["segments"].as_array().cloned().unwrap_or_default();
    println!("Segments:     {}", segments.len());
    println!();

    let sessions = status["sessions"].as_array().cloned().unwrap_or_default();
    println!("Replicas: {}", sessions.len());
    for s in &sessions {
        println!(
            "  server {:<6} {:<22} from {}:{}",
            s["server_id"],
            s["peer"].as_str().unwrap_or("?"),
            s["start_file"].as_str().unwrap_or("?"),
            s["start_offset"]
        );
    }
    println!();
    Ok(())
}

async fn rotate(api: &Api) -> Result<()> {
    let at = api.post("/binlog/rotate", json!({})).await?;
    println!("Rotated to {}", coordinate(&at));
    Ok(())
}

fn check_config(path: &PathBuf) -> Result<()> {
    let config = wolfrelay::WolfRelayConfig::from_file(path)
        .with_context(|| format!("{} is not a valid configuration", path.display()))?;
    println!("✓ Configuration is valid");
    println!("  Server ID: {}", config.node.server_id);
    println!("  Primary:   {}", if config.primary.enabled { "enabled" } else { "disabled" });
    for link in &config.links {
        println!("  Link {:<12} {}:{}", link.name, link.host, link.port);
    }
    Ok(())
}

fn coordinate(value: &Value) -> String {
    match (value["file"].as_str(), value["offset"].as_u64()) {
        (Some(file), Some(offset)) if !file.is_empty() => format!("{}:{}", file, offset),
        _ => "-".to_string(),
    }
}
