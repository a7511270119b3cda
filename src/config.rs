//! WolfRelay Configuration
//!
//! This module provides configuration structures for a WolfRelay node: the
//! optional primary role (source log plus dump service) and any number of
//! replication links.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};
use std::path::PathBuf;
use std::time::Duration;

use crate::checkpoint::{SourceLink, TlsOptions};
use crate::coordinate::Coordinate;
use crate::filter::FilterConfig;
use crate::relay::RelayLogOptions;
use crate::replica::{ApplySettings, IoSettings};

/// Main WolfRelay configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WolfRelayConfig {
    /// Node-specific configuration
    pub node: NodeConfig,

    /// Primary role: source log and dump service
    #[serde(default)]
    pub primary: PrimaryConfig,

    /// Relay log settings shared by all links
    #[serde(default)]
    pub relay_log: RelayLogConfig,

    /// Apply worker settings shared by all links
    #[serde(default)]
    pub apply: ApplyConfig,

    /// Replication links to primaries
    #[serde(default)]
    pub links: Vec<LinkConfig>,

    /// API configuration
    #[serde(default)]
    pub api: ApiConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Node-specific configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Server id, unique across the replication topology
    pub server_id: u32,

    /// Data directory for logs and checkpoints
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Apply events that carry this node's own server id
    #[serde(default)]
    pub replicate_same_server_id: bool,
}

/// Primary role configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrimaryConfig {
    /// Serve the source log to replicas
    #[serde(default)]
    pub enabled: bool,

    /// Dump service bind address
    #[serde(default = "default_primary_address")]
    pub bind_address: String,

    /// Source log segment basename
    #[serde(default = "default_log_basename")]
    pub log_basename: String,

    /// Maximum segment size in megabytes
    #[serde(default = "default_segment_size_mb")]
    pub segment_size_mb: u64,

    /// fsync every append
    #[serde(default = "default_true")]
    pub fsync: bool,

    /// TLS certificate (PEM); TLS is enabled when both cert and key are set
    #[serde(default)]
    pub tls_cert: Option<PathBuf>,

    /// TLS private key (PEM)
    #[serde(default)]
    pub tls_key: Option<PathBuf>,
}

/// Relay log configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayLogConfig {
    /// Maximum segment size in megabytes
    #[serde(default = "default_segment_size_mb")]
    pub segment_size_mb: u64,

    /// Total relay size before the I/O worker throttles, in megabytes (0 = unlimited)
    #[serde(default)]
    pub space_limit_mb: u64,

    /// Delete relay segments once applied
    #[serde(default = "default_true")]
    pub purge: bool,

    /// fsync every append
    #[serde(default)]
    pub fsync: bool,

    /// Appended events between I/O checkpoints
    #[serde(default = "default_checkpoint_every")]
    pub checkpoint_every: u32,
}

/// Apply worker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplyConfig {
    /// Retries of one group on transient conflicts before giving up
    #[serde(default = "default_max_group_retries")]
    pub max_group_retries: u32,

    /// Backoff step in milliseconds
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,

    /// Backoff ceiling in milliseconds
    #[serde(default = "default_retry_backoff_max_ms")]
    pub retry_backoff_max_ms: u64,
}

/// One replication link to a primary
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkConfig {
    /// Link name, used in the API and as the checkpoint directory
    pub name: String,

    /// Primary host
    pub host: String,

    /// Primary dump service port
    #[serde(default = "default_primary_port")]
    pub port: u16,

    #[serde(default)]
    pub user: String,

    #[serde(default)]
    pub password: String,

    /// Seconds between connection attempts
    #[serde(default = "default_connect_retry_secs")]
    pub connect_retry_secs: u64,

    /// Connection attempts before giving up (0 = forever)
    #[serde(default)]
    pub max_retries: u32,

    /// Heartbeat period requested from the primary (0 disables)
    #[serde(default = "default_heartbeat_period_ms")]
    pub heartbeat_period_ms: u64,

    /// Read timeout on the primary connection (default: twice the heartbeat period)
    #[serde(default)]
    pub net_timeout_secs: Option<u64>,

    /// Events from these server ids are not relayed
    #[serde(default)]
    pub ignore_server_ids: Vec<u32>,

    /// Source log file to start from on a fresh link (default: first available)
    #[serde(default)]
    pub start_file: Option<String>,

    /// Offset in `start_file` to start from
    #[serde(default)]
    pub start_offset: Option<u64>,

    /// Stop at the end of the primary's log instead of waiting for more
    #[serde(default)]
    pub non_blocking: bool,

    /// Start both workers when the node starts
    #[serde(default = "default_true")]
    pub auto_start: bool,

    #[serde(default)]
    pub tls: TlsOptions,

    #[serde(default)]
    pub executor: ExecutorConfig,

    #[serde(default)]
    pub filter: FilterConfig,
}

/// Where applied events go
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExecutorConfig {
    /// Keep events in memory (dry run)
    #[default]
    Recording,
    /// Execute payloads as SQL against MariaDB/MySQL
    Mariadb(DatabaseConfig),
}

/// Database connection configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct DatabaseConfig {
    /// MariaDB host
    pub host: String,

    /// MariaDB port
    #[serde(default = "default_db_port")]
    pub port: u16,

    /// Database user
    pub user: String,

    /// Database password
    #[serde(default)]
    pub password: String,

    /// Connection pool size
    #[serde(default = "default_pool_size")]
    pub pool_size: u32,

    /// Connection timeout in seconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
}

/// API configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    /// Enable HTTP API
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// HTTP API bind address
    #[serde(default = "default_api_address")]
    pub bind_address: String,

    /// Enable CORS
    #[serde(default)]
    pub cors_enabled: bool,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format (pretty, json)
    #[serde(default = "default_log_format")]
    pub format: String,
}

// Default value functions
fn default_db_port() -> u16 {
    3306
}

fn default_pool_size() -> u32 {
    4
}

fn default_connect_timeout() -> u64 {
    30
}

fn default_primary_port() -> u16 {
    7700
}

fn default_primary_address() -> String {
    "0.0.0.0:7700".to_string()
}

fn default_log_basename() -> String {
    "wolfrelay-bin".to_string()
}

fn default_segment_size_mb() -> u64 {
    64
}

fn default_checkpoint_every() -> u32 {
    1
}

fn default_max_group_retries() -> u32 {
    10
}

fn default_retry_backoff_ms() -> u64 {
    1000
}

fn default_retry_backoff_max_ms() -> u64 {
    5000
}

fn default_connect_retry_secs() -> u64 {
    60
}

fn default_heartbeat_period_ms() -> u64 {
    30_000
}

fn default_true() -> bool {
    true
}

fn default_api_address() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("/var/lib/wolfrelay")
}

impl Default for PrimaryConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            bind_address: default_primary_address(),
            log_basename: default_log_basename(),
            segment_size_mb: default_segment_size_mb(),
            fsync: true,
            tls_cert: None,
            tls_key: None,
        }
    }
}

impl Default for RelayLogConfig {
    fn default() -> Self {
        Self {
            segment_size_mb: default_segment_size_mb(),
            space_limit_mb: 0,
            purge: true,
            fsync: false,
            checkpoint_every: default_checkpoint_every(),
        }
    }
}

impl Default for ApplyConfig {
    fn default() -> Self {
        Self {
            max_group_retries: default_max_group_retries(),
            retry_backoff_ms: default_retry_backoff_ms(),
            retry_backoff_max_ms: default_retry_backoff_max_ms(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind_address: default_api_address(),
            cors_enabled: false,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl WolfRelayConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &std::path::Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_str(&content)
    }

    /// Load configuration from a TOML string
    pub fn from_str(content: &str) -> crate::Result<Self> {
        let config: WolfRelayConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> crate::Result<()> {
        if self.node.server_id == 0 {
            return Err(crate::Error::Config("node.server_id must be non-zero".into()));
        }

        if self.primary.enabled {
            if self.primary.bind_address.is_empty() {
                return Err(crate::Error::Config("primary.bind_address cannot be empty".into()));
            }
            if self.primary.tls_cert.is_some() != self.primary.tls_key.is_some() {
                return Err(crate::Error::Config(
                    "primary.tls_cert and primary.tls_key must be set together".into(),
                ));
            }
        }

        if self.primary.segment_size_mb == 0 || self.relay_log.segment_size_mb == 0 {
            return Err(crate::Error::Config("segment_size_mb must be positive".into()));
        }

        if self.apply.retry_backoff_max_ms < self.apply.retry_backoff_ms {
            return Err(crate::Error::Config(
                "apply.retry_backoff_max_ms is below apply.retry_backoff_ms".into(),
            ));
        }

        let mut names = HashSet::new();
        for link in &self.links {
            link.validate()?;
            if !names.insert(link.name.as_str()) {
                return Err(crate::Error::Config(format!("duplicate link name '{}'", link.name)));
            }
        }

        Ok(())
    }

    /// Get the data directory path
    pub fn data_dir(&self) -> &PathBuf {
        &self.node.data_dir
    }

    /// Directory of the primary's source log
    pub fn binlog_dir(&self) -> PathBuf {
        self.node.data_dir.join("binlog")
    }

    /// Directory holding a link's relay log and checkpoints
    pub fn link_dir(&self, name: &str) -> PathBuf {
        self.node.data_dir.join("links").join(name)
    }

    /// Relay log options for a link
    pub fn relay_options(&self, link: &LinkConfig) -> RelayLogOptions {
        RelayLogOptions {
            basename: format!("{}-relay-bin", link.name),
            max_segment_size: self.relay_log.segment_size_mb * 1024 * 1024,
            space_limit: self.relay_log.space_limit_mb * 1024 * 1024,
            purge: self.relay_log.purge,
            fsync: self.relay_log.fsync,
            server_id: self.node.server_id,
        }
    }

    /// I/O worker settings for a link
    pub fn io_settings(&self, link: &LinkConfig) -> IoSettings {
        IoSettings {
            net_timeout: link.net_timeout(),
            non_blocking: link.non_blocking,
            checkpoint_every: self.relay_log.checkpoint_every.max(1),
        }
    }

    pub fn apply_settings(&self) -> ApplySettings {
        ApplySettings {
            max_group_retries: self.apply.max_group_retries,
            retry_backoff: Duration::from_millis(self.apply.retry_backoff_ms),
            retry_backoff_max: Duration::from_millis(self.apply.retry_backoff_max_ms),
        }
    }
}

impl LinkConfig {
    fn validate(&self) -> crate::Result<()> {
        let valid_name = !self.name.is_empty()
            && self
                .name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !valid_name {
            return Err(crate::Error::Config(format!(
                "link name '{}' must be non-empty and use only letters, digits, '-' or '_'",
                self.name
            )));
        }
        if self.host.is_empty() {
            return Err(crate::Error::Config(format!("links.{}.host cannot be empty", self.name)));
        }
        if self.start_offset.is_some() && self.start_file.is_none() {
            return Err(crate::Error::Config(format!(
                "links.{}.start_offset requires start_file",
                self.name
            )));
        }
        if self.tls.enabled && self.tls.ca.is_none() {
            return Err(crate::Error::Config(format!(
                "links.{}.tls.ca is required when TLS is enabled",
                self.name
            )));
        }
        if let ExecutorConfig::Mariadb(db) = &self.executor {
            if db.host.is_empty() {
                return Err(crate::Error::Config(format!(
                    "links.{}.executor.host cannot be empty",
                    self.name
                )));
            }
        }
        self.filter
            .compile()
            .map_err(|e| crate::Error::Config(format!("links.{}.filter: {}", self.name, e)))?;
        Ok(())
    }

    pub fn connect_retry(&self) -> Duration {
        Duration::from_secs(self.connect_retry_secs)
    }

    pub fn heartbeat_period(&self) -> Option<Duration> {
        (self.heartbeat_period_ms > 0).then(|| Duration::from_millis(self.heartbeat_period_ms))
    }

    /// Explicit timeout, else twice the heartbeat period
    pub fn net_timeout(&self) -> Option<Duration> {
        match self.net_timeout_secs {
            Some(0) => None,
            Some(secs) => Some(Duration::from_secs(secs)),
            None => self.heartbeat_period().map(|p| p * 2),
        }
    }

    /// Starting coordinate for a link without checkpoints
    pub fn start_coordinate(&self) -> Coordinate {
        match &self.start_file {
            Some(file) => Coordinate::new(
                file.clone(),
                self.start_offset
                    .unwrap_or(crate::coordinate::SEGMENT_HEADER_SIZE),
            ),
            None => Coordinate::default(),
        }
    }

    /// Source link record for a link without checkpoints
    pub fn source_link(&self) -> SourceLink {
        SourceLink {
            host: self.host.clone(),
            port: self.port,
            user: self.user.clone(),
            password: self.password.clone(),
            tls: self.tls.clone(),
            connect_retry: self.connect_retry(),
            heartbeat_period_ns: self.heartbeat_period_ms.saturating_mul(1_000_000),
            max_retries: self.max_retries,
            ignore_server_ids: self.ignore_server_ids.iter().copied().collect::<BTreeSet<_>>(),
            requested: self.start_coordinate(),
            ..SourceLink::default()
        }
    }
}
