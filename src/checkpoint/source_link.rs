//! Source Link Record
//!
//! Connection parameters and the durable "requested" position of the I/O
//! worker. Only the I/O worker writes it; status readers take a shared lock.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Serialize;

use super::{read_lines, write_lines, Fields};
use crate::coordinate::Coordinate;
use crate::error::Result;

/// TLS settings for the connection to the primary
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, serde::Deserialize)]
#[serde(default)]
pub struct TlsOptions {
    pub enabled: bool,
    /// CA bundle used to verify the primary
    pub ca: Option<PathBuf>,
    /// Client certificate (PEM)
    pub cert: Option<PathBuf>,
    /// Client private key (PEM)
    pub key: Option<PathBuf>,
}

/// I/O worker run state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IoRunState {
    #[default]
    Stopped,
    Connecting,
    Connected,
}

/// Everything the I/O worker needs to (re)connect and resume
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceLink {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub tls: TlsOptions,
    pub connect_retry: Duration,
    /// Heartbeat period in nanoseconds; 0 disables heartbeats
    pub heartbeat_period_ns: u64,
    /// Connection attempts before giving up; 0 retries forever
    pub max_retries: u32,
    pub ignore_server_ids: BTreeSet<u32>,
    /// Next source position to request from the primary
    pub requested: Coordinate,
    /// Relay log end at which `requested` was durable
    pub relay_coordinate: Coordinate,
    /// Runtime only, never persisted
    pub run_state: IoRunState,
}

impl Default for SourceLink {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: 7700,
            user: String::new(),
            password: String::new(),
            tls: TlsOptions::default(),
            connect_retry: Duration::from_secs(60),
            heartbeat_period_ns: 0,
            max_retries: 0,
            ignore_server_ids: BTreeSet::new(),
            requested: Coordinate::default(),
            relay_coordinate: Coordinate::default(),
            run_state: IoRunState::Stopped,
        }
    }
}

impl SourceLink {
    /// `host:port` of the primary
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn heartbeat_period(&self) -> Option<Duration> {
        (self.heartbeat_period_ns > 0).then(|| Duration::from_nanos(self.heartbeat_period_ns))
    }

    pub fn to_lines(&self) -> Vec<String> {
        let ids: Vec<String> = self.ignore_server_ids.iter().map(u32::to_string).collect();
        let path_line = |p: &Option<PathBuf>| {
            p.as_ref()
                .map(|p| p.display().to_string())
                .unwrap_or_default()
        };
        let mut ignore_line = self.ignore_server_ids.len().to_string();
        if !ids.is_empty() {
            ignore_line.push(' ');
            ignore_line.push_str(&ids.join(" "));
        }

        vec![
            self.relay_coordinate.file.clone(),
            self.relay_coordinate.offset.to_string(),
            self.requested.file.clone(),
            self.requested.offset.to_string(),
            self.host.clone(),
            self.port.to_string(),
            self.user.clone(),
            self.password.clone(),
            self.connect_retry.as_secs().to_string(),
            u8::from(self.tls.enabled).to_string(),
            path_line(&self.tls.ca),
            path_line(&self.tls.cert),
            path_line(&self.tls.key),
            self.heartbeat_period_ns.to_string(),
            self.max_retries.to_string(),
            ignore_line,
        ]
    }

    /// Parse a record; extension lines absent from older files take defaults
    pub fn from_lines(path: &Path, values: Vec<String>) -> Result<Self> {
        let mut f = Fields::new(path, values);
        let defaults = Self::default();

        let relay_coordinate = Coordinate::new(f.string("relay log file")?, f.number("relay log pos")?);
        let requested = Coordinate::new(f.string("source log file")?, f.number("source log pos")?);
        let host = f.next_opt().unwrap_or_default();
        let port = f.number_or("port", defaults.port)?;
        let user = f.next_opt().unwrap_or_default();
        let password = f.next_opt().unwrap_or_default();
        let connect_retry = Duration::from_secs(f.number_or("connect retry", defaults.connect_retry.as_secs())?);
        let tls_enabled: u8 = f.number_or("ssl", 0)?;
        let path_opt = |s: Option<String>| s.filter(|s| !s.is_empty()).map(PathBuf::from);
        let tls = TlsOptions {
            enabled: tls_enabled != 0,
            ca: path_opt(f.next_opt()),
            cert: path_opt(f.next_opt()),
            key: path_opt(f.next_opt()),
        };
        let heartbeat_period_ns = f.number_or("heartbeat period", 0)?;
        let max_retries = f.number_or("max retries", 0)?;

        let mut ignore_server_ids = BTreeSet::new();
        if let Some(line) = f.next_opt() {
            let mut parts = line.split_whitespace();
            let count: usize = parts
                .next()
                .unwrap_or("0")
                .parse()
                .map_err(|_| f.error("ignored server ids", "bad count"))?;
            for part in parts {
                let id = part
                    .parse()
                    .map_err(|_| f.error("ignored server ids", &format!("bad id '{}'", part)))?;
                ignore_server_ids.insert(id);
            }
            if ignore_server_ids.len() != count {
                return Err(f.error(
                    "ignored server ids",
                    &format!("expected {} ids, found {}", count, ignore_server_ids.len()),
                ));
            }
        }

        Ok(Self {
            host,
            port,
            user,
            password,
            tls,
            connect_retry,
            heartbeat_period_ns,
            max_retries,
            ignore_server_ids,
            requested,
            relay_coordinate,
            run_state: IoRunState::Stopped,
        })
    }

    /// Load from `path`; `None` if the file does not exist
    pub fn load(path: &Path) -> Result<Option<Self>> {
        match read_lines(path)? {
            Some(values) => Self::from_lines(path, values).map(Some),
            None => Ok(None),
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        write_lines(path, &self.to_lines())
    }
}
