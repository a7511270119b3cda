//! WolfRelay Error Types

use serde::Serialize;
use thiserror::Error;

/// Result type alias for WolfRelay operations
pub type Result<T> = std::result::Result<T, Error>;

/// WolfRelay error types
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration file: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("Invalid filter rule: {0}")]
    Filter(String),

    // Network errors
    #[error("Network error: {0}")]
    Network(String),

    #[error("Connection failed to {address}: {reason}")]
    ConnectionFailed { address: String, reason: String },

    #[error("Connection timeout to {0}")]
    ConnectionTimeout(String),

    #[error("TLS error: {0}")]
    Tls(String),

    // Protocol errors
    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Malformed event at {file}:{offset}: {reason}")]
    MalformedEvent {
        file: String,
        offset: u64,
        reason: String,
    },

    #[error("Primary reported error {code}: {message}")]
    Remote { code: u16, message: String },

    // Log storage errors
    #[error("Could not find requested position {file}:{offset}")]
    NoSuchPosition { file: String, offset: u64 },

    #[error("Relay log write failed: {0}")]
    WriteError(String),

    #[error("Refusing to purge up to {0}: still referenced")]
    PurgeRefused(String),

    #[error("Checkpoint error: {0}")]
    Checkpoint(String),

    // Apply errors
    #[error("Transient conflict: {0}")]
    TransientConflict(String),

    #[error("Apply failed: {0}")]
    Apply(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    // Link and lifecycle errors
    #[error("Replication error: {0}")]
    Replication(String),

    #[error("Link not found: {0}")]
    LinkNotFound(String),

    #[error("Link {0} has running workers; stop them first")]
    LinkRunning(String),

    #[error("Session holds locks; release them before stopping {0}")]
    LockHeld(String),

    #[error("Server id conflict: {0}")]
    ServerIdConflict(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    // Internal errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Shutdown in progress")]
    ShuttingDown,
}

/// Coarse error classification reported through link status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Network,
    Protocol,
    TransientConflict,
    Config,
    Durability,
    NoSuchPosition,
    State,
    Cancelled,
    Fatal,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ErrorKind::Network => "network",
            ErrorKind::Protocol => "protocol",
            ErrorKind::TransientConflict => "transient_conflict",
            ErrorKind::Config => "config",
            ErrorKind::Durability => "durability",
            ErrorKind::NoSuchPosition => "no_such_position",
            ErrorKind::State => "state",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Fatal => "fatal",
        };
        f.write_str(name)
    }
}

impl Error {
    /// Classify this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Config(_) | Error::ConfigParse(_) | Error::Filter(_) => ErrorKind::Config,
            Error::Network(_)
            | Error::ConnectionFailed { .. }
            | Error::ConnectionTimeout(_)
            | Error::Tls(_) => ErrorKind::Network,
            Error::Protocol(_)
            | Error::MalformedEvent { .. }
            | Error::Remote { .. }
            | Error::ServerIdConflict(_) => ErrorKind::Protocol,
            Error::NoSuchPosition { .. } => ErrorKind::NoSuchPosition,
            Error::WriteError(_) | Error::Checkpoint(_) | Error::Io(_) => ErrorKind::Durability,
            Error::TransientConflict(_) => ErrorKind::TransientConflict,
            Error::LinkNotFound(_)
            | Error::LinkRunning(_)
            | Error::LockHeld(_)
            | Error::PurgeRefused(_) => ErrorKind::State,
            Error::Cancelled | Error::ShuttingDown => ErrorKind::Cancelled,
            Error::Apply(_)
            | Error::Database(_)
            | Error::Replication(_)
            | Error::Json(_)
            | Error::Internal(_) => ErrorKind::Fatal,
        }
    }

    /// Check if this error is retryable by the I/O worker
    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::Network
    }

    /// Map an I/O error seen on a socket to a network error
    pub fn from_socket(e: std::io::Error) -> Self {
        Error::Network(e.to_string())
    }
}
