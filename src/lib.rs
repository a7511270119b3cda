//! WolfRelay - Primary/Replica Log Replication
//!
//! A primary appends transaction groups to a segmented source log and
//! streams it to replicas over a framed TCP protocol. Each replica runs one
//! link per primary: an I/O worker copies events into a local relay log and
//! an apply worker replays whole groups through an executor, with crash-safe
//! checkpoints on both sides.
//!
//! # Features
//!
//! - Segmented, checksummed event logs with rotation and purge
//! - Resumable dump sessions with heartbeats and optional TLS
//! - Relay log space limits with back-pressure on the I/O worker
//! - Database/table filters and database rewrite rules
//! - Transient-conflict retries and stop conditions on the apply side
//! - HTTP admin API and a command-line client

pub mod api;
pub mod binlog;
pub mod checkpoint;
pub mod config;
pub mod coordinate;
pub mod dump;
pub mod error;
pub mod event;
pub mod executor;
pub mod filter;
pub mod link;
pub mod network;
pub mod protocol;
pub mod relay;
pub mod replica;

pub use config::WolfRelayConfig;
pub use error::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::WolfRelayConfig;
    pub use crate::coordinate::Coordinate;
    pub use crate::error::{Error, Result};
    pub use crate::event::{Event, LogEvent};
    pub use crate::link::{Link, LinkRegistry};
}
