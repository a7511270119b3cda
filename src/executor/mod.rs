//! Database Executor Module
//!
//! The apply worker hands every replicated data event to an [`Executor`].
//! The executor owns the open transaction for the current group; the worker
//! only decides when a group ends, when to roll back and when to retry.

mod mariadb;
mod recording;

pub use mariadb::MariaDbExecutor;
pub use recording::RecordingExecutor;

use async_trait::async_trait;
use bytes::Bytes;

use crate::coordinate::Coordinate;

/// A data event as presented to an executor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplyEvent {
    /// Schema after rewrite rules
    pub schema: String,
    pub table: Option<String>,
    pub payload: Bytes,
    /// Originating server
    pub server_id: u32,
    pub timestamp: u32,
    /// Relay position of the event
    pub relay: Coordinate,
    /// Source position just past the event
    pub source_end: Coordinate,
    /// Last event of its group; the executor commits after applying it
    pub ends_group: bool,
}

/// Result of executing one event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecOutcome {
    /// Applied (and committed, at a group end)
    Committed,
    /// Deadlock, lock wait timeout or lost connection; the group may be retried
    TransientConflict(String),
    Fatal(String),
}

#[async_trait]
pub trait Executor: Send + Sync {
    /// Apply one event inside the current group
    async fn execute(&self, event: &ApplyEvent) -> ExecOutcome;

    /// Commit the current group without another event (the group's last
    /// event was filtered out)
    async fn finish_group(&self) -> ExecOutcome;

    /// Discard everything applied since the last commit
    async fn rollback(&self);

    /// Short name for status output
    fn name(&self) -> &'static str;
}
