//! Replica Workers
//!
//! Each replication link runs two tasks over a shared [`ReplicaContext`]:
//! the I/O worker pulls events from the primary into the relay log, and the
//! apply worker replays the relay log through an executor.

mod apply_worker;
mod io_worker;

pub use apply_worker::{ApplyExit, ApplyWorker};
pub use io_worker::IoWorker;

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::RwLock;

use crate::checkpoint::{ApplyState, CheckpointPaths, SourceLink};
use crate::coordinate::Coordinate;
use crate::error::{Error, ErrorKind, Result};
use crate::filter::ReplicationFilter;
use crate::relay::RelayLog;

/// I/O worker tuning
#[derive(Debug, Clone)]
pub struct IoSettings {
    /// Read timeout on the primary connection; `None` waits indefinitely
    pub net_timeout: Option<Duration>,
    /// Ask the primary to end the stream at the end of its log
    pub non_blocking: bool,
    /// Appended events between checkpoint flushes
    pub checkpoint_every: u32,
}

impl Default for IoSettings {
    fn default() -> Self {
        Self {
            net_timeout: None,
            non_blocking: false,
            checkpoint_every: 1,
        }
    }
}

/// Apply worker tuning
#[derive(Debug, Clone)]
pub struct ApplySettings {
    pub max_group_retries: u32,
    pub retry_backoff: Duration,
    pub retry_backoff_max: Duration,
}

impl Default for ApplySettings {
    fn default() -> Self {
        Self {
            max_group_retries: 10,
            retry_backoff: Duration::from_millis(1000),
            retry_backoff_max: Duration::from_millis(5000),
        }
    }
}

impl ApplySettings {
    /// Sleep before retry number `attempt` (1-based)
    pub fn backoff(&self, attempt: u32) -> Duration {
        self.retry_backoff
            .saturating_mul(attempt)
            .min(self.retry_backoff_max)
    }
}

/// Last error recorded by a worker
#[derive(Debug, Clone, Serialize)]
pub struct WorkerError {
    pub kind: ErrorKind,
    pub message: String,
    /// Position the worker stopped at
    pub coordinate: Coordinate,
    pub at: DateTime<Utc>,
}

impl WorkerError {
    pub fn new(err: &Error, coordinate: Coordinate) -> Self {
        Self {
            kind: err.kind(),
            message: err.to_string(),
            coordinate,
            at: Utc::now(),
        }
    }
}

/// State shared by a link's workers and its admin commands
pub struct ReplicaContext {
    pub name: String,
    /// Local server id
    pub server_id: u32,
    pub replicate_same_server_id: bool,
    pub source: RwLock<SourceLink>,
    pub apply: RwLock<ApplyState>,
    pub relay: Arc<RelayLog>,
    pub filter: ReplicationFilter,
    pub paths: CheckpointPaths,
    pub io_settings: IoSettings,
    pub apply_settings: ApplySettings,
    pub io_error: Mutex<Option<WorkerError>>,
    pub apply_error: Mutex<Option<WorkerError>>,
    /// Seconds the local clock is ahead of the primary's
    pub clock_skew: Mutex<Option<i64>>,
}

impl ReplicaContext {
    /// Whether events from `server_id` must not be applied or relayed
    pub fn is_self_origin(&self, server_id: u32) -> bool {
        server_id == self.server_id && !self.replicate_same_server_id
    }

    /// Persist the source link record
    pub async fn save_source(&self) -> Result<()> {
        let link = self.source.read().await;
        link.save(&self.paths.source_link())?;
        self.relay.pin_io(link.relay_coordinate.clone());
        Ok(())
    }

    /// Persist the apply state record
    pub async fn save_apply(&self) -> Result<()> {
        let state = self.apply.read().await;
        state.save(&self.paths.apply_state())?;
        self.relay.pin_apply(state.group_cursor.clone());
        Ok(())
    }

    pub fn record_io_error(&self, err: &Error, at: Coordinate) {
        *self.io_error.lock() = Some(WorkerError::new(err, at));
    }

    pub fn record_apply_error(&self, err: &Error, at: Coordinate) {
        *self.apply_error.lock() = Some(WorkerError::new(err, at));
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::binlog::ReadOutcome;
    use crate::event::LogEvent;
    use crate::relay::RelayLogOptions;
    use std::path::Path;

    /// Context over a fresh relay log in `dir`
    pub fn context(dir: &Path, server_id: u32) -> ReplicaContext {
        let relay = RelayLog::open(
            dir.join("relay"),
            RelayLogOptions {
                basename: "relay".into(),
                max_segment_size: 1 << 20,
                space_limit: 0,
                purge: false,
                fsync: false,
                server_id,
            },
        )
        .unwrap();
        ReplicaContext {
            name: "test".into(),
            server_id,
            replicate_same_server_id: false,
            source: RwLock::new(SourceLink::default()),
            apply: RwLock::new(ApplyState::default()),
            relay: Arc::new(relay),
            filter: ReplicationFilter::default(),
            paths: CheckpointPaths::new(dir),
            io_settings: IoSettings::default(),
            apply_settings: ApplySettings {
                max_group_retries: 10,
                retry_backoff: Duration::from_millis(10),
                retry_backoff_max: Duration::from_millis(50),
            },
            io_error: Mutex::new(None),
            apply_error: Mutex::new(None),
            clock_skew: Mutex::new(None),
        }
    }

    /// Every event currently in the relay log
    pub async fn relay_events(ctx: &ReplicaContext) -> Vec<LogEvent> {
        let mut reader = ctx.relay.reader(&ctx.relay.start().await).await.unwrap();
        let mut events = Vec::new();
        loop {
            match reader.next().await.unwrap() {
                ReadOutcome::Event(ev) => events.push(ev.event),
                ReadOutcome::EndOfSegment => {
                    if !reader.advance().await.unwrap() {
                        break;
                    }
                }
                ReadOutcome::EndOfLog => break,
            }
        }
        events
    }
}
