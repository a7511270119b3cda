//! Replication Links
//!
//! A link is one replica-side connection to a primary: its checkpoints,
//! relay log, filter, executor and the two worker tasks. The admin command
//! surface (start, stop, change, reset, skip, filter, status) lives here.

mod registry;

pub use registry::LinkRegistry;

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex as SyncMutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::checkpoint::{
    ApplyRunState, ApplyState, CheckpointPaths, IoRunState, PendingReset, SourceLink,
    StopCondition, TlsOptions,
};
use crate::config::{LinkConfig, WolfRelayConfig};
use crate::coordinate::Coordinate;
use crate::error::{Error, Result};
use crate::executor::Executor;
use crate::filter::{FilterConfig, FilterDescription, ReplicationFilter, RuleSet};
use crate::relay::RelayLog;
use crate::replica::{ApplyExit, ApplyWorker, IoWorker, ReplicaContext, WorkerError};

/// Identity of the client issuing an admin command
#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct AdminSession {
    /// The session holds table or global read locks
    #[serde(default)]
    pub holds_locks: bool,
}

/// Which workers a start or stop applies to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerSelection {
    #[default]
    Both,
    Io,
    Apply,
}

impl WorkerSelection {
    fn io(self) -> bool {
        matches!(self, WorkerSelection::Both | WorkerSelection::Io)
    }

    fn apply(self) -> bool {
        matches!(self, WorkerSelection::Both | WorkerSelection::Apply)
    }
}

/// New connection parameters and start position for a stopped link
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ChangeRequest {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub user: Option<String>,
    pub password: Option<String>,
    pub connect_retry_secs: Option<u64>,
    pub heartbeat_period_ms: Option<u64>,
    pub max_retries: Option<u32>,
    pub ignore_server_ids: Option<Vec<u32>>,
    pub tls: Option<TlsOptions>,
    /// Source log file to resume from
    pub start_file: Option<String>,
    pub start_offset: Option<u64>,
}

/// Snapshot of a link for `SHOW STATUS`
#[derive(Debug, Clone, Serialize)]
pub struct LinkStatus {
    pub name: String,
    pub source_host: String,
    pub source_port: u16,
    pub io_state: IoRunState,
    pub apply_state: ApplyRunState,
    /// Next source position the I/O worker will request
    pub requested: Coordinate,
    pub relay_write: Coordinate,
    pub relay_group: Coordinate,
    pub relay_event: Coordinate,
    /// Source position of the last applied group
    pub source_applied: Coordinate,
    pub skip_counter: u32,
    pub retry_count: u32,
    pub stop_condition: StopCondition,
    pub relay_log_space: u64,
    pub clock_skew_secs: Option<i64>,
    pub last_io_error: Option<WorkerError>,
    pub last_apply_error: Option<WorkerError>,
    pub ignore_server_ids: Vec<u32>,
    pub filter: FilterDescription,
    pub executor: String,
}

struct Worker<T> {
    cancel: CancellationToken,
    handle: JoinHandle<T>,
}

impl<T> Worker<T> {
    fn running(&self) -> bool {
        !self.handle.is_finished()
    }

    async fn stop(self) -> Option<T> {
        self.cancel.cancel();
        match self.handle.await {
            Ok(value) => Some(value),
            Err(e) => {
                tracing::error!("Worker task failed: {}", e);
                None
            }
        }
    }
}

#[derive(Default)]
struct Workers {
    io: Option<Worker<()>>,
    apply: Option<Worker<ApplyExit>>,
}

impl Workers {
    fn io_running(&self) -> bool {
        self.io.as_ref().map_or(false, Worker::running)
    }

    fn apply_running(&self) -> bool {
        self.apply.as_ref().map_or(false, Worker::running)
    }
}

pub struct Link {
    ctx: Arc<ReplicaContext>,
    executor: Arc<dyn Executor>,
    config: LinkConfig,
    /// Serializes admin commands; holds the worker handles
    workers: Mutex<Workers>,
}

impl Link {
    /// Open a link's relay log and checkpoints, creating them on first use
    ///
    /// A relay reset interrupted by a crash is finished before anything
    /// else reads the position records.
    pub async fn open(
        config: &WolfRelayConfig,
        link: &LinkConfig,
        executor: Arc<dyn Executor>,
    ) -> Result<Self> {
        let dir = config.link_dir(&link.name);
        std::fs::create_dir_all(&dir)?;
        let paths = CheckpointPaths::new(&dir);
        let relay = RelayLog::open(dir.join("relay"), config.relay_options(link))?;

        let (source, apply) = match PendingReset::load(&paths.pending_reset())? {
            Some(pending) => {
                tracing::warn!("[{}] Finishing interrupted relay log reset", link.name);
                Self::finish_reset(&relay, &paths, pending).await?.unzip()
            }
            None => (
                SourceLink::load(&paths.source_link())?,
                ApplyState::load(&paths.apply_state())?,
            ),
        };

        let source = match source {
            Some(saved) => {
                tracing::info!(
                    "[{}] Resuming from checkpoint: source {} relay {}",
                    link.name,
                    saved.requested,
                    saved.relay_coordinate
                );
                saved
            }
            None => link.source_link(),
        };
        let apply = apply.unwrap_or_else(|| ApplyState {
            source_mirror: source.requested.clone(),
            ..ApplyState::default()
        });
        relay.pin_io(source.relay_coordinate.clone());
        relay.pin_apply(apply.group_cursor.clone());

        let ctx = ReplicaContext {
            name: link.name.clone(),
            server_id: config.node.server_id,
            replicate_same_server_id: config.node.replicate_same_server_id,
            source: RwLock::new(source),
            apply: RwLock::new(apply),
            relay: Arc::new(relay),
            filter: ReplicationFilter::from_config(&link.filter)?,
            paths,
            io_settings: config.io_settings(link),
            apply_settings: config.apply_settings(),
            io_error: SyncMutex::new(None),
            apply_error: SyncMutex::new(None),
            clock_skew: SyncMutex::new(None),
        };
        Ok(Self::from_context(Arc::new(ctx), executor, link.clone()))
    }

    pub(crate) fn from_context(
        ctx: Arc<ReplicaContext>,
        executor: Arc<dyn Executor>,
        config: LinkConfig,
    ) -> Self {
        Self {
            ctx,
            executor,
            config,
            workers: Mutex::new(Workers::default()),
        }
    }

    pub fn name(&self) -> &str {
        &self.ctx.name
    }

    pub fn auto_start(&self) -> bool {
        self.config.auto_start
    }

    /// Start the selected workers; already running workers only produce warnings
    pub async fn start(
        &self,
        which: WorkerSelection,
        until: Option<StopCondition>,
    ) -> Result<Vec<String>> {
        let mut workers = self.workers.lock().await;
        let mut warnings = Vec::new();

        if until.is_some() && (!which.apply() || workers.apply_running()) {
            return Err(Error::LinkRunning(format!(
                "{}: a stop condition needs the apply worker to be started by this command",
                self.name()
            )));
        }

        if which.io() {
            if workers.io_running() {
                warnings.push(format!("{}: I/O worker is already running", self.name()));
            } else {
                let cancel = CancellationToken::new();
                *self.ctx.io_error.lock() = None;
                let handle = IoWorker::new(Arc::clone(&self.ctx), cancel.clone()).spawn();
                workers.io = Some(Worker { cancel, handle });
            }
        }

        if which.apply() {
            if workers.apply_running() {
                warnings.push(format!("{}: apply worker is already running", self.name()));
            } else {
                if let Some(until) = until {
                    self.ctx.apply.write().await.stop_condition = until;
                    self.ctx.save_apply().await?;
                }
                let cancel = CancellationToken::new();
                *self.ctx.apply_error.lock() = None;
                let handle = ApplyWorker::new(
                    Arc::clone(&self.ctx),
                    Arc::clone(&self.executor),
                    cancel.clone(),
                )
                .spawn();
                workers.apply = Some(Worker { cancel, handle });
            }
        }

        for warning in &warnings {
            tracing::warn!("{}", warning);
        }
        Ok(warnings)
    }

    /// Stop the selected workers and wait for them to checkpoint
    pub async fn stop(&self, which: WorkerSelection, session: AdminSession) -> Result<Vec<String>> {
        if session.holds_locks {
            return Err(Error::LockHeld(self.name().to_string()));
        }

        let mut workers = self.workers.lock().await;
        let mut warnings = Vec::new();

        if which.io() {
            match workers.io.take() {
                Some(worker) if worker.running() => {
                    worker.stop().await;
                }
                _ => warnings.push(format!("{}: I/O worker is not running", self.name())),
            }
        }
        if which.apply() {
            match workers.apply.take() {
                Some(worker) if worker.running() => {
                    worker.stop().await;
                }
                _ => warnings.push(format!("{}: apply worker is not running", self.name())),
            }
        }

        for warning in &warnings {
            tracing::warn!("{}", warning);
        }
        Ok(warnings)
    }

    /// Stop everything regardless of sessions; used on shutdown
    pub async fn shutdown(&self) {
        let mut workers = self.workers.lock().await;
        if let Some(worker) = workers.io.take() {
            worker.stop().await;
        }
        if let Some(worker) = workers.apply.take() {
            worker.stop().await;
        }
        if let Err(e) = self.ctx.relay.close().await {
            tracing::warn!("[{}] Closing relay log failed: {}", self.name(), e);
        }
    }

    /// Point a stopped link at a new primary or position
    ///
    /// A new position or primary discards the relay log and both
    /// checkpoints are rewritten.
    pub async fn change(&self, req: ChangeRequest) -> Result<()> {
        let workers = self.workers.lock().await;
        self.require_stopped(&workers)?;

        if req.start_offset.is_some() && req.start_file.is_none() {
            return Err(Error::Config("start_offset requires start_file".into()));
        }

        let mut source = self.ctx.source.read().await.clone();
        let moved = req.start_file.is_some()
            || req.host.as_ref().map_or(false, |h| *h != source.host)
            || req.port.map_or(false, |p| p != source.port);

        if let Some(host) = req.host {
            source.host = host;
        }
        if let Some(port) = req.port {
            source.port = port;
        }
        if let Some(user) = req.user {
            source.user = user;
        }
        if let Some(password) = req.password {
            source.password = password;
        }
        if let Some(secs) = req.connect_retry_secs {
            source.connect_retry = Duration::from_secs(secs);
        }
        if let Some(ms) = req.heartbeat_period_ms {
            source.heartbeat_period_ns = ms.saturating_mul(1_000_000);
        }
        if let Some(max) = req.max_retries {
            source.max_retries = max;
        }
        if let Some(ids) = req.ignore_server_ids {
            source.ignore_server_ids = ids.into_iter().collect();
        }
        if let Some(tls) = req.tls {
            if tls.enabled && tls.ca.is_none() {
                return Err(Error::Config("TLS needs a CA bundle".into()));
            }
            source.tls = tls;
        }

        if moved {
            source.requested = match req.start_file {
                Some(file) => Coordinate::new(
                    file,
                    req.start_offset
                        .unwrap_or(crate::coordinate::SEGMENT_HEADER_SIZE),
                ),
                None => Coordinate::default(),
            };
            source.relay_coordinate = Coordinate::default();
            // Journal first: until it is cleared, reopening finishes the reset
            let stop_condition = self.ctx.apply.read().await.stop_condition.clone();
            let pending = PendingReset::Change {
                apply: ApplyState {
                    stop_condition,
                    ..ApplyState::starting_at(Coordinate::default(), source.requested.clone())
                },
                source,
            };
            pending.save(&self.ctx.paths.pending_reset())?;

            if let Some((source, apply)) =
                Self::finish_reset(&self.ctx.relay, &self.ctx.paths, pending).await?
            {
                tracing::info!(
                    "[{}] Link now replicates {} from {}",
                    self.name(),
                    source.address(),
                    if source.requested.is_unset() {
                        "the first log".to_string()
                    } else {
                        source.requested.to_string()
                    }
                );
                self.ctx.relay.pin_io(source.relay_coordinate.clone());
                self.ctx.relay.pin_apply(apply.group_cursor.clone());
                *self.ctx.source.write().await = source;
                *self.ctx.apply.write().await = apply;
            }
            return Ok(());
        }

        *self.ctx.source.write().await = source;
        self.ctx.save_source().await
    }

    /// Forget all replication progress of a stopped link
    pub async fn reset(&self) -> Result<()> {
        let workers = self.workers.lock().await;
        self.require_stopped(&workers)?;

        PendingReset::Forget.save(&self.ctx.paths.pending_reset())?;
        Self::finish_reset(&self.ctx.relay, &self.ctx.paths, PendingReset::Forget).await?;

        let fresh = self.config.source_link();
        let mut source = self.ctx.source.write().await;
        source.requested = fresh.requested.clone();
        source.relay_coordinate = Coordinate::default();
        *self.ctx.apply.write().await = ApplyState {
            source_mirror: fresh.requested,
            ..ApplyState::default()
        };
        *self.ctx.io_error.lock() = None;
        *self.ctx.apply_error.lock() = None;
        tracing::info!("[{}] Reset: relay log and checkpoints removed", self.name());
        Ok(())
    }

    /// Empty the relay log, then settle the position records as `pending` says
    ///
    /// Every step overwrites or deletes, so running it again after a crash
    /// is harmless. The journal is removed last.
    async fn finish_reset(
        relay: &RelayLog,
        paths: &CheckpointPaths,
        pending: PendingReset,
    ) -> Result<Option<(SourceLink, ApplyState)>> {
        let relay_start = relay.reset().await?;
        let settled = match pending {
            PendingReset::Change {
                mut source,
                mut apply,
            } => {
                source.relay_coordinate = relay.end();
                apply.event_cursor = relay_start.clone();
                apply.group_cursor = relay_start;
                source.save(&paths.source_link())?;
                apply.save(&paths.apply_state())?;
                Some((source, apply))
            }
            PendingReset::Forget => {
                paths.remove_all()?;
                None
            }
        };
        PendingReset::clear(&paths.pending_reset())?;
        Ok(settled)
    }

    /// Skip the next `count` groups when the apply worker starts
    pub async fn skip(&self, count: u32) -> Result<()> {
        let workers = self.workers.lock().await;
        if workers.apply_running() {
            return Err(Error::LinkRunning(self.name().to_string()));
        }
        self.ctx.apply.write().await.skip_counter = count;
        self.ctx.save_apply().await
    }

    /// Replace every rule set; takes effect at the next group
    pub fn set_filter(&self, config: &FilterConfig) -> Result<()> {
        self.ctx.filter.replace_all(config)?;
        tracing::info!("[{}] Replication filter replaced", self.name());
        Ok(())
    }

    /// Replace one rule set
    pub fn set_rule_set(&self, set: RuleSet, values: &[String]) -> Result<()> {
        self.ctx.filter.replace_rule_set(set, values)
    }

    pub async fn status(&self) -> LinkStatus {
        let source = self.ctx.source.read().await.clone();
        let apply = self.ctx.apply.read().await.clone();
        LinkStatus {
            name: self.name().to_string(),
            source_host: source.host,
            source_port: source.port,
            io_state: source.run_state,
            apply_state: apply.run_state,
            requested: source.requested,
            relay_write: self.ctx.relay.end(),
            relay_group: apply.group_cursor,
            relay_event: apply.event_cursor,
            source_applied: apply.source_mirror,
            skip_counter: apply.skip_counter,
            retry_count: apply.retry_count,
            stop_condition: apply.stop_condition,
            relay_log_space: self.ctx.relay.total_size(),
            clock_skew_secs: *self.ctx.clock_skew.lock(),
            last_io_error: self.ctx.io_error.lock().clone(),
            last_apply_error: self.ctx.apply_error.lock().clone(),
            ignore_server_ids: source.ignore_server_ids.into_iter().collect(),
            filter: self.ctx.filter.snapshot().describe(),
            executor: self.executor.name().to_string(),
        }
    }

    fn require_stopped(&self, workers: &Workers) -> Result<()> {
        if workers.io_running() || workers.apply_running() {
            return Err(Error::LinkRunning(self.name().to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ExecutorConfig, LinkConfig};
    use crate::event::{DataEvent, Event, GroupBoundary, LogEvent};
    use crate::executor::RecordingExecutor;
    use bytes::Bytes;
    use tempfile::tempdir;

    fn config(dir: &std::path::Path) -> WolfRelayConfig {
        let text = format!(
            "[node]\nserver_id = 2\ndata_dir = \"{}\"\n\n[[links]]\nname = \"east\"\nhost = \"127.0.0.1\"\nport = 1\nconnect_retry_secs = 3600\n",
            dir.display()
        );
        WolfRelayConfig::from_str(&text).unwrap()
    }

    async fn open(config: &WolfRelayConfig) -> Link {
        let link: &LinkConfig = &config.links[0];
        assert!(matches!(link.executor, ExecutorConfig::Recording));
        Link::open(config, link, Arc::new(RecordingExecutor::new()))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_start_twice_warns_and_stop_refuses_locks() {
        let dir = tempdir().unwrap();
        let config = config(dir.path());
        let link = open(&config).await;

        assert!(link.start(WorkerSelection::Both, None).await.unwrap().is_empty());
        let warnings = link.start(WorkerSelection::Both, None).await.unwrap();
        assert_eq!(warnings.len(), 2);

        let locked = link
            .stop(WorkerSelection::Both, AdminSession { holds_locks: true })
            .await;
        assert!(matches!(locked, Err(Error::LockHeld(_))));

        assert!(matches!(link.change(ChangeRequest::default()).await, Err(Error::LinkRunning(_))));
        assert!(matches!(link.reset().await, Err(Error::LinkRunning(_))));

        link.stop(WorkerSelection::Both, AdminSession::default())
            .await
            .unwrap();
        let status = link.status().await;
        assert_eq!(status.io_state, IoRunState::Stopped);
        assert_eq!(status.apply_state, ApplyRunState::Stopped);
    }

    #[tokio::test]
    async fn test_change_resets_relay_and_persists_both_checkpoints() {
        let dir = tempdir().unwrap();
        let config = config(dir.path());
        let link = open(&config).await;

        link.change(ChangeRequest {
            host: Some("10.0.0.9".into()),
            start_file: Some("wolfrelay-bin.000007".into()),
            start_offset: Some(1200),
            ..ChangeRequest::default()
        })
        .await
        .unwrap();

        let status = link.status().await;
        assert_eq!(status.source_host, "10.0.0.9");
        assert_eq!(status.requested, Coordinate::new("wolfrelay-bin.000007", 1200));
        assert_eq!(status.source_applied, status.requested);
        assert_eq!(status.relay_group.file, status.relay_write.file);
        assert!(!link.ctx.paths.pending_reset().exists());

        // Reopening reads the same positions back
        link.shutdown().await;
        drop(link);
        let link = open(&config).await;
        let reopened = link.status().await;
        assert_eq!(reopened.requested, status.requested);
        assert_eq!(reopened.source_applied, status.requested);
        assert_eq!(reopened.source_host, "10.0.0.9");
    }

    /// Fill the relay past its first segment and checkpoint the end
    async fn advance_relay(link: &Link) -> Coordinate {
        for n in 0..3 {
            let row = LogEvent::new(
                Event::Data(DataEvent {
                    boundary: GroupBoundary::standalone(),
                    schema: "app".into(),
                    table: None,
                    payload: Bytes::from(format!("INSERT INTO t VALUES ({})", n)),
                }),
                1,
                0,
            );
            link.ctx.relay.append(&row).await.unwrap();
            link.ctx.relay.rotate().await.unwrap();
        }
        let end = link.ctx.relay.end();
        link.ctx.source.write().await.relay_coordinate = end.clone();
        link.ctx.apply.write().await.group_cursor = end.clone();
        link.ctx.save_source().await.unwrap();
        link.ctx.save_apply().await.unwrap();
        end
    }

    #[tokio::test]
    async fn test_change_interrupted_after_relay_reset_completes_on_open() {
        let dir = tempdir().unwrap();
        let config = config(dir.path());
        let link = open(&config).await;
        let stale = advance_relay(&link).await;
        let paths = link.ctx.paths.clone();

        // Crash after the journal and the relay reset, before either record is rewritten
        let mut source = link.ctx.source.read().await.clone();
        source.host = "10.0.0.9".into();
        source.requested = Coordinate::new("wolfrelay-bin.000007", 1200);
        source.relay_coordinate = Coordinate::default();
        let apply = ApplyState::starting_at(Coordinate::default(), source.requested.clone());
        PendingReset::Change { source, apply }
            .save(&paths.pending_reset())
            .unwrap();
        link.ctx.relay.reset().await.unwrap();
        link.shutdown().await;
        drop(link);
        assert_eq!(
            SourceLink::load(&paths.source_link()).unwrap().unwrap().relay_coordinate,
            stale
        );

        let link = open(&config).await;
        let status = link.status().await;
        assert!(!paths.pending_reset().exists());
        assert_eq!(status.source_host, "10.0.0.9");
        assert_eq!(status.requested, Coordinate::new("wolfrelay-bin.000007", 1200));
        assert_eq!(status.source_applied, status.requested);
        assert!(status.relay_write.file.ends_with(".000001"));
        assert_eq!(status.relay_group, Coordinate::start_of(status.relay_write.file.clone()));

        // Both records on disk point inside the new relay log
        let source = SourceLink::load(&paths.source_link()).unwrap().unwrap();
        assert_eq!(source.relay_coordinate, status.relay_write);
        let apply = ApplyState::load(&paths.apply_state()).unwrap().unwrap();
        assert_eq!(apply.group_cursor, status.relay_group);
        assert!(link.ctx.relay.reader(&apply.group_cursor).await.is_ok());
    }

    #[tokio::test]
    async fn test_change_interrupted_before_relay_reset_completes_on_open() {
        let dir = tempdir().unwrap();
        let config = config(dir.path());
        let link = open(&config).await;
        advance_relay(&link).await;
        let paths = link.ctx.paths.clone();

        let mut source = link.ctx.source.read().await.clone();
        source.requested = Coordinate::new("wolfrelay-bin.000002", 4);
        source.relay_coordinate = Coordinate::default();
        let apply = ApplyState::starting_at(Coordinate::default(), source.requested.clone());
        PendingReset::Change { source, apply }
            .save(&paths.pending_reset())
            .unwrap();
        link.shutdown().await;
        drop(link);

        let link = open(&config).await;
        let status = link.status().await;
        assert!(!paths.pending_reset().exists());
        assert_eq!(status.requested, Coordinate::new("wolfrelay-bin.000002", 4));
        assert!(status.relay_write.file.ends_with(".000001"));
        assert_eq!(status.relay_group.file, status.relay_write.file);
    }

    #[tokio::test]
    async fn test_reset_interrupted_forgets_progress_on_open() {
        let dir = tempdir().unwrap();
        let config = config(dir.path());
        let link = open(&config).await;
        advance_relay(&link).await;
        link.skip(2).await.unwrap();
        let paths = link.ctx.paths.clone();

        PendingReset::Forget.save(&paths.pending_reset()).unwrap();
        link.shutdown().await;
        drop(link);

        let link = open(&config).await;
        let status = link.status().await;
        assert!(!paths.pending_reset().exists());
        assert!(!paths.apply_state().exists());
        assert!(!paths.source_link().exists());
        assert_eq!(status.skip_counter, 0);
        assert!(status.relay_write.file.ends_with(".000001"));
        assert!(status.requested.is_unset());
    }

    #[tokio::test]
    async fn test_reset_removes_checkpoints() {
        let dir = tempdir().unwrap();
        let config = config(dir.path());
        let link = open(&config).await;
        link.skip(3).await.unwrap();
        assert!(link.ctx.paths.apply_state().exists());

        link.reset().await.unwrap();
        assert!(!link.ctx.paths.pending_reset().exists());
        assert!(!link.ctx.paths.apply_state().exists());
        assert!(!link.ctx.paths.source_link().exists());
        assert_eq!(link.status().await.skip_counter, 0);
    }

    #[tokio::test]
    async fn test_until_requires_apply_worker_start() {
        let dir = tempdir().unwrap();
        let config = config(dir.path());
        let link = open(&config).await;
        let until = StopCondition::AtSourceCoordinate(Coordinate::new("wolfrelay-bin.000001", 900));

        assert!(link
            .start(WorkerSelection::Io, Some(until.clone()))
            .await
            .is_err());
        link.start(WorkerSelection::Apply, Some(until.clone()))
            .await
            .unwrap();
        assert_eq!(link.status().await.stop_condition, until);
        link.shutdown().await;
    }

    #[tokio::test]
    async fn test_filter_replacement_is_visible_in_status() {
        let dir = tempdir().unwrap();
        let config = config(dir.path());
        let link = open(&config).await;
        link.set_filter(&FilterConfig {
            do_db: vec!["app".into()],
            ..FilterConfig::default()
        })
        .unwrap();
        assert_eq!(link.status().await.filter.do_db, vec!["app".to_string()]);

        let bad = FilterConfig {
            rewrite_db: vec!["nope".into()],
            ..FilterConfig::default()
        };
        assert!(link.set_filter(&bad).is_err());
        assert_eq!(link.status().await.filter.do_db, vec!["app".to_string()]);
    }
}
