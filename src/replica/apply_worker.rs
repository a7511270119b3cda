//! Apply Worker
//!
//! Reads the relay log from the last fully applied group and hands data
//! events to the executor. Cursors move only at group boundaries, so a
//! restart or a retry always resumes at the start of a whole group.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::ReplicaContext;
use crate::binlog::{LogReader, ReadEvent, ReadOutcome};
use crate::checkpoint::{ApplyRunState, StopCondition};
use crate::coordinate::Coordinate;
use crate::error::{Error, Result};
use crate::event::{flags, DataEvent, Event, EventHeader};
use crate::executor::{ApplyEvent, ExecOutcome, Executor};
use crate::filter::FilterRules;

/// Why the apply worker returned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyExit {
    Stopped,
    /// The stop condition was reached and cleared
    UntilReached,
    Failed,
}

enum Step {
    Continue,
    Retry(String),
    Halt,
}

/// Read position within the relay log's source stream
struct Cursor {
    in_group: bool,
    /// Current group is consumed by the skip counter
    skipping: bool,
    /// Rules in force for the current group
    rules: Arc<FilterRules>,
    source_file: String,
    source_pos: u64,
}

impl Cursor {
    fn source(&self) -> Coordinate {
        Coordinate::new(self.source_file.clone(), self.source_pos)
    }
}

pub struct ApplyWorker {
    ctx: Arc<ReplicaContext>,
    executor: Arc<dyn Executor>,
    cancel: CancellationToken,
}

impl ApplyWorker {
    pub fn new(
        ctx: Arc<ReplicaContext>,
        executor: Arc<dyn Executor>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            ctx,
            executor,
            cancel,
        }
    }

    pub fn spawn(self) -> JoinHandle<ApplyExit> {
        tokio::spawn(self.run())
    }

    pub async fn run(self) -> ApplyExit {
        let name = self.ctx.name.clone();
        tracing::info!("[{}] Apply worker starting ({} executor)", name, self.executor.name());
        self.ctx.apply.write().await.run_state = ApplyRunState::Running;

        let result = self.run_inner().await;

        let group_cursor = {
            let mut state = self.ctx.apply.write().await;
            state.run_state = ApplyRunState::Stopped;
            state.event_cursor = state.group_cursor.clone();
            state.group_cursor.clone()
        };
        if let Err(e) = self.ctx.save_apply().await {
            tracing::warn!("[{}] Final apply checkpoint failed: {}", name, e);
        }
        self.ctx.relay.set_apply_parked(false);

        match result {
            Ok(exit) => {
                tracing::info!("[{}] Apply worker halted at {} ({:?})", name, group_cursor, exit);
                exit
            }
            Err(Error::Cancelled) => {
                tracing::info!("[{}] Apply worker stopped at {}", name, group_cursor);
                ApplyExit::Stopped
            }
            Err(e) => {
                tracing::error!("[{}] Apply worker failed at {}: {}", name, group_cursor, e);
                self.ctx.record_apply_error(&e, group_cursor);
                ApplyExit::Failed
            }
        }
    }

    async fn run_inner(&self) -> Result<ApplyExit> {
        let (start, mirror) = {
            let mut state = self.ctx.apply.write().await;
            if state.group_cursor.is_unset() {
                state.group_cursor = self.ctx.relay.start().await;
            }
            state.event_cursor = state.group_cursor.clone();
            (state.group_cursor.clone(), state.source_mirror.clone())
        };
        tracing::debug!("[{}] Applying from relay {} (source {})", self.ctx.name, start, mirror);

        let mut reader = self.ctx.relay.reader(&start).await?;
        let mut cur = Cursor {
            in_group: false,
            skipping: false,
            rules: self.ctx.filter.snapshot(),
            source_file: mirror.file,
            source_pos: mirror.offset,
        };

        let result = self.drive(&mut reader, &mut cur).await;
        if cur.in_group {
            self.executor.rollback().await;
        }
        result
    }

    async fn drive(&self, reader: &mut LogReader, cur: &mut Cursor) -> Result<ApplyExit> {
        loop {
            let outcome = tokio::select! {
                _ = self.cancel.cancelled() => return Err(Error::Cancelled),
                outcome = reader.next() => outcome?,
            };

            match outcome {
                ReadOutcome::Event(ev) => match self.handle_event(ev, cur).await? {
                    Step::Continue => {}
                    Step::Halt => return Ok(ApplyExit::UntilReached),
                    Step::Retry(reason) => self.retry(reason, reader, cur).await?,
                },
                ReadOutcome::EndOfSegment => {
                    if !reader.advance().await? {
                        // Closed segment with nothing after it yet; the next rotation moves the end
                        tokio::select! {
                            _ = self.cancel.cancelled() => return Err(Error::Cancelled),
                            r = reader.wait_for_data() => r?,
                        }
                    }
                }
                ReadOutcome::EndOfLog => {
                    self.ctx.relay.set_apply_parked(true);
                    let waited = tokio::select! {
                        _ = self.cancel.cancelled() => Err(Error::Cancelled),
                        r = reader.wait_for_data() => r,
                    };
                    self.ctx.relay.set_apply_parked(false);
                    waited?;
                }
            }
        }
    }

    async fn handle_event(&self, ev: ReadEvent, cur: &mut Cursor) -> Result<Step> {
        let header = ev.event.header;
        self.ctx.apply.write().await.event_cursor = ev.end.clone();

        // Written by the relay log itself
        if header.has_flag(flags::RELAY_LOG) {
            if !cur.in_group {
                self.move_group_cursor(&ev.end, None).await?;
            }
            return Ok(Step::Continue);
        }

        match &ev.event.event {
            Event::Rotate {
                new_file,
                new_offset,
            } => {
                cur.source_file = new_file.clone();
                cur.source_pos = *new_offset;
                if !cur.in_group {
                    self.move_group_cursor(&ev.end, Some(cur.source())).await?;
                }
            }
            Event::FormatHandshake { .. } => {
                if header.end_log_pos != 0 {
                    if cur.in_group && !ev.event.is_synthetic() {
                        tracing::warn!(
                            "[{}] Primary restarted inside a group at {}; discarding the partial group",
                            self.ctx.name,
                            cur.source()
                        );
                        self.executor.rollback().await;
                        cur.in_group = false;
                        cur.skipping = false;
                    }
                    cur.source_pos = header.end_log_pos as u64;
                }
                if !cur.in_group {
                    self.move_group_cursor(&ev.end, Some(cur.source())).await?;
                }
            }
            Event::Heartbeat { .. } | Event::StreamEnd => {
                if !cur.in_group {
                    self.move_group_cursor(&ev.end, None).await?;
                }
            }
            Event::Data(data) => return self.handle_data(&ev, header, data.clone(), cur).await,
        }
        Ok(Step::Continue)
    }

    async fn handle_data(
        &self,
        ev: &ReadEvent,
        header: EventHeader,
        data: DataEvent,
        cur: &mut Cursor,
    ) -> Result<Step> {
        let stop = self.ctx.apply.read().await.stop_condition.clone();
        if stop.reached(&ev.start, &cur.source()) {
            if cur.in_group {
                self.executor.rollback().await;
                cur.in_group = false;
            }
            self.ctx.apply.write().await.stop_condition = StopCondition::None;
            self.ctx.save_apply().await?;
            tracing::info!(
                "[{}] Reached stop condition {:?} at relay {} (source {})",
                self.ctx.name,
                stop,
                ev.start,
                cur.source()
            );
            return Ok(Step::Halt);
        }

        if data.boundary.starts_group() || !cur.in_group {
            cur.in_group = true;
            cur.skipping = self.ctx.apply.read().await.skip_counter > 0;
            cur.rules = self.ctx.filter.snapshot();
        }

        let source_end = Coordinate::new(cur.source_file.clone(), header.end_log_pos as u64);
        let ends_group = data.boundary.ends_group();
        let wanted = !cur.skipping
            && !self.ctx.is_self_origin(header.server_id)
            && cur
                .rules
                .should_replicate(&data.schema, data.table.as_deref());

        let outcome = if wanted {
            let event = ApplyEvent {
                schema: cur.rules.rewrite(&data.schema).to_string(),
                table: data.table,
                payload: data.payload,
                server_id: header.server_id,
                timestamp: header.timestamp,
                relay: ev.start.clone(),
                source_end: source_end.clone(),
                ends_group,
            };
            self.executor.execute(&event).await
        } else if ends_group {
            self.executor.finish_group().await
        } else {
            ExecOutcome::Committed
        };

        match outcome {
            ExecOutcome::Committed => {}
            ExecOutcome::TransientConflict(reason) => return Ok(Step::Retry(reason)),
            ExecOutcome::Fatal(reason) => {
                return Err(Error::Apply(format!(
                    "{} executor failed on relay {} (source {}): {}",
                    self.executor.name(),
                    ev.start,
                    source_end,
                    reason
                )))
            }
        }

        if header.end_log_pos != 0 {
            cur.source_pos = header.end_log_pos as u64;
        }
        if ends_group {
            let skipped = cur.skipping;
            cur.in_group = false;
            cur.skipping = false;
            self.commit_group(&ev.end, source_end, skipped).await?;
        }
        Ok(Step::Continue)
    }

    /// Move both cursors past a completed group and persist them
    async fn commit_group(&self, end: &Coordinate, source_end: Coordinate, skipped: bool) -> Result<()> {
        let previous_file = {
            let mut state = self.ctx.apply.write().await;
            let previous = std::mem::replace(&mut state.group_cursor, end.clone());
            state.event_cursor = end.clone();
            state.source_mirror = source_end;
            state.retry_count = 0;
            if skipped {
                state.skip_counter = state.skip_counter.saturating_sub(1);
            }
            previous.file
        };
        self.ctx.save_apply().await?;
        if previous_file != end.file {
            self.purge().await;
        }
        Ok(())
    }

    /// Move the group cursor over an event that is not part of a group
    async fn move_group_cursor(&self, end: &Coordinate, source: Option<Coordinate>) -> Result<()> {
        let previous_file = {
            let mut state = self.ctx.apply.write().await;
            let previous = std::mem::replace(&mut state.group_cursor, end.clone());
            state.event_cursor = end.clone();
            if let Some(source) = source {
                state.source_mirror = source;
            }
            previous.file
        };
        self.ctx.save_apply().await?;
        if previous_file != end.file {
            self.purge().await;
        }
        Ok(())
    }

    /// Roll back the open group and replay it from its first event
    async fn retry(&self, reason: String, reader: &mut LogReader, cur: &mut Cursor) -> Result<()> {
        self.executor.rollback().await;

        let (attempt, group_cursor, mirror) = {
            let mut state = self.ctx.apply.write().await;
            state.retry_count += 1;
            state.event_cursor = state.group_cursor.clone();
            (
                state.retry_count,
                state.group_cursor.clone(),
                state.source_mirror.clone(),
            )
        };
        let max = self.ctx.apply_settings.max_group_retries;
        if attempt > max {
            // Out of retries: the conflict is now a hard apply error
            return Err(Error::Apply(format!(
                "group at {} still failing after {} retries: {}",
                group_cursor, max, reason
            )));
        }
        self.ctx.save_apply().await?;

        let delay = self.ctx.apply_settings.backoff(attempt);
        tracing::warn!(
            "[{}] Transient conflict at {} ({}); retry {}/{} in {:?}",
            self.ctx.name,
            group_cursor,
            reason,
            attempt,
            max,
            delay
        );
        tokio::select! {
            _ = self.cancel.cancelled() => return Err(Error::Cancelled),
            _ = tokio::time::sleep(delay) => {}
        }

        reader.seek(&group_cursor).await?;
        cur.in_group = false;
        cur.skipping = false;
        cur.source_file = mirror.file;
        cur.source_pos = mirror.offset;
        Ok(())
    }

    async fn purge(&self) {
        if !self.ctx.relay.purge_enabled() {
            return;
        }
        let at = self.ctx.apply.read().await.group_cursor.clone();
        match self.ctx.relay.purge_up_to(&at).await {
            Ok(_) => {}
            Err(Error::PurgeRefused(reason)) => {
                tracing::debug!("[{}] Relay purge deferred: {}", self.ctx.name, reason)
            }
            Err(e) => tracing::warn!("[{}] Relay purge failed: {}", self.ctx.name, e),
        }
    }
}
