//! Recording Executor
//!
//! Keeps applied events in memory. Used for dry-run links and tests; a
//! queue of scripted outcomes lets tests inject conflicts and failures.

use std::collections::VecDeque;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{ApplyEvent, ExecOutcome, Executor};

#[derive(Debug, Default)]
struct Recorded {
    pending: Vec<ApplyEvent>,
    committed: Vec<Vec<ApplyEvent>>,
    rollbacks: usize,
    script: VecDeque<ExecOutcome>,
}

#[derive(Debug, Default)]
pub struct RecordingExecutor {
    state: Mutex<Recorded>,
}

impl RecordingExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue outcomes returned by the next `execute` calls, in order
    ///
    /// A scripted `Committed` applies the event normally.
    pub fn script(&self, outcomes: impl IntoIterator<Item = ExecOutcome>) {
        self.state.lock().script.extend(outcomes);
    }

    /// Committed groups, oldest first
    pub fn committed_groups(&self) -> Vec<Vec<ApplyEvent>> {
        self.state.lock().committed.clone()
    }

    /// Every committed event, in commit order
    pub fn committed_events(&self) -> Vec<ApplyEvent> {
        self.state.lock().committed.iter().flatten().cloned().collect()
    }

    pub fn rollbacks(&self) -> usize {
        self.state.lock().rollbacks
    }

    /// Events applied since the last commit
    pub fn pending(&self) -> usize {
        self.state.lock().pending.len()
    }
}

#[async_trait]
impl Executor for RecordingExecutor {
    async fn execute(&self, event: &ApplyEvent) -> ExecOutcome {
        let mut state = self.state.lock();
        match state.script.pop_front() {
            None | Some(ExecOutcome::Committed) => {}
            Some(failure) => return failure,
        }
        state.pending.push(event.clone());
        if event.ends_group {
            let group = std::mem::take(&mut state.pending);
            state.committed.push(group);
        }
        ExecOutcome::Committed
    }

    async fn finish_group(&self) -> ExecOutcome {
        let mut state = self.state.lock();
        if !state.pending.is_empty() {
            let group = std::mem::take(&mut state.pending);
            state.committed.push(group);
        }
        ExecOutcome::Committed
    }

    async fn rollback(&self) {
        let mut state = self.state.lock();
        state.pending.clear();
        state.rollbacks += 1;
    }

    fn name(&self) -> &'static str {
        "recording"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinate::Coordinate;
    use bytes::Bytes;

    fn event(n: u64, ends_group: bool) -> ApplyEvent {
        ApplyEvent {
            schema: "app".into(),
            table: Some("t".into()),
            payload: Bytes::from(n.to_string()),
            server_id: 1,
            timestamp: 0,
            relay: Coordinate::new("relay.000001", n),
            source_end: Coordinate::new("log.000001", n),
            ends_group,
        }
    }

    #[tokio::test]
    async fn test_rollback_discards_pending_events() {
        let exec = RecordingExecutor::new();
        exec.execute(&event(1, false)).await;
        exec.rollback().await;
        exec.execute(&event(2, true)).await;

        let groups = exec.committed_groups();
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0], vec![event(2, true)]);
        assert_eq!(exec.rollbacks(), 1);
    }

    #[tokio::test]
    async fn test_scripted_outcomes_come_first() {
        let exec = RecordingExecutor::new();
        exec.script([ExecOutcome::TransientConflict("deadlock".into())]);
        assert!(matches!(
            exec.execute(&event(1, true)).await,
            ExecOutcome::TransientConflict(_)
        ));
        assert_eq!(exec.execute(&event(1, true)).await, ExecOutcome::Committed);
        assert_eq!(exec.committed_events().len(), 1);
    }
}
