//! Event Log Reader
//!
//! Sequential cursor over an [`EventLog`]. The reader never reads past the
//! published end of the active segment, so a frame that is still being
//! written is never observed.

use std::fs::File;
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::watch;

use super::segment::read_frame;
use super::EventLog;
use crate::coordinate::{Coordinate, SEGMENT_HEADER_SIZE};
use crate::error::{Error, Result};
use crate::event::LogEvent;

/// One event read from the log
#[derive(Debug, Clone)]
pub struct ReadEvent {
    pub event: LogEvent,
    /// Frame exactly as stored
    pub frame: Bytes,
    /// Coordinate of the first byte of the event
    pub start: Coordinate,
    /// Coordinate just past the event
    pub end: Coordinate,
}

/// Result of a read attempt
#[derive(Debug)]
pub enum ReadOutcome {
    Event(ReadEvent),
    /// End of a closed segment; call [`LogReader::advance`]
    EndOfSegment,
    /// End of the segment still being written; wait for more data
    EndOfLog,
}

/// Cursor over an event log
pub struct LogReader {
    log: Arc<EventLog>,
    file_name: String,
    file: File,
    pos: u64,
    end_rx: watch::Receiver<Coordinate>,
}

impl LogReader {
    /// Open a reader positioned at `at`
    pub async fn open(log: Arc<EventLog>, at: &Coordinate) -> Result<Self> {
        let file = open_at(&log, at).await?;
        let end_rx = log.subscribe();
        Ok(Self {
            log,
            file_name: at.file.clone(),
            file,
            pos: at.offset,
            end_rx,
        })
    }

    /// Current read position
    pub fn position(&self) -> Coordinate {
        Coordinate::new(self.file_name.clone(), self.pos)
    }

    /// Reposition to a previously written coordinate
    pub async fn seek(&mut self, at: &Coordinate) -> Result<()> {
        if at.file != self.file_name {
            self.file = open_at(&self.log, at).await?;
            self.file_name = at.file.clone();
        } else if at.offset < SEGMENT_HEADER_SIZE {
            return Err(Error::NoSuchPosition {
                file: at.file.clone(),
                offset: at.offset,
            });
        }
        self.pos = at.offset;
        Ok(())
    }

    /// Read the next event, or report where the reader stands
    pub async fn next(&mut self) -> Result<ReadOutcome> {
        let end = self.end_rx.borrow_and_update().clone();
        let active = end.file == self.file_name;
        let limit = if active {
            end.offset
        } else {
            self.file.metadata()?.len()
        };

        if self.pos >= limit {
            return Ok(if active {
                ReadOutcome::EndOfLog
            } else {
                ReadOutcome::EndOfSegment
            });
        }

        let start = self.position();
        let frame = read_frame(&mut self.file, self.pos, limit).map_err(|e| match e {
            Error::MalformedEvent { offset, reason, .. } => Error::MalformedEvent {
                file: self.file_name.clone(),
                offset,
                reason,
            },
            other => other,
        })?;
        let event = LogEvent::decode(&frame).map_err(|reason| Error::MalformedEvent {
            file: self.file_name.clone(),
            offset: self.pos,
            reason,
        })?;

        self.pos += frame.len() as u64;
        Ok(ReadOutcome::Event(ReadEvent {
            event,
            frame,
            start,
            end: self.position(),
        }))
    }

    /// Move to the start of the next segment in the index
    ///
    /// Returns false when there is no later segment.
    pub async fn advance(&mut self) -> Result<bool> {
        match self.log.next_segment(&self.file_name).await {
            Some(next) => {
                let at = Coordinate::start_of(next);
                self.seek(&at).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Wait until the log's end coordinate moves
    pub async fn wait_for_data(&mut self) -> Result<()> {
        self.end_rx.changed().await.map_err(|_| Error::ShuttingDown)
    }

    /// True while the reader sits in the segment being written
    pub fn in_active_segment(&self) -> bool {
        self.end_rx.borrow().file == self.file_name
    }

    pub fn log(&self) -> &Arc<EventLog> {
        &self.log
    }
}

async fn open_at(log: &EventLog, at: &Coordinate) -> Result<File> {
    let no_such = || Error::NoSuchPosition {
        file: at.file.clone(),
        offset: at.offset,
    };
    let len = log.segment_len(&at.file).await?.ok_or_else(no_such)?;
    if at.offset < SEGMENT_HEADER_SIZE || at.offset > len {
        return Err(no_such());
    }
    Ok(File::open(log.paths().segment_path(&at.file))?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binlog::{LogKind, LogOptions};
    use crate::event::{DataEvent, Event, GroupBoundary};
    use std::time::Duration;
    use tempfile::tempdir;

    fn open_log(dir: &std::path::Path) -> Arc<EventLog> {
        Arc::new(
            EventLog::open(
                dir,
                LogOptions {
                    basename: "log".to_string(),
                    max_segment_size: 1 << 20,
                    fsync: false,
                    server_id: 1,
                    kind: LogKind::Source,
                },
            )
            .unwrap(),
        )
    }

    fn row(n: u32) -> LogEvent {
        LogEvent::new(
            Event::Data(DataEvent {
                boundary: GroupBoundary::standalone(),
                schema: "app".to_string(),
                table: None,
                payload: Bytes::from(n.to_string()),
            }),
            1,
            0,
        )
    }

    #[tokio::test]
    async fn test_reads_across_rotation() {
        let dir = tempdir().unwrap();
        let log = open_log(dir.path());
        log.append(&row(1)).await.unwrap();
        log.rotate().await.unwrap();
        log.append(&row(2)).await.unwrap();

        let mut reader = LogReader::open(Arc::clone(&log), &Coordinate::start_of("log.000001"))
            .await
            .unwrap();
        let mut kinds = Vec::new();
        loop {
            match reader.next().await.unwrap() {
                ReadOutcome::Event(ev) => kinds.push(ev.event.event.name()),
                ReadOutcome::EndOfSegment => assert!(reader.advance().await.unwrap()),
                ReadOutcome::EndOfLog => break,
            }
        }
        assert_eq!(
            kinds,
            vec!["FormatHandshake", "Data", "Rotate", "FormatHandshake", "Data"]
        );
        assert_eq!(reader.position(), log.end());
    }

    #[tokio::test]
    async fn test_wait_wakes_on_append() {
        let dir = tempdir().unwrap();
        let log = open_log(dir.path());
        let mut reader = LogReader::open(Arc::clone(&log), &log.end()).await.unwrap();
        assert!(matches!(reader.next().await.unwrap(), ReadOutcome::EndOfLog));

        let writer = Arc::clone(&log);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            writer.append(&row(7)).await.unwrap();
        });

        tokio::time::timeout(Duration::from_secs(5), reader.wait_for_data())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(reader.next().await.unwrap(), ReadOutcome::Event(_)));
    }

    #[tokio::test]
    async fn test_unknown_position_is_rejected() {
        let dir = tempdir().unwrap();
        let log = open_log(dir.path());
        let missing = LogReader::open(Arc::clone(&log), &Coordinate::start_of("log.000042")).await;
        assert!(matches!(missing, Err(Error::NoSuchPosition { .. })));

        let past_end = LogReader::open(Arc::clone(&log), &log.end().with_offset(1 << 30)).await;
        assert!(matches!(past_end, Err(Error::NoSuchPosition { .. })));
    }
}
