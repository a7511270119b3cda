//! Event Log Writer
//!
//! Owns the active segment and the index. A single mutex guards appends,
//! segment switches and index updates so readers and the writer always
//! agree on rotation boundaries.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::{watch, Mutex};

use super::segment::SegmentWriter;
use super::{read_index, sync_dir, write_index, LogPaths};
use crate::coordinate::{compare_files, file_sequence, Coordinate, SEGMENT_HEADER_SIZE};
use crate::error::{Error, Result};
use crate::event::{current_timestamp, flags, Event, LogEvent};

/// What a log is used for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogKind {
    /// Primary's own log: positions are stamped on append, a fresh segment
    /// is started on every open
    Source,
    /// Replica relay log: appended frames keep their source positions, the
    /// last segment is reopened on start
    Relay,
}

/// Event log options
#[derive(Debug, Clone)]
pub struct LogOptions {
    /// Segment file basename
    pub basename: String,
    /// Rotate once a segment grows past this many bytes
    pub max_segment_size: u64,
    /// fsync after every append
    pub fsync: bool,
    /// Server id stamped on control events written by the log
    pub server_id: u32,
    pub kind: LogKind,
}

struct LogInner {
    active: SegmentWriter,
    index: Vec<String>,
    closed: bool,
}

/// Segmented, indexed, append-only event log
pub struct EventLog {
    paths: LogPaths,
    options: LogOptions,
    inner: Mutex<LogInner>,
    /// End of the durable log; receivers use it as the "new data" signal
    end: watch::Sender<Coordinate>,
    total_size: AtomicU64,
}

impl EventLog {
    /// Open the log in `dir`, creating or recovering segments as needed
    pub fn open(dir: impl Into<PathBuf>, options: LogOptions) -> Result<Self> {
        let paths = LogPaths::new(dir, options.basename.clone());
        paths.ensure_dirs()?;

        let mut index = read_index(&paths)?;
        let active = match index.last().cloned() {
            None => {
                let seg = start_segment(&paths, &options, &mut index, 1)?;
                tracing::info!("Created {} log {}", kind_name(options.kind), seg.name);
                seg
            }
            Some(last) => {
                let (mut seg, discarded) =
                    SegmentWriter::recover(paths.segment_path(&last), last.clone())?;
                if discarded > 0 {
                    tracing::warn!("Recovered {}: dropped {} torn bytes", last, discarded);
                }
                match options.kind {
                    LogKind::Relay => {
                        if seg.size == SEGMENT_HEADER_SIZE {
                            write_handshake(&mut seg, &options)?;
                        }
                        seg.set_in_use(true)?;
                        seg
                    }
                    LogKind::Source => {
                        seg.set_in_use(false)?;
                        seg.sync()?;
                        let next = file_sequence(&last).map_or(index.len() as u64 + 1, |s| s + 1);
                        start_segment(&paths, &options, &mut index, next)?
                    }
                }
            }
        };

        let mut total = 0;
        for name in &index {
            if *name == active.name {
                total += active.size;
            } else {
                total += std::fs::metadata(paths.segment_path(name))?.len();
            }
        }

        let (end, _) = watch::channel(Coordinate::new(active.name.clone(), active.size));

        Ok(Self {
            paths,
            options,
            inner: Mutex::new(LogInner {
                active,
                index,
                closed: false,
            }),
            end,
            total_size: AtomicU64::new(total),
        })
    }

    /// Append an event and return the coordinate just past it
    ///
    /// Source logs stamp `end_log_pos`; relay logs keep the event's own.
    pub async fn append(&self, event: &LogEvent) -> Result<Coordinate> {
        event.check().map_err(Error::Config)?;
        let mut inner = self.inner.lock().await;
        let end = match self.options.kind {
            LogKind::Source => self.write_stamped(&mut inner, event.clone())?,
            LogKind::Relay => self.write_frame(&mut inner, &event.encode())?,
        };
        self.maybe_rotate(&mut inner)?;
        Ok(end)
    }

    /// Append an already-encoded frame unchanged
    pub async fn append_frame(&self, frame: &[u8]) -> Result<Coordinate> {
        let mut inner = self.inner.lock().await;
        let end = self.write_frame(&mut inner, frame)?;
        self.maybe_rotate(&mut inner)?;
        Ok(end)
    }

    /// Append a whole transaction group without rotating in the middle
    ///
    /// Nothing is written unless every event in the group can be framed.
    pub async fn append_group(&self, events: Vec<LogEvent>) -> Result<Vec<Coordinate>> {
        for event in &events {
            event.check().map_err(Error::Config)?;
        }
        let mut inner = self.inner.lock().await;
        let mut ends = Vec::with_capacity(events.len());
        for event in events {
            let end = match self.options.kind {
                LogKind::Source => self.write_stamped(&mut inner, event)?,
                LogKind::Relay => self.write_frame(&mut inner, &event.encode())?,
            };
            ends.push(end);
        }
        self.maybe_rotate(&mut inner)?;
        Ok(ends)
    }

    /// Close the active segment and start a new one
    pub async fn rotate(&self) -> Result<String> {
        let mut inner = self.inner.lock().await;
        self.rotate_locked(&mut inner)
    }

    /// Delete every segment listed before `file`
    ///
    /// Never deletes the active segment. Returns the purged names.
    pub async fn purge_before(&self, file: &str) -> Result<Vec<String>> {
        let mut inner = self.inner.lock().await;
        if !inner.index.iter().any(|n| n == file) {
            return Err(Error::NoSuchPosition {
                file: file.to_string(),
                offset: 0,
            });
        }

        let active = inner.active.name.clone();
        let (purged, kept): (Vec<String>, Vec<String>) = inner.index.drain(..).partition(|n| {
            *n != active && compare_files(n, file) == std::cmp::Ordering::Less
        });
        inner.index = kept;
        write_index(&self.paths, &inner.index)?;

        for name in &purged {
            let path = self.paths.segment_path(name);
            let len = std::fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
            std::fs::remove_file(&path)?;
            self.total_size.fetch_sub(len, Ordering::SeqCst);
            tracing::debug!("Purged segment {}", name);
        }
        Ok(purged)
    }

    /// Drop everything after `at`, including later segments
    pub async fn truncate_to(&self, at: &Coordinate) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let pos = inner
            .index
            .iter()
            .position(|n| *n == at.file)
            .ok_or_else(|| Error::NoSuchPosition {
                file: at.file.clone(),
                offset: at.offset,
            })?;

        let len = if inner.active.name == at.file {
            inner.active.size
        } else {
            std::fs::metadata(self.paths.segment_path(&at.file))?.len()
        };
        if at.offset > len {
            return Err(Error::NoSuchPosition {
                file: at.file.clone(),
                offset: at.offset,
            });
        }

        for name in inner.index.split_off(pos + 1) {
            std::fs::remove_file(self.paths.segment_path(&name))?;
            tracing::info!("Removed segment {} past {}", name, at);
        }

        if inner.active.name != at.file {
            let (seg, _) = SegmentWriter::recover(self.paths.segment_path(&at.file), at.file.clone())?;
            inner.active = seg;
        }

        let target = at.offset.max(SEGMENT_HEADER_SIZE);
        inner.active.truncate(target)?;
        if target == SEGMENT_HEADER_SIZE {
            write_handshake(&mut inner.active, &self.options)?;
        }
        inner.active.set_in_use(true)?;
        inner.active.sync()?;
        write_index(&self.paths, &inner.index)?;

        self.recount(&inner)?;
        self.publish(&inner);
        Ok(())
    }

    /// Delete the index and every segment, then start over at sequence 1
    ///
    /// The index goes first so an interrupted reset reopens as an empty log;
    /// leftover segment files are truncated when their names come around again.
    pub async fn reset(&self) -> Result<String> {
        let mut inner = self.inner.lock().await;
        let index_path = self.paths.index_path();
        if index_path.exists() {
            std::fs::remove_file(&index_path)?;
            sync_dir(&self.paths.dir);
        }
        for name in &inner.index {
            let path = self.paths.segment_path(name);
            if path.exists() {
                std::fs::remove_file(&path)?;
            }
        }

        let mut index = Vec::new();
        let seg = start_segment(&self.paths, &self.options, &mut index, 1)?;
        let name = seg.name.clone();
        inner.active = seg;
        inner.index = index;
        inner.closed = false;

        self.recount(&inner)?;
        self.publish(&inner);
        tracing::info!("Reset {} log, now at {}", kind_name(self.options.kind), name);
        Ok(name)
    }

    /// Clear the in-use flag and flush; optionally record a stream end first
    pub async fn close(&self, write_stream_end: bool) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if inner.closed {
            return Ok(());
        }
        if write_stream_end {
            let stop = LogEvent::new(Event::StreamEnd, self.options.server_id, current_timestamp());
            self.write_stamped(&mut inner, stop)?;
        }
        inner.active.set_in_use(false)?;
        inner.active.sync()?;
        inner.closed = true;
        Ok(())
    }

    /// Flush the active segment to disk
    pub async fn sync(&self) -> Result<()> {
        let inner = self.inner.lock().await;
        inner
            .active
            .sync()
            .map_err(|e| Error::WriteError(format!("sync of {} failed: {}", inner.active.name, e)))
    }

    /// Coordinate just past the last durable event
    pub fn end(&self) -> Coordinate {
        self.end.borrow().clone()
    }

    /// Watch the end coordinate
    pub fn subscribe(&self) -> watch::Receiver<Coordinate> {
        self.end.subscribe()
    }

    /// Name of the segment currently being written
    pub fn active_file(&self) -> String {
        self.end.borrow().file.clone()
    }

    pub async fn segments(&self) -> Vec<String> {
        self.inner.lock().await.index.clone()
    }

    pub async fn contains(&self, file: &str) -> bool {
        self.inner.lock().await.index.iter().any(|n| n == file)
    }

    /// Segment listed right after `file`
    pub async fn next_segment(&self, file: &str) -> Option<String> {
        let inner = self.inner.lock().await;
        let pos = inner.index.iter().position(|n| n == file)?;
        inner.index.get(pos + 1).cloned()
    }

    /// Coordinate of the first event of the oldest segment
    pub async fn first_coordinate(&self) -> Coordinate {
        let inner = self.inner.lock().await;
        let first = inner.index.first().unwrap_or(&inner.active.name);
        Coordinate::start_of(first.clone())
    }

    /// Current length of a listed segment
    pub async fn segment_len(&self, file: &str) -> Result<Option<u64>> {
        let inner = self.inner.lock().await;
        if inner.active.name == file {
            return Ok(Some(inner.active.size));
        }
        if !inner.index.iter().any(|n| n == file) {
            return Ok(None);
        }
        Ok(Some(std::fs::metadata(self.paths.segment_path(file))?.len()))
    }

    /// Total bytes across all segments
    pub fn total_size(&self) -> u64 {
        self.total_size.load(Ordering::SeqCst)
    }

    pub fn paths(&self) -> &LogPaths {
        &self.paths
    }

    pub fn kind(&self) -> LogKind {
        self.options.kind
    }

    fn write_frame(&self, inner: &mut LogInner, frame: &[u8]) -> Result<Coordinate> {
        if inner.closed {
            return Err(Error::ShuttingDown);
        }
        let size = inner
            .active
            .append(frame)
            .map_err(|e| Error::WriteError(format!("append to {} failed: {}", inner.active.name, e)))?;
        if self.options.fsync {
            inner.active.sync().map_err(|e| {
                Error::WriteError(format!("fsync of {} failed: {}", inner.active.name, e))
            })?;
        }
        self.total_size.fetch_add(frame.len() as u64, Ordering::SeqCst);
        self.publish(inner);
        Ok(Coordinate::new(inner.active.name.clone(), size))
    }

    fn write_stamped(&self, inner: &mut LogInner, mut event: LogEvent) -> Result<Coordinate> {
        let end = inner.active.size + event.encoded_len() as u64;
        event.header.end_log_pos = u32::try_from(end)
            .map_err(|_| Error::WriteError(format!("{} exceeds 4 GiB", inner.active.name)))?;
        self.write_frame(inner, &event.encode())
    }

    fn maybe_rotate(&self, inner: &mut LogInner) -> Result<()> {
        if inner.active.size >= self.options.max_segment_size {
            self.rotate_locked(inner)?;
        }
        Ok(())
    }

    fn rotate_locked(&self, inner: &mut LogInner) -> Result<String> {
        let next_seq = file_sequence(&inner.active.name).map_or(inner.index.len() as u64 + 1, |s| s + 1);
        let next_name = self.paths.segment_name(next_seq);

        let rotate = LogEvent::new(
            Event::Rotate {
                new_file: next_name.clone(),
                new_offset: SEGMENT_HEADER_SIZE,
            },
            self.options.server_id,
            current_timestamp(),
        )
        .with_flags(self.own_flags());
        self.write_stamped(inner, rotate)?;
        inner.active.set_in_use(false)?;
        inner.active.sync()?;

        let previous = inner.active.name.clone();
        let seg = start_segment(&self.paths, &self.options, &mut inner.index, next_seq)?;
        self.total_size.fetch_add(seg.size, Ordering::SeqCst);
        inner.active = seg;
        self.publish(inner);

        tracing::info!("Rotated {} log {} -> {}", kind_name(self.options.kind), previous, next_name);
        Ok(next_name)
    }

    fn own_flags(&self) -> u16 {
        own_flags(self.options.kind)
    }

    fn recount(&self, inner: &LogInner) -> Result<()> {
        let mut total = 0;
        for name in &inner.index {
            if *name == inner.active.name {
                total += inner.active.size;
            } else {
                total += std::fs::metadata(self.paths.segment_path(name))?.len();
            }
        }
        self.total_size.store(total, Ordering::SeqCst);
        Ok(())
    }

    fn publish(&self, inner: &LogInner) {
        self.end
            .send_replace(Coordinate::new(inner.active.name.clone(), inner.active.size));
    }
}

fn own_flags(kind: LogKind) -> u16 {
    match kind {
        LogKind::Source => 0,
        LogKind::Relay => flags::RELAY_LOG,
    }
}

fn kind_name(kind: LogKind) -> &'static str {
    match kind {
        LogKind::Source => "source",
        LogKind::Relay => "relay",
    }
}

/// Create segment `seq`, write its handshake and list it in the index
fn start_segment(
    paths: &LogPaths,
    options: &LogOptions,
    index: &mut Vec<String>,
    seq: u64,
) -> Result<SegmentWriter> {
    let name = paths.segment_name(seq);
    let mut seg = SegmentWriter::create(paths.segment_path(&name), name.clone())?;
    write_handshake(&mut seg, options)?;
    seg.sync()?;
    index.push(name);
    write_index(paths, index)?;
    Ok(seg)
}

fn write_handshake(seg: &mut SegmentWriter, options: &LogOptions) -> Result<()> {
    let mut handshake = LogEvent::new(Event::format_handshake(), options.server_id, current_timestamp())
        .with_flags(flags::IN_USE | own_flags(options.kind));
    handshake.header.end_log_pos = (seg.size + handshake.encoded_len() as u64) as u32;
    seg.append(&handshake.encode())?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binlog::read_first_event;
    use crate::event::{DataEvent, GroupBoundary};
    use bytes::Bytes;
    use tempfile::tempdir;

    pub(crate) fn options(kind: LogKind, max: u64) -> LogOptions {
        LogOptions {
            basename: "log".to_string(),
            max_segment_size: max,
            fsync: false,
            server_id: 1,
            kind,
        }
    }

    fn row(n: u32) -> LogEvent {
        LogEvent::new(
            Event::Data(DataEvent {
                boundary: GroupBoundary::standalone(),
                schema: "app".to_string(),
                table: Some("t".to_string()),
                payload: Bytes::from(format!("INSERT INTO t VALUES ({})", n)),
            }),
            1,
            0,
        )
    }

    #[tokio::test]
    async fn test_append_stamps_positions() {
        let dir = tempdir().unwrap();
        let log = EventLog::open(dir.path(), options(LogKind::Source, 1 << 20)).unwrap();

        let start = log.end();
        let ev = row(1);
        let end = log.append(&ev).await.unwrap();
        assert_eq!(end.offset, start.offset + ev.encoded_len() as u64);
        assert_eq!(log.end(), end);
    }

    #[tokio::test]
    async fn test_group_with_oversized_name_writes_nothing() {
        let dir = tempdir().unwrap();
        let log = EventLog::open(dir.path(), options(LogKind::Source, 1 << 20)).unwrap();
        let before = log.end();

        let mut long = row(2);
        if let Event::Data(data) = &mut long.event {
            data.table = Some("t".repeat(crate::event::MAX_NAME_LEN + 1));
        }
        let err = log.append_group(vec![row(1), long.clone()]).await.unwrap_err();
        assert!(matches!(err, Error::Config(_)));
        assert!(matches!(log.append(&long).await, Err(Error::Config(_))));
        assert_eq!(log.end(), before);

        // The log stays usable and readable
        let end = log.append(&row(3)).await.unwrap();
        assert_eq!(end.offset, before.offset + row(3).encoded_len() as u64);
    }

    #[tokio::test]
    async fn test_rotation_links_segments() {
        let dir = tempdir().unwrap();
        let log = EventLog::open(dir.path(), options(LogKind::Source, 1 << 20)).unwrap();
        log.append(&row(1)).await.unwrap();

        let next = log.rotate().await.unwrap();
        assert_eq!(next, "log.000002");
        assert_eq!(log.segments().await, vec!["log.000001", "log.000002"]);

        // Closed segment no longer carries the in-use flag
        let first = read_first_event(&dir.path().join("log.000001")).unwrap();
        assert!(!first.header.has_flag(flags::IN_USE));
        let second = read_first_event(&dir.path().join("log.000002")).unwrap();
        assert!(second.header.has_flag(flags::IN_USE));
        assert!(matches!(second.event, Event::FormatHandshake { .. }));
    }

    #[tokio::test]
    async fn test_size_threshold_rotates() {
        let dir = tempdir().unwrap();
        let log = EventLog::open(dir.path(), options(LogKind::Source, 200)).unwrap();
        for n in 0..10 {
            log.append(&row(n)).await.unwrap();
        }
        assert!(log.segments().await.len() > 1);
    }

    #[tokio::test]
    async fn test_source_log_starts_fresh_segment_on_reopen() {
        let dir = tempdir().unwrap();
        {
            let log = EventLog::open(dir.path(), options(LogKind::Source, 1 << 20)).unwrap();
            log.append(&row(1)).await.unwrap();
            log.close(true).await.unwrap();
        }
        let log = EventLog::open(dir.path(), options(LogKind::Source, 1 << 20)).unwrap();
        assert_eq!(log.active_file(), "log.000002");
    }

    #[tokio::test]
    async fn test_relay_log_reopens_last_segment() {
        let dir = tempdir().unwrap();
        let end = {
            let log = EventLog::open(dir.path(), options(LogKind::Relay, 1 << 20)).unwrap();
            log.append(&row(1)).await.unwrap()
        };
        let log = EventLog::open(dir.path(), options(LogKind::Relay, 1 << 20)).unwrap();
        assert_eq!(log.end(), end);
    }

    #[tokio::test]
    async fn test_purge_keeps_active_and_later_segments() {
        let dir = tempdir().unwrap();
        let log = EventLog::open(dir.path(), options(LogKind::Relay, 1 << 20)).unwrap();
        log.rotate().await.unwrap();
        log.rotate().await.unwrap();
        let before = log.total_size();

        let purged = log.purge_before("log.000003").await.unwrap();
        assert_eq!(purged, vec!["log.000001", "log.000002"]);
        assert_eq!(log.segments().await, vec!["log.000003"]);
        assert!(log.total_size() < before);
        assert!(!dir.path().join("log.000001").exists());
    }

    #[tokio::test]
    async fn test_truncate_drops_tail_and_later_segments() {
        let dir = tempdir().unwrap();
        let log = EventLog::open(dir.path(), options(LogKind::Relay, 1 << 20)).unwrap();
        let keep = log.append(&row(1)).await.unwrap();
        log.append(&row(2)).await.unwrap();
        log.rotate().await.unwrap();
        log.append(&row(3)).await.unwrap();

        log.truncate_to(&keep).await.unwrap();
        assert_eq!(log.end(), keep);
        assert_eq!(log.segments().await, vec!["log.000001"]);
    }

    #[tokio::test]
    async fn test_reset_starts_over() {
        let dir = tempdir().unwrap();
        let log = EventLog::open(dir.path(), options(LogKind::Relay, 1 << 20)).unwrap();
        log.rotate().await.unwrap();
        log.append(&row(1)).await.unwrap();

        let first = log.reset().await.unwrap();
        assert_eq!(first, "log.000001");
        assert_eq!(log.segments().await, vec!["log.000001"]);
        assert!(!dir.path().join("log.000002").exists());
    }

    #[tokio::test]
    async fn test_reset_interrupted_after_index_removal_reopens_empty() {
        let dir = tempdir().unwrap();
        {
            let log = EventLog::open(dir.path(), options(LogKind::Relay, 1 << 20)).unwrap();
            log.append(&row(1)).await.unwrap();
            log.rotate().await.unwrap();
            log.append(&row(2)).await.unwrap();
        }
        // only the index is gone, both segment files are still on disk
        std::fs::remove_file(LogPaths::new(dir.path(), "log").index_path()).unwrap();

        let log = EventLog::open(dir.path(), options(LogKind::Relay, 1 << 20)).unwrap();
        assert_eq!(log.segments().await, vec!["log.000001"]);
        assert_eq!(log.active_file(), "log.000001");
        let end = log.append(&row(3)).await.unwrap();
        assert_eq!(end.file, "log.000001");
    }
}
