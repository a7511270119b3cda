//! Dump Session
//!
//! Streams the primary's event log to one replica, starting at the
//! requested coordinate and following the log as it grows.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::sync::CancellationToken;

use crate::binlog::{read_first_event, EventLog, LogReader, ReadOutcome};
use crate::coordinate::{Coordinate, SEGMENT_HEADER_SIZE};
use crate::error::{Error, Result};
use crate::event::{self, flags, Event, LogEvent};
use crate::protocol::{write_packet, DumpRequest, Packet};

/// How a session ended without error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    /// Non-blocking dump reached the end of the log
    EndOfStream,
    /// Cancelled by shutdown or a newer session with the same server id
    Cancelled,
}

/// Parameters of one dump
pub struct DumpParams {
    pub request: DumpRequest,
    /// `None` disables heartbeats
    pub heartbeat: Option<Duration>,
}

/// Resolve the requested start into a concrete coordinate
pub async fn resolve_start(log: &EventLog, request: &DumpRequest) -> Result<Coordinate> {
    let file = if request.log_name.is_empty() {
        log.first_coordinate().await.file
    } else {
        request.log_name.clone()
    };
    let at = Coordinate::new(file, request.start_offset as u64);

    let no_such = || Error::NoSuchPosition {
        file: at.file.clone(),
        offset: at.offset,
    };
    let len = log.segment_len(&at.file).await?.ok_or_else(no_such)?;
    if at.offset < SEGMENT_HEADER_SIZE || at.offset > len {
        return Err(no_such());
    }
    Ok(at)
}

/// Stream events from `start` until the replica goes away, the session is
/// cancelled, or a non-blocking dump reaches the end of the log
pub async fn stream_events<W: AsyncWrite + Unpin>(
    writer: &mut W,
    log: Arc<EventLog>,
    start: Coordinate,
    params: &DumpParams,
    cancel: &CancellationToken,
) -> Result<SessionEnd> {
    send(writer, &LogEvent::synthetic(rotate_to(&start)).encode()).await?;

    let handshake_path = log.paths().segment_path(&start.file);
    let handshake = read_first_event(&handshake_path)?;
    let mut read_from = start.clone();
    if matches!(handshake.event, Event::FormatHandshake { .. }) {
        let mut probe = handshake.clone();
        probe.header.flags &= !flags::IN_USE;
        if start.offset == SEGMENT_HEADER_SIZE {
            // Sent in place of the stored copy; positions stay meaningful
            read_from = start.with_offset(SEGMENT_HEADER_SIZE + probe.encoded_len() as u64);
        } else {
            probe.header.end_log_pos = 0;
        }
        send(writer, &probe.encode()).await?;
    }

    let mut reader = LogReader::open(Arc::clone(&log), &read_from).await?;
    let mut last_file = start.file.clone();
    let mut last_offset = start.offset;

    loop {
        let outcome = tokio::select! {
            _ = cancel.cancelled() => return Ok(SessionEnd::Cancelled),
            outcome = reader.next() => outcome?,
        };

        match outcome {
            ReadOutcome::Event(ev) => {
                last_file = ev.end.file.clone();
                last_offset = ev.end.offset;
                match &ev.event.event {
                    Event::StreamEnd => continue,
                    Event::FormatHandshake { .. } if ev.event.header.has_flag(flags::IN_USE) => {
                        send(writer, &event::clear_flags(&ev.frame, flags::IN_USE)).await?;
                    }
                    _ => send(writer, &ev.frame).await?,
                }
                tracing::trace!("Sent {} ending at {}", ev.event.event.name(), ev.end);
            }
            ReadOutcome::EndOfSegment => {
                if reader.advance().await? {
                    let next = reader.position();
                    send(writer, &LogEvent::synthetic(rotate_to(&next)).encode()).await?;
                    last_file = next.file;
                    last_offset = next.offset;
                } else {
                    // Closed segment with nothing after it yet
                    wait_or_heartbeat(writer, &mut reader, params, cancel, &last_file, last_offset)
                        .await?;
                }
            }
            ReadOutcome::EndOfLog => {
                if params.request.non_blocking() {
                    write_packet(writer, &Packet::EndOfStream).await?;
                    return Ok(SessionEnd::EndOfStream);
                }
                if !wait_or_heartbeat(writer, &mut reader, params, cancel, &last_file, last_offset)
                    .await?
                {
                    return Ok(SessionEnd::Cancelled);
                }
            }
        }
    }
}

/// Block until new data, emitting a heartbeat on every idle period
///
/// Returns false when cancelled.
async fn wait_or_heartbeat<W: AsyncWrite + Unpin>(
    writer: &mut W,
    reader: &mut LogReader,
    params: &DumpParams,
    cancel: &CancellationToken,
    file: &str,
    offset: u64,
) -> Result<bool> {
    match params.heartbeat {
        Some(period) => {
            tokio::select! {
                _ = cancel.cancelled() => Ok(false),
                changed = reader.wait_for_data() => changed.map(|_| true),
                _ = tokio::time::sleep(period) => {
                    let beat = LogEvent::synthetic(Event::Heartbeat {
                        file: file.to_string(),
                        offset,
                    });
                    send(writer, &beat.encode()).await?;
                    tracing::trace!("Heartbeat at {}:{}", file, offset);
                    Ok(true)
                }
            }
        }
        None => {
            tokio::select! {
                _ = cancel.cancelled() => Ok(false),
                changed = reader.wait_for_data() => changed.map(|_| true),
            }
        }
    }
}

fn rotate_to(at: &Coordinate) -> Event {
    Event::Rotate {
        new_file: at.file.clone(),
        new_offset: at.offset,
    }
}

async fn send<W: AsyncWrite + Unpin>(writer: &mut W, frame: &[u8]) -> Result<()> {
    write_packet(writer, &Packet::Event(bytes::Bytes::copy_from_slice(frame))).await
}

/// Drain and discard anything the replica sends during the dump
///
/// Returns when the replica closes its side.
pub async fn drain<R: AsyncRead + Unpin>(reader: &mut R) {
    let mut sink = tokio::io::sink();
    let _ = tokio::io::copy(reader, &mut sink).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binlog::{LogKind, LogOptions};
    use crate::event::{DataEvent, GroupBoundary};
    use crate::protocol::read_packet;
    use bytes::Bytes;
    use tempfile::tempdir;

    fn source_log(dir: &std::path::Path) -> Arc<EventLog> {
        Arc::new(
            EventLog::open(
                dir,
                LogOptions {
                    basename: "log".into(),
                    max_segment_size: 1 << 20,
                    fsync: false,
                    server_id: 1,
                    kind: LogKind::Source,
                },
            )
            .unwrap(),
        )
    }

    fn request(file: &str, offset: u32, flags: u16) -> DumpRequest {
        DumpRequest {
            start_offset: offset,
            flags,
            server_id: 2,
            log_name: file.into(),
        }
    }

    fn row() -> LogEvent {
        LogEvent::new(
            Event::Data(DataEvent {
                boundary: GroupBoundary::standalone(),
                schema: "app".into(),
                table: None,
                payload: Bytes::from_static(b"INSERT INTO t VALUES (1)"),
            }),
            1,
            0,
        )
    }

    async fn next_event<R: AsyncRead + Unpin>(r: &mut R) -> LogEvent {
        match read_packet(r).await.unwrap() {
            Packet::Event(frame) => LogEvent::decode(&frame).unwrap(),
            other => panic!("expected event, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_idle_dump_sends_heartbeats_at_start_position() {
        let dir = tempdir().unwrap();
        let log = source_log(dir.path());
        let (mut server, mut client) = tokio::io::duplex(1 << 16);
        let cancel = CancellationToken::new();

        let params = DumpParams {
            request: request("log.000001", 4, 0),
            heartbeat: Some(Duration::from_millis(100)),
        };
        let start = resolve_start(&log, &params.request).await.unwrap();
        let session = {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                stream_events(&mut server, log, start, &params, &cancel).await
            })
        };

        let rotate = next_event(&mut client).await;
        assert!(rotate.is_synthetic());
        assert_eq!(
            rotate.event,
            Event::Rotate { new_file: "log.000001".into(), new_offset: 4 }
        );
        let handshake = next_event(&mut client).await;
        assert!(matches!(handshake.event, Event::FormatHandshake { .. }));
        assert!(!handshake.header.has_flag(flags::IN_USE));
        assert!(handshake.header.end_log_pos > 4);

        for _ in 0..2 {
            let beat = tokio::time::timeout(Duration::from_secs(1), next_event(&mut client))
                .await
                .unwrap();
            assert_eq!(
                beat.event,
                Event::Heartbeat { file: "log.000001".into(), offset: 4 }
            );
        }

        cancel.cancel();
        assert_eq!(session.await.unwrap().unwrap(), SessionEnd::Cancelled);
    }

    #[tokio::test]
    async fn test_resume_sends_neutralised_handshake_then_events() {
        let dir = tempdir().unwrap();
        let log = source_log(dir.path());
        let first = log.append(&row()).await.unwrap();
        log.append(&row()).await.unwrap();

        let (mut server, mut client) = tokio::io::duplex(1 << 16);
        let params = DumpParams {
            request: request("log.000001", first.offset as u32, crate::protocol::dump_flags::NON_BLOCKING),
            heartbeat: None,
        };
        let start = resolve_start(&log, &params.request).await.unwrap();
        let cancel = CancellationToken::new();
        let end = stream_events(&mut server, log, start, &params, &cancel)
            .await
            .unwrap();
        assert_eq!(end, SessionEnd::EndOfStream);

        let rotate = next_event(&mut client).await;
        assert!(matches!(rotate.event, Event::Rotate { new_offset, .. } if new_offset == first.offset));
        let handshake = next_event(&mut client).await;
        assert_eq!(handshake.header.end_log_pos, 0);
        assert!(!handshake.header.has_flag(flags::IN_USE));

        let data = next_event(&mut client).await;
        assert!(matches!(data.event, Event::Data(_)));
        assert_eq!(read_packet(&mut client).await.unwrap(), Packet::EndOfStream);
    }

    #[tokio::test]
    async fn test_stream_end_is_not_forwarded() {
        let dir = tempdir().unwrap();
        let log = source_log(dir.path());
        log.append(&row()).await.unwrap();
        log.close(true).await.unwrap();
        drop(log);

        // Reopening starts log.000002; the dump crosses the closed segment
        let log = source_log(dir.path());
        let (mut server, mut client) = tokio::io::duplex(1 << 16);
        let params = DumpParams {
            request: request("", 4, crate::protocol::dump_flags::NON_BLOCKING),
            heartbeat: None,
        };
        let start = resolve_start(&log, &params.request).await.unwrap();
        assert_eq!(start.file, "log.000001");
        let cancel = CancellationToken::new();
        stream_events(&mut server, log, start, &params, &cancel)
            .await
            .unwrap();
        drop(server);

        let mut names = Vec::new();
        while let Ok(Packet::Event(frame)) = read_packet(&mut client).await {
            names.push(LogEvent::decode(&frame).unwrap().event.name());
        }
        assert_eq!(
            names,
            vec!["Rotate", "FormatHandshake", "Data", "Rotate", "FormatHandshake"]
        );
    }

    #[tokio::test]
    async fn test_unknown_start_is_rejected() {
        let dir = tempdir().unwrap();
        let log = source_log(dir.path());
        for req in [request("log.000009", 4, 0), request("log.000001", 2, 0), request("log.000001", 1 << 30, 0)] {
            assert!(matches!(
                resolve_start(&log, &req).await,
                Err(Error::NoSuchPosition { .. })
            ));
        }
    }
}
