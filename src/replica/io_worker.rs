//! I/O Worker
//!
//! Connects to the primary, asks for the event stream starting at the
//! checkpointed source position and appends what arrives to the relay log.
//! Network failures are retried after `connect_retry`; anything else stops
//! the worker and is recorded as its last error.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use rand::Rng;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::ReplicaContext;
use crate::checkpoint::IoRunState;
use crate::coordinate::Coordinate;
use crate::dump::dump_request;
use crate::error::{Error, Result};
use crate::event::{flags, Event, LogEvent, CURRENT_PROTOCOL_VERSION, SERVER_VERSION};
use crate::network::{self, tls, BoxStream};
use crate::protocol::{
    dump_flags, error_code, read_packet, unexpected, write_packet, Packet, Registration,
};

/// Upper bound for connecting and for each handshake reply
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

/// Per-connection bookkeeping
#[derive(Default)]
struct StreamState {
    /// Primary speaks a pre-v4 protocol
    legacy: bool,
    ignored: BTreeSet<u32>,
    /// Events were skipped since the last append
    elided: bool,
    /// Appends since the last checkpoint
    unsaved: u32,
}

enum StreamEnd {
    /// Non-blocking dump finished
    EndOfStream,
}

pub struct IoWorker {
    ctx: Arc<ReplicaContext>,
    cancel: CancellationToken,
}

impl IoWorker {
    pub fn new(ctx: Arc<ReplicaContext>, cancel: CancellationToken) -> Self {
        Self { ctx, cancel }
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    /// Run until stopped, a fatal error, or the end of a non-blocking dump
    pub async fn run(self) {
        let name = self.ctx.name.clone();
        tracing::info!("[{}] I/O worker starting", name);

        let result = self.run_inner().await;
        if let Err(e) = self.checkpoint().await {
            tracing::warn!("[{}] Final I/O checkpoint failed: {}", name, e);
        }
        let requested = {
            let mut link = self.ctx.source.write().await;
            link.run_state = IoRunState::Stopped;
            link.requested.clone()
        };

        match result {
            Ok(()) => tracing::info!("[{}] I/O worker reached end of stream at {}", name, requested),
            Err(Error::Cancelled) => tracing::info!("[{}] I/O worker stopped at {}", name, requested),
            Err(e) => {
                tracing::error!("[{}] I/O worker failed at {}: {}", name, requested, e);
                self.ctx.record_io_error(&e, requested);
            }
        }
    }

    async fn run_inner(&self) -> Result<()> {
        self.recover().await?;
        let mut attempts = 0u32;

        loop {
            if self.cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            self.ctx.source.write().await.run_state = IoRunState::Connecting;

            let mut state = StreamState::default();
            let result = self.stream(&mut state, &mut attempts).await;
            self.settle(&mut state).await?;

            let err = match result {
                Ok(StreamEnd::EndOfStream) => return Ok(()),
                Err(e) if e.is_retryable() => e,
                Err(e) => return Err(e),
            };

            let link = self.ctx.source.read().await.clone();
            attempts += 1;
            if link.max_retries > 0 && attempts >= link.max_retries {
                return Err(Error::Replication(format!(
                    "gave up on {} after {} attempts: {}",
                    link.address(),
                    attempts,
                    err
                )));
            }
            self.ctx.record_io_error(&err, link.requested.clone());

            let delay = {
                let jitter_ms = (link.connect_retry.as_millis() as u64 / 10).max(1);
                link.connect_retry + Duration::from_millis(rand::thread_rng().gen_range(0..jitter_ms))
            };
            tracing::warn!(
                "[{}] Lost primary {} ({}); retrying in {:?}",
                self.ctx.name,
                link.address(),
                err,
                delay
            );
            tokio::select! {
                _ = self.cancel.cancelled() => return Err(Error::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// Drop relay data written after the last checkpoint
    async fn recover(&self) -> Result<()> {
        let relay = &self.ctx.relay;
        let end = relay.end();
        let mut link = self.ctx.source.write().await;

        let known = !link.relay_coordinate.is_unset()
            && relay.log().contains(&link.relay_coordinate.file).await;
        if !known {
            link.relay_coordinate = end;
        } else if link.relay_coordinate < end {
            tracing::info!(
                "[{}] Truncating relay log from {} to checkpoint {}",
                self.ctx.name,
                end,
                link.relay_coordinate
            );
            relay.truncate_to(&link.relay_coordinate).await?;
        }
        drop(link);
        self.ctx.save_source().await
    }

    /// One connection: handshake, registration, dump and event loop
    async fn stream(&self, state: &mut StreamState, attempts: &mut u32) -> Result<StreamEnd> {
        let link = self.ctx.source.read().await.clone();
        state.ignored = link.ignore_server_ids.clone();

        let connector = if link.tls.enabled {
            Some(tls::client_connector(&link.tls)?)
        } else {
            None
        };
        let mut stream = tokio::select! {
            _ = self.cancel.cancelled() => return Err(Error::Cancelled),
            s = network::connect(&link.host, link.port, HANDSHAKE_TIMEOUT, connector.as_ref()) => s?,
        };
        tracing::debug!("[{}] Connected to {}", self.ctx.name, link.address());

        tokio::select! {
            _ = self.cancel.cancelled() => return Err(Error::Cancelled),
            r = self.handshake(&mut stream, state) => r?,
        }

        let mut flags = 0;
        if self.ctx.io_settings.non_blocking {
            flags |= dump_flags::NON_BLOCKING;
        }
        let request = dump_request(
            self.ctx.server_id,
            &link.requested.file,
            link.requested.offset.max(crate::coordinate::SEGMENT_HEADER_SIZE),
            flags,
        );
        write_packet(&mut stream, &Packet::Dump(request)).await?;

        self.ctx.source.write().await.run_state = IoRunState::Connected;
        *attempts = 0;
        tracing::info!(
            "[{}] Streaming from {} at {}",
            self.ctx.name,
            link.address(),
            if link.requested.is_unset() { "the first log".to_string() } else { link.requested.to_string() }
        );

        let net_timeout = self.ctx.io_settings.net_timeout;
        loop {
            let packet = tokio::select! {
                _ = self.cancel.cancelled() => return Err(Error::Cancelled),
                p = read_with_timeout(&mut stream, net_timeout) => p?,
            };
            match packet {
                Packet::Event(frame) => self.handle_frame(frame, state).await?,
                Packet::EndOfStream => return Ok(StreamEnd::EndOfStream),
                Packet::Error { code, message }
                    if code == error_code::SHUTTING_DOWN || code == error_code::SUPERSEDED =>
                {
                    return Err(Error::Network(format!("primary ended the dump: {}", message)))
                }
                other => return Err(unexpected(other, "Event")),
            }
        }
    }

    async fn handshake(&self, stream: &mut BoxStream, state: &mut StreamState) -> Result<()> {
        let link = self.ctx.source.read().await.clone();

        write_packet(
            stream,
            &Packet::Hello {
                protocol_version: CURRENT_PROTOCOL_VERSION,
                client_version: SERVER_VERSION.to_string(),
            },
        )
        .await?;
        match read_with_timeout(stream, Some(HANDSHAKE_TIMEOUT)).await? {
            Packet::Greeting {
                protocol_version,
                server_version,
            } => {
                state.legacy = protocol_version < CURRENT_PROTOCOL_VERSION;
                tracing::debug!(
                    "[{}] Primary runs {} (protocol {}{})",
                    self.ctx.name,
                    server_version,
                    protocol_version,
                    if state.legacy { ", legacy" } else { "" }
                );
            }
            other => return Err(unexpected(other, "Greeting")),
        }

        write_packet(stream, &Packet::IdentityQuery).await?;
        match read_with_timeout(stream, Some(HANDSHAKE_TIMEOUT)).await? {
            Packet::Identity {
                unix_timestamp,
                server_id,
            } => {
                let skew = chrono::Utc::now().timestamp() - unix_timestamp as i64;
                *self.ctx.clock_skew.lock() = Some(skew);
                if server_id == self.ctx.server_id && !self.ctx.replicate_same_server_id {
                    return Err(Error::ServerIdConflict(format!(
                        "primary {} has the same server id {} as this replica",
                        link.address(),
                        server_id
                    )));
                }
            }
            other => return Err(unexpected(other, "Identity")),
        }

        if let Some(period) = link.heartbeat_period() {
            let period_ns = u64::try_from(period.as_nanos()).unwrap_or(u64::MAX);
            write_packet(stream, &Packet::SetHeartbeat { period_ns }).await?;
            expect_ok(stream, "SetHeartbeat").await?;
        }

        let registration = Registration {
            server_id: self.ctx.server_id,
            report_host: self.ctx.name.clone(),
            report_user: link.user.clone(),
            report_password: link.password.clone(),
            report_port: 0,
            master_id_hint: 0,
        };
        write_packet(stream, &Packet::Register(registration)).await?;
        expect_ok(stream, "Register").await
    }

    /// Account for one received frame and append it when it belongs in the relay
    async fn handle_frame(&self, frame: Bytes, state: &mut StreamState) -> Result<()> {
        let received_len = frame.len() as u64;
        let mut event = LogEvent::decode(&frame).map_err(|reason| {
            let at = self.requested_now();
            Error::MalformedEvent {
                file: at.file,
                offset: at.offset,
                reason,
            }
        })?;

        let frame = if state.legacy {
            if let Event::FormatHandshake {
                protocol_version, ..
            } = &mut event.event
            {
                *protocol_version = CURRENT_PROTOCOL_VERSION;
            }
            event.header.flags &= flags::LEGACY_MASK;
            event.encode()
        } else {
            frame
        };

        match &event.event {
            Event::Heartbeat { file, offset } => {
                tracing::trace!("[{}] Heartbeat from primary at {}:{}", self.ctx.name, file, offset);
                if state.elided || state.unsaved > 0 {
                    self.settle(state).await?;
                }
            }
            Event::Rotate {
                new_file,
                new_offset,
            } => {
                let at = Coordinate::new(new_file.clone(), *new_offset);
                self.append(&frame, state).await?;
                self.ctx.source.write().await.requested = at;
                if !event.is_synthetic() {
                    self.ctx.relay.rotate().await?;
                }
                self.settle(state).await?;
            }
            Event::FormatHandshake { .. } => {
                self.append(&frame, state).await?;
                if event.header.end_log_pos != 0 {
                    self.ctx.source.write().await.requested.offset += received_len;
                }
                self.settle(state).await?;
            }
            Event::StreamEnd => {
                tracing::debug!("[{}] Ignoring forwarded StreamEnd", self.ctx.name);
            }
            Event::Data(_) => {
                let origin = event.header.server_id;
                if self.ctx.is_self_origin(origin) || state.ignored.contains(&origin) {
                    self.ctx.source.write().await.requested.offset += received_len;
                    state.elided = true;
                    return Ok(());
                }
                self.ctx.relay.wait_for_space(&self.cancel).await?;
                self.append(&frame, state).await?;
                self.ctx.source.write().await.requested.offset += received_len;
                if state.unsaved >= self.ctx.io_settings.checkpoint_every {
                    self.checkpoint().await?;
                    state.unsaved = 0;
                }
            }
        }
        Ok(())
    }

    async fn append(&self, frame: &[u8], state: &mut StreamState) -> Result<()> {
        self.ctx.relay.append_frame(frame).await?;
        state.elided = false;
        state.unsaved += 1;
        Ok(())
    }

    /// Record skipped events with a rotate to the current position, then
    /// checkpoint
    async fn settle(&self, state: &mut StreamState) -> Result<()> {
        if state.elided {
            let at = self.ctx.source.read().await.requested.clone();
            let rotate = LogEvent::synthetic(Event::Rotate {
                new_file: at.file.clone(),
                new_offset: at.offset,
            });
            self.ctx.relay.append(&rotate).await?;
            state.elided = false;
            tracing::debug!("[{}] Skipped events up to {}", self.ctx.name, at);
        }
        self.checkpoint().await?;
        state.unsaved = 0;
        Ok(())
    }

    /// Make the relay durable and record the matching source position
    async fn checkpoint(&self) -> Result<()> {
        self.ctx.relay.sync().await?;
        self.ctx.source.write().await.relay_coordinate = self.ctx.relay.end();
        self.ctx.save_source().await
    }

    fn requested_now(&self) -> Coordinate {
        self.ctx
            .source
            .try_read()
            .map(|link| link.requested.clone())
            .unwrap_or_default()
    }
}

async fn read_with_timeout(stream: &mut BoxStream, limit: Option<Duration>) -> Result<Packet> {
    match limit {
        None => read_packet(stream).await,
        Some(limit) => tokio::time::timeout(limit, read_packet(stream))
            .await
            .map_err(|_| Error::Network(format!("nothing received from primary for {:?}", limit)))?,
    }
}

async fn expect_ok(stream: &mut BoxStream, after: &str) -> Result<()> {
    match read_with_timeout(stream, Some(HANDSHAKE_TIMEOUT)).await? {
        Packet::Ok => Ok(()),
        other => Err(unexpected(other, &format!("Ok after {}", after))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binlog::{EventLog, LogKind, LogOptions};
    use crate::dump::DumpServer;
    use crate::event::{DataEvent, GroupBoundary};
    use crate::replica::testing;
    use std::net::SocketAddr;
    use tempfile::tempdir;
    use tokio::net::TcpListener;

    async fn primary(dir: &std::path::Path) -> (Arc<DumpServer>, SocketAddr) {
        let log = Arc::new(
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
        );
        let server = Arc::new(DumpServer::new(1, log, None));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(Arc::clone(&server).serve(listener));
        (server, addr)
    }

    fn row(origin: u32, n: u32) -> LogEvent {
        LogEvent::new(
            Event::Data(DataEvent {
                boundary: GroupBoundary::standalone(),
                schema: "app".into(),
                table: Some("t".into()),
                payload: Bytes::from(format!("INSERT INTO t VALUES ({})", n)),
            }),
            origin,
            0,
        )
    }

    fn replica(dir: &std::path::Path, addr: SocketAddr, server_id: u32) -> Arc<ReplicaContext> {
        let mut ctx = testing::context(dir, server_id);
        ctx.io_settings.non_blocking = true;
        let link = ctx.source.get_mut();
        link.host = addr.ip().to_string();
        link.port = addr.port();
        link.connect_retry = Duration::from_millis(20);
        Arc::new(ctx)
    }

    async fn run_once(ctx: &Arc<ReplicaContext>) {
        let worker = IoWorker::new(Arc::clone(ctx), CancellationToken::new());
        tokio::time::timeout(Duration::from_secs(10), worker.run())
            .await
            .unwrap();
    }

    fn data_payloads(events: &[LogEvent]) -> Vec<Bytes> {
        events
            .iter()
            .filter_map(|e| match &e.event {
                Event::Data(d) => Some(d.payload.clone()),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn test_copies_primary_log_into_relay() {
        let pdir = tempdir().unwrap();
        let rdir = tempdir().unwrap();
        let (server, addr) = primary(pdir.path()).await;
        for n in 0..3 {
            server.log().append(&row(1, n)).await.unwrap();
        }

        let ctx = replica(rdir.path(), addr, 2);
        run_once(&ctx).await;
        assert!(ctx.io_error.lock().is_none());

        let link = ctx.source.read().await.clone();
        assert_eq!(link.requested, server.log().end());
        assert_eq!(link.relay_coordinate, ctx.relay.end());
        assert_eq!(link.run_state, IoRunState::Stopped);

        let saved = crate::checkpoint::SourceLink::load(&ctx.paths.source_link())
            .unwrap()
            .unwrap();
        assert_eq!(saved.requested, link.requested);

        let events = testing::relay_events(&ctx).await;
        assert_eq!(data_payloads(&events).len(), 3);
    }

    #[tokio::test]
    async fn test_resume_requests_exactly_the_checkpoint() {
        let pdir = tempdir().unwrap();
        let rdir = tempdir().unwrap();
        let (server, addr) = primary(pdir.path()).await;
        for n in 0..3 {
            server.log().append(&row(1, n)).await.unwrap();
        }
        let ctx = replica(rdir.path(), addr, 2);
        run_once(&ctx).await;
        let checkpoint = ctx.source.read().await.requested.clone();

        // Bytes appended after the checkpoint are discarded on restart
        ctx.relay.append(&row(1, 99)).await.unwrap();
        for n in 3..5 {
            server.log().append(&row(1, n)).await.unwrap();
        }
        run_once(&ctx).await;

        let events = testing::relay_events(&ctx).await;
        let expected: Vec<Bytes> = (0..5)
            .map(|n| Bytes::from(format!("INSERT INTO t VALUES ({})", n)))
            .collect();
        assert_eq!(data_payloads(&events), expected);

        // The second dump started from the synthetic rotate to the checkpoint
        assert!(events.iter().any(|e| e.is_synthetic()
            && e.event
                == Event::Rotate {
                    new_file: checkpoint.file.clone(),
                    new_offset: checkpoint.offset
                }));
        assert_eq!(ctx.source.read().await.requested, server.log().end());
    }

    #[tokio::test]
    async fn test_own_events_are_skipped_but_accounted() {
        let pdir = tempdir().unwrap();
        let rdir = tempdir().unwrap();
        let (server, addr) = primary(pdir.path()).await;
        server.log().append(&row(1, 0)).await.unwrap();
        server.log().append(&row(2, 1)).await.unwrap();
        server.log().append(&row(2, 2)).await.unwrap();

        let ctx = replica(rdir.path(), addr, 2);
        run_once(&ctx).await;

        let end = server.log().end();
        assert_eq!(ctx.source.read().await.requested, end);

        let events = testing::relay_events(&ctx).await;
        assert_eq!(data_payloads(&events).len(), 1);
        let last = events.last().unwrap();
        assert!(last.is_synthetic());
        assert_eq!(
            last.event,
            Event::Rotate { new_file: end.file.clone(), new_offset: end.offset }
        );
    }

    #[tokio::test]
    async fn test_same_server_id_as_primary_is_fatal() {
        let pdir = tempdir().unwrap();
        let rdir = tempdir().unwrap();
        let (_server, addr) = primary(pdir.path()).await;

        let ctx = replica(rdir.path(), addr, 1);
        run_once(&ctx).await;
        let err = ctx.io_error.lock().clone().unwrap();
        assert_eq!(err.kind, crate::error::ErrorKind::Protocol);
        assert!(err.message.contains("same server id"));
    }

    #[tokio::test]
    async fn test_gives_up_after_max_retries() {
        let rdir = tempdir().unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let mut ctx = testing::context(rdir.path(), 2);
        {
            let link = ctx.source.get_mut();
            link.host = addr.ip().to_string();
            link.port = addr.port();
            link.connect_retry = Duration::from_millis(10);
            link.max_retries = 3;
        }
        let ctx = Arc::new(ctx);
        run_once(&ctx).await;

        let err = ctx.io_error.lock().clone().unwrap();
        assert!(err.message.contains("after 3 attempts"));
    }

    #[tokio::test]
    async fn test_stop_while_waiting_for_events() {
        let pdir = tempdir().unwrap();
        let rdir = tempdir().unwrap();
        let (server, addr) = primary(pdir.path()).await;
        server.log().append(&row(1, 0)).await.unwrap();

        let mut ctx = testing::context(rdir.path(), 2);
        {
            let link = ctx.source.get_mut();
            link.host = addr.ip().to_string();
            link.port = addr.port();
        }
        let ctx = Arc::new(ctx);
        let cancel = CancellationToken::new();
        let handle = IoWorker::new(Arc::clone(&ctx), cancel.clone()).spawn();

        let end = server.log().end();
        for _ in 0..100 {
            if ctx.source.read().await.requested == end {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(ctx.source.read().await.run_state, IoRunState::Connected);

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
        let link = ctx.source.read().await.clone();
        assert_eq!(link.requested, end);
        assert_eq!(link.run_state, IoRunState::Stopped);
        assert!(ctx.io_error.lock().is_none());
    }

    /// Serve one connection the way a pre-v4 primary does, then end the dump
    async fn legacy_primary(listener: TcpListener, frames: Vec<Bytes>) {
        let (mut sock, _) = listener.accept().await.unwrap();
        assert!(matches!(read_packet(&mut sock).await.unwrap(), Packet::Hello { .. }));
        let greeting = Packet::Greeting {
            protocol_version: 3,
            server_version: "legacy-3.23".into(),
        };
        write_packet(&mut sock, &greeting).await.unwrap();

        assert!(matches!(read_packet(&mut sock).await.unwrap(), Packet::IdentityQuery));
        let identity = Packet::Identity {
            unix_timestamp: chrono::Utc::now().timestamp() as u64,
            server_id: 1,
        };
        write_packet(&mut sock, &identity).await.unwrap();

        assert!(matches!(read_packet(&mut sock).await.unwrap(), Packet::Register(_)));
        write_packet(&mut sock, &Packet::Ok).await.unwrap();
        assert!(matches!(read_packet(&mut sock).await.unwrap(), Packet::Dump(_)));
        for frame in frames {
            write_packet(&mut sock, &Packet::Event(frame)).await.unwrap();
        }
        write_packet(&mut sock, &Packet::EndOfStream).await.unwrap();
    }

    #[tokio::test]
    async fn test_legacy_primary_events_are_rewritten_for_the_relay() {
        let rdir = tempdir().unwrap();
        // 0x0008 and 0x0004 are flags a legacy primary sets with another meaning
        let mut handshake = LogEvent::new(
            Event::FormatHandshake {
                protocol_version: 3,
                peer_version: "legacy-3.23".into(),
            },
            1,
            0,
        )
        .with_flags(flags::IN_USE | 0x0008);
        handshake.header.end_log_pos = 4 + handshake.encoded_len() as u32;
        let mut data = row(1, 7).with_flags(0x0004);
        data.header.end_log_pos = handshake.header.end_log_pos + data.encoded_len() as u32;
        let rotate = LogEvent::synthetic(Event::Rotate {
            new_file: "log.000001".into(),
            new_offset: 4,
        });
        let frames = vec![rotate.encode(), handshake.encode(), data.encode()];
        assert_eq!(frames[1][4], crate::event::event_type::START_EVENT_V3);

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let served = tokio::spawn(legacy_primary(listener, frames));

        let ctx = replica(rdir.path(), addr, 2);
        run_once(&ctx).await;
        served.await.unwrap();
        assert!(ctx.io_error.lock().is_none());

        let events = testing::relay_events(&ctx).await;
        let relayed = events
            .iter()
            .find(|e| {
                e.header.server_id == 1 && matches!(e.event, Event::FormatHandshake { .. })
            })
            .unwrap();
        assert!(matches!(
            relayed.event,
            Event::FormatHandshake {
                protocol_version: CURRENT_PROTOCOL_VERSION,
                ..
            }
        ));
        assert_eq!(
            relayed.header.event_type,
            crate::event::event_type::FORMAT_DESCRIPTION_EVENT
        );
        assert_eq!(relayed.header.flags, flags::IN_USE);
        assert_eq!(relayed.header.end_log_pos, handshake.header.end_log_pos);

        let relayed_row = events
            .iter()
            .find(|e| matches!(e.event, Event::Data(_)))
            .unwrap();
        assert_eq!(relayed_row.header.flags, 0);
        assert_eq!(data_payloads(&events), vec![Bytes::from("INSERT INTO t VALUES (7)")]);

        assert_eq!(
            ctx.source.read().await.requested,
            Coordinate::new("log.000001", data.header.end_log_pos as u64)
        );
    }
}
