//! Dump Service
//!
//! Primary-side listener. Each replica connection runs the handshake and
//! registration exchange, then a dump session streaming the event log.
//! Sessions are tracked by replica server id; a replica that reconnects
//! with the same id replaces its older session.

mod session;

pub use session::{resolve_start, stream_events, DumpParams, SessionEnd};

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;

use crate::binlog::EventLog;
use crate::error::{Error, Result};
use crate::event::{CURRENT_PROTOCOL_VERSION, SERVER_VERSION};
use crate::network::{self, BoxStream};
use crate::protocol::{error_code, read_packet, write_packet, DumpRequest, Packet, Registration};

/// Registry entry for a running session
struct SessionEntry {
    generation: u64,
    cancel: CancellationToken,
    info: SessionInfo,
}

/// Replica session as reported by status queries
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub server_id: u32,
    pub peer: String,
    pub report_host: String,
    pub report_port: u16,
    pub start_file: String,
    pub start_offset: u32,
    pub connected_at: DateTime<Utc>,
}

/// Primary-side dump listener
pub struct DumpServer {
    server_id: u32,
    log: Arc<EventLog>,
    tls: Option<TlsAcceptor>,
    sessions: Mutex<HashMap<u32, SessionEntry>>,
    generation: AtomicU64,
    shutdown: CancellationToken,
}

impl DumpServer {
    pub fn new(server_id: u32, log: Arc<EventLog>, tls: Option<TlsAcceptor>) -> Self {
        Self {
            server_id,
            log,
            tls,
            sessions: Mutex::new(HashMap::new()),
            generation: AtomicU64::new(0),
            shutdown: CancellationToken::new(),
        }
    }

    /// Accept connections until [`DumpServer::shutdown`] is called
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        let local = listener.local_addr()?;
        tracing::info!("Dump service listening on {}", local);

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((socket, addr)) => {
                            let server = Arc::clone(&self);
                            tokio::spawn(async move {
                                if let Err(e) = server.handle_connection(socket, addr).await {
                                    tracing::warn!("Dump connection from {} ended: {}", addr, e);
                                }
                            });
                        }
                        Err(e) => {
                            tracing::error!("Accept error: {}", e);
                        }
                    }
                }
                _ = self.shutdown.cancelled() => break,
            }
        }

        tracing::info!("Dump service stopped");
        Ok(())
    }

    /// Stop accepting and cancel every session
    pub fn shutdown(&self) {
        self.shutdown.cancel();
        for (_, entry) in self.sessions.lock().drain() {
            entry.cancel.cancel();
        }
    }

    /// Currently connected replicas
    pub fn sessions(&self) -> Vec<SessionInfo> {
        let mut list: Vec<SessionInfo> = self
            .sessions
            .lock()
            .values()
            .map(|e| e.info.clone())
            .collect();
        list.sort_by_key(|s| s.server_id);
        list
    }

    pub fn log(&self) -> &Arc<EventLog> {
        &self.log
    }

    async fn handle_connection(&self, socket: TcpStream, addr: SocketAddr) -> Result<()> {
        let mut stream = network::accept(socket, self.tls.as_ref()).await?;
        let peer = addr.to_string();

        match read_packet(&mut stream).await? {
            Packet::Hello {
                protocol_version,
                client_version,
            } => {
                tracing::debug!(
                    "Replica {} speaks protocol {} ({})",
                    peer,
                    protocol_version,
                    client_version
                );
            }
            other => {
                return self
                    .refuse(&mut stream, error_code::PROTOCOL, format!("expected Hello, got {}", other.type_name()))
                    .await
            }
        }
        write_packet(
            &mut stream,
            &Packet::Greeting {
                protocol_version: CURRENT_PROTOCOL_VERSION,
                server_version: SERVER_VERSION.to_string(),
            },
        )
        .await?;

        let mut heartbeat = None;
        let mut registration = Registration::default();
        let request = loop {
            match read_packet(&mut stream).await? {
                Packet::IdentityQuery => {
                    let now = Utc::now().timestamp().max(0) as u64;
                    write_packet(
                        &mut stream,
                        &Packet::Identity {
                            unix_timestamp: now,
                            server_id: self.server_id,
                        },
                    )
                    .await?;
                }
                Packet::SetHeartbeat { period_ns } => {
                    heartbeat = (period_ns > 0).then(|| Duration::from_nanos(period_ns));
                    write_packet(&mut stream, &Packet::Ok).await?;
                }
                Packet::Register(reg) => {
                    if let Err(reason) = self.check_server_id(reg.server_id) {
                        return self.refuse(&mut stream, error_code::BAD_SERVER_ID, reason).await;
                    }
                    registration = reg;
                    write_packet(&mut stream, &Packet::Ok).await?;
                }
                Packet::Dump(request) => break request,
                other => {
                    let reason = format!("unexpected {} before dump request", other.type_name());
                    return self.refuse(&mut stream, error_code::PROTOCOL, reason).await;
                }
            }
        };

        if let Err(reason) = self.check_server_id(request.server_id) {
            return self.refuse(&mut stream, error_code::BAD_SERVER_ID, reason).await;
        }
        let start = match resolve_start(&self.log, &request).await {
            Ok(start) => start,
            Err(e) => {
                return self
                    .refuse(&mut stream, error_code::NO_SUCH_POSITION, e.to_string())
                    .await
            }
        };

        let info = SessionInfo {
            server_id: request.server_id,
            peer: peer.clone(),
            report_host: registration.report_host,
            report_port: registration.report_port,
            start_file: start.file.clone(),
            start_offset: request.start_offset,
            connected_at: Utc::now(),
        };
        let (generation, cancel) = self.register(info);
        tracing::info!("Replica {} (server id {}) dumping from {}", peer, request.server_id, start);

        let params = DumpParams { request, heartbeat };
        let result = self.run_session(stream, start, &params, &cancel).await;
        self.unregister(params.request.server_id, generation);

        match result {
            Ok(end) => {
                tracing::info!("Dump for server id {} finished: {:?}", params.request.server_id, end);
                Ok(())
            }
            Err(e) => {
                tracing::info!("Replica {} disconnected: {}", peer, e);
                Ok(())
            }
        }
    }

    async fn run_session(
        &self,
        stream: BoxStream,
        start: crate::coordinate::Coordinate,
        params: &DumpParams,
        cancel: &CancellationToken,
    ) -> Result<SessionEnd> {
        let (mut reader, mut writer) = tokio::io::split(stream);
        let session_cancel = cancel.child_token();
        let watch_peer = {
            let token = session_cancel.clone();
            async move {
                session::drain(&mut reader).await;
                token.cancel();
            }
        };
        let stream = stream_events(&mut writer, Arc::clone(&self.log), start, params, &session_cancel);

        tokio::pin!(watch_peer);
        tokio::select! {
            result = stream => result,
            _ = &mut watch_peer => Err(Error::Network("replica closed the connection".into())),
        }
    }

    /// Record a new session, cancelling any older one with the same id
    fn register(&self, info: SessionInfo) -> (u64, CancellationToken) {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let cancel = self.shutdown.child_token();
        let server_id = info.server_id;
        let previous = self.sessions.lock().insert(
            server_id,
            SessionEntry {
                generation,
                cancel: cancel.clone(),
                info,
            },
        );
        if let Some(old) = previous {
            tracing::warn!(
                "Server id {} reconnected from {}; ending its previous session",
                server_id,
                old.info.peer
            );
            old.cancel.cancel();
        }
        (generation, cancel)
    }

    fn unregister(&self, server_id: u32, generation: u64) {
        let mut sessions = self.sessions.lock();
        if sessions.get(&server_id).map(|e| e.generation) == Some(generation) {
            sessions.remove(&server_id);
        }
    }

    fn check_server_id(&self, server_id: u32) -> std::result::Result<(), String> {
        if server_id == 0 {
            return Err("replica server id is not set".into());
        }
        if server_id == self.server_id {
            return Err(format!(
                "replica server id {} equals the primary's own id",
                server_id
            ));
        }
        Ok(())
    }

    async fn refuse(&self, stream: &mut BoxStream, code: u16, reason: String) -> Result<()> {
        tracing::warn!("Refusing dump request: {}", reason);
        write_packet(stream, &Packet::error(code, reason.clone())).await?;
        Err(Error::Protocol(reason))
    }
}

/// Build a dump request for `file:offset`
pub fn dump_request(server_id: u32, file: &str, offset: u64, flags: u16) -> DumpRequest {
    DumpRequest {
        start_offset: u32::try_from(offset).unwrap_or(u32::MAX),
        flags,
        server_id,
        log_name: file.to_string(),
    }
}
