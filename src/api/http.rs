//! HTTP API Server
//!
//! Admin surface for replication links and the primary's source log.

use std::sync::Arc;
use std::time::Instant;

use axum::{
    extract::{Json, Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Router,
};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::checkpoint::StopCondition;
use crate::config::ApiConfig;
use crate::coordinate::Coordinate;
use crate::dump::{DumpServer, SessionInfo};
use crate::error::{Error, ErrorKind, Result};
use crate::event::{current_timestamp, DataEvent, Event, GroupBoundary, LogEvent};
use crate::filter::FilterConfig;
use crate::link::{AdminSession, ChangeRequest, LinkRegistry, LinkStatus, WorkerSelection};

/// Shared application state
pub struct AppState {
    /// Local server id
    pub server_id: u32,
    pub links: Arc<LinkRegistry>,
    /// Present when this node serves its own source log
    pub primary: Option<Arc<DumpServer>>,
    pub started: Instant,
}

/// HTTP API server
pub struct HttpServer {
    config: ApiConfig,
    state: Arc<AppState>,
}

impl HttpServer {
    pub fn new(config: ApiConfig, state: AppState) -> Self {
        Self {
            config,
            state: Arc::new(state),
        }
    }

    /// Create the router
    pub fn router(&self) -> Router {
        let router = Router::new()
            .route("/health", get(handle_health))
            // Replication links
            .route("/links", get(handle_links))
            .route("/links/:name/status", get(handle_link_status))
            .route("/links/:name/start", post(handle_start))
            .route("/links/:name/stop", post(handle_stop))
            .route("/links/:name/change", post(handle_change))
            .route("/links/:name/reset", post(handle_reset))
            .route("/links/:name/skip", post(handle_skip))
            .route("/links/:name/filter", put(handle_filter))
            // Primary source log
            .route("/binlog/status", get(handle_binlog_status))
            .route("/binlog/rotate", post(handle_binlog_rotate))
            .route("/binlog/events", post(handle_binlog_events))
            .layer(TraceLayer::new_for_http())
            .with_state(Arc::clone(&self.state));

        if self.config.cors_enabled {
            router.layer(CorsLayer::permissive())
        } else {
            router
        }
    }

    /// Serve until `shutdown` fires
    pub async fn start(&self, shutdown: CancellationToken) -> Result<()> {
        if !self.config.enabled {
            tracing::info!("HTTP API disabled");
            return Ok(());
        }

        let app = self.router();
        let listener = tokio::net::TcpListener::bind(&self.config.bind_address).await?;
        tracing::info!("HTTP API listening on {}", self.config.bind_address);

        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown.cancelled_owned())
            .await
            .map_err(|e| Error::Network(format!("HTTP server error: {}", e)))?;

        Ok(())
    }
}

// ============ Request/Response Types ============

/// Error response
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

/// Health response
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub healthy: bool,
    pub server_id: u32,
    pub primary: bool,
    pub links: usize,
    pub uptime_seconds: u64,
}

/// Result of start/stop
#[derive(Debug, Serialize, Deserialize)]
pub struct CommandResponse {
    pub success: bool,
    #[serde(default)]
    pub warnings: Vec<String>,
}

impl CommandResponse {
    fn ok(warnings: Vec<String>) -> Self {
        Self {
            success: true,
            warnings,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct StartRequest {
    pub workers: WorkerSelection,
    /// Halt the apply worker before this source position
    pub until_source: Option<Coordinate>,
    /// Halt the apply worker before this relay position
    pub until_relay: Option<Coordinate>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct StopRequest {
    pub workers: WorkerSelection,
    #[serde(flatten)]
    pub session: AdminSession,
}

#[derive(Debug, Deserialize)]
pub struct SkipRequest {
    pub count: u32,
}

/// Events for one transaction group on the primary
#[derive(Debug, Deserialize)]
pub struct AppendRequest {
    pub events: Vec<AppendEvent>,
}

#[derive(Debug, Deserialize)]
pub struct AppendEvent {
    pub schema: String,
    #[serde(default)]
    pub table: Option<String>,
    pub payload: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AppendResponse {
    /// Source log position after each appended event
    pub end: Vec<Coordinate>,
}

#[derive(Debug, Serialize)]
pub struct BinlogStatus {
    pub server_id: u32,
    pub end: Coordinate,
    pub segments: Vec<String>,
    pub total_size: u64,
    pub sessions: Vec<SessionInfo>,
}

// ============ Handlers ============

async fn handle_health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(HealthResponse {
        healthy: true,
        server_id: state.server_id,
        primary: state.primary.is_some(),
        links: state.links.len(),
        uptime_seconds: state.started.elapsed().as_secs(),
    })
}

async fn handle_links(State(state): State<Arc<AppState>>) -> Json<Vec<LinkStatus>> {
    Json(state.links.statuses().await)
}

async fn handle_link_status(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> Response {
    match state.links.get(&name) {
        Ok(link) => Json(link.status().await).into_response(),
        Err(e) => error_response(e),
    }
}

async fn handle_start(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    body: Option<Json<StartRequest>>,
) -> Response {
    let req = body.map(|Json(r)| r).unwrap_or_default();
    let until = match (req.until_source, req.until_relay) {
        (Some(_), Some(_)) => {
            return error_response(Error::Config(
                "until_source and until_relay are mutually exclusive".into(),
            ))
        }
        (Some(at), None) => Some(StopCondition::AtSourceCoordinate(at)),
        (None, Some(at)) => Some(StopCondition::AtRelayCoordinate(at)),
        (None, None) => None,
    };

    let result = match state.links.get(&name) {
        Ok(link) => link.start(req.workers, until).await,
        Err(e) => Err(e),
    };
    match result {
        Ok(warnings) => Json(CommandResponse::ok(warnings)).into_response(),
        Err(e) => error_response(e),
    }
}

async fn handle_stop(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    body: Option<Json<StopRequest>>,
) -> Response {
    let req = body.map(|Json(r)| r).unwrap_or_default();
    let result = match state.links.get(&name) {
        Ok(link) => link.stop(req.workers, req.session).await,
        Err(e) => Err(e),
    };
    match result {
        Ok(warnings) => Json(CommandResponse::ok(warnings)).into_response(),
        Err(e) => error_response(e),
    }
}

async fn handle_change(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    Json(req): Json<ChangeRequest>,
) -> Response {
    let result = match state.links.get(&name) {
        Ok(link) => link.change(req).await,
        Err(e) => Err(e),
    };
    command_result(result)
}

async fn handle_reset(State(state): State<Arc<AppState>>, Path(name): Path<String>) -> Response {
    let result = match state.links.get(&name) {
        Ok(link) => link.reset().await,
        Err(e) => Err(e),
    };
    command_result(result)
}

async fn handle_skip(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    Json(req): Json<SkipRequest>,
) -> Response {
    let result = match state.links.get(&name) {
        Ok(link) => link.skip(req.count).await,
        Err(e) => Err(e),
    };
    command_result(result)
}

async fn handle_filter(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    Json(req): Json<FilterConfig>,
) -> Response {
    let result = state.links.get(&name).and_then(|link| link.set_filter(&req));
    command_result(result)
}

async fn handle_binlog_status(State(state): State<Arc<AppState>>) -> Response {
    let Some(primary) = &state.primary else {
        return error_response(not_primary());
    };
    let log = primary.log();
    Json(BinlogStatus {
        server_id: state.server_id,
        end: log.end(),
        segments: log.segments().await,
        total_size: log.total_size(),
        sessions: primary.sessions(),
    })
    .into_response()
}

async fn handle_binlog_rotate(State(state): State<Arc<AppState>>) -> Response {
    let Some(primary) = &state.primary else {
        return error_response(not_primary());
    };
    match primary.log().rotate().await {
        Ok(file) => {
            tracing::info!("Source log rotated to {}", file);
            Json(Coordinate::start_of(file)).into_response()
        }
        Err(e) => error_response(e),
    }
}

async fn handle_binlog_events(
    State(state): State<Arc<AppState>>,
    Json(req): Json<AppendRequest>,
) -> Response {
    let Some(primary) = &state.primary else {
        return error_response(not_primary());
    };
    if req.events.is_empty() {
        return error_response(Error::Config("a group needs at least one event".into()));
    }

    let events = match group_events(state.server_id, req.events) {
        Ok(events) => events,
        Err(e) => return error_response(e),
    };
    match primary.log().append_group(events).await {
        Ok(end) => (StatusCode::CREATED, Json(AppendResponse { end })).into_response(),
        Err(e) => error_response(e),
    }
}

// ============ Helpers ============

/// Mark the first and last events as the group's boundaries
fn group_events(server_id: u32, events: Vec<AppendEvent>) -> Result<Vec<LogEvent>> {
    let last = events.len() - 1;
    let timestamp = current_timestamp();
    events
        .into_iter()
        .enumerate()
        .map(|(i, ev)| {
            let boundary = match (i == 0, i == last) {
                (true, true) => GroupBoundary::standalone(),
                (true, false) => GroupBoundary::begin(),
                (false, true) => GroupBoundary::commit(),
                (false, false) => GroupBoundary::inner(),
            };
            let data = DataEvent {
                boundary,
                schema: ev.schema,
                table: ev.table,
                payload: Bytes::from(ev.payload),
            };
            data.check_names()
                .map_err(|e| Error::Config(format!("event {}: {}", i, e)))?;
            Ok(LogEvent::new(Event::Data(data), server_id, timestamp))
        })
        .collect()
}

fn not_primary() -> Error {
    Error::Config("this node does not serve a source log (primary.enabled = false)".into())
}

fn command_result(result: Result<()>) -> Response {
    match result {
        Ok(()) => Json(CommandResponse::ok(Vec::new())).into_response(),
        Err(e) => error_response(e),
    }
}

fn status_for(e: &Error) -> StatusCode {
    match e {
        Error::LinkNotFound(_) => StatusCode::NOT_FOUND,
        Error::LinkRunning(_) | Error::LockHeld(_) => StatusCode::CONFLICT,
        _ => match e.kind() {
            ErrorKind::Config => StatusCode::BAD_REQUEST,
            ErrorKind::NoSuchPosition => StatusCode::NOT_FOUND,
            ErrorKind::State => StatusCode::CONFLICT,
            ErrorKind::Cancelled => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        },
    }
}

fn error_response(e: Error) -> Response {
    let status = status_for(&e);
    if status.is_server_error() {
        tracing::error!("Admin request failed: {}", e);
    }
    (
        status,
        Json(ErrorResponse {
            error: e.to_string(),
            code: e.kind().to_string(),
        }),
    )
        .into_response()
}
