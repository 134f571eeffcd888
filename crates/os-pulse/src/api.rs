//! HTTP control plane.
//!
//! Frontend-facing routes (sessions, monitoring control, event polling) and
//! producer-facing ingestion routes share one axum [`Router`]. Every error
//! is returned as `{"error": "..."}` with a status derived from its class.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::rejection::JsonRejection;
use axum::extract::{DefaultBodyLimit, Multipart, Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, error, info};

use pulse_core::models::{
    Event, EventStats, HttpTransaction, IngestEnvelope, MonitorMode, MonitorModeEntry,
    NetworkBatch, ProcessDescriptor, Session,
};
use pulse_core::{ErrorClass, PulseError};
use pulse_runtime::processes;
use pulse_runtime::relay::StartRequest;
use pulse_runtime::{InstrumentationEngine, MonitoringControlRelay};
use pulse_store::{
    ArtifactStore, EventDeliveryQueue, EventIngestionService, SessionRegistry,
};

/// Default batch size for `GET events/{sessionId}`.
const DEFAULT_FETCH_LIMIT: usize = 10;
const DEFAULT_EXPORT_LIMIT: usize = 1000;
const MAX_UPLOAD_BYTES: usize = 256 * 1024 * 1024;

// ── State ──────────────────────────────────────────────────────────────────────

pub struct AppState<E: InstrumentationEngine> {
    pub relay: Arc<MonitoringControlRelay<E>>,
    pub registry: SessionRegistry,
    pub ingest: EventIngestionService,
    pub queue: EventDeliveryQueue,
    pub artifacts: ArtifactStore,
    /// Lease length when `events/lease` is called without `visibilitySecs`.
    pub lease_visibility: Duration,
}

impl<E: InstrumentationEngine> Clone for AppState<E> {
    fn clone(&self) -> Self {
        Self {
            relay: Arc::clone(&self.relay),
            registry: self.registry.clone(),
            ingest: self.ingest.clone(),
            queue: self.queue.clone(),
            artifacts: self.artifacts.clone(),
            lease_visibility: self.lease_visibility,
        }
    }
}

pub fn router<E: InstrumentationEngine>(state: AppState<E>) -> Router {
    Router::new()
        // Sessions and artifacts
        .route("/api/upload", post(upload::<E>))
        .route("/api/create-session", post(create_session::<E>))
        .route("/api/sessions/active", get(active_sessions::<E>))
        .route("/api/sessions/{id}", get(get_session::<E>))
        .route("/api/sessions/{id}/events", get(session_events::<E>))
        // Monitoring control
        .route("/api/monitor-modes", get(monitor_modes::<E>))
        .route("/api/list-processes", post(list_processes))
        .route("/api/start-monitor", post(start_monitor::<E>))
        .route("/api/stop-monitor", post(stop_monitor::<E>))
        .route("/api/monitor/stop", post(stop_monitor::<E>))
        // Delivery
        .route("/api/events/export", get(export_events::<E>))
        .route("/api/events/stats", get(event_stats::<E>))
        .route("/api/events/lease", post(lease_events::<E>))
        .route("/api/events/ack", post(ack_events::<E>))
        .route("/api/events/{session_id}", get(fetch_events::<E>))
        // Ingestion
        .route("/api/events", post(ingest_event::<E>))
        .route("/api/http/events", post(ingest_http::<E>))
        .route("/api/net/events", post(ingest_net::<E>))
        .route("/api/health", get(health::<E>))
        .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES))
        .with_state(state)
}

// ── Errors ─────────────────────────────────────────────────────────────────────

#[derive(Debug)]
pub struct ApiError(PulseError);

impl From<PulseError> for ApiError {
    fn from(e: PulseError) -> Self {
        ApiError(e)
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError(PulseError::InvalidRequest(rejection.body_text()))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match self.0.class() {
            ErrorClass::NotFound => StatusCode::NOT_FOUND,
            ErrorClass::InvalidRequest => StatusCode::BAD_REQUEST,
            ErrorClass::Conflict => StatusCode::CONFLICT,
            ErrorClass::UpstreamUnavailable => StatusCode::BAD_GATEWAY,
            ErrorClass::PartialFailure | ErrorClass::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            error!(status = status.as_u16(), error = %self.0, "request failed");
        } else {
            debug!(status = status.as_u16(), error = %self.0, "request rejected");
        }

        let mut body = json!({ "error": self.0.to_string() });
        if let PulseError::PartialFailure { persisted, .. } = &self.0 {
            body["persisted"] = json!(persisted);
        }
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

fn invalid(msg: impl Into<String>) -> ApiError {
    ApiError(PulseError::InvalidRequest(msg.into()))
}

/// Run a store call off the async runtime.
async fn blocking<T, F>(f: F) -> ApiResult<T>
where
    F: FnOnce() -> pulse_core::Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| ApiError(PulseError::Other(anyhow::anyhow!("store task failed: {e}"))))?
        .map_err(ApiError)
}

/// Lenient positive-integer query value: anything unparseable or zero
/// yields `default`.
fn query_usize(raw: Option<&str>, default: usize) -> usize {
    raw.and_then(|s| s.trim().parse::<usize>().ok())
        .filter(|n| *n > 0)
        .unwrap_or(default)
}

// ── Sessions and artifacts ─────────────────────────────────────────────────────

/// The first multipart field named `file`.
async fn read_file_field(mut multipart: Multipart) -> ApiResult<(String, Vec<u8>)> {
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| invalid(e.body_text()))?
    {
        if field.name() != Some("file") {
            continue;
        }
        let name = field
            .file_name()
            .map(str::to_string)
            .ok_or_else(|| invalid("file field has no file name"))?;
        let bytes = field.bytes().await.map_err(|e| invalid(e.body_text()))?;
        return Ok((name, bytes.to_vec()));
    }
    Err(invalid("No file provided"))
}

async fn upload<E: InstrumentationEngine>(
    State(state): State<AppState<E>>,
    multipart: Multipart,
) -> ApiResult<Json<Value>> {
    let (name, bytes) = read_file_field(multipart).await?;
    let artifacts = state.artifacts.clone();
    let stored = blocking(move || artifacts.save(&name, &bytes)).await?;
    Ok(Json(json!({
        "message": "File uploaded successfully",
        "fileName": stored.file_name,
        "path": stored.path.display().to_string(),
    })))
}

async fn create_session<E: InstrumentationEngine>(
    State(state): State<AppState<E>>,
    multipart: Multipart,
) -> ApiResult<Json<Value>> {
    let (name, bytes) = read_file_field(multipart).await?;
    let (artifacts, registry) = (state.artifacts.clone(), state.registry.clone());
    let (session_id, file_name) = blocking(move || {
        let stored = artifacts.save(&name, &bytes)?;
        let id = registry.create_session(&stored.file_name)?;
        Ok((id, stored.file_name))
    })
    .await?;
    info!(session_id = %session_id, file_name = %file_name, "session created");
    Ok(Json(json!({ "sessionId": session_id, "fileName": file_name })))
}

async fn active_sessions<E: InstrumentationEngine>(
    State(state): State<AppState<E>>,
) -> ApiResult<Json<Vec<Session>>> {
    let registry = state.registry.clone();
    Ok(Json(blocking(move || registry.list_active_sessions()).await?))
}

async fn get_session<E: InstrumentationEngine>(
    State(state): State<AppState<E>>,
    Path(id): Path<String>,
) -> ApiResult<Json<Session>> {
    let registry = state.registry.clone();
    Ok(Json(blocking(move || registry.get_session(&id)).await?))
}

async fn session_events<E: InstrumentationEngine>(
    State(state): State<AppState<E>>,
    Path(id): Path<String>,
) -> ApiResult<Json<Vec<Event>>> {
    let (registry, queue) = (state.registry.clone(), state.queue.clone());
    let events = blocking(move || {
        let session = registry.get_session(&id)?;
        queue.events_in_window(&session)
    })
    .await?;
    Ok(Json(events))
}

// ── Monitoring control ─────────────────────────────────────────────────────────

async fn monitor_modes<E: InstrumentationEngine>(
    State(state): State<AppState<E>>,
) -> Json<Vec<MonitorModeEntry>> {
    Json(state.relay.enabled_modes().entries())
}

async fn list_processes() -> ApiResult<Json<Vec<ProcessDescriptor>>> {
    Ok(Json(processes::list_processes().await?))
}

/// `mode` arrives either as the numeric id or as a name.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ModeParam {
    Id(i64),
    Name(String),
}

impl ModeParam {
    fn resolve(&self) -> pulse_core::Result<MonitorMode> {
        match self {
            ModeParam::Id(id) => {
                MonitorMode::from_id(*id).ok_or_else(|| PulseError::InvalidMode(id.to_string()))
            }
            ModeParam::Name(name) => name.parse(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StartMonitorBody {
    #[serde(default)]
    session_id: String,
    mode: ModeParam,
    #[serde(default)]
    processes: Vec<u32>,
    #[serde(default)]
    file_name: Option<String>,
    #[serde(default)]
    filter: Option<String>,
}

async fn start_monitor<E: InstrumentationEngine>(
    State(state): State<AppState<E>>,
    body: Result<Json<StartMonitorBody>, JsonRejection>,
) -> ApiResult<Json<Value>> {
    let Json(body) = body?;
    if body.session_id.trim().is_empty() {
        return Err(invalid("sessionId is required"));
    }
    let mode = body.mode.resolve()?;

    // Attach-all narrows by the uploaded file's name unless told otherwise.
    let filter = match mode {
        MonitorMode::AttachAll => body.filter.or_else(|| body.file_name.clone()),
        _ => None,
    };
    let request = StartRequest {
        session_id: body.session_id.clone(),
        mode,
        processes: body.processes,
        filter,
        file_name: body.file_name,
    };

    // Detached so a dropped connection cannot leave the session half-started.
    let relay = Arc::clone(&state.relay);
    let outcome = tokio::spawn(async move { relay.start(request).await })
        .await
        .map_err(|e| ApiError(PulseError::Other(anyhow::anyhow!("start task failed: {e}"))))??;
    Ok(Json(json!({
        "message": "Monitoring started successfully",
        "sessionId": body.session_id,
        "monitoringPid": outcome.monitoring_pid,
        "mode": mode.id(),
        "attached": outcome.attached,
    })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StopMonitorBody {
    #[serde(default)]
    session_id: String,
}

async fn stop_monitor<E: InstrumentationEngine>(
    State(state): State<AppState<E>>,
    body: Result<Json<StopMonitorBody>, JsonRejection>,
) -> ApiResult<Json<Value>> {
    let Json(body) = body?;
    if body.session_id.trim().is_empty() {
        return Err(invalid("sessionId is required"));
    }
    let outcome = state.relay.stop(&body.session_id).await?;
    Ok(Json(json!({
        "message": "Monitoring stopped successfully",
        "sessionId": body.session_id,
        "warnings": outcome.warnings,
    })))
}

// ── Delivery ───────────────────────────────────────────────────────────────────

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PageQuery {
    limit: Option<String>,
    offset: Option<String>,
    visibility_secs: Option<String>,
}

/// Drain the global undelivered queue; the path segment is informational.
async fn fetch_events<E: InstrumentationEngine>(
    State(state): State<AppState<E>>,
    Path(session_id): Path<String>,
    Query(page): Query<PageQuery>,
) -> ApiResult<Json<Vec<Event>>> {
    let limit = query_usize(page.limit.as_deref(), DEFAULT_FETCH_LIMIT);
    let queue = state.queue.clone();
    let events = blocking(move || queue.fetch_undelivered(limit)).await?;
    debug!(session_id = %session_id, count = events.len(), "events delivered");
    Ok(Json(events))
}

async fn export_events<E: InstrumentationEngine>(
    State(state): State<AppState<E>>,
    Query(page): Query<PageQuery>,
) -> ApiResult<Json<Vec<Event>>> {
    let limit = query_usize(page.limit.as_deref(), DEFAULT_EXPORT_LIMIT);
    let offset = page
        .offset
        .as_deref()
        .and_then(|s| s.trim().parse::<usize>().ok())
        .unwrap_or(0);
    let queue = state.queue.clone();
    Ok(Json(blocking(move || queue.export_all(offset, limit)).await?))
}

async fn event_stats<E: InstrumentationEngine>(
    State(state): State<AppState<E>>,
) -> ApiResult<Json<EventStats>> {
    let queue = state.queue.clone();
    Ok(Json(blocking(move || queue.stats()).await?))
}

async fn lease_events<E: InstrumentationEngine>(
    State(state): State<AppState<E>>,
    Query(page): Query<PageQuery>,
) -> ApiResult<Json<Vec<Event>>> {
    let limit = query_usize(page.limit.as_deref(), DEFAULT_FETCH_LIMIT);
    let visibility = page
        .visibility_secs
        .as_deref()
        .and_then(|s| s.trim().parse::<u64>().ok())
        .filter(|s| *s > 0)
        .map(Duration::from_secs)
        .unwrap_or(state.lease_visibility);
    let queue = state.queue.clone();
    Ok(Json(
        blocking(move || queue.lease_undelivered(limit, visibility)).await?,
    ))
}

#[derive(Debug, Deserialize)]
struct AckBody {
    ids: Vec<i64>,
}

async fn ack_events<E: InstrumentationEngine>(
    State(state): State<AppState<E>>,
    body: Result<Json<AckBody>, JsonRejection>,
) -> ApiResult<Json<Value>> {
    let Json(body) = body?;
    let queue = state.queue.clone();
    let acknowledged = blocking(move || queue.acknowledge(&body.ids)).await?;
    Ok(Json(json!({ "acknowledged": acknowledged })))
}

// ── Ingestion ──────────────────────────────────────────────────────────────────

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SessionHint {
    session_id: Option<String>,
}

async fn ingest_event<E: InstrumentationEngine>(
    State(state): State<AppState<E>>,
    body: Result<Json<IngestEnvelope>, JsonRejection>,
) -> ApiResult<Json<Value>> {
    let Json(envelope) = body?;
    let ingest = state.ingest.clone();
    let event = blocking(move || ingest.ingest_generic(envelope)).await?;
    Ok(Json(json!({ "status": "success", "id": event.id })))
}

async fn ingest_http<E: InstrumentationEngine>(
    State(state): State<AppState<E>>,
    Query(hint): Query<SessionHint>,
    body: Result<Json<HttpTransaction>, JsonRejection>,
) -> ApiResult<Json<Value>> {
    let Json(transaction) = body?;
    let ingest = state.ingest.clone();
    let event = blocking(move || {
        ingest.ingest_http_transaction(transaction, hint.session_id.as_deref())
    })
    .await?;
    Ok(Json(json!({ "status": "success", "id": event.id })))
}

async fn ingest_net<E: InstrumentationEngine>(
    State(state): State<AppState<E>>,
    Query(hint): Query<SessionHint>,
    body: Result<Json<NetworkBatch>, JsonRejection>,
) -> ApiResult<Json<Value>> {
    let Json(batch) = body?;
    let ingest = state.ingest.clone();
    let events =
        blocking(move || ingest.ingest_network_batch(batch, hint.session_id.as_deref())).await?;
    Ok(Json(json!({ "status": "success", "stored": events.len() })))
}

async fn health<E: InstrumentationEngine>(
    State(state): State<AppState<E>>,
) -> ApiResult<Json<Value>> {
    let registry = state.registry.clone();
    let active = blocking(move || registry.count_active_sessions()).await?;
    let monitoring = state.relay.active_sessions().await.len();
    Ok(Json(json!({
        "status": "healthy",
        "service": "os-pulse",
        "activeSessions": active,
        "monitoring": monitoring,
    })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::path::Path as FsPath;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    use axum::body::{to_bytes, Body};
    use axum::http::{header, Method, Request};
    use pulse_core::events::DecoderRegistry;
    use pulse_core::models::EnabledModes;
    use pulse_core::time_utils::TimestampParser;
    use pulse_runtime::relay::RelayConfig;
    use pulse_runtime::{Attachment, EventRouter, Forwarder};
    use pulse_store::Database;
    use tempfile::TempDir;
    use tokio::sync::mpsc;
    use tower::ServiceExt;

    // ── Fake engine ──────────────────────────────────────────────────────────

    #[derive(Default)]
    struct FakeEngine {
        attached: Mutex<Vec<u32>>,
        unreachable: HashSet<u32>,
        senders: Mutex<Vec<mpsc::Sender<Value>>>,
        next: AtomicU32,
    }

    impl InstrumentationEngine for FakeEngine {
        async fn enumerate_processes(&self) -> pulse_core::Result<Vec<ProcessDescriptor>> {
            Ok(Vec::new())
        }

        async fn spawn(&self, _program: &FsPath) -> pulse_core::Result<u32> {
            Ok(9000)
        }

        async fn attach(&self, pid: u32, _session_id: &str) -> pulse_core::Result<Attachment> {
            if self.unreachable.contains(&pid) {
                return Err(PulseError::UpstreamUnavailable("engine not running".to_string()));
            }
            self.attached.lock().unwrap().push(pid);
            let (tx, rx) = mpsc::channel(4);
            self.senders.lock().unwrap().push(tx);
            Ok(Attachment {
                id: format!("a{}", self.next.fetch_add(1, Ordering::SeqCst)),
                pid,
                messages: rx,
            })
        }

        async fn resume(&self, _pid: u32) -> pulse_core::Result<()> {
            Ok(())
        }

        async fn detach(&self, _attachment_id: &str) -> pulse_core::Result<()> {
            self.senders.lock().unwrap().clear();
            Ok(())
        }

        async fn kill(&self, _pid: u32) -> pulse_core::Result<()> {
            Ok(())
        }
    }

    struct TestApp {
        app: Router,
        engine: Arc<FakeEngine>,
        _tmp: TempDir,
    }

    fn test_app_with(engine: FakeEngine, modes: EnabledModes) -> TestApp {
        let tmp = TempDir::new().unwrap();
        let db = Database::open_in_memory().unwrap();
        let registry = SessionRegistry::new(db.clone());
        let ingest = EventIngestionService::new(db.clone(), TimestampParser::default());
        let queue = EventDeliveryQueue::new(db);
        let artifacts = ArtifactStore::new(tmp.path().join("artifacts")).unwrap();
        let router = EventRouter::new(
            DecoderRegistry::default(),
            Forwarder::Local(ingest.clone()),
            "os-pulse-relay",
        );
        let engine = Arc::new(engine);
        let relay = MonitoringControlRelay::new(
            Arc::clone(&engine),
            registry.clone(),
            artifacts.clone(),
            router,
            RelayConfig {
                enabled_modes: modes,
                directive_timeout: Duration::from_secs(1),
                ..RelayConfig::default()
            },
        );
        let state = AppState {
            relay: Arc::new(relay),
            registry,
            ingest,
            queue,
            artifacts,
            lease_visibility: Duration::from_secs(30),
        };
        TestApp {
            app: super::router(state),
            engine,
            _tmp: tmp,
        }
    }

    fn test_app() -> TestApp {
        test_app_with(FakeEngine::default(), EnabledModes::all())
    }

    async fn send(app: &Router, req: Request<Body>) -> (StatusCode, Value) {
        let response = app.clone().oneshot(req).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or_else(|_| json!(String::from_utf8_lossy(&bytes)))
        };
        (status, body)
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    fn post_json(uri: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method(Method::POST)
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn post_file(uri: &str, file_name: &str, contents: &[u8]) -> Request<Body> {
        let boundary = "pulse-test-boundary";
        let mut body = Vec::new();
        body.extend_from_slice(
            format!(
                "--{boundary}\r\nContent-Disposition: form-data; name=\"file\"; filename=\"{file_name}\"\r\nContent-Type: application/octet-stream\r\n\r\n"
            )
            .as_bytes(),
        );
        body.extend_from_slice(contents);
        body.extend_from_slice(format!("\r\n--{boundary}--\r\n").as_bytes());
        Request::builder()
            .method(Method::POST)
            .uri(uri)
            .header(
                header::CONTENT_TYPE,
                format!("multipart/form-data; boundary={boundary}"),
            )
            .body(Body::from(body))
            .unwrap()
    }

    async fn create_session(app: &Router, file_name: &str) -> String {
        let (status, body) = send(app, post_file("/api/create-session", file_name, b"MZ")).await;
        assert_eq!(status, StatusCode::OK, "{body}");
        body["sessionId"].as_str().unwrap().to_string()
    }

    fn file_event(ts: &str) -> Value {
        json!({
            "event_type": "file_operation",
            "source": "test",
            "timestamp": ts,
            "data": {"filePath": "C:\\f.txt", "bytesTransferred": 10}
        })
    }

    // ── Health and discovery ─────────────────────────────────────────────────

    #[tokio::test]
    async fn test_health() {
        let t = test_app();
        let (status, body) = send(&t.app, get("/api/health")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["activeSessions"], 0);
    }

    #[tokio::test]
    async fn test_monitor_modes_lists_only_enabled() {
        let t = test_app_with(
            FakeEngine::default(),
            EnabledModes::new([MonitorMode::AttachSpecific]),
        );
        let (status, body) = send(&t.app, get("/api/monitor-modes")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!([{"id": 2, "mode": "Specific Processes"}]));
    }

    #[tokio::test]
    async fn test_list_processes_returns_array() {
        let t = test_app();
        let (status, body) = send(&t.app, post_json("/api/list-processes", json!({}))).await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.as_array().is_some_and(|a| !a.is_empty()));
    }

    // ── Sessions ─────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn test_create_session_stores_artifact() {
        let t = test_app();
        let id = create_session(&t.app, "a b.exe").await;

        let (status, body) = send(&t.app, get(&format!("/api/sessions/{id}"))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["sessionId"], id);
        assert_eq!(body["fileName"], "a_b.exe");
        assert_eq!(body["isActive"], false);
    }

    #[tokio::test]
    async fn test_create_session_without_file_is_bad_request() {
        let t = test_app();
        let req = Request::builder()
            .method(Method::POST)
            .uri("/api/create-session")
            .header(header::CONTENT_TYPE, "multipart/form-data; boundary=x")
            .body(Body::from("--x--\r\n"))
            .unwrap();
        let (status, body) = send(&t.app, req).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].is_string());
    }

    #[tokio::test]
    async fn test_upload_returns_path() {
        let t = test_app();
        let (status, body) = send(&t.app, post_file("/api/upload", "tool.exe", b"MZ")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["fileName"], "tool.exe");
        assert!(body["path"].as_str().unwrap().ends_with("tool.exe"));
    }

    #[tokio::test]
    async fn test_unknown_session_is_not_found() {
        let t = test_app();
        let (status, body) = send(&t.app, get("/api/sessions/nope")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(body["error"].as_str().unwrap().contains("nope"));
    }

    // ── Monitoring control ───────────────────────────────────────────────────

    #[tokio::test]
    async fn test_start_and_stop_monitoring() {
        let t = test_app();
        let id = create_session(&t.app, "a.exe").await;

        let (status, body) = send(
            &t.app,
            post_json(
                "/api/start-monitor",
                json!({"sessionId": id, "fileName": "a.exe", "mode": 2, "processes": [1234]}),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK, "{body}");
        assert_eq!(body["monitoringPid"], 1234);
        assert_eq!(*t.engine.attached.lock().unwrap(), vec![1234]);

        let (_, active) = send(&t.app, get("/api/sessions/active")).await;
        assert_eq!(active.as_array().unwrap().len(), 1);

        let (status, body) =
            send(&t.app, post_json("/api/stop-monitor", json!({"sessionId": id}))).await;
        assert_eq!(status, StatusCode::OK);
        assert!(body["message"].is_string());

        let (_, session) = send(&t.app, get(&format!("/api/sessions/{id}"))).await;
        assert_eq!(session["isActive"], false);
        let started: chrono::DateTime<chrono::Utc> =
            serde_json::from_value(session["monitoringStarted"].clone()).unwrap();
        let ended: chrono::DateTime<chrono::Utc> =
            serde_json::from_value(session["monitoringEnded"].clone()).unwrap();
        assert!(ended >= started);
    }

    #[tokio::test]
    async fn test_start_accepts_mode_name() {
        let t = test_app();
        let id = create_session(&t.app, "a.exe").await;
        let (status, body) = send(
            &t.app,
            post_json(
                "/api/start-monitor",
                json!({"sessionId": id, "mode": "spawn-uploaded", "fileName": "a.exe"}),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK, "{body}");
        assert_eq!(body["monitoringPid"], 9000);
        assert_eq!(body["mode"], 3);
    }

    #[tokio::test]
    async fn test_start_unknown_session_is_not_found() {
        let t = test_app();
        let (status, body) = send(
            &t.app,
            post_json("/api/start-monitor", json!({"sessionId": "ghost", "mode": 2, "processes": [1]})),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(body["error"].is_string());
        assert!(t.engine.attached.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_start_without_processes_is_bad_request() {
        let t = test_app();
        let id = create_session(&t.app, "a.exe").await;
        let (status, _) = send(
            &t.app,
            post_json("/api/start-monitor", json!({"sessionId": id, "mode": 2})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_start_invalid_mode_is_bad_request() {
        let t = test_app();
        let id = create_session(&t.app, "a.exe").await;
        let (status, _) = send(
            &t.app,
            post_json("/api/start-monitor", json!({"sessionId": id, "mode": 9})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_start_twice_is_conflict() {
        let t = test_app();
        let id = create_session(&t.app, "a.exe").await;
        let body = json!({"sessionId": id, "mode": 2, "processes": [1]});
        let (first, _) = send(&t.app, post_json("/api/start-monitor", body.clone())).await;
        assert_eq!(first, StatusCode::OK);
        let (second, _) = send(&t.app, post_json("/api/start-monitor", body)).await;
        assert_eq!(second, StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn test_engine_failure_is_bad_gateway() {
        let t = test_app_with(
            FakeEngine {
                unreachable: HashSet::from([77]),
                ..FakeEngine::default()
            },
            EnabledModes::all(),
        );
        let id = create_session(&t.app, "a.exe").await;
        let (status, _) = send(
            &t.app,
            post_json("/api/start-monitor", json!({"sessionId": id, "mode": 2, "processes": [77]})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_GATEWAY);
    }

    #[tokio::test]
    async fn test_stop_without_start_still_succeeds() {
        let t = test_app();
        let id = create_session(&t.app, "a.exe").await;
        let (status, _) =
            send(&t.app, post_json("/api/monitor/stop", json!({"sessionId": id}))).await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_malformed_body_is_bad_request() {
        let t = test_app();
        let req = Request::builder()
            .method(Method::POST)
            .uri("/api/stop-monitor")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from("{not json"))
            .unwrap();
        let (status, body) = send(&t.app, req).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].is_string());
    }

    // ── Ingestion and delivery ───────────────────────────────────────────────

    #[tokio::test]
    async fn test_ingest_then_fetch_drains_queue() {
        let t = test_app();
        for day in 1..=5 {
            let (status, _) = send(
                &t.app,
                post_json("/api/events", file_event(&format!("2024-01-0{day}T00:00:00Z"))),
            )
            .await;
            assert_eq!(status, StatusCode::OK);
        }

        let (_, first) = send(&t.app, get("/api/events/any?limit=2")).await;
        let first = first.as_array().unwrap().clone();
        assert_eq!(first.len(), 2);
        assert!(first[0]["timestamp"].as_str().unwrap().starts_with("2024-01-01"));
        assert_eq!(first[0]["event_type"], "file_operation");

        let (_, second) = send(&t.app, get("/api/events/any?limit=2")).await;
        assert!(second[0]["timestamp"].as_str().unwrap().starts_with("2024-01-03"));

        let (_, stats) = send(&t.app, get("/api/events/stats")).await;
        assert_eq!(stats["total_events"], 5);
        assert_eq!(stats["sent_events"], 4);
    }

    #[tokio::test]
    async fn test_fetch_default_limit_is_ten() {
        let t = test_app();
        for i in 0..12 {
            send(
                &t.app,
                post_json("/api/events", file_event(&format!("2024-01-01T00:00:{i:02}Z"))),
            )
            .await;
        }
        let (_, batch) = send(&t.app, get("/api/events/s?limit=abc")).await;
        assert_eq!(batch.as_array().unwrap().len(), DEFAULT_FETCH_LIMIT);
    }

    #[tokio::test]
    async fn test_ingest_rejects_bad_timestamp() {
        let t = test_app();
        let (status, _) = send(&t.app, post_json("/api/events", file_event("yesterday"))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_export_has_no_delivery_side_effect() {
        let t = test_app();
        for day in 1..=3 {
            send(
                &t.app,
                post_json("/api/events", file_event(&format!("2024-01-0{day}T00:00:00Z"))),
            )
            .await;
        }
        let (_, page) = send(&t.app, get("/api/events/export?offset=1&limit=1")).await;
        assert_eq!(page.as_array().unwrap().len(), 1);
        let (_, stats) = send(&t.app, get("/api/events/stats")).await;
        assert_eq!(stats["unsent_events"], 3);
    }

    #[tokio::test]
    async fn test_http_event_with_session_hint() {
        let t = test_app();
        let tx = json!({
            "timestamp_ms": 1_704_067_200_000i64,
            "type": "http",
            "client": {"ip": "10.0.0.2"},
            "request": {
                "method": "GET", "scheme": "https", "host": "example.com", "port": 443,
                "path": "/", "url": "https://example.com/", "http_version": "HTTP/1.1",
                "headers": {}, "body": null
            }
        });
        let (status, body) = send(&t.app, post_json("/api/http/events?sessionId=s-1", tx)).await;
        assert_eq!(status, StatusCode::OK, "{body}");

        let (_, events) = send(&t.app, get("/api/events/export")).await;
        assert_eq!(events[0]["event_type"], "http_network_operation");
        assert_eq!(events[0]["sessionId"], "s-1");
        assert!(events[0]["timestamp"].as_str().unwrap().starts_with("2024-01-01T00:00:00"));
    }

    #[tokio::test]
    async fn test_http_event_past_year_9999_is_rejected() {
        let t = test_app();
        send(&t.app, post_json("/api/events", file_event("2024-01-01T00:00:00Z"))).await;

        let tx = json!({"timestamp_ms": 400_000_000_000_000i64, "type": "http"});
        let (status, body) = send(&t.app, post_json("/api/http/events", tx)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST, "{body}");

        // Nothing unreadable was written, so delivery keeps working.
        let (status, batch) = send(&t.app, get("/api/events/any")).await;
        assert_eq!(status, StatusCode::OK, "{batch}");
        assert_eq!(batch.as_array().unwrap().len(), 1);
        let (status, _) = send(&t.app, get("/api/events/export")).await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_net_batch_fans_out() {
        let t = test_app();
        let batch = json!({"events": [
            {"timestamp": 1_704_067_200.5, "frame_number": 1, "protocol": "UDP", "src": "a", "dst": "b", "length": 60},
            {"timestamp": 1_704_067_201.0, "frame_number": 2, "protocol": "UDP", "src": "a", "dst": "b", "length": 60},
            {"timestamp": 1_704_067_202.0, "frame_number": 3, "protocol": "DNS", "src": "a", "dst": "b", "length": 80}
        ]});
        let (status, body) = send(&t.app, post_json("/api/net/events", batch)).await;
        assert_eq!(status, StatusCode::OK, "{body}");
        assert_eq!(body["stored"], 3);

        let (_, stats) = send(&t.app, get("/api/events/stats")).await;
        assert_eq!(stats["total_events"], 3);
    }

    #[tokio::test]
    async fn test_lease_and_ack() {
        let t = test_app();
        for day in 1..=3 {
            send(
                &t.app,
                post_json("/api/events", file_event(&format!("2024-01-0{day}T00:00:00Z"))),
            )
            .await;
        }

        let (status, leased) =
            send(&t.app, post_json("/api/events/lease?limit=2&visibilitySecs=60", json!({}))).await;
        assert_eq!(status, StatusCode::OK);
        let leased = leased.as_array().unwrap().clone();
        assert_eq!(leased.len(), 2);
        assert_eq!(leased[0]["deliveryState"], "leased");

        // Leased rows are invisible to a second lease.
        let (_, again) = send(&t.app, post_json("/api/events/lease?limit=5", json!({}))).await;
        assert_eq!(again.as_array().unwrap().len(), 1);

        let ids: Vec<i64> = leased.iter().map(|e| e["id"].as_i64().unwrap()).collect();
        let (status, ack) = send(&t.app, post_json("/api/events/ack", json!({"ids": ids}))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(ack["acknowledged"], 2);

        let (_, stats) = send(&t.app, get("/api/events/stats")).await;
        assert_eq!(stats["sent_events"], 2);
    }

    #[tokio::test]
    async fn test_session_window_events() {
        let t = test_app();
        let id = create_session(&t.app, "a.exe").await;
        send(
            &t.app,
            post_json(
                "/api/start-monitor",
                json!({"sessionId": id, "mode": 2, "processes": [5]}),
            ),
        )
        .await;

        let mut event = file_event(&chrono::Utc::now().to_rfc3339());
        event["data"]["metadata"] = json!({"sessionId": id});
        send(&t.app, post_json("/api/events", event)).await;
        send(&t.app, post_json("/api/events", file_event("2001-01-01T00:00:00Z"))).await;

        let (status, events) = send(&t.app, get(&format!("/api/sessions/{id}/events"))).await;
        assert_eq!(status, StatusCode::OK);
        let events = events.as_array().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0]["sessionId"], id);
    }
}
