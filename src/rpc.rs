//! RPC Dispatcher (C7): WebSocket server hosting JSON-RPC 2.0.
//!
//! Wire envelopes are hand-rolled `serde` types (no JSON-RPC crate fit the
//! handful of shapes this needs). The per-connection reader loop follows the
//! same split-sender/split-receiver + `tokio::select!` shape used elsewhere
//! in this codebase for WebSocket fan-out, generalized from a tagged custom
//! protocol to full JSON-RPC request/response/notification envelopes.

use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::auth::Role;
use crate::error::AppError;
use crate::state::AppState;

const OUTBOUND_QUEUE_CAPACITY: usize = 256;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(untagged)]
pub enum Id {
    Number(i64),
    String(String),
}

#[derive(Debug, Deserialize)]
pub struct Request {
    pub jsonrpc: String,
    pub method: String,
    #[serde(default)]
    pub params: Value,
    pub id: Option<Id>,
}

#[derive(Debug, Serialize)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

#[derive(Debug, Serialize)]
pub struct Response {
    pub jsonrpc: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
    pub id: Option<Id>,
}

impl Response {
    fn ok(id: Option<Id>, result: Value) -> Self {
        Self { jsonrpc: "2.0", result: Some(result), error: None, id }
    }

    fn err(id: Option<Id>, code: i64, message: impl Into<String>) -> Self {
        Self {
            jsonrpc: "2.0",
            result: None,
            error: Some(RpcError { code, message: message.into(), data: None }),
            id,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct WireNotification {
    pub jsonrpc: &'static str,
    pub method: &'static str,
    pub params: Value,
}

/// Maps an `AppError` (and the component errors it wraps) onto the JSON-RPC
/// error codes in §6.2/§7. This is the single place that translation
/// happens — no other component constructs an error object.
fn map_error(id: Option<Id>, err: AppError) -> Response {
    use AppError::*;
    let (code, message): (i64, String) = match &err {
        AuthenticationRequired => (-32001, "Authentication required".to_string()),
        InsufficientPermissions => (-32002, "Insufficient permissions".to_string()),
        RateLimitExceeded => (-32003, "Rate limit exceeded".to_string()),
        CameraNotFoundOrDisconnected(d) => {
            (-32010, format!("Camera not found or disconnected: {d}"))
        }
        CameraAlreadyRecording(d) => (-32011, format!("Camera already recording: {d}")),
        RecordingAlreadyInProgress(d) => (-32012, format!("Recording already in progress: {d}")),
        CameraCapabilityNotSupported(c) => {
            (-32013, format!("Camera capability not supported: {c}"))
        }
        StorageSpaceLow => (-32020, "Storage space low".to_string()),
        StorageSpaceCritical => (-32021, "Storage space critical".to_string()),
        InsufficientStorageSpace => (-32022, "Insufficient storage space".to_string()),
        RelayServiceUnavailable | Relay(_) => {
            (-32030, "Relay service unavailable".to_string())
        }
        NotFound(f) => (-32602, format!("Not found: {f}")),
        PermissionDenied(f) => (-32602, format!("Permission denied: {f}")),
        InUse(f) => (-32602, format!("File is in use: {f}")),
        InvalidParams(m) => (-32602, m.clone()),
        MethodNotFound(m) => (-32601, format!("Method not found: {m}")),
        InvalidRequest(m) => (-32600, m.clone()),
        ParseError(m) => (-32700, m.clone()),
        Auth(_) => (-32001, "Authentication required".to_string()),
        _ => (-32603, "Internal error".to_string()),
    };
    Response::err(id, code, message)
}

/// Token-bucket rate limiter owned exclusively by one connection's reader
/// task — never shared, so it needs no internal locking beyond what keeps it
/// `Send` across awaits.
struct RateLimiter {
    limit_per_minute: u32,
    window_start: std::sync::Mutex<Instant>,
    count: AtomicU32,
}

impl RateLimiter {
    fn new(limit_per_minute: u32) -> Self {
        Self {
            limit_per_minute,
            window_start: std::sync::Mutex::new(Instant::now()),
            count: AtomicU32::new(0),
        }
    }

    fn check(&self) -> bool {
        let mut window_start = self.window_start.lock().unwrap();
        if window_start.elapsed() >= Duration::from_secs(60) {
            *window_start = Instant::now();
            self.count.store(0, Ordering::SeqCst);
        }
        self.count.fetch_add(1, Ordering::SeqCst) < self.limit_per_minute
    }
}

/// Per-connection state, owned by that connection's reader task for its
/// entire transport lifetime.
pub struct ClientConnection {
    pub id: String,
    pub authenticated: bool,
    pub role: Option<Role>,
    pub user_id: Option<String>,
    pub session_id: Option<String>,
    rate_limiter: RateLimiter,
}

impl ClientConnection {
    fn new(rate_limit_per_minute: u32) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            authenticated: false,
            role: None,
            user_id: None,
            session_id: None,
            rate_limiter: RateLimiter::new(rate_limit_per_minute),
        }
    }
}

static CONNECTION_COUNT: AtomicUsize = AtomicUsize::new(0);

pub async fn ws_handler(
    State(state): State<Arc<AppState>>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    if CONNECTION_COUNT.fetch_add(1, Ordering::SeqCst) >= state.config.server.max_connections {
        CONNECTION_COUNT.fetch_sub(1, Ordering::SeqCst);
        let _ = socket.close().await;
        return;
    }

    let mut conn = ClientConnection::new(state.config.auth.rate_limit_per_minute);
    info!("client {} connected", conn.id);

    let (mut sink, mut stream) = socket.split();
    let (outbound_tx, mut outbound_rx) = mpsc::channel::<Message>(OUTBOUND_QUEUE_CAPACITY);
    let mut events = state.bus.subscribe();

    let writer = tokio::spawn(async move {
        while let Some(msg) = outbound_rx.recv().await {
            if sink.send(msg).await.is_err() {
                break;
            }
        }
    });

    loop {
        tokio::select! {
            frame = stream.next() => {
                match frame {
                    Some(Ok(Message::Text(text))) => {
                        let response = handle_frame(&state, &mut conn, &text).await;
                        if let Some(response) = response {
                            let json = serde_json::to_string(&response).unwrap_or_default();
                            if outbound_tx.send(Message::Text(json)).await.is_err() {
                                break;
                            }
                        }
                    }
                    Some(Ok(Message::Binary(_))) => break,
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!("client {} websocket error: {}", conn.id, e);
                        break;
                    }
                }
            }
            event = events.recv() => {
                match event {
                    Ok(event) => {
                        let notification = WireNotification {
                            jsonrpc: "2.0",
                            method: event.method(),
                            params: serde_json::to_value(&event).unwrap_or(Value::Null),
                        };
                        let json = serde_json::to_string(&notification).unwrap_or_default();
                        let _ = outbound_tx.try_send(Message::Text(json));
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        warn!("client {} lagged {} notifications", conn.id, n);
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        }
    }

    writer.abort();
    CONNECTION_COUNT.fetch_sub(1, Ordering::SeqCst);
    info!("client {} disconnected", conn.id);
}

/// Parses, validates, rate-limits, authenticates, authorizes, and dispatches
/// one text frame, returning the response to send (or `None` for a binary
/// frame that should instead close the connection — handled by the caller).
async fn handle_frame(state: &Arc<AppState>, conn: &mut ClientConnection, text: &str) -> Option<Response> {
    let request: Request = match serde_json::from_str(text) {
        Ok(r) => r,
        Err(e) => return Some(Response::err(None, -32700, format!("Parse error: {e}"))),
    };

    Some(handle_request(state, conn, request).await)
}

pub async fn handle_request(state: &Arc<AppState>, conn: &mut ClientConnection, request: Request) -> Response {
    let id = request.id.clone();

    if request.jsonrpc != "2.0" || request.method.is_empty() {
        return Response::err(id, -32600, "Invalid Request");
    }

    if !conn.rate_limiter.check() {
        return Response::err(id, -32003, "Rate limit exceeded");
    }

    if request.method == "authenticate" {
        return handle_authenticate(state, conn, id, request.params).await;
    }

    // A connection that never called `authenticate` can still carry a valid
    // per-call `auth_token` in params (§4.7's stateless flow); only reject
    // once neither the connection nor the call itself resolves to a role.
    let role = effective_role(state, conn, &request.params);
    if !conn.authenticated && role.is_none() {
        return Response::err(id, -32001, "Authentication required");
    }

    if !is_known_method(&request.method) {
        return Response::err(id, -32601, format!("Method not found: {}", request.method));
    }

    let Some(role) = role else {
        return Response::err(id, -32001, "Authentication required");
    };

    if !state.auth.permits(role, &request.method) {
        return Response::err(id, -32002, "Insufficient permissions");
    }

    match dispatch(state, conn, &request.method, request.params, role).await {
        Ok(result) => Response::ok(id, result),
        Err(err) => map_error(id, err),
    }
}

/// Some methods accept a per-call `auth_token` in params instead of relying
/// on a prior `authenticate`, per §4.7's stateless-client allowance. When
/// present it is validated independently of the connection's own state.
fn effective_role(state: &Arc<AppState>, conn: &ClientConnection, params: &Value) -> Option<Role> {
    if let Some(token) = params.get("auth_token").and_then(Value::as_str) {
        return state.auth.validate_token(token).ok().map(|c| c.role);
    }
    conn.role
}

async fn handle_authenticate(
    state: &Arc<AppState>,
    conn: &mut ClientConnection,
    id: Option<Id>,
    params: Value,
) -> Response {
    let Some(token) = params.get("auth_token").and_then(Value::as_str) else {
        return Response::err(id, -32602, "Missing auth_token");
    };

    match state.auth.validate_token(token) {
        Ok(claims) => {
            conn.authenticated = true;
            conn.role = Some(claims.role);
            conn.user_id = Some(claims.user_id.clone());
            conn.session_id = Some(conn.id.clone());
            Response::ok(
                id,
                serde_json::json!({
                    "authenticated": true,
                    "role": role_name(claims.role),
                    "permissions": permissions_for(claims.role),
                    "session_id": conn.session_id,
                    "expires_at": claims.expires_at,
                }),
            )
        }
        Err(_) => Response::err(id, -32001, "Authentication required"),
    }
}

fn role_name(role: Role) -> &'static str {
    match role {
        Role::Viewer => "viewer",
        Role::Operator => "operator",
        Role::Admin => "admin",
    }
}

fn permissions_for(role: Role) -> Vec<&'static str> {
    match role {
        Role::Viewer => vec!["read"],
        Role::Operator => vec!["read", "record"],
        Role::Admin => vec!["read", "record", "manage"],
    }
}

fn is_known_method(method: &str) -> bool {
    matches!(
        method,
        "ping"
            | "get_camera_list"
            | "get_camera_status"
            | "get_streams"
            | "get_metrics"
            | "take_snapshot"
            | "start_recording"
            | "stop_recording"
            | "list_recordings"
            | "list_snapshots"
            | "get_recording_info"
            | "get_snapshot_info"
            | "delete_recording"
            | "delete_snapshot"
            | "get_status"
            | "get_server_info"
            | "set_retention_policy"
            | "cleanup_old_files"
            | "get_storage_info"
    )
}

async fn dispatch(
    state: &Arc<AppState>,
    _conn: &ClientConnection,
    method: &str,
    params: Value,
    role: Role,
) -> Result<Value, AppError> {
    match method {
        "ping" => Ok(Value::String("pong".to_string())),
        "get_camera_list" => Ok(get_camera_list(state)),
        "get_camera_status" => get_camera_status(state, &params),
        "get_streams" => get_streams(state).await,
        "get_metrics" => Ok(get_metrics(state).await),
        "take_snapshot" => take_snapshot(state, &params, role).await,
        "start_recording" => start_recording(state, &params, role).await,
        "stop_recording" => stop_recording(state, &params, role).await,
        "list_recordings" => list_recordings(state, &params).await,
        "list_snapshots" => list_snapshots(state, &params).await,
        "get_recording_info" => get_recording_info(state, &params).await,
        "get_snapshot_info" => get_snapshot_info(state, &params).await,
        "delete_recording" => delete_recording(state, &params, role).await,
        "delete_snapshot" => delete_snapshot(state, &params, role).await,
        "get_status" => Ok(get_status(state).await),
        "get_server_info" => Ok(get_server_info(state).await),
        "set_retention_policy" => set_retention_policy(state, &params, role).await,
        "cleanup_old_files" => cleanup_old_files(state, role).await,
        "get_storage_info" => get_storage_info(state, role).await,
        _ => Err(AppError::MethodNotFound(method.to_string())),
    }
}

fn required_str<'a>(params: &'a Value, field: &str) -> Result<&'a str, AppError> {
    params
        .get(field)
        .and_then(Value::as_str)
        .ok_or_else(|| AppError::InvalidParams(format!("missing required field: {field}")))
}

fn get_camera_list(state: &Arc<AppState>) -> Value {
    let cameras = state.monitor.get_connected_cameras();
    let connected = cameras.len();
    serde_json::json!({
        "cameras": cameras.iter().map(|c| serde_json::json!({
            "device": c.stable_name,
            "status": c.status,
            "name": c.name,
            "resolution": c.resolution,
            "fps": c.fps,
            "streams": Vec::<String>::new(),
        })).collect::<Vec<_>>(),
        "total": connected,
        "connected": connected,
    })
}

fn get_camera_status(state: &Arc<AppState>, params: &Value) -> Result<Value, AppError> {
    let device = required_str(params, "device")?;
    let camera = state
        .monitor
        .get_device(device)
        .ok_or_else(|| AppError::CameraNotFoundOrDisconnected(device.to_string()))?;
    Ok(serde_json::json!({
        "device": camera.stable_name,
        "status": camera.status,
        "name": camera.name,
        "resolution": camera.resolution,
        "fps": camera.fps,
        "streams": Vec::<String>::new(),
        "capabilities": camera.capabilities,
    }))
}

async fn get_streams(state: &Arc<AppState>) -> Result<Value, AppError> {
    let streams = state.paths.get_streams().await?;
    Ok(serde_json::to_value(streams)?)
}

async fn get_metrics(_state: &Arc<AppState>) -> Value {
    serde_json::json!({
        "cpu_usage": 0.0,
        "memory_usage": 0.0,
        "active_connections": CONNECTION_COUNT.load(Ordering::SeqCst),
        "total_requests": 0,
        "average_response_time": 0.0,
        "error_rate": 0.0,
    })
}

async fn take_snapshot(state: &Arc<AppState>, params: &Value, role: Role) -> Result<Value, AppError> {
    let device = required_str(params, "device")?;
    let opts = crate::session::SnapshotOptions {
        filename: params.get("filename").and_then(Value::as_str).map(String::from),
        quality: params.get("quality").and_then(Value::as_u64).map(|q| q as u8),
        format: params.get("format").and_then(Value::as_str).map(String::from),
    };
    let snapshot = state.sessions.take_snapshot(device, opts, role).await?;
    Ok(serde_json::json!({
        "device": snapshot.device,
        "filename": snapshot.filename,
        "status": snapshot.status,
        "timestamp": snapshot.timestamp.duration_since(std::time::UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0),
        "file_size": snapshot.file_size,
        "format": snapshot.format,
        "quality": snapshot.quality,
    }))
}

async fn start_recording(state: &Arc<AppState>, params: &Value, role: Role) -> Result<Value, AppError> {
    let device = required_str(params, "device")?;
    let opts = crate::session::StartRecordingOptions {
        duration_seconds: params
            .get("duration_seconds")
            .and_then(Value::as_u64)
            .or_else(|| params.get("max_duration").and_then(Value::as_u64)),
        format: params.get("format").and_then(Value::as_str).map(String::from),
        quality: params.get("quality").and_then(Value::as_u64).map(|q| q as u8),
    };
    let session = state.sessions.start_recording(device, opts, role).await?;
    Ok(serde_json::json!({
        "device": session.device,
        "filename": session.filename,
        "session_id": session.id,
        "start_time": session.start_time.duration_since(std::time::UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0),
        "format": session.format,
    }))
}

async fn stop_recording(state: &Arc<AppState>, params: &Value, role: Role) -> Result<Value, AppError> {
    let device = required_str(params, "device")?;
    let session = state.sessions.stop_recording(device, role).await?;
    let duration = session
        .end_time
        .and_then(|end| end.duration_since(session.start_time).ok())
        .map(|d| d.as_secs());
    Ok(serde_json::json!({
        "device": session.device,
        "session_id": session.id,
        "filename": session.filename,
        "start_time": session.start_time.duration_since(std::time::UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0),
        "end_time": session.end_time.and_then(|e| e.duration_since(std::time::UNIX_EPOCH).ok()).map(|d| d.as_secs()),
        "duration": duration,
        "format": session.format,
        "file_size": session.current_file_size,
    }))
}

fn pagination(params: &Value) -> (usize, usize) {
    let limit = params.get("limit").and_then(Value::as_u64).unwrap_or(50) as usize;
    let offset = params.get("offset").and_then(Value::as_u64).unwrap_or(0) as usize;
    (limit, offset)
}

async fn list_recordings(state: &Arc<AppState>, params: &Value) -> Result<Value, AppError> {
    let (limit, offset) = pagination(params);
    let (files, total) = state.sessions.list_recordings(limit, offset).await?;
    Ok(serde_json::json!({ "files": files, "total": total, "limit": limit, "offset": offset }))
}

async fn list_snapshots(state: &Arc<AppState>, params: &Value) -> Result<Value, AppError> {
    let (limit, offset) = pagination(params);
    let (files, total) = state.sessions.list_snapshots(limit, offset).await?;
    Ok(serde_json::json!({ "files": files, "total": total, "limit": limit, "offset": offset }))
}

async fn get_recording_info(state: &Arc<AppState>, params: &Value) -> Result<Value, AppError> {
    let filename = required_str(params, "filename")?;
    Ok(serde_json::to_value(state.sessions.get_recording_info(filename).await?)?)
}

async fn get_snapshot_info(state: &Arc<AppState>, params: &Value) -> Result<Value, AppError> {
    let filename = required_str(params, "filename")?;
    Ok(serde_json::to_value(state.sessions.get_snapshot_info(filename).await?)?)
}

async fn delete_recording(state: &Arc<AppState>, params: &Value, role: Role) -> Result<Value, AppError> {
    let filename = required_str(params, "filename")?;
    state.sessions.delete_recording(filename, role).await?;
    Ok(serde_json::json!({ "success": true }))
}

async fn delete_snapshot(state: &Arc<AppState>, params: &Value, role: Role) -> Result<Value, AppError> {
    let filename = required_str(params, "filename")?;
    state.sessions.delete_snapshot(filename, role).await?;
    Ok(serde_json::json!({ "success": true }))
}

async fn get_status(state: &Arc<AppState>) -> Value {
    let relay_ok = state.relay.health().await.is_ok();
    serde_json::json!({
        "status": if relay_ok { "ok" } else { "degraded" },
        "monitor_ready": state.monitor.is_ready(),
        "connected_cameras": state.monitor.get_connected_cameras().len(),
        "active_recordings": state.sessions.get_active_recordings().await.len(),
        "relay_reachable": relay_ok,
    })
}

async fn get_server_info(state: &Arc<AppState>) -> Value {
    serde_json::json!({
        "version": env!("CARGO_PKG_VERSION"),
        "max_connections": state.config.server.max_connections,
        "active_connections": CONNECTION_COUNT.load(Ordering::SeqCst),
        "relay_base_url": state.config.relay.base_url,
        "storage": {
            "warn_threshold_percent": state.config.storage.warn_threshold_percent,
            "block_threshold_percent": state.config.storage.block_threshold_percent,
        },
    })
}

async fn set_retention_policy(state: &Arc<AppState>, params: &Value, role: Role) -> Result<Value, AppError> {
    let enabled = params.get("enabled").and_then(Value::as_bool);
    let max_age_hours = params.get("max_age_hours").and_then(Value::as_u64);
    let retention = state.sessions.set_retention_policy(role, enabled, max_age_hours).await?;
    Ok(serde_json::json!({
        "enabled": retention.enabled,
        "max_age_hours": retention.max_age_hours,
        "sweep_interval_secs": retention.sweep_interval_secs,
    }))
}

async fn cleanup_old_files(state: &Arc<AppState>, role: Role) -> Result<Value, AppError> {
    let removed = state.sessions.cleanup_old_files(role).await?;
    Ok(serde_json::json!({ "removed": removed }))
}

async fn get_storage_info(state: &Arc<AppState>, role: Role) -> Result<Value, AppError> {
    let info = state.sessions.get_storage_info(role).await?;
    Ok(serde_json::to_value(info)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::AppState;

    fn connection() -> ClientConnection {
        ClientConnection::new(100)
    }

    #[tokio::test]
    async fn ping_requires_no_authentication() {
        let state = AppState::for_tests().await;
        let mut conn = connection();
        let request = Request {
            jsonrpc: "2.0".to_string(),
            method: "ping".to_string(),
            params: Value::Null,
            id: Some(Id::Number(1)),
        };
        let response = handle_request(&state, &mut conn, request).await;
        assert_eq!(response.result, Some(Value::String("pong".to_string())));
    }

    #[tokio::test]
    async fn unauthenticated_protected_call_is_rejected() {
        let state = AppState::for_tests().await;
        let mut conn = connection();
        let request = Request {
            jsonrpc: "2.0".to_string(),
            method: "start_recording".to_string(),
            params: serde_json::json!({"device": "camera0"}),
            id: Some(Id::Number(2)),
        };
        let response = handle_request(&state, &mut conn, request).await;
        assert_eq!(response.error.unwrap().code, -32001);
    }

    #[tokio::test]
    async fn unknown_method_is_method_not_found() {
        let state = AppState::for_tests().await;
        let mut conn = connection();
        conn.authenticated = true;
        conn.role = Some(Role::Admin);
        let request = Request {
            jsonrpc: "2.0".to_string(),
            method: "no_such_method".to_string(),
            params: Value::Null,
            id: Some(Id::Number(3)),
        };
        let response = handle_request(&state, &mut conn, request).await;
        assert_eq!(response.error.unwrap().code, -32601);
    }

    #[tokio::test]
    async fn viewer_cannot_start_recording() {
        let state = AppState::for_tests().await;
        let mut conn = connection();
        conn.authenticated = true;
        conn.role = Some(Role::Viewer);
        let request = Request {
            jsonrpc: "2.0".to_string(),
            method: "start_recording".to_string(),
            params: serde_json::json!({"device": "camera0"}),
            id: Some(Id::Number(4)),
        };
        let response = handle_request(&state, &mut conn, request).await;
        assert_eq!(response.error.unwrap().code, -32002);
    }

    #[tokio::test]
    async fn rate_limit_trips_after_configured_count() {
        let state = AppState::for_tests().await;
        let mut conn = ClientConnection::new(2);
        let make_ping = |id| Request {
            jsonrpc: "2.0".to_string(),
            method: "ping".to_string(),
            params: Value::Null,
            id: Some(Id::Number(id)),
        };

        let r1 = handle_request(&state, &mut conn, make_ping(1)).await;
        let r2 = handle_request(&state, &mut conn, make_ping(2)).await;
        let r3 = handle_request(&state, &mut conn, make_ping(3)).await;

        assert!(r1.result.is_some());
        assert!(r2.result.is_some());
        assert_eq!(r3.error.unwrap().code, -32003);
    }

    #[tokio::test]
    async fn invalid_envelope_is_invalid_request() {
        let state = AppState::for_tests().await;
        let mut conn = connection();
        let request = Request {
            jsonrpc: "1.0".to_string(),
            method: "ping".to_string(),
            params: Value::Null,
            id: Some(Id::Number(5)),
        };
        let response = handle_request(&state, &mut conn, request).await;
        assert_eq!(response.error.unwrap().code, -32600);
    }

    fn mint_token(role: &str) -> String {
        use jsonwebtoken::{encode, EncodingKey, Header};
        #[derive(serde::Serialize)]
        struct RawClaims {
            sub: String,
            role: String,
            exp: i64,
        }
        let claims = RawClaims {
            sub: "stateless-user".to_string(),
            role: role.to_string(),
            exp: 4_102_444_800,
        };
        encode(&Header::default(), &claims, &EncodingKey::from_secret(b"test-secret")).unwrap()
    }

    #[tokio::test]
    async fn stateless_auth_token_permits_call_without_prior_authenticate() {
        let state = AppState::for_tests().await;
        let mut conn = connection();
        let request = Request {
            jsonrpc: "2.0".to_string(),
            method: "get_camera_list".to_string(),
            params: serde_json::json!({"auth_token": mint_token("viewer")}),
            id: Some(Id::Number(6)),
        };
        let response = handle_request(&state, &mut conn, request).await;
        assert!(response.error.is_none());
        assert!(!conn.authenticated);
    }

    #[tokio::test]
    async fn stateless_auth_token_still_enforces_permissions() {
        let state = AppState::for_tests().await;
        let mut conn = connection();
        let request = Request {
            jsonrpc: "2.0".to_string(),
            method: "start_recording".to_string(),
            params: serde_json::json!({"device": "camera0", "auth_token": mint_token("viewer")}),
            id: Some(Id::Number(7)),
        };
        let response = handle_request(&state, &mut conn, request).await;
        assert_eq!(response.error.unwrap().code, -32002);
    }

    #[tokio::test]
    async fn admin_can_read_storage_info() {
        let state = AppState::for_tests().await;
        let mut conn = connection();
        conn.authenticated = true;
        conn.role = Some(Role::Admin);
        let request = Request {
            jsonrpc: "2.0".to_string(),
            method: "get_storage_info".to_string(),
            params: Value::Null,
            id: Some(Id::Number(8)),
        };
        let response = handle_request(&state, &mut conn, request).await;
        assert!(response.error.is_none());
    }

    #[tokio::test]
    async fn operator_cannot_set_retention_policy() {
        let state = AppState::for_tests().await;
        let mut conn = connection();
        conn.authenticated = true;
        conn.role = Some(Role::Operator);
        let request = Request {
            jsonrpc: "2.0".to_string(),
            method: "set_retention_policy".to_string(),
            params: serde_json::json!({"enabled": true}),
            id: Some(Id::Number(9)),
        };
        let response = handle_request(&state, &mut conn, request).await;
        assert_eq!(response.error.unwrap().code, -32002);
    }
}
