use thiserror::Error;

use crate::auth::AuthError;
use crate::device::ProbeError;
use crate::relay::RelayError;

/// Crate-wide error type. The RPC dispatcher (see [`crate::rpc`]) is the
/// only place that translates an `AppError` into a JSON-RPC error object;
/// every other component just returns one.
#[derive(Error, Debug)]
pub enum AppError {
    #[error("device error: {0}")]
    Device(#[from] ProbeError),

    #[error("relay error: {0}")]
    Relay(#[from] RelayError),

    #[error("auth error: {0}")]
    Auth(#[from] AuthError),

    #[error("camera not found or disconnected: {0}")]
    CameraNotFoundOrDisconnected(String),

    #[error("camera is already recording: {0}")]
    CameraAlreadyRecording(String),

    #[error("recording already in progress: {0}")]
    RecordingAlreadyInProgress(String),

    #[error("camera does not support the requested capability: {0}")]
    CameraCapabilityNotSupported(String),

    #[error("storage space low")]
    StorageSpaceLow,

    #[error("storage space critical")]
    StorageSpaceCritical,

    #[error("insufficient storage space")]
    InsufficientStorageSpace,

    #[error("relay service unavailable")]
    RelayServiceUnavailable,

    #[error("not found: {0}")]
    NotFound(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("file is in use by an active recording: {0}")]
    InUse(String),

    #[error("invalid params: {0}")]
    InvalidParams(String),

    #[error("method not found: {0}")]
    MethodNotFound(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("parse error: {0}")]
    ParseError(String),

    #[error("authentication required")]
    AuthenticationRequired,

    #[error("insufficient permissions")]
    InsufficientPermissions,

    #[error("rate limit exceeded")]
    RateLimitExceeded,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, AppError>;
