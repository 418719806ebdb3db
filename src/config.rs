//! Validated, in-memory configuration record (§6.3). Loading YAML/env
//! overrides is outside the core's scope per the purpose statement, but a
//! thin loader is still provided so `main.rs` has something to call before
//! constructing the composition root.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub max_connections: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            max_connections: 256,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub base_url: String,
    pub connect_timeout_ms: u64,
    pub request_timeout_ms: u64,
    pub max_retry_attempts: u32,
    pub circuit_breaker_threshold: u32,
    pub circuit_breaker_open_ms: u64,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:9997".to_string(),
            connect_timeout_ms: 5_000,
            request_timeout_ms: 10_000,
            max_retry_attempts: 3,
            circuit_breaker_threshold: 5,
            circuit_breaker_open_ms: 30_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub recordings_dir: PathBuf,
    pub snapshots_dir: PathBuf,
    /// Percent used at which `storage_warning` notifications begin firing.
    pub warn_threshold_percent: f64,
    /// Percent used at which `start_recording` is refused outright.
    pub block_threshold_percent: f64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            recordings_dir: PathBuf::from("/var/lib/camera-gateway/recordings"),
            snapshots_dir: PathBuf::from("/var/lib/camera-gateway/snapshots"),
            warn_threshold_percent: 85.0,
            block_threshold_percent: 95.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CameraConfig {
    pub poll_interval_ms: u64,
    pub probe_timeout_ms: u64,
    /// Inclusive `/dev/videoN` range scanned as candidates.
    pub device_range_start: u32,
    pub device_range_end: u32,
    pub miss_threshold: u32,
    pub error_threshold: u32,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 2_000,
            probe_timeout_ms: 5_000,
            device_range_start: 0,
            device_range_end: 9,
            miss_threshold: 3,
            error_threshold: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionConfig {
    pub enabled: bool,
    pub max_age_hours: u64,
    pub sweep_interval_secs: u64,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            max_age_hours: 24 * 14,
            sweep_interval_secs: 3_600,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// HMAC signing key used to verify inbound JWTs. Never logged.
    pub jwt_signing_key: String,
    pub rate_limit_per_minute: u32,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            jwt_signing_key: String::new(),
            rate_limit_per_minute: 100,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub relay: RelayConfig,
    pub storage: StorageConfig,
    pub camera: CameraConfig,
    pub retention: RetentionConfig,
    pub auth: AuthConfig,
}

impl AppConfig {
    /// Reads a YAML config file from disk. Field-mapping only; no schema
    /// validation beyond what serde itself enforces (validation of the
    /// loaded record is the caller's responsibility, per §1).
    pub fn from_file(path: &std::path::Path) -> crate::error::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        serde_yaml::from_str(&contents)
            .map_err(|e| crate::error::AppError::Config(format!("failed to parse {path:?}: {e}")))
    }

    /// Applies `SERVICE_<SECTION>_<FIELD>` environment overrides, e.g.
    /// `SERVICE_SERVER_PORT` → `server.port`, per §6.3.
    pub fn merge_env(mut self) -> Self {
        if let Ok(v) = std::env::var("SERVICE_SERVER_HOST") {
            self.server.host = v;
        }
        if let Ok(v) = std::env::var("SERVICE_SERVER_PORT") {
            if let Ok(port) = v.parse() {
                self.server.port = port;
            }
        }
        if let Ok(v) = std::env::var("SERVICE_RELAY_BASE_URL") {
            self.relay.base_url = v;
        }
        if let Ok(v) = std::env::var("SERVICE_AUTH_JWT_SIGNING_KEY") {
            self.auth.jwt_signing_key = v;
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_internally_consistent() {
        let config = AppConfig::default();
        assert!(config.storage.warn_threshold_percent < config.storage.block_threshold_percent);
        assert!(config.camera.device_range_start <= config.camera.device_range_end);
    }

    #[test]
    fn env_override_wins_over_default() {
        std::env::set_var("SERVICE_SERVER_PORT", "9100");
        let config = AppConfig::default().merge_env();
        assert_eq!(config.server.port, 9100);
        std::env::remove_var("SERVICE_SERVER_PORT");
    }
}
