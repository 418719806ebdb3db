//! Composition root: wires the eight components together behind a single
//! `Arc<AppState>` shared by every WebSocket connection's handler.

use std::sync::Arc;

use crate::auth::Auth;
use crate::config::AppConfig;
use crate::device;
use crate::events::NotificationBus;
use crate::monitor::{CameraMonitor, MonitorConfig};
use crate::paths::{PathStreamManager, UseCase};
use crate::relay::RelayClient;
use crate::session::SessionManager;

pub struct AppState {
    pub config: AppConfig,
    pub bus: Arc<NotificationBus>,
    pub monitor: Arc<CameraMonitor>,
    pub relay: Arc<RelayClient>,
    pub paths: Arc<PathStreamManager>,
    pub sessions: Arc<SessionManager>,
    pub auth: Arc<Auth>,
}

impl AppState {
    /// Leaves-first construction: the notification bus has no dependencies,
    /// the camera monitor depends only on the bus, the relay client depends
    /// only on config, the path manager depends on the relay client, and the
    /// session manager depends on all three.
    pub fn new(config: AppConfig) -> crate::error::Result<Arc<Self>> {
        let bus = Arc::new(NotificationBus::new());

        let candidates = device::candidate_paths(config.camera.device_range_start, config.camera.device_range_end);
        let monitor_config = MonitorConfig {
            poll_interval: std::time::Duration::from_millis(config.camera.poll_interval_ms),
            probe_timeout: std::time::Duration::from_millis(config.camera.probe_timeout_ms),
            miss_threshold: config.camera.miss_threshold,
            error_threshold: config.camera.error_threshold,
        };
        let monitor = Arc::new(CameraMonitor::new(candidates, monitor_config, Arc::clone(&bus)));

        let relay = Arc::new(RelayClient::new(&config.relay)?);

        let mut capture_commands = std::collections::HashMap::new();
        capture_commands.insert(UseCase::Recording, "ffmpeg -f v4l2 -i $DEVICE -c copy -f mp4 $OUT".to_string());
        capture_commands.insert(UseCase::Snapshot, "ffmpeg -f v4l2 -i $DEVICE -frames:v 1 $OUT".to_string());
        let paths = Arc::new(PathStreamManager::new(
            Arc::clone(&relay),
            capture_commands,
            std::time::Duration::from_secs(30),
        ));

        let sessions = SessionManager::new(
            Arc::clone(&monitor),
            Arc::clone(&paths),
            Arc::clone(&bus),
            config.storage.clone(),
            config.retention.clone(),
        );

        let auth = Arc::new(Auth::new(&config.auth.jwt_signing_key));

        Ok(Arc::new(Self {
            config,
            bus,
            monitor,
            relay,
            paths,
            sessions,
            auth,
        }))
    }

    /// Starts the background tasks owned by each component (monitor polling,
    /// disconnect watcher, retention sweep). Call once after construction.
    pub async fn start(self: &Arc<Self>) {
        self.monitor.start().await;
        self.sessions.start();
    }

    pub fn stop(&self) {
        self.monitor.stop();
        self.sessions.stop();
    }

    #[cfg(test)]
    pub async fn for_tests() -> Arc<Self> {
        let mut config = AppConfig::default();
        config.auth.jwt_signing_key = "test-secret".to_string();
        config.storage.recordings_dir = std::env::temp_dir().join("camera-gateway-rpc-test-recordings");
        config.storage.snapshots_dir = std::env::temp_dir().join("camera-gateway-rpc-test-snapshots");
        config.retention.enabled = false;
        config.camera.device_range_start = 0;
        config.camera.device_range_end = 0;
        Self::new(config).expect("test AppState should construct")
    }
}
