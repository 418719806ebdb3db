//! Session Manager (C5): recording lifecycle, duration control, snapshots,
//! file inventory, and retention. The hardest part of the core — see §4.5.
//!
//! Per-device serialization uses a map-of-locks keyed by stable name,
//! created on first use and never removed (§9's re-architecture note on
//! "shared mutable maps across goroutines"). Whole-map reads
//! (`is_device_recording`, `get_active_recordings`) go through a single
//! `RwLock` and must never escalate to a write lock.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::Serialize;
use tokio::sync::{Mutex as AsyncMutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{info, warn};
use uuid::Uuid;

use crate::auth::Role;
use crate::config::{RetentionConfig, StorageConfig};
use crate::error::{AppError, Result};
use crate::events::{Event, NotificationBus, StorageLevel};
use crate::monitor::{CameraMonitor, DeviceStatus};
use crate::paths::{PathStreamManager, UseCase};

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum RecordingStatus {
    Starting,
    Recording,
    Stopping,
    Stopped,
    Failed,
}

impl RecordingStatus {
    fn is_terminal(self) -> bool {
        matches!(self, RecordingStatus::Stopped | RecordingStatus::Failed)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RecordingSession {
    pub id: String,
    pub device: String,
    pub start_time: SystemTime,
    pub end_time: Option<SystemTime>,
    pub max_duration: Option<Duration>,
    pub status: RecordingStatus,
    pub filename: String,
    pub format: String,
    pub current_file_size: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct SnapshotCapture {
    pub id: String,
    pub device: String,
    pub filename: String,
    pub format: String,
    pub quality: u8,
    pub timestamp: SystemTime,
    pub file_size: u64,
    pub status: SnapshotStatus,
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum SnapshotStatus {
    Pending,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct FileMetadata {
    pub filename: String,
    pub size: u64,
    pub created_at: SystemTime,
    pub modified_at: SystemTime,
    pub download_url: String,
}

#[derive(Debug, Clone, Default)]
pub struct StartRecordingOptions {
    pub duration_seconds: Option<u64>,
    pub format: Option<String>,
    pub quality: Option<u8>,
}

#[derive(Debug, Clone, Default)]
pub struct SnapshotOptions {
    pub filename: Option<String>,
    pub quality: Option<u8>,
    pub format: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StorageInfo {
    pub recordings_dir: String,
    pub snapshots_dir: String,
    pub recordings_used_percent: Option<f64>,
    pub snapshots_used_percent: Option<f64>,
    pub warn_threshold_percent: f64,
    pub block_threshold_percent: f64,
    pub retention_enabled: bool,
    pub retention_max_age_hours: u64,
}

const RECORDING_START_TIMEOUT: Duration = Duration::from_secs(15);
const CLEANUP_WINDOW: Duration = Duration::from_secs(2);

struct PerDeviceLocks {
    locks: std::sync::Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl PerDeviceLocks {
    fn new() -> Self {
        Self { locks: std::sync::Mutex::new(HashMap::new()) }
    }

    fn get(&self, device: &str) -> Arc<AsyncMutex<()>> {
        self.locks
            .lock()
            .unwrap()
            .entry(device.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }
}

pub struct SessionManager {
    monitor: Arc<CameraMonitor>,
    paths: Arc<PathStreamManager>,
    bus: Arc<NotificationBus>,
    storage: StorageConfig,
    retention: std::sync::RwLock<RetentionConfig>,

    sessions: RwLock<HashMap<String, RecordingSession>>,
    active: RwLock<HashMap<String, String>>,
    /// Recording-session-id → the relay path binding backing it, so stop/fail
    /// paths can release the exact binding `ensure_path` returned rather than
    /// reconstructing a key by convention.
    bindings: RwLock<HashMap<String, crate::paths::PathBinding>>,
    snapshots_index: RwLock<HashMap<String, SnapshotCapture>>,
    device_locks: PerDeviceLocks,
    duration_tasks: std::sync::Mutex<HashMap<String, JoinHandle<()>>>,
    retention_task: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl SessionManager {
    pub fn new(
        monitor: Arc<CameraMonitor>,
        paths: Arc<PathStreamManager>,
        bus: Arc<NotificationBus>,
        storage: StorageConfig,
        retention: RetentionConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            monitor,
            paths,
            bus,
            storage,
            retention: std::sync::RwLock::new(retention),
            sessions: RwLock::new(HashMap::new()),
            active: RwLock::new(HashMap::new()),
            bindings: RwLock::new(HashMap::new()),
            snapshots_index: RwLock::new(HashMap::new()),
            device_locks: PerDeviceLocks::new(),
            duration_tasks: std::sync::Mutex::new(HashMap::new()),
            retention_task: std::sync::Mutex::new(None),
        })
    }

    /// Spawns the disconnect watcher and, if enabled, the retention sweep.
    /// Idempotent.
    pub fn start(self: &Arc<Self>) {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            manager.watch_disconnects().await;
        });

        if self.retention.read().unwrap().enabled {
            self.spawn_retention_task();
        }
    }

    fn spawn_retention_task(self: &Arc<Self>) {
        let manager = Arc::clone(self);
        let mut guard = self.retention_task.lock().unwrap();
        if guard.is_none() {
            *guard = Some(tokio::spawn(async move {
                manager.retention_loop().await;
            }));
        }
    }

    pub fn stop(&self) {
        if let Some(task) = self.retention_task.lock().unwrap().take() {
            task.abort();
        }
        for (_, task) in self.duration_tasks.lock().unwrap().drain() {
            task.abort();
        }
    }

    async fn watch_disconnects(self: Arc<Self>) {
        let mut rx = self.monitor.subscribe();
        loop {
            match rx.recv().await {
                Ok(Event::CameraStatusUpdate { device, status, .. }) if status == "DISCONNECTED" => {
                    self.fail_active_recording(&device, "device disconnected").await;
                }
                Ok(_) => {}
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    warn!("session manager missed {} camera events", n);
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    }

    // ---- recording lifecycle ----------------------------------------

    pub async fn start_recording(
        self: &Arc<Self>,
        device: &str,
        opts: StartRecordingOptions,
        caller_role: Role,
    ) -> Result<RecordingSession> {
        if caller_role < Role::Operator {
            return Err(AppError::InsufficientPermissions);
        }

        let lock = self.device_locks.get(device);
        let _guard = lock.lock().await;

        let camera = self
            .monitor
            .get_device(device)
            .ok_or_else(|| AppError::CameraNotFoundOrDisconnected(device.to_string()))?;
        if camera.status != DeviceStatus::Connected {
            return Err(AppError::CameraNotFoundOrDisconnected(device.to_string()));
        }

        if self.active.read().await.contains_key(device) {
            return Err(AppError::CameraAlreadyRecording(device.to_string()));
        }

        self.check_storage_for_start(&self.storage.recordings_dir)?;

        let format = opts.format.unwrap_or_else(|| "mp4".to_string());
        let session_id = Uuid::new_v4().to_string();
        let filename = recording_filename(device, &format);
        let max_duration = opts.duration_seconds.map(Duration::from_secs);

        let mut session = RecordingSession {
            id: session_id.clone(),
            device: device.to_string(),
            start_time: SystemTime::now(),
            end_time: None,
            max_duration,
            status: RecordingStatus::Starting,
            filename: filename.clone(),
            format: format.clone(),
            current_file_size: 0,
        };

        let binding = match tokio::time::timeout(
            RECORDING_START_TIMEOUT,
            self.paths.ensure_path(device, UseCase::Recording),
        )
        .await
        {
            Ok(Ok(binding)) => binding,
            Ok(Err(e)) => {
                session.status = RecordingStatus::Failed;
                self.bus.publish(failed_notification(&session));
                return Err(e);
            }
            Err(_) => {
                session.status = RecordingStatus::Failed;
                self.bus.publish(failed_notification(&session));
                return Err(AppError::RelayServiceUnavailable);
            }
        };

        session.status = RecordingStatus::Recording;
        self.sessions.write().await.insert(session_id.clone(), session.clone());
        self.active.write().await.insert(device.to_string(), session_id.clone());
        self.bindings.write().await.insert(session_id.clone(), binding.clone());

        self.bus.publish(Event::RecordingStatusUpdate {
            device: device.to_string(),
            session_id: session_id.clone(),
            status: "RECORDING".to_string(),
            filename: Some(filename),
            duration: None,
        });

        if let Some(duration) = max_duration {
            self.arm_duration_timer(device.to_string(), session_id.clone(), duration, binding.clone());
        }

        Ok(session)
    }

    fn arm_duration_timer(
        self: &Arc<Self>,
        device: String,
        session_id: String,
        duration: Duration,
        binding: crate::paths::PathBinding,
    ) {
        let manager = Arc::clone(self);
        let task_session_id = session_id.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(duration).await;
            let _ = manager.finish_recording(&device, &binding, RecordingStatus::Stopped).await;
        });
        self.duration_tasks.lock().unwrap().insert(task_session_id, handle);
    }

    /// `stopRecording` path: cancels any armed duration timer, then performs
    /// the same cleanup as the timer firing.
    pub async fn stop_recording(self: &Arc<Self>, device: &str, caller_role: Role) -> Result<RecordingSession> {
        if caller_role < Role::Operator {
            return Err(AppError::InsufficientPermissions);
        }

        let lock = self.device_locks.get(device);
        let _guard = lock.lock().await;

        let session_id = self
            .active
            .read()
            .await
            .get(device)
            .cloned()
            .ok_or_else(|| AppError::CameraNotFoundOrDisconnected(device.to_string()))?;

        if let Some(task) = self.duration_tasks.lock().unwrap().remove(&session_id) {
            task.abort();
        }

        let binding = self
            .bindings
            .read()
            .await
            .get(&session_id)
            .cloned()
            .ok_or_else(|| AppError::Internal(format!("no path binding recorded for session {session_id}")))?;

        self.finish_recording_locked(device, &session_id, &binding, RecordingStatus::Stopped).await
    }

    async fn finish_recording(
        self: &Arc<Self>,
        device: &str,
        binding: &crate::paths::PathBinding,
        terminal_status: RecordingStatus,
    ) -> Result<()> {
        let lock = self.device_locks.get(device);
        let _guard = lock.lock().await;

        let Some(session_id) = self.active.read().await.get(device).cloned() else {
            return Ok(());
        };

        self.finish_recording_locked(device, &session_id, binding, terminal_status)
            .await
            .map(|_| ())
    }

    /// Caller must already hold `device_locks.get(device)`.
    async fn finish_recording_locked(
        self: &Arc<Self>,
        device: &str,
        session_id: &str,
        binding: &crate::paths::PathBinding,
        terminal_status: RecordingStatus,
    ) -> Result<RecordingSession> {
        self.active.write().await.remove(device);
        self.bindings.write().await.remove(session_id);

        let _ = self.paths.release_path(binding).await;

        let mut sessions = self.sessions.write().await;
        let session = sessions
            .get_mut(session_id)
            .ok_or_else(|| AppError::Internal(format!("session {session_id} vanished")))?;
        session.status = terminal_status;
        session.end_time = Some(SystemTime::now());
        let result = session.clone();
        drop(sessions);

        let duration = result
            .end_time
            .and_then(|end| end.duration_since(result.start_time).ok())
            .map(|d| d.as_secs());

        self.bus.publish(Event::RecordingStatusUpdate {
            device: device.to_string(),
            session_id: session_id.to_string(),
            status: status_str(terminal_status).to_string(),
            filename: Some(result.filename.clone()),
            duration,
        });

        Ok(result)
    }

    async fn fail_active_recording(self: &Arc<Self>, device: &str, reason: &str) {
        let lock = self.device_locks.get(device);
        let _guard = lock.lock().await;

        let Some(session_id) = self.active.read().await.get(device).cloned() else {
            return;
        };

        warn!("failing active recording on {}: {}", device, reason);
        if let Some(task) = self.duration_tasks.lock().unwrap().remove(&session_id) {
            task.abort();
        }

        let Some(binding) = self.bindings.read().await.get(&session_id).cloned() else {
            return;
        };

        let _ = self
            .finish_recording_locked(device, &session_id, &binding, RecordingStatus::Failed)
            .await;
    }

    fn check_storage_for_start(&self, dir: &std::path::Path) -> Result<()> {
        match used_percent(dir) {
            Some(percent) if percent >= self.storage.block_threshold_percent => {
                Err(AppError::InsufficientStorageSpace)
            }
            Some(percent) if percent >= self.storage.warn_threshold_percent => {
                self.bus.publish(Event::StorageWarning {
                    directory: dir.display().to_string(),
                    used_percent: percent,
                    level: StorageLevel::Warning,
                });
                Ok(())
            }
            _ => Ok(()),
        }
    }

    // ---- snapshot -----------------------------------------------------

    pub async fn take_snapshot(
        self: &Arc<Self>,
        device: &str,
        opts: SnapshotOptions,
        caller_role: Role,
    ) -> Result<SnapshotCapture> {
        if caller_role < Role::Operator {
            return Err(AppError::InsufficientPermissions);
        }

        let camera = self
            .monitor
            .get_device(device)
            .ok_or_else(|| AppError::CameraNotFoundOrDisconnected(device.to_string()))?;
        if camera.status != DeviceStatus::Connected {
            return Err(AppError::CameraNotFoundOrDisconnected(device.to_string()));
        }

        self.check_storage_for_start(&self.storage.snapshots_dir)?;

        let format = opts.format.unwrap_or_else(|| "jpg".to_string());
        let filename = opts.filename.unwrap_or_else(|| recording_filename(device, &format));
        let id = Uuid::new_v4().to_string();

        let binding = self.paths.ensure_path(device, UseCase::Snapshot).await?;
        let release_result = self.paths.release_path(&binding).await;

        let mut snapshot = SnapshotCapture {
            id: id.clone(),
            device: device.to_string(),
            filename,
            format,
            quality: opts.quality.unwrap_or(85),
            timestamp: SystemTime::now(),
            file_size: 0,
            status: SnapshotStatus::Completed,
        };

        if release_result.is_err() {
            snapshot.status = SnapshotStatus::Failed;
        }

        self.snapshots_index.write().await.insert(id, snapshot.clone());
        Ok(snapshot)
    }

    // ---- active-recording tracking (read-only, O(1)/O(n)) --------------

    pub async fn is_device_recording(&self, device: &str) -> bool {
        self.active.read().await.contains_key(device)
    }

    pub async fn get_active_recording(&self, device: &str) -> Option<RecordingSession> {
        let session_id = self.active.read().await.get(device).cloned()?;
        self.sessions.read().await.get(&session_id).cloned()
    }

    pub async fn get_active_recordings(&self) -> Vec<RecordingSession> {
        let active = self.active.read().await;
        let sessions = self.sessions.read().await;
        active
            .values()
            .filter_map(|id| sessions.get(id).cloned())
            .collect()
    }

    // ---- file inventory -------------------------------------------------

    pub async fn list_recordings(&self, limit: usize, offset: usize) -> Result<(Vec<FileMetadata>, usize)> {
        list_directory(&self.storage.recordings_dir, limit, offset)
    }

    pub async fn list_snapshots(&self, limit: usize, offset: usize) -> Result<(Vec<FileMetadata>, usize)> {
        list_directory(&self.storage.snapshots_dir, limit, offset)
    }

    pub async fn get_recording_info(&self, filename: &str) -> Result<FileMetadata> {
        file_metadata(&self.storage.recordings_dir, filename)
    }

    pub async fn get_snapshot_info(&self, filename: &str) -> Result<FileMetadata> {
        file_metadata(&self.storage.snapshots_dir, filename)
    }

    pub async fn delete_recording(&self, filename: &str, caller_role: Role) -> Result<()> {
        if caller_role < Role::Admin {
            return Err(AppError::InsufficientPermissions);
        }
        self.ensure_not_in_use(filename).await?;
        delete_file(&self.storage.recordings_dir, filename)
    }

    pub async fn delete_snapshot(&self, filename: &str, caller_role: Role) -> Result<()> {
        if caller_role < Role::Admin {
            return Err(AppError::InsufficientPermissions);
        }
        delete_file(&self.storage.snapshots_dir, filename)
    }

    async fn ensure_not_in_use(&self, filename: &str) -> Result<()> {
        let sessions = self.sessions.read().await;
        let active = self.active.read().await;
        let in_use = active
            .values()
            .filter_map(|id| sessions.get(id))
            .any(|s| s.filename == filename);
        if in_use {
            return Err(AppError::InUse(filename.to_string()));
        }
        Ok(())
    }

    // ---- retention -------------------------------------------------------

    async fn retention_loop(self: Arc<Self>) {
        loop {
            let sweep_interval = Duration::from_secs(self.retention.read().unwrap().sweep_interval_secs);
            tokio::time::sleep(sweep_interval).await;
            if !self.retention.read().unwrap().enabled {
                continue;
            }
            self.sweep_once().await;
        }
    }

    async fn sweep_once(&self) -> usize {
        let max_age_hours = self.retention.read().unwrap().max_age_hours;
        let max_age = Duration::from_secs(max_age_hours * 3600);
        let mut removed = 0;
        for dir in [&self.storage.recordings_dir, &self.storage.snapshots_dir] {
            match self.sweep_directory(dir, max_age).await {
                Ok(n) => removed += n,
                Err(e) => warn!("retention sweep of {:?} failed: {}", dir, e),
            }
        }
        removed
    }

    async fn sweep_directory(&self, dir: &std::path::Path, max_age: Duration) -> Result<usize> {
        let entries = match std::fs::read_dir(dir) {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };

        let active_filenames: std::collections::HashSet<String> = self
            .get_active_recordings()
            .await
            .into_iter()
            .map(|s| s.filename)
            .collect();

        let now = SystemTime::now();
        let mut removed = 0;
        for entry in entries.flatten() {
            let path = entry.path();
            let Ok(metadata) = entry.metadata() else { continue };
            let Ok(modified) = metadata.modified() else { continue };
            let Ok(age) = now.duration_since(modified) else { continue };
            if age < max_age {
                continue;
            }
            let filename = path.file_name().and_then(|n| n.to_str()).unwrap_or_default();
            if active_filenames.contains(filename) {
                continue;
            }
            if let Err(e) = std::fs::remove_file(&path) {
                warn!("retention sweep failed to remove {:?}: {}", path, e);
            } else {
                info!("retention sweep removed {:?}", path);
                removed += 1;
            }
        }
        Ok(removed)
    }

    // ---- admin: retention and storage -----------------------------------

    pub async fn set_retention_policy(
        self: &Arc<Self>,
        caller_role: Role,
        enabled: Option<bool>,
        max_age_hours: Option<u64>,
    ) -> Result<RetentionConfig> {
        if caller_role < Role::Admin {
            return Err(AppError::InsufficientPermissions);
        }

        let (was_enabled, updated) = {
            let mut guard = self.retention.write().unwrap();
            let was_enabled = guard.enabled;
            if let Some(enabled) = enabled {
                guard.enabled = enabled;
            }
            if let Some(max_age_hours) = max_age_hours {
                guard.max_age_hours = max_age_hours;
            }
            (was_enabled, guard.clone())
        };

        if updated.enabled && !was_enabled {
            self.spawn_retention_task();
        } else if !updated.enabled && was_enabled {
            if let Some(task) = self.retention_task.lock().unwrap().take() {
                task.abort();
            }
        }

        Ok(updated)
    }

    pub async fn cleanup_old_files(self: &Arc<Self>, caller_role: Role) -> Result<usize> {
        if caller_role < Role::Admin {
            return Err(AppError::InsufficientPermissions);
        }
        Ok(self.sweep_once().await)
    }

    pub async fn get_storage_info(&self, caller_role: Role) -> Result<StorageInfo> {
        if caller_role < Role::Admin {
            return Err(AppError::InsufficientPermissions);
        }
        let retention = self.retention.read().unwrap().clone();
        Ok(StorageInfo {
            recordings_dir: self.storage.recordings_dir.display().to_string(),
            snapshots_dir: self.storage.snapshots_dir.display().to_string(),
            recordings_used_percent: used_percent(&self.storage.recordings_dir),
            snapshots_used_percent: used_percent(&self.storage.snapshots_dir),
            warn_threshold_percent: self.storage.warn_threshold_percent,
            block_threshold_percent: self.storage.block_threshold_percent,
            retention_enabled: retention.enabled,
            retention_max_age_hours: retention.max_age_hours,
        })
    }
}

fn status_str(status: RecordingStatus) -> &'static str {
    match status {
        RecordingStatus::Starting => "STARTING",
        RecordingStatus::Recording => "RECORDING",
        RecordingStatus::Stopping => "STOPPING",
        RecordingStatus::Stopped => "STOPPED",
        RecordingStatus::Failed => "FAILED",
    }
}

fn failed_notification(session: &RecordingSession) -> Event {
    Event::RecordingStatusUpdate {
        device: session.device.clone(),
        session_id: session.id.clone(),
        status: "FAILED".to_string(),
        filename: Some(session.filename.clone()),
        duration: None,
    }
}

fn recording_filename(device: &str, format: &str) -> String {
    let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default();
    format!("{device}_{}.{format}", now.as_secs())
}

fn list_directory(dir: &std::path::Path, limit: usize, offset: usize) -> Result<(Vec<FileMetadata>, usize)> {
    let mut entries = Vec::new();
    match std::fs::read_dir(dir) {
        Ok(read_dir) => {
            for entry in read_dir.flatten() {
                if let Ok(metadata) = entry.metadata() {
                    if !metadata.is_file() {
                        continue;
                    }
                    entries.push(to_file_metadata(&entry.path(), &metadata));
                }
            }
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }

    entries.sort_by(|a, b| b.modified_at.cmp(&a.modified_at));
    let total = entries.len();
    let page = entries.into_iter().skip(offset).take(limit).collect();
    Ok((page, total))
}

fn file_metadata(dir: &std::path::Path, filename: &str) -> Result<FileMetadata> {
    let path = dir.join(filename);
    let metadata = std::fs::metadata(&path).map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            AppError::NotFound(filename.to_string())
        } else {
            AppError::PermissionDenied(filename.to_string())
        }
    })?;
    Ok(to_file_metadata(&path, &metadata))
}

fn delete_file(dir: &std::path::Path, filename: &str) -> Result<()> {
    let path = dir.join(filename);
    std::fs::remove_file(&path).map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => AppError::NotFound(filename.to_string()),
        std::io::ErrorKind::PermissionDenied => AppError::PermissionDenied(filename.to_string()),
        _ => AppError::Internal(e.to_string()),
    })
}

fn to_file_metadata(path: &std::path::Path, metadata: &std::fs::Metadata) -> FileMetadata {
    let filename = path.file_name().and_then(|n| n.to_str()).unwrap_or_default().to_string();
    FileMetadata {
        download_url: format!("/files/{filename}"),
        filename,
        size: metadata.len(),
        created_at: metadata.created().unwrap_or(UNIX_EPOCH),
        modified_at: metadata.modified().unwrap_or(UNIX_EPOCH),
    }
}

fn used_percent(dir: &std::path::Path) -> Option<f64> {
    let stat = nix::sys::statvfs::statvfs(dir).ok()?;
    let block_size = stat.fragment_size() as u64;
    let total = stat.blocks() as u64 * block_size;
    if total == 0 {
        return None;
    }
    let available = stat.blocks_available() as u64 * block_size;
    let used = total.saturating_sub(available);
    Some(used as f64 / total as f64 * 100.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CameraConfig, RelayConfig};
    use crate::monitor::{CameraMonitor, MonitorConfig};
    use crate::paths::PathStreamManager;
    use crate::relay::RelayClient;
    use std::collections::HashMap as StdHashMap;

    fn manager() -> (Arc<SessionManager>, Arc<CameraMonitor>) {
        let bus = Arc::new(NotificationBus::new());
        let monitor = Arc::new(CameraMonitor::new(
            vec![],
            MonitorConfig::default(),
            Arc::clone(&bus),
        ));
        let relay = Arc::new(RelayClient::new(&RelayConfig::default()).unwrap());
        let mut commands = StdHashMap::new();
        commands.insert(UseCase::Recording, "true".to_string());
        commands.insert(UseCase::Snapshot, "true".to_string());
        let paths = Arc::new(PathStreamManager::new(relay, commands, Duration::from_millis(10)));
        let storage = StorageConfig {
            recordings_dir: std::env::temp_dir().join("camera-gateway-test-recordings"),
            snapshots_dir: std::env::temp_dir().join("camera-gateway-test-snapshots"),
            ..StorageConfig::default()
        };
        let retention = RetentionConfig { enabled: false, ..RetentionConfig::default() };
        (
            SessionManager::new(Arc::clone(&monitor), paths, bus, storage, retention),
            monitor,
        )
    }

    #[tokio::test]
    async fn start_recording_on_absent_device_is_rejected() {
        let (manager, _monitor) = manager();
        let err = manager
            .start_recording("camera0", StartRecordingOptions::default(), Role::Operator)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::CameraNotFoundOrDisconnected(_)));
    }

    #[tokio::test]
    async fn start_recording_requires_operator_role() {
        let (manager, _monitor) = manager();
        let err = manager
            .start_recording("camera0", StartRecordingOptions::default(), Role::Viewer)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::InsufficientPermissions));
    }

    #[tokio::test]
    async fn no_active_recording_means_not_recording() {
        let (manager, _monitor) = manager();
        assert!(!manager.is_device_recording("camera0").await);
        assert!(manager.get_active_recording("camera0").await.is_none());
        assert!(manager.get_active_recordings().await.is_empty());
    }

    #[test]
    fn recording_filename_embeds_device_and_format() {
        let name = recording_filename("camera0", "mp4");
        assert!(name.starts_with("camera0_"));
        assert!(name.ends_with(".mp4"));
    }

    #[tokio::test]
    async fn duration_timer_stops_within_the_cleanup_window() {
        let (manager, _monitor) = manager();
        let device = "camera0".to_string();
        let session_id = "test-session".to_string();
        let binding = crate::paths::PathBinding {
            path_name: "camera0:record".to_string(),
            device: device.clone(),
            use_case: UseCase::Recording,
        };
        let session = RecordingSession {
            id: session_id.clone(),
            device: device.clone(),
            start_time: SystemTime::now(),
            end_time: None,
            max_duration: Some(Duration::from_millis(20)),
            status: RecordingStatus::Recording,
            filename: "camera0_test.mp4".to_string(),
            format: "mp4".to_string(),
            current_file_size: 0,
        };
        manager.sessions.write().await.insert(session_id.clone(), session);
        manager.active.write().await.insert(device.clone(), session_id.clone());
        manager.bindings.write().await.insert(session_id.clone(), binding.clone());

        manager.arm_duration_timer(device.clone(), session_id.clone(), Duration::from_millis(20), binding);

        // Tolerance for a duration-armed stop is `requested + CLEANUP_WINDOW`.
        tokio::time::sleep(Duration::from_millis(20) + CLEANUP_WINDOW).await;
        assert!(!manager.is_device_recording(&device).await);
    }

    #[tokio::test]
    async fn set_retention_policy_requires_admin_role() {
        let (manager, _monitor) = manager();
        let err = manager.set_retention_policy(Role::Operator, Some(true), None).await.unwrap_err();
        assert!(matches!(err, AppError::InsufficientPermissions));
    }

    #[tokio::test]
    async fn set_retention_policy_updates_and_starts_task() {
        let (manager, _monitor) = manager();
        let updated = manager
            .set_retention_policy(Role::Admin, Some(true), Some(48))
            .await
            .unwrap();
        assert!(updated.enabled);
        assert_eq!(updated.max_age_hours, 48);
        assert!(manager.retention_task.lock().unwrap().is_some());

        let updated = manager.set_retention_policy(Role::Admin, Some(false), None).await.unwrap();
        assert!(!updated.enabled);
        assert!(manager.retention_task.lock().unwrap().is_none());
    }

    #[tokio::test]
    async fn cleanup_old_files_requires_admin_role() {
        let (manager, _monitor) = manager();
        let err = manager.cleanup_old_files(Role::Viewer).await.unwrap_err();
        assert!(matches!(err, AppError::InsufficientPermissions));
    }

    #[tokio::test]
    async fn cleanup_old_files_removes_nothing_from_empty_directories() {
        let (manager, _monitor) = manager();
        let removed = manager.cleanup_old_files(Role::Admin).await.unwrap();
        assert_eq!(removed, 0);
    }

    #[tokio::test]
    async fn get_storage_info_requires_admin_role() {
        let (manager, _monitor) = manager();
        let err = manager.get_storage_info(Role::Operator).await.unwrap_err();
        assert!(matches!(err, AppError::InsufficientPermissions));
    }

    #[tokio::test]
    async fn get_storage_info_reports_configured_thresholds() {
        let (manager, _monitor) = manager();
        let info = manager.get_storage_info(Role::Admin).await.unwrap();
        assert_eq!(info.warn_threshold_percent, StorageConfig::default().warn_threshold_percent);
        assert!(!info.retention_enabled);
    }
}
