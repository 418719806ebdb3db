//! Camera Monitor (C2): reconciles device-probe results into a live
//! connected-cameras map and fans transitions out through the notification
//! bus. Grounded on the same atomic-counter + status-enum + cooldown shape
//! used for hardware health tracking elsewhere in this codebase, generalized
//! from one device to a map of devices.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, SystemTime};

use serde::Serialize;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::device::{self, CapabilityRecord, ProbeError};
use crate::events::{Event, NotificationBus};

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum DeviceStatus {
    Connected,
    Disconnected,
    Error,
}

impl DeviceStatus {
    fn as_str(&self) -> &'static str {
        match self {
            DeviceStatus::Connected => "CONNECTED",
            DeviceStatus::Disconnected => "DISCONNECTED",
            DeviceStatus::Error => "ERROR",
        }
    }
}

/// Public identity + status of a candidate device. Exclusively owned and
/// mutated by [`CameraMonitor`]; everything else gets a defensive clone.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct CameraDevice {
    pub stable_name: String,
    pub path: PathBuf,
    pub status: DeviceStatus,
    pub name: String,
    pub resolution: Option<(u32, u32)>,
    pub fps: Option<u32>,
    pub capabilities: Option<CapabilityRecord>,
    #[serde(skip)]
    pub last_seen: SystemTime,
}

pub struct MonitorConfig {
    pub poll_interval: Duration,
    pub probe_timeout: Duration,
    /// Consecutive misses before a present device is declared DISCONNECTED.
    pub miss_threshold: u32,
    /// Consecutive probe failures before a present device is declared ERROR.
    pub error_threshold: u32,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(2),
            probe_timeout: Duration::from_secs(5),
            miss_threshold: 3,
            error_threshold: 3,
        }
    }
}

struct DeviceCounters {
    miss_count: AtomicU32,
    error_count: AtomicU32,
}

impl Default for DeviceCounters {
    fn default() -> Self {
        Self {
            miss_count: AtomicU32::new(0),
            error_count: AtomicU32::new(0),
        }
    }
}

/// Maintains `stableName → CameraDevice`. Construct with [`CameraMonitor::new`]
/// and drive with [`CameraMonitor::start`]; `stop()` drains the ticker.
pub struct CameraMonitor {
    candidates: Vec<PathBuf>,
    config: MonitorConfig,
    devices: Arc<RwLock<HashMap<String, CameraDevice>>>,
    counters: Arc<RwLock<HashMap<String, DeviceCounters>>>,
    bus: Arc<NotificationBus>,
    ready: Arc<AtomicBool>,
    task: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl CameraMonitor {
    pub fn new(candidates: Vec<PathBuf>, config: MonitorConfig, bus: Arc<NotificationBus>) -> Self {
        Self {
            candidates,
            config,
            devices: Arc::new(RwLock::new(HashMap::new())),
            counters: Arc::new(RwLock::new(HashMap::new())),
            bus,
            ready: Arc::new(AtomicBool::new(false)),
            task: std::sync::Mutex::new(None),
        }
    }

    /// Idempotent: spawns the reconciliation ticker if not already running,
    /// and blocks until the first full pass completes.
    pub async fn start(self: &Arc<Self>) {
        {
            let mut task = self.task.lock().unwrap();
            if task.is_some() {
                return;
            }
            let monitor = Arc::clone(self);
            *task = Some(tokio::spawn(async move {
                monitor.run().await;
            }));
        }
        self.reconcile_once().await;
    }

    /// Stops the ticker. In-flight probes are backed by `spawn_blocking` tasks
    /// that are abandoned, not awaited, matching the probe's own
    /// never-block-past-timeout contract.
    pub fn stop(&self) {
        if let Some(handle) = self.task.lock().unwrap().take() {
            handle.abort();
        }
    }

    async fn run(self: Arc<Self>) {
        let mut interval = tokio::time::interval(self.config.poll_interval);
        loop {
            interval.tick().await;
            self.reconcile_once().await;
        }
    }

    async fn reconcile_once(&self) {
        for path in self.candidates.clone() {
            self.reconcile_device(path).await;
        }
        self.ready.store(true, Ordering::SeqCst);
    }

    async fn reconcile_device(&self, path: PathBuf) {
        let stable_name = device::stable_name(&path);
        let probe_timeout = self.config.probe_timeout;

        let present = tokio::task::spawn_blocking(move || device::exists(&path))
            .await
            .unwrap_or(false);

        if !present {
            self.handle_absent(&stable_name);
            return;
        }

        self.reset_miss_count(&stable_name);

        let probe_path = self.candidate_path(&stable_name);
        let result =
            tokio::task::spawn_blocking(move || device::probe(&probe_path, probe_timeout)).await;

        match result {
            Ok(Ok(record)) => {
                self.reset_error_count(&stable_name);
                self.handle_probe_success(&stable_name, record);
            }
            Ok(Err(err)) => self.handle_probe_error(&stable_name, err),
            Err(join_err) => {
                warn!("probe task for {} panicked: {}", stable_name, join_err);
            }
        }
    }

    fn candidate_path(&self, stable_name: &str) -> PathBuf {
        self.candidates
            .iter()
            .find(|p| device::stable_name(p) == stable_name)
            .cloned()
            .unwrap_or_else(|| PathBuf::from(stable_name))
    }

    fn handle_absent(&self, stable_name: &str) {
        let miss_count = self.increment_miss_count(stable_name);
        if miss_count < self.config.miss_threshold {
            return;
        }
        let removed = self.devices.write().unwrap().remove(stable_name);
        if let Some(device) = removed {
            info!("camera {} disconnected", stable_name);
            self.bus.publish(Event::CameraStatusUpdate {
                device: stable_name.to_string(),
                status: DeviceStatus::Disconnected.as_str().to_string(),
                name: device.name,
                resolution: None,
                fps: None,
                streams: vec![],
            });
        }
    }

    /// Sets/refreshes `status=ERROR` for a candidate that exists but keeps
    /// failing to probe, whether or not it was ever successfully probed
    /// before. Below `error_threshold` this only bumps the counter.
    fn handle_probe_error(&self, stable_name: &str, err: ProbeError) {
        warn!("probe failed for {}: {}", stable_name, err);
        let error_count = self.increment_error_count(stable_name);
        if error_count < self.config.error_threshold {
            return;
        }

        let mut devices = self.devices.write().unwrap();
        let already_error = devices
            .get(stable_name)
            .map(|d| d.status == DeviceStatus::Error)
            .unwrap_or(false);
        if already_error {
            return;
        }

        let path = self.candidate_path(stable_name);
        devices
            .entry(stable_name.to_string())
            .and_modify(|d| d.status = DeviceStatus::Error)
            .or_insert_with(|| CameraDevice {
                stable_name: stable_name.to_string(),
                path,
                status: DeviceStatus::Error,
                name: stable_name.to_string(),
                resolution: None,
                fps: None,
                capabilities: None,
                last_seen: SystemTime::now(),
            });
        drop(devices);

        warn!("camera {} entered ERROR state", stable_name);
        self.bus.publish(Event::CameraStatusUpdate {
            device: stable_name.to_string(),
            status: DeviceStatus::Error.as_str().to_string(),
            name: stable_name.to_string(),
            resolution: None,
            fps: None,
            streams: vec![],
        });
    }

    /// Reconciles a successful probe into the map. Inserts a new entry for a
    /// device seen for the first time (CONNECTED); for a known device,
    /// refreshes capabilities and emits STATUS_CHANGED when they differ, or
    /// CONNECTED when recovering from ERROR.
    fn handle_probe_success(&self, stable_name: &str, record: CapabilityRecord) {
        let resolution = record.default_resolution();
        let fps = record.default_fps();
        let name = if record.card.is_empty() {
            stable_name.to_string()
        } else {
            record.card.clone()
        };

        let mut devices = self.devices.write().unwrap();
        let (status_label, emit) = match devices.get_mut(stable_name) {
            Some(existing) => {
                let recovering = existing.status == DeviceStatus::Error;
                let changed = existing.capabilities.as_ref() != Some(&record);
                existing.status = DeviceStatus::Connected;
                existing.name = name.clone();
                existing.resolution = resolution;
                existing.fps = fps;
                existing.capabilities = Some(record);
                existing.last_seen = SystemTime::now();

                if recovering {
                    (DeviceStatus::Connected.as_str(), true)
                } else if changed {
                    ("STATUS_CHANGED", true)
                } else {
                    ("", false)
                }
            }
            None => {
                let device = CameraDevice {
                    stable_name: stable_name.to_string(),
                    path: self.candidate_path(stable_name),
                    status: DeviceStatus::Connected,
                    name: name.clone(),
                    resolution,
                    fps,
                    capabilities: Some(record),
                    last_seen: SystemTime::now(),
                };
                devices.insert(stable_name.to_string(), device);
                (DeviceStatus::Connected.as_str(), true)
            }
        };
        drop(devices);

        if emit {
            info!("camera {} {}", stable_name, status_label.to_lowercase());
            self.bus.publish(Event::CameraStatusUpdate {
                device: stable_name.to_string(),
                status: status_label.to_string(),
                name,
                resolution,
                fps,
                streams: vec![],
            });
        }
    }

    fn increment_miss_count(&self, stable_name: &str) -> u32 {
        let counters = self.counters.read().unwrap();
        if let Some(c) = counters.get(stable_name) {
            return c.miss_count.fetch_add(1, Ordering::SeqCst) + 1;
        }
        drop(counters);
        self.counters
            .write()
            .unwrap()
            .entry(stable_name.to_string())
            .or_default();
        1
    }

    fn reset_miss_count(&self, stable_name: &str) {
        if let Some(c) = self.counters.read().unwrap().get(stable_name) {
            c.miss_count.store(0, Ordering::SeqCst);
        }
    }

    fn increment_error_count(&self, stable_name: &str) -> u32 {
        let counters = self.counters.read().unwrap();
        if let Some(c) = counters.get(stable_name) {
            return c.error_count.fetch_add(1, Ordering::SeqCst) + 1;
        }
        drop(counters);
        self.counters
            .write()
            .unwrap()
            .entry(stable_name.to_string())
            .or_default();
        1
    }

    fn reset_error_count(&self, stable_name: &str) {
        if let Some(c) = self.counters.read().unwrap().get(stable_name) {
            c.error_count.store(0, Ordering::SeqCst);
        }
    }

    /// Defensive snapshot; never exposes the live map.
    pub fn get_connected_cameras(&self) -> Vec<CameraDevice> {
        self.devices.read().unwrap().values().cloned().collect()
    }

    pub fn get_device(&self, name_or_path: &str) -> Option<CameraDevice> {
        let devices = self.devices.read().unwrap();
        if let Some(device) = devices.get(name_or_path) {
            return Some(device.clone());
        }
        devices
            .values()
            .find(|d| d.path.to_string_lossy() == name_or_path)
            .cloned()
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    /// Any component interested in device transitions (most notably the
    /// session manager, which must fail an active recording when its device
    /// disconnects) subscribes here rather than through a separate handler
    /// interface.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.bus.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn monitor() -> Arc<CameraMonitor> {
        Arc::new(CameraMonitor::new(
            vec![PathBuf::from("/dev/__no_such_camera_device__0")],
            MonitorConfig {
                poll_interval: Duration::from_millis(10),
                probe_timeout: Duration::from_millis(50),
                miss_threshold: 1,
                error_threshold: 1,
            },
            Arc::new(NotificationBus::new()),
        ))
    }

    #[tokio::test]
    async fn becomes_ready_after_first_pass() {
        let monitor = monitor();
        assert!(!monitor.is_ready());
        monitor.start().await;
        assert!(monitor.is_ready());
        monitor.stop();
    }

    #[tokio::test]
    async fn absent_candidate_never_appears_in_the_map() {
        let monitor = monitor();
        monitor.start().await;
        assert!(monitor.get_connected_cameras().is_empty());
        monitor.stop();
    }

    #[tokio::test]
    async fn stable_name_lookup_is_independent_of_raw_path() {
        let monitor = monitor();
        assert_eq!(monitor.get_device("camera0"), None);
    }

    #[tokio::test]
    async fn repeated_probe_failure_sets_error_status() {
        // A present-but-not-a-video-device path: `exists()` is true, but
        // `probe()`'s querycap ioctl fails, driving the error path without
        // ever reaching CONNECTED.
        let file = tempfile::NamedTempFile::new().unwrap();
        let stable_name = device::stable_name(file.path());
        let monitor = Arc::new(CameraMonitor::new(
            vec![file.path().to_path_buf()],
            MonitorConfig {
                poll_interval: Duration::from_millis(10),
                probe_timeout: Duration::from_millis(200),
                miss_threshold: 5,
                error_threshold: 2,
            },
            Arc::new(NotificationBus::new()),
        ));

        monitor.reconcile_once().await;
        assert!(monitor.get_device(&stable_name).is_none());

        monitor.reconcile_once().await;
        let device = monitor
            .get_device(&stable_name)
            .expect("device recorded once error_threshold is reached");
        assert_eq!(device.status, DeviceStatus::Error);
    }

    #[tokio::test]
    async fn error_device_recovers_to_connected_on_next_ok_probe() {
        let monitor = Arc::new(CameraMonitor::new(
            vec![],
            MonitorConfig::default(),
            Arc::new(NotificationBus::new()),
        ));
        monitor.devices.write().unwrap().insert(
            "camera0".to_string(),
            CameraDevice {
                stable_name: "camera0".to_string(),
                path: PathBuf::from("/dev/video0"),
                status: DeviceStatus::Error,
                name: "camera0".to_string(),
                resolution: None,
                fps: None,
                capabilities: None,
                last_seen: SystemTime::now(),
            },
        );

        let record = CapabilityRecord {
            driver: "uvcvideo".into(),
            card: "Test Cam".into(),
            bus_info: "usb-0000:00:14.0-1".into(),
            formats: vec![],
        };
        monitor.handle_probe_success("camera0", record);

        let device = monitor.get_device("camera0").unwrap();
        assert_eq!(device.status, DeviceStatus::Connected);
    }

    #[tokio::test]
    async fn capability_change_on_known_device_emits_status_changed() {
        let bus = Arc::new(NotificationBus::new());
        let monitor = Arc::new(CameraMonitor::new(vec![], MonitorConfig::default(), Arc::clone(&bus)));
        let mut rx = bus.subscribe();

        let first = CapabilityRecord {
            driver: "uvcvideo".into(),
            card: "Test Cam".into(),
            bus_info: "usb-0000:00:14.0-1".into(),
            formats: vec![],
        };
        monitor.handle_probe_success("camera0", first);
        assert!(matches!(rx.recv().await.unwrap(), Event::CameraStatusUpdate { status, .. } if status == "CONNECTED"));

        let changed = CapabilityRecord {
            driver: "uvcvideo".into(),
            card: "Test Cam v2".into(),
            bus_info: "usb-0000:00:14.0-1".into(),
            formats: vec![],
        };
        monitor.handle_probe_success("camera0", changed);
        assert!(matches!(rx.recv().await.unwrap(), Event::CameraStatusUpdate { status, .. } if status == "STATUS_CHANGED"));
    }
}
