//! Path/Stream Manager (C4): reifies "a relay path bound to a device for a
//! use case" on top of the Relay Client, with refcounting and request
//! coalescing so concurrent callers asking for the same binding get the
//! same path and only one underlying `paths_add`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::error::{AppError, Result};
use crate::relay::{PathConfig, RelayClient};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UseCase {
    Recording,
    Snapshot,
    Preview,
}

impl UseCase {
    fn path_suffix(self) -> &'static str {
        match self {
            UseCase::Recording => "record",
            UseCase::Snapshot => "snapshot",
            UseCase::Preview => "preview",
        }
    }
}

#[derive(Debug, Clone)]
pub struct PathBinding {
    pub path_name: String,
    pub device: String,
    pub use_case: UseCase,
}

struct Entry {
    binding: PathBinding,
    refcount: u32,
    linger_task: Option<JoinHandle<()>>,
}

pub struct PathStreamManager {
    relay: Arc<RelayClient>,
    capture_commands: HashMap<UseCase, String>,
    linger: Duration,
    entries: Mutex<HashMap<String, Entry>>,
}

impl PathStreamManager {
    pub fn new(relay: Arc<RelayClient>, capture_commands: HashMap<UseCase, String>, linger: Duration) -> Self {
        Self {
            relay,
            capture_commands,
            linger,
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn key(device: &str, use_case: UseCase) -> String {
        format!("{device}:{}", use_case.path_suffix())
    }

    /// Safe to call concurrently for the same (device, use_case): only the
    /// first caller issues `paths_add`; subsequent concurrent and later
    /// calls reuse the binding and bump the refcount.
    pub async fn ensure_path(self: &Arc<Self>, device: &str, use_case: UseCase) -> Result<PathBinding> {
        let key = Self::key(device, use_case);
        let mut entries = self.entries.lock().await;

        if let Some(entry) = entries.get_mut(&key) {
            if let Some(task) = entry.linger_task.take() {
                task.abort();
            }
            entry.refcount += 1;
            return Ok(entry.binding.clone());
        }

        let command = self
            .capture_commands
            .get(&use_case)
            .cloned()
            .ok_or_else(|| AppError::CameraCapabilityNotSupported(format!("{use_case:?}")))?;

        let path_name = key.clone();
        let path_config = PathConfig {
            name: path_name.clone(),
            source: "publisher".to_string(),
            run_on_demand: Some(command),
        };

        self.relay.paths_add(&path_config).await?;

        let binding = PathBinding {
            path_name: path_name.clone(),
            device: device.to_string(),
            use_case,
        };

        entries.insert(
            key,
            Entry {
                binding: binding.clone(),
                refcount: 1,
                linger_task: None,
            },
        );

        info!("programmed relay path {} for device {}", path_name, device);
        Ok(binding)
    }

    /// Decrements the refcount; at zero, arms a linger timer rather than
    /// deleting immediately, so a quick stop/start pair reuses the path.
    pub async fn release_path(self: &Arc<Self>, binding: &PathBinding) -> Result<()> {
        let key = Self::key(&binding.device, binding.use_case);
        let mut entries = self.entries.lock().await;

        let Some(entry) = entries.get_mut(&key) else {
            return Ok(());
        };

        entry.refcount = entry.refcount.saturating_sub(1);
        if entry.refcount > 0 {
            return Ok(());
        }

        let manager = Arc::clone(self);
        let linger = self.linger;
        let key_for_task = key.clone();
        entry.linger_task = Some(tokio::spawn(async move {
            tokio::time::sleep(linger).await;
            manager.expire_if_still_idle(&key_for_task).await;
        }));

        Ok(())
    }

    async fn expire_if_still_idle(&self, key: &str) {
        let binding = {
            let mut entries = self.entries.lock().await;
            match entries.get(key) {
                Some(entry) if entry.refcount == 0 => entries.remove(key).map(|e| e.binding),
                _ => None,
            }
        };

        if let Some(binding) = binding {
            if let Err(e) = self.relay.paths_delete(&binding.path_name).await {
                tracing::warn!("failed to delete lingering path {}: {}", binding.path_name, e);
            } else {
                debug!("deleted lingering relay path {}", binding.path_name);
            }
        }
    }

    pub async fn get_streams(&self) -> Result<Vec<crate::relay::RuntimePath>> {
        Ok(self.relay.paths_list().await?)
    }

    #[cfg(test)]
    async fn refcount(&self, device: &str, use_case: UseCase) -> u32 {
        self.entries
            .lock()
            .await
            .get(&Self::key(device, use_case))
            .map(|e| e.refcount)
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RelayConfig;

    fn manager() -> Arc<PathStreamManager> {
        let relay = Arc::new(RelayClient::new(&RelayConfig::default()).unwrap());
        let mut commands = HashMap::new();
        commands.insert(UseCase::Recording, "ffmpeg -i /dev/video0 out.mp4".to_string());
        Arc::new(PathStreamManager::new(relay, commands, Duration::from_millis(10)))
    }

    #[tokio::test]
    async fn unsupported_use_case_is_rejected_before_calling_the_relay() {
        let manager = manager();
        let err = manager.ensure_path("camera0", UseCase::Preview).await.unwrap_err();
        assert!(matches!(err, AppError::CameraCapabilityNotSupported(_)));
    }

    #[tokio::test]
    async fn release_without_a_prior_ensure_is_a_no_op() {
        let manager = manager();
        let binding = PathBinding {
            path_name: "camera0:record".to_string(),
            device: "camera0".to_string(),
            use_case: UseCase::Recording,
        };
        manager.release_path(&binding).await.unwrap();
    }
}
