//! Notification Bus (C8): event taxonomy and lossy fan-out.
//!
//! Producers (the camera monitor, the session manager) publish [`Event`]s;
//! consumers (one per RPC connection) subscribe and receive a
//! `tokio::sync::broadcast` receiver. A slow subscriber that falls behind the
//! ring buffer gets `Lagged(n)` on its next `recv()` rather than blocking the
//! publisher — this is the bounded-per-subscriber-channel-with-drop-counter
//! behavior from the design, with the broadcast channel's own lag counter
//! standing in for a hand-rolled one (see DESIGN.md).

use serde::Serialize;
use tokio::sync::broadcast;

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Event kinds, matching the wire notifications in the external interface.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "method", content = "params")]
pub enum Event {
    #[serde(rename = "camera_status_update")]
    CameraStatusUpdate {
        device: String,
        status: String,
        name: String,
        resolution: Option<(u32, u32)>,
        fps: Option<u32>,
        streams: Vec<String>,
    },
    #[serde(rename = "recording_status_update")]
    RecordingStatusUpdate {
        device: String,
        session_id: String,
        status: String,
        filename: Option<String>,
        duration: Option<u64>,
    },
    #[serde(rename = "storage_warning")]
    StorageWarning {
        directory: String,
        used_percent: f64,
        level: StorageLevel,
    },
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StorageLevel {
    Warning,
    Critical,
}

impl Event {
    /// The JSON-RPC notification method name this event serializes as.
    pub fn method(&self) -> &'static str {
        match self {
            Event::CameraStatusUpdate { .. } => "camera_status_update",
            Event::RecordingStatusUpdate { .. } => "recording_status_update",
            Event::StorageWarning { .. } => "storage_warning",
        }
    }
}

pub struct NotificationBus {
    tx: broadcast::Sender<Event>,
}

impl NotificationBus {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { tx }
    }

    /// Non-blocking publish. If there are no subscribers this is a no-op;
    /// events are fire-and-forget, never buffered for future subscribers.
    pub fn publish(&self, event: Event) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for NotificationBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_reaches_subscriber() {
        let bus = NotificationBus::new();
        let mut rx = bus.subscribe();

        bus.publish(Event::CameraStatusUpdate {
            device: "camera0".into(),
            status: "CONNECTED".into(),
            name: "Test Cam".into(),
            resolution: Some((1920, 1080)),
            fps: Some(30),
            streams: vec![],
        });

        let event = rx.recv().await.unwrap();
        assert!(matches!(event, Event::CameraStatusUpdate { .. }));
    }

    #[tokio::test]
    async fn multiple_subscribers_each_get_the_event() {
        let bus = NotificationBus::new();
        let mut rx1 = bus.subscribe();
        let mut rx2 = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 2);

        bus.publish(Event::StorageWarning {
            directory: "/recordings".into(),
            used_percent: 91.0,
            level: StorageLevel::Warning,
        });

        assert!(matches!(rx1.recv().await.unwrap(), Event::StorageWarning { .. }));
        assert!(matches!(rx2.recv().await.unwrap(), Event::StorageWarning { .. }));
    }

    #[test]
    fn publish_without_subscribers_does_not_panic() {
        let bus = NotificationBus::new();
        assert_eq!(bus.subscriber_count(), 0);
        bus.publish(Event::RecordingStatusUpdate {
            device: "camera0".into(),
            session_id: "s1".into(),
            status: "STOPPED".into(),
            filename: Some("camera0_20260101T000000Z.mp4".into()),
            duration: Some(30),
        });
    }
}
