//! Device Probe (C1): enumerate and probe local video-capture devices.
//!
//! The probe is pure I/O over the V4L2 ioctl surface. It holds no service-wide
//! state and must never keep a device open after returning.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};
use v4l2r::bindings::{v4l2_frmivalenum, v4l2_frmsizeenum};
use v4l2r::ioctl::{
    self, Capabilities, Capability as V4l2rCapability, FormatIterator, FrmIvalTypes, FrmSizeTypes,
};
use v4l2r::nix::errno::Errno;
use v4l2r::QueueType;

/// Error kinds surfaced by [`probe`] and [`exists`].
#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("device not found: {0}")]
    NotFound(String),
    #[error("access denied opening {0}")]
    AccessDenied(String),
    #[error("device busy: {0}")]
    Busy(String),
    #[error("malformed response from device: {0}")]
    MalformedResponse(String),
    #[error("probe timed out after {0:?}")]
    Timeout(Duration),
}

/// One supported pixel format and the resolutions/frame-rates it advertises.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FormatCapability {
    /// Four-character-code pixel format, e.g. "MJPG", "YUYV".
    pub format: String,
    pub resolutions: Vec<ResolutionCapability>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResolutionCapability {
    pub width: u32,
    pub height: u32,
    /// Frame rates supported at this resolution, descending.
    pub frame_rates: Vec<u32>,
}

/// Immutable snapshot of what a device advertises. Owned by the
/// [`crate::monitor::CameraMonitor`]'s `CameraDevice` entry; replaced
/// atomically on re-probe, never mutated in place.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CapabilityRecord {
    pub driver: String,
    pub card: String,
    pub bus_info: String,
    pub formats: Vec<FormatCapability>,
}

impl CapabilityRecord {
    /// The resolution/fps the monitor reports as "current" until a stream
    /// is actually opened: the first (highest-priority) format's largest
    /// resolution.
    pub fn default_resolution(&self) -> Option<(u32, u32)> {
        self.formats
            .first()
            .and_then(|f| f.resolutions.first())
            .map(|r| (r.width, r.height))
    }

    pub fn default_fps(&self) -> Option<u32> {
        self.formats
            .first()
            .and_then(|f| f.resolutions.first())
            .and_then(|r| r.frame_rates.first())
            .copied()
    }
}

/// Non-blocking filesystem + device-node check. Does not open the device.
pub fn exists(path: &Path) -> bool {
    path.exists()
}

/// Bounded-time probe of a single device path. Runs the blocking V4L2 ioctl
/// sequence on a dedicated thread so a wedged driver cannot hang the caller
/// past `timeout`; the thread itself is abandoned (not joined) on timeout,
/// matching the "never keep the device open" contract from the caller's
/// point of view.
pub fn probe(path: &Path, timeout: Duration) -> Result<CapabilityRecord, ProbeError> {
    if !exists(path) {
        return Err(ProbeError::NotFound(path.display().to_string()));
    }

    let path = path.to_path_buf();
    let (tx, rx) = mpsc::channel();

    std::thread::spawn(move || {
        let result = probe_blocking(&path);
        let _ = tx.send(result);
    });

    match rx.recv_timeout(timeout) {
        Ok(result) => result,
        Err(mpsc::RecvTimeoutError::Timeout) => Err(ProbeError::Timeout(timeout)),
        Err(mpsc::RecvTimeoutError::Disconnected) => Err(ProbeError::MalformedResponse(
            "probe thread exited without a result".to_string(),
        )),
    }
}

fn probe_blocking(path: &Path) -> Result<CapabilityRecord, ProbeError> {
    let file = std::fs::File::options()
        .read(true)
        .open(path)
        .map_err(|e| classify_open_error(path, &e))?;

    let caps: V4l2rCapability = ioctl::querycap(&file)
        .map_err(|e| ProbeError::MalformedResponse(format!("querycap failed: {e}")))?;
    let flags = caps.device_caps();
    let queue = if flags.contains(Capabilities::VIDEO_CAPTURE) {
        QueueType::VideoCapture
    } else if flags.contains(Capabilities::VIDEO_CAPTURE_MPLANE) {
        QueueType::VideoCaptureMplane
    } else {
        return Err(ProbeError::MalformedResponse(
            "device does not expose a capture queue".to_string(),
        ));
    };

    let mut formats = Vec::new();
    for desc in FormatIterator::new(&file, queue) {
        let format = fourcc_to_string(desc.pixelformat);
        let resolutions = enumerate_resolutions(&file, desc.pixelformat);
        formats.push(FormatCapability { format, resolutions });
    }
    formats.sort_by(|a, b| priority_of(&a.format).cmp(&priority_of(&b.format)).reverse());

    Ok(CapabilityRecord {
        driver: caps.driver,
        card: caps.card,
        bus_info: caps.bus_info,
        formats,
    })
}

fn enumerate_resolutions(
    file: &std::fs::File,
    fourcc: v4l2r::PixelFormat,
) -> Vec<ResolutionCapability> {
    let mut resolutions = Vec::new();
    let mut index = 0u32;
    loop {
        match ioctl::enum_frame_sizes::<v4l2_frmsizeenum>(file, index, fourcc) {
            Ok(size) => {
                if let Some(FrmSizeTypes::Discrete(d)) = size.size() {
                    let frame_rates = enumerate_fps(file, fourcc, d.width, d.height);
                    resolutions.push(ResolutionCapability {
                        width: d.width,
                        height: d.height,
                        frame_rates,
                    });
                }
                index += 1;
            }
            Err(e) => {
                if !matches!(e, ioctl::FrameSizeError::IoctlError(err) if err == Errno::EINVAL) {
                    debug!("enum_frame_sizes failed for {:?}: {}", fourcc, e);
                }
                break;
            }
        }
    }
    resolutions.sort_by(|a, b| (b.width * b.height).cmp(&(a.width * a.height)));
    resolutions.dedup_by(|a, b| a.width == b.width && a.height == b.height);
    resolutions
}

fn enumerate_fps(file: &std::fs::File, fourcc: v4l2r::PixelFormat, width: u32, height: u32) -> Vec<u32> {
    let mut rates = Vec::new();
    let mut index = 0u32;
    loop {
        match ioctl::enum_frame_intervals::<v4l2_frmivalenum>(file, index, fourcc, width, height) {
            Ok(interval) => {
                if let Some(FrmIvalTypes::Discrete(fraction)) = interval.intervals() {
                    if fraction.numerator > 0 {
                        rates.push(fraction.denominator / fraction.numerator);
                    }
                }
                index += 1;
            }
            Err(e) => {
                if !matches!(e, ioctl::FrameIntervalsError::IoctlError(err) if err == Errno::EINVAL) {
                    debug!(
                        "enum_frame_intervals failed for {:?} {}x{}: {}",
                        fourcc, width, height, e
                    );
                }
                break;
            }
        }
    }
    rates.sort_unstable_by(|a, b| b.cmp(a));
    rates.dedup();
    rates
}

fn classify_open_error(path: &Path, e: &std::io::Error) -> ProbeError {
    use std::io::ErrorKind;
    match e.kind() {
        ErrorKind::NotFound => ProbeError::NotFound(path.display().to_string()),
        ErrorKind::PermissionDenied => ProbeError::AccessDenied(path.display().to_string()),
        _ if e.raw_os_error() == Some(libc::EBUSY) => {
            ProbeError::Busy(path.display().to_string())
        }
        _ => ProbeError::MalformedResponse(format!("open {path:?} failed: {e}")),
    }
}

fn fourcc_to_string(fourcc: v4l2r::PixelFormat) -> String {
    let bytes: [u8; 4] = fourcc.into();
    String::from_utf8_lossy(&bytes).trim().to_string()
}

/// Stable ordering preference when picking the "current" format to report;
/// MJPEG and H.264 are favored because they are the formats the relay's
/// capture process consumes most cheaply.
fn priority_of(format: &str) -> u32 {
    match format {
        "MJPG" => 100,
        "H264" => 90,
        "YUYV" => 10,
        _ => 0,
    }
}

/// Derive the client-facing stable name from an OS device path, e.g.
/// `/dev/video0` → `camera0`. Deterministic and reversible for paths of the
/// conventional `/dev/videoN` shape; falls back to a sanitized copy of the
/// last path component for anything else.
pub fn stable_name(path: &Path) -> String {
    match path
        .file_name()
        .and_then(|n| n.to_str())
        .and_then(|n| n.strip_prefix("video"))
    {
        Some(n) if n.chars().all(|c| c.is_ascii_digit()) && !n.is_empty() => {
            format!("camera{n}")
        }
        _ => {
            let fallback = path
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or("unknown");
            warn!("device path {:?} does not match /dev/videoN; using fallback stable name", path);
            fallback.to_string()
        }
    }
}

/// Default candidate device paths for a configured device index range.
pub fn candidate_paths(start: u32, end: u32) -> Vec<PathBuf> {
    (start..=end)
        .map(|n| PathBuf::from(format!("/dev/video{n}")))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stable_name_from_conventional_path() {
        assert_eq!(stable_name(Path::new("/dev/video0")), "camera0");
        assert_eq!(stable_name(Path::new("/dev/video12")), "camera12");
    }

    #[test]
    fn stable_name_fallback_for_unconventional_path() {
        assert_eq!(stable_name(Path::new("/dev/weird")), "weird");
    }

    #[test]
    fn exists_false_for_missing_path() {
        assert!(!exists(Path::new("/dev/__definitely_not_a_real_device__")));
    }

    #[test]
    fn probe_missing_device_is_not_found() {
        let err = probe(
            Path::new("/dev/__definitely_not_a_real_device__"),
            Duration::from_millis(100),
        )
        .unwrap_err();
        assert!(matches!(err, ProbeError::NotFound(_)));
    }

    #[test]
    fn candidate_paths_covers_inclusive_range() {
        let paths = candidate_paths(0, 2);
        assert_eq!(
            paths,
            vec![
                PathBuf::from("/dev/video0"),
                PathBuf::from("/dev/video1"),
                PathBuf::from("/dev/video2"),
            ]
        );
    }

    #[test]
    fn default_resolution_picks_first_format() {
        let record = CapabilityRecord {
            driver: "uvcvideo".into(),
            card: "Test Cam".into(),
            bus_info: "usb-0000:00:14.0-1".into(),
            formats: vec![FormatCapability {
                format: "MJPG".into(),
                resolutions: vec![ResolutionCapability {
                    width: 1920,
                    height: 1080,
                    frame_rates: vec![30, 15],
                }],
            }],
        };
        assert_eq!(record.default_resolution(), Some((1920, 1080)));
        assert_eq!(record.default_fps(), Some(30));
    }
}
