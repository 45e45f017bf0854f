//! V4L2 device enumeration and capability query

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use v4l::capability::Flags;
use v4l::prelude::*;
use v4l::video::Capture;

use super::format::PixelFormat;
use super::source::SourceId;
use crate::error::{AppError, Result};

/// Information about a video device
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VideoDeviceInfo {
    /// Device path (e.g., /dev/video0)
    pub path: PathBuf,
    /// Index `N` of `/dev/videoN`
    pub index: Option<u32>,
    /// Card name
    pub card: String,
    pub driver: String,
    pub bus_info: String,
    pub video_capture: bool,
    pub streaming: bool,
    /// Formats offered by the driver
    pub formats: Vec<FormatInfo>,
}

impl VideoDeviceInfo {
    /// Identifier to capture this device with
    pub fn source_id(&self) -> SourceId {
        match self.index {
            Some(index) => SourceId::Device(index),
            None => SourceId::Path(self.path.clone()),
        }
    }
}

/// A pixel format offered by a device
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FormatInfo {
    pub fourcc: String,
    /// Description from driver
    pub description: String,
    /// Whether frames in this format can be decoded
    pub supported: bool,
}

/// Index of a `/dev/videoN` node
pub fn device_index(path: &Path) -> Option<u32> {
    path.file_name()?
        .to_str()?
        .strip_prefix("video")?
        .parse()
        .ok()
}

/// Query a single device node
pub fn query_device(path: &Path) -> Result<VideoDeviceInfo> {
    let device = Device::with_path(path)
        .map_err(|e| AppError::VideoError(format!("Failed to open device {:?}: {}", path, e)))?;
    let caps = device
        .query_caps()
        .map_err(|e| AppError::VideoError(format!("Failed to query capabilities: {}", e)))?;

    let formats = device
        .enum_formats()
        .map(|descs| {
            descs
                .into_iter()
                .map(|desc| FormatInfo {
                    fourcc: desc.fourcc.to_string(),
                    description: desc.description,
                    supported: PixelFormat::from_fourcc(desc.fourcc).is_some(),
                })
                .collect()
        })
        .unwrap_or_default();

    Ok(VideoDeviceInfo {
        path: path.to_path_buf(),
        index: device_index(path),
        card: caps.card,
        driver: caps.driver,
        bus_info: caps.bus,
        video_capture: caps.capabilities.contains(Flags::VIDEO_CAPTURE),
        streaming: caps.capabilities.contains(Flags::STREAMING),
        formats,
    })
}

/// Enumerate all video capture devices, ordered by index
pub fn enumerate_devices() -> Result<Vec<VideoDeviceInfo>> {
    info!("Enumerating video devices...");

    let mut devices = Vec::new();
    let entries = std::fs::read_dir("/dev")
        .map_err(|e| AppError::VideoError(format!("Failed to read /dev: {}", e)))?;

    for entry in entries.flatten() {
        let path = entry.path();
        if device_index(&path).is_none() {
            continue;
        }

        match query_device(&path) {
            Ok(info) if info.video_capture => {
                info!(
                    "Found capture device: {} ({}) - {} formats",
                    info.card,
                    info.driver,
                    info.formats.len()
                );
                devices.push(info);
            }
            Ok(_) => debug!("Skipping non-capture device: {:?}", path),
            Err(e) => debug!("{}", e),
        }
    }

    devices.sort_by_key(|d| d.index);
    info!("Found {} video capture devices", devices.len());
    Ok(devices)
}
