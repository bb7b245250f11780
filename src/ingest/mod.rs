//! Capture device discovery and frame acquisition.
//!
//! This module provides the frame source for the single webcam:
//! - Device discovery over a bounded index range (`/dev/video0..N`)
//! - Device configuration (resolution, target frame rate)
//! - Raw frame acquisition, normalized to RGB24
//!
//! Backends:
//! - V4L2 devices (feature: ingest-v4l2)
//! - Synthetic source for `stub://` device prefixes (testing, demos)
//!
//! A failed read never closes the device here. The session decides whether to
//! retry or to drop the handle and rescan.

#[cfg(feature = "ingest-v4l2")]
mod normalize;
pub mod synthetic;
#[cfg(feature = "ingest-v4l2")]
pub mod v4l2;

use anyhow::Result;

use crate::error::SourceError;
use crate::frame::{Frame, FRAME_HEIGHT, FRAME_WIDTH};

pub use synthetic::SyntheticProbe;
#[cfg(feature = "ingest-v4l2")]
pub use v4l2::V4l2Probe;

/// Number of device indices tried on every scan.
pub const DEFAULT_SCAN_LIMIT: u32 = 3;

/// Target capture rate requested from the device.
pub const DEFAULT_TARGET_FPS: u32 = 30;

/// Configuration shared by every capture backend.
#[derive(Clone, Debug)]
pub struct CaptureConfig {
    /// Device path prefix; the index is appended (e.g. "/dev/video" -> "/dev/video0").
    /// A `stub://` prefix selects the synthetic backend.
    pub device_prefix: String,
    /// Indices `0..scan_limit` are tried in order.
    pub scan_limit: u32,
    pub width: u32,
    pub height: u32,
    pub target_fps: u32,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            device_prefix: "/dev/video".to_string(),
            scan_limit: DEFAULT_SCAN_LIMIT,
            width: FRAME_WIDTH,
            height: FRAME_HEIGHT,
            target_fps: DEFAULT_TARGET_FPS,
        }
    }
}

impl CaptureConfig {
    pub fn device_path(&self, index: u32) -> String {
        format!("{}{}", self.device_prefix, index)
    }
}

/// An opened capture device.
pub trait CaptureDevice: Send {
    /// Read the next frame. Errors are transient from the device's point of view.
    fn read(&mut self) -> Result<Frame, SourceError>;

    /// Cheap liveness check; must not perform device I/O.
    fn is_open(&self) -> bool;

    /// Human-readable device name for logs.
    fn describe(&self) -> String;
}

/// Opens a capture device by index.
pub trait DeviceProbe: Send + Sync {
    fn open_index(&self, index: u32, config: &CaptureConfig) -> Result<Box<dyn CaptureDevice>>;
}

/// Exclusive handle to the one open capture device.
pub struct DeviceHandle {
    index: u32,
    device: Box<dyn CaptureDevice>,
}

impl DeviceHandle {
    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn is_open(&self) -> bool {
        self.device.is_open()
    }

    pub fn describe(&self) -> String {
        self.device.describe()
    }
}

impl std::fmt::Debug for DeviceHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceHandle")
            .field("index", &self.index)
            .field("device", &self.device.describe())
            .finish()
    }
}

/// Frame source for the single webcam.
pub struct FrameSource {
    probe: Box<dyn DeviceProbe>,
    config: CaptureConfig,
}

impl FrameSource {
    pub fn new(probe: Box<dyn DeviceProbe>, config: CaptureConfig) -> Self {
        Self { probe, config }
    }

    /// Select the backend from the configured device prefix.
    pub fn from_config(config: CaptureConfig) -> Result<Self> {
        let probe: Box<dyn DeviceProbe> = if config.device_prefix.starts_with("stub://") {
            Box::new(SyntheticProbe)
        } else {
            #[cfg(feature = "ingest-v4l2")]
            {
                Box::new(V4l2Probe)
            }
            #[cfg(not(feature = "ingest-v4l2"))]
            {
                anyhow::bail!(
                    "capture from {} requires the ingest-v4l2 feature",
                    config.device_prefix
                )
            }
        };
        Ok(Self::new(probe, config))
    }

    pub fn config(&self) -> &CaptureConfig {
        &self.config
    }

    /// Open the first device that responds, always scanning from index 0.
    pub fn open(&self) -> Result<DeviceHandle, SourceError> {
        for index in 0..self.config.scan_limit {
            match self.probe.open_index(index, &self.config) {
                Ok(device) => {
                    log::info!(
                        "FrameSource: camera initialized at index {} ({})",
                        index,
                        device.describe()
                    );
                    return Ok(DeviceHandle { index, device });
                }
                Err(err) => {
                    log::debug!("FrameSource: index {} unavailable: {:#}", index, err);
                }
            }
        }
        Err(SourceError::DeviceNotFound {
            scanned: self.config.scan_limit,
        })
    }

    /// Read one frame, conformed to the configured size.
    pub fn read(&self, handle: &mut DeviceHandle) -> Result<Frame, SourceError> {
        let frame = handle.device.read()?;
        frame
            .conform(self.config.width, self.config.height)
            .map_err(|err| SourceError::ReadFailure(format!("{err:#}")))
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
