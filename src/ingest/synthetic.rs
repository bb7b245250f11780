//! Synthetic capture backend for `stub://` device prefixes.
//!
//! Produces a moving test pattern at the configured size, paced to the
//! configured frame rate like a real camera. Every index opens.

use anyhow::Result;
use std::time::{Duration, Instant};

use super::{CaptureConfig, CaptureDevice, DeviceProbe};
use crate::error::SourceError;
use crate::frame::Frame;

/// Probe that opens a synthetic device at any index.
#[derive(Clone, Copy, Debug, Default)]
pub struct SyntheticProbe;

impl DeviceProbe for SyntheticProbe {
    fn open_index(&self, index: u32, config: &CaptureConfig) -> Result<Box<dyn CaptureDevice>> {
        let device = SyntheticDevice::new(config.device_path(index), config);
        log::info!("SyntheticDevice: connected to {} (synthetic)", device.path);
        Ok(Box::new(device))
    }
}

pub struct SyntheticDevice {
    path: String,
    width: u32,
    height: u32,
    frame_interval: Option<Duration>,
    frame_count: u64,
    last_frame_at: Option<Instant>,
}

impl SyntheticDevice {
    fn new(path: String, config: &CaptureConfig) -> Self {
        let frame_interval = if config.target_fps == 0 {
            None
        } else {
            Some(Duration::from_secs(1) / config.target_fps)
        };
        Self {
            path,
            width: config.width,
            height: config.height,
            frame_interval,
            frame_count: 0,
            last_frame_at: None,
        }
    }

    fn pace(&mut self) {
        if let (Some(interval), Some(last)) = (self.frame_interval, self.last_frame_at) {
            let elapsed = last.elapsed();
            if elapsed < interval {
                std::thread::sleep(interval - elapsed);
            }
        }
        self.last_frame_at = Some(Instant::now());
    }

    fn generate_pixels(&self) -> Vec<u8> {
        let width = self.width as usize;
        let height = self.height as usize;
        let shift = self.frame_count as usize;
        let mut pixels = Vec::with_capacity(width * height * 3);
        for y in 0..height {
            for x in 0..width {
                pixels.push(((x + shift) % 256) as u8);
                pixels.push(((y + shift / 2) % 256) as u8);
                pixels.push(96);
            }
        }
        pixels
    }
}

impl CaptureDevice for SyntheticDevice {
    fn read(&mut self) -> Result<Frame, SourceError> {
        self.pace();
        self.frame_count += 1;
        Frame::new(self.generate_pixels(), self.width, self.height)
            .map_err(|err| SourceError::ReadFailure(err.to_string()))
    }

    fn is_open(&self) -> bool {
        true
    }

    fn describe(&self) -> String {
        format!("{} (synthetic)", self.path)
    }
}
