use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::encode::DEFAULT_JPEG_QUALITY;
use crate::ingest::{CaptureConfig, DEFAULT_SCAN_LIMIT, DEFAULT_TARGET_FPS};
use crate::record::DEFAULT_RECORDING_FPS;
use crate::session::SessionConfig;

const DEFAULT_API_ADDR: &str = "0.0.0.0:5000";
const DEFAULT_RECORDINGS_DIR: &str = "recordings";
const DEFAULT_DEVICE_PREFIX: &str = "/dev/video";
const DEFAULT_FFMPEG_PROGRAM: &str = "ffmpeg";
const DEFAULT_WIDTH: u32 = crate::frame::FRAME_WIDTH;
const DEFAULT_HEIGHT: u32 = crate::frame::FRAME_HEIGHT;
const DEFAULT_OPEN_BACKOFF_MS: u64 = 1000;
const DEFAULT_READ_BACKOFF_MS: u64 = 100;
const DEFAULT_MAX_READ_FAILURES: u32 = 30;

#[derive(Debug, Deserialize, Default)]
struct CamgateConfigFile {
    api: Option<ApiConfigFile>,
    recordings_dir: Option<PathBuf>,
    camera: Option<CameraConfigFile>,
    recording: Option<RecordingConfigFile>,
    retry: Option<RetryConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct ApiConfigFile {
    addr: Option<String>,
    remote_host: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct CameraConfigFile {
    device: Option<String>,
    scan_limit: Option<u32>,
    width: Option<u32>,
    height: Option<u32>,
    target_fps: Option<u32>,
    jpeg_quality: Option<u8>,
}

#[derive(Debug, Deserialize, Default)]
struct RecordingConfigFile {
    fps: Option<u32>,
    ffmpeg: Option<PathBuf>,
}

#[derive(Debug, Deserialize, Default)]
struct RetryConfigFile {
    open_backoff_ms: Option<u64>,
    read_backoff_ms: Option<u64>,
    max_read_failures: Option<u32>,
}

#[derive(Debug, Clone)]
pub struct CamgateConfig {
    pub api_addr: String,
    /// Extra host (e.g. a tailnet address) printed in the startup banner.
    pub remote_host: Option<String>,
    pub recordings_dir: PathBuf,
    pub camera: CameraSettings,
    pub recording_fps: u32,
    /// `ffmpeg` executable used by the default recording backend.
    pub ffmpeg_program: PathBuf,
    pub retry: RetrySettings,
}

#[derive(Debug, Clone)]
pub struct CameraSettings {
    /// Device path prefix; the scan index is appended. `stub://` selects the
    /// synthetic backend.
    pub device: String,
    pub scan_limit: u32,
    pub width: u32,
    pub height: u32,
    pub target_fps: u32,
    pub jpeg_quality: u8,
}

#[derive(Debug, Clone)]
pub struct RetrySettings {
    pub open_backoff: Duration,
    pub read_backoff: Duration,
    pub max_read_failures: u32,
}

impl CamgateConfig {
    /// Load from `CAMGATE_CONFIG` (if set), then env overrides, then validate.
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("CAMGATE_CONFIG").ok();
        Self::load_from(config_path.as_deref().map(Path::new))
    }

    pub fn load_from(path: Option<&Path>) -> Result<Self> {
        let file_cfg = match path {
            Some(path) => Some(read_config_file(path)?),
            None => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default());
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: CamgateConfigFile) -> Self {
        let api = file.api.unwrap_or_default();
        let camera = file.camera.unwrap_or_default();
        let retry = file.retry.unwrap_or_default();
        let recording = file.recording.unwrap_or_default();
        Self {
            api_addr: api.addr.unwrap_or_else(|| DEFAULT_API_ADDR.to_string()),
            remote_host: api.remote_host,
            recordings_dir: file
                .recordings_dir
                .unwrap_or_else(|| PathBuf::from(DEFAULT_RECORDINGS_DIR)),
            camera: CameraSettings {
                device: camera
                    .device
                    .unwrap_or_else(|| DEFAULT_DEVICE_PREFIX.to_string()),
                scan_limit: camera.scan_limit.unwrap_or(DEFAULT_SCAN_LIMIT),
                width: camera.width.unwrap_or(DEFAULT_WIDTH),
                height: camera.height.unwrap_or(DEFAULT_HEIGHT),
                target_fps: camera.target_fps.unwrap_or(DEFAULT_TARGET_FPS),
                jpeg_quality: camera.jpeg_quality.unwrap_or(DEFAULT_JPEG_QUALITY),
            },
            recording_fps: recording.fps.unwrap_or(DEFAULT_RECORDING_FPS),
            ffmpeg_program: recording
                .ffmpeg
                .unwrap_or_else(|| PathBuf::from(DEFAULT_FFMPEG_PROGRAM)),
            retry: RetrySettings {
                open_backoff: Duration::from_millis(
                    retry.open_backoff_ms.unwrap_or(DEFAULT_OPEN_BACKOFF_MS),
                ),
                read_backoff: Duration::from_millis(
                    retry.read_backoff_ms.unwrap_or(DEFAULT_READ_BACKOFF_MS),
                ),
                max_read_failures: retry.max_read_failures.unwrap_or(DEFAULT_MAX_READ_FAILURES),
            },
        }
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(addr) = std::env::var("CAMGATE_ADDR") {
            if !addr.trim().is_empty() {
                self.api_addr = addr;
            }
        }
        if let Ok(dir) = std::env::var("CAMGATE_RECORDINGS_DIR") {
            if !dir.trim().is_empty() {
                self.recordings_dir = PathBuf::from(dir);
            }
        }
        if let Ok(device) = std::env::var("CAMGATE_DEVICE") {
            if !device.trim().is_empty() {
                self.camera.device = device;
            }
        }
        if let Ok(program) = std::env::var("CAMGATE_FFMPEG") {
            if !program.trim().is_empty() {
                self.ffmpeg_program = PathBuf::from(program.trim());
            }
        }
        if let Ok(quality) = std::env::var("CAMGATE_JPEG_QUALITY") {
            self.camera.jpeg_quality = quality
                .trim()
                .parse()
                .map_err(|_| anyhow!("CAMGATE_JPEG_QUALITY must be an integer in 1..=100"))?;
        }
        if let Ok(host) = std::env::var("TAILSCALE_IP") {
            if !host.trim().is_empty() {
                self.remote_host = Some(host.trim().to_string());
            }
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        self.api_addr
            .parse::<std::net::SocketAddr>()
            .map_err(|e| anyhow!("invalid api address '{}': {}", self.api_addr, e))?;
        if self.camera.device.trim().is_empty() {
            return Err(anyhow!("camera device must not be empty"));
        }
        if self.camera.scan_limit == 0 {
            return Err(anyhow!("camera scan_limit must be greater than zero"));
        }
        if self.camera.width == 0 || self.camera.height == 0 {
            return Err(anyhow!("camera width and height must be greater than zero"));
        }
        if !(1..=100).contains(&self.camera.jpeg_quality) {
            return Err(anyhow!("jpeg_quality must be in 1..=100"));
        }
        if self.recording_fps == 0 {
            return Err(anyhow!("recording fps must be greater than zero"));
        }
        if self.retry.max_read_failures == 0 {
            return Err(anyhow!("retry max_read_failures must be greater than zero"));
        }
        if self.ffmpeg_program.as_os_str().is_empty() {
            return Err(anyhow!("recording ffmpeg program must not be empty"));
        }
        if self.recordings_dir.as_os_str().is_empty() {
            return Err(anyhow!("recordings_dir must not be empty"));
        }
        Ok(())
    }

    pub fn capture_config(&self) -> CaptureConfig {
        CaptureConfig {
            device_prefix: self.camera.device.clone(),
            scan_limit: self.camera.scan_limit,
            width: self.camera.width,
            height: self.camera.height,
            target_fps: self.camera.target_fps,
        }
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            recordings_dir: self.recordings_dir.clone(),
            recording_fps: self.recording_fps,
            jpeg_quality: self.camera.jpeg_quality,
            open_backoff: self.retry.open_backoff,
            read_backoff: self.retry.read_backoff,
            max_read_failures: self.retry.max_read_failures,
        }
    }
}

fn read_config_file(path: &Path) -> Result<CamgateConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let cfg = serde_json::from_str(&raw)
        .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?;
    Ok(cfg)
}
