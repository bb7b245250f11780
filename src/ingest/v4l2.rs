//! V4L2 capture backend.
//!
//! Opens `/dev/videoN` nodes through libv4l, requests the configured size and
//! frame rate, and streams through memory-mapped buffers. The driver may pick
//! a different format; whatever it reports is normalized to RGB24.

use anyhow::{anyhow, Context, Result};
use ouroboros::self_referencing;

use super::normalize::{normalize_to_rgb, PixelFormat};
use super::{CaptureConfig, CaptureDevice, DeviceProbe};
use crate::error::SourceError;
use crate::frame::Frame;

const STREAM_BUFFERS: u32 = 4;

/// Probe for local V4L2 device nodes.
#[derive(Clone, Copy, Debug, Default)]
pub struct V4l2Probe;

impl DeviceProbe for V4l2Probe {
    fn open_index(&self, index: u32, config: &CaptureConfig) -> Result<Box<dyn CaptureDevice>> {
        let device = V4l2Device::open(config.device_path(index), config)?;
        Ok(Box::new(device))
    }
}

#[self_referencing]
struct V4l2State {
    device: v4l::Device,
    #[borrows(mut device)]
    #[covariant]
    stream: v4l::prelude::MmapStream<'this, v4l::Device>,
}

pub struct V4l2Device {
    path: String,
    state: Option<V4l2State>,
    format: PixelFormat,
    width: u32,
    height: u32,
    frame_count: u64,
}

impl V4l2Device {
    fn open(path: String, config: &CaptureConfig) -> Result<Self> {
        use v4l::buffer::Type;
        use v4l::video::Capture;

        let device =
            v4l::Device::with_path(&path).with_context(|| format!("open v4l2 device {path}"))?;
        let mut format = device.format().context("read v4l2 format")?;
        format.width = config.width;
        format.height = config.height;
        format.fourcc = v4l::FourCC::new(b"RGB3");

        let format = match device.set_format(&format) {
            Ok(format) => format,
            Err(err) => {
                log::warn!("V4l2Device: failed to set format on {}: {}", path, err);
                device
                    .format()
                    .context("read v4l2 format after set failure")?
            }
        };
        let pixel_format = PixelFormat::from_fourcc(&format.fourcc.repr).ok_or_else(|| {
            anyhow!(
                "v4l2 device {} negotiated unsupported pixel format {}",
                path,
                format.fourcc
            )
        })?;

        if config.target_fps > 0 {
            let params = v4l::video::capture::Parameters::with_fps(config.target_fps);
            if let Err(err) = device.set_params(&params) {
                log::warn!("V4l2Device: failed to set fps on {}: {}", path, err);
            }
        }

        let state = V4l2StateBuilder {
            device,
            stream_builder: |device| {
                v4l::prelude::MmapStream::with_buffers(device, Type::VideoCapture, STREAM_BUFFERS)
                    .map_err(|err| anyhow::Error::new(err).context("create v4l2 buffer stream"))
            },
        }
        .try_build()?;

        log::info!(
            "V4l2Device: connected to {} ({}x{} {:?})",
            path,
            format.width,
            format.height,
            pixel_format
        );
        Ok(Self {
            path,
            state: Some(state),
            format: pixel_format,
            width: format.width,
            height: format.height,
            frame_count: 0,
        })
    }
}

impl CaptureDevice for V4l2Device {
    fn read(&mut self) -> Result<Frame, SourceError> {
        use v4l::io::traits::CaptureStream;

        let (width, height, format) = (self.width, self.height, self.format);
        let state = self
            .state
            .as_mut()
            .ok_or_else(|| SourceError::ReadFailure("v4l2 device not connected".to_string()))?;
        let converted = state.with_mut(|fields| {
            let (buf, meta) = fields
                .stream
                .next()
                .map_err(|err| anyhow::Error::new(err).context("capture v4l2 frame"))?;
            let used = (meta.bytesused as usize).min(buf.len());
            let used = if used == 0 { buf.len() } else { used };
            normalize_to_rgb(&buf[..used], width, height, format)
        });

        let (pixels, w, h) =
            converted.map_err(|err| SourceError::ReadFailure(format!("{err:#}")))?;
        self.frame_count += 1;
        Frame::new(pixels, w, h).map_err(|err| SourceError::ReadFailure(err.to_string()))
    }

    fn is_open(&self) -> bool {
        self.state.is_some()
    }

    fn describe(&self) -> String {
        format!(
            "{} {}x{} {:?}, {} frames",
            self.path, self.width, self.height, self.format, self.frame_count
        )
    }
}
