//! In-memory frame representation.
//!
//! - `Frame`: RGB24 pixel buffer with fixed dimensions.
//! - `EncodedFrame`: JPEG bytes produced from a `Frame`.
//!
//! Frames are ephemeral: one is captured, annotated, encoded and dropped per
//! processing cycle.

use anyhow::{anyhow, Result};
use image::{imageops, RgbImage};

/// Default capture width.
pub const FRAME_WIDTH: u32 = 640;

/// Default capture height.
pub const FRAME_HEIGHT: u32 = 480;

/// RGB triple.
pub type Rgb = [u8; 3];

// ----------------------------------------------------------------------------
// Frame: raw RGB24 pixels
// ----------------------------------------------------------------------------

/// One captured image in packed RGB24 layout, row-major, no padding.
#[derive(Clone, Debug)]
pub struct Frame {
    data: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

impl Frame {
    /// Wrap an RGB24 buffer. The buffer length must equal `width * height * 3`.
    pub fn new(data: Vec<u8>, width: u32, height: u32) -> Result<Self> {
        let expected = rgb_len(width, height)?;
        if data.len() != expected {
            return Err(anyhow!(
                "RGB frame length mismatch: expected {}, got {}",
                expected,
                data.len()
            ));
        }
        Ok(Self {
            data,
            width,
            height,
        })
    }

    /// A frame filled with a single color.
    pub fn filled(width: u32, height: u32, color: Rgb) -> Self {
        let pixels = (width as usize) * (height as usize);
        let mut data = Vec::with_capacity(pixels * 3);
        for _ in 0..pixels {
            data.extend_from_slice(&color);
        }
        Self {
            data,
            width,
            height,
        }
    }

    pub fn pixels(&self) -> &[u8] {
        &self.data
    }

    pub fn pixel(&self, x: u32, y: u32) -> Option<Rgb> {
        if x >= self.width || y >= self.height {
            return None;
        }
        let offset = self.offset(x, y);
        Some([
            self.data[offset],
            self.data[offset + 1],
            self.data[offset + 2],
        ])
    }

    /// Set a pixel, silently clipping coordinates outside the frame.
    pub fn put_pixel(&mut self, x: i64, y: i64, color: Rgb) {
        if x < 0 || y < 0 || x >= self.width as i64 || y >= self.height as i64 {
            return;
        }
        let offset = self.offset(x as u32, y as u32);
        self.data[offset..offset + 3].copy_from_slice(&color);
    }

    /// Mirror the image around its vertical axis.
    pub fn mirror_horizontal(&mut self) {
        let row_bytes = self.width as usize * 3;
        if row_bytes == 0 {
            return;
        }
        for row in self.data.chunks_exact_mut(row_bytes) {
            let (mut left, mut right) = (0usize, self.width as usize - 1);
            while left < right {
                for channel in 0..3 {
                    row.swap(left * 3 + channel, right * 3 + channel);
                }
                left += 1;
                right -= 1;
            }
        }
    }

    /// Resize to the given dimensions if they differ. Devices may ignore the
    /// requested format, and downstream consumers expect a fixed size.
    pub fn conform(self, width: u32, height: u32) -> Result<Self> {
        if self.width == width && self.height == height {
            return Ok(self);
        }
        let image = RgbImage::from_raw(self.width, self.height, self.data)
            .ok_or_else(|| anyhow!("frame buffer does not match its dimensions"))?;
        let resized = imageops::resize(&image, width, height, imageops::FilterType::Triangle);
        Ok(Self {
            data: resized.into_raw(),
            width,
            height,
        })
    }

    fn offset(&self, x: u32, y: u32) -> usize {
        (y as usize * self.width as usize + x as usize) * 3
    }
}

pub(crate) fn rgb_len(width: u32, height: u32) -> Result<usize> {
    width
        .checked_mul(height)
        .and_then(|v| v.checked_mul(3))
        .map(|v| v as usize)
        .ok_or_else(|| anyhow!("RGB frame dimensions overflow"))
}

// ----------------------------------------------------------------------------
// EncodedFrame: compressed delivery image
// ----------------------------------------------------------------------------

/// A JPEG-compressed frame, shared by the live stream and the recording sink.
#[derive(Clone, Debug)]
pub struct EncodedFrame {
    pub width: u32,
    pub height: u32,
    jpeg: Vec<u8>,
}

impl EncodedFrame {
    pub(crate) fn new(jpeg: Vec<u8>, width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            jpeg,
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.jpeg
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn gradient(width: u32, height: u32) -> Frame {
        let mut data = Vec::with_capacity((width * height * 3) as usize);
        for y in 0..height {
            for x in 0..width {
                data.extend_from_slice(&[x as u8, y as u8, 7]);
            }
        }
        Frame::new(data, width, height).expect("gradient frame")
    }

    #[test]
    fn rejects_buffer_of_wrong_length() {
        assert!(Frame::new(vec![0u8; 10], 2, 2).is_err());
    }

    #[test]
    fn mirror_swaps_columns() {
        let mut frame = gradient(5, 2);
        frame.mirror_horizontal();
        assert_eq!(frame.pixel(0, 0), Some([4, 0, 7]));
        assert_eq!(frame.pixel(4, 1), Some([0, 1, 7]));
        assert_eq!(frame.pixel(2, 1), Some([2, 1, 7]));
    }

    #[test]
    fn put_pixel_clips_out_of_bounds() {
        let mut frame = Frame::filled(4, 4, [0, 0, 0]);
        frame.put_pixel(-1, 2, [255, 0, 0]);
        frame.put_pixel(4, 0, [255, 0, 0]);
        frame.put_pixel(3, 3, [255, 0, 0]);
        assert_eq!(frame.pixel(3, 3), Some([255, 0, 0]));
        assert_eq!(
            frame.pixels().iter().filter(|&&b| b == 255).count(),
            1,
            "only the in-bounds write lands"
        );
    }

    #[test]
    fn conform_resizes_to_target() -> Result<()> {
        let frame = gradient(320, 240).conform(FRAME_WIDTH, FRAME_HEIGHT)?;
        assert_eq!((frame.width, frame.height), (FRAME_WIDTH, FRAME_HEIGHT));
        assert_eq!(frame.pixels().len(), rgb_len(FRAME_WIDTH, FRAME_HEIGHT)?);
        Ok(())
    }
}
