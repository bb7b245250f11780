//! JPEG encoding for delivery, and handoff of encoded frames to the recording sink.

use image::codecs::jpeg::JpegEncoder;
use image::ExtendedColorType;

use crate::error::EncodeError;
use crate::frame::{rgb_len, EncodedFrame, Frame};
use crate::record::RecordingSink;

/// Default JPEG quality for the live stream.
pub const DEFAULT_JPEG_QUALITY: u8 = 85;

#[derive(Clone, Copy, Debug)]
pub struct FrameEncoder {
    quality: u8,
}

impl Default for FrameEncoder {
    fn default() -> Self {
        Self::new(DEFAULT_JPEG_QUALITY)
    }
}

impl FrameEncoder {
    /// Quality is clamped to 1..=100.
    pub fn new(quality: u8) -> Self {
        Self {
            quality: quality.clamp(1, 100),
        }
    }

    pub fn quality(&self) -> u8 {
        self.quality
    }

    /// Compress an annotated frame. A failure means the caller skips this frame.
    pub fn encode_for_stream(&self, frame: &Frame) -> Result<EncodedFrame, EncodeError> {
        let expected = rgb_len(frame.width, frame.height).unwrap_or(usize::MAX);
        if frame.pixels().len() != expected {
            return Err(EncodeError::BufferMismatch {
                width: frame.width,
                height: frame.height,
                expected,
                actual: frame.pixels().len(),
            });
        }

        let mut jpeg = Vec::with_capacity(expected / 8);
        JpegEncoder::new_with_quality(&mut jpeg, self.quality).encode(
            frame.pixels(),
            frame.width,
            frame.height,
            ExtendedColorType::Rgb8,
        )?;
        Ok(EncodedFrame::new(jpeg, frame.width, frame.height))
    }

    /// Hand an encoded frame to the active recording. Never fails: the sink
    /// absorbs write errors so the stream keeps flowing.
    pub fn feed_recording(&self, frame: &EncodedFrame, sink: &mut RecordingSink) {
        sink.write(frame);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{FRAME_HEIGHT, FRAME_WIDTH};

    #[test]
    fn encodes_jpeg_with_soi_and_eoi_markers() -> anyhow::Result<()> {
        let frame = Frame::filled(FRAME_WIDTH, FRAME_HEIGHT, [10, 200, 30]);
        let encoded = FrameEncoder::default().encode_for_stream(&frame)?;
        let bytes = encoded.as_bytes();
        assert_eq!(&bytes[..2], &[0xFF, 0xD8]);
        assert_eq!(&bytes[bytes.len() - 2..], &[0xFF, 0xD9]);
        assert_eq!((encoded.width, encoded.height), (FRAME_WIDTH, FRAME_HEIGHT));
        Ok(())
    }

    #[test]
    fn encoded_frame_decodes_back_to_same_size() -> anyhow::Result<()> {
        let frame = Frame::filled(64, 48, [128, 128, 128]);
        let encoded = FrameEncoder::new(85).encode_for_stream(&frame)?;
        let decoded = image::load_from_memory(encoded.as_bytes())?;
        assert_eq!((decoded.width(), decoded.height()), (64, 48));
        Ok(())
    }

    #[test]
    fn quality_is_clamped() {
        assert_eq!(FrameEncoder::new(0).quality(), 1);
        assert_eq!(FrameEncoder::new(250).quality(), 100);
    }
}
