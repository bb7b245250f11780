//! In-process recording through libav (`record-ffmpeg` feature).
//!
//! Each JPEG is decoded to RGB24, scaled to YUV420P and encoded as MPEG-4
//! Part 2. The MP4 muxer tags that stream `mp4v`.

use ffmpeg_next as ffmpeg;
use std::io;
use std::path::{Path, PathBuf};

use super::{RecordingFormat, VideoBackend, VideoWriter};

fn av_err(err: ffmpeg::Error) -> io::Error {
    io::Error::new(io::ErrorKind::Other, format!("libav: {err}"))
}

pub struct LibavBackend;

impl VideoBackend for LibavBackend {
    fn open(&self, path: &Path, format: RecordingFormat) -> io::Result<Box<dyn VideoWriter>> {
        Ok(Box::new(LibavWriter::open(path, format)?))
    }

    fn name(&self) -> &'static str {
        "libav"
    }
}

struct LibavWriter {
    path: PathBuf,
    format: RecordingFormat,
    output: ffmpeg::format::context::Output,
    stream_index: usize,
    encoder: ffmpeg::encoder::video::Encoder,
    scaler: ffmpeg::software::scaling::Context,
    encoder_time_base: ffmpeg::Rational,
    stream_time_base: ffmpeg::Rational,
    next_pts: i64,
}

// The libav contexts are owned exclusively by this writer and are only used
// from whichever thread holds the recording lock.
unsafe impl Send for LibavWriter {}

impl LibavWriter {
    fn open(path: &Path, format: RecordingFormat) -> io::Result<Self> {
        ffmpeg::init().map_err(av_err)?;
        let mut output = ffmpeg::format::output(&path).map_err(av_err)?;
        let global_header = output
            .format()
            .flags()
            .contains(ffmpeg::format::Flags::GLOBAL_HEADER);

        let codec = ffmpeg::encoder::find(ffmpeg::codec::Id::MPEG4)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "libav has no MPEG-4 encoder"))?;
        let mut stream = output.add_stream(codec).map_err(av_err)?;
        let stream_index = stream.index();

        let encoder_time_base = ffmpeg::Rational::new(1, format.fps as i32);
        let mut config = ffmpeg::codec::context::Context::new_with_codec(codec)
            .encoder()
            .video()
            .map_err(av_err)?;
        config.set_width(format.width);
        config.set_height(format.height);
        config.set_format(ffmpeg::format::Pixel::YUV420P);
        config.set_time_base(encoder_time_base);
        config.set_frame_rate(Some(ffmpeg::Rational::new(format.fps as i32, 1)));
        if global_header {
            config.set_flags(ffmpeg::codec::Flags::GLOBAL_HEADER);
        }
        let encoder = config.open_as(codec).map_err(av_err)?;
        stream.set_parameters(&encoder);
        stream.set_time_base(encoder_time_base);

        output.write_header().map_err(av_err)?;
        let stream_time_base = output
            .stream(stream_index)
            .map(|s| s.time_base())
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "libav dropped the video stream"))?;

        let scaler = ffmpeg::software::scaling::Context::get(
            ffmpeg::format::Pixel::RGB24,
            format.width,
            format.height,
            ffmpeg::format::Pixel::YUV420P,
            format.width,
            format.height,
            ffmpeg::software::scaling::Flags::BILINEAR,
        )
        .map_err(av_err)?;

        Ok(Self {
            path: path.to_path_buf(),
            format,
            output,
            stream_index,
            encoder,
            scaler,
            encoder_time_base,
            stream_time_base,
            next_pts: 0,
        })
    }

    fn rgb_frame(&self, jpeg: &[u8]) -> io::Result<ffmpeg::frame::Video> {
        let rgb = image::load_from_memory_with_format(jpeg, image::ImageFormat::Jpeg)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?
            .to_rgb8();
        if rgb.width() != self.format.width || rgb.height() != self.format.height {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!(
                    "jpeg is {}x{}, recording is {}x{}",
                    rgb.width(),
                    rgb.height(),
                    self.format.width,
                    self.format.height
                ),
            ));
        }

        let mut frame =
            ffmpeg::frame::Video::new(ffmpeg::format::Pixel::RGB24, rgb.width(), rgb.height());
        let row_bytes = rgb.width() as usize * 3;
        let stride = frame.stride(0);
        let data = frame.data_mut(0);
        for (row, src) in rgb.as_raw().chunks_exact(row_bytes).enumerate() {
            let start = row * stride;
            data[start..start + row_bytes].copy_from_slice(src);
        }
        Ok(frame)
    }

    fn drain_packets(&mut self) -> io::Result<()> {
        let mut packet = ffmpeg::Packet::empty();
        while self.encoder.receive_packet(&mut packet).is_ok() {
            packet.set_stream(self.stream_index);
            packet.rescale_ts(self.encoder_time_base, self.stream_time_base);
            packet.write_interleaved(&mut self.output).map_err(av_err)?;
        }
        Ok(())
    }
}

impl VideoWriter for LibavWriter {
    fn write_frame(&mut self, jpeg: &[u8]) -> io::Result<()> {
        let rgb = self.rgb_frame(jpeg)?;
        let mut yuv = ffmpeg::frame::Video::empty();
        self.scaler.run(&rgb, &mut yuv).map_err(av_err)?;
        yuv.set_pts(Some(self.next_pts));
        self.encoder.send_frame(&yuv).map_err(av_err)?;
        self.next_pts += 1;
        self.drain_packets()
    }

    fn finish(mut self: Box<Self>) -> io::Result<u64> {
        self.encoder.send_eof().map_err(av_err)?;
        self.drain_packets()?;
        self.output.write_trailer().map_err(av_err)?;
        Ok(std::fs::metadata(&self.path)?.len())
    }
}
