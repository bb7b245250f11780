//! Recording sink and recordings directory.
//!
//! - `RecordingSink`: one open recording file. Created by `start`, consumed by
//!   `stop`, so a sink can only be finalized once.
//! - `VideoBackend`: the encoder/muxer behind a sink. The default spawns the
//!   `ffmpeg` CLI; the `record-ffmpeg` feature encodes in-process with libav.
//! - `list_recordings`: filesystem listing of finished recordings.
//!
//! Writes are best-effort: a failed write is counted and logged but never
//! propagates, so the live stream keeps running while recording.

pub mod ffmpeg_cli;
#[cfg(feature = "record-ffmpeg")]
pub mod libav;

use chrono::NaiveDateTime;
use serde::Serialize;
use std::fs::OpenOptions;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use crate::clock::iso_from_system;
use crate::frame::EncodedFrame;

pub use ffmpeg_cli::FfmpegCliBackend;
#[cfg(feature = "record-ffmpeg")]
pub use libav::LibavBackend;

pub const RECORDING_PREFIX: &str = "recording_";
pub const RECORDING_EXTENSION: &str = "mp4";

/// Nominal frame rate written into recording files.
pub const DEFAULT_RECORDING_FPS: u32 = 20;

/// `recording_<YYYYMMDD_HHMMSS>.mp4`
pub fn recording_filename(now: NaiveDateTime) -> String {
    format!(
        "{}{}.{}",
        RECORDING_PREFIX,
        now.format("%Y%m%d_%H%M%S"),
        RECORDING_EXTENSION
    )
}

/// Fixed geometry and rate of a recording.
#[derive(Clone, Copy, Debug)]
pub struct RecordingFormat {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
}

/// An open video file accepting JPEG frames.
pub trait VideoWriter: Send {
    fn write_frame(&mut self, jpeg: &[u8]) -> io::Result<()>;

    /// Flush pending frames, write the container index and close the file.
    /// Returns the final file size.
    fn finish(self: Box<Self>) -> io::Result<u64>;
}

/// Opens video writers. `path` already exists (empty) when `open` is called.
pub trait VideoBackend: Send + Sync {
    fn open(&self, path: &Path, format: RecordingFormat) -> io::Result<Box<dyn VideoWriter>>;

    fn name(&self) -> &'static str;
}

/// In-process libav when built with `record-ffmpeg`, the ffmpeg CLI otherwise.
pub fn default_backend(ffmpeg_program: &Path) -> Arc<dyn VideoBackend> {
    #[cfg(feature = "record-ffmpeg")]
    {
        let _ = ffmpeg_program;
        Arc::new(LibavBackend)
    }
    #[cfg(not(feature = "record-ffmpeg"))]
    {
        Arc::new(FfmpegCliBackend::new(ffmpeg_program))
    }
}

/// Summary returned when a sink is closed.
#[derive(Clone, Debug)]
pub struct RecordingSummary {
    pub filename: String,
    pub path: PathBuf,
    pub frames: usize,
    pub bytes: u64,
    pub write_failures: u64,
}

pub struct RecordingSink {
    filename: String,
    path: PathBuf,
    writer: Box<dyn VideoWriter>,
    format: RecordingFormat,
    frames: usize,
    write_failures: u64,
    started_at: Instant,
}

impl RecordingSink {
    /// Create `dir` if needed and open a new recording file inside it.
    /// An existing file with the same name is never overwritten.
    pub fn start(
        dir: &Path,
        filename: &str,
        format: RecordingFormat,
        backend: &dyn VideoBackend,
    ) -> io::Result<Self> {
        if format.fps == 0 || format.width == 0 || format.height == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "recording size and frame rate must be greater than zero",
            ));
        }
        std::fs::create_dir_all(dir)?;
        let path = dir.join(filename);
        // Claim the name before the backend reopens it for writing.
        OpenOptions::new().write(true).create_new(true).open(&path)?;
        let writer = match backend.open(&path, format) {
            Ok(writer) => writer,
            Err(err) => {
                let _ = std::fs::remove_file(&path);
                return Err(err);
            }
        };
        log::info!(
            "RecordingSink: opened {} ({}x{} @ {} fps, {})",
            path.display(),
            format.width,
            format.height,
            format.fps,
            backend.name()
        );
        Ok(Self {
            filename: filename.to_string(),
            path,
            writer,
            format,
            frames: 0,
            write_failures: 0,
            started_at: Instant::now(),
        })
    }

    pub fn filename(&self) -> &str {
        &self.filename
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn frame_count(&self) -> usize {
        self.frames
    }

    pub fn write_failures(&self) -> u64 {
        self.write_failures
    }

    /// Append one frame. Frames of the wrong size and I/O errors are dropped.
    pub fn write(&mut self, frame: &EncodedFrame) {
        if frame.width != self.format.width || frame.height != self.format.height {
            self.note_failure(&format!(
                "frame is {}x{}, recording is {}x{}",
                frame.width, frame.height, self.format.width, self.format.height
            ));
            return;
        }
        match self.writer.write_frame(frame.as_bytes()) {
            Ok(()) => self.frames += 1,
            Err(err) => self.note_failure(&err.to_string()),
        }
    }

    /// Finalize the file and close it.
    pub fn stop(self) -> io::Result<RecordingSummary> {
        let elapsed = self.started_at.elapsed();
        let bytes = self.writer.finish()?;
        log::info!(
            "RecordingSink: closed {} ({} frames, {} bytes, {:.1}s, {} dropped)",
            self.path.display(),
            self.frames,
            bytes,
            elapsed.as_secs_f64(),
            self.write_failures
        );
        Ok(RecordingSummary {
            filename: self.filename,
            path: self.path,
            frames: self.frames,
            bytes,
            write_failures: self.write_failures,
        })
    }

    fn note_failure(&mut self, reason: &str) {
        self.write_failures += 1;
        if self.write_failures == 1 {
            log::warn!(
                "RecordingSink: dropping frame for {}: {}",
                self.filename,
                reason
            );
        } else {
            log::debug!(
                "RecordingSink: dropping frame for {}: {}",
                self.filename,
                reason
            );
        }
    }
}

// ----------------------------------------------------------------------------
// Directory listing
// ----------------------------------------------------------------------------

/// One finished recording as reported by `/recordings`.
#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
pub struct RecordingEntry {
    pub filename: String,
    pub size: u64,
    pub modified: String,
}

/// List `.mp4` files in `dir`, newest name first. A missing directory is empty.
pub fn list_recordings(dir: &Path) -> io::Result<Vec<RecordingEntry>> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(err),
    };

    let suffix = format!(".{RECORDING_EXTENSION}");
    let mut recordings = Vec::new();
    for entry in entries {
        let entry = entry?;
        let Some(filename) = entry.file_name().to_str().map(str::to_string) else {
            continue;
        };
        if !filename.ends_with(&suffix) {
            continue;
        }
        let metadata = entry.metadata()?;
        if !metadata.is_file() {
            continue;
        }
        recordings.push(RecordingEntry {
            filename,
            size: metadata.len(),
            modified: iso_from_system(metadata.modified()?),
        });
    }
    recordings.sort_by(|a, b| b.filename.cmp(&a.filename));
    Ok(recordings)
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

/// Backend doubles shared by unit tests in this crate.
#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use std::fs::File;
    use std::io::Write;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    /// Appends raw JPEG bytes to the reserved file. `finish` raises
    /// `finishing`, waits `finish_delay` and then raises `finalized`.
    #[derive(Default)]
    pub(crate) struct AppendBackend {
        pub(crate) finish_delay: Duration,
        pub(crate) finishing: Arc<AtomicBool>,
        pub(crate) finalized: Arc<AtomicBool>,
        pub(crate) fail_open: bool,
    }

    struct AppendWriter {
        file: File,
        finish_delay: Duration,
        finishing: Arc<AtomicBool>,
        finalized: Arc<AtomicBool>,
    }

    impl VideoWriter for AppendWriter {
        fn write_frame(&mut self, jpeg: &[u8]) -> io::Result<()> {
            self.file.write_all(jpeg)
        }

        fn finish(mut self: Box<Self>) -> io::Result<u64> {
            self.finishing.store(true, Ordering::SeqCst);
            self.file.flush()?;
            std::thread::sleep(self.finish_delay);
            let len = self.file.metadata()?.len();
            self.finalized.store(true, Ordering::SeqCst);
            Ok(len)
        }
    }

    impl VideoBackend for AppendBackend {
        fn open(&self, path: &Path, _format: RecordingFormat) -> io::Result<Box<dyn VideoWriter>> {
            if self.fail_open {
                return Err(io::Error::new(io::ErrorKind::Other, "encoder unavailable"));
            }
            let file = OpenOptions::new().append(true).open(path)?;
            Ok(Box::new(AppendWriter {
                file,
                finish_delay: self.finish_delay,
                finishing: self.finishing.clone(),
                finalized: self.finalized.clone(),
            }))
        }

        fn name(&self) -> &'static str {
            "append"
        }
    }

    /// Accepts the open but fails every write.
    pub(crate) struct BrokenPipeBackend;

    struct BrokenPipeWriter;

    impl VideoWriter for BrokenPipeWriter {
        fn write_frame(&mut self, _jpeg: &[u8]) -> io::Result<()> {
            Err(io::Error::new(io::ErrorKind::BrokenPipe, "encoder exited"))
        }

        fn finish(self: Box<Self>) -> io::Result<u64> {
            Ok(0)
        }
    }

    impl VideoBackend for BrokenPipeBackend {
        fn open(&self, _path: &Path, _format: RecordingFormat) -> io::Result<Box<dyn VideoWriter>> {
            Ok(Box::new(BrokenPipeWriter))
        }

        fn name(&self) -> &'static str {
            "broken-pipe"
        }
    }
}
