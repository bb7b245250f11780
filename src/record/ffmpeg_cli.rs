//! Recording through an `ffmpeg` child process.
//!
//! JPEG frames are piped to `ffmpeg -f image2pipe`, which re-encodes them as
//! MPEG-4 Part 2 (`mp4v`) in an MP4 container. The child owns the muxing, so a
//! failed write never leaves a half-patched index behind: the pipe is closed
//! and ffmpeg finalizes whatever it already received.

use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, Command, Stdio};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use super::{RecordingFormat, VideoBackend, VideoWriter};

pub struct FfmpegCliBackend {
    program: PathBuf,
}

impl FfmpegCliBackend {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    /// True when `<program> -version` runs and exits cleanly.
    pub fn is_available(&self) -> bool {
        Command::new(&self.program)
            .arg("-version")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map(|status| status.success())
            .unwrap_or(false)
    }

    fn command(&self, path: &Path, format: RecordingFormat) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(["-hide_banner", "-loglevel", "error", "-y"])
            .args(["-f", "image2pipe", "-c:v", "mjpeg"])
            .arg("-framerate")
            .arg(format.fps.to_string())
            .args(["-i", "pipe:0"])
            .args(["-c:v", "mpeg4", "-tag:v", "mp4v", "-q:v", "5"])
            .args(["-pix_fmt", "yuv420p"])
            .arg("-s")
            .arg(format!("{}x{}", format.width, format.height))
            .arg(path)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped());
        cmd
    }
}

impl Default for FfmpegCliBackend {
    fn default() -> Self {
        Self::new("ffmpeg")
    }
}

impl VideoBackend for FfmpegCliBackend {
    fn open(&self, path: &Path, format: RecordingFormat) -> io::Result<Box<dyn VideoWriter>> {
        let mut child = self.command(path, format).spawn().map_err(|e| {
            io::Error::new(
                e.kind(),
                format!("failed to spawn {}: {}", self.program.display(), e),
            )
        })?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "ffmpeg stdin unavailable"))?;

        let errors = Arc::new(Mutex::new(String::new()));
        let stderr_thread = child.stderr.take().map(|stderr| {
            let errors = errors.clone();
            std::thread::spawn(move || {
                for line in BufReader::new(stderr).lines().map_while(Result::ok) {
                    log::warn!("FfmpegCliBackend: ffmpeg: {}", line);
                    if let Ok(mut buf) = errors.lock() {
                        buf.push_str(&line);
                        buf.push('\n');
                    }
                }
            })
        });

        Ok(Box::new(FfmpegCliWriter {
            path: path.to_path_buf(),
            child,
            stdin: Some(stdin),
            stderr_thread,
            errors,
        }))
    }

    fn name(&self) -> &'static str {
        "ffmpeg-cli"
    }
}

struct FfmpegCliWriter {
    path: PathBuf,
    child: Child,
    stdin: Option<ChildStdin>,
    stderr_thread: Option<JoinHandle<()>>,
    errors: Arc<Mutex<String>>,
}

impl FfmpegCliWriter {
    fn stderr_text(&self) -> String {
        self.errors
            .lock()
            .map(|buf| buf.trim().to_string())
            .unwrap_or_default()
    }
}

impl VideoWriter for FfmpegCliWriter {
    fn write_frame(&mut self, jpeg: &[u8]) -> io::Result<()> {
        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "ffmpeg input closed"))?;
        if let Err(err) = stdin.write_all(jpeg) {
            // Once the pipe breaks, ffmpeg has exited or is exiting.
            self.stdin = None;
            return Err(err);
        }
        Ok(())
    }

    fn finish(mut self: Box<Self>) -> io::Result<u64> {
        drop(self.stdin.take());
        let status = self.child.wait()?;
        if let Some(handle) = self.stderr_thread.take() {
            let _ = handle.join();
        }
        if !status.success() {
            let stderr = self.stderr_text();
            return Err(io::Error::new(
                io::ErrorKind::Other,
                format!("ffmpeg exited with {}: {}", status, stderr),
            ));
        }
        Ok(std::fs::metadata(&self.path)?.len())
    }
}

impl Drop for FfmpegCliWriter {
    fn drop(&mut self) {
        // Only reached without `finish` when a sink is dropped unfinalized.
        drop(self.stdin.take());
        if let Ok(None) = self.child.try_wait() {
            let _ = self.child.wait();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encode::FrameEncoder;
    use crate::frame::Frame;
    use anyhow::Result;
    use tempfile::tempdir;

    fn format() -> RecordingFormat {
        RecordingFormat {
            width: 64,
            height: 48,
            fps: 20,
        }
    }

    #[test]
    fn missing_program_fails_to_open() -> Result<()> {
        let dir = tempdir()?;
        let backend = FfmpegCliBackend::new(dir.path().join("no-such-ffmpeg"));
        assert!(!backend.is_available());
        let err = backend
            .open(&dir.path().join("r.mp4"), format())
            .err()
            .expect("spawn must fail");
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
        Ok(())
    }

    #[test]
    fn writes_playable_mp4_when_ffmpeg_is_installed() -> Result<()> {
        let backend = FfmpegCliBackend::default();
        if !backend.is_available() {
            eprintln!("ffmpeg not installed, skipping");
            return Ok(());
        }
        let dir = tempdir()?;
        let path = dir.path().join("r.mp4");
        let mut writer = backend.open(&path, format())?;
        let encoder = FrameEncoder::default();
        for shade in [10u8, 80, 160, 240] {
            let frame = encoder.encode_for_stream(&Frame::filled(64, 48, [shade, shade, shade]))?;
            writer.write_frame(frame.as_bytes())?;
        }
        let bytes = writer.finish()?;
        assert!(bytes > 0);

        let data = std::fs::read(&path)?;
        assert_eq!(&data[4..8], b"ftyp");
        assert!(data.windows(4).any(|w| w == b"moov"));
        assert!(data.windows(4).any(|w| w == b"mp4v"));
        Ok(())
    }

    #[test]
    fn nonzero_exit_surfaces_on_finish() -> Result<()> {
        // `false` accepts any arguments and exits with status 1.
        let backend = FfmpegCliBackend::new("false");
        let dir = tempdir()?;
        let mut writer = backend.open(&dir.path().join("r.mp4"), format())?;
        let _ = writer.write_frame(&[0xFF, 0xD8, 0xFF, 0xD9]);
        let err = writer.finish().err().expect("exit status 1 is a failure");
        assert!(err.to_string().contains("exited with"));
        Ok(())
    }
}
