//! Camera session manager.
//!
//! `CameraSession` owns the single capture device and the recording state, and
//! is shared by every HTTP connection behind an `Arc`.
//!
//! Locking:
//! - `device`: held only around `open()`/`read()` of the device. Never held
//!   while annotating, encoding or writing to a socket. Waiters are not
//!   queued in any particular order (plain `Mutex`, free-for-all).
//! - `recording`: held for a start toggle, a single sink write, or a stop
//!   including finalization. A start that races a stop therefore sees the
//!   previous file fully written. Toggles never touch `device`.
//!
//! Device failures stay inside the session: a read error is retried on the
//! same handle, and only `max_read_failures` consecutive errors release it.
//! The next cycle then rescans from index 0.

use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use crate::annotate::annotate;
use crate::clock::{iso_timestamp, Clock};
use crate::encode::{FrameEncoder, DEFAULT_JPEG_QUALITY};
use crate::error::{SessionError, SourceError};
use crate::frame::{EncodedFrame, Frame};
use crate::ingest::{DeviceHandle, FrameSource};
use crate::record::{
    recording_filename, RecordingFormat, RecordingSink, RecordingSummary, VideoBackend,
    DEFAULT_RECORDING_FPS,
};

const DEFAULT_OPEN_BACKOFF: Duration = Duration::from_secs(1);
const DEFAULT_READ_BACKOFF: Duration = Duration::from_millis(100);
const DEFAULT_MAX_READ_FAILURES: u32 = 30;
const BACKOFF_SLICE: Duration = Duration::from_millis(25);

/// Tunables for the session. Stream and recording rates are independent.
#[derive(Clone, Debug)]
pub struct SessionConfig {
    pub recordings_dir: std::path::PathBuf,
    pub recording_fps: u32,
    pub jpeg_quality: u8,
    /// Delay between device open attempts while no camera is available.
    pub open_backoff: Duration,
    /// Delay after a failed read on an open device.
    pub read_backoff: Duration,
    /// Consecutive read failures after which the device is released.
    pub max_read_failures: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            recordings_dir: std::path::PathBuf::from("recordings"),
            recording_fps: DEFAULT_RECORDING_FPS,
            jpeg_quality: DEFAULT_JPEG_QUALITY,
            open_backoff: DEFAULT_OPEN_BACKOFF,
            read_backoff: DEFAULT_READ_BACKOFF,
            max_read_failures: DEFAULT_MAX_READ_FAILURES,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum DeviceStatus {
    Closed,
    Open,
    Broken,
}

/// Snapshot returned by `/status`.
#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
pub struct SessionStatus {
    pub camera_active: bool,
    pub recording: bool,
    pub timestamp: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RecordingStarted {
    pub filename: String,
}

struct DeviceSlot {
    handle: Option<DeviceHandle>,
    status: DeviceStatus,
    consecutive_failures: u32,
}

pub struct CameraSession {
    source: FrameSource,
    encoder: FrameEncoder,
    clock: Arc<dyn Clock>,
    recorder: Arc<dyn VideoBackend>,
    config: SessionConfig,
    device: Mutex<DeviceSlot>,
    recording: Mutex<Option<RecordingSink>>,
    camera_active: AtomicBool,
    subscribers: AtomicUsize,
}

impl CameraSession {
    /// Build the session and make a first attempt at opening the camera.
    /// A missing camera is not an error; streams keep retrying.
    pub fn new(
        source: FrameSource,
        recorder: Arc<dyn VideoBackend>,
        config: SessionConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let session = Self {
            encoder: FrameEncoder::new(config.jpeg_quality),
            source,
            clock,
            recorder,
            config,
            device: Mutex::new(DeviceSlot {
                handle: None,
                status: DeviceStatus::Closed,
                consecutive_failures: 0,
            }),
            recording: Mutex::new(None),
            camera_active: AtomicBool::new(false),
            subscribers: AtomicUsize::new(0),
        };
        match session.ensure_device() {
            Ok(()) => log::info!("CameraSession: camera ready"),
            Err(err) => log::warn!("CameraSession: camera not available yet: {}", err),
        }
        session
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Open the device if there is no working handle.
    pub fn ensure_device(&self) -> Result<(), SessionError> {
        let mut slot = self.lock_device();
        self.ensure_device_locked(&mut slot)
    }

    fn ensure_device_locked(&self, slot: &mut DeviceSlot) -> Result<(), SessionError> {
        if slot.handle.as_ref().is_some_and(DeviceHandle::is_open) {
            return Ok(());
        }
        // Release any stale handle before opening another.
        if slot.handle.take().is_some() {
            log::info!("CameraSession: releasing stale device handle");
        }
        self.camera_active.store(false, Ordering::SeqCst);

        let handle = self.source.open()?;
        slot.handle = Some(handle);
        slot.status = DeviceStatus::Open;
        slot.consecutive_failures = 0;
        self.camera_active.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// Read one raw frame under the device lock.
    fn read_frame(&self) -> Result<Frame, SessionError> {
        let mut slot = self.lock_device();
        self.ensure_device_locked(&mut slot)?;

        let result = match slot.handle.as_mut() {
            Some(handle) => self.source.read(handle),
            None => Err(SourceError::ReadFailure("no device handle".to_string())),
        };
        match result {
            Ok(frame) => {
                slot.consecutive_failures = 0;
                Ok(frame)
            }
            Err(err) => {
                slot.consecutive_failures += 1;
                if slot.consecutive_failures >= self.config.max_read_failures {
                    log::warn!(
                        "CameraSession: {} consecutive read failures, releasing device: {}",
                        slot.consecutive_failures,
                        err
                    );
                    slot.handle = None;
                    slot.status = DeviceStatus::Broken;
                    slot.consecutive_failures = 0;
                    self.camera_active.store(false, Ordering::SeqCst);
                } else {
                    log::debug!("CameraSession: could not read frame: {}", err);
                }
                Err(err.into())
            }
        }
    }

    /// One processing cycle: read, annotate, feed the recording, encode.
    pub fn next_stream_frame(&self) -> Result<EncodedFrame, SessionError> {
        let frame = self.read_frame()?;
        let recording = self.is_recording();
        let frame = annotate(frame, self.clock.now(), recording);
        let encoded = self.encoder.encode_for_stream(&frame)?;
        if recording {
            let mut sink = self.lock_recording();
            if let Some(sink) = sink.as_mut() {
                self.encoder.feed_recording(&encoded, sink);
            }
        }
        Ok(encoded)
    }

    /// Start an independent frame sequence bound to the caller's connection.
    pub fn subscribe(self: &Arc<Self>) -> FrameStream {
        let count = self.subscribers.fetch_add(1, Ordering::SeqCst) + 1;
        log::debug!("CameraSession: subscriber joined ({} active)", count);
        FrameStream {
            session: Arc::clone(self),
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.load(Ordering::SeqCst)
    }

    pub fn start_recording(&self) -> Result<RecordingStarted, SessionError> {
        let mut recording = self.lock_recording();
        if recording.is_some() {
            return Err(SessionError::AlreadyRecording);
        }
        let filename = recording_filename(self.clock.now());
        let format = RecordingFormat {
            width: self.source.config().width,
            height: self.source.config().height,
            fps: self.config.recording_fps,
        };
        let sink = RecordingSink::start(
            &self.config.recordings_dir,
            &filename,
            format,
            self.recorder.as_ref(),
        )
        .map_err(|err| {
                log::error!("CameraSession: could not start recording: {}", err);
                SessionError::Io(err)
            })?;
        *recording = Some(sink);
        log::info!("CameraSession: recording started: {}", filename);
        Ok(RecordingStarted { filename })
    }

    /// Close the active recording. The file is finalized before this returns,
    /// and the recording lock is held until then.
    pub fn stop_recording(&self) -> Result<Option<RecordingSummary>, SessionError> {
        let mut recording = self.lock_recording();
        let sink = recording.take().ok_or(SessionError::NotRecording)?;
        let filename = sink.filename().to_string();
        let finalized = sink.stop();
        drop(recording);
        match finalized {
            Ok(summary) => {
                log::info!("CameraSession: recording stopped: {}", filename);
                Ok(Some(summary))
            }
            Err(err) => {
                log::error!(
                    "CameraSession: recording {} could not be finalized: {}",
                    filename,
                    err
                );
                Ok(None)
            }
        }
    }

    pub fn is_recording(&self) -> bool {
        self.lock_recording().is_some()
    }

    /// Current filename of the active recording, if any.
    pub fn recording_filename(&self) -> Option<String> {
        self.lock_recording()
            .as_ref()
            .map(|sink| sink.filename().to_string())
    }

    /// State snapshot. Does not wait on the device lock.
    pub fn status(&self) -> SessionStatus {
        SessionStatus {
            camera_active: self.camera_active.load(Ordering::SeqCst),
            recording: self.is_recording(),
            timestamp: iso_timestamp(self.clock.now()),
        }
    }

    pub fn device_status(&self) -> DeviceStatus {
        self.lock_device().status
    }

    /// Index of the currently open device.
    pub fn device_index(&self) -> Option<u32> {
        self.lock_device().handle.as_ref().map(DeviceHandle::index)
    }

    /// Finalize any open recording. The device is released with the session.
    pub fn shutdown(&self) {
        match self.stop_recording() {
            Ok(_) => log::info!("CameraSession: finalized recording on shutdown"),
            Err(SessionError::NotRecording) => {}
            Err(err) => log::warn!("CameraSession: shutdown: {}", err),
        }
    }

    fn lock_device(&self) -> MutexGuard<'_, DeviceSlot> {
        self.device.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_recording(&self) -> MutexGuard<'_, Option<RecordingSink>> {
        self.recording.lock().unwrap_or_else(|e| e.into_inner())
    }
}

// ----------------------------------------------------------------------------
// FrameStream: per-subscriber lazy sequence
// ----------------------------------------------------------------------------

/// Unbounded sequence of encoded frames for one subscriber.
///
/// Each `next()` drives one device read. Device failures are retried with
/// backoff; the iterator only ends once cancelled. Dropping it releases the
/// subscriber slot.
pub struct FrameStream {
    session: Arc<CameraSession>,
    cancel: Arc<AtomicBool>,
}

impl FrameStream {
    /// Share an external cancellation flag (e.g. server shutdown).
    pub fn with_cancel(mut self, cancel: Arc<AtomicBool>) -> Self {
        self.cancel = cancel;
        self
    }

    fn cancelled(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }

    /// Sleep in short slices so cancellation is observed promptly.
    fn pause(&self, total: Duration) {
        let mut remaining = total;
        while !remaining.is_zero() && !self.cancelled() {
            let step = remaining.min(BACKOFF_SLICE);
            std::thread::sleep(step);
            remaining -= step;
        }
    }
}

impl Iterator for FrameStream {
    type Item = EncodedFrame;

    fn next(&mut self) -> Option<EncodedFrame> {
        loop {
            if self.cancelled() {
                return None;
            }
            match self.session.next_stream_frame() {
                Ok(frame) => return Some(frame),
                Err(SessionError::Source(SourceError::DeviceNotFound { .. })) => {
                    self.pause(self.session.config.open_backoff);
                }
                Err(SessionError::Encode(err)) => {
                    log::debug!("FrameStream: skipping frame: {}", err);
                }
                Err(err) => {
                    log::debug!("FrameStream: retrying after: {}", err);
                    self.pause(self.session.config.read_backoff);
                }
            }
        }
    }
}

impl Drop for FrameStream {
    fn drop(&mut self) {
        let left = self.session.subscribers.fetch_sub(1, Ordering::SeqCst) - 1;
        log::debug!("CameraSession: subscriber left ({} active)", left);
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FixedClock;
    use crate::ingest::{CaptureConfig, CaptureDevice, DeviceProbe};
    use crate::record::test_support::AppendBackend;
    use anyhow::Result;
    use chrono::{NaiveDate, NaiveDateTime};
    use tempfile::{tempdir, TempDir};

    /// Scripted camera bay: which indices open, and whether reads fail.
    #[derive(Default)]
    struct Bay {
        available: Vec<u32>,
        failing_reads: bool,
        open_attempts: Vec<u32>,
    }

    struct BayProbe(Arc<Mutex<Bay>>);

    struct BayDevice {
        index: u32,
        bay: Arc<Mutex<Bay>>,
        width: u32,
        height: u32,
    }

    impl DeviceProbe for BayProbe {
        fn open_index(
            &self,
            index: u32,
            config: &CaptureConfig,
        ) -> anyhow::Result<Box<dyn CaptureDevice>> {
            let mut bay = self.0.lock().unwrap();
            bay.open_attempts.push(index);
            if !bay.available.contains(&index) {
                anyhow::bail!("no camera at {index}");
            }
            Ok(Box::new(BayDevice {
                index,
                bay: self.0.clone(),
                width: config.width,
                height: config.height,
            }))
        }
    }

    impl CaptureDevice for BayDevice {
        fn read(&mut self) -> Result<Frame, SourceError> {
            if self.bay.lock().unwrap().failing_reads {
                return Err(SourceError::ReadFailure("unplugged".to_string()));
            }
            Ok(Frame::filled(self.width, self.height, [50, 60, 70]))
        }

        fn is_open(&self) -> bool {
            true
        }

        fn describe(&self) -> String {
            format!("bay{}", self.index)
        }
    }

    struct Fixture {
        session: Arc<CameraSession>,
        bay: Arc<Mutex<Bay>>,
        clock: Arc<FixedClock>,
        finishing: Arc<AtomicBool>,
        finalized: Arc<AtomicBool>,
        dir: TempDir,
    }

    fn new_year() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 1, 1)
            .and_then(|d| d.and_hms_opt(0, 0, 0))
            .expect("valid date")
    }

    fn fixture(available: Vec<u32>) -> Fixture {
        fixture_with_finish_delay(available, Duration::ZERO)
    }

    fn fixture_with_finish_delay(available: Vec<u32>, finish_delay: Duration) -> Fixture {
        let bay = Arc::new(Mutex::new(Bay {
            available,
            ..Bay::default()
        }));
        let dir = tempdir().expect("tempdir");
        let capture = CaptureConfig {
            device_prefix: "stub://bay".to_string(),
            width: 64,
            height: 48,
            target_fps: 0,
            ..CaptureConfig::default()
        };
        let source = FrameSource::new(Box::new(BayProbe(bay.clone())), capture);
        let config = SessionConfig {
            recordings_dir: dir.path().join("recordings"),
            open_backoff: Duration::from_millis(10),
            read_backoff: Duration::from_millis(1),
            max_read_failures: 3,
            ..SessionConfig::default()
        };
        let clock = Arc::new(FixedClock::new(new_year()));
        let backend = AppendBackend {
            finish_delay,
            ..AppendBackend::default()
        };
        let finishing = backend.finishing.clone();
        let finalized = backend.finalized.clone();
        let session = Arc::new(CameraSession::new(
            source,
            Arc::new(backend),
            config,
            clock.clone(),
        ));
        Fixture {
            session,
            bay,
            clock,
            finishing,
            finalized,
            dir,
        }
    }

    #[test]
    fn second_start_is_rejected_and_keeps_filename() -> Result<()> {
        let fx = fixture(vec![0]);
        let started = fx.session.start_recording()?;
        assert_eq!(started.filename, "recording_20240101_000000.mp4");

        fx.clock.advance(chrono::Duration::seconds(5));
        let err = fx.session.start_recording().unwrap_err();
        assert!(matches!(err, SessionError::AlreadyRecording));
        assert_eq!(
            fx.session.recording_filename().as_deref(),
            Some("recording_20240101_000000.mp4")
        );
        Ok(())
    }

    #[test]
    fn stop_when_idle_is_rejected_without_side_effects() {
        let fx = fixture(vec![0]);
        let err = fx.session.stop_recording().unwrap_err();
        assert!(matches!(err, SessionError::NotRecording));
        assert!(!fx.session.status().recording);
        assert!(!fx.dir.path().join("recordings").exists());
    }

    #[test]
    fn status_tracks_recording_and_stop_finalizes_file() -> Result<()> {
        let fx = fixture(vec![0]);
        fx.session.start_recording()?;
        assert!(fx.session.status().recording);

        for _ in 0..4 {
            fx.session.next_stream_frame()?;
        }

        let summary = fx.session.stop_recording()?.expect("finalized");
        assert_eq!(summary.frames, 4);
        assert!(fx.finalized.load(Ordering::SeqCst));
        let status = fx.session.status();
        assert!(!status.recording);
        assert_eq!(status.timestamp, "2024-01-01T00:00:00.000000");

        let path = fx
            .dir
            .path()
            .join("recordings")
            .join("recording_20240101_000000.mp4");
        assert!(std::fs::metadata(&path)?.len() > 0);

        // Closed sink: further frames are not written anywhere.
        fx.session.next_stream_frame()?;
        assert_eq!(std::fs::metadata(&path)?.len(), summary.bytes);
        Ok(())
    }

    #[test]
    fn start_racing_stop_sees_previous_file_finalized() -> Result<()> {
        let fx = fixture_with_finish_delay(vec![0], Duration::from_millis(150));
        fx.session.start_recording()?;
        fx.session.next_stream_frame()?;

        let session = fx.session.clone();
        let stopper = std::thread::spawn(move || session.stop_recording());
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while !fx.finishing.load(Ordering::SeqCst) {
            assert!(std::time::Instant::now() < deadline, "stop never began finalizing");
            std::thread::sleep(Duration::from_millis(1));
        }

        fx.clock.advance(chrono::Duration::seconds(1));
        let started = fx.session.start_recording()?;
        assert!(
            fx.finalized.load(Ordering::SeqCst),
            "new recording began while the previous file was still open"
        );
        assert_eq!(started.filename, "recording_20240101_000001.mp4");

        let summary = stopper
            .join()
            .expect("stop thread panicked")?
            .expect("finalized");
        assert_eq!(summary.filename, "recording_20240101_000000.mp4");
        assert_eq!(summary.frames, 1);
        assert!(fx.session.status().recording);
        Ok(())
    }

    #[test]
    fn start_failure_surfaces_io_error_and_stays_idle() -> Result<()> {
        let fx = fixture(vec![0]);
        std::fs::write(fx.dir.path().join("recordings"), b"blocking file")?;
        let err = fx.session.start_recording().unwrap_err();
        assert!(matches!(err, SessionError::Io(_)));
        assert!(!fx.session.is_recording());
        Ok(())
    }

    #[test]
    fn camera_status_reflects_device_presence() -> Result<()> {
        let fx = fixture(vec![]);
        assert!(!fx.session.status().camera_active);
        assert_eq!(fx.session.device_status(), DeviceStatus::Closed);

        fx.bay.lock().unwrap().available = vec![2];
        fx.session.ensure_device()?;
        assert!(fx.session.status().camera_active);
        assert_eq!(fx.session.device_index(), Some(2));
        Ok(())
    }

    #[test]
    fn persistent_read_failure_rescans_from_index_zero() -> Result<()> {
        let fx = fixture(vec![1]);
        assert_eq!(fx.session.device_index(), Some(1));

        fx.bay.lock().unwrap().failing_reads = true;
        for _ in 0..3 {
            assert!(fx.session.next_stream_frame().is_err());
        }
        assert_eq!(fx.session.device_status(), DeviceStatus::Broken);
        assert!(!fx.session.status().camera_active);

        {
            let mut bay = fx.bay.lock().unwrap();
            bay.failing_reads = false;
            bay.available = vec![0, 1];
            bay.open_attempts.clear();
        }
        fx.session.next_stream_frame()?;
        assert_eq!(fx.session.device_index(), Some(0));
        assert_eq!(fx.bay.lock().unwrap().open_attempts, vec![0]);
        Ok(())
    }

    #[test]
    fn transient_read_failure_keeps_the_handle() -> Result<()> {
        let fx = fixture(vec![0]);
        fx.bay.lock().unwrap().failing_reads = true;
        assert!(fx.session.next_stream_frame().is_err());
        fx.bay.lock().unwrap().failing_reads = false;
        fx.session.next_stream_frame()?;
        assert_eq!(fx.bay.lock().unwrap().open_attempts, vec![0]);
        assert_eq!(fx.session.device_status(), DeviceStatus::Open);
        Ok(())
    }

    #[test]
    fn stream_waits_for_camera_and_releases_subscriber_on_drop() {
        let fx = fixture(vec![]);
        let mut stream = fx.session.subscribe();
        assert_eq!(fx.session.subscriber_count(), 1);

        let bay = fx.bay.clone();
        let plug_in = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            bay.lock().unwrap().available = vec![0];
        });
        let frame = stream.next().expect("stream yields once camera appears");
        assert_eq!(&frame.as_bytes()[..2], &[0xFF, 0xD8]);
        plug_in.join().unwrap();

        drop(stream);
        assert_eq!(fx.session.subscriber_count(), 0);
    }

    #[test]
    fn cancelled_stream_ends() {
        let fx = fixture(vec![]);
        let cancel = Arc::new(AtomicBool::new(true));
        let mut stream = fx.session.subscribe().with_cancel(cancel);
        assert!(stream.next().is_none());
    }

    #[test]
    fn concurrent_subscribers_each_get_frames() {
        let fx = fixture(vec![0]);
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let session = fx.session.clone();
                std::thread::spawn(move || session.subscribe().take(5).count())
            })
            .collect();
        for handle in handles {
            assert_eq!(handle.join().unwrap(), 5);
        }
        assert_eq!(fx.session.subscriber_count(), 0);
    }
}
