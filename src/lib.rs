//! camgate
//!
//! Exposes a single webcam as a network service: a live MJPEG stream over
//! HTTP, optional concurrent recording to MP4 files, and a single
//! process-lifetime token gating every route.
//!
//! # Architecture
//!
//! One `CameraSession` owns the capture device and the recording state.
//! Every streaming client pulls frames through it:
//!
//! ```text
//! FrameSource -> annotate -> FrameEncoder -> subscriber socket
//!                                         \-> RecordingSink (while recording)
//! ```
//!
//! # Module Structure
//!
//! - `ingest`: device discovery and raw frame acquisition (V4L2, synthetic)
//! - `frame`: RGB24 and JPEG frame types
//! - `annotate`: mirror, timestamp and REC overlays
//! - `encode`: JPEG encoding and recording handoff
//! - `record`: MP4 recording sink, encoder backends and recordings listing
//! - `session`: the camera session manager
//! - `api`: HTTP routes, token gate, multipart streaming
//! - `config`: file and environment configuration

pub mod annotate;
pub mod api;
pub mod clock;
pub mod config;
pub mod encode;
pub mod error;
pub mod frame;
pub mod ingest;
pub mod record;
pub mod session;

pub use clock::{Clock, FixedClock, SystemClock};
pub use error::{EncodeError, SessionError, SourceError};
pub use frame::{EncodedFrame, Frame, FRAME_HEIGHT, FRAME_WIDTH};
pub use ingest::{CaptureConfig, FrameSource};
pub use record::{list_recordings, RecordingEntry, VideoBackend, VideoWriter};
pub use session::{CameraSession, FrameStream, SessionConfig, SessionStatus};
