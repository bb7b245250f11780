//! Error taxonomy for the capture, encode and session layers.
//!
//! Glue code (API server, config, binary) uses `anyhow::Result`; the types here
//! exist so the session can decide between retrying, skipping a frame and
//! reporting a user-facing conflict.

use thiserror::Error;

/// Failures reported by a frame source.
#[derive(Debug, Error)]
pub enum SourceError {
    /// No device index in the scan range could be opened.
    #[error("no capture device found (scanned indices 0..{scanned})")]
    DeviceNotFound { scanned: u32 },

    /// A read from an open device failed. Transient; the caller retries.
    #[error("frame read failed: {0}")]
    ReadFailure(String),
}

/// Failures while compressing a frame for delivery.
#[derive(Debug, Error)]
pub enum EncodeError {
    #[error("frame buffer is {actual} bytes, expected {expected} for {width}x{height} RGB24")]
    BufferMismatch {
        width: u32,
        height: u32,
        expected: usize,
        actual: usize,
    },

    #[error("jpeg encode failed: {0}")]
    Jpeg(#[from] image::ImageError),
}

/// Errors surfaced by `CameraSession` operations.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("already recording")]
    AlreadyRecording,

    #[error("not recording")]
    NotRecording,

    #[error("failed to start recording: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Source(#[from] SourceError),

    #[error(transparent)]
    Encode(#[from] EncodeError),
}
