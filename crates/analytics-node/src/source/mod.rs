//! Frame source adapter
//!
//! Wraps an external capture capability behind [`FrameSource`]: a sequence of
//! raw frames terminated by end-of-stream or a failure. The end-of-stream
//! policy lives with the caller: file sources rewind, live and network
//! sources are gone for good.

pub mod ffmpeg;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::streams::{SourceKind, StreamDescriptor};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// One decoded frame, packed RGB24 (`width * height * 3` bytes)
#[derive(Debug, Clone)]
pub struct Frame {
    /// Position within the source since it was opened (resets do not rewind it)
    pub sequence: u64,
    pub width: u32,
    pub height: u32,
    pub pixels: Arc<[u8]>,
    pub captured_at: DateTime<Utc>,
}

impl Frame {
    pub fn new(sequence: u64, width: u32, height: u32, pixels: impl Into<Arc<[u8]>>) -> Self {
        Self {
            sequence,
            width,
            height,
            pixels: pixels.into(),
            captured_at: Utc::now(),
        }
    }

    /// Human-readable frame size, e.g. `640x480`
    pub fn size_label(&self) -> String {
        format!("{}x{}", self.width, self.height)
    }
}

/// Outcome of a successful read
#[derive(Debug)]
pub enum FrameEvent {
    Frame(Frame),
    EndOfStream,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SourceError {
    #[error("source unavailable: {0}")]
    Unavailable(String),

    #[error("source did not open within {0:?}")]
    OpenTimeout(Duration),

    #[error("read failure: {0}")]
    ReadFailure(String),

    /// A single bad frame; the source itself is still usable
    #[error("transient read error: {0}")]
    Transient(String),

    #[error("operation not supported for {0} sources")]
    Unsupported(SourceKind),
}

impl SourceError {
    pub fn is_transient(&self) -> bool {
        matches!(self, SourceError::Transient(_))
    }

    /// Short label used for metrics
    pub fn reason(&self) -> &'static str {
        match self {
            SourceError::Unavailable(_) => "unavailable",
            SourceError::OpenTimeout(_) => "open_timeout",
            SourceError::ReadFailure(_) => "read_failure",
            SourceError::Transient(_) => "transient",
            SourceError::Unsupported(_) => "unsupported",
        }
    }
}

/// An opened capture source
#[async_trait]
pub trait FrameSource: Send {
    fn kind(&self) -> SourceKind;

    /// Pull the next frame
    async fn next_frame(&mut self) -> Result<FrameEvent, SourceError>;

    /// Reposition to the first frame. Only file sources support this.
    async fn reset(&mut self) -> Result<(), SourceError>;

    /// Release the underlying resources. Idempotent.
    async fn close(&mut self);
}

/// Opens capture sources for stream descriptors
#[async_trait]
pub trait SourceOpener: Send + Sync {
    async fn open(&self, descriptor: &StreamDescriptor)
        -> Result<Box<dyn FrameSource>, SourceError>;
}

/// Open timeouts per source kind
#[derive(Debug, Clone, Copy)]
pub struct OpenTimeouts {
    pub device: Duration,
    pub network: Duration,
    pub file: Duration,
}

impl OpenTimeouts {
    pub fn for_kind(&self, kind: SourceKind) -> Duration {
        match kind {
            SourceKind::LiveDevice => self.device,
            SourceKind::NetworkStream => self.network,
            SourceKind::File => self.file,
        }
    }
}

impl Default for OpenTimeouts {
    fn default() -> Self {
        Self {
            device: Duration::from_secs(5),
            network: Duration::from_secs(10),
            file: Duration::from_secs(5),
        }
    }
}

/// Open a source, failing with [`SourceError::OpenTimeout`] instead of blocking
pub async fn open_bounded(
    opener: &dyn SourceOpener,
    descriptor: &StreamDescriptor,
    timeout: Duration,
) -> Result<Box<dyn FrameSource>, SourceError> {
    match tokio::time::timeout(timeout, opener.open(descriptor)).await {
        Ok(result) => result,
        Err(_) => Err(SourceError::OpenTimeout(timeout)),
    }
}
