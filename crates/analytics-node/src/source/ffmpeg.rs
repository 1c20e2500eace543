//! Capture through the `ffmpeg` CLI
//!
//! Each open source owns one ffmpeg child process decoding the input and
//! writing packed `rgb24` frames of a fixed size to its stdout. The process is
//! killed on close and on drop.

use super::{Frame, FrameEvent, FrameSource, SourceError, SourceOpener};
use async_trait::async_trait;
use common::streams::{SourceKind, StreamDescriptor};
use common::validation::parse_device_index;
use std::path::Path;
use std::process::Stdio;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, ChildStdout, Command};
use tracing::{debug, info, warn};

/// Capture tool settings shared by every source
#[derive(Debug, Clone)]
pub struct FfmpegSettings {
    /// Path to the ffmpeg binary
    pub binary: String,
    pub width: u32,
    pub height: u32,
}

impl Default for FfmpegSettings {
    fn default() -> Self {
        Self {
            binary: "ffmpeg".to_string(),
            width: 640,
            height: 480,
        }
    }
}

impl FfmpegSettings {
    fn frame_len(&self) -> usize {
        self.width as usize * self.height as usize * 3
    }
}

/// Opens [`FfmpegSource`]s
#[derive(Debug, Clone, Default)]
pub struct FfmpegOpener {
    settings: FfmpegSettings,
}

impl FfmpegOpener {
    pub fn new(settings: FfmpegSettings) -> Self {
        Self { settings }
    }
}

#[async_trait]
impl SourceOpener for FfmpegOpener {
    async fn open(
        &self,
        descriptor: &StreamDescriptor,
    ) -> Result<Box<dyn FrameSource>, SourceError> {
        let source = FfmpegSource::open(
            descriptor.source,
            descriptor.source_path.clone(),
            self.settings.clone(),
        )
        .await?;
        Ok(Box::new(source))
    }
}

/// Build the ffmpeg argument list for a source
pub fn build_input_args(
    kind: SourceKind,
    locator: &str,
    settings: &FfmpegSettings,
) -> Result<Vec<String>, SourceError> {
    let mut args: Vec<String> = ["-hide_banner", "-loglevel", "error", "-nostdin"]
        .iter()
        .map(|s| s.to_string())
        .collect();

    match kind {
        SourceKind::LiveDevice => {
            let index = parse_device_index(locator, "source_path")
                .map_err(|e| SourceError::Unavailable(e.to_string()))?;
            args.extend(device_input_args(index));
        }
        SourceKind::NetworkStream => {
            if locator.starts_with("rtsp://") || locator.starts_with("rtsps://") {
                args.push("-rtsp_transport".to_string());
                args.push("tcp".to_string());
            }
            args.push("-i".to_string());
            args.push(locator.to_string());
        }
        SourceKind::File => {
            args.push("-i".to_string());
            args.push(locator.to_string());
        }
    }

    args.extend([
        "-an".to_string(),
        "-vf".to_string(),
        format!("scale={}:{}", settings.width, settings.height),
        "-pix_fmt".to_string(),
        "rgb24".to_string(),
        "-f".to_string(),
        "rawvideo".to_string(),
        "pipe:1".to_string(),
    ]);

    Ok(args)
}

#[cfg(target_os = "linux")]
fn device_input_args(index: u32) -> Vec<String> {
    vec![
        "-f".to_string(),
        "v4l2".to_string(),
        "-i".to_string(),
        format!("/dev/video{}", index),
    ]
}

#[cfg(target_os = "macos")]
fn device_input_args(index: u32) -> Vec<String> {
    vec![
        "-f".to_string(),
        "avfoundation".to_string(),
        "-i".to_string(),
        index.to_string(),
    ]
}

#[cfg(not(any(target_os = "linux", target_os = "macos")))]
fn device_input_args(index: u32) -> Vec<String> {
    vec![
        "-f".to_string(),
        "dshow".to_string(),
        "-video_device_number".to_string(),
        index.to_string(),
        "-i".to_string(),
        "video=default".to_string(),
    ]
}

/// A capture source backed by an ffmpeg child process
pub struct FfmpegSource {
    kind: SourceKind,
    locator: String,
    settings: FfmpegSettings,
    child: Option<Child>,
    stdout: Option<ChildStdout>,
    /// First frame, read while opening to prove the source works
    pending: Option<Vec<u8>>,
    sequence: u64,
}

impl FfmpegSource {
    /// Spawn the capture process and wait for its first frame
    pub async fn open(
        kind: SourceKind,
        locator: String,
        settings: FfmpegSettings,
    ) -> Result<Self, SourceError> {
        if kind == SourceKind::File && !Path::new(&locator).exists() {
            return Err(SourceError::Unavailable(format!(
                "video file not found: {}",
                locator
            )));
        }

        let mut source = Self {
            kind,
            locator,
            settings,
            child: None,
            stdout: None,
            pending: None,
            sequence: 0,
        };

        source.spawn()?;

        match source.read_raw().await {
            Ok(Some(first)) => source.pending = Some(first),
            Ok(None) => {
                source.close().await;
                return Err(SourceError::Unavailable(format!(
                    "{} produced no frames",
                    source.locator
                )));
            }
            Err(e) => {
                source.close().await;
                return Err(SourceError::Unavailable(e.to_string()));
            }
        }

        info!(
            kind = %source.kind,
            locator = %source.locator,
            width = source.settings.width,
            height = source.settings.height,
            "capture source opened"
        );
        Ok(source)
    }

    fn spawn(&mut self) -> Result<(), SourceError> {
        let args = build_input_args(self.kind, &self.locator, &self.settings)?;
        debug!(args = ?args, "spawning ffmpeg capture process");

        let mut child = Command::new(&self.settings.binary)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| SourceError::Unavailable(format!("failed to execute ffmpeg: {}", e)))?;

        self.stdout = child.stdout.take();
        self.child = Some(child);
        Ok(())
    }

    /// Read one full frame. `Ok(None)` means the pipe ended, including a
    /// truncated trailing frame.
    async fn read_raw(&mut self) -> Result<Option<Vec<u8>>, SourceError> {
        let frame_len = self.settings.frame_len();
        let stdout = self
            .stdout
            .as_mut()
            .ok_or_else(|| SourceError::ReadFailure("capture process is not running".to_string()))?;

        let mut buf = vec![0u8; frame_len];
        let mut filled = 0;
        while filled < frame_len {
            let n = stdout
                .read(&mut buf[filled..])
                .await
                .map_err(|e| SourceError::ReadFailure(e.to_string()))?;
            if n == 0 {
                break;
            }
            filled += n;
        }

        if filled < frame_len {
            if filled > 0 {
                debug!(
                    locator = %self.locator,
                    bytes = filled,
                    expected = frame_len,
                    "discarding truncated trailing frame"
                );
            }
            return Ok(None);
        }

        Ok(Some(buf))
    }

    async fn kill_child(&mut self) {
        self.stdout = None;
        if let Some(mut child) = self.child.take() {
            if let Err(e) = child.kill().await {
                warn!(locator = %self.locator, error = %e, "failed to kill ffmpeg process");
            }
        }
    }
}

#[async_trait]
impl FrameSource for FfmpegSource {
    fn kind(&self) -> SourceKind {
        self.kind
    }

    async fn next_frame(&mut self) -> Result<FrameEvent, SourceError> {
        let pixels = match self.pending.take() {
            Some(pixels) => pixels,
            None => match self.read_raw().await? {
                Some(pixels) => pixels,
                None => return Ok(FrameEvent::EndOfStream),
            },
        };

        self.sequence += 1;
        Ok(FrameEvent::Frame(Frame::new(
            self.sequence,
            self.settings.width,
            self.settings.height,
            pixels,
        )))
    }

    async fn reset(&mut self) -> Result<(), SourceError> {
        if !self.kind.is_rewindable() {
            return Err(SourceError::Unsupported(self.kind));
        }

        self.kill_child().await;
        self.pending = None;
        self.spawn()?;
        debug!(locator = %self.locator, "capture source rewound");
        Ok(())
    }

    async fn close(&mut self) {
        if self.child.is_some() {
            self.kill_child().await;
            debug!(locator = %self.locator, "capture source closed");
        }
        self.pending = None;
    }
}
