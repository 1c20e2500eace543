//! Stream contracts shared between the analytics engine and its control plane.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Kind of capture source backing a stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SourceKind {
    /// Local capture device addressed by index (e.g. "0")
    #[serde(rename = "webcam", alias = "live_device")]
    LiveDevice,

    /// Network stream addressed by URL (RTSP, HTTP, ...)
    #[serde(rename = "rtsp", alias = "network_stream")]
    NetworkStream,

    /// Video file on local disk; loops forever
    #[serde(rename = "file")]
    File,
}

impl SourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::LiveDevice => "webcam",
            SourceKind::NetworkStream => "rtsp",
            SourceKind::File => "file",
        }
    }

    /// File sources rewind on end-of-stream; live and network sources are gone.
    pub fn is_rewindable(&self) -> bool {
        matches!(self, SourceKind::File)
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SourceKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "webcam" | "live_device" => Ok(SourceKind::LiveDevice),
            "rtsp" | "network_stream" => Ok(SourceKind::NetworkStream),
            "file" => Ok(SourceKind::File),
            _ => Err(format!("Invalid source kind: {}", s)),
        }
    }
}

/// Identity and configuration for one feed
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StreamDescriptor {
    /// Unique stream identifier; generated when left empty on creation
    #[serde(default)]
    pub stream_id: String,

    /// Source kind
    pub source: SourceKind,

    /// Device index, URL or file path depending on `source`
    pub source_path: String,

    /// Ordered backend model names run against every dispatched frame
    pub ai_models: Vec<String>,

    /// Owned by the worker lifecycle; ignored on creation
    #[serde(default)]
    pub is_active: bool,
}

/// Stream worker lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    #[default]
    Stopped,
    Starting,
    Running,
    Stopping,
}

impl WorkerState {
    pub fn is_active(&self) -> bool {
        matches!(self, WorkerState::Starting | WorkerState::Running)
    }
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            WorkerState::Stopped => "stopped",
            WorkerState::Starting => "starting",
            WorkerState::Running => "running",
            WorkerState::Stopping => "stopping",
        };
        f.write_str(s)
    }
}

/// Read-only view of a stream and its worker
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamSnapshot {
    pub stream_id: String,
    pub config: StreamDescriptor,
    pub state: WorkerState,
    pub is_running: bool,
    pub frame_count: u64,
    pub dispatch_count: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_dispatch: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub last_update: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamListResponse {
    pub streams: Vec<StreamSnapshot>,
    pub total: usize,
}

/// Acknowledgement returned by create/start/stop/delete
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamActionResponse {
    pub message: String,
    pub stream_id: String,
}
