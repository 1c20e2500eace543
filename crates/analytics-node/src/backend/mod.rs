//! Analysis backends
//!
//! A backend turns one frame into a structured payload. Model names are
//! resolved once, at stream creation, into the closed [`ModelKind`] set; each
//! model maps to one [`AnalysisMode`] that the backend understands.

pub mod mock;
pub mod registry;
pub mod vision;

use crate::source::Frame;
use async_trait::async_trait;
use common::analysis::AnalysisPayload;
use serde_json::json;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Instruction family sent to a backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AnalysisMode {
    Generic,
    ObjectInventory,
    DefectInspection,
    AssetTracking,
}

impl AnalysisMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            AnalysisMode::Generic => "generic",
            AnalysisMode::ObjectInventory => "object_inventory",
            AnalysisMode::DefectInspection => "defect_inspection",
            AnalysisMode::AssetTracking => "asset_tracking",
        }
    }
}

impl fmt::Display for AnalysisMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Model names a stream may be configured with
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModelKind {
    ObjectDetection,
    DefectAnalysis,
    AssetTracking,
    General,
}

impl ModelKind {
    pub const ALL: [ModelKind; 4] = [
        ModelKind::ObjectDetection,
        ModelKind::DefectAnalysis,
        ModelKind::AssetTracking,
        ModelKind::General,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            ModelKind::ObjectDetection => "object_detection",
            ModelKind::DefectAnalysis => "defect_analysis",
            ModelKind::AssetTracking => "asset_tracking",
            ModelKind::General => "general",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.name() == name)
    }

    pub fn mode(&self) -> AnalysisMode {
        match self {
            ModelKind::ObjectDetection => AnalysisMode::ObjectInventory,
            ModelKind::DefectAnalysis => AnalysisMode::DefectInspection,
            ModelKind::AssetTracking => AnalysisMode::AssetTracking,
            ModelKind::General => AnalysisMode::Generic,
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            ModelKind::ObjectDetection => "Object inventory: classes, locations and sizes",
            ModelKind::DefectAnalysis => "Defect and quality inspection with severity levels",
            ModelKind::AssetTracking => "Asset and equipment tracking with operational status",
            ModelKind::General => "General scene analysis",
        }
    }
}

impl fmt::Display for ModelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A failed analysis call. Local to one dispatch; never fatal to a stream.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum BackendError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("backend returned status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("backend call timed out after {0:?}")]
    Timeout(Duration),

    #[error("unusable backend response: {0}")]
    Unusable(String),

    #[error("failed to encode frame: {0}")]
    Encode(String),
}

impl BackendError {
    /// Payload recorded in place of a result when the call failed
    pub fn to_payload(&self) -> AnalysisPayload {
        let mut payload = AnalysisPayload::new();
        payload.insert("error".to_string(), json!(self.to_string()));
        payload.insert("analysis".to_string(), json!("Analysis failed"));
        payload.insert("confidence".to_string(), json!(0.0));
        payload
    }
}

/// Uniform capability every backend variant implements
#[async_trait]
pub trait AnalysisBackend: Send + Sync {
    /// Stable identifier (e.g. "mock", "anthropic_vision")
    fn id(&self) -> &'static str;

    /// Whether this variant delegates to an external vision model
    fn is_external(&self) -> bool {
        false
    }

    /// Analyze a single frame. Backends see no frame history.
    async fn analyze(
        &self,
        frame: &Frame,
        mode: AnalysisMode,
    ) -> Result<AnalysisPayload, BackendError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_model_names_resolve() {
        for kind in ModelKind::ALL {
            assert_eq!(ModelKind::from_name(kind.name()), Some(kind));
        }
        assert_eq!(ModelKind::from_name("face_recognition"), None);
        assert_eq!(ModelKind::from_name("Object_Detection"), None);
    }

    #[test]
    fn test_model_modes() {
        assert_eq!(ModelKind::ObjectDetection.mode(), AnalysisMode::ObjectInventory);
        assert_eq!(ModelKind::DefectAnalysis.mode(), AnalysisMode::DefectInspection);
        assert_eq!(ModelKind::AssetTracking.mode().as_str(), "asset_tracking");
        assert_eq!(ModelKind::General.mode().as_str(), "generic");
    }

    #[test]
    fn test_failure_payload_carries_error_marker() {
        let payload = BackendError::Timeout(Duration::from_secs(30)).to_payload();
        assert!(payload["error"].as_str().unwrap().contains("timed out"));
        assert_eq!(payload["analysis"], "Analysis failed");
        assert_eq!(payload["confidence"], 0.0);
    }
}
