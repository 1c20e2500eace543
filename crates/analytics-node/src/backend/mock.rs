/// Deterministic offline backend used when no vision service is configured
use super::{AnalysisBackend, AnalysisMode, BackendError};
use crate::source::Frame;
use async_trait::async_trait;
use common::analysis::AnalysisPayload;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MockBackendConfig {
    /// Simulate processing delay in milliseconds
    #[serde(default)]
    pub simulated_delay_ms: u64,
}

/// Mock analysis backend
#[derive(Debug, Clone, Default)]
pub struct MockBackend {
    config: MockBackendConfig,
}

impl MockBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(config: MockBackendConfig) -> Self {
        Self { config }
    }

    fn payload(frame: &Frame, mode: AnalysisMode) -> Value {
        let frame_size = frame.size_label();
        match mode {
            AnalysisMode::ObjectInventory => json!({
                "objects": [
                    {"class": "person", "confidence": 0.85, "bbox": [100, 100, 200, 300], "location": "center"},
                    {"class": "car", "confidence": 0.72, "bbox": [300, 150, 500, 400], "location": "right"}
                ],
                "count": 2,
                "frame_size": frame_size,
                "analysis_type": "object_detection"
            }),
            AnalysisMode::DefectInspection => json!({
                "defects": [
                    {"type": "scratch", "severity": "minor", "location": [150, 200], "confidence": 0.78}
                ],
                "defect_count": 1,
                "quality_score": 0.88,
                "frame_size": frame_size,
                "analysis_type": "defect_analysis"
            }),
            AnalysisMode::AssetTracking => json!({
                "assets": [
                    {"id": "asset_001", "type": "equipment", "status": "operational", "location": "zone_a"}
                ],
                "total_assets": 1,
                "frame_size": frame_size,
                "analysis_type": "asset_tracking"
            }),
            AnalysisMode::Generic => json!({
                "processed": true,
                "frame_size": frame_size,
                "analysis_type": "general",
                "timestamp": frame.captured_at.to_rfc3339()
            }),
        }
    }
}

#[async_trait]
impl AnalysisBackend for MockBackend {
    fn id(&self) -> &'static str {
        "mock"
    }

    async fn analyze(
        &self,
        frame: &Frame,
        mode: AnalysisMode,
    ) -> Result<AnalysisPayload, BackendError> {
        if self.config.simulated_delay_ms > 0 {
            tokio::time::sleep(Duration::from_millis(self.config.simulated_delay_ms)).await;
        }

        match Self::payload(frame, mode) {
            Value::Object(payload) => Ok(payload),
            other => Err(BackendError::Unusable(format!(
                "mock payload is not an object: {}",
                other
            ))),
        }
    }
}
