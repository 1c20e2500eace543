use super::{AnalysisBackend, BackendError, ModelKind};
use crate::source::Frame;
use common::analysis::{AnalysisPayload, ModelInfo, ModelListResponse};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use telemetry::metrics::BACKEND_LATENCY;
use thiserror::Error;
use tracing::debug;

pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(30);

/// Model names that did not resolve, in the order they were given
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("Invalid AI models: {}", .0.join(", "))]
pub struct UnknownModels(pub Vec<String>);

/// Maps model names to the active backend variant and bounds every call.
///
/// The registry is stateless between calls and cheap to clone; every worker
/// shares one instance.
#[derive(Clone)]
pub struct BackendRegistry {
    backend: Arc<dyn AnalysisBackend>,
    call_timeout: Duration,
}

impl BackendRegistry {
    pub fn new(backend: Arc<dyn AnalysisBackend>) -> Self {
        Self {
            backend,
            call_timeout: DEFAULT_CALL_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, call_timeout: Duration) -> Self {
        self.call_timeout = call_timeout;
        self
    }

    pub fn backend_id(&self) -> &'static str {
        self.backend.id()
    }

    pub fn is_external(&self) -> bool {
        self.backend.is_external()
    }

    pub fn call_timeout(&self) -> Duration {
        self.call_timeout
    }

    /// Resolve configured model names. Duplicates collapse to their first
    /// occurrence; any unknown name rejects the whole list.
    pub fn resolve(&self, names: &[String]) -> Result<Vec<ModelKind>, UnknownModels> {
        let mut resolved = Vec::with_capacity(names.len());
        let mut unknown = Vec::new();

        for name in names {
            match ModelKind::from_name(name.trim()) {
                Some(kind) if !resolved.contains(&kind) => resolved.push(kind),
                Some(_) => {}
                None => unknown.push(name.clone()),
            }
        }

        if unknown.is_empty() {
            Ok(resolved)
        } else {
            Err(UnknownModels(unknown))
        }
    }

    /// Run one model against one frame within the call timeout
    pub async fn analyze(
        &self,
        frame: &Frame,
        model: ModelKind,
    ) -> Result<AnalysisPayload, BackendError> {
        let started = Instant::now();
        let outcome =
            tokio::time::timeout(self.call_timeout, self.backend.analyze(frame, model.mode()))
                .await
                .unwrap_or(Err(BackendError::Timeout(self.call_timeout)));

        let elapsed = started.elapsed();
        BACKEND_LATENCY
            .with_label_values(&[model.name()])
            .observe(elapsed.as_secs_f64());
        debug!(
            model = %model,
            backend = self.backend.id(),
            frame = frame.sequence,
            elapsed_ms = elapsed.as_millis() as u64,
            ok = outcome.is_ok(),
            "backend call finished"
        );

        outcome
    }

    /// Describe every model this node accepts
    pub fn describe(&self) -> ModelListResponse {
        let external = self.backend.is_external();
        let models: BTreeMap<String, ModelInfo> = ModelKind::ALL
            .iter()
            .map(|kind| {
                (
                    kind.name().to_string(),
                    ModelInfo {
                        name: kind.name().to_string(),
                        mode: kind.mode().as_str().to_string(),
                        description: kind.description().to_string(),
                        anthropic_enabled: external,
                    },
                )
            })
            .collect();

        ModelListResponse {
            total: models.len(),
            models,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::mock::MockBackend;
    use crate::backend::AnalysisMode;
    use async_trait::async_trait;

    struct StalledBackend;

    #[async_trait]
    impl AnalysisBackend for StalledBackend {
        fn id(&self) -> &'static str {
            "stalled"
        }

        async fn analyze(
            &self,
            _frame: &Frame,
            _mode: AnalysisMode,
        ) -> Result<AnalysisPayload, BackendError> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(AnalysisPayload::new())
        }
    }

    fn names(values: &[&str]) -> Vec<String> {
        values.iter().map(|s| s.to_string()).collect()
    }

    fn frame() -> Frame {
        Frame::new(1, 2, 2, vec![0u8; 12])
    }

    #[test]
    fn test_resolve_dedupes_in_order() {
        let registry = BackendRegistry::new(Arc::new(MockBackend::new()));
        let resolved = registry
            .resolve(&names(&["defect_analysis", "object_detection", "defect_analysis"]))
            .unwrap();
        assert_eq!(
            resolved,
            vec![ModelKind::DefectAnalysis, ModelKind::ObjectDetection]
        );
    }

    #[test]
    fn test_resolve_rejects_unknown_names() {
        let registry = BackendRegistry::new(Arc::new(MockBackend::new()));
        let err = registry
            .resolve(&names(&["object_detection", "lpr", "pose"]))
            .unwrap_err();
        assert_eq!(err, UnknownModels(names(&["lpr", "pose"])));
        assert_eq!(err.to_string(), "Invalid AI models: lpr, pose");
    }

    #[test]
    fn test_describe_lists_all_models() {
        let registry = BackendRegistry::new(Arc::new(MockBackend::new()));
        let listing = registry.describe();
        assert_eq!(listing.total, 4);
        assert_eq!(listing.models["asset_tracking"].mode, "asset_tracking");
        assert!(!listing.models["general"].anthropic_enabled);
    }

    #[tokio::test]
    async fn test_analyze_times_out() {
        let timeout = Duration::from_millis(20);
        let registry = BackendRegistry::new(Arc::new(StalledBackend)).with_timeout(timeout);
        let result = registry.analyze(&frame(), ModelKind::General).await;
        assert_eq!(result, Err(BackendError::Timeout(timeout)));
    }

    #[tokio::test]
    async fn test_analyze_routes_mode() {
        let registry = BackendRegistry::new(Arc::new(MockBackend::new()));
        let payload = registry
            .analyze(&frame(), ModelKind::ObjectDetection)
            .await
            .unwrap();
        assert_eq!(payload["analysis_type"], "object_detection");
    }
}
