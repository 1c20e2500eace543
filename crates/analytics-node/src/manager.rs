//! Stream registry
//!
//! Owns the descriptor and worker of every configured stream. Descriptors are
//! validated and their model names resolved once, on creation; later
//! lifecycle operations go through the stream's [`StreamWorker`].

use crate::error::StreamError;
use crate::worker::{StreamWorker, WorkerContext};
use chrono::{DateTime, Utc};
use common::streams::{SourceKind, StreamDescriptor, StreamSnapshot};
use common::validation::{validate_id, validate_locator, MAX_MODELS_PER_STREAM};
use futures::future::join_all;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use telemetry::metrics::FRAMES_CAPTURED;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

pub const DEFAULT_MAX_RUNNING: usize = 10;

struct StreamEntry {
    worker: Arc<StreamWorker>,
    created_at: DateTime<Utc>,
    last_update: Mutex<DateTime<Utc>>,
}

impl StreamEntry {
    async fn touch(&self) {
        *self.last_update.lock().await = Utc::now();
    }

    async fn snapshot(&self) -> StreamSnapshot {
        let status = self.worker.status().await;
        let mut config = self.worker.descriptor().clone();
        config.is_active = status.state.is_active();

        StreamSnapshot {
            stream_id: config.stream_id.clone(),
            config,
            state: status.state,
            is_running: status.state.is_active(),
            frame_count: status.frames_seen,
            dispatch_count: status.dispatches,
            last_dispatch: status.last_dispatch,
            last_error: status.last_error,
            last_update: *self.last_update.lock().await,
        }
    }
}

#[derive(Clone)]
pub struct StreamManager {
    inner: Arc<ManagerInner>,
}

struct ManagerInner {
    ctx: WorkerContext,
    max_running: usize,
    streams: RwLock<HashMap<String, Arc<StreamEntry>>>,
}

impl StreamManager {
    pub fn new(ctx: WorkerContext, max_running: usize) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                ctx,
                max_running: max_running.max(1),
                streams: RwLock::new(HashMap::new()),
            }),
        }
    }

    pub fn max_running(&self) -> usize {
        self.inner.max_running
    }

    /// Validate and register a stream. An empty id is replaced by a
    /// generated one. The stream starts stopped.
    pub async fn create(&self, mut descriptor: StreamDescriptor) -> Result<String, StreamError> {
        if descriptor.stream_id.trim().is_empty() {
            descriptor.stream_id = uuid::Uuid::new_v4().to_string();
        }

        validate_id(&descriptor.stream_id, "stream_id")
            .map_err(|e| StreamError::Configuration(e.to_string()))?;
        validate_locator(descriptor.source, &descriptor.source_path, "source_path")
            .map_err(|e| StreamError::Configuration(e.to_string()))?;

        if descriptor.ai_models.is_empty() {
            return Err(StreamError::Configuration(
                "at least one AI model is required".to_string(),
            ));
        }
        if descriptor.ai_models.len() > MAX_MODELS_PER_STREAM {
            return Err(StreamError::Configuration(format!(
                "at most {} AI models per stream",
                MAX_MODELS_PER_STREAM
            )));
        }

        let models = self
            .inner
            .ctx
            .backends
            .resolve(&descriptor.ai_models)
            .map_err(|e| StreamError::Configuration(e.to_string()))?;

        descriptor.ai_models = models.iter().map(|m| m.name().to_string()).collect();
        descriptor.is_active = false;
        let stream_id = descriptor.stream_id.clone();

        let mut streams = self.inner.streams.write().await;
        if streams.contains_key(&stream_id) {
            return Err(StreamError::Conflict(format!(
                "Stream '{}' already exists",
                stream_id
            )));
        }

        info!(
            stream_id = %stream_id,
            kind = %descriptor.source,
            models = ?descriptor.ai_models,
            "stream created"
        );

        let now = Utc::now();
        let worker = StreamWorker::new(descriptor, models, self.inner.ctx.clone());
        streams.insert(
            stream_id.clone(),
            Arc::new(StreamEntry {
                worker: Arc::new(worker),
                created_at: now,
                last_update: Mutex::new(now),
            }),
        );

        Ok(stream_id)
    }

    async fn entry(&self, stream_id: &str) -> Result<Arc<StreamEntry>, StreamError> {
        self.inner
            .streams
            .read()
            .await
            .get(stream_id)
            .cloned()
            .ok_or_else(|| StreamError::NotFound(stream_id.to_string()))
    }

    /// Start the stream's worker; returns once its source is open
    pub async fn start(&self, stream_id: &str) -> Result<(), StreamError> {
        let entry = self.entry(stream_id).await?;

        if !entry.worker.state().is_active() {
            let running = self.running_count().await;
            if running >= self.inner.max_running {
                warn!(
                    stream_id,
                    running,
                    max = self.inner.max_running,
                    "refusing to start stream, at capacity"
                );
                return Err(StreamError::Capacity(self.inner.max_running));
            }
        }

        let result = entry.worker.start().await;
        entry.touch().await;
        result.map_err(StreamError::from)
    }

    /// Stop the stream's worker. Stopping a stopped stream succeeds.
    pub async fn stop(&self, stream_id: &str) -> Result<(), StreamError> {
        let entry = self.entry(stream_id).await?;
        entry.worker.stop().await;
        entry.touch().await;
        Ok(())
    }

    /// Forget the stream, then stop its worker. A `start` racing with the
    /// delete sees `NotFound` instead of reviving the removed worker.
    pub async fn delete(&self, stream_id: &str) -> Result<(), StreamError> {
        let entry = self
            .inner
            .streams
            .write()
            .await
            .remove(stream_id)
            .ok_or_else(|| StreamError::NotFound(stream_id.to_string()))?;

        entry.worker.retire().await;
        if let Err(e) = FRAMES_CAPTURED.remove_label_values(&[stream_id]) {
            debug!(stream_id, error = %e, "no frame counter to remove");
        }

        info!(stream_id, "stream deleted");
        Ok(())
    }

    pub async fn get(&self, stream_id: &str) -> Result<StreamSnapshot, StreamError> {
        let entry = self.entry(stream_id).await?;
        Ok(entry.snapshot().await)
    }

    /// Snapshots of every stream, oldest first
    pub async fn list(&self) -> Vec<StreamSnapshot> {
        let mut entries: Vec<Arc<StreamEntry>> =
            self.inner.streams.read().await.values().cloned().collect();
        entries.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.worker.stream_id().cmp(b.worker.stream_id()))
        });

        let mut snapshots = Vec::with_capacity(entries.len());
        for entry in entries {
            snapshots.push(entry.snapshot().await);
        }
        snapshots
    }

    pub async fn len(&self) -> usize {
        self.inner.streams.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.streams.read().await.is_empty()
    }

    /// Streams whose worker is starting or running
    pub async fn running_count(&self) -> usize {
        self.inner
            .streams
            .read()
            .await
            .values()
            .filter(|entry| entry.worker.state().is_active())
            .count()
    }

    /// Register the stopped demo streams: the first capture device, the
    /// sample clip when it exists, and an example RTSP feed. Ids that are
    /// already taken are left alone. Returns how many were added.
    pub async fn seed_demo_streams(&self, sample_video: Option<&str>) -> usize {
        let mut demos = vec![demo_descriptor(
            "demo_webcam",
            SourceKind::LiveDevice,
            "0",
            &["object_detection", "asset_tracking"],
        )];
        match sample_video {
            Some(path) if Path::new(path).is_file() => demos.push(demo_descriptor(
                "demo_file",
                SourceKind::File,
                path,
                &["defect_analysis", "object_detection"],
            )),
            Some(path) => warn!(path, "sample video not found, skipping file demo stream"),
            None => {}
        }
        demos.push(demo_descriptor(
            "demo_rtsp",
            SourceKind::NetworkStream,
            "rtsp://example.com/stream",
            &["asset_tracking"],
        ));

        let mut added = 0;
        for descriptor in demos {
            let stream_id = descriptor.stream_id.clone();
            match self.create(descriptor).await {
                Ok(_) => added += 1,
                Err(StreamError::Conflict(_)) => {
                    debug!(stream_id = %stream_id, "demo stream already registered");
                }
                Err(e) => warn!(stream_id = %stream_id, error = %e, "failed to create demo stream"),
            }
        }
        added
    }

    /// Stop every worker concurrently
    pub async fn shutdown(&self) {
        let workers: Vec<Arc<StreamWorker>> = self
            .inner
            .streams
            .read()
            .await
            .values()
            .map(|entry| Arc::clone(&entry.worker))
            .collect();

        let stopped = join_all(workers.iter().map(|worker| worker.stop()))
            .await
            .into_iter()
            .filter(|was_active| *was_active)
            .count();

        info!(stopped, total = workers.len(), "all streams stopped");
    }
}

fn demo_descriptor(
    stream_id: &str,
    source: SourceKind,
    source_path: &str,
    models: &[&str],
) -> StreamDescriptor {
    StreamDescriptor {
        stream_id: stream_id.to_string(),
        source,
        source_path: source_path.to_string(),
        ai_models: models.iter().map(|m| m.to_string()).collect(),
        is_active: false,
    }
}
