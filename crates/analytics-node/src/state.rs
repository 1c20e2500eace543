use crate::backend::registry::BackendRegistry;
use crate::manager::StreamManager;
use crate::source::SourceOpener;
use crate::store::ResultStore;
use crate::worker::{WorkerContext, WorkerSettings};
use chrono::{DateTime, Utc};
use common::analysis::DashboardStats;
use std::sync::Arc;

/// Shared application state handed to every handler
#[derive(Clone)]
pub struct AnalyticsState {
    inner: Arc<AnalyticsStateInner>,
}

struct AnalyticsStateInner {
    manager: StreamManager,
    store: ResultStore,
    backends: BackendRegistry,
    started_at: DateTime<Utc>,
}

impl AnalyticsState {
    pub fn new(
        opener: Arc<dyn SourceOpener>,
        backends: BackendRegistry,
        store: ResultStore,
        settings: WorkerSettings,
        max_running: usize,
    ) -> Self {
        let ctx = WorkerContext {
            opener,
            backends: backends.clone(),
            store: store.clone(),
            settings,
        };

        Self {
            inner: Arc::new(AnalyticsStateInner {
                manager: StreamManager::new(ctx, max_running),
                store,
                backends,
                started_at: Utc::now(),
            }),
        }
    }

    pub fn streams(&self) -> &StreamManager {
        &self.inner.manager
    }

    pub fn results(&self) -> &ResultStore {
        &self.inner.store
    }

    pub fn backends(&self) -> &BackendRegistry {
        &self.inner.backends
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.inner.started_at
    }

    pub async fn dashboard_stats(&self) -> DashboardStats {
        let now = Utc::now();
        let history = self.inner.store.stats(now).await;

        DashboardStats {
            active_streams: self.inner.manager.running_count().await,
            total_streams: self.inner.manager.len().await,
            recent_results: history.recent_results,
            alerts: history.alerts,
            alert_breakdown: history.alert_breakdown,
            subscribers: self.inner.store.subscriber_count().await,
            timestamp: now,
        }
    }

    /// Stop every stream worker
    pub async fn shutdown(&self) {
        self.inner.manager.shutdown().await;
    }
}
