//! Bounded result history with live fan-out
//!
//! Every published result is appended to a FIFO-bounded history and offered
//! to each live subscriber. Append and fan-out happen under one publish gate,
//! so every subscriber observes results in history order. Subscriber queues
//! are bounded; a subscriber whose queue is full or closed is dropped rather
//! than allowed to stall publishers.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use common::analysis::{AlertBreakdown, AnalysisResult, Severity};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use telemetry::metrics::{RESULTS_PUBLISHED, SUBSCRIBERS, SUBSCRIBER_DROPS};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, warn};

pub const DEFAULT_CAPACITY: usize = 1000;
pub const MIN_CAPACITY: usize = 1;
pub const SUBSCRIBER_QUEUE_DEPTH: usize = 256;

/// Window counted as "recent" on the dashboard
pub const RECENT_WINDOW_SECS: i64 = 60;
/// Window in which warnings and criticals count as alerts
pub const ALERT_WINDOW_SECS: i64 = 300;

pub type SubscriberId = u64;

/// A live feed of published results
#[derive(Debug)]
pub struct Subscription {
    id: SubscriberId,
    receiver: mpsc::Receiver<Arc<AnalysisResult>>,
}

impl Subscription {
    pub fn id(&self) -> SubscriberId {
        self.id
    }

    /// Next result, or `None` once the store has dropped this subscriber
    pub async fn recv(&mut self) -> Option<Arc<AnalysisResult>> {
        self.receiver.recv().await
    }
}

/// Aggregates over the history at a point in time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HistoryStats {
    pub recent_results: usize,
    pub alerts: usize,
    pub alert_breakdown: AlertBreakdown,
}

#[derive(Clone)]
pub struct ResultStore {
    inner: Arc<StoreInner>,
}

struct StoreInner {
    capacity: usize,
    publish_gate: Mutex<()>,
    history: RwLock<VecDeque<Arc<AnalysisResult>>>,
    subscribers: Mutex<HashMap<SubscriberId, mpsc::Sender<Arc<AnalysisResult>>>>,
    next_subscriber: AtomicU64,
}

impl ResultStore {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(MIN_CAPACITY);
        Self {
            inner: Arc::new(StoreInner {
                capacity,
                publish_gate: Mutex::new(()),
                history: RwLock::new(VecDeque::with_capacity(capacity)),
                subscribers: Mutex::new(HashMap::new()),
                next_subscriber: AtomicU64::new(1),
            }),
        }
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    pub async fn len(&self) -> usize {
        self.inner.history.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.history.read().await.is_empty()
    }

    /// Append a result, evicting the oldest past capacity, then offer it to
    /// every subscriber
    pub async fn publish(&self, result: AnalysisResult) -> Arc<AnalysisResult> {
        let result = Arc::new(result);
        let _gate = self.inner.publish_gate.lock().await;

        {
            let mut history = self.inner.history.write().await;
            history.push_back(Arc::clone(&result));
            while history.len() > self.inner.capacity {
                history.pop_front();
            }
        }

        RESULTS_PUBLISHED
            .with_label_values(&[result.severity.as_str()])
            .inc();

        self.broadcast(&result).await;
        result
    }

    async fn broadcast(&self, result: &Arc<AnalysisResult>) {
        let mut subscribers = self.inner.subscribers.lock().await;
        if subscribers.is_empty() {
            return;
        }

        subscribers.retain(|id, sender| match sender.try_send(Arc::clone(result)) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                warn!(subscriber = id, "subscriber queue full, dropping subscriber");
                SUBSCRIBER_DROPS.inc();
                false
            }
            Err(TrySendError::Closed(_)) => {
                debug!(subscriber = id, "subscriber gone, removing");
                SUBSCRIBER_DROPS.inc();
                false
            }
        });
        SUBSCRIBERS.set(subscribers.len() as i64);
    }

    /// Filtered view of the history, oldest first. `limit` keeps the most
    /// recent matches.
    pub async fn query(
        &self,
        stream_id: Option<&str>,
        severity: Option<Severity>,
        limit: usize,
    ) -> Vec<AnalysisResult> {
        // Copy out so filtering never holds the lock against publishers
        let snapshot: Vec<Arc<AnalysisResult>> =
            self.inner.history.read().await.iter().cloned().collect();

        let matching: Vec<&Arc<AnalysisResult>> = snapshot
            .iter()
            .filter(|r| stream_id.map_or(true, |id| r.stream_id == id))
            .filter(|r| severity.map_or(true, |s| r.severity == s))
            .collect();

        let skip = matching.len().saturating_sub(limit);
        matching
            .into_iter()
            .skip(skip)
            .map(|r| (**r).clone())
            .collect()
    }

    /// Register a live subscriber
    pub async fn subscribe(&self) -> Subscription {
        let id = self.inner.next_subscriber.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = mpsc::channel(SUBSCRIBER_QUEUE_DEPTH);

        let mut subscribers = self.inner.subscribers.lock().await;
        subscribers.insert(id, sender);
        SUBSCRIBERS.set(subscribers.len() as i64);
        debug!(subscriber = id, total = subscribers.len(), "subscriber registered");

        Subscription { id, receiver }
    }

    /// Remove a subscriber. Returns false if it was already gone.
    pub async fn unsubscribe(&self, id: SubscriberId) -> bool {
        let mut subscribers = self.inner.subscribers.lock().await;
        let removed = subscribers.remove(&id).is_some();
        SUBSCRIBERS.set(subscribers.len() as i64);
        removed
    }

    pub async fn subscriber_count(&self) -> usize {
        self.inner.subscribers.lock().await.len()
    }

    /// Recent result and alert counts relative to `now`
    pub async fn stats(&self, now: DateTime<Utc>) -> HistoryStats {
        let recent_cutoff = now - ChronoDuration::seconds(RECENT_WINDOW_SECS);
        let alert_cutoff = now - ChronoDuration::seconds(ALERT_WINDOW_SECS);

        let history = self.inner.history.read().await;
        let mut stats = HistoryStats::default();
        for result in history.iter() {
            if result.timestamp > recent_cutoff {
                stats.recent_results += 1;
            }
            if result.timestamp > alert_cutoff {
                match result.severity {
                    Severity::Critical => stats.alert_breakdown.critical += 1,
                    Severity::Warning => stats.alert_breakdown.warning += 1,
                    Severity::Info => {}
                }
            }
        }
        stats.alerts = stats.alert_breakdown.critical + stats.alert_breakdown.warning;
        stats
    }
}

impl Default for ResultStore {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}
