//! Per-stream capture and dispatch loop
//!
//! A [`StreamWorker`] owns the lifecycle of one stream:
//! `Stopped -> Starting -> Running -> Stopping -> Stopped`. While running it
//! pulls frames at a paced rate, samples every `frame_skip`-th frame (subject
//! to a minimum interval between dispatches), runs it through every
//! configured model in order and publishes one classified result per model.
//!
//! Each run carries a generation number. State writes from a run are ignored
//! once the generation has moved on, so a loop that is being torn down can
//! never overwrite the state of the run that replaced it.

use crate::backend::registry::BackendRegistry;
use crate::backend::ModelKind;
use crate::classifier::{classify, result_confidence};
use crate::source::{
    open_bounded, Frame, FrameEvent, FrameSource, OpenTimeouts, SourceError, SourceOpener,
};
use crate::store::ResultStore;
use chrono::{DateTime, Utc};
use common::analysis::{AnalysisPayload, AnalysisResult};
use common::streams::{StreamDescriptor, WorkerState};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use telemetry::metrics::{ACTIVE_WORKERS, DISPATCHES, FRAMES_CAPTURED, WORKER_FAILURES};
use thiserror::Error;
use tokio::sync::{oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Consecutive rewinds without a frame before a file source is given up on
pub const MAX_EMPTY_REWINDS: u32 = 3;

/// Tunables shared by every worker
#[derive(Debug, Clone)]
pub struct WorkerSettings {
    /// Dispatch every N-th frame (at least 1)
    pub frame_skip: u64,
    /// Minimum wall-clock spacing between two dispatches of one stream
    pub min_dispatch_interval: Duration,
    /// Pacing between frame reads
    pub frame_interval: Duration,
    pub open_timeouts: OpenTimeouts,
    /// How long `stop` waits for the loop before aborting it
    pub stop_grace: Duration,
    /// Pause after a transient read error
    pub transient_backoff: Duration,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            frame_skip: 30,
            min_dispatch_interval: Duration::from_secs(1),
            frame_interval: Duration::from_millis(33),
            open_timeouts: OpenTimeouts::default(),
            stop_grace: Duration::from_secs(2),
            transient_backoff: Duration::from_millis(500),
        }
    }
}

/// Everything a worker needs from the rest of the node
#[derive(Clone)]
pub struct WorkerContext {
    pub opener: Arc<dyn SourceOpener>,
    pub backends: BackendRegistry,
    pub store: ResultStore,
    pub settings: WorkerSettings,
}

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("stream '{stream_id}' is already {state}")]
    AlreadyRunning {
        stream_id: String,
        state: WorkerState,
    },

    /// The stream was deleted while the call was waiting
    #[error("stream '{stream_id}' has been removed")]
    Retired { stream_id: String },

    #[error("stream '{stream_id}' failed to start: {source}")]
    Source {
        stream_id: String,
        #[source]
        source: SourceError,
    },
}

/// Point-in-time view of a worker
#[derive(Debug, Clone)]
pub struct WorkerStatus {
    pub state: WorkerState,
    pub frames_seen: u64,
    pub dispatches: u64,
    pub last_dispatch: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

struct RunHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

struct WorkerShared {
    state: watch::Sender<WorkerState>,
    generation: AtomicU64,
    frames_seen: AtomicU64,
    dispatches: AtomicU64,
    last_dispatch: Mutex<Option<DateTime<Utc>>>,
    last_error: Mutex<Option<String>>,
}

impl WorkerShared {
    /// Move to `to` if `generation` is still the current run and the state
    /// matches `from` (when given)
    fn transition(&self, generation: u64, from: Option<WorkerState>, to: WorkerState) -> bool {
        self.state.send_if_modified(|state| {
            if self.generation.load(Ordering::SeqCst) != generation {
                return false;
            }
            if from.is_some_and(|from| *state != from) {
                return false;
            }
            let changed = *state != to;
            *state = to;
            changed
        })
    }

    async fn reset(&self) {
        self.frames_seen.store(0, Ordering::SeqCst);
        self.dispatches.store(0, Ordering::SeqCst);
        *self.last_dispatch.lock().await = None;
        *self.last_error.lock().await = None;
    }

    async fn record_error(&self, message: String) {
        *self.last_error.lock().await = Some(message);
    }
}

pub struct StreamWorker {
    descriptor: Arc<StreamDescriptor>,
    models: Arc<[ModelKind]>,
    ctx: WorkerContext,
    shared: Arc<WorkerShared>,
    run: Mutex<Option<RunHandle>>,
    retired: AtomicBool,
}

impl StreamWorker {
    /// `models` must already be resolved against the backend registry
    pub fn new(descriptor: StreamDescriptor, models: Vec<ModelKind>, ctx: WorkerContext) -> Self {
        let (state, _) = watch::channel(WorkerState::Stopped);
        Self {
            descriptor: Arc::new(descriptor),
            models: models.into(),
            ctx,
            shared: Arc::new(WorkerShared {
                state,
                generation: AtomicU64::new(0),
                frames_seen: AtomicU64::new(0),
                dispatches: AtomicU64::new(0),
                last_dispatch: Mutex::new(None),
                last_error: Mutex::new(None),
            }),
            run: Mutex::new(None),
            retired: AtomicBool::new(false),
        }
    }

    pub fn stream_id(&self) -> &str {
        &self.descriptor.stream_id
    }

    pub fn descriptor(&self) -> &StreamDescriptor {
        &self.descriptor
    }

    pub fn models(&self) -> &[ModelKind] {
        &self.models
    }

    pub fn state(&self) -> WorkerState {
        *self.shared.state.borrow()
    }

    /// Observe state changes
    pub fn watch_state(&self) -> watch::Receiver<WorkerState> {
        self.shared.state.subscribe()
    }

    pub async fn status(&self) -> WorkerStatus {
        WorkerStatus {
            state: self.state(),
            frames_seen: self.shared.frames_seen.load(Ordering::SeqCst),
            dispatches: self.shared.dispatches.load(Ordering::SeqCst),
            last_dispatch: *self.shared.last_dispatch.lock().await,
            last_error: self.shared.last_error.lock().await.clone(),
        }
    }

    /// Open the source and begin the loop.
    ///
    /// Returns once the source is open (or failed to open). A stop issued
    /// while the source is still opening wins; start then returns `Ok` with
    /// the worker stopped.
    pub async fn start(&self) -> Result<(), WorkerError> {
        let opened = {
            let mut run = self.run.lock().await;
            if self.retired.load(Ordering::SeqCst) {
                return Err(WorkerError::Retired {
                    stream_id: self.descriptor.stream_id.clone(),
                });
            }
            let current = self.state();
            if current != WorkerState::Stopped {
                return Err(WorkerError::AlreadyRunning {
                    stream_id: self.descriptor.stream_id.clone(),
                    state: current,
                });
            }

            let generation = self.shared.generation.fetch_add(1, Ordering::SeqCst) + 1;
            self.shared.reset().await;
            self.shared.state.send_replace(WorkerState::Starting);

            let cancel = CancellationToken::new();
            let (opened_tx, opened_rx) = oneshot::channel();
            let run_loop = RunLoop {
                descriptor: Arc::clone(&self.descriptor),
                models: Arc::clone(&self.models),
                ctx: self.ctx.clone(),
                shared: Arc::clone(&self.shared),
                generation,
                cancel: cancel.clone(),
            };
            let task = tokio::spawn(run_loop.run(opened_tx));
            *run = Some(RunHandle { cancel, task });
            opened_rx
        };

        match opened.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(source)) => Err(WorkerError::Source {
                stream_id: self.descriptor.stream_id.clone(),
                source,
            }),
            Err(_) => {
                debug!(stream_id = %self.descriptor.stream_id, "start superseded by stop");
                Ok(())
            }
        }
    }

    /// Stop the loop and release the source. Idempotent; returns whether the
    /// worker was active.
    pub async fn stop(&self) -> bool {
        let mut run = self.run.lock().await;
        self.stop_locked(&mut run).await
    }

    /// Stop the worker for good. Any later `start`, including one already
    /// queued behind this call, fails with [`WorkerError::Retired`].
    pub async fn retire(&self) -> bool {
        let mut run = self.run.lock().await;
        self.retired.store(true, Ordering::SeqCst);
        self.stop_locked(&mut run).await
    }

    async fn stop_locked(&self, run: &mut Option<RunHandle>) -> bool {
        let Some(handle) = run.take() else {
            return false;
        };

        let was_active = self.shared.state.send_if_modified(|state| {
            if state.is_active() {
                *state = WorkerState::Stopping;
                true
            } else {
                false
            }
        });

        handle.cancel.cancel();
        let mut task = handle.task;
        match tokio::time::timeout(self.ctx.settings.stop_grace, &mut task).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                error!(stream_id = %self.descriptor.stream_id, error = %e, "stream loop panicked");
            }
            Err(_) => {
                warn!(
                    stream_id = %self.descriptor.stream_id,
                    grace_ms = self.ctx.settings.stop_grace.as_millis() as u64,
                    "stream loop did not stop within grace period, aborting"
                );
                task.abort();
            }
        }

        // Retire the run so nothing it still does can touch the state
        self.shared.generation.fetch_add(1, Ordering::SeqCst);
        self.shared.state.send_replace(WorkerState::Stopped);

        if was_active {
            info!(stream_id = %self.descriptor.stream_id, "stream stopped");
        }
        was_active
    }
}

/// Keeps the active worker gauge accurate even if the loop is aborted
struct ActiveGuard;

impl ActiveGuard {
    fn enter() -> Self {
        ACTIVE_WORKERS.inc();
        Self
    }
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        ACTIVE_WORKERS.dec();
    }
}

enum LoopExit {
    Cancelled,
    Failed(SourceError),
}

struct RunLoop {
    descriptor: Arc<StreamDescriptor>,
    models: Arc<[ModelKind]>,
    ctx: WorkerContext,
    shared: Arc<WorkerShared>,
    generation: u64,
    cancel: CancellationToken,
}

impl RunLoop {
    async fn run(self, opened: oneshot::Sender<Result<(), SourceError>>) {
        let stream_id = self.descriptor.stream_id.clone();
        let open_timeout = self
            .ctx
            .settings
            .open_timeouts
            .for_kind(self.descriptor.source);

        let result = tokio::select! {
            _ = self.cancel.cancelled() => {
                debug!(stream_id = %stream_id, "cancelled while opening source");
                return;
            }
            result = open_bounded(self.ctx.opener.as_ref(), &self.descriptor, open_timeout) => result,
        };

        let mut source = match result {
            Ok(source) => source,
            Err(e) => {
                error!(
                    stream_id = %stream_id,
                    kind = %self.descriptor.source,
                    locator = %self.descriptor.source_path,
                    error = %e,
                    "failed to open source"
                );
                WORKER_FAILURES.with_label_values(&[e.reason()]).inc();
                self.shared.record_error(e.to_string()).await;
                self.shared.transition(self.generation, None, WorkerState::Stopped);
                let _ = opened.send(Err(e));
                return;
            }
        };

        if !self
            .shared
            .transition(self.generation, Some(WorkerState::Starting), WorkerState::Running)
        {
            source.close().await;
            return;
        }
        let _active = ActiveGuard::enter();
        let _ = opened.send(Ok(()));

        info!(
            stream_id = %stream_id,
            kind = %self.descriptor.source,
            models = ?self.models.iter().map(|m| m.name()).collect::<Vec<_>>(),
            frame_skip = self.ctx.settings.frame_skip,
            "stream running"
        );

        let exit = self.frame_loop(source.as_mut()).await;
        source.close().await;

        match exit {
            LoopExit::Cancelled => {
                debug!(stream_id = %stream_id, "stream loop cancelled");
            }
            LoopExit::Failed(e) => {
                error!(stream_id = %stream_id, error = %e, "source failed, stopping stream");
                WORKER_FAILURES.with_label_values(&[e.reason()]).inc();
                self.shared.record_error(e.to_string()).await;
            }
        }

        self.shared.transition(self.generation, None, WorkerState::Stopped);
    }

    async fn frame_loop(&self, source: &mut dyn FrameSource) -> LoopExit {
        let settings = &self.ctx.settings;
        let frame_skip = settings.frame_skip.max(1);
        let mut pacing =
            tokio::time::interval(settings.frame_interval.max(Duration::from_millis(1)));
        pacing.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut last_dispatch: Option<Instant> = None;
        let mut empty_rewinds = 0u32;

        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return LoopExit::Cancelled,
                _ = pacing.tick() => {}
            }

            let event = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return LoopExit::Cancelled,
                event = source.next_frame() => event,
            };

            match event {
                Ok(FrameEvent::Frame(frame)) => {
                    empty_rewinds = 0;
                    let seen = self.shared.frames_seen.fetch_add(1, Ordering::SeqCst) + 1;
                    FRAMES_CAPTURED
                        .with_label_values(&[&self.descriptor.stream_id])
                        .inc();

                    if seen % frame_skip != 0 {
                        continue;
                    }
                    let due = last_dispatch
                        .map_or(true, |at| at.elapsed() >= settings.min_dispatch_interval);
                    if !due {
                        continue;
                    }
                    last_dispatch = Some(Instant::now());

                    tokio::select! {
                        biased;
                        _ = self.cancel.cancelled() => return LoopExit::Cancelled,
                        _ = self.dispatch(&frame) => {}
                    }
                }
                Ok(FrameEvent::EndOfStream) => {
                    if !self.descriptor.source.is_rewindable() {
                        return LoopExit::Failed(SourceError::ReadFailure(
                            "source ended".to_string(),
                        ));
                    }
                    empty_rewinds += 1;
                    if empty_rewinds > MAX_EMPTY_REWINDS {
                        return LoopExit::Failed(SourceError::ReadFailure(format!(
                            "no frames after {} rewinds",
                            MAX_EMPTY_REWINDS
                        )));
                    }
                    debug!(stream_id = %self.descriptor.stream_id, "end of file, rewinding");
                    if let Err(e) = source.reset().await {
                        return LoopExit::Failed(e);
                    }
                }
                Err(e) if e.is_transient() => {
                    warn!(stream_id = %self.descriptor.stream_id, error = %e, "skipping bad frame");
                    tokio::select! {
                        _ = self.cancel.cancelled() => return LoopExit::Cancelled,
                        _ = tokio::time::sleep(settings.transient_backoff) => {}
                    }
                }
                Err(e) => return LoopExit::Failed(e),
            }
        }
    }

    /// Run every model against one frame and publish the results in order
    async fn dispatch(&self, frame: &Frame) {
        self.shared.dispatches.fetch_add(1, Ordering::SeqCst);
        *self.shared.last_dispatch.lock().await = Some(Utc::now());

        for model in self.models.iter().copied() {
            let payload = match self.ctx.backends.analyze(frame, model).await {
                Ok(payload) => {
                    DISPATCHES.with_label_values(&[model.name(), "success"]).inc();
                    payload
                }
                Err(e) => {
                    warn!(
                        stream_id = %self.descriptor.stream_id,
                        model = %model,
                        frame = frame.sequence,
                        error = %e,
                        "analysis failed"
                    );
                    DISPATCHES.with_label_values(&[model.name(), "failure"]).inc();
                    e.to_payload()
                }
            };

            let result = build_result(&self.descriptor.stream_id, model, payload);
            debug!(
                stream_id = %result.stream_id,
                model = %result.model_name,
                severity = %result.severity,
                "publishing result"
            );
            self.ctx.store.publish(result).await;
        }
    }
}

fn build_result(stream_id: &str, model: ModelKind, payload: AnalysisPayload) -> AnalysisResult {
    AnalysisResult {
        stream_id: stream_id.to_string(),
        model_name: model.name().to_string(),
        timestamp: Utc::now(),
        confidence: result_confidence(&payload),
        severity: classify(&payload),
        payload,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{AnalysisBackend, AnalysisMode, BackendError};
    use async_trait::async_trait;
    use common::analysis::Severity;
    use common::streams::SourceKind;
    use serde_json::json;

    #[derive(Clone, Copy)]
    enum Step {
        Frame,
        End,
        Transient,
        Fail,
    }

    #[derive(Default)]
    struct SourceCounters {
        opens: AtomicU64,
        resets: AtomicU64,
        closes: AtomicU64,
    }

    struct ScriptedSource {
        kind: SourceKind,
        script: Vec<Step>,
        pos: usize,
        sequence: u64,
        counters: Arc<SourceCounters>,
        slow_close: bool,
    }

    #[async_trait]
    impl FrameSource for ScriptedSource {
        fn kind(&self) -> SourceKind {
            self.kind
        }

        async fn next_frame(&mut self) -> Result<FrameEvent, SourceError> {
            let Some(step) = self.script.get(self.pos).copied() else {
                // An idle live feed
                std::future::pending::<()>().await;
                return Ok(FrameEvent::EndOfStream);
            };
            self.pos += 1;
            match step {
                Step::Frame => {
                    self.sequence += 1;
                    Ok(FrameEvent::Frame(Frame::new(self.sequence, 2, 2, vec![0u8; 12])))
                }
                Step::End => Ok(FrameEvent::EndOfStream),
                Step::Transient => Err(SourceError::Transient("corrupt frame".to_string())),
                Step::Fail => Err(SourceError::ReadFailure("device unplugged".to_string())),
            }
        }

        async fn reset(&mut self) -> Result<(), SourceError> {
            if !self.kind.is_rewindable() {
                return Err(SourceError::Unsupported(self.kind));
            }
            self.pos = 0;
            self.counters.resets.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn close(&mut self) {
            if self.slow_close {
                tokio::time::sleep(Duration::from_secs(60)).await;
            }
            self.counters.closes.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct ScriptedOpener {
        script: Vec<Step>,
        counters: Arc<SourceCounters>,
        fail_open: Option<SourceError>,
        open_delay: Duration,
        slow_close: bool,
    }

    impl ScriptedOpener {
        fn new(script: Vec<Step>) -> Self {
            Self {
                script,
                counters: Arc::new(SourceCounters::default()),
                fail_open: None,
                open_delay: Duration::ZERO,
                slow_close: false,
            }
        }
    }

    #[async_trait]
    impl SourceOpener for ScriptedOpener {
        async fn open(
            &self,
            descriptor: &StreamDescriptor,
        ) -> Result<Box<dyn FrameSource>, SourceError> {
            if !self.open_delay.is_zero() {
                tokio::time::sleep(self.open_delay).await;
            }
            if let Some(e) = &self.fail_open {
                return Err(e.clone());
            }
            self.counters.opens.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(ScriptedSource {
                kind: descriptor.source,
                script: self.script.clone(),
                pos: 0,
                sequence: 0,
                counters: Arc::clone(&self.counters),
                slow_close: self.slow_close,
            }))
        }
    }

    /// Numbers its calls; fails the call numbered `fail_on`
    #[derive(Default)]
    struct CountingBackend {
        calls: AtomicU64,
        fail_on: Option<u64>,
    }

    #[async_trait]
    impl AnalysisBackend for CountingBackend {
        fn id(&self) -> &'static str {
            "counting"
        }

        async fn analyze(
            &self,
            frame: &Frame,
            mode: AnalysisMode,
        ) -> Result<AnalysisPayload, BackendError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if self.fail_on == Some(call) {
                return Err(BackendError::Transport("connection reset".to_string()));
            }
            let mut payload = AnalysisPayload::new();
            payload.insert("call".to_string(), json!(call));
            payload.insert("frame".to_string(), json!(frame.sequence));
            payload.insert("mode".to_string(), json!(mode.as_str()));
            payload.insert("confidence".to_string(), json!(0.9));
            Ok(payload)
        }
    }

    fn settings() -> WorkerSettings {
        WorkerSettings {
            frame_skip: 1,
            min_dispatch_interval: Duration::ZERO,
            frame_interval: Duration::from_millis(1),
            open_timeouts: OpenTimeouts::default(),
            stop_grace: Duration::from_secs(2),
            transient_backoff: Duration::from_millis(1),
        }
    }

    fn descriptor(kind: SourceKind) -> StreamDescriptor {
        StreamDescriptor {
            stream_id: "dock-1".to_string(),
            source: kind,
            source_path: "scripted".to_string(),
            ai_models: vec![],
            is_active: false,
        }
    }

    fn worker(
        kind: SourceKind,
        opener: ScriptedOpener,
        backend: CountingBackend,
        models: Vec<ModelKind>,
        settings: WorkerSettings,
    ) -> (StreamWorker, ResultStore) {
        let store = ResultStore::new(1000);
        let ctx = WorkerContext {
            opener: Arc::new(opener),
            backends: BackendRegistry::new(Arc::new(backend)),
            store: store.clone(),
            settings,
        };
        (StreamWorker::new(descriptor(kind), models, ctx), store)
    }

    async fn wait_for_results(store: &ResultStore, count: usize) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while store.len().await < count {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("results did not arrive in time");
    }

    async fn wait_for_state(worker: &StreamWorker, state: WorkerState) {
        let mut rx = worker.watch_state();
        tokio::time::timeout(Duration::from_secs(5), rx.wait_for(|s| *s == state))
            .await
            .expect("state not reached in time")
            .unwrap();
    }

    #[tokio::test]
    async fn test_file_source_rewinds_until_stopped() {
        let opener = ScriptedOpener::new(vec![Step::Frame, Step::Frame, Step::End]);
        let counters = Arc::clone(&opener.counters);
        let (worker, store) = worker(
            SourceKind::File,
            opener,
            CountingBackend::default(),
            vec![ModelKind::General],
            settings(),
        );

        worker.start().await.unwrap();
        assert_eq!(worker.state(), WorkerState::Running);

        wait_for_results(&store, 6).await;
        assert!(counters.resets.load(Ordering::SeqCst) >= 2);
        assert_eq!(worker.state(), WorkerState::Running);

        assert!(worker.stop().await);
        assert_eq!(worker.state(), WorkerState::Stopped);
        assert_eq!(counters.closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_empty_file_gives_up_after_rewinds() {
        let opener = ScriptedOpener::new(vec![Step::End]);
        let counters = Arc::clone(&opener.counters);
        let (worker, store) = worker(
            SourceKind::File,
            opener,
            CountingBackend::default(),
            vec![ModelKind::General],
            settings(),
        );

        worker.start().await.unwrap();
        wait_for_state(&worker, WorkerState::Stopped).await;

        assert_eq!(
            counters.resets.load(Ordering::SeqCst),
            u64::from(MAX_EMPTY_REWINDS)
        );
        assert_eq!(counters.closes.load(Ordering::SeqCst), 1);
        assert!(worker.status().await.last_error.unwrap().contains("rewinds"));
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn test_live_read_failure_stops_worker() {
        let opener = ScriptedOpener::new(vec![Step::Frame, Step::Frame, Step::Fail, Step::Frame]);
        let counters = Arc::clone(&opener.counters);
        let (worker, store) = worker(
            SourceKind::LiveDevice,
            opener,
            CountingBackend::default(),
            vec![ModelKind::ObjectDetection],
            settings(),
        );

        worker.start().await.unwrap();
        wait_for_state(&worker, WorkerState::Stopped).await;

        let status = worker.status().await;
        assert_eq!(status.frames_seen, 2);
        assert!(status.last_error.unwrap().contains("device unplugged"));
        assert_eq!(store.len().await, 2);
        assert_eq!(counters.closes.load(Ordering::SeqCst), 1);

        // Already stopped by the failure; stop is a no-op
        assert!(!worker.stop().await);
        assert_eq!(worker.state(), WorkerState::Stopped);
    }

    #[tokio::test]
    async fn test_network_end_of_stream_stops_worker() {
        let opener = ScriptedOpener::new(vec![Step::Frame, Step::End]);
        let counters = Arc::clone(&opener.counters);
        let (worker, _store) = worker(
            SourceKind::NetworkStream,
            opener,
            CountingBackend::default(),
            vec![ModelKind::General],
            settings(),
        );

        worker.start().await.unwrap();
        wait_for_state(&worker, WorkerState::Stopped).await;
        assert_eq!(counters.resets.load(Ordering::SeqCst), 0);
        assert!(worker.status().await.last_error.is_some());
    }

    #[tokio::test]
    async fn test_transient_errors_are_skipped() {
        let opener = ScriptedOpener::new(vec![Step::Frame, Step::Transient, Step::Frame]);
        let (worker, store) = worker(
            SourceKind::LiveDevice,
            opener,
            CountingBackend::default(),
            vec![ModelKind::General],
            settings(),
        );

        worker.start().await.unwrap();
        wait_for_results(&store, 2).await;
        assert_eq!(worker.state(), WorkerState::Running);
        worker.stop().await;
    }

    #[tokio::test]
    async fn test_failed_model_does_not_block_the_others() {
        let opener = ScriptedOpener::new(vec![Step::Frame]);
        let backend = CountingBackend {
            fail_on: Some(1),
            ..Default::default()
        };
        let (worker, store) = worker(
            SourceKind::LiveDevice,
            opener,
            backend,
            vec![
                ModelKind::ObjectDetection,
                ModelKind::DefectAnalysis,
                ModelKind::General,
            ],
            settings(),
        );

        worker.start().await.unwrap();
        wait_for_results(&store, 3).await;
        worker.stop().await;

        let results = store.query(None, None, 100).await;
        let outcome: Vec<(&str, Severity)> = results
            .iter()
            .map(|r| (r.model_name.as_str(), r.severity))
            .collect();
        assert_eq!(
            outcome,
            vec![
                ("object_detection", Severity::Critical),
                ("defect_analysis", Severity::Info),
                ("general", Severity::Info),
            ]
        );
        assert!(results[0].payload.contains_key("error"));
        assert_eq!(results[1].payload["frame"], 1);
        assert_eq!(results[2].payload["frame"], 1);
    }

    #[tokio::test]
    async fn test_failed_call_becomes_critical_result() {
        let opener = ScriptedOpener::new(vec![Step::Frame; 5]);
        let backend = CountingBackend {
            fail_on: Some(3),
            ..Default::default()
        };
        let (worker, store) = worker(
            SourceKind::LiveDevice,
            opener,
            backend,
            vec![ModelKind::DefectAnalysis],
            settings(),
        );

        worker.start().await.unwrap();
        wait_for_results(&store, 5).await;
        assert_eq!(worker.state(), WorkerState::Running);

        let results = store.query(None, None, 100).await;
        let critical: Vec<_> = results
            .iter()
            .filter(|r| r.severity == Severity::Critical)
            .collect();
        assert_eq!(critical.len(), 1);
        assert_eq!(critical[0].payload["analysis"], "Analysis failed");
        assert_eq!(critical[0].confidence, 0.0);
        assert_eq!(
            results.iter().filter(|r| r.severity == Severity::Info).count(),
            4
        );

        worker.stop().await;
    }

    #[tokio::test]
    async fn test_results_follow_model_order() {
        let opener = ScriptedOpener::new(vec![Step::Frame; 3]);
        let (worker, store) = worker(
            SourceKind::LiveDevice,
            opener,
            CountingBackend::default(),
            vec![ModelKind::ObjectDetection, ModelKind::AssetTracking],
            settings(),
        );

        worker.start().await.unwrap();
        wait_for_results(&store, 6).await;
        worker.stop().await;

        let results = store.query(Some("dock-1"), None, 100).await;
        let order: Vec<(&str, u64)> = results
            .iter()
            .map(|r| (r.model_name.as_str(), r.payload["frame"].as_u64().unwrap()))
            .collect();
        assert_eq!(
            order,
            vec![
                ("object_detection", 1),
                ("asset_tracking", 1),
                ("object_detection", 2),
                ("asset_tracking", 2),
                ("object_detection", 3),
                ("asset_tracking", 3),
            ]
        );
        assert!(results.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));
    }

    #[tokio::test]
    async fn test_frame_skip_samples_every_nth_frame() {
        let opener = ScriptedOpener::new(vec![Step::Frame; 9]);
        let mut settings = settings();
        settings.frame_skip = 3;
        let (worker, store) = worker(
            SourceKind::LiveDevice,
            opener,
            CountingBackend::default(),
            vec![ModelKind::General],
            settings,
        );

        worker.start().await.unwrap();
        wait_for_results(&store, 3).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        let frames: Vec<u64> = store
            .query(None, None, 100)
            .await
            .iter()
            .map(|r| r.payload["frame"].as_u64().unwrap())
            .collect();
        assert_eq!(frames, vec![3, 6, 9]);

        let status = worker.status().await;
        assert_eq!(status.frames_seen, 9);
        assert_eq!(status.dispatches, 3);
        assert!(status.last_dispatch.is_some());
        worker.stop().await;
    }

    #[tokio::test]
    async fn test_min_dispatch_interval_throttles() {
        let opener = ScriptedOpener::new(vec![Step::Frame; 5]);
        let mut settings = settings();
        settings.min_dispatch_interval = Duration::from_secs(3600);
        let (worker, store) = worker(
            SourceKind::LiveDevice,
            opener,
            CountingBackend::default(),
            vec![ModelKind::General],
            settings,
        );

        worker.start().await.unwrap();
        wait_for_results(&store, 1).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(store.len().await, 1);
        assert_eq!(worker.status().await.frames_seen, 5);
        worker.stop().await;
    }

    #[tokio::test]
    async fn test_start_reports_open_failure() {
        let mut opener = ScriptedOpener::new(vec![]);
        opener.fail_open = Some(SourceError::Unavailable("no such device".to_string()));
        let (worker, _store) = worker(
            SourceKind::LiveDevice,
            opener,
            CountingBackend::default(),
            vec![ModelKind::General],
            settings(),
        );

        let err = worker.start().await.unwrap_err();
        assert!(matches!(
            err,
            WorkerError::Source {
                source: SourceError::Unavailable(_),
                ..
            }
        ));
        assert_eq!(worker.state(), WorkerState::Stopped);
        assert!(worker.status().await.last_error.is_some());
    }

    #[tokio::test]
    async fn test_start_times_out_opening() {
        let mut opener = ScriptedOpener::new(vec![Step::Frame]);
        opener.open_delay = Duration::from_secs(60);
        let mut settings = settings();
        settings.open_timeouts.network = Duration::from_millis(20);
        let (worker, _store) = worker(
            SourceKind::NetworkStream,
            opener,
            CountingBackend::default(),
            vec![ModelKind::General],
            settings,
        );

        let err = worker.start().await.unwrap_err();
        assert!(matches!(
            err,
            WorkerError::Source {
                source: SourceError::OpenTimeout(_),
                ..
            }
        ));
        assert_eq!(worker.state(), WorkerState::Stopped);
    }

    #[tokio::test]
    async fn test_double_start_and_double_stop() {
        let opener = ScriptedOpener::new(vec![]);
        let counters = Arc::clone(&opener.counters);
        let (worker, _store) = worker(
            SourceKind::LiveDevice,
            opener,
            CountingBackend::default(),
            vec![ModelKind::General],
            settings(),
        );

        worker.start().await.unwrap();
        assert!(matches!(
            worker.start().await,
            Err(WorkerError::AlreadyRunning {
                state: WorkerState::Running,
                ..
            })
        ));

        assert!(worker.stop().await);
        assert!(!worker.stop().await);
        assert_eq!(worker.state(), WorkerState::Stopped);
        assert_eq!(counters.closes.load(Ordering::SeqCst), 1);

        // A stopped worker can run again
        worker.start().await.unwrap();
        assert_eq!(worker.state(), WorkerState::Running);
        assert_eq!(counters.opens.load(Ordering::SeqCst), 2);
        worker.stop().await;
    }

    #[tokio::test]
    async fn test_stop_aborts_after_grace_period() {
        let mut opener = ScriptedOpener::new(vec![]);
        opener.slow_close = true;
        let mut settings = settings();
        settings.stop_grace = Duration::from_millis(50);
        let (worker, _store) = worker(
            SourceKind::LiveDevice,
            opener,
            CountingBackend::default(),
            vec![ModelKind::General],
            settings,
        );

        worker.start().await.unwrap();
        let stopped = tokio::time::timeout(Duration::from_secs(2), worker.stop()).await;
        assert!(matches!(stopped, Ok(true)));
        assert_eq!(worker.state(), WorkerState::Stopped);
    }

    #[tokio::test]
    async fn test_stop_while_opening_wins() {
        let mut opener = ScriptedOpener::new(vec![Step::Frame]);
        opener.open_delay = Duration::from_millis(200);
        let (worker, store) = worker(
            SourceKind::NetworkStream,
            opener,
            CountingBackend::default(),
            vec![ModelKind::General],
            settings(),
        );
        let worker = Arc::new(worker);

        let starter = {
            let worker = Arc::clone(&worker);
            tokio::spawn(async move { worker.start().await })
        };
        wait_for_state(&worker, WorkerState::Starting).await;
        assert!(worker.stop().await);

        assert!(starter.await.unwrap().is_ok());
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(worker.state(), WorkerState::Stopped);
        assert!(store.is_empty().await);
    }
}
