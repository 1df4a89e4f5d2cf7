//! Event-driven supervision of a running workflow.
//!
//! A [`WorkflowMonitor`] tracks every pipeline of one run through
//! `STARTING → RUNNING → {DONE, FAILED}` by consuming [`WorkflowStatus`]
//! events from an [`EventFeed`]. Its state lives in a [`SharedData`] so the
//! background task and any reader see consistent snapshots, and listener
//! notifications are issued while that lock is held, which gives every
//! listener one total order of transitions and final reports.

use crate::feed::{EventFeed, EventTopic, FeedSubscription};
use chrono::Utc;
use orca_core::{
    OrcaConfig, OrcaError, OrcaResult, PipelineName, PipelineState, RunId, SharedData,
    SharedDataGuard, WorkflowReport, WorkflowState, WorkflowStatus,
};
use parking_lot::Mutex;
use serde_json::json;
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const WORKFLOW_STATE: &str = "workflow_state";
const PIPELINES: &str = "pipelines";
const ERROR: &str = "error";
const MALFORMED: &str = "malformed_events";

/// Receives pipeline transitions and the final workflow report.
///
/// Callbacks run on the monitor task, in registration order, while the
/// monitor's state lock is held: they may read the monitor but must not block.
pub trait StatusListener: Send + Sync {
    /// A pipeline moved from `old` to `new`. Not called for repeated events.
    fn on_transition(&self, pipeline: &str, old: PipelineState, new: PipelineState);

    /// The workflow reached `COMPLETE` or `CANCELLED`.
    fn on_finished(&self, _report: &WorkflowReport) {}

    /// The monitor lost its event feed; `report.error` holds the cause.
    fn on_error(&self, _report: &WorkflowReport) {}
}

/// Handle returned by [`WorkflowMonitor::add_status_listener`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(Uuid);

type ListenerSet = Vec<(ListenerId, Arc<dyn StatusListener>)>;

/// State shared between the monitor handle and its background task.
struct MonitorCore {
    run_id: RunId,
    topic: EventTopic,
    state: SharedData,
    listeners: Mutex<ListenerSet>,
    finished_tx: watch::Sender<WorkflowState>,
    cancel: CancellationToken,
}

impl MonitorCore {
    fn listeners(&self) -> Vec<Arc<dyn StatusListener>> {
        self.listeners
            .lock()
            .iter()
            .map(|(_, l)| Arc::clone(l))
            .collect()
    }

    fn report(&self, guard: &SharedDataGuard<'_>) -> OrcaResult<WorkflowReport> {
        Ok(WorkflowReport {
            run_id: self.run_id.clone(),
            state: guard.get_as(WORKFLOW_STATE)?,
            pipelines: guard.get_as(PIPELINES)?,
            error: guard.get_as(ERROR)?,
        })
    }

    /// Apply one raw payload. Returns `true` once the workflow is complete.
    fn handle_payload(&self, payload: &str) -> OrcaResult<bool> {
        let status: WorkflowStatus = match serde_json::from_str(payload) {
            Ok(status) => status,
            Err(e) => {
                warn!(topic = %self.topic, error = %e, "skipping malformed status event");
                let guard = self.state.lock();
                let seen: u64 = guard.get_as(MALFORMED)?;
                guard.set(MALFORMED, seen + 1)?;
                return Ok(false);
            }
        };

        if status.run_id != self.run_id {
            debug!(
                run_id = %self.run_id,
                event_run = %status.run_id,
                "ignoring event for another run"
            );
            return Ok(false);
        }

        let guard = self.state.lock();
        let workflow: WorkflowState = guard.get_as(WORKFLOW_STATE)?;
        if workflow.is_finished() || self.cancel.is_cancelled() {
            return Ok(workflow == WorkflowState::Complete);
        }

        let mut pipelines: BTreeMap<PipelineName, PipelineState> = guard.get_as(PIPELINES)?;
        let Some(old) = pipelines.get(&status.pipeline_name).copied() else {
            warn!(
                run_id = %self.run_id,
                pipeline = %status.pipeline_name,
                "event for unknown pipeline"
            );
            return Ok(false);
        };

        if !old.can_transition_to(status.state) {
            debug!(
                pipeline = %status.pipeline_name,
                current = %old,
                event = %status.state,
                "event does not change pipeline state"
            );
            return Ok(false);
        }

        pipelines.insert(status.pipeline_name.clone(), status.state);
        let complete = pipelines.values().all(|s| s.is_terminal());
        guard.set(PIPELINES, &pipelines)?;

        let lag_ms = (Utc::now() - status.timestamp).num_milliseconds();
        info!(
            run_id = %self.run_id,
            pipeline = %status.pipeline_name,
            from = %old,
            to = %status.state,
            host = %status.source_host,
            lag_ms,
            "pipeline transition"
        );
        for listener in self.listeners() {
            listener.on_transition(&status.pipeline_name, old, status.state);
        }

        if complete {
            self.finish_locked(&guard, WorkflowState::Complete, None)?;
        }
        Ok(complete)
    }

    /// Move the workflow out of `ACTIVE` once; later calls are no-ops.
    fn finish(&self, state: WorkflowState, error: Option<String>) {
        let guard = self.state.lock();
        if let Err(e) = self.finish_locked(&guard, state, error) {
            error!(run_id = %self.run_id, error = %e, "failed to record final workflow state");
        }
    }

    fn finish_locked(
        &self,
        guard: &SharedDataGuard<'_>,
        state: WorkflowState,
        error: Option<String>,
    ) -> OrcaResult<()> {
        let current: WorkflowState = guard.get_as(WORKFLOW_STATE)?;
        if current.is_finished() {
            return Ok(());
        }
        guard.set(WORKFLOW_STATE, state)?;
        guard.set(ERROR, &error)?;
        let report = self.report(guard)?;

        match state {
            WorkflowState::Failed => {
                error!(run_id = %self.run_id, error = ?report.error, "workflow monitor failed");
                for listener in self.listeners() {
                    listener.on_error(&report);
                }
            }
            _ => {
                info!(run_id = %self.run_id, state = %state, "workflow finished");
                for listener in self.listeners() {
                    listener.on_finished(&report);
                }
            }
        }
        self.finished_tx.send_replace(state);
        Ok(())
    }
}

async fn consume(core: Arc<MonitorCore>, mut subscription: Box<dyn FeedSubscription>) {
    loop {
        tokio::select! {
            biased;
            _ = core.cancel.cancelled() => {
                core.finish(WorkflowState::Cancelled, None);
                break;
            }
            next = subscription.next_payload() => {
                let outcome = next.and_then(|payload| core.handle_payload(&payload));
                match outcome {
                    Ok(true) => break,
                    Ok(false) => {}
                    Err(e) => {
                        core.finish(WorkflowState::Failed, Some(e.to_string()));
                        break;
                    }
                }
            }
        }
    }
    drop(subscription);
    debug!(topic = %core.topic, "monitor task exited, subscription released");
}

/// Tracks the pipelines of one run until the workflow finishes.
pub struct WorkflowMonitor {
    core: Arc<MonitorCore>,
    feed: Arc<dyn EventFeed>,
    finished_rx: watch::Receiver<WorkflowState>,
    task: Mutex<Option<JoinHandle<()>>>,
    started: AtomicBool,
}

impl WorkflowMonitor {
    /// Monitor for `pipelines` of `run_id`, listening on the run's topic.
    ///
    /// Every pipeline starts in `STARTING`. Names must be unique and the set
    /// non-empty.
    pub fn new(
        config: &OrcaConfig,
        run_id: RunId,
        pipelines: &[PipelineName],
        feed: Arc<dyn EventFeed>,
    ) -> OrcaResult<Self> {
        let topic = EventTopic::from_config(config, &run_id);
        Self::with_topic(topic, run_id, pipelines, feed)
    }

    pub fn with_topic(
        topic: EventTopic,
        run_id: RunId,
        pipelines: &[PipelineName],
        feed: Arc<dyn EventFeed>,
    ) -> OrcaResult<Self> {
        validate_pipelines(pipelines)?;

        let initial: BTreeMap<PipelineName, PipelineState> = pipelines
            .iter()
            .map(|name| (name.clone(), PipelineState::Starting))
            .collect();
        let state = SharedData::new();
        state.init_data([
            (WORKFLOW_STATE, serde_json::to_value(WorkflowState::Active)?),
            (PIPELINES, serde_json::to_value(&initial)?),
            (ERROR, json!(null)),
            (MALFORMED, json!(0u64)),
        ])?;

        let (finished_tx, finished_rx) = watch::channel(WorkflowState::Active);
        let core = MonitorCore {
            run_id,
            topic,
            state,
            listeners: Mutex::new(Vec::new()),
            finished_tx,
            cancel: CancellationToken::new(),
        };

        Ok(Self {
            core: Arc::new(core),
            feed,
            finished_rx,
            task: Mutex::new(None),
            started: AtomicBool::new(false),
        })
    }

    pub fn run_id(&self) -> &RunId {
        &self.core.run_id
    }

    pub fn topic(&self) -> &EventTopic {
        &self.core.topic
    }

    /// Register a listener; notifications follow registration order.
    pub fn add_status_listener(&self, listener: Arc<dyn StatusListener>) -> ListenerId {
        let id = ListenerId(Uuid::new_v4());
        self.core.listeners.lock().push((id, listener));
        id
    }

    /// Returns `false` if `id` was not registered.
    pub fn remove_status_listener(&self, id: ListenerId) -> bool {
        let mut listeners = self.core.listeners.lock();
        let before = listeners.len();
        listeners.retain(|(lid, _)| *lid != id);
        listeners.len() != before
    }

    /// Subscribe to the run's topic and start consuming on a background task.
    ///
    /// Must be called from within a tokio runtime. A failed subscription does
    /// not make this return an error: the monitor moves to `FAILED` and
    /// listeners get `on_error`.
    pub async fn start_monitor_task(&self) -> OrcaResult<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(OrcaError::Monitor(format!(
                "monitor for run {} already started",
                self.core.run_id
            )));
        }
        if self.core.cancel.is_cancelled() {
            debug!(run_id = %self.core.run_id, "monitor stopped before start");
            return Ok(());
        }

        match self.feed.subscribe(&self.core.topic).await {
            Ok(subscription) => {
                info!(run_id = %self.core.run_id, topic = %self.core.topic, "monitor started");
                let handle = tokio::spawn(consume(Arc::clone(&self.core), subscription));
                *self.task.lock() = Some(handle);
            }
            Err(e) => {
                self.core.finish(WorkflowState::Failed, Some(e.to_string()));
            }
        }
        Ok(())
    }

    /// Request early termination without waiting for the task to exit.
    ///
    /// The workflow becomes `CANCELLED` unless it had already finished, and no
    /// transition is reported after this returns.
    pub fn stop(&self) {
        self.core.cancel.cancel();
        self.core.finish(WorkflowState::Cancelled, None);
    }

    pub fn workflow_state(&self) -> WorkflowState {
        *self.finished_rx.borrow()
    }

    pub fn is_finished(&self) -> bool {
        self.workflow_state().is_finished()
    }

    pub fn pipeline_state(&self, pipeline: &str) -> OrcaResult<Option<PipelineState>> {
        let guard = self.core.state.lock();
        let pipelines: BTreeMap<PipelineName, PipelineState> = guard.get_as(PIPELINES)?;
        Ok(pipelines.get(pipeline).copied())
    }

    /// Snapshot of the aggregate state.
    pub fn report(&self) -> OrcaResult<WorkflowReport> {
        let guard = self.core.state.lock();
        self.core.report(&guard)
    }

    /// Number of payloads that could not be parsed.
    pub fn malformed_events(&self) -> OrcaResult<u64> {
        self.core.state.lock().get_as(MALFORMED)
    }

    /// Wait until the workflow leaves `ACTIVE` and return the final state.
    pub async fn wait_for_completion(&self) -> WorkflowState {
        let mut rx = self.finished_rx.clone();
        let finished = rx.wait_for(|s| s.is_finished()).await.map(|s| *s);
        match finished {
            Ok(state) => state,
            Err(_) => {
                let state = *rx.borrow();
                state
            }
        }
    }

    /// Blocking form of [`wait_for_completion`](Self::wait_for_completion) for
    /// callers outside the runtime. Returns the state seen at `timeout`.
    pub fn wait_blocking(&self, timeout: Duration) -> WorkflowState {
        let deadline = Instant::now() + timeout;
        loop {
            let generation = self.core.state.generation();
            let state = self
                .core
                .state
                .lock()
                .get_as(WORKFLOW_STATE)
                .unwrap_or(WorkflowState::Active);
            let now = Instant::now();
            if state.is_finished() || now >= deadline {
                return state;
            }
            self.core.state.wait_for_generation(generation, deadline - now);
        }
    }

    /// Wait for the background task to exit.
    pub async fn join(&self) {
        let handle = self.task.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!(run_id = %self.core.run_id, error = %e, "monitor task panicked");
            }
        }
    }
}

impl std::fmt::Debug for WorkflowMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowMonitor")
            .field("run_id", &self.core.run_id)
            .field("topic", &self.core.topic)
            .field("state", &self.workflow_state())
            .field("started", &self.started.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

impl Drop for WorkflowMonitor {
    fn drop(&mut self) {
        self.core.cancel.cancel();
    }
}

pub(crate) fn validate_pipelines(pipelines: &[PipelineName]) -> OrcaResult<()> {
    if pipelines.is_empty() {
        return Err(OrcaError::Config("workflow has no pipelines".to_string()));
    }
    let mut seen = HashSet::new();
    for name in pipelines {
        if name.trim().is_empty() {
            return Err(OrcaError::Config("empty pipeline name".to_string()));
        }
        if !seen.insert(name.as_str()) {
            return Err(OrcaError::Config(format!("duplicate pipeline name '{name}'")));
        }
    }
    Ok(())
}
