//! Shared admission/state-machine core used by every dispatch strategy.
//!
//! All graph state lives behind one mutex. Strategies only decide *when* to
//! ask for work; claiming, running and completing actions happen here.

use crate::core::errors::BuildError;
use crate::core::limits::{AdmissionController, AdmissionPermit, AdmissionState};
use crate::exec::process::{ActionRunner, ExecutionResult};
use crate::graph::action::{ActionId, ActionState};
use crate::graph::graph::ActionGraph;
use crate::graph::ready::ReadySet;
use crate::report::{ActionRecord, ExecutionMode, Report, ResultAggregator};
use crate::scheduler::cache::ArtifactCache;
use crate::scheduler::observer::ActionObserver;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Scheduler lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Idle,
    Running,
    /// No new starts; in-flight actions finish
    Draining,
    Done,
}

/// Per-run behaviour switches
#[derive(Debug, Clone, Copy, Default)]
pub struct QueueOptions {
    pub stop_on_error: bool,
    pub tolerate_failed_prerequisites: bool,
    pub tolerate_cancelled: bool,
    pub compact_output: bool,
}

/// A ready action that has been admitted and marked running
#[derive(Debug)]
pub struct Claim {
    id: ActionId,
    permit: AdmissionPermit,
}

impl Claim {
    pub fn id(&self) -> ActionId {
        self.id
    }
}

enum Completion {
    Ran(ExecutionResult),
    CacheHit,
    Error(BuildError),
}

struct QueueState {
    phase: Phase,
    ready: ReadySet,
    aggregator: ResultAggregator,
    in_flight: usize,
    cancelled: bool,
}

/// What to tell observers once the lock is released
#[derive(Default)]
struct Notices {
    completed: Option<ActionRecord>,
    skipped: Vec<ActionId>,
    phase: Option<Phase>,
}

pub struct ActionQueue {
    graph: Arc<ActionGraph>,
    state: Mutex<QueueState>,
    admission: Arc<AdmissionController>,
    runner: Arc<dyn ActionRunner>,
    cache: Option<Arc<dyn ArtifactCache>>,
    observers: Vec<Arc<dyn ActionObserver>>,
    options: QueueOptions,
    cancel: CancellationToken,
    changed: Notify,
}

impl std::fmt::Debug for ActionQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActionQueue")
            .field("actions", &self.graph.len())
            .field("phase", &self.phase())
            .field("options", &self.options)
            .finish()
    }
}

impl ActionQueue {
    pub(crate) fn new(
        graph: Arc<ActionGraph>,
        admission: Arc<AdmissionController>,
        runner: Arc<dyn ActionRunner>,
        cache: Option<Arc<dyn ArtifactCache>>,
        observers: Vec<Arc<dyn ActionObserver>>,
        options: QueueOptions,
    ) -> Self {
        let ready = ReadySet::new(&graph, options.tolerate_failed_prerequisites);
        let aggregator = ResultAggregator::new(&graph, options.tolerate_cancelled);
        Self {
            graph,
            state: Mutex::new(QueueState {
                phase: Phase::Idle,
                ready,
                aggregator,
                in_flight: 0,
                cancelled: false,
            }),
            admission,
            runner,
            cache,
            observers,
            options,
            cancel: CancellationToken::new(),
            changed: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn graph(&self) -> &ActionGraph {
        &self.graph
    }

    pub fn phase(&self) -> Phase {
        self.lock().phase
    }

    pub fn is_done(&self) -> bool {
        self.phase() == Phase::Done
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn admission(&self) -> AdmissionState {
        self.admission.snapshot()
    }

    pub fn action_state(&self, id: ActionId) -> ActionState {
        self.lock().ready.state(id)
    }

    /// Idle -> Running. Later calls are no-ops.
    pub fn start(&self) {
        let notices = {
            let mut state = self.lock();
            if state.phase != Phase::Idle {
                debug!(phase = ?state.phase, "Start ignored");
                return;
            }
            state.phase = Phase::Running;
            info!(actions = self.graph.len(), "Scheduler running");
            let mut notices = Notices {
                phase: Some(Phase::Running),
                ..Default::default()
            };
            self.finish_if_settled(&mut state, &mut notices);
            notices
        };
        self.publish(notices);
        self.changed.notify_waiters();
    }

    /// Admit the oldest ready action, if the phase and budget allow it.
    pub fn try_claim(&self) -> Option<Claim> {
        let mut state = self.lock();
        if state.phase != Phase::Running || state.cancelled {
            return None;
        }
        let id = state.ready.start_next()?;
        match self.admission.try_acquire(self.graph.action(id).weight) {
            Some(permit) => {
                state.in_flight += 1;
                Some(Claim { id, permit })
            }
            None => {
                state.ready.requeue(id);
                None
            }
        }
    }

    /// True while new actions may still be started.
    fn accepting(&self) -> bool {
        let state = self.lock();
        state.phase == Phase::Running && !state.cancelled
    }

    /// Wait until an action can be claimed; `None` once nothing more will start.
    pub async fn next_claim(&self) -> Option<Claim> {
        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(claim) = self.try_claim() {
                return Some(claim);
            }
            if !self.accepting() {
                return None;
            }
            notified.await;
        }
    }

    /// Start as many admissible actions as the budget allows, each on its own task.
    pub fn start_many(self: &Arc<Self>) -> usize {
        let mut started = 0;
        while let Some(claim) = self.try_claim() {
            let queue = Arc::clone(self);
            tokio::spawn(async move { queue.execute(claim).await });
            started += 1;
        }
        if started > 0 {
            debug!(started, "Started actions");
        }
        started
    }

    /// Run a claimed action and record its outcome.
    pub async fn execute(&self, claim: Claim) {
        let Claim { id, permit } = claim;
        let action = self.graph.action(id);
        for observer in &self.observers {
            observer.on_action_started(id, action);
        }
        debug!(action = %action.name, id = %id, weight = permit.weight(), "Action started");

        let completion = self.run_claimed(id).await;
        // Slot goes back before dependents are released.
        drop(permit);
        self.complete(id, completion);
    }

    async fn run_claimed(&self, id: ActionId) -> Completion {
        let action = self.graph.action(id);
        if let Some(cache) = &self.cache {
            match cache.lookup(action).await {
                Ok(true) => return Completion::CacheHit,
                Ok(false) => {}
                Err(e) => warn!(action = %action.name, "Artifact cache lookup failed: {:#}", e),
            }
            self.lock().aggregator.record_cache_miss();
        }

        match self.runner.run(action, &self.cancel).await {
            Ok(result) => {
                if result.success() {
                    if let Some(cache) = &self.cache {
                        if let Err(e) = cache.store(action, &result).await {
                            warn!(action = %action.name, "Artifact cache store failed: {:#}", e);
                        }
                    }
                }
                Completion::Ran(result)
            }
            Err(e) => Completion::Error(e),
        }
    }

    fn complete(&self, id: ActionId, completion: Completion) {
        let action = self.graph.action(id);
        let mut notices = Notices::default();
        let final_state;
        {
            let mut state = self.lock();
            state.in_flight = state.in_flight.saturating_sub(1);

            final_state = match &completion {
                Completion::Ran(result) => {
                    state.aggregator.record_result(id, result);
                    if result.success() {
                        ActionState::Succeeded
                    } else {
                        ActionState::Failed
                    }
                }
                Completion::CacheHit => {
                    state.aggregator.record_cache_hit(id);
                    ActionState::Succeeded
                }
                Completion::Error(e @ BuildError::Cancelled { .. }) => {
                    state.aggregator.record_error(id, ActionState::Cancelled, e.to_string());
                    ActionState::Cancelled
                }
                Completion::Error(e) => {
                    state.aggregator.record_error(id, ActionState::Failed, e.to_string());
                    ActionState::Failed
                }
            };

            let progress = state.ready.complete(&self.graph, id, final_state);
            for skipped in &progress.skipped {
                state.aggregator.record_skipped(*skipped, Some(&action.name));
            }
            notices.skipped = progress.skipped;

            if final_state == ActionState::Failed
                && self.options.stop_on_error
                && state.phase == Phase::Running
            {
                warn!(action = %action.name, "Action failed, draining in-flight actions");
                state.phase = Phase::Draining;
                notices.phase = Some(Phase::Draining);
            }

            self.finish_if_settled(&mut state, &mut notices);
            notices.completed = Some(state.aggregator.record(id).clone());
        }

        self.log_completion(id, final_state, &completion);
        self.publish(notices);
        self.changed.notify_waiters();
    }

    /// Move to Done once nothing runs and nothing more can start.
    fn finish_if_settled(&self, state: &mut QueueState, notices: &mut Notices) {
        if state.in_flight > 0 {
            return;
        }
        let stopping = state.cancelled || state.phase == Phase::Draining;
        let settled = match state.phase {
            Phase::Running => stopping || !state.ready.has_ready(),
            Phase::Draining => true,
            Phase::Idle => state.cancelled,
            Phase::Done => false,
        };
        if !settled {
            return;
        }

        let leftover = state.ready.skip_unstarted();
        if !leftover.is_empty() {
            if !stopping {
                error!(count = leftover.len(), "Actions left unreachable with nothing running");
            }
            for id in &leftover {
                state.aggregator.record_skipped(*id, None);
            }
            notices.skipped.extend(leftover);
        }
        state.phase = Phase::Done;
        notices.phase = Some(Phase::Done);
        info!(success = state.aggregator.success(), "Scheduler done");
    }

    fn log_completion(&self, id: ActionId, state: ActionState, completion: &Completion) {
        let action = self.graph.action(id);
        match completion {
            Completion::Ran(result) => {
                let failed = !result.success();
                if failed || !self.options.compact_output {
                    for line in &result.output {
                        info!(action = %action.name, "{}", line);
                    }
                }
                if failed {
                    error!(
                        action = %action.name,
                        exit_code = result.exit_code,
                        duration_ms = result.duration.as_millis() as u64,
                        "Action failed"
                    );
                } else {
                    info!(
                        action = %action.name,
                        duration_ms = result.duration.as_millis() as u64,
                        "Action succeeded"
                    );
                }
            }
            Completion::CacheHit => info!(action = %action.name, "Action satisfied from cache"),
            Completion::Error(e) => match state {
                ActionState::Cancelled => info!(action = %action.name, "Action cancelled"),
                _ => error!(action = %action.name, category = e.category(), "Action failed: {}", e),
            },
        }
    }

    fn publish(&self, notices: Notices) {
        if self.observers.is_empty() {
            return;
        }
        for observer in &self.observers {
            for id in &notices.skipped {
                observer.on_action_skipped(*id, self.graph.action(*id));
            }
            if let Some(record) = &notices.completed {
                observer.on_action_completed(record);
            }
            if let Some(phase) = notices.phase {
                observer.on_phase_changed(phase);
            }
        }
    }

    /// Raise cancellation: running children are killed, nothing new starts.
    pub fn cancel(&self) {
        self.cancel.cancel();
        let notices = {
            let mut state = self.lock();
            if state.cancelled || state.phase == Phase::Done {
                return;
            }
            state.cancelled = true;
            state.aggregator.mark_interrupted();
            warn!(in_flight = state.in_flight, "Run cancelled");
            let mut notices = Notices::default();
            if state.phase == Phase::Running {
                state.phase = Phase::Draining;
                notices.phase = Some(Phase::Draining);
            }
            self.finish_if_settled(&mut state, &mut notices);
            notices
        };
        self.publish(notices);
        self.changed.notify_waiters();
    }

    /// Wait for Done and return the overall result.
    pub async fn wait_done(&self) -> bool {
        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let state = self.lock();
                if state.phase == Phase::Done {
                    return state.aggregator.success();
                }
            }
            notified.await;
        }
    }

    pub fn report(&self, mode: ExecutionMode) -> Report {
        self.lock().aggregator.finish(mode)
    }
}
