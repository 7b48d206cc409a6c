//! Local scheduling of an [`ActionGraph`].
//!
//! The [`Scheduler`] owns the admission budget and the ready set, and runs
//! actions through an [`ActionRunner`] under either an automatic worker pool
//! or caller-driven manual starts.

pub mod cache;
pub mod dispatch;
pub mod observer;
pub mod queue;

pub use cache::{ArtifactCache, MemoryArtifactCache};
pub use dispatch::{AutomaticDispatch, DispatchStrategy, ManualDispatch};
pub use observer::{ActionObserver, ObservedEvent, RecordingObserver};
pub use queue::{ActionQueue, Phase, QueueOptions};

use crate::core::config::ExecutorConfig;
use crate::core::errors::Result;
use crate::core::limits::{AdmissionController, AdmissionLimits, AdmissionState};
use crate::core::memory::{MemoryProbe, SystemMemory};
use crate::exec::process::{ActionRunner, ProcessExecutor};
use crate::graph::action::{ActionId, ActionState};
use crate::graph::graph::ActionGraph;
use crate::report::{ExecutionMode, Report};
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument};

/// Builder for [`Scheduler`]
pub struct SchedulerBuilder {
    config: ExecutorConfig,
    memory: Arc<dyn MemoryProbe>,
    max_slots: Option<usize>,
    runner: Option<Arc<dyn ActionRunner>>,
    cache: Option<Arc<dyn ArtifactCache>>,
    observers: Vec<Arc<dyn ActionObserver>>,
    dispatch: Option<Box<dyn DispatchStrategy>>,
}

impl SchedulerBuilder {
    pub fn new(config: ExecutorConfig) -> Self {
        Self {
            config,
            memory: Arc::new(SystemMemory),
            max_slots: None,
            runner: None,
            cache: None,
            observers: Vec::new(),
            dispatch: None,
        }
    }

    pub fn memory_probe(mut self, memory: Arc<dyn MemoryProbe>) -> Self {
        self.memory = memory;
        self
    }

    /// Bypass core/memory derivation and use exactly this many slots.
    pub fn max_slots(mut self, slots: usize) -> Self {
        self.max_slots = Some(slots);
        self
    }

    pub fn runner(mut self, runner: Arc<dyn ActionRunner>) -> Self {
        self.runner = Some(runner);
        self
    }

    pub fn cache(mut self, cache: Arc<dyn ArtifactCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn observer(mut self, observer: Arc<dyn ActionObserver>) -> Self {
        self.observers.push(observer);
        self
    }

    /// Override the strategy selected by the config's dispatch mode.
    pub fn dispatch(mut self, dispatch: Box<dyn DispatchStrategy>) -> Self {
        self.dispatch = Some(dispatch);
        self
    }

    pub fn build(self, graph: ActionGraph) -> Result<Scheduler> {
        self.config.validate()?;
        graph.validate()?;

        let memory_per_action = self.config.memory_per_action(graph.memory_per_action());
        let max_slots = match self.max_slots {
            Some(slots) => slots,
            None => self
                .config
                .effective_parallelism(self.memory.as_ref(), graph.memory_per_action()),
        };
        let limits = AdmissionLimits::new(max_slots)
            .with_weights(self.config.use_action_weights)
            .with_memory_per_action(memory_per_action);
        let admission = AdmissionController::new(limits, self.memory)?;

        let runner = self.runner.unwrap_or_else(|| {
            Arc::new(
                ProcessExecutor::new()
                    .with_timeout(self.config.action_timeout())
                    .log_command_lines(self.config.log_command_lines),
            )
        });
        let options = QueueOptions {
            stop_on_error: self.config.stop_on_error,
            tolerate_failed_prerequisites: self.config.tolerate_failed_prerequisites,
            tolerate_cancelled: self.config.tolerate_cancelled,
            compact_output: self.config.compact_output,
        };
        let dispatch = self
            .dispatch
            .unwrap_or_else(|| dispatch::strategy_for(self.config.dispatch));

        info!(
            actions = graph.len(),
            max_slots,
            dispatch = dispatch.name(),
            "Scheduler configured"
        );

        let queue = ActionQueue::new(
            Arc::new(graph),
            admission,
            runner,
            self.cache,
            self.observers,
            options,
        );
        Ok(Scheduler {
            queue: Arc::new(queue),
            dispatch,
            handles: Mutex::new(Vec::new()),
            show_action_timings: self.config.show_action_timings,
        })
    }
}

/// Runs an action graph on this host.
pub struct Scheduler {
    queue: Arc<ActionQueue>,
    dispatch: Box<dyn DispatchStrategy>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    show_action_timings: bool,
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("queue", &self.queue)
            .field("dispatch", &self.dispatch.name())
            .finish()
    }
}

impl Scheduler {
    pub fn builder(config: ExecutorConfig) -> SchedulerBuilder {
        SchedulerBuilder::new(config)
    }

    /// Scheduler with the default runner and system memory probe.
    pub fn new(config: ExecutorConfig, graph: ActionGraph) -> Result<Self> {
        SchedulerBuilder::new(config).build(graph)
    }

    pub fn graph(&self) -> &ActionGraph {
        self.queue.graph()
    }

    pub fn queue(&self) -> &Arc<ActionQueue> {
        &self.queue
    }

    /// Move to Running and launch the dispatch strategy. Idempotent.
    pub fn start(&self) {
        if self.queue.phase() != Phase::Idle {
            return;
        }
        self.queue.start();
        let launched = self.dispatch.launch(Arc::clone(&self.queue));
        self.handles
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .extend(launched);
    }

    /// Manual mode: start as many ready actions as the budget admits.
    pub fn start_many(&self) -> usize {
        self.queue.start_many()
    }

    /// Start if needed and wait until every action is terminal.
    #[instrument(skip(self), fields(actions = self.graph().len()))]
    pub async fn run_till_done(&self) -> bool {
        self.start();
        let success = self.queue.wait_done().await;

        let handles: Vec<JoinHandle<()>> = std::mem::take(
            &mut *self
                .handles
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner()),
        );
        for joined in futures::future::join_all(handles).await {
            if let Err(e) = joined {
                tracing::error!("Dispatch task ended abnormally: {}", e);
            }
        }

        if self.show_action_timings {
            self.log_timings();
        }
        success
    }

    fn log_timings(&self) {
        let report = self.queue.report(ExecutionMode::Local);
        for record in report.slowest(10) {
            info!(
                action = %record.name,
                duration_ms = record.duration.unwrap_or_default().as_millis() as u64,
                cpu_ms = record.processor_time.map(|t| t.as_millis() as u64),
                "Action timing"
            );
        }
    }

    /// Kill running actions and stop starting new ones.
    pub fn cancel(&self) {
        self.queue.cancel();
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.queue.cancellation_token()
    }

    pub fn phase(&self) -> Phase {
        self.queue.phase()
    }

    pub fn action_state(&self, id: ActionId) -> ActionState {
        self.queue.action_state(id)
    }

    pub fn admission_snapshot(&self) -> AdmissionState {
        self.queue.admission()
    }

    pub fn report(&self) -> Report {
        self.queue.report(ExecutionMode::Local)
    }
}
