use crate::core::config::ExecutorConfig;
use crate::core::errors::{BuildError, Result};
use crate::core::memory::{MemoryProbe, SystemMemory};
use crate::exec::process::ActionRunner;
use crate::graph::action::ActionState;
use crate::graph::graph::ActionGraph;
use crate::offload::negotiate::ResourceBroker;
use crate::offload::OffloadAdapter;
use crate::report::{ExecutionMode, Report, ResultAggregator};
use crate::scheduler::{ActionObserver, ArtifactCache, Scheduler};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

/// Runs a graph either remotely, when offloading is configured and available,
/// or on this host through the [`Scheduler`].
pub struct BuildExecutor {
    config: ExecutorConfig,
    memory: Arc<dyn MemoryProbe>,
    max_slots: Option<usize>,
    runner: Option<Arc<dyn ActionRunner>>,
    cache: Option<Arc<dyn ArtifactCache>>,
    observers: Vec<Arc<dyn ActionObserver>>,
    broker: Option<Arc<dyn ResourceBroker>>,
    cancel: CancellationToken,
}

impl BuildExecutor {
    pub fn new(config: ExecutorConfig) -> Self {
        Self {
            config,
            memory: Arc::new(SystemMemory),
            max_slots: None,
            runner: None,
            cache: None,
            observers: Vec::new(),
            broker: None,
            cancel: CancellationToken::new(),
        }
    }

    pub fn memory_probe(mut self, memory: Arc<dyn MemoryProbe>) -> Self {
        self.memory = memory;
        self
    }

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

    /// Broker used when negotiating offload capacity.
    pub fn broker(mut self, broker: Arc<dyn ResourceBroker>) -> Self {
        self.broker = Some(broker);
        self
    }

    /// Cancelling this token aborts the run, local or remote.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    #[instrument(skip_all, fields(actions = graph.len()))]
    pub async fn execute(&self, graph: ActionGraph) -> Result<Report> {
        if graph.is_empty() {
            info!("Nothing to build");
            return Ok(ResultAggregator::new(&graph, self.config.tolerate_cancelled)
                .finish(ExecutionMode::Local));
        }
        graph.validate()?;

        if let Some(offload) = &self.config.offload {
            let mut adapter = OffloadAdapter::new(offload.clone());
            if let Some(broker) = &self.broker {
                adapter = adapter.with_broker(Arc::clone(broker));
            }
            if adapter.is_available(&graph) {
                match self.offload(&adapter, &graph).await {
                    Ok(report) => return Ok(report),
                    Err(e) if e.allows_local_fallback() => {
                        warn!(category = e.category(), "Offload unavailable, building locally: {}", e);
                    }
                    Err(e) => return Err(e),
                }
            }
        }

        self.run_local(graph).await
    }

    async fn offload(&self, adapter: &OffloadAdapter, graph: &ActionGraph) -> Result<Report> {
        let grant = match adapter.negotiate(graph, &self.cancel).await {
            Ok(grant) => grant,
            Err(BuildError::Cancelled { .. }) => {
                let report =
                    self.uniform_report(graph, ActionState::Cancelled, ExecutionMode::Aborted);
                return Ok(report);
            }
            Err(e) => return Err(e),
        };
        let mode = ExecutionMode::Offloaded {
            task_id: grant.task_id.clone(),
        };
        let outcome = match adapter.execute(graph, &grant, &self.cancel).await {
            Ok(true) => ActionState::Succeeded,
            Ok(false) => ActionState::Failed,
            Err(BuildError::Cancelled { .. }) => ActionState::Cancelled,
            Err(e) => return Err(e),
        };
        Ok(self.uniform_report(graph, outcome, mode))
    }

    /// Report where every action shares one outcome.
    fn uniform_report(&self, graph: &ActionGraph, state: ActionState, mode: ExecutionMode) -> Report {
        let mut aggregator = ResultAggregator::new(graph, self.config.tolerate_cancelled);
        if state == ActionState::Cancelled {
            aggregator.mark_interrupted();
        }
        for id in graph.ids() {
            aggregator.record_remote(id, state);
        }
        aggregator.finish(mode)
    }

    async fn run_local(&self, graph: ActionGraph) -> Result<Report> {
        let mut builder = Scheduler::builder(self.config.clone()).memory_probe(Arc::clone(&self.memory));
        if let Some(slots) = self.max_slots {
            builder = builder.max_slots(slots);
        }
        if let Some(runner) = &self.runner {
            builder = builder.runner(Arc::clone(runner));
        }
        if let Some(cache) = &self.cache {
            builder = builder.cache(Arc::clone(cache));
        }
        for observer in &self.observers {
            builder = builder.observer(Arc::clone(observer));
        }
        let scheduler = builder.build(graph)?;

        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => {
                scheduler.cancel();
                scheduler.run_till_done().await;
            }
            _ = scheduler.run_till_done() => {}
        }
        Ok(scheduler.report())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::memory::FixedMemory;
    use crate::graph::action::{Action, ActionId};

    #[tokio::test]
    async fn test_empty_graph_succeeds() {
        let report = BuildExecutor::new(ExecutorConfig::default())
            .execute(ActionGraph::builder().build())
            .await
            .unwrap();
        assert!(report.success);
        assert_eq!(report.total, 0);
        assert_eq!(report.mode, ExecutionMode::Local);
    }

    #[tokio::test]
    async fn test_dangling_prerequisite_aborts() {
        let mut builder = ActionGraph::builder();
        builder.add(Action::new("a", "true").after(ActionId(7)));
        let err = BuildExecutor::new(ExecutorConfig::default())
            .memory_probe(Arc::new(FixedMemory::new(u64::MAX)))
            .execute(builder.build())
            .await
            .unwrap_err();
        assert!(err.is_fatal());
        assert!(matches!(err, BuildError::Configuration { .. }));
    }

    #[tokio::test]
    async fn test_cancelled_before_execute_fails() {
        let mut builder = ActionGraph::builder();
        builder.add(Action::new("a", "true"));
        let executor = BuildExecutor::new(ExecutorConfig::default())
            .memory_probe(Arc::new(FixedMemory::new(u64::MAX)));
        executor.cancellation_token().cancel();

        let report = executor.execute(builder.build()).await.unwrap();
        assert!(report.interrupted);
        assert!(!report.success);
        assert_eq!(report.actions[0].state, ActionState::Skipped);
    }
}
