use crate::core::config::DispatchMode;
use crate::scheduler::queue::ActionQueue;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

/// Decides when ready actions are pulled into execution.
///
/// Both strategies share the same [`ActionQueue`]; they differ only in who
/// drives `try_claim`.
pub trait DispatchStrategy: Send + Sync + std::fmt::Debug {
    fn name(&self) -> &'static str;

    /// Spawn whatever tasks drive the queue to completion.
    fn launch(&self, queue: Arc<ActionQueue>) -> Vec<JoinHandle<()>>;
}

pub fn strategy_for(mode: DispatchMode) -> Box<dyn DispatchStrategy> {
    match mode {
        DispatchMode::Automatic => Box::new(AutomaticDispatch),
        DispatchMode::Manual { poll_interval_ms } => Box::new(ManualDispatch {
            poll_interval: Some(Duration::from_millis(poll_interval_ms)),
        }),
    }
}

/// Fixed worker pool; each worker loops claim -> run until nothing more starts.
#[derive(Debug, Default, Clone, Copy)]
pub struct AutomaticDispatch;

impl DispatchStrategy for AutomaticDispatch {
    fn name(&self) -> &'static str {
        "automatic"
    }

    fn launch(&self, queue: Arc<ActionQueue>) -> Vec<JoinHandle<()>> {
        let workers = queue
            .admission()
            .max_slots
            .min(queue.graph().len())
            .max(1);
        debug!(workers, "Launching dispatch workers");

        (0..workers)
            .map(|worker| {
                let queue = Arc::clone(&queue);
                tokio::spawn(async move {
                    while let Some(claim) = queue.next_claim().await {
                        trace!(worker, action = %claim.id(), "Worker claimed action");
                        queue.execute(claim).await;
                    }
                    trace!(worker, "Worker exiting");
                })
            })
            .collect()
    }
}

/// Caller-driven starts. With a poll interval a ticker calls
/// [`ActionQueue::start_many`] on its own; without one nothing starts until
/// the caller does it.
#[derive(Debug, Default, Clone, Copy)]
pub struct ManualDispatch {
    pub poll_interval: Option<Duration>,
}

impl DispatchStrategy for ManualDispatch {
    fn name(&self) -> &'static str {
        "manual"
    }

    fn launch(&self, queue: Arc<ActionQueue>) -> Vec<JoinHandle<()>> {
        let Some(period) = self.poll_interval else {
            return Vec::new();
        };
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if queue.is_done() {
                    break;
                }
                queue.start_many();
            }
        });
        vec![handle]
    }
}
