use crate::exec::process::ExecutionResult;
use crate::graph::action::{ActionId, ActionState};
use crate::graph::graph::ActionGraph;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::info;
use uuid::Uuid;

/// Where the graph was executed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExecutionMode {
    Local,
    Offloaded { task_id: String },
    /// Cancelled before the graph reached either path
    Aborted,
}

/// Final state and details of one action
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionRecord {
    pub id: ActionId,
    pub name: String,
    pub state: ActionState,
    pub exit_code: Option<i32>,
    pub output: Vec<String>,
    pub duration: Option<Duration>,
    pub processor_time: Option<Duration>,
    pub cache_hit: bool,
    /// Why the action did not succeed, when known
    pub error: Option<String>,
}

/// Aggregate outcome of a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Report {
    pub run_id: Uuid,
    pub mode: ExecutionMode,
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub skipped: usize,
    pub cache_hits: usize,
    pub cache_misses: usize,
    /// The run was cancelled, whether or not any action was running at the time
    pub interrupted: bool,
    pub success: bool,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub actions: Vec<ActionRecord>,
}

impl Report {
    pub fn cancelled_or_skipped(&self) -> usize {
        self.cancelled + self.skipped
    }

    pub fn record(&self, id: ActionId) -> Option<&ActionRecord> {
        self.actions.get(id.index())
    }

    pub fn failures(&self) -> impl Iterator<Item = &ActionRecord> {
        self.actions
            .iter()
            .filter(|r| r.state == ActionState::Failed)
    }

    /// The `n` longest-running actions, slowest first
    pub fn slowest(&self, n: usize) -> Vec<&ActionRecord> {
        let mut timed: Vec<&ActionRecord> = self
            .actions
            .iter()
            .filter(|r| r.duration.is_some() && !r.cache_hit)
            .collect();
        timed.sort_by(|a, b| b.duration.cmp(&a.duration));
        timed.truncate(n);
        timed
    }

    pub fn elapsed(&self) -> Duration {
        (self.finished_at - self.started_at)
            .to_std()
            .unwrap_or_default()
    }
}

/// Accumulates per-action outcomes while a run is in progress.
#[derive(Debug)]
pub struct ResultAggregator {
    run_id: Uuid,
    started_at: DateTime<Utc>,
    records: Vec<ActionRecord>,
    cache_hits: usize,
    cache_misses: usize,
    interrupted: bool,
    tolerate_cancelled: bool,
}

impl ResultAggregator {
    pub fn new(graph: &ActionGraph, tolerate_cancelled: bool) -> Self {
        let records = graph
            .iter()
            .map(|(id, action)| ActionRecord {
                id,
                name: action.name.clone(),
                state: ActionState::Pending,
                exit_code: None,
                output: Vec::new(),
                duration: None,
                processor_time: None,
                cache_hit: false,
                error: None,
            })
            .collect();
        Self {
            run_id: Uuid::new_v4(),
            started_at: Utc::now(),
            records,
            cache_hits: 0,
            cache_misses: 0,
            interrupted: false,
            tolerate_cancelled,
        }
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// Record an action whose process ran to completion.
    pub fn record_result(&mut self, id: ActionId, result: &ExecutionResult) {
        let record = &mut self.records[id.index()];
        record.state = if result.success() {
            ActionState::Succeeded
        } else {
            ActionState::Failed
        };
        record.exit_code = Some(result.exit_code);
        record.output = result.output.clone();
        record.duration = Some(result.duration);
        record.processor_time = result.processor_time;
        if !result.success() {
            record.error = Some(
                result
                    .description
                    .clone()
                    .unwrap_or_else(|| format!("exited with code {}", result.exit_code)),
            );
        }
    }

    /// Record an action that ended without a usable process result.
    pub fn record_error(&mut self, id: ActionId, state: ActionState, message: impl Into<String>) {
        let record = &mut self.records[id.index()];
        record.state = state;
        record.error = Some(message.into());
    }

    /// Record an action that ran remotely, where only the overall outcome is known.
    pub fn record_remote(&mut self, id: ActionId, state: ActionState) {
        let record = &mut self.records[id.index()];
        record.state = state;
        if state != ActionState::Succeeded {
            record.error = Some(format!("offloaded build {}", state));
        }
    }

    pub fn record_skipped(&mut self, id: ActionId, cause: Option<&str>) {
        let record = &mut self.records[id.index()];
        record.state = ActionState::Skipped;
        record.error = cause.map(|c| format!("prerequisite '{}' did not succeed", c));
    }

    pub fn record_cache_hit(&mut self, id: ActionId) {
        self.cache_hits += 1;
        let record = &mut self.records[id.index()];
        record.state = ActionState::Succeeded;
        record.cache_hit = true;
    }

    pub fn record_cache_miss(&mut self) {
        self.cache_misses += 1;
    }

    /// Note that the run was cancelled. Unless cancellation is tolerated the
    /// run fails, even when every action ended `Skipped`.
    pub fn mark_interrupted(&mut self) {
        self.interrupted = true;
    }

    pub fn state(&self, id: ActionId) -> ActionState {
        self.records[id.index()].state
    }

    pub fn record(&self, id: ActionId) -> &ActionRecord {
        &self.records[id.index()]
    }

    fn count(&self, state: ActionState) -> usize {
        self.records.iter().filter(|r| r.state == state).count()
    }

    /// True iff nothing failed and, unless tolerated, nothing was cancelled.
    pub fn success(&self) -> bool {
        if self.interrupted && !self.tolerate_cancelled {
            return false;
        }
        self.records.iter().all(|r| match r.state {
            ActionState::Failed => false,
            ActionState::Cancelled => self.tolerate_cancelled,
            _ => true,
        })
    }

    pub fn finish(&self, mode: ExecutionMode) -> Report {
        let report = Report {
            run_id: self.run_id,
            mode,
            total: self.records.len(),
            succeeded: self.count(ActionState::Succeeded),
            failed: self.count(ActionState::Failed),
            cancelled: self.count(ActionState::Cancelled),
            skipped: self.count(ActionState::Skipped),
            cache_hits: self.cache_hits,
            cache_misses: self.cache_misses,
            interrupted: self.interrupted,
            success: self.success(),
            started_at: self.started_at,
            finished_at: Utc::now(),
            actions: self.records.clone(),
        };
        info!(
            run_id = %report.run_id,
            total = report.total,
            succeeded = report.succeeded,
            failed = report.failed,
            cancelled = report.cancelled,
            skipped = report.skipped,
            cache_hits = report.cache_hits,
            cache_misses = report.cache_misses,
            interrupted = report.interrupted,
            success = report.success,
            "Run finished"
        );
        report
    }
}
