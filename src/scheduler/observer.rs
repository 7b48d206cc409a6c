//! Hooks for watching a run without touching its state.

use crate::graph::action::{Action, ActionId};
use crate::report::ActionRecord;
use crate::scheduler::queue::Phase;
use std::sync::Mutex;

/// Receives scheduler events. Called outside the scheduler lock; each
/// completion hook fires at most once per action.
pub trait ActionObserver: Send + Sync {
    fn on_action_started(&self, _id: ActionId, _action: &Action) {}

    fn on_action_completed(&self, _record: &ActionRecord) {}

    fn on_action_skipped(&self, _id: ActionId, _action: &Action) {}

    fn on_phase_changed(&self, _phase: Phase) {}
}

/// Event captured by [`RecordingObserver`]
#[derive(Debug, Clone, PartialEq)]
pub enum ObservedEvent {
    Started(ActionId),
    Completed(ActionId),
    Skipped(ActionId),
    Phase(Phase),
}

/// Keeps every event in order; handy for assertions and debugging.
#[derive(Debug, Default)]
pub struct RecordingObserver {
    events: Mutex<Vec<ObservedEvent>>,
}

impl RecordingObserver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<ObservedEvent> {
        self.events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn push(&self, event: ObservedEvent) {
        self.events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(event);
    }

    /// Position of an event in the log
    pub fn position(&self, event: &ObservedEvent) -> Option<usize> {
        self.events().iter().position(|e| e == event)
    }
}

impl ActionObserver for RecordingObserver {
    fn on_action_started(&self, id: ActionId, _action: &Action) {
        self.push(ObservedEvent::Started(id));
    }

    fn on_action_completed(&self, record: &ActionRecord) {
        self.push(ObservedEvent::Completed(record.id));
    }

    fn on_action_skipped(&self, id: ActionId, _action: &Action) {
        self.push(ObservedEvent::Skipped(id));
    }

    fn on_phase_changed(&self, phase: Phase) {
        self.push(ObservedEvent::Phase(phase));
    }
}
