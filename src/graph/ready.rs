use crate::graph::action::{ActionId, ActionState};
use crate::graph::graph::ActionGraph;
use std::collections::VecDeque;

/// What a completion changed downstream
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Progress {
    /// Dependents whose last prerequisite just finished
    pub ready: Vec<ActionId>,
    /// Transitive dependents poisoned by a failure, in breadth-first order
    pub skipped: Vec<ActionId>,
}

/// Per-run action states plus the incremental ready queue.
///
/// Each action keeps a count of prerequisites that have not yet finished.
/// Completing an action touches only its direct dependents, so readiness is
/// never recomputed by scanning the whole graph.
#[derive(Debug, Clone)]
pub struct ReadySet {
    states: Vec<ActionState>,
    remaining: Vec<usize>,
    queue: VecDeque<ActionId>,
    tolerate_failures: bool,
}

impl ReadySet {
    /// Actions with no prerequisites start out ready, in discovery order.
    pub fn new(graph: &ActionGraph, tolerate_failures: bool) -> Self {
        let remaining: Vec<usize> = graph.ids().map(|id| graph.prerequisite_count(id)).collect();
        let mut states = vec![ActionState::Pending; graph.len()];
        let mut queue = VecDeque::new();
        for (index, count) in remaining.iter().enumerate() {
            if *count == 0 {
                states[index] = ActionState::Ready;
                queue.push_back(ActionId(index));
            }
        }
        Self {
            states,
            remaining,
            queue,
            tolerate_failures,
        }
    }

    pub fn state(&self, id: ActionId) -> ActionState {
        self.states[id.0]
    }

    pub fn states(&self) -> &[ActionState] {
        &self.states
    }

    /// Currently ready actions, oldest first
    pub fn ready(&self) -> impl Iterator<Item = ActionId> + '_ {
        self.queue
            .iter()
            .copied()
            .filter(|id| self.states[id.0] == ActionState::Ready)
    }

    pub fn has_ready(&self) -> bool {
        self.ready().next().is_some()
    }

    /// Take the oldest ready action and mark it running.
    pub fn start_next(&mut self) -> Option<ActionId> {
        while let Some(id) = self.queue.pop_front() {
            if self.states[id.0] == ActionState::Ready {
                self.states[id.0] = ActionState::Running;
                return Some(id);
            }
        }
        None
    }

    /// Put an action taken by `start_next` back at the head of the queue.
    pub fn requeue(&mut self, id: ActionId) {
        if self.states[id.0] == ActionState::Running {
            self.states[id.0] = ActionState::Ready;
            self.queue.push_front(id);
        }
    }

    /// Record a terminal outcome and update dependents.
    pub fn complete(&mut self, graph: &ActionGraph, id: ActionId, state: ActionState) -> Progress {
        debug_assert!(state.is_terminal());
        let mut progress = Progress::default();
        if self.states[id.0].is_terminal() {
            return progress;
        }
        self.states[id.0] = state;

        let poisons = match state {
            ActionState::Succeeded => false,
            ActionState::Skipped => true,
            _ => !self.tolerate_failures,
        };

        if poisons {
            self.skip_dependents(graph, id, &mut progress.skipped);
        } else {
            for dependent in graph.dependents(id) {
                let slot = &mut self.remaining[dependent.0];
                *slot = slot.saturating_sub(1);
                if *slot == 0 && self.states[dependent.0] == ActionState::Pending {
                    self.states[dependent.0] = ActionState::Ready;
                    self.queue.push_back(dependent);
                    progress.ready.push(dependent);
                }
            }
        }
        progress
    }

    fn skip_dependents(&mut self, graph: &ActionGraph, root: ActionId, skipped: &mut Vec<ActionId>) {
        let mut frontier = VecDeque::from([root]);
        while let Some(id) = frontier.pop_front() {
            for dependent in graph.dependents(id) {
                if matches!(
                    self.states[dependent.0],
                    ActionState::Pending | ActionState::Ready
                ) {
                    self.states[dependent.0] = ActionState::Skipped;
                    skipped.push(dependent);
                    frontier.push_back(dependent);
                }
            }
        }
        if !skipped.is_empty() {
            self.queue
                .retain(|id| self.states[id.0] == ActionState::Ready);
        }
    }

    /// Mark every action that never started as skipped.
    pub fn skip_unstarted(&mut self) -> Vec<ActionId> {
        self.queue.clear();
        let mut skipped = Vec::new();
        for (index, state) in self.states.iter_mut().enumerate() {
            if matches!(state, ActionState::Pending | ActionState::Ready) {
                *state = ActionState::Skipped;
                skipped.push(ActionId(index));
            }
        }
        skipped
    }

    pub fn running(&self) -> usize {
        self.states
            .iter()
            .filter(|s| **s == ActionState::Running)
            .count()
    }

    pub fn all_terminal(&self) -> bool {
        self.states.iter().all(|s| s.is_terminal())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::action::Action;
    use pretty_assertions::assert_eq;

    /// a -> {b, c} -> d, plus an unrelated e
    fn graph() -> ActionGraph {
        let mut builder = ActionGraph::builder();
        let a = builder.add(Action::new("a", "true"));
        let b = builder.add(Action::new("b", "true").after(a));
        let c = builder.add(Action::new("c", "true").after(a));
        builder.add(Action::new("d", "true").after(b).after(c));
        builder.add(Action::new("e", "true"));
        builder.build()
    }

    fn id(i: usize) -> ActionId {
        ActionId(i)
    }

    #[test]
    fn test_roots_ready_first() {
        let graph = graph();
        let ready = ReadySet::new(&graph, false);
        assert_eq!(ready.ready().collect::<Vec<_>>(), vec![id(0), id(4)]);
        assert_eq!(ready.state(id(3)), ActionState::Pending);
    }

    #[test]
    fn test_join_waits_for_both_sides() {
        let graph = graph();
        let mut ready = ReadySet::new(&graph, false);
        assert_eq!(ready.start_next(), Some(id(0)));
        let progress = ready.complete(&graph, id(0), ActionState::Succeeded);
        assert_eq!(progress.ready, vec![id(1), id(2)]);

        let progress = ready.complete(&graph, id(1), ActionState::Succeeded);
        assert!(progress.ready.is_empty());
        let progress = ready.complete(&graph, id(2), ActionState::Succeeded);
        assert_eq!(progress.ready, vec![id(3)]);
    }

    #[test]
    fn test_failure_skips_transitively() {
        let graph = graph();
        let mut ready = ReadySet::new(&graph, false);
        ready.start_next();
        let progress = ready.complete(&graph, id(0), ActionState::Failed);
        assert_eq!(progress.skipped, vec![id(1), id(2), id(3)]);
        assert_eq!(ready.state(id(4)), ActionState::Ready);
        assert_eq!(ready.ready().collect::<Vec<_>>(), vec![id(4)]);
    }

    #[test]
    fn test_partial_failure_on_join() {
        let graph = graph();
        let mut ready = ReadySet::new(&graph, false);
        ready.complete(&graph, id(0), ActionState::Succeeded);
        let progress = ready.complete(&graph, id(1), ActionState::Cancelled);
        assert_eq!(progress.skipped, vec![id(3)]);
        // The sibling still finishes, but the join stays skipped.
        let progress = ready.complete(&graph, id(2), ActionState::Succeeded);
        assert!(progress.ready.is_empty());
        assert_eq!(ready.state(id(3)), ActionState::Skipped);
    }

    #[test]
    fn test_tolerant_mode_runs_dependents() {
        let graph = graph();
        let mut ready = ReadySet::new(&graph, true);
        let progress = ready.complete(&graph, id(0), ActionState::Failed);
        assert!(progress.skipped.is_empty());
        assert_eq!(progress.ready, vec![id(1), id(2)]);
    }

    #[test]
    fn test_completion_is_idempotent() {
        let graph = graph();
        let mut ready = ReadySet::new(&graph, false);
        ready.complete(&graph, id(0), ActionState::Succeeded);
        let again = ready.complete(&graph, id(0), ActionState::Succeeded);
        assert_eq!(again, Progress::default());
    }

    #[test]
    fn test_skip_unstarted() {
        let graph = graph();
        let mut ready = ReadySet::new(&graph, false);
        ready.start_next();
        let skipped = ready.skip_unstarted();
        assert_eq!(skipped, vec![id(1), id(2), id(3), id(4)]);
        assert_eq!(ready.running(), 1);
        assert!(!ready.all_terminal());
        ready.complete(&graph, id(0), ActionState::Succeeded);
        assert!(ready.all_terminal());
    }
}
