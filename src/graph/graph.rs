use crate::core::errors::{BuildError, GraphError, Result};
use crate::graph::action::{Action, ActionId};
use petgraph::algo::tarjan_scc;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashSet, VecDeque};

/// Collects actions before the graph is frozen.
#[derive(Debug, Default)]
pub struct ActionGraphBuilder {
    actions: Vec<Action>,
    memory_per_action: Option<u64>,
}

impl ActionGraphBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an action; the returned id is its discovery order.
    pub fn add(&mut self, action: Action) -> ActionId {
        self.actions.push(action);
        ActionId(self.actions.len() - 1)
    }

    /// Raise the per-action memory estimate for this graph.
    pub fn memory_per_action(&mut self, bytes: u64) -> &mut Self {
        self.memory_per_action = Some(bytes);
        self
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    pub fn build(self) -> ActionGraph {
        ActionGraph::from_actions(self.actions, self.memory_per_action)
    }
}

/// Immutable set of actions and prerequisite edges.
///
/// Edges run from prerequisite to dependent. Node indices equal action ids.
/// References to unknown actions are kept aside so `validate` can report them.
#[derive(Debug, Clone)]
pub struct ActionGraph {
    actions: Vec<Action>,
    edges: DiGraph<ActionId, ()>,
    dependents: Vec<Vec<ActionId>>,
    prerequisites: Vec<Vec<ActionId>>,
    dangling: Vec<(ActionId, ActionId)>,
    memory_per_action: Option<u64>,
}

impl ActionGraph {
    pub fn builder() -> ActionGraphBuilder {
        ActionGraphBuilder::new()
    }

    fn from_actions(actions: Vec<Action>, memory_per_action: Option<u64>) -> Self {
        let mut edges = DiGraph::with_capacity(actions.len(), actions.len());
        for index in 0..actions.len() {
            edges.add_node(ActionId(index));
        }

        let mut dangling = Vec::new();
        for (index, action) in actions.iter().enumerate() {
            let mut seen = HashSet::new();
            for &prereq in &action.prerequisites {
                if prereq.0 >= actions.len() {
                    dangling.push((ActionId(index), prereq));
                } else if seen.insert(prereq) {
                    edges.add_edge(NodeIndex::new(prereq.0), NodeIndex::new(index), ());
                }
            }
        }

        // Adjacency in discovery order; petgraph yields neighbours newest-first.
        let sorted = |index: usize, direction: Direction| {
            let mut ids: Vec<ActionId> = edges
                .neighbors_directed(NodeIndex::new(index), direction)
                .map(|n| ActionId(n.index()))
                .collect();
            ids.sort();
            ids
        };
        let dependents = (0..actions.len())
            .map(|i| sorted(i, Direction::Outgoing))
            .collect();
        let prerequisites = (0..actions.len())
            .map(|i| sorted(i, Direction::Incoming))
            .collect();

        Self {
            actions,
            edges,
            dependents,
            prerequisites,
            dangling,
            memory_per_action,
        }
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    pub fn action(&self, id: ActionId) -> &Action {
        &self.actions[id.0]
    }

    pub fn get(&self, id: ActionId) -> Option<&Action> {
        self.actions.get(id.0)
    }

    pub fn ids(&self) -> impl Iterator<Item = ActionId> + '_ {
        (0..self.actions.len()).map(ActionId)
    }

    pub fn iter(&self) -> impl Iterator<Item = (ActionId, &Action)> + '_ {
        self.actions
            .iter()
            .enumerate()
            .map(|(i, a)| (ActionId(i), a))
    }

    /// Graph-level memory estimate override, if any
    pub fn memory_per_action(&self) -> Option<u64> {
        self.memory_per_action
    }

    /// Actions that list `id` as a prerequisite, in discovery order
    pub fn dependents(&self, id: ActionId) -> impl Iterator<Item = ActionId> + '_ {
        self.dependents[id.0].iter().copied()
    }

    /// Distinct known prerequisites of `id`, in discovery order
    pub fn prerequisites(&self, id: ActionId) -> impl Iterator<Item = ActionId> + '_ {
        self.prerequisites[id.0].iter().copied()
    }

    pub fn prerequisite_count(&self, id: ActionId) -> usize {
        self.prerequisites[id.0].len()
    }

    /// Check that every prerequisite exists and that an ordering exists.
    pub fn validate(&self) -> Result<()> {
        if let Some(&(action, prereq)) = self.dangling.first() {
            return Err(BuildError::graph(GraphError::DanglingPrerequisite {
                action: self.actions[action.0].name.clone(),
                prerequisite: prereq.to_string(),
            }));
        }

        // Kahn's algorithm: repeatedly retire actions with no unmet prerequisites.
        let mut in_degree: Vec<usize> = self.ids().map(|id| self.prerequisite_count(id)).collect();
        let mut queue: VecDeque<ActionId> =
            self.ids().filter(|id| in_degree[id.0] == 0).collect();
        let mut retired = 0;

        while let Some(id) = queue.pop_front() {
            retired += 1;
            for dependent in self.dependents(id) {
                in_degree[dependent.0] -= 1;
                if in_degree[dependent.0] == 0 {
                    queue.push_back(dependent);
                }
            }
        }

        if retired == self.len() {
            return Ok(());
        }
        Err(BuildError::graph(GraphError::CycleDetected {
            members: self.cycle_members(),
        }))
    }

    /// Names of actions that sit on a cycle.
    fn cycle_members(&self) -> Vec<String> {
        let mut members: Vec<ActionId> = tarjan_scc(&self.edges)
            .into_iter()
            .filter(|component| {
                component.len() > 1
                    || self.edges.contains_edge(component[0], component[0])
            })
            .flatten()
            .map(|n| ActionId(n.index()))
            .collect();
        members.sort();
        members
            .into_iter()
            .map(|id| self.actions[id.0].name.clone())
            .collect()
    }

    /// Stable topological order: among ready actions, lowest discovery index first.
    pub fn topological_order(&self) -> Result<Vec<ActionId>> {
        self.validate()?;
        let mut in_degree: Vec<usize> = self.ids().map(|id| self.prerequisite_count(id)).collect();
        let mut heap: BinaryHeap<Reverse<ActionId>> = self
            .ids()
            .filter(|id| in_degree[id.0] == 0)
            .map(Reverse)
            .collect();
        let mut order = Vec::with_capacity(self.len());
        while let Some(Reverse(id)) = heap.pop() {
            order.push(id);
            for dependent in self.dependents(id) {
                in_degree[dependent.0] -= 1;
                if in_degree[dependent.0] == 0 {
                    heap.push(Reverse(dependent));
                }
            }
        }
        Ok(order)
    }

    /// True when every action in `order` comes after all of its prerequisites.
    pub fn is_dependency_ordered(&self, order: &[ActionId]) -> bool {
        let mut position = vec![usize::MAX; self.len()];
        for (pos, id) in order.iter().enumerate() {
            position[id.0] = pos;
        }
        order.iter().enumerate().all(|(pos, &id)| {
            self.prerequisites(id).all(|p| position[p.0] < pos)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn diamond() -> (ActionGraph, [ActionId; 4]) {
        let mut builder = ActionGraph::builder();
        let a = builder.add(Action::new("a", "true"));
        let b = builder.add(Action::new("b", "true").after(a));
        let c = builder.add(Action::new("c", "true").after(a));
        let d = builder.add(Action::new("d", "true").after(b).after(c));
        (builder.build(), [a, b, c, d])
    }

    #[test]
    fn test_diamond_validates() {
        let (graph, [a, b, c, d]) = diamond();
        assert!(graph.validate().is_ok());
        assert_eq!(graph.len(), 4);
        let mut deps: Vec<_> = graph.dependents(a).collect();
        deps.sort();
        assert_eq!(deps, vec![b, c]);
        assert_eq!(graph.prerequisite_count(d), 2);
    }

    #[test]
    fn test_cycle_detected() {
        let mut builder = ActionGraph::builder();
        let mut x = Action::new("x", "true");
        x.prerequisites.push(ActionId(1));
        builder.add(x);
        builder.add(Action::new("y", "true").after(ActionId(0)));
        builder.add(Action::new("z", "true"));
        let graph = builder.build();

        let err = graph.validate().unwrap_err();
        assert_eq!(
            err.graph_error(),
            Some(&GraphError::CycleDetected {
                members: vec!["x".to_string(), "y".to_string()]
            })
        );
        assert!(graph.topological_order().is_err());
    }

    #[test]
    fn test_self_loop_is_a_cycle() {
        let mut builder = ActionGraph::builder();
        builder.add(Action::new("loop", "true").after(ActionId(0)));
        let err = builder.build().validate().unwrap_err();
        assert!(matches!(
            err.graph_error(),
            Some(GraphError::CycleDetected { .. })
        ));
    }

    #[test]
    fn test_dangling_prerequisite() {
        let mut builder = ActionGraph::builder();
        builder.add(Action::new("orphan", "true").after(ActionId(7)));
        let err = builder.build().validate().unwrap_err();
        assert_eq!(
            err.graph_error(),
            Some(&GraphError::DanglingPrerequisite {
                action: "orphan".to_string(),
                prerequisite: "#7".to_string(),
            })
        );
    }

    #[test]
    fn test_topological_order_is_stable() {
        // Discovered out of order: the link step comes first.
        let mut builder = ActionGraph::builder();
        let mut link = Action::new("link", "ld");
        link.prerequisites = vec![ActionId(2), ActionId(1)];
        let link = builder.add(link);
        let b = builder.add(Action::new("b.o", "cc"));
        let a = builder.add(Action::new("a.o", "cc"));
        let graph = builder.build();

        let order = graph.topological_order().unwrap();
        assert_eq!(order, vec![b, a, link]);
        assert!(graph.is_dependency_ordered(&order));
        assert!(!graph.is_dependency_ordered(&[link, b, a]));
    }

    #[test]
    fn test_duplicate_prerequisites_collapse() {
        let mut builder = ActionGraph::builder();
        let a = builder.add(Action::new("a", "true"));
        let mut b = Action::new("b", "true");
        b.prerequisites = vec![a, a];
        let b = builder.add(b);
        let graph = builder.build();
        assert_eq!(graph.prerequisite_count(b), 1);
    }
}
