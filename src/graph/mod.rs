//! Action graph: actions, prerequisite edges, validation and readiness tracking.

pub mod action;
#[allow(clippy::module_inception)]
pub mod graph;
pub mod ready;
pub mod spec;

pub use action::{Action, ActionId, ActionState};
pub use graph::{ActionGraph, ActionGraphBuilder};
pub use ready::{Progress, ReadySet};
pub use spec::{ActionSpec, GraphSpec};
