//! The action document handed to the dispatch tool.
//!
//! ```json
//! {"actions":[{"index":"0","cmd":"/usr/bin/clang","arg":"-c a.c","workdir":"/src","dep":[]}]}
//! ```
//!
//! Indices are positions in dependency order and are written as decimal
//! strings; readers accept strings or plain numbers.

use crate::core::errors::{BuildError, Result};
use crate::graph::action::{join_arguments, path_text, Action, ActionId};
use crate::graph::graph::ActionGraph;
use crate::offload::toolchain::wrapped_clang;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireAction {
    #[serde(serialize_with = "index_out", deserialize_with = "index_in")]
    pub index: usize,
    pub cmd: String,
    pub arg: String,
    pub workdir: String,
    #[serde(
        default,
        serialize_with = "indices_out",
        deserialize_with = "indices_in"
    )]
    pub dep: Vec<usize>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireDocument {
    pub actions: Vec<WireAction>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum IndexRepr {
    Number(u64),
    Text(String),
}

impl IndexRepr {
    fn into_index<E: serde::de::Error>(self) -> std::result::Result<usize, E> {
        match self {
            IndexRepr::Number(n) => usize::try_from(n).map_err(E::custom),
            IndexRepr::Text(s) => s
                .trim()
                .parse()
                .map_err(|_| E::custom(format!("invalid index {:?}", s))),
        }
    }
}

fn index_out<S: Serializer>(index: &usize, serializer: S) -> std::result::Result<S::Ok, S::Error> {
    serializer.serialize_str(&index.to_string())
}

fn index_in<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<usize, D::Error> {
    IndexRepr::deserialize(deserializer)?.into_index()
}

#[allow(clippy::ptr_arg)]
fn indices_out<S: Serializer>(
    indices: &Vec<usize>,
    serializer: S,
) -> std::result::Result<S::Ok, S::Error> {
    serializer.collect_seq(indices.iter().map(|i| i.to_string()))
}

fn indices_in<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> std::result::Result<Vec<usize>, D::Error> {
    Vec::<IndexRepr>::deserialize(deserializer)?
        .into_iter()
        .map(IndexRepr::into_index)
        .collect()
}

impl WireDocument {
    /// Serialize `graph` in `order`, which must already be dependency ordered.
    pub fn from_graph(graph: &ActionGraph, order: &[ActionId]) -> Result<Self> {
        if !graph.is_dependency_ordered(order) || order.len() != graph.len() {
            return Err(BuildError::InternalSortFailure { attempts: 0 });
        }
        let mut position = vec![0usize; graph.len()];
        for (pos, id) in order.iter().enumerate() {
            position[id.index()] = pos;
        }

        let actions = order
            .iter()
            .enumerate()
            .map(|(index, &id)| {
                let action = graph.action(id);
                let (cmd, arg) = wire_command(action);
                let mut dep: Vec<usize> = graph.prerequisites(id).map(|p| position[p.index()]).collect();
                dep.sort_unstable();
                WireAction {
                    index,
                    cmd,
                    arg,
                    workdir: path_text(&action.working_dir),
                    dep,
                }
            })
            .collect();
        Ok(Self { actions })
    }

    pub fn parse(text: &str) -> Result<Self> {
        let document: WireDocument = serde_json::from_str(text)?;
        Ok(document)
    }

    pub fn to_json(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Each entry sits at its own index and only depends on earlier ones.
    pub fn is_ordered(&self) -> bool {
        self.actions
            .iter()
            .enumerate()
            .all(|(pos, a)| a.index == pos && a.dep.iter().all(|d| *d < pos))
    }
}

/// Command and argument string as the remote side should see them.
fn wire_command(action: &Action) -> (String, String) {
    let program = action.program_name();
    if program == "env" || program == "arch" {
        if let Some((index, clang)) = wrapped_clang(&action.arguments) {
            return (clang.to_string(), join_arguments(&action.arguments[index + 1..]));
        }
    }

    let arguments: Vec<String> = action
        .arguments
        .iter()
        .map(|arg| {
            if arg.contains("cp -f \"\"") {
                arg.replace("\"\"", "\"")
            } else {
                arg.clone()
            }
        })
        .collect();
    (path_text(&action.executable), join_arguments(&arguments))
}

/// Order actions so every prerequisite precedes its dependents.
///
/// Discovery order is kept when it already satisfies that. Otherwise each
/// pass re-sorts the previous result, preferring earlier positions among
/// actions that are free to go next, and unplaceable actions are appended in
/// their previous order. Fails after `attempts` passes without a valid order.
pub fn sort_for_offload(graph: &ActionGraph, attempts: usize) -> Result<Vec<ActionId>> {
    let mut order: Vec<ActionId> = graph.ids().collect();
    if graph.is_dependency_ordered(&order) {
        return Ok(order);
    }
    debug!("Discovery order violates dependencies, re-sorting");

    for attempt in 1..=attempts {
        order = stabilize(graph, &order);
        if graph.is_dependency_ordered(&order) {
            debug!(attempt, "Actions sorted");
            return Ok(order);
        }
        warn!(attempt, attempts, "Sort pass left actions out of order");
    }
    Err(BuildError::InternalSortFailure { attempts })
}

fn stabilize(graph: &ActionGraph, order: &[ActionId]) -> Vec<ActionId> {
    let mut position = vec![0usize; graph.len()];
    for (pos, id) in order.iter().enumerate() {
        position[id.index()] = pos;
    }
    let mut remaining: Vec<usize> = graph.ids().map(|id| graph.prerequisite_count(id)).collect();
    let mut heap: BinaryHeap<Reverse<(usize, ActionId)>> = order
        .iter()
        .filter(|id| remaining[id.index()] == 0)
        .map(|&id| Reverse((position[id.index()], id)))
        .collect();

    let mut placed = vec![false; graph.len()];
    let mut sorted = Vec::with_capacity(order.len());
    while let Some(Reverse((_, id))) = heap.pop() {
        placed[id.index()] = true;
        sorted.push(id);
        for dependent in graph.dependents(id) {
            remaining[dependent.index()] -= 1;
            if remaining[dependent.index()] == 0 {
                heap.push(Reverse((position[dependent.index()], dependent)));
            }
        }
    }
    sorted.extend(order.iter().filter(|id| !placed[id.index()]));
    sorted
}
