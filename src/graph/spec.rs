use crate::core::errors::{BuildError, GraphError, Result};
use crate::graph::action::{Action, ActionId};
use crate::graph::graph::ActionGraph;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

fn default_weight() -> f64 {
    1.0
}

/// One action as written in a build file
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ActionSpec {
    pub id: String,
    pub exe: PathBuf,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub workdir: Option<PathBuf>,
    #[serde(default = "default_weight")]
    pub weight: f64,
    #[serde(default)]
    pub deps: Vec<String>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

/// A build file: actions referencing each other by id
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct GraphSpec {
    #[serde(default)]
    pub memory_per_action_bytes: Option<u64>,
    pub actions: Vec<ActionSpec>,
}

impl GraphSpec {
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| BuildError::io(format!("read build file {}", path.display()), e))?;
        Self::from_yaml_str(&text)
    }

    /// Resolve ids into an action graph.
    ///
    /// Ids may be referenced before they are declared. Unknown or duplicate
    /// ids are configuration errors. `base_dir` anchors relative work dirs.
    pub fn into_graph(self, base_dir: &Path) -> Result<ActionGraph> {
        let mut index: HashMap<&str, ActionId> = HashMap::with_capacity(self.actions.len());
        for (position, spec) in self.actions.iter().enumerate() {
            if index.insert(spec.id.as_str(), ActionId(position)).is_some() {
                return Err(BuildError::configuration_field(
                    format!("duplicate action id '{}'", spec.id),
                    "actions.id",
                ));
            }
        }

        let mut resolved = Vec::with_capacity(self.actions.len());
        for spec in &self.actions {
            let mut action = Action::new(spec.id.clone(), spec.exe.clone())
                .args(spec.args.iter().cloned())
                .weight(spec.weight)
                .working_dir(match &spec.workdir {
                    Some(dir) if dir.is_absolute() => dir.clone(),
                    Some(dir) => base_dir.join(dir),
                    None => base_dir.to_path_buf(),
                });
            if let Some(secs) = spec.timeout_secs {
                action = action.timeout(Duration::from_secs(secs));
            }
            for dep in &spec.deps {
                let id = index.get(dep.as_str()).ok_or_else(|| {
                    BuildError::graph(GraphError::DanglingPrerequisite {
                        action: spec.id.clone(),
                        prerequisite: dep.clone(),
                    })
                })?;
                action = action.after(*id);
            }
            resolved.push(action);
        }

        let mut builder = ActionGraph::builder();
        if let Some(bytes) = self.memory_per_action_bytes {
            builder.memory_per_action(bytes);
        }
        for action in resolved {
            builder.add(action);
        }
        let graph = builder.build();
        debug!(actions = graph.len(), "Loaded build file");
        graph.validate()?;
        Ok(graph)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::errors::GraphError;

    const BUILD: &str = r#"
actions:
  - id: link
    exe: /usr/bin/cc
    args: ["-o", "app", "a.o", "b.o"]
    deps: [a, b]
  - id: a
    exe: /usr/bin/cc
    args: ["-c", "a.c"]
    workdir: src
  - id: b
    exe: /usr/bin/cc
    args: ["-c", "b.c"]
    weight: 2.5
    timeout_secs: 30
"#;

    #[test]
    fn test_forward_references_resolve() {
        let graph = GraphSpec::from_yaml_str(BUILD)
            .unwrap()
            .into_graph(Path::new("/work"))
            .unwrap();
        assert_eq!(graph.len(), 3);
        let link = graph.action(ActionId(0));
        assert_eq!(link.prerequisites, vec![ActionId(1), ActionId(2)]);
        assert_eq!(link.working_dir, PathBuf::from("/work"));
        assert_eq!(graph.action(ActionId(1)).working_dir, PathBuf::from("/work/src"));
        assert_eq!(graph.action(ActionId(2)).weight, 2.5);
        assert_eq!(
            graph.action(ActionId(2)).timeout,
            Some(Duration::from_secs(30))
        );
    }

    #[test]
    fn test_unknown_dependency() {
        let yaml = "actions:\n  - id: x\n    exe: cc\n    deps: [nope]\n";
        let err = GraphSpec::from_yaml_str(yaml)
            .unwrap()
            .into_graph(Path::new("."))
            .unwrap_err();
        assert!(matches!(
            err.graph_error(),
            Some(GraphError::DanglingPrerequisite { .. })
        ));
    }

    #[test]
    fn test_duplicate_ids_rejected() {
        let yaml = "actions:\n  - id: x\n    exe: cc\n  - id: x\n    exe: cc\n";
        let err = GraphSpec::from_yaml_str(yaml)
            .unwrap()
            .into_graph(Path::new("."))
            .unwrap_err();
        assert_eq!(err.category(), "configuration");
    }

    #[test]
    fn test_cycle_in_build_file() {
        let yaml = "actions:\n  - id: x\n    exe: cc\n    deps: [y]\n  - id: y\n    exe: cc\n    deps: [x]\n";
        let err = GraphSpec::from_yaml_str(yaml)
            .unwrap()
            .into_graph(Path::new("."))
            .unwrap_err();
        assert!(matches!(
            err.graph_error(),
            Some(GraphError::CycleDetected { .. })
        ));
    }
}
