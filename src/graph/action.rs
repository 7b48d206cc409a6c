use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Opaque handle for an action; its value is the action's discovery order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ActionId(pub(crate) usize);

impl ActionId {
    pub fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for ActionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Lifecycle of an action within one run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionState {
    Pending,
    Ready,
    Running,
    Succeeded,
    Failed,
    Cancelled,
    Skipped,
}

impl ActionState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ActionState::Succeeded
                | ActionState::Failed
                | ActionState::Cancelled
                | ActionState::Skipped
        )
    }

    /// Terminal states that poison dependents unless failures are tolerated.
    pub fn is_failure(self) -> bool {
        matches!(self, ActionState::Failed | ActionState::Cancelled)
    }
}

impl fmt::Display for ActionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ActionState::Pending => "pending",
            ActionState::Ready => "ready",
            ActionState::Running => "running",
            ActionState::Succeeded => "succeeded",
            ActionState::Failed => "failed",
            ActionState::Cancelled => "cancelled",
            ActionState::Skipped => "skipped",
        };
        f.write_str(name)
    }
}

/// One external command plus the actions it waits on.
#[derive(Debug, Clone, PartialEq)]
pub struct Action {
    /// Human-readable label used in logs and reports
    pub name: String,
    pub executable: PathBuf,
    pub arguments: Vec<String>,
    pub working_dir: PathBuf,
    /// Cost hint for weight-aware admission
    pub weight: f64,
    pub prerequisites: Vec<ActionId>,
    /// Overrides the configured default timeout
    pub timeout: Option<Duration>,
}

impl Action {
    pub fn new(name: impl Into<String>, executable: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            executable: executable.into(),
            arguments: Vec::new(),
            working_dir: PathBuf::from("."),
            weight: 1.0,
            prerequisites: Vec::new(),
            timeout: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.arguments.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.arguments.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = dir.into();
        self
    }

    pub fn weight(mut self, weight: f64) -> Self {
        self.weight = weight;
        self
    }

    pub fn after(mut self, prerequisite: ActionId) -> Self {
        if !self.prerequisites.contains(&prerequisite) {
            self.prerequisites.push(prerequisite);
        }
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// File name of the executable, used for compiler detection.
    pub fn program_name(&self) -> &str {
        self.executable
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default()
    }

    /// Arguments joined into one string, quoting those that need it.
    pub fn argument_string(&self) -> String {
        join_arguments(&self.arguments)
    }

    /// Full command line for logging.
    pub fn command_line(&self) -> String {
        let program = quote_argument(&path_text(&self.executable));
        if self.arguments.is_empty() {
            program
        } else {
            format!("{} {}", program, self.argument_string())
        }
    }
}

pub(crate) fn join_arguments(arguments: &[String]) -> String {
    arguments
        .iter()
        .map(|a| quote_argument(a))
        .collect::<Vec<_>>()
        .join(" ")
}

pub(crate) fn path_text(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

fn quote_argument(arg: &str) -> String {
    if arg.is_empty() {
        return "\"\"".to_string();
    }
    if arg.chars().any(|c| c.is_whitespace() || c == '"') {
        format!("\"{}\"", arg.replace('"', "\\\""))
    } else {
        arg.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_states() {
        assert!(!ActionState::Pending.is_terminal());
        assert!(!ActionState::Running.is_terminal());
        assert!(ActionState::Skipped.is_terminal());
        assert!(ActionState::Cancelled.is_failure());
        assert!(!ActionState::Skipped.is_failure());
    }

    #[test]
    fn test_command_line_quoting() {
        let action = Action::new("compile", "/usr/bin/cc")
            .args(["-c", "my file.c", "-DNAME=\"x\""])
            .arg("");
        assert_eq!(
            action.command_line(),
            r#"/usr/bin/cc -c "my file.c" "-DNAME=\"x\"" """#
        );
        assert_eq!(action.program_name(), "cc");
    }

    #[test]
    fn test_after_deduplicates() {
        let action = Action::new("link", "ld")
            .after(ActionId(0))
            .after(ActionId(0))
            .after(ActionId(1));
        assert_eq!(action.prerequisites, vec![ActionId(0), ActionId(1)]);
    }
}
