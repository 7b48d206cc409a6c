use std::fmt;
use thiserror::Error;

/// Structural problems found while validating an action graph.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GraphError {
    /// No topological order exists; `members` names the actions left on a cycle.
    CycleDetected { members: Vec<String> },
    /// `action` lists a prerequisite that is not part of the graph.
    DanglingPrerequisite { action: String, prerequisite: String },
}

impl fmt::Display for GraphError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GraphError::CycleDetected { members } => {
                write!(f, "cycle detected among actions [{}]", members.join(", "))
            }
            GraphError::DanglingPrerequisite {
                action,
                prerequisite,
            } => write!(
                f,
                "action '{}' depends on unknown action '{}'",
                action, prerequisite
            ),
        }
    }
}

/// Unified error type for the build executor
#[derive(Debug, Error)]
pub enum BuildError {
    /// Invalid graph or configuration; aborts before anything runs
    #[error("Configuration error: {message}")]
    Configuration {
        message: String,
        field: Option<String>,
        graph: Option<GraphError>,
    },

    /// The process for an action could not be started
    #[error("Failed to launch '{program}': {source}")]
    LaunchFailed {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// An action exceeded its time budget and was killed
    #[error("Action '{action}' timed out after {timeout_ms}ms")]
    TimedOut { action: String, timeout_ms: u64 },

    /// Cancellation was observed before or during an operation
    #[error("Operation was cancelled: {operation}")]
    Cancelled { operation: String },

    /// Remote execution is not usable for this run
    #[error("Offload unavailable: {reason}")]
    OffloadUnavailable { reason: String },

    /// Remote execution setup broke part way through
    #[error("Offload setup failed during {stage}: {message}")]
    OffloadSetupFailed { stage: String, message: String },

    /// Actions could not be put in dependency order
    #[error("Internal sort failure: actions still unordered after {attempts} attempts")]
    InternalSortFailure { attempts: usize },

    /// IO errors
    #[error("IO operation failed: {operation}")]
    Io {
        operation: String,
        #[source]
        source: std::io::Error,
    },

    /// Serialization errors
    #[error("Serialization failed: {format}")]
    Serialization {
        format: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

impl BuildError {
    /// Create a configuration error
    pub fn configuration<S: Into<String>>(message: S) -> Self {
        Self::Configuration {
            message: message.into(),
            field: None,
            graph: None,
        }
    }

    /// Create a configuration error tied to one config field
    pub fn configuration_field<S: Into<String>, F: Into<String>>(message: S, field: F) -> Self {
        Self::Configuration {
            message: message.into(),
            field: Some(field.into()),
            graph: None,
        }
    }

    /// Wrap a graph validation failure
    pub fn graph(err: GraphError) -> Self {
        Self::Configuration {
            message: err.to_string(),
            field: None,
            graph: Some(err),
        }
    }

    pub fn launch_failed<S: Into<String>>(program: S, source: std::io::Error) -> Self {
        Self::LaunchFailed {
            program: program.into(),
            source,
        }
    }

    pub fn timed_out<S: Into<String>>(action: S, timeout_ms: u64) -> Self {
        Self::TimedOut {
            action: action.into(),
            timeout_ms,
        }
    }

    pub fn cancelled<S: Into<String>>(operation: S) -> Self {
        Self::Cancelled {
            operation: operation.into(),
        }
    }

    pub fn offload_unavailable<S: Into<String>>(reason: S) -> Self {
        Self::OffloadUnavailable {
            reason: reason.into(),
        }
    }

    pub fn offload_setup<S: Into<String>, M: Into<String>>(stage: S, message: M) -> Self {
        Self::OffloadSetupFailed {
            stage: stage.into(),
            message: message.into(),
        }
    }

    /// Create an IO error
    pub fn io<S: Into<String>>(operation: S, source: std::io::Error) -> Self {
        Self::Io {
            operation: operation.into(),
            source,
        }
    }

    /// Create a serialization error
    pub fn serialization<S: Into<String>, E: std::error::Error + Send + Sync + 'static>(
        format: S,
        source: E,
    ) -> Self {
        Self::Serialization {
            format: format.into(),
            source: Box::new(source),
        }
    }

    /// The graph problem behind a configuration error, if any
    pub fn graph_error(&self) -> Option<&GraphError> {
        match self {
            Self::Configuration { graph, .. } => graph.as_ref(),
            _ => None,
        }
    }

    /// Errors that abort the whole run rather than a single action
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Configuration { .. } | Self::InternalSortFailure { .. }
        )
    }

    /// Offload errors after which local execution is still a correct fallback
    pub fn allows_local_fallback(&self) -> bool {
        matches!(
            self,
            Self::OffloadUnavailable { .. } | Self::OffloadSetupFailed { .. }
        )
    }

    /// Get error category for logging
    pub fn category(&self) -> &'static str {
        match self {
            Self::Configuration { .. } => "configuration",
            Self::LaunchFailed { .. } => "launch",
            Self::TimedOut { .. } => "timeout",
            Self::Cancelled { .. } => "cancelled",
            Self::OffloadUnavailable { .. } => "offload_unavailable",
            Self::OffloadSetupFailed { .. } => "offload_setup",
            Self::InternalSortFailure { .. } => "internal",
            Self::Io { .. } => "io",
            Self::Serialization { .. } => "serialization",
        }
    }
}

/// Result type alias for convenience
pub type Result<T> = std::result::Result<T, BuildError>;

impl From<std::io::Error> for BuildError {
    fn from(err: std::io::Error) -> Self {
        Self::io("io_operation", err)
    }
}

impl From<serde_json::Error> for BuildError {
    fn from(err: serde_json::Error) -> Self {
        Self::serialization("json", err)
    }
}

impl From<serde_yaml::Error> for BuildError {
    fn from(err: serde_yaml::Error) -> Self {
        Self::serialization("yaml", err)
    }
}

impl From<GraphError> for BuildError {
    fn from(err: GraphError) -> Self {
        Self::graph(err)
    }
}
