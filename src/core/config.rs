use crate::core::errors::{BuildError, Result};
use crate::core::memory::MemoryProbe;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

/// Default memory estimate for one compile action.
pub const DEFAULT_MEMORY_PER_ACTION: u64 = 1536 * 1024 * 1024;

/// How ready actions are pulled into execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum DispatchMode {
    /// A fixed pool of workers keeps pulling from the ready set.
    Automatic,
    /// A driver periodically asks for as many starts as the budget allows.
    Manual {
        #[serde(default = "default_poll_interval_ms")]
        poll_interval_ms: u64,
    },
}

fn default_poll_interval_ms() -> u64 {
    500
}

impl Default for DispatchMode {
    fn default() -> Self {
        DispatchMode::Automatic
    }
}

/// Executor configuration with all tuning parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Hard cap on concurrent actions (0 = derive from cores and memory)
    pub max_parallel_actions: usize,
    /// Count logical cores instead of physical ones
    pub use_all_cores: bool,
    /// Scales the core count when not using all cores
    pub processor_count_multiplier: f64,
    /// Per-action memory estimate in bytes (0 disables memory gating)
    pub memory_per_action_bytes: u64,
    /// Stop starting new actions after the first failure
    pub stop_on_error: bool,
    /// Let heavy actions occupy more than one slot
    pub use_action_weights: bool,
    /// Dependents of failed actions still run
    pub tolerate_failed_prerequisites: bool,
    /// Cancelled actions do not fail the run
    pub tolerate_cancelled: bool,
    /// Default per-action timeout in seconds
    pub action_timeout_secs: Option<u64>,
    pub dispatch: DispatchMode,
    /// Only surface output of failed actions
    pub compact_output: bool,
    pub log_command_lines: bool,
    /// Log the slowest actions once the run is over
    pub show_action_timings: bool,
    pub offload: Option<OffloadConfig>,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_parallel_actions: 0,
            use_all_cores: false,
            processor_count_multiplier: 1.0,
            memory_per_action_bytes: DEFAULT_MEMORY_PER_ACTION,
            stop_on_error: false,
            use_action_weights: false,
            tolerate_failed_prerequisites: false,
            tolerate_cancelled: false,
            action_timeout_secs: None,
            dispatch: DispatchMode::Automatic,
            compact_output: false,
            log_command_lines: false,
            show_action_timings: false,
            offload: None,
        }
    }
}

impl ExecutorConfig {
    pub fn builder() -> ExecutorConfigBuilder {
        ExecutorConfigBuilder::new()
    }

    /// Load from a YAML document
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: ExecutorConfig = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a YAML file
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| BuildError::io(format!("read config {}", path.display()), e))?;
        Self::from_yaml_str(&text)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if !(self.processor_count_multiplier.is_finite() && self.processor_count_multiplier > 0.0)
        {
            return Err(BuildError::configuration_field(
                "processor_count_multiplier must be a positive number",
                "processor_count_multiplier",
            ));
        }
        if self.action_timeout_secs == Some(0) {
            return Err(BuildError::configuration_field(
                "action_timeout_secs must be greater than 0",
                "action_timeout_secs",
            ));
        }
        if let DispatchMode::Manual { poll_interval_ms } = self.dispatch {
            if poll_interval_ms == 0 {
                return Err(BuildError::configuration_field(
                    "poll_interval_ms must be greater than 0",
                    "dispatch.poll_interval_ms",
                ));
            }
        }
        if let Some(offload) = &self.offload {
            offload.validate()?;
        }
        Ok(())
    }

    pub fn action_timeout(&self) -> Option<Duration> {
        self.action_timeout_secs.map(Duration::from_secs)
    }

    /// Number of actions allowed to run at once on this host.
    ///
    /// Starts from the core count (logical with `use_all_cores`, physical
    /// otherwise scaled by the multiplier), applies the explicit cap, then
    /// caps again by how many per-action memory estimates fit into the
    /// memory the probe reports. Never below one.
    pub fn effective_parallelism(
        &self,
        memory: &dyn MemoryProbe,
        memory_override: Option<u64>,
    ) -> usize {
        let (cores, multiplier) = if self.use_all_cores {
            (num_cpus::get(), 1.0)
        } else {
            (num_cpus::get_physical(), self.processor_count_multiplier)
        };
        let mut limit = ((cores as f64 * multiplier).floor() as usize).max(1);

        if self.max_parallel_actions > 0 {
            limit = limit.min(self.max_parallel_actions);
        }

        let per_action = self.memory_per_action(memory_override);
        if per_action > 0 {
            if let Some(available) = memory.available_bytes() {
                let by_memory = ((available / per_action) as usize).max(1);
                if by_memory < limit {
                    debug!(
                        by_memory,
                        limit, "Memory budget lowers the parallel action limit"
                    );
                }
                limit = limit.min(by_memory);
            }
        }

        info!(
            cores,
            multiplier,
            limit,
            all_cores = self.use_all_cores,
            "Resolved parallel action limit"
        );
        limit
    }

    /// Per-action memory estimate; a graph may raise it but never lower it.
    pub fn memory_per_action(&self, memory_override: Option<u64>) -> u64 {
        if self.memory_per_action_bytes == 0 {
            return 0;
        }
        self.memory_per_action_bytes
            .max(memory_override.unwrap_or_default())
    }
}

/// Builder for ExecutorConfig
#[derive(Debug, Default)]
pub struct ExecutorConfigBuilder {
    config: ExecutorConfig,
}

impl ExecutorConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: ExecutorConfig::default(),
        }
    }

    pub fn max_parallel_actions(mut self, max: usize) -> Self {
        self.config.max_parallel_actions = max;
        self
    }

    pub fn use_all_cores(mut self, all: bool) -> Self {
        self.config.use_all_cores = all;
        self
    }

    pub fn processor_count_multiplier(mut self, multiplier: f64) -> Self {
        self.config.processor_count_multiplier = multiplier;
        self
    }

    pub fn memory_per_action(mut self, bytes: u64) -> Self {
        self.config.memory_per_action_bytes = bytes;
        self
    }

    pub fn stop_on_error(mut self, stop: bool) -> Self {
        self.config.stop_on_error = stop;
        self
    }

    pub fn use_action_weights(mut self, weights: bool) -> Self {
        self.config.use_action_weights = weights;
        self
    }

    pub fn tolerate_failed_prerequisites(mut self, tolerate: bool) -> Self {
        self.config.tolerate_failed_prerequisites = tolerate;
        self
    }

    pub fn tolerate_cancelled(mut self, tolerate: bool) -> Self {
        self.config.tolerate_cancelled = tolerate;
        self
    }

    pub fn action_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.config.action_timeout_secs = timeout.map(|t| t.as_secs().max(1));
        self
    }

    pub fn dispatch(mut self, dispatch: DispatchMode) -> Self {
        self.config.dispatch = dispatch;
        self
    }

    pub fn compact_output(mut self, compact: bool) -> Self {
        self.config.compact_output = compact;
        self
    }

    pub fn log_command_lines(mut self, log: bool) -> Self {
        self.config.log_command_lines = log;
        self
    }

    pub fn show_action_timings(mut self, show: bool) -> Self {
        self.config.show_action_timings = show;
        self
    }

    pub fn offload(mut self, offload: OffloadConfig) -> Self {
        self.config.offload = Some(offload);
        self
    }

    /// Build and validate
    pub fn build(self) -> Result<ExecutorConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

/// Settings for handing the whole graph to a remote accelerator.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OffloadConfig {
    /// Directory holding the accelerator tools; searched via `tool_dir_env` when unset
    pub tool_dir: Option<PathBuf>,
    /// Environment variable holding a path list to search for the tools
    pub tool_dir_env: String,
    pub booster: String,
    pub apply_script: String,
    pub idle_loop: String,
    /// Tool that receives the serialized action document
    pub dispatch_tool: String,
    /// Opt-in marker that must sit next to the tools
    pub switch_file: String,
    pub negotiation_timeout_secs: u64,
    pub negotiation_poll_ms: u64,
    /// Recognized compiler actions must exceed this (default: logical CPU count)
    pub min_actions: Option<usize>,
    pub sort_attempts: usize,
    /// Working directory for the dispatch tool
    pub working_dir: Option<PathBuf>,
}

impl Default for OffloadConfig {
    fn default() -> Self {
        let (exe, script) = if cfg!(windows) {
            (".exe", ".bat")
        } else {
            ("", ".sh")
        };
        Self {
            tool_dir: None,
            tool_dir_env: "BUILDFLOW_OFFLOAD_TOOLS".to_string(),
            booster: format!("offload-booster{}", exe),
            apply_script: format!("offload_apply{}", script),
            idle_loop: format!("offload-idle-loop{}", exe),
            dispatch_tool: format!("offload-dispatch{}", exe),
            switch_file: "offload_enable.json".to_string(),
            negotiation_timeout_secs: 70,
            negotiation_poll_ms: 1000,
            min_actions: None,
            sort_attempts: 3,
            working_dir: None,
        }
    }
}

impl OffloadConfig {
    pub fn validate(&self) -> Result<()> {
        if self.negotiation_timeout_secs == 0 {
            return Err(BuildError::configuration_field(
                "negotiation_timeout_secs must be greater than 0",
                "offload.negotiation_timeout_secs",
            ));
        }
        if self.negotiation_poll_ms == 0 {
            return Err(BuildError::configuration_field(
                "negotiation_poll_ms must be greater than 0",
                "offload.negotiation_poll_ms",
            ));
        }
        if self.sort_attempts == 0 {
            return Err(BuildError::configuration_field(
                "sort_attempts must be greater than 0",
                "offload.sort_attempts",
            ));
        }
        for (field, name) in [
            ("booster", &self.booster),
            ("apply_script", &self.apply_script),
            ("idle_loop", &self.idle_loop),
            ("dispatch_tool", &self.dispatch_tool),
            ("switch_file", &self.switch_file),
        ] {
            if name.trim().is_empty() {
                return Err(BuildError::configuration_field(
                    format!("{} must not be empty", field),
                    format!("offload.{}", field),
                ));
            }
        }
        Ok(())
    }

    pub fn negotiation_timeout(&self) -> Duration {
        Duration::from_secs(self.negotiation_timeout_secs)
    }

    pub fn negotiation_poll(&self) -> Duration {
        Duration::from_millis(self.negotiation_poll_ms)
    }

    pub fn min_actions(&self) -> usize {
        self.min_actions.unwrap_or_else(num_cpus::get)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::memory::FixedMemory;

    #[test]
    fn test_defaults_are_valid() {
        let config = ExecutorConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.memory_per_action_bytes, DEFAULT_MEMORY_PER_ACTION);
        assert_eq!(config.dispatch, DispatchMode::Automatic);
    }

    #[test]
    fn test_yaml_partial_document() {
        let yaml = r#"
max_parallel_actions: 3
stop_on_error: true
dispatch:
  mode: manual
  poll_interval_ms: 25
"#;
        let config = ExecutorConfig::from_yaml_str(yaml).unwrap();
        assert_eq!(config.max_parallel_actions, 3);
        assert!(config.stop_on_error);
        assert_eq!(
            config.dispatch,
            DispatchMode::Manual {
                poll_interval_ms: 25
            }
        );
        assert!(!config.use_action_weights);
    }

    #[test]
    fn test_rejects_bad_values() {
        assert!(ExecutorConfig::builder()
            .processor_count_multiplier(0.0)
            .build()
            .is_err());
        assert!(ExecutorConfig::builder()
            .dispatch(DispatchMode::Manual {
                poll_interval_ms: 0
            })
            .build()
            .is_err());
        let offload = OffloadConfig {
            sort_attempts: 0,
            ..Default::default()
        };
        assert!(ExecutorConfig::builder().offload(offload).build().is_err());
    }

    #[test]
    fn test_parallelism_capped_by_explicit_limit() {
        let config = ExecutorConfig::builder()
            .max_parallel_actions(1)
            .memory_per_action(0)
            .build()
            .unwrap();
        assert_eq!(config.effective_parallelism(&FixedMemory::new(0), None), 1);
    }

    #[test]
    fn test_parallelism_capped_by_memory() {
        let config = ExecutorConfig::builder()
            .use_all_cores(true)
            .memory_per_action(100)
            .build()
            .unwrap();
        // Only room for one action, regardless of core count.
        assert_eq!(config.effective_parallelism(&FixedMemory::new(150), None), 1);
        // Override raises the estimate.
        assert_eq!(config.memory_per_action(Some(400)), 400);
        assert_eq!(config.memory_per_action(Some(10)), 100);
    }

    #[test]
    fn test_parallelism_never_zero() {
        let config = ExecutorConfig::builder()
            .processor_count_multiplier(0.01)
            .memory_per_action(0)
            .build()
            .unwrap();
        assert!(config.effective_parallelism(&FixedMemory::new(0), None) >= 1);
    }
}
