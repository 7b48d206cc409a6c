use crate::core::config::OffloadConfig;
use crate::core::errors::{BuildError, Result};
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Resolved locations of the accelerator tools.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OffloadTools {
    pub dir: PathBuf,
    pub booster: PathBuf,
    pub apply_script: PathBuf,
    pub idle_loop: PathBuf,
    pub dispatch_tool: PathBuf,
    pub switch_file: PathBuf,
}

impl OffloadTools {
    /// Locate the tool directory from config, falling back to the configured
    /// environment path list.
    pub fn discover(config: &OffloadConfig) -> Result<Self> {
        Self::discover_with(config, std::env::var_os(&config.tool_dir_env))
    }

    /// Same as [`discover`](Self::discover) with the path list supplied by the caller.
    pub fn discover_with(config: &OffloadConfig, search_path: Option<OsString>) -> Result<Self> {
        let dir = match &config.tool_dir {
            Some(dir) => dir.clone(),
            None => {
                let search_path = search_path.ok_or_else(|| {
                    BuildError::offload_unavailable(format!(
                        "no tool_dir configured and {} is not set",
                        config.tool_dir_env
                    ))
                })?;
                std::env::split_paths(&search_path)
                    .find(|dir| dir.join(&config.booster).is_file())
                    .ok_or_else(|| {
                        BuildError::offload_unavailable(format!(
                            "{} not found in any directory listed by {}",
                            config.booster, config.tool_dir_env
                        ))
                    })?
            }
        };
        debug!(dir = %dir.display(), "Checking offload tools");

        let tools = Self {
            booster: dir.join(&config.booster),
            apply_script: dir.join(&config.apply_script),
            idle_loop: dir.join(&config.idle_loop),
            dispatch_tool: dir.join(&config.dispatch_tool),
            switch_file: dir.join(&config.switch_file),
            dir,
        };
        for tool in [
            &tools.booster,
            &tools.idle_loop,
            &tools.apply_script,
            &tools.dispatch_tool,
        ] {
            require_file(tool)?;
        }
        Ok(tools)
    }

    /// The opt-in marker must sit next to the tools.
    pub fn is_enabled(&self) -> bool {
        let enabled = self.switch_file.is_file();
        if !enabled {
            info!(switch_file = %self.switch_file.display(), "Offload switch file not present");
        }
        enabled
    }
}

fn require_file(path: &Path) -> Result<()> {
    if path.is_file() {
        Ok(())
    } else {
        Err(BuildError::offload_unavailable(format!(
            "tool {} does not exist",
            path.display()
        )))
    }
}
