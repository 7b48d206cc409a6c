//! Handing a whole action graph to a remote accelerator.
//!
//! The adapter checks whether offloading is worthwhile, negotiates capacity
//! with a [`ResourceBroker`] under a capped timeout, then serializes the graph
//! in dependency order and runs the dispatch tool on it. Every setup failure
//! surfaces as an error that permits local fallback.

pub mod descriptor;
pub mod negotiate;
pub mod toolchain;
pub mod tools;
pub mod wire;

pub use descriptor::DescriptorFile;
pub use negotiate::{parse_grant, ResourceBroker, ResourceGrant, ScriptBroker};
pub use toolchain::{CompilerFamily, ToolchainEntry, ToolchainFile, ToolchainManifest};
pub use tools::OffloadTools;
pub use wire::{sort_for_offload, WireAction, WireDocument};

use crate::core::config::OffloadConfig;
use crate::core::errors::{BuildError, Result};
use crate::graph::graph::ActionGraph;
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

pub struct OffloadAdapter {
    config: OffloadConfig,
    broker: Option<Arc<dyn ResourceBroker>>,
}

impl std::fmt::Debug for OffloadAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OffloadAdapter")
            .field("config", &self.config)
            .field("broker", &self.broker)
            .finish()
    }
}

impl OffloadAdapter {
    pub fn new(config: OffloadConfig) -> Self {
        Self {
            config,
            broker: None,
        }
    }

    /// Replace the apply-script broker.
    pub fn with_broker(mut self, broker: Arc<dyn ResourceBroker>) -> Self {
        self.broker = Some(broker);
        self
    }

    pub fn config(&self) -> &OffloadConfig {
        &self.config
    }

    fn platform_supported() -> bool {
        cfg!(any(windows, target_os = "macos", target_os = "linux"))
    }

    /// Cheap checks only: platform, enough compiler actions, tools and opt-in marker.
    pub fn is_available(&self, graph: &ActionGraph) -> bool {
        if !Self::platform_supported() {
            info!("Offload not supported on this platform");
            return false;
        }

        let accelerable = ToolchainManifest::accelerable_actions(graph);
        let threshold = self.config.min_actions();
        if accelerable <= threshold {
            info!(accelerable, threshold, "Too few compiler actions to offload");
            return false;
        }

        match OffloadTools::discover(&self.config) {
            Ok(tools) => tools.is_enabled(),
            Err(e) => {
                info!("Offload tools unavailable: {}", e);
                false
            }
        }
    }

    /// Ask the broker for capacity, giving up after the configured timeout
    /// or as soon as `cancel` fires.
    #[instrument(skip_all, fields(actions = graph.len()))]
    pub async fn negotiate(
        &self,
        graph: &ActionGraph,
        cancel: &CancellationToken,
    ) -> Result<ResourceGrant> {
        let tools = OffloadTools::discover(&self.config)?;
        let manifest = ToolchainManifest::from_graph(graph)?;
        let toolchain = DescriptorFile::create(&tools.dir, "toolchain_", &manifest.to_json()?)
            .await
            .map_err(|e| BuildError::offload_setup("toolchain", e.to_string()))?;

        let broker: Arc<dyn ResourceBroker> = match &self.broker {
            Some(broker) => Arc::clone(broker),
            None => Arc::new(ScriptBroker {
                apply_script: tools.apply_script.clone(),
                booster: tools.booster.clone(),
                idle_loop: tools.idle_loop.clone(),
                output_dir: tools.dir.clone(),
                poll: self.config.negotiation_poll(),
            }),
        };

        let limit = self.config.negotiation_timeout();
        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                info!("Resource negotiation cancelled");
                return Err(BuildError::cancelled("resource negotiation"));
            }
            outcome = tokio::time::timeout(limit, broker.request(toolchain.path())) => outcome,
        };
        match outcome {
            Err(_) => {
                warn!(timeout_secs = limit.as_secs(), "Resource negotiation timed out");
                Err(BuildError::offload_unavailable(format!(
                    "resource negotiation timed out after {}s",
                    limit.as_secs()
                )))
            }
            Ok(Err(e)) if e.allows_local_fallback() => Err(e),
            Ok(Err(e)) => Err(BuildError::offload_setup("negotiate", e.to_string())),
            Ok(Ok(grant)) => Ok(grant.with_toolchain(toolchain)),
        }
    }

    /// Run the whole graph remotely; `Ok(false)` means the remote build failed.
    #[instrument(skip_all, fields(actions = graph.len(), task_id = %grant.task_id))]
    pub async fn execute(
        &self,
        graph: &ActionGraph,
        grant: &ResourceGrant,
        cancel: &CancellationToken,
    ) -> Result<bool> {
        let order = sort_for_offload(graph, self.config.sort_attempts)?;
        let document = WireDocument::from_graph(graph, &order)?;
        let tools = OffloadTools::discover(&self.config)?;
        let actions_file = DescriptorFile::create(&tools.dir, "actions_", &document.to_json()?)
            .await
            .map_err(|e| BuildError::offload_setup("actions", e.to_string()))?;

        let mut command = Command::new(&tools.dispatch_tool);
        command.arg("--actions_json_file").arg(actions_file.path());
        if let Some(toolchain) = grant.toolchain_file() {
            command.arg("--tool_chain_json_file").arg(toolchain);
        }
        if let Some(dir) = &self.config.working_dir {
            command.current_dir(dir);
        }
        command
            .envs(&grant.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        info!(tool = %tools.dispatch_tool.display(), max_parallel = grant.max_parallel, "Dispatching actions");
        let started = std::time::Instant::now();
        let mut child = command.spawn().map_err(|e| {
            BuildError::offload_setup(
                "dispatch",
                format!("failed to launch {}: {}", tools.dispatch_tool.display(), e),
            )
        })?;

        let mut streams = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            streams.push(tokio::spawn(forward_lines(stdout)));
        }
        if let Some(stderr) = child.stderr.take() {
            streams.push(tokio::spawn(forward_lines(stderr)));
        }

        let status = tokio::select! {
            status = child.wait() => status.map_err(|e| BuildError::io("wait for dispatch tool", e))?,
            _ = cancel.cancelled() => {
                if let Err(e) = child.start_kill() {
                    debug!("Dispatch tool already exited: {}", e);
                }
                let _ = child.wait().await;
                return Err(BuildError::cancelled("offloaded build"));
            }
        };
        futures::future::join_all(streams).await;

        info!(
            %status,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Offloaded build finished"
        );
        Ok(status.success())
    }
}

async fn forward_lines<R: AsyncRead + Unpin>(reader: R) {
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        info!(target: "buildflow::offload::dispatch", "{}", line);
    }
}
