use crate::core::errors::{BuildError, Result};
use crate::offload::descriptor::DescriptorFile;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tracing::{debug, info, instrument, warn};

/// Key carrying the parallelism hint in a grant document.
pub const MAX_PROCESS_KEY: &str = "OFFLOAD_MAX_PROCESS";
/// Key carrying the opaque remote task identifier.
pub const TASK_ID_KEY: &str = "OFFLOAD_TASK_ID";

/// Remote capacity handed out by the broker.
#[derive(Debug)]
pub struct ResourceGrant {
    pub max_parallel: usize,
    pub task_id: String,
    /// Every pair from the grant document, passed to the dispatch tool's environment
    pub env: BTreeMap<String, String>,
    toolchain: Option<DescriptorFile>,
}

impl ResourceGrant {
    pub fn new(max_parallel: usize, task_id: impl Into<String>) -> Self {
        let task_id = task_id.into();
        let env = BTreeMap::from([
            (MAX_PROCESS_KEY.to_string(), max_parallel.to_string()),
            (TASK_ID_KEY.to_string(), task_id.clone()),
        ]);
        Self {
            max_parallel,
            task_id,
            env,
            toolchain: None,
        }
    }

    /// Keep the toolchain manifest alive for as long as the grant is.
    pub(crate) fn with_toolchain(mut self, toolchain: DescriptorFile) -> Self {
        self.toolchain = Some(toolchain);
        self
    }

    pub fn toolchain_file(&self) -> Option<&Path> {
        self.toolchain.as_ref().map(DescriptorFile::path)
    }
}

/// Parse the flat key/value document written by the broker.
///
/// Values may be strings, numbers or booleans. A missing or invalid
/// parallelism hint or task id makes the whole document unusable.
pub fn parse_grant(text: &str) -> Result<ResourceGrant> {
    let malformed = |message: String| BuildError::offload_setup("negotiate", message);

    let document: serde_json::Map<String, Value> = serde_json::from_str(text)
        .map_err(|e| malformed(format!("grant document is not a JSON object: {}", e)))?;

    let mut env = BTreeMap::new();
    for (key, value) in document {
        let text = match value {
            Value::String(s) => s,
            Value::Number(n) => n.to_string(),
            Value::Bool(b) => b.to_string(),
            other => return Err(malformed(format!("value of {} is not a scalar: {}", key, other))),
        };
        env.insert(key, text);
    }

    let max_parallel = env
        .get(MAX_PROCESS_KEY)
        .ok_or_else(|| malformed(format!("{} missing", MAX_PROCESS_KEY)))?
        .trim()
        .parse::<usize>()
        .ok()
        .filter(|n| *n > 0)
        .ok_or_else(|| malformed(format!("{} must be a positive integer", MAX_PROCESS_KEY)))?;
    let task_id = env
        .get(TASK_ID_KEY)
        .map(|id| id.trim().to_string())
        .filter(|id| !id.is_empty())
        .ok_or_else(|| malformed(format!("{} missing or empty", TASK_ID_KEY)))?;

    Ok(ResourceGrant {
        max_parallel,
        task_id,
        env,
        toolchain: None,
    })
}

/// Source of remote capacity. The adapter bounds every call with its own timeout.
#[async_trait]
pub trait ResourceBroker: Send + Sync + std::fmt::Debug {
    async fn request(&self, toolchain_file: &Path) -> Result<ResourceGrant>;
}

/// Runs the apply script and waits for it to write a grant document.
#[derive(Debug, Clone)]
pub struct ScriptBroker {
    pub apply_script: PathBuf,
    pub booster: PathBuf,
    pub idle_loop: PathBuf,
    /// Where the grant document is written
    pub output_dir: PathBuf,
    pub poll: Duration,
}

/// Kills the apply script unless negotiation succeeded.
struct ScriptGuard(Option<Child>);

impl ScriptGuard {
    fn child(&mut self) -> Option<&mut Child> {
        self.0.as_mut()
    }

    /// Let the script keep running after we are done with it.
    fn detach(mut self) {
        self.0.take();
    }
}

impl Drop for ScriptGuard {
    fn drop(&mut self) {
        if let Some(child) = self.0.as_mut() {
            if let Err(e) = child.start_kill() {
                debug!("Apply script already gone: {}", e);
            }
        }
    }
}

fn forward_lines<R>(reader: R, stream: &'static str)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            debug!(stream, "apply: {}", line);
        }
    });
}

#[async_trait]
impl ResourceBroker for ScriptBroker {
    #[instrument(skip(self), fields(script = %self.apply_script.display()))]
    async fn request(&self, toolchain_file: &Path) -> Result<ResourceGrant> {
        let output = DescriptorFile::empty(&self.output_dir, "grant_")?;
        info!(output = %output.path().display(), "Requesting offload resources");

        let mut child = Command::new(&self.apply_script)
            .arg(&self.booster)
            .arg(output.path())
            .arg(toolchain_file)
            .arg(&self.idle_loop)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| BuildError::launch_failed(self.apply_script.display().to_string(), e))?;
        if let Some(stdout) = child.stdout.take() {
            forward_lines(stdout, "stdout");
        }
        if let Some(stderr) = child.stderr.take() {
            forward_lines(stderr, "stderr");
        }
        let mut guard = ScriptGuard(Some(child));

        loop {
            if output.has_contents() {
                let text = tokio::fs::read_to_string(output.path())
                    .await
                    .map_err(|e| BuildError::io(format!("read {}", output.path().display()), e))?;
                let grant = parse_grant(&text)?;
                info!(
                    task_id = %grant.task_id,
                    max_parallel = grant.max_parallel,
                    "Offload resources granted"
                );
                guard.detach();
                return Ok(grant);
            }

            let exited = match guard.child() {
                Some(child) => child
                    .try_wait()
                    .map_err(|e| BuildError::io("poll apply script", e))?,
                None => None,
            };
            if let Some(status) = exited {
                // The script may have written the file right before exiting.
                if output.has_contents() {
                    continue;
                }
                warn!(%status, "Apply script exited without granting resources");
                return Err(BuildError::offload_unavailable(format!(
                    "apply script exited with {} before writing a grant",
                    status
                )));
            }
            tokio::time::sleep(self.poll).await;
        }
    }
}
