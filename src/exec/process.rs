use crate::core::errors::{BuildError, Result};
use crate::exec::output::LineSplitter;
use crate::graph::action::{path_text, Action};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

/// Outcome of one finished process
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    /// Exit code; -1 when the process ended by signal
    pub exit_code: i32,
    /// Combined stdout/stderr lines, in arrival order
    pub output: Vec<String>,
    pub duration: Duration,
    /// User plus system CPU time, when the platform exposes it
    pub processor_time: Option<Duration>,
    pub description: Option<String>,
}

impl ExecutionResult {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Runs one action to completion.
///
/// Implementations must return `Ok` for any process that ran, whatever its
/// exit code, and reserve `Err` for `LaunchFailed`, `TimedOut` and
/// `Cancelled`.
#[async_trait]
pub trait ActionRunner: Send + Sync {
    async fn run(&self, action: &Action, cancel: &CancellationToken) -> Result<ExecutionResult>;
}

enum Interrupt {
    Cancelled,
    TimedOut(Duration),
}

/// Launches actions as child processes.
#[derive(Debug, Clone, Default)]
pub struct ProcessExecutor {
    default_timeout: Option<Duration>,
    env: BTreeMap<String, String>,
    log_command_lines: bool,
}

impl ProcessExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.default_timeout = timeout;
        self
    }

    /// Extra environment for every child
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn log_command_lines(mut self, enabled: bool) -> Self {
        self.log_command_lines = enabled;
        self
    }

    async fn interrupted(cancel: &CancellationToken, deadline: Option<(Instant, Duration)>) -> Interrupt {
        match deadline {
            Some((at, limit)) => tokio::select! {
                _ = cancel.cancelled() => Interrupt::Cancelled,
                _ = tokio::time::sleep_until(at.into()) => Interrupt::TimedOut(limit),
            },
            None => {
                cancel.cancelled().await;
                Interrupt::Cancelled
            }
        }
    }

    async fn kill(child: &mut Child, action: &Action) {
        if let Err(e) = child.start_kill() {
            debug!(action = %action.name, "kill failed, process likely gone: {}", e);
        }
        if let Err(e) = child.wait().await {
            warn!(action = %action.name, "Failed to reap killed process: {}", e);
        }
    }

    fn interrupt_error(interrupt: Interrupt, action: &Action) -> BuildError {
        match interrupt {
            Interrupt::Cancelled => BuildError::cancelled(format!("action '{}'", action.name)),
            Interrupt::TimedOut(limit) => {
                BuildError::timed_out(action.name.clone(), limit.as_millis() as u64)
            }
        }
    }
}

#[async_trait]
impl ActionRunner for ProcessExecutor {
    #[instrument(skip(self, action, cancel), fields(action = %action.name))]
    async fn run(&self, action: &Action, cancel: &CancellationToken) -> Result<ExecutionResult> {
        if cancel.is_cancelled() {
            return Err(BuildError::cancelled(format!("action '{}'", action.name)));
        }
        if self.log_command_lines {
            debug!(command = %action.command_line(), workdir = %action.working_dir.display(), "Launching");
        }

        let mut command = Command::new(&action.executable);
        command
            .args(&action.arguments)
            .current_dir(&action.working_dir)
            .envs(&self.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let started = Instant::now();
        let mut child = command
            .spawn()
            .map_err(|e| BuildError::launch_failed(path_text(&action.executable), e))?;
        let pid = child.id();
        let deadline = action
            .timeout
            .or(self.default_timeout)
            .map(|limit| (started + limit, limit));

        let mut drain = tokio::spawn(read_output(child.stdout.take(), child.stderr.take()));

        // Pipes first, so a chatty child never blocks on a full buffer.
        let output = tokio::select! {
            joined = &mut drain => joined
                .map_err(|e| BuildError::io("join output reader", std::io::Error::other(e)))?
                .map_err(|e| BuildError::io("read process output", e))?,
            why = Self::interrupted(cancel, deadline) => {
                Self::kill(&mut child, action).await;
                drain.abort();
                return Err(Self::interrupt_error(why, action));
            }
        };

        // The child has closed its pipes and is about to exit; sample CPU time
        // while it can still be read.
        let processor_time = pid.and_then(processor_time_of);

        let status = tokio::select! {
            status = child.wait() => status.map_err(|e| BuildError::io("wait for process", e))?,
            why = Self::interrupted(cancel, deadline) => {
                Self::kill(&mut child, action).await;
                return Err(Self::interrupt_error(why, action));
            }
        };

        let result = ExecutionResult {
            exit_code: status.code().unwrap_or(-1),
            output,
            duration: started.elapsed(),
            processor_time,
            description: describe_status(&status),
        };
        debug!(
            exit_code = result.exit_code,
            duration_ms = result.duration.as_millis() as u64,
            lines = result.output.len(),
            "Process finished"
        );
        Ok(result)
    }
}

async fn read_some<R: AsyncRead + Unpin>(reader: &mut Option<R>, buf: &mut [u8]) -> std::io::Result<usize> {
    match reader {
        Some(reader) => reader.read(buf).await,
        None => std::future::pending().await,
    }
}

/// Drain stdout and stderr together until both reach end of stream.
async fn read_output(
    mut stdout: Option<ChildStdout>,
    mut stderr: Option<ChildStderr>,
) -> std::io::Result<Vec<String>> {
    let mut lines = Vec::new();
    let mut out_lines = LineSplitter::new();
    let mut err_lines = LineSplitter::new();
    let mut out_buf = vec![0u8; 8 * 1024];
    let mut err_buf = vec![0u8; 8 * 1024];

    while stdout.is_some() || stderr.is_some() {
        tokio::select! {
            read = read_some(&mut stdout, &mut out_buf) => match read? {
                0 => {
                    stdout = None;
                    lines.extend(out_lines.finish());
                }
                n => lines.extend(out_lines.push(&out_buf[..n])),
            },
            read = read_some(&mut stderr, &mut err_buf) => match read? {
                0 => {
                    stderr = None;
                    lines.extend(err_lines.finish());
                }
                n => lines.extend(err_lines.push(&err_buf[..n])),
            },
        }
    }
    Ok(lines)
}

/// Clock ticks per second as reported by `sysconf(_SC_CLK_TCK)`.
#[cfg(target_os = "linux")]
fn clock_ticks_per_second() -> Option<u64> {
    // SAFETY: sysconf only reads a configuration value.
    let ticks = unsafe { libc::sysconf(libc::_SC_CLK_TCK) };
    u64::try_from(ticks).ok().filter(|t| *t > 0)
}

/// User plus system time from fields 14 and 15 of `/proc/<pid>/stat`.
#[cfg(target_os = "linux")]
fn processor_time_of(pid: u32) -> Option<Duration> {
    let ticks_per_second = clock_ticks_per_second()?;
    let stat = std::fs::read_to_string(format!("/proc/{}/stat", pid)).ok()?;
    let after_name = &stat[stat.rfind(')')? + 1..];
    let fields: Vec<&str> = after_name.split_whitespace().collect();
    let utime: u64 = fields.get(11)?.parse().ok()?;
    let stime: u64 = fields.get(12)?.parse().ok()?;
    Some(Duration::from_millis((utime + stime) * 1000 / ticks_per_second))
}

#[cfg(not(target_os = "linux"))]
fn processor_time_of(_pid: u32) -> Option<Duration> {
    None
}

/// Suffix for exits that a bare exit code explains poorly.
fn describe_status(status: &std::process::ExitStatus) -> Option<String> {
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return Some(format!("terminated by signal {}", signal));
        }
    }
    match status.code() {
        Some(0) | None => None,
        Some(code) => Some(format!("exited with code {}", code)),
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn shell(name: &str, script: &str) -> Action {
        Action::new(name, "/bin/sh").args(["-c", script])
    }

    #[tokio::test]
    async fn test_captures_both_streams() {
        let executor = ProcessExecutor::new();
        let result = executor
            .run(
                &shell("echo", "echo out; echo err 1>&2; printf 'a\\r\\nb'"),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert!(result.success());
        let mut lines = result.output.clone();
        lines.sort();
        assert_eq!(lines, vec!["a", "b", "err", "out"]);
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_not_an_error() {
        let executor = ProcessExecutor::new();
        let result = executor
            .run(&shell("fail", "exit 3"), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(result.exit_code, 3);
        assert!(!result.success());
        assert_eq!(result.description.as_deref(), Some("exited with code 3"));
    }

    #[tokio::test]
    async fn test_signal_exit_is_described() {
        let result = ProcessExecutor::new()
            .run(&shell("killed", "kill -9 $$"), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(result.exit_code, -1);
        assert_eq!(result.description.as_deref(), Some("terminated by signal 9"));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_clock_ticks_queried() {
        assert!(clock_ticks_per_second().unwrap() > 0);
    }

    #[tokio::test]
    async fn test_launch_failure() {
        let executor = ProcessExecutor::new();
        let action = Action::new("missing", "/definitely/not/here");
        let err = executor
            .run(&action, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, BuildError::LaunchFailed { .. }));
    }

    #[tokio::test]
    async fn test_timeout_kills_process() {
        let executor = ProcessExecutor::new().with_timeout(Some(Duration::from_millis(100)));
        let started = Instant::now();
        let err = executor
            .run(&shell("sleeper", "sleep 10"), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, BuildError::TimedOut { .. }));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_cancellation_kills_process() {
        let executor = ProcessExecutor::new();
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });
        let started = Instant::now();
        let err = executor
            .run(&shell("sleeper", "sleep 10"), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, BuildError::Cancelled { .. }));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_already_cancelled_never_spawns() {
        let executor = ProcessExecutor::new();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = executor
            .run(&Action::new("missing", "/definitely/not/here"), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, BuildError::Cancelled { .. }));
    }

    #[tokio::test]
    async fn test_large_output_does_not_block() {
        let executor = ProcessExecutor::new().with_timeout(Some(Duration::from_secs(20)));
        let result = executor
            .run(
                &shell("chatty", "i=0; while [ $i -lt 5000 ]; do echo line $i; i=$((i+1)); done"),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(result.output.len(), 5000);
        assert_eq!(result.output[4999], "line 4999");
    }

    #[tokio::test]
    async fn test_env_and_workdir() {
        let dir = tempfile::tempdir().unwrap();
        let executor = ProcessExecutor::new().with_env("BUILDFLOW_TEST_VAR", "hello");
        let action = shell("env", "echo $BUILDFLOW_TEST_VAR; pwd").working_dir(dir.path());
        let result = executor
            .run(&action, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(result.output[0], "hello");
        let reported = std::fs::canonicalize(&result.output[1]).unwrap();
        assert_eq!(reported, std::fs::canonicalize(dir.path()).unwrap());
    }
}
