//! Task execution: run the external research agent for one item.
//!
//! Exactly one process per pick. The instruction payload goes in on stdin,
//! output is captured up to a bound, and a hard timeout kills the process.
//! Nothing here returns an error: spawn failures, timeouts, and non-zero
//! exits all become an unsuccessful [`TaskOutcome`] so the artifact can
//! still be validated.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, LazyLock, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use opentelemetry::KeyValue;
use regex::Regex;
use secrecy::{ExposeSecret, SecretString};
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tracing::{debug, error, info, warn};

use crate::config::tools::AllowedTools;
use crate::model::QueueItem;
use crate::telemetry::metrics;

/// How long to wait for output still in the pipes after killing the runner.
const DRAIN_GRACE: Duration = Duration::from_millis(250);

static PERMISSION_DENIAL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)permission|not allowed|denied|unauthorized|disallowed")
        .expect("valid permission regex")
});

/// What came back from one task run.
#[derive(Debug, Clone, Default)]
pub struct TaskOutcome {
    pub success: bool,
    pub exit_code: Option<i32>,
    pub timed_out: bool,
    pub stdout: String,
    pub stderr: String,
    pub duration: Duration,
    /// The runner's error stream mentions a permission denial.
    pub permission_warning: bool,
    /// Why the run was unsuccessful, if it was.
    pub diagnostic: Option<String>,
}

impl TaskOutcome {
    fn failed(diagnostic: String, duration: Duration) -> Self {
        Self {
            diagnostic: Some(diagnostic),
            duration,
            ..Default::default()
        }
    }

    fn outcome_label(&self) -> &'static str {
        if self.timed_out {
            "timeout"
        } else if self.success {
            "success"
        } else {
            "failure"
        }
    }
}

/// One invocation of the runner.
#[derive(Debug, Clone, Copy)]
pub struct TaskRequest<'a> {
    pub item: &'a QueueItem,
    /// Where the runner was told to write, relative to the workspace root.
    pub artifact: &'a Path,
    /// Payload written to the runner's stdin.
    pub instructions: &'a str,
}

/// Runs the external task for an item.
#[async_trait]
pub trait TaskRunner: Send + Sync {
    /// Never fails; every problem is reported in the outcome.
    async fn run(&self, request: &TaskRequest<'_>) -> TaskOutcome;
}

/// How to invoke the runner process.
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    pub program: PathBuf,
    /// Arguments placed before the generated ones.
    pub base_args: Vec<String>,
    pub working_dir: PathBuf,
    pub timeout: Duration,
    /// Per-stream capture bound in bytes.
    pub max_output_bytes: usize,
    /// Where attempt logs go. `None` disables them.
    pub logs_dir: Option<PathBuf>,
    pub api_key: Option<SecretString>,
}

impl RunnerConfig {
    pub const DEFAULT_MAX_OUTPUT_BYTES: usize = 10 * 1024 * 1024;

    pub fn new(program: impl Into<PathBuf>, working_dir: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            base_args: Vec::new(),
            working_dir: working_dir.into(),
            timeout: crate::config::DEFAULT_TASK_TIMEOUT,
            max_output_bytes: Self::DEFAULT_MAX_OUTPUT_BYTES,
            logs_dir: None,
            api_key: None,
        }
    }
}

/// Spawns the research agent CLI.
pub struct CommandRunner {
    config: RunnerConfig,
    tools: AllowedTools,
}

impl CommandRunner {
    pub fn new(config: RunnerConfig, tools: AllowedTools) -> Self {
        Self { config, tools }
    }

    fn command(&self, item: &QueueItem) -> Command {
        let mut command = Command::new(&self.config.program);
        command
            .args(&self.config.base_args)
            .args(["-p", "--model", item.model.as_str(), "--output-format", "json"])
            .arg("--allowedTools")
            .args(&self.tools.allow)
            .current_dir(&self.config.working_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(ref key) = self.config.api_key {
            command.env("ANTHROPIC_API_KEY", key.expose_secret());
        }
        command
    }

    async fn execute(&self, item: &QueueItem, instructions: &str) -> TaskOutcome {
        let start = Instant::now();
        let limit = self.config.max_output_bytes;

        let mut child = match self.command(item).spawn() {
            Ok(child) => child,
            Err(e) => {
                let msg = format!(
                    "failed to spawn runner {}: {e}",
                    self.config.program.display()
                );
                error!(item = %item.id, "{msg}");
                return TaskOutcome::failed(msg, start.elapsed());
            }
        };

        let stdin = child.stdin.take();
        // Readers run as their own tasks and fill buffers that outlive the
        // timeout, so a killed run still reports what it printed.
        let stdout_buf = Capture::default();
        let stderr_buf = Capture::default();
        let mut stdout_task =
            tokio::spawn(capture(child.stdout.take(), stdout_buf.clone(), limit));
        let mut stderr_task =
            tokio::spawn(capture(child.stderr.take(), stderr_buf.clone(), limit));

        let run = async {
            tokio::join!(
                write_instructions(stdin, instructions),
                &mut stdout_task,
                &mut stderr_task,
                child.wait(),
            )
        };

        let finished = tokio::time::timeout(self.config.timeout, run).await;
        let status = match finished {
            Ok((written, out, err, status)) => {
                if let Err(e) = written {
                    // The runner may exit without draining stdin; the exit
                    // status says whether that mattered.
                    debug!(item = %item.id, "writing instructions failed: {e}");
                }
                for (stream, joined) in [("stdout", out), ("stderr", err)] {
                    match joined {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => {
                            warn!(item = %item.id, "reading runner {stream} failed: {e}")
                        }
                        Err(e) => warn!(item = %item.id, "runner {stream} reader died: {e}"),
                    }
                }
                Some(status)
            }
            Err(_) => {
                if let Err(e) = child.start_kill() {
                    warn!(item = %item.id, "failed to kill timed out runner: {e}");
                }
                let _ = child.wait().await;
                // Descendants can keep the pipes open past the kill.
                let _ = tokio::time::timeout(DRAIN_GRACE, async {
                    let _ = (&mut stdout_task).await;
                    let _ = (&mut stderr_task).await;
                })
                .await;
                stdout_task.abort();
                stderr_task.abort();
                None
            }
        };

        let stdout = stdout_buf.take();
        let stderr = stderr_buf.take();
        let duration = start.elapsed();

        let Some(status) = status else {
            let msg = format!("runner timed out after {}s", self.config.timeout.as_secs_f64());
            error!(item = %item.id, "{msg}");
            return TaskOutcome {
                timed_out: true,
                permission_warning: PERMISSION_DENIAL.is_match(&stderr),
                stdout,
                stderr,
                ..TaskOutcome::failed(msg, duration)
            };
        };

        let mut outcome = match status {
            Ok(status) if status.success() => TaskOutcome {
                success: true,
                exit_code: status.code(),
                duration,
                ..Default::default()
            },
            Ok(status) => {
                let code = status.code().unwrap_or(-1);
                let mut msg = format!("runner exited with status {code}");
                if !stderr.trim().is_empty() {
                    msg.push_str(&format!(": {}", truncate(stderr.trim(), 500)));
                }
                error!(item = %item.id, "{msg}");
                TaskOutcome {
                    exit_code: status.code(),
                    ..TaskOutcome::failed(msg, duration)
                }
            }
            Err(e) => TaskOutcome::failed(format!("failed to wait for runner: {e}"), duration),
        };

        // Only the error stream: research output legitimately talks about
        // permissions. Timed out runs are scanned the same way above.
        outcome.permission_warning = PERMISSION_DENIAL.is_match(&stderr);
        outcome.stdout = stdout;
        outcome.stderr = stderr;
        outcome
    }

    async fn write_attempt_log(&self, item: &QueueItem, instructions: &str, outcome: &TaskOutcome) {
        let Some(ref dir) = self.config.logs_dir else {
            return;
        };

        let log = AttemptLog {
            item,
            instructions: format!("{}...", truncate(instructions, 500)),
            output: truncate(&outcome.stdout, 50_000),
            stderr: truncate(&outcome.stderr, 5_000),
            duration_ms: outcome.duration.as_millis() as u64,
            success: outcome.success,
            timed_out: outcome.timed_out,
            exit_code: outcome.exit_code,
            permission_issue: outcome.permission_warning,
            diagnostic: outcome.diagnostic.as_deref(),
            timestamp: Utc::now().to_rfc3339(),
        };
        let path = dir.join(format!("{}-attempt{}.json", item.id, item.attempts));

        let written = async {
            tokio::fs::create_dir_all(dir).await?;
            let body = serde_json::to_vec_pretty(&log).map_err(std::io::Error::other)?;
            tokio::fs::write(&path, body).await
        }
        .await;
        if let Err(e) = written {
            warn!(item = %item.id, path = %path.display(), "failed to write attempt log: {e}");
        }
    }
}

#[async_trait]
impl TaskRunner for CommandRunner {
    async fn run(&self, request: &TaskRequest<'_>) -> TaskOutcome {
        let TaskRequest {
            item,
            artifact,
            instructions,
        } = *request;
        debug!(
            item = %item.id,
            program = %self.config.program.display(),
            model = %item.model,
            artifact = %artifact.display(),
            "starting runner"
        );

        let outcome = self.execute(item, instructions).await;

        if outcome.permission_warning {
            warn!(item = %item.id, "possible permission issue in runner stderr, check the attempt log");
        }
        metrics::task_duration_ms().record(
            outcome.duration.as_millis() as f64,
            &[KeyValue::new("outcome", outcome.outcome_label())],
        );
        info!(
            item = %item.id,
            duration_ms = outcome.duration.as_millis() as u64,
            success = outcome.success,
            timed_out = outcome.timed_out,
            "runner finished"
        );

        self.write_attempt_log(item, instructions, &outcome).await;
        outcome
    }
}

/// Attempt log written next to the worker log for post-mortems.
#[derive(Serialize)]
struct AttemptLog<'a> {
    item: &'a QueueItem,
    instructions: String,
    output: &'a str,
    stderr: &'a str,
    duration_ms: u64,
    success: bool,
    timed_out: bool,
    exit_code: Option<i32>,
    permission_issue: bool,
    diagnostic: Option<&'a str>,
    timestamp: String,
}

async fn write_instructions(
    stdin: Option<tokio::process::ChildStdin>,
    instructions: &str,
) -> std::io::Result<()> {
    let Some(mut stdin) = stdin else {
        return Ok(());
    };
    stdin.write_all(instructions.as_bytes()).await?;
    stdin.shutdown().await
}

/// Captured bytes of one output stream, shared with its reader task.
#[derive(Debug, Clone, Default)]
struct Capture(Arc<Mutex<Vec<u8>>>);

impl Capture {
    fn lock(&self) -> MutexGuard<'_, Vec<u8>> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn take(&self) -> String {
        let bytes = std::mem::take(&mut *self.lock());
        String::from_utf8_lossy(&bytes).into_owned()
    }
}

/// Keep up to `limit` bytes, then drain and discard the rest so the child
/// never blocks on a full pipe.
async fn capture<R>(reader: Option<R>, into: Capture, limit: usize) -> std::io::Result<()>
where
    R: AsyncRead + Unpin,
{
    let Some(mut reader) = reader else {
        return Ok(());
    };
    let mut chunk = [0u8; 8192];
    loop {
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            return Ok(());
        }
        let mut buf = into.lock();
        let room = limit.saturating_sub(buf.len());
        buf.extend_from_slice(&chunk[..n.min(room)]);
    }
}

/// Longest prefix of `s` no longer than `max` bytes, on a char boundary.
pub(crate) fn truncate(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}
