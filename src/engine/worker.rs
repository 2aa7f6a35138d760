//! Process isolation for the parallel strategy.
//!
//! The parent writes one [`WorkerRequest`] as JSON to the child's stdin and
//! reads one [`CollectionOutcome`] JSON line back from its stdout. Whatever
//! happens to the child (crash, signal, hang) the parent still ends up with
//! exactly one outcome for the task.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;

use crate::domain::{CollectionOutcome, CollectionTask, ErrorKind};
use crate::engine::orchestrator::execute_task;
use crate::infra::config::SourcesConfig;
use crate::sources::builtin_registry;

/// Everything a worker needs to run one task on its own.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerRequest {
    pub task: CollectionTask,
    #[serde(default)]
    pub sources: SourcesConfig,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credentials: Option<String>,
    pub task_timeout_secs: u64,
}

/// How to start a worker process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
}

impl WorkerCommand {
    pub fn new(program: impl Into<PathBuf>, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    /// This executable's hidden `worker` subcommand.
    pub fn current_exe() -> std::io::Result<Self> {
        Ok(Self::new(std::env::current_exe()?, ["worker"]))
    }
}

/// Run one task in a child process. The child is killed if it outlives
/// `timeout` or if this future is dropped.
pub async fn run_isolated(
    command: &WorkerCommand,
    request: &WorkerRequest,
    timeout: Duration,
) -> CollectionOutcome {
    let task = &request.task;
    let started_at = Utc::now();
    let fail = |kind: ErrorKind, detail: String| CollectionOutcome::failed(task, kind, detail, started_at);

    let payload = match serde_json::to_vec(request) {
        Ok(payload) => payload,
        Err(e) => return fail(ErrorKind::Configuration, format!("failed to encode worker request: {e}")),
    };

    let mut cmd = Command::new(&command.program);
    cmd.args(&command.args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit())
        .kill_on_drop(true);
    // Own process group: a terminal Ctrl-C reaches the parent only, which
    // then decides between grace and termination for each worker.
    #[cfg(unix)]
    cmd.process_group(0);

    let mut child = match cmd.spawn() {
        Ok(child) => child,
        Err(e) => {
            return fail(
                ErrorKind::Transient,
                format!("failed to start worker {}: {e}", command.program.display()),
            )
        }
    };
    let pid = child.id();
    tracing::debug!(task = %task.identity, ?pid, "worker started");

    let mut stdin = child.stdin.take();
    let mut stdout = child.stdout.take();

    let exchange = async {
        if let Some(mut stdin) = stdin.take() {
            // A worker that dies before reading its input shows up in the exit status
            if let Err(e) = stdin.write_all(&payload).await {
                tracing::debug!(task = %task.identity, "worker stdin closed early: {}", e);
            }
            drop(stdin);
        }

        let mut output = Vec::new();
        if let Some(stdout) = stdout.as_mut() {
            let _ = stdout.read_to_end(&mut output).await;
        }
        let status = child.wait().await;
        (status, output)
    };

    let (status, output) = match tokio::time::timeout(timeout, exchange).await {
        Ok(result) => result,
        Err(_) => {
            tracing::warn!(task = %task.identity, ?pid, ?timeout, "worker timed out, killing it");
            return fail(ErrorKind::Transient, format!("worker timed out after {timeout:?}"));
        }
    };

    if let Some(outcome) = parse_outcome(&output) {
        return outcome;
    }

    let detail = match status {
        Ok(status) if status.success() => "worker exited without reporting an outcome".to_string(),
        Ok(status) => format!("worker crashed ({status})"),
        Err(e) => format!("failed to wait for worker: {e}"),
    };
    tracing::warn!(task = %task.identity, ?pid, "{}", detail);
    fail(ErrorKind::Transient, detail)
}

// The outcome is the last non-empty line; anything before it is noise
fn parse_outcome(output: &[u8]) -> Option<CollectionOutcome> {
    let text = String::from_utf8_lossy(output);
    let line = text.lines().rev().find(|l| !l.trim().is_empty())?;
    serde_json::from_str(line).ok()
}

/// Worker side: read a request from stdin, run it, print the outcome.
pub async fn serve() -> anyhow::Result<()> {
    let mut raw = Vec::new();
    tokio::io::stdin().read_to_end(&mut raw).await?;
    let request: WorkerRequest = serde_json::from_slice(&raw)?;

    let registry = builtin_registry(&request.sources);
    let outcome = execute_task(
        &registry,
        &request.task,
        request.credentials.as_deref(),
        Duration::from_secs(request.task_timeout_secs.max(1)),
    )
    .await;

    let mut line = serde_json::to_vec(&outcome)?;
    line.push(b'\n');
    let mut stdout = tokio::io::stdout();
    stdout.write_all(&line).await?;
    stdout.flush().await?;
    Ok(())
}
