//! One complete collection run: lock, plan, orchestrate, persist, report.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::domain::{CollectionOutcome, DiffReport, ErrorKind, SourceIdentity, TimeWindow};
use crate::engine::orchestrator::{Orchestrator, Strategy, WorkerSetup};
use crate::engine::persistence::{DiffPersistenceEngine, RecordSink, RunHistoryEntry, SinkError};
use crate::engine::planner::{plan, TaskSpec};
use crate::engine::worker::WorkerCommand;
use crate::infra::config::HarvesterConfig;
use crate::infra::lock::{LockError, RunLock};
use crate::sources::SourceRegistry;

/// Process exit codes for the CLI.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitStatus {
    Success,
    LockHeld,
    TasksFailed,
    Fatal,
}

impl ExitStatus {
    pub fn code(self) -> i32 {
        match self {
            ExitStatus::Success => 0,
            ExitStatus::LockHeld => 2,
            ExitStatus::TasksFailed => 3,
            ExitStatus::Fatal => 4,
        }
    }
}

#[derive(Debug, Error)]
pub enum RunError {
    #[error(transparent)]
    Lock(#[from] LockError),

    #[error("failed to open record store: {0}")]
    Sink(#[from] SinkError),
}

impl RunError {
    pub fn exit_status(&self) -> ExitStatus {
        match self {
            RunError::Lock(LockError::Held { .. }) => ExitStatus::LockHeld,
            RunError::Lock(_) | RunError::Sink(_) => ExitStatus::Fatal,
        }
    }
}

type SinkOpener = Box<dyn Fn() -> Result<Arc<dyn RecordSink>, SinkError> + Send + Sync>;

/// Where the runner gets its sink from. `Open` is only called once the run
/// lock is held, so a refused run never creates or migrates a store.
enum SinkSource {
    Ready(Arc<dyn RecordSink>),
    Open(SinkOpener),
}

impl SinkSource {
    fn get(&self) -> Result<Arc<dyn RecordSink>, SinkError> {
        match self {
            SinkSource::Ready(sink) => Ok(Arc::clone(sink)),
            SinkSource::Open(open) => open(),
        }
    }
}

/// Per-task line of a report, without the collected payload.
#[derive(Debug, Clone, Serialize)]
pub struct TaskSummary {
    pub identity: SourceIdentity,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time_window: Option<TimeWindow>,
    pub success: bool,
    pub items: usize,
    pub ephemeral_items: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_detail: Option<String>,
    pub duration_ms: i64,
}

impl From<&CollectionOutcome> for TaskSummary {
    fn from(outcome: &CollectionOutcome) -> Self {
        Self {
            identity: outcome.identity.clone(),
            time_window: outcome.time_window,
            success: outcome.success,
            items: outcome.items.len(),
            ephemeral_items: outcome.ephemeral_items.len(),
            error_kind: outcome.error_kind,
            error_detail: outcome.error_detail.clone(),
            duration_ms: outcome.duration().num_milliseconds(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub strategy: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub tasks: Vec<TaskSummary>,
    pub diff: DiffReport,
    pub succeeded: usize,
    pub failed: usize,
    pub cancelled: usize,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub persistence_errors: Vec<String>,
    #[serde(skip)]
    pub outcomes: Vec<CollectionOutcome>,
}

impl RunReport {
    pub fn exit_status(&self) -> ExitStatus {
        if self.failed > 0 || self.cancelled > 0 || !self.persistence_errors.is_empty() {
            ExitStatus::TasksFailed
        } else {
            ExitStatus::Success
        }
    }

    pub fn duration(&self) -> chrono::Duration {
        self.finished_at - self.started_at
    }
}

pub struct Runner {
    config: HarvesterConfig,
    registry: Arc<SourceRegistry>,
    sink: SinkSource,
    worker: Option<WorkerCommand>,
    pacing_seed: Option<u64>,
    shuffle: bool,
}

impl Runner {
    pub fn new(config: HarvesterConfig, registry: Arc<SourceRegistry>, sink: Arc<dyn RecordSink>) -> Self {
        Self::with_sink_source(config, registry, SinkSource::Ready(sink))
    }

    /// Like `new`, but the sink is opened by `open` after the run lock has
    /// been acquired.
    pub fn opening<F>(config: HarvesterConfig, registry: Arc<SourceRegistry>, open: F) -> Self
    where
        F: Fn() -> Result<Arc<dyn RecordSink>, SinkError> + Send + Sync + 'static,
    {
        Self::with_sink_source(config, registry, SinkSource::Open(Box::new(open)))
    }

    fn with_sink_source(config: HarvesterConfig, registry: Arc<SourceRegistry>, sink: SinkSource) -> Self {
        Self {
            config,
            registry,
            sink,
            worker: None,
            pacing_seed: None,
            shuffle: false,
        }
    }

    /// Command used to start workers for the parallel strategy. Defaults to
    /// this executable's `worker` subcommand.
    pub fn with_worker(mut self, command: WorkerCommand) -> Self {
        self.worker = Some(command);
        self
    }

    pub fn with_pacing_seed(mut self, seed: u64) -> Self {
        self.pacing_seed = Some(seed);
        self
    }

    /// Randomize task order so accounts aren't visited in the same sequence every day.
    pub fn with_shuffle(mut self, shuffle: bool) -> Self {
        self.shuffle = shuffle;
        self
    }

    pub fn config(&self) -> &HarvesterConfig {
        &self.config
    }

    /// Run `specs` while holding the run lock.
    pub async fn run(
        &self,
        specs: Vec<TaskSpec>,
        strategy: Strategy,
        cancel: &CancellationToken,
    ) -> Result<RunReport, RunError> {
        let lock = RunLock::acquire(&self.config.lock_path)?;
        tracing::info!(
            pid = lock.owner_pid(),
            lock = %lock.lock_path().display(),
            "run lock acquired"
        );

        let sink = match self.sink.get() {
            Ok(sink) => sink,
            Err(e) => {
                if let Err(release) = lock.release() {
                    tracing::warn!("failed to release run lock: {}", release);
                }
                return Err(e.into());
            }
        };

        let report = self.run_locked(specs, strategy, cancel, sink).await;

        if let Err(e) = lock.release() {
            tracing::warn!("failed to release run lock: {}", e);
        }
        Ok(report)
    }

    async fn run_locked(
        &self,
        specs: Vec<TaskSpec>,
        strategy: Strategy,
        cancel: &CancellationToken,
        sink: Arc<dyn RecordSink>,
    ) -> RunReport {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        tracing::info!(%run_id, specs = specs.len(), "run started");

        let mut plan = plan(specs, &self.config.platforms);
        if self.shuffle {
            plan.shuffle(&mut rand::thread_rng());
        }

        let run_cancel = cancel.child_token();
        let deadline = self.config.orchestrator.deadline_secs.map(|secs| {
            let trigger = run_cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_secs(secs)).await;
                tracing::warn!(deadline_secs = secs, "run deadline reached, stopping");
                trigger.cancel();
            })
        });

        let mut outcomes = plan.rejected;
        outcomes.extend(self.orchestrator().run(plan.tasks, strategy, &run_cancel).await);

        if let Some(timer) = deadline {
            timer.abort();
        }

        let (diff, persistence_errors) = persist(Arc::clone(&sink), run_id, &outcomes);
        if let Some(days) = self.config.history_retention_days {
            prune_history(sink.as_ref(), days);
        }

        let succeeded = outcomes.iter().filter(|o| o.success).count();
        let cancelled = outcomes
            .iter()
            .filter(|o| o.error_kind == Some(ErrorKind::Cancelled))
            .count();
        let report = RunReport {
            run_id,
            strategy: strategy.to_string(),
            started_at,
            finished_at: Utc::now(),
            tasks: outcomes.iter().map(TaskSummary::from).collect(),
            diff,
            succeeded,
            failed: outcomes.len() - succeeded - cancelled,
            cancelled,
            persistence_errors,
            outcomes,
        };

        tracing::info!(
            %run_id,
            succeeded = report.succeeded,
            failed = report.failed,
            cancelled = report.cancelled,
            diff = %report.diff,
            "run finished"
        );
        report
    }

    fn orchestrator(&self) -> Orchestrator {
        let settings = &self.config.orchestrator;
        let mut orchestrator = Orchestrator::new(Arc::clone(&self.registry), self.config.pacing.clone())
            .with_credentials(self.config.token.clone())
            .with_task_timeout(Duration::from_secs(settings.task_timeout_secs))
            .with_grace_period(Duration::from_secs(settings.grace_period_secs));

        if let Some(seed) = self.pacing_seed {
            orchestrator = orchestrator.with_pacing_seed(seed);
        }

        let command = match &self.worker {
            Some(command) => Some(command.clone()),
            None => WorkerCommand::current_exe().ok(),
        };
        if let Some(command) = command {
            orchestrator = orchestrator.with_worker(WorkerSetup {
                command,
                sources: self.config.sources.clone(),
            });
        }
        orchestrator
    }
}

fn persist(
    sink: Arc<dyn RecordSink>,
    run_id: Uuid,
    outcomes: &[CollectionOutcome],
) -> (DiffReport, Vec<String>) {
    let engine = DiffPersistenceEngine::new(Arc::clone(&sink));
    let mut diff = DiffReport::default();
    let mut errors = Vec::new();

    for outcome in outcomes {
        if outcome.success {
            match engine.persist_outcome(outcome) {
                Ok(change) => {
                    tracing::debug!(identity = %outcome.identity, diff = %change, "persisted");
                    diff += change;
                }
                Err(e) => {
                    tracing::error!(identity = %outcome.identity, "persistence failed: {}", e);
                    errors.push(format!("{}: {e}", outcome.identity));
                }
            }
        }

        let entry = RunHistoryEntry::from_outcome(run_id, outcome);
        if let Err(e) = sink.record_run(&entry) {
            tracing::warn!(identity = %outcome.identity, "history not recorded: {}", e);
        }
    }

    (diff, errors)
}

fn prune_history(sink: &dyn RecordSink, days: u32) {
    let cutoff = Utc::now() - chrono::TimeDelta::days(i64::from(days));
    match sink.prune_history(cutoff) {
        Ok(0) => {}
        Ok(removed) => tracing::info!(removed, retention_days = days, "old run history pruned"),
        Err(e) => tracing::warn!("failed to prune run history: {}", e),
    }
}
