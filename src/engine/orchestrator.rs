//! Task orchestration
//!
//! Runs a batch of [`CollectionTask`]s under one of three strategies and
//! returns exactly one [`CollectionOutcome`] per task, whatever happens to
//! the individual tasks or to the run as a whole.

use chrono::{DateTime, Utc};
use futures::FutureExt;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::domain::{
    CollectionOutcome, CollectionTask, ErrorKind, ExecutionMode, IdentitySummary,
    NormalizedRecord, TaskOptions,
};
use crate::engine::pacing::{PacingConfig, RateScheduler};
use crate::engine::worker::{self, WorkerCommand, WorkerRequest};
use crate::infra::config::{OrchestratorConfig, SourcesConfig, StrategyKind};
use crate::sources::{RegistryError, SourceContract, SourceError, SourceRegistry};

/// How a batch is spread over execution units.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    /// One task at a time, in input order.
    Sequential,
    /// Each task in its own worker process, at most `workers` at once.
    ParallelIsolated { workers: usize },
    /// Tasks share this process, at most `max_in_flight` inside a source call.
    CooperativeBounded { max_in_flight: usize },
}

impl Strategy {
    pub fn from_config(config: &OrchestratorConfig) -> Self {
        match config.strategy {
            StrategyKind::Sequential => Strategy::Sequential,
            StrategyKind::Parallel => Strategy::ParallelIsolated {
                workers: config.workers.unwrap_or_else(default_workers),
            },
            StrategyKind::Cooperative => Strategy::CooperativeBounded {
                max_in_flight: config.max_in_flight,
            },
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Strategy::Sequential => write!(f, "sequential"),
            Strategy::ParallelIsolated { workers } => write!(f, "parallel ({workers} workers)"),
            Strategy::CooperativeBounded { max_in_flight } => {
                write!(f, "cooperative ({max_in_flight} in flight)")
            }
        }
    }
}

pub fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

/// Lifecycle of a task within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Pending,
    Dispatching,
    Succeeded,
    Failed,
    Reported,
}

/// What the parallel strategy needs to start workers.
#[derive(Debug, Clone)]
pub struct WorkerSetup {
    pub command: WorkerCommand,
    pub sources: SourcesConfig,
}

pub struct Orchestrator {
    registry: Arc<SourceRegistry>,
    pacing: PacingConfig,
    pacing_seed: Option<u64>,
    credentials: Option<String>,
    task_timeout: Duration,
    grace_period: Duration,
    worker: Option<WorkerSetup>,
}

impl Orchestrator {
    pub fn new(registry: Arc<SourceRegistry>, pacing: PacingConfig) -> Self {
        let defaults = OrchestratorConfig::default();
        Self {
            registry,
            pacing,
            pacing_seed: None,
            credentials: None,
            task_timeout: Duration::from_secs(defaults.task_timeout_secs),
            grace_period: Duration::from_secs(defaults.grace_period_secs),
            worker: None,
        }
    }

    pub fn with_credentials(mut self, credentials: Option<String>) -> Self {
        self.credentials = credentials;
        self
    }

    pub fn with_pacing_seed(mut self, seed: u64) -> Self {
        self.pacing_seed = Some(seed);
        self
    }

    pub fn with_task_timeout(mut self, timeout: Duration) -> Self {
        self.task_timeout = timeout;
        self
    }

    pub fn with_grace_period(mut self, grace: Duration) -> Self {
        self.grace_period = grace;
        self
    }

    /// Required for [`Strategy::ParallelIsolated`]. Without it every task of
    /// a parallel batch fails with [`ErrorKind::Configuration`], since the
    /// in-process registry cannot be carried into another process.
    pub fn with_worker(mut self, setup: WorkerSetup) -> Self {
        self.worker = Some(setup);
        self
    }

    /// Run every task and return one outcome per task.
    ///
    /// Outcomes come back in completion order; tasks that never finished
    /// because of `cancel` are appended last as [`ErrorKind::Cancelled`].
    pub async fn run(
        &self,
        tasks: Vec<CollectionTask>,
        strategy: Strategy,
        cancel: &CancellationToken,
    ) -> Vec<CollectionOutcome> {
        let total = tasks.len();
        tracing::info!(tasks = total, strategy = %strategy, "dispatching batch");

        let mut batch = Batch::new(tasks);
        let mut pacer = Pacer::new(self.scheduler(), total);

        match strategy {
            Strategy::Sequential => self.run_sequential(&mut batch, &mut pacer, cancel).await,
            Strategy::CooperativeBounded { max_in_flight } => {
                let registry = Arc::clone(&self.registry);
                let credentials = self.credentials.clone();
                let timeout = self.task_timeout;
                self.run_bounded(&mut batch, &mut pacer, max_in_flight, cancel, move |task| {
                    let registry = Arc::clone(&registry);
                    let credentials = credentials.clone();
                    async move { execute_task(&registry, &task, credentials.as_deref(), timeout).await }
                })
                .await
            }
            Strategy::ParallelIsolated { workers } => {
                let Some(setup) = self.worker.clone() else {
                    tracing::error!("parallel strategy requested without a worker command");
                    return batch.fail_all(
                        ErrorKind::Configuration,
                        "parallel strategy needs a worker command",
                    );
                };
                let credentials = self.credentials.clone();
                let timeout = self.task_timeout;
                self.run_bounded(&mut batch, &mut pacer, workers, cancel, move |task| {
                    let request = WorkerRequest {
                        task,
                        sources: setup.sources.clone(),
                        credentials: credentials.clone(),
                        task_timeout_secs: timeout.as_secs(),
                    };
                    let command = setup.command.clone();
                    // The parent's deadline is a little looser than the worker's own
                    async move { worker::run_isolated(&command, &request, timeout + WORKER_SLACK).await }
                })
                .await
            }
        }

        let outcomes = batch.finish();
        let succeeded = outcomes.iter().filter(|o| o.success).count();
        tracing::info!(
            tasks = total,
            succeeded,
            failed = total - succeeded,
            "batch finished"
        );
        outcomes
    }

    fn scheduler(&self) -> RateScheduler {
        match self.pacing_seed {
            Some(seed) => RateScheduler::seeded(self.pacing.clone(), seed),
            None => RateScheduler::new(self.pacing.clone()),
        }
    }

    async fn run_sequential(&self, batch: &mut Batch, pacer: &mut Pacer, cancel: &CancellationToken) {
        for index in 0..batch.len() {
            if !pacer.before_dispatch(index, cancel).await {
                break;
            }
            batch.dispatch(index);

            let task = batch.task(index).clone();
            let work = execute_task(
                &self.registry,
                &task,
                self.credentials.as_deref(),
                self.task_timeout,
            );
            tokio::pin!(work);

            let outcome = tokio::select! {
                outcome = &mut work => Some(outcome),
                _ = cancel.cancelled() => {
                    tracing::info!(task = %task.identity, grace = ?self.grace_period, "stop requested, letting current task finish");
                    tokio::time::timeout(self.grace_period, &mut work).await.ok()
                }
            };

            match outcome {
                Some(outcome) => batch.complete(index, outcome),
                None => {
                    tracing::warn!(task = %task.identity, "grace period expired, abandoning task");
                    break;
                }
            }
        }
    }

    /// Shared driver for the two concurrent strategies. `execute` turns a task
    /// into a self-contained future; at most `limit` of them run at once.
    async fn run_bounded<F, Fut>(
        &self,
        batch: &mut Batch,
        pacer: &mut Pacer,
        limit: usize,
        cancel: &CancellationToken,
        execute: F,
    ) where
        F: Fn(CollectionTask) -> Fut,
        Fut: Future<Output = CollectionOutcome> + Send + 'static,
    {
        let semaphore = Arc::new(Semaphore::new(limit.max(1)));
        let (tx, mut rx) = mpsc::unbounded_channel::<(usize, CollectionOutcome)>();
        let mut running = JoinSet::new();

        for index in 0..batch.len() {
            if !pacer.before_dispatch(index, cancel).await {
                break;
            }
            let permit = tokio::select! {
                permit = Arc::clone(&semaphore).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
                _ = cancel.cancelled() => break,
            };
            batch.dispatch(index);

            let work = execute(batch.task(index).clone());
            let tx = tx.clone();
            running.spawn(async move {
                let outcome = work.await;
                let _ = tx.send((index, outcome));
                drop(permit);
            });
        }
        drop(tx);

        let mut deadline = cancel
            .is_cancelled()
            .then(|| Instant::now() + self.grace_period);
        loop {
            let received = match deadline {
                Some(at) => match tokio::time::timeout_at(at, rx.recv()).await {
                    Ok(received) => received,
                    Err(_) => {
                        tracing::warn!(
                            in_flight = running.len(),
                            "grace period expired, terminating in-flight tasks"
                        );
                        break;
                    }
                },
                None => tokio::select! {
                    received = rx.recv() => received,
                    _ = cancel.cancelled() => {
                        tracing::info!(
                            in_flight = running.len(),
                            grace = ?self.grace_period,
                            "stop requested, waiting for in-flight tasks"
                        );
                        deadline = Some(Instant::now() + self.grace_period);
                        continue;
                    }
                },
            };
            match received {
                Some((index, outcome)) => batch.complete(index, outcome),
                None => break,
            }
        }

        running.shutdown().await;
        while let Ok((index, outcome)) = rx.try_recv() {
            batch.complete(index, outcome);
        }
    }
}

const WORKER_SLACK: Duration = Duration::from_secs(5);

struct Pacer {
    scheduler: RateScheduler,
    total: usize,
}

impl Pacer {
    fn new(scheduler: RateScheduler, total: usize) -> Self {
        Self { scheduler, total }
    }

    /// Wait out the pauses owed before dispatching `index`.
    /// Returns false if the run was cancelled meanwhile.
    async fn before_dispatch(&mut self, index: usize, cancel: &CancellationToken) -> bool {
        if let Some(delay) = self.scheduler.batch_delay(index, self.total) {
            tracing::info!(after = index, delay = ?delay, "batch pause");
            if !pause(delay, cancel).await {
                return false;
            }
        }
        if let Some(delay) = self.scheduler.task_delay(index) {
            tracing::debug!(index, delay = ?delay, "pacing");
            if !pause(delay, cancel).await {
                return false;
            }
        }
        !cancel.is_cancelled()
    }
}

async fn pause(delay: Duration, cancel: &CancellationToken) -> bool {
    if delay.is_zero() {
        return !cancel.is_cancelled();
    }
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(delay) => true,
    }
}

/// Per-run bookkeeping: one state and at most one outcome per task.
struct Batch {
    tasks: Vec<CollectionTask>,
    states: Vec<TaskState>,
    outcomes: Vec<Option<CollectionOutcome>>,
    completion_order: Vec<usize>,
}

impl Batch {
    fn new(tasks: Vec<CollectionTask>) -> Self {
        let n = tasks.len();
        Self {
            tasks,
            states: vec![TaskState::Pending; n],
            outcomes: vec![None; n],
            completion_order: Vec::with_capacity(n),
        }
    }

    fn len(&self) -> usize {
        self.tasks.len()
    }

    fn task(&self, index: usize) -> &CollectionTask {
        &self.tasks[index]
    }

    fn dispatch(&mut self, index: usize) {
        self.transition(index, TaskState::Dispatching);
    }

    fn complete(&mut self, index: usize, outcome: CollectionOutcome) {
        if self.outcomes[index].is_some() {
            return;
        }
        let state = if outcome.success {
            TaskState::Succeeded
        } else {
            TaskState::Failed
        };
        self.transition(index, state);
        if let Some(kind) = outcome.error_kind {
            tracing::warn!(
                task = %self.tasks[index].identity,
                kind = %kind,
                "task failed: {}",
                outcome.error_detail.as_deref().unwrap_or("")
            );
        }
        self.outcomes[index] = Some(outcome);
        self.completion_order.push(index);
    }

    fn transition(&mut self, index: usize, to: TaskState) {
        tracing::debug!(
            task = %self.tasks[index].identity,
            index,
            from = ?self.states[index],
            to = ?to,
            "task state"
        );
        self.states[index] = to;
    }

    fn fail_all(mut self, kind: ErrorKind, detail: &str) -> Vec<CollectionOutcome> {
        let now = Utc::now();
        for index in 0..self.len() {
            let outcome = CollectionOutcome::failed(&self.tasks[index], kind, detail, now);
            self.complete(index, outcome);
        }
        self.finish()
    }

    fn finish(mut self) -> Vec<CollectionOutcome> {
        let mut reported = Vec::with_capacity(self.len());
        let order = std::mem::take(&mut self.completion_order);
        for index in order {
            if let Some(outcome) = self.outcomes[index].take() {
                self.transition(index, TaskState::Reported);
                reported.push(outcome);
            }
        }

        let now = Utc::now();
        for index in 0..self.len() {
            if self.states[index] != TaskState::Reported {
                reported.push(CollectionOutcome::cancelled(&self.tasks[index], now));
                self.transition(index, TaskState::Reported);
            }
        }
        reported
    }
}

/// Run one task against a source from `registry`. Never panics and never
/// outlives `timeout`; every failure becomes a failed outcome.
pub async fn execute_task(
    registry: &SourceRegistry,
    task: &CollectionTask,
    credentials: Option<&str>,
    timeout: Duration,
) -> CollectionOutcome {
    let started_at = Utc::now();
    let work = AssertUnwindSafe(collect(registry, task, credentials, started_at)).catch_unwind();

    match tokio::time::timeout(timeout, work).await {
        Ok(Ok(outcome)) => outcome,
        Ok(Err(panic)) => CollectionOutcome::failed(
            task,
            ErrorKind::Permanent,
            format!("source panicked: {}", panic_message(panic.as_ref())),
            started_at,
        ),
        Err(_) => CollectionOutcome::failed(
            task,
            ErrorKind::Transient,
            format!("timed out after {timeout:?}"),
            started_at,
        ),
    }
}

async fn collect(
    registry: &SourceRegistry,
    task: &CollectionTask,
    credentials: Option<&str>,
    started_at: DateTime<Utc>,
) -> CollectionOutcome {
    let options = match task.options() {
        Ok(options) => options,
        Err(e) => {
            return CollectionOutcome::failed(task, ErrorKind::Configuration, e.to_string(), started_at)
        }
    };

    let source = match registry.create(&task.identity.source_type, &task.identity, credentials) {
        Ok(source) => source,
        Err(e @ RegistryError::UnknownSourceType(_)) => {
            return CollectionOutcome::failed(task, ErrorKind::Permanent, e.to_string(), started_at)
        }
        Err(RegistryError::Construction { source, .. }) => {
            return CollectionOutcome::failed(task, source.kind.into(), source.message, started_at)
        }
    };

    match gather(source.as_ref(), task, &options).await {
        Ok((summary, items, ephemeral)) => {
            tracing::debug!(
                task = %task.identity,
                items = items.len(),
                ephemeral = ephemeral.len(),
                "task collected"
            );
            CollectionOutcome::succeeded(task, started_at, summary, items, ephemeral)
        }
        Err(e) => CollectionOutcome::failed(task, e.kind.into(), e.message, started_at),
    }
}

type Gathered = (IdentitySummary, Vec<NormalizedRecord>, Vec<NormalizedRecord>);

async fn gather(
    source: &dyn SourceContract,
    task: &CollectionTask,
    options: &TaskOptions,
) -> Result<Gathered, SourceError> {
    let identity = &task.identity;
    let window = task.time_window.as_ref();

    let summary = source.fetch_identity_summary(identity).await?;
    let mut items = source
        .fetch_items(identity, options.limit, &task.parameters, window)
        .await?;

    if let Some(window) = window {
        if !source.filters_by_time() {
            let fetched = items.len();
            items.retain(|item| item.published_at.is_some_and(|at| window.contains(at)));
            if items.len() < fetched {
                tracing::debug!(
                    task = %identity,
                    window = %window,
                    dropped = fetched - items.len(),
                    "items outside window dropped"
                );
            }
        }
    }

    // Ephemeral items only make sense for the current state of an account
    let mut ephemeral = if options.include_ephemeral && task.execution_mode == ExecutionMode::Profile {
        source
            .fetch_ephemeral_items(identity, options.ephemeral_limit)
            .await?
    } else {
        Vec::new()
    };

    if options.attach_media {
        for record in items.iter_mut().chain(ephemeral.iter_mut()) {
            if let Err(e) = source.attach_media(record).await {
                tracing::warn!(task = %identity, record = %record.record_id, "media not attached: {}", e);
            }
        }
    }

    Ok((summary, items, ephemeral))
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{SourceIdentity, TaskParameters, TimeWindow};
    use async_trait::async_trait;
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Behaviour is picked by handle: `ok-<n>`, `gone`, `flaky`, `panic`, `slow`, `dated`.
    struct ScriptedSource {
        in_flight: Arc<AtomicUsize>,
        peak: Arc<AtomicUsize>,
        work: Duration,
    }

    #[async_trait]
    impl SourceContract for ScriptedSource {
        fn source_type(&self) -> &str {
            "scripted"
        }

        async fn fetch_identity_summary(
            &self,
            identity: &SourceIdentity,
        ) -> Result<IdentitySummary, SourceError> {
            match identity.handle.as_str() {
                "gone" => Err(SourceError::permanent("no such account")),
                "flaky" => Err(SourceError::transient("connection reset")),
                "panic" => panic!("scripted panic"),
                handle => Ok(IdentitySummary::new(handle, handle)),
            }
        }

        async fn fetch_items(
            &self,
            identity: &SourceIdentity,
            _limit: usize,
            _params: &TaskParameters,
            _window: Option<&TimeWindow>,
        ) -> Result<Vec<NormalizedRecord>, SourceError> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            let wait = if identity.handle == "slow" {
                Duration::from_secs(3600)
            } else {
                self.work
            };
            if !wait.is_zero() {
                tokio::time::sleep(wait).await;
            }
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            if identity.handle == "dated" {
                return Ok((1..=5)
                    .map(|day| {
                        NormalizedRecord::new("scripted", format!("d{day}"), "post").with_published_at(
                            Utc.with_ymd_and_hms(2024, 1, day, 12, 0, 0).unwrap(),
                        )
                    })
                    .chain(std::iter::once(NormalizedRecord::new("scripted", "undated", "post")))
                    .collect());
            }

            let count = identity
                .handle
                .strip_prefix("ok-")
                .and_then(|n| n.parse().ok())
                .unwrap_or(1);
            Ok((0..count)
                .map(|i| NormalizedRecord::new("scripted", format!("{}-{i}", identity.handle), "post"))
                .collect())
        }

        async fn fetch_ephemeral_items(
            &self,
            identity: &SourceIdentity,
            _limit: Option<usize>,
        ) -> Result<Vec<NormalizedRecord>, SourceError> {
            Ok(vec![NormalizedRecord::new(
                "scripted",
                format!("{}-story", identity.handle),
                "story",
            )])
        }
    }

    struct Harness {
        registry: Arc<SourceRegistry>,
        peak: Arc<AtomicUsize>,
    }

    fn harness(work: Duration) -> Harness {
        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let mut registry = SourceRegistry::new();
        let (i, p) = (Arc::clone(&in_flight), Arc::clone(&peak));
        registry.register("scripted", move |_, _| {
            Ok(Box::new(ScriptedSource {
                in_flight: Arc::clone(&i),
                peak: Arc::clone(&p),
                work,
            }) as Box<dyn SourceContract>)
        });
        Harness {
            registry: Arc::new(registry),
            peak,
        }
    }

    fn tasks(handles: &[&str]) -> Vec<CollectionTask> {
        handles
            .iter()
            .map(|h| CollectionTask::new(SourceIdentity::new("scripted", *h)))
            .collect()
    }

    fn orchestrator(h: &Harness) -> Orchestrator {
        Orchestrator::new(Arc::clone(&h.registry), PacingConfig::none())
    }

    #[tokio::test]
    async fn sequential_isolates_failures_and_keeps_order() {
        let h = harness(Duration::ZERO);
        let outcomes = orchestrator(&h)
            .run(
                tasks(&["ok-2", "gone", "flaky", "ok-3"]),
                Strategy::Sequential,
                &CancellationToken::new(),
            )
            .await;

        let handles: Vec<&str> = outcomes.iter().map(|o| o.identity.handle.as_str()).collect();
        assert_eq!(handles, vec!["ok-2", "gone", "flaky", "ok-3"]);

        assert!(outcomes[0].success);
        assert_eq!(outcomes[0].items.len(), 2);
        assert_eq!(outcomes[0].ephemeral_items.len(), 1);
        assert_eq!(outcomes[1].error_kind, Some(ErrorKind::Permanent));
        assert_eq!(outcomes[2].error_kind, Some(ErrorKind::Transient));
        assert!(outcomes[3].success);
        assert_eq!(outcomes[3].items.len(), 3);
    }

    #[tokio::test]
    async fn empty_batch_is_fine() {
        let h = harness(Duration::ZERO);
        let outcomes = orchestrator(&h)
            .run(Vec::new(), Strategy::CooperativeBounded { max_in_flight: 3 }, &CancellationToken::new())
            .await;
        assert!(outcomes.is_empty());
    }

    #[tokio::test]
    async fn parallel_without_worker_command_is_a_configuration_error() {
        let h = harness(Duration::ZERO);
        let outcomes = orchestrator(&h)
            .run(
                tasks(&["ok-1", "ok-2"]),
                Strategy::ParallelIsolated { workers: 2 },
                &CancellationToken::new(),
            )
            .await;

        assert_eq!(outcomes.len(), 2);
        assert!(outcomes
            .iter()
            .all(|o| o.error_kind == Some(ErrorKind::Configuration)));
        assert_eq!(h.peak.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn unknown_source_type_is_permanent() {
        let h = harness(Duration::ZERO);
        let task = CollectionTask::new(SourceIdentity::new("myspace", "tom"));
        let outcomes = orchestrator(&h)
            .run(vec![task], Strategy::Sequential, &CancellationToken::new())
            .await;
        assert_eq!(outcomes[0].error_kind, Some(ErrorKind::Permanent));
        assert!(outcomes[0].error_detail.as_deref().unwrap().contains("myspace"));
    }

    #[tokio::test]
    async fn bad_parameters_are_a_configuration_error() {
        let h = harness(Duration::ZERO);
        let task = CollectionTask::new(SourceIdentity::new("scripted", "ok-1"))
            .with_parameter(TaskOptions::LIMIT, serde_json::json!("lots"));
        let outcomes = orchestrator(&h)
            .run(vec![task], Strategy::Sequential, &CancellationToken::new())
            .await;
        assert_eq!(outcomes[0].error_kind, Some(ErrorKind::Configuration));
    }

    #[tokio::test]
    async fn panicking_source_yields_one_outcome() {
        let h = harness(Duration::ZERO);
        let outcomes = orchestrator(&h)
            .run(
                tasks(&["ok-1", "panic", "ok-1"]),
                Strategy::CooperativeBounded { max_in_flight: 2 },
                &CancellationToken::new(),
            )
            .await;

        assert_eq!(outcomes.len(), 3);
        let panicked: Vec<_> = outcomes.iter().filter(|o| o.identity.handle == "panic").collect();
        assert_eq!(panicked.len(), 1);
        assert_eq!(panicked[0].error_kind, Some(ErrorKind::Permanent));
        assert_eq!(outcomes.iter().filter(|o| o.success).count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn cooperative_respects_in_flight_bound() {
        let h = harness(Duration::from_millis(50));
        let outcomes = orchestrator(&h)
            .run(
                tasks(&["ok-1"; 8]),
                Strategy::CooperativeBounded { max_in_flight: 2 },
                &CancellationToken::new(),
            )
            .await;

        assert_eq!(outcomes.len(), 8);
        assert!(outcomes.iter().all(|o| o.success));
        assert_eq!(h.peak.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn pacing_spaces_dispatches() {
        let h = harness(Duration::ZERO);
        let pacing = PacingConfig::fixed(Duration::from_secs(1), 10, Duration::from_secs(100));
        let orchestrator = Orchestrator::new(Arc::clone(&h.registry), pacing);

        let started = Instant::now();
        let outcomes = orchestrator
            .run(tasks(&["ok-1"; 12]), Strategy::Sequential, &CancellationToken::new())
            .await;
        let elapsed = started.elapsed();

        assert_eq!(outcomes.len(), 12);
        // 11 task delays plus one batch pause after the tenth task
        assert!(elapsed >= Duration::from_secs(111), "elapsed {elapsed:?}");
        assert!(elapsed < Duration::from_secs(112), "elapsed {elapsed:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn slow_task_times_out_as_transient() {
        let h = harness(Duration::ZERO);
        let outcomes = orchestrator(&h)
            .with_task_timeout(Duration::from_secs(5))
            .run(tasks(&["slow", "ok-1"]), Strategy::Sequential, &CancellationToken::new())
            .await;

        assert_eq!(outcomes[0].error_kind, Some(ErrorKind::Transient));
        assert!(outcomes[1].success);
    }

    #[tokio::test]
    async fn cancelled_before_start_reports_every_task() {
        let h = harness(Duration::ZERO);
        let cancel = CancellationToken::new();
        cancel.cancel();

        for strategy in [
            Strategy::Sequential,
            Strategy::CooperativeBounded { max_in_flight: 2 },
        ] {
            let outcomes = orchestrator(&h).run(tasks(&["ok-1"; 4]), strategy, &cancel).await;
            assert_eq!(outcomes.len(), 4);
            assert!(outcomes
                .iter()
                .all(|o| o.error_kind == Some(ErrorKind::Cancelled)));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_stops_dispatching() {
        let h = harness(Duration::ZERO);
        let pacing = PacingConfig::fixed(Duration::from_secs(10), 0, Duration::ZERO);
        let orchestrator = Orchestrator::new(Arc::clone(&h.registry), pacing);

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(15)).await;
            trigger.cancel();
        });

        let outcomes = orchestrator
            .run(tasks(&["ok-1"; 5]), Strategy::Sequential, &cancel)
            .await;

        assert_eq!(outcomes.len(), 5);
        assert_eq!(outcomes.iter().filter(|o| o.success).count(), 2);
        assert_eq!(
            outcomes
                .iter()
                .filter(|o| o.error_kind == Some(ErrorKind::Cancelled))
                .count(),
            3
        );
    }

    #[tokio::test(start_paused = true)]
    async fn in_flight_tasks_are_abandoned_after_grace() {
        let h = harness(Duration::ZERO);
        let orchestrator = orchestrator(&h).with_grace_period(Duration::from_secs(2));

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(5)).await;
            trigger.cancel();
        });

        let started = Instant::now();
        let outcomes = orchestrator
            .run(
                tasks(&["ok-1", "slow", "slow", "ok-1"]),
                Strategy::CooperativeBounded { max_in_flight: 4 },
                &cancel,
            )
            .await;

        assert!(started.elapsed() < Duration::from_secs(60));
        assert_eq!(outcomes.len(), 4);
        let cancelled: Vec<_> = outcomes
            .iter()
            .filter(|o| o.error_kind == Some(ErrorKind::Cancelled))
            .map(|o| o.identity.handle.as_str())
            .collect();
        assert_eq!(cancelled, vec!["slow", "slow"]);
    }

    #[tokio::test]
    async fn windowed_items_are_filtered_when_source_does_not() {
        let h = harness(Duration::ZERO);
        let window = TimeWindow::new(
            Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 0).unwrap(),
            Utc.with_ymd_and_hms(2024, 1, 4, 0, 0, 0).unwrap(),
        )
        .unwrap();
        let task = CollectionTask::new(SourceIdentity::new("scripted", "dated")).with_window(window);

        let outcomes = orchestrator(&h)
            .run(vec![task], Strategy::Sequential, &CancellationToken::new())
            .await;

        let ids: Vec<&str> = outcomes[0].items.iter().map(|r| r.record_id.as_str()).collect();
        assert_eq!(ids, vec!["d2", "d3"]);
        // Backfill windows skip ephemeral items
        assert!(outcomes[0].ephemeral_items.is_empty());
    }

    #[test]
    fn strategy_from_config() {
        let mut config = OrchestratorConfig::default();
        assert_eq!(Strategy::from_config(&config), Strategy::Sequential);

        config.strategy = StrategyKind::Parallel;
        config.workers = Some(3);
        assert_eq!(
            Strategy::from_config(&config),
            Strategy::ParallelIsolated { workers: 3 }
        );

        config.strategy = StrategyKind::Cooperative;
        config.max_in_flight = 7;
        assert_eq!(
            Strategy::from_config(&config),
            Strategy::CooperativeBounded { max_in_flight: 7 }
        );
    }
}
