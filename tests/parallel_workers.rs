mod common;

use pretty_assertions::assert_eq;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use common::Workspace;
use harvester::domain::{CollectionTask, ErrorKind, SourceIdentity};
use harvester::engine::{Orchestrator, PacingConfig, Strategy, WorkerCommand, WorkerSetup};
use harvester::sources::builtin_registry;

fn tasks(handles: &[&str]) -> Vec<CollectionTask> {
    handles
        .iter()
        .map(|h| CollectionTask::new(SourceIdentity::new("instagram", *h)))
        .collect()
}

fn orchestrator(ws: &Workspace, command: WorkerCommand) -> Orchestrator {
    let sources = ws.sources();
    Orchestrator::new(Arc::new(builtin_registry(&sources)), PacingConfig::none())
        .with_task_timeout(Duration::from_secs(30))
        .with_worker(WorkerSetup { command, sources })
}

fn binary() -> WorkerCommand {
    WorkerCommand::new(env!("CARGO_BIN_EXE_harvester"), ["worker"])
}

#[tokio::test]
async fn worker_processes_report_one_outcome_per_task() {
    let ws = Workspace::new();
    let outcomes = orchestrator(&ws, binary())
        .run(
            tasks(&["nasa", "esa", "ghost", "broken", "nasa"]),
            Strategy::ParallelIsolated { workers: 2 },
            &CancellationToken::new(),
        )
        .await;

    assert_eq!(outcomes.len(), 5);

    let kind_of = |handle: &str| -> Vec<Option<ErrorKind>> {
        outcomes
            .iter()
            .filter(|o| o.identity.handle == handle)
            .map(|o| o.error_kind)
            .collect()
    };
    assert_eq!(kind_of("nasa"), vec![None, None]);
    assert_eq!(kind_of("esa"), vec![None]);
    assert_eq!(kind_of("ghost"), vec![Some(ErrorKind::Permanent)]);
    assert_eq!(kind_of("broken"), vec![Some(ErrorKind::Transient)]);

    let nasa = outcomes.iter().find(|o| o.identity.handle == "nasa").unwrap();
    assert_eq!(nasa.items.len(), 3);
    assert_eq!(nasa.ephemeral_items.len(), 1);
    assert_eq!(nasa.summary.as_ref().unwrap().display_name.as_deref(), Some("NASA"));
}

#[cfg(unix)]
#[tokio::test]
async fn crashing_worker_does_not_take_down_siblings() {
    let ws = Workspace::new();
    let script = r#"read -r line; case "$line" in *'"handle":"crash"'*) kill -9 $$ ;; esac; printf '%s' "$line" | "$0" worker"#;
    let command = WorkerCommand::new("sh", ["-c", script, env!("CARGO_BIN_EXE_harvester")]);

    let outcomes = orchestrator(&ws, command)
        .run(
            tasks(&["nasa", "crash", "esa"]),
            Strategy::ParallelIsolated { workers: 3 },
            &CancellationToken::new(),
        )
        .await;

    assert_eq!(outcomes.len(), 3);
    for outcome in &outcomes {
        if outcome.identity.handle == "crash" {
            assert_eq!(outcome.error_kind, Some(ErrorKind::Transient));
        } else {
            assert!(outcome.success, "{:?}", outcome.error_detail);
        }
    }
}

#[cfg(unix)]
#[tokio::test]
async fn cancellation_kills_hung_workers_after_grace() {
    let ws = Workspace::new();
    let command = WorkerCommand::new("sh", ["-c", "cat > /dev/null; sleep 60"]);
    let orchestrator = orchestrator(&ws, command).with_grace_period(Duration::from_millis(200));

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(300)).await;
        trigger.cancel();
    });

    let started = std::time::Instant::now();
    let outcomes = orchestrator
        .run(
            tasks(&["nasa", "esa", "nasa", "esa"]),
            Strategy::ParallelIsolated { workers: 2 },
            &cancel,
        )
        .await;

    assert!(started.elapsed() < Duration::from_secs(20));
    assert_eq!(outcomes.len(), 4);
    assert!(outcomes
        .iter()
        .all(|o| o.error_kind == Some(ErrorKind::Cancelled)));
}
