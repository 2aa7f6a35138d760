//! Collection engine: planning, pacing, orchestration and persistence.

pub mod orchestrator;
pub mod pacing;
pub mod persistence;
pub mod planner;
pub mod runner;
pub mod windows;
pub mod worker;

pub use orchestrator::{execute_task, Orchestrator, Strategy, TaskState, WorkerSetup};
pub use pacing::{PacingConfig, RateScheduler};
pub use persistence::{DiffPersistenceEngine, MemorySink, RecordSink, RunHistoryEntry, SinkError};
pub use planner::{plan, Plan, PlanError, RangeSpec, TaskSpec};
pub use runner::{ExitStatus, RunError, RunReport, Runner, TaskSummary};
pub use windows::{parse_date, split, SplitError, SplitUnit};
pub use worker::{WorkerCommand, WorkerRequest};
