//! Harvester
//!
//! Collects accounts from social platforms through pluggable sources,
//! paces requests to stay under platform throttling, and persists records
//! incrementally, reporting what was created, updated or left unchanged.

pub mod cli;
pub mod domain;
pub mod engine;
pub mod infra;
pub mod sources;

pub use domain::{CollectionOutcome, CollectionTask, DiffReport, ErrorKind, SourceIdentity, TimeWindow};
pub use engine::{Orchestrator, Runner, Strategy};
pub use sources::{SourceContract, SourceRegistry};
