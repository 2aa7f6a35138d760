//! Turns account lists and backfill requests into concrete tasks.

use chrono::{DateTime, Utc};
use rand::seq::SliceRandom;
use rand::Rng;
use std::collections::BTreeMap;
use thiserror::Error;

use crate::domain::task::ParameterError;
use crate::domain::{
    CollectionOutcome, CollectionTask, ErrorKind, SourceIdentity, TaskOptions, TaskParameters,
};
use crate::engine::windows::{split, SplitError, SplitUnit};
use crate::infra::config::PlatformSettings;

/// Why a spec could not be turned into tasks.
#[derive(Debug, Error)]
pub enum PlanError {
    #[error(transparent)]
    Parameter(#[from] ParameterError),

    #[error(transparent)]
    Split(#[from] SplitError),

    #[error("empty range {start} .. {end}")]
    EmptyRange {
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    },
}

/// A historical range to cover, one task per window.
#[derive(Debug, Clone, PartialEq)]
pub struct RangeSpec {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub unit: SplitUnit,
    pub step: u32,
}

/// What the caller wants collected for one account.
#[derive(Debug, Clone)]
pub struct TaskSpec {
    pub identity: SourceIdentity,
    pub parameters: TaskParameters,
    pub range: Option<RangeSpec>,
}

impl TaskSpec {
    pub fn new(identity: SourceIdentity) -> Self {
        Self {
            identity,
            parameters: TaskParameters::new(),
            range: None,
        }
    }

    pub fn with_parameters(mut self, parameters: TaskParameters) -> Self {
        self.parameters = parameters;
        self
    }

    pub fn with_range(mut self, range: RangeSpec) -> Self {
        self.range = Some(range);
        self
    }
}

#[derive(Debug, Default)]
pub struct Plan {
    pub tasks: Vec<CollectionTask>,
    /// Specs that could not become tasks, already resolved as failures.
    pub rejected: Vec<CollectionOutcome>,
}

impl Plan {
    pub fn shuffle<R: Rng + ?Sized>(&mut self, rng: &mut R) {
        self.tasks.shuffle(rng);
    }
}

/// Expand specs into tasks, filling in per-platform defaults for options the
/// caller left unset.
pub fn plan(specs: Vec<TaskSpec>, platforms: &BTreeMap<String, PlatformSettings>) -> Plan {
    let mut plan = Plan::default();

    for spec in specs {
        let settings = platforms
            .get(&spec.identity.source_type)
            .cloned()
            .unwrap_or_default();
        let parameters = with_platform_defaults(spec.parameters, &settings);
        let base = CollectionTask::new(spec.identity).with_parameters(parameters);

        if let Err(e) = base.options() {
            plan.rejected.push(reject(&base, e.into()));
            continue;
        }

        let Some(range) = spec.range else {
            plan.tasks.push(base);
            continue;
        };

        match split(range.start, range.end, range.unit, range.step) {
            Ok(windows) if windows.is_empty() => {
                let err = PlanError::EmptyRange {
                    start: range.start,
                    end: range.end,
                };
                plan.rejected.push(reject(&base, err));
            }
            Ok(windows) => {
                tracing::debug!(
                    identity = %base.identity,
                    windows = windows.len(),
                    unit = %range.unit,
                    step = range.step,
                    "range split"
                );
                plan.tasks
                    .extend(windows.into_iter().map(|w| base.clone().with_window(w)));
            }
            Err(e) => plan.rejected.push(reject(&base, e.into())),
        }
    }

    plan
}

fn with_platform_defaults(mut parameters: TaskParameters, settings: &PlatformSettings) -> TaskParameters {
    parameters
        .entry(TaskOptions::LIMIT.to_string())
        .or_insert_with(|| settings.post_limit.into());
    if let Some(limit) = settings.story_limit {
        parameters
            .entry(TaskOptions::EPHEMERAL_LIMIT.to_string())
            .or_insert_with(|| limit.into());
    }
    parameters
        .entry(TaskOptions::ATTACH_MEDIA.to_string())
        .or_insert_with(|| settings.download_media.into());
    parameters
}

fn reject(task: &CollectionTask, err: PlanError) -> CollectionOutcome {
    tracing::warn!(identity = %task.identity, "task rejected: {}", err);
    CollectionOutcome::failed(task, ErrorKind::Configuration, err.to_string(), Utc::now())
}
