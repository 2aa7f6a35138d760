use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::AddAssign;

use super::records::{IdentitySummary, NormalizedRecord};
use super::task::{CollectionTask, SourceIdentity, TimeWindow};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorKind {
    /// Network or throttling trouble. A later run may succeed.
    Transient,
    /// Unknown or invalid identity. Retrying will not help.
    Permanent,
    /// Bad task parameters or a malformed window.
    Configuration,
    /// Not completed before the run was stopped.
    Cancelled,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Transient => "transient",
            Self::Permanent => "permanent",
            Self::Configuration => "configuration",
            Self::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

/// Result of executing one task. Immutable once built.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectionOutcome {
    pub identity: SourceIdentity,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_window: Option<TimeWindow>,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<IdentitySummary>,
    #[serde(default)]
    pub items: Vec<NormalizedRecord>,
    #[serde(default)]
    pub ephemeral_items: Vec<NormalizedRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_detail: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl CollectionOutcome {
    pub fn succeeded(
        task: &CollectionTask,
        started_at: DateTime<Utc>,
        summary: IdentitySummary,
        items: Vec<NormalizedRecord>,
        ephemeral_items: Vec<NormalizedRecord>,
    ) -> Self {
        Self {
            identity: task.identity.clone(),
            time_window: task.time_window,
            success: true,
            summary: Some(summary),
            items,
            ephemeral_items,
            error_kind: None,
            error_detail: None,
            started_at,
            finished_at: Utc::now(),
        }
    }

    /// A failed outcome never carries items, even when some were received.
    pub fn failed(
        task: &CollectionTask,
        kind: ErrorKind,
        detail: impl Into<String>,
        started_at: DateTime<Utc>,
    ) -> Self {
        Self {
            identity: task.identity.clone(),
            time_window: task.time_window,
            success: false,
            summary: None,
            items: Vec::new(),
            ephemeral_items: Vec::new(),
            error_kind: Some(kind),
            error_detail: Some(detail.into()),
            started_at,
            finished_at: Utc::now(),
        }
    }

    pub fn cancelled(task: &CollectionTask, started_at: DateTime<Utc>) -> Self {
        Self::failed(
            task,
            ErrorKind::Cancelled,
            "run stopped before the task completed",
            started_at,
        )
    }

    pub fn duration(&self) -> chrono::Duration {
        self.finished_at - self.started_at
    }

    pub fn record_count(&self) -> usize {
        self.items.len() + self.ephemeral_items.len()
    }
}

/// Created/updated/unchanged tallies from one or more persist calls.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffReport {
    pub created: usize,
    pub updated: usize,
    pub unchanged: usize,
}

impl DiffReport {
    pub fn total(&self) -> usize {
        self.created + self.updated + self.unchanged
    }

    pub fn merge(&mut self, other: DiffReport) {
        *self += other;
    }
}

impl AddAssign for DiffReport {
    fn add_assign(&mut self, rhs: Self) {
        self.created += rhs.created;
        self.updated += rhs.updated;
        self.unchanged += rhs.unchanged;
    }
}

impl fmt::Display for DiffReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} created, {} updated, {} unchanged",
            self.created, self.updated, self.unchanged
        )
    }
}
