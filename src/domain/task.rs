use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

/// Free-form options passed from the caller to the source.
pub type TaskParameters = BTreeMap<String, serde_json::Value>;

/// One external account or topic on one platform.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SourceIdentity {
    pub source_type: String,
    pub handle: String,
}

impl SourceIdentity {
    pub fn new(source_type: impl Into<String>, handle: impl Into<String>) -> Self {
        Self {
            source_type: source_type.into().to_lowercase(),
            handle: handle.into(),
        }
    }
}

impl fmt::Display for SourceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.source_type, self.handle)
    }
}

/// Half-open interval `[start, end)`. Never empty.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawWindow")]
pub struct TimeWindow {
    start: DateTime<Utc>,
    end: DateTime<Utc>,
}

#[derive(Deserialize)]
struct RawWindow {
    start: DateTime<Utc>,
    end: DateTime<Utc>,
}

impl TryFrom<RawWindow> for TimeWindow {
    type Error = String;

    fn try_from(raw: RawWindow) -> Result<Self, Self::Error> {
        TimeWindow::new(raw.start, raw.end)
            .ok_or_else(|| format!("window start {} is not before end {}", raw.start, raw.end))
    }
}

impl TimeWindow {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Option<Self> {
        (start < end).then_some(Self { start, end })
    }

    pub fn start(&self) -> DateTime<Utc> {
        self.start
    }

    pub fn end(&self) -> DateTime<Utc> {
        self.end
    }

    pub fn contains(&self, ts: DateTime<Utc>) -> bool {
        self.start <= ts && ts < self.end
    }
}

impl fmt::Display for TimeWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}, {})",
            self.start.format("%Y-%m-%d %H:%M"),
            self.end.format("%Y-%m-%d %H:%M")
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    /// Regular collection of an account's latest activity.
    #[default]
    Profile,
    /// One window of a historical range.
    Backfill,
}

/// A single unit of work. Consumed exactly once by the orchestrator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectionTask {
    pub identity: SourceIdentity,
    #[serde(default)]
    pub parameters: TaskParameters,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_window: Option<TimeWindow>,
    #[serde(default)]
    pub execution_mode: ExecutionMode,
}

impl CollectionTask {
    pub fn new(identity: SourceIdentity) -> Self {
        Self {
            identity,
            parameters: TaskParameters::new(),
            time_window: None,
            execution_mode: ExecutionMode::Profile,
        }
    }

    pub fn with_parameter(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.parameters.insert(key.into(), value);
        self
    }

    pub fn with_parameters(mut self, parameters: TaskParameters) -> Self {
        self.parameters = parameters;
        self
    }

    pub fn with_window(mut self, window: TimeWindow) -> Self {
        self.time_window = Some(window);
        self.execution_mode = ExecutionMode::Backfill;
        self
    }

    pub fn options(&self) -> Result<TaskOptions, ParameterError> {
        TaskOptions::from_parameters(&self.parameters)
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum ParameterError {
    #[error("parameter `{name}` must be {expected}")]
    WrongType {
        name: &'static str,
        expected: &'static str,
    },
}

/// Options the orchestrator itself understands. Everything else in the
/// parameter map is only meaningful to the source.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskOptions {
    pub limit: usize,
    pub ephemeral_limit: Option<usize>,
    pub include_ephemeral: bool,
    pub attach_media: bool,
}

impl Default for TaskOptions {
    fn default() -> Self {
        Self {
            limit: Self::DEFAULT_LIMIT,
            ephemeral_limit: None,
            include_ephemeral: true,
            attach_media: false,
        }
    }
}

impl TaskOptions {
    pub const DEFAULT_LIMIT: usize = 50;

    pub const LIMIT: &'static str = "limit";
    pub const EPHEMERAL_LIMIT: &'static str = "ephemeral_limit";
    pub const INCLUDE_EPHEMERAL: &'static str = "include_ephemeral";
    pub const ATTACH_MEDIA: &'static str = "attach_media";

    pub fn from_parameters(params: &TaskParameters) -> Result<Self, ParameterError> {
        let defaults = Self::default();

        let limit = match params.get(Self::LIMIT) {
            None | Some(serde_json::Value::Null) => defaults.limit,
            Some(v) => v.as_u64().ok_or(ParameterError::WrongType {
                name: Self::LIMIT,
                expected: "a non-negative integer",
            })? as usize,
        };

        let ephemeral_limit = match params.get(Self::EPHEMERAL_LIMIT) {
            None | Some(serde_json::Value::Null) => None,
            Some(v) => Some(v.as_u64().ok_or(ParameterError::WrongType {
                name: Self::EPHEMERAL_LIMIT,
                expected: "a non-negative integer",
            })? as usize),
        };

        let include_ephemeral = flag(params, Self::INCLUDE_EPHEMERAL, defaults.include_ephemeral)?;
        let attach_media = flag(params, Self::ATTACH_MEDIA, defaults.attach_media)?;

        Ok(Self {
            limit,
            ephemeral_limit,
            // A zero limit means the caller doesn't want ephemeral items at all
            include_ephemeral: include_ephemeral && ephemeral_limit != Some(0),
            attach_media,
        })
    }
}

fn flag(params: &TaskParameters, name: &'static str, default: bool) -> Result<bool, ParameterError> {
    match params.get(name) {
        None | Some(serde_json::Value::Null) => Ok(default),
        Some(v) => v.as_bool().ok_or(ParameterError::WrongType {
            name,
            expected: "a boolean",
        }),
    }
}
