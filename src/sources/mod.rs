//! Source layer
//!
//! Every platform plugs in through [`SourceContract`]. Sources are created on
//! demand by a [`SourceRegistry`] and own no state shared between tasks.

pub mod payload;
pub mod registry;
pub mod remote;
pub mod replay;

use async_trait::async_trait;
use std::fmt;
use thiserror::Error;

use crate::domain::{
    ErrorKind, IdentitySummary, NormalizedRecord, SourceIdentity, TaskParameters, TimeWindow,
};

pub use registry::{builtin_registry, RegistryError, SourceFactory, SourceRegistry};
pub use remote::RemoteSource;
pub use replay::ReplaySource;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceErrorKind {
    Transient,
    Permanent,
}

/// Failure reported by a source call.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{kind} source error: {message}")]
pub struct SourceError {
    pub kind: SourceErrorKind,
    pub message: String,
}

impl SourceError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            kind: SourceErrorKind::Transient,
            message: message.into(),
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            kind: SourceErrorKind::Permanent,
            message: message.into(),
        }
    }

    pub fn is_transient(&self) -> bool {
        self.kind == SourceErrorKind::Transient
    }
}

impl fmt::Display for SourceErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transient => f.write_str("transient"),
            Self::Permanent => f.write_str("permanent"),
        }
    }
}

impl From<SourceErrorKind> for ErrorKind {
    fn from(kind: SourceErrorKind) -> Self {
        match kind {
            SourceErrorKind::Transient => ErrorKind::Transient,
            SourceErrorKind::Permanent => ErrorKind::Permanent,
        }
    }
}

/// Capabilities every platform source provides.
///
/// Each call may block for the duration of a remote operation. Sources never
/// retry on their own; transient failures are left to a later run.
#[async_trait]
pub trait SourceContract: Send + Sync {
    /// Registry key this source was built for (e.g. "instagram").
    fn source_type(&self) -> &str;

    /// Fetch profile-level information for the identity.
    async fn fetch_identity_summary(
        &self,
        identity: &SourceIdentity,
    ) -> Result<IdentitySummary, SourceError>;

    /// Fetch up to `limit` regular items, optionally restricted to `window`.
    async fn fetch_items(
        &self,
        identity: &SourceIdentity,
        limit: usize,
        params: &TaskParameters,
        window: Option<&TimeWindow>,
    ) -> Result<Vec<NormalizedRecord>, SourceError>;

    /// Fetch short-lived items (stories). `None` means no limit.
    async fn fetch_ephemeral_items(
        &self,
        _identity: &SourceIdentity,
        _limit: Option<usize>,
    ) -> Result<Vec<NormalizedRecord>, SourceError> {
        Ok(Vec::new())
    }

    /// Fetch media for the record and note where it went in its fields.
    /// Returns whether anything was attached.
    async fn attach_media(&self, _record: &mut NormalizedRecord) -> Result<bool, SourceError> {
        Ok(false)
    }

    /// Whether `fetch_items` honours the window itself. When it doesn't, the
    /// orchestrator filters on `published_at` afterwards.
    fn filters_by_time(&self) -> bool {
        false
    }
}
