//! Payload shape shared by the bundled sources.
//!
//! ```json
//! {
//!   "profile": { "id": "17841", "handle": "nasa", "display_name": "NASA", ... },
//!   "items": [ { "id": "3301", "kind": "post", "published_at": "2024-03-01T10:00:00Z", ... } ],
//!   "ephemeral": [ ... ]
//! }
//! ```
//!
//! Anything besides the well-known keys is kept verbatim as record fields.

use chrono::{DateTime, TimeZone, Utc};
use serde::Deserialize;
use serde_json::{Map, Value};

use crate::domain::{Fields, IdentitySummary, NormalizedRecord, SourceIdentity};

use super::SourceError;

#[derive(Debug, Deserialize)]
pub struct SourceDocument {
    #[serde(default)]
    pub profile: Option<Map<String, Value>>,
    #[serde(default)]
    pub items: Vec<Map<String, Value>>,
    #[serde(default)]
    pub ephemeral: Vec<Map<String, Value>>,
}

impl SourceDocument {
    pub fn parse(raw: &str) -> Result<Self, SourceError> {
        serde_json::from_str(raw)
            .map_err(|e| SourceError::transient(format!("malformed source payload: {e}")))
    }

    pub fn summary(&self, identity: &SourceIdentity) -> Result<IdentitySummary, SourceError> {
        let profile = self.profile.as_ref().ok_or_else(|| {
            SourceError::permanent(format!("no profile returned for {identity}"))
        })?;

        let mut fields: Fields = profile.clone().into_iter().collect();
        let id = fields
            .remove("id")
            .and_then(|v| id_string(&v))
            .unwrap_or_else(|| identity.handle.clone());
        let handle = fields
            .remove("handle")
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_else(|| identity.handle.clone());
        let display_name = fields
            .remove("display_name")
            .and_then(|v| v.as_str().map(str::to_string));

        Ok(IdentitySummary {
            id,
            handle,
            display_name,
            fields,
        })
    }

    pub fn items(&self, source_type: &str, default_kind: &str, limit: usize) -> Vec<NormalizedRecord> {
        normalize_all(&self.items, source_type, default_kind, Some(limit))
    }

    pub fn ephemeral_items(&self, source_type: &str, limit: Option<usize>) -> Vec<NormalizedRecord> {
        normalize_all(&self.ephemeral, source_type, "story", limit)
    }
}

fn normalize_all(
    raw: &[Map<String, Value>],
    source_type: &str,
    default_kind: &str,
    limit: Option<usize>,
) -> Vec<NormalizedRecord> {
    let collected_at = Utc::now();
    raw.iter()
        .filter_map(|item| normalize(item, source_type, default_kind, collected_at))
        .take(limit.unwrap_or(usize::MAX))
        .collect()
}

/// Items without an id can't be keyed and are skipped.
pub fn normalize(
    raw: &Map<String, Value>,
    source_type: &str,
    default_kind: &str,
    collected_at: DateTime<Utc>,
) -> Option<NormalizedRecord> {
    let mut fields: Fields = raw.clone().into_iter().collect();

    let record_id = match fields.remove("id").as_ref().and_then(id_string) {
        Some(id) => id,
        None => {
            tracing::debug!(source = source_type, "skipping item without id");
            return None;
        }
    };
    let kind = fields
        .remove("kind")
        .and_then(|v| v.as_str().map(str::to_string))
        .unwrap_or_else(|| default_kind.to_string());
    let published_at = fields.remove("published_at").as_ref().and_then(parse_timestamp);

    let mut record = NormalizedRecord::new(source_type, record_id, kind)
        .with_fields(fields)
        .with_collected_at(collected_at);
    record.published_at = published_at;
    Some(record)
}

// Ids arrive as strings or as bare numbers depending on the platform
fn id_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// RFC 3339 strings or unix seconds.
fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .map(|dt| dt.with_timezone(&Utc))
            .ok(),
        Value::Number(n) => n.as_i64().and_then(|secs| Utc.timestamp_opt(secs, 0).single()),
        _ => None,
    }
}
