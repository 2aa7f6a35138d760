use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Normalized field values of a record. Ordered so comparisons and
/// serialized output are stable.
pub type Fields = BTreeMap<String, serde_json::Value>;

/// Natural key of a record: unique per source.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RecordKey {
    pub source_type: String,
    pub record_id: String,
}

impl RecordKey {
    pub fn new(source_type: impl Into<String>, record_id: impl Into<String>) -> Self {
        Self {
            source_type: source_type.into(),
            record_id: record_id.into(),
        }
    }
}

impl fmt::Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.source_type, self.record_id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedRecord {
    pub source_type: String,
    pub record_id: String,
    pub kind: String,
    #[serde(default)]
    pub fields: Fields,
    /// When the platform says the record was published, if known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub published_at: Option<DateTime<Utc>>,
    pub collected_at: DateTime<Utc>,
}

impl NormalizedRecord {
    pub fn new(
        source_type: impl Into<String>,
        record_id: impl Into<String>,
        kind: impl Into<String>,
    ) -> Self {
        Self {
            source_type: source_type.into(),
            record_id: record_id.into(),
            kind: kind.into(),
            fields: Fields::new(),
            published_at: None,
            collected_at: Utc::now(),
        }
    }

    pub fn with_field(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.fields.insert(key.into(), value);
        self
    }

    pub fn with_fields(mut self, fields: Fields) -> Self {
        self.fields = fields;
        self
    }

    pub fn with_published_at(mut self, published_at: DateTime<Utc>) -> Self {
        self.published_at = Some(published_at);
        self
    }

    pub fn with_collected_at(mut self, collected_at: DateTime<Utc>) -> Self {
        self.collected_at = collected_at;
        self
    }

    pub fn key(&self) -> RecordKey {
        RecordKey::new(self.source_type.clone(), self.record_id.clone())
    }
}

/// Profile-level information about one collected identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdentitySummary {
    pub id: String,
    pub handle: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(default)]
    pub fields: Fields,
}

impl IdentitySummary {
    pub const RECORD_KIND: &'static str = "profile";

    pub fn new(id: impl Into<String>, handle: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            handle: handle.into(),
            display_name: None,
            fields: Fields::new(),
        }
    }

    pub fn with_display_name(mut self, display_name: impl Into<String>) -> Self {
        self.display_name = Some(display_name.into());
        self
    }

    /// Key under which the profile is stored. Prefixed so a profile never
    /// collides with an item that happens to share its platform id.
    pub fn record_id(&self) -> String {
        format!("{}:{}", Self::RECORD_KIND, self.id)
    }

    /// Profile as a record so it can go through the same upsert path as items.
    pub fn to_record(&self, source_type: &str, collected_at: DateTime<Utc>) -> NormalizedRecord {
        let mut fields = self.fields.clone();
        fields.insert(
            "handle".to_string(),
            serde_json::Value::String(self.handle.clone()),
        );
        if let Some(name) = &self.display_name {
            fields.insert(
                "display_name".to_string(),
                serde_json::Value::String(name.clone()),
            );
        }

        NormalizedRecord::new(source_type, self.record_id(), Self::RECORD_KIND)
            .with_fields(fields)
            .with_collected_at(collected_at)
    }
}
