use async_trait::async_trait;
use std::path::{Path, PathBuf};

use crate::domain::{IdentitySummary, NormalizedRecord, SourceIdentity, TaskParameters, TimeWindow};
use crate::sources::payload::SourceDocument;
use crate::sources::{SourceContract, SourceError};

/// Serves previously captured payloads from disk.
///
/// Layout: `<root>/<source_type>/<handle>.json`, with media files under
/// `<root>/<source_type>/media/<record_id>.*`.
#[derive(Debug, Clone)]
pub struct ReplaySource {
    source_type: String,
    root: PathBuf,
}

impl ReplaySource {
    pub fn new(source_type: &str, root: impl Into<PathBuf>) -> Self {
        Self {
            source_type: source_type.to_lowercase(),
            root: root.into(),
        }
    }

    fn platform_dir(&self) -> PathBuf {
        self.root.join(&self.source_type)
    }

    fn document_path(&self, handle: &str) -> Result<PathBuf, SourceError> {
        // Handles come from user input; keep them inside the replay root
        if handle.is_empty() || handle.contains(['/', '\\']) || handle.starts_with('.') {
            return Err(SourceError::permanent(format!("invalid handle `{handle}`")));
        }
        Ok(self.platform_dir().join(format!("{handle}.json")))
    }

    async fn load(&self, identity: &SourceIdentity) -> Result<SourceDocument, SourceError> {
        let path = self.document_path(&identity.handle)?;
        match tokio::fs::read_to_string(&path).await {
            Ok(raw) => SourceDocument::parse(&raw),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(SourceError::permanent(
                format!("no capture for {identity} at {}", path.display()),
            )),
            Err(e) => Err(SourceError::transient(format!(
                "failed to read {}: {e}",
                path.display()
            ))),
        }
    }

    async fn find_media(dir: &Path, record_id: &str) -> std::io::Result<Option<PathBuf>> {
        let mut entries = match tokio::fs::read_dir(dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e),
        };
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.file_stem().and_then(|s| s.to_str()) == Some(record_id) {
                return Ok(Some(path));
            }
        }
        Ok(None)
    }
}

#[async_trait]
impl SourceContract for ReplaySource {
    fn source_type(&self) -> &str {
        &self.source_type
    }

    async fn fetch_identity_summary(
        &self,
        identity: &SourceIdentity,
    ) -> Result<IdentitySummary, SourceError> {
        self.load(identity).await?.summary(identity)
    }

    async fn fetch_items(
        &self,
        identity: &SourceIdentity,
        limit: usize,
        _params: &TaskParameters,
        _window: Option<&TimeWindow>,
    ) -> Result<Vec<NormalizedRecord>, SourceError> {
        let doc = self.load(identity).await?;
        Ok(doc.items(&self.source_type, "post", limit))
    }

    async fn fetch_ephemeral_items(
        &self,
        identity: &SourceIdentity,
        limit: Option<usize>,
    ) -> Result<Vec<NormalizedRecord>, SourceError> {
        let doc = self.load(identity).await?;
        Ok(doc.ephemeral_items(&self.source_type, limit))
    }

    async fn attach_media(&self, record: &mut NormalizedRecord) -> Result<bool, SourceError> {
        let media_dir = self.platform_dir().join("media");
        let found = Self::find_media(&media_dir, &record.record_id)
            .await
            .map_err(|e| SourceError::transient(format!("media lookup failed: {e}")))?;

        match found {
            Some(path) => {
                record.fields.insert(
                    "media_path".to_string(),
                    serde_json::Value::String(path.to_string_lossy().into_owned()),
                );
                Ok(true)
            }
            None => Ok(false),
        }
    }
}
