use async_trait::async_trait;
use serde::Serialize;
use std::time::Duration;

use crate::domain::{IdentitySummary, NormalizedRecord, SourceIdentity, TaskParameters, TimeWindow};
use crate::infra::config::RemoteConfig;
use crate::sources::payload::SourceDocument;
use crate::sources::{SourceContract, SourceError, SourceErrorKind};

/// Talks to a scraping service that runs platform actors on our behalf.
///
/// Every call is a `POST {endpoint}/{source_type}` with a [`RemoteRequest`]
/// body; the service answers with the shared payload document.
#[derive(Debug, Clone)]
pub struct RemoteSource {
    source_type: String,
    url: String,
    token: Option<String>,
    timeout: Duration,
    client: reqwest::Client,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "lowercase")]
enum Operation {
    Profile,
    Items,
    Ephemeral,
}

#[derive(Debug, Serialize)]
struct RemoteRequest<'a> {
    operation: Operation,
    handle: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    limit: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    parameters: Option<&'a TaskParameters>,
    #[serde(skip_serializing_if = "Option::is_none")]
    window: Option<&'a TimeWindow>,
}

impl RemoteSource {
    pub fn new(
        source_type: &str,
        config: &RemoteConfig,
        credentials: Option<&str>,
    ) -> Result<Self, SourceError> {
        let endpoint = config
            .endpoint
            .as_deref()
            .ok_or_else(|| SourceError::permanent("remote endpoint is not configured"))?;

        Ok(Self {
            source_type: source_type.to_lowercase(),
            url: format!("{}/{}", endpoint.trim_end_matches('/'), source_type.to_lowercase()),
            token: credentials.map(str::to_string),
            timeout: Duration::from_secs(config.timeout_secs),
            client: reqwest::Client::new(),
        })
    }

    async fn call(&self, request: RemoteRequest<'_>) -> Result<SourceDocument, SourceError> {
        tracing::debug!(url = %self.url, operation = ?request.operation, handle = request.handle, "calling remote source");

        let mut builder = self
            .client
            .post(&self.url)
            .json(&request)
            .timeout(self.timeout);
        if let Some(token) = &self.token {
            builder = builder.bearer_auth(token);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| SourceError::transient(format!("request to {} failed: {e}", self.url)))?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            let message = match status {
                401 | 403 => "remote service rejected our credentials".to_string(),
                404 => format!("`{}` is unknown to the remote service", request.handle),
                429 => "rate limit exceeded".to_string(),
                _ => format!("remote service error ({status}): {body}"),
            };
            return Err(SourceError {
                kind: classify_status(status),
                message,
            });
        }

        let raw = response
            .text()
            .await
            .map_err(|e| SourceError::transient(format!("failed to read response: {e}")))?;
        SourceDocument::parse(&raw)
    }
}

/// Throttling and server trouble may clear up by the next run; other client
/// errors won't.
pub fn classify_status(status: u16) -> SourceErrorKind {
    match status {
        408 | 425 | 429 | 500..=599 => SourceErrorKind::Transient,
        _ => SourceErrorKind::Permanent,
    }
}

#[async_trait]
impl SourceContract for RemoteSource {
    fn source_type(&self) -> &str {
        &self.source_type
    }

    async fn fetch_identity_summary(
        &self,
        identity: &SourceIdentity,
    ) -> Result<IdentitySummary, SourceError> {
        let doc = self
            .call(RemoteRequest {
                operation: Operation::Profile,
                handle: &identity.handle,
                limit: None,
                parameters: None,
                window: None,
            })
            .await?;
        doc.summary(identity)
    }

    async fn fetch_items(
        &self,
        identity: &SourceIdentity,
        limit: usize,
        params: &TaskParameters,
        window: Option<&TimeWindow>,
    ) -> Result<Vec<NormalizedRecord>, SourceError> {
        let doc = self
            .call(RemoteRequest {
                operation: Operation::Items,
                handle: &identity.handle,
                limit: Some(limit),
                parameters: Some(params),
                window,
            })
            .await?;
        Ok(doc.items(&self.source_type, "post", limit))
    }

    async fn fetch_ephemeral_items(
        &self,
        identity: &SourceIdentity,
        limit: Option<usize>,
    ) -> Result<Vec<NormalizedRecord>, SourceError> {
        let doc = self
            .call(RemoteRequest {
                operation: Operation::Ephemeral,
                handle: &identity.handle,
                limit,
                parameters: None,
                window: None,
            })
            .await?;
        Ok(doc.ephemeral_items(&self.source_type, limit))
    }

    fn filters_by_time(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_classification() {
        assert_eq!(classify_status(429), SourceErrorKind::Transient);
        assert_eq!(classify_status(503), SourceErrorKind::Transient);
        assert_eq!(classify_status(404), SourceErrorKind::Permanent);
        assert_eq!(classify_status(400), SourceErrorKind::Permanent);
    }

    #[test]
    fn requires_endpoint() {
        let err = RemoteSource::new("twitter", &RemoteConfig::default(), None).unwrap_err();
        assert_eq!(err.kind, SourceErrorKind::Permanent);
    }

    #[test]
    fn url_joins_endpoint_and_type() {
        let config = RemoteConfig {
            endpoint: Some("https://scraper.local/actors/".to_string()),
            ..RemoteConfig::default()
        };
        let source = RemoteSource::new("Twitter", &config, Some("token")).unwrap();
        assert_eq!(source.url, "https://scraper.local/actors/twitter");
        assert!(source.filters_by_time());
    }

    #[test]
    fn request_body_omits_empty_parts() {
        let body = serde_json::to_value(RemoteRequest {
            operation: Operation::Profile,
            handle: "nasa",
            limit: None,
            parameters: None,
            window: None,
        })
        .unwrap();
        assert_eq!(body, serde_json::json!({"operation": "profile", "handle": "nasa"}));
    }
}
