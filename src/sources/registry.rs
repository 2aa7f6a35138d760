//! Maps source-type keys to constructors.

use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

use crate::domain::SourceIdentity;
use crate::infra::config::{SourceAdapter, SourcesConfig};

use super::{RemoteSource, ReplaySource, SourceContract, SourceError};

/// Builds a source for one identity. `credentials` is whatever token the run
/// was configured with.
pub type SourceFactory = Arc<
    dyn Fn(&SourceIdentity, Option<&str>) -> Result<Box<dyn SourceContract>, SourceError>
        + Send
        + Sync,
>;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("unknown source type `{0}`")]
    UnknownSourceType(String),

    #[error("failed to build `{source_type}` source: {source}")]
    Construction {
        source_type: String,
        #[source]
        source: SourceError,
    },
}

/// Registry of source constructors. Holds no per-task state, so one instance
/// can be shared by concurrent runs.
#[derive(Clone, Default)]
pub struct SourceRegistry {
    factories: HashMap<String, SourceFactory>,
}

impl std::fmt::Debug for SourceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SourceRegistry")
            .field("source_types", &self.source_types())
            .finish()
    }
}

impl SourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a factory. Registering an existing type replaces it.
    pub fn register<F>(&mut self, source_type: impl Into<String>, factory: F)
    where
        F: Fn(&SourceIdentity, Option<&str>) -> Result<Box<dyn SourceContract>, SourceError>
            + Send
            + Sync
            + 'static,
    {
        let source_type = source_type.into().to_lowercase();
        if self
            .factories
            .insert(source_type.clone(), Arc::new(factory))
            .is_some()
        {
            tracing::debug!(source_type = %source_type, "source factory replaced");
        } else {
            tracing::debug!(source_type = %source_type, "source factory registered");
        }
    }

    pub fn create(
        &self,
        source_type: &str,
        identity: &SourceIdentity,
        credentials: Option<&str>,
    ) -> Result<Box<dyn SourceContract>, RegistryError> {
        let factory = self
            .factories
            .get(&source_type.to_lowercase())
            .ok_or_else(|| RegistryError::UnknownSourceType(source_type.to_string()))?;

        factory(identity, credentials).map_err(|source| RegistryError::Construction {
            source_type: source_type.to_string(),
            source,
        })
    }

    pub fn contains(&self, source_type: &str) -> bool {
        self.factories.contains_key(&source_type.to_lowercase())
    }

    pub fn source_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.factories.keys().cloned().collect();
        types.sort();
        types
    }
}

/// Registry with the bundled adapters, plus one alias per configured platform.
pub fn builtin_registry(config: &SourcesConfig) -> SourceRegistry {
    let mut registry = SourceRegistry::new();

    register_adapter(&mut registry, "replay", SourceAdapter::Replay, config);
    register_adapter(&mut registry, "remote", SourceAdapter::Remote, config);
    for (platform, adapter) in &config.platforms {
        register_adapter(&mut registry, platform, *adapter, config);
    }

    registry
}

fn register_adapter(
    registry: &mut SourceRegistry,
    source_type: &str,
    adapter: SourceAdapter,
    config: &SourcesConfig,
) {
    match adapter {
        SourceAdapter::Replay => {
            let root = config.replay.root.clone();
            registry.register(source_type, move |identity, _credentials| {
                Ok(Box::new(ReplaySource::new(&identity.source_type, root.clone())))
            });
        }
        SourceAdapter::Remote => {
            let remote = config.remote.clone();
            registry.register(source_type, move |identity, credentials| {
                let source = RemoteSource::new(&identity.source_type, &remote, credentials)?;
                Ok(Box::new(source))
            });
        }
    }
}
