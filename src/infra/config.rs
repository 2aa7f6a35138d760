use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::engine::pacing::PacingConfig;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HarvesterConfig {
    pub database: PathBuf,
    pub lock_path: PathBuf,
    /// Token handed to sources that need one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    pub pacing: PacingConfig,
    pub orchestrator: OrchestratorConfig,
    pub sources: SourcesConfig,
    pub platforms: BTreeMap<String, PlatformSettings>,
    /// Drop run history older than this many days after each run.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub history_retention_days: Option<u32>,
}

impl Default for HarvesterConfig {
    fn default() -> Self {
        let data_dir = dirs::data_local_dir()
            .map(|d| d.join("harvester"))
            .unwrap_or_else(|| PathBuf::from("."));
        let lock_dir = dirs::runtime_dir().unwrap_or_else(std::env::temp_dir);

        Self {
            database: data_dir.join("harvester.db"),
            lock_path: lock_dir.join("harvester.lock"),
            token: None,
            pacing: PacingConfig::default(),
            orchestrator: OrchestratorConfig::default(),
            sources: SourcesConfig::default(),
            platforms: BTreeMap::new(),
            history_retention_days: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum StrategyKind {
    #[default]
    Sequential,
    Parallel,
    Cooperative,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub strategy: StrategyKind,
    /// Worker processes for the parallel strategy. Defaults to the number of CPUs.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workers: Option<usize>,
    pub max_in_flight: usize,
    pub task_timeout_secs: u64,
    pub grace_period_secs: u64,
    /// Stop dispatching after this many seconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deadline_secs: Option<u64>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            strategy: StrategyKind::Sequential,
            workers: None,
            max_in_flight: 4,
            task_timeout_secs: 600,
            grace_period_secs: 30,
            deadline_secs: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceAdapter {
    Replay,
    Remote,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SourcesConfig {
    pub replay: ReplayConfig,
    pub remote: RemoteConfig,
    /// Platform name -> adapter that serves it.
    pub platforms: BTreeMap<String, SourceAdapter>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplayConfig {
    pub root: PathBuf,
}

impl Default for ReplayConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("replay"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    pub timeout_secs: u64,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            timeout_secs: 300,
        }
    }
}

/// Per-platform collection defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PlatformSettings {
    pub enabled: bool,
    pub post_limit: usize,
    /// `None` collects every available story.
    pub story_limit: Option<usize>,
    pub download_media: bool,
}

impl Default for PlatformSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            post_limit: 50,
            story_limit: None,
            download_media: false,
        }
    }
}

pub struct ConfigManager {
    config: HarvesterConfig,
}

impl ConfigManager {
    pub const CONFIG_FILE: &'static str = "harvester.yml";

    pub fn new(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let mut config = Self::load_config(path.as_ref())?;
        Self::apply_env(&mut config);
        Self::validate(&config)?;

        Ok(Self { config })
    }

    fn load_config(path: &Path) -> Result<HarvesterConfig, ConfigError> {
        if !path.exists() {
            tracing::debug!(path = %path.display(), "no config file, using defaults");
            return Ok(HarvesterConfig::default());
        }

        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        serde_yaml::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    fn apply_env(config: &mut HarvesterConfig) {
        if let Ok(db) = std::env::var("HARVESTER_DB") {
            config.database = PathBuf::from(db);
        }
        if let Ok(lock) = std::env::var("HARVESTER_LOCK") {
            config.lock_path = PathBuf::from(lock);
        }
        if let Ok(token) = std::env::var("HARVESTER_TOKEN") {
            if !token.is_empty() {
                config.token = Some(token);
            }
        }
    }

    pub fn validate(config: &HarvesterConfig) -> Result<(), ConfigError> {
        let orchestrator = &config.orchestrator;
        if orchestrator.workers == Some(0) {
            return Err(ConfigError::Invalid("orchestrator.workers must be at least 1".into()));
        }
        if orchestrator.max_in_flight == 0 {
            return Err(ConfigError::Invalid(
                "orchestrator.max_in_flight must be at least 1".into(),
            ));
        }
        if orchestrator.task_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "orchestrator.task_timeout_secs must be positive".into(),
            ));
        }
        config.pacing.validate().map_err(ConfigError::Invalid)?;
        Ok(())
    }

    pub fn get(&self) -> &HarvesterConfig {
        &self.config
    }

    pub fn into_config(self) -> HarvesterConfig {
        self.config
    }

    pub fn platform(&self, name: &str) -> PlatformSettings {
        self.config
            .platforms
            .get(&name.to_lowercase())
            .cloned()
            .unwrap_or_default()
    }

    /// Write a commented starter config. Leaves an existing file alone.
    pub fn create_default(path: impl AsRef<Path>) -> Result<bool, ConfigError> {
        let path = path.as_ref();
        if path.exists() {
            return Ok(false);
        }

        let default_content = r#"# Harvester configuration

# database: ./harvester.db
# lock_path: /tmp/harvester.lock
# history_retention_days: 30

pacing:
  min_delay_secs: 5        # pause before each task after the first
  max_delay_secs: 10
  batch_size: 3            # extra pause after this many tasks
  batch_min_delay_secs: 5
  batch_max_delay_secs: 60

orchestrator:
  strategy: sequential     # sequential, parallel, cooperative
  # workers: 4             # parallel worker processes (default: CPU count)
  max_in_flight: 4         # cooperative concurrency bound
  task_timeout_secs: 600
  grace_period_secs: 30

sources:
  replay:
    root: ./replay
  remote:
    # endpoint: https://scraper.example.com/actors
    timeout_secs: 300
  platforms:
    instagram: remote
    facebook: remote
    twitter: remote
    threads: remote

platforms:
  instagram:
    enabled: true
    post_limit: 5
    download_media: true
  twitter:
    enabled: true
    post_limit: 20
    download_media: true
  facebook:
    enabled: false
    post_limit: 10
  threads:
    enabled: false
    post_limit: 15
"#;

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|source| ConfigError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        std::fs::write(path, default_content).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(true)
    }
}

/// Serde helpers for durations written as (fractional) seconds.
pub mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::TempDir;

    #[test]
    fn missing_file_gives_defaults() {
        let dir = TempDir::new().unwrap();
        let manager = ConfigManager::new(dir.path().join("absent.yml")).unwrap();
        assert_eq!(manager.get().orchestrator.strategy, StrategyKind::Sequential);
        assert_eq!(manager.get().pacing.batch_size, 3);
    }

    #[test]
    fn starter_file_parses() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(ConfigManager::CONFIG_FILE);
        assert!(ConfigManager::create_default(&path).unwrap());
        assert!(!ConfigManager::create_default(&path).unwrap());

        let manager = ConfigManager::new(&path).unwrap();
        let config = manager.get();
        assert_eq!(config.pacing.min_delay, Duration::from_secs(5));
        assert_eq!(config.sources.platforms.get("twitter"), Some(&SourceAdapter::Remote));
        assert_eq!(manager.platform("Instagram").post_limit, 5);
        assert!(!manager.platform("threads").enabled);
        assert_eq!(manager.platform("tiktok").post_limit, 50);
    }

    #[test]
    fn rejects_zero_concurrency() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bad.yml");
        std::fs::write(&path, "orchestrator:\n  max_in_flight: 0\n").unwrap();

        let err = ConfigManager::new(&path).err().unwrap();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn reports_parse_errors_with_path() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("broken.yml");
        std::fs::write(&path, "pacing: [1, 2").unwrap();

        let err = ConfigManager::new(&path).err().unwrap();
        assert!(err.to_string().contains("broken.yml"));
    }
}
