#![allow(dead_code)]

use std::path::{Path, PathBuf};
use tempfile::TempDir;

use harvester::infra::config::{SourceAdapter, SourcesConfig};

/// Temp directory with replay captures for an `instagram` platform.
pub struct Workspace {
    dir: TempDir,
}

impl Workspace {
    pub fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let captures = dir.path().join("captures").join("instagram");
        std::fs::create_dir_all(&captures).unwrap();

        std::fs::write(
            captures.join("nasa.json"),
            r#"{
              "profile": {"id": "528817151", "handle": "nasa", "display_name": "NASA", "followers": 97000000},
              "items": [
                {"id": "n1", "published_at": "2024-01-03T12:00:00Z", "caption": "Moon", "likes": 10},
                {"id": "n2", "published_at": "2024-01-20T12:00:00Z", "caption": "Mars", "likes": 20},
                {"id": "n3", "published_at": "2024-02-11T12:00:00Z", "caption": "None", "likes": 30}
              ],
              "ephemeral": [{"id": "ns1", "published_at": "2024-02-12T08:00:00Z"}]
            }"#,
        )
        .unwrap();
        std::fs::write(
            captures.join("esa.json"),
            r#"{
              "profile": {"id": "2094200507", "handle": "esa"},
              "items": [
                {"id": "e1", "published_at": "2024-01-05T09:00:00Z"},
                {"id": "e2", "published_at": "2024-01-06T09:00:00Z"}
              ]
            }"#,
        )
        .unwrap();
        std::fs::write(captures.join("broken.json"), "{\"profile\": ").unwrap();

        Self { dir }
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn database(&self) -> PathBuf {
        self.path().join("harvester.db")
    }

    pub fn lock_path(&self) -> PathBuf {
        self.path().join("harvester.lock")
    }

    pub fn captures(&self) -> PathBuf {
        self.path().join("captures")
    }

    pub fn sources(&self) -> SourcesConfig {
        let mut sources = SourcesConfig::default();
        sources.replay.root = self.captures();
        sources
            .platforms
            .insert("instagram".to_string(), SourceAdapter::Replay);
        sources
    }

    /// Config file with pacing off and the replay captures wired up.
    /// `extra` is appended verbatim.
    pub fn write_config(&self, extra: &str) -> PathBuf {
        let path = self.path().join("harvester.yml");
        let yaml = format!(
            "database: {db}
lock_path: {lock}
pacing:
  min_delay_secs: 0
  max_delay_secs: 0
  batch_size: 0
sources:
  replay:
    root: {captures}
  platforms:
    instagram: replay
{extra}",
            db = self.database().display(),
            lock = self.lock_path().display(),
            captures = self.captures().display(),
        );
        std::fs::write(&path, yaml).unwrap();
        path
    }
}
