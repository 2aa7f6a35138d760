//! Account lists for daily runs.
//!
//! ```text
//! # accounts.txt
//! [instagram]
//! nasa
//! esa        # trailing comments are fine
//!
//! [twitter]
//! nasa
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::domain::SourceIdentity;

#[derive(Debug, Error)]
pub enum AccountsError {
    #[error("failed to read accounts file {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("line {line}: malformed section header `{text}`")]
    BadHeader { line: usize, text: String },
}

/// Handles grouped by platform, in file order within each platform.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AccountList {
    platforms: BTreeMap<String, Vec<String>>,
}

impl AccountList {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, AccountsError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| AccountsError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&text)
    }

    pub fn parse(text: &str) -> Result<Self, AccountsError> {
        let mut list = Self::default();
        let mut current: Option<String> = None;

        for (number, raw) in text.lines().enumerate() {
            let line = raw.split('#').next().unwrap_or("").trim();
            if line.is_empty() {
                continue;
            }

            if let Some(rest) = line.strip_prefix('[') {
                let name = rest
                    .strip_suffix(']')
                    .map(str::trim)
                    .filter(|name| !name.is_empty())
                    .ok_or_else(|| AccountsError::BadHeader {
                        line: number + 1,
                        text: line.to_string(),
                    })?;
                let name = name.to_lowercase();
                list.platforms.entry(name.clone()).or_default();
                current = Some(name);
                continue;
            }

            match &current {
                Some(platform) => {
                    let handles = list.platforms.entry(platform.clone()).or_default();
                    let handle = line.trim_start_matches('@').to_string();
                    if !handles.contains(&handle) {
                        handles.push(handle);
                    }
                }
                None => {
                    tracing::warn!(line = number + 1, handle = line, "account outside any [platform] section, ignored");
                }
            }
        }

        Ok(list)
    }

    pub fn platforms(&self) -> impl Iterator<Item = &str> {
        self.platforms.keys().map(String::as_str)
    }

    pub fn handles(&self, platform: &str) -> &[String] {
        self.platforms
            .get(&platform.to_lowercase())
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Every account whose platform passes `keep`.
    pub fn identities<F>(&self, mut keep: F) -> Vec<SourceIdentity>
    where
        F: FnMut(&str) -> bool,
    {
        self.platforms
            .iter()
            .filter(|(platform, _)| keep(platform))
            .flat_map(|(platform, handles)| {
                handles.iter().map(move |h| SourceIdentity::new(platform.as_str(), h.as_str()))
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.platforms.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
