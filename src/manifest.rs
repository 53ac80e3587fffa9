//! Manifest store: the persisted, ordered list of installed releases.
//!
//! The manifest is always handled as a snapshot: load it once, mutate it in
//! memory, then replace the file in one rename.

use crate::error::{RelmaError, Result};
use crate::types::Release;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::Path;
use tempfile::NamedTempFile;

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(transparent)]
pub struct Releases(Vec<Release>);

impl Releases {
    pub fn new(releases: Vec<Release>) -> Self {
        Self(releases)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Release> {
        self.0.iter()
    }

    pub fn iter_mut(&mut self) -> std::slice::IterMut<'_, Release> {
        self.0.iter_mut()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn position(&self, owner: &str, repo: &str) -> Option<usize> {
        self.0.iter().position(|r| r.is(owner, repo))
    }

    pub fn find(&self, owner: &str, repo: &str) -> Option<&Release> {
        self.0.iter().find(|r| r.is(owner, repo))
    }

    pub fn find_mut(&mut self, owner: &str, repo: &str) -> Option<&mut Release> {
        self.0.iter_mut().find(|r| r.is(owner, repo))
    }

    /// Insert `release`, replacing an entry with the same identity in place.
    /// Returns the replaced entry, if any.
    pub fn upsert(&mut self, release: Release) -> Option<Release> {
        match self.position(&release.owner, &release.repo) {
            Some(index) => Some(std::mem::replace(&mut self.0[index], release)),
            None => {
                self.0.push(release);
                None
            }
        }
    }

    pub fn remove(&mut self, owner: &str, repo: &str) -> Option<Release> {
        self.position(owner, repo).map(|index| self.0.remove(index))
    }

    pub fn into_vec(self) -> Vec<Release> {
        self.0
    }
}

impl<'a> IntoIterator for &'a Releases {
    type Item = &'a Release;
    type IntoIter = std::slice::Iter<'a, Release>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

/// Read the manifest. A missing file is an empty manifest; anything
/// unreadable is an error, since guessing at state is worse than stopping.
pub fn load_releases(path: &Path) -> Result<Releases> {
    if !path.exists() {
        tracing::debug!("No manifest at {}, starting empty", path.display());
        return Ok(Releases::default());
    }

    let content = fs::read_to_string(path).map_err(|e| manifest_error("read", path, e))?;
    if content.trim().is_empty() {
        return Ok(Releases::default());
    }

    let releases: Releases =
        serde_json::from_str(&content).map_err(|e| manifest_error("parse", path, e))?;
    check_unique(&releases).map_err(|e| manifest_error("parse", path, e))?;

    tracing::debug!(
        "Loaded {} release(s) from {}",
        releases.len(),
        path.display()
    );
    Ok(releases)
}

/// Replace the manifest file atomically: write a sibling temp file, then
/// rename it over the original.
pub fn save_releases(path: &Path, releases: &Releases) -> Result<()> {
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(dir).map_err(|e| manifest_error("write", path, e))?;

    let mut content =
        serde_json::to_string_pretty(releases).map_err(|e| manifest_error("write", path, e))?;
    content.push('\n');

    let mut temp = NamedTempFile::new_in(dir).map_err(|e| manifest_error("write", path, e))?;
    temp.write_all(content.as_bytes())
        .and_then(|_| temp.as_file().sync_all())
        .map_err(|e| manifest_error("write", path, e))?;
    temp.persist(path)
        .map_err(|e| manifest_error("write", path, e.error))?;

    tracing::debug!("Wrote {} release(s) to {}", releases.len(), path.display());
    Ok(())
}

fn check_unique(releases: &Releases) -> std::result::Result<(), String> {
    for (index, release) in releases.iter().enumerate() {
        if releases.position(&release.owner, &release.repo) != Some(index) {
            return Err(format!("duplicate entry for {}", release.identity()));
        }
    }
    Ok(())
}

fn manifest_error(
    action: &'static str,
    path: &Path,
    source: impl Into<Box<dyn std::error::Error + Send + Sync>>,
) -> RelmaError {
    RelmaError::ManifestIo {
        action,
        path: path.to_path_buf(),
        source: source.into(),
    }
}
