use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// One tracked installation, identified by `(owner, repo)`.
///
/// Field names are serialized in PascalCase and must stay stable: users
/// inspect and hand-edit `releases.json`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "PascalCase")]
pub struct Release {
    pub owner: String,
    pub repo: String,
    pub version: String,
    #[serde(rename = "URL")]
    pub url: String,
    pub asset_file_name: String,
    #[serde(default)]
    pub installed_files: InstalledFiles,
    /// Latest tag seen by the last `update`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latest_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub installed_at: Option<String>,
}

impl Release {
    pub fn is(&self, owner: &str, repo: &str) -> bool {
        self.owner == owner && self.repo == repo
    }

    pub fn identity(&self) -> String {
        format!("{}/{}", self.owner, self.repo)
    }
}

pub type InstalledFiles = Vec<InstalledFile>;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "PascalCase")]
pub struct InstalledFile {
    /// Root-relative when the file lives under the relma root, absolute otherwise.
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<u32>,
}

impl InstalledFile {
    /// Record `target`, storing it relative to `root` when possible.
    pub fn new(root: &Path, target: &Path, mode: Option<u32>) -> Self {
        let path = target
            .strip_prefix(root)
            .unwrap_or(target)
            .to_string_lossy()
            .to_string();
        Self { path, mode }
    }

    pub fn resolve(&self, root: &Path) -> PathBuf {
        root.join(&self.path)
    }
}

/// A reference resolved down to one downloadable asset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedRelease {
    pub owner: String,
    pub repo: String,
    pub version: String,
    pub asset_file_name: String,
    pub url: String,
}
