use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

pub const APP_NAME: &str = "relma";
pub const BIN_DIR_NAME: &str = "bin";
pub const RELEASES_FILE_NAME: &str = "releases.json";
pub const CONFIG_FILE_NAME: &str = "config.json";
pub const DEFAULT_GITHUB_API_URL: &str = "https://api.github.com";

/// Everything relma needs to locate its state. Read once per invocation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Config {
    pub relma_root: PathBuf,
    #[serde(default = "default_github_api_url")]
    pub github_api_url: String,
}

fn default_github_api_url() -> String {
    DEFAULT_GITHUB_API_URL.to_string()
}

fn default_relma_root() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_NAME)
}

impl Default for Config {
    fn default() -> Self {
        Self::new(default_relma_root())
    }
}

impl Config {
    pub fn new(relma_root: impl Into<PathBuf>) -> Self {
        Self {
            relma_root: relma_root.into(),
            github_api_url: default_github_api_url(),
        }
    }

    pub fn releases_file(&self) -> PathBuf {
        self.relma_root.join(RELEASES_FILE_NAME)
    }

    pub fn bin_dir(&self) -> PathBuf {
        self.relma_root.join(BIN_DIR_NAME)
    }
}

/// `$RELMA_CONFIG`, or `<config dir>/relma/config.json`.
pub fn config_file_path() -> Result<PathBuf> {
    if let Ok(path) = std::env::var("RELMA_CONFIG") {
        return Ok(PathBuf::from(path));
    }
    let path = dirs::config_dir()
        .ok_or_else(|| anyhow!("Could not determine config directory"))?
        .join(APP_NAME)
        .join(CONFIG_FILE_NAME);
    tracing::debug!("Config file path: {}", path.display());
    Ok(path)
}

pub fn load_config(config_path: &Path) -> Result<Config> {
    let mut config = if config_path.exists() {
        let content = fs::read_to_string(config_path)
            .with_context(|| format!("Could not read config file at {}", config_path.display()))?;
        serde_json::from_str(&content).with_context(|| {
            format!(
                "Could not parse config file {} as JSON",
                config_path.display()
            )
        })?
    } else {
        Config::default()
    };

    // Apply environment variable overrides
    if let Ok(root) = std::env::var("RELMA_ROOT") {
        config.relma_root = PathBuf::from(root);
    }
    if let Ok(api_url) = std::env::var("RELMA_GITHUB_API_URL") {
        config.github_api_url = api_url;
    }

    tracing::debug!("relma root: {}", config.relma_root.display());
    Ok(config)
}

pub fn save_config(config_path: &Path, config: &Config) -> Result<()> {
    let config_dir = config_path
        .parent()
        .ok_or_else(|| anyhow!("Invalid config path"))?;
    fs::create_dir_all(config_dir)?;

    let content = serde_json::to_string_pretty(config)?;
    fs::write(config_path, content)
        .with_context(|| format!("Could not write config file {}", config_path.display()))?;
    Ok(())
}

/// Write the config file unless one already exists. Returns whether it was created.
pub fn init_config_file(config_path: &Path, config: &Config) -> Result<bool> {
    if config_path.exists() {
        tracing::info!("Config file {} already exists", config_path.display());
        return Ok(false);
    }
    save_config(config_path, config)?;
    tracing::info!("Created config file {}", config_path.display());
    Ok(true)
}

/// Open the config file in `editor`, `$EDITOR`, or `vi`, in that order.
pub fn edit_config(config_path: &Path, editor: Option<&str>) -> Result<()> {
    let editor = editor
        .map(str::to_string)
        .or_else(|| std::env::var("EDITOR").ok().filter(|e| !e.trim().is_empty()))
        .unwrap_or_else(|| "vi".to_string());

    tracing::debug!("Executing: {} {}", editor, config_path.display());
    let status = Command::new(&editor)
        .arg(config_path)
        .status()
        .with_context(|| format!("Could not start editor '{}'", editor))?;

    if !status.success() {
        return Err(anyhow!(
            "Editor '{}' exited with status {}",
            editor,
            status.code().unwrap_or(1)
        ));
    }

    // Refuse to leave a config behind that the next invocation cannot read.
    load_config(config_path).map(|_| ())
}
