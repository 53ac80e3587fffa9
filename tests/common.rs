use async_trait::async_trait;
use flate2::write::GzEncoder;
use flate2::Compression;
use relma::config::Config;
use relma::github::ReleaseSource;
use relma::manifest::{load_releases, Releases};
use relma::{App, RemoteError};
use std::collections::HashMap;
use std::io::{Cursor, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

// Each integration test binary compiles this module separately and uses a
// different subset of it.
#[allow(dead_code)]
pub struct TestContext {
    pub _temp_dir: TempDir,
    pub root: PathBuf,
    pub source: MockSource,
}

#[allow(dead_code)]
impl TestContext {
    pub fn new() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let root = temp_dir.path().join("relma");
        Self {
            _temp_dir: temp_dir,
            root,
            source: MockSource::default(),
        }
    }

    pub fn config(&self) -> Config {
        Config::new(&self.root)
    }

    /// A fresh engine sharing this context's mock remote.
    pub fn app(&self) -> App {
        App::new(self.config(), self.source.clone())
    }

    pub fn bin_dir(&self) -> PathBuf {
        self.root.join("bin")
    }

    pub fn releases(&self) -> Releases {
        load_releases(&self.config().releases_file()).expect("Failed to load manifest")
    }

    pub fn manifest_bytes(&self) -> Option<Vec<u8>> {
        std::fs::read(self.config().releases_file()).ok()
    }

    pub fn config_path(&self) -> PathBuf {
        self._temp_dir.path().join("config").join("relma").join("config.json")
    }

    /// The relma binary, isolated to this context's root and config file.
    pub fn cmd(&self) -> Command {
        let mut cmd = Command::new(env!("CARGO_BIN_EXE_relma"));
        cmd.env("RELMA_ROOT", &self.root);
        cmd.env("RELMA_CONFIG", self.config_path());
        cmd.env("HOME", self._temp_dir.path());
        cmd.env("XDG_CONFIG_HOME", self._temp_dir.path().join("config"));
        cmd.env_remove("RUST_LOG");
        cmd.env_remove("GITHUB_TOKEN");
        cmd
    }

    /// Register an asset and return its download URL.
    pub fn publish(&self, owner: &str, repo: &str, tag: &str, asset: &str, bytes: Vec<u8>) -> String {
        let url = release_url(owner, repo, tag, asset);
        self.source.add_asset(&url, bytes);
        url
    }
}

#[derive(Default)]
struct MockState {
    tags: HashMap<String, Vec<String>>,
    tag_failures: HashMap<String, u16>,
    assets: HashMap<String, Vec<u8>>,
    fetched: Vec<String>,
    on_fetch: Option<Box<dyn Fn() + Send>>,
}

/// In-memory stand-in for GitHub. Clones share state.
#[derive(Clone, Default)]
pub struct MockSource {
    state: Arc<Mutex<MockState>>,
}

#[allow(dead_code)]
impl MockSource {
    pub fn set_tags(&self, owner_repo: &str, tags: &[&str]) {
        let mut state = self.state.lock().unwrap();
        state.tag_failures.remove(owner_repo);
        state
            .tags
            .insert(owner_repo.to_string(), tags.iter().map(|t| t.to_string()).collect());
    }

    pub fn fail_tags(&self, owner_repo: &str, status: u16) {
        self.state
            .lock()
            .unwrap()
            .tag_failures
            .insert(owner_repo.to_string(), status);
    }

    pub fn add_asset(&self, url: &str, bytes: Vec<u8>) {
        self.state
            .lock()
            .unwrap()
            .assets
            .insert(url.to_string(), bytes);
    }

    /// Run `hook` on every download, before the body is returned.
    pub fn on_fetch(&self, hook: impl Fn() + Send + 'static) {
        self.state.lock().unwrap().on_fetch = Some(Box::new(hook));
    }

    /// URLs downloaded so far, in order.
    pub fn fetched(&self) -> Vec<String> {
        self.state.lock().unwrap().fetched.clone()
    }
}

#[async_trait]
impl ReleaseSource for MockSource {
    async fn list_tags(&self, owner: &str, repo: &str) -> Result<Vec<String>, RemoteError> {
        let key = format!("{}/{}", owner, repo);
        let url = format!("https://api.github.com/repos/{}/tags", key);
        let state = self.state.lock().unwrap();
        if let Some(status) = state.tag_failures.get(&key) {
            return Err(RemoteError::Status {
                url,
                status: *status,
            });
        }
        state
            .tags
            .get(&key)
            .cloned()
            .ok_or(RemoteError::Status { url, status: 404 })
    }

    async fn fetch_bytes(&self, url: &str) -> Result<Vec<u8>, RemoteError> {
        let mut state = self.state.lock().unwrap();
        state.fetched.push(url.to_string());
        if let Some(hook) = &state.on_fetch {
            hook();
        }
        state.assets.get(url).cloned().ok_or(RemoteError::Status {
            url: url.to_string(),
            status: 404,
        })
    }
}

#[allow(dead_code)]
pub fn release_url(owner: &str, repo: &str, tag: &str, asset: &str) -> String {
    format!(
        "https://github.com/{}/{}/releases/download/{}/{}",
        owner, repo, tag, asset
    )
}

/// A .tar.gz holding `(path, contents, mode)` entries.
#[allow(dead_code)]
pub fn tar_gz(files: &[(&str, &[u8], u32)]) -> Vec<u8> {
    let mut builder = tar::Builder::new(GzEncoder::new(Vec::new(), Compression::default()));
    for (path, data, mode) in files {
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(*mode);
        builder
            .append_data(&mut header, path, *data)
            .expect("Failed to append tar entry");
    }
    builder
        .into_inner()
        .and_then(|gz| gz.finish())
        .expect("Failed to finish tarball")
}

/// A .zip holding `(path, contents, mode)` entries.
#[allow(dead_code)]
pub fn zip(files: &[(&str, &[u8], u32)]) -> Vec<u8> {
    let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
    for (path, data, mode) in files {
        let options = zip::write::FileOptions::default().unix_permissions(*mode);
        writer.start_file(*path, options).expect("Failed to start zip entry");
        writer.write_all(data).expect("Failed to write zip entry");
    }
    writer.finish().expect("Failed to finish zip").into_inner()
}

#[allow(dead_code)]
pub fn is_executable(path: &Path) -> bool {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::metadata(path)
            .map(|m| m.permissions().mode() & 0o111 != 0)
            .unwrap_or(false)
    }
    #[cfg(not(unix))]
    {
        path.is_file()
    }
}

#[allow(dead_code)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub status: std::process::ExitStatus,
}

impl From<Output> for CommandOutput {
    fn from(output: Output) -> Self {
        Self {
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            status: output.status,
        }
    }
}

#[allow(dead_code)]
impl CommandOutput {
    pub fn assert_success(&self) -> &Self {
        if !self.status.success() {
            panic!(
                "Command failed with status {:?}\nstdout: {}\nstderr: {}",
                self.status.code(),
                self.stdout,
                self.stderr
            );
        }
        self
    }

    pub fn assert_failure(&self) -> &Self {
        assert!(
            !self.status.success(),
            "Command unexpectedly succeeded\nstdout: {}",
            self.stdout
        );
        self
    }

    pub fn assert_stdout_contains(&self, text: &str) -> &Self {
        assert!(
            self.stdout.contains(text),
            "Stdout did not contain '{}'\nActual stdout: {}",
            text,
            self.stdout
        );
        self
    }

    pub fn assert_stderr_contains(&self, text: &str) -> &Self {
        assert!(
            self.stderr.contains(text),
            "Stderr did not contain '{}'\nActual stderr: {}",
            text,
            self.stderr
        );
        self
    }
}
