//! Installer: moves selected files from an unpacked asset into the bin
//! directory, all or nothing.

use crate::download::{ArchiveKind, ExtractedEntry, Unpacked};
use crate::error::{RelmaError, Result};
use crate::types::{InstalledFile, InstalledFiles};
use std::collections::HashSet;
use std::ffi::{OsStr, OsString};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

/// Entries worth installing: executables, or the asset itself when it was
/// downloaded as a bare binary.
pub fn select_targets(unpacked: &Unpacked) -> Vec<&ExtractedEntry> {
    if unpacked.kind == ArchiveKind::Bare && unpacked.entries.len() == 1 {
        return unpacked.entries.iter().collect();
    }
    unpacked.entries.iter().filter(|e| e.is_executable).collect()
}

/// Install the selected files of `unpacked` into `bin_dir`.
///
/// Returned paths are the final locations, recorded relative to `root` when
/// `bin_dir` lives under it. On error nothing from this attempt is left in
/// `bin_dir` and any file it would have overwritten is restored. On success
/// the replaced files are still held: call [`Placement::finish`] once the
/// manifest records the new files, or [`Placement::rollback`] if it could not.
pub fn install_files(unpacked: &Unpacked, bin_dir: &Path, root: &Path) -> Result<Placement> {
    let targets = select_targets(unpacked);
    if targets.is_empty() {
        return Err(RelmaError::NoInstallableFile {
            asset: unpacked.asset_file_name.clone(),
        });
    }

    fs::create_dir_all(bin_dir).map_err(|e| RelmaError::filesystem(bin_dir, e))?;
    let mut transaction = InstallTransaction::begin(bin_dir)?;

    let mut seen = HashSet::new();
    for entry in targets {
        let Some(file_name) = entry.relative_path.file_name() else {
            continue;
        };
        if !seen.insert(file_name.to_os_string()) {
            tracing::warn!(
                "Skipping {}: another file named {} is already being installed",
                entry.relative_path.display(),
                file_name.to_string_lossy()
            );
            continue;
        }
        transaction.stage(&unpacked.path_of(entry), file_name, entry.mode)?;
    }

    let placed = transaction.place_all()?;
    let files = placed
        .into_iter()
        .map(|(path, mode)| {
            tracing::info!("Installed {}", path.display());
            InstalledFile::new(root, &path, mode)
        })
        .collect();
    Ok(Placement { files, transaction })
}

/// Files now in the bin directory, with the files they replaced kept aside
/// until the caller settles the outcome.
#[derive(Debug)]
#[must_use = "a placement must be finished or rolled back"]
pub struct Placement {
    files: InstalledFiles,
    transaction: InstallTransaction,
}

impl Placement {
    pub fn files(&self) -> &InstalledFiles {
        &self.files
    }

    /// Keep the new files and discard the replaced ones.
    pub fn finish(self) {
        tracing::debug!("Committed {} file(s)", self.files.len());
    }

    /// Remove the new files and put the replaced ones back.
    pub fn rollback(mut self) {
        self.transaction.rollback();
    }
}

#[derive(Debug)]
struct StagedFile {
    file_name: OsString,
    mode: Option<u32>,
}

/// Files are first copied into `<staging>/files` inside `bin_dir` (same
/// filesystem, so the final step is a rename), then moved into place.
/// Overwritten files are parked in `<staging>/backup` until the transaction
/// is dropped.
#[derive(Debug)]
struct InstallTransaction {
    bin_dir: PathBuf,
    staging: TempDir,
    staged: Vec<StagedFile>,
    placed: Vec<PathBuf>,
    backups: Vec<(PathBuf, PathBuf)>,
}

impl InstallTransaction {
    fn begin(bin_dir: &Path) -> Result<Self> {
        let staging = tempfile::Builder::new()
            .prefix(".relma-staging-")
            .tempdir_in(bin_dir)
            .map_err(|e| RelmaError::filesystem(bin_dir, e))?;
        for dir in ["files", "backup"] {
            fs::create_dir(staging.path().join(dir))
                .map_err(|e| RelmaError::filesystem(staging.path(), e))?;
        }
        Ok(Self {
            bin_dir: bin_dir.to_path_buf(),
            staging,
            staged: Vec::new(),
            placed: Vec::new(),
            backups: Vec::new(),
        })
    }

    fn staged_path(&self, file_name: &OsStr) -> PathBuf {
        self.staging.path().join("files").join(file_name)
    }

    fn backup_path(&self, file_name: &OsStr) -> PathBuf {
        self.staging.path().join("backup").join(file_name)
    }

    fn stage(&mut self, source: &Path, file_name: &OsStr, mode: Option<u32>) -> Result<()> {
        let staged_path = self.staged_path(file_name);
        fs::copy(source, &staged_path).map_err(|e| RelmaError::filesystem(source, e))?;

        #[cfg(unix)]
        if let Some(mode) = mode {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&staged_path, fs::Permissions::from_mode(mode))
                .map_err(|e| RelmaError::filesystem(&staged_path, e))?;
        }

        self.staged.push(StagedFile {
            file_name: file_name.to_os_string(),
            mode,
        });
        Ok(())
    }

    /// Move every staged file into `bin_dir`. Rolls back on the first failure.
    fn place_all(&mut self) -> Result<Vec<(PathBuf, Option<u32>)>> {
        let staged = std::mem::take(&mut self.staged);
        let mut placed = Vec::with_capacity(staged.len());

        for file in staged {
            let target = self.bin_dir.join(&file.file_name);
            if let Err(e) = self.place(&file.file_name, &target) {
                self.rollback();
                return Err(RelmaError::filesystem(target, e));
            }
            placed.push((target, file.mode));
        }
        Ok(placed)
    }

    fn place(&mut self, file_name: &OsStr, target: &Path) -> io::Result<()> {
        if let Ok(metadata) = fs::symlink_metadata(target) {
            if !metadata.is_dir() {
                let backup = self.backup_path(file_name);
                fs::rename(target, &backup)?;
                self.backups.push((target.to_path_buf(), backup));
            }
        }

        fs::rename(self.staged_path(file_name), target)?;
        self.placed.push(target.to_path_buf());
        Ok(())
    }

    fn rollback(&mut self) {
        for path in self.placed.drain(..).rev() {
            if let Err(e) = fs::remove_file(&path) {
                tracing::error!("Could not roll back {}: {}", path.display(), e);
            } else {
                tracing::debug!("Rolled back {}", path.display());
            }
        }
        for (target, backup) in self.backups.drain(..).rev() {
            if let Err(e) = fs::rename(&backup, &target) {
                tracing::error!("Could not restore {}: {}", target.display(), e);
            }
        }
    }
}

/// Delete `path`, treating an already missing file as success.
/// Returns whether a file was actually removed.
pub fn remove_installed_file(path: &Path) -> Result<bool> {
    match fs::remove_file(path) {
        Ok(()) => {
            tracing::info!("Removed {}", path.display());
            Ok(true)
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            tracing::warn!("{} was already gone", path.display());
            Ok(false)
        }
        Err(e) => Err(RelmaError::filesystem(path, e)),
    }
}
