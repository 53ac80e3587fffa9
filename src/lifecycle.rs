//! The release lifecycle engine.
//!
//! Every state-changing command is an [`Operation`] run by [`App`]. Each
//! command loads the manifest once, computes all per-release outcomes, and
//! writes the manifest once at the end. Network work for independent
//! releases runs concurrently; filesystem and manifest changes run serially.

use crate::config::Config;
use crate::download::{fetch_and_unpack, Unpacked};
use crate::error::{RelmaError, Result};
use crate::github::ReleaseSource;
use crate::install::{install_files, remove_installed_file, Placement};
use crate::manifest::{load_releases, save_releases, Releases};
use crate::reference::{self, parse_identity, ReleaseRef};
use crate::types::{Release, ResolvedRelease};
use chrono::Utc;
use futures_util::future::join_all;
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

/// Which tracked releases a batch command applies to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Scope {
    All,
    Only(Vec<(String, String)>),
}

impl Scope {
    /// No arguments means every tracked release.
    pub fn parse(args: &[String]) -> Result<Self> {
        if args.is_empty() {
            return Ok(Scope::All);
        }
        let mut seen = HashSet::new();
        let mut selected = Vec::new();
        for arg in args {
            let identity = parse_identity(arg)?;
            if seen.insert(identity.clone()) {
                selected.push(identity);
            }
        }
        Ok(Scope::Only(selected))
    }

    /// Targets in report order: manifest order for `All`, argument order otherwise.
    fn targets(&self, releases: &Releases) -> Vec<Target> {
        match self {
            Scope::All => releases
                .iter()
                .map(|r| Target {
                    owner: r.owner.clone(),
                    repo: r.repo.clone(),
                    release: Some(r.clone()),
                })
                .collect(),
            Scope::Only(identities) => identities
                .iter()
                .map(|(owner, repo)| Target {
                    owner: owner.clone(),
                    repo: repo.clone(),
                    release: releases.find(owner, repo).cloned(),
                })
                .collect(),
        }
    }
}

struct Target {
    owner: String,
    repo: String,
    release: Option<Release>,
}

impl Target {
    fn report(&self, status: EntryStatus) -> EntryReport {
        EntryReport {
            owner: self.owner.clone(),
            repo: self.repo.clone(),
            status,
        }
    }
}

#[derive(Debug)]
pub enum Operation {
    Install(ReleaseRef),
    Update(Scope),
    Upgrade { scope: Scope, yes: bool },
    Uninstall { owner: String, repo: String },
}

#[derive(Debug)]
pub enum Outcome {
    Installed(InstallReport),
    Updated(BatchReport),
    /// Upgrade planned but not confirmed; apply it with [`App::apply_upgrade`].
    UpgradePlanned(UpgradePlan),
    Upgraded(BatchReport),
    Uninstalled(UninstallReport),
}

#[derive(Debug)]
pub enum EntryStatus {
    Current { version: String },
    UpdateAvailable { current: String, latest: String },
    Upgraded { from: String, to: String },
    Failed(RelmaError),
}

#[derive(Debug)]
pub struct EntryReport {
    pub owner: String,
    pub repo: String,
    pub status: EntryStatus,
}

impl EntryReport {
    pub fn identity(&self) -> String {
        format!("{}/{}", self.owner, self.repo)
    }
}

/// Per-release outcomes of a batch command.
#[derive(Debug, Default)]
pub struct BatchReport {
    pub entries: Vec<EntryReport>,
}

impl BatchReport {
    pub fn failures(&self) -> impl Iterator<Item = &EntryReport> {
        self.entries
            .iter()
            .filter(|e| matches!(e.status, EntryStatus::Failed(_)))
    }

    pub fn has_failures(&self) -> bool {
        self.failures().next().is_some()
    }
}

#[derive(Debug)]
pub struct PendingUpgrade {
    pub current: Release,
    pub resolved: ResolvedRelease,
}

#[derive(Debug)]
pub enum PlannedEntry {
    /// Nothing to do (already current) or nothing possible (failed lookup).
    Settled(EntryReport),
    Pending(PendingUpgrade),
}

#[derive(Debug, Default)]
pub struct UpgradePlan {
    pub entries: Vec<PlannedEntry>,
}

impl UpgradePlan {
    pub fn pending(&self) -> impl Iterator<Item = &PendingUpgrade> {
        self.entries.iter().filter_map(|e| match e {
            PlannedEntry::Pending(p) => Some(p),
            PlannedEntry::Settled(_) => None,
        })
    }

    pub fn is_empty(&self) -> bool {
        self.pending().next().is_none()
    }
}

#[derive(Debug)]
pub struct InstallReport {
    pub release: Release,
    pub previous_version: Option<String>,
}

#[derive(Debug)]
pub struct UninstallReport {
    pub release: Release,
    pub removed: Vec<PathBuf>,
    /// Files listed in the manifest that were already gone.
    pub missing: Vec<PathBuf>,
    /// Files left in place because another release also lists them.
    pub kept: Vec<PathBuf>,
}

#[derive(Debug)]
pub struct InitReport {
    pub root: PathBuf,
    pub bin_dir: PathBuf,
    pub releases_file: PathBuf,
    pub created_manifest: bool,
}

pub struct App {
    config: Config,
    source: Box<dyn ReleaseSource>,
}

impl App {
    pub fn new(config: Config, source: impl ReleaseSource + 'static) -> Self {
        Self {
            config,
            source: Box::new(source),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn root(&self) -> &Path {
        &self.config.relma_root
    }

    fn load(&self) -> Result<Releases> {
        load_releases(&self.config.releases_file())
    }

    fn save(&self, releases: &Releases) -> Result<()> {
        save_releases(&self.config.releases_file(), releases)
    }

    pub async fn run(&self, operation: Operation) -> Result<Outcome> {
        tracing::debug!("Running {:?}", operation);
        match operation {
            Operation::Install(reference) => self.install(&reference).await.map(Outcome::Installed),
            Operation::Update(scope) => self.update(&scope).await.map(Outcome::Updated),
            Operation::Upgrade { scope, yes } => {
                let plan = self.plan_upgrade(&scope).await?;
                if yes {
                    self.apply_upgrade(plan).await.map(Outcome::Upgraded)
                } else {
                    Ok(Outcome::UpgradePlanned(plan))
                }
            }
            Operation::Uninstall { owner, repo } => {
                self.uninstall(&owner, &repo).map(Outcome::Uninstalled)
            }
        }
    }

    /// Create the root and bin directories and an empty manifest.
    pub fn init(&self) -> Result<InitReport> {
        let root = self.root().to_path_buf();
        let bin_dir = self.config.bin_dir();
        fs::create_dir_all(&bin_dir).map_err(|e| RelmaError::filesystem(&bin_dir, e))?;

        let releases_file = self.config.releases_file();
        let created_manifest = !releases_file.exists();
        if created_manifest {
            self.save(&Releases::default())?;
            tracing::info!("Created {}", releases_file.display());
        }

        Ok(InitReport {
            root,
            bin_dir,
            releases_file,
            created_manifest,
        })
    }

    pub fn list(&self) -> Result<Releases> {
        self.load()
    }

    pub async fn install(&self, reference: &ReleaseRef) -> Result<InstallReport> {
        let mut releases = self.load()?;
        let tracked = releases.find(&reference.owner, &reference.repo).cloned();

        let resolved = reference::resolve(self.source.as_ref(), reference, tracked.as_ref()).await?;
        tracing::info!(
            "Installing {} {}...",
            reference.identity(),
            resolved.version
        );

        let unpacked =
            fetch_and_unpack(self.source.as_ref(), &resolved.url, &resolved.asset_file_name).await?;
        let Placed {
            release,
            previous,
            placement,
        } = self.place(&mut releases, &resolved, &unpacked, None)?;
        drop(unpacked);

        self.commit(&releases, vec![placement])?;
        if let Some(previous) = &previous {
            self.remove_stale_files(&releases, previous);
        }

        tracing::info!(
            "Successfully installed {} {}",
            release.identity(),
            release.version
        );
        Ok(InstallReport {
            release,
            previous_version: previous.map(|p| p.version),
        })
    }

    /// Look up the latest tag of every release in scope and record it, without
    /// downloading anything.
    pub async fn update(&self, scope: &Scope) -> Result<BatchReport> {
        let mut releases = self.load()?;
        let targets = scope.targets(&releases);
        let latest = join_all(targets.iter().map(|t| self.latest_tag(t))).await;

        let mut report = BatchReport::default();
        let mut changed = false;
        for (target, latest) in targets.iter().zip(latest) {
            let status = match latest {
                Ok((current, latest)) => {
                    if let Some(release) = releases.find_mut(&target.owner, &target.repo) {
                        if release.latest_version.as_deref() != Some(latest.as_str()) {
                            release.latest_version = Some(latest.clone());
                            changed = true;
                        }
                    }
                    if latest == current.version {
                        EntryStatus::Current { version: latest }
                    } else {
                        EntryStatus::UpdateAvailable {
                            current: current.version,
                            latest,
                        }
                    }
                }
                Err(e) => EntryStatus::Failed(e),
            };
            report.entries.push(target.report(status));
        }

        if changed {
            self.save(&releases)?;
        }
        Ok(report)
    }

    /// Decide which releases in scope need an upgrade. Any difference between
    /// the tracked version and the latest tag counts, compared as plain strings.
    pub async fn plan_upgrade(&self, scope: &Scope) -> Result<UpgradePlan> {
        let releases = self.load()?;
        let targets = scope.targets(&releases);
        let latest = join_all(targets.iter().map(|t| self.latest_tag(t))).await;

        let mut plan = UpgradePlan::default();
        for (target, latest) in targets.iter().zip(latest) {
            let entry = match latest {
                Ok((current, latest)) if latest == current.version => {
                    tracing::info!("{} is up to date ({})", target_identity(target), latest);
                    PlannedEntry::Settled(target.report(EntryStatus::Current { version: latest }))
                }
                Ok((current, latest)) => {
                    let resolved = reference::resolve_from_tracked(&current, &latest);
                    PlannedEntry::Pending(PendingUpgrade { current, resolved })
                }
                Err(e) => PlannedEntry::Settled(target.report(EntryStatus::Failed(e))),
            };
            plan.entries.push(entry);
        }
        Ok(plan)
    }

    /// Download and install every pending entry of `plan`, replacing manifest
    /// entries in place. Failures are recorded per entry.
    pub async fn apply_upgrade(&self, plan: UpgradePlan) -> Result<BatchReport> {
        let mut releases = self.load()?;

        let downloads = join_all(plan.pending().map(|p| {
            fetch_and_unpack(
                self.source.as_ref(),
                &p.resolved.url,
                &p.resolved.asset_file_name,
            )
        }))
        .await;
        let mut downloads = downloads.into_iter();

        let mut report = BatchReport::default();
        let mut replaced = Vec::new();
        let mut placements = Vec::new();
        for entry in plan.entries {
            let pending = match entry {
                PlannedEntry::Settled(settled) => {
                    report.entries.push(settled);
                    continue;
                }
                PlannedEntry::Pending(pending) => pending,
            };
            let PendingUpgrade { current, resolved } = pending;
            let downloaded = downloads.next().unwrap_or_else(|| {
                Err(RelmaError::NotTracked {
                    owner: current.owner.clone(),
                    repo: current.repo.clone(),
                })
            });

            let outcome = downloaded.and_then(|unpacked| {
                if releases.find(&current.owner, &current.repo).is_none() {
                    return Err(RelmaError::NotTracked {
                        owner: current.owner.clone(),
                        repo: current.repo.clone(),
                    });
                }
                let latest = Some(resolved.version.clone());
                self.place(&mut releases, &resolved, &unpacked, latest)
            });

            let status = match outcome {
                Ok(Placed {
                    release,
                    previous,
                    placement,
                }) => {
                    tracing::info!(
                        "Upgraded {} {} -> {}",
                        release.identity(),
                        current.version,
                        release.version
                    );
                    let to = release.version.clone();
                    placements.push(placement);
                    if let Some(previous) = previous {
                        replaced.push(previous);
                    }
                    EntryStatus::Upgraded {
                        from: current.version.clone(),
                        to,
                    }
                }
                Err(e) => {
                    tracing::warn!("Failed to upgrade {}: {}", current.identity(), e);
                    EntryStatus::Failed(e)
                }
            };
            report.entries.push(EntryReport {
                owner: current.owner,
                repo: current.repo,
                status,
            });
        }

        if !placements.is_empty() {
            self.commit(&releases, placements)?;
            for previous in &replaced {
                self.remove_stale_files(&releases, previous);
            }
        }
        Ok(report)
    }

    /// Plan and, when `yes` is set, apply an upgrade.
    pub async fn upgrade(&self, scope: &Scope, yes: bool) -> Result<Outcome> {
        self.run(Operation::Upgrade {
            scope: scope.clone(),
            yes,
        })
        .await
    }

    /// Delete every file of `owner/repo`, then drop its manifest entry.
    ///
    /// Files already missing are fine, so running this again after a failed
    /// manifest write finishes the job. Files another entry also lists are
    /// left in place.
    pub fn uninstall(&self, owner: &str, repo: &str) -> Result<UninstallReport> {
        let mut releases = self.load()?;
        let release = releases
            .find(owner, repo)
            .cloned()
            .ok_or_else(|| RelmaError::NotTracked {
                owner: owner.to_string(),
                repo: repo.to_string(),
            })?;

        releases.remove(owner, repo);
        let owned_elsewhere = self.tracked_paths(&releases);

        let mut removed = Vec::new();
        let mut missing = Vec::new();
        let mut kept = Vec::new();
        for file in &release.installed_files {
            let path = file.resolve(self.root());
            if owned_elsewhere.contains(&path) {
                tracing::warn!(
                    "Keeping {}: another installed release also provides it",
                    path.display()
                );
                kept.push(path);
            } else if remove_installed_file(&path)? {
                removed.push(path);
            } else {
                missing.push(path);
            }
        }

        self.save(&releases)?;

        tracing::info!("Uninstalled {}", release.identity());
        Ok(UninstallReport {
            release,
            removed,
            missing,
            kept,
        })
    }

    async fn latest_tag(&self, target: &Target) -> Result<(Release, String)> {
        let release = target.release.clone().ok_or_else(|| RelmaError::NotTracked {
            owner: target.owner.clone(),
            repo: target.repo.clone(),
        })?;
        let latest = reference::fetch_latest_tag(self.source.as_ref(), &release.owner, &release.repo)
            .await?;
        Ok((release, latest))
    }

    /// Install `unpacked` and upsert the manifest entry (in memory only).
    ///
    /// Paths the new entry provides are dropped from any other entry that
    /// listed them, so each installed file has exactly one owner.
    fn place(
        &self,
        releases: &mut Releases,
        resolved: &ResolvedRelease,
        unpacked: &Unpacked,
        latest_version: Option<String>,
    ) -> Result<Placed> {
        let placement = install_files(unpacked, &self.config.bin_dir(), self.root())?;

        let release = Release {
            owner: resolved.owner.clone(),
            repo: resolved.repo.clone(),
            version: resolved.version.clone(),
            url: resolved.url.clone(),
            asset_file_name: resolved.asset_file_name.clone(),
            installed_files: placement.files().clone(),
            latest_version,
            installed_at: Some(Utc::now().to_rfc3339()),
        };

        let provided: HashSet<PathBuf> = release
            .installed_files
            .iter()
            .map(|f| f.resolve(self.root()))
            .collect();
        for other in releases.iter_mut() {
            if other.is(&release.owner, &release.repo) {
                continue;
            }
            let root = self.root();
            let identity = other.identity();
            other.installed_files.retain(|file| {
                let taken = provided.contains(&file.resolve(root));
                if taken {
                    tracing::warn!(
                        "{} now provides {}, replacing the copy from {}",
                        release.identity(),
                        file.path,
                        identity
                    );
                }
                !taken
            });
        }

        let previous = releases.upsert(release.clone());
        Ok(Placed {
            release,
            previous,
            placement,
        })
    }

    /// Persist `releases`, then settle `placements`: keep them when the write
    /// succeeded, undo them when it did not.
    fn commit(&self, releases: &Releases, placements: Vec<Placement>) -> Result<()> {
        match self.save(releases) {
            Ok(()) => {
                placements.into_iter().for_each(Placement::finish);
                Ok(())
            }
            Err(e) => {
                tracing::error!("Could not record installed files, rolling back: {}", e);
                placements.into_iter().rev().for_each(Placement::rollback);
                Err(e)
            }
        }
    }

    /// Every path the manifest lists, resolved against the root.
    fn tracked_paths(&self, releases: &Releases) -> HashSet<PathBuf> {
        releases
            .iter()
            .flat_map(|r| r.installed_files.iter())
            .map(|f| f.resolve(self.root()))
            .collect()
    }

    /// Remove files of `previous` that no entry of `releases` lists anymore.
    fn remove_stale_files(&self, releases: &Releases, previous: &Release) {
        let kept = self.tracked_paths(releases);

        for file in &previous.installed_files {
            let path = file.resolve(self.root());
            if kept.contains(&path) {
                continue;
            }
            if let Err(e) = remove_installed_file(&path) {
                tracing::warn!("Could not remove stale file {}: {}", path.display(), e);
            }
        }
    }
}

/// Result of `App::place`: the new entry, the entry it replaced, and the
/// files still awaiting `App::commit`.
struct Placed {
    release: Release,
    previous: Option<Release>,
    placement: Placement,
}

fn target_identity(target: &Target) -> String {
    format!("{}/{}", target.owner, target.repo)
}
