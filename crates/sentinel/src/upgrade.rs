// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Replaces an installed component's code (including the supervisor's own)
//! atomically, with automatic rollback on failure.
//!
//! The whole transaction for one target is serialised by a per-component
//! file lock; a concurrent upgrade of a *different* target is not
//! coordinated here at all, since each target's lock is independent.

use std::collections::HashMap;
use std::future::Future;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::pin::Pin;

use nix::fcntl::{Flock, FlockArg};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{info, warn};

use crate::config::{SharedConfig, UpgradeTuning};
use crate::status::{read_json, write_json_atomic};

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = anyhow::Result<T>> + Send + 'a>>;

/// `components.json` entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryEntry {
    pub version: String,
    pub repo: String,
    #[serde(rename = "type")]
    pub kind: ComponentKind,
    pub installed_at: i64,
    pub upgraded_at: Option<i64>,
    pub skill_dir: PathBuf,
    pub data_dir: PathBuf,
    pub bin: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComponentKind {
    Declarative,
    Ai,
}

/// `components.json`, keyed by component name.
pub type Registry = HashMap<String, RegistryEntry>;

pub fn load_registry(path: &Path) -> anyhow::Result<Registry> {
    Ok(read_json(path)?.unwrap_or_default())
}

pub fn save_registry(path: &Path, registry: &Registry) -> anyhow::Result<()> {
    write_json_atomic(path, registry)
}

/// Relative-path -> sha256 content hash, captured at install time and used
/// to detect local edits before an upgrade.
pub type Manifest = HashMap<String, String>;

/// Top-level subdirectory names inside a component's skill dir that an
/// upgrade's copy step never overwrites.
pub const PRESERVED_PATHS: &[&str] = &["node_modules", "data"];

/// Walk `root` and hash every file not under a [`PRESERVED_PATHS`] entry.
pub fn capture_manifest(root: &Path) -> anyhow::Result<Manifest> {
    let mut manifest = Manifest::new();
    if root.exists() {
        walk_files(root, root, &mut manifest)?;
    }
    Ok(manifest)
}

fn walk_files(root: &Path, dir: &Path, out: &mut Manifest) -> anyhow::Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            let rel = path.strip_prefix(root).unwrap_or(&path);
            let top = rel.components().next().map(|c| c.as_os_str().to_string_lossy().into_owned());
            if top.as_deref().is_some_and(|t| PRESERVED_PATHS.contains(&t)) {
                continue;
            }
            walk_files(root, &path, out)?;
        } else if file_type.is_file() {
            let rel = path.strip_prefix(root).unwrap_or(&path).to_string_lossy().replace('\\', "/");
            out.insert(rel, hash_file(&path)?);
        }
    }
    Ok(())
}

fn hash_file(path: &Path) -> anyhow::Result<String> {
    let bytes = std::fs::read(path)?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    Ok(format!("{:x}", hasher.finalize()))
}

/// Files a recorded install-time manifest disagrees with the current
/// on-disk state about.
#[derive(Debug, Default, Clone, Serialize)]
pub struct LocalModifications {
    pub modified: Vec<String>,
    pub added: Vec<String>,
    pub removed: Vec<String>,
}

pub fn detect_local_modifications(installed: &Manifest, current: &Manifest) -> LocalModifications {
    let mut out = LocalModifications::default();
    for (path, hash) in current {
        match installed.get(path) {
            None => out.added.push(path.clone()),
            Some(h) if h != hash => out.modified.push(path.clone()),
            _ => {}
        }
    }
    for path in installed.keys() {
        if !current.contains_key(path) {
            out.removed.push(path.clone());
        }
    }
    out.added.sort();
    out.modified.sort();
    out.removed.sort();
    out
}

/// A unified-style diff for one file that changed between the current
/// install and the new release.
#[derive(Debug, Clone, Serialize)]
pub struct FileDiff {
    pub path: String,
    /// `None` when either side is missing or not valid UTF-8 (binary files
    /// are reported as changed without a textual diff).
    pub diff: Option<String>,
}

/// Diff every "interesting" path: present in either manifest but not
/// identical between `current_dir` and `new_dir`.
pub fn diff_release(current_dir: &Path, new_dir: &Path, current: &Manifest, new: &Manifest) -> Vec<FileDiff> {
    let mut paths: Vec<&String> = current
        .iter()
        .filter(|(path, hash)| new.get(*path) != Some(hash))
        .map(|(path, _)| path)
        .chain(new.keys().filter(|path| !current.contains_key(*path)))
        .collect();
    paths.sort();
    paths.dedup();

    paths
        .into_iter()
        .map(|path| {
            let old_text = std::fs::read_to_string(current_dir.join(path)).ok();
            let new_text = std::fs::read_to_string(new_dir.join(path)).ok();
            let diff = match (old_text, new_text) {
                (Some(o), Some(n)) => Some(unified_diff(&o, &n)),
                _ => None,
            };
            FileDiff { path: path.clone(), diff }
        })
        .collect()
}

/// A minimal line-oriented unified diff (`-`/`+`/` ` prefixed lines) built
/// from a longest-common-subsequence alignment of the two texts' lines.
pub fn unified_diff(old: &str, new: &str) -> String {
    let old_lines: Vec<&str> = old.lines().collect();
    let new_lines: Vec<&str> = new.lines().collect();
    let aligned = lcs_indices(&old_lines, &new_lines);

    let mut out = String::new();
    let (mut i, mut j) = (0, 0);
    for (oi, ni) in aligned {
        while i < oi {
            out.push('-');
            out.push_str(old_lines[i]);
            out.push('\n');
            i += 1;
        }
        while j < ni {
            out.push('+');
            out.push_str(new_lines[j]);
            out.push('\n');
            j += 1;
        }
        out.push(' ');
        out.push_str(old_lines[oi]);
        out.push('\n');
        i += 1;
        j += 1;
    }
    while i < old_lines.len() {
        out.push('-');
        out.push_str(old_lines[i]);
        out.push('\n');
        i += 1;
    }
    while j < new_lines.len() {
        out.push('+');
        out.push_str(new_lines[j]);
        out.push('\n');
        j += 1;
    }
    out
}

fn lcs_indices(a: &[&str], b: &[&str]) -> Vec<(usize, usize)> {
    let (n, m) = (a.len(), b.len());
    let mut dp = vec![vec![0u32; m + 1]; n + 1];
    for i in (0..n).rev() {
        for j in (0..m).rev() {
            dp[i][j] = if a[i] == b[j] {
                dp[i + 1][j + 1] + 1
            } else {
                dp[i + 1][j].max(dp[i][j + 1])
            };
        }
    }
    let mut pairs = Vec::new();
    let (mut i, mut j) = (0, 0);
    while i < n && j < m {
        if a[i] == b[j] {
            pairs.push((i, j));
            i += 1;
            j += 1;
        } else if dp[i + 1][j] >= dp[i][j + 1] {
            i += 1;
        } else {
            j += 1;
        }
    }
    pairs
}

/// Result of the lock-free "Check" phase.
#[derive(Debug, Clone, Serialize)]
pub struct CheckResult {
    pub has_update: bool,
    pub current: String,
    pub latest: String,
    pub repo: String,
}

/// Status of one reported apply sub-step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Done,
    Skipped,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct StepReport {
    pub step: u32,
    pub total: u32,
    pub name: &'static str,
    pub status: StepStatus,
    pub message: Option<String>,
    pub error: Option<String>,
}

/// Rollback actions replayed after a failed apply step.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RollbackReport {
    pub performed: bool,
    pub steps: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct UpgradeReport {
    pub success: bool,
    pub failed_step: Option<u32>,
    pub error: Option<String>,
    pub rollback: Option<RollbackReport>,
    pub steps: Vec<StepReport>,
}

/// Fetches the latest published version for a component's repo. Injected
/// so `Upgrader` is testable without network access.
pub trait VersionChecker: Send + Sync {
    fn latest_tag<'a>(&'a self, repo: &'a str) -> BoxFuture<'a, String>;
}

/// Fetches and extracts a release archive into `dest_dir`.
pub trait Downloader: Send + Sync {
    fn download<'a>(&'a self, repo: &'a str, tag: &'a str, dest_dir: &'a Path) -> BoxFuture<'a, ()>;
}

/// Starts, stops, and polls the online-ness of a target's managed service.
pub trait ServiceManager: Send + Sync {
    fn stop<'a>(&'a self, service: &'a str) -> BoxFuture<'a, ()>;
    fn start<'a>(&'a self, service: &'a str) -> BoxFuture<'a, ()>;
    fn is_online<'a>(&'a self, service: &'a str) -> BoxFuture<'a, bool>;
}

/// Runs a component's post-install hook script if one is present.
pub trait HookRunner: Send + Sync {
    fn run<'a>(&'a self, hook_path: &'a Path) -> BoxFuture<'a, ()>;
}

/// `reqwest`-backed [`VersionChecker`] against the GitHub releases API.
pub struct GitHubReleaseChecker {
    client: reqwest::Client,
}

impl GitHubReleaseChecker {
    pub fn new() -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(UpgradeTuning::DOWNLOAD_TIMEOUT)
            .user_agent("sentinel-upgrader")
            .build()?;
        Ok(Self { client })
    }
}

impl VersionChecker for GitHubReleaseChecker {
    fn latest_tag<'a>(&'a self, repo: &'a str) -> BoxFuture<'a, String> {
        Box::pin(async move {
            let url = format!("https://api.github.com/repos/{repo}/releases/latest");
            let body: serde_json::Value = self.client.get(&url).send().await?.error_for_status()?.json().await?;
            body.get("tag_name")
                .and_then(|v| v.as_str())
                .map(str::to_string)
                .ok_or_else(|| anyhow::anyhow!("release response for '{repo}' missing tag_name"))
        })
    }
}

/// `reqwest` + `tar`/`flate2` backed [`Downloader`] for `.tar.gz` release
/// assets.
pub struct ReqwestDownloader {
    client: reqwest::Client,
}

impl ReqwestDownloader {
    pub fn new() -> anyhow::Result<Self> {
        let client = reqwest::Client::builder().timeout(UpgradeTuning::DOWNLOAD_TIMEOUT).build()?;
        Ok(Self { client })
    }
}

impl Downloader for ReqwestDownloader {
    fn download<'a>(&'a self, repo: &'a str, tag: &'a str, dest_dir: &'a Path) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            let url = format!("https://github.com/{repo}/archive/refs/tags/{tag}.tar.gz");
            let body = self.client.get(&url).send().await?.error_for_status()?.bytes().await?;
            std::fs::create_dir_all(dest_dir)?;
            let decoder = flate2::read::GzDecoder::new(Cursor::new(body));
            tar::Archive::new(decoder).unpack(dest_dir)?;
            Ok(())
        })
    }
}

/// Shells out to `<skill_dir>/scripts/service.sh {stop|start|status}`, the
/// same per-component script convention as the channel adapters' `send.js`
///, with an explicit
/// wall-clock timeout.
pub struct ScriptServiceManager {
    script: PathBuf,
}

impl ScriptServiceManager {
    pub fn new(script: PathBuf) -> Self {
        Self { script }
    }

    async fn run(&self, arg: &str) -> anyhow::Result<std::process::Output> {
        let fut = tokio::process::Command::new(&self.script).arg(arg).output();
        tokio::time::timeout(UpgradeTuning::SUBPROCESS_TIMEOUT, fut)
            .await
            .map_err(|_| anyhow::anyhow!("service script '{}' {arg} timed out", self.script.display()))?
            .map_err(Into::into)
    }
}

impl ServiceManager for ScriptServiceManager {
    fn stop<'a>(&'a self, _service: &'a str) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            self.run("stop").await?;
            Ok(())
        })
    }
    fn start<'a>(&'a self, _service: &'a str) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            self.run("start").await?;
            Ok(())
        })
    }
    fn is_online<'a>(&'a self, _service: &'a str) -> BoxFuture<'a, bool> {
        Box::pin(async move { Ok(self.run("status").await.map(|out| out.status.success()).unwrap_or(false)) })
    }
}

/// Runs `<hook_path>` with an explicit timeout if it exists; missing hooks
/// are skipped, not an error.
pub struct SubprocessHookRunner;

impl HookRunner for SubprocessHookRunner {
    fn run<'a>(&'a self, hook_path: &'a Path) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            if !hook_path.exists() {
                return Ok(());
            }
            let fut = tokio::process::Command::new(hook_path).output();
            let output = tokio::time::timeout(UpgradeTuning::SUBPROCESS_TIMEOUT, fut)
                .await
                .map_err(|_| anyhow::anyhow!("post-install hook '{}' timed out", hook_path.display()))??;
            if !output.status.success() {
                anyhow::bail!(
                    "post-install hook '{}' exited with {}",
                    hook_path.display(),
                    output.status
                );
            }
            Ok(())
        })
    }
}

/// Install-root-relative paths the upgrader needs.
#[derive(Debug, Clone)]
pub struct UpgradePaths {
    pub root: PathBuf,
    pub locks_dir: PathBuf,
    pub registry_path: PathBuf,
}

impl UpgradePaths {
    pub fn from_config(cfg: &SharedConfig) -> Self {
        Self {
            root: cfg.root_dir(),
            locks_dir: cfg.locks_dir(),
            registry_path: cfg.registry_path(),
        }
    }

    fn backup_dir(&self, name: &str) -> PathBuf {
        self.root.join(".backup").join(name)
    }
}

/// The staged, lock-protected upgrade transaction.
pub struct Upgrader<V: VersionChecker, D: Downloader, S: ServiceManager, H: HookRunner> {
    paths: UpgradePaths,
    version_checker: V,
    downloader: D,
    service_manager: S,
    hook_runner: H,
}

impl<V: VersionChecker, D: Downloader, S: ServiceManager, H: HookRunner> Upgrader<V, D, S, H> {
    pub fn new(paths: UpgradePaths, version_checker: V, downloader: D, service_manager: S, hook_runner: H) -> Self {
        Self {
            paths,
            version_checker,
            downloader,
            service_manager,
            hook_runner,
        }
    }

    /// Step 1: fetch remote latest tag and compare, without taking the
    /// lock.
    pub async fn check(&self, name: &str) -> anyhow::Result<CheckResult> {
        let registry = load_registry(&self.paths.registry_path)?;
        let entry = registry
            .get(name)
            .ok_or_else(|| anyhow::anyhow!("unknown component '{name}'"))?;
        let latest = self.version_checker.latest_tag(&entry.repo).await?;
        Ok(CheckResult {
            has_update: latest != entry.version,
            current: entry.version.clone(),
            latest,
            repo: entry.repo.clone(),
        })
    }

    /// Steps 2-8 of the upgrade transaction: acquire the
    /// per-component lock, download, analyse, optionally confirm, then run
    /// the staged apply with auto-rollback. `confirm` is `None` in
    /// non-interactive mode, which skips step 5 entirely.
    pub async fn apply(
        &self,
        name: &str,
        now: i64,
        confirm: Option<&(dyn Fn(&CheckResult, &[FileDiff]) -> bool + Send + Sync)>,
        mut on_progress: impl FnMut(StepReport),
    ) -> anyhow::Result<UpgradeReport> {
        std::fs::create_dir_all(&self.paths.locks_dir)?;
        let lock_path = self.paths.locks_dir.join(format!("{name}.lock"));
        let lock_file = std::fs::OpenOptions::new().create(true).write(true).open(&lock_path)?;
        let _guard = Flock::lock(lock_file, FlockArg::LockExclusiveNonblock)
            .map_err(|(_file, errno)| anyhow::anyhow!("upgrade of '{name}' already in progress: {errno}"))?;

        let mut registry = load_registry(&self.paths.registry_path)?;
        let entry = registry
            .get(name)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("unknown component '{name}'"))?;

        let check = self.check(name).await?;
        if !check.has_update {
            return Ok(UpgradeReport {
                success: true,
                failed_step: None,
                error: None,
                rollback: None,
                steps: vec![],
            });
        }

        let download_dir = tempfile::tempdir()?;
        self.downloader.download(&entry.repo, &check.latest, download_dir.path()).await?;

        let manifest_path = self.paths.root.join("components").join(format!("{name}.manifest.json"));
        let installed_manifest: Manifest = read_json(&manifest_path)?.unwrap_or_default();
        let current_manifest = capture_manifest(&entry.skill_dir)?;
        let local_mods = detect_local_modifications(&installed_manifest, &current_manifest);
        if !local_mods.modified.is_empty() || !local_mods.added.is_empty() {
            warn!(component = name, modified = local_mods.modified.len(), added = local_mods.added.len(), "local edits detected before upgrade");
        }
        let new_manifest = capture_manifest(download_dir.path())?;
        let diffs = diff_release(&entry.skill_dir, download_dir.path(), &current_manifest, &new_manifest);

        if let Some(confirm) = confirm {
            if !confirm(&check, &diffs) {
                return Ok(UpgradeReport {
                    success: false,
                    failed_step: None,
                    error: Some("upgrade declined by operator".to_string()),
                    rollback: None,
                    steps: vec![],
                });
            }
        }

        let mut steps = Vec::new();
        let total = 8u32;
        let service = entry.bin.as_deref().unwrap_or(name);
        let backup_dir = self.paths.backup_dir(name).join(now.to_string());

        macro_rules! report {
            ($step:expr, $name:expr, $status:expr, $message:expr) => {{
                let r = StepReport { step: $step, total, name: $name, status: $status, message: $message, error: None };
                on_progress(r.clone());
                steps.push(r);
            }};
        }

        macro_rules! fail_and_rollback {
            ($step:expr, $name:expr, $err:expr) => {{
                let err_msg = $err.to_string();
                let failed = StepReport {
                    step: $step,
                    total,
                    name: $name,
                    status: StepStatus::Failed,
                    message: None,
                    error: Some(err_msg.clone()),
                };
                on_progress(failed.clone());
                steps.push(failed);
                let rollback = self
                    .rollback(
                        &entry.skill_dir,
                        &backup_dir,
                        service,
                        $step >= 2,
                        $step >= 6,
                        name,
                        &entry,
                        &installed_manifest,
                        &manifest_path,
                    )
                    .await;
                return Ok(UpgradeReport {
                    success: false,
                    failed_step: Some($step),
                    error: Some(err_msg),
                    rollback: Some(rollback),
                    steps,
                });
            }};
        }

        // Step 1: snapshot.
        if let Err(e) = snapshot_dir(&entry.skill_dir, &backup_dir) {
            fail_and_rollback!(1, "snapshot", e);
        }
        report!(1, "snapshot", StepStatus::Done, None);

        // Step 2: stop services.
        if let Err(e) = self.service_manager.stop(service).await {
            fail_and_rollback!(2, "stop_services", e);
        }
        report!(2, "stop_services", StepStatus::Done, None);

        // Step 3: copy extracted files over the install dir, preserving
        // node_modules/data subdirectories.
        if let Err(e) = copy_tree_preserving(download_dir.path(), &entry.skill_dir, PRESERVED_PATHS) {
            fail_and_rollback!(3, "copy_files", e);
        }
        report!(3, "copy_files", StepStatus::Done, None);

        // Step 4: platform dependencies. No manifest-declared dependency
        // installer exists yet; nothing to do is a success, not a skip,
        // since the step always completes for the components this crate
        // currently manages.
        report!(4, "install_platform_deps", StepStatus::Skipped, Some("no platform dependencies declared".to_string()));

        // Step 5: post-install hook.
        let hook_path = entry.skill_dir.join("scripts").join("post-install.sh");
        if let Err(e) = self.hook_runner.run(&hook_path).await {
            fail_and_rollback!(5, "post_install_hook", e);
        }
        report!(5, "post_install_hook", StepStatus::Done, None);

        // Step 6: regenerate manifest, update registry.
        let fresh_manifest = match capture_manifest(&entry.skill_dir) {
            Ok(m) => m,
            Err(e) => fail_and_rollback!(6, "update_manifest_registry", e),
        };
        if let Err(e) = write_json_atomic(&manifest_path, &fresh_manifest) {
            fail_and_rollback!(6, "update_manifest_registry", e);
        }
        let mut updated_entry = entry.clone();
        updated_entry.version = check.latest.clone();
        updated_entry.upgraded_at = Some(now);
        registry.insert(name.to_string(), updated_entry);
        if let Err(e) = save_registry(&self.paths.registry_path, &registry) {
            fail_and_rollback!(6, "update_manifest_registry", e);
        }
        report!(6, "update_manifest_registry", StepStatus::Done, None);

        // Step 7: start services.
        if let Err(e) = self.service_manager.start(service).await {
            fail_and_rollback!(7, "start_services", e);
        }
        report!(7, "start_services", StepStatus::Done, None);

        // Step 8: verify online, polling with a deadline.
        if let Err(e) = self.wait_online(service).await {
            fail_and_rollback!(8, "verify_online", e);
        }
        report!(8, "verify_online", StepStatus::Done, None);

        prune_old_snapshots(&self.paths.backup_dir(name), &backup_dir);

        info!(component = name, version = %check.latest, "upgrade applied");
        Ok(UpgradeReport { success: true, failed_step: None, error: None, rollback: None, steps })
    }

    async fn wait_online(&self, service: &str) -> anyhow::Result<()> {
        let deadline = tokio::time::Instant::now() + UpgradeTuning::SERVICE_VERIFY_DEADLINE;
        loop {
            if self.service_manager.is_online(service).await? {
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                anyhow::bail!("service '{service}' did not come online before the verify deadline");
            }
            tokio::time::sleep(UpgradeTuning::SERVICE_VERIFY_POLL_INTERVAL).await;
        }
    }

    /// Replay the snapshot over the install dir, restart services, and (when
    /// the failure happened at or after step 6) revert `components.json` and
    /// the manifest to their pre-upgrade contents — step 6 is the point
    /// where those two files stop reflecting the installed version, so a
    /// failure at step 6, 7, or 8 must undo them too or `apply` would report
    /// `success=false` while the registry still shows the new version.
    /// Never returns an error: rollback failures are logged and reflected in
    /// the report instead, since the caller is already unwinding a failure.
    #[allow(clippy::too_many_arguments)]
    async fn rollback(
        &self,
        skill_dir: &Path,
        backup_dir: &Path,
        service: &str,
        restore_files: bool,
        restore_registry: bool,
        name: &str,
        original_entry: &RegistryEntry,
        original_manifest: &Manifest,
        manifest_path: &Path,
    ) -> RollbackReport {
        let mut performed_steps = Vec::new();
        if restore_files && backup_dir.exists() {
            match copy_tree_preserving(backup_dir, skill_dir, &[]) {
                Ok(()) => performed_steps.push("restore_snapshot".to_string()),
                Err(e) => warn!(error = %e, "rollback: failed to restore snapshot"),
            }
        }
        if restore_registry {
            match write_json_atomic(manifest_path, original_manifest) {
                Ok(()) => performed_steps.push("restore_manifest".to_string()),
                Err(e) => warn!(error = %e, "rollback: failed to restore manifest"),
            }
            match load_registry(&self.paths.registry_path) {
                Ok(mut registry) => {
                    registry.insert(name.to_string(), original_entry.clone());
                    match save_registry(&self.paths.registry_path, &registry) {
                        Ok(()) => performed_steps.push("restore_registry".to_string()),
                        Err(e) => warn!(error = %e, "rollback: failed to restore components.json"),
                    }
                }
                Err(e) => warn!(error = %e, "rollback: failed to reload components.json for restore"),
            }
        }
        match self.service_manager.start(service).await {
            Ok(()) => performed_steps.push("restart_services".to_string()),
            Err(e) => warn!(error = %e, "rollback: failed to restart services"),
        }
        RollbackReport { performed: !performed_steps.is_empty(), steps: performed_steps }
    }
}

fn snapshot_dir(src: &Path, dest: &Path) -> anyhow::Result<()> {
    if let Some(parent) = dest.parent() {
        std::fs::create_dir_all(parent)?;
    }
    copy_tree_preserving(src, dest, &[])
}

/// Recursively copy `src` over `dest`, skipping any top-level subdirectory
/// of `src` named in `preserve` (those are left untouched in `dest`).
fn copy_tree_preserving(src: &Path, dest: &Path, preserve: &[&str]) -> anyhow::Result<()> {
    if !src.exists() {
        return Ok(());
    }
    std::fs::create_dir_all(dest)?;
    for entry in std::fs::read_dir(src)? {
        let entry = entry?;
        let name = entry.file_name();
        if preserve.iter().any(|p| std::ffi::OsStr::new(p) == name.as_os_str()) {
            continue;
        }
        let from = entry.path();
        let to = dest.join(&name);
        if entry.file_type()?.is_dir() {
            copy_tree_preserving(&from, &to, &[])?;
        } else {
            std::fs::copy(&from, &to)?;
        }
    }
    Ok(())
}

/// Keep only the most recent snapshot under `<root>/.backup/<name>/`.
fn prune_old_snapshots(backups_root: &Path, keep: &Path) {
    let Ok(entries) = std::fs::read_dir(backups_root) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path != keep {
            let _ = std::fs::remove_dir_all(&path);
        }
    }
}

#[cfg(test)]
#[path = "upgrade_tests.rs"]
mod tests;
