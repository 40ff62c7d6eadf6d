// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

#![allow(clippy::unwrap_used)]

use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use super::*;

#[test]
fn capture_manifest_skips_preserved_paths() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("index.js"), b"hello").unwrap();
    std::fs::create_dir_all(dir.path().join("node_modules/pkg")).unwrap();
    std::fs::write(dir.path().join("node_modules/pkg/lib.js"), b"vendored").unwrap();

    let manifest = capture_manifest(dir.path()).unwrap();
    assert_eq!(manifest.len(), 1);
    assert!(manifest.contains_key("index.js"));
}

#[test]
fn detect_local_modifications_reports_added_and_modified() {
    let mut installed = Manifest::new();
    installed.insert("a.js".to_string(), "hash-a".to_string());
    installed.insert("b.js".to_string(), "hash-b".to_string());

    let mut current = Manifest::new();
    current.insert("a.js".to_string(), "hash-a".to_string());
    current.insert("b.js".to_string(), "hash-b-edited".to_string());
    current.insert("c.js".to_string(), "hash-c".to_string());

    let mods = detect_local_modifications(&installed, &current);
    assert_eq!(mods.added, vec!["c.js".to_string()]);
    assert_eq!(mods.modified, vec!["b.js".to_string()]);
    assert!(mods.removed.is_empty());
}

#[test]
fn unified_diff_marks_added_removed_and_common_lines() {
    let old = "one\ntwo\nthree\n";
    let new = "one\ntwo-changed\nthree\nfour\n";
    let diff = unified_diff(old, new);
    assert!(diff.contains("-two"));
    assert!(diff.contains("+two-changed"));
    assert!(diff.contains(" one"));
    assert!(diff.contains(" three"));
    assert!(diff.contains("+four"));
}

struct FakeVersionChecker {
    tag: String,
}

impl VersionChecker for FakeVersionChecker {
    fn latest_tag<'a>(&'a self, _repo: &'a str) -> BoxFuture<'a, String> {
        Box::pin(async move { Ok(self.tag.clone()) })
    }
}

struct FakeDownloader {
    files: Vec<(&'static str, &'static str)>,
}

impl Downloader for FakeDownloader {
    fn download<'a>(&'a self, _repo: &'a str, _tag: &'a str, dest_dir: &'a Path) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            std::fs::create_dir_all(dest_dir)?;
            for (name, contents) in &self.files {
                std::fs::write(dest_dir.join(name), contents)?;
            }
            Ok(())
        })
    }
}

#[derive(Default)]
struct FakeServiceManager {
    online: AtomicBool,
    stop_calls: AtomicU32,
    start_calls: AtomicU32,
    fail_start: AtomicU32,
}

impl ServiceManager for FakeServiceManager {
    fn stop<'a>(&'a self, _service: &'a str) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            self.stop_calls.fetch_add(1, Ordering::SeqCst);
            self.online.store(false, Ordering::SeqCst);
            Ok(())
        })
    }
    fn start<'a>(&'a self, _service: &'a str) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            self.start_calls.fetch_add(1, Ordering::SeqCst);
            // The first `fail_start` calls to `start` fail (used to force a
            // step-7 failure after step 6 already wrote the new version);
            // the rollback's own restart_services call always succeeds.
            if self.fail_start.load(Ordering::SeqCst) > 0 && self.start_calls.load(Ordering::SeqCst) == 1 {
                self.fail_start.fetch_sub(1, Ordering::SeqCst);
                anyhow::bail!("service failed to start");
            }
            self.online.store(true, Ordering::SeqCst);
            Ok(())
        })
    }
    fn is_online<'a>(&'a self, _service: &'a str) -> BoxFuture<'a, bool> {
        Box::pin(async move { Ok(self.online.load(Ordering::SeqCst)) })
    }
}

struct FakeHookRunner {
    fail: bool,
}

impl HookRunner for FakeHookRunner {
    fn run<'a>(&'a self, _hook_path: &'a Path) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            if self.fail {
                anyhow::bail!("post-install hook exited non-zero");
            }
            Ok(())
        })
    }
}

struct Harness {
    _dir: tempfile::TempDir,
    paths: UpgradePaths,
}

fn seed_component(name: &str, old_version: &str) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().to_path_buf();
    let skill_dir = root.join("skills").join(name);
    std::fs::create_dir_all(&skill_dir).unwrap();
    std::fs::write(skill_dir.join("index.js"), b"console.log('old')").unwrap();

    let mut registry = Registry::new();
    registry.insert(
        name.to_string(),
        RegistryEntry {
            version: old_version.to_string(),
            repo: "zylos/telegram".to_string(),
            kind: ComponentKind::Declarative,
            installed_at: 0,
            upgraded_at: None,
            skill_dir,
            data_dir: root.join("components").join(name),
            bin: Some(format!("zylos-{name}")),
        },
    );
    let paths = UpgradePaths {
        root: root.clone(),
        locks_dir: root.join("locks"),
        registry_path: root.join("components.json"),
    };
    save_registry(&paths.registry_path, &registry).unwrap();
    Harness { _dir: dir, paths }
}

#[tokio::test]
async fn check_reports_has_update_when_latest_differs() {
    let harness = seed_component("telegram", "0.1.0");
    let upgrader = Upgrader::new(
        harness.paths.clone(),
        FakeVersionChecker { tag: "0.2.0".to_string() },
        FakeDownloader { files: vec![] },
        FakeServiceManager::default(),
        FakeHookRunner { fail: false },
    );

    let result = upgrader.check("telegram").await.unwrap();
    assert!(result.has_update);
    assert_eq!(result.current, "0.1.0");
    assert_eq!(result.latest, "0.2.0");
}

#[tokio::test]
async fn apply_succeeds_and_updates_registry_and_manifest() {
    let harness = seed_component("telegram", "0.1.0");
    let service = FakeServiceManager::default();
    let upgrader = Upgrader::new(
        harness.paths.clone(),
        FakeVersionChecker { tag: "0.2.0".to_string() },
        FakeDownloader { files: vec![("index.js", "console.log('new')")] },
        service,
        FakeHookRunner { fail: false },
    );

    let mut seen_steps = Vec::new();
    let report = upgrader
        .apply("telegram", 1000, None, |r| seen_steps.push(r.name))
        .await
        .unwrap();

    assert!(report.success);
    assert_eq!(report.steps.len(), 8);
    assert_eq!(
        seen_steps,
        vec![
            "snapshot",
            "stop_services",
            "copy_files",
            "install_platform_deps",
            "post_install_hook",
            "update_manifest_registry",
            "start_services",
            "verify_online",
        ]
    );

    let registry = load_registry(&harness.paths.registry_path).unwrap();
    let entry = &registry["telegram"];
    assert_eq!(entry.version, "0.2.0");
    assert_eq!(entry.upgraded_at, Some(1000));

    let installed = std::fs::read_to_string(entry.skill_dir.join("index.js")).unwrap();
    assert_eq!(installed, "console.log('new')");
}

/// Mirrors spec scenario S6: steps 1-4 succeed, the post-install hook (step
/// 5) fails; expect rollback, registry still at the old version, a backup
/// directory retained, and the service restarted.
#[tokio::test]
async fn apply_rolls_back_on_post_install_hook_failure() {
    let harness = seed_component("telegram", "0.1.0");
    let upgrader = Upgrader::new(
        harness.paths.clone(),
        FakeVersionChecker { tag: "0.2.0".to_string() },
        FakeDownloader { files: vec![("index.js", "console.log('new')")] },
        FakeServiceManager::default(),
        FakeHookRunner { fail: true },
    );

    let report = upgrader.apply("telegram", 2000, None, |_| {}).await.unwrap();

    assert!(!report.success);
    assert_eq!(report.failed_step, Some(5));
    let rollback = report.rollback.unwrap();
    assert!(rollback.performed);
    assert!(rollback.steps.contains(&"restore_snapshot".to_string()));
    assert!(rollback.steps.contains(&"restart_services".to_string()));

    let registry = load_registry(&harness.paths.registry_path).unwrap();
    assert_eq!(registry["telegram"].version, "0.1.0");

    let skill_dir = &registry["telegram"].skill_dir;
    let contents = std::fs::read_to_string(skill_dir.join("index.js")).unwrap();
    assert_eq!(contents, "console.log('old')");

    let backups = harness.paths.backup_dir("telegram");
    assert!(backups.join("2000").exists());
}

/// Upgrade atomicity law (SS8): a failure at or after step 6 (which already
/// wrote the new version into `components.json` and the manifest) must
/// revert both files, not just the skill directory and services.
#[tokio::test]
async fn apply_rolls_back_registry_and_manifest_on_start_services_failure() {
    let harness = seed_component("telegram", "0.1.0");
    let service = FakeServiceManager {
        fail_start: AtomicU32::new(1),
        ..Default::default()
    };
    let upgrader = Upgrader::new(
        harness.paths.clone(),
        FakeVersionChecker { tag: "0.2.0".to_string() },
        FakeDownloader { files: vec![("index.js", "console.log('new')")] },
        service,
        FakeHookRunner { fail: false },
    );

    let report = upgrader.apply("telegram", 5000, None, |_| {}).await.unwrap();

    assert!(!report.success);
    assert_eq!(report.failed_step, Some(7));
    let rollback = report.rollback.unwrap();
    assert!(rollback.performed);
    assert!(rollback.steps.contains(&"restore_registry".to_string()));
    assert!(rollback.steps.contains(&"restore_manifest".to_string()));
    assert!(rollback.steps.contains(&"restart_services".to_string()));

    let registry = load_registry(&harness.paths.registry_path).unwrap();
    assert_eq!(registry["telegram"].version, "0.1.0");
    assert_eq!(registry["telegram"].upgraded_at, None);

    let manifest_path = harness.paths.root.join("components").join("telegram.manifest.json");
    let manifest: Manifest = read_json(&manifest_path).unwrap().unwrap_or_default();
    assert!(manifest.is_empty(), "no manifest existed before the upgrade; restore must not invent one");
}

#[tokio::test]
async fn apply_is_noop_when_already_up_to_date() {
    let harness = seed_component("telegram", "0.2.0");
    let upgrader = Upgrader::new(
        harness.paths.clone(),
        FakeVersionChecker { tag: "0.2.0".to_string() },
        FakeDownloader { files: vec![] },
        FakeServiceManager::default(),
        FakeHookRunner { fail: false },
    );

    let report = upgrader.apply("telegram", 3000, None, |_| {}).await.unwrap();
    assert!(report.success);
    assert!(report.steps.is_empty());
}

#[tokio::test]
async fn apply_fails_fast_on_lock_contention() {
    let harness = seed_component("telegram", "0.1.0");
    std::fs::create_dir_all(&harness.paths.locks_dir).unwrap();
    let lock_path = harness.paths.locks_dir.join("telegram.lock");
    let held = std::fs::OpenOptions::new().create(true).write(true).open(&lock_path).unwrap();
    let _guard = Flock::lock(held, FlockArg::LockExclusiveNonblock).unwrap();

    let upgrader = Upgrader::new(
        harness.paths.clone(),
        FakeVersionChecker { tag: "0.2.0".to_string() },
        FakeDownloader { files: vec![] },
        FakeServiceManager::default(),
        FakeHookRunner { fail: false },
    );

    let err = upgrader.apply("telegram", 4000, None, |_| {}).await.unwrap_err();
    assert!(err.to_string().contains("already in progress"));
}

#[test]
fn prune_old_snapshots_keeps_only_the_given_directory() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::create_dir_all(dir.path().join("1000")).unwrap();
    std::fs::create_dir_all(dir.path().join("2000")).unwrap();

    prune_old_snapshots(dir.path(), &dir.path().join("2000"));

    assert!(!dir.path().join("1000").exists());
    assert!(dir.path().join("2000").exists());
}
