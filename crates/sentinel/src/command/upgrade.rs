// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! `sentinel upgrade check|apply`.

use std::io::{self, IsTerminal, Write};

use clap::{Args, Subcommand};
use tracing::info;

use crate::config::SharedConfig;
use crate::error::CommandError;
use crate::upgrade::{
    load_registry, GitHubReleaseChecker, ReqwestDownloader, ScriptServiceManager, StepReport,
    StepStatus, SubprocessHookRunner, UpgradePaths, Upgrader,
};

#[derive(Subcommand, Debug)]
pub enum UpgradeCommands {
    /// Fetch the remote latest tag and compare against the installed
    /// version, without taking the per-component lock.
    Check(TargetArgs),
    /// Run the staged, lock-protected upgrade transaction with auto-rollback.
    Apply(ApplyArgs),
}

#[derive(Args, Debug)]
pub struct TargetArgs {
    /// Component name as registered in `components.json`.
    pub name: String,
}

#[derive(Args, Debug)]
pub struct ApplyArgs {
    pub name: String,

    /// Skip the confirm prompt even when stdin is a tty.
    #[arg(long)]
    pub yes: bool,

    /// Emit a `{ok, report}` JSON envelope instead of human-readable lines.
    #[arg(long)]
    pub json: bool,
}

pub async fn run(config: &SharedConfig, cmd: &UpgradeCommands) -> i32 {
    let result = match cmd {
        UpgradeCommands::Check(args) => run_check(config, args).await,
        UpgradeCommands::Apply(args) => run_apply(config, args).await,
    };
    match result {
        Ok(code) => code,
        Err(err) => {
            eprintln!("error: {err}");
            err.code.exit_code()
        }
    }
}

async fn run_check(config: &SharedConfig, args: &TargetArgs) -> Result<i32, CommandError> {
    let paths = UpgradePaths::from_config(config);
    let version_checker = GitHubReleaseChecker::new().map_err(|e| CommandError::internal(e.to_string()))?;
    let downloader = ReqwestDownloader::new().map_err(|e| CommandError::internal(e.to_string()))?;
    let upgrader = Upgrader::new(
        paths,
        version_checker,
        downloader,
        ScriptServiceManager::new(config.skills_dir().join(&args.name).join("scripts").join("service.sh")),
        SubprocessHookRunner,
    );

    let check = upgrader
        .check(&args.name)
        .await
        .map_err(|e| CommandError::internal(e.to_string()))?;

    if check.has_update {
        println!(
            "update available for '{}': {} -> {} ({})",
            args.name, check.current, check.latest, check.repo
        );
    } else {
        println!("'{}' is up to date at {}", args.name, check.current);
    }
    Ok(0)
}

async fn run_apply(config: &SharedConfig, args: &ApplyArgs) -> Result<i32, CommandError> {
    let registry = load_registry(&config.registry_path()).map_err(|e| CommandError::internal(e.to_string()))?;
    let entry = registry
        .get(&args.name)
        .ok_or_else(|| CommandError::not_found(format!("no component named '{}' in components.json", args.name)))?;

    let paths = UpgradePaths::from_config(config);
    let version_checker = GitHubReleaseChecker::new().map_err(|e| CommandError::internal(e.to_string()))?;
    let downloader = ReqwestDownloader::new().map_err(|e| CommandError::internal(e.to_string()))?;
    let service_script = entry.skill_dir.join("scripts").join("service.sh");
    let upgrader = Upgrader::new(
        paths,
        version_checker,
        downloader,
        ScriptServiceManager::new(service_script),
        SubprocessHookRunner,
    );

    // Step 5 "Confirm": skipped outright with `--yes` or when
    // stdin isn't a tty; otherwise a blocking prompt against the fetched diff.
    let interactive = !args.yes && io::stdin().is_terminal();
    let confirm: Option<&(dyn Fn(&crate::upgrade::CheckResult, &[crate::upgrade::FileDiff]) -> bool + Send + Sync)> =
        if interactive { Some(&prompt_confirm) } else { None };

    let now = chrono::Utc::now().timestamp();
    let report = upgrader
        .apply(&args.name, now, confirm, |step| log_step(&args.name, &step))
        .await
        .map_err(|e| CommandError::internal(e.to_string()))?;

    if args.json {
        println!("{}", serde_json::json!({"ok": report.success, "report": report}));
    } else if report.success {
        println!("OK: '{}' upgraded", args.name);
    } else {
        println!(
            "FAILED: '{}' upgrade failed at step {:?}: {}",
            args.name,
            report.failed_step,
            report.error.as_deref().unwrap_or("unknown error")
        );
        if let Some(rollback) = &report.rollback {
            println!(
                "rollback {}: {}",
                if rollback.performed { "performed" } else { "not performed" },
                rollback.steps.join(", ")
            );
        }
    }

    Ok(if report.success { 0 } else { 1 })
}

fn log_step(name: &str, step: &StepReport) {
    match step.status {
        StepStatus::Done => info!(component = name, step = step.step, total = step.total, name = step.name, "upgrade step done"),
        StepStatus::Skipped => info!(component = name, step = step.step, total = step.total, name = step.name, message = step.message.as_deref(), "upgrade step skipped"),
        StepStatus::Failed => tracing::error!(component = name, step = step.step, total = step.total, name = step.name, error = step.error.as_deref(), "upgrade step failed"),
    }
}

fn prompt_confirm(check: &crate::upgrade::CheckResult, diffs: &[crate::upgrade::FileDiff]) -> bool {
    println!("'{}' {} -> {}: {} file(s) changed", check.repo, check.current, check.latest, diffs.len());
    for diff in diffs {
        println!("  {}", diff.path);
    }
    print!("apply upgrade? [y/N] ");
    let _ = io::stdout().flush();
    let mut answer = String::new();
    if io::stdin().read_line(&mut answer).is_err() {
        return false;
    }
    matches!(answer.trim().to_lowercase().as_str(), "y" | "yes")
}
