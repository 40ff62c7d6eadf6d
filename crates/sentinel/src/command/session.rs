// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! `TmuxSessionProbe` — the [`crate::monitor::SessionProbe`] the `monitor`
//! subcommand drives in production. Shells out to tmux the same way
//! [`crate::terminal::TmuxAdapter`] does, plus filesystem mtime lookups.

use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::process::Stdio;
use std::sync::{Arc, Mutex};

use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use tracing::debug;

use crate::monitor::SessionProbe;

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = anyhow::Result<T>> + Send + 'a>>;

pub struct TmuxSessionProbe {
    session: String,
    socket: Option<PathBuf>,
    agent_bin: String,
    agent_args: Vec<String>,
    working_dir: PathBuf,
    conversation_log_dir: PathBuf,
    // Fast-path cache for `conversation_log_mtime`, kept warm by `_watcher`
    // so the 1-second tick doesn't `stat()` the log directory when nothing
    // changed. The watcher is a latency optimization only: if it fails to
    // start (no inotify, sandboxed filesystem, ...) `conversation_log_mtime`
    // falls back to scanning the directory directly, which remains the
    // source of truth either way.
    watched_mtime: Arc<Mutex<Option<i64>>>,
    _watcher: Option<RecommendedWatcher>,
}

impl TmuxSessionProbe {
    pub fn new(
        session: String,
        socket: Option<PathBuf>,
        agent_bin: String,
        agent_args: Vec<String>,
        working_dir: PathBuf,
        conversation_log_dir: PathBuf,
    ) -> Self {
        let watched_mtime = Arc::new(Mutex::new(latest_mtime_in_dir(&conversation_log_dir)));
        let _watcher = spawn_log_watcher(&conversation_log_dir, watched_mtime.clone());
        Self {
            session,
            socket,
            agent_bin,
            agent_args,
            working_dir,
            conversation_log_dir,
            watched_mtime,
            _watcher,
        }
    }

    fn tmux_cmd(&self) -> tokio::process::Command {
        let mut cmd = tokio::process::Command::new("tmux");
        if let Some(ref s) = self.socket {
            cmd.arg("-S").arg(s);
        }
        cmd
    }

    async fn pane_pid(&self) -> anyhow::Result<Option<i32>> {
        let output = self
            .tmux_cmd()
            .args(["list-panes", "-t", &self.session, "-F", "#{pane_pid}"])
            .stderr(Stdio::null())
            .output()
            .await?;
        if !output.status.success() {
            return Ok(None);
        }
        let text = String::from_utf8_lossy(&output.stdout);
        Ok(text.lines().next().and_then(|s| s.trim().parse().ok()))
    }
}

impl SessionProbe for TmuxSessionProbe {
    fn session_exists<'a>(&'a self) -> BoxFuture<'a, bool> {
        Box::pin(async move {
            let status = self
                .tmux_cmd()
                .args(["has-session", "-t", &self.session])
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .status()
                .await?;
            Ok(status.success())
        })
    }

    fn agent_process_running<'a>(&'a self) -> BoxFuture<'a, bool> {
        Box::pin(async move {
            let Some(pid) = self.pane_pid().await? else {
                return Ok(false);
            };
            // Walk the pane's process subtree via `pgrep -P`; one shallow
            // level is enough since the agent is execed directly under the
            // pane's shell (or is the pane's own process on some shells).
            let direct = process_cmdline_matches(pid, &self.agent_bin)?;
            if direct {
                return Ok(true);
            }
            let output = tokio::process::Command::new("pgrep")
                .args(["-P", &pid.to_string()])
                .stderr(Stdio::null())
                .output()
                .await?;
            if !output.status.success() {
                return Ok(false);
            }
            for line in String::from_utf8_lossy(&output.stdout).lines() {
                if let Ok(child_pid) = line.trim().parse::<i32>() {
                    if process_cmdline_matches(child_pid, &self.agent_bin)? {
                        return Ok(true);
                    }
                }
            }
            Ok(false)
        })
    }

    fn spawn_agent<'a>(&'a self) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            let _ = self
                .tmux_cmd()
                .args(["kill-session", "-t", &self.session])
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .status()
                .await;
            let mut cmd = self.tmux_cmd();
            cmd.args(["new-session", "-d", "-s", &self.session, "-c"])
                .arg(&self.working_dir)
                .arg(&self.agent_bin);
            for arg in &self.agent_args {
                cmd.arg(arg);
            }
            let status = cmd.stdout(Stdio::null()).stderr(Stdio::null()).status().await?;
            if !status.success() {
                anyhow::bail!("tmux new-session failed for agent '{}'", self.agent_bin);
            }
            Ok(())
        })
    }

    fn kill_session<'a>(&'a self) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            let _ = self
                .tmux_cmd()
                .args(["kill-session", "-t", &self.session])
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .status()
                .await;
            Ok(())
        })
    }

    fn terminal_activity_time<'a>(&'a self) -> BoxFuture<'a, Option<i64>> {
        Box::pin(async move {
            let output = self
                .tmux_cmd()
                .args(["display-message", "-p", "-t", &self.session, "#{window_activity}"])
                .stderr(Stdio::null())
                .output()
                .await?;
            if !output.status.success() {
                return Ok(None);
            }
            let text = String::from_utf8_lossy(&output.stdout);
            Ok(text.trim().parse::<i64>().ok())
        })
    }

    fn conversation_log_mtime<'a>(&'a self) -> BoxFuture<'a, Option<i64>> {
        Box::pin(async move {
            if self._watcher.is_some() {
                Ok(*self.watched_mtime.lock().unwrap_or_else(|e| e.into_inner()))
            } else {
                Ok(latest_mtime_in_dir(&self.conversation_log_dir))
            }
        })
    }
}

/// Watches `dir` for changes and keeps `cache` equal to the directory's
/// latest file mtime, mirroring a standard filesystem-watch
/// detector. Returns `None` if a watcher could not be installed; callers
/// must still treat a live directory scan as authoritative.
fn spawn_log_watcher(dir: &std::path::Path, cache: Arc<Mutex<Option<i64>>>) -> Option<RecommendedWatcher> {
    let watched_dir = dir.to_path_buf();
    let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| match res {
        Ok(_) => *cache.lock().unwrap_or_else(|e| e.into_inner()) = latest_mtime_in_dir(&watched_dir),
        Err(e) => debug!(error = %e, "conversation log watcher error"),
    })
    .ok()?;
    watcher.watch(dir, RecursiveMode::NonRecursive).ok()?;
    Some(watcher)
}

fn process_cmdline_matches(pid: i32, agent_bin: &str) -> anyhow::Result<bool> {
    let path = format!("/proc/{pid}/comm");
    match std::fs::read_to_string(path) {
        Ok(comm) => Ok(comm.trim() == agent_bin || agent_bin.ends_with(comm.trim())),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e.into()),
    }
}

fn latest_mtime_in_dir(dir: &std::path::Path) -> Option<i64> {
    let entries = std::fs::read_dir(dir).ok()?;
    entries
        .flatten()
        .filter_map(|entry| entry.metadata().ok().and_then(|m| m.modified().ok()))
        .filter_map(|modified| modified.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|d| d.as_secs() as i64)
        .max()
}
