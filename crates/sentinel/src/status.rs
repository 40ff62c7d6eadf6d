// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! One-writer-many-readers JSON status files.
//!
//! Every write goes through [`write_json_atomic`] (write a sibling `.tmp`
//! file, then `rename`), the same idiom a writer would use for credential
//! persistence (`credential::persist::save`), so readers never observe a
//! partial file.

use std::path::{Path, PathBuf};

use chrono::{TimeZone, Utc};
use serde::{Deserialize, Serialize};

/// Coarse liveness classification shared by [`AgentStatus`] and the
/// liveness engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Health {
    Ok,
    Recovering,
    RateLimited,
    Down,
}

impl std::fmt::Display for Health {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Ok => "ok",
            Self::Recovering => "recovering",
            Self::RateLimited => "rate_limited",
            Self::Down => "down",
        };
        f.write_str(s)
    }
}

/// The agent's coarse activity classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentState {
    Offline,
    Stopped,
    Busy,
    Idle,
}

impl std::fmt::Display for AgentState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Offline => "offline",
            Self::Stopped => "stopped",
            Self::Busy => "busy",
            Self::Idle => "idle",
        };
        f.write_str(s)
    }
}

/// `activity-monitor/claude-status.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentStatus {
    pub state: AgentState,
    pub health: Health,
    pub idle_seconds: i64,
    pub last_activity: i64,
    pub last_check: i64,
    pub last_check_human: String,
}

impl AgentStatus {
    pub fn new(state: AgentState, health: Health, idle_seconds: i64, last_activity: i64, now: i64) -> Self {
        Self {
            state,
            health,
            idle_seconds,
            last_activity,
            last_check: now,
            last_check_human: Utc
                .timestamp_opt(now, 0)
                .single()
                .map(|dt| dt.to_rfc3339())
                .unwrap_or_default(),
        }
    }
}

/// Phase tag for an in-flight heartbeat.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum HeartbeatPhase {
    Primary,
    Recovery,
    DownCheck,
    RateLimitCheck,
    Stuck,
}

/// `activity-monitor/heartbeat-pending.json` — exists iff exactly one
/// heartbeat control item is in flight.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingHeartbeat {
    pub control_id: i64,
    pub phase: HeartbeatPhase,
    pub created_at: i64,
}

/// `activity-monitor/health-check-state.json`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct HealthCheckState {
    pub last_check_at: Option<i64>,
}

/// `activity-monitor/daily-<task>-state.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct DailyTaskState {
    pub last_date: Option<String>,
}

/// `activity-monitor/context-monitor-state.json` — tracks the hourly
/// context-usage check's two-step control pair.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct ContextMonitorState {
    pub last_check_at: Option<i64>,
    /// Set when the "report current context" control has been enqueued and
    /// the 30s follow-up handoff check is still pending.
    pub pending_handoff_check_at: Option<i64>,
}

/// `activity-monitor/api-activity.json` — last time the agent's API surface
/// was observed active, for diagnostics only (not load-bearing for any
/// invariant; the liveness engine derives truth from heartbeats).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct ApiActivity {
    pub last_request_at: Option<i64>,
    pub requests_total: u64,
}

/// `activity-monitor/hook-state.json` — last lifecycle hook event observed,
/// written by whichever process handles hook callbacks (out of sentinel's
/// scope; sentinel only reads/writes the file shape).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct HookState {
    pub last_event: Option<String>,
    pub last_event_at: Option<i64>,
}

/// Write `value` to `path` atomically: serialize to a sibling `.tmp` file in
/// the same directory, then `rename` over the destination.
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(value)?;
    let tmp_path = tmp_sibling(path);
    std::fs::write(&tmp_path, json)?;
    std::fs::rename(&tmp_path, path)?;
    Ok(())
}

fn tmp_sibling(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

/// Read and parse a JSON status file, returning `None` if it does not exist.
pub fn read_json<T: for<'de> Deserialize<'de>>(path: &Path) -> anyhow::Result<Option<T>> {
    match std::fs::read_to_string(path) {
        Ok(contents) => Ok(Some(serde_json::from_str(&contents)?)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Owns the `activity-monitor/` directory and exposes typed read/write
/// helpers for each status file it manages.
#[derive(Debug, Clone)]
pub struct StatusSurface {
    dir: PathBuf,
}

impl StatusSurface {
    pub fn new(monitor_dir: PathBuf) -> Self {
        Self { dir: monitor_dir }
    }

    fn path(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }

    pub fn agent_status_path(&self) -> PathBuf {
        self.path("claude-status.json")
    }

    pub fn read_agent_status(&self) -> anyhow::Result<Option<AgentStatus>> {
        read_json(&self.agent_status_path())
    }

    pub fn write_agent_status(&self, status: &AgentStatus) -> anyhow::Result<()> {
        write_json_atomic(&self.agent_status_path(), status)
    }

    pub fn heartbeat_pending_path(&self) -> PathBuf {
        self.path("heartbeat-pending.json")
    }

    pub fn read_pending_heartbeat(&self) -> anyhow::Result<Option<PendingHeartbeat>> {
        read_json(&self.heartbeat_pending_path())
    }

    pub fn write_pending_heartbeat(&self, pending: &PendingHeartbeat) -> anyhow::Result<()> {
        write_json_atomic(&self.heartbeat_pending_path(), pending)
    }

    /// Remove the pending-heartbeat file. Not present is not an error.
    pub fn clear_pending_heartbeat(&self) -> anyhow::Result<()> {
        match std::fs::remove_file(self.heartbeat_pending_path()) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    pub fn health_check_state_path(&self) -> PathBuf {
        self.path("health-check-state.json")
    }

    pub fn read_health_check_state(&self) -> anyhow::Result<HealthCheckState> {
        Ok(read_json(&self.health_check_state_path())?.unwrap_or_default())
    }

    pub fn write_health_check_state(&self, state: &HealthCheckState) -> anyhow::Result<()> {
        write_json_atomic(&self.health_check_state_path(), state)
    }

    pub fn context_monitor_state_path(&self) -> PathBuf {
        self.path("context-monitor-state.json")
    }

    pub fn read_context_monitor_state(&self) -> anyhow::Result<ContextMonitorState> {
        Ok(read_json(&self.context_monitor_state_path())?.unwrap_or_default())
    }

    pub fn write_context_monitor_state(&self, state: &ContextMonitorState) -> anyhow::Result<()> {
        write_json_atomic(&self.context_monitor_state_path(), state)
    }

    pub fn api_activity_path(&self) -> PathBuf {
        self.path("api-activity.json")
    }

    pub fn read_api_activity(&self) -> anyhow::Result<ApiActivity> {
        Ok(read_json(&self.api_activity_path())?.unwrap_or_default())
    }

    pub fn write_api_activity(&self, activity: &ApiActivity) -> anyhow::Result<()> {
        write_json_atomic(&self.api_activity_path(), activity)
    }

    pub fn hook_state_path(&self) -> PathBuf {
        self.path("hook-state.json")
    }

    pub fn read_hook_state(&self) -> anyhow::Result<HookState> {
        Ok(read_json(&self.hook_state_path())?.unwrap_or_default())
    }

    pub fn write_hook_state(&self, state: &HookState) -> anyhow::Result<()> {
        write_json_atomic(&self.hook_state_path(), state)
    }

    /// Per-task daily scheduler state, keyed by task name.
    pub fn daily_task_state_path(&self, task_name: &str) -> PathBuf {
        self.path(&format!("daily-{task_name}-state.json"))
    }

    pub fn read_daily_task_state(&self, task_name: &str) -> anyhow::Result<DailyTaskState> {
        Ok(read_json(&self.daily_task_state_path(task_name))?.unwrap_or_default())
    }

    pub fn write_daily_task_state(&self, task_name: &str, state: &DailyTaskState) -> anyhow::Result<()> {
        write_json_atomic(&self.daily_task_state_path(task_name), state)
    }

    pub fn pending_channels_path(&self) -> PathBuf {
        self.path("pending-channels.jsonl")
    }

    /// Append a `(channel, endpoint)` pair to notify when liveness recovers.
    pub fn append_pending_channel(&self, channel: &str, endpoint: Option<&str>) -> anyhow::Result<()> {
        use std::io::Write;
        if let Some(parent) = self.pending_channels_path().parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.pending_channels_path())?;
        let entry = serde_json::json!({"channel": channel, "endpoint": endpoint});
        writeln!(file, "{entry}")?;
        Ok(())
    }

    /// Read and clear all pending channel notifications.
    pub fn drain_pending_channels(&self) -> anyhow::Result<Vec<(String, Option<String>)>> {
        let path = self.pending_channels_path();
        let contents = match std::fs::read_to_string(&path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut out = Vec::new();
        for line in contents.lines() {
            if line.trim().is_empty() {
                continue;
            }
            let v: serde_json::Value = serde_json::from_str(line)?;
            let channel = v.get("channel").and_then(|c| c.as_str()).unwrap_or_default().to_owned();
            let endpoint = v.get("endpoint").and_then(|e| e.as_str()).map(str::to_owned);
            out.push((channel, endpoint));
        }
        match std::fs::remove_file(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        Ok(out)
    }
}

#[cfg(test)]
#[path = "status_tests.rs"]
mod tests;
