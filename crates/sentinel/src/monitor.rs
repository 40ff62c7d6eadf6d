// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The Activity Monitor: the outer 1-second-tick process that classifies
//! the agent's liveness, drives the [`crate::liveness`] engine, respawns
//! the agent when its terminal session disappears, and triggers daily and
//! periodic maintenance work.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use chrono::{Datelike, FixedOffset, TimeZone, Timelike, Utc};
use tracing::{debug, info, warn};

use crate::config::MonitorTuning;
use crate::liveness::{LivenessDeps, LivenessEngine};
use crate::status::{AgentState, AgentStatus, Health, StatusSurface};

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = anyhow::Result<T>> + Send + 'a>>;

/// Everything the monitor needs to know about, and do to, the agent's
/// terminal session. Injected so the monitor is testable without a real
/// tmux session.
pub trait SessionProbe: Send + Sync {
    fn session_exists<'a>(&'a self) -> BoxFuture<'a, bool>;
    fn agent_process_running<'a>(&'a self) -> BoxFuture<'a, bool>;
    fn spawn_agent<'a>(&'a self) -> BoxFuture<'a, ()>;
    fn kill_session<'a>(&'a self) -> BoxFuture<'a, ()>;

    /// Unix timestamp of the most recent terminal activity (pane output),
    /// used as a fallback when the conversation log mtime is unavailable.
    fn terminal_activity_time<'a>(&'a self) -> BoxFuture<'a, Option<i64>>;

    /// Unix mtime of the agent's most recent conversation log file.
    fn conversation_log_mtime<'a>(&'a self) -> BoxFuture<'a, Option<i64>>;
}

/// Reads the agent's self-reported context-window usage fraction (0.0-1.0).
/// `None` means the agent hasn't reported anything yet.
pub trait ContextUsageProbe: Send + Sync {
    fn usage_fraction<'a>(&'a self) -> BoxFuture<'a, Option<f64>>;
}

/// A task run once per local day at a fixed hour. Implementations enqueue whatever control item or external
/// action the task represents.
pub trait DailyTaskRunner: Send + Sync {
    fn run<'a>(&'a self) -> BoxFuture<'a, ()>;
}

/// A daily task's schedule: run at `hour` local time, deduped by date stamp
/// rather than an interval timer.
pub struct DailyTaskSpec {
    pub name: String,
    pub hour: u32,
    pub runner: Arc<dyn DailyTaskRunner>,
}

/// Enqueues the hourly context-usage control pair and the six-hourly health
/// check control. Kept as a narrow trait (rather than a
/// direct `Store` dependency) so monitor logic is testable with a fake.
pub trait ControlEnqueuer: Send + Sync {
    fn enqueue_context_report<'a>(&'a self) -> BoxFuture<'a, ()>;
    fn enqueue_context_handoff<'a>(&'a self) -> BoxFuture<'a, ()>;
    fn enqueue_health_check<'a>(&'a self) -> BoxFuture<'a, ()>;
}

pub struct ActivityMonitor<D: LivenessDeps, S: SessionProbe, C: ContextUsageProbe, E: ControlEnqueuer> {
    status: StatusSurface,
    session: S,
    context_probe: C,
    enqueuer: E,
    liveness: LivenessEngine<D>,
    daily_tasks: Vec<DailyTaskSpec>,
    /// Fixed UTC offset the daily-task scheduler treats as "local time".
    timezone: FixedOffset,
    offline_since: Option<i64>,
    stopped_since: Option<i64>,
    idle_since: Option<i64>,
}

impl<D: LivenessDeps, S: SessionProbe, C: ContextUsageProbe, E: ControlEnqueuer> ActivityMonitor<D, S, C, E> {
    /// Feed an externally-detected rate-limit signal into the liveness
    /// engine.
    pub fn observe_rate_limit_signal(&mut self, detected: bool, now: i64) {
        self.liveness.observe_rate_limit_signal(detected, now);
    }

    pub fn new(
        status: StatusSurface,
        session: S,
        context_probe: C,
        enqueuer: E,
        liveness: LivenessEngine<D>,
        daily_tasks: Vec<DailyTaskSpec>,
        timezone: FixedOffset,
    ) -> Self {
        Self {
            status,
            session,
            context_probe,
            enqueuer,
            liveness,
            daily_tasks,
            timezone,
            offline_since: None,
            stopped_since: None,
            idle_since: None,
        }
    }

    /// One 1-second tick.
    pub async fn tick(&mut self, now: i64) -> anyhow::Result<AgentStatus> {
        if !self.session.session_exists().await? {
            self.stopped_since = None;
            let first_offline_at = *self.offline_since.get_or_insert(now);
            if now - first_offline_at >= MonitorTuning::RESTART_DELAY.as_secs() as i64 {
                info!("terminal session absent past restart delay; spawning agent");
                self.session.spawn_agent().await?;
                self.offline_since = None;
            }
            let status = AgentStatus::new(AgentState::Offline, self.liveness.state().health, 0, now, now);
            self.status.write_agent_status(&status)?;
            self.liveness.process(false, now).await?;
            return Ok(status);
        }
        self.offline_since = None;

        if !self.session.agent_process_running().await? {
            let first_stopped_at = *self.stopped_since.get_or_insert(now);
            if now - first_stopped_at >= MonitorTuning::RESTART_DELAY.as_secs() as i64 {
                info!("agent process absent past restart delay; spawning agent");
                self.session.spawn_agent().await?;
                self.stopped_since = None;
            }
            let status = AgentStatus::new(AgentState::Stopped, self.liveness.state().health, 0, now, now);
            self.status.write_agent_status(&status)?;
            self.liveness.process(false, now).await?;
            return Ok(status);
        }
        self.stopped_since = None;

        let last_activity = self
            .session
            .conversation_log_mtime()
            .await?
            .or(self.session.terminal_activity_time().await?)
            .unwrap_or(now);

        let idle_threshold = MonitorTuning::IDLE_THRESHOLD.as_secs() as i64;
        let state = if now - last_activity < idle_threshold {
            self.idle_since = None;
            AgentState::Busy
        } else {
            let first_idle_at = *self.idle_since.get_or_insert(now);
            let _ = first_idle_at;
            AgentState::Idle
        };
        let idle_seconds = match (state, self.idle_since) {
            (AgentState::Idle, Some(since)) => now - since,
            _ => 0,
        };

        self.liveness.process(true, now).await?;

        let status = AgentStatus::new(state, self.liveness.state().health, idle_seconds, last_activity, now);
        self.status.write_agent_status(&status)?;

        if self.liveness.state().health == Health::Ok {
            self.run_daily_tasks(now).await?;
            self.run_context_usage_check(now).await?;
            self.run_health_check(now).await?;
        }

        Ok(status)
    }

    async fn run_daily_tasks(&self, now: i64) -> anyhow::Result<()> {
        let local_now = Utc
            .timestamp_opt(now, 0)
            .single()
            .unwrap_or_else(Utc::now)
            .with_timezone(&self.timezone);
        let today = format!("{:04}-{:02}-{:02}", local_now.year(), local_now.month(), local_now.day());
        let local_hour = local_now.hour();

        for task in &self.daily_tasks {
            if local_hour != task.hour {
                continue;
            }
            let recorded = self.status.read_daily_task_state(&task.name)?;
            if recorded.last_date.as_deref() == Some(today.as_str()) {
                continue;
            }
            info!(task = %task.name, "running daily task");
            task.runner.run().await?;
            self.status.write_daily_task_state(
                &task.name,
                &crate::status::DailyTaskState { last_date: Some(today.clone()) },
            )?;
        }
        Ok(())
    }

    async fn run_context_usage_check(&self, now: i64) -> anyhow::Result<()> {
        let mut state = self.status.read_context_monitor_state()?;

        if let Some(due_at) = state.pending_handoff_check_at {
            if now >= due_at {
                if let Some(usage) = self.context_probe.usage_fraction().await? {
                    if usage >= MonitorTuning::CONTEXT_USAGE_THRESHOLD {
                        info!(usage, "context usage above threshold; invoking handoff");
                        self.enqueuer.enqueue_context_handoff().await?;
                    }
                }
                state.pending_handoff_check_at = None;
                self.status.write_context_monitor_state(&state)?;
            }
            return Ok(());
        }

        let interval = MonitorTuning::CONTEXT_CHECK_INTERVAL.as_secs() as i64;
        let since = state.last_check_at.map(|t| now - t).unwrap_or(i64::MAX);
        if since >= interval {
            debug!("enqueueing hourly context-usage report");
            self.enqueuer.enqueue_context_report().await?;
            state.last_check_at = Some(now);
            state.pending_handoff_check_at =
                Some(now + MonitorTuning::CONTEXT_HANDOFF_DELAY.as_secs() as i64);
            self.status.write_context_monitor_state(&state)?;
        }
        Ok(())
    }

    async fn run_health_check(&self, now: i64) -> anyhow::Result<()> {
        let mut state = self.status.read_health_check_state()?;
        let interval = MonitorTuning::HEALTH_CHECK_INTERVAL.as_secs() as i64;
        let since = state.last_check_at.map(|t| now - t).unwrap_or(i64::MAX);
        if since >= interval {
            debug!("enqueueing six-hourly health check");
            self.enqueuer.enqueue_health_check().await?;
            state.last_check_at = Some(now);
            self.status.write_health_check_state(&state)?;
        }
        Ok(())
    }
}

/// Truncate the activity log if a new local day started, in `offset`'s
/// timezone (the same configured offset the daily-task scheduler uses).
/// `log_path` is truncated (not deleted) so tailing processes keep their fd.
pub fn truncate_activity_log_if_new_day(
    log_path: &std::path::Path,
    last_truncated_date: &mut Option<String>,
    now: i64,
    offset: FixedOffset,
) -> anyhow::Result<bool> {
    let local_now = Utc.timestamp_opt(now, 0).single().unwrap_or_else(Utc::now).with_timezone(&offset);
    let today = format!("{:04}-{:02}-{:02}", local_now.year(), local_now.month(), local_now.day());
    if last_truncated_date.as_deref() == Some(today.as_str()) {
        return Ok(false);
    }
    if log_path.exists() {
        std::fs::File::create(log_path)?;
    }
    *last_truncated_date = Some(today);
    Ok(true)
}

#[cfg(test)]
#[path = "monitor_tests.rs"]
mod tests;
