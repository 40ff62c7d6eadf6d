// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Heartbeat state machine and recovery ladder.
//!
//! Pure state machine; every side effect (enqueueing a heartbeat, polling
//! its status, touching the pending-heartbeat file, killing the terminal
//! session, notifying channels waiting on recovery) is an injected
//! trait-object dependency, following the same object-safe trait pattern
//! used elsewhere for decoupling from a concrete backend, so the engine is
//! unit-testable without a real tmux session or queue store.

use std::future::Future;
use std::pin::Pin;

use tracing::{info, warn};

use crate::config::LivenessTuning;
use crate::status::{Health, HeartbeatPhase, PendingHeartbeat};

/// Outcome of polling an in-flight heartbeat's control item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatPoll {
    /// `pending` or `running` — still waiting on the agent.
    InFlight,
    Done,
    Failed,
    Timeout,
    NotFound,
}

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = anyhow::Result<T>> + Send + 'a>>;

/// Side effects the liveness engine needs, injected so `process()` is
/// testable with fakes.
pub trait LivenessDeps: Send + Sync {
    /// Enqueue a heartbeat control item (`bypass_state=true`, priority 0,
    /// `ack_deadline=ACK_DEADLINE`) and return its id.
    fn enqueue_heartbeat<'a>(&'a self, phase: HeartbeatPhase) -> BoxFuture<'a, i64>;

    /// Poll the status of a previously enqueued heartbeat control item.
    fn get_heartbeat_status<'a>(&'a self, control_id: i64) -> BoxFuture<'a, HeartbeatPoll>;

    fn read_pending(&self) -> anyhow::Result<Option<PendingHeartbeat>>;
    fn write_pending(&self, pending: &PendingHeartbeat) -> anyhow::Result<()>;
    fn clear_pending(&self) -> anyhow::Result<()>;

    /// Kill the terminal session so the Activity Monitor respawns the agent.
    fn kill_session<'a>(&'a self) -> BoxFuture<'a, ()>;

    /// Notify channels queued in `pending-channels.jsonl` that the agent
    /// has recovered, then drain the file.
    fn notify_pending_channels<'a>(&'a self) -> BoxFuture<'a, ()>;
}

/// In-memory liveness state.
#[derive(Debug, Clone, PartialEq)]
pub struct LivenessState {
    pub health: Health,
    pub restart_failure_count: u32,
    pub last_heartbeat_at: Option<i64>,
    pub last_recovery_at: Option<i64>,
    pub last_down_check_at: Option<i64>,
    pub last_rate_limited_check_at: Option<i64>,
    pub rate_limit_reset_at: Option<i64>,
}

impl Default for LivenessState {
    fn default() -> Self {
        Self {
            health: Health::Ok,
            restart_failure_count: 0,
            last_heartbeat_at: None,
            last_recovery_at: None,
            last_down_check_at: None,
            last_rate_limited_check_at: None,
            rate_limit_reset_at: None,
        }
    }
}

/// Heartbeat state machine (ok / recovering / rate_limited / down) and
/// recovery ladder.
pub struct LivenessEngine<D: LivenessDeps> {
    deps: D,
    state: LivenessState,
}

impl<D: LivenessDeps> LivenessEngine<D> {
    pub fn new(deps: D, state: LivenessState) -> Self {
        Self { deps, state }
    }

    pub fn state(&self) -> &LivenessState {
        &self.state
    }

    /// One liveness tick.
    pub async fn process(&mut self, claude_running: bool, now: i64) -> anyhow::Result<()> {
        if let Some(pending) = self.deps.read_pending()? {
            self.process_pending(&pending, now).await?;
            return Ok(());
        }

        if !claude_running {
            return Ok(());
        }

        match self.state.health {
            Health::Recovering => self.maybe_retry_recovery(now).await?,
            Health::RateLimited => self.maybe_probe_rate_limited(now).await?,
            Health::Down => self.maybe_probe_down(now).await?,
            Health::Ok => self.maybe_send_primary_heartbeat(now).await?,
        }
        Ok(())
    }

    async fn process_pending(&mut self, pending: &PendingHeartbeat, now: i64) -> anyhow::Result<()> {
        let age = now - pending.created_at;
        if age >= LivenessTuning::MAX_PENDING_AGE.as_secs() as i64 {
            self.on_failure(now).await?;
            return Ok(());
        }

        match self.deps.get_heartbeat_status(pending.control_id).await? {
            HeartbeatPoll::InFlight => Ok(()),
            HeartbeatPoll::Done => self.on_success(now).await,
            HeartbeatPoll::Failed | HeartbeatPoll::Timeout | HeartbeatPoll::NotFound => {
                self.on_failure(now).await
            }
        }
    }

    async fn on_success(&mut self, now: i64) -> anyhow::Result<()> {
        self.deps.clear_pending()?;
        self.state.last_heartbeat_at = Some(now);
        if self.state.health != Health::Ok {
            info!(from = %self.state.health, "liveness recovered");
            self.state.health = Health::Ok;
            self.state.restart_failure_count = 0;
            self.deps.notify_pending_channels().await?;
        }
        Ok(())
    }

    async fn on_failure(&mut self, now: i64) -> anyhow::Result<()> {
        self.deps.clear_pending()?;
        match self.state.health {
            Health::Ok => self.trigger_recovery("primary heartbeat failed", now).await?,
            Health::Recovering => self.trigger_recovery("recovery heartbeat failed", now).await?,
            Health::Down | Health::RateLimited => {
                warn!(health = %self.state.health, "heartbeat failed while already degraded");
            }
        }
        Ok(())
    }

    /// Transition `ok -> recovering` (if not already), bump the restart
    /// counter, kill the session, and escalate to `down` past the ladder's
    /// max.
    pub async fn trigger_recovery(&mut self, reason: &str, now: i64) -> anyhow::Result<()> {
        if self.state.health != Health::Recovering {
            self.state.health = Health::Recovering;
        }
        self.state.restart_failure_count += 1;
        self.state.last_recovery_at = Some(now);
        warn!(reason, count = self.state.restart_failure_count, "triggering recovery");
        self.deps.kill_session().await?;

        if self.state.restart_failure_count >= LivenessTuning::MAX_RESTART_FAILURES {
            warn!("restart failure ladder exhausted; declaring agent down");
            self.state.health = Health::Down;
        }
        Ok(())
    }

    async fn maybe_retry_recovery(&mut self, now: i64) -> anyhow::Result<()> {
        let backoff = (self.state.restart_failure_count as i64 * 60).min(300);
        let since = self.state.last_recovery_at.map(|t| now - t).unwrap_or(i64::MAX);
        if since >= backoff {
            self.enqueue(HeartbeatPhase::Recovery, now).await?;
        }
        Ok(())
    }

    async fn maybe_probe_rate_limited(&mut self, now: i64) -> anyhow::Result<()> {
        let interval = LivenessTuning::RATE_LIMITED_PROBE_INTERVAL.as_secs() as i64;
        let since = self.state.last_rate_limited_check_at.map(|t| now - t).unwrap_or(i64::MAX);
        if since >= interval {
            self.state.last_rate_limited_check_at = Some(now);
            self.enqueue(HeartbeatPhase::RateLimitCheck, now).await?;
        }
        Ok(())
    }

    async fn maybe_probe_down(&mut self, now: i64) -> anyhow::Result<()> {
        let interval = LivenessTuning::DOWN_RETRY_INTERVAL.as_secs() as i64;
        let since = self.state.last_down_check_at.map(|t| now - t).unwrap_or(i64::MAX);
        if since >= interval {
            self.state.last_down_check_at = Some(now);
            self.enqueue(HeartbeatPhase::DownCheck, now).await?;
        }
        Ok(())
    }

    async fn maybe_send_primary_heartbeat(&mut self, now: i64) -> anyhow::Result<()> {
        let interval = LivenessTuning::HEARTBEAT_INTERVAL.as_secs() as i64;
        let since = self.state.last_heartbeat_at.map(|t| now - t).unwrap_or(i64::MAX);
        if since >= interval {
            self.enqueue(HeartbeatPhase::Primary, now).await?;
        }
        Ok(())
    }

    async fn enqueue(&mut self, phase: HeartbeatPhase, now: i64) -> anyhow::Result<()> {
        let control_id = self.deps.enqueue_heartbeat(phase).await?;
        self.deps.write_pending(&PendingHeartbeat {
            control_id,
            phase,
            created_at: now,
        })?;
        Ok(())
    }

    /// Request a `stuck` phase heartbeat (triggered externally by the
    /// Activity Monitor on unusual pane activity). Accepted only in `ok`
    /// with no in-flight heartbeat. Returns whether accepted.
    pub async fn request_stuck_probe(&mut self, now: i64) -> anyhow::Result<bool> {
        if self.state.health != Health::Ok {
            return Ok(false);
        }
        if self.deps.read_pending()?.is_some() {
            return Ok(false);
        }
        self.enqueue(HeartbeatPhase::Stuck, now).await?;
        Ok(true)
    }

    /// Externally-detected rate-limit signal. Transitions
    /// `ok`/`recovering` into `rate_limited`.
    pub fn observe_rate_limit_signal(&mut self, detected: bool, now: i64) {
        if detected && matches!(self.state.health, Health::Ok | Health::Recovering) {
            info!("rate limit detected; entering rate_limited state");
            self.state.health = Health::RateLimited;
            self.state.last_rate_limited_check_at = Some(now);
        }
    }
}

#[cfg(test)]
#[path = "liveness_tests.rs"]
mod tests;
