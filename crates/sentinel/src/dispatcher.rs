// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The single consumer that moves one item at a time from the queue store
//! into the agent's input surface.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::config::DispatcherTuning;
use crate::queue::{ConversationRow, ControlRow, Store};
use crate::status::{AgentState, Health, StatusSurface};
use crate::terminal::{SendOutcome, Submitter};

/// Control characters sanitised out of rendered content before paste,
/// except `\t` and `\n`.
fn sanitize(content: &str) -> String {
    content
        .chars()
        .filter(|c| *c == '\t' || *c == '\n' || !c.is_control())
        .collect()
}

/// The item a single claim cycle picked, if any.
enum Claimed {
    Control(ControlRow),
    Conversation(ConversationRow),
    None,
}

/// The single-consumer claim/render/submit/verify loop.
pub struct Dispatcher {
    store: Store,
    status: StatusSurface,
    terminal: Arc<dyn Submitter>,
    poll_interval: Duration,
    last_cleanup: Option<i64>,
}

impl Dispatcher {
    pub fn new(store: Store, status: StatusSurface, terminal: Arc<dyn Submitter>) -> Self {
        Self {
            store,
            status,
            terminal,
            poll_interval: DispatcherTuning::POLL_INTERVAL_BASE,
            last_cleanup: None,
        }
    }

    /// Reset orphaned `running` rows left over from a previous dispatcher
    /// crash.
    pub async fn reclaim_on_startup(&self) -> anyhow::Result<u64> {
        self.store
            .reclaim_orphaned_running_controls(DispatcherTuning::ORPHAN_RUNNING_THRESHOLD.as_secs() as i64)
            .await
    }

    /// Run the dispatcher loop until `shutdown` is cancelled. On shutdown,
    /// finishes the current iteration then returns.
    pub async fn run(&mut self, shutdown: tokio_util::sync::CancellationToken) -> anyhow::Result<()> {
        self.reclaim_on_startup().await?;
        loop {
            if shutdown.is_cancelled() {
                info!("dispatcher shutting down");
                return Ok(());
            }
            let delivered = self.tick().await?;
            if delivered {
                self.poll_interval = DispatcherTuning::POLL_INTERVAL_BASE;
            } else {
                self.step_idle_poll_interval().await?;
            }
            tokio::select! {
                _ = tokio::time::sleep(self.poll_interval) => {}
                _ = shutdown.cancelled() => {
                    info!("dispatcher shutting down mid-sleep");
                    return Ok(());
                }
            }
        }
    }

    /// One iteration of the main loop. Returns
    /// whether an item was delivered.
    async fn tick(&mut self) -> anyhow::Result<bool> {
        let now = now();

        if self.last_cleanup.map(|t| now - t).unwrap_or(i64::MAX)
            >= DispatcherTuning::CLEANUP_INTERVAL.as_secs() as i64
        {
            let cutoff = now - DispatcherTuning::RETENTION.as_secs() as i64;
            let removed = self.store.cleanup_control_queue(cutoff).await?;
            if removed > 0 {
                debug!(removed, "cleaned up final control rows past retention");
            }
            self.last_cleanup = Some(now);
        }

        let expired = self.store.expire_timed_out_controls(now).await?;
        if expired > 0 {
            debug!(expired, "swept expired control items to timeout");
        }

        let agent_status = self.status.read_agent_status()?;
        let (state, health) = match &agent_status {
            Some(s) => (s.state, s.health),
            None => (AgentState::Offline, Health::Down),
        };
        let idle_seconds = agent_status.as_ref().map(|s| s.idle_seconds).unwrap_or(0);

        match self.claim_next_item(now).await? {
            Claimed::Control(row) => self.handle_control(row, state, health, idle_seconds).await,
            Claimed::Conversation(row) => {
                self.handle_conversation(row, state, health, idle_seconds).await
            }
            Claimed::None => Ok(false),
        }
    }

    /// Strict control priority: try control first; if a control row is
    /// observed but the claim loses to a racing consumer, do NOT fall
    /// through to conversation in the same iteration.
    async fn claim_next_item(&self, now: i64) -> anyhow::Result<Claimed> {
        if let Some(row) = self.store.next_pending_control(now).await? {
            return if self.store.claim_control(row.id).await? {
                Ok(Claimed::Control(row))
            } else {
                Ok(Claimed::None)
            };
        }
        if let Some(row) = self.store.next_pending_conversation().await? {
            return if self.store.claim_conversation(row.id).await? {
                Ok(Claimed::Conversation(row))
            } else {
                Ok(Claimed::None)
            };
        }
        Ok(Claimed::None)
    }

    async fn handle_control(
        &self,
        row: ControlRow,
        state: AgentState,
        health: Health,
        idle_seconds: i64,
    ) -> anyhow::Result<bool> {
        if let Some(reason) = self.gate(row.bypass_state, row.require_idle, state, health, idle_seconds) {
            debug!(id = row.id, reason, "releasing control item, gate failed");
            self.store.requeue_control(row.id, None).await?;
            return Ok(false);
        }

        let content = sanitize(&row.content);
        match self.terminal.send_and_verify(&content).await {
            SendOutcome::Submitted => {
                // Left `running`; the agent acks it later.
                if row.require_idle {
                    self.hold_for_idle().await;
                }
                Ok(true)
            }
            SendOutcome::PasteError(err) => {
                warn!(id = row.id, error = %err, "control paste/verify failed");
                self.store
                    .retry_or_fail_control(row.id, &err, DispatcherTuning::MAX_RETRIES as i64)
                    .await?;
                Ok(false)
            }
        }
    }

    async fn handle_conversation(
        &self,
        row: ConversationRow,
        state: AgentState,
        health: Health,
        idle_seconds: i64,
    ) -> anyhow::Result<bool> {
        // Conversations are never `bypass_state`; gate unconditionally on
        // state/health, plus idle if requested.
        if let Some(reason) = self.gate(false, row.require_idle, state, health, idle_seconds) {
            debug!(id = row.id, reason, "releasing conversation item, gate failed");
            self.store.requeue_conversation(row.id).await?;
            return Ok(false);
        }

        let content = sanitize(&row.content);
        match self.terminal.send_and_verify(&content).await {
            SendOutcome::Submitted => {
                self.store.mark_delivered(row.id).await?;
                if row.require_idle {
                    self.hold_for_idle().await;
                }
                Ok(true)
            }
            SendOutcome::PasteError(err) => {
                self.handle_conversation_failure(&row, &err, health).await?;
                Ok(false)
            }
        }
    }

    /// A channel-health problem releases without penalty; a genuine
    /// delivery failure increments retry with exponential backoff.
    async fn handle_conversation_failure(
        &self,
        row: &ConversationRow,
        err: &str,
        health: Health,
    ) -> anyhow::Result<()> {
        if health != Health::Ok {
            warn!(id = row.id, "channel unhealthy; releasing without retry penalty");
            self.store.requeue_conversation(row.id).await?;
            tokio::time::sleep(DispatcherTuning::RETRY_BASE).await;
            return Ok(());
        }

        let new_count = self.store.increment_retry_count(row.id).await?;
        if new_count >= DispatcherTuning::MAX_RETRIES as i64 {
            warn!(id = row.id, error = err, "conversation exhausted retries; marking failed");
            self.store.mark_failed(row.id).await?;
        } else {
            warn!(id = row.id, error = err, retry = new_count, "conversation delivery failed; requeueing");
            self.store.requeue_conversation(row.id).await?;
            let backoff = DispatcherTuning::RETRY_BASE * 2u32.pow(new_count.min(16) as u32);
            tokio::time::sleep(backoff).await;
        }
        Ok(())
    }

    /// Gating predicates. Returns `Some(reason)` if
    /// the item should be released back to `pending`.
    fn gate(
        &self,
        bypass_state: bool,
        require_idle: bool,
        state: AgentState,
        health: Health,
        idle_seconds: i64,
    ) -> Option<&'static str> {
        if !bypass_state && matches!(state, AgentState::Offline | AgentState::Stopped) {
            return Some("agent offline or stopped");
        }
        if !bypass_state && health != Health::Ok {
            return Some("health not ok");
        }
        if require_idle
            && (state != AgentState::Idle
                || idle_seconds < DispatcherTuning::REQUIRE_IDLE_MIN_SECONDS as i64)
        {
            return Some("require_idle not satisfied");
        }
        None
    }

    /// After a `require_idle` submit, hold then poll until the agent
    /// settles into idle/offline/stopped.
    async fn hold_for_idle(&self) {
        tokio::time::sleep(Duration::from_millis(DispatcherTuning::POST_SEND_HOLD_MS)).await;
        let deadline = tokio::time::Instant::now()
            + Duration::from_millis(DispatcherTuning::EXECUTION_MAX_WAIT_MS);
        loop {
            match self.status.read_agent_status() {
                Ok(Some(status))
                    if matches!(status.state, AgentState::Idle | AgentState::Offline | AgentState::Stopped) =>
                {
                    return;
                }
                _ => {}
            }
            if tokio::time::Instant::now() >= deadline {
                return;
            }
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
    }

    /// Step the poll interval toward `POLL_INTERVAL_MAX` when idle and
    /// nothing was delivered.
    async fn step_idle_poll_interval(&mut self) -> anyhow::Result<()> {
        let is_idle = matches!(
            self.status.read_agent_status()?.map(|s| s.state),
            Some(AgentState::Idle)
        );
        if is_idle {
            self.poll_interval = (self.poll_interval * 2).min(DispatcherTuning::POLL_INTERVAL_MAX);
        } else {
            self.poll_interval = DispatcherTuning::POLL_INTERVAL_BASE;
        }
        Ok(())
    }
}

fn now() -> i64 {
    chrono::Utc::now().timestamp()
}

#[cfg(test)]
#[path = "dispatcher_tests.rs"]
mod tests;
