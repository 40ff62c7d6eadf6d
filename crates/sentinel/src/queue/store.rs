// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::str::FromStr;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;

use super::types::{
    AckResult, CheckpointRow, ConversationRow, ControlRow, ControlStatus, Direction,
    InsertControlOptions, RetryOrFailResult, UnsummarizedRange,
};

/// Literal token substituted for the assigned id inside control content.
const CONTROL_ID_TOKEN: &str = "__CONTROL_ID__";

/// Busy timeout applied to every connection so concurrent short-lived
/// writers block instead of failing with `SQLITE_BUSY`.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// The Queue Store: durable, crash-safe persistence of conversation and
/// control items with cheap priority-ordered selection.
///
/// Backed by a local WAL-mode SQLite database so the "many short-lived
/// enqueuer processes, one dispatcher" pattern the source relies on keeps
/// working without an in-process queue.
#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
}

fn now() -> i64 {
    chrono::Utc::now().timestamp()
}

impl Store {
    /// Open (creating if absent) the database at `db_url` and run migrations.
    pub async fn connect(db_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(db_url)
            .with_context(|| format!("parsing database url '{db_url}'"))?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .busy_timeout(BUSY_TIMEOUT);
        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect_with(options)
            .await
            .context("connecting to queue store")?;
        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .context("running queue store migrations")?;
        Ok(Self { pool })
    }

    /// Wrap an already-open pool (used by in-memory tests).
    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    #[cfg(test)]
    pub(crate) fn pool_for_test(&self) -> SqlitePool {
        self.pool.clone()
    }

    // ---- conversations --------------------------------------------------

    /// Insert a conversation item. `direction=inbound` defaults `status` to
    /// `pending`; `outbound` defaults to `delivered` (audit-only).
    pub async fn insert_conversation(
        &self,
        direction: &str,
        channel: &str,
        endpoint: Option<&str>,
        content: &str,
        status: Option<&str>,
        priority: i64,
        require_idle: bool,
    ) -> Result<ConversationRow> {
        let direction_enum = Direction::from_str(direction)?;
        let default_status = match direction_enum {
            Direction::Inbound => "pending",
            Direction::Outbound => "delivered",
        };
        let status = status.unwrap_or(default_status);
        let ts = now();
        let id = sqlx::query(
            "INSERT INTO conversations \
             (direction, channel, endpoint, content, status, priority, require_idle, retry_count, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, 0, ?, ?)",
        )
        .bind(direction_enum.to_string())
        .bind(channel)
        .bind(endpoint)
        .bind(content)
        .bind(status)
        .bind(priority)
        .bind(require_idle)
        .bind(ts)
        .bind(ts)
        .execute(&self.pool)
        .await
        .context("inserting conversation")?
        .last_insert_rowid();

        self.conversation_by_id(id)
            .await?
            .context("conversation vanished immediately after insert")
    }

    async fn conversation_by_id(&self, id: i64) -> Result<Option<ConversationRow>> {
        let row = sqlx::query_as::<_, ConversationRow>("SELECT * FROM conversations WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .context("fetching conversation by id")?;
        Ok(row)
    }

    /// Lowest-priority-number, then oldest pending conversation.
    pub async fn next_pending_conversation(&self) -> Result<Option<ConversationRow>> {
        let row = sqlx::query_as::<_, ConversationRow>(
            "SELECT * FROM conversations WHERE status = 'pending' \
             ORDER BY priority ASC, created_at ASC LIMIT 1",
        )
        .fetch_optional(&self.pool)
        .await
        .context("selecting next pending conversation")?;
        Ok(row)
    }

    /// Conditional `pending -> running`. Returns `true` iff exactly one row changed.
    pub async fn claim_conversation(&self, id: i64) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE conversations SET status = 'running', updated_at = ? \
             WHERE id = ? AND status = 'pending'",
        )
        .bind(now())
        .bind(id)
        .execute(&self.pool)
        .await
        .context("claiming conversation")?;
        Ok(result.rows_affected() == 1)
    }

    /// `running -> pending`. Does not touch `retry_count`.
    pub async fn requeue_conversation(&self, id: i64) -> Result<()> {
        sqlx::query(
            "UPDATE conversations SET status = 'pending', updated_at = ? \
             WHERE id = ? AND status = 'running'",
        )
        .bind(now())
        .bind(id)
        .execute(&self.pool)
        .await
        .context("requeueing conversation")?;
        Ok(())
    }

    pub async fn increment_retry_count(&self, id: i64) -> Result<i64> {
        sqlx::query("UPDATE conversations SET retry_count = retry_count + 1, updated_at = ? WHERE id = ?")
            .bind(now())
            .bind(id)
            .execute(&self.pool)
            .await
            .context("incrementing conversation retry count")?;
        let row: (i64,) = sqlx::query_as("SELECT retry_count FROM conversations WHERE id = ?")
            .bind(id)
            .fetch_one(&self.pool)
            .await
            .context("reading conversation retry count")?;
        Ok(row.0)
    }

    pub async fn mark_delivered(&self, id: i64) -> Result<()> {
        sqlx::query("UPDATE conversations SET status = 'delivered', updated_at = ? WHERE id = ?")
            .bind(now())
            .bind(id)
            .execute(&self.pool)
            .await
            .context("marking conversation delivered")?;
        Ok(())
    }

    pub async fn mark_failed(&self, id: i64) -> Result<()> {
        sqlx::query("UPDATE conversations SET status = 'failed', updated_at = ? WHERE id = ?")
            .bind(now())
            .bind(id)
            .execute(&self.pool)
            .await
            .context("marking conversation failed")?;
        Ok(())
    }

    // ---- control items ----------------------------------------------------

    /// Insert a control item. If `content` contains the literal token
    /// `__CONTROL_ID__`, rewrite it to the assigned id in the same
    /// transaction as the insert.
    pub async fn insert_control(
        &self,
        content: &str,
        opts: &InsertControlOptions,
    ) -> Result<ControlRow> {
        let ts = now();
        let mut tx = self.pool.begin().await.context("starting control insert transaction")?;
        let id = sqlx::query(
            "INSERT INTO control_items \
             (content, priority, require_idle, bypass_state, ack_deadline_at, available_at, status, retry_count, last_error, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, 'pending', 0, NULL, ?, ?)",
        )
        .bind(content)
        .bind(opts.priority)
        .bind(opts.require_idle)
        .bind(opts.bypass_state)
        .bind(opts.ack_deadline_at)
        .bind(opts.available_at)
        .bind(ts)
        .bind(ts)
        .execute(&mut *tx)
        .await
        .context("inserting control item")?
        .last_insert_rowid();

        if content.contains(CONTROL_ID_TOKEN) {
            let substituted = content.replace(CONTROL_ID_TOKEN, &id.to_string());
            sqlx::query("UPDATE control_items SET content = ? WHERE id = ?")
                .bind(substituted)
                .bind(id)
                .execute(&mut *tx)
                .await
                .context("substituting __CONTROL_ID__")?;
        }

        let row = sqlx::query_as::<_, ControlRow>("SELECT * FROM control_items WHERE id = ?")
            .bind(id)
            .fetch_one(&mut *tx)
            .await
            .context("reading freshly inserted control item")?;
        tx.commit().await.context("committing control insert transaction")?;
        Ok(row)
    }

    async fn control_by_id(&self, id: i64) -> Result<Option<ControlRow>> {
        let row = sqlx::query_as::<_, ControlRow>("SELECT * FROM control_items WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .context("fetching control item by id")?;
        Ok(row)
    }

    pub async fn get_control(&self, id: i64) -> Result<Option<ControlRow>> {
        self.control_by_id(id).await
    }

    /// Lowest-priority-number, then oldest pending control; skips rows
    /// whose `available_at > now`.
    pub async fn next_pending_control(&self, now_ts: i64) -> Result<Option<ControlRow>> {
        let row = sqlx::query_as::<_, ControlRow>(
            "SELECT * FROM control_items WHERE status = 'pending' \
             AND (available_at IS NULL OR available_at <= ?) \
             ORDER BY priority ASC, created_at ASC LIMIT 1",
        )
        .bind(now_ts)
        .fetch_optional(&self.pool)
        .await
        .context("selecting next pending control item")?;
        Ok(row)
    }

    pub async fn claim_control(&self, id: i64) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE control_items SET status = 'running', updated_at = ? \
             WHERE id = ? AND status = 'pending'",
        )
        .bind(now())
        .bind(id)
        .execute(&self.pool)
        .await
        .context("claiming control item")?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn requeue_control(&self, id: i64, last_error: Option<&str>) -> Result<()> {
        sqlx::query(
            "UPDATE control_items SET status = 'pending', last_error = ?, updated_at = ? \
             WHERE id = ? AND status = 'running'",
        )
        .bind(last_error)
        .bind(now())
        .bind(id)
        .execute(&self.pool)
        .await
        .context("requeueing control item")?;
        Ok(())
    }

    /// Transactional ack: expired deadline -> `timeout`, else -> `done`;
    /// idempotent for any already-final state.
    pub async fn ack_control(&self, id: i64) -> Result<AckResult> {
        let ts = now();
        let mut tx = self.pool.begin().await.context("starting ack transaction")?;
        let row = sqlx::query_as::<_, ControlRow>("SELECT * FROM control_items WHERE id = ?")
            .bind(id)
            .fetch_optional(&mut *tx)
            .await
            .context("fetching control item for ack")?;

        let Some(row) = row else {
            tx.commit().await.ok();
            return Ok(AckResult {
                found: false,
                already_final: false,
                status: ControlStatus::Failed,
            });
        };

        let current = row.status_enum()?;
        if matches!(
            current,
            ControlStatus::Done | ControlStatus::Failed | ControlStatus::Timeout
        ) {
            tx.commit().await.ok();
            return Ok(AckResult {
                found: true,
                already_final: true,
                status: current,
            });
        }

        let expired = row
            .ack_deadline_at
            .map(|deadline| deadline < ts)
            .unwrap_or(false);
        let next = if expired {
            ControlStatus::Timeout
        } else {
            ControlStatus::Done
        };

        sqlx::query("UPDATE control_items SET status = ?, updated_at = ? WHERE id = ?")
            .bind(next.to_string())
            .bind(ts)
            .bind(id)
            .execute(&mut *tx)
            .await
            .context("updating control item on ack")?;
        tx.commit().await.context("committing ack transaction")?;

        Ok(AckResult {
            found: true,
            already_final: false,
            status: next,
        })
    }

    /// Increment retry; at `max_retries` transition to `failed`, else back
    /// to `pending` for another delivery attempt.
    pub async fn retry_or_fail_control(
        &self,
        id: i64,
        reason: &str,
        max_retries: i64,
    ) -> Result<RetryOrFailResult> {
        let ts = now();
        let mut tx = self.pool.begin().await.context("starting retry-or-fail transaction")?;
        let row = sqlx::query_as::<_, ControlRow>("SELECT * FROM control_items WHERE id = ?")
            .bind(id)
            .fetch_one(&mut *tx)
            .await
            .context("fetching control item for retry_or_fail")?;

        let new_count = row.retry_count + 1;
        let next = if new_count >= max_retries {
            ControlStatus::Failed
        } else {
            ControlStatus::Pending
        };

        sqlx::query(
            "UPDATE control_items SET status = ?, retry_count = ?, last_error = ?, updated_at = ? \
             WHERE id = ?",
        )
        .bind(next.to_string())
        .bind(new_count)
        .bind(reason)
        .bind(ts)
        .bind(id)
        .execute(&mut *tx)
        .await
        .context("updating control item in retry_or_fail")?;
        tx.commit().await.context("committing retry-or-fail transaction")?;

        Ok(RetryOrFailResult {
            status: next,
            retry_count: new_count,
        })
    }

    /// Sweep rows past their ack deadline to `timeout`. Must run before any
    /// dispatch decision.
    pub async fn expire_timed_out_controls(&self, now_ts: i64) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE control_items SET status = 'timeout', updated_at = ? \
             WHERE status IN ('pending', 'running') \
             AND ack_deadline_at IS NOT NULL AND ack_deadline_at < ?",
        )
        .bind(now_ts)
        .bind(now_ts)
        .execute(&self.pool)
        .await
        .context("expiring timed out control items")?;
        Ok(result.rows_affected())
    }

    pub async fn cleanup_control_queue(&self, cutoff: i64) -> Result<u64> {
        let result = sqlx::query(
            "DELETE FROM control_items \
             WHERE status IN ('done', 'failed', 'timeout') AND updated_at < ?",
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await
        .context("cleaning up control queue")?;
        Ok(result.rows_affected())
    }

    /// Reset orphaned `running` control rows older than `threshold_secs` back
    /// to `pending` with one retry increment.
    pub async fn reclaim_orphaned_running_controls(&self, threshold_secs: i64) -> Result<u64> {
        let cutoff = now() - threshold_secs;
        let result = sqlx::query(
            "UPDATE control_items SET status = 'pending', retry_count = retry_count + 1, updated_at = ? \
             WHERE status = 'running' AND updated_at < ?",
        )
        .bind(now())
        .bind(cutoff)
        .execute(&self.pool)
        .await
        .context("reclaiming orphaned running control items")?;
        Ok(result.rows_affected())
    }

    // ---- checkpoints --------------------------------------------------------

    pub async fn last_checkpoint(&self) -> Result<Option<CheckpointRow>> {
        let row = sqlx::query_as::<_, CheckpointRow>(
            "SELECT * FROM checkpoints ORDER BY id DESC LIMIT 1",
        )
        .fetch_optional(&self.pool)
        .await
        .context("fetching last checkpoint")?;
        Ok(row)
    }

    /// Create a checkpoint covering `[prev.end + 1, end_id]` (or `[1, end_id]`
    /// if no prior checkpoint exists). Rejects a non-monotonic `end_id`.
    pub async fn create_checkpoint(&self, end_id: i64, summary: Option<&str>) -> Result<CheckpointRow> {
        let prev = self.last_checkpoint().await?;
        let start_id = prev.as_ref().map(|c| c.end_conversation_id + 1).unwrap_or(1);
        if end_id < start_id {
            bail!(
                "checkpoint end_id {end_id} precedes required start {start_id}; checkpoints must be monotonic"
            );
        }
        let ts = now();
        let id = sqlx::query(
            "INSERT INTO checkpoints (start_conversation_id, end_conversation_id, summary, timestamp) \
             VALUES (?, ?, ?, ?)",
        )
        .bind(start_id)
        .bind(end_id)
        .bind(summary)
        .bind(ts)
        .execute(&self.pool)
        .await
        .context("inserting checkpoint")?
        .last_insert_rowid();

        Ok(CheckpointRow {
            id,
            start_conversation_id: start_id,
            end_conversation_id: end_id,
            summary: summary.map(str::to_owned),
            timestamp: ts,
        })
    }

    pub async fn list_checkpoints(&self, limit: i64) -> Result<Vec<CheckpointRow>> {
        let rows = sqlx::query_as::<_, CheckpointRow>(
            "SELECT * FROM checkpoints ORDER BY id DESC LIMIT ?",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("listing checkpoints")?;
        Ok(rows)
    }

    /// The range of inbound conversations not yet covered by any checkpoint.
    pub async fn unsummarized_range(&self) -> Result<UnsummarizedRange> {
        let begin_id = self
            .last_checkpoint()
            .await?
            .map(|c| c.end_conversation_id + 1)
            .unwrap_or(1);
        let max_id: (Option<i64>,) =
            sqlx::query_as("SELECT MAX(id) FROM conversations WHERE direction = 'inbound'")
                .fetch_one(&self.pool)
                .await
                .context("reading max conversation id")?;
        let end_id = max_id.0.unwrap_or(0);
        let count = if end_id >= begin_id {
            let row: (i64,) = sqlx::query_as(
                "SELECT COUNT(*) FROM conversations \
                 WHERE direction = 'inbound' AND id BETWEEN ? AND ?",
            )
            .bind(begin_id)
            .bind(end_id)
            .fetch_one(&self.pool)
            .await
            .context("counting unsummarized conversations")?;
            row.0
        } else {
            0
        };
        Ok(UnsummarizedRange {
            begin_id,
            end_id,
            count,
        })
    }

    pub async fn conversations_by_range(&self, begin: i64, end: i64) -> Result<Vec<ConversationRow>> {
        let rows = sqlx::query_as::<_, ConversationRow>(
            "SELECT * FROM conversations WHERE id BETWEEN ? AND ? ORDER BY id ASC",
        )
        .bind(begin)
        .bind(end)
        .fetch_all(&self.pool)
        .await
        .context("listing conversations by range")?;
        Ok(rows)
    }
}

#[cfg(test)]
#[path = "store_tests.rs"]
mod tests;
