// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::fmt;

/// Direction of a conversation item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Inbound,
    Outbound,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Inbound => f.write_str("inbound"),
            Self::Outbound => f.write_str("outbound"),
        }
    }
}

impl std::str::FromStr for Direction {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "inbound" => Ok(Self::Inbound),
            "outbound" => Ok(Self::Outbound),
            other => anyhow::bail!("unknown direction '{other}', expected inbound or outbound"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConversationStatus {
    Pending,
    Running,
    Delivered,
    Failed,
}

impl fmt::Display for ConversationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Delivered => "delivered",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

impl std::str::FromStr for ConversationStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "delivered" => Ok(Self::Delivered),
            "failed" => Ok(Self::Failed),
            other => anyhow::bail!("unknown conversation status '{other}'"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ControlStatus {
    Pending,
    Running,
    Done,
    Failed,
    Timeout,
}

impl fmt::Display for ControlStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Done => "done",
            Self::Failed => "failed",
            Self::Timeout => "timeout",
        };
        f.write_str(s)
    }
}

impl std::str::FromStr for ControlStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "done" => Ok(Self::Done),
            "failed" => Ok(Self::Failed),
            "timeout" => Ok(Self::Timeout),
            other => anyhow::bail!("unknown control status '{other}'"),
        }
    }
}

/// A conversation item row.
#[derive(Debug, Clone, PartialEq, FromRow, Serialize, Deserialize)]
pub struct ConversationRow {
    pub id: i64,
    pub direction: String,
    pub channel: String,
    pub endpoint: Option<String>,
    pub content: String,
    pub status: String,
    pub priority: i64,
    pub require_idle: bool,
    pub retry_count: i64,
    pub created_at: i64,
    pub updated_at: i64,
}

impl ConversationRow {
    pub fn status_enum(&self) -> anyhow::Result<ConversationStatus> {
        self.status.parse()
    }
}

/// A control item row.
#[derive(Debug, Clone, PartialEq, FromRow, Serialize, Deserialize)]
pub struct ControlRow {
    pub id: i64,
    pub content: String,
    pub priority: i64,
    pub require_idle: bool,
    pub bypass_state: bool,
    pub ack_deadline_at: Option<i64>,
    pub available_at: Option<i64>,
    pub status: String,
    pub retry_count: i64,
    pub last_error: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl ControlRow {
    pub fn status_enum(&self) -> anyhow::Result<ControlStatus> {
        self.status.parse()
    }
}

/// A checkpoint row.
#[derive(Debug, Clone, PartialEq, FromRow, Serialize, Deserialize)]
pub struct CheckpointRow {
    pub id: i64,
    pub start_conversation_id: i64,
    pub end_conversation_id: i64,
    pub summary: Option<String>,
    pub timestamp: i64,
}

/// Options accepted by `insert_control` beyond `content`.
#[derive(Debug, Clone, Default)]
pub struct InsertControlOptions {
    pub priority: i64,
    pub require_idle: bool,
    pub bypass_state: bool,
    pub ack_deadline_at: Option<i64>,
    pub available_at: Option<i64>,
}

impl InsertControlOptions {
    pub fn new() -> Self {
        Self {
            priority: 3,
            require_idle: false,
            bypass_state: false,
            ack_deadline_at: None,
            available_at: None,
        }
    }
}

/// Result of `ack_control`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AckResult {
    pub found: bool,
    pub already_final: bool,
    pub status: ControlStatus,
}

/// Result of `retry_or_fail_control`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryOrFailResult {
    pub status: ControlStatus,
    pub retry_count: i64,
}

/// Result of `unsummarized_range`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnsummarizedRange {
    pub begin_id: i64,
    pub end_id: i64,
    pub count: i64,
}
