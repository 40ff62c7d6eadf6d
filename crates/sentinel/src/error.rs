// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use serde::{Deserialize, Serialize};
use std::fmt;

/// Error codes surfaced by every `sentinel` subcommand's `--json` error
/// envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    /// Malformed flags or arguments.
    InvalidArgs,
    /// Liveness engine reports `recovering`; caller should back off and retry.
    HealthRecovering,
    /// Liveness engine reports `down`; caller should not retry without intervention.
    HealthDown,
    /// Referenced control item, conversation turn, or checkpoint does not exist.
    NotFound,
    /// The request conflicts with the current state (e.g. duplicate `__CONTROL_ID__`).
    Conflict,
    /// Unexpected internal failure (I/O, database, tmux).
    Internal,
}

impl ErrorCode {
    /// Process exit code used by every subcommand for this error.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::InvalidArgs => 2,
            Self::HealthRecovering => 75, // EX_TEMPFAIL
            Self::HealthDown => 69,       // EX_UNAVAILABLE
            Self::NotFound => 4,
            Self::Conflict => 5,
            Self::Internal => 1,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InvalidArgs => "INVALID_ARGS",
            Self::HealthRecovering => "HEALTH_RECOVERING",
            Self::HealthDown => "HEALTH_DOWN",
            Self::NotFound => "NOT_FOUND",
            Self::Conflict => "CONFLICT",
            Self::Internal => "INTERNAL",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A `sentinel` command failure, carrying an [`ErrorCode`] alongside the
/// human-readable message `anyhow::Error` would otherwise swallow.
#[derive(Debug)]
pub struct CommandError {
    pub code: ErrorCode,
    pub message: String,
}

impl CommandError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn invalid_args(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidArgs, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::NotFound, message)
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Conflict, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Internal, message)
    }

    /// Render as the `{"ok": false, "error": {"code": ..., "message": ...}}`
    /// envelope every subcommand emits on `--json` failure.
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "ok": false,
            "error": {
                "code": self.code.as_str(),
                "message": self.message,
            }
        })
    }
}

impl fmt::Display for CommandError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for CommandError {}

#[cfg(test)]
#[path = "error_tests.rs"]
mod tests;
