// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Rate-limit detection is a behavioural contract between the activity
//! monitor and the agent's own UI, so it is left as an injected boundary
//! rather than hardcoded into the liveness engine. This module ships the
//! one concrete detector sentinel wires up by default: a configurable
//! regex scanned against the captured tmux pane.

use regex::Regex;

/// Detects a rate-limit signal in captured pane text.
pub trait RateLimitDetector: Send + Sync {
    fn detect(&self, pane_text: &str) -> bool;
}

/// Matches `pane_text` against a configurable regex.
pub struct PatternRateLimitDetector {
    pattern: Regex,
}

impl PatternRateLimitDetector {
    pub fn new(pattern: &str) -> anyhow::Result<Self> {
        Ok(Self {
            pattern: Regex::new(pattern)?,
        })
    }

    /// The default pattern sentinel ships: the agent's own rate-limit
    /// banner text.
    pub fn default_pattern() -> &'static str {
        r"(?i)rate.?limit|usage limit reached|try again (later|in \d+)"
    }
}

impl RateLimitDetector for PatternRateLimitDetector {
    fn detect(&self, pane_text: &str) -> bool {
        self.pattern.is_match(pane_text)
    }
}

#[cfg(test)]
#[path = "rate_limit_tests.rs"]
mod tests;
