// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Pastes arbitrary text into the agent's tmux input area and verifies
//! submission by scanning the captured pane for the rule-bounded input box
//!.

mod classify;
mod tmux;

use std::future::Future;
use std::pin::Pin;

pub use classify::{classify_input_area, InputAreaState};
pub use tmux::{SendOutcome, TmuxAdapter};

/// Object-safe handle to "paste and verify" so the [`crate::dispatcher`]
/// can be driven by a fake in tests, mirroring the object-safe
/// `object-safe trait pattern used elsewhere in this crate to decouple its
/// session loop from a real PTY.
pub trait Submitter: Send + Sync {
    fn send_and_verify<'a>(&'a self, content: &'a str) -> Pin<Box<dyn Future<Output = SendOutcome> + Send + 'a>>;
}

impl Submitter for TmuxAdapter {
    fn send_and_verify<'a>(&'a self, content: &'a str) -> Pin<Box<dyn Future<Output = SendOutcome> + Send + 'a>> {
        Box::pin(async move { TmuxAdapter::send_and_verify(self, content).await })
    }
}
