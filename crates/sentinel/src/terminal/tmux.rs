// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::config::TerminalTuning;
use crate::terminal::classify::{classify_input_area, InputAreaState};

/// Outcome of [`TmuxAdapter::send_and_verify`]. Never an `Err` — paste
/// failures are reported in-band so callers can decide retry policy
/// without a `Result`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    Submitted,
    PasteError(String),
}

/// Pastes text into a tmux session's input area via the paste-buffer
/// protocol and verifies the agent actually accepted it.
///
/// Stateless between calls, mirroring the source's `TmuxBackend` (grounded
/// on its `-S <socket>` prefixing and `tmux_cmd` builder idiom) but using
/// `set-buffer`/`paste-buffer`/`delete-buffer` rather than `send-keys -l`
/// so large payloads don't hit the tmux command-line length limit.
pub struct TmuxAdapter {
    session: String,
    socket: Option<PathBuf>,
}

impl TmuxAdapter {
    pub fn new(session: String, socket: Option<PathBuf>) -> Self {
        Self { session, socket }
    }

    fn tmux_cmd(&self) -> Command {
        let mut cmd = Command::new("tmux");
        if let Some(ref s) = self.socket {
            cmd.arg("-S").arg(s);
        }
        cmd
    }

    /// `BASE + floor(bytes/1024)*PER_KB`, capped at `MAX`.
    fn paste_delay(bytes: usize) -> Duration {
        let scaled = TerminalTuning::PASTE_DELAY_PER_KB * (bytes / 1024) as u32;
        (TerminalTuning::PASTE_DELAY_BASE + scaled).min(TerminalTuning::PASTE_DELAY_MAX)
    }

    async fn set_buffer(&self, name: &str, content: &str) -> anyhow::Result<()> {
        let mut child = self
            .tmux_cmd()
            .args(["set-buffer", "-b", name, "-"])
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()?;
        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(content.as_bytes()).await?;
        }
        let status = child.wait().await?;
        if !status.success() {
            anyhow::bail!("tmux set-buffer failed");
        }
        Ok(())
    }

    async fn paste_buffer(&self, name: &str) -> anyhow::Result<()> {
        let status = self
            .tmux_cmd()
            .args(["paste-buffer", "-b", name, "-t", &self.session])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await?;
        if !status.success() {
            anyhow::bail!("tmux paste-buffer failed");
        }
        Ok(())
    }

    async fn delete_buffer(&self, name: &str) -> anyhow::Result<()> {
        let _ = self
            .tmux_cmd()
            .args(["delete-buffer", "-b", name])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await;
        Ok(())
    }

    async fn send_key(&self, key: &str) -> anyhow::Result<()> {
        let status = self
            .tmux_cmd()
            .args(["send-keys", "-t", &self.session, key])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await?;
        if !status.success() {
            anyhow::bail!("tmux send-keys {key} failed");
        }
        Ok(())
    }

    /// Dismiss a ghost-text placeholder hint by pressing space then backspace.
    async fn dismiss_ghost_text(&self) -> anyhow::Result<()> {
        self.send_key("Space").await?;
        self.send_key("BSpace").await
    }

    async fn capture_pane(&self) -> anyhow::Result<Vec<String>> {
        let output = self
            .tmux_cmd()
            .args(["capture-pane", "-p", "-e", "-t", &self.session])
            .output()
            .await?;
        if !output.status.success() {
            anyhow::bail!("tmux capture-pane failed");
        }
        let text = String::from_utf8_lossy(&output.stdout);
        Ok(text.lines().map(str::to_owned).collect())
    }

    /// Capture the full visible pane as a single string, for diagnostics and
    /// out-of-band detectors (e.g. rate-limit pane scanning) that don't need
    /// the input-area rule-line parsing.
    pub async fn capture_pane_text(&self) -> anyhow::Result<String> {
        Ok(self.capture_pane().await?.join("\n"))
    }

    /// Paste `content`, submit, and verify the input area cleared.
    pub async fn send_and_verify(&self, content: &str) -> SendOutcome {
        match self.send_and_verify_inner(content).await {
            Ok(outcome) => outcome,
            Err(err) => {
                warn!(error = %err, "tmux paste failed");
                SendOutcome::PasteError(err.to_string())
            }
        }
    }

    async fn send_and_verify_inner(&self, content: &str) -> anyhow::Result<SendOutcome> {
        let buffer_name = format!("sentinel-{}", uuid::Uuid::new_v4());
        self.set_buffer(&buffer_name, content).await?;
        self.paste_buffer(&buffer_name).await?;
        tokio::time::sleep(Self::paste_delay(content.len())).await;
        self.delete_buffer(&buffer_name).await?;

        self.send_key("Enter").await?;

        let mut attempt = 0;
        loop {
            self.dismiss_ghost_text().await.ok();
            let lines = self.capture_pane().await?;
            match classify_input_area(&lines) {
                InputAreaState::Empty => return Ok(SendOutcome::Submitted),
                InputAreaState::Indeterminate { raw_capture } => {
                    debug!(%raw_capture, "indeterminate input-area read; treating as success");
                    return Ok(SendOutcome::Submitted);
                }
                InputAreaState::HasContent { text } => {
                    if attempt >= TerminalTuning::ENTER_VERIFY_MAX_RETRIES {
                        return Ok(SendOutcome::PasteError(format!(
                            "input area still populated after {attempt} retries: {text:?}"
                        )));
                    }
                    attempt += 1;
                    tokio::time::sleep(Duration::from_millis(
                        TerminalTuning::ENTER_VERIFY_WAIT_MS,
                    ))
                    .await;
                    self.send_key("Enter").await?;
                }
            }
        }
    }
}

#[cfg(test)]
#[path = "tmux_tests.rs"]
mod tests;
