// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! `sentinel queue send` — record an outbound audit row and invoke the
//! channel adapter script that actually delivers it.

use std::io::Read;

use clap::Args;
use tracing::warn;

use crate::config::SharedConfig;
use crate::error::CommandError;

#[derive(Args, Debug)]
pub struct SendArgs {
    /// Channel adapter to invoke (runs `<skills>/<channel>/scripts/send.js`).
    pub channel: String,

    /// Addressee within the channel. Optional.
    pub endpoint: Option<String>,

    /// Message body. Read from stdin if omitted.
    pub message: Option<String>,
}

pub async fn run(config: &SharedConfig, args: &SendArgs) -> i32 {
    match run_inner(config, args).await {
        Ok(code) => code,
        Err(err) => {
            eprintln!("error: {err}");
            err.code.exit_code()
        }
    }
}

async fn run_inner(config: &SharedConfig, args: &SendArgs) -> Result<i32, CommandError> {
    let message = match &args.message {
        Some(m) => m.clone(),
        None => {
            let mut buf = String::new();
            std::io::stdin()
                .read_to_string(&mut buf)
                .map_err(|e| CommandError::internal(format!("reading message from stdin: {e}")))?;
            buf
        }
    };
    if message.trim().is_empty() {
        return Err(CommandError::invalid_args("message must not be empty"));
    }

    let store = super::open_store(config).await.map_err(|e| CommandError::internal(e.to_string()))?;
    store
        .insert_conversation(
            "outbound",
            &args.channel,
            args.endpoint.as_deref(),
            &message,
            None,
            3,
            false,
        )
        .await
        .map_err(|e| CommandError::internal(e.to_string()))?;

    let script = config
        .skills_dir()
        .join(&args.channel)
        .join("scripts")
        .join("send.js");
    if !script.exists() {
        warn!(channel = %args.channel, path = %script.display(), "no send.js adapter installed; outbound row recorded only");
        return Ok(0);
    }

    let mut cmd = tokio::process::Command::new("node");
    cmd.arg(&script).arg(&args.channel);
    if let Some(endpoint) = &args.endpoint {
        cmd.arg(endpoint);
    }
    cmd.arg(&message);

    let status = cmd
        .status()
        .await
        .map_err(|e| CommandError::internal(format!("spawning channel adapter '{}': {e}", script.display())))?;
    // Preserve the adapter's own exit code.
    Ok(status.code().unwrap_or(1))
}
