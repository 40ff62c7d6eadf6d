// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! `sentinel queue receive` — insert one inbound conversation item
//!.

use clap::Args;

use crate::config::SharedConfig;
use crate::error::{CommandError, ErrorCode};
use crate::status::{Health, StatusSurface};

#[derive(Args, Debug)]
pub struct ReceiveArgs {
    /// Channel tag this message arrived on (e.g. `telegram`, `system`).
    #[arg(long)]
    pub channel: String,

    /// Opaque addressee within the channel.
    #[arg(long)]
    pub endpoint: Option<String>,

    /// 1 = most urgent, 3 = least urgent. Default 3.
    #[arg(long, default_value_t = 3, value_parser = clap::value_parser!(i64).range(1..=3))]
    pub priority: i64,

    /// Accepted for wire compatibility with external channel adapters;
    /// suppressing the reply is the adapter's responsibility, not the
    /// queue store's.
    #[arg(long)]
    pub no_reply: bool,

    /// Only deliver once the agent has been idle for
    /// `REQUIRE_IDLE_MIN_SECONDS`.
    #[arg(long)]
    pub require_idle: bool,

    /// Message body.
    #[arg(long)]
    pub content: String,

    /// Emit `{ok, id}` / `{ok:false, error:{code, message}}` on stdout
    /// instead of a human-readable line.
    #[arg(long)]
    pub json: bool,
}

pub async fn run(config: &SharedConfig, args: &ReceiveArgs) -> i32 {
    match run_inner(config, args).await {
        Ok(id) => {
            if args.json {
                println!("{}", serde_json::json!({"ok": true, "id": id}));
            } else {
                println!("OK: received conversation {id}");
            }
            0
        }
        Err(err) => super::report_error(&err, args.json),
    }
}

async fn run_inner(config: &SharedConfig, args: &ReceiveArgs) -> Result<i64, CommandError> {
    if args.content.trim().is_empty() {
        return Err(CommandError::invalid_args("--content must not be empty"));
    }

    let status_surface = StatusSurface::new(config.monitor_dir());
    let health = status_surface
        .read_agent_status()
        .map_err(|e| CommandError::internal(e.to_string()))?
        .map(|s| s.health)
        .unwrap_or(Health::Ok);
    match health {
        Health::Recovering => {
            return Err(CommandError::new(
                ErrorCode::HealthRecovering,
                "agent is recovering; try again shortly",
            ))
        }
        Health::Down => {
            return Err(CommandError::new(
                ErrorCode::HealthDown,
                "agent is declared down; intervention required",
            ))
        }
        Health::Ok | Health::RateLimited => {}
    }

    let store = super::open_store(config).await.map_err(|e| CommandError::internal(e.to_string()))?;
    let row = store
        .insert_conversation(
            "inbound",
            &args.channel,
            args.endpoint.as_deref(),
            &args.content,
            None,
            args.priority,
            args.require_idle,
        )
        .await
        .map_err(|e| CommandError::internal(e.to_string()))?;
    Ok(row.id)
}
