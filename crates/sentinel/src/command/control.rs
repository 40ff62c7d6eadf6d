// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! `sentinel queue control enqueue|get|ack`.

use clap::{Args, Subcommand};

use crate::config::SharedConfig;
use crate::error::CommandError;
use crate::queue::{ControlStatus, InsertControlOptions};

#[derive(Subcommand, Debug)]
pub enum ControlCommands {
    /// Enqueue a control item the agent must acknowledge.
    Enqueue(EnqueueArgs),
    /// Report a control item's status, sweeping expired deadlines first.
    Get(GetArgs),
    /// Acknowledge a control item (idempotent).
    Ack(AckArgs),
}

#[derive(Args, Debug)]
pub struct EnqueueArgs {
    #[arg(long)]
    pub content: String,
    #[arg(long, default_value_t = 3)]
    pub priority: i64,
    #[arg(long)]
    pub require_idle: bool,
    #[arg(long)]
    pub bypass_state: bool,
    /// Seconds from now after which an un-acked item is swept to `timeout`.
    #[arg(long = "ack-deadline")]
    pub ack_deadline: Option<i64>,
    /// Seconds from now before which the item is ineligible for claim.
    #[arg(long = "available-in")]
    pub available_in: Option<i64>,
}

#[derive(Args, Debug)]
pub struct GetArgs {
    #[arg(long)]
    pub id: i64,
}

#[derive(Args, Debug)]
pub struct AckArgs {
    #[arg(long)]
    pub id: i64,
}

pub async fn run(config: &SharedConfig, cmd: &ControlCommands) -> i32 {
    let result = match cmd {
        ControlCommands::Enqueue(args) => run_enqueue(config, args).await,
        ControlCommands::Get(args) => run_get(config, args).await,
        ControlCommands::Ack(args) => run_ack(config, args).await,
    };
    match result {
        Ok(code) => code,
        Err(err) => {
            eprintln!("error: {err}");
            err.code.exit_code()
        }
    }
}

fn now() -> i64 {
    chrono::Utc::now().timestamp()
}

async fn run_enqueue(config: &SharedConfig, args: &EnqueueArgs) -> Result<i32, CommandError> {
    let store = super::open_store(config).await.map_err(|e| CommandError::internal(e.to_string()))?;
    let opts = InsertControlOptions {
        priority: args.priority,
        require_idle: args.require_idle,
        bypass_state: args.bypass_state,
        ack_deadline_at: args.ack_deadline.map(|secs| now() + secs),
        available_at: args.available_in.map(|secs| now() + secs),
    };
    let row = store
        .insert_control(&args.content, &opts)
        .await
        .map_err(|e| CommandError::internal(e.to_string()))?;
    println!("OK: enqueued control {}", row.id);
    Ok(0)
}

async fn run_get(config: &SharedConfig, args: &GetArgs) -> Result<i32, CommandError> {
    let store = super::open_store(config).await.map_err(|e| CommandError::internal(e.to_string()))?;
    // Sweep deadlines before reporting.
    store
        .expire_timed_out_controls(now())
        .await
        .map_err(|e| CommandError::internal(e.to_string()))?;
    let row = store
        .get_control(args.id)
        .await
        .map_err(|e| CommandError::internal(e.to_string()))?
        .ok_or_else(|| CommandError::not_found(format!("control {} not found", args.id)))?;
    println!("status={}", row.status);
    Ok(0)
}

async fn run_ack(config: &SharedConfig, args: &AckArgs) -> Result<i32, CommandError> {
    let store = super::open_store(config).await.map_err(|e| CommandError::internal(e.to_string()))?;
    let result = store
        .ack_control(args.id)
        .await
        .map_err(|e| CommandError::internal(e.to_string()))?;
    if !result.found {
        return Err(CommandError::not_found(format!("control {} not found", args.id)));
    }
    if result.already_final {
        println!(
            "OK: control {} already in final state ({})",
            args.id, result.status
        );
    } else if result.status == ControlStatus::Timeout {
        println!("OK: control {} marked as timeout", args.id);
    } else {
        println!("OK: control {} marked as done", args.id);
    }
    Ok(0)
}
