// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! `sentinel queue checkpoint create|latest|list`.

use clap::{Args, Subcommand};

use crate::config::SharedConfig;
use crate::error::CommandError;

#[derive(Subcommand, Debug)]
pub enum CheckpointCommands {
    /// Create a checkpoint covering up to `end_id`.
    Create(CreateArgs),
    /// Print the most recent checkpoint.
    Latest,
    /// List the most recent checkpoints.
    List(ListArgs),
}

#[derive(Args, Debug)]
pub struct CreateArgs {
    pub end_id: i64,
    #[arg(long)]
    pub summary: Option<String>,
}

#[derive(Args, Debug)]
pub struct ListArgs {
    #[arg(long, default_value_t = 20)]
    pub limit: i64,
}

pub async fn run(config: &SharedConfig, cmd: &CheckpointCommands) -> i32 {
    let result = match cmd {
        CheckpointCommands::Create(args) => run_create(config, args).await,
        CheckpointCommands::Latest => run_latest(config).await,
        CheckpointCommands::List(args) => run_list(config, args).await,
    };
    match result {
        Ok(code) => code,
        Err(err) => {
            eprintln!("error: {err}");
            err.code.exit_code()
        }
    }
}

async fn run_create(config: &SharedConfig, args: &CreateArgs) -> Result<i32, CommandError> {
    let store = super::open_store(config).await.map_err(|e| CommandError::internal(e.to_string()))?;
    let checkpoint = store
        .create_checkpoint(args.end_id, args.summary.as_deref())
        .await
        .map_err(|e| CommandError::invalid_args(e.to_string()))?;
    println!(
        "OK: checkpoint {} covers [{}, {}]",
        checkpoint.id, checkpoint.start_conversation_id, checkpoint.end_conversation_id
    );
    Ok(0)
}

async fn run_latest(config: &SharedConfig) -> Result<i32, CommandError> {
    let store = super::open_store(config).await.map_err(|e| CommandError::internal(e.to_string()))?;
    match store.last_checkpoint().await.map_err(|e| CommandError::internal(e.to_string()))? {
        Some(c) => {
            println!(
                "checkpoint {} [{}, {}] at {}: {}",
                c.id,
                c.start_conversation_id,
                c.end_conversation_id,
                c.timestamp,
                c.summary.as_deref().unwrap_or("(no summary)")
            );
        }
        None => println!("(no checkpoints yet)"),
    }
    Ok(0)
}

async fn run_list(config: &SharedConfig, args: &ListArgs) -> Result<i32, CommandError> {
    let store = super::open_store(config).await.map_err(|e| CommandError::internal(e.to_string()))?;
    let checkpoints = store
        .list_checkpoints(args.limit)
        .await
        .map_err(|e| CommandError::internal(e.to_string()))?;
    for c in checkpoints {
        println!(
            "{}\t[{}, {}]\t{}\t{}",
            c.id,
            c.start_conversation_id,
            c.end_conversation_id,
            c.timestamp,
            c.summary.as_deref().unwrap_or("")
        );
    }
    Ok(0)
}
