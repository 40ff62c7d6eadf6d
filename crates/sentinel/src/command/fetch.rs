// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! `sentinel queue fetch --unsummarized | --begin <id> --end <id>`
//!: prints the checkpoint summary covering the range (if any)
//! followed by the formatted conversations in it.

use clap::Args;

use crate::config::SharedConfig;
use crate::error::CommandError;
use crate::queue::ConversationRow;

#[derive(Args, Debug)]
#[command(group(clap::ArgGroup::new("range").required(true).args(["unsummarized", "begin"])))]
pub struct FetchArgs {
    /// Fetch everything not yet covered by a checkpoint.
    #[arg(long)]
    pub unsummarized: bool,

    #[arg(long, requires = "end")]
    pub begin: Option<i64>,

    #[arg(long)]
    pub end: Option<i64>,
}

pub async fn run(config: &SharedConfig, args: &FetchArgs) -> i32 {
    match run_inner(config, args).await {
        Ok(code) => code,
        Err(err) => {
            eprintln!("error: {err}");
            err.code.exit_code()
        }
    }
}

async fn run_inner(config: &SharedConfig, args: &FetchArgs) -> Result<i32, CommandError> {
    let store = super::open_store(config).await.map_err(|e| CommandError::internal(e.to_string()))?;

    let (begin, end) = if args.unsummarized {
        let range = store
            .unsummarized_range()
            .await
            .map_err(|e| CommandError::internal(e.to_string()))?;
        (range.begin_id, range.end_id)
    } else {
        let begin = args.begin.ok_or_else(|| CommandError::invalid_args("--begin requires --end"))?;
        let end = args
            .end
            .ok_or_else(|| CommandError::invalid_args("--begin requires --end"))?;
        (begin, end)
    };

    if end < begin {
        println!("(nothing to fetch)");
        return Ok(0);
    }

    if let Some(checkpoint) = store.last_checkpoint().await.map_err(|e| CommandError::internal(e.to_string()))? {
        if checkpoint.start_conversation_id <= end && checkpoint.end_conversation_id >= begin {
            if let Some(summary) = &checkpoint.summary {
                println!("--- checkpoint {} summary ---", checkpoint.id);
                println!("{summary}");
                println!();
            }
        }
    }

    let conversations = store
        .conversations_by_range(begin, end)
        .await
        .map_err(|e| CommandError::internal(e.to_string()))?;
    for conversation in &conversations {
        println!("{}", format_conversation(conversation));
    }
    Ok(0)
}

fn format_conversation(row: &ConversationRow) -> String {
    format!(
        "[{}] {} {} ({}): {}",
        row.id,
        row.direction,
        row.channel,
        row.endpoint.as_deref().unwrap_or("-"),
        row.content
    )
}
