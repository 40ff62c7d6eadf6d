// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! CLI subcommands exposed by the `sentinel` binary. Each submodule owns
//! one `clap::Args`/`Subcommand` type and a `run` entry point returning the
//! process exit code.

pub mod checkpoint;
pub mod control;
pub mod dispatcher;
pub mod fetch;
pub mod monitor;
pub mod rate_limit;
pub mod receive;
pub mod send;
pub mod session;
pub mod upgrade;

use crate::config::SharedConfig;
use crate::error::CommandError;
use crate::queue::Store;

/// Open the queue store at the configured install root, creating the
/// directory structure on first run.
pub async fn open_store(config: &SharedConfig) -> anyhow::Result<Store> {
    std::fs::create_dir_all(config.root_dir())?;
    Store::connect(&config.db_url()).await
}

/// Resolves once SIGINT or SIGTERM arrives, shared by every long-running
/// subcommand (`dispatcher`, `monitor`) so both shut down the same way.
#[cfg(unix)]
pub async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(_) => return,
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}

#[cfg(not(unix))]
pub async fn wait_for_shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

/// Print either the `--json` error envelope or a one-line human string for
/// `err`, then return its process exit code.
pub fn report_error(err: &CommandError, json: bool) -> i32 {
    if json {
        println!("{}", err.to_json());
    } else {
        eprintln!("error: {err}");
    }
    err.code.exit_code()
}
