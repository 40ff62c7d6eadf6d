// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! `sentinel dispatcher` — runs the single-consumer claim/render/submit/
//! verify loop until SIGINT/SIGTERM.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::SharedConfig;
use crate::dispatcher::Dispatcher;
use crate::status::StatusSurface;
use crate::terminal::TmuxAdapter;

pub async fn run(config: &SharedConfig) -> i32 {
    match run_inner(config).await {
        Ok(()) => 0,
        Err(err) => {
            tracing::error!(error = %err, "dispatcher exited with an error");
            1
        }
    }
}

async fn run_inner(config: &SharedConfig) -> anyhow::Result<()> {
    let store = super::open_store(config).await?;
    let status = StatusSurface::new(config.monitor_dir());
    let terminal = Arc::new(TmuxAdapter::new(config.session.clone(), config.tmux_socket.clone()));

    let mut dispatcher = Dispatcher::new(store, status, terminal);
    let shutdown = CancellationToken::new();
    let watcher = shutdown.clone();
    tokio::spawn(async move {
        super::wait_for_shutdown_signal().await;
        info!("shutdown signal received");
        watcher.cancel();
    });

    dispatcher.run(shutdown).await
}
