// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use clap::{Parser, Subcommand};

use sentinel::command::{checkpoint, control, dispatcher, fetch, monitor, receive, send, upgrade};
use sentinel::config::SharedConfig;

#[derive(Parser)]
#[command(name = "sentinel", version, about = "Autonomous-agent supervisor: queue, dispatcher, liveness, and upgrades.")]
struct Cli {
    #[command(flatten)]
    config: SharedConfig,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Insert one inbound conversation item.
    Receive(receive::ReceiveArgs),
    /// Record an outbound audit row and invoke the channel adapter.
    Send(send::SendArgs),
    /// Enqueue, inspect, or acknowledge control items.
    Control {
        #[command(subcommand)]
        cmd: control::ControlCommands,
    },
    /// Create or inspect conversation checkpoints.
    Checkpoint {
        #[command(subcommand)]
        cmd: checkpoint::CheckpointCommands,
    },
    /// Print a checkpoint summary plus the conversations in a range.
    Fetch(fetch::FetchArgs),
    /// Run the single-consumer dispatcher loop until SIGINT/SIGTERM.
    Dispatcher,
    /// Run the activity monitor's 1-second tick loop until SIGINT/SIGTERM.
    Monitor,
    /// Check for, or apply, a component upgrade.
    Upgrade {
        #[command(subcommand)]
        cmd: upgrade::UpgradeCommands,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    cli.config.init_tracing();

    let code = match &cli.command {
        Commands::Receive(args) => receive::run(&cli.config, args).await,
        Commands::Send(args) => send::run(&cli.config, args).await,
        Commands::Control { cmd } => control::run(&cli.config, cmd).await,
        Commands::Checkpoint { cmd } => checkpoint::run(&cli.config, cmd).await,
        Commands::Fetch(args) => fetch::run(&cli.config, args).await,
        Commands::Dispatcher => dispatcher::run(&cli.config).await,
        Commands::Monitor => monitor::run(&cli.config).await,
        Commands::Upgrade { cmd } => upgrade::run(&cli.config, cmd).await,
    };
    std::process::exit(code);
}
