// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

/// Configuration shared by every sentinel subcommand: where the install
/// root lives, how to log, and which tmux session the agent runs in.
///
/// Every subcommand flattens this into its own `clap::Args` struct.
#[derive(Debug, Clone, Parser)]
pub struct SharedConfig {
    /// Install root directory (holds `conversations.db`, `activity-monitor/`,
    /// `locks/`, `components.json`, etc).
    #[arg(long, env = "SENTINEL_ROOT", default_value = "~/.local/state/sentinel")]
    pub root: String,

    /// tmux session name the agent runs inside.
    #[arg(long, env = "SENTINEL_SESSION", default_value = "sentinel-agent")]
    pub session: String,

    /// tmux socket path (isolated server). Defaults to the user's default server.
    #[arg(long, env = "SENTINEL_TMUX_SOCKET")]
    pub tmux_socket: Option<PathBuf>,

    /// Log format (json or text).
    #[arg(long, env = "SENTINEL_LOG_FORMAT", default_value = "json")]
    pub log_format: String,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, env = "SENTINEL_LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// UTC offset in minutes the Activity Monitor uses as "local time" for
    /// the once-per-local-day daily task scheduler and activity-log
    /// rotation (e.g. `-300` for US Eastern standard time). Defaults to 0
    /// (UTC) rather than the host's system timezone, so a fresh install
    /// behaves the same in any container regardless of its own TZ.
    #[arg(long, env = "SENTINEL_TZ_OFFSET_MINUTES", default_value_t = 0)]
    pub timezone_offset_minutes: i32,
}

impl SharedConfig {
    /// Resolve `~` in `root` and return the install root as an absolute path.
    pub fn root_dir(&self) -> PathBuf {
        if let Some(rest) = self.root.strip_prefix("~/") {
            let home = std::env::var("HOME").unwrap_or_default();
            PathBuf::from(home).join(rest)
        } else {
            PathBuf::from(&self.root)
        }
    }

    pub fn db_path(&self) -> PathBuf {
        self.root_dir().join("conversations.db")
    }

    pub fn monitor_dir(&self) -> PathBuf {
        self.root_dir().join("activity-monitor")
    }

    pub fn locks_dir(&self) -> PathBuf {
        self.root_dir().join("locks")
    }

    pub fn components_dir(&self) -> PathBuf {
        self.root_dir().join("components")
    }

    pub fn skills_dir(&self) -> PathBuf {
        self.root_dir().join("skills")
    }

    pub fn registry_path(&self) -> PathBuf {
        self.root_dir().join("components.json")
    }

    /// SQLite connection URL: a local WAL-mode database shared by many
    /// short-lived writer processes.
    pub fn db_url(&self) -> String {
        format!("sqlite://{}?mode=rwc", self.db_path().display())
    }

    /// The configured "local" timezone as a fixed UTC offset, used by the
    /// Activity Monitor's daily-task scheduler and activity-log rotation.
    /// `timezone_offset_minutes` is clamped to a day on either side, so the
    /// conversion below can never fail.
    #[allow(clippy::unwrap_used)]
    pub fn timezone(&self) -> chrono::FixedOffset {
        let minutes = self.timezone_offset_minutes.clamp(-1439, 1439);
        chrono::FixedOffset::east_opt(minutes * 60).unwrap()
    }

    /// Initialize `tracing_subscriber` according to `log_format`/`log_level`.
    pub fn init_tracing(&self) {
        let filter = tracing_subscriber::EnvFilter::try_new(&self.log_level)
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
        let subscriber = tracing_subscriber::fmt().with_env_filter(filter);
        if self.log_format == "json" {
            let _ = subscriber.json().try_init();
        } else {
            let _ = subscriber.try_init();
        }
    }
}

/// Dispatcher tunables.
pub struct DispatcherTuning;

impl DispatcherTuning {
    pub const CLEANUP_INTERVAL: Duration = Duration::from_secs(3600);
    pub const RETENTION: Duration = Duration::from_secs(7 * 24 * 3600);
    pub const REQUIRE_IDLE_MIN_SECONDS: u64 = 10;
    pub const POST_SEND_HOLD_MS: u64 = 500;
    pub const EXECUTION_MAX_WAIT_MS: u64 = 60_000;
    pub const RETRY_BASE: Duration = Duration::from_secs(2);
    pub const MAX_RETRIES: u32 = 5;
    pub const POLL_INTERVAL_BASE: Duration = Duration::from_millis(250);
    pub const POLL_INTERVAL_MAX: Duration = Duration::from_secs(5);
    /// Orphaned `running` rows older than this on dispatcher startup are
    /// reset to `pending` with one retry increment.
    pub const ORPHAN_RUNNING_THRESHOLD: Duration = Duration::from_secs(30);
}

/// Terminal I/O adapter tunables.
pub struct TerminalTuning;

impl TerminalTuning {
    pub const PASTE_DELAY_BASE: Duration = Duration::from_millis(100);
    pub const PASTE_DELAY_PER_KB: Duration = Duration::from_millis(50);
    pub const PASTE_DELAY_MAX: Duration = Duration::from_secs(5);
    pub const ENTER_VERIFY_MAX_RETRIES: u32 = 3;
    pub const ENTER_VERIFY_WAIT_MS: u64 = 300;
}

/// Liveness engine tunables.
pub struct LivenessTuning;

impl LivenessTuning {
    pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30 * 60);
    pub const ACK_DEADLINE: Duration = Duration::from_secs(5 * 60);
    pub const MAX_PENDING_AGE: Duration = Duration::from_secs(10 * 60);
    pub const MAX_RESTART_FAILURES: u32 = 3;
    pub const RATE_LIMITED_PROBE_INTERVAL: Duration = Duration::from_secs(5 * 60);
    pub const DOWN_RETRY_INTERVAL: Duration = Duration::from_secs(30 * 60);
}

/// Activity monitor tunables.
pub struct MonitorTuning;

impl MonitorTuning {
    pub const TICK: Duration = Duration::from_secs(1);
    pub const IDLE_THRESHOLD: Duration = Duration::from_secs(3);
    pub const RESTART_DELAY: Duration = Duration::from_secs(10);
    pub const CONTEXT_CHECK_INTERVAL: Duration = Duration::from_secs(3600);
    pub const CONTEXT_HANDOFF_DELAY: Duration = Duration::from_secs(30);
    pub const CONTEXT_USAGE_THRESHOLD: f64 = 0.70;
    pub const HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(6 * 3600);
}

/// Component upgrader tunables.
pub struct UpgradeTuning;

impl UpgradeTuning {
    /// Wall-clock timeout for subprocess invocations: package install,
    /// post-install hook, service stop/start.
    pub const SUBPROCESS_TIMEOUT: Duration = Duration::from_secs(120);
    /// Poll interval and deadline while waiting for a restarted service to
    /// report `online`.
    pub const SERVICE_VERIFY_POLL_INTERVAL: Duration = Duration::from_millis(500);
    pub const SERVICE_VERIFY_DEADLINE: Duration = Duration::from_secs(30);
    /// HTTP timeout for the version check and archive download.
    pub const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(60);
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;
