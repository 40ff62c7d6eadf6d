// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

#![allow(clippy::unwrap_used)]

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, Ordering};
use std::sync::Mutex;

use chrono::{FixedOffset, TimeZone};

use super::*;
use crate::liveness::{HeartbeatPoll, LivenessState};
use crate::status::HeartbeatPhase;

#[derive(Default)]
struct FakeLivenessDeps {
    pending: Mutex<Option<crate::status::PendingHeartbeat>>,
}

impl LivenessDeps for FakeLivenessDeps {
    fn enqueue_heartbeat<'a>(&'a self, _phase: HeartbeatPhase) -> BoxFuture<'a, i64> {
        Box::pin(async move { Ok(1) })
    }
    fn get_heartbeat_status<'a>(&'a self, _control_id: i64) -> BoxFuture<'a, HeartbeatPoll> {
        Box::pin(async move { Ok(HeartbeatPoll::Done) })
    }
    fn read_pending(&self) -> anyhow::Result<Option<crate::status::PendingHeartbeat>> {
        Ok(self.pending.lock().unwrap().clone())
    }
    fn write_pending(&self, pending: &crate::status::PendingHeartbeat) -> anyhow::Result<()> {
        *self.pending.lock().unwrap() = Some(pending.clone());
        Ok(())
    }
    fn clear_pending(&self) -> anyhow::Result<()> {
        *self.pending.lock().unwrap() = None;
        Ok(())
    }
    fn kill_session<'a>(&'a self) -> BoxFuture<'a, ()> {
        Box::pin(async move { Ok(()) })
    }
    fn notify_pending_channels<'a>(&'a self) -> BoxFuture<'a, ()> {
        Box::pin(async move { Ok(()) })
    }
}

#[derive(Default)]
struct FakeSessionProbe {
    exists: AtomicBool,
    running: AtomicBool,
    log_mtime: AtomicI64,
    spawn_calls: AtomicU32,
}

impl SessionProbe for FakeSessionProbe {
    fn session_exists<'a>(&'a self) -> BoxFuture<'a, bool> {
        Box::pin(async move { Ok(self.exists.load(Ordering::SeqCst)) })
    }
    fn agent_process_running<'a>(&'a self) -> BoxFuture<'a, bool> {
        Box::pin(async move { Ok(self.running.load(Ordering::SeqCst)) })
    }
    fn spawn_agent<'a>(&'a self) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            self.spawn_calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }
    fn kill_session<'a>(&'a self) -> BoxFuture<'a, ()> {
        Box::pin(async move { Ok(()) })
    }
    fn terminal_activity_time<'a>(&'a self) -> BoxFuture<'a, Option<i64>> {
        Box::pin(async move { Ok(None) })
    }
    fn conversation_log_mtime<'a>(&'a self) -> BoxFuture<'a, Option<i64>> {
        Box::pin(async move { Ok(Some(self.log_mtime.load(Ordering::SeqCst))) })
    }
}

#[derive(Default)]
struct FakeContextUsageProbe {
    usage: Mutex<Option<f64>>,
}

impl ContextUsageProbe for FakeContextUsageProbe {
    fn usage_fraction<'a>(&'a self) -> BoxFuture<'a, Option<f64>> {
        Box::pin(async move { Ok(*self.usage.lock().unwrap()) })
    }
}

#[derive(Default)]
struct FakeEnqueuer {
    reports: AtomicU32,
    handoffs: AtomicU32,
    health_checks: AtomicU32,
}

impl ControlEnqueuer for FakeEnqueuer {
    fn enqueue_context_report<'a>(&'a self) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            self.reports.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }
    fn enqueue_context_handoff<'a>(&'a self) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            self.handoffs.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }
    fn enqueue_health_check<'a>(&'a self) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            self.health_checks.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }
}

struct FakeDailyTaskRunner {
    calls: Arc<AtomicU32>,
}

impl DailyTaskRunner for FakeDailyTaskRunner {
    fn run<'a>(&'a self) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }
}

fn monitor(
    dir: &std::path::Path,
    daily_tasks: Vec<DailyTaskSpec>,
) -> ActivityMonitor<FakeLivenessDeps, FakeSessionProbe, FakeContextUsageProbe, FakeEnqueuer> {
    ActivityMonitor::new(
        StatusSurface::new(dir.to_path_buf()),
        FakeSessionProbe::default(),
        FakeContextUsageProbe::default(),
        FakeEnqueuer::default(),
        LivenessEngine::new(FakeLivenessDeps::default(), LivenessState::default()),
        daily_tasks,
        FixedOffset::east_opt(0).unwrap(),
    )
}

#[tokio::test]
async fn offline_session_spawns_after_restart_delay() {
    let dir = tempfile::tempdir().unwrap();
    let mut mon = monitor(dir.path(), vec![]);
    mon.session.exists.store(false, Ordering::SeqCst);

    let status = mon.tick(0).await.unwrap();
    assert_eq!(status.state, AgentState::Offline);
    assert_eq!(mon.session.spawn_calls.load(Ordering::SeqCst), 0);

    mon.tick(9).await.unwrap();
    assert_eq!(mon.session.spawn_calls.load(Ordering::SeqCst), 0);

    mon.tick(10).await.unwrap();
    assert_eq!(mon.session.spawn_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn stopped_process_spawns_after_restart_delay() {
    let dir = tempfile::tempdir().unwrap();
    let mut mon = monitor(dir.path(), vec![]);
    mon.session.exists.store(true, Ordering::SeqCst);
    mon.session.running.store(false, Ordering::SeqCst);

    let status = mon.tick(0).await.unwrap();
    assert_eq!(status.state, AgentState::Stopped);

    mon.tick(10).await.unwrap();
    assert_eq!(mon.session.spawn_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn idle_seconds_track_from_first_idle_tick() {
    let dir = tempfile::tempdir().unwrap();
    let mut mon = monitor(dir.path(), vec![]);
    mon.session.exists.store(true, Ordering::SeqCst);
    mon.session.running.store(true, Ordering::SeqCst);
    mon.session.log_mtime.store(100, Ordering::SeqCst);

    let status = mon.tick(100).await.unwrap();
    assert_eq!(status.state, AgentState::Busy);

    let status = mon.tick(105).await.unwrap();
    assert_eq!(status.state, AgentState::Idle);
    assert_eq!(status.idle_seconds, 0);

    let status = mon.tick(108).await.unwrap();
    assert_eq!(status.state, AgentState::Idle);
    assert_eq!(status.idle_seconds, 3);
}

#[tokio::test]
async fn daily_task_runs_once_per_local_date() {
    let dir = tempfile::tempdir().unwrap();
    let calls = Arc::new(AtomicU32::new(0));
    let task = DailyTaskSpec {
        name: "upgrade".to_string(),
        hour: 5,
        runner: Arc::new(FakeDailyTaskRunner { calls: calls.clone() }),
    };
    let mut mon = monitor(dir.path(), vec![task]);
    mon.session.exists.store(true, Ordering::SeqCst);
    mon.session.running.store(true, Ordering::SeqCst);

    let day1_5am = chrono::Utc.with_ymd_and_hms(2026, 7, 28, 5, 0, 0).unwrap().timestamp();
    mon.session.log_mtime.store(day1_5am, Ordering::SeqCst);
    mon.tick(day1_5am).await.unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    // Same local day, same hour: does not fire again.
    mon.tick(day1_5am + 30).await.unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    let day2_5am = chrono::Utc.with_ymd_and_hms(2026, 7, 29, 5, 0, 0).unwrap().timestamp();
    mon.session.log_mtime.store(day2_5am, Ordering::SeqCst);
    mon.tick(day2_5am).await.unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn context_usage_check_enqueues_report_then_handoff_above_threshold() {
    let dir = tempfile::tempdir().unwrap();
    let mut mon = monitor(dir.path(), vec![]);
    mon.session.exists.store(true, Ordering::SeqCst);
    mon.session.running.store(true, Ordering::SeqCst);
    mon.session.log_mtime.store(0, Ordering::SeqCst);
    *mon.context_probe.usage.lock().unwrap() = Some(0.9);

    mon.tick(0).await.unwrap();
    assert_eq!(mon.enqueuer.reports.load(Ordering::SeqCst), 1);
    assert_eq!(mon.enqueuer.handoffs.load(Ordering::SeqCst), 0);

    mon.tick(29).await.unwrap();
    assert_eq!(mon.enqueuer.handoffs.load(Ordering::SeqCst), 0);

    mon.tick(30).await.unwrap();
    assert_eq!(mon.enqueuer.handoffs.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn context_usage_check_skips_handoff_below_threshold() {
    let dir = tempfile::tempdir().unwrap();
    let mut mon = monitor(dir.path(), vec![]);
    mon.session.exists.store(true, Ordering::SeqCst);
    mon.session.running.store(true, Ordering::SeqCst);
    mon.session.log_mtime.store(0, Ordering::SeqCst);
    *mon.context_probe.usage.lock().unwrap() = Some(0.1);

    mon.tick(0).await.unwrap();
    mon.tick(30).await.unwrap();
    assert_eq!(mon.enqueuer.handoffs.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn health_check_enqueues_once_per_interval() {
    let dir = tempfile::tempdir().unwrap();
    let mut mon = monitor(dir.path(), vec![]);
    mon.session.exists.store(true, Ordering::SeqCst);
    mon.session.running.store(true, Ordering::SeqCst);
    mon.session.log_mtime.store(0, Ordering::SeqCst);

    mon.tick(0).await.unwrap();
    assert_eq!(mon.enqueuer.health_checks.load(Ordering::SeqCst), 1);

    mon.tick(100).await.unwrap();
    assert_eq!(mon.enqueuer.health_checks.load(Ordering::SeqCst), 1);
}

#[test]
fn activity_log_truncates_once_per_local_day() {
    let dir = tempfile::tempdir().unwrap();
    let log_path = dir.path().join("activity.log");
    std::fs::write(&log_path, b"stale content").unwrap();
    let mut last = None;

    let utc = FixedOffset::east_opt(0).unwrap();
    let day1 = chrono::Utc.with_ymd_and_hms(2026, 7, 28, 0, 5, 0).unwrap().timestamp();
    assert!(truncate_activity_log_if_new_day(&log_path, &mut last, day1, utc).unwrap());
    assert_eq!(std::fs::metadata(&log_path).unwrap().len(), 0);

    assert!(!truncate_activity_log_if_new_day(&log_path, &mut last, day1 + 60, utc).unwrap());

    let day2 = chrono::Utc.with_ymd_and_hms(2026, 7, 29, 0, 5, 0).unwrap().timestamp();
    assert!(truncate_activity_log_if_new_day(&log_path, &mut last, day2, utc).unwrap());
}
