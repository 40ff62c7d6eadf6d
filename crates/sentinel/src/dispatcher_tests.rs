// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

#![allow(clippy::unwrap_used)]

use std::future::Future;
use std::pin::Pin;
use std::sync::Mutex;

use sqlx::sqlite::SqlitePoolOptions;

use super::*;
use crate::queue::InsertControlOptions;
use crate::status::AgentStatus;

struct FakeSubmitter {
    outcome: Mutex<SendOutcome>,
    submitted: Mutex<Vec<String>>,
}

impl FakeSubmitter {
    fn always_submits() -> Self {
        Self {
            outcome: Mutex::new(SendOutcome::Submitted),
            submitted: Mutex::new(Vec::new()),
        }
    }
}

impl Submitter for FakeSubmitter {
    fn send_and_verify<'a>(&'a self, content: &'a str) -> Pin<Box<dyn Future<Output = SendOutcome> + Send + 'a>> {
        Box::pin(async move {
            self.submitted.lock().unwrap().push(content.to_string());
            self.outcome.lock().unwrap().clone()
        })
    }
}

async fn test_store() -> Store {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .unwrap();
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    Store::from_pool(pool)
}

fn test_dispatcher(store: Store, dir: &std::path::Path, submitter: Arc<FakeSubmitter>) -> (Dispatcher, StatusSurface) {
    let status = StatusSurface::new(dir.to_path_buf());
    (Dispatcher::new(store, status.clone(), submitter), status)
}

fn write_idle_status(status: &StatusSurface, idle_seconds: i64) {
    status
        .write_agent_status(&AgentStatus::new(AgentState::Idle, Health::Ok, idle_seconds, 0, 0))
        .unwrap();
}

#[tokio::test(start_paused = true)]
async fn control_claimed_submitted_and_acked_idempotently() {
    let store = test_store().await;
    let dir = tempfile::tempdir().unwrap();
    let submitter = Arc::new(FakeSubmitter::always_submits());
    let (mut dispatcher, status) = test_dispatcher(store.clone(), dir.path(), submitter.clone());
    write_idle_status(&status, 60);

    let control = store
        .insert_control(
            "Heartbeat check.",
            &InsertControlOptions {
                priority: 0,
                bypass_state: true,
                ack_deadline_at: Some(now() + 300),
                ..InsertControlOptions::new()
            },
        )
        .await
        .unwrap();

    let delivered = dispatcher.tick().await.unwrap();
    assert!(delivered);
    assert_eq!(submitter.submitted.lock().unwrap().as_slice(), &["Heartbeat check."]);

    let row = store.get_control(control.id).await.unwrap().unwrap();
    assert_eq!(row.status, "running");

    let ack = store.ack_control(control.id).await.unwrap();
    assert!(!ack.already_final);
    assert_eq!(ack.status, crate::queue::ControlStatus::Done);

    let second_ack = store.ack_control(control.id).await.unwrap();
    assert!(second_ack.already_final);
    assert_eq!(second_ack.status, crate::queue::ControlStatus::Done);
}

#[tokio::test]
async fn control_past_ack_deadline_times_out() {
    let store = test_store().await;
    let control = store
        .insert_control(
            "short-lived",
            &InsertControlOptions {
                ack_deadline_at: Some(now() - 2),
                ..InsertControlOptions::new()
            },
        )
        .await
        .unwrap();

    store.expire_timed_out_controls(now()).await.unwrap();
    let row = store.get_control(control.id).await.unwrap().unwrap();
    assert_eq!(row.status, "timeout");

    let ack = store.ack_control(control.id).await.unwrap();
    assert!(ack.already_final);
    assert_eq!(ack.status, crate::queue::ControlStatus::Timeout);
}

#[tokio::test]
async fn control_beats_conversations_by_priority() {
    let store = test_store().await;
    let dir = tempfile::tempdir().unwrap();
    let submitter = Arc::new(FakeSubmitter::always_submits());
    let (mut dispatcher, status) = test_dispatcher(store.clone(), dir.path(), submitter.clone());
    write_idle_status(&status, 60);

    store.insert_conversation("inbound", "telegram", None, "A", None, 3, false).await.unwrap();
    store.insert_conversation("inbound", "telegram", None, "B", None, 1, false).await.unwrap();
    store
        .insert_control("C", &InsertControlOptions { priority: 0, bypass_state: true, ..InsertControlOptions::new() })
        .await
        .unwrap();

    dispatcher.tick().await.unwrap();
    dispatcher.tick().await.unwrap();
    dispatcher.tick().await.unwrap();

    assert_eq!(submitter.submitted.lock().unwrap().as_slice(), &["C", "B", "A"]);
}

#[tokio::test(start_paused = true)]
async fn require_idle_item_waits_for_idle_state_and_blocks_lower_priority() {
    let store = test_store().await;
    let dir = tempfile::tempdir().unwrap();
    let submitter = Arc::new(FakeSubmitter::always_submits());
    let (mut dispatcher, status) = test_dispatcher(store.clone(), dir.path(), submitter.clone());

    status
        .write_agent_status(&AgentStatus::new(AgentState::Busy, Health::Ok, 0, 0, 0))
        .unwrap();

    let idle_control = store
        .insert_control(
            "idle-only",
            &InsertControlOptions { priority: 0, bypass_state: true, require_idle: true, ..InsertControlOptions::new() },
        )
        .await
        .unwrap();
    store
        .insert_conversation("inbound", "telegram", None, "later", None, 3, false)
        .await
        .unwrap();

    // Busy: claimed then released every tick, never delivered.
    for _ in 0..3 {
        let delivered = dispatcher.tick().await.unwrap();
        assert!(!delivered);
    }
    assert!(submitter.submitted.lock().unwrap().is_empty());
    let row = store.get_control(idle_control.id).await.unwrap().unwrap();
    assert_eq!(row.status, "pending");

    write_idle_status(&status, 60);
    let delivered = dispatcher.tick().await.unwrap();
    assert!(delivered);
    assert_eq!(submitter.submitted.lock().unwrap().as_slice(), &["idle-only"]);
}

#[tokio::test(start_paused = true)]
async fn gated_release_does_not_increment_retry_count() {
    let store = test_store().await;
    let dir = tempfile::tempdir().unwrap();
    let submitter = Arc::new(FakeSubmitter::always_submits());
    let (mut dispatcher, status) = test_dispatcher(store.clone(), dir.path(), submitter);

    status
        .write_agent_status(&AgentStatus::new(AgentState::Offline, Health::Down, 0, 0, 0))
        .unwrap();

    let conv = store
        .insert_conversation("inbound", "telegram", None, "hi", None, 3, false)
        .await
        .unwrap();

    dispatcher.tick().await.unwrap();
    let row = store.conversations_by_range(conv.id, conv.id).await.unwrap();
    assert_eq!(row[0].status, "pending");
    assert_eq!(row[0].retry_count, 0);
}

#[tokio::test(start_paused = true)]
async fn paste_failure_increments_retry_until_cap() {
    let store = test_store().await;
    let dir = tempfile::tempdir().unwrap();
    let submitter = Arc::new(FakeSubmitter {
        outcome: Mutex::new(SendOutcome::PasteError("boom".to_string())),
        submitted: Mutex::new(Vec::new()),
    });
    let (mut dispatcher, status) = test_dispatcher(store.clone(), dir.path(), submitter);
    write_idle_status(&status, 60);

    let conv = store
        .insert_conversation("inbound", "telegram", None, "hi", None, 3, false)
        .await
        .unwrap();

    for _ in 0..DispatcherTuning::MAX_RETRIES {
        dispatcher.tick().await.unwrap();
    }

    let row = store.conversations_by_range(conv.id, conv.id).await.unwrap();
    assert_eq!(row[0].status, "failed");
}
