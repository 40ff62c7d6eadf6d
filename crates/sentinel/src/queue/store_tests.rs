// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

#![allow(clippy::unwrap_used, clippy::expect_used)]

use super::*;
use sqlx::sqlite::SqlitePoolOptions;

async fn test_store() -> Store {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .expect("open in-memory sqlite");
    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .expect("run migrations");
    Store::from_pool(pool)
}

#[tokio::test]
async fn insert_conversation_defaults_by_direction() {
    let store = test_store().await;
    let inbound = store
        .insert_conversation("inbound", "telegram", None, "hi", None, 3, false)
        .await
        .unwrap();
    assert_eq!(inbound.status, "pending");

    let outbound = store
        .insert_conversation("outbound", "telegram", None, "reply", None, 3, false)
        .await
        .unwrap();
    assert_eq!(outbound.status, "delivered");
}

#[tokio::test]
async fn insert_conversation_rejects_unknown_direction() {
    let store = test_store().await;
    let err = store
        .insert_conversation("sideways", "telegram", None, "hi", None, 3, false)
        .await
        .unwrap_err();
    assert!(err.to_string().contains("unknown direction"));
}

#[tokio::test]
async fn control_id_token_is_substituted_in_same_transaction() {
    let store = test_store().await;
    let row = store
        .insert_control(
            "ack with: control ack --id __CONTROL_ID__",
            &InsertControlOptions::new(),
        )
        .await
        .unwrap();
    assert_eq!(
        row.content,
        format!("ack with: control ack --id {}", row.id)
    );
}

#[tokio::test]
async fn claim_control_is_conditional_and_single_winner() {
    let store = test_store().await;
    let row = store
        .insert_control("do the thing", &InsertControlOptions::new())
        .await
        .unwrap();

    assert!(store.claim_control(row.id).await.unwrap());
    // Second claim on an already-running row must not succeed.
    assert!(!store.claim_control(row.id).await.unwrap());
}

#[tokio::test]
async fn next_pending_control_skips_future_available_at() {
    let store = test_store().await;
    let future = chrono::Utc::now().timestamp() + 3600;
    let mut opts = InsertControlOptions::new();
    opts.available_at = Some(future);
    store.insert_control("later", &opts).await.unwrap();

    let immediate = store
        .insert_control("now", &InsertControlOptions::new())
        .await
        .unwrap();

    let claimed = store
        .next_pending_control(chrono::Utc::now().timestamp())
        .await
        .unwrap()
        .expect("one eligible row");
    assert_eq!(claimed.id, immediate.id);
}

#[tokio::test]
async fn priority_then_fifo_ordering_s3() {
    let store = test_store().await;
    let conv_a = store
        .insert_conversation("inbound", "system", None, "A", None, 3, false)
        .await
        .unwrap();
    let conv_b = store
        .insert_conversation("inbound", "system", None, "B", None, 1, false)
        .await
        .unwrap();
    let control_c = store
        .insert_control("C", &InsertControlOptions::new())
        .await
        .unwrap();

    // Strict control priority: C always wins regardless of conversation priority.
    let next_control = store
        .next_pending_control(chrono::Utc::now().timestamp())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(next_control.id, control_c.id);

    let next_conv = store.next_pending_conversation().await.unwrap().unwrap();
    assert_eq!(next_conv.id, conv_b.id);
    assert_ne!(next_conv.id, conv_a.id);
}

#[tokio::test]
async fn ack_idempotence_s1() {
    let store = test_store().await;
    let row = store
        .insert_control("Heartbeat check.", &InsertControlOptions::new())
        .await
        .unwrap();
    store.claim_control(row.id).await.unwrap();

    let first = store.ack_control(row.id).await.unwrap();
    assert!(!first.already_final);
    assert_eq!(first.status, ControlStatus::Done);

    let second = store.ack_control(row.id).await.unwrap();
    assert!(second.already_final);
    assert_eq!(second.status, ControlStatus::Done);
}

#[tokio::test]
async fn ack_after_deadline_transitions_to_timeout_s2() {
    let store = test_store().await;
    let mut opts = InsertControlOptions::new();
    opts.ack_deadline_at = Some(chrono::Utc::now().timestamp() - 1);
    let row = store.insert_control("slow", &opts).await.unwrap();
    store.claim_control(row.id).await.unwrap();

    let result = store.ack_control(row.id).await.unwrap();
    assert_eq!(result.status, ControlStatus::Timeout);

    let second = store.ack_control(row.id).await.unwrap();
    assert!(second.already_final);
    assert_eq!(second.status, ControlStatus::Timeout);
}

#[tokio::test]
async fn expire_timed_out_controls_sweeps_before_dispatch_invariant3() {
    let store = test_store().await;
    let mut opts = InsertControlOptions::new();
    opts.ack_deadline_at = Some(chrono::Utc::now().timestamp() - 10);
    let row = store.insert_control("expired", &opts).await.unwrap();

    let now_ts = chrono::Utc::now().timestamp();
    let swept = store.expire_timed_out_controls(now_ts).await.unwrap();
    assert_eq!(swept, 1);

    let refreshed = store.get_control(row.id).await.unwrap().unwrap();
    assert_eq!(refreshed.status, "timeout");
}

#[tokio::test]
async fn retry_or_fail_control_transitions_to_failed_at_cap() {
    let store = test_store().await;
    let row = store
        .insert_control("flaky", &InsertControlOptions::new())
        .await
        .unwrap();
    store.claim_control(row.id).await.unwrap();

    let r1 = store
        .retry_or_fail_control(row.id, "paste error", 2)
        .await
        .unwrap();
    assert_eq!(r1.status, ControlStatus::Pending);
    assert_eq!(r1.retry_count, 1);

    store.claim_control(row.id).await.unwrap();
    let r2 = store
        .retry_or_fail_control(row.id, "paste error", 2)
        .await
        .unwrap();
    assert_eq!(r2.status, ControlStatus::Failed);
    assert_eq!(r2.retry_count, 2);
}

#[tokio::test]
async fn requeue_does_not_touch_retry_count() {
    let store = test_store().await;
    let row = store
        .insert_conversation("inbound", "system", None, "hi", None, 3, false)
        .await
        .unwrap();
    store.claim_conversation(row.id).await.unwrap();
    store.requeue_conversation(row.id).await.unwrap();

    let refreshed = store.next_pending_conversation().await.unwrap().unwrap();
    assert_eq!(refreshed.id, row.id);
    assert_eq!(refreshed.retry_count, 0);
}

#[tokio::test]
async fn checkpoint_monotonicity() {
    let store = test_store().await;
    for i in 1..=5 {
        store
            .insert_conversation("inbound", "system", None, &format!("msg {i}"), None, 3, false)
            .await
            .unwrap();
    }

    let first = store.create_checkpoint(3, Some("first three")).await.unwrap();
    assert_eq!(first.start_conversation_id, 1);
    assert_eq!(first.end_conversation_id, 3);

    let second = store.create_checkpoint(5, Some("rest")).await.unwrap();
    assert_eq!(second.start_conversation_id, 4);
    assert_eq!(second.end_conversation_id, 5);

    let err = store.create_checkpoint(4, None).await.unwrap_err();
    assert!(err.to_string().contains("monotonic"));
}

#[tokio::test]
async fn unsummarized_range_reflects_last_checkpoint() {
    let store = test_store().await;
    for i in 1..=3 {
        store
            .insert_conversation("inbound", "system", None, &format!("msg {i}"), None, 3, false)
            .await
            .unwrap();
    }
    let range = store.unsummarized_range().await.unwrap();
    assert_eq!(range.begin_id, 1);
    assert_eq!(range.end_id, 3);
    assert_eq!(range.count, 3);

    store.create_checkpoint(2, None).await.unwrap();
    let range = store.unsummarized_range().await.unwrap();
    assert_eq!(range.begin_id, 3);
    assert_eq!(range.end_id, 3);
    assert_eq!(range.count, 1);
}

#[tokio::test]
async fn reclaim_orphaned_running_controls_resets_with_retry() {
    let store = test_store().await;
    let row = store
        .insert_control("orphan", &InsertControlOptions::new())
        .await
        .unwrap();
    store.claim_control(row.id).await.unwrap();
    // Simulate an old `updated_at` by backdating directly.
    sqlx::query("UPDATE control_items SET updated_at = ? WHERE id = ?")
        .bind(chrono::Utc::now().timestamp() - 120)
        .bind(row.id)
        .execute(&store.pool_for_test())
        .await
        .unwrap();

    let reclaimed = store.reclaim_orphaned_running_controls(30).await.unwrap();
    assert_eq!(reclaimed, 1);

    let refreshed = store.get_control(row.id).await.unwrap().unwrap();
    assert_eq!(refreshed.status, "pending");
    assert_eq!(refreshed.retry_count, 1);
}
