// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Crash-and-recover E2E: a lost lease relinquishes the worker without
//! touching shared state; the next claimant replays history and drains
//! the jobs the previous owner never got to.

mod common;

use std::time::Duration;

use common::*;
use serde_json::json;
use stepfleet_core::kv::KvStore;
use stepfleet_core::lease::lock_key;
use stepfleet_core::session::SessionStatus;

#[tokio::test]
async fn crash_and_recover_replays_history_then_drains_queue() {
    let ctx = TestContext::new();

    // ---- first owner completes two of three steps ----
    let host1 = ctx.start_host(5).await;
    ctx.connect_session("s1", "conn-1").await;
    ctx.announce("s1").await;
    wait_for_tracked(host1.manager(), "s1").await;

    ctx.enqueue("s1", "navigate", json!({"url": "https://example.com"}))
        .await;
    ctx.enqueue("s1", "click", json!({"selector": "#b"})).await;
    wait_for_history_len(&ctx.registry, "s1", 2).await;
    assert_eq!(ctx.notifier.count(), 2);

    // ---- simulate the crash: the lease falls to someone else ----
    ctx.kv.delete_many(&[lock_key("s1")]).await.unwrap();
    ctx.kv
        .put(&lock_key("s1"), "intruder", Some(Duration::from_secs(30)))
        .await
        .unwrap();

    // the owner detects the loss on its next renewal and relinquishes
    // without cleaning shared state
    wait_for_worker_count(host1.manager(), 0).await;
    assert_eq!(ctx.registry.history("s1").await.unwrap().len(), 2);
    assert!(ctx.registry.state("s1").await.unwrap().is_some());
    host1.shutdown().await.unwrap();

    // a third step arrives while nobody owns the session; the queue is
    // durable, so it waits
    ctx.enqueue("s1", "type", json!({"text": "hi", "selector": "#in"}))
        .await;

    // the stale lease expires (simulated by removal)
    ctx.kv.delete_many(&[lock_key("s1")]).await.unwrap();

    // ---- second owner claims on re-announcement ----
    let host2 = ctx.start_host(5).await;
    ctx.announce("s1").await;
    wait_for_tracked(host2.manager(), "s1").await;
    wait_for_history_len(&ctx.registry, "s1", 3).await;
    wait_for_status(&ctx.registry, "s1", SessionStatus::Active).await;

    // the two completed steps were replayed, in timestamp order, without
    // client-visible notifications; only the third step notified
    assert_eq!(
        ctx.executor.replayed_actions("s1"),
        vec!["navigate", "click"]
    );
    assert_eq!(ctx.notifier.count(), 3);

    let history = ctx.registry.history("s1").await.unwrap();
    let actions: Vec<&str> = history.iter().map(|s| s.action.as_str()).collect();
    assert_eq!(actions, vec!["navigate", "click", "type"]);

    // only the live executions ran through execute(); replays went through
    // the recovery path
    assert_eq!(
        ctx.executor.executed_actions("s1"),
        vec!["navigate", "click", "type"]
    );

    host2.shutdown().await.unwrap();
}

#[tokio::test]
async fn recovery_passes_through_recovering_status() {
    let ctx = TestContext::new();

    // history left behind by a dead owner
    ctx.connect_session("s1", "conn-1").await;
    for (i, action) in ["navigate", "click"].iter().enumerate() {
        ctx.registry
            .log_step_completion(
                "s1",
                &stepfleet_core::session::Step {
                    id: format!("old-{i}"),
                    action: action.to_string(),
                    data: json!({}),
                    timestamp: 1000 + i as i64,
                },
            )
            .await
            .unwrap();
    }

    let host = ctx.start_host(5).await;
    ctx.announce("s1").await;
    wait_for_tracked(host.manager(), "s1").await;
    wait_for_status(&ctx.registry, "s1", SessionStatus::Active).await;

    assert_eq!(
        ctx.executor.replayed_actions("s1"),
        vec!["navigate", "click"]
    );
    // replay never goes through execute() and never notifies
    assert!(ctx.executor.executed_actions("s1").is_empty());
    assert_eq!(ctx.notifier.count(), 0);

    // recovery progress was reported through the state record
    let state = ctx.registry.state("s1").await.unwrap().unwrap();
    assert_eq!(state.error.as_deref(), Some("replaying step 2/2"));
    assert_eq!(state.total_steps, 2);

    host.shutdown().await.unwrap();
}

#[tokio::test]
async fn stalled_job_from_dead_owner_is_requeued_and_executed() {
    let ctx = TestContext::new();

    ctx.connect_session("s1", "conn-1").await;
    // the dead owner popped a job into the active list and never settled it
    let job_id = ctx.enqueue("s1", "navigate", json!({})).await;
    ctx.kv
        .list_pop_head("queue:rpa-session-s1:wait")
        .await
        .unwrap();
    ctx.kv
        .list_push_tail("queue:rpa-session-s1:active", &job_id)
        .await
        .unwrap();

    let host = ctx.start_host(5).await;
    ctx.announce("s1").await;
    wait_for_history_len(&ctx.registry, "s1", 1).await;

    let history = ctx.registry.history("s1").await.unwrap();
    assert_eq!(history[0].id, job_id);

    host.shutdown().await.unwrap();
}
