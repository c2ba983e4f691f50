// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Happy-path E2E: announce, claim, execute steps in order, notify.

mod common;

use common::*;
use serde_json::json;
use stepfleet_core::kv::KvStore;
use stepfleet_core::lease::lock_key;
use stepfleet_core::session::SessionStatus;

#[tokio::test]
async fn happy_path_executes_steps_in_order() {
    let ctx = TestContext::new();
    let host = ctx.start_host(5).await;

    ctx.connect_session("s1", "conn-1").await;
    ctx.announce("s1").await;
    wait_for_tracked(host.manager(), "s1").await;
    wait_for_status(&ctx.registry, "s1", SessionStatus::Active).await;

    ctx.enqueue("s1", "navigate", json!({"url": "https://example.com"}))
        .await;
    ctx.enqueue("s1", "click", json!({"selector": "#b"})).await;
    ctx.enqueue("s1", "type", json!({"text": "hi", "selector": "#in"}))
        .await;

    wait_for_history_len(&ctx.registry, "s1", 3).await;

    let history = ctx.registry.history("s1").await.unwrap();
    let actions: Vec<&str> = history.iter().map(|s| s.action.as_str()).collect();
    assert_eq!(actions, vec!["navigate", "click", "type"]);

    let state = ctx.registry.state("s1").await.unwrap().unwrap();
    assert_eq!(state.status, SessionStatus::Active);
    assert_eq!(state.total_steps, 3);
    assert!(ctx.registry.is_active("s1").await.unwrap());

    // the client got one notification per step, on its connection
    let deliveries = ctx.notifier.deliveries();
    assert_eq!(deliveries.len(), 3);
    assert!(deliveries.iter().all(|d| d.connection_id == "conn-1"));
    assert_eq!(deliveries[0].step.action, "navigate");

    // recent list is newest first, history is oldest first
    let recent = ctx.registry.recent_steps("s1").await.unwrap();
    assert_eq!(recent[0].action, "type");

    // nothing was replayed on a fresh claim
    assert!(ctx.executor.replayed_actions("s1").is_empty());

    host.shutdown().await.unwrap();
    // graceful shutdown released the lease
    assert_eq!(ctx.kv.get(&lock_key("s1")).await.unwrap(), None);
}

#[tokio::test]
async fn queue_stats_reflect_live_session() {
    let ctx = TestContext::new();
    let host = ctx.start_host(5).await;

    ctx.connect_session("s1", "conn-1").await;
    ctx.announce("s1").await;
    wait_for_tracked(host.manager(), "s1").await;

    ctx.enqueue("s1", "navigate", json!({})).await;
    wait_for_history_len(&ctx.registry, "s1", 1).await;

    let stats = ctx.queues.stats("s1").await.unwrap();
    assert_eq!(stats.queue_name, "rpa-session-s1");
    assert_eq!(stats.job_counts.completed, 1);

    host.shutdown().await.unwrap();
}

#[tokio::test]
async fn reconnect_announcement_to_owner_is_ignored() {
    let ctx = TestContext::new();
    let host = ctx.start_host(5).await;

    ctx.connect_session("s1", "conn-1").await;
    ctx.announce("s1").await;
    wait_for_tracked(host.manager(), "s1").await;
    let manager_id = host.manager().manager_id().to_string();

    // the client reconnects: the gateway re-touches and re-announces
    ctx.connect_session("s1", "conn-2").await;
    ctx.announce("s1").await;
    tokio::time::sleep(std::time::Duration::from_millis(150)).await;

    assert_eq!(host.manager().tracked_sessions().await, vec!["s1"]);
    assert_eq!(
        ctx.kv.get(&lock_key("s1")).await.unwrap().as_deref(),
        Some(manager_id.as_str())
    );
    // completions now go to the new connection
    ctx.enqueue("s1", "click", json!({})).await;
    wait_for_history_len(&ctx.registry, "s1", 1).await;
    let deliveries = ctx.notifier.deliveries();
    assert_eq!(deliveries.last().unwrap().connection_id, "conn-2");

    host.shutdown().await.unwrap();
}

#[tokio::test]
async fn stop_dismantles_worker_and_state() {
    let ctx = TestContext::new();
    let host = ctx.start_host(5).await;

    ctx.connect_session("s1", "conn-1").await;
    ctx.announce("s1").await;
    wait_for_tracked(host.manager(), "s1").await;
    ctx.enqueue("s1", "navigate", json!({})).await;
    wait_for_history_len(&ctx.registry, "s1", 1).await;

    // gateway publishes STOP on client disconnect
    ctx.publish_stop("s1").await;
    wait_for_worker_count(host.manager(), 0).await;

    // all five session keys are gone, queue obliterated, lease released
    assert!(ctx.registry.state("s1").await.unwrap().is_none());
    assert!(ctx.registry.history("s1").await.unwrap().is_empty());
    assert_eq!(ctx.kv.get(&lock_key("s1")).await.unwrap(), None);
    assert!(ctx
        .kv
        .scan_keys("queue:rpa-session-s1:*")
        .await
        .unwrap()
        .is_empty());

    host.shutdown().await.unwrap();
}
