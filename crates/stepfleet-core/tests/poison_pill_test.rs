// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Poison-pill E2E: a job that exhausts its retries stops the session.

mod common;

use std::time::Duration;

use common::*;
use serde_json::json;
use stepfleet_core::kv::KvStore;
use stepfleet_core::lease::lock_key;
use stepfleet_core::queue::EnqueueOpts;
use stepfleet_core::session::{SessionStatus, StepPayload, STOP_COMMAND};

#[tokio::test]
async fn exhausted_job_fails_the_session() {
    let ctx = TestContext::new();
    let host = ctx.start_host(5).await;

    ctx.connect_session("s1", "conn-1").await;
    ctx.announce("s1").await;
    wait_for_tracked(host.manager(), "s1").await;

    ctx.executor.fail_action("explode", u32::MAX);
    let mut control = ctx.subscribe_control("s1").await;

    let job_id = ctx
        .queues
        .enqueue(
            "s1",
            &StepPayload {
                action: "explode".to_string(),
                data: json!({}),
            },
            EnqueueOpts {
                backoff: Some(Duration::from_millis(5)),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    // exactly one STOP graduates the failure to a terminal session
    let stop = tokio::time::timeout(WAIT_TIMEOUT, control.next())
        .await
        .expect("timeout waiting for STOP")
        .expect("control channel closed");
    assert_eq!(stop.payload, STOP_COMMAND);

    wait_for_worker_count(host.manager(), 0).await;
    wait_for_status(&ctx.registry, "s1", SessionStatus::Failed).await;

    // the terminal diagnosis survives cleanup
    let state = ctx.registry.state("s1").await.unwrap().unwrap();
    assert_eq!(state.status, SessionStatus::Failed);
    assert_eq!(state.failed_job_id.as_deref(), Some(job_id.as_str()));
    assert!(state
        .error
        .as_deref()
        .is_some_and(|e| e.contains("explode")));

    // queue obliterated, lease released, nothing in history
    assert!(ctx
        .kv
        .scan_keys("queue:rpa-session-s1:*")
        .await
        .unwrap()
        .is_empty());
    assert_eq!(ctx.kv.get(&lock_key("s1")).await.unwrap(), None);
    assert!(ctx.registry.history("s1").await.unwrap().is_empty());

    // every attempt went through the executor
    assert_eq!(ctx.executor.executed_actions("s1").len(), 3);

    host.shutdown().await.unwrap();
}

#[tokio::test]
async fn transient_failure_retries_and_recovers() {
    let ctx = TestContext::new();
    let host = ctx.start_host(5).await;

    ctx.connect_session("s1", "conn-1").await;
    ctx.announce("s1").await;
    wait_for_tracked(host.manager(), "s1").await;

    // fails twice, succeeds on the third and final attempt
    ctx.executor.fail_action("flaky", 2);
    ctx.queues
        .enqueue(
            "s1",
            &StepPayload {
                action: "flaky".to_string(),
                data: json!({}),
            },
            EnqueueOpts {
                backoff: Some(Duration::from_millis(5)),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    wait_for_history_len(&ctx.registry, "s1", 1).await;

    assert_eq!(ctx.executor.executed_actions("s1").len(), 3);
    let state = ctx.registry.state("s1").await.unwrap().unwrap();
    assert_eq!(state.total_steps, 1);
    assert!(state.failed_job_id.is_none());
    // the status keeps the last failure diagnosis; only a status update
    // overwrites it, never a completed step
    assert_eq!(state.status, SessionStatus::Error);
    assert!(state.error.as_deref().is_some_and(|e| e.contains("flaky")));
    assert_eq!(ctx.notifier.count(), 1);

    host.shutdown().await.unwrap();
}
