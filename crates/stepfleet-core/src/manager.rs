// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Worker manager: claims announced sessions under capacity, drives
//! recovery replay, and supervises one single-concurrency worker task per
//! claimed session.
//!
//! Each worker is a supervised task with two inputs: the session's queue
//! and a stop signal. The task finishes the currently-executing step
//! before honoring a stop; `STOP` is cooperative cancellation, not an
//! abort. Lease renewal rides the same loop, so a lease lost while a long
//! step executes is detected on the next renewal and the worker
//! relinquishes locally, leaving recovery to the next claimant.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::{CoreError, Result};
use crate::executor::{CompletionNotifier, StepExecutor};
use crate::kv::KvStore;
use crate::lease::SessionLease;
use crate::queue::{Job, QueueEvent, QueueService, QueueWorker};
use crate::registry::SessionRegistry;
use crate::session::{now_millis, SessionStatus, Step, STOP_COMMAND};

/// Worker manager tuning knobs.
#[derive(Debug, Clone)]
pub struct WorkerManagerConfig {
    /// Maximum sessions this host claims concurrently.
    pub max_workers: usize,
    /// Queue poll interval while idle.
    pub poll_interval: Duration,
    /// Lease renewal interval.
    pub renew_interval: Duration,
}

impl Default for WorkerManagerConfig {
    fn default() -> Self {
        Self {
            max_workers: 5,
            poll_interval: Duration::from_millis(250),
            renew_interval: Duration::from_secs(10),
        }
    }
}

struct WorkerHandle {
    stop_tx: watch::Sender<bool>,
    join: JoinHandle<()>,
    events_task: JoinHandle<()>,
    is_processing: Arc<AtomicBool>,
    #[allow(dead_code)]
    created_at: DateTime<Utc>,
}

enum WorkerEntry {
    /// Reserved while the claim/spawn sequence runs.
    Starting,
    Running(WorkerHandle),
    /// Reserved while a stop drains the worker.
    Stopping,
}

/// One instance per host process. Holds the in-memory map of claimed
/// sessions and the per-process manager identity leases are tagged with.
pub struct WorkerManager {
    manager_id: String,
    registry: SessionRegistry,
    queues: QueueService,
    lease: SessionLease,
    executor: Arc<dyn StepExecutor>,
    notifier: Arc<dyn CompletionNotifier>,
    config: WorkerManagerConfig,
    workers: Mutex<HashMap<String, WorkerEntry>>,
}

impl WorkerManager {
    /// Create a manager with a fresh UUIDv4 identity.
    pub fn new(
        kv: Arc<dyn KvStore>,
        queues: QueueService,
        executor: Arc<dyn StepExecutor>,
        notifier: Arc<dyn CompletionNotifier>,
        config: WorkerManagerConfig,
    ) -> Self {
        let manager_id = Uuid::new_v4().to_string();
        Self::with_lease(
            SessionRegistry::new(kv.clone()),
            queues,
            SessionLease::new(kv, manager_id.clone()),
            executor,
            notifier,
            config,
            manager_id,
        )
    }

    /// Create a manager around an explicit lease handle. Tests shorten the
    /// lease TTL through this.
    pub fn with_lease(
        registry: SessionRegistry,
        queues: QueueService,
        lease: SessionLease,
        executor: Arc<dyn StepExecutor>,
        notifier: Arc<dyn CompletionNotifier>,
        config: WorkerManagerConfig,
        manager_id: String,
    ) -> Self {
        Self {
            manager_id,
            registry,
            queues,
            lease,
            executor,
            notifier,
            config,
            workers: Mutex::new(HashMap::new()),
        }
    }

    /// The per-process manager identity.
    pub fn manager_id(&self) -> &str {
        &self.manager_id
    }

    /// Ids of the sessions currently tracked by this host.
    pub async fn tracked_sessions(&self) -> Vec<String> {
        let workers = self.workers.lock().await;
        let mut ids: Vec<String> = workers.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Number of sessions currently tracked by this host.
    pub async fn worker_count(&self) -> usize {
        self.workers.lock().await.len()
    }

    /// True while the session's worker is executing a step.
    pub async fn is_processing(&self, session_id: &str) -> bool {
        let workers = self.workers.lock().await;
        match workers.get(session_id) {
            Some(WorkerEntry::Running(handle)) => handle.is_processing.load(Ordering::SeqCst),
            _ => false,
        }
    }

    async fn remove_entry(&self, session_id: &str) {
        self.workers.lock().await.remove(session_id);
    }

    /// Handle a `new-sessions-channel` announcement.
    ///
    /// Ignores the announcement when at capacity (another host will pick it
    /// up), when the session is already tracked locally, or when the lease
    /// is held elsewhere. Any spawn failure releases the lease.
    pub async fn on_new_session(self: &Arc<Self>, session_id: &str) -> Result<()> {
        {
            let mut workers = self.workers.lock().await;
            if workers.len() >= self.config.max_workers {
                debug!(session_id, "at capacity, ignoring announcement");
                return Ok(());
            }
            if workers.contains_key(session_id) {
                debug!(session_id, "session already tracked, ignoring announcement");
                return Ok(());
            }
            workers.insert(session_id.to_string(), WorkerEntry::Starting);
        }

        let acquired = match self.lease.acquire(session_id).await {
            Ok(acquired) => acquired,
            Err(e) => {
                self.remove_entry(session_id).await;
                return Err(e);
            }
        };
        if !acquired {
            debug!(session_id, "lease held elsewhere, ignoring announcement");
            self.remove_entry(session_id).await;
            return Ok(());
        }

        if let Err(e) = self.spawn_worker(session_id).await {
            warn!(session_id, error = %e, "spawn failed, releasing lease");
            if let Err(release_err) = self.lease.release(session_id).await {
                warn!(session_id, error = %release_err, "lease release failed");
            }
            self.remove_entry(session_id).await;
            return Err(e);
        }
        Ok(())
    }

    /// Claim-side spawn: recovery replay when history exists, stalled-job
    /// requeue, then the supervised worker task.
    async fn spawn_worker(self: &Arc<Self>, session_id: &str) -> Result<()> {
        if let Some(state) = self.registry.state(session_id).await? {
            if state.status == SessionStatus::Terminated {
                return Err(CoreError::SessionTerminated(session_id.to_string()));
            }
        }

        let mut history = self.registry.history(session_id).await?;
        if !history.is_empty() {
            // the store returns sorted history; sort anyway
            history.sort_by_key(|step| step.timestamp);
            let total = history.len();
            info!(session_id, steps = total, "recovering session from history");
            for (index, step) in history.iter().enumerate() {
                self.registry
                    .update_status(
                        session_id,
                        SessionStatus::Recovering,
                        Some(&format!("replaying step {}/{total}", index + 1)),
                    )
                    .await?;
                self.executor
                    .replay(session_id, step)
                    .await
                    .map_err(|e| CoreError::Executor(e.to_string()))?;
            }
            // A STOP from the previous owner may have torn state down while
            // we replayed; only go live if the lease is still ours.
            if !self.lease.is_owned(session_id).await? {
                return Err(CoreError::LeaseLost {
                    session_id: session_id.to_string(),
                    holder: None,
                });
            }
        }
        self.registry
            .update_status(session_id, SessionStatus::Active, None)
            .await?;

        let (worker, mut events_rx) = self.queues.worker(session_id);
        worker.recover_stalled().await?;

        let (stop_tx, stop_rx) = watch::channel(false);
        let is_processing = Arc::new(AtomicBool::new(false));

        let events_task = tokio::spawn({
            let manager = Arc::clone(self);
            let session_id = session_id.to_string();
            async move {
                while let Some(event) = events_rx.recv().await {
                    manager.handle_queue_event(&session_id, event);
                }
            }
        });
        let join = tokio::spawn(run_worker(
            Arc::clone(self),
            session_id.to_string(),
            worker,
            stop_rx,
            is_processing.clone(),
        ));

        let handle = WorkerHandle {
            stop_tx,
            join,
            events_task,
            is_processing,
            created_at: Utc::now(),
        };

        let mut workers = self.workers.lock().await;
        match workers.get_mut(session_id) {
            Some(entry @ WorkerEntry::Starting) => {
                *entry = WorkerEntry::Running(handle);
                info!(session_id, manager_id = %self.manager_id, "worker started");
                Ok(())
            }
            _ => {
                // the reservation was overtaken (a STOP landed mid-spawn)
                handle.join.abort();
                handle.events_task.abort();
                Err(CoreError::Protocol(format!(
                    "worker reservation for '{session_id}' vanished during spawn"
                )))
            }
        }
    }

    /// Execute one job: delegate to the executor, persist the completed
    /// step, and notify the gateway when a connection is bound. On failure
    /// the error is recorded and propagated so the queue applies
    /// retry/backoff; the step is not added to history.
    async fn process_step(&self, session_id: &str, job: &Job) -> Result<()> {
        debug!(session_id, job_id = %job.job_id, action = %job.data.action, "executing step");
        match self.executor.execute(session_id, &job.data).await {
            Ok(_result) => {
                let step = Step {
                    id: job.job_id.clone(),
                    action: job.data.action.clone(),
                    data: job.data.data.clone(),
                    timestamp: now_millis(),
                };
                self.registry.log_step_completion(session_id, &step).await?;
                if let Some(connection_id) = self.registry.connection_id(session_id).await? {
                    self.notifier
                        .step_completed(&connection_id, session_id, &step)
                        .await;
                }
                Ok(())
            }
            Err(e) => {
                self.registry
                    .update_status(session_id, SessionStatus::Error, Some(&e.to_string()))
                    .await?;
                if job.attempts_made + 1 >= job.max_attempts {
                    self.registry
                        .record_failed_job(session_id, &job.job_id)
                        .await?;
                }
                Err(CoreError::Executor(e.to_string()))
            }
        }
    }

    fn handle_queue_event(&self, session_id: &str, event: QueueEvent) {
        match event {
            QueueEvent::Completed { job_id } => {
                debug!(session_id, job_id = %job_id, "job completed");
            }
            QueueEvent::Stalled { job_id } => {
                warn!(session_id, job_id = %job_id, "stalled job requeued");
            }
            QueueEvent::Failed {
                job_id,
                reason,
                attempts_made,
                max_attempts,
                terminal,
            } => {
                if terminal {
                    warn!(
                        session_id,
                        job_id = %job_id,
                        reason = %reason,
                        "job failed permanently"
                    );
                } else {
                    debug!(
                        session_id,
                        job_id = %job_id,
                        attempts_made,
                        max_attempts,
                        reason = %reason,
                        "job failed, will retry"
                    );
                }
            }
        }
    }

    /// Handle a message on `session-control:<sessionId>`.
    pub async fn on_session_control(self: &Arc<Self>, session_id: &str, command: &str) -> Result<()> {
        if command != STOP_COMMAND {
            debug!(session_id, command, "reserved control payload ignored");
            return Ok(());
        }
        let tracked = self.workers.lock().await.contains_key(session_id);
        if !tracked {
            return Ok(());
        }

        // A STOP caused by a poison pill graduates the session to failed.
        if let Ok(Some(state)) = self.registry.state(session_id).await {
            if state.status == SessionStatus::Error && state.failed_job_id.is_some() {
                if let Err(e) = self
                    .registry
                    .update_status(session_id, SessionStatus::Failed, None)
                    .await
                {
                    warn!(session_id, error = %e, "failed-status write failed");
                }
            }
        }
        self.stop_worker(session_id).await
    }

    /// Drain and dismantle a worker.
    ///
    /// Order matters: queue cleanup precedes lease release so a
    /// re-announcement arriving after release does not find stale queue
    /// state under a new owner. A terminal diagnosis (failed, terminated)
    /// is written back after cleanup so it stays visible until TTL expiry.
    pub async fn stop_worker(&self, session_id: &str) -> Result<()> {
        let handle = {
            let mut workers = self.workers.lock().await;
            match workers.get(session_id) {
                Some(WorkerEntry::Running(_)) => {
                    match workers.insert(session_id.to_string(), WorkerEntry::Stopping) {
                        Some(WorkerEntry::Running(handle)) => handle,
                        _ => return Ok(()),
                    }
                }
                Some(WorkerEntry::Starting) => {
                    // spawn in flight; overtake the reservation so the
                    // install step aborts and releases the lease
                    workers.insert(session_id.to_string(), WorkerEntry::Stopping);
                    return Ok(());
                }
                _ => return Ok(()),
            }
        };

        info!(session_id, "stopping worker");
        let _ = handle.stop_tx.send(true);
        if let Err(e) = handle.join.await {
            error!(session_id, error = %e, "worker task join failed");
        }
        if let Err(e) = handle.events_task.await {
            error!(session_id, error = %e, "event task join failed");
        }

        // Shared state is single-writer under the lease. If it slipped away
        // mid-stop, the successor owns the queue and records now.
        if !self.lease.is_owned(session_id).await.unwrap_or(false) {
            warn!(session_id, "lease no longer held, skipping shared-state cleanup");
            self.remove_entry(session_id).await;
            return Ok(());
        }

        let terminal_state = self
            .registry
            .state(session_id)
            .await
            .ok()
            .flatten()
            .filter(|state| state.status.is_terminal());

        if let Err(e) = self.queues.cleanup(session_id).await {
            warn!(session_id, error = %e, "queue cleanup failed");
        }
        if let Err(e) = self.registry.cleanup(session_id).await {
            warn!(session_id, error = %e, "registry cleanup failed");
        }
        if let Some(state) = terminal_state {
            if let Err(e) = self.registry.restore_state(session_id, &state).await {
                warn!(session_id, error = %e, "terminal state restore failed");
            }
        }
        if let Err(e) = self.lease.release(session_id).await {
            warn!(session_id, error = %e, "lease release failed");
        }
        self.remove_entry(session_id).await;
        info!(session_id, "worker stopped");
        Ok(())
    }

    /// Graceful host shutdown: stop every tracked worker, releasing leases
    /// so announcements resume quickly elsewhere.
    pub async fn shutdown(&self) {
        let session_ids = self.tracked_sessions().await;
        info!(
            manager_id = %self.manager_id,
            sessions = session_ids.len(),
            "manager shutting down"
        );
        for session_id in session_ids {
            if let Err(e) = self.stop_worker(&session_id).await {
                warn!(session_id = %session_id, error = %e, "stop during shutdown failed");
            }
        }
    }
}

/// Supervised per-session worker loop: drain the queue one job at a time,
/// renew the lease between jobs, honor stop between jobs.
async fn run_worker(
    manager: Arc<WorkerManager>,
    session_id: String,
    worker: QueueWorker,
    mut stop_rx: watch::Receiver<bool>,
    is_processing: Arc<AtomicBool>,
) {
    let renew_interval = manager.config.renew_interval;
    let poll_interval = manager.config.poll_interval;
    let mut last_renew = tokio::time::Instant::now();

    loop {
        if *stop_rx.borrow() {
            break;
        }

        if last_renew.elapsed() >= renew_interval {
            match manager.lease.renew(&session_id).await {
                Ok(()) => last_renew = tokio::time::Instant::now(),
                Err(e @ CoreError::LeaseLost { .. }) => {
                    warn!(
                        session_id = %session_id,
                        error = %e,
                        "lease lost, relinquishing worker"
                    );
                    // Shared state belongs to the new owner now; only the
                    // local entry is removed.
                    manager.remove_entry(&session_id).await;
                    return;
                }
                Err(e) => {
                    warn!(session_id = %session_id, error = %e, "lease renewal failed");
                    last_renew = tokio::time::Instant::now();
                }
            }
        }

        match worker.next_job().await {
            Ok(Some(job)) => {
                is_processing.store(true, Ordering::SeqCst);
                let result = manager.process_step(&session_id, &job).await;
                let settle = match result {
                    Ok(()) => worker.complete(&job).await,
                    Err(e) => worker.fail(&job, &e.to_string()).await.map(|_| ()),
                };
                is_processing.store(false, Ordering::SeqCst);
                if let Err(e) = settle {
                    error!(session_id = %session_id, error = %e, "job settlement failed");
                }
            }
            Ok(None) => {
                tokio::select! {
                    biased;
                    _ = stop_rx.changed() => {}
                    _ = tokio::time::sleep(poll_interval) => {}
                }
            }
            Err(e) if e.is_transient() => {
                warn!(session_id = %session_id, error = %e, "queue dispatch failed, retrying");
                tokio::select! {
                    biased;
                    _ = stop_rx.changed() => {}
                    _ = tokio::time::sleep(poll_interval) => {}
                }
            }
            Err(e) => {
                // a broken queue record is fatal for this worker
                error!(session_id = %session_id, error = %e, "worker error, stopping");
                let manager = Arc::clone(&manager);
                let session_id = session_id.clone();
                tokio::spawn(async move {
                    if let Err(e) = manager.stop_worker(&session_id).await {
                        warn!(session_id = %session_id, error = %e, "stop after worker error failed");
                    }
                });
                return;
            }
        }
    }
}
