// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Per-session ordered job queues with retry/backoff.
//!
//! Queue state lives entirely in the KV store under
//! `<prefix>:rpa-session-<sessionId>:*`, so a successor host can drain jobs
//! enqueued before the previous owner crashed. Dispatch is single-concurrency
//! per queue; together with the session lease this gives FIFO execution per
//! session.

use std::sync::Arc;
use std::time::Duration;

use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::{CoreError, Result};
use crate::kv::KvStore;
use crate::session::{control_channel, now_millis, StepPayload, STOP_COMMAND};

/// Default key prefix for queue state.
pub const DEFAULT_QUEUE_PREFIX: &str = "queue";

/// Default retry budget per job.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Base delay of the exponential backoff.
pub const DEFAULT_BACKOFF: Duration = Duration::from_secs(2);

/// Completed-job records kept per queue.
pub const REMOVE_ON_COMPLETE: i64 = 100;

/// Failed-job records kept per queue.
pub const REMOVE_ON_FAIL: i64 = 50;

const JOB_TTL: Duration = Duration::from_secs(3600);
const JOB_ID_SUFFIX_LEN: usize = 9;

/// Queue name for a session.
pub fn queue_name(session_id: &str) -> String {
    format!("rpa-session-{session_id}")
}

fn qkey(prefix: &str, session_id: &str, suffix: &str) -> String {
    format!("{prefix}:rpa-session-{session_id}:{suffix}")
}

/// An enqueued step awaiting execution, with retry bookkeeping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    /// Globally unique id: `<sessionId>-<millis>-<9 random chars>`.
    pub job_id: String,
    /// The step to execute.
    pub data: StepPayload,
    /// Failed dispatch attempts so far.
    pub attempts_made: u32,
    /// Retry budget.
    pub max_attempts: u32,
    /// Base backoff delay in milliseconds; doubles per attempt.
    pub backoff_ms: u64,
}

/// Options recognized by [`QueueService::enqueue`].
#[derive(Debug, Clone, Default)]
pub struct EnqueueOpts {
    /// Positive priority enqueues at the head of the line.
    pub priority: Option<i64>,
    /// Delay before the job becomes eligible for dispatch.
    pub delay: Option<Duration>,
    /// Override the retry budget.
    pub attempts: Option<u32>,
    /// Override the exponential backoff base delay.
    pub backoff: Option<Duration>,
}

/// Per-state job counts for a queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct JobCounts {
    /// Jobs waiting for dispatch (including delayed ones).
    pub waiting: u64,
    /// Jobs currently executing.
    pub active: u64,
    /// Retained completed jobs.
    pub completed: u64,
    /// Retained permanently-failed jobs.
    pub failed: u64,
}

/// Snapshot returned by [`QueueService::stats`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueStats {
    /// True when anything is waiting or executing.
    pub is_active: bool,
    /// The per-state counts.
    pub job_counts: JobCounts,
    /// The queue name.
    pub queue_name: String,
}

/// Signals observable by the worker manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueEvent {
    /// A job finished successfully.
    Completed {
        /// The job id.
        job_id: String,
    },
    /// A dispatch attempt failed. `terminal` is true once the retry budget
    /// is exhausted; at that point a `STOP` has been published on the
    /// session's control channel.
    Failed {
        /// The job id.
        job_id: String,
        /// The failure message.
        reason: String,
        /// Attempts made including this one.
        attempts_made: u32,
        /// The retry budget.
        max_attempts: u32,
        /// Whether the budget is exhausted.
        terminal: bool,
    },
    /// A job was found mid-flight from a previous owner and was requeued.
    Stalled {
        /// The job id.
        job_id: String,
    },
}

/// Factory and bookkeeping operations for per-session queues.
#[derive(Clone)]
pub struct QueueService {
    kv: Arc<dyn KvStore>,
    prefix: String,
}

impl QueueService {
    /// Create a queue service with the default key prefix.
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self::with_prefix(kv, DEFAULT_QUEUE_PREFIX)
    }

    /// Create a queue service with a custom key prefix.
    pub fn with_prefix(kv: Arc<dyn KvStore>, prefix: &str) -> Self {
        Self {
            kv,
            prefix: prefix.to_string(),
        }
    }

    fn key(&self, session_id: &str, suffix: &str) -> String {
        qkey(&self.prefix, session_id, suffix)
    }

    fn job_key(&self, session_id: &str, job_id: &str) -> String {
        self.key(session_id, &format!("job:{job_id}"))
    }

    /// Enqueue a step. Returns the assigned job id.
    pub async fn enqueue(
        &self,
        session_id: &str,
        payload: &StepPayload,
        opts: EnqueueOpts,
    ) -> Result<String> {
        let suffix: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(JOB_ID_SUFFIX_LEN)
            .map(char::from)
            .collect();
        let job_id = format!("{session_id}-{}-{suffix}", now_millis());

        let job = Job {
            job_id: job_id.clone(),
            data: payload.clone(),
            attempts_made: 0,
            max_attempts: opts.attempts.unwrap_or(DEFAULT_MAX_ATTEMPTS),
            backoff_ms: opts.backoff.unwrap_or(DEFAULT_BACKOFF).as_millis() as u64,
        };
        self.kv
            .put(
                &self.job_key(session_id, &job_id),
                &serde_json::to_string(&job)?,
                Some(JOB_TTL),
            )
            .await?;

        if let Some(delay) = opts.delay {
            let due = now_millis() + delay.as_millis() as i64;
            self.kv
                .sorted_set_add(&self.key(session_id, "delayed"), due as f64, &job_id)
                .await?;
            self.kv
                .expire(&self.key(session_id, "delayed"), JOB_TTL)
                .await?;
        } else if opts.priority.unwrap_or(0) > 0 {
            self.kv
                .list_push_head(&self.key(session_id, "wait"), &job_id)
                .await?;
            self.kv.expire(&self.key(session_id, "wait"), JOB_TTL).await?;
        } else {
            self.kv
                .list_push_tail(&self.key(session_id, "wait"), &job_id)
                .await?;
            self.kv.expire(&self.key(session_id, "wait"), JOB_TTL).await?;
        }

        debug!(session_id, job_id = %job_id, "job enqueued");
        Ok(job_id)
    }

    /// Halt dispatch. In-flight jobs complete normally.
    pub async fn pause(&self, session_id: &str) -> Result<()> {
        self.kv
            .hash_write(
                &self.key(session_id, "meta"),
                &[("paused", "1".to_string())],
                Some(JOB_TTL),
            )
            .await?;
        Ok(())
    }

    /// Restart dispatch after a pause.
    pub async fn resume(&self, session_id: &str) -> Result<()> {
        self.kv
            .hash_write(
                &self.key(session_id, "meta"),
                &[("paused", "0".to_string())],
                Some(JOB_TTL),
            )
            .await?;
        Ok(())
    }

    /// Per-state job counts.
    pub async fn counts(&self, session_id: &str) -> Result<JobCounts> {
        let waiting = self.kv.list_len(&self.key(session_id, "wait")).await?
            + self
                .kv
                .sorted_set_cardinality(&self.key(session_id, "delayed"))
                .await?;
        let active = self.kv.list_len(&self.key(session_id, "active")).await?;
        let completed = self.kv.list_len(&self.key(session_id, "completed")).await?;
        let failed = self.kv.list_len(&self.key(session_id, "failed")).await?;
        Ok(JobCounts {
            waiting,
            active,
            completed,
            failed,
        })
    }

    /// Queue snapshot for introspection.
    pub async fn stats(&self, session_id: &str) -> Result<QueueStats> {
        let job_counts = self.counts(session_id).await?;
        Ok(QueueStats {
            is_active: job_counts.waiting > 0 || job_counts.active > 0,
            job_counts,
            queue_name: queue_name(session_id),
        })
    }

    /// Forcibly obliterate the queue and its bookkeeping. Irreversible.
    pub async fn cleanup(&self, session_id: &str) -> Result<()> {
        let keys = self
            .kv
            .scan_keys(&self.key(session_id, "*"))
            .await?;
        self.kv.delete_many(&keys).await?;
        debug!(session_id, removed = keys.len(), "queue obliterated");
        Ok(())
    }

    /// Create the single-concurrency worker for a session's queue, plus the
    /// event stream the claiming manager observes.
    pub fn worker(&self, session_id: &str) -> (QueueWorker, mpsc::UnboundedReceiver<QueueEvent>) {
        let (events, events_rx) = mpsc::unbounded_channel();
        (
            QueueWorker {
                kv: self.kv.clone(),
                prefix: self.prefix.clone(),
                session_id: session_id.to_string(),
                events,
            },
            events_rx,
        )
    }
}

/// Single-concurrency dispatch over one session's queue.
///
/// Exactly one worker per session is permitted to drain the queue; the
/// session lease enforces this across hosts.
pub struct QueueWorker {
    kv: Arc<dyn KvStore>,
    prefix: String,
    session_id: String,
    events: mpsc::UnboundedSender<QueueEvent>,
}

impl QueueWorker {
    fn key(&self, suffix: &str) -> String {
        qkey(&self.prefix, &self.session_id, suffix)
    }

    fn job_key(&self, job_id: &str) -> String {
        self.key(&format!("job:{job_id}"))
    }

    fn emit(&self, event: QueueEvent) {
        // The receiver lives on the owning manager; a closed channel just
        // means the manager is shutting the worker down.
        let _ = self.events.send(event);
    }

    /// Requeue jobs left in the active list by a previous owner.
    pub async fn recover_stalled(&self) -> Result<()> {
        let stalled = self.kv.list_range(&self.key("active"), 0, -1).await?;
        if stalled.is_empty() {
            return Ok(());
        }
        warn!(
            session_id = %self.session_id,
            count = stalled.len(),
            "requeuing stalled jobs"
        );
        for job_id in stalled.iter().rev() {
            self.kv.list_push_head(&self.key("wait"), job_id).await?;
            self.emit(QueueEvent::Stalled {
                job_id: job_id.clone(),
            });
        }
        self.kv.delete_many(&[self.key("active")]).await?;
        Ok(())
    }

    async fn is_paused(&self) -> Result<bool> {
        let meta = self.kv.hash_read_all(&self.key("meta")).await?;
        Ok(meta.get("paused").map(String::as_str) == Some("1"))
    }

    async fn promote_due(&self) -> Result<()> {
        let due = self
            .kv
            .sorted_set_range_by_score(
                &self.key("delayed"),
                f64::NEG_INFINITY,
                now_millis() as f64,
            )
            .await?;
        for job_id in due {
            self.kv
                .sorted_set_remove(&self.key("delayed"), &job_id)
                .await?;
            self.kv.list_push_tail(&self.key("wait"), &job_id).await?;
        }
        Ok(())
    }

    /// Take the next eligible job, moving it to the active list. Returns
    /// `None` when the queue is paused or empty.
    pub async fn next_job(&self) -> Result<Option<Job>> {
        if self.is_paused().await? {
            return Ok(None);
        }
        self.promote_due().await?;

        let Some(job_id) = self.kv.list_pop_head(&self.key("wait")).await? else {
            return Ok(None);
        };
        self.kv.list_push_tail(&self.key("active"), &job_id).await?;

        let Some(serialized) = self.kv.get(&self.job_key(&job_id)).await? else {
            self.kv.list_remove(&self.key("active"), &job_id).await?;
            return Err(CoreError::JobUnreadable {
                job_id,
                reason: "payload record missing".to_string(),
            });
        };
        let job: Job = serde_json::from_str(&serialized).map_err(|e| CoreError::JobUnreadable {
            job_id: job_id.clone(),
            reason: e.to_string(),
        })?;
        Ok(Some(job))
    }

    /// Record a successful execution.
    pub async fn complete(&self, job: &Job) -> Result<()> {
        self.kv
            .list_remove(&self.key("active"), &job.job_id)
            .await?;
        self.kv.delete_many(&[self.job_key(&job.job_id)]).await?;
        self.kv
            .list_push_head(&self.key("completed"), &job.job_id)
            .await?;
        self.kv
            .list_trim(&self.key("completed"), 0, REMOVE_ON_COMPLETE - 1)
            .await?;
        self.emit(QueueEvent::Completed {
            job_id: job.job_id.clone(),
        });
        Ok(())
    }

    /// Record a failed execution. Schedules a retry with exponential
    /// backoff while the budget lasts; otherwise records the permanent
    /// failure and publishes `STOP` on the session's control channel,
    /// the single rule for graduating a transient failure to a terminal
    /// session. Returns true when the failure was terminal.
    pub async fn fail(&self, job: &Job, reason: &str) -> Result<bool> {
        let attempts_made = job.attempts_made + 1;
        self.kv
            .list_remove(&self.key("active"), &job.job_id)
            .await?;

        let mut updated = job.clone();
        updated.attempts_made = attempts_made;
        self.kv
            .put(
                &self.job_key(&job.job_id),
                &serde_json::to_string(&updated)?,
                Some(JOB_TTL),
            )
            .await?;

        if attempts_made < job.max_attempts {
            let backoff_ms = job.backoff_ms << (attempts_made - 1);
            let due = now_millis() + backoff_ms as i64;
            self.kv
                .sorted_set_add(&self.key("delayed"), due as f64, &job.job_id)
                .await?;
            debug!(
                session_id = %self.session_id,
                job_id = %job.job_id,
                attempts_made,
                backoff_ms,
                "job failed, retry scheduled"
            );
            self.emit(QueueEvent::Failed {
                job_id: job.job_id.clone(),
                reason: reason.to_string(),
                attempts_made,
                max_attempts: job.max_attempts,
                terminal: false,
            });
            return Ok(false);
        }

        self.kv
            .list_push_head(&self.key("failed"), &job.job_id)
            .await?;
        self.kv
            .list_trim(&self.key("failed"), 0, REMOVE_ON_FAIL - 1)
            .await?;
        warn!(
            session_id = %self.session_id,
            job_id = %job.job_id,
            attempts_made,
            "job exhausted retries, stopping session"
        );
        self.emit(QueueEvent::Failed {
            job_id: job.job_id.clone(),
            reason: reason.to_string(),
            attempts_made,
            max_attempts: job.max_attempts,
            terminal: true,
        });
        self.kv
            .publish(&control_channel(&self.session_id), STOP_COMMAND)
            .await?;
        Ok(true)
    }
}
