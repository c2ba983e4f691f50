// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Idle-session reaper.
//!
//! A standalone periodic sweep, not colocated with the worker hosts.
//! Sessions whose `last_active_time` is older than the idle timeout get a
//! `STOP` published on their control channel and are marked terminated.
//! The reaper mutates only session state; the worker manager that consumes
//! the `STOP` performs queue and lease cleanup.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use stepfleet_core::error::Result;
use stepfleet_core::kv::KvStore;
use stepfleet_core::registry::{session_from_state_key, SessionRegistry, STATE_KEY_PATTERN};
use stepfleet_core::session::{
    control_channel, now_millis, SessionState, SessionStatus, STOP_COMMAND,
};

/// Termination reason recorded for reaped sessions.
pub const IDLE_TIMEOUT_REASON: &str = "idle_timeout";

/// Reaper configuration.
#[derive(Debug, Clone)]
pub struct IdleReaperConfig {
    /// How often to sweep.
    pub poll_interval: Duration,
    /// Inactivity threshold before a session is terminated.
    pub idle_timeout: Duration,
}

impl Default for IdleReaperConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(300),
            idle_timeout: Duration::from_secs(1800),
        }
    }
}

/// What a sweep did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepOutcome {
    /// Session state records examined.
    pub scanned: usize,
    /// Sessions terminated for idleness.
    pub reaped: usize,
}

/// Periodic sweep that terminates idle sessions.
pub struct IdleReaper {
    kv: Arc<dyn KvStore>,
    registry: SessionRegistry,
    config: IdleReaperConfig,
    shutdown: Arc<Notify>,
}

impl IdleReaper {
    /// Create a reaper over the given store.
    pub fn new(kv: Arc<dyn KvStore>, config: IdleReaperConfig) -> Self {
        let registry = SessionRegistry::new(kv.clone());
        Self {
            kv,
            registry,
            config,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Get a handle that can be used to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Run the sweep loop until shutdown is signalled.
    pub async fn run(&self) {
        info!(
            poll_interval_secs = self.config.poll_interval.as_secs(),
            idle_timeout_secs = self.config.idle_timeout.as_secs(),
            "Idle reaper started"
        );

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!("Idle reaper received shutdown signal");
                    break;
                }

                _ = tokio::time::sleep(self.config.poll_interval) => {
                    match self.sweep().await {
                        Ok(outcome) if outcome.reaped > 0 => {
                            info!(
                                scanned = outcome.scanned,
                                reaped = outcome.reaped,
                                "sweep terminated idle sessions"
                            );
                        }
                        Ok(outcome) => {
                            debug!(scanned = outcome.scanned, "sweep found nothing idle");
                        }
                        Err(e) => {
                            error!(error = %e, "sweep failed");
                        }
                    }
                }
            }
        }

        info!("Idle reaper stopped");
    }

    /// One sweep over every session state record.
    ///
    /// The underlying scan is cursor-based with a bounded batch size, so a
    /// large fleet does not monopolize the store.
    pub async fn sweep(&self) -> Result<SweepOutcome> {
        let cutoff = now_millis() - self.config.idle_timeout.as_millis() as i64;
        let keys = self.kv.scan_keys(STATE_KEY_PATTERN).await?;

        let mut outcome = SweepOutcome {
            scanned: keys.len(),
            reaped: 0,
        };

        for key in keys {
            let Some(session_id) = session_from_state_key(&key) else {
                continue;
            };
            let fields = self.kv.hash_read_all(&key).await?;
            if fields.is_empty() {
                // expired mid-scan
                continue;
            }
            let state = match SessionState::from_hash(&fields) {
                Ok(state) => state,
                Err(e) => {
                    warn!(session_id, error = %e, "unreadable session state skipped");
                    continue;
                }
            };
            if state.status == SessionStatus::Terminated {
                continue;
            }
            if state.last_active_time > cutoff {
                continue;
            }

            info!(
                session_id,
                last_active_time = state.last_active_time,
                status = %state.status,
                "terminating idle session"
            );
            self.kv
                .publish(&control_channel(session_id), STOP_COMMAND)
                .await?;
            self.registry
                .terminate(session_id, IDLE_TIMEOUT_REASON)
                .await?;
            outcome.reaped += 1;
        }

        Ok(outcome)
    }
}
