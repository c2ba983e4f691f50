// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Stepfleet Core - Distributed Session-Worker Engine
//!
//! This crate implements the per-host core of a horizontally scalable
//! backend that executes long-running, ordered sequences of client actions
//! ("steps"). Each client maps to one isolated session; steps execute
//! exactly in submission order, surviving worker crashes and host churn.
//! Every host is interchangeable.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │                        Socket Gateway (external)                    │
//! │    generates sessionId, forwards steps, relays completions          │
//! └─────────────────────────────────────────────────────────────────────┘
//!          │ announce / enqueue                      ▲ notify
//!          ▼                                         │
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │                       Shared KV store (Redis)                       │
//! │   session records · step history · leases · queues · pub/sub       │
//! └─────────────────────────────────────────────────────────────────────┘
//!          ▲                    ▲                     ▲
//!          │                    │                     │
//! ┌────────┴────────┐  ┌────────┴────────┐   ┌────────┴────────┐
//! │   Host A        │  │   Host B        │   │  Idle Reaper    │
//! │  WorkerManager  │  │  WorkerManager  │   │  (scheduled)    │
//! │  1 task/session │  │  1 task/session │   │  stepfleet-reaper│
//! └─────────────────┘  └─────────────────┘   └─────────────────┘
//! ```
//!
//! # Session flow
//!
//! 1. The gateway registers the session and publishes its id on
//!    `new-sessions-channel`.
//! 2. Every host hears the announcement; the first one whose lease
//!    `set_if_absent` wins claims the session and spawns a worker.
//! 3. The worker drains the session's queue one job at a time, executing
//!    steps through the [`executor::StepExecutor`] port and appending
//!    completed steps to the persisted history.
//! 4. If the owner crashes, the lease expires; the next claimant replays
//!    the history to rebuild executor state, requeues any stalled job, and
//!    resumes draining.
//! 5. `STOP` on `session-control:<sessionId>` dismantles the worker: the
//!    in-flight step finishes, the queue is obliterated, session records
//!    are deleted, the lease is released.
//!
//! # Modules
//!
//! - [`config`]: Host configuration from environment variables
//! - [`error`]: Error types for core and KV operations
//! - [`executor`]: Step execution and completion notification ports
//! - [`kv`]: KV store trait with Redis and in-memory backends
//! - [`lease`]: Owner-tagged, TTL-bounded session leases
//! - [`manager`]: Worker manager: claim, recover, supervise, stop
//! - [`queue`]: Per-session ordered job queues with retry/backoff
//! - [`registry`]: Persisted session state and step history
//! - [`runtime`]: Embeddable host runtime
//! - [`session`]: Shared vocabulary: statuses, steps, channels

#![deny(missing_docs)]

/// Host configuration from environment variables.
pub mod config;

/// Error types for core and KV operations.
pub mod error;

/// Step execution and completion notification ports.
pub mod executor;

/// KV store trait with Redis and in-memory backends.
pub mod kv;

/// Owner-tagged, TTL-bounded session leases.
pub mod lease;

/// Worker manager: claim, recover, supervise, stop.
pub mod manager;

/// Per-session ordered job queues with retry/backoff.
pub mod queue;

/// Persisted session state and step history.
pub mod registry;

/// Embeddable host runtime.
pub mod runtime;

/// Shared vocabulary: statuses, steps, channels.
pub mod session;
