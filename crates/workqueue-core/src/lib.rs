// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! WorkQueue Core - Hierarchical Work Distribution
//!
//! This crate splits workflow specifications into work elements and hands
//! them down a tree of queues: a global queue splits requests coarsely, local
//! queues pull what their sites have room for, split it further and feed the
//! job factory. Progress flows back up and is rolled into each parent.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                            Global WorkQueue                              │
//! │      inbox: requests  ──StartPolicy──▶  queue: Available elements        │
//! └─────────────────────────────────────────────────────────────────────────┘
//!          ▲  status reports                      │ get_work(free slots)
//!          │                                      ▼
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                       Local WorkQueue (per agent)                        │
//! │   inbox: Acquired mirrors ──StartPolicy──▶ queue: job-creation units     │
//! └─────────────────────────────────────────────────────────────────────────┘
//!                                                 │
//!                                                 ▼
//!                                      Job factory (external)
//! ```
//!
//! # Element Lifecycle
//!
//! ```text
//! Available ──▶ Negotiating ──▶ Acquired ──▶ Running ──▶ Done | Failed
//!     ▲              │              │
//!     └── timeout ───┘── release ───┘
//!
//! any non-terminal ──▶ CancelRequested ──▶ Canceled
//! ```
//!
//! The claim (`Available → Negotiating → Acquired`) is a revision-checked
//! update per step, so two queues racing for an element never both win.
//!
//! # Operations
//!
//! | Operation | Where | Description |
//! |-----------|-------|-------------|
//! | `queue_work` | [`queue::WorkQueue`] | Split a spec into Available elements (idempotent) |
//! | `get_work` | [`queue::WorkQueue`] | Claim elements for a resource offer, priority then FIFO |
//! | `status` / `status_inbox` | [`queue::WorkQueue`] | Filtered reads of the two collections |
//! | `update_element` | [`queue::WorkQueue`] | Merge progress and roll up the parent |
//! | `cancel_work` / `release_work` | [`queue::WorkQueue`] | Cancellation and explicit release |
//! | `pull_work` / `update_parent` | [`hierarchy::LocalQueueSync`] | Local queue synchronisation |
//! | housekeeping | [`housekeeping::HousekeepingWorker`] | Reclaim, re-split, roll up, archive, purge |
//!
//! # Backends
//!
//! Elements are stored through [`persistence::QueueBackend`]:
//! [`persistence::MemoryBackend`] for tests and embedding,
//! [`persistence::SqliteBackend`] for durable deployments.
//!
//! # Configuration
//!
//! The `workqueue` binary reads its configuration from `WORKQUEUE_*`
//! environment variables, see [`config::Config::from_env`].

#![deny(missing_docs)]

/// Environment-based daemon configuration.
pub mod config;

/// Work elements and their state machine.
pub mod element;

/// Error types.
pub mod error;

/// Global to local queue propagation.
pub mod hierarchy;

/// Periodic queue maintenance.
pub mod housekeeping;

/// Embedded database migrations.
pub mod migrations;

/// Data location and free slot lookups.
pub mod oracle;

/// Element storage backends.
pub mod persistence;

/// Start and end policies.
pub mod policy;

/// The single-queue engine.
pub mod queue;

/// Backoff for transient failures.
pub mod retry;

/// Workflow specifications.
pub mod spec;

pub use element::{Element, ElementStatus, Progress};
pub use error::{QueueError, Result};
pub use queue::{QueueParams, WorkOffer, WorkQueue};
