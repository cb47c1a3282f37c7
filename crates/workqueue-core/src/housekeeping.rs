// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Background worker for periodic queue maintenance.
//!
//! Each pass:
//! 1. reverts elements stuck in Negotiating (and optionally Acquired) to
//!    Available, and finishes abandoned CancelRequested elements as Canceled
//! 2. re-splits inbox elements with deferred inputs
//! 3. quarantines orphaned and duplicate elements
//! 4. rolls up every unfinished parent through its end policy
//! 5. archives requests whose elements are all terminal
//! 6. deletes archived elements past the retention window
//!
//! Steps that fail with a retryable error are retried with backoff before
//! the pass gives up.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Notify;
use tracing::{debug, error, info};

use crate::error::Result;
use crate::queue::WorkQueue;
use crate::retry::{RetryConfig, with_backoff};

/// Configuration for the housekeeping worker.
#[derive(Debug, Clone)]
pub struct HousekeepingConfig {
    /// How often to run a pass.
    pub poll_interval: Duration,
    /// How long archived elements are kept.
    pub retention: Duration,
    /// Backoff for each step of a pass.
    pub retry: RetryConfig,
}

impl Default for HousekeepingConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(300),
            retention: Duration::from_secs(30 * 24 * 3600),
            retry: RetryConfig::default(),
        }
    }
}

/// What one pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HousekeepingReport {
    /// Elements taken back from a lost holder.
    pub reclaimed: Vec<String>,
    /// Inbox elements split this pass.
    pub resplit: Vec<String>,
    /// Elements set aside as inconsistent.
    pub quarantined: Vec<String>,
    /// Parents whose rollup changed.
    pub rolled_up: usize,
    /// Requests archived.
    pub archived: Vec<String>,
    /// Elements deleted.
    pub purged: u64,
}

/// Background worker running queue maintenance.
pub struct HousekeepingWorker {
    queue: Arc<WorkQueue>,
    config: HousekeepingConfig,
    shutdown: Arc<Notify>,
}

impl HousekeepingWorker {
    /// Create a new housekeeping worker.
    pub fn new(queue: Arc<WorkQueue>, config: HousekeepingConfig) -> Self {
        Self {
            queue,
            config,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Get a handle that can be used to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Run the housekeeping loop until shutdown is signalled.
    pub async fn run(&self) {
        info!(
            queue = self.queue.url(),
            poll_interval_secs = self.config.poll_interval.as_secs(),
            retention_days = self.config.retention.as_secs() / 86400,
            "Housekeeping worker started"
        );

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!("Housekeeping worker received shutdown signal");
                    break;
                }

                _ = tokio::time::sleep(self.config.poll_interval) => {
                    if let Err(e) = self.run_once().await {
                        error!(error = %e, "Housekeeping pass failed");
                    }
                }
            }
        }

        info!("Housekeeping worker stopped");
    }

    /// Run a single pass.
    pub async fn run_once(&self) -> Result<HousekeepingReport> {
        let now = Utc::now();
        let retry = &self.config.retry;
        let queue = &self.queue;

        let reclaimed = with_backoff(retry, "reclaim_stale", || queue.reclaim_stale(now)).await?;
        let resplit = with_backoff(retry, "process_inbound_work", || queue.process_inbound_work())
            .await?
            .split;
        let quarantined =
            with_backoff(retry, "quarantine_inconsistent", || queue.quarantine_inconsistent()).await?;
        let rolled_up = with_backoff(retry, "roll_up_all", || queue.roll_up_all()).await?;
        let archived = with_backoff(retry, "archive_finished", || queue.archive_finished(now)).await?;
        let purged = with_backoff(retry, "purge_archived", || {
            queue.purge_archived(now, self.config.retention)
        })
        .await?;

        let report = HousekeepingReport {
            reclaimed,
            resplit,
            quarantined,
            rolled_up,
            archived,
            purged,
        };
        if report == HousekeepingReport::default() {
            debug!("Housekeeping found nothing to do");
        } else {
            info!(
                reclaimed = report.reclaimed.len(),
                resplit = report.resplit.len(),
                quarantined = report.quarantined.len(),
                rolled_up = report.rolled_up,
                archived = report.archived.len(),
                purged = report.purged,
                "Housekeeping pass complete"
            );
        }
        Ok(report)
    }
}
