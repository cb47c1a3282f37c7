// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Global to local queue propagation.
//!
//! A [`LocalQueueSync`] keeps one local queue in step with its parent:
//!
//! 1. cancellation requests seen on the parent's change feed are mirrored
//!    into the local queue, and held local work is stopped through the
//!    [`JobController`];
//! 2. free slots (minus work pulled but not yet claimed locally) are offered
//!    to the parent, and the claimed elements are mirrored into the local
//!    inbox as `Acquired` and split further;
//! 3. the status of every mirrored element is pushed back to the parent,
//!    which merges it and re-evaluates its end policy.
//!
//! Nothing here holds a lock across queues; the parent's claim is the only
//! mutual exclusion, and everything else converges through repeated passes.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, Notify};
use tracing::{debug, error, info, instrument, warn};

use crate::element::{Element, ElementStatus, Progress};
use crate::error::Result;
use crate::persistence::{Change, ElementFilter, QueueDb};
use crate::queue::{MergeSummary, StatusReport, WorkOffer, WorkQueue};
use crate::retry::{RetryConfig, with_backoff};

/// Operations a local queue needs from its parent.
#[async_trait]
pub trait ParentQueue: Send + Sync {
    /// Identity of the parent queue.
    fn url(&self) -> &str;

    /// Claim work for an offer.
    async fn get_work(&self, offer: &WorkOffer) -> Result<Vec<Element>>;

    /// Merge status reports from a child queue.
    async fn report_status(
        &self,
        child_queue_url: &str,
        reports: &[StatusReport],
    ) -> Result<MergeSummary>;

    /// Read the parent's change feed.
    async fn poll_changes(&self, since: u64, limit: u32) -> Result<(Vec<Change>, u64)>;
}

#[async_trait]
impl ParentQueue for WorkQueue {
    fn url(&self) -> &str {
        WorkQueue::url(self)
    }

    async fn get_work(&self, offer: &WorkOffer) -> Result<Vec<Element>> {
        WorkQueue::get_work(self, offer).await
    }

    async fn report_status(
        &self,
        child_queue_url: &str,
        reports: &[StatusReport],
    ) -> Result<MergeSummary> {
        self.merge_child_reports(child_queue_url, reports).await
    }

    async fn poll_changes(&self, since: u64, limit: u32) -> Result<(Vec<Change>, u64)> {
        WorkQueue::poll_changes(self, since, limit).await
    }
}

/// Stops job creation and execution for an element.
#[async_trait]
pub trait JobController: Send + Sync {
    /// Stop everything created for `element`.
    async fn stop_work(&self, element: &Element) -> Result<()>;
}

/// Controller for queues with no job factory attached.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopJobController;

#[async_trait]
impl JobController for NoopJobController {
    async fn stop_work(&self, element: &Element) -> Result<()> {
        debug!(element_id = %element.id, "No job factory attached, nothing to stop");
        Ok(())
    }
}

/// Configuration for [`LocalQueueSync`].
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// How often to run a sync pass.
    pub pull_interval: Duration,
    /// Only pull work for this team.
    pub team: Option<String>,
    /// Backoff for transient failures within a pass.
    pub retry: RetryConfig,
    /// Change feed entries read per request.
    pub change_batch: u32,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            pull_interval: Duration::from_secs(120),
            team: None,
            retry: RetryConfig::default(),
            change_batch: 500,
        }
    }
}

/// Outcome of one sync pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    /// Local elements cancelled or stopped.
    pub cancelled: Vec<String>,
    /// Elements pulled into the local inbox.
    pub pulled: Vec<String>,
    /// Result of pushing status to the parent.
    pub merged: MergeSummary,
}

/// Keeps a local queue in step with its parent.
pub struct LocalQueueSync {
    local: Arc<WorkQueue>,
    parent: Arc<dyn ParentQueue>,
    jobs: Arc<dyn JobController>,
    config: SyncConfig,
    cursor: Mutex<u64>,
    excluded: Mutex<BTreeSet<String>>,
    shutdown: Arc<Notify>,
}

impl LocalQueueSync {
    /// Create a sync loop for `local` under `parent`.
    pub fn new(
        local: Arc<WorkQueue>,
        parent: Arc<dyn ParentQueue>,
        jobs: Arc<dyn JobController>,
        config: SyncConfig,
    ) -> Self {
        Self {
            local,
            parent,
            jobs,
            config,
            cursor: Mutex::new(0),
            excluded: Mutex::new(BTreeSet::new()),
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Get a handle that can be used to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Stop pulling work for a request (aborted or force-completed).
    pub async fn exclude_request(&self, request_name: &str) {
        self.excluded.lock().await.insert(request_name.to_string());
    }

    /// Run the sync loop until shutdown is signalled.
    pub async fn run(&self) {
        info!(
            queue = self.local.url(),
            parent = self.parent.url(),
            pull_interval_secs = self.config.pull_interval.as_secs(),
            "Local queue sync started"
        );

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!("Local queue sync received shutdown signal");
                    break;
                }

                _ = tokio::time::sleep(self.config.pull_interval) => {
                    if let Err(e) = self.run_once().await {
                        error!(error = %e, "Local queue sync pass failed");
                    }
                }
            }
        }

        info!("Local queue sync stopped");
    }

    /// One pass: cancellations, then pulling, then reporting.
    pub async fn run_once(&self) -> Result<SyncReport> {
        let retry = &self.config.retry;
        let cancelled =
            with_backoff(retry, "propagate_cancellation", || self.propagate_cancellation()).await?;
        let pulled = with_backoff(retry, "pull_work", || self.pull_work()).await?;
        let merged = with_backoff(retry, "update_parent", || self.update_parent()).await?;
        Ok(SyncReport {
            cancelled,
            pulled,
            merged,
        })
    }

    /// Offer free slots to the parent and mirror what it hands out.
    #[instrument(skip(self), fields(queue = self.local.url()))]
    pub async fn pull_work(&self) -> Result<Vec<String>> {
        let mut slots = self.local.locations().oracle().free_slots().await?;
        // Work pulled earlier but not claimed downstream still needs its slots.
        for pending in self
            .local
            .status(&ElementFilter::statuses([ElementStatus::Available]))
            .await?
        {
            charge_pending(&mut slots, &pending);
        }
        if slots.values().all(|free| *free == 0) {
            debug!("No free slots to offer");
            return Ok(Vec::new());
        }

        let mut exclude = self.excluded.lock().await.clone();
        for element in self
            .local
            .status_inbox(&ElementFilter::statuses([
                ElementStatus::CancelRequested,
                ElementStatus::Canceled,
            ]))
            .await?
        {
            exclude.insert(element.request_name);
        }

        let offer = WorkOffer {
            child_queue_url: self.local.url().to_string(),
            slots,
            exclude_requests: exclude,
            team: self.config.team.clone(),
        };
        let claimed = self.parent.get_work(&offer).await?;
        if claimed.is_empty() {
            debug!("Parent had no work for the offer");
            return Ok(Vec::new());
        }

        let mirrors: Vec<Element> = claimed
            .iter()
            .map(|e| e.mirror_for_child(self.parent.url()))
            .collect();
        let inserted = self.local.accept_work(mirrors).await?;
        info!(
            claimed = claimed.len(),
            inserted = inserted.len(),
            "Pulled work from parent"
        );

        self.local.process_inbound_work().await?;
        Ok(inserted)
    }

    /// Push the status of every mirrored element to the parent.
    #[instrument(skip(self), fields(queue = self.local.url()))]
    pub async fn update_parent(&self) -> Result<MergeSummary> {
        // Archived elements are still reported so a finish is never lost
        // between archiving and the next pass.
        let reports: Vec<StatusReport> = self
            .local
            .status_inbox(&ElementFilter::default().with_inactive())
            .await?
            .iter()
            .filter(|e| e.quarantine_reason.is_none())
            .filter(|e| e.parent_queue_url.as_deref() == Some(self.parent.url()))
            .map(StatusReport::from_element)
            .collect();
        if reports.is_empty() {
            return Ok(MergeSummary::default());
        }

        let summary = self
            .parent
            .report_status(self.local.url(), &reports)
            .await?;
        if summary.rejected > 0 {
            warn!(rejected = summary.rejected, "Parent rejected status reports");
        }
        debug!(
            applied = summary.applied,
            ignored = summary.ignored,
            "Reported status to parent"
        );
        Ok(summary)
    }

    /// Mirror cancellations from the parent and stop cancelled local work.
    #[instrument(skip(self), fields(queue = self.local.url()))]
    pub async fn propagate_cancellation(&self) -> Result<Vec<String>> {
        let mut touched = Vec::new();

        let mut cursor = self.cursor.lock().await;
        loop {
            let (changes, next) = self
                .parent
                .poll_changes(*cursor, self.config.change_batch)
                .await?;
            for change in &changes {
                if change.db != QueueDb::Queue
                    || change.status != Some(ElementStatus::CancelRequested)
                {
                    continue;
                }
                let Some(mirror) = self.local.get_inbox_element(&change.element_id).await? else {
                    continue;
                };
                info!(
                    element_id = %mirror.id,
                    request_name = %mirror.request_name,
                    "Parent requested cancellation"
                );
                self.excluded.lock().await.insert(mirror.request_name.clone());
                touched.extend(self.local.cancel_inbox_element(&mirror.id).await?);
            }
            *cursor = next;
            if changes.len() < self.config.change_batch as usize {
                break;
            }
        }
        drop(cursor);

        for element in self
            .local
            .status(&ElementFilter::statuses([ElementStatus::CancelRequested]))
            .await?
        {
            self.jobs.stop_work(&element).await?;
            self.local
                .update_element(&element.id, &Progress::status(ElementStatus::Canceled))
                .await?;
            info!(element_id = %element.id, "Stopped cancelled work");
            if !touched.contains(&element.id) {
                touched.push(element.id);
            }
        }
        Ok(touched)
    }
}

/// Charge an unclaimed element against the candidate site with the most free
/// slots.
fn charge_pending(slots: &mut BTreeMap<String, u64>, element: &Element) {
    let site = element
        .sites
        .iter()
        .filter_map(|site| slots.get(site).map(|free| (site.clone(), *free)))
        .max_by(|a, b| a.1.cmp(&b.1).then_with(|| b.0.cmp(&a.0)))
        .map(|(site, _)| site);
    if let Some(free) = site.and_then(|site| slots.get_mut(&site)) {
        *free = free.saturating_sub(element.num_jobs.max(1));
    }
}
