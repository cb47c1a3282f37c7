// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The single-queue engine.
//!
//! A [`WorkQueue`] owns two element collections. The inbox holds what the
//! queue received (whole requests in a global queue, elements pulled from the
//! parent in a local one); the queue collection holds the elements split from
//! them, which downstream consumers claim with [`WorkQueue::get_work`].
//!
//! Every mutation of an existing element is a read-modify-write guarded by
//! the element revision, so concurrent callers never overwrite each other and
//! a claim succeeds for at most one of them.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, instrument, warn};

use crate::element::{Element, ElementStatus, FailureDetail, InputRef, Progress};
use crate::error::{QueueError, Result};
use crate::oracle::LocationCache;
use crate::persistence::{Change, ElementFilter, QueueBackend, QueueDb};
use crate::policy::{EndPolicyArgs, EndPolicyKind, RollupResult, SplitOutcome, StartPolicy, StartPolicyArgs};
use crate::spec::{SpecStore, WorkflowSpec};

/// Engine parameters.
#[derive(Debug, Clone)]
pub struct QueueParams {
    /// Identity of this queue.
    pub queue_url: String,
    /// How long an element may stay Negotiating before it is reclaimed.
    pub negotiation_timeout: Duration,
    /// Reclaim Acquired elements not updated for this long (off when `None`).
    pub acquired_timeout: Option<Duration>,
    /// Bound on any single store operation.
    pub backend_timeout: Duration,
    /// End policy threshold stamped on new requests.
    pub success_threshold: f64,
    /// Arguments for splitting inbox elements.
    pub split_args: StartPolicyArgs,
    /// Attempts for a read-modify-write before giving up with a conflict.
    pub max_update_attempts: u32,
}

impl Default for QueueParams {
    fn default() -> Self {
        Self {
            queue_url: "local".to_string(),
            negotiation_timeout: Duration::from_secs(3600),
            acquired_timeout: None,
            backend_timeout: Duration::from_secs(30),
            success_threshold: 0.9,
            split_args: StartPolicyArgs::default(),
            max_update_attempts: 5,
        }
    }
}

/// Free resources offered by a downstream consumer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkOffer {
    /// Identity of the claimant, recorded as ChildQueueUrl.
    pub child_queue_url: String,
    /// Free job slots per site.
    pub slots: BTreeMap<String, u64>,
    /// Requests the claimant does not want (aborted, force-completed).
    pub exclude_requests: BTreeSet<String>,
    /// Only elements for this team (or without a team).
    pub team: Option<String>,
}

impl WorkOffer {
    /// Offer `slots` on behalf of `child_queue_url`.
    pub fn new<S: Into<String>>(
        child_queue_url: &str,
        slots: impl IntoIterator<Item = (S, u64)>,
    ) -> Self {
        Self {
            child_queue_url: child_queue_url.to_string(),
            slots: slots.into_iter().map(|(site, n)| (site.into(), n)).collect(),
            ..Default::default()
        }
    }

    /// Exclude requests from the offer.
    pub fn excluding<S: Into<String>>(mut self, requests: impl IntoIterator<Item = S>) -> Self {
        self.exclude_requests.extend(requests.into_iter().map(Into::into));
        self
    }

    /// Restrict to a team.
    pub fn for_team(mut self, team: &str) -> Self {
        self.team = Some(team.to_string());
        self
    }
}

/// Progress of one element as reported by the queue holding it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusReport {
    /// Element the report is about.
    pub element_id: String,
    /// Reported progress.
    pub progress: Progress,
}

impl StatusReport {
    /// Snapshot of an element's status and counters.
    pub fn from_element(element: &Element) -> Self {
        Self {
            element_id: element.id.clone(),
            progress: Progress {
                status: Some(element.status),
                percent_complete: Some(element.percent_complete),
                percent_success: Some(element.percent_success),
                jobs_created: Some(element.jobs_created),
                events_written: Some(element.events_written),
                files_processed: Some(element.files_processed),
            },
        }
    }
}

/// Outcome of merging child reports.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeSummary {
    /// Reports merged.
    pub applied: usize,
    /// Reports about elements the reporter no longer holds.
    pub ignored: usize,
    /// Reports that broke the state machine or named unknown elements.
    pub rejected: usize,
}

/// Outcome of queueing (or re-splitting) work.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueueWorkOutcome {
    /// Inbox element the work was split from.
    pub request_element_id: String,
    /// Every element the split produced, new or already present.
    pub element_ids: Vec<String>,
    /// Elements inserted by this call.
    pub inserted: Vec<String>,
    /// Inputs waiting for a usable location.
    pub deferred: BTreeSet<String>,
    /// Set when location data was unavailable and nothing was split.
    pub not_ready: Option<String>,
}

impl QueueWorkOutcome {
    /// Whether the split ran.
    pub fn is_ready(&self) -> bool {
        self.not_ready.is_none()
    }
}

/// Outcome of [`WorkQueue::process_inbound_work`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InboundSummary {
    /// Inbox elements split in this pass.
    pub split: Vec<String>,
    /// New queue elements.
    pub inserted: usize,
    /// Inbox elements left for a later pass.
    pub not_ready: usize,
    /// Inbox elements that could not be split and were failed.
    pub failed: usize,
}

/// Aggregate view of one request in this queue.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RequestSummary {
    /// Request name.
    pub request_name: String,
    /// Rolled-up status; `None` if the inbox holds nothing for the request.
    pub status: Option<ElementStatus>,
    /// Inbox elements of the request.
    pub inbox_elements: usize,
    /// Queue elements by status.
    pub by_status: BTreeMap<ElementStatus, usize>,
    /// Estimated jobs over all queue elements.
    pub total_jobs: u64,
    /// Jobs created downstream.
    pub jobs_created: u64,
    /// Job-weighted completion (0-100).
    pub percent_complete: f64,
    /// Job-weighted success (0-100).
    pub percent_success: f64,
    /// Inputs not split yet.
    pub deferred_inputs: BTreeSet<String>,
    /// Failed descendants recorded on the inbox elements.
    pub failures: Vec<FailureDetail>,
}

/// Single-queue engine.
pub struct WorkQueue {
    backend: Arc<dyn QueueBackend>,
    specs: Arc<dyn SpecStore>,
    locations: Arc<LocationCache>,
    params: QueueParams,
}

impl WorkQueue {
    /// Create an engine over `backend`.
    pub fn new(
        backend: Arc<dyn QueueBackend>,
        specs: Arc<dyn SpecStore>,
        locations: Arc<LocationCache>,
        params: QueueParams,
    ) -> Result<Self> {
        if params.queue_url.trim().is_empty() {
            return Err(QueueError::Configuration("queue_url must not be empty".to_string()));
        }
        if params.max_update_attempts == 0 {
            return Err(QueueError::Configuration(
                "max_update_attempts must be positive".to_string(),
            ));
        }
        EndPolicyArgs {
            policy: EndPolicyKind::SingleShot,
            success_threshold: params.success_threshold,
        }
        .validate()?;

        Ok(Self {
            backend,
            specs,
            locations,
            params,
        })
    }

    /// Identity of this queue.
    pub fn url(&self) -> &str {
        &self.params.queue_url
    }

    /// Engine parameters.
    pub fn params(&self) -> &QueueParams {
        &self.params
    }

    /// Location cache used for splitting.
    pub fn locations(&self) -> &Arc<LocationCache> {
        &self.locations
    }

    fn end_policy(&self) -> EndPolicyArgs {
        EndPolicyArgs {
            policy: EndPolicyKind::SingleShot,
            success_threshold: self.params.success_threshold,
        }
    }

    async fn bounded<T>(&self, operation: &str, fut: impl Future<Output = Result<T>>) -> Result<T> {
        match tokio::time::timeout(self.params.backend_timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(QueueError::store(
                operation,
                format!("timed out after {:?}", self.params.backend_timeout),
            )),
        }
    }

    async fn get(&self, db: QueueDb, id: &str) -> Result<Option<Element>> {
        self.bounded("get_element", self.backend.get_element(db, id)).await
    }

    async fn list(&self, db: QueueDb, filter: &ElementFilter) -> Result<Vec<Element>> {
        self.bounded("list_elements", self.backend.list_elements(db, filter))
            .await
    }

    async fn insert(&self, db: QueueDb, elements: Vec<Element>) -> Result<Vec<String>> {
        self.bounded("insert_elements", self.backend.insert_elements(db, elements))
            .await
    }

    async fn compare_and_swap(&self, db: QueueDb, element: &Element) -> Result<bool> {
        self.bounded("update_element", self.backend.update_element(db, element))
            .await
    }

    /// Read-modify-write of one element.
    ///
    /// `f` returns whether it changed anything; unchanged elements are not
    /// written. Lost races are retried with a fresh copy.
    async fn modify<F>(&self, db: QueueDb, id: &str, mut f: F) -> Result<Element>
    where
        F: FnMut(&mut Element) -> Result<bool> + Send,
    {
        for attempt in 1..=self.params.max_update_attempts {
            let Some(mut element) = self.get(db, id).await? else {
                return Err(QueueError::ElementNotFound {
                    element_id: id.to_string(),
                });
            };
            if !f(&mut element)? {
                return Ok(element);
            }
            if self.compare_and_swap(db, &element).await? {
                element.revision += 1;
                return Ok(element);
            }
            debug!(element_id = id, %db, attempt, "Concurrent update, retrying");
        }
        Err(QueueError::ClaimConflict {
            element_id: id.to_string(),
        })
    }

    /// Split `spec` with the named start policy and persist the elements as
    /// Available.
    ///
    /// Re-queueing the same spec inserts only elements that do not exist yet.
    /// Requests already finished or being cancelled are left alone.
    #[instrument(skip(self, spec, args), fields(request_name = %spec.request_name))]
    pub async fn queue_work(
        &self,
        spec: &WorkflowSpec,
        policy_name: &str,
        args: StartPolicyArgs,
    ) -> Result<QueueWorkOutcome> {
        let policy = StartPolicy::from_name(policy_name, args)?;
        spec.validate()?;

        let mut request = Element::new(&spec.request_name, "", "", "", InputRef::Request);
        request.status = ElementStatus::Negotiating;
        request.priority = spec.priority;
        request.team = spec.team.clone();
        request.spec_url = spec.spec_url.clone();
        request.start_policy = policy.kind;
        request.end_policy = self.end_policy();
        request.num_jobs = spec.tasks.iter().map(|t| spec.estimated_jobs(t)).sum();
        let request_id = request.id.clone();
        self.insert(QueueDb::Inbox, vec![request]).await?;

        let stored = self
            .get(QueueDb::Inbox, &request_id)
            .await?
            .ok_or_else(|| QueueError::ElementNotFound {
                element_id: request_id.clone(),
            })?;
        if !stored.is_active() || !is_splittable(stored.status) {
            info!(status = %stored.status, "Request already settled, not re-queued");
            return Ok(QueueWorkOutcome {
                request_element_id: request_id,
                ..Default::default()
            });
        }

        let outcome = self.split_inbox_element(&stored, spec, policy).await?;
        info!(
            policy = %policy.kind,
            elements = outcome.element_ids.len(),
            inserted = outcome.inserted.len(),
            deferred = outcome.deferred.len(),
            ready = outcome.is_ready(),
            "Queued work"
        );
        Ok(outcome)
    }

    async fn split_inbox_element(
        &self,
        inbox: &Element,
        spec: &WorkflowSpec,
        policy: StartPolicy,
    ) -> Result<QueueWorkOutcome> {
        let parent = match inbox.input {
            InputRef::Request => None,
            _ => Some(inbox),
        };
        let mut outcome = QueueWorkOutcome {
            request_element_id: inbox.id.clone(),
            ..Default::default()
        };

        let (mut elements, deferred) = match policy.split(spec, &self.locations, parent).await? {
            SplitOutcome::NotReady { reason } => {
                info!(element_id = %inbox.id, reason = %reason, "Work not yet splittable");
                outcome.not_ready = Some(reason);
                return Ok(outcome);
            }
            SplitOutcome::Ready { elements, deferred } => (elements, deferred),
        };
        for element in &mut elements {
            element.parent_queue_id = Some(inbox.id.clone());
            element.end_policy = inbox.end_policy.clone();
        }
        outcome.element_ids = elements.iter().map(|e| e.id.clone()).collect();
        outcome.inserted = self.insert(QueueDb::Queue, elements).await?;
        outcome.deferred = deferred.clone();

        let nothing_to_do = outcome.element_ids.is_empty() && deferred.is_empty();
        if nothing_to_do {
            warn!(element_id = %inbox.id, "Split produced no work");
        }
        self.modify(QueueDb::Inbox, &inbox.id, |e| {
            let mut changed = e.deferred_inputs != deferred;
            e.deferred_inputs = deferred.clone();
            if nothing_to_do {
                e.percent_complete = 100.0;
                e.percent_success = 100.0;
                changed |= e.advance_to(ElementStatus::Done)?;
            } else if deferred.is_empty() {
                changed |= e.advance_to(ElementStatus::Acquired)?;
            }
            Ok(changed)
        })
        .await?;

        Ok(outcome)
    }

    /// Split inbox elements that have no children yet, or still have deferred
    /// inputs, using the start policy recorded on each.
    ///
    /// Elements that cannot be split at all are failed so the failure reaches
    /// the parent queue.
    #[instrument(skip(self))]
    pub async fn process_inbound_work(&self) -> Result<InboundSummary> {
        let inbox = self
            .list(
                QueueDb::Inbox,
                &ElementFilter::statuses([
                    ElementStatus::Negotiating,
                    ElementStatus::Acquired,
                    ElementStatus::Running,
                ]),
            )
            .await?;
        let mut summary = InboundSummary::default();

        for element in inbox {
            let children = self
                .list(
                    QueueDb::Queue,
                    &ElementFilter::children_of(&element.id).with_inactive(),
                )
                .await?;
            if !children.is_empty() && element.deferred_inputs.is_empty() {
                continue;
            }

            let split = match self.specs.get_spec(&element.spec_url).await {
                Ok(spec) => {
                    let policy = StartPolicy::new(element.start_policy, self.params.split_args);
                    self.split_inbox_element(&element, &spec, policy).await
                }
                Err(err) => Err(err),
            };

            match split {
                Ok(outcome) if !outcome.is_ready() => summary.not_ready += 1,
                Ok(outcome) => {
                    summary.inserted += outcome.inserted.len();
                    summary.split.push(element.id.clone());
                }
                Err(err) if err.is_retryable() => return Err(err),
                Err(err) => {
                    error!(
                        element_id = %element.id,
                        request_name = %element.request_name,
                        error = %err,
                        "Inbound element cannot be split, failing it"
                    );
                    let reason = err.to_string();
                    self.modify(QueueDb::Inbox, &element.id, |e| {
                        e.failures = vec![FailureDetail {
                            element_id: e.id.clone(),
                            status: ElementStatus::Failed,
                            percent_success: 0.0,
                        }];
                        let changed = e.advance_to(ElementStatus::Failed)?;
                        if changed {
                            debug!(element_id = %e.id, reason = %reason, "Inbound element failed");
                        }
                        Ok(changed)
                    })
                    .await?;
                    summary.failed += 1;
                }
            }
        }

        if !summary.split.is_empty() {
            info!(
                split = summary.split.len(),
                inserted = summary.inserted,
                "Processed inbound work"
            );
        }
        Ok(summary)
    }

    /// Insert elements pulled from a parent queue into the inbox.
    pub async fn accept_work(&self, elements: Vec<Element>) -> Result<Vec<String>> {
        if let Some(bad) = elements.iter().find(|e| e.parent_queue_url.is_none()) {
            return Err(QueueError::DataIntegrity(format!(
                "element '{}' has no parent queue",
                bad.id
            )));
        }
        self.insert(QueueDb::Inbox, elements).await
    }

    /// Claim Available elements for the offer.
    ///
    /// Candidates are taken by priority (descending), then insertion order.
    /// Each claimed element is charged `max(num_jobs, 1)` slots at the
    /// intersecting site with the most free slots, or across its sites when
    /// no single one has room. Elements whose sites together cannot fit them
    /// are skipped. Returns an empty list when nothing fits.
    #[instrument(skip(self, offer), fields(child_queue = %offer.child_queue_url))]
    pub async fn get_work(&self, offer: &WorkOffer) -> Result<Vec<Element>> {
        if offer.child_queue_url.trim().is_empty() {
            return Err(QueueError::Configuration(
                "work offer needs a child queue url".to_string(),
            ));
        }
        let mut slots: BTreeMap<String, u64> = offer
            .slots
            .iter()
            .filter(|(_, free)| **free > 0)
            .map(|(site, free)| (site.clone(), *free))
            .collect();
        if slots.is_empty() {
            return Ok(Vec::new());
        }

        let mut candidates: Vec<Element> = self
            .list(QueueDb::Queue, &ElementFilter::statuses([ElementStatus::Available]))
            .await?
            .into_iter()
            .filter(|e| !offer.exclude_requests.contains(&e.request_name))
            .filter(|e| team_matches(e, offer.team.as_deref()))
            .filter(|e| e.runs_at_any(slots.keys()))
            .collect();
        candidates.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then_with(|| a.sequence.cmp(&b.sequence))
        });

        let mut claimed = Vec::new();
        for candidate in candidates {
            let cost = candidate.num_jobs.max(1);
            let Some(charges) = place(&candidate, &slots, cost) else {
                let offered: u64 = candidate
                    .sites
                    .iter()
                    .filter_map(|site| offer.slots.get(site))
                    .sum();
                if offered < cost {
                    warn!(
                        element_id = %candidate.id,
                        cost,
                        offered,
                        "Element needs more slots than offered at its sites"
                    );
                } else {
                    debug!(element_id = %candidate.id, cost, "No room left for element, skipped");
                }
                continue;
            };
            let id = candidate.id.clone();
            match self.claim(candidate, &offer.child_queue_url).await? {
                Some(element) => {
                    for (site, charge) in charges {
                        if let Some(free) = slots.get_mut(&site) {
                            *free = free.saturating_sub(charge);
                        }
                    }
                    claimed.push(element);
                }
                None => debug!(element_id = %id, "Element claimed concurrently, skipped"),
            }
            if slots.values().all(|free| *free == 0) {
                break;
            }
        }

        if !claimed.is_empty() {
            info!(claimed = claimed.len(), "Handed out work");
        }
        Ok(claimed)
    }

    /// Available -> Negotiating -> Acquired, each step conditional on the
    /// revision read. `None` if another caller got there first.
    async fn claim(&self, mut element: Element, child_queue_url: &str) -> Result<Option<Element>> {
        element.transition(ElementStatus::Negotiating)?;
        element.child_queue_url = Some(child_queue_url.to_string());
        if !self.compare_and_swap(QueueDb::Queue, &element).await? {
            return Ok(None);
        }
        element.revision += 1;

        element.transition(ElementStatus::Acquired)?;
        if !self.compare_and_swap(QueueDb::Queue, &element).await? {
            warn!(element_id = %element.id, "Claim confirmation lost, left for reclaim");
            return Ok(None);
        }
        element.revision += 1;
        debug!(element_id = %element.id, child_queue = child_queue_url, "Element acquired");
        Ok(Some(element))
    }

    /// Elements of the queue collection matching `filter`.
    pub async fn status(&self, filter: &ElementFilter) -> Result<Vec<Element>> {
        self.list(QueueDb::Queue, filter).await
    }

    /// Elements of the inbox matching `filter`.
    pub async fn status_inbox(&self, filter: &ElementFilter) -> Result<Vec<Element>> {
        self.list(QueueDb::Inbox, filter).await
    }

    /// One element of the queue collection.
    pub async fn get_element(&self, element_id: &str) -> Result<Option<Element>> {
        self.get(QueueDb::Queue, element_id).await
    }

    /// One element of the inbox.
    pub async fn get_inbox_element(&self, element_id: &str) -> Result<Option<Element>> {
        self.get(QueueDb::Inbox, element_id).await
    }

    /// Merge a progress report into a queue element and roll up its parent.
    #[instrument(skip(self, progress))]
    pub async fn update_element(&self, element_id: &str, progress: &Progress) -> Result<Element> {
        progress.validate(element_id)?;
        let element = self
            .modify(QueueDb::Queue, element_id, |e| {
                let progress = stop_cancelled(e, progress);
                e.apply_progress(&progress)?;
                Ok(true)
            })
            .await?;
        debug!(status = %element.status, "Progress merged");

        if let Some(parent_id) = &element.parent_queue_id {
            self.roll_up(parent_id).await?;
        }
        Ok(element)
    }

    /// Merge status reports from the child queue holding the elements.
    ///
    /// Reports about elements the child does not hold (released, reclaimed)
    /// are ignored; reports the state machine refuses are rejected.
    #[instrument(skip(self, reports), fields(reports = reports.len()))]
    pub async fn merge_child_reports(
        &self,
        child_queue_url: &str,
        reports: &[StatusReport],
    ) -> Result<MergeSummary> {
        let mut summary = MergeSummary::default();
        let mut parents = BTreeSet::new();

        for report in reports {
            let mut held = true;
            let result = self
                .modify(QueueDb::Queue, &report.element_id, |e| {
                    held = e.child_queue_url.as_deref() == Some(child_queue_url);
                    if !held {
                        return Ok(false);
                    }
                    if let Some(reported) = report.progress.status
                        && reported.rank() < e.status.rank()
                    {
                        return Err(QueueError::InvalidTransition {
                            element_id: e.id.clone(),
                            from: e.status,
                            to: reported,
                        });
                    }
                    let progress = stop_cancelled(e, &report.progress);
                    let before = e.clone();
                    e.apply_progress(&progress)?;
                    Ok(!same_progress(&before, e))
                })
                .await;

            match result {
                Ok(element) if held => {
                    summary.applied += 1;
                    if let Some(parent) = element.parent_queue_id {
                        parents.insert(parent);
                    }
                }
                Ok(_) => {
                    debug!(element_id = %report.element_id, "Report from a queue no longer holding the element");
                    summary.ignored += 1;
                }
                Err(err) if err.is_retryable() => return Err(err),
                Err(err) => {
                    warn!(element_id = %report.element_id, error = %err, "Rejected status report");
                    summary.rejected += 1;
                }
            }
        }

        for parent in parents {
            self.roll_up(&parent).await?;
        }
        Ok(summary)
    }

    /// Re-evaluate the end policy of an inbox element over its children.
    pub async fn roll_up(&self, inbox_id: &str) -> Result<Option<Element>> {
        let Some(parent) = self.get(QueueDb::Inbox, inbox_id).await? else {
            return Ok(None);
        };
        if !parent.is_active() || parent.status.is_terminal() {
            return Ok(Some(parent));
        }

        let children = self
            .list(QueueDb::Queue, &ElementFilter::children_of(inbox_id))
            .await?;
        let refs: Vec<&Element> = children.iter().collect();
        let updated = self
            .modify(QueueDb::Inbox, inbox_id, |p| {
                let policy = p.end_policy.clone();
                let rollup = policy.evaluate(p, &refs)?;
                apply_rollup(p, &rollup)
            })
            .await?;

        if updated.status.is_terminal() {
            info!(
                request_name = %updated.request_name,
                element_id = %updated.id,
                status = %updated.status,
                percent_success = updated.percent_success,
                "Element finished"
            );
        }
        Ok(Some(updated))
    }

    /// Request cancellation of every element of a request.
    ///
    /// Unheld (Available) elements are canceled at once; held ones move to
    /// CancelRequested and are finished by their holder.
    #[instrument(skip(self))]
    pub async fn cancel_work(&self, request_name: &str) -> Result<Vec<String>> {
        let filter = ElementFilter::request(request_name);
        let queue = self.list(QueueDb::Queue, &filter).await?;
        let inbox = self.list(QueueDb::Inbox, &filter).await?;

        let mut touched = self.cancel_in(QueueDb::Queue, &queue).await?;
        touched.extend(self.cancel_in(QueueDb::Inbox, &inbox).await?);

        for parent in &inbox {
            self.roll_up(&parent.id).await?;
        }
        info!(elements = touched.len(), "Cancellation requested");
        Ok(touched)
    }

    /// Request cancellation of one inbox element and its children.
    pub async fn cancel_inbox_element(&self, inbox_id: &str) -> Result<Vec<String>> {
        let children = self
            .list(QueueDb::Queue, &ElementFilter::children_of(inbox_id))
            .await?;
        let mut touched = self.cancel_in(QueueDb::Queue, &children).await?;
        if let Some(parent) = self.get(QueueDb::Inbox, inbox_id).await? {
            touched.extend(self.cancel_in(QueueDb::Inbox, &[parent]).await?);
        }
        self.roll_up(inbox_id).await?;
        Ok(touched)
    }

    async fn cancel_in(&self, db: QueueDb, elements: &[Element]) -> Result<Vec<String>> {
        let mut touched = Vec::new();
        for element in elements {
            if element.status.is_terminal() || element.status == ElementStatus::CancelRequested {
                continue;
            }
            let mut changed = false;
            self.modify(db, &element.id, |e| {
                changed = request_cancel(e)?;
                Ok(changed)
            })
            .await?;
            if changed {
                touched.push(element.id.clone());
            }
        }
        Ok(touched)
    }

    /// Take work back from a decommissioned child queue.
    ///
    /// Negotiating and Acquired elements it holds return to Available.
    /// CancelRequested ones have nobody left to stop them and become
    /// Canceled.
    #[instrument(skip(self))]
    pub async fn release_work(&self, child_queue_url: &str) -> Result<Vec<String>> {
        let filter = ElementFilter::statuses([
            ElementStatus::Negotiating,
            ElementStatus::Acquired,
            ElementStatus::CancelRequested,
        ])
        .held_by(child_queue_url);
        let mut released = Vec::new();
        let mut parents = BTreeSet::new();

        for element in self.list(QueueDb::Queue, &filter).await? {
            let mut changed = false;
            let updated = self
                .modify(QueueDb::Queue, &element.id, |e| {
                    let target = release_target(e.status);
                    changed =
                        e.child_queue_url.as_deref() == Some(child_queue_url) && target.is_some();
                    if changed && let Some(target) = target {
                        e.transition(target)?;
                        e.child_queue_url = None;
                    }
                    Ok(changed)
                })
                .await?;
            if changed {
                released.push(element.id.clone());
                if updated.status == ElementStatus::Canceled
                    && let Some(parent) = updated.parent_queue_id
                {
                    parents.insert(parent);
                }
            }
        }

        for parent in parents {
            self.roll_up(&parent).await?;
        }
        info!(released = released.len(), "Released work");
        Ok(released)
    }

    /// Take back elements stuck past their timeout.
    ///
    /// Negotiating (and, if configured, Acquired) elements revert to
    /// Available. CancelRequested elements left untouched for the
    /// negotiation timeout have lost their holder and become Canceled.
    pub async fn reclaim_stale(&self, now: DateTime<Utc>) -> Result<Vec<String>> {
        let mut targets = vec![
            (ElementStatus::Negotiating, self.params.negotiation_timeout),
            (ElementStatus::CancelRequested, self.params.negotiation_timeout),
        ];
        if let Some(timeout) = self.params.acquired_timeout {
            targets.push((ElementStatus::Acquired, timeout));
        }

        let mut reclaimed = Vec::new();
        let mut parents = BTreeSet::new();
        for (status, timeout) in targets {
            let cutoff = now - to_chrono(timeout)?;
            let filter = ElementFilter {
                statuses: BTreeSet::from([status]),
                updated_before: Some(cutoff),
                ..Default::default()
            };
            for element in self.list(QueueDb::Queue, &filter).await? {
                let mut reverted = false;
                let updated = self
                    .modify(QueueDb::Queue, &element.id, |e| {
                        reverted = e.status == status && e.updated_at < cutoff;
                        if reverted && let Some(target) = release_target(status) {
                            e.transition(target)?;
                            e.child_queue_url = None;
                        }
                        Ok(reverted)
                    })
                    .await?;
                if reverted {
                    if updated.status == ElementStatus::Canceled
                        && let Some(parent) = updated.parent_queue_id
                    {
                        parents.insert(parent);
                    }
                    warn!(
                        element_id = %element.id,
                        %status,
                        child_queue = element.child_queue_url.as_deref().unwrap_or(""),
                        "Reclaimed stale element"
                    );
                    reclaimed.push(element.id.clone());
                }
            }
        }

        for parent in parents {
            self.roll_up(&parent).await?;
        }
        Ok(reclaimed)
    }

    /// Quarantine queue elements whose parent is gone, and all but the first
    /// of elements sharing request, task and splitting key.
    pub async fn quarantine_inconsistent(&self) -> Result<Vec<String>> {
        let elements = self.list(QueueDb::Queue, &ElementFilter::default()).await?;
        let inbox_ids: BTreeSet<String> = self
            .list(QueueDb::Inbox, &ElementFilter::default().with_inactive())
            .await?
            .into_iter()
            .map(|e| e.id)
            .collect();

        let mut first_seen: HashMap<(String, String, String), String> = HashMap::new();
        let mut quarantined = Vec::new();

        for element in elements {
            let orphaned = element
                .parent_queue_id
                .as_ref()
                .filter(|parent| !inbox_ids.contains(*parent))
                .map(|parent| format!("orphaned: parent '{}' does not exist", parent));
            let key = (
                element.request_name.clone(),
                element.task_name.clone(),
                element.splitting_key.clone(),
            );
            let reason = match orphaned {
                Some(reason) => Some(reason),
                None => match first_seen.get(&key) {
                    Some(first) => Some(format!("duplicate of '{}'", first)),
                    None => {
                        first_seen.insert(key, element.id.clone());
                        None
                    }
                },
            };
            let Some(reason) = reason else {
                continue;
            };

            error!(
                element_id = %element.id,
                request_name = %element.request_name,
                reason = %reason,
                "Quarantining inconsistent element"
            );
            self.modify(QueueDb::Queue, &element.id, |e| {
                if e.quarantine_reason.is_some() {
                    return Ok(false);
                }
                e.quarantine_reason = Some(reason.clone());
                e.updated_at = Utc::now();
                Ok(true)
            })
            .await?;
            quarantined.push(element.id);
        }
        Ok(quarantined)
    }

    /// Roll up every unfinished inbox element. Returns how many changed.
    pub async fn roll_up_all(&self) -> Result<usize> {
        let mut changed = 0;
        for parent in self.list(QueueDb::Inbox, &ElementFilter::default()).await? {
            if parent.status.is_terminal() {
                continue;
            }
            if let Some(updated) = self.roll_up(&parent.id).await?
                && updated.revision != parent.revision
            {
                changed += 1;
            }
        }
        Ok(changed)
    }

    /// Archive every element of requests whose elements are all terminal.
    /// Returns the archived request names.
    pub async fn archive_finished(&self, now: DateTime<Utc>) -> Result<Vec<String>> {
        let inbox = self.list(QueueDb::Inbox, &ElementFilter::default()).await?;
        let queue = self.list(QueueDb::Queue, &ElementFilter::default()).await?;

        let mut finished: BTreeMap<String, bool> = BTreeMap::new();
        for element in &inbox {
            let entry = finished.entry(element.request_name.clone()).or_insert(true);
            *entry &= element.status.is_terminal();
        }
        for element in &queue {
            if let Some(entry) = finished.get_mut(&element.request_name) {
                *entry &= element.status.is_terminal();
            }
        }
        finished.retain(|_, done| *done);

        let targets = inbox
            .iter()
            .map(|e| (QueueDb::Inbox, e))
            .chain(queue.iter().map(|e| (QueueDb::Queue, e)))
            .filter(|(_, e)| finished.contains_key(&e.request_name));
        for (db, element) in targets {
            self.modify(db, &element.id, |e| {
                if e.archived_at.is_some() {
                    return Ok(false);
                }
                e.archived_at = Some(now);
                Ok(true)
            })
            .await?;
        }

        let requests: Vec<String> = finished.into_keys().collect();
        for request_name in &requests {
            info!(request_name = %request_name, "Archived finished request");
        }
        Ok(requests)
    }

    /// Delete elements archived longer than `retention` ago, and change feed
    /// entries older than that.
    pub async fn purge_archived(&self, now: DateTime<Utc>, retention: Duration) -> Result<u64> {
        let cutoff = now - to_chrono(retention)?;
        let mut purged = 0;
        for db in [QueueDb::Inbox, QueueDb::Queue] {
            let ids: Vec<String> = self
                .list(db, &ElementFilter::default().with_inactive())
                .await?
                .into_iter()
                .filter(|e| e.archived_at.is_some_and(|at| at < cutoff))
                .map(|e| e.id)
                .collect();
            if !ids.is_empty() {
                purged += self
                    .bounded("delete_elements", self.backend.delete_elements(db, &ids))
                    .await?;
            }
        }
        let pruned = self
            .bounded("prune_changes", self.backend.prune_changes(cutoff))
            .await?;
        if purged > 0 || pruned > 0 {
            info!(purged, pruned, "Purged archived elements");
        }
        Ok(purged)
    }

    /// Aggregate status and counters of one request.
    pub async fn request_summary(&self, request_name: &str) -> Result<RequestSummary> {
        let filter = ElementFilter::request(request_name).with_inactive();
        let inbox: Vec<Element> = self
            .list(QueueDb::Inbox, &filter)
            .await?
            .into_iter()
            .filter(|e| e.quarantine_reason.is_none())
            .collect();
        let queue: Vec<Element> = self
            .list(QueueDb::Queue, &filter)
            .await?
            .into_iter()
            .filter(|e| e.quarantine_reason.is_none())
            .collect();
        if inbox.is_empty() && queue.is_empty() {
            return Err(QueueError::ElementNotFound {
                element_id: request_name.to_string(),
            });
        }

        let status = match inbox.as_slice() {
            [] => None,
            [single] => Some(single.status),
            many => {
                let mut synthetic = Element::new(request_name, "", "", "", InputRef::Request);
                synthetic.status = ElementStatus::Acquired;
                synthetic.end_policy = many[0].end_policy.clone();
                let refs: Vec<&Element> = many.iter().collect();
                Some(synthetic.end_policy.evaluate(&synthetic, &refs)?.status)
            }
        };

        let mut by_status = BTreeMap::new();
        let mut weight = 0u64;
        let mut complete = 0.0;
        let mut success = 0.0;
        let mut total_jobs = 0;
        let mut jobs_created = 0;
        for element in &queue {
            *by_status.entry(element.status).or_insert(0) += 1;
            let w = element.num_jobs.max(1);
            weight += w;
            complete += element.percent_complete * w as f64;
            success += element.percent_success * w as f64;
            total_jobs += element.num_jobs;
            jobs_created += element.jobs_created;
        }
        let mean = |sum: f64| if weight == 0 { 0.0 } else { sum / weight as f64 };

        Ok(RequestSummary {
            request_name: request_name.to_string(),
            status,
            inbox_elements: inbox.len(),
            by_status,
            total_jobs,
            jobs_created,
            percent_complete: mean(complete),
            percent_success: mean(success),
            deferred_inputs: inbox
                .iter()
                .flat_map(|e| e.deferred_inputs.iter().cloned())
                .collect(),
            failures: inbox.iter().flat_map(|e| e.failures.iter().cloned()).collect(),
        })
    }

    /// Changes to this queue's store after position `since`.
    pub async fn poll_changes(&self, since: u64, limit: u32) -> Result<(Vec<Change>, u64)> {
        self.bounded("poll_changes", self.backend.poll_changes(since, limit))
            .await
    }

    /// Check the backing store is reachable.
    pub async fn health_check(&self) -> Result<()> {
        self.bounded("health_check", self.backend.health_check()).await
    }
}

fn is_splittable(status: ElementStatus) -> bool {
    matches!(
        status,
        ElementStatus::Negotiating | ElementStatus::Acquired | ElementStatus::Running
    )
}

/// Where an element taken back from its holder goes.
fn release_target(status: ElementStatus) -> Option<ElementStatus> {
    match status {
        ElementStatus::Negotiating | ElementStatus::Acquired => Some(ElementStatus::Available),
        ElementStatus::CancelRequested => Some(ElementStatus::Canceled),
        _ => None,
    }
}

fn team_matches(element: &Element, team: Option<&str>) -> bool {
    match (element.team.as_deref(), team) {
        (Some(element_team), Some(team)) => element_team == team,
        _ => true,
    }
}

/// Slots to charge per site for `cost`.
///
/// The whole cost goes to the intersecting site with the most free slots
/// (ties to the alphabetically first) when it fits there. Otherwise it is
/// spread over the intersecting sites, roomiest first. `None` when the sites
/// together cannot fit it.
fn place(element: &Element, slots: &BTreeMap<String, u64>, cost: u64) -> Option<Vec<(String, u64)>> {
    let mut sites: Vec<(&String, u64)> = element
        .sites
        .iter()
        .filter_map(|site| slots.get(site).map(|free| (site, *free)))
        .filter(|(_, free)| *free > 0)
        .collect();
    sites.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(b.0)));

    if let Some((site, free)) = sites.first()
        && *free >= cost
    {
        return Some(vec![((*site).clone(), cost)]);
    }
    if sites.iter().map(|(_, free)| free).sum::<u64>() < cost {
        return None;
    }

    let mut remaining = cost;
    let mut charges = Vec::new();
    for (site, free) in sites {
        if remaining == 0 {
            break;
        }
        let charge = free.min(remaining);
        charges.push((site.clone(), charge));
        remaining -= charge;
    }
    Some(charges)
}

/// A terminal report for a cancel-requested element means it was stopped.
fn stop_cancelled(element: &Element, progress: &Progress) -> Progress {
    let mut progress = progress.clone();
    if element.status == ElementStatus::CancelRequested
        && progress.status.is_some_and(|s| s.is_terminal())
    {
        progress.status = Some(ElementStatus::Canceled);
    }
    progress
}

fn request_cancel(element: &mut Element) -> Result<bool> {
    if element.status.is_terminal() || element.status == ElementStatus::CancelRequested {
        return Ok(false);
    }
    let unheld = element.status == ElementStatus::Available;
    element.transition(ElementStatus::CancelRequested)?;
    if unheld {
        element.transition(ElementStatus::Canceled)?;
    }
    Ok(true)
}

fn apply_rollup(parent: &mut Element, rollup: &RollupResult) -> Result<bool> {
    let mut changed = false;
    if parent.percent_complete != rollup.percent_complete
        || parent.percent_success != rollup.percent_success
        || parent.jobs_created != rollup.jobs_created
        || parent.events_written != rollup.events_written
        || parent.files_processed != rollup.files_processed
    {
        parent.percent_complete = rollup.percent_complete;
        parent.percent_success = rollup.percent_success;
        parent.jobs_created = rollup.jobs_created;
        parent.events_written = rollup.events_written;
        parent.files_processed = rollup.files_processed;
        changed = true;
    }
    if parent.advance_to(rollup.status)? {
        if parent.status == ElementStatus::Failed {
            parent.failures = rollup.failures.clone();
        }
        changed = true;
    }
    if changed {
        parent.updated_at = Utc::now();
    }
    Ok(changed)
}

fn same_progress(a: &Element, b: &Element) -> bool {
    a.status == b.status
        && a.percent_complete == b.percent_complete
        && a.percent_success == b.percent_success
        && a.jobs_created == b.jobs_created
        && a.events_written == b.events_written
        && a.files_processed == b.files_processed
}

fn to_chrono(duration: Duration) -> Result<chrono::Duration> {
    chrono::Duration::from_std(duration)
        .map_err(|e| QueueError::Configuration(format!("duration {:?} out of range: {}", duration, e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn element(sites: &[&str], jobs: u64) -> Element {
        let mut e = Element::new("req", "/req/Proc", "b", "", InputRef::Generated);
        e.sites = sites.iter().map(|s| s.to_string()).collect();
        e.num_jobs = jobs;
        e
    }

    fn charge(site: &str, slots: u64) -> (String, u64) {
        (site.to_string(), slots)
    }

    #[test]
    fn test_place_prefers_most_free_slots() {
        let slots = BTreeMap::from([
            ("T1_US_FNAL".to_string(), 5),
            ("T2_CH_CERN".to_string(), 3),
        ]);
        let e = element(&["T1_US_FNAL", "T2_CH_CERN"], 1);
        assert_eq!(place(&e, &slots, 1), Some(vec![charge("T1_US_FNAL", 1)]));
        // DESY is not offered, so CERN alone has to fit the cost.
        let e = element(&["T2_CH_CERN", "T2_DE_DESY"], 3);
        assert_eq!(place(&e, &slots, 3), Some(vec![charge("T2_CH_CERN", 3)]));
        assert_eq!(place(&e, &slots, 4), None);
    }

    #[test]
    fn test_place_tie_goes_to_first_name() {
        let slots = BTreeMap::from([("B".to_string(), 2), ("A".to_string(), 2)]);
        let e = element(&["A", "B"], 1);
        assert_eq!(place(&e, &slots, 1), Some(vec![charge("A", 1)]));
    }

    #[test]
    fn test_place_spreads_over_sites_when_none_fits_alone() {
        let slots = BTreeMap::from([
            ("T1_US_FNAL".to_string(), 5),
            ("T2_CH_CERN".to_string(), 3),
            ("T2_DE_DESY".to_string(), 1),
        ]);
        let e = element(&["T1_US_FNAL", "T2_CH_CERN", "T2_DE_DESY"], 7);
        assert_eq!(
            place(&e, &slots, 7),
            Some(vec![charge("T1_US_FNAL", 5), charge("T2_CH_CERN", 2)])
        );
        assert_eq!(place(&e, &slots, 10), None);
    }

    #[test]
    fn test_team_matching() {
        let mut e = element(&[], 1);
        assert!(team_matches(&e, None));
        assert!(team_matches(&e, Some("production")));
        e.team = Some("production".to_string());
        assert!(team_matches(&e, Some("production")));
        assert!(!team_matches(&e, Some("relval")));
        assert!(team_matches(&e, None));
    }

    #[test]
    fn test_request_cancel() {
        let mut e = element(&[], 1);
        assert!(request_cancel(&mut e).unwrap());
        assert_eq!(e.status, ElementStatus::Canceled);

        let mut e = element(&[], 1);
        e.status = ElementStatus::Running;
        assert!(request_cancel(&mut e).unwrap());
        assert_eq!(e.status, ElementStatus::CancelRequested);
        assert!(!request_cancel(&mut e).unwrap());

        let mut e = element(&[], 1);
        e.status = ElementStatus::Done;
        assert!(!request_cancel(&mut e).unwrap());
    }

    #[test]
    fn test_apply_rollup_records_failures() {
        let mut parent = element(&[], 10);
        parent.status = ElementStatus::Acquired;
        let rollup = RollupResult {
            status: ElementStatus::Failed,
            percent_complete: 100.0,
            percent_success: 10.0,
            jobs_created: 10,
            events_written: 0,
            files_processed: 0,
            failures: vec![FailureDetail {
                element_id: "child".to_string(),
                status: ElementStatus::Failed,
                percent_success: 10.0,
            }],
        };
        assert!(apply_rollup(&mut parent, &rollup).unwrap());
        assert_eq!(parent.status, ElementStatus::Failed);
        assert_eq!(parent.failures.len(), 1);
        // Re-applying is a no-op.
        assert!(!apply_rollup(&mut parent, &rollup).unwrap());
    }

    #[test]
    fn test_status_report_snapshot() {
        let mut e = element(&[], 4);
        e.status = ElementStatus::Running;
        e.percent_complete = 25.0;
        e.jobs_created = 4;
        let report = StatusReport::from_element(&e);
        assert_eq!(report.element_id, e.id);
        assert_eq!(report.progress.status, Some(ElementStatus::Running));
        assert_eq!(report.progress.percent_complete, Some(25.0));
        assert_eq!(report.progress.jobs_created, Some(4));
    }

    #[test]
    fn test_work_offer_builder() {
        let offer = WorkOffer::new("local-a", [("T1_US_FNAL", 5u64)])
            .excluding(["aborted-req"])
            .for_team("production");
        assert_eq!(offer.slots["T1_US_FNAL"], 5);
        assert!(offer.exclude_requests.contains("aborted-req"));
        assert_eq!(offer.team.as_deref(), Some("production"));
    }
}
