// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! WorkQueue elements and their status state machine.
//!
//! ```text
//!   Available ──► Negotiating ──► Acquired ──► Running ──► Done
//!       ▲              │              │           │    └──► Failed
//!       └──────────────┴──────────────┘           │
//!        (timeout / release)                      │
//!   any non-terminal ──► CancelRequested ──► Canceled
//! ```

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{QueueError, Result};
use crate::policy::{EndPolicyArgs, StartPolicyKind};

/// Status of a WorkQueue element.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ElementStatus {
    /// Split and waiting to be claimed.
    Available,
    /// A downstream queue is claiming this element.
    Negotiating,
    /// Claimed by a downstream queue.
    Acquired,
    /// Job creation has started downstream.
    Running,
    /// Finished successfully.
    Done,
    /// Finished unsuccessfully.
    Failed,
    /// Cancellation requested; the holder must stop work and report back.
    CancelRequested,
    /// Cancelled.
    Canceled,
}

impl ElementStatus {
    /// Every status, in state machine order.
    pub const ALL: [ElementStatus; 8] = [
        ElementStatus::Available,
        ElementStatus::Negotiating,
        ElementStatus::Acquired,
        ElementStatus::Running,
        ElementStatus::Done,
        ElementStatus::Failed,
        ElementStatus::CancelRequested,
        ElementStatus::Canceled,
    ];

    /// Status name as stored in the queue backend.
    pub fn as_str(&self) -> &'static str {
        match self {
            ElementStatus::Available => "Available",
            ElementStatus::Negotiating => "Negotiating",
            ElementStatus::Acquired => "Acquired",
            ElementStatus::Running => "Running",
            ElementStatus::Done => "Done",
            ElementStatus::Failed => "Failed",
            ElementStatus::CancelRequested => "CancelRequested",
            ElementStatus::Canceled => "Canceled",
        }
    }

    /// No transition leaves a terminal status.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ElementStatus::Done | ElementStatus::Failed | ElementStatus::Canceled
        )
    }

    /// Position in the forward ordering
    /// `Available < Negotiating < Acquired < Running < CancelRequested < terminal`.
    pub fn rank(&self) -> u8 {
        match self {
            ElementStatus::Available => 0,
            ElementStatus::Negotiating => 1,
            ElementStatus::Acquired => 2,
            ElementStatus::Running => 3,
            ElementStatus::CancelRequested => 4,
            ElementStatus::Done | ElementStatus::Failed | ElementStatus::Canceled => 5,
        }
    }

    /// Whether the state machine allows moving from `self` to `next`.
    pub fn can_transition_to(&self, next: ElementStatus) -> bool {
        use ElementStatus::*;
        match (*self, next) {
            (Available, Negotiating) => true,
            (Negotiating, Acquired) | (Negotiating, Available) => true,
            // Explicit release of a claim held by a decommissioned child queue.
            (Acquired, Available) => true,
            (Acquired, Running) | (Acquired, Done) | (Acquired, Failed) => true,
            (Running, Done) | (Running, Failed) => true,
            (CancelRequested, Canceled) => true,
            (from, CancelRequested) => !from.is_terminal() && from != CancelRequested,
            _ => false,
        }
    }
}

impl fmt::Display for ElementStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ElementStatus {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self> {
        ElementStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| QueueError::DataIntegrity(format!("unknown element status '{}'", s)))
    }
}

/// Derive the stable element ID from the request, task and splitting key.
///
/// `scope` distinguishes elements split from different parents at the same
/// level of the hierarchy (the parent element ID), and is empty at the top.
pub fn element_id(request_name: &str, task_name: &str, splitting_key: &str, scope: &str) -> String {
    let mut hasher = Sha256::new();
    for part in [request_name, task_name, splitting_key, scope] {
        hasher.update(part.as_bytes());
        hasher.update([0u8]);
    }
    format!("{:x}", hasher.finalize())
}

/// The data an element processes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InputRef {
    /// A single block of a dataset.
    Block {
        /// Dataset name.
        dataset: String,
        /// Block name.
        block: String,
    },
    /// A whole dataset (or the selected blocks of it).
    Dataset {
        /// Dataset name.
        dataset: String,
        /// Blocks covered by the element.
        blocks: Vec<String>,
    },
    /// No input data; events are generated (Monte Carlo).
    Generated,
    /// The complete request, as held in a global queue inbox.
    Request,
}

/// Event and lumi range for generated work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mask {
    /// First event number (inclusive).
    pub first_event: u64,
    /// Last event number (inclusive).
    pub last_event: u64,
    /// First luminosity section (inclusive).
    pub first_lumi: u64,
    /// Last luminosity section (inclusive).
    pub last_lumi: u64,
}

impl Mask {
    /// Number of events covered by the mask.
    pub fn events(&self) -> u64 {
        self.last_event + 1 - self.first_event
    }
}

/// Last known state of a failed descendant, attached to a failed parent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureDetail {
    /// Descendant element ID.
    pub element_id: String,
    /// Status the descendant ended in.
    pub status: ElementStatus,
    /// Reported success percentage.
    pub percent_success: f64,
}

/// Progress report merged into an element by `update_element`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Progress {
    /// New status reported by the downstream consumer.
    pub status: Option<ElementStatus>,
    /// Percentage of jobs finished (0-100).
    pub percent_complete: Option<f64>,
    /// Percentage of finished jobs that succeeded (0-100).
    pub percent_success: Option<f64>,
    /// Jobs created so far.
    pub jobs_created: Option<u64>,
    /// Events written so far.
    pub events_written: Option<u64>,
    /// Files processed so far.
    pub files_processed: Option<u64>,
}

impl Progress {
    /// Progress report that only carries a status.
    pub fn status(status: ElementStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    /// Reject values outside the valid ranges.
    pub fn validate(&self, element_id: &str) -> Result<()> {
        for (name, value) in [
            ("percent_complete", self.percent_complete),
            ("percent_success", self.percent_success),
        ] {
            if let Some(v) = value
                && !(0.0..=100.0).contains(&v)
            {
                return Err(QueueError::InvariantViolation(format!(
                    "{} for element '{}' must be within 0..=100, got {}",
                    name, element_id, v
                )));
            }
        }
        Ok(())
    }
}

/// Unit of distributable work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Element {
    /// Stable ID derived from request, task and splitting key.
    pub id: String,
    /// Workflow this element belongs to.
    pub request_name: String,
    /// Task within the workflow.
    pub task_name: String,
    /// Identity of the data partition within the task.
    pub splitting_key: String,
    /// Current status.
    pub status: ElementStatus,
    /// Data to process.
    pub input: InputRef,
    /// Candidate sites for processing.
    pub sites: BTreeSet<String>,
    /// Event/lumi range for generated work.
    pub mask: Option<Mask>,
    /// Estimated number of jobs.
    pub num_jobs: u64,
    /// Input files covered.
    pub num_files: u64,
    /// Input (or generated) events covered.
    pub num_events: u64,
    /// Luminosity sections covered.
    pub num_lumis: u64,
    /// Scheduling priority; higher goes first.
    pub priority: i64,
    /// Team allowed to process this element (None = any team).
    pub team: Option<String>,
    /// Where the workflow spec can be fetched from.
    pub spec_url: String,
    /// Policy used to split this element further downstream.
    pub start_policy: StartPolicyKind,
    /// Policy used to roll up this element's children.
    pub end_policy: EndPolicyArgs,
    /// Element in the same queue's inbox (or the parent queue) this was split from.
    pub parent_queue_id: Option<String>,
    /// Parent queue the element was pulled from (mirrored copies only).
    pub parent_queue_url: Option<String>,
    /// Downstream queue holding the element.
    pub child_queue_url: Option<String>,
    /// Percentage of jobs finished (0-100).
    pub percent_complete: f64,
    /// Percentage of finished jobs that succeeded (0-100).
    pub percent_success: f64,
    /// Jobs created downstream.
    pub jobs_created: u64,
    /// Events written downstream.
    pub events_written: u64,
    /// Files processed downstream.
    pub files_processed: u64,
    /// Inputs not split yet because they had no usable location.
    #[serde(default)]
    pub deferred_inputs: BTreeSet<String>,
    /// Failed descendants, filled when the element is rolled up to Failed.
    #[serde(default)]
    pub failures: Vec<FailureDetail>,
    /// Why the element was excluded from active queries.
    #[serde(default)]
    pub quarantine_reason: Option<String>,
    /// Insertion order within the backend; assigned on insert.
    #[serde(default)]
    pub sequence: u64,
    /// Optimistic concurrency revision; assigned by the backend.
    #[serde(default)]
    pub revision: u64,
    /// When the element was first inserted.
    pub inserted_at: DateTime<Utc>,
    /// Last modification time.
    pub updated_at: DateTime<Utc>,
    /// When the owning request was archived.
    #[serde(default)]
    pub archived_at: Option<DateTime<Utc>>,
}

impl Element {
    /// Create an `Available` element with zeroed counters.
    pub fn new(
        request_name: &str,
        task_name: &str,
        splitting_key: &str,
        scope: &str,
        input: InputRef,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: element_id(request_name, task_name, splitting_key, scope),
            request_name: request_name.to_string(),
            task_name: task_name.to_string(),
            splitting_key: splitting_key.to_string(),
            status: ElementStatus::Available,
            input,
            sites: BTreeSet::new(),
            mask: None,
            num_jobs: 0,
            num_files: 0,
            num_events: 0,
            num_lumis: 0,
            priority: 0,
            team: None,
            spec_url: String::new(),
            start_policy: StartPolicyKind::Block,
            end_policy: EndPolicyArgs::default(),
            parent_queue_id: None,
            parent_queue_url: None,
            child_queue_url: None,
            percent_complete: 0.0,
            percent_success: 0.0,
            jobs_created: 0,
            events_written: 0,
            files_processed: 0,
            deferred_inputs: BTreeSet::new(),
            failures: Vec::new(),
            quarantine_reason: None,
            sequence: 0,
            revision: 0,
            inserted_at: now,
            updated_at: now,
            archived_at: None,
        }
    }

    /// Move to `next`, failing if the state machine forbids it.
    pub fn transition(&mut self, next: ElementStatus) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(QueueError::InvalidTransition {
                element_id: self.id.clone(),
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Move forward to `target` through the intermediate states the machine
    /// requires. Targets at or behind the current rank are ignored.
    ///
    /// Returns whether the status changed.
    pub fn advance_to(&mut self, target: ElementStatus) -> Result<bool> {
        let before = self.status;
        if before == target || target.rank() <= before.rank() {
            return Ok(false);
        }
        while self.status != target {
            let next = if self.status.can_transition_to(target) {
                target
            } else if target == ElementStatus::Canceled {
                ElementStatus::CancelRequested
            } else {
                match self.status {
                    ElementStatus::Available => ElementStatus::Negotiating,
                    ElementStatus::Negotiating => ElementStatus::Acquired,
                    ElementStatus::Acquired => ElementStatus::Running,
                    _ => break,
                }
            };
            self.transition(next)?;
        }
        Ok(self.status != before)
    }

    /// Whether the element takes part in claims and rollups.
    pub fn is_active(&self) -> bool {
        self.quarantine_reason.is_none() && self.archived_at.is_none()
    }

    /// Whether any candidate site is among `sites`.
    pub fn runs_at_any<'a>(&self, mut sites: impl Iterator<Item = &'a String>) -> bool {
        sites.any(|site| self.sites.contains(site))
    }

    /// Merge a progress report; status changes must be legal transitions.
    pub fn apply_progress(&mut self, progress: &Progress) -> Result<()> {
        progress.validate(&self.id)?;
        if let Some(status) = progress.status
            && status != self.status
        {
            self.transition(status)?;
        }
        if let Some(v) = progress.percent_complete {
            self.percent_complete = v;
        }
        if let Some(v) = progress.percent_success {
            self.percent_success = v;
        }
        if let Some(v) = progress.jobs_created {
            self.jobs_created = v;
        }
        if let Some(v) = progress.events_written {
            self.events_written = v;
        }
        if let Some(v) = progress.files_processed {
            self.files_processed = v;
        }
        // A bare terminal report means the work is fully accounted for.
        if self.status.is_terminal() && progress.percent_complete.is_none() {
            self.percent_complete = 100.0;
        }
        if self.status == ElementStatus::Done && progress.percent_success.is_none() {
            self.percent_success = 100.0;
        }
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Copy of this element as it is inserted into a child queue's inbox.
    pub fn mirror_for_child(&self, parent_queue_url: &str) -> Element {
        let mut copy = self.clone();
        copy.status = ElementStatus::Acquired;
        copy.parent_queue_url = Some(parent_queue_url.to_string());
        copy.child_queue_url = None;
        copy.sequence = 0;
        copy.revision = 0;
        copy.percent_complete = 0.0;
        copy.percent_success = 0.0;
        copy.failures.clear();
        copy.inserted_at = Utc::now();
        copy.updated_at = copy.inserted_at;
        copy
    }
}
