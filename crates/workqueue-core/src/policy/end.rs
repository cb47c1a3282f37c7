// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! End policies: derive a parent's status from its children.
//!
//! Evaluation is a pure function of the parent and its children so it can be
//! re-run on every status report.

use serde::{Deserialize, Serialize};

use crate::element::{Element, ElementStatus, FailureDetail};
use crate::error::{QueueError, Result};

/// Available end policies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum EndPolicyKind {
    /// The parent finishes once, when every child is terminal.
    #[default]
    SingleShot,
}

fn default_success_threshold() -> f64 {
    0.9
}

/// End policy and its arguments, recorded on every element.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EndPolicyArgs {
    /// Which policy.
    #[serde(default)]
    pub policy: EndPolicyKind,
    /// Minimum job-weighted success fraction (0.0-1.0) for `Done`; inclusive.
    #[serde(default = "default_success_threshold")]
    pub success_threshold: f64,
}

impl Default for EndPolicyArgs {
    fn default() -> Self {
        Self {
            policy: EndPolicyKind::SingleShot,
            success_threshold: default_success_threshold(),
        }
    }
}

/// Aggregate view of a parent's children.
#[derive(Debug, Clone, PartialEq)]
pub struct RollupResult {
    /// Aggregate status.
    pub status: ElementStatus,
    /// Job-weighted completion (0-100).
    pub percent_complete: f64,
    /// Job-weighted success (0-100).
    pub percent_success: f64,
    /// Jobs created by all children.
    pub jobs_created: u64,
    /// Events written by all children.
    pub events_written: u64,
    /// Files processed by all children.
    pub files_processed: u64,
    /// Failed children, when the aggregate is `Failed`.
    pub failures: Vec<FailureDetail>,
}

impl RollupResult {
    /// The terminal status to apply, if the children decided one.
    pub fn terminal_status(&self) -> Option<ElementStatus> {
        self.status.is_terminal().then_some(self.status)
    }
}

impl EndPolicyArgs {
    /// Reject thresholds outside 0.0..=1.0.
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.success_threshold) {
            return Err(QueueError::Configuration(format!(
                "success threshold must be within 0.0..=1.0, got {}",
                self.success_threshold
            )));
        }
        Ok(())
    }

    /// Roll `children` up into `parent`'s aggregate status.
    ///
    /// - parent still has deferred inputs: `Negotiating`
    /// - parent `CancelRequested` and every child terminal: `Canceled`
    /// - any child `CancelRequested`: `CancelRequested`
    /// - any child in flight: the furthest in-flight status reached
    /// - all terminal, any `Canceled`: `Canceled`
    /// - all terminal: `Done` if the success fraction is at least the
    ///   threshold, otherwise `Failed`
    ///
    /// With no children the parent's own status is kept, except that a
    /// cancellation request completes.
    pub fn evaluate(&self, parent: &Element, children: &[&Element]) -> Result<RollupResult> {
        self.validate()?;

        let mut weight_total = 0u64;
        let mut complete = 0.0;
        let mut success = 0.0;
        let mut rollup = RollupResult {
            status: parent.status,
            percent_complete: parent.percent_complete,
            percent_success: parent.percent_success,
            jobs_created: 0,
            events_written: 0,
            files_processed: 0,
            failures: Vec::new(),
        };

        for child in children {
            for (name, value) in [
                ("percent_complete", child.percent_complete),
                ("percent_success", child.percent_success),
            ] {
                if !(0.0..=100.0).contains(&value) {
                    return Err(QueueError::InvariantViolation(format!(
                        "child '{}' reports {} = {}",
                        child.id, name, value
                    )));
                }
            }
            let weight = child.num_jobs.max(1);
            weight_total += weight;
            complete += child.percent_complete * weight as f64;
            success += child.percent_success * weight as f64;
            rollup.jobs_created += child.jobs_created;
            rollup.events_written += child.events_written;
            rollup.files_processed += child.files_processed;
        }

        if children.is_empty() {
            if parent.status == ElementStatus::CancelRequested {
                rollup.status = ElementStatus::Canceled;
            } else if !parent.deferred_inputs.is_empty() {
                rollup.status = ElementStatus::Negotiating;
            }
            return Ok(rollup);
        }

        rollup.percent_complete = complete / weight_total as f64;
        rollup.percent_success = success / weight_total as f64;

        let all_terminal = children.iter().all(|c| c.status.is_terminal());
        rollup.status = if parent.status == ElementStatus::CancelRequested && all_terminal {
            ElementStatus::Canceled
        } else if !parent.deferred_inputs.is_empty() {
            ElementStatus::Negotiating
        } else if children.iter().any(|c| c.status == ElementStatus::CancelRequested) {
            ElementStatus::CancelRequested
        } else if !all_terminal {
            in_flight_status(children)
        } else if children.iter().any(|c| c.status == ElementStatus::Canceled) {
            ElementStatus::Canceled
        } else if rollup.percent_success / 100.0 >= self.success_threshold {
            ElementStatus::Done
        } else {
            ElementStatus::Failed
        };

        if rollup.status == ElementStatus::Failed {
            rollup.failures = children
                .iter()
                .filter(|c| c.status == ElementStatus::Failed || c.percent_success < 100.0)
                .map(|c| FailureDetail {
                    element_id: c.id.clone(),
                    status: c.status,
                    percent_success: c.percent_success,
                })
                .collect();
        }

        Ok(rollup)
    }
}

fn in_flight_status(children: &[&Element]) -> ElementStatus {
    // Finished children count as work that has started.
    children
        .iter()
        .map(|c| {
            if c.status.is_terminal() {
                ElementStatus::Running
            } else {
                c.status
            }
        })
        .max_by_key(|s| s.rank())
        .unwrap_or(ElementStatus::Available)
}
