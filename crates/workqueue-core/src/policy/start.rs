// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Start policies: split a workflow spec, or a parent element pulled from an
//! upstream queue, into elements.
//!
//! | Policy | Element granularity | Sites |
//! |--------|---------------------|-------|
//! | `Block` | one per input block | block locations |
//! | `Dataset` | one per task | locations shared by every block |
//! | `MonteCarlo` | one per `max_jobs_per_element` jobs | site whitelist |
//!
//! Blocks without a usable location are deferred and reported back so the
//! caller can retry later. A failed location lookup makes the whole split
//! [`SplitOutcome::NotReady`].

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::element::{Element, InputRef, Mask};
use crate::error::{QueueError, Result};
use crate::oracle::LocationCache;
use crate::spec::{Block, Generation, InputDataset, SplittingAlgorithm, TaskSpec, WorkflowSpec};

/// Available start policies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StartPolicyKind {
    /// One element per input block.
    Block,
    /// One element per task covering the whole input dataset.
    Dataset,
    /// Generated events, no input data.
    MonteCarlo,
}

impl StartPolicyKind {
    /// Every start policy.
    pub const ALL: [StartPolicyKind; 3] = [
        StartPolicyKind::Block,
        StartPolicyKind::Dataset,
        StartPolicyKind::MonteCarlo,
    ];

    /// Policy name as used in configuration.
    pub fn as_str(&self) -> &'static str {
        match self {
            StartPolicyKind::Block => "Block",
            StartPolicyKind::Dataset => "Dataset",
            StartPolicyKind::MonteCarlo => "MonteCarlo",
        }
    }

    /// Policy a downstream queue uses for elements produced by this one.
    pub fn downstream(&self) -> StartPolicyKind {
        match self {
            StartPolicyKind::Dataset => StartPolicyKind::Block,
            other => *other,
        }
    }
}

impl fmt::Display for StartPolicyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StartPolicyKind {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self> {
        StartPolicyKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| QueueError::Configuration(format!("unknown start policy '{}'", s)))
    }
}

fn default_max_jobs_per_element() -> u64 {
    1000
}

/// Start policy arguments.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartPolicyArgs {
    /// Upper bound on jobs in one generated element.
    #[serde(default = "default_max_jobs_per_element")]
    pub max_jobs_per_element: u64,
}

impl Default for StartPolicyArgs {
    fn default() -> Self {
        Self {
            max_jobs_per_element: default_max_jobs_per_element(),
        }
    }
}

/// Result of a split.
#[derive(Debug, Clone, PartialEq)]
pub enum SplitOutcome {
    /// Elements were produced.
    Ready {
        /// New elements, in split order.
        elements: Vec<Element>,
        /// Blocks left for a later attempt because no usable site hosts them.
        deferred: BTreeSet<String>,
    },
    /// Location data could not be fetched; retry later.
    NotReady {
        /// Why the split could not run.
        reason: String,
    },
}

impl SplitOutcome {
    /// Produced elements; empty when not ready.
    pub fn elements(&self) -> &[Element] {
        match self {
            SplitOutcome::Ready { elements, .. } => elements,
            SplitOutcome::NotReady { .. } => &[],
        }
    }

    /// Sum of the produced elements' job estimates.
    pub fn total_jobs(&self) -> u64 {
        self.elements().iter().map(|e| e.num_jobs).sum()
    }
}

enum Lookup {
    Sites(BTreeSet<String>),
    Failed(String),
}

/// A start policy with its arguments.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StartPolicy {
    /// Which policy.
    pub kind: StartPolicyKind,
    /// Policy arguments.
    pub args: StartPolicyArgs,
}

impl StartPolicy {
    /// Create a policy.
    pub fn new(kind: StartPolicyKind, args: StartPolicyArgs) -> Self {
        Self { kind, args }
    }

    /// Resolve a policy by configuration name.
    pub fn from_name(name: &str, args: StartPolicyArgs) -> Result<Self> {
        Ok(Self::new(name.parse()?, args))
    }

    /// Split `spec`, or `parent` when re-splitting an element pulled from an
    /// upstream queue.
    ///
    /// Only inserts are implied by the result; no existing element is touched.
    pub async fn split(
        &self,
        spec: &WorkflowSpec,
        locations: &LocationCache,
        parent: Option<&Element>,
    ) -> Result<SplitOutcome> {
        spec.validate()?;
        if self.args.max_jobs_per_element == 0 {
            return Err(QueueError::Configuration(
                "max_jobs_per_element must be positive".to_string(),
            ));
        }

        let outcome = match parent {
            None => self.split_spec(spec, locations).await?,
            Some(parent) => self.split_parent(spec, locations, parent).await?,
        };

        if let SplitOutcome::Ready { elements, deferred } = &outcome {
            debug!(
                request_name = %spec.request_name,
                policy = %self.kind,
                elements = elements.len(),
                deferred = deferred.len(),
                "Split complete"
            );
        }
        Ok(outcome)
    }

    async fn split_spec(&self, spec: &WorkflowSpec, cache: &LocationCache) -> Result<SplitOutcome> {
        let mut elements = Vec::new();
        let mut deferred = BTreeSet::new();

        for task in &spec.tasks {
            match self.kind {
                StartPolicyKind::Block => {
                    let dataset = require_input(spec, task, self.kind)?;
                    for block in spec.selected_blocks(task) {
                        let jobs = block_jobs(task, block);
                        if jobs == 0 {
                            continue;
                        }
                        let sites = match locate(spec, cache, &dataset.name, &block.name).await? {
                            Lookup::Sites(sites) => sites,
                            Lookup::Failed(reason) => return Ok(SplitOutcome::NotReady { reason }),
                        };
                        if sites.is_empty() {
                            deferred.insert(block.name.clone());
                            continue;
                        }
                        elements.push(self.block_element(spec, task, &dataset.name, block, sites, ""));
                    }
                }
                StartPolicyKind::Dataset => {
                    let dataset = require_input(spec, task, self.kind)?;
                    let blocks: Vec<&Block> = spec
                        .selected_blocks(task)
                        .filter(|b| block_jobs(task, b) > 0)
                        .collect();
                    if blocks.is_empty() {
                        continue;
                    }

                    let mut common: Option<BTreeSet<String>> = None;
                    for block in &blocks {
                        let sites = match locate(spec, cache, &dataset.name, &block.name).await? {
                            Lookup::Sites(sites) => sites,
                            Lookup::Failed(reason) => return Ok(SplitOutcome::NotReady { reason }),
                        };
                        common = Some(match common {
                            None => sites,
                            Some(acc) => acc.intersection(&sites).cloned().collect(),
                        });
                    }
                    let common = common.unwrap_or_default();
                    if common.is_empty() {
                        deferred.extend(blocks.iter().map(|b| b.name.clone()));
                        continue;
                    }
                    elements.push(self.dataset_element(spec, task, dataset, &blocks, common));
                }
                StartPolicyKind::MonteCarlo => {
                    let generation = require_generation(spec, task)?;
                    if spec.site_whitelist.is_empty() {
                        return Err(QueueError::invalid_spec(
                            &spec.request_name,
                            "MonteCarlo work requires a site whitelist",
                        ));
                    }
                    let sites = spec.candidate_sites(spec.site_whitelist.iter().cloned());
                    if sites.is_empty() {
                        return Err(QueueError::invalid_spec(
                            &spec.request_name,
                            "every whitelisted site is blacklisted",
                        ));
                    }
                    let mask = Mask {
                        first_event: generation.first_event,
                        last_event: generation.first_event + generation.total_events - 1,
                        first_lumi: generation.first_lumi,
                        last_lumi: generation.first_lumi
                            + generation.total_events.div_ceil(generation.events_per_lumi)
                            - 1,
                    };
                    elements.extend(self.slice_generated(spec, task, generation, mask, &sites, "")?);
                }
            }
        }

        Ok(SplitOutcome::Ready { elements, deferred })
    }

    async fn split_parent(
        &self,
        spec: &WorkflowSpec,
        cache: &LocationCache,
        parent: &Element,
    ) -> Result<SplitOutcome> {
        let task = spec.task(&parent.task_name).ok_or_else(|| {
            QueueError::invalid_spec(
                &spec.request_name,
                format!("element '{}' references unknown task '{}'", parent.id, parent.task_name),
            )
        })?;
        let scope = parent.id.as_str();
        let mut elements = Vec::new();
        let mut deferred = BTreeSet::new();

        match (self.kind, &parent.input) {
            (StartPolicyKind::MonteCarlo, InputRef::Generated) => {
                let generation = require_generation(spec, task)?;
                let mask = parent.mask.ok_or_else(|| {
                    QueueError::InvariantViolation(format!(
                        "generated element '{}' has no event mask",
                        parent.id
                    ))
                })?;
                elements = self.slice_generated(spec, task, generation, mask, &parent.sites, scope)?;
            }
            (StartPolicyKind::Block, InputRef::Dataset { dataset, blocks }) => {
                let input = require_input(spec, task, self.kind)?;
                for name in blocks {
                    let block = input.blocks.iter().find(|b| &b.name == name).ok_or_else(|| {
                        QueueError::InvariantViolation(format!(
                            "element '{}' covers block '{}' missing from the spec",
                            parent.id, name
                        ))
                    })?;
                    if block_jobs(task, block) == 0 {
                        continue;
                    }
                    let sites = match locate(spec, cache, dataset, name).await? {
                        Lookup::Sites(sites) => sites,
                        Lookup::Failed(reason) => return Ok(SplitOutcome::NotReady { reason }),
                    };
                    let sites: BTreeSet<String> = sites.intersection(&parent.sites).cloned().collect();
                    if sites.is_empty() {
                        deferred.insert(name.clone());
                        continue;
                    }
                    elements.push(self.block_element(spec, task, dataset, block, sites, scope));
                }
            }
            (StartPolicyKind::Block | StartPolicyKind::Dataset, InputRef::Block { .. })
            | (StartPolicyKind::Dataset, InputRef::Dataset { .. }) => {
                elements.push(self.mirror_element(parent, scope));
            }
            (kind, input) => {
                return Err(QueueError::Configuration(format!(
                    "{} policy cannot split element '{}' with {:?} input",
                    kind, parent.id, input
                )));
            }
        }

        for element in &mut elements {
            element.priority = parent.priority;
            element.team = parent.team.clone();
            element.end_policy = parent.end_policy.clone();
            element.parent_queue_id = Some(parent.id.clone());
        }

        let total: u64 = elements.iter().map(|e| e.num_jobs).sum();
        if total > parent.num_jobs {
            return Err(QueueError::InvariantViolation(format!(
                "children of '{}' estimate {} jobs, parent holds {}",
                parent.id, total, parent.num_jobs
            )));
        }

        Ok(SplitOutcome::Ready { elements, deferred })
    }

    fn base_element(
        &self,
        spec: &WorkflowSpec,
        task: &TaskSpec,
        key: &str,
        scope: &str,
        input: InputRef,
    ) -> Element {
        let mut element = Element::new(&spec.request_name, &task.name, key, scope, input);
        element.priority = spec.priority;
        element.team = spec.team.clone();
        element.spec_url = spec.spec_url.clone();
        element.start_policy = self.kind.downstream();
        element
    }

    fn block_element(
        &self,
        spec: &WorkflowSpec,
        task: &TaskSpec,
        dataset: &str,
        block: &Block,
        sites: BTreeSet<String>,
        scope: &str,
    ) -> Element {
        let input = InputRef::Block {
            dataset: dataset.to_string(),
            block: block.name.clone(),
        };
        let mut element = self.base_element(spec, task, &block.name, scope, input);
        element.sites = sites;
        element.num_jobs = block_jobs(task, block);
        element.num_files = block.files;
        element.num_events = block.events;
        element.num_lumis = block.lumis;
        element
    }

    fn dataset_element(
        &self,
        spec: &WorkflowSpec,
        task: &TaskSpec,
        dataset: &InputDataset,
        blocks: &[&Block],
        sites: BTreeSet<String>,
    ) -> Element {
        let input = InputRef::Dataset {
            dataset: dataset.name.clone(),
            blocks: blocks.iter().map(|b| b.name.clone()).collect(),
        };
        let mut element = self.base_element(spec, task, &dataset.name, "", input);
        element.sites = sites;
        for block in blocks {
            element.num_jobs += block_jobs(task, block);
            element.num_files += block.files;
            element.num_events += block.events;
            element.num_lumis += block.lumis;
        }
        element
    }

    fn mirror_element(&self, parent: &Element, scope: &str) -> Element {
        let mut element = Element::new(
            &parent.request_name,
            &parent.task_name,
            &parent.splitting_key,
            scope,
            parent.input.clone(),
        );
        element.sites = parent.sites.clone();
        element.mask = parent.mask;
        element.num_jobs = parent.num_jobs;
        element.num_files = parent.num_files;
        element.num_events = parent.num_events;
        element.num_lumis = parent.num_lumis;
        element.spec_url = parent.spec_url.clone();
        element.start_policy = self.kind.downstream();
        element
    }

    /// Cut an event range into elements of at most `max_jobs_per_element` jobs.
    fn slice_generated(
        &self,
        spec: &WorkflowSpec,
        task: &TaskSpec,
        generation: &Generation,
        mask: Mask,
        sites: &BTreeSet<String>,
        scope: &str,
    ) -> Result<Vec<Element>> {
        let SplittingAlgorithm::EventBased { events_per_job } = task.splitting else {
            return Err(QueueError::invalid_spec(
                &spec.request_name,
                format!("generation task '{}' requires event based splitting", task.name),
            ));
        };
        if mask.last_event < mask.first_event {
            return Err(QueueError::InvariantViolation(format!(
                "event mask {}-{} is empty",
                mask.first_event, mask.last_event
            )));
        }

        let events_per_element = events_per_job.saturating_mul(self.args.max_jobs_per_element);
        let events_per_lumi = generation.events_per_lumi;
        let mut elements = Vec::new();
        let mut first_event = mask.first_event;

        loop {
            let last_event = first_event
                .saturating_add(events_per_element - 1)
                .min(mask.last_event);
            let events = last_event + 1 - first_event;
            let first_lumi = mask.first_lumi + (first_event - mask.first_event) / events_per_lumi;
            let last_lumi =
                (mask.first_lumi + (last_event - mask.first_event) / events_per_lumi).min(mask.last_lumi);

            let key = format!("{}-{}", first_event, last_event);
            let mut element = self.base_element(spec, task, &key, scope, InputRef::Generated);
            element.sites = sites.clone();
            element.mask = Some(Mask {
                first_event,
                last_event,
                first_lumi,
                last_lumi,
            });
            element.num_jobs = events.div_ceil(events_per_job);
            element.num_events = events;
            element.num_lumis = last_lumi + 1 - first_lumi;
            elements.push(element);

            if last_event >= mask.last_event {
                break;
            }
            first_event = last_event + 1;
        }

        Ok(elements)
    }
}

fn block_jobs(task: &TaskSpec, block: &Block) -> u64 {
    task.splitting.estimate_jobs(block.files, block.events, block.lumis)
}

fn require_input<'a>(
    spec: &WorkflowSpec,
    task: &'a TaskSpec,
    kind: StartPolicyKind,
) -> Result<&'a InputDataset> {
    task.input.as_ref().ok_or_else(|| {
        QueueError::invalid_spec(
            &spec.request_name,
            format!("{} policy needs input data for task '{}'", kind, task.name),
        )
    })
}

fn require_generation<'a>(spec: &WorkflowSpec, task: &'a TaskSpec) -> Result<&'a Generation> {
    match (&task.input, &task.generation) {
        (None, Some(generation)) => Ok(generation),
        _ => Err(QueueError::invalid_spec(
            &spec.request_name,
            format!("MonteCarlo policy needs a generation-only task, '{}' is not", task.name),
        )),
    }
}

async fn locate(
    spec: &WorkflowSpec,
    cache: &LocationCache,
    dataset: &str,
    block: &str,
) -> Result<Lookup> {
    match cache.locations(dataset, block).await {
        Ok(sites) => Ok(Lookup::Sites(spec.candidate_sites(sites))),
        Err(err) if err.is_retryable() => {
            warn!(
                request_name = %spec.request_name,
                block,
                error = %err,
                "Location lookup failed, split postponed"
            );
            Ok(Lookup::Failed(err.to_string()))
        }
        Err(err) => Err(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oracle::StaticOracle;
    use std::sync::Arc;
    use std::time::Duration;

    fn block(name: &str, files: u64) -> Block {
        Block {
            name: name.to_string(),
            files,
            events: files * 1000,
            lumis: files * 5,
            runs: BTreeSet::new(),
        }
    }

    fn data_spec(blocks: Vec<Block>) -> WorkflowSpec {
        WorkflowSpec {
            request_name: "req".to_string(),
            spec_url: "specs/req".to_string(),
            priority: 3,
            team: Some("production".to_string()),
            site_whitelist: BTreeSet::new(),
            site_blacklist: BTreeSet::new(),
            block_whitelist: BTreeSet::new(),
            block_blacklist: BTreeSet::new(),
            run_whitelist: BTreeSet::new(),
            run_blacklist: BTreeSet::new(),
            tasks: vec![TaskSpec {
                name: "/req/Proc".to_string(),
                input: Some(InputDataset {
                    name: "/A/B/RAW".to_string(),
                    blocks,
                }),
                generation: None,
                splitting: SplittingAlgorithm::FileBased { files_per_job: 10 },
            }],
        }
    }

    fn mc_spec(total_events: u64) -> WorkflowSpec {
        let mut spec = data_spec(vec![]);
        spec.tasks[0].input = None;
        spec.tasks[0].generation = Some(Generation {
            total_events,
            events_per_lumi: 100,
            first_event: 1,
            first_lumi: 1,
        });
        spec.tasks[0].splitting = SplittingAlgorithm::EventBased { events_per_job: 100 };
        spec.site_whitelist = ["T2_CH_CERN", "T1_US_FNAL"].into_iter().map(String::from).collect();
        spec
    }

    async fn cache_with(locations: &[(&str, &[&str])]) -> (Arc<StaticOracle>, LocationCache) {
        let oracle = Arc::new(StaticOracle::new());
        for (block, sites) in locations {
            oracle.set_locations(block, sites).await;
        }
        let cache = LocationCache::new(oracle.clone(), Duration::from_secs(3600));
        (oracle, cache)
    }

    fn block_policy() -> StartPolicy {
        StartPolicy::new(StartPolicyKind::Block, StartPolicyArgs::default())
    }

    #[test]
    fn test_unknown_policy_is_configuration_error() {
        let err = StartPolicy::from_name("ResubmitBlock", StartPolicyArgs::default()).unwrap_err();
        assert!(matches!(err, QueueError::Configuration(_)));
        assert_eq!(
            StartPolicy::from_name("Dataset", StartPolicyArgs::default()).unwrap().kind,
            StartPolicyKind::Dataset
        );
    }

    #[tokio::test]
    async fn test_block_split_conserves_jobs() {
        let spec = data_spec(vec![block("b1", 100), block("b2", 35), block("b3", 0)]);
        let (_, cache) = cache_with(&[
            ("b1", &["T1_US_FNAL", "T2_CH_CERN"]),
            ("b2", &["T2_CH_CERN"]),
            ("b3", &["T2_CH_CERN"]),
        ])
        .await;

        let outcome = block_policy().split(&spec, &cache, None).await.unwrap();
        let elements = outcome.elements();
        // b3 is empty and produces nothing.
        assert_eq!(elements.len(), 2);
        assert_eq!(elements[0].num_jobs, 10);
        assert_eq!(elements[1].num_jobs, 4);
        assert_eq!(outcome.total_jobs(), spec.estimated_jobs(&spec.tasks[0]));

        let keys: BTreeSet<_> = elements.iter().map(|e| e.splitting_key.as_str()).collect();
        assert_eq!(keys.len(), elements.len());
        assert_eq!(elements[0].priority, 3);
        assert_eq!(elements[0].team.as_deref(), Some("production"));
        assert_eq!(elements[0].spec_url, "specs/req");
        assert_eq!(elements[0].status, crate::element::ElementStatus::Available);
    }

    #[tokio::test]
    async fn test_split_is_deterministic() {
        let spec = data_spec(vec![block("b1", 10), block("b2", 20)]);
        let (_, cache) = cache_with(&[("b1", &["T1_US_FNAL"]), ("b2", &["T1_US_FNAL"])]).await;
        let first = block_policy().split(&spec, &cache, None).await.unwrap();
        let second = block_policy().split(&spec, &cache, None).await.unwrap();
        let ids = |o: &SplitOutcome| o.elements().iter().map(|e| e.id.clone()).collect::<Vec<_>>();
        assert_eq!(ids(&first), ids(&second));
    }

    #[tokio::test]
    async fn test_unlocated_blocks_are_deferred() {
        let mut spec = data_spec(vec![block("b1", 10), block("b2", 20)]);
        spec.site_blacklist.insert("T2_DE_DESY".to_string());
        let (_, cache) = cache_with(&[("b1", &["T1_US_FNAL"]), ("b2", &["T2_DE_DESY"])]).await;

        let SplitOutcome::Ready { elements, deferred } =
            block_policy().split(&spec, &cache, None).await.unwrap()
        else {
            panic!("expected a split");
        };
        assert_eq!(elements.len(), 1);
        assert_eq!(deferred.into_iter().collect::<Vec<_>>(), vec!["b2"]);
    }

    #[tokio::test]
    async fn test_lookup_failure_is_not_ready() {
        let spec = data_spec(vec![block("b1", 10)]);
        let (oracle, cache) = cache_with(&[("b1", &["T1_US_FNAL"])]).await;
        oracle.set_unavailable(true);

        let outcome = block_policy().split(&spec, &cache, None).await.unwrap();
        assert!(matches!(outcome, SplitOutcome::NotReady { .. }));
        assert!(outcome.elements().is_empty());
    }

    #[tokio::test]
    async fn test_invalid_spec_is_rejected() {
        let spec = data_spec(vec![]);
        let (_, cache) = cache_with(&[]).await;
        let policy = StartPolicy::new(StartPolicyKind::MonteCarlo, StartPolicyArgs::default());
        let err = policy.split(&spec, &cache, None).await.unwrap_err();
        assert!(matches!(err, QueueError::InvalidSpec { .. }));
    }

    #[tokio::test]
    async fn test_dataset_split_uses_common_sites() {
        let spec = data_spec(vec![block("b1", 10), block("b2", 25)]);
        let (_, cache) = cache_with(&[
            ("b1", &["T1_US_FNAL", "T2_CH_CERN"]),
            ("b2", &["T2_CH_CERN", "T2_DE_DESY"]),
        ])
        .await;
        let policy = StartPolicy::new(StartPolicyKind::Dataset, StartPolicyArgs::default());

        let outcome = policy.split(&spec, &cache, None).await.unwrap();
        let elements = outcome.elements();
        assert_eq!(elements.len(), 1);
        assert_eq!(elements[0].num_jobs, 1 + 3);
        assert_eq!(elements[0].num_files, 35);
        assert_eq!(
            elements[0].sites.iter().collect::<Vec<_>>(),
            vec!["T2_CH_CERN"]
        );
        assert_eq!(elements[0].start_policy, StartPolicyKind::Block);
    }

    #[tokio::test]
    async fn test_dataset_without_common_site_is_deferred() {
        let spec = data_spec(vec![block("b1", 10), block("b2", 10)]);
        let (_, cache) = cache_with(&[("b1", &["T1_US_FNAL"]), ("b2", &["T2_CH_CERN"])]).await;
        let policy = StartPolicy::new(StartPolicyKind::Dataset, StartPolicyArgs::default());

        let SplitOutcome::Ready { elements, deferred } =
            policy.split(&spec, &cache, None).await.unwrap()
        else {
            panic!("expected a split");
        };
        assert!(elements.is_empty());
        assert_eq!(deferred.len(), 2);
    }

    #[tokio::test]
    async fn test_monte_carlo_slices_events() {
        let spec = mc_spec(10_550);
        let (_, cache) = cache_with(&[]).await;
        let policy = StartPolicy::new(
            StartPolicyKind::MonteCarlo,
            StartPolicyArgs {
                max_jobs_per_element: 50,
            },
        );

        let outcome = policy.split(&spec, &cache, None).await.unwrap();
        let elements = outcome.elements();
        let jobs: Vec<u64> = elements.iter().map(|e| e.num_jobs).collect();
        assert_eq!(jobs, vec![50, 50, 6]);
        assert_eq!(outcome.total_jobs(), spec.estimated_jobs(&spec.tasks[0]));

        let masks: Vec<Mask> = elements.iter().filter_map(|e| e.mask).collect();
        assert_eq!(masks[0].first_event, 1);
        assert_eq!(masks[0].last_event, 5000);
        assert_eq!(masks[1].first_event, 5001);
        assert_eq!(masks[2].last_event, 10_550);
        assert_eq!(masks[2].last_lumi, 106);
        assert_eq!(elements.iter().map(|e| e.num_events).sum::<u64>(), 10_550);
        assert!(elements.iter().all(|e| e.sites.len() == 2));
    }

    #[tokio::test]
    async fn test_monte_carlo_requires_whitelist() {
        let mut spec = mc_spec(1000);
        spec.site_whitelist.clear();
        let (_, cache) = cache_with(&[]).await;
        let policy = StartPolicy::new(StartPolicyKind::MonteCarlo, StartPolicyArgs::default());
        assert!(matches!(
            policy.split(&spec, &cache, None).await,
            Err(QueueError::InvalidSpec { .. })
        ));
    }

    #[tokio::test]
    async fn test_resplit_dataset_parent_into_blocks() {
        let spec = data_spec(vec![block("b1", 10), block("b2", 25)]);
        let (_, cache) = cache_with(&[
            ("b1", &["T1_US_FNAL", "T2_CH_CERN"]),
            ("b2", &["T2_CH_CERN"]),
        ])
        .await;
        let global = StartPolicy::new(StartPolicyKind::Dataset, StartPolicyArgs::default());
        let parent = global.split(&spec, &cache, None).await.unwrap().elements()[0].clone();

        let local = StartPolicy::new(parent.start_policy, StartPolicyArgs::default());
        let outcome = local.split(&spec, &cache, Some(&parent)).await.unwrap();
        let children = outcome.elements();
        assert_eq!(children.len(), 2);
        assert_eq!(outcome.total_jobs(), parent.num_jobs);
        for child in children {
            assert_eq!(child.parent_queue_id.as_deref(), Some(parent.id.as_str()));
            assert_eq!(child.sites.iter().collect::<Vec<_>>(), vec!["T2_CH_CERN"]);
        }
    }

    #[tokio::test]
    async fn test_resplit_block_parent_mirrors_it() {
        let spec = data_spec(vec![block("b1", 10)]);
        let (_, cache) = cache_with(&[("b1", &["T1_US_FNAL"])]).await;
        let parent = block_policy().split(&spec, &cache, None).await.unwrap().elements()[0].clone();

        let outcome = block_policy().split(&spec, &cache, Some(&parent)).await.unwrap();
        let child = &outcome.elements()[0];
        assert_ne!(child.id, parent.id);
        assert_eq!(child.input, parent.input);
        assert_eq!(child.num_jobs, parent.num_jobs);
    }

    #[tokio::test]
    async fn test_resplit_generated_parent_stays_within_mask() {
        let spec = mc_spec(10_000);
        let (_, cache) = cache_with(&[]).await;
        let global = StartPolicy::new(StartPolicyKind::MonteCarlo, StartPolicyArgs::default());
        let parent = global.split(&spec, &cache, None).await.unwrap().elements()[0].clone();
        assert_eq!(parent.num_jobs, 100);

        let local = StartPolicy::new(
            StartPolicyKind::MonteCarlo,
            StartPolicyArgs {
                max_jobs_per_element: 30,
            },
        );
        let outcome = local.split(&spec, &cache, Some(&parent)).await.unwrap();
        assert_eq!(outcome.elements().len(), 4);
        assert_eq!(outcome.total_jobs(), 100);
        let last = outcome.elements().last().and_then(|e| e.mask).unwrap();
        assert_eq!(last.last_event, 10_000);
    }

    #[tokio::test]
    async fn test_resplit_rejects_expansion() {
        let spec = data_spec(vec![block("b1", 10)]);
        let (_, cache) = cache_with(&[("b1", &["T1_US_FNAL"])]).await;
        let mut parent = block_policy().split(&spec, &cache, None).await.unwrap().elements()[0].clone();
        parent.input = InputRef::Dataset {
            dataset: "/A/B/RAW".to_string(),
            blocks: vec!["b1".to_string()],
        };
        parent.num_jobs = 0;

        let err = block_policy().split(&spec, &cache, Some(&parent)).await.unwrap_err();
        assert!(matches!(err, QueueError::InvariantViolation(_)));
    }
}
