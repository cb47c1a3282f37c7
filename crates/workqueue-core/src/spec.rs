// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Workflow specifications as seen by the queue.
//!
//! Only the parts relevant to splitting are modelled: the top-level tasks,
//! their input data, the job splitting algorithm and the site/data
//! restrictions. Specs are read-only from the queue's perspective.

use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::error::{QueueError, Result};

/// How a task's input is divided into jobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "algorithm", rename_all = "snake_case")]
pub enum SplittingAlgorithm {
    /// A fixed number of files per job.
    FileBased {
        /// Files per job.
        files_per_job: u64,
    },
    /// A fixed number of events per job.
    EventBased {
        /// Events per job.
        events_per_job: u64,
    },
    /// A fixed number of luminosity sections per job.
    LumiBased {
        /// Lumis per job.
        lumis_per_job: u64,
    },
}

impl SplittingAlgorithm {
    /// Estimated jobs for a unit of input. Jobs never span blocks, so a
    /// task's estimate is the sum of its blocks' estimates.
    pub fn estimate_jobs(&self, files: u64, events: u64, lumis: u64) -> u64 {
        match *self {
            SplittingAlgorithm::FileBased { files_per_job } => files.div_ceil(files_per_job),
            SplittingAlgorithm::EventBased { events_per_job } => events.div_ceil(events_per_job),
            SplittingAlgorithm::LumiBased { lumis_per_job } => lumis.div_ceil(lumis_per_job),
        }
    }

    fn per_job(&self) -> u64 {
        match *self {
            SplittingAlgorithm::FileBased { files_per_job } => files_per_job,
            SplittingAlgorithm::EventBased { events_per_job } => events_per_job,
            SplittingAlgorithm::LumiBased { lumis_per_job } => lumis_per_job,
        }
    }
}

/// A block of input files.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    /// Block name (`/Primary/Processed/TIER#uuid`).
    pub name: String,
    /// Number of files.
    pub files: u64,
    /// Number of events.
    pub events: u64,
    /// Number of luminosity sections.
    pub lumis: u64,
    /// Runs contained in the block.
    #[serde(default)]
    pub runs: BTreeSet<u64>,
}

/// Input dataset of a task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputDataset {
    /// Dataset name.
    pub name: String,
    /// Blocks of the dataset.
    pub blocks: Vec<Block>,
}

/// Generated-event parameters for tasks without input data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Generation {
    /// Total events to generate.
    pub total_events: u64,
    /// Events per luminosity section.
    pub events_per_lumi: u64,
    /// First event number.
    #[serde(default = "one")]
    pub first_event: u64,
    /// First lumi number.
    #[serde(default = "one")]
    pub first_lumi: u64,
}

fn one() -> u64 {
    1
}

/// A top-level task of a workflow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskSpec {
    /// Task path, e.g. `/ReqName/DataProcessing`.
    pub name: String,
    /// Input data; `None` for generation tasks.
    pub input: Option<InputDataset>,
    /// Generation parameters; required when `input` is `None`.
    pub generation: Option<Generation>,
    /// Job splitting algorithm.
    pub splitting: SplittingAlgorithm,
}

/// A workflow specification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowSpec {
    /// Unique request name.
    pub request_name: String,
    /// Where the spec is published; recorded on elements for downstream queues.
    pub spec_url: String,
    /// Scheduling priority.
    pub priority: i64,
    /// Team that should process the request.
    #[serde(default)]
    pub team: Option<String>,
    /// Sites allowed to run the request (empty = no restriction).
    #[serde(default)]
    pub site_whitelist: BTreeSet<String>,
    /// Sites that must not run the request.
    #[serde(default)]
    pub site_blacklist: BTreeSet<String>,
    /// Blocks to process (empty = all).
    #[serde(default)]
    pub block_whitelist: BTreeSet<String>,
    /// Blocks to skip.
    #[serde(default)]
    pub block_blacklist: BTreeSet<String>,
    /// Runs to process (empty = all).
    #[serde(default)]
    pub run_whitelist: BTreeSet<u64>,
    /// Runs to skip.
    #[serde(default)]
    pub run_blacklist: BTreeSet<u64>,
    /// Top-level tasks.
    pub tasks: Vec<TaskSpec>,
}

impl WorkflowSpec {
    /// Reject specs that no start policy can split.
    pub fn validate(&self) -> Result<()> {
        let invalid = |reason: String| QueueError::invalid_spec(&self.request_name, reason);

        if self.request_name.trim().is_empty() {
            return Err(invalid("request_name is required".to_string()));
        }
        if self.tasks.is_empty() {
            return Err(invalid("spec has no top-level tasks".to_string()));
        }

        let mut names = BTreeSet::new();
        for task in &self.tasks {
            if !names.insert(task.name.as_str()) {
                return Err(invalid(format!("duplicate task '{}'", task.name)));
            }
            if task.splitting.per_job() == 0 {
                return Err(invalid(format!(
                    "task '{}' splits with zero units per job",
                    task.name
                )));
            }
            match (&task.input, &task.generation) {
                (None, None) => {
                    return Err(invalid(format!(
                        "task '{}' has neither input data nor generation parameters",
                        task.name
                    )));
                }
                (None, Some(generation)) => {
                    if generation.total_events == 0 || generation.events_per_lumi == 0 {
                        return Err(invalid(format!(
                            "task '{}' must generate a positive number of events",
                            task.name
                        )));
                    }
                    let lumis = generation.total_events.div_ceil(generation.events_per_lumi);
                    if generation.first_event.checked_add(generation.total_events).is_none()
                        || generation.first_lumi.checked_add(lumis).is_none()
                    {
                        return Err(invalid(format!(
                            "task '{}' event or lumi range exceeds the numbering space",
                            task.name
                        )));
                    }
                    if !matches!(task.splitting, SplittingAlgorithm::EventBased { .. }) {
                        return Err(invalid(format!(
                            "generation task '{}' requires event based splitting",
                            task.name
                        )));
                    }
                }
                (Some(dataset), _) => {
                    if dataset.name.is_empty() {
                        return Err(invalid(format!(
                            "task '{}' input dataset has no name",
                            task.name
                        )));
                    }
                }
            }
        }
        Ok(())
    }

    /// Look up a top-level task by name.
    pub fn task(&self, name: &str) -> Option<&TaskSpec> {
        self.tasks.iter().find(|t| t.name == name)
    }

    /// Whether the block passes the block and run white/black lists.
    pub fn accepts_block(&self, block: &Block) -> bool {
        if !self.block_whitelist.is_empty() && !self.block_whitelist.contains(&block.name) {
            return false;
        }
        if self.block_blacklist.contains(&block.name) {
            return false;
        }
        if !self.run_whitelist.is_empty()
            && !block.runs.is_empty()
            && block.runs.is_disjoint(&self.run_whitelist)
        {
            return false;
        }
        if !block.runs.is_empty() && block.runs.is_subset(&self.run_blacklist) {
            return false;
        }
        true
    }

    /// Blocks of `task` selected for processing.
    pub fn selected_blocks<'a>(&'a self, task: &'a TaskSpec) -> impl Iterator<Item = &'a Block> {
        task.input
            .iter()
            .flat_map(|dataset| dataset.blocks.iter())
            .filter(|block| self.accepts_block(block))
    }

    /// Restrict data locations to the site white/black lists.
    pub fn candidate_sites<I, S>(&self, locations: I) -> BTreeSet<String>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        locations
            .into_iter()
            .map(Into::into)
            .filter(|site| self.site_whitelist.is_empty() || self.site_whitelist.contains(site))
            .filter(|site| !self.site_blacklist.contains(site))
            .collect()
    }

    /// Total estimated jobs of a task over all selected input.
    pub fn estimated_jobs(&self, task: &TaskSpec) -> u64 {
        match (&task.input, &task.generation) {
            (Some(_), _) => self
                .selected_blocks(task)
                .map(|b| task.splitting.estimate_jobs(b.files, b.events, b.lumis))
                .sum(),
            (None, Some(generation)) => task.splitting.estimate_jobs(0, generation.total_events, 0),
            (None, None) => 0,
        }
    }
}

/// Read-only source of workflow specs.
#[async_trait]
pub trait SpecStore: Send + Sync {
    /// Fetch and parse the spec published at `spec_url`.
    async fn get_spec(&self, spec_url: &str) -> Result<WorkflowSpec>;
}

/// In-memory spec store, keyed by spec URL.
#[derive(Default)]
pub struct MemorySpecStore {
    specs: RwLock<HashMap<String, WorkflowSpec>>,
}

impl MemorySpecStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish a spec under its `spec_url`.
    pub async fn publish(&self, spec: WorkflowSpec) {
        self.specs.write().await.insert(spec.spec_url.clone(), spec);
    }
}

#[async_trait]
impl SpecStore for MemorySpecStore {
    async fn get_spec(&self, spec_url: &str) -> Result<WorkflowSpec> {
        self.specs
            .read()
            .await
            .get(spec_url)
            .cloned()
            .ok_or_else(|| QueueError::Configuration(format!("no spec published at '{}'", spec_url)))
    }
}

/// Spec store over a directory of JSON files.
///
/// A spec URL is resolved relative to the directory; a `file://` prefix is
/// ignored.
#[derive(Debug, Clone)]
pub struct FileSpecStore {
    root: PathBuf,
}

impl FileSpecStore {
    /// Serve specs from `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn resolve(&self, spec_url: &str) -> PathBuf {
        self.root.join(spec_url.trim_start_matches("file://"))
    }

    /// Every `*.json` spec in the directory, sorted by file name.
    pub async fn list_specs(&self) -> Result<Vec<WorkflowSpec>> {
        let mut entries = tokio::fs::read_dir(&self.root).await.map_err(|e| {
            QueueError::Configuration(format!("cannot read spec dir {}: {}", self.root.display(), e))
        })?;
        let mut paths = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| QueueError::store("read_spec_dir", e.to_string()))?
        {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "json") {
                paths.push(path);
            }
        }
        paths.sort();

        let mut specs = Vec::with_capacity(paths.len());
        for path in paths {
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            specs.push(self.get_spec(&name).await?);
        }
        Ok(specs)
    }
}

#[async_trait]
impl SpecStore for FileSpecStore {
    async fn get_spec(&self, spec_url: &str) -> Result<WorkflowSpec> {
        let path = self.resolve(spec_url);
        let raw = match tokio::fs::read_to_string(&path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(QueueError::Configuration(format!(
                    "no spec published at '{}'",
                    spec_url
                )));
            }
            Err(e) => return Err(QueueError::store("read_spec", e.to_string())),
        };
        serde_json::from_str(&raw)
            .map_err(|e| QueueError::invalid_spec(spec_url, format!("malformed spec: {}", e)))
    }
}
