// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for workqueue-core integration tests.
//!
//! Provides spec builders and a `TestContext` wiring a queue to an in-memory
//! (or SQLite) store, a static oracle and a shared spec store.

#![allow(dead_code)]

use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use workqueue_core::element::Element;
use workqueue_core::error::{QueueError, Result};
use workqueue_core::oracle::{LocationCache, StaticOracle};
use workqueue_core::persistence::{
    Change, ElementFilter, MemoryBackend, QueueBackend, QueueDb, SqliteBackend,
};
use workqueue_core::queue::{QueueParams, WorkQueue};
use workqueue_core::spec::{
    Block, Generation, InputDataset, MemorySpecStore, SplittingAlgorithm, TaskSpec, WorkflowSpec,
};

pub const FNAL: &str = "T1_US_FNAL";
pub const CERN: &str = "T2_CH_CERN";
pub const DESY: &str = "T2_DE_DESY";

pub const DATASET: &str = "/Primary/Processed/RAW";

/// Block name within the test dataset.
pub fn block_name(n: u32) -> String {
    format!("{}#{}", DATASET, n)
}

/// A block with `files` files, 1000 events and 5 lumis per file.
pub fn block(n: u32, files: u64) -> Block {
    Block {
        name: block_name(n),
        files,
        events: files * 1000,
        lumis: files * 5,
        runs: BTreeSet::from([1]),
    }
}

/// Processing spec over `blocks`, 10 files per job.
pub fn data_spec(request: &str, blocks: Vec<Block>) -> WorkflowSpec {
    WorkflowSpec {
        request_name: request.to_string(),
        spec_url: format!("specs/{}", request),
        priority: 1,
        team: None,
        site_whitelist: BTreeSet::new(),
        site_blacklist: BTreeSet::new(),
        block_whitelist: BTreeSet::new(),
        block_blacklist: BTreeSet::new(),
        run_whitelist: BTreeSet::new(),
        run_blacklist: BTreeSet::new(),
        tasks: vec![TaskSpec {
            name: format!("/{}/DataProcessing", request),
            input: Some(InputDataset {
                name: DATASET.to_string(),
                blocks,
            }),
            generation: None,
            splitting: SplittingAlgorithm::FileBased { files_per_job: 10 },
        }],
    }
}

/// Generation spec of `total_events`, 100 events per job, runnable at `sites`.
pub fn mc_spec(request: &str, total_events: u64, sites: &[&str]) -> WorkflowSpec {
    let mut spec = data_spec(request, Vec::new());
    spec.tasks[0].name = format!("/{}/Production", request);
    spec.tasks[0].input = None;
    spec.tasks[0].generation = Some(Generation {
        total_events,
        events_per_lumi: 100,
        first_event: 1,
        first_lumi: 1,
    });
    spec.tasks[0].splitting = SplittingAlgorithm::EventBased { events_per_job: 100 };
    spec.site_whitelist = sites.iter().map(|s| s.to_string()).collect();
    spec
}

/// Queue parameters with short timeouts.
pub fn params(queue_url: &str) -> QueueParams {
    QueueParams {
        queue_url: queue_url.to_string(),
        backend_timeout: Duration::from_secs(5),
        ..QueueParams::default()
    }
}

/// In-memory store whose listings fail with a transient error on demand.
#[derive(Default)]
pub struct FlakyBackend {
    inner: MemoryBackend,
    failures: AtomicU32,
}

impl FlakyBackend {
    /// Fail the next `n` listings.
    pub fn fail_next(&self, n: u32) {
        self.failures.store(n, Ordering::SeqCst);
    }

    fn should_fail(&self) -> bool {
        self.failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl QueueBackend for FlakyBackend {
    async fn insert_elements(&self, db: QueueDb, elements: Vec<Element>) -> Result<Vec<String>> {
        self.inner.insert_elements(db, elements).await
    }

    async fn get_element(&self, db: QueueDb, id: &str) -> Result<Option<Element>> {
        self.inner.get_element(db, id).await
    }

    async fn list_elements(&self, db: QueueDb, filter: &ElementFilter) -> Result<Vec<Element>> {
        if self.should_fail() {
            return Err(QueueError::TransientStore {
                operation: "list_elements".to_string(),
                details: "connection reset".to_string(),
            });
        }
        self.inner.list_elements(db, filter).await
    }

    async fn update_element(&self, db: QueueDb, element: &Element) -> Result<bool> {
        self.inner.update_element(db, element).await
    }

    async fn delete_elements(&self, db: QueueDb, ids: &[String]) -> Result<u64> {
        self.inner.delete_elements(db, ids).await
    }

    async fn poll_changes(&self, since: u64, limit: u32) -> Result<(Vec<Change>, u64)> {
        self.inner.poll_changes(since, limit).await
    }

    async fn prune_changes(&self, before: DateTime<Utc>) -> Result<u64> {
        self.inner.prune_changes(before).await
    }

    async fn health_check(&self) -> Result<()> {
        self.inner.health_check().await
    }
}

/// A queue plus the collaborators tests poke at.
pub struct TestContext {
    pub queue: Arc<WorkQueue>,
    pub backend: Arc<dyn QueueBackend>,
    pub oracle: Arc<StaticOracle>,
    pub specs: Arc<MemorySpecStore>,
}

impl TestContext {
    /// Queue over an in-memory backend with its own oracle and spec store.
    pub fn memory(queue_url: &str) -> Self {
        Self::build(
            Arc::new(MemoryBackend::new()),
            Arc::new(StaticOracle::new()),
            Arc::new(MemorySpecStore::new()),
            params(queue_url),
        )
    }

    /// Queue over an in-memory SQLite database.
    pub async fn sqlite(queue_url: &str) -> Self {
        let backend = SqliteBackend::connect("sqlite::memory:")
            .await
            .expect("Failed to open SQLite store");
        Self::build(
            Arc::new(backend),
            Arc::new(StaticOracle::new()),
            Arc::new(MemorySpecStore::new()),
            params(queue_url),
        )
    }

    /// Another queue sharing this context's oracle and spec store.
    pub fn sibling(&self, queue_url: &str) -> Self {
        Self::build(
            Arc::new(MemoryBackend::new()),
            self.oracle.clone(),
            self.specs.clone(),
            params(queue_url),
        )
    }

    /// Queue over a store that can be told to fail.
    pub fn flaky(queue_url: &str) -> (Self, Arc<FlakyBackend>) {
        let store = Arc::new(FlakyBackend::default());
        let ctx = Self::build(
            store.clone(),
            Arc::new(StaticOracle::new()),
            Arc::new(MemorySpecStore::new()),
            params(queue_url),
        );
        (ctx, store)
    }

    /// Queue with custom parameters.
    pub fn with_params(queue_params: QueueParams) -> Self {
        Self::build(
            Arc::new(MemoryBackend::new()),
            Arc::new(StaticOracle::new()),
            Arc::new(MemorySpecStore::new()),
            queue_params,
        )
    }

    fn build(
        backend: Arc<dyn QueueBackend>,
        oracle: Arc<StaticOracle>,
        specs: Arc<MemorySpecStore>,
        queue_params: QueueParams,
    ) -> Self {
        let locations = Arc::new(LocationCache::new(oracle.clone(), Duration::from_secs(3600)));
        let queue = Arc::new(
            WorkQueue::new(backend.clone(), specs.clone(), locations, queue_params)
                .expect("Failed to create queue"),
        );
        Self {
            queue,
            backend,
            oracle,
            specs,
        }
    }

    /// Place blocks at sites.
    pub async fn locate(&self, blocks: &[(u32, &[&str])]) {
        for (n, sites) in blocks {
            self.oracle.set_locations(&block_name(*n), sites).await;
        }
    }

    /// Publish a spec so downstream queues can fetch it.
    pub async fn publish(&self, spec: &WorkflowSpec) {
        self.specs.publish(spec.clone()).await;
    }
}
