// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! WorkQueue daemon
//!
//! Runs one queue of the hierarchy:
//! - housekeeping (reclaim, re-split, roll up, archive, purge)
//! - for the global queue, queues every spec found in the spec directory
//! - for a local queue, the sync loop against the parent queue's store

use std::sync::Arc;

use anyhow::Result;
use tracing::{error, info, warn};

use workqueue_core::config::Config;
use workqueue_core::hierarchy::{LocalQueueSync, NoopJobController, SyncConfig};
use workqueue_core::housekeeping::{HousekeepingConfig, HousekeepingWorker};
use workqueue_core::oracle::{LocationCache, ResourceOracle, StaticOracle};
use workqueue_core::persistence::SqliteBackend;
use workqueue_core::policy::{StartPolicyArgs, StartPolicyKind};
use workqueue_core::queue::{QueueParams, WorkQueue};
use workqueue_core::spec::{FileSpecStore, MemorySpecStore, SpecStore, WorkflowSpec};

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file (from crate directory or parent directories)
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("workqueue_core=info".parse()?),
        )
        .init();

    info!("Starting WorkQueue");

    let config = Config::from_env().map_err(|e| {
        error!("Configuration error: {}", e);
        e
    })?;

    info!(
        queue = %config.queue_url,
        parent = config.parent_url.as_deref().unwrap_or("-"),
        database = %config.database_url,
        "Configuration loaded"
    );

    let oracle: Arc<dyn ResourceOracle> = match &config.resources_file {
        Some(path) => Arc::new(StaticOracle::from_json_file(path)?) as Arc<dyn ResourceOracle>,
        None => {
            warn!("No resources file configured, no site has free slots or data");
            Arc::new(StaticOracle::new()) as Arc<dyn ResourceOracle>
        }
    };
    let locations = Arc::new(LocationCache::new(oracle, config.location_cache_ttl));

    let file_specs = config.spec_dir.as_ref().map(|dir| Arc::new(FileSpecStore::new(dir)));
    let specs: Arc<dyn SpecStore> = match &file_specs {
        Some(store) => store.clone() as Arc<dyn SpecStore>,
        None => Arc::new(MemorySpecStore::new()) as Arc<dyn SpecStore>,
    };

    let backend = Arc::new(SqliteBackend::connect(&config.database_url).await?);
    let queue = Arc::new(WorkQueue::new(
        backend.clone(),
        specs.clone(),
        locations.clone(),
        config.queue_params(),
    )?);
    queue.health_check().await?;
    info!("Element store ready");

    for child in &config.released_queues {
        let released = queue.release_work(child).await?;
        info!(child_queue = %child, released = released.len(), "Released decommissioned queue");
    }

    if config.is_global()
        && let Some(store) = &file_specs
    {
        for spec in store.list_specs().await? {
            let policy = default_start_policy(&spec);
            match queue.queue_work(&spec, policy.as_str(), StartPolicyArgs::default()).await {
                Ok(outcome) => info!(
                    request_name = %spec.request_name,
                    inserted = outcome.inserted.len(),
                    "Queued spec"
                ),
                Err(e) => error!(request_name = %spec.request_name, error = %e, "Failed to queue spec"),
            }
        }
    }

    let housekeeping = Arc::new(HousekeepingWorker::new(
        queue.clone(),
        HousekeepingConfig {
            poll_interval: config.housekeeping_interval,
            retention: config.retention,
            ..HousekeepingConfig::default()
        },
    ));
    let housekeeping_shutdown = housekeeping.shutdown_handle();
    let housekeeping_task = {
        let worker = housekeeping.clone();
        tokio::spawn(async move { worker.run().await })
    };

    let mut sync_task = None;
    if let (Some(parent_url), Some(parent_db)) = (&config.parent_url, &config.parent_database_url) {
        let parent_backend = Arc::new(SqliteBackend::connect(parent_db).await?);
        let parent = Arc::new(WorkQueue::new(
            parent_backend,
            specs.clone(),
            locations.clone(),
            QueueParams {
                queue_url: parent_url.clone(),
                ..config.queue_params()
            },
        )?);
        let sync = Arc::new(LocalQueueSync::new(
            queue.clone(),
            parent,
            Arc::new(NoopJobController),
            SyncConfig {
                pull_interval: config.pull_interval,
                team: config.team.clone(),
                ..SyncConfig::default()
            },
        ));
        let shutdown = sync.shutdown_handle();
        let worker = sync.clone();
        sync_task = Some((shutdown, tokio::spawn(async move { worker.run().await })));
    }

    info!("WorkQueue initialized successfully");

    tokio::signal::ctrl_c().await?;
    info!("Shutting down...");

    housekeeping_shutdown.notify_one();
    if let Some((shutdown, task)) = sync_task {
        shutdown.notify_one();
        task.await?;
    }
    housekeeping_task.await?;

    backend.pool().close().await;
    info!("Shutdown complete");

    Ok(())
}

/// Generation requests are split by event ranges, everything else by block.
fn default_start_policy(spec: &WorkflowSpec) -> StartPolicyKind {
    if spec.tasks.iter().all(|task| task.input.is_none()) {
        StartPolicyKind::MonteCarlo
    } else {
        StartPolicyKind::Block
    }
}
