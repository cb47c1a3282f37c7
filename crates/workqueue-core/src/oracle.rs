// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Site and data-location lookups.
//!
//! The [`ResourceOracle`] answers where data lives and how many job slots
//! each site has free. [`LocationCache`] wraps an oracle with an explicit
//! TTL and is owned by the queue that uses it.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::debug;

use crate::error::{QueueError, Result};

/// Data-location and resource-control lookups.
#[async_trait]
pub trait ResourceOracle: Send + Sync {
    /// Sites hosting a block of a dataset.
    async fn data_locations(&self, dataset: &str, block: &str) -> Result<Vec<String>>;

    /// Free job slots per site.
    async fn free_slots(&self) -> Result<BTreeMap<String, u64>>;
}

/// Oracle backed by a fixed table, loadable from JSON.
///
/// ```json
/// {
///   "slots": {"T1_US_FNAL": 500},
///   "locations": {"/A/B/RAW#1": ["T1_US_FNAL"]}
/// }
/// ```
#[derive(Default)]
pub struct StaticOracle {
    locations: RwLock<HashMap<String, Vec<String>>>,
    slots: RwLock<BTreeMap<String, u64>>,
    unavailable: AtomicBool,
}

#[derive(Deserialize)]
struct StaticOracleFile {
    #[serde(default)]
    slots: BTreeMap<String, u64>,
    #[serde(default)]
    locations: HashMap<String, Vec<String>>,
}

impl StaticOracle {
    /// Create an empty oracle.
    pub fn new() -> Self {
        Self::default()
    }

    /// Load slots and block locations from a JSON file.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            QueueError::Configuration(format!("cannot read resource file {:?}: {}", path, e))
        })?;
        let file: StaticOracleFile = serde_json::from_str(&raw).map_err(|e| {
            QueueError::Configuration(format!("invalid resource file {:?}: {}", path, e))
        })?;
        Ok(Self {
            locations: RwLock::new(file.locations),
            slots: RwLock::new(file.slots),
            unavailable: AtomicBool::new(false),
        })
    }

    /// Set the sites hosting a block.
    pub async fn set_locations(&self, block: &str, sites: &[&str]) {
        self.locations.write().await.insert(
            block.to_string(),
            sites.iter().map(|s| s.to_string()).collect(),
        );
    }

    /// Set the free slots of a site.
    pub async fn set_slots(&self, site: &str, slots: u64) {
        self.slots.write().await.insert(site.to_string(), slots);
    }

    /// Make every lookup fail with a transient error.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check_available(&self, operation: &str) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(QueueError::store(operation, "resource oracle unavailable"));
        }
        Ok(())
    }
}

#[async_trait]
impl ResourceOracle for StaticOracle {
    async fn data_locations(&self, _dataset: &str, block: &str) -> Result<Vec<String>> {
        self.check_available("data_locations")?;
        Ok(self
            .locations
            .read()
            .await
            .get(block)
            .cloned()
            .unwrap_or_default())
    }

    async fn free_slots(&self) -> Result<BTreeMap<String, u64>> {
        self.check_available("free_slots")?;
        Ok(self.slots.read().await.clone())
    }
}

struct CachedLocations {
    sites: Vec<String>,
    fetched_at: Instant,
}

/// Block-location cache with an explicit time-to-live.
pub struct LocationCache {
    oracle: Arc<dyn ResourceOracle>,
    ttl: Duration,
    entries: RwLock<HashMap<(String, String), CachedLocations>>,
}

impl LocationCache {
    /// Wrap `oracle`, keeping answers for `ttl`.
    pub fn new(oracle: Arc<dyn ResourceOracle>, ttl: Duration) -> Self {
        Self {
            oracle,
            ttl,
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// The oracle behind the cache.
    pub fn oracle(&self) -> &Arc<dyn ResourceOracle> {
        &self.oracle
    }

    /// Sites hosting `block`, served from cache while fresh.
    ///
    /// Lookup failures are returned to the caller and never cached.
    pub async fn locations(&self, dataset: &str, block: &str) -> Result<Vec<String>> {
        let key = (dataset.to_string(), block.to_string());
        if let Some(entry) = self.entries.read().await.get(&key)
            && entry.fetched_at.elapsed() < self.ttl
        {
            return Ok(entry.sites.clone());
        }

        let sites = self.oracle.data_locations(dataset, block).await?;
        debug!(dataset, block, sites = sites.len(), "Refreshed data location");
        self.entries.write().await.insert(
            key,
            CachedLocations {
                sites: sites.clone(),
                fetched_at: Instant::now(),
            },
        );
        Ok(sites)
    }

    /// Drop every cached entry.
    pub async fn invalidate(&self) {
        self.entries.write().await.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct CountingOracle {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl ResourceOracle for CountingOracle {
        async fn data_locations(&self, _dataset: &str, _block: &str) -> Result<Vec<String>> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(vec![format!("T2_SITE_{}", n)])
        }

        async fn free_slots(&self) -> Result<BTreeMap<String, u64>> {
            Ok(BTreeMap::new())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_cache_serves_until_ttl_expires() {
        let oracle = Arc::new(CountingOracle {
            calls: AtomicUsize::new(0),
        });
        let cache = LocationCache::new(oracle.clone(), Duration::from_secs(60));

        let first = cache.locations("/A/B/RAW", "/A/B/RAW#1").await.unwrap();
        let second = cache.locations("/A/B/RAW", "/A/B/RAW#1").await.unwrap();
        assert_eq!(first, second);
        assert_eq!(oracle.calls.load(Ordering::SeqCst), 1);

        tokio::time::advance(Duration::from_secs(61)).await;
        let third = cache.locations("/A/B/RAW", "/A/B/RAW#1").await.unwrap();
        assert_ne!(first, third);
        assert_eq!(oracle.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_invalidate_forces_refresh() {
        let oracle = Arc::new(CountingOracle {
            calls: AtomicUsize::new(0),
        });
        let cache = LocationCache::new(oracle.clone(), Duration::from_secs(3600));
        cache.locations("/A/B/RAW", "b").await.unwrap();
        cache.invalidate().await;
        cache.locations("/A/B/RAW", "b").await.unwrap();
        assert_eq!(oracle.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_failures_are_not_cached() {
        let oracle = Arc::new(StaticOracle::new());
        oracle.set_locations("b", &["T1_US_FNAL"]).await;
        let cache = LocationCache::new(oracle.clone(), Duration::from_secs(3600));

        oracle.set_unavailable(true);
        let err = cache.locations("/A/B/RAW", "b").await.unwrap_err();
        assert!(err.is_retryable());

        oracle.set_unavailable(false);
        assert_eq!(
            cache.locations("/A/B/RAW", "b").await.unwrap(),
            vec!["T1_US_FNAL"]
        );
    }

    #[test]
    fn test_static_oracle_from_json_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("resources.json");
        std::fs::write(
            &path,
            r#"{"slots": {"T1_US_FNAL": 5}, "locations": {"b1": ["T1_US_FNAL"]}}"#,
        )
        .unwrap();
        let oracle = StaticOracle::from_json_file(&path).unwrap();
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        rt.block_on(async {
            assert_eq!(oracle.free_slots().await.unwrap()["T1_US_FNAL"], 5);
            assert_eq!(
                oracle.data_locations("ds", "b1").await.unwrap(),
                vec!["T1_US_FNAL"]
            );
        });
    }

    #[test]
    fn test_static_oracle_rejects_bad_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("resources.json");
        std::fs::write(&path, "not json").unwrap();
        assert!(matches!(
            StaticOracle::from_json_file(&path),
            Err(QueueError::Configuration(_))
        ));
    }
}
