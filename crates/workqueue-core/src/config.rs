// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration loading from environment variables.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::queue::QueueParams;

/// WorkQueue daemon configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// SQLite connection URL for the element store
    pub database_url: String,
    /// Identity of this queue
    pub queue_url: String,
    /// Parent queue identity; `None` for the global queue
    pub parent_url: Option<String>,
    /// SQLite URL of the parent queue's store (required with `parent_url`)
    pub parent_database_url: Option<String>,
    /// Directory of published workflow specs
    pub spec_dir: Option<PathBuf>,
    /// Team this queue pulls work for
    pub team: Option<String>,
    /// JSON file with site slots and block locations
    pub resources_file: Option<PathBuf>,
    /// How long an element may stay Negotiating before it is reclaimed
    pub negotiation_timeout: Duration,
    /// How long an element may stay Acquired before it is reclaimed; `None` never
    pub acquired_timeout: Option<Duration>,
    /// Child queues whose held work is released at startup
    pub released_queues: Vec<String>,
    /// Housekeeping period
    pub housekeeping_interval: Duration,
    /// Pull/update period of a local queue
    pub pull_interval: Duration,
    /// How long finished requests are kept before purging
    pub retention: Duration,
    /// Bound on any single store operation
    pub backend_timeout: Duration,
    /// Default end policy success threshold (0.0-1.0)
    pub success_threshold: f64,
    /// Data location cache TTL
    pub location_cache_ttl: Duration,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Required:
    /// - `WORKQUEUE_QUEUE_URL`: identity of this queue
    ///
    /// Optional (with defaults):
    /// - `WORKQUEUE_DATABASE_URL`: SQLite URL (default: `sqlite::memory:`)
    /// - `WORKQUEUE_PARENT_URL`: parent queue identity (default: none, global queue)
    /// - `WORKQUEUE_PARENT_DATABASE_URL`: parent store, required with `WORKQUEUE_PARENT_URL`
    /// - `WORKQUEUE_SPEC_DIR`: directory of published spec JSON files (default: none)
    /// - `WORKQUEUE_TEAM`: team to pull work for (default: any)
    /// - `WORKQUEUE_RESOURCES_FILE`: slots and locations JSON (default: none)
    /// - `WORKQUEUE_NEGOTIATION_TIMEOUT_SECS` (default: 3600)
    /// - `WORKQUEUE_ACQUIRED_TIMEOUT_SECS` (default: none, Acquired work is never reclaimed)
    /// - `WORKQUEUE_RELEASE_QUEUES`: comma-separated decommissioned child queues (default: none)
    /// - `WORKQUEUE_HOUSEKEEPING_INTERVAL_SECS` (default: 300)
    /// - `WORKQUEUE_PULL_INTERVAL_SECS` (default: 120)
    /// - `WORKQUEUE_RETENTION_DAYS` (default: 30)
    /// - `WORKQUEUE_BACKEND_TIMEOUT_SECS` (default: 30)
    /// - `WORKQUEUE_SUCCESS_THRESHOLD` (default: 0.9)
    /// - `WORKQUEUE_LOCATION_CACHE_TTL_SECS` (default: 3600)
    pub fn from_env() -> Result<Self, ConfigError> {
        let queue_url = std::env::var("WORKQUEUE_QUEUE_URL")
            .map_err(|_| ConfigError::Missing("WORKQUEUE_QUEUE_URL"))?;
        if queue_url.trim().is_empty() {
            return Err(ConfigError::Invalid("WORKQUEUE_QUEUE_URL", "must not be empty"));
        }

        let database_url = std::env::var("WORKQUEUE_DATABASE_URL")
            .unwrap_or_else(|_| "sqlite::memory:".to_string());

        let success_threshold: f64 = parse_var(
            "WORKQUEUE_SUCCESS_THRESHOLD",
            "0.9",
            "must be a number between 0.0 and 1.0",
        )?;
        if !(0.0..=1.0).contains(&success_threshold) {
            return Err(ConfigError::Invalid(
                "WORKQUEUE_SUCCESS_THRESHOLD",
                "must be a number between 0.0 and 1.0",
            ));
        }

        let retention_days: u64 = parse_var(
            "WORKQUEUE_RETENTION_DAYS",
            "30",
            "must be a non-negative integer",
        )?;

        let retention = retention_days
            .checked_mul(24 * 3600)
            .map(Duration::from_secs)
            .filter(|retention| chrono::Duration::from_std(*retention).is_ok())
            .ok_or(ConfigError::Invalid("WORKQUEUE_RETENTION_DAYS", "is too large"))?;

        let acquired_timeout = match optional_var("WORKQUEUE_ACQUIRED_TIMEOUT_SECS") {
            Some(_) => Some(secs_var("WORKQUEUE_ACQUIRED_TIMEOUT_SECS", "0")?),
            None => None,
        };
        let released_queues = optional_var("WORKQUEUE_RELEASE_QUEUES")
            .map(|list| {
                list.split(',')
                    .map(str::trim)
                    .filter(|queue| !queue.is_empty())
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default();

        let parent_url = optional_var("WORKQUEUE_PARENT_URL");
        let parent_database_url = optional_var("WORKQUEUE_PARENT_DATABASE_URL");
        if parent_url.is_some() && parent_database_url.is_none() {
            return Err(ConfigError::Missing("WORKQUEUE_PARENT_DATABASE_URL"));
        }

        Ok(Self {
            database_url,
            queue_url,
            parent_url,
            parent_database_url,
            spec_dir: optional_var("WORKQUEUE_SPEC_DIR").map(PathBuf::from),
            team: optional_var("WORKQUEUE_TEAM"),
            resources_file: optional_var("WORKQUEUE_RESOURCES_FILE").map(PathBuf::from),
            negotiation_timeout: secs_var("WORKQUEUE_NEGOTIATION_TIMEOUT_SECS", "3600")?,
            acquired_timeout,
            released_queues,
            housekeeping_interval: secs_var("WORKQUEUE_HOUSEKEEPING_INTERVAL_SECS", "300")?,
            pull_interval: secs_var("WORKQUEUE_PULL_INTERVAL_SECS", "120")?,
            retention,
            backend_timeout: secs_var("WORKQUEUE_BACKEND_TIMEOUT_SECS", "30")?,
            success_threshold,
            location_cache_ttl: secs_var("WORKQUEUE_LOCATION_CACHE_TTL_SECS", "3600")?,
        })
    }

    /// Whether this queue is at the top of the hierarchy.
    pub fn is_global(&self) -> bool {
        self.parent_url.is_none()
    }

    /// Engine parameters derived from this configuration.
    pub fn queue_params(&self) -> QueueParams {
        QueueParams {
            queue_url: self.queue_url.clone(),
            negotiation_timeout: self.negotiation_timeout,
            acquired_timeout: self.acquired_timeout,
            backend_timeout: self.backend_timeout,
            success_threshold: self.success_threshold,
            ..QueueParams::default()
        }
    }
}

fn optional_var(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn parse_var<T: FromStr>(
    key: &'static str,
    default: &str,
    message: &'static str,
) -> Result<T, ConfigError> {
    std::env::var(key)
        .unwrap_or_else(|_| default.to_string())
        .parse()
        .map_err(|_| ConfigError::Invalid(key, message))
}

fn secs_var(key: &'static str, default: &str) -> Result<Duration, ConfigError> {
    let secs: u64 = parse_var(key, default, "must be a positive number of seconds")?;
    if secs == 0 {
        return Err(ConfigError::Invalid(key, "must be a positive number of seconds"));
    }
    Ok(Duration::from_secs(secs))
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    Missing(&'static str),

    /// An environment variable has an invalid value.
    #[error("invalid value for {0}: {1}")]
    Invalid(&'static str, &'static str),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use std::sync::Mutex;

    // Mutex to serialize tests that modify environment variables
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    const ALL_VARS: [&str; 16] = [
        "WORKQUEUE_DATABASE_URL",
        "WORKQUEUE_QUEUE_URL",
        "WORKQUEUE_PARENT_URL",
        "WORKQUEUE_PARENT_DATABASE_URL",
        "WORKQUEUE_SPEC_DIR",
        "WORKQUEUE_TEAM",
        "WORKQUEUE_RESOURCES_FILE",
        "WORKQUEUE_NEGOTIATION_TIMEOUT_SECS",
        "WORKQUEUE_ACQUIRED_TIMEOUT_SECS",
        "WORKQUEUE_RELEASE_QUEUES",
        "WORKQUEUE_HOUSEKEEPING_INTERVAL_SECS",
        "WORKQUEUE_PULL_INTERVAL_SECS",
        "WORKQUEUE_RETENTION_DAYS",
        "WORKQUEUE_BACKEND_TIMEOUT_SECS",
        "WORKQUEUE_SUCCESS_THRESHOLD",
        "WORKQUEUE_LOCATION_CACHE_TTL_SECS",
    ];

    struct EnvGuard {
        vars: Vec<(String, Option<String>)>,
    }

    impl EnvGuard {
        /// Start from a clean slate: every WORKQUEUE_* variable unset.
        fn new() -> Self {
            let mut guard = Self { vars: Vec::new() };
            for key in ALL_VARS {
                guard.remove(key);
            }
            guard
        }

        fn set(&mut self, key: &str, value: &str) {
            let old = env::var(key).ok();
            self.vars.push((key.to_string(), old));
            // SAFETY: Tests are serialized via ENV_MUTEX, so no concurrent access
            unsafe { env::set_var(key, value) };
        }

        fn remove(&mut self, key: &str) {
            let old = env::var(key).ok();
            self.vars.push((key.to_string(), old));
            // SAFETY: Tests are serialized via ENV_MUTEX, so no concurrent access
            unsafe { env::remove_var(key) };
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            for (key, value) in self.vars.drain(..).rev() {
                // SAFETY: Tests are serialized via ENV_MUTEX, so no concurrent access
                unsafe {
                    match value {
                        Some(v) => env::set_var(&key, v),
                        None => env::remove_var(&key),
                    }
                }
            }
        }
    }

    #[test]
    fn test_config_from_env_with_defaults() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::new();
        guard.set("WORKQUEUE_QUEUE_URL", "global");

        let config = Config::from_env().unwrap();

        assert_eq!(config.queue_url, "global");
        assert_eq!(config.database_url, "sqlite::memory:");
        assert!(config.is_global());
        assert!(config.team.is_none());
        assert_eq!(config.negotiation_timeout, Duration::from_secs(3600));
        assert!(config.acquired_timeout.is_none());
        assert!(config.released_queues.is_empty());
        assert_eq!(config.housekeeping_interval, Duration::from_secs(300));
        assert_eq!(config.pull_interval, Duration::from_secs(120));
        assert_eq!(config.retention, Duration::from_secs(30 * 24 * 3600));
        assert_eq!(config.backend_timeout, Duration::from_secs(30));
        assert_eq!(config.success_threshold, 0.9);
        assert_eq!(config.location_cache_ttl, Duration::from_secs(3600));
    }

    #[test]
    fn test_config_from_env_local_queue() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::new();
        guard.set("WORKQUEUE_QUEUE_URL", "local-fnal");
        guard.set("WORKQUEUE_PARENT_URL", "global");
        guard.set("WORKQUEUE_PARENT_DATABASE_URL", "sqlite:global.db");
        guard.set("WORKQUEUE_TEAM", "production");
        guard.set("WORKQUEUE_DATABASE_URL", "sqlite:queue.db?mode=rwc");
        guard.set("WORKQUEUE_NEGOTIATION_TIMEOUT_SECS", "60");
        guard.set("WORKQUEUE_SUCCESS_THRESHOLD", "0.5");

        let config = Config::from_env().unwrap();

        assert!(!config.is_global());
        assert_eq!(config.parent_url.as_deref(), Some("global"));
        assert_eq!(config.parent_database_url.as_deref(), Some("sqlite:global.db"));
        assert_eq!(config.team.as_deref(), Some("production"));
        assert_eq!(config.database_url, "sqlite:queue.db?mode=rwc");

        let params = config.queue_params();
        assert_eq!(params.queue_url, "local-fnal");
        assert_eq!(params.negotiation_timeout, Duration::from_secs(60));
        assert_eq!(params.success_threshold, 0.5);
    }

    #[test]
    fn test_config_missing_queue_url() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let _guard = EnvGuard::new();

        let err = Config::from_env().unwrap_err();
        assert!(matches!(err, ConfigError::Missing("WORKQUEUE_QUEUE_URL")));
        assert!(err.to_string().contains("WORKQUEUE_QUEUE_URL"));
    }

    #[test]
    fn test_config_parent_needs_its_store() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::new();
        guard.set("WORKQUEUE_QUEUE_URL", "local-fnal");
        guard.set("WORKQUEUE_PARENT_URL", "global");

        let err = Config::from_env().unwrap_err();
        assert!(matches!(err, ConfigError::Missing("WORKQUEUE_PARENT_DATABASE_URL")));
    }

    #[test]
    fn test_config_invalid_timeout() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::new();
        guard.set("WORKQUEUE_QUEUE_URL", "global");
        guard.set("WORKQUEUE_NEGOTIATION_TIMEOUT_SECS", "soon");

        let err = Config::from_env().unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid("WORKQUEUE_NEGOTIATION_TIMEOUT_SECS", _)
        ));

        guard.set("WORKQUEUE_NEGOTIATION_TIMEOUT_SECS", "0");
        assert!(Config::from_env().is_err());
    }

    #[test]
    fn test_config_threshold_out_of_range() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::new();
        guard.set("WORKQUEUE_QUEUE_URL", "global");
        guard.set("WORKQUEUE_SUCCESS_THRESHOLD", "1.5");

        let err = Config::from_env().unwrap_err();
        assert!(matches!(err, ConfigError::Invalid("WORKQUEUE_SUCCESS_THRESHOLD", _)));
    }

    #[test]
    fn test_config_acquired_timeout_and_released_queues() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::new();
        guard.set("WORKQUEUE_QUEUE_URL", "global");
        guard.set("WORKQUEUE_ACQUIRED_TIMEOUT_SECS", "7200");
        guard.set("WORKQUEUE_RELEASE_QUEUES", "local-old, ,local-gone");

        let config = Config::from_env().unwrap();
        assert_eq!(config.acquired_timeout, Some(Duration::from_secs(7200)));
        assert_eq!(config.released_queues, vec!["local-old", "local-gone"]);
        assert_eq!(
            config.queue_params().acquired_timeout,
            Some(Duration::from_secs(7200))
        );

        guard.set("WORKQUEUE_ACQUIRED_TIMEOUT_SECS", "0");
        let err = Config::from_env().unwrap_err();
        assert!(matches!(err, ConfigError::Invalid("WORKQUEUE_ACQUIRED_TIMEOUT_SECS", _)));
    }

    #[test]
    fn test_config_retention_overflow_is_rejected() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::new();
        guard.set("WORKQUEUE_QUEUE_URL", "global");
        guard.set("WORKQUEUE_RETENTION_DAYS", &u64::MAX.to_string());

        let err = Config::from_env().unwrap_err();
        assert!(matches!(err, ConfigError::Invalid("WORKQUEUE_RETENTION_DAYS", _)));

        // Fits in u64 seconds but not in a timestamp offset.
        guard.set("WORKQUEUE_RETENTION_DAYS", "100000000000000");
        assert!(Config::from_env().is_err());

        guard.set("WORKQUEUE_RETENTION_DAYS", "0");
        assert_eq!(Config::from_env().unwrap().retention, Duration::ZERO);
    }
}
