use crate::errors::{RollupError, RollupResult};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

const DEFAULT_POLL_INTERVAL_SECONDS: u64 = 30;
const DEFAULT_SAFETY_MARGIN_SECONDS: i64 = 300;
const DEFAULT_LEASE_SECONDS: i64 = 120;
const DEFAULT_LEASE_RENEW_TIMEOUT_MS: u64 = 5_000;
const DEFAULT_QUERY_TIMEOUT_SECONDS: u64 = 30;
const DEFAULT_WORKER_CONCURRENCY: usize = 4;
const DEFAULT_MAX_WINDOWS_PER_CYCLE: u32 = 16;
const DEFAULT_MAX_BACKOFF_MS: u64 = 15 * 60 * 1000;
const DEFAULT_STORE_RETRY_ATTEMPTS: u32 = 3;
const DEFAULT_STORE_RETRY_BACKOFF_MS: u64 = 200;
const DEFAULT_RUN_RETENTION_DAYS: i64 = 30;
const RUN_RETENTION_DAYS_MIN: i64 = 1;
const RUN_RETENTION_DAYS_MAX: i64 = 3650;
const LEASE_SAFETY_FACTOR: u64 = 2;

/// Engine settings shared by the manager, runner and lock.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RollupConfig {
    #[serde(default = "default_poll_interval_seconds")]
    pub poll_interval_seconds: u64,
    #[serde(default = "default_safety_margin_seconds")]
    pub safety_margin_seconds: i64,
    #[serde(default = "default_lease_seconds")]
    pub lease_seconds: i64,
    #[serde(default = "default_lease_renew_timeout_ms")]
    pub lease_renew_timeout_ms: u64,
    #[serde(default = "default_query_timeout_seconds")]
    pub query_timeout_seconds: u64,
    #[serde(default = "default_worker_concurrency")]
    pub worker_concurrency: usize,
    #[serde(default = "default_max_windows_per_cycle")]
    pub max_windows_per_cycle: u32,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    #[serde(default = "default_store_retry_attempts")]
    pub store_retry_attempts: u32,
    #[serde(default = "default_store_retry_backoff_ms")]
    pub store_retry_backoff_ms: u64,
    #[serde(default = "default_run_retention_days")]
    pub run_retention_days: i64,
    /// Lock holder identity; generated per process when absent.
    #[serde(default)]
    pub holder_id: Option<String>,
}

impl Default for RollupConfig {
    fn default() -> Self {
        Self {
            poll_interval_seconds: DEFAULT_POLL_INTERVAL_SECONDS,
            safety_margin_seconds: DEFAULT_SAFETY_MARGIN_SECONDS,
            lease_seconds: DEFAULT_LEASE_SECONDS,
            lease_renew_timeout_ms: DEFAULT_LEASE_RENEW_TIMEOUT_MS,
            query_timeout_seconds: DEFAULT_QUERY_TIMEOUT_SECONDS,
            worker_concurrency: DEFAULT_WORKER_CONCURRENCY,
            max_windows_per_cycle: DEFAULT_MAX_WINDOWS_PER_CYCLE,
            max_backoff_ms: DEFAULT_MAX_BACKOFF_MS,
            store_retry_attempts: DEFAULT_STORE_RETRY_ATTEMPTS,
            store_retry_backoff_ms: DEFAULT_STORE_RETRY_BACKOFF_MS,
            run_retention_days: DEFAULT_RUN_RETENTION_DAYS,
            holder_id: None,
        }
    }
}

impl RollupConfig {
    pub fn load(path: &Path) -> RollupResult<Self> {
        let raw = fs::read_to_string(path).map_err(|e| {
            RollupError::Config(format!(
                "Failed to read config '{}': {}",
                path.display(),
                e
            ))
        })?;
        let config: Self = serde_json::from_str(&raw).map_err(|e| {
            RollupError::Config(format!(
                "Failed to parse config '{}': {}",
                path.display(),
                e
            ))
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> RollupResult<()> {
        if self.poll_interval_seconds == 0 {
            return Err(RollupError::Config(
                "pollIntervalSeconds must be > 0".to_string(),
            ));
        }
        if self.safety_margin_seconds < 0 {
            return Err(RollupError::Config(
                "safetyMarginSeconds cannot be negative".to_string(),
            ));
        }
        if self.lease_seconds <= 0 {
            return Err(RollupError::Config("leaseSeconds must be > 0".to_string()));
        }
        if self.query_timeout_seconds == 0 {
            return Err(RollupError::Config(
                "queryTimeoutSeconds must be > 0".to_string(),
            ));
        }
        let min_lease = self
            .query_timeout_seconds
            .saturating_mul(LEASE_SAFETY_FACTOR);
        if (self.lease_seconds as u64) < min_lease {
            return Err(RollupError::Config(format!(
                "leaseSeconds ({}) must be at least {}x queryTimeoutSeconds ({})",
                self.lease_seconds, LEASE_SAFETY_FACTOR, self.query_timeout_seconds
            )));
        }
        if self.lease_renew_timeout_ms == 0
            || self.lease_renew_timeout_ms >= (self.lease_seconds as u64).saturating_mul(1000)
        {
            return Err(RollupError::Config(
                "leaseRenewTimeoutMs must be > 0 and shorter than the lease".to_string(),
            ));
        }
        if self.worker_concurrency == 0 {
            return Err(RollupError::Config(
                "workerConcurrency must be >= 1".to_string(),
            ));
        }
        if self.max_windows_per_cycle == 0 {
            return Err(RollupError::Config(
                "maxWindowsPerCycle must be >= 1".to_string(),
            ));
        }
        if self.store_retry_attempts == 0 {
            return Err(RollupError::Config(
                "storeRetryAttempts must be >= 1".to_string(),
            ));
        }
        if !(RUN_RETENTION_DAYS_MIN..=RUN_RETENTION_DAYS_MAX).contains(&self.run_retention_days) {
            return Err(RollupError::Config(format!(
                "runRetentionDays must be between {} and {}",
                RUN_RETENTION_DAYS_MIN, RUN_RETENTION_DAYS_MAX
            )));
        }
        if let Some(holder) = &self.holder_id {
            if holder.trim().is_empty() {
                return Err(RollupError::Config("holderId cannot be blank".to_string()));
            }
        }
        Ok(())
    }

    pub fn holder_id(&self) -> String {
        self.holder_id
            .as_ref()
            .map(|value| value.trim().to_string())
            .unwrap_or_else(|| format!("rollup-manager-{}", uuid::Uuid::new_v4()))
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_seconds)
    }

    pub fn query_timeout(&self) -> Duration {
        Duration::from_secs(self.query_timeout_seconds)
    }

    pub fn lease_renew_timeout(&self) -> Duration {
        Duration::from_millis(self.lease_renew_timeout_ms)
    }

    pub fn lease(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.lease_seconds)
    }

    pub fn safety_margin(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.safety_margin_seconds)
    }
}

fn default_poll_interval_seconds() -> u64 {
    DEFAULT_POLL_INTERVAL_SECONDS
}

fn default_safety_margin_seconds() -> i64 {
    DEFAULT_SAFETY_MARGIN_SECONDS
}

fn default_lease_seconds() -> i64 {
    DEFAULT_LEASE_SECONDS
}

fn default_lease_renew_timeout_ms() -> u64 {
    DEFAULT_LEASE_RENEW_TIMEOUT_MS
}

fn default_query_timeout_seconds() -> u64 {
    DEFAULT_QUERY_TIMEOUT_SECONDS
}

fn default_worker_concurrency() -> usize {
    DEFAULT_WORKER_CONCURRENCY
}

fn default_max_windows_per_cycle() -> u32 {
    DEFAULT_MAX_WINDOWS_PER_CYCLE
}

fn default_max_backoff_ms() -> u64 {
    DEFAULT_MAX_BACKOFF_MS
}

fn default_store_retry_attempts() -> u32 {
    DEFAULT_STORE_RETRY_ATTEMPTS
}

fn default_store_retry_backoff_ms() -> u64 {
    DEFAULT_STORE_RETRY_BACKOFF_MS
}

fn default_run_retention_days() -> i64 {
    DEFAULT_RUN_RETENTION_DAYS
}
