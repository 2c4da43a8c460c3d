//! Configuration types

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{ConfigError, ReverieResult};
use crate::quota::{QuotaLimits, ResetSchedule};

const MIB: u64 = 1024 * 1024;

/// In-process LRU budget.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryTierConfig {
    pub max_bytes: u64,
}

impl Default for MemoryTierConfig {
    fn default() -> Self {
        Self { max_bytes: 32 * MIB }
    }
}

/// On-device persistent store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocalTierConfig {
    /// Directory holding `blobs/` and the `index` environment.
    pub root_dir: PathBuf,
    pub max_bytes: u64,
    /// Entries older than this are swept regardless of size pressure.
    pub max_age_secs: u64,
    /// Size sweeps evict down to `max_bytes * target_fraction`.
    pub target_fraction: f64,
    /// LMDB map size for the index.
    pub index_map_size: usize,
    pub sweep_interval_secs: u64,
}

impl LocalTierConfig {
    pub fn new(root_dir: impl Into<PathBuf>) -> Self {
        Self {
            root_dir: root_dir.into(),
            max_bytes: 256 * MIB,
            max_age_secs: 30 * 24 * 60 * 60,
            target_fraction: 0.8,
            index_map_size: 64 * MIB as usize,
            sweep_interval_secs: 3600,
        }
    }

    pub fn max_age(&self) -> Duration {
        Duration::from_secs(self.max_age_secs)
    }

    pub fn target_bytes(&self) -> u64 {
        (self.max_bytes as f64 * self.target_fraction) as u64
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

/// Shared remote store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteTierConfig {
    pub enabled: bool,
    pub base_url: Option<String>,
    /// Bound on lookup plus download; exceeding it counts as a miss.
    pub timeout_ms: u64,
}

impl Default for RemoteTierConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            base_url: None,
            timeout_ms: 5_000,
        }
    }
}

impl RemoteTierConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct QuotaConfig {
    pub limits: QuotaLimits,
    pub reset: ResetSchedule,
}

/// Batch preload behaviour.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PreloadConfig {
    pub concurrency: usize,
    /// Minimum pause between chunks. The governor's spacing applies on top.
    pub batch_pause_ms: u64,
    /// Rate-limit waits longer than this are not retried inside a preload.
    pub max_retry_wait_ms: u64,
}

impl Default for PreloadConfig {
    fn default() -> Self {
        Self {
            concurrency: 3,
            batch_pause_ms: 250,
            max_retry_wait_ms: 10_000,
        }
    }
}

impl PreloadConfig {
    pub fn batch_pause(&self) -> Duration {
        Duration::from_millis(self.batch_pause_ms)
    }

    pub fn max_retry_wait(&self) -> Duration {
        Duration::from_millis(self.max_retry_wait_ms)
    }
}

/// Top-level configuration for one cache instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReverieConfig {
    pub memory: MemoryTierConfig,
    pub local: LocalTierConfig,
    pub remote: RemoteTierConfig,
    pub quota: QuotaConfig,
    pub preload: PreloadConfig,
}

impl ReverieConfig {
    /// Defaults with the local tier rooted at `root_dir`.
    pub fn default_for(root_dir: impl AsRef<Path>) -> Self {
        Self {
            memory: MemoryTierConfig::default(),
            local: LocalTierConfig::new(root_dir.as_ref()),
            remote: RemoteTierConfig::default(),
            quota: QuotaConfig::default(),
            preload: PreloadConfig::default(),
        }
    }

    /// Create a config from environment variables, falling back to defaults.
    ///
    /// Environment variables:
    /// - `REVERIE_CACHE_DIR`: local tier root (default: `$TMPDIR/reverie`)
    /// - `REVERIE_MEMORY_MAX_BYTES`: memory budget (default: 32 MiB)
    /// - `REVERIE_LOCAL_MAX_BYTES`: local budget (default: 256 MiB)
    /// - `REVERIE_LOCAL_MAX_AGE_SECS`: age sweep threshold (default: 30 days)
    /// - `REVERIE_LOCAL_TARGET_FRACTION`: size sweep target (default: 0.8)
    /// - `REVERIE_REMOTE_URL`: enables the HTTP remote tier
    /// - `REVERIE_REMOTE_TIMEOUT_MS`: remote lookup timeout (default: 5000)
    /// - `REVERIE_QUOTA_TIER`: "free" or "paid" (default: free)
    /// - `REVERIE_QUOTA_DAILY_LIMIT`: overrides the tier's daily limit
    /// - `REVERIE_QUOTA_TIMEZONE`: IANA zone for the reset (default: America/Los_Angeles)
    /// - `REVERIE_QUOTA_RESET_HOUR`: local hour of the reset (default: 0)
    /// - `REVERIE_PRELOAD_CONCURRENCY`: preload chunk size (default: 3)
    pub fn from_env() -> Self {
        let root_dir = std::env::var("REVERIE_CACHE_DIR")
            .ok()
            .map(PathBuf::from)
            .unwrap_or_else(|| std::env::temp_dir().join("reverie"));
        let mut config = Self::default_for(root_dir);

        if let Some(v) = env_parse("REVERIE_MEMORY_MAX_BYTES") {
            config.memory.max_bytes = v;
        }
        if let Some(v) = env_parse("REVERIE_LOCAL_MAX_BYTES") {
            config.local.max_bytes = v;
        }
        if let Some(v) = env_parse("REVERIE_LOCAL_MAX_AGE_SECS") {
            config.local.max_age_secs = v;
        }
        if let Some(v) = env_parse("REVERIE_LOCAL_TARGET_FRACTION") {
            config.local.target_fraction = v;
        }

        let remote_url = std::env::var("REVERIE_REMOTE_URL")
            .ok()
            .map(|s| s.trim().trim_end_matches('/').to_string())
            .filter(|s| !s.is_empty());
        config.remote.enabled = remote_url.is_some();
        config.remote.base_url = remote_url;
        if let Some(v) = env_parse("REVERIE_REMOTE_TIMEOUT_MS") {
            config.remote.timeout_ms = v;
        }

        if let Some(limits) = std::env::var("REVERIE_QUOTA_TIER")
            .ok()
            .and_then(|s| QuotaLimits::by_name(&s))
        {
            config.quota.limits = limits;
        }
        if let Some(v) = env_parse("REVERIE_QUOTA_DAILY_LIMIT") {
            config.quota.limits.daily_limit = v;
        }
        if let Some(tz) = env_parse("REVERIE_QUOTA_TIMEZONE") {
            config.quota.reset.timezone = tz;
        }
        if let Some(v) = env_parse("REVERIE_QUOTA_RESET_HOUR") {
            config.quota.reset.hour = v;
        }
        if let Some(v) = env_parse("REVERIE_PRELOAD_CONCURRENCY") {
            config.preload.concurrency = v;
        }

        config
    }

    /// Validate configuration values.
    pub fn validate(&self) -> ReverieResult<()> {
        if self.memory.max_bytes == 0 {
            return Err(ConfigError::invalid(
                "memory.max_bytes",
                self.memory.max_bytes,
                "memory budget must be greater than 0",
            )
            .into());
        }

        if self.local.max_bytes == 0 {
            return Err(ConfigError::invalid(
                "local.max_bytes",
                self.local.max_bytes,
                "local budget must be greater than 0",
            )
            .into());
        }

        if !(self.local.target_fraction > 0.0 && self.local.target_fraction <= 1.0) {
            return Err(ConfigError::invalid(
                "local.target_fraction",
                self.local.target_fraction,
                "target_fraction must be in (0.0, 1.0]",
            )
            .into());
        }

        if self.local.max_age_secs == 0 {
            return Err(ConfigError::invalid(
                "local.max_age_secs",
                self.local.max_age_secs,
                "max age must be positive",
            )
            .into());
        }

        if self.local.root_dir.as_os_str().is_empty() {
            return Err(ConfigError::MissingRequired {
                field: "local.root_dir".to_string(),
            }
            .into());
        }

        if self.remote.enabled && self.remote.base_url.is_none() {
            return Err(ConfigError::MissingRequired {
                field: "remote.base_url".to_string(),
            }
            .into());
        }

        if self.quota.limits.daily_limit == 0 {
            return Err(ConfigError::invalid(
                "quota.limits.daily_limit",
                self.quota.limits.daily_limit,
                "daily_limit must be greater than 0",
            )
            .into());
        }

        if self.quota.reset.hour > 23 || self.quota.reset.minute > 59 {
            return Err(ConfigError::invalid(
                "quota.reset",
                format!("{:02}:{:02}", self.quota.reset.hour, self.quota.reset.minute),
                "reset time must be a valid time of day",
            )
            .into());
        }

        if self.preload.concurrency == 0 {
            return Err(ConfigError::invalid(
                "preload.concurrency",
                self.preload.concurrency,
                "concurrency must be greater than 0",
            )
            .into());
        }

        Ok(())
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|s| s.trim().parse().ok())
}
