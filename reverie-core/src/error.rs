//! Error types for Reverie operations

use chrono::{DateTime, Utc};
use std::time::Duration;
use thiserror::Error;

use crate::CacheKey;

/// Which cache tier an error or hit originated from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum TierKind {
    Memory,
    Local,
    Remote,
}

impl TierKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Memory => "memory",
            Self::Local => "local",
            Self::Remote => "remote",
        }
    }
}

impl std::fmt::Display for TierKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Cache tier errors. Never surfaced across the public fetch boundary.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TierError {
    #[error("{tier} tier unavailable: {reason}")]
    Unavailable { tier: TierKind, reason: String },

    #[error("Corrupt {tier} entry for key {key}: {reason}")]
    CorruptEntry {
        tier: TierKind,
        key: CacheKey,
        reason: String,
    },

    #[error("Artifact of {size} bytes exceeds {tier} budget of {budget} bytes")]
    TooLarge { tier: TierKind, size: u64, budget: u64 },

    #[error("I/O error in {tier} tier: {reason}")]
    Io { tier: TierKind, reason: String },

    #[error("Serialization error: {reason}")]
    Serialization { reason: String },

    #[error("{tier} tier lock poisoned")]
    LockPoisoned { tier: TierKind },
}

impl TierError {
    pub fn unavailable(tier: TierKind, reason: impl Into<String>) -> Self {
        Self::Unavailable {
            tier,
            reason: reason.into(),
        }
    }

    pub fn io(tier: TierKind, err: impl std::fmt::Display) -> Self {
        Self::Io {
            tier,
            reason: err.to_string(),
        }
    }
}

/// Reasons the quota governor refuses a generation call.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum QuotaDenial {
    #[error("Daily quota exceeded ({daily_count}/{daily_limit}), resets at {resets_at}")]
    QuotaExceeded {
        daily_count: u32,
        daily_limit: u32,
        resets_at: DateTime<Utc>,
    },

    #[error("Rate limited, retry in {wait:?}")]
    RateLimited { wait: Duration },

    #[error("Provider backoff in effect, retry in {wait:?}")]
    Backoff { wait: Duration },
}

impl QuotaDenial {
    /// How long the caller should wait before trying again.
    pub fn wait(&self, now: DateTime<Utc>) -> Duration {
        match self {
            Self::QuotaExceeded { resets_at, .. } => (*resets_at - now)
                .to_std()
                .unwrap_or(Duration::ZERO),
            Self::RateLimited { wait } | Self::Backoff { wait } => *wait,
        }
    }
}

/// Failures reported by a generation provider.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum GenerationError {
    #[error("{provider} reported its quota is exhausted: {message}")]
    ProviderQuotaExceeded { provider: String, message: String },

    #[error("{provider} rate limited the request, retry after {retry_after_ms}ms")]
    ProviderRateLimited {
        provider: String,
        retry_after_ms: i64,
    },

    #[error("{provider} failed: {message}")]
    Provider { provider: String, message: String },

    #[error("Network error: {reason}")]
    Network { reason: String },

    #[error("Invalid output from {provider}: {reason}")]
    InvalidOutput { provider: String, reason: String },
}

impl GenerationError {
    /// Quota and rate-limit rejections feed the governor's backoff window.
    pub fn is_provider_quota(&self) -> bool {
        matches!(
            self,
            Self::ProviderQuotaExceeded { .. } | Self::ProviderRateLimited { .. }
        )
    }
}

/// Configuration errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Missing required configuration field: {field}")]
    MissingRequired { field: String },

    #[error("Invalid value for {field}: {value} - {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },
}

impl ConfigError {
    pub(crate) fn invalid(
        field: &str,
        value: impl std::fmt::Display,
        reason: &str,
    ) -> Self {
        Self::InvalidValue {
            field: field.to_string(),
            value: value.to_string(),
            reason: reason.to_string(),
        }
    }
}

/// Master error type for all Reverie errors.
#[derive(Debug, Clone, Error)]
pub enum ReverieError {
    #[error("Tier error: {0}")]
    Tier(#[from] TierError),

    #[error("Quota error: {0}")]
    Quota(#[from] QuotaDenial),

    #[error("Generation failed: {0}")]
    Generation(#[from] GenerationError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("Generation for {key} was cancelled before it started")]
    Cancelled { key: CacheKey },
}

impl ReverieError {
    /// True when retrying later can reasonably succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Quota(_) => true,
            Self::Generation(GenerationError::Network { .. })
            | Self::Generation(GenerationError::ProviderRateLimited { .. })
            | Self::Generation(GenerationError::Provider { .. }) => true,
            Self::Cancelled { .. } => true,
            _ => false,
        }
    }

    /// Suggested wait before retrying, when the error carries one.
    pub fn retry_after(&self, now: DateTime<Utc>) -> Option<Duration> {
        match self {
            Self::Quota(denial) => Some(denial.wait(now)),
            Self::Generation(GenerationError::ProviderRateLimited { retry_after_ms, .. }) => {
                Some(Duration::from_millis((*retry_after_ms).max(0) as u64))
            }
            _ => None,
        }
    }
}

/// Result type alias for Reverie operations.
pub type ReverieResult<T> = Result<T, ReverieError>;

// =============================================================================
// TESTS
// =============================================================================
