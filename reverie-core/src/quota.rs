//! Quota accounting data: limits, reset schedule and persisted state.

use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use crate::error::TierError;

// =============================================================================
// LIMITS
// =============================================================================

/// Provider tier limits. Configuration, never hardcoded in the governor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaLimits {
    pub tier_name: String,
    pub daily_limit: u32,
    pub min_interval_ms: u64,
    pub backoff_ms: u64,
}

impl QuotaLimits {
    /// Low daily cap with several seconds between calls.
    pub fn free_tier() -> Self {
        Self {
            tier_name: "free".to_string(),
            daily_limit: 1500,
            min_interval_ms: 4_000,
            backoff_ms: 60_000,
        }
    }

    /// High daily cap with near-zero spacing.
    pub fn paid_tier() -> Self {
        Self {
            tier_name: "paid".to_string(),
            daily_limit: 10_000,
            min_interval_ms: 100,
            backoff_ms: 30_000,
        }
    }

    pub fn by_name(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "free" => Some(Self::free_tier()),
            "paid" => Some(Self::paid_tier()),
            _ => None,
        }
    }

    pub fn with_daily_limit(mut self, limit: u32) -> Self {
        self.daily_limit = limit;
        self
    }

    pub fn with_min_interval(mut self, interval: Duration) -> Self {
        self.min_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff_ms = backoff.as_millis() as u64;
        self
    }

    pub fn min_interval(&self) -> Duration {
        Duration::from_millis(self.min_interval_ms)
    }

    pub fn backoff(&self) -> Duration {
        Duration::from_millis(self.backoff_ms)
    }
}

impl Default for QuotaLimits {
    fn default() -> Self {
        Self::free_tier()
    }
}

// =============================================================================
// RESET SCHEDULE
// =============================================================================

/// Daily reset boundary: a fixed time of day in a fixed timezone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResetSchedule {
    pub timezone: Tz,
    pub hour: u32,
    pub minute: u32,
}

impl Default for ResetSchedule {
    fn default() -> Self {
        Self {
            timezone: chrono_tz::America::Los_Angeles,
            hour: 0,
            minute: 0,
        }
    }
}

impl ResetSchedule {
    pub fn new(timezone: Tz, hour: u32, minute: u32) -> Self {
        Self {
            timezone,
            hour,
            minute,
        }
    }

    /// First boundary strictly after `now`.
    pub fn next_reset_after(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let mut date = now.with_timezone(&self.timezone).date_naive();
        // a boundary exists on every calendar day, so at most two iterations
        // are needed; the third covers a DST gap swallowing the boundary
        for _ in 0..3 {
            if let Some(candidate) = self.boundary_on(date) {
                if candidate > now {
                    return candidate;
                }
            }
            match date.succ_opt() {
                Some(next) => date = next,
                None => break,
            }
        }
        now + chrono::Duration::hours(24)
    }

    fn boundary_on(&self, date: NaiveDate) -> Option<DateTime<Utc>> {
        let naive = date.and_hms_opt(self.hour, self.minute, 0)?;
        self.timezone
            .from_local_datetime(&naive)
            .earliest()
            .or_else(|| {
                // skipped by a DST jump; use the first valid instant after it
                self.timezone
                    .from_local_datetime(&(naive + chrono::Duration::hours(1)))
                    .earliest()
            })
            .map(|t| t.with_timezone(&Utc))
    }
}

// =============================================================================
// STATE
// =============================================================================

/// Persisted governor counters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaState {
    pub daily_count: u32,
    pub daily_limit: u32,
    pub window_reset_at: DateTime<Utc>,
    pub last_request_at: Option<DateTime<Utc>>,
    pub min_interval_ms: u64,
    pub last_provider_error_at: Option<DateTime<Utc>>,
}

impl QuotaState {
    pub fn fresh(limits: &QuotaLimits, window_reset_at: DateTime<Utc>) -> Self {
        Self {
            daily_count: 0,
            daily_limit: limits.daily_limit,
            window_reset_at,
            last_request_at: None,
            min_interval_ms: limits.min_interval_ms,
            last_provider_error_at: None,
        }
    }

    pub fn is_exhausted(&self) -> bool {
        self.daily_count >= self.daily_limit
    }
}

/// Observable governor state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GovernorState {
    Open,
    RateLimited,
    QuotaExhausted,
    Backoff,
}

/// Point-in-time view of the governor for stats and logging.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaSnapshot {
    pub limits: QuotaLimits,
    pub daily_count: u32,
    pub in_flight: u32,
    pub remaining: u32,
    pub window_reset_at: DateTime<Utc>,
    pub last_request_at: Option<DateTime<Utc>>,
    pub last_provider_error_at: Option<DateTime<Utc>>,
    pub state: GovernorState,
}

// =============================================================================
// PERSISTENCE
// =============================================================================

/// Durable home for [`QuotaState`]. Called with the governor's lock held, so
/// implementations must be quick and must not block on the governor.
pub trait QuotaStore: Send + Sync {
    fn load(&self) -> Result<Option<QuotaState>, TierError>;

    fn save(&self, state: &QuotaState) -> Result<(), TierError>;
}

/// Volatile store for tests and ephemeral sessions.
#[derive(Debug, Default)]
pub struct InMemoryQuotaStore {
    state: Mutex<Option<QuotaState>>,
    saves: AtomicU64,
}

impl InMemoryQuotaStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_state(state: QuotaState) -> Self {
        Self {
            state: Mutex::new(Some(state)),
            saves: AtomicU64::new(0),
        }
    }

    pub fn save_count(&self) -> u64 {
        self.saves.load(Ordering::Relaxed)
    }
}

impl QuotaStore for InMemoryQuotaStore {
    fn load(&self) -> Result<Option<QuotaState>, TierError> {
        Ok(self.state.lock().unwrap_or_else(|e| e.into_inner()).clone())
    }

    fn save(&self, state: &QuotaState) -> Result<(), TierError> {
        *self.state.lock().unwrap_or_else(|e| e.into_inner()) = Some(state.clone());
        self.saves.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn utc(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    #[test]
    fn test_next_reset_is_local_midnight() {
        let schedule = ResetSchedule::default();
        // 2026-03-02 15:00 UTC is 07:00 PST
        let next = schedule.next_reset_after(utc("2026-03-02T15:00:00Z"));
        assert_eq!(next, utc("2026-03-03T08:00:00Z"));
    }

    #[test]
    fn test_next_reset_is_strictly_after_boundary() {
        let schedule = ResetSchedule::default();
        let boundary = utc("2026-03-03T08:00:00Z");
        assert_eq!(
            schedule.next_reset_after(boundary),
            utc("2026-03-04T08:00:00Z")
        );
    }

    #[test]
    fn test_reset_follows_daylight_saving() {
        let schedule = ResetSchedule::default();
        // midnight PDT is 07:00 UTC
        let next = schedule.next_reset_after(utc("2026-07-01T12:00:00Z"));
        assert_eq!(next, utc("2026-07-02T07:00:00Z"));
    }

    #[test]
    fn test_reset_inside_dst_gap_moves_forward() {
        // 02:30 local does not exist on 2026-03-08 in Los Angeles
        let schedule = ResetSchedule::new(chrono_tz::America::Los_Angeles, 2, 30);
        let next = schedule.next_reset_after(utc("2026-03-08T08:00:00Z"));
        // 03:30 PDT
        assert_eq!(next, utc("2026-03-08T10:30:00Z"));
    }

    #[test]
    fn test_limit_presets() {
        let free = QuotaLimits::free_tier();
        let paid = QuotaLimits::paid_tier();
        assert_eq!(free.daily_limit, 1500);
        assert!(free.min_interval() > paid.min_interval());
        assert!(paid.daily_limit > free.daily_limit);
        assert_eq!(QuotaLimits::by_name("PAID"), Some(paid));
        assert_eq!(QuotaLimits::by_name("enterprise"), None);
    }

    #[test]
    fn test_in_memory_store_counts_saves() {
        let store = InMemoryQuotaStore::new();
        assert!(store.load().unwrap().is_none());
        let state = QuotaState::fresh(&QuotaLimits::free_tier(), Utc::now());
        store.save(&state).unwrap();
        store.save(&state).unwrap();
        assert_eq!(store.save_count(), 2);
        assert_eq!(store.load().unwrap(), Some(state));
    }

    #[test]
    fn test_quota_state_serde_round_trip() {
        let state = QuotaState::fresh(&QuotaLimits::paid_tier(), utc("2026-03-03T08:00:00Z"));
        let json = serde_json::to_string(&state).unwrap();
        let back: QuotaState = serde_json::from_str(&json).unwrap();
        assert_eq!(state, back);
    }
}
