//! Quota and rate governor for generation providers.
//!
//! Tracks the daily request count against the provider tier's limit, the
//! minimum spacing between requests, and a cool-down after the provider
//! itself reports a quota violation. State is persisted after every mutation.
//!
//! Checks are evaluated in a fixed order:
//!
//! 1. `QuotaExhausted`: `daily_count + in_flight >= daily_limit`, resolves at
//!    the next reset boundary
//! 2. `Backoff`: a provider quota error was seen within the backoff window
//! 3. `RateLimited`: the previous request started less than `min_interval` ago

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use reverie_core::{
    Clock, GovernorState, QuotaDenial, QuotaLimits, QuotaSnapshot, QuotaState, QuotaStore,
    ResetSchedule,
};

/// Outcome of a non-reserving check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuotaDecision {
    pub allowed: bool,
    pub reason: Option<QuotaDenial>,
    pub wait: Option<Duration>,
}

impl QuotaDecision {
    fn allow() -> Self {
        Self {
            allowed: true,
            reason: None,
            wait: None,
        }
    }

    fn deny(reason: QuotaDenial, now: DateTime<Utc>) -> Self {
        Self {
            allowed: false,
            wait: Some(reason.wait(now)),
            reason: Some(reason),
        }
    }
}

struct GovernorInner {
    state: QuotaState,
    /// Reservations handed out but not yet settled.
    in_flight: u32,
}

pub struct QuotaGovernor {
    limits: QuotaLimits,
    schedule: ResetSchedule,
    store: Arc<dyn QuotaStore>,
    clock: Arc<dyn Clock>,
    inner: Mutex<GovernorInner>,
}

impl QuotaGovernor {
    /// Restore persisted state from `store`, or start a fresh quota day.
    ///
    /// Configured limits always win over persisted ones; counters and
    /// timestamps are kept.
    pub fn new(
        limits: QuotaLimits,
        schedule: ResetSchedule,
        store: Arc<dyn QuotaStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let now = clock.now();
        let next_reset = schedule.next_reset_after(now);

        let state = match store.load() {
            Ok(Some(mut state)) => {
                state.daily_limit = limits.daily_limit;
                state.min_interval_ms = limits.min_interval_ms;
                // a schedule change may have moved the boundary earlier
                state.window_reset_at = state.window_reset_at.min(next_reset);
                tracing::info!(
                    daily_count = state.daily_count,
                    daily_limit = state.daily_limit,
                    window_reset_at = %state.window_reset_at,
                    "Restored quota state"
                );
                state
            }
            Ok(None) => QuotaState::fresh(&limits, next_reset),
            Err(e) => {
                tracing::error!(error = %e, "Failed to load quota state, starting fresh");
                QuotaState::fresh(&limits, next_reset)
            }
        };

        Self {
            limits,
            schedule,
            store,
            clock,
            inner: Mutex::new(GovernorInner {
                state,
                in_flight: 0,
            }),
        }
    }

    pub fn limits(&self) -> &QuotaLimits {
        &self.limits
    }

    pub fn schedule(&self) -> &ResetSchedule {
        &self.schedule
    }

    fn lock(&self) -> MutexGuard<'_, GovernorInner> {
        // every mutation leaves the state consistent, so a poisoned lock
        // still guards valid data
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn persist(&self, state: &QuotaState) {
        if let Err(e) = self.store.save(state) {
            tracing::error!(error = %e, "Failed to persist quota state");
        }
    }

    /// Reset the counter if the window has elapsed. Returns true if it did.
    fn roll_window(&self, inner: &mut GovernorInner, now: DateTime<Utc>) -> bool {
        if now < inner.state.window_reset_at {
            return false;
        }
        let previous = inner.state.daily_count;
        inner.state.daily_count = 0;
        inner.state.window_reset_at = self.schedule.next_reset_after(now);
        tracing::info!(
            previous_count = previous,
            next_reset_at = %inner.state.window_reset_at,
            "Quota window reset"
        );
        true
    }

    fn evaluate(&self, inner: &GovernorInner, now: DateTime<Utc>) -> Result<(), QuotaDenial> {
        let state = &inner.state;
        if state.daily_count.saturating_add(inner.in_flight) >= state.daily_limit {
            return Err(QuotaDenial::QuotaExceeded {
                daily_count: state.daily_count,
                daily_limit: state.daily_limit,
                resets_at: state.window_reset_at,
            });
        }

        if let Some(error_at) = state.last_provider_error_at {
            let wait = remaining(error_at, self.limits.backoff(), now);
            if !wait.is_zero() {
                return Err(QuotaDenial::Backoff { wait });
            }
        }

        if let Some(last) = state.last_request_at {
            let wait = remaining(last, self.limits.min_interval(), now);
            if !wait.is_zero() {
                return Err(QuotaDenial::RateLimited { wait });
            }
        }

        Ok(())
    }

    /// Check without reserving.
    pub fn can_proceed(&self) -> QuotaDecision {
        let now = self.clock.now();
        let mut inner = self.lock();
        if self.roll_window(&mut inner, now) {
            self.persist(&inner.state);
        }
        match self.evaluate(&inner, now) {
            Ok(()) => QuotaDecision::allow(),
            Err(denial) => QuotaDecision::deny(denial, now),
        }
    }

    /// Check and, if allowed, reserve a slot in one step.
    ///
    /// The reservation stamps `last_request_at` and counts against the daily
    /// limit until settled, so concurrent callers cannot both slip through
    /// the last remaining slot. Dropping an unsettled reservation releases it.
    pub fn try_acquire(self: &Arc<Self>) -> Result<QuotaReservation, QuotaDenial> {
        let now = self.clock.now();
        let mut inner = self.lock();
        let rolled = self.roll_window(&mut inner, now);

        if let Err(denial) = self.evaluate(&inner, now) {
            if rolled {
                self.persist(&inner.state);
            }
            tracing::debug!(reason = %denial, "Generation denied by quota governor");
            return Err(denial);
        }

        inner.in_flight += 1;
        inner.state.last_request_at = Some(now);
        self.persist(&inner.state);

        Ok(QuotaReservation {
            governor: Arc::clone(self),
            settled: false,
        })
    }

    /// Count one successful provider call made outside a reservation.
    pub fn record_success(&self) {
        let now = self.clock.now();
        let mut inner = self.lock();
        self.roll_window(&mut inner, now);
        inner.state.daily_count = inner.state.daily_count.saturating_add(1);
        inner.state.last_request_at = Some(now);
        self.persist(&inner.state);
    }

    /// The provider reported a quota or rate violation. Its view is
    /// authoritative: the day's budget is treated as spent and the backoff
    /// window starts now.
    pub fn record_provider_error(&self) {
        let now = self.clock.now();
        let mut inner = self.lock();
        self.roll_window(&mut inner, now);
        inner.state.daily_count = inner.state.daily_count.max(inner.state.daily_limit);
        inner.state.last_provider_error_at = Some(now);
        self.persist(&inner.state);
        tracing::warn!(
            daily_limit = inner.state.daily_limit,
            resets_at = %inner.state.window_reset_at,
            "Provider reported quota violation, budget exhausted until reset"
        );
    }

    fn settle(&self, outcome: Settlement) {
        let now = self.clock.now();
        let mut inner = self.lock();
        inner.in_flight = inner.in_flight.saturating_sub(1);
        match outcome {
            Settlement::Success => {
                // a reservation that straddled the reset boundary is charged
                // to the new day
                self.roll_window(&mut inner, now);
                inner.state.daily_count = inner.state.daily_count.saturating_add(1);
                self.persist(&inner.state);
            }
            Settlement::ProviderError => {
                drop(inner);
                self.record_provider_error();
            }
            Settlement::Released => {}
        }
    }

    pub fn snapshot(&self) -> QuotaSnapshot {
        let now = self.clock.now();
        let mut inner = self.lock();
        if self.roll_window(&mut inner, now) {
            self.persist(&inner.state);
        }
        let state = match self.evaluate(&inner, now) {
            Ok(()) => GovernorState::Open,
            Err(QuotaDenial::QuotaExceeded { .. }) => GovernorState::QuotaExhausted,
            Err(QuotaDenial::Backoff { .. }) => GovernorState::Backoff,
            Err(QuotaDenial::RateLimited { .. }) => GovernorState::RateLimited,
        };
        QuotaSnapshot {
            limits: self.limits.clone(),
            daily_count: inner.state.daily_count,
            in_flight: inner.in_flight,
            remaining: inner
                .state
                .daily_limit
                .saturating_sub(inner.state.daily_count.saturating_add(inner.in_flight)),
            window_reset_at: inner.state.window_reset_at,
            last_request_at: inner.state.last_request_at,
            last_provider_error_at: inner.state.last_provider_error_at,
            state,
        }
    }
}

impl std::fmt::Debug for QuotaGovernor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QuotaGovernor")
            .field("tier", &self.limits.tier_name)
            .field("daily_limit", &self.limits.daily_limit)
            .finish()
    }
}

/// Time left until `since + window`, zero once elapsed. Clamped to `window`
/// so a clock that steps backwards cannot produce an oversized wait.
fn remaining(since: DateTime<Utc>, window: Duration, now: DateTime<Utc>) -> Duration {
    let elapsed = (now - since).to_std().unwrap_or(Duration::ZERO);
    window.saturating_sub(elapsed).min(window)
}

enum Settlement {
    Success,
    ProviderError,
    Released,
}

/// A reserved generation slot. Settle it with [`succeed`](Self::succeed) or
/// [`provider_error`](Self::provider_error); dropping it releases the slot
/// without charging the daily count.
pub struct QuotaReservation {
    governor: Arc<QuotaGovernor>,
    settled: bool,
}

impl QuotaReservation {
    pub fn succeed(mut self) {
        self.settled = true;
        self.governor.settle(Settlement::Success);
    }

    pub fn provider_error(mut self) {
        self.settled = true;
        self.governor.settle(Settlement::ProviderError);
    }

    /// Generation failed for a reason unrelated to quota.
    pub fn release(mut self) {
        self.settled = true;
        self.governor.settle(Settlement::Released);
    }
}

impl Drop for QuotaReservation {
    fn drop(&mut self) {
        if !self.settled {
            self.governor.settle(Settlement::Released);
        }
    }
}

impl std::fmt::Debug for QuotaReservation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QuotaReservation")
            .field("settled", &self.settled)
            .finish()
    }
}


#[cfg(test)]
mod prop_tests {
    use super::*;
    use proptest::prelude::*;
    use reverie_core::{InMemoryQuotaStore, ManualClock};

    #[derive(Debug, Clone)]
    enum Op {
        Acquire,
        Success,
        ProviderError,
        Advance(u64),
    }

    fn op_strategy() -> impl Strategy<Value = Op> {
        prop_oneof![
            4 => Just(Op::Acquire),
            2 => Just(Op::Success),
            1 => Just(Op::ProviderError),
            3 => (1u64..600).prop_map(Op::Advance),
        ]
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        /// Within one quota day the count never decreases, and once it reaches
        /// the limit every check is denied.
        #[test]
        fn prop_daily_count_monotonic(
            limit in 1u32..20,
            ops in prop::collection::vec(op_strategy(), 1..80),
        ) {
            let start = DateTime::parse_from_rfc3339("2026-03-02T15:00:00Z")
                .unwrap()
                .with_timezone(&Utc);
            let clock = Arc::new(ManualClock::new(start));
            let governor = Arc::new(QuotaGovernor::new(
                QuotaLimits::free_tier()
                    .with_daily_limit(limit)
                    .with_min_interval(Duration::from_secs(1)),
                ResetSchedule::default(),
                Arc::new(InMemoryQuotaStore::new()),
                clock.clone(),
            ));

            // at most 80 * 600s = 13.3h, which never crosses the 08:00Z boundary
            let mut last_count = 0u32;
            for op in ops {
                match op {
                    Op::Acquire => {
                        if let Ok(reservation) = governor.try_acquire() {
                            reservation.succeed();
                        }
                    }
                    Op::Success => governor.record_success(),
                    Op::ProviderError => governor.record_provider_error(),
                    Op::Advance(secs) => clock.advance(Duration::from_secs(secs)),
                }
                let snapshot = governor.snapshot();
                prop_assert!(snapshot.daily_count >= last_count);
                if snapshot.daily_count >= limit {
                    prop_assert!(!governor.can_proceed().allowed);
                    prop_assert_eq!(snapshot.state, GovernorState::QuotaExhausted);
                }
                last_count = snapshot.daily_count;
            }
        }
    }
}
