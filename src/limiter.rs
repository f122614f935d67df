//! Admission control: per-identity request and email budgets, plus a
//! circuit breaker guarding the LLM spend.
//!
//! Expensive endpoints count by payload size (emails), not by request
//! count. The identity table is hard-capped; when full, the least
//! recently seen identity is evicted under a global sweep lock.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;

use crate::config::Policy;
use crate::error::CoreError;

// ---------------------------------------------------------------------------
// Rate limiter
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Clone)]
struct IdentityWindow {
    minute_start: i64,
    requests_in_minute: u32,
    emails_in_minute: u32,
    hour_start: i64,
    emails_in_hour: u32,
    last_seen: i64,
}

pub struct RateLimiter {
    requests_per_minute: u32,
    emails_per_minute: u32,
    emails_per_hour: u32,
    max_tracked: usize,
    identities: DashMap<String, IdentityWindow>,
    /// Held only while evicting; admission reads stay concurrent.
    sweep: Mutex<()>,
}

impl RateLimiter {
    pub fn new(policy: &Policy) -> Self {
        Self {
            requests_per_minute: policy.requests_per_minute,
            emails_per_minute: policy.emails_per_minute,
            emails_per_hour: policy.emails_per_hour,
            max_tracked: policy.max_tracked_ips,
            identities: DashMap::new(),
            sweep: Mutex::new(()),
        }
    }

    /// Admit or reject one request carrying `email_count` emails.
    ///
    /// Counters are only committed when every budget admits the request,
    /// so a rejected batch has no side effects.
    pub fn check_admission(
        &self,
        identity: &str,
        email_count: u32,
        now: DateTime<Utc>,
    ) -> Result<(), CoreError> {
        let ts = now.timestamp();
        let minute = ts - ts.rem_euclid(60);
        let hour = ts - ts.rem_euclid(3600);

        if !self.identities.contains_key(identity) && self.identities.len() >= self.max_tracked {
            self.evict_least_recent();
        }

        let mut entry = self.identities.entry(identity.to_string()).or_default();
        let window = entry.value_mut();

        if window.minute_start != minute {
            window.minute_start = minute;
            window.requests_in_minute = 0;
            window.emails_in_minute = 0;
        }
        if window.hour_start != hour {
            window.hour_start = hour;
            window.emails_in_hour = 0;
        }
        window.last_seen = ts;

        let minute_left = (minute + 60 - ts).max(1) as u64;
        let hour_left = (hour + 3600 - ts).max(1) as u64;

        if window.requests_in_minute + 1 > self.requests_per_minute {
            tracing::warn!(identity = %crate::hygiene::hash_pii(identity), limit = "requests_per_minute", "admission rejected");
            return Err(CoreError::RateLimited {
                retry_after_secs: minute_left,
                limit: "requests_per_minute",
            });
        }
        if window.emails_in_minute + email_count > self.emails_per_minute {
            tracing::warn!(identity = %crate::hygiene::hash_pii(identity), limit = "emails_per_minute", "admission rejected");
            return Err(CoreError::RateLimited {
                retry_after_secs: minute_left,
                limit: "emails_per_minute",
            });
        }
        if window.emails_in_hour + email_count > self.emails_per_hour {
            tracing::warn!(identity = %crate::hygiene::hash_pii(identity), limit = "emails_per_hour", "admission rejected");
            return Err(CoreError::RateLimited {
                retry_after_secs: hour_left,
                limit: "emails_per_hour",
            });
        }

        window.requests_in_minute += 1;
        window.emails_in_minute += email_count;
        window.emails_in_hour += email_count;
        Ok(())
    }

    pub fn tracked_identities(&self) -> usize {
        self.identities.len()
    }

    /// Deterministic LRU eviction on the bounded cap.
    fn evict_least_recent(&self) {
        let _guard = self.sweep.lock();
        if self.identities.len() < self.max_tracked {
            return; // another thread already made room
        }
        let oldest = self
            .identities
            .iter()
            .min_by_key(|e| e.value().last_seen)
            .map(|e| e.key().clone());
        if let Some(key) = oldest {
            self.identities.remove(&key);
        }
    }
}

// ---------------------------------------------------------------------------
// Circuit breaker
// ---------------------------------------------------------------------------

const OUTCOME_WINDOW: usize = 20;
const FAILURE_THRESHOLD: usize = 10;
const COOL_DOWN_SECS: i64 = 60;

#[derive(Default)]
struct BreakerState {
    outcomes: VecDeque<bool>,
    open_until: Option<i64>,
    open_reason: Option<String>,
    cost_day: i64,
    cost_today_usd: f64,
}

/// Opens on LLM failure rate or daily cost cap breach; rejects further
/// LLM calls until the cool-down elapses.
pub struct CircuitBreaker {
    daily_cost_cap_usd: f64,
    state: Mutex<BreakerState>,
}

impl CircuitBreaker {
    pub fn new(policy: &Policy) -> Self {
        Self {
            daily_cost_cap_usd: policy.daily_cost_cap_usd,
            state: Mutex::new(BreakerState::default()),
        }
    }

    pub fn check(&self, now: DateTime<Utc>) -> Result<(), CoreError> {
        let mut state = self.state.lock();
        if let Some(until) = state.open_until {
            if now.timestamp() < until {
                let reason = state
                    .open_reason
                    .clone()
                    .unwrap_or_else(|| "llm failure rate".to_string());
                return Err(CoreError::CircuitOpen { reason });
            }
            // Cool-down elapsed: half-open, allow traffic again.
            state.open_until = None;
            state.open_reason = None;
            state.outcomes.clear();
        }
        Ok(())
    }

    pub fn record_success(&self, _now: DateTime<Utc>) {
        let mut state = self.state.lock();
        push_outcome(&mut state.outcomes, true);
    }

    pub fn record_failure(&self, now: DateTime<Utc>) {
        let mut state = self.state.lock();
        push_outcome(&mut state.outcomes, false);
        let failures = state.outcomes.iter().filter(|ok| !**ok).count();
        if failures >= FAILURE_THRESHOLD {
            state.open_until = Some(now.timestamp() + COOL_DOWN_SECS);
            state.open_reason = Some("llm failure rate".to_string());
            tracing::warn!(failures, window = OUTCOME_WINDOW, "circuit opened on failure rate");
        }
    }

    /// Accumulate spend; opens the circuit when the daily cap is crossed.
    pub fn record_cost(&self, usd: f64, now: DateTime<Utc>) {
        let mut state = self.state.lock();
        let day = now.timestamp() / 86_400;
        if state.cost_day != day {
            state.cost_day = day;
            state.cost_today_usd = 0.0;
        }
        state.cost_today_usd += usd;
        if state.cost_today_usd >= self.daily_cost_cap_usd {
            state.open_until = Some(now.timestamp() + COOL_DOWN_SECS);
            state.open_reason = Some("daily cost cap reached".to_string());
            tracing::warn!(spent = state.cost_today_usd, cap = self.daily_cost_cap_usd, "circuit opened on cost cap");
        }
    }
}

fn push_outcome(outcomes: &mut VecDeque<bool>, ok: bool) {
    if outcomes.len() >= OUTCOME_WINDOW {
        outcomes.pop_front();
    }
    outcomes.push_back(ok);
}
