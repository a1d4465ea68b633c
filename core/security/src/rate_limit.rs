//! Per-identifier sliding-window rate limiting.
//!
//! State lives in a concurrent map keyed by identifier, so checks for
//! different profiles never contend on a shared lock.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use veilvault_common::Clock;

/// Map size above which each check first drops expired entries.
const PRUNE_THRESHOLD: usize = 1024;

/// Counter state for one identifier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitState {
    pub first_attempt: DateTime<Utc>,
    pub last_attempt: DateTime<Utc>,
    pub attempt_count: u32,
    pub blocked: bool,
    pub block_expiry: Option<DateTime<Utc>>,
    /// End of the counting window opened by `first_attempt`.
    pub window_end: DateTime<Utc>,
}

impl RateLimitState {
    fn fresh(now: DateTime<Utc>, window: Duration) -> Self {
        Self {
            first_attempt: now,
            last_attempt: now,
            attempt_count: 0,
            blocked: false,
            block_expiry: None,
            window_end: now + window,
        }
    }

    /// Neither blocked nor inside its window; equivalent to no state.
    fn is_stale(&self, now: DateTime<Utc>) -> bool {
        match (self.blocked, self.block_expiry) {
            (true, Some(until)) => now >= until,
            _ => now > self.window_end,
        }
    }
}

/// Result of a rate-limit check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitOutcome {
    /// Attempt counted and allowed.
    Allowed { attempts: u32, remaining: u32 },
    /// This attempt crossed the threshold; the identifier is now blocked.
    Exceeded { until: DateTime<Utc> },
    /// The identifier was already blocked; nothing was counted.
    Blocked { until: DateTime<Utc> },
}

impl RateLimitOutcome {
    pub fn is_allowed(&self) -> bool {
        matches!(self, RateLimitOutcome::Allowed { .. })
    }
}

/// Sliding-window rate limiter with a fixed block duration.
pub struct RateLimiter {
    states: DashMap<String, RateLimitState>,
    block_duration: Duration,
    clock: Arc<dyn Clock>,
}

impl RateLimiter {
    pub fn new(block_duration: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            states: DashMap::new(),
            block_duration,
            clock,
        }
    }

    /// Count one attempt for `identifier`.
    ///
    /// # Postconditions
    /// - The first attempt in a window counts as 1
    /// - Once `window` has elapsed since the first attempt the counter resets
    /// - Attempt `max_attempts + 1` inside the window blocks the identifier
    ///   for the block duration
    /// - An expired block is cleared and the attempt counted afresh
    pub fn check(&self, identifier: &str, max_attempts: u32, window: Duration) -> RateLimitOutcome {
        let now = self.clock.now();
        if self.states.len() > PRUNE_THRESHOLD {
            self.prune();
        }
        let mut entry = self
            .states
            .entry(identifier.to_string())
            .or_insert_with(|| RateLimitState::fresh(now, window));
        let state = entry.value_mut();

        if state.blocked {
            match state.block_expiry {
                Some(until) if now < until => return RateLimitOutcome::Blocked { until },
                _ => *state = RateLimitState::fresh(now, window),
            }
        }

        if now - state.first_attempt > window {
            *state = RateLimitState::fresh(now, window);
        }

        state.attempt_count += 1;
        state.last_attempt = now;

        if state.attempt_count > max_attempts {
            let until = now + self.block_duration;
            state.blocked = true;
            state.block_expiry = Some(until);
            return RateLimitOutcome::Exceeded { until };
        }

        RateLimitOutcome::Allowed {
            attempts: state.attempt_count,
            remaining: max_attempts - state.attempt_count,
        }
    }

    /// Whether `identifier` is currently blocked.
    pub fn is_blocked(&self, identifier: &str) -> bool {
        let now = self.clock.now();
        self.states
            .get(identifier)
            .map(|s| s.blocked && s.block_expiry.map_or(false, |until| now < until))
            .unwrap_or(false)
    }

    /// Current state for `identifier`, if any attempt was recorded.
    pub fn info(&self, identifier: &str) -> Option<RateLimitState> {
        self.states.get(identifier).map(|s| s.value().clone())
    }

    /// Forget all attempts for `identifier`.
    pub fn reset(&self, identifier: &str) {
        self.states.remove(identifier);
    }

    /// Drop every identifier whose window and block have both expired.
    /// Returns the number dropped.
    pub fn prune(&self) -> usize {
        let now = self.clock.now();
        let before = self.states.len();
        self.states.retain(|_, state| !state.is_stale(now));
        before.saturating_sub(self.states.len())
    }

    /// Number of identifiers with recorded state.
    pub fn tracked(&self) -> usize {
        self.states.len()
    }
}
