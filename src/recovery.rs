//! Failure classification and recovery decisions.
//!
//! - Transient failures retry with bounded exponential backoff until the
//!   attempt budget runs out.
//! - Validation failures get at most one corrective re-invocation.
//! - Budget and unclassified failures are never retried.

use crate::errors::FailureClass;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Bounded exponential backoff: `base * 2^(attempt-1)`, capped at `max`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub base: Duration,
    pub max: Duration,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self { base, max }
    }

    /// Delay before the retry that follows `attempt` (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(20);
        self.base
            .checked_mul(1u32 << exponent)
            .unwrap_or(self.max)
            .min(self.max)
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(30))
    }
}

/// What to do after a failed invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryAction {
    Retry,
    Skip,
    Abort,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecoveryDecision {
    pub action: RecoveryAction,
    pub remaining_attempts: u32,
    pub backoff: Duration,
    /// The retry should carry the rejection reason as corrective context.
    pub corrective: bool,
}

impl RecoveryDecision {
    fn retry(remaining_attempts: u32, backoff: Duration, corrective: bool) -> Self {
        Self {
            action: RecoveryAction::Retry,
            remaining_attempts,
            backoff,
            corrective,
        }
    }

    fn give_up(required: bool, remaining_attempts: u32) -> Self {
        Self {
            action: if required {
                RecoveryAction::Abort
            } else {
                RecoveryAction::Skip
            },
            remaining_attempts,
            backoff: Duration::ZERO,
            corrective: false,
        }
    }

    fn abort(remaining_attempts: u32) -> Self {
        Self {
            action: RecoveryAction::Abort,
            remaining_attempts,
            backoff: Duration::ZERO,
            corrective: false,
        }
    }
}

/// Maps a failure to a `RecoveryDecision`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecoveryPolicy {
    pub max_attempts: u32,
    pub backoff: Backoff,
    pub corrective_retry: bool,
}

impl Default for RecoveryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: Backoff::default(),
            corrective_retry: true,
        }
    }
}

impl RecoveryPolicy {
    /// Decide how to respond to a failure on `attempt` (1-based).
    ///
    /// `required` is the static classification of the invocation; optional
    /// invocations are skipped instead of aborting the phase once recovery
    /// is exhausted. `corrective_used` tracks whether the single corrective
    /// validation retry has already been spent.
    pub fn decide(
        &self,
        class: FailureClass,
        attempt: u32,
        required: bool,
        corrective_used: bool,
    ) -> RecoveryDecision {
        let remaining = self.max_attempts.saturating_sub(attempt);
        match class {
            FailureClass::Transient if remaining > 0 => {
                RecoveryDecision::retry(remaining, self.backoff.delay(attempt), false)
            }
            FailureClass::Transient => RecoveryDecision::give_up(required, 0),
            FailureClass::Validation
                if self.corrective_retry && !corrective_used && remaining > 0 =>
            {
                RecoveryDecision::retry(remaining, Duration::ZERO, true)
            }
            FailureClass::Validation | FailureClass::Connection => {
                RecoveryDecision::give_up(required, remaining)
            }
            FailureClass::BudgetExceeded | FailureClass::NotResumable | FailureClass::Fatal => {
                RecoveryDecision::abort(remaining)
            }
        }
    }
}

/// Classify a free-form provider error message.
///
/// Only messages that look like network, rate-limit or timeout conditions are
/// treated as transient; anything unrecognised is fatal so that systemic
/// problems are never masked by silent retries.
pub fn classify_message(message: &str) -> FailureClass {
    const TRANSIENT_MARKERS: &[&str] = &[
        "timed out",
        "timeout",
        "rate limit",
        "rate_limit",
        "429",
        "overloaded",
        "529",
        "502",
        "503",
        "504",
        "connection reset",
        "connection refused",
        "econnreset",
        "network",
        "temporarily unavailable",
    ];
    const BUDGET_MARKERS: &[&str] = &["credit balance", "budget exceeded", "quota exceeded"];

    let lower = message.to_lowercase();
    if BUDGET_MARKERS.iter().any(|m| lower.contains(m)) {
        FailureClass::BudgetExceeded
    } else if TRANSIENT_MARKERS.iter().any(|m| lower.contains(m)) {
        FailureClass::Transient
    } else {
        FailureClass::Fatal
    }
}
