//! Cost and budget tracking for a single build.
//!
//! Costs are accumulated in integer micro-units so that concurrent
//! recording is exactly commutative: `[c1, c2, c3]` recorded in any order
//! yields the same total. The tracker is owned by one build run and is
//! never a process-wide singleton.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::sync::{Mutex, MutexGuard};
use thiserror::Error;

const MICROS_PER_UNIT: f64 = 1_000_000.0;

/// A non-negative cost in currency-equivalent units.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Cost(u64);

impl Cost {
    pub const ZERO: Cost = Cost(0);

    /// Convert from a floating point amount. Negative and NaN inputs clamp to zero.
    pub fn from_f64(value: f64) -> Self {
        if value.is_nan() || value <= 0.0 {
            return Cost::ZERO;
        }
        Cost((value * MICROS_PER_UNIT).round() as u64)
    }

    pub fn from_micros(micros: u64) -> Self {
        Cost(micros)
    }

    pub fn as_f64(&self) -> f64 {
        self.0 as f64 / MICROS_PER_UNIT
    }

    pub fn micros(&self) -> u64 {
        self.0
    }

    pub fn saturating_add(self, other: Cost) -> Cost {
        Cost(self.0.saturating_add(other.0))
    }
}

impl std::fmt::Display for Cost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:.4}", self.as_f64())
    }
}

impl Serialize for Cost {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(self.as_f64())
    }
}

impl<'de> Deserialize<'de> for Cost {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = f64::deserialize(deserializer)?;
        Ok(Cost::from_f64(value))
    }
}

impl std::iter::Sum for Cost {
    fn sum<I: Iterator<Item = Cost>>(iter: I) -> Self {
        iter.fold(Cost::ZERO, Cost::saturating_add)
    }
}

/// Running totals observed by a tracker.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Totals {
    pub cost: Cost,
    pub tokens: u64,
    pub calls: u64,
}

/// Raised by `CostTracker::check` once spend has passed the budget.
#[derive(Debug, Clone, Copy, PartialEq, Error)]
#[error("spent {spent} exceeds budget {budget}")]
pub struct BudgetBreach {
    pub spent: Cost,
    pub budget: Cost,
}

impl BudgetBreach {
    pub fn remaining(&self) -> f64 {
        self.budget.as_f64() - self.spent.as_f64()
    }
}

/// Single source of truth for spend within one build.
#[derive(Debug, Default)]
pub struct CostTracker {
    totals: Mutex<Totals>,
}

impl CostTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a tracker rehydrated from previously persisted totals.
    pub fn with_totals(totals: Totals) -> Self {
        Self {
            totals: Mutex::new(totals),
        }
    }

    // Totals are plain counters, so a poisoned lock still holds a usable value.
    fn lock(&self) -> MutexGuard<'_, Totals> {
        self.totals
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Atomically add one invocation's cost and tokens; returns the new totals.
    pub fn record(&self, cost: Cost, tokens: u64) -> Totals {
        let mut totals = self.lock();
        totals.cost = totals.cost.saturating_add(cost);
        totals.tokens = totals.tokens.saturating_add(tokens);
        totals.calls += 1;
        *totals
    }

    pub fn totals(&self) -> Totals {
        *self.lock()
    }

    pub fn spent(&self) -> Cost {
        self.lock().cost
    }

    /// Budget minus spend. Negative once an invocation overshoots.
    pub fn remaining(&self, budget: Cost) -> f64 {
        (budget.micros() as i128 - self.spent().micros() as i128) as f64 / MICROS_PER_UNIT
    }

    /// Fails once spend has passed the budget.
    pub fn check(&self, budget: Cost) -> Result<(), BudgetBreach> {
        let spent = self.spent();
        if spent > budget {
            return Err(BudgetBreach { spent, budget });
        }
        Ok(())
    }

    /// Whether a phase projected to cost at least `projected` fits in the budget.
    pub fn can_afford(&self, projected: Cost, budget: Cost) -> bool {
        self.spent().saturating_add(projected) <= budget
    }

    /// Operator-initiated "restart cost accounting" on resume.
    pub fn reset(&self) {
        *self.lock() = Totals::default();
    }
}
