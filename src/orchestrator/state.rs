//! Build-level state: status and running metrics.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

use crate::cost::{Cost, Totals};
use crate::errors::{BuildError, FailureClass};
use crate::phase::{PhaseResult, PhaseStatus, duration_millis};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BuildStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
}

impl BuildStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BuildStatus::Pending => "pending",
            BuildStatus::Running => "running",
            BuildStatus::Completed => "completed",
            BuildStatus::Failed => "failed",
        }
    }
}

impl std::fmt::Display for BuildStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Why a build did not complete.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureReport {
    pub class: FailureClass,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<String>,
    pub message: String,
    /// Budget minus spend at the time of failure
    pub remaining_budget: f64,
}

impl FailureReport {
    pub fn from_error(err: &BuildError, remaining_budget: f64) -> Self {
        Self {
            class: err.class(),
            phase: err.phase().map(str::to_string),
            message: err.to_string(),
            remaining_budget,
        }
    }
}

/// Running totals for the whole build.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildMetrics {
    pub build_id: String,
    pub project_name: String,
    pub status: BuildStatus,
    pub phases_completed: u32,
    pub phases_failed: u32,
    pub phases_skipped: u32,
    #[serde(with = "duration_millis")]
    pub total_duration: Duration,
    pub total_cost: Cost,
    pub total_tokens: u64,
    pub agent_calls: u64,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureReport>,
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

impl BuildMetrics {
    pub fn new(build_id: impl Into<String>, project_name: impl Into<String>) -> Self {
        Self {
            build_id: build_id.into(),
            project_name: project_name.into(),
            status: BuildStatus::Pending,
            phases_completed: 0,
            phases_failed: 0,
            phases_skipped: 0,
            total_duration: Duration::ZERO,
            total_cost: Cost::ZERO,
            total_tokens: 0,
            agent_calls: 0,
            started_at: Utc::now(),
            completed_at: None,
            failure: None,
            metadata: BTreeMap::new(),
        }
    }

    /// Fold a finished phase into the totals.
    pub fn record_phase(&mut self, result: &PhaseResult) {
        match result.status {
            PhaseStatus::Completed => self.phases_completed += 1,
            PhaseStatus::Failed => self.phases_failed += 1,
            PhaseStatus::Skipped => self.phases_skipped += 1,
            PhaseStatus::Pending | PhaseStatus::InProgress => {}
        }
        self.total_cost = self.total_cost.saturating_add(result.cost);
        self.total_tokens = self.total_tokens.saturating_add(result.tokens);
        self.agent_calls += result.responses.len() as u64;
    }

    /// Cost totals in the shape the cost tracker is rehydrated from.
    pub fn totals(&self) -> Totals {
        Totals {
            cost: self.total_cost,
            tokens: self.total_tokens,
            calls: self.agent_calls,
        }
    }

    /// Clear spend and call counters (operator-initiated on resume).
    pub fn reset_cost(&mut self) {
        self.total_cost = Cost::ZERO;
        self.total_tokens = 0;
        self.agent_calls = 0;
    }

    pub fn finish(&mut self, status: BuildStatus, failure: Option<FailureReport>) {
        self.status = status;
        self.failure = failure;
        self.completed_at = Some(Utc::now());
    }

    pub fn is_completed(&self) -> bool {
        self.status == BuildStatus::Completed
    }

    pub fn failure_class(&self) -> Option<FailureClass> {
        self.failure.as_ref().map(|f| f.class)
    }

    /// Process exit code for this outcome.
    pub fn exit_code(&self) -> u8 {
        match (&self.status, &self.failure) {
            (BuildStatus::Completed, _) => crate::errors::exit_code::SUCCESS,
            (_, Some(failure)) => failure.class.exit_code(),
            _ => crate::errors::exit_code::FATAL,
        }
    }
}
