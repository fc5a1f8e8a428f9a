//! Typed error hierarchy for the buildforge orchestrator.
//!
//! Four enums cover the subsystems that can fail:
//! - `AgentError`: a single agent query failed
//! - `ConnectionError`: a tool provider is unreachable or degraded
//! - `CheckpointError`: checkpoint persistence or validation failed
//! - `BuildError`: build-level terminal conditions
//!
//! Every error maps onto a `FailureClass`, which drives both recovery
//! decisions and the process exit code.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

/// Process exit codes for the build entry points.
pub mod exit_code {
    pub const SUCCESS: u8 = 0;
    pub const FATAL: u8 = 1;
    pub const BUDGET_EXCEEDED: u8 = 2;
    pub const VALIDATION: u8 = 3;
    pub const NOT_RESUMABLE: u8 = 4;
}

/// Classification of every failure the orchestrator can observe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureClass {
    /// Network or timeout-like failure; retryable with backoff.
    Transient,
    /// Agent output was malformed or unusable.
    Validation,
    /// The cost or time ceiling was breached.
    BudgetExceeded,
    /// A tool provider is unreachable or degraded.
    Connection,
    /// Checkpoint missing, invalid or mismatched.
    NotResumable,
    /// Unclassified failure.
    Fatal,
}

impl FailureClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureClass::Transient => "transient",
            FailureClass::Validation => "validation",
            FailureClass::BudgetExceeded => "budget_exceeded",
            FailureClass::Connection => "connection",
            FailureClass::NotResumable => "not_resumable",
            FailureClass::Fatal => "fatal",
        }
    }

    /// Exit code reported by the CLI when a build ends with this class.
    pub fn exit_code(&self) -> u8 {
        match self {
            FailureClass::BudgetExceeded => exit_code::BUDGET_EXCEEDED,
            FailureClass::Validation => exit_code::VALIDATION,
            FailureClass::NotResumable => exit_code::NOT_RESUMABLE,
            FailureClass::Transient | FailureClass::Connection | FailureClass::Fatal => {
                exit_code::FATAL
            }
        }
    }
}

impl std::fmt::Display for FailureClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Errors from a single agent query.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum AgentError {
    #[error("Agent call timed out after {secs}s")]
    Timeout { secs: u64 },

    #[error("Transient agent failure: {0}")]
    Transient(String),

    #[error("Agent output failed validation: {0}")]
    Validation(String),

    #[error("Budget exceeded: {0}")]
    BudgetExceeded(String),

    #[error("Tool connection error: {0}")]
    Connection(String),

    #[error("Agent provider error: {0}")]
    Provider(String),
}

impl AgentError {
    pub fn class(&self) -> FailureClass {
        match self {
            AgentError::Timeout { .. } | AgentError::Transient(_) => FailureClass::Transient,
            AgentError::Validation(_) => FailureClass::Validation,
            AgentError::BudgetExceeded(_) => FailureClass::BudgetExceeded,
            AgentError::Connection(_) => FailureClass::Connection,
            AgentError::Provider(_) => FailureClass::Fatal,
        }
    }
}

/// Errors from the connection manager.
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("Unknown tool provider '{0}'")]
    UnknownProvider(String),

    #[error("Provider '{provider}' is not ready (state: {state})")]
    NotReady { provider: String, state: String },

    #[error("Provider '{provider}' is permanently degraded after {attempts} reconnect attempts")]
    PermanentlyDegraded { provider: String, attempts: u32 },

    #[error("Provider '{provider}' failed: {source}")]
    Provider {
        provider: String,
        #[source]
        source: anyhow::Error,
    },
}

impl ConnectionError {
    pub fn provider(&self) -> &str {
        match self {
            ConnectionError::UnknownProvider(p) => p,
            ConnectionError::NotReady { provider, .. }
            | ConnectionError::PermanentlyDegraded { provider, .. }
            | ConnectionError::Provider { provider, .. } => provider,
        }
    }
}

/// Errors from the checkpoint store.
#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("No checkpoint found in {}", dir.display())]
    NotFound { dir: PathBuf },

    #[error("Checkpoint at {} is invalid: {reason}", path.display())]
    Invalid { path: PathBuf, reason: String },

    #[error("Specification hash mismatch: checkpoint recorded {recorded}, current is {current}")]
    SpecMismatch { recorded: String, current: String },

    #[error("Specification {} recorded in checkpoint is unreadable: {source}", path.display())]
    SpecUnreadable {
        path: PathBuf,
        #[source]
        source: anyhow::Error,
    },

    #[error("Failed to write checkpoint at {}: {source}", path.display())]
    WriteFailed {
        path: PathBuf,
        #[source]
        source: anyhow::Error,
    },
}

impl CheckpointError {
    /// Whether this error means "nothing to resume" rather than an I/O fault.
    pub fn is_not_resumable(&self) -> bool {
        !matches!(self, CheckpointError::WriteFailed { .. })
    }
}

/// Build-level terminal conditions.
#[derive(Debug, Error)]
pub enum BuildError {
    #[error(
        "Budget exceeded at phase '{phase}': spent {spent:.4}, projected {projected:.4}, budget {budget:.4} (remaining {remaining:.4})"
    )]
    BudgetExceeded {
        phase: String,
        spent: f64,
        projected: f64,
        budget: f64,
        remaining: f64,
    },

    #[error("Build deadline of {secs}s exceeded during phase '{phase}'")]
    DeadlineExceeded { phase: String, secs: u64 },

    #[error("Build is not resumable: {0}")]
    NotResumable(#[source] CheckpointError),

    #[error("Phase '{phase}' failed ({class}): {message}")]
    PhaseFailed {
        phase: String,
        class: FailureClass,
        message: String,
    },

    #[error("Build cancelled during phase '{phase}'")]
    Cancelled { phase: String },

    #[error("Failed to persist checkpoint: {0}")]
    Checkpoint(#[source] CheckpointError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl BuildError {
    pub fn class(&self) -> FailureClass {
        match self {
            BuildError::BudgetExceeded { .. } | BuildError::DeadlineExceeded { .. } => {
                FailureClass::BudgetExceeded
            }
            BuildError::NotResumable(_) => FailureClass::NotResumable,
            BuildError::PhaseFailed { class, .. } => *class,
            BuildError::Cancelled { .. } | BuildError::Checkpoint(_) | BuildError::Other(_) => {
                FailureClass::Fatal
            }
        }
    }

    /// Name of the phase the error is attributed to, if any.
    pub fn phase(&self) -> Option<&str> {
        match self {
            BuildError::BudgetExceeded { phase, .. }
            | BuildError::DeadlineExceeded { phase, .. }
            | BuildError::PhaseFailed { phase, .. }
            | BuildError::Cancelled { phase } => Some(phase),
            BuildError::NotResumable(_) | BuildError::Checkpoint(_) | BuildError::Other(_) => None,
        }
    }

    pub fn exit_code(&self) -> u8 {
        self.class().exit_code()
    }
}

impl From<CheckpointError> for BuildError {
    fn from(err: CheckpointError) -> Self {
        if err.is_not_resumable() {
            BuildError::NotResumable(err)
        } else {
            BuildError::Checkpoint(err)
        }
    }
}
