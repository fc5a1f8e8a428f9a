//! Command hook definitions, loaded from `[[hooks]]` in `buildforge.toml`.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use super::types::{HookContext, HookEvent};
use crate::config::pattern_matches;

fn default_timeout() -> u64 {
    30
}

fn default_enabled() -> bool {
    true
}

/// A single command hook.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HookDefinition {
    pub event: HookEvent,

    /// Optional glob matched against the phase name ("code*")
    #[serde(default, rename = "match")]
    pub phase_match: Option<String>,

    /// Shell command; relative paths resolve against the project directory
    pub command: String,

    #[serde(default)]
    pub working_dir: Option<PathBuf>,

    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,

    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

impl HookDefinition {
    pub fn command(event: HookEvent, command: impl Into<String>) -> Self {
        Self {
            event,
            phase_match: None,
            command: command.into(),
            working_dir: None,
            timeout_secs: default_timeout(),
            enabled: true,
        }
    }

    pub fn with_match(mut self, pattern: impl Into<String>) -> Self {
        self.phase_match = Some(pattern.into());
        self
    }

    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.timeout_secs = secs;
        self
    }

    /// Whether this hook fires for `ctx`. A phase pattern never matches
    /// contexts without a phase (tool-use events).
    pub fn matches(&self, ctx: &HookContext) -> bool {
        if !self.enabled || self.event != ctx.event {
            return false;
        }
        match (&self.phase_match, &ctx.phase) {
            (None, _) => true,
            (Some(pattern), Some(phase)) => pattern_matches(pattern, phase),
            (Some(_), None) => false,
        }
    }
}
