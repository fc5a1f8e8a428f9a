//! Phase definitions for the build pipeline.
//!
//! This module provides:
//! - `PhaseStatus`, the lifecycle of a phase as recorded by the orchestrator
//! - `PhaseDefinition` / `AgentStep`, the static invocation plan of a phase
//! - `PhaseResult`, the aggregated outcome of one phase
//! - `PhasesFile` for loading a custom phase table from `phases.json`
//! - The default six-phase table as a fallback

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::Path;
use std::time::Duration;

use crate::agent::{AgentKind, AgentResponse, OutputFormat, ResponseError};
use crate::cost::Cost;

pub const ANALYSIS: &str = "analysis";
pub const TASK_BREAKDOWN: &str = "task_breakdown";
pub const INSTRUCTION_BUILDING: &str = "instruction_building";
pub const CODE_GENERATION: &str = "code_generation";
pub const TESTING: &str = "testing";
pub const DOCUMENTATION: &str = "documentation";

/// Status of a phase. Only the orchestrator mutates it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PhaseStatus {
    #[default]
    Pending,
    InProgress,
    Completed,
    Failed,
    Skipped,
}

impl PhaseStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Skipped)
    }

    /// Completed or explicitly skipped phases unblock their successors.
    pub fn unblocks_successors(&self) -> bool {
        matches!(self, Self::Completed | Self::Skipped)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PhaseStatus::Pending => "pending",
            PhaseStatus::InProgress => "in_progress",
            PhaseStatus::Completed => "completed",
            PhaseStatus::Failed => "failed",
            PhaseStatus::Skipped => "skipped",
        }
    }
}

impl std::fmt::Display for PhaseStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Where a successful agent result is handed off through a tool provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactSink {
    pub provider: String,
    pub capability: String,
}

fn default_true() -> bool {
    true
}

/// One agent invocation within a phase plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentStep {
    /// Identifier unique within the phase (e.g. "analyzer")
    pub id: String,
    pub agent: AgentKind,
    /// Optional (advisory) steps may fail without failing the phase
    #[serde(default = "default_true")]
    pub required: bool,
    /// Capabilities the agent may use, as `provider:capability`
    #[serde(default)]
    pub capabilities: BTreeSet<String>,
    #[serde(default)]
    pub output: OutputFormat,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sink: Option<ArtifactSink>,
}

impl AgentStep {
    pub fn required(id: &str, agent: AgentKind) -> Self {
        Self {
            id: id.to_string(),
            agent,
            required: true,
            capabilities: BTreeSet::new(),
            output: agent.default_output(),
            sink: None,
        }
    }

    pub fn optional(id: &str, agent: AgentKind) -> Self {
        Self {
            required: false,
            ..Self::required(id, agent)
        }
    }

    pub fn with_capabilities<I, S>(mut self, capabilities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.capabilities = capabilities.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_output(mut self, output: OutputFormat) -> Self {
        self.output = output;
        self
    }

    pub fn with_sink(mut self, provider: &str, capability: &str) -> Self {
        self.sink = Some(ArtifactSink {
            provider: provider.to_string(),
            capability: capability.to_string(),
        });
        self
    }

    /// Provider names referenced by the capability set.
    pub fn providers(&self) -> BTreeSet<&str> {
        self.capabilities
            .iter()
            .filter_map(|cap| cap.split_once(':').map(|(provider, _)| provider))
            .collect()
    }
}

/// Static definition of a phase: its invocation plan and cost projection.
///
/// Steps are grouped into waves. Steps inside one wave are independent and
/// may run concurrently; waves run in declared order and later waves see the
/// results of earlier ones.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseDefinition {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub waves: Vec<Vec<AgentStep>>,
    /// Projected minimum cost; the phase is not started if it does not fit
    #[serde(default)]
    pub min_cost: Cost,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub call_timeout_secs: Option<u64>,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl PhaseDefinition {
    pub fn new(name: &str, description: &str) -> Self {
        Self {
            name: name.to_string(),
            description: description.to_string(),
            waves: Vec::new(),
            min_cost: Cost::ZERO,
            call_timeout_secs: None,
            enabled: true,
        }
    }

    /// Append a step in a new wave, after everything declared so far.
    pub fn then_run(mut self, step: AgentStep) -> Self {
        self.waves.push(vec![step]);
        self
    }

    /// Add a step to the last wave, running alongside its siblings.
    pub fn alongside(mut self, step: AgentStep) -> Self {
        match self.waves.last_mut() {
            Some(wave) => wave.push(step),
            None => self.waves.push(vec![step]),
        }
        self
    }

    pub fn with_min_cost(mut self, min_cost: f64) -> Self {
        self.min_cost = Cost::from_f64(min_cost);
        self
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout_secs = Some(timeout.as_secs().max(1));
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    pub fn steps(&self) -> impl Iterator<Item = &AgentStep> {
        self.waves.iter().flatten()
    }

    pub fn call_timeout(&self) -> Option<Duration> {
        self.call_timeout_secs.map(Duration::from_secs)
    }

    /// Validate structural properties of the plan.
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            anyhow::bail!("Phase name must not be empty");
        }
        if self.waves.iter().all(|w| w.is_empty()) {
            anyhow::bail!("Phase '{}' has no agent steps", self.name);
        }
        let mut seen = BTreeSet::new();
        for step in self.steps() {
            if !seen.insert(step.id.as_str()) {
                anyhow::bail!("Phase '{}' declares step '{}' twice", self.name, step.id);
            }
        }
        Ok(())
    }
}

/// Aggregated outcome of one phase.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseResult {
    pub phase: String,
    pub status: PhaseStatus,
    pub responses: Vec<AgentResponse>,
    #[serde(with = "duration_millis")]
    pub duration: Duration,
    pub cost: Cost,
    pub tokens: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ResponseError>,
    /// Combined output handed to later phases
    #[serde(default)]
    pub output: String,
}

impl PhaseResult {
    pub fn skipped(phase: &str) -> Self {
        Self {
            phase: phase.to_string(),
            status: PhaseStatus::Skipped,
            responses: Vec::new(),
            duration: Duration::ZERO,
            cost: Cost::ZERO,
            tokens: 0,
            error: None,
            output: String::new(),
        }
    }

    pub fn is_completed(&self) -> bool {
        self.status == PhaseStatus::Completed
    }
}

pub(crate) mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        (duration.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

/// A custom phase table stored as `.buildforge/phases.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhasesFile {
    pub phases: Vec<PhaseDefinition>,
}

impl PhasesFile {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read phases file: {}", path.display()))?;

        let phases_file: PhasesFile = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse phases JSON: {}", path.display()))?;

        for phase in &phases_file.phases {
            phase.validate()?;
        }
        Ok(phases_file)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let content =
            serde_json::to_string_pretty(self).context("Failed to serialize phases to JSON")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write phases file: {}", path.display()))?;
        Ok(())
    }
}

/// The default pipeline: analysis through documentation.
pub fn default_phases() -> Vec<PhaseDefinition> {
    vec![
        PhaseDefinition::new(ANALYSIS, "Analyze the specification: goals, constraints, components and risks.")
            .then_run(
                AgentStep::required("analyzer", AgentKind::Analyzer)
                    .with_capabilities(["filesystem:read_file", "memory:store"]),
            )
            .with_min_cost(0.05),
        PhaseDefinition::new(TASK_BREAKDOWN, "Break the analysis into an ordered list of implementation tasks.")
            .then_run(AgentStep::required("planner", AgentKind::Planner))
            .with_min_cost(0.05),
        PhaseDefinition::new(INSTRUCTION_BUILDING, "Turn each task into precise implementation instructions.")
            .then_run(AgentStep::required("instruction_builder", AgentKind::InstructionBuilder))
            .with_min_cost(0.05),
        PhaseDefinition::new(CODE_GENERATION, "Generate the project source code following the instructions.")
            .then_run(
                AgentStep::required("generator", AgentKind::Generator)
                    .with_capabilities([
                        "filesystem:read_file",
                        "filesystem:write_file",
                        "git:commit",
                    ])
                    .with_sink("filesystem", "write_artifact"),
            )
            .then_run(AgentStep::optional("code_reviewer", AgentKind::Reviewer))
            .with_min_cost(0.20),
        PhaseDefinition::new(TESTING, "Write and run tests for the generated code.")
            .then_run(
                AgentStep::required("tester", AgentKind::Tester)
                    .with_capabilities(["filesystem:read_file", "filesystem:write_file"]),
            )
            .alongside(AgentStep::optional("test_reviewer", AgentKind::Reviewer))
            .with_min_cost(0.10),
        PhaseDefinition::new(DOCUMENTATION, "Document the project: README, usage and architecture notes.")
            .then_run(
                AgentStep::required("documenter", AgentKind::Documenter)
                    .with_capabilities(["filesystem:write_file"])
                    .with_sink("filesystem", "write_artifact"),
            )
            .with_min_cost(0.05),
    ]
}

/// Load the phase table from `phases.json` if present, else the defaults.
pub fn load_phases_or_default(phases_file: Option<&Path>) -> Result<Vec<PhaseDefinition>> {
    match phases_file {
        Some(path) if path.exists() => Ok(PhasesFile::load(path)?.phases),
        _ => Ok(default_phases()),
    }
}

pub fn phase_names(phases: &[PhaseDefinition]) -> Vec<String> {
    phases.iter().map(|p| p.name.clone()).collect()
}
