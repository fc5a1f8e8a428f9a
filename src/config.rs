//! Layered configuration for buildforge.
//!
//! Settings come from `.buildforge/buildforge.toml`, then environment
//! variables, then CLI flags. Every section is optional:
//!
//! ```toml
//! [project]
//! name = "my-app"
//!
//! [build]
//! budget = 25.0
//! max_duration_secs = 7200
//! max_concurrency = 4
//! call_timeout_secs = 600
//!
//! [recovery]
//! max_attempts = 3
//! base_backoff_ms = 1000
//! max_backoff_ms = 30000
//! corrective_retry = true
//!
//! [connections]
//! max_reconnect_attempts = 3
//! health_check_on_open = true
//!
//! [agent]
//! claude_cmd = "claude"
//! model = "sonnet"
//!
//! [[providers]]
//! name = "filesystem"
//! command = "mcp-filesystem"
//! args = ["."]
//!
//! [phases.overrides."code*"]
//! min_cost = 2.0
//! call_timeout_secs = 1200
//!
//! [[hooks]]
//! event = "post_tool_use"
//! command = "./scripts/log-tool.sh"
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::connections::{ConnectionSettings, ProviderConfig};
use crate::cost::Cost;
use crate::executor::ExecutorSettings;
use crate::hooks::HookDefinition;
use crate::orchestrator::OrchestratorSettings;
use crate::phase::{PhaseDefinition, load_phases_or_default};
use crate::recovery::{Backoff, RecoveryPolicy};

/// Project state directory, relative to the project root.
pub const STATE_DIR: &str = ".buildforge";
pub const CONFIG_FILE: &str = "buildforge.toml";
pub const PHASES_FILE: &str = "phases.json";
pub const CHECKPOINT_DIR: &str = "checkpoint";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProjectSection {
    /// Overrides the name taken from the spec heading
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildSection {
    /// Budget used when the CLI does not pass one
    #[serde(default = "default_budget")]
    pub budget: f64,
    #[serde(default)]
    pub max_duration_secs: Option<u64>,
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    #[serde(default = "default_call_timeout_secs")]
    pub call_timeout_secs: u64,
}

fn default_budget() -> f64 {
    25.0
}

fn default_max_concurrency() -> usize {
    4
}

fn default_call_timeout_secs() -> u64 {
    600
}

impl Default for BuildSection {
    fn default() -> Self {
        Self {
            budget: default_budget(),
            max_duration_secs: None,
            max_concurrency: default_max_concurrency(),
            call_timeout_secs: default_call_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoverySection {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_backoff_ms")]
    pub base_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    /// One re-invocation with the validation error appended to the prompt
    #[serde(default = "default_true")]
    pub corrective_retry: bool,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_backoff_ms() -> u64 {
    1000
}

fn default_max_backoff_ms() -> u64 {
    30_000
}

fn default_true() -> bool {
    true
}

impl Default for RecoverySection {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_backoff_ms: default_base_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            corrective_retry: true,
        }
    }
}

impl RecoverySection {
    fn backoff(&self) -> Backoff {
        Backoff::new(
            Duration::from_millis(self.base_backoff_ms),
            Duration::from_millis(self.max_backoff_ms),
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionsSection {
    #[serde(default = "default_max_attempts")]
    pub max_reconnect_attempts: u32,
    #[serde(default = "default_true")]
    pub health_check_on_open: bool,
}

impl Default for ConnectionsSection {
    fn default() -> Self {
        Self {
            max_reconnect_attempts: default_max_attempts(),
            health_check_on_open: true,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentSection {
    /// Claude CLI command (default: "claude")
    #[serde(default)]
    pub claude_cmd: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
}

/// Per-phase settings applied to every phase whose name matches the pattern.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PhaseOverride {
    #[serde(default)]
    pub min_cost: Option<f64>,
    #[serde(default)]
    pub call_timeout_secs: Option<u64>,
    #[serde(default)]
    pub enabled: Option<bool>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PhasesSection {
    #[serde(default)]
    pub overrides: BTreeMap<String, PhaseOverride>,
}

/// The complete buildforge.toml structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BuildforgeToml {
    #[serde(default)]
    pub project: ProjectSection,
    #[serde(default)]
    pub build: BuildSection,
    #[serde(default)]
    pub recovery: RecoverySection,
    #[serde(default)]
    pub connections: ConnectionsSection,
    #[serde(default)]
    pub agent: AgentSection,
    #[serde(default)]
    pub providers: Vec<ProviderConfig>,
    #[serde(default)]
    pub phases: PhasesSection,
    #[serde(default)]
    pub hooks: Vec<HookDefinition>,
}

impl BuildforgeToml {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse buildforge.toml")
    }

    /// Load `buildforge.toml` from `state_dir`, or defaults if it is absent.
    pub fn load_or_default(state_dir: &Path) -> Result<Self> {
        let path = state_dir.join(CONFIG_FILE);
        if path.exists() {
            Self::load(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Apply environment overrides. `env` looks a variable up by name.
    pub fn apply_env(&mut self, env: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(v) = env("BUILDFORGE_BUDGET") {
            self.build.budget = v
                .trim()
                .parse()
                .with_context(|| format!("Invalid BUILDFORGE_BUDGET '{v}'"))?;
        }
        if let Some(v) = env("BUILDFORGE_MAX_CONCURRENCY") {
            self.build.max_concurrency = v
                .trim()
                .parse()
                .with_context(|| format!("Invalid BUILDFORGE_MAX_CONCURRENCY '{v}'"))?;
        }
        if let Some(v) = env("BUILDFORGE_MAX_ATTEMPTS") {
            self.recovery.max_attempts = v
                .trim()
                .parse()
                .with_context(|| format!("Invalid BUILDFORGE_MAX_ATTEMPTS '{v}'"))?;
        }
        if let Some(v) = env("CLAUDE_CMD").filter(|v| !v.trim().is_empty()) {
            self.agent.claude_cmd = Some(v);
        }
        Ok(())
    }

    /// Apply every matching override to `phases`, in pattern order.
    pub fn apply_overrides(&self, phases: &mut [PhaseDefinition]) {
        for phase in phases.iter_mut() {
            for (pattern, o) in &self.phases.overrides {
                if !pattern_matches(pattern, &phase.name) {
                    continue;
                }
                if let Some(min_cost) = o.min_cost {
                    phase.min_cost = Cost::from_f64(min_cost);
                }
                if let Some(secs) = o.call_timeout_secs {
                    phase.call_timeout_secs = Some(secs);
                }
                if let Some(enabled) = o.enabled {
                    phase.enabled = enabled;
                }
            }
        }
    }

    /// Check the configuration and return human-readable warnings.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        if self.build.budget <= 0.0 {
            warnings.push(format!(
                "build.budget is {}; every phase will be refused",
                self.build.budget
            ));
        }
        if self.build.max_concurrency == 0 {
            warnings.push("build.max_concurrency is 0; one invocation will run at a time".into());
        }
        if self.build.call_timeout_secs == 0 {
            warnings.push("build.call_timeout_secs is 0; every agent call will time out".into());
        }
        if self.recovery.max_attempts == 0 {
            warnings.push("recovery.max_attempts is 0; failed invocations are never retried".into());
        }
        if self.recovery.base_backoff_ms > self.recovery.max_backoff_ms {
            warnings.push(format!(
                "recovery.base_backoff_ms ({}) exceeds max_backoff_ms ({})",
                self.recovery.base_backoff_ms, self.recovery.max_backoff_ms
            ));
        }
        for (pattern, o) in &self.phases.overrides {
            if let Some(min_cost) = o.min_cost
                && min_cost < 0.0
            {
                warnings.push(format!(
                    "Negative min_cost {min_cost} in override for pattern '{pattern}'"
                ));
            }
        }

        let mut names = std::collections::BTreeSet::new();
        for provider in &self.providers {
            if !names.insert(provider.name.as_str()) {
                warnings.push(format!("Provider '{}' is declared twice", provider.name));
            }
            if provider.command.trim().is_empty() {
                warnings.push(format!("Provider '{}' has an empty command", provider.name));
            }
        }
        warnings
    }
}

/// Case-insensitive glob match supporting `*` (any run) and `?` (one char).
pub fn pattern_matches(pattern: &str, name: &str) -> bool {
    let pattern: Vec<char> = pattern.to_lowercase().chars().collect();
    let name: Vec<char> = name.to_lowercase().chars().collect();

    let (mut p, mut n) = (0, 0);
    // Position of the last `*` and the name index it was tried at.
    let mut backtrack: Option<(usize, usize)> = None;

    while n < name.len() {
        match pattern.get(p) {
            Some('*') => {
                backtrack = Some((p, n));
                p += 1;
            }
            Some(&c) if c == '?' || c == name[n] => {
                p += 1;
                n += 1;
            }
            _ => match backtrack {
                Some((star, tried)) => {
                    p = star + 1;
                    n = tried + 1;
                    backtrack = Some((star, tried + 1));
                }
                None => return false,
            },
        }
    }
    pattern[p..].iter().all(|&c| c == '*')
}

/// Effective runtime configuration for one project.
#[derive(Debug, Clone)]
pub struct Config {
    pub project_dir: PathBuf,
    pub state_dir: PathBuf,
    pub toml: BuildforgeToml,
    pub verbose: bool,
}

impl Config {
    /// Resolve configuration for `project_dir` from the file and the
    /// process environment.
    pub fn load(project_dir: &Path, verbose: bool) -> Result<Self> {
        Self::load_with_env(project_dir, verbose, |key| std::env::var(key).ok())
    }

    pub fn load_with_env(
        project_dir: &Path,
        verbose: bool,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<Self> {
        let project_dir = project_dir
            .canonicalize()
            .with_context(|| format!("Failed to resolve project directory: {}", project_dir.display()))?;
        let state_dir = project_dir.join(STATE_DIR);
        let mut toml = BuildforgeToml::load_or_default(&state_dir)?;
        toml.apply_env(env)?;

        Ok(Self {
            project_dir,
            state_dir,
            toml,
            verbose,
        })
    }

    pub fn config_file(&self) -> PathBuf {
        self.state_dir.join(CONFIG_FILE)
    }

    pub fn phases_file(&self) -> PathBuf {
        self.state_dir.join(PHASES_FILE)
    }

    pub fn checkpoint_dir(&self) -> PathBuf {
        self.state_dir.join(CHECKPOINT_DIR)
    }

    /// CLI value, else the configured default.
    pub fn budget(&self, cli: Option<f64>) -> f64 {
        cli.unwrap_or(self.toml.build.budget)
    }

    pub fn claude_cmd(&self) -> String {
        self.toml
            .agent
            .claude_cmd
            .clone()
            .unwrap_or_else(|| "claude".to_string())
    }

    pub fn model(&self) -> Option<String> {
        self.toml.agent.model.clone()
    }

    pub fn project_name(&self) -> Option<String> {
        self.toml.project.name.clone()
    }

    pub fn providers(&self) -> Vec<ProviderConfig> {
        self.toml.providers.clone()
    }

    pub fn hooks(&self) -> &[HookDefinition] {
        &self.toml.hooks
    }

    pub fn recovery_policy(&self) -> RecoveryPolicy {
        RecoveryPolicy {
            max_attempts: self.toml.recovery.max_attempts.max(1),
            backoff: self.toml.recovery.backoff(),
            corrective_retry: self.toml.recovery.corrective_retry,
        }
    }

    pub fn connection_settings(&self) -> ConnectionSettings {
        ConnectionSettings {
            max_reconnect_attempts: self.toml.connections.max_reconnect_attempts,
            backoff: self.toml.recovery.backoff(),
            health_check_on_open: self.toml.connections.health_check_on_open,
        }
    }

    pub fn orchestrator_settings(&self) -> OrchestratorSettings {
        OrchestratorSettings {
            max_duration: self.toml.build.max_duration_secs.map(Duration::from_secs),
            executor: ExecutorSettings {
                max_concurrency: self.toml.build.max_concurrency.max(1),
                call_timeout: Duration::from_secs(self.toml.build.call_timeout_secs),
            },
            policy: self.recovery_policy(),
            connections: self.connection_settings(),
        }
    }

    /// The phase table (`phases.json` or the defaults) with overrides applied.
    pub fn phases(&self) -> Result<Vec<PhaseDefinition>> {
        let mut phases = load_phases_or_default(Some(&self.phases_file()))?;
        self.toml.apply_overrides(&mut phases);
        Ok(phases)
    }

    pub fn validate(&self) -> Vec<String> {
        self.toml.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hooks::HookEvent;
    use crate::phase::default_phases;
    use std::collections::HashMap;
    use tempfile::tempdir;

    fn env_of(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_pattern_matches() {
        assert!(pattern_matches("testing", "testing"));
        assert!(!pattern_matches("testing", "testings"));
        assert!(pattern_matches("code*", "code_generation"));
        assert!(pattern_matches("*ing", "testing"));
        assert!(!pattern_matches("*ing", "documentation"));
        assert!(pattern_matches("task_*_down", "task_break_down"));
        assert!(pattern_matches("phase-0?", "phase-01"));
        assert!(!pattern_matches("phase-0?", "phase-10"));
        assert!(pattern_matches("CODE*", "code_generation"));
        assert!(pattern_matches("*", ""));
        assert!(pattern_matches("a*b*c", "axxbyyc"));
        assert!(!pattern_matches("a*b*c", "axxbyy"));
    }

    #[test]
    fn test_parse_empty_uses_defaults() {
        let toml = BuildforgeToml::parse("").unwrap();
        assert_eq!(toml.build.budget, 25.0);
        assert_eq!(toml.build.max_concurrency, 4);
        assert_eq!(toml.recovery.max_attempts, 3);
        assert!(toml.recovery.corrective_retry);
        assert!(toml.providers.is_empty());
        assert!(toml.validate().is_empty());
    }

    #[test]
    fn test_parse_full_file() {
        let content = r#"
[project]
name = "todo"

[build]
budget = 12.5
max_duration_secs = 3600
max_concurrency = 2

[recovery]
max_attempts = 5
corrective_retry = false

[agent]
claude_cmd = "/opt/claude"
model = "sonnet"

[[providers]]
name = "filesystem"
command = "mcp-fs"
args = ["."]

[phases.overrides."code*"]
min_cost = 2.0
call_timeout_secs = 1200

[[hooks]]
event = "post_tool_use"
command = "./log.sh"
match = "testing"
"#;
        let toml = BuildforgeToml::parse(content).unwrap();
        assert_eq!(toml.project.name.as_deref(), Some("todo"));
        assert_eq!(toml.build.budget, 12.5);
        assert_eq!(toml.build.max_duration_secs, Some(3600));
        assert_eq!(toml.recovery.max_attempts, 5);
        assert!(!toml.recovery.corrective_retry);
        assert_eq!(toml.agent.model.as_deref(), Some("sonnet"));
        assert_eq!(toml.providers[0].args, vec!["."]);
        assert_eq!(toml.phases.overrides["code*"].min_cost, Some(2.0));
        assert_eq!(toml.hooks[0].event, HookEvent::PostToolUse);
        assert_eq!(toml.hooks[0].phase_match.as_deref(), Some("testing"));
    }

    #[test]
    fn test_env_overrides_file() {
        let mut toml = BuildforgeToml::parse("[build]\nbudget = 5.0").unwrap();
        toml.apply_env(env_of(&[
            ("BUILDFORGE_BUDGET", "40"),
            ("BUILDFORGE_MAX_ATTEMPTS", "2"),
            ("CLAUDE_CMD", "my-claude"),
        ]))
        .unwrap();
        assert_eq!(toml.build.budget, 40.0);
        assert_eq!(toml.recovery.max_attempts, 2);
        assert_eq!(toml.agent.claude_cmd.as_deref(), Some("my-claude"));
    }

    #[test]
    fn test_invalid_env_value_is_an_error() {
        let mut toml = BuildforgeToml::default();
        let err = toml
            .apply_env(env_of(&[("BUILDFORGE_MAX_CONCURRENCY", "many")]))
            .unwrap_err();
        assert!(err.to_string().contains("BUILDFORGE_MAX_CONCURRENCY"));
    }

    #[test]
    fn test_overrides_apply_to_matching_phases() {
        let toml = BuildforgeToml::parse(
            r#"
[phases.overrides."code*"]
min_cost = 2.0
call_timeout_secs = 1200

[phases.overrides.documentation]
enabled = false
"#,
        )
        .unwrap();
        let mut phases = default_phases();
        toml.apply_overrides(&mut phases);

        let code = phases.iter().find(|p| p.name == "code_generation").unwrap();
        assert_eq!(code.min_cost, Cost::from_f64(2.0));
        assert_eq!(code.call_timeout(), Some(Duration::from_secs(1200)));
        let docs = phases.iter().find(|p| p.name == "documentation").unwrap();
        assert!(!docs.enabled);
        let analysis = phases.iter().find(|p| p.name == "analysis").unwrap();
        assert!(analysis.enabled);
        assert_eq!(analysis.call_timeout(), None);
    }

    #[test]
    fn test_validate_warns() {
        let toml = BuildforgeToml::parse(
            r#"
[build]
max_concurrency = 0

[recovery]
max_attempts = 0

[phases.overrides."*"]
min_cost = -1.0

[[providers]]
name = "fs"
command = "a"

[[providers]]
name = "fs"
command = ""
"#,
        )
        .unwrap();
        let warnings = toml.validate();
        assert!(warnings.iter().any(|w| w.contains("max_concurrency")));
        assert!(warnings.iter().any(|w| w.contains("max_attempts")));
        assert!(warnings.iter().any(|w| w.contains("Negative min_cost")));
        assert!(warnings.iter().any(|w| w.contains("declared twice")));
        assert!(warnings.iter().any(|w| w.contains("empty command")));
    }

    #[test]
    fn test_config_load_resolves_paths_and_settings() {
        let dir = tempdir().unwrap();
        let state = dir.path().join(STATE_DIR);
        std::fs::create_dir_all(&state).unwrap();
        std::fs::write(
            state.join(CONFIG_FILE),
            "[build]\nmax_duration_secs = 60\n[recovery]\nbase_backoff_ms = 10\nmax_backoff_ms = 100\n",
        )
        .unwrap();

        let config = Config::load_with_env(dir.path(), false, env_of(&[])).unwrap();
        let root = dir.path().canonicalize().unwrap();
        assert_eq!(config.checkpoint_dir(), root.join(".buildforge/checkpoint"));
        assert_eq!(config.claude_cmd(), "claude");
        assert_eq!(config.budget(None), 25.0);
        assert_eq!(config.budget(Some(3.0)), 3.0);

        let settings = config.orchestrator_settings();
        assert_eq!(settings.max_duration, Some(Duration::from_secs(60)));
        assert_eq!(settings.policy.backoff.base, Duration::from_millis(10));
        assert_eq!(settings.connections.backoff.max, Duration::from_millis(100));
        assert_eq!(config.phases().unwrap().len(), 6);
    }

    #[test]
    fn test_config_load_rejects_bad_toml() {
        let dir = tempdir().unwrap();
        let state = dir.path().join(STATE_DIR);
        std::fs::create_dir_all(&state).unwrap();
        std::fs::write(state.join(CONFIG_FILE), "[build\nbudget = ").unwrap();
        assert!(Config::load_with_env(dir.path(), false, env_of(&[])).is_err());
    }
}
