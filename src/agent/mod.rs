//! Agents: the pluggable units that turn a prompt into a result.
//!
//! The set of agents is closed (`AgentKind`); which agents run in a phase is
//! decided by the phase definition table. Every agent talks to the outside
//! world through a single `QueryBackend` capability.

pub mod claude;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::time::Duration;

use crate::cost::Cost;
use crate::errors::{AgentError, FailureClass};
use crate::util::{parse_embedded_json, truncate};

pub use claude::ClaudeCliBackend;

/// Output produced by one backend query.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryOutput {
    pub text: String,
    pub cost: Cost,
    pub tokens: u64,
}

/// A failed query together with whatever the provider billed for it.
#[derive(Debug)]
pub struct QueryFailure {
    pub error: AgentError,
    pub cost: Cost,
    pub tokens: u64,
}

impl QueryFailure {
    pub fn billed(error: AgentError, cost: Cost, tokens: u64) -> Self {
        Self { error, cost, tokens }
    }
}

impl From<AgentError> for QueryFailure {
    fn from(error: AgentError) -> Self {
        Self::billed(error, Cost::ZERO, 0)
    }
}

impl std::fmt::Display for QueryFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} (billed {}, {} tokens)", self.error, self.cost, self.tokens)
    }
}

/// The external model-querying capability.
///
/// A failed query still reports the spend the provider charged before
/// failing, so retries are billed.
#[async_trait]
pub trait QueryBackend: Send + Sync {
    async fn query(
        &self,
        prompt: &str,
        allowed_capabilities: &BTreeSet<String>,
    ) -> Result<QueryOutput, QueryFailure>;
}

/// The closed set of agent variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentKind {
    Analyzer,
    Planner,
    InstructionBuilder,
    Generator,
    Tester,
    Reviewer,
    Documenter,
}

impl AgentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentKind::Analyzer => "analyzer",
            AgentKind::Planner => "planner",
            AgentKind::InstructionBuilder => "instruction_builder",
            AgentKind::Generator => "generator",
            AgentKind::Tester => "tester",
            AgentKind::Reviewer => "reviewer",
            AgentKind::Documenter => "documenter",
        }
    }

    fn role(&self) -> &'static str {
        match self {
            AgentKind::Analyzer => {
                "You are a requirements analyst. Summarize the goals, constraints, components and risks of the project."
            }
            AgentKind::Planner => {
                "You are a technical planner. Break the work into ordered implementation tasks. Respond with a JSON object of the form {\"tasks\": [{\"id\": ..., \"title\": ..., \"depends_on\": [...]}]}."
            }
            AgentKind::InstructionBuilder => {
                "You are a senior engineer. Turn each task into precise, self-contained implementation instructions."
            }
            AgentKind::Generator => {
                "You are a software engineer. Implement the instructions, producing complete source files."
            }
            AgentKind::Tester => {
                "You are a test engineer. Write tests covering the generated code and report how to run them."
            }
            AgentKind::Reviewer => {
                "You are a code reviewer. Point out defects and risks in the results above. Be concise."
            }
            AgentKind::Documenter => {
                "You are a technical writer. Write the README and usage documentation for the project."
            }
        }
    }

    /// The output format this agent produces unless the phase table says otherwise.
    pub fn default_output(&self) -> OutputFormat {
        match self {
            AgentKind::Planner => OutputFormat::Json,
            _ => OutputFormat::Text,
        }
    }

    /// Render the prompt for one invocation of this agent.
    pub fn build_prompt(&self, ctx: &PromptContext<'_>) -> String {
        let mut prompt = format!("[phase: {} | agent: {}]\n\n", ctx.phase, ctx.step_id);
        prompt.push_str(self.role());
        prompt.push_str("\n\n## SPECIFICATION\n\n");
        prompt.push_str(ctx.spec.trim_end());
        prompt.push('\n');

        if !ctx.prior_outputs.is_empty() {
            prompt.push_str("\n## PRIOR PHASE OUTPUTS\n");
            for (phase, output) in ctx.prior_outputs {
                prompt.push_str(&format!("\n### {phase}\n\n{}\n", output.trim_end()));
            }
        }

        if !ctx.earlier_results.is_empty() {
            prompt.push_str("\n## EARLIER RESULTS IN THIS PHASE\n");
            for (step, result) in ctx.earlier_results {
                prompt.push_str(&format!("\n### {step}\n\n{}\n", result.trim_end()));
            }
        }

        prompt.push_str(&format!("\n## TASK\n\n{}\n", ctx.task));

        if let Some(reason) = ctx.correction {
            prompt.push_str(&format!(
                "\n## CORRECTION\n\nYour previous answer was rejected: {reason}\nReturn a corrected answer.\n"
            ));
        }
        prompt
    }

    /// Run one invocation against `backend`, bounded by `timeout`.
    ///
    /// Never fails: a timeout, backend error or rejected output becomes an
    /// unsuccessful `AgentResponse` for the recovery policy to handle.
    pub async fn invoke(
        &self,
        backend: &dyn QueryBackend,
        invocation: &AgentInvocation,
        timeout: Duration,
    ) -> AgentResponse {
        let query = backend.query(&invocation.prompt, &invocation.capabilities);
        match tokio::time::timeout(timeout, query).await {
            Err(_) => AgentResponse::failure(
                invocation,
                AgentError::Timeout {
                    secs: timeout.as_secs(),
                },
                Cost::ZERO,
                0,
            ),
            Ok(Err(failure)) => {
                AgentResponse::failure(invocation, failure.error, failure.cost, failure.tokens)
            }
            Ok(Ok(output)) => match invocation.output.validate(&output.text) {
                Ok(()) => AgentResponse::success(invocation, output),
                // The provider already billed this attempt.
                Err(err) => AgentResponse::failure(invocation, err, output.cost, output.tokens),
            },
        }
    }
}

impl std::fmt::Display for AgentKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Inputs for prompt rendering.
#[derive(Debug, Clone, Copy)]
pub struct PromptContext<'a> {
    pub phase: &'a str,
    pub step_id: &'a str,
    pub spec: &'a str,
    pub task: &'a str,
    pub prior_outputs: &'a [(String, String)],
    pub earlier_results: &'a [(String, String)],
    pub correction: Option<&'a str>,
}

/// Expected shape of an agent's result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

impl OutputFormat {
    /// Reject malformed or unusable output.
    pub fn validate(&self, text: &str) -> Result<(), AgentError> {
        if text.trim().is_empty() {
            return Err(AgentError::Validation("agent returned empty output".into()));
        }
        match self {
            OutputFormat::Text => Ok(()),
            OutputFormat::Json => parse_embedded_json::<serde_json::Value>(text)
                .map(|_| ())
                .map_err(|reason| {
                    AgentError::Validation(format!(
                        "expected a JSON object ({reason}) in: {}",
                        truncate(text.trim(), 120)
                    ))
                }),
        }
    }
}

/// A single call to an agent for a phase.
#[derive(Debug, Clone)]
pub struct AgentInvocation {
    pub phase: String,
    pub step_id: String,
    pub agent: AgentKind,
    pub prompt: String,
    pub capabilities: BTreeSet<String>,
    pub output: OutputFormat,
    /// 1-based attempt number
    pub attempt: u32,
}

/// Error half of an unsuccessful `AgentResponse`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseError {
    pub class: FailureClass,
    pub message: String,
}

impl From<&AgentError> for ResponseError {
    fn from(err: &AgentError) -> Self {
        Self {
            class: err.class(),
            message: err.to_string(),
        }
    }
}

impl std::fmt::Display for ResponseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.message, self.class)
    }
}

/// Immutable outcome of one invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentResponse {
    pub step_id: String,
    pub agent: AgentKind,
    pub attempt: u32,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ResponseError>,
    pub cost: Cost,
    pub tokens: u64,
    pub timestamp: DateTime<Utc>,
}

impl AgentResponse {
    pub fn success(invocation: &AgentInvocation, output: QueryOutput) -> Self {
        Self {
            step_id: invocation.step_id.clone(),
            agent: invocation.agent,
            attempt: invocation.attempt,
            success: true,
            result: Some(output.text),
            error: None,
            cost: output.cost,
            tokens: output.tokens,
            timestamp: Utc::now(),
        }
    }

    pub fn failure(invocation: &AgentInvocation, err: AgentError, cost: Cost, tokens: u64) -> Self {
        Self {
            step_id: invocation.step_id.clone(),
            agent: invocation.agent,
            attempt: invocation.attempt,
            success: false,
            result: None,
            error: Some(ResponseError::from(&err)),
            cost,
            tokens,
            timestamp: Utc::now(),
        }
    }

    /// Failure class of an unsuccessful response.
    pub fn failure_class(&self) -> Option<FailureClass> {
        self.error.as_ref().map(|e| e.class)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedBackend;

    fn invocation(output: OutputFormat) -> AgentInvocation {
        AgentInvocation {
            phase: "analysis".into(),
            step_id: "analyzer".into(),
            agent: AgentKind::Analyzer,
            prompt: "[phase: analysis | agent: analyzer]\n".into(),
            capabilities: BTreeSet::new(),
            output,
            attempt: 1,
        }
    }

    #[test]
    fn test_prompt_contains_sections_in_order() {
        let prior = vec![("analysis".to_string(), "It is a todo app.".to_string())];
        let earlier = vec![("tester".to_string(), "tests written".to_string())];
        let prompt = AgentKind::Reviewer.build_prompt(&PromptContext {
            phase: "testing",
            step_id: "test_reviewer",
            spec: "# Todo\n",
            task: "Review the tests.",
            prior_outputs: &prior,
            earlier_results: &earlier,
            correction: Some("too vague"),
        });

        assert!(prompt.starts_with("[phase: testing | agent: test_reviewer]"));
        let spec = prompt.find("## SPECIFICATION").unwrap();
        let prior_idx = prompt.find("## PRIOR PHASE OUTPUTS").unwrap();
        let earlier_idx = prompt.find("## EARLIER RESULTS").unwrap();
        let task = prompt.find("## TASK").unwrap();
        let correction = prompt.find("## CORRECTION").unwrap();
        assert!(spec < prior_idx && prior_idx < earlier_idx && earlier_idx < task && task < correction);
        assert!(prompt.contains("too vague"));
    }

    #[test]
    fn test_json_output_validation() {
        assert!(OutputFormat::Json.validate(r#"Plan: {"tasks": []}"#).is_ok());
        let err = OutputFormat::Json.validate("just prose").unwrap_err();
        assert_eq!(err.class(), FailureClass::Validation);
        assert!(OutputFormat::Text.validate("   ").is_err());
        assert!(OutputFormat::Text.validate("fine").is_ok());
    }

    #[tokio::test]
    async fn test_invoke_success_carries_cost() {
        let backend = ScriptedBackend::new().push_ok("analyzer", "done", 0.25, 100);
        let response = AgentKind::Analyzer
            .invoke(&backend, &invocation(OutputFormat::Text), Duration::from_secs(5))
            .await;
        assert!(response.success);
        assert_eq!(response.result.as_deref(), Some("done"));
        assert_eq!(response.cost, Cost::from_f64(0.25));
        assert_eq!(response.tokens, 100);
    }

    #[tokio::test]
    async fn test_invoke_rejected_output_keeps_billed_cost() {
        let backend = ScriptedBackend::new().push_ok("analyzer", "not json", 0.5, 10);
        let response = AgentKind::Analyzer
            .invoke(&backend, &invocation(OutputFormat::Json), Duration::from_secs(5))
            .await;
        assert!(!response.success);
        assert_eq!(response.failure_class(), Some(FailureClass::Validation));
        assert_eq!(response.cost, Cost::from_f64(0.5));
    }

    #[tokio::test]
    async fn test_invoke_failed_query_keeps_billed_cost() {
        let backend = ScriptedBackend::new().push_billed_err(
            "analyzer",
            AgentError::Provider("max turns reached".into()),
            1.5,
            1500,
        );
        let response = AgentKind::Analyzer
            .invoke(&backend, &invocation(OutputFormat::Text), Duration::from_secs(5))
            .await;
        assert!(!response.success);
        assert_eq!(response.failure_class(), Some(FailureClass::Fatal));
        assert_eq!(response.cost, Cost::from_f64(1.5));
        assert_eq!(response.tokens, 1500);
    }

    #[tokio::test(start_paused = true)]
    async fn test_invoke_timeout_becomes_transient_response() {
        let backend = ScriptedBackend::new().push_hang("analyzer");
        let response = AgentKind::Analyzer
            .invoke(&backend, &invocation(OutputFormat::Text), Duration::from_secs(2))
            .await;
        assert!(!response.success);
        assert_eq!(response.failure_class(), Some(FailureClass::Transient));
        assert!(response.error.unwrap().message.contains("timed out"));
    }
}
