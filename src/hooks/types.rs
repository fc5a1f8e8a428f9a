//! Hook events, the context passed to observers, and the `Observer` trait.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::agent::AgentResponse;

/// Extension points at which observers run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HookEvent {
    /// Before each agent invocation attempt
    PreInvocation,
    /// After each agent invocation attempt, successful or not
    PostInvocation,
    /// Before a tool provider capability is invoked
    PreToolUse,
    /// After a tool provider capability returns
    PostToolUse,
}

impl HookEvent {
    pub fn all() -> &'static [HookEvent] {
        &[
            HookEvent::PreInvocation,
            HookEvent::PostInvocation,
            HookEvent::PreToolUse,
            HookEvent::PostToolUse,
        ]
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            HookEvent::PreInvocation => "pre_invocation",
            HookEvent::PostInvocation => "post_invocation",
            HookEvent::PreToolUse => "pre_tool_use",
            HookEvent::PostToolUse => "post_tool_use",
        }
    }
}

impl std::fmt::Display for HookEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for HookEvent {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "pre_invocation" => Ok(HookEvent::PreInvocation),
            "post_invocation" => Ok(HookEvent::PostInvocation),
            "pre_tool_use" => Ok(HookEvent::PreToolUse),
            "post_tool_use" => Ok(HookEvent::PostToolUse),
            _ => anyhow::bail!(
                "Invalid hook event '{}'. Valid values: pre_invocation, post_invocation, pre_tool_use, post_tool_use",
                s
            ),
        }
    }
}

/// Context data passed to observers, serialized as JSON for command hooks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HookContext {
    pub event: HookEvent,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attempt: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capability: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub success: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl HookContext {
    fn new(event: HookEvent) -> Self {
        Self {
            event,
            timestamp: Utc::now(),
            phase: None,
            agent: None,
            attempt: None,
            provider: None,
            capability: None,
            success: None,
            cost: None,
            error: None,
        }
    }

    pub fn pre_invocation(phase: &str, step_id: &str, attempt: u32) -> Self {
        Self {
            phase: Some(phase.to_string()),
            agent: Some(step_id.to_string()),
            attempt: Some(attempt),
            ..Self::new(HookEvent::PreInvocation)
        }
    }

    pub fn post_invocation(phase: &str, response: &AgentResponse) -> Self {
        Self {
            phase: Some(phase.to_string()),
            agent: Some(response.step_id.clone()),
            attempt: Some(response.attempt),
            success: Some(response.success),
            cost: Some(response.cost.as_f64()),
            error: response.error.as_ref().map(|e| e.message.clone()),
            ..Self::new(HookEvent::PostInvocation)
        }
    }

    pub fn pre_tool_use(provider: &str, capability: &str) -> Self {
        Self {
            provider: Some(provider.to_string()),
            capability: Some(capability.to_string()),
            ..Self::new(HookEvent::PreToolUse)
        }
    }

    pub fn post_tool_use(provider: &str, capability: &str, error: Option<String>) -> Self {
        Self {
            provider: Some(provider.to_string()),
            capability: Some(capability.to_string()),
            success: Some(error.is_none()),
            error,
            ..Self::new(HookEvent::PostToolUse)
        }
    }
}

/// An observer notified at hook extension points.
///
/// Observers run in registration order and are bounded by `timeout`; a
/// failing or slow observer never aborts the invocation it observes.
#[async_trait]
pub trait Observer: Send + Sync {
    fn name(&self) -> &str;

    /// Whether this observer wants to see `ctx`.
    fn interested(&self, _ctx: &HookContext) -> bool {
        true
    }

    fn timeout(&self) -> Duration {
        Duration::from_secs(30)
    }

    async fn observe(&self, ctx: &HookContext) -> Result<()>;
}
