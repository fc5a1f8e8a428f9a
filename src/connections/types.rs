//! Tool provider contract and the connection state machine.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, warn};

/// Lifecycle state of a `ToolConnection`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Ready,
    Degraded,
}

impl ConnectionState {
    /// Legal transitions. `Ready` is only ever reached from `Connecting`.
    pub fn can_transition_to(&self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        matches!(
            (self, next),
            (Disconnected, Connecting)
                | (Connecting, Ready)
                | (Connecting, Degraded)
                | (Connecting, Disconnected)
                | (Ready, Degraded)
                | (Ready, Disconnected)
                | (Degraded, Connecting)
                | (Degraded, Disconnected)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Ready => "ready",
            ConnectionState::Degraded => "degraded",
        }
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Result of a provider health check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Health {
    Ok,
    Degraded(String),
}

fn default_request_timeout() -> u64 {
    60
}

/// How to reach one tool provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub name: String,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

impl ProviderConfig {
    pub fn new(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            command: command.into(),
            args: Vec::new(),
            env: BTreeMap::new(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

/// Creates live handles to a provider.
#[async_trait]
pub trait ToolProvider: Send + Sync {
    async fn connect(&self, config: &ProviderConfig) -> Result<Box<dyn ProviderHandle>>;
}

/// A live session with a provider. Calls on one handle never interleave.
#[async_trait]
pub trait ProviderHandle: Send {
    async fn invoke(&mut self, capability: &str, args: Value) -> Result<Value>;
    async fn health_check(&mut self) -> Health;
    async fn disconnect(&mut self) -> Result<()>;
}

#[derive(Debug)]
struct ConnectionStatus {
    state: ConnectionState,
    last_health_check: Option<DateTime<Utc>>,
    permanently_degraded: bool,
}

/// A handle to one external capability provider, shared by all phases.
pub struct ToolConnection {
    config: ProviderConfig,
    status: Mutex<ConnectionStatus>,
    // tokio mutex: held across the provider call so invocations serialize
    pub(super) handle: tokio::sync::Mutex<Option<Box<dyn ProviderHandle>>>,
}

impl std::fmt::Debug for ToolConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolConnection")
            .field("provider", &self.config.name)
            .field("state", &self.state())
            .finish()
    }
}

impl ToolConnection {
    pub fn new(config: ProviderConfig) -> Self {
        Self {
            config,
            status: Mutex::new(ConnectionStatus {
                state: ConnectionState::Disconnected,
                last_health_check: None,
                permanently_degraded: false,
            }),
            handle: tokio::sync::Mutex::new(None),
        }
    }

    fn status(&self) -> MutexGuard<'_, ConnectionStatus> {
        self.status
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn provider(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &ProviderConfig {
        &self.config
    }

    pub fn state(&self) -> ConnectionState {
        self.status().state
    }

    pub fn is_ready(&self) -> bool {
        self.state() == ConnectionState::Ready
    }

    pub fn last_health_check(&self) -> Option<DateTime<Utc>> {
        self.status().last_health_check
    }

    pub fn is_permanently_degraded(&self) -> bool {
        self.status().permanently_degraded
    }

    /// Apply a transition if it is legal. Returns whether the state changed.
    pub(super) fn transition(&self, next: ConnectionState) -> bool {
        let mut status = self.status();
        if status.state == next {
            return true;
        }
        if !status.state.can_transition_to(next) {
            warn!(
                provider = %self.config.name,
                from = %status.state,
                to = %next,
                "ignoring illegal connection transition"
            );
            return false;
        }
        debug!(provider = %self.config.name, from = %status.state, to = %next, "connection state");
        status.state = next;
        true
    }

    pub(super) fn mark_health_checked(&self) {
        self.status().last_health_check = Some(Utc::now());
    }

    pub(super) fn mark_permanently_degraded(&self) {
        self.status().permanently_degraded = true;
    }
}
