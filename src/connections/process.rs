//! Tool provider that talks JSON lines to a child process.
//!
//! Requests are `{"id": n, "method": "...", "params": {...}}`, responses
//! are `{"id": n, "result": ...}` or `{"id": n, "error": "..."}`. Lines that
//! are not responses to the pending request are ignored. `ping` is the
//! health check.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tracing::debug;

use super::types::{Health, ProviderConfig, ProviderHandle, ToolProvider};

#[derive(Debug, Serialize)]
struct Request<'a> {
    id: u64,
    method: &'a str,
    params: Value,
}

#[derive(Debug, Deserialize)]
struct Response {
    id: u64,
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<Value>,
}

/// Spawns one child process per connection.
#[derive(Debug, Default, Clone, Copy)]
pub struct StdioProvider;

#[async_trait]
impl ToolProvider for StdioProvider {
    async fn connect(&self, config: &ProviderConfig) -> Result<Box<dyn ProviderHandle>> {
        let mut child = Command::new(&config.command)
            .args(&config.args)
            .envs(&config.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("Failed to spawn provider command: {}", config.command))?;

        let stdin = child.stdin.take().context("provider stdin unavailable")?;
        let stdout = child.stdout.take().context("provider stdout unavailable")?;

        Ok(Box::new(StdioHandle {
            name: config.name.clone(),
            child,
            stdin,
            stdout: BufReader::new(stdout).lines(),
            next_id: 1,
            request_timeout: Duration::from_secs(config.request_timeout_secs.max(1)),
        }))
    }
}

struct StdioHandle {
    name: String,
    child: Child,
    stdin: ChildStdin,
    stdout: Lines<BufReader<ChildStdout>>,
    next_id: u64,
    request_timeout: Duration,
}

impl StdioHandle {
    async fn request(&mut self, method: &str, params: Value) -> Result<Value> {
        let id = self.next_id;
        self.next_id += 1;

        let mut line = serde_json::to_string(&Request { id, method, params })?;
        line.push('\n');
        self.stdin
            .write_all(line.as_bytes())
            .await
            .with_context(|| format!("Failed to write request to provider '{}'", self.name))?;
        self.stdin.flush().await?;

        let limit = self.request_timeout;
        tokio::time::timeout(limit, self.read_response(id))
            .await
            .with_context(|| format!("provider '{}' timed out after {}s", self.name, limit.as_secs()))?
    }

    async fn read_response(&mut self, id: u64) -> Result<Value> {
        while let Some(line) = self.stdout.next_line().await? {
            let Ok(response) = serde_json::from_str::<Response>(line.trim()) else {
                debug!(provider = %self.name, %line, "ignoring non-response line");
                continue;
            };
            if response.id != id {
                continue;
            }
            if let Some(error) = response.error {
                let message = match error {
                    Value::String(s) => s,
                    other => other.to_string(),
                };
                anyhow::bail!("provider '{}' returned error: {}", self.name, message);
            }
            return Ok(response.result.unwrap_or(Value::Null));
        }
        anyhow::bail!("provider '{}' closed its output", self.name)
    }
}

#[async_trait]
impl ProviderHandle for StdioHandle {
    async fn invoke(&mut self, capability: &str, args: Value) -> Result<Value> {
        self.request(capability, args).await
    }

    async fn health_check(&mut self) -> Health {
        match self.request("ping", Value::Null).await {
            Ok(_) => Health::Ok,
            Err(e) => Health::Degraded(e.to_string()),
        }
    }

    async fn disconnect(&mut self) -> Result<()> {
        // Closing stdin asks a well-behaved provider to exit.
        let _ = self.stdin.shutdown().await;
        match tokio::time::timeout(Duration::from_secs(2), self.child.wait()).await {
            Ok(status) => {
                status.with_context(|| format!("Failed to wait for provider '{}'", self.name))?;
                Ok(())
            }
            Err(_) => self
                .child
                .kill()
                .await
                .with_context(|| format!("Failed to kill provider '{}'", self.name)),
        }
    }
}
