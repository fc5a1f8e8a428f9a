//! `QueryBackend` that drives the Claude CLI in `stream-json` mode.

use async_trait::async_trait;
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tracing::debug;

use super::{QueryBackend, QueryFailure, QueryOutput};
use crate::cost::Cost;
use crate::errors::{AgentError, FailureClass};
use crate::recovery::classify_message;
use crate::stream::StreamAccumulator;

/// Runs one `claude --print` session per query.
#[derive(Debug, Clone)]
pub struct ClaudeCliBackend {
    cmd: String,
    model: Option<String>,
    working_dir: PathBuf,
}

impl ClaudeCliBackend {
    pub fn new(cmd: impl Into<String>, working_dir: impl Into<PathBuf>) -> Self {
        Self {
            cmd: cmd.into(),
            model: None,
            working_dir: working_dir.into(),
        }
    }

    pub fn with_model(mut self, model: Option<String>) -> Self {
        self.model = model;
        self
    }

    /// CLI flags for a query with the given allowed capabilities.
    pub fn flags(&self, allowed_capabilities: &BTreeSet<String>) -> Vec<String> {
        let mut flags = vec![
            "--print".to_string(),
            "--output-format".to_string(),
            "stream-json".to_string(),
            "--verbose".to_string(),
        ];
        if let Some(model) = &self.model {
            flags.push("--model".to_string());
            flags.push(model.clone());
        }
        if !allowed_capabilities.is_empty() {
            let tools: Vec<String> = allowed_capabilities.iter().map(|c| tool_name(c)).collect();
            flags.push("--allowedTools".to_string());
            flags.push(tools.join(","));
        }
        flags
    }
}

/// Map a `provider:capability` pair onto the CLI's MCP tool naming.
fn tool_name(capability: &str) -> String {
    match capability.split_once(':') {
        Some((provider, cap)) => format!("mcp__{provider}__{cap}"),
        None => capability.to_string(),
    }
}

fn classified(message: String) -> AgentError {
    match classify_message(&message) {
        FailureClass::Transient => AgentError::Transient(message),
        FailureClass::BudgetExceeded => AgentError::BudgetExceeded(message),
        _ => AgentError::Provider(message),
    }
}

#[async_trait]
impl QueryBackend for ClaudeCliBackend {
    async fn query(
        &self,
        prompt: &str,
        allowed_capabilities: &BTreeSet<String>,
    ) -> Result<QueryOutput, QueryFailure> {
        let flags = self.flags(allowed_capabilities);
        debug!(cmd = %self.cmd, flags = %flags.join(" "), "spawning claude");

        let mut child = Command::new(&self.cmd)
            .args(&flags)
            .current_dir(&self.working_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| AgentError::Provider(format!("failed to spawn '{}': {e}", self.cmd)))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(prompt.as_bytes())
                .await
                .map_err(|e| classified(format!("failed to write prompt: {e}")))?;
            stdin
                .shutdown()
                .await
                .map_err(|e| classified(format!("failed to close stdin: {e}")))?;
        }

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| AgentError::Provider("claude stdout unavailable".into()))?;
        let mut stderr = child
            .stderr
            .take()
            .ok_or_else(|| AgentError::Provider("claude stderr unavailable".into()))?;
        let stderr_task = tokio::spawn(async move {
            let mut buf = String::new();
            let _ = stderr.read_to_string(&mut buf).await;
            buf
        });

        let mut accumulator = StreamAccumulator::new();
        let mut lines = BufReader::new(stdout).lines();
        while let Some(line) = lines
            .next_line()
            .await
            .map_err(|e| classified(format!("failed to read claude output: {e}")))?
        {
            accumulator.push_line(&line);
        }

        let status = child
            .wait()
            .await
            .map_err(|e| classified(format!("failed to wait for claude: {e}")))?;
        let stderr = stderr_task.await.unwrap_or_default();
        let outcome = accumulator.finish();
        // Failed sessions are billed too.
        let cost = Cost::from_f64(outcome.cost_usd);
        let tokens = outcome.tokens;

        if outcome.is_error {
            return Err(QueryFailure::billed(classified(outcome.text), cost, tokens));
        }
        if !status.success() {
            let detail = if stderr.trim().is_empty() {
                outcome.text
            } else {
                stderr.trim().to_string()
            };
            let err = classified(format!(
                "claude exited with code {}: {detail}",
                status.code().unwrap_or(-1)
            ));
            return Err(QueryFailure::billed(err, cost, tokens));
        }

        Ok(QueryOutput {
            text: outcome.text,
            cost,
            tokens,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags_include_stream_json_and_tools() {
        let backend =
            ClaudeCliBackend::new("claude", ".").with_model(Some("sonnet".to_string()));
        let caps: BTreeSet<String> = ["filesystem:read_file".to_string(), "git:commit".to_string()]
            .into_iter()
            .collect();
        let flags = backend.flags(&caps);
        assert!(flags.windows(2).any(|w| w == ["--output-format", "stream-json"]));
        assert!(flags.windows(2).any(|w| w == ["--model", "sonnet"]));
        let tools = flags.last().unwrap();
        assert_eq!(tools, "mcp__filesystem__read_file,mcp__git__commit");
    }

    #[test]
    fn test_flags_without_capabilities() {
        let flags = ClaudeCliBackend::new("claude", ".").flags(&BTreeSet::new());
        assert!(!flags.contains(&"--allowedTools".to_string()));
        assert!(!flags.contains(&"--model".to_string()));
    }

    #[test]
    fn test_error_classification() {
        assert!(matches!(
            classified("API Error: 529 overloaded".into()),
            AgentError::Transient(_)
        ));
        assert!(matches!(
            classified("credit balance is too low".into()),
            AgentError::BudgetExceeded(_)
        ));
        assert!(matches!(classified("bad flag".into()), AgentError::Provider(_)));
    }

    #[tokio::test]
    async fn test_missing_binary_is_provider_error() {
        let backend = ClaudeCliBackend::new("/nonexistent/claude-binary", ".");
        let failure = backend.query("hi", &BTreeSet::new()).await.unwrap_err();
        assert_eq!(failure.error.class(), FailureClass::Fatal);
        assert_eq!(failure.cost, Cost::ZERO);
    }

    #[cfg(unix)]
    fn fake_cli(dir: &std::path::Path, body: &str) -> std::path::PathBuf {
        use std::os::unix::fs::PermissionsExt;

        let script = dir.join("fake-claude");
        std::fs::write(&script, format!("#!/bin/sh\ncat > /dev/null\n{body}\n")).unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
        script
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_query_parses_fake_cli_output() {
        let dir = tempfile::tempdir().unwrap();
        let script = fake_cli(
            dir.path(),
            r#"echo '{"type":"result","subtype":"success","result":"hello","is_error":false,"total_cost_usd":0.5,"usage":{"input_tokens":10,"output_tokens":5}}'"#,
        );

        let backend = ClaudeCliBackend::new(script.to_string_lossy(), dir.path());
        let output = backend.query("prompt", &BTreeSet::new()).await.unwrap();
        assert_eq!(output.text, "hello");
        assert_eq!(output.cost, Cost::from_f64(0.5));
        assert_eq!(output.tokens, 15);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_error_result_keeps_billed_cost() {
        let dir = tempfile::tempdir().unwrap();
        let script = fake_cli(
            dir.path(),
            r#"echo '{"type":"result","subtype":"error_max_turns","result":"max turns","is_error":true,"total_cost_usd":1.5,"usage":{"input_tokens":1000,"output_tokens":500}}'"#,
        );

        let backend = ClaudeCliBackend::new(script.to_string_lossy(), dir.path());
        let failure = backend.query("prompt", &BTreeSet::new()).await.unwrap_err();
        assert!(matches!(failure.error, AgentError::Provider(ref m) if m == "max turns"));
        assert_eq!(failure.cost, Cost::from_f64(1.5));
        assert_eq!(failure.tokens, 1500);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_nonzero_exit_keeps_billed_cost() {
        let dir = tempfile::tempdir().unwrap();
        let script = fake_cli(
            dir.path(),
            r#"echo '{"type":"result","subtype":"success","result":"partial","is_error":false,"total_cost_usd":0.25,"usage":{"input_tokens":20,"output_tokens":5}}'
echo 'API Error: 529 overloaded' >&2
exit 3"#,
        );

        let backend = ClaudeCliBackend::new(script.to_string_lossy(), dir.path());
        let failure = backend.query("prompt", &BTreeSet::new()).await.unwrap_err();
        assert!(matches!(failure.error, AgentError::Transient(_)));
        assert!(failure.error.to_string().contains("code 3"));
        assert_eq!(failure.cost, Cost::from_f64(0.25));
        assert_eq!(failure.tokens, 25);
    }
}
