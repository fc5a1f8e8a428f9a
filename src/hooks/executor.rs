//! Command observers: run a shell command with the hook context on stdin.

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use super::config::HookDefinition;
use super::types::{HookContext, Observer};

/// Observer backed by a `HookDefinition` command.
///
/// The command runs under `sh -c` with the JSON-serialized `HookContext` on
/// stdin and `BUILDFORGE_EVENT` / `BUILDFORGE_PHASE` in its environment. A
/// non-zero exit is reported as an error, which the manager logs.
#[derive(Debug, Clone)]
pub struct CommandObserver {
    name: String,
    hook: HookDefinition,
    working_dir: PathBuf,
}

impl CommandObserver {
    pub fn new(hook: HookDefinition, project_dir: &Path) -> Self {
        let working_dir = match &hook.working_dir {
            Some(dir) if dir.is_absolute() => dir.clone(),
            Some(dir) => project_dir.join(dir),
            None => project_dir.to_path_buf(),
        };
        Self {
            name: format!("{}:{}", hook.event, hook.command),
            hook,
            working_dir,
        }
    }
}

#[async_trait]
impl Observer for CommandObserver {
    fn name(&self) -> &str {
        &self.name
    }

    fn interested(&self, ctx: &HookContext) -> bool {
        self.hook.matches(ctx)
    }

    fn timeout(&self) -> Duration {
        Duration::from_secs(self.hook.timeout_secs)
    }

    async fn observe(&self, ctx: &HookContext) -> Result<()> {
        let context_json =
            serde_json::to_string(ctx).context("Failed to serialize hook context to JSON")?;

        debug!(command = %self.hook.command, event = %ctx.event, "running hook");

        let mut child = Command::new("sh")
            .arg("-c")
            .arg(&self.hook.command)
            .current_dir(&self.working_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .env("BUILDFORGE_EVENT", ctx.event.as_str())
            .env("BUILDFORGE_PHASE", ctx.phase.as_deref().unwrap_or(""))
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("Failed to spawn hook command: {}", self.hook.command))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(context_json.as_bytes())
                .await
                .context("Failed to write context to hook stdin")?;
        }

        let output = child
            .wait_with_output()
            .await
            .context("Failed to wait for hook command")?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            anyhow::bail!(
                "hook exited with code {}: {}",
                output.status.code().unwrap_or(-1),
                stderr.trim()
            );
        }
        Ok(())
    }
}
