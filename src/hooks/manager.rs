//! Ordered observer list invoked at each extension point.

use std::path::Path;
use std::sync::Arc;
use tracing::warn;

use super::config::HookDefinition;
use super::executor::CommandObserver;
use super::types::{HookContext, Observer};

/// Runs observers in registration order.
///
/// Each observer is bounded by its own timeout. Errors and timeouts are
/// logged at `warn` and swallowed.
#[derive(Default, Clone)]
pub struct HookManager {
    observers: Vec<Arc<dyn Observer>>,
}

impl std::fmt::Debug for HookManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<&str> = self.observers.iter().map(|o| o.name()).collect();
        f.debug_struct("HookManager").field("observers", &names).finish()
    }
}

impl HookManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build command observers from configured hook definitions.
    pub fn from_definitions(hooks: &[HookDefinition], project_dir: &Path) -> Self {
        let observers = hooks
            .iter()
            .filter(|h| h.enabled)
            .map(|h| Arc::new(CommandObserver::new(h.clone(), project_dir)) as Arc<dyn Observer>)
            .collect();
        Self { observers }
    }

    pub fn register(&mut self, observer: Arc<dyn Observer>) {
        self.observers.push(observer);
    }

    pub fn with_observer(mut self, observer: Arc<dyn Observer>) -> Self {
        self.register(observer);
        self
    }

    pub fn len(&self) -> usize {
        self.observers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.observers.is_empty()
    }

    /// Notify every interested observer of `ctx`.
    pub async fn notify(&self, ctx: &HookContext) {
        for observer in self.observers.iter().filter(|o| o.interested(ctx)) {
            let limit = observer.timeout();
            match tokio::time::timeout(limit, observer.observe(ctx)).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    warn!(observer = observer.name(), event = %ctx.event, error = %e, "observer failed");
                }
                Err(_) => {
                    warn!(
                        observer = observer.name(),
                        event = %ctx.event,
                        timeout_secs = limit.as_secs(),
                        "observer timed out"
                    );
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hooks::types::HookEvent;
    use crate::testing::RecordingObserver;
    use anyhow::Result;
    use async_trait::async_trait;
    use std::time::Duration;

    struct Failing;

    #[async_trait]
    impl Observer for Failing {
        fn name(&self) -> &str {
            "failing"
        }
        async fn observe(&self, _ctx: &HookContext) -> Result<()> {
            anyhow::bail!("observer exploded")
        }
    }

    struct Stuck;

    #[async_trait]
    impl Observer for Stuck {
        fn name(&self) -> &str {
            "stuck"
        }
        fn timeout(&self) -> Duration {
            Duration::from_millis(50)
        }
        async fn observe(&self, _ctx: &HookContext) -> Result<()> {
            std::future::pending::<()>().await;
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_failing_and_stuck_observers_do_not_stop_later_ones() {
        let recorder = Arc::new(RecordingObserver::default());
        let manager = HookManager::new()
            .with_observer(Arc::new(Failing))
            .with_observer(Arc::new(Stuck))
            .with_observer(recorder.clone());

        manager
            .notify(&HookContext::pre_invocation("analysis", "analyzer", 1))
            .await;

        assert_eq!(recorder.events(), vec![HookEvent::PreInvocation]);
    }

    #[tokio::test]
    async fn test_observers_run_in_registration_order() {
        let log = Arc::new(std::sync::Mutex::new(Vec::new()));
        let manager = HookManager::new()
            .with_observer(Arc::new(RecordingObserver::with_log("first", log.clone())))
            .with_observer(Arc::new(RecordingObserver::with_log("second", log.clone())));
        manager.notify(&HookContext::pre_tool_use("fs", "read")).await;

        assert_eq!(*log.lock().unwrap(), vec!["first", "second"]);
    }

    #[test]
    fn test_from_definitions_skips_disabled() {
        let mut disabled = HookDefinition::command(HookEvent::PreToolUse, "true");
        disabled.enabled = false;
        let hooks = vec![
            HookDefinition::command(HookEvent::PostToolUse, "true"),
            disabled,
        ];
        let manager = HookManager::from_definitions(&hooks, Path::new("."));
        assert_eq!(manager.len(), 1);
    }
}
