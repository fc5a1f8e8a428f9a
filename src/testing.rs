//! Scripted doubles for the query backend, tool providers and observers.

use anyhow::Result;
use async_trait::async_trait;
use serde_json::{Value, json};
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::agent::{QueryBackend, QueryFailure, QueryOutput};
use crate::connections::{Health, ProviderConfig, ProviderHandle, ToolProvider};
use crate::cost::Cost;
use crate::errors::AgentError;
use crate::hooks::{HookContext, HookEvent, Observer};

/// Step id from the `[phase: X | agent: step]` prompt header.
pub fn step_of(prompt: &str) -> String {
    prompt
        .lines()
        .next()
        .and_then(|header| header.split("agent: ").nth(1))
        .map(|rest| rest.trim_end_matches(']').trim().to_string())
        .unwrap_or_default()
}

#[derive(Debug, Clone)]
enum Reply {
    Ok(QueryOutput),
    Err(AgentError, Cost, u64),
    Delayed(Duration, QueryOutput),
    Hang,
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Replies per step id, in order; unscripted calls succeed with "ok".
#[derive(Default)]
pub struct ScriptedBackend {
    replies: Mutex<HashMap<String, VecDeque<Reply>>>,
    prompts: Mutex<Vec<(String, String)>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl ScriptedBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(self, step: &str, reply: Reply) -> Self {
        self.replies
            .lock()
            .unwrap()
            .entry(step.to_string())
            .or_default()
            .push_back(reply);
        self
    }

    pub fn push_ok(self, step: &str, text: &str, cost: f64, tokens: u64) -> Self {
        self.push(step, Reply::Ok(output(text, cost, tokens)))
    }

    pub fn push_err(self, step: &str, err: AgentError) -> Self {
        self.push(step, Reply::Err(err, Cost::ZERO, 0))
    }

    /// A failed call that the provider still charged for.
    pub fn push_billed_err(self, step: &str, err: AgentError, cost: f64, tokens: u64) -> Self {
        self.push(step, Reply::Err(err, Cost::from_f64(cost), tokens))
    }

    pub fn push_delayed(self, step: &str, delay: Duration, text: &str, cost: f64) -> Self {
        self.push(step, Reply::Delayed(delay, output(text, cost, 0)))
    }

    pub fn push_hang(self, step: &str) -> Self {
        self.push(step, Reply::Hang)
    }

    pub fn calls(&self, step: &str) -> usize {
        self.prompts
            .lock()
            .unwrap()
            .iter()
            .filter(|(s, _)| s == step)
            .count()
    }

    pub fn total_calls(&self) -> usize {
        self.prompts.lock().unwrap().len()
    }

    pub fn prompts(&self, step: &str) -> Vec<String> {
        self.prompts
            .lock()
            .unwrap()
            .iter()
            .filter(|(s, _)| s == step)
            .map(|(_, p)| p.clone())
            .collect()
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

fn output(text: &str, cost: f64, tokens: u64) -> QueryOutput {
    QueryOutput {
        text: text.to_string(),
        cost: Cost::from_f64(cost),
        tokens,
    }
}

#[async_trait]
impl QueryBackend for ScriptedBackend {
    async fn query(
        &self,
        prompt: &str,
        _allowed_capabilities: &BTreeSet<String>,
    ) -> Result<QueryOutput, QueryFailure> {
        let step = step_of(prompt);
        self.prompts
            .lock()
            .unwrap()
            .push((step.clone(), prompt.to_string()));
        let reply = self
            .replies
            .lock()
            .unwrap()
            .get_mut(&step)
            .and_then(VecDeque::pop_front)
            .unwrap_or_else(|| Reply::Ok(output("ok", 0.0, 0)));

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        let _guard = InFlight(&self.in_flight);

        match reply {
            Reply::Ok(out) => Ok(out),
            Reply::Err(err, cost, tokens) => Err(QueryFailure::billed(err, cost, tokens)),
            Reply::Delayed(delay, out) => {
                tokio::time::sleep(delay).await;
                Ok(out)
            }
            Reply::Hang => {
                std::future::pending::<()>().await;
                Err(AgentError::Provider("unreachable".into()).into())
            }
        }
    }
}

/// In-memory tool provider with switchable failures.
#[derive(Default)]
pub struct ScriptedProvider {
    connects: AtomicU32,
    failing_connects: AtomicU32,
    healthy: Arc<AtomicBool>,
    failing_invokes: Arc<AtomicBool>,
    invoke_delay_ms: Arc<AtomicU64>,
    failing_disconnects: bool,
    invocations: Arc<Mutex<Vec<(String, Value)>>>,
}

impl ScriptedProvider {
    pub fn new() -> Self {
        Self {
            healthy: Arc::new(AtomicBool::new(true)),
            ..Self::default()
        }
    }

    /// Fail the next `n` connect attempts.
    pub fn fail_connects(self, n: u32) -> Self {
        self.failing_connects.store(n, Ordering::SeqCst);
        self
    }

    pub fn fail_disconnects(mut self) -> Self {
        self.failing_disconnects = true;
        self
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }

    pub fn set_failing_invokes(&self, failing: bool) {
        self.failing_invokes.store(failing, Ordering::SeqCst);
    }

    /// Make every invoke take `delay` before it completes.
    pub fn set_invoke_delay(&self, delay: Duration) {
        self.invoke_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn connect_count(&self) -> u32 {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn invocations(&self) -> Vec<(String, Value)> {
        self.invocations.lock().unwrap().clone()
    }
}

#[async_trait]
impl ToolProvider for ScriptedProvider {
    async fn connect(&self, config: &ProviderConfig) -> Result<Box<dyn ProviderHandle>> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        let remaining = self.failing_connects.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failing_connects.store(remaining - 1, Ordering::SeqCst);
            anyhow::bail!("connection refused by {}", config.name);
        }
        Ok(Box::new(ScriptedHandle {
            healthy: self.healthy.clone(),
            failing_invokes: self.failing_invokes.clone(),
            invoke_delay_ms: self.invoke_delay_ms.clone(),
            failing_disconnect: self.failing_disconnects,
            invocations: self.invocations.clone(),
        }))
    }
}

struct ScriptedHandle {
    healthy: Arc<AtomicBool>,
    failing_invokes: Arc<AtomicBool>,
    invoke_delay_ms: Arc<AtomicU64>,
    failing_disconnect: bool,
    invocations: Arc<Mutex<Vec<(String, Value)>>>,
}

#[async_trait]
impl ProviderHandle for ScriptedHandle {
    async fn invoke(&mut self, capability: &str, args: Value) -> Result<Value> {
        let delay = self.invoke_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        if self.failing_invokes.load(Ordering::SeqCst) {
            anyhow::bail!("provider rejected {capability}");
        }
        self.invocations
            .lock()
            .unwrap()
            .push((capability.to_string(), args.clone()));
        Ok(json!({ "capability": capability, "args": args }))
    }

    async fn health_check(&mut self) -> Health {
        if self.healthy.load(Ordering::SeqCst) {
            Health::Ok
        } else {
            Health::Degraded("ping failed".into())
        }
    }

    async fn disconnect(&mut self) -> Result<()> {
        if self.failing_disconnect {
            anyhow::bail!("broken pipe");
        }
        Ok(())
    }
}

/// Records every context it observes.
pub struct RecordingObserver {
    name: String,
    seen: Mutex<Vec<HookContext>>,
    log: Option<Arc<Mutex<Vec<String>>>>,
}

impl Default for RecordingObserver {
    fn default() -> Self {
        Self {
            name: "recorder".into(),
            seen: Mutex::new(Vec::new()),
            log: None,
        }
    }
}

impl RecordingObserver {
    /// Also append this observer's name to a shared log on every event.
    pub fn with_log(name: &str, log: Arc<Mutex<Vec<String>>>) -> Self {
        Self {
            name: name.to_string(),
            seen: Mutex::new(Vec::new()),
            log: Some(log),
        }
    }

    pub fn contexts(&self) -> Vec<HookContext> {
        self.seen.lock().unwrap().clone()
    }

    pub fn events(&self) -> Vec<HookEvent> {
        self.contexts().iter().map(|c| c.event).collect()
    }
}

#[async_trait]
impl Observer for RecordingObserver {
    fn name(&self) -> &str {
        &self.name
    }

    async fn observe(&self, ctx: &HookContext) -> Result<()> {
        self.seen.lock().unwrap().push(ctx.clone());
        if let Some(log) = &self.log {
            log.lock().unwrap().push(self.name.clone());
        }
        Ok(())
    }
}

#[test]
fn test_step_of_parses_prompt_header() {
    assert_eq!(step_of("[phase: testing | agent: test_reviewer]\n\nbody"), "test_reviewer");
    assert_eq!(step_of("no header"), "");
}
