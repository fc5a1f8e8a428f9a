//! Phase executor: runs one phase's agent invocations and aggregates them
//! into a `PhaseResult`.
//!
//! Steps within a wave run concurrently, bounded by a semaphore; waves run
//! in declared order so later prompts can embed earlier results. Each step
//! runs an attempt loop driven by the `RecoveryPolicy`.

use serde_json::json;
use std::collections::BTreeSet;
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::agent::{
    AgentInvocation, AgentResponse, PromptContext, QueryBackend, ResponseError,
};
use crate::connections::ConnectionManager;
use crate::cost::{Cost, CostTracker};
use crate::errors::{AgentError, FailureClass};
use crate::hooks::{HookContext, HookManager};
use crate::phase::{AgentStep, PhaseDefinition, PhaseResult, PhaseStatus};
use crate::recovery::{RecoveryAction, RecoveryPolicy};
use crate::spec::BuildSpecification;

/// Why a build stopped dispatching new invocations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    BudgetExceeded,
    Deadline,
    External,
}

impl CancelReason {
    fn as_error(&self, cost: &CostTracker, budget: Cost) -> ResponseError {
        match self {
            CancelReason::BudgetExceeded => ResponseError {
                class: FailureClass::BudgetExceeded,
                message: format!("budget exhausted: spent {} of {}", cost.spent(), budget),
            },
            CancelReason::Deadline => ResponseError {
                class: FailureClass::BudgetExceeded,
                message: "build deadline reached".to_string(),
            },
            CancelReason::External => ResponseError {
                class: FailureClass::Fatal,
                message: "build cancelled".to_string(),
            },
        }
    }
}

/// Build-wide cancellation shared by the orchestrator and every invocation.
///
/// Cancelling stops new dispatch only; invocations already running finish
/// on their own timeout so their cost is recorded.
#[derive(Debug)]
pub struct RunControl {
    token: CancellationToken,
    budget: Cost,
    reason: OnceLock<CancelReason>,
}

impl RunControl {
    pub fn new(budget: Cost) -> Self {
        Self {
            token: CancellationToken::new(),
            budget,
            reason: OnceLock::new(),
        }
    }

    pub fn budget(&self) -> Cost {
        self.budget
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Cancel the build. The first reason recorded wins.
    pub fn cancel(&self, reason: CancelReason) {
        let _ = self.reason.set(reason);
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn reason(&self) -> Option<CancelReason> {
        self.reason.get().copied()
    }

    /// Resolves once the build is stopped by its deadline or by the operator.
    /// A budget breach only stops new dispatch, so it never resolves this.
    pub async fn interrupted(&self) {
        self.token.cancelled().await;
        if self.reason() == Some(CancelReason::BudgetExceeded) {
            std::future::pending::<()>().await;
        }
    }

    fn interruption_error(&self, cost: &CostTracker) -> ResponseError {
        self.reason()
            .unwrap_or(CancelReason::External)
            .as_error(cost, self.budget)
    }
}

/// Read-only inputs of a phase.
#[derive(Debug, Clone)]
pub struct PhaseInputs {
    pub spec: Arc<BuildSpecification>,
    /// Outputs of earlier completed phases, in pipeline order
    pub prior_outputs: Arc<Vec<(String, String)>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecutorSettings {
    pub max_concurrency: usize,
    pub call_timeout: Duration,
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        Self {
            max_concurrency: 4,
            call_timeout: Duration::from_secs(600),
        }
    }
}

#[derive(Debug)]
enum StepStatus {
    Succeeded(String),
    /// Optional step gave up; the phase continues
    Skipped(ResponseError),
    Failed(ResponseError),
    /// Never finished an attempt because dispatch stopped
    Cancelled,
}

#[derive(Debug)]
struct StepOutcome {
    responses: Vec<AgentResponse>,
    status: StepStatus,
}

/// Everything one spawned step needs, owned.
struct StepRun {
    step: AgentStep,
    phase: String,
    task: String,
    call_timeout: Duration,
    inputs: PhaseInputs,
    earlier_results: Arc<Vec<(String, String)>>,
    backend: Arc<dyn QueryBackend>,
    connections: Arc<ConnectionManager>,
    hooks: Arc<HookManager>,
    cost: Arc<CostTracker>,
    policy: RecoveryPolicy,
    control: Arc<RunControl>,
    phase_token: CancellationToken,
}

impl StepRun {
    fn dispatch_stopped(&self) -> bool {
        self.control.is_cancelled() || self.phase_token.is_cancelled()
    }

    /// Make sure every configured provider the step may use is ready.
    async fn ensure_providers(&self) -> Result<(), AgentError> {
        for provider in self.step.providers() {
            if !self.connections.is_configured(provider) {
                continue;
            }
            self.connections
                .ensure_ready(provider)
                .await
                .map_err(|e| AgentError::Connection(e.to_string()))?;
        }
        Ok(())
    }

    async fn deliver_to_sink(&self, content: &str) -> Result<(), ResponseError> {
        let Some(sink) = &self.step.sink else {
            return Ok(());
        };
        if !self.connections.is_configured(&sink.provider) {
            debug!(provider = %sink.provider, step = %self.step.id, "sink provider not configured, skipping");
            return Ok(());
        }
        let args = json!({
            "phase": self.phase,
            "step": self.step.id,
            "content": content,
        });
        let delivery = async {
            match self.connections.ensure_ready(&sink.provider).await {
                Ok(conn) => self
                    .connections
                    .invoke(&conn, &sink.capability, args)
                    .await
                    .map(|_| ()),
                Err(e) => Err(e),
            }
        };
        let result = tokio::select! {
            result = delivery => result,
            _ = self.control.interrupted() => {
                warn!(phase = %self.phase, agent = %self.step.id, provider = %sink.provider, "artifact delivery interrupted");
                return Err(self.control.interruption_error(&self.cost));
            }
        };
        result.map_err(|e| ResponseError {
            class: FailureClass::Connection,
            message: format!("artifact sink {}:{} failed: {e}", sink.provider, sink.capability),
        })
    }

    async fn run(self) -> StepOutcome {
        let mut responses = Vec::new();
        let mut attempt = 1u32;
        let mut correction: Option<String> = None;
        let mut corrective_used = false;

        loop {
            // Stopped from outside this step; the step that caused the stop
            // reports the failure.
            if self.dispatch_stopped() {
                return StepOutcome {
                    responses,
                    status: StepStatus::Cancelled,
                };
            }

            let prompt = self.step.agent.build_prompt(&PromptContext {
                phase: &self.phase,
                step_id: &self.step.id,
                spec: self.inputs.spec.raw_text(),
                task: &self.task,
                prior_outputs: &self.inputs.prior_outputs,
                earlier_results: &self.earlier_results,
                correction: correction.as_deref(),
            });
            let invocation = AgentInvocation {
                phase: self.phase.clone(),
                step_id: self.step.id.clone(),
                agent: self.step.agent,
                prompt,
                capabilities: self.step.capabilities.clone(),
                output: self.step.output,
                attempt,
            };

            self.hooks
                .notify(&HookContext::pre_invocation(&self.phase, &self.step.id, attempt))
                .await;

            let ready = tokio::select! {
                ready = self.ensure_providers() => ready,
                _ = self.control.interrupted() => {
                    return StepOutcome {
                        responses,
                        status: StepStatus::Cancelled,
                    };
                }
            };
            let response = match ready {
                Ok(()) => {
                    self.step
                        .agent
                        .invoke(self.backend.as_ref(), &invocation, self.call_timeout)
                        .await
                }
                Err(err) => AgentResponse::failure(&invocation, err, Cost::ZERO, 0),
            };

            let totals = self.cost.record(response.cost, response.tokens);
            self.hooks
                .notify(&HookContext::post_invocation(&self.phase, &response))
                .await;

            debug!(
                phase = %self.phase,
                agent = %self.step.id,
                attempt,
                success = response.success,
                cost = %response.cost,
                spent = %totals.cost,
                "invocation finished"
            );

            if let Err(breach) = self.cost.check(self.control.budget()) {
                warn!(phase = %self.phase, spent = %breach.spent, budget = %breach.budget, "budget exceeded, stopping dispatch");
                self.control.cancel(CancelReason::BudgetExceeded);
            }

            if response.success {
                let text = response.result.clone().unwrap_or_default();
                responses.push(response);
                let status = match self.deliver_to_sink(&text).await {
                    Ok(()) => StepStatus::Succeeded(text),
                    Err(err) if self.step.required => StepStatus::Failed(err),
                    Err(err) => StepStatus::Skipped(err),
                };
                return StepOutcome { responses, status };
            }

            let err = response.error.clone().unwrap_or_else(|| ResponseError {
                class: FailureClass::Fatal,
                message: "invocation failed without an error".to_string(),
            });
            responses.push(response);

            let decision = self
                .policy
                .decide(err.class, attempt, self.step.required, corrective_used);
            match decision.action {
                RecoveryAction::Retry => {
                    info!(
                        phase = %self.phase,
                        agent = %self.step.id,
                        attempt,
                        class = %err.class,
                        remaining = decision.remaining_attempts,
                        backoff_ms = decision.backoff.as_millis() as u64,
                        "retrying invocation"
                    );
                    if decision.corrective {
                        corrective_used = true;
                        correction = Some(err.message.clone());
                    }
                    if !decision.backoff.is_zero() {
                        tokio::select! {
                            _ = tokio::time::sleep(decision.backoff) => {}
                            _ = self.control.token().cancelled() => {}
                            _ = self.phase_token.cancelled() => {}
                        }
                    }
                    attempt += 1;
                }
                RecoveryAction::Skip => {
                    warn!(phase = %self.phase, agent = %self.step.id, error = %err, "optional invocation skipped");
                    return StepOutcome {
                        responses,
                        status: StepStatus::Skipped(err),
                    };
                }
                RecoveryAction::Abort => {
                    return StepOutcome {
                        responses,
                        status: StepStatus::Failed(err),
                    };
                }
            }
        }
    }
}

/// Runs phases against shared build resources.
#[derive(Clone)]
pub struct PhaseExecutor {
    backend: Arc<dyn QueryBackend>,
    connections: Arc<ConnectionManager>,
    hooks: Arc<HookManager>,
    cost: Arc<CostTracker>,
    policy: RecoveryPolicy,
    settings: ExecutorSettings,
}

impl PhaseExecutor {
    pub fn new(
        backend: Arc<dyn QueryBackend>,
        connections: Arc<ConnectionManager>,
        hooks: Arc<HookManager>,
        cost: Arc<CostTracker>,
        policy: RecoveryPolicy,
        settings: ExecutorSettings,
    ) -> Self {
        Self {
            backend,
            connections,
            hooks,
            cost,
            policy,
            settings,
        }
    }

    /// Execute every invocation of `def` and aggregate the result.
    ///
    /// The phase is completed only if every required step succeeded. A
    /// failing required step stops dispatch of the rest of the phase; steps
    /// already running are awaited.
    pub async fn run(
        &self,
        def: &PhaseDefinition,
        inputs: &PhaseInputs,
        control: &Arc<RunControl>,
    ) -> PhaseResult {
        let started = Instant::now();
        let phase_token = control.token().child_token();
        let semaphore = Arc::new(Semaphore::new(self.settings.max_concurrency.max(1)));
        let call_timeout = def.call_timeout().unwrap_or(self.settings.call_timeout);

        info!(phase = %def.name, waves = def.waves.len(), "phase started");

        let mut responses: Vec<AgentResponse> = Vec::new();
        let mut earlier: Vec<(String, String)> = Vec::new();
        let mut succeeded: BTreeSet<String> = BTreeSet::new();
        let mut output_sections: Vec<String> = Vec::new();
        let mut phase_error: Option<ResponseError> = None;

        for wave in &def.waves {
            if phase_token.is_cancelled() {
                break;
            }
            let earlier_results = Arc::new(earlier.clone());
            let mut set = JoinSet::new();

            for (pos, step) in wave.iter().enumerate() {
                let permit = tokio::select! {
                    permit = semaphore.clone().acquire_owned() => permit,
                    _ = phase_token.cancelled() => break,
                };
                let Ok(permit) = permit else { break };
                if phase_token.is_cancelled() {
                    break;
                }

                let run = StepRun {
                    step: step.clone(),
                    phase: def.name.clone(),
                    task: def.description.clone(),
                    call_timeout,
                    inputs: inputs.clone(),
                    earlier_results: earlier_results.clone(),
                    backend: self.backend.clone(),
                    connections: self.connections.clone(),
                    hooks: self.hooks.clone(),
                    cost: self.cost.clone(),
                    policy: self.policy,
                    control: control.clone(),
                    phase_token: phase_token.clone(),
                };
                let token = phase_token.clone();
                set.spawn(async move {
                    let _permit = permit;
                    let outcome = run.run().await;
                    if matches!(outcome.status, StepStatus::Failed(_)) {
                        token.cancel();
                    }
                    (pos, outcome)
                });
            }

            let mut outcomes: Vec<Option<StepOutcome>> = wave.iter().map(|_| None).collect();
            while let Some(joined) = set.join_next().await {
                match joined {
                    Ok((pos, outcome)) => outcomes[pos] = Some(outcome),
                    Err(e) => {
                        error!(phase = %def.name, error = %e, "invocation task failed");
                        phase_token.cancel();
                        phase_error.get_or_insert(ResponseError {
                            class: FailureClass::Fatal,
                            message: format!("invocation task failed: {e}"),
                        });
                    }
                }
            }

            // Aggregate in declared order regardless of completion order.
            for (step, outcome) in wave.iter().zip(outcomes) {
                let Some(outcome) = outcome else { continue };
                responses.extend(outcome.responses);
                match outcome.status {
                    StepStatus::Succeeded(text) => {
                        if step.required {
                            output_sections.push(format!("## {}\n\n{}", step.id, text.trim_end()));
                        }
                        succeeded.insert(step.id.clone());
                        earlier.push((step.id.clone(), text));
                    }
                    StepStatus::Skipped(err) => {
                        debug!(phase = %def.name, agent = %step.id, error = %err, "step skipped");
                    }
                    StepStatus::Failed(err) => {
                        phase_error.get_or_insert(err);
                    }
                    StepStatus::Cancelled => {}
                }
            }
        }

        let all_required_succeeded = def
            .steps()
            .filter(|s| s.required)
            .all(|s| succeeded.contains(&s.id));

        let error = match phase_error {
            Some(err) => Some(err),
            None if all_required_succeeded => None,
            None => Some(
                control
                    .reason()
                    .unwrap_or(CancelReason::External)
                    .as_error(&self.cost, control.budget()),
            ),
        };
        let status = if error.is_none() {
            PhaseStatus::Completed
        } else {
            PhaseStatus::Failed
        };

        let result = PhaseResult {
            phase: def.name.clone(),
            status,
            cost: responses.iter().map(|r| r.cost).sum(),
            tokens: responses.iter().map(|r| r.tokens).sum(),
            responses,
            duration: started.elapsed(),
            error,
            output: output_sections.join("\n\n"),
        };

        info!(
            phase = %result.phase,
            status = %result.status,
            cost = %result.cost,
            calls = result.responses.len(),
            duration_ms = result.duration.as_millis() as u64,
            "phase finished"
        );
        result
    }
}
