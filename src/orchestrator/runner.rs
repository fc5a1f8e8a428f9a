//! The build orchestrator: sequences phases, enforces the budget and
//! deadline, and commits a checkpoint after every phase.

use serde_json::json;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::state::{BuildMetrics, BuildStatus, FailureReport};
use crate::agent::QueryBackend;
use crate::checkpoint::{CheckpointStore, PhaseRecord, PhaseSnapshot};
use crate::connections::{ConnectionManager, ConnectionSettings, ProviderConfig, ToolProvider};
use crate::cost::{Cost, CostTracker};
use crate::errors::{BuildError, FailureClass};
use crate::executor::{CancelReason, ExecutorSettings, PhaseExecutor, PhaseInputs, RunControl};
use crate::hooks::HookManager;
use crate::phase::{PhaseDefinition, PhaseResult, PhaseStatus, phase_names};
use crate::recovery::RecoveryPolicy;
use crate::spec::BuildSpecification;

#[derive(Debug, Clone, Copy, Default)]
pub struct OrchestratorSettings {
    /// Build-wide deadline, accumulated across resumes
    pub max_duration: Option<Duration>,
    pub executor: ExecutorSettings,
    pub policy: RecoveryPolicy,
    pub connections: ConnectionSettings,
}

/// Where a run starts and what it carries over from earlier runs.
struct BuildRun {
    spec: BuildSpecification,
    store: CheckpointStore,
    metrics: BuildMetrics,
    tracker: CostTracker,
    start_index: usize,
    progress: Vec<PhaseRecord>,
    prior_outputs: Vec<(String, String)>,
    budget: Cost,
}

/// Everything the phase loop mutates.
struct LoopState<'a> {
    spec: &'a Arc<BuildSpecification>,
    store: &'a CheckpointStore,
    metrics: &'a mut BuildMetrics,
    progress: &'a mut Vec<PhaseRecord>,
    prior_outputs: &'a mut Vec<(String, String)>,
    base_duration: Duration,
    started: Instant,
}

impl LoopState<'_> {
    fn elapsed(&self) -> Duration {
        self.base_duration + self.started.elapsed()
    }

    /// Fold a finished phase into the metrics and persist it before the
    /// next phase may start.
    fn commit(&mut self, index: usize, result: &PhaseResult) -> Result<(), BuildError> {
        self.metrics.record_phase(result);
        self.metrics.total_duration = self.elapsed();
        self.progress.push(PhaseRecord {
            name: result.phase.clone(),
            status: result.status,
        });
        self.store.save(
            &*self.metrics,
            self.spec,
            &self.progress[..],
            Some(&PhaseSnapshot::new(index, result)),
        )?;
        if result.is_completed() {
            self.prior_outputs
                .push((result.phase.clone(), result.output.clone()));
        }
        Ok(())
    }
}

/// Owns the fixed phase list and drives a build through it.
pub struct BuildOrchestrator {
    phases: Vec<PhaseDefinition>,
    backend: Arc<dyn QueryBackend>,
    tool_provider: Arc<dyn ToolProvider>,
    providers: Vec<ProviderConfig>,
    hooks: Arc<HookManager>,
    settings: OrchestratorSettings,
    checkpoint_dir: PathBuf,
    project_name: Option<String>,
    cancel: Option<CancellationToken>,
}

impl BuildOrchestrator {
    pub fn new(
        phases: Vec<PhaseDefinition>,
        backend: Arc<dyn QueryBackend>,
        tool_provider: Arc<dyn ToolProvider>,
        checkpoint_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            phases,
            backend,
            tool_provider,
            providers: Vec::new(),
            hooks: Arc::new(HookManager::new()),
            settings: OrchestratorSettings::default(),
            checkpoint_dir: checkpoint_dir.into(),
            project_name: None,
            cancel: None,
        }
    }

    pub fn with_providers(mut self, providers: Vec<ProviderConfig>) -> Self {
        self.providers = providers;
        self
    }

    pub fn with_hooks(mut self, hooks: HookManager) -> Self {
        self.hooks = Arc::new(hooks);
        self
    }

    pub fn with_settings(mut self, settings: OrchestratorSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Name recorded in metrics instead of the one derived from the spec.
    pub fn with_project_name(mut self, name: Option<String>) -> Self {
        self.project_name = name;
        self
    }

    /// External cancellation (e.g. Ctrl-C). Stops dispatch like a budget breach.
    pub fn with_cancel_token(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    pub fn phases(&self) -> &[PhaseDefinition] {
        &self.phases
    }

    pub fn checkpoint_dir(&self) -> &Path {
        &self.checkpoint_dir
    }

    fn validate_phases(&self) -> Result<(), BuildError> {
        let mut seen = BTreeSet::new();
        for phase in &self.phases {
            phase.validate()?;
            if !seen.insert(phase.name.as_str()) {
                return Err(anyhow::anyhow!("phase '{}' is declared twice", phase.name).into());
            }
        }
        Ok(())
    }

    /// Run a fresh build from the first phase. An existing checkpoint in the
    /// checkpoint directory is replaced.
    ///
    /// In-build failures (budget, phase failure, deadline) are reported in
    /// the returned metrics; `Err` means the build could not be run or its
    /// state could not be persisted.
    pub async fn start(
        &self,
        spec: BuildSpecification,
        budget: f64,
    ) -> Result<BuildMetrics, BuildError> {
        self.validate_phases()?;
        let store = CheckpointStore::new(&self.checkpoint_dir);
        store.clear()?;

        let build_id = uuid::Uuid::new_v4().to_string();
        let project_name = self
            .project_name
            .clone()
            .unwrap_or_else(|| spec.project_name());
        let metrics = BuildMetrics::new(build_id, project_name);
        info!(
            build_id = %metrics.build_id,
            project = %metrics.project_name,
            budget,
            phases = self.phases.len(),
            "starting build"
        );

        self.execute(BuildRun {
            spec,
            store,
            metrics,
            tracker: CostTracker::new(),
            start_index: 0,
            progress: Vec::new(),
            prior_outputs: Vec::new(),
            budget: Cost::from_f64(budget),
        })
        .await
    }

    /// Continue a build from its latest checkpoint in `checkpoint_dir`.
    ///
    /// `budget` is the ceiling for the whole build including spend recorded
    /// before the interruption, unless `reset_cost` restarts cost accounting.
    /// Nothing is written if the directory holds no resumable checkpoint.
    pub async fn resume(
        &self,
        checkpoint_dir: &Path,
        budget: f64,
        reset_cost: bool,
    ) -> Result<BuildMetrics, BuildError> {
        self.validate_phases()?;
        let store = CheckpointStore::new(checkpoint_dir);
        let (checkpoint, spec) = store.load_verified(&phase_names(&self.phases))?;

        let start_index = checkpoint.resume_index();
        let mut metrics = checkpoint.metadata.metrics.clone();
        if metrics.status == BuildStatus::Completed && start_index == self.phases.len() {
            info!(build_id = %metrics.build_id, "build already completed, nothing to resume");
            return Ok(metrics);
        }

        if reset_cost {
            info!(spent = %metrics.total_cost, "resetting cost accounting");
            metrics.reset_cost();
        }
        // Progress is rebuilt from the completed prefix; the failed phase re-runs.
        metrics.phases_failed = 0;
        metrics.failure = None;
        metrics.completed_at = None;

        info!(
            build_id = %metrics.build_id,
            resume_from = self.phases.get(start_index).map(|p| p.name.as_str()).unwrap_or("-"),
            spent = %metrics.total_cost,
            "resuming build"
        );

        let tracker = CostTracker::with_totals(metrics.totals());
        let progress = checkpoint.metadata.progress[..start_index].to_vec();
        let prior_outputs = checkpoint.prior_outputs();
        self.execute(BuildRun {
            spec,
            store,
            metrics,
            tracker,
            start_index,
            progress,
            prior_outputs,
            budget: Cost::from_f64(budget),
        })
        .await
    }

    async fn execute(&self, run: BuildRun) -> Result<BuildMetrics, BuildError> {
        let BuildRun {
            spec,
            store,
            mut metrics,
            tracker,
            start_index,
            mut progress,
            mut prior_outputs,
            budget,
        } = run;

        let spec = Arc::new(spec);
        let cost = Arc::new(tracker);
        let control = Arc::new(RunControl::new(budget));
        let connections = Arc::new(ConnectionManager::new(
            self.tool_provider.clone(),
            self.providers.clone(),
            self.hooks.clone(),
            self.settings.connections,
        ));
        let executor = PhaseExecutor::new(
            self.backend.clone(),
            connections.clone(),
            self.hooks.clone(),
            cost.clone(),
            self.settings.policy,
            self.settings.executor,
        );

        let base_duration = metrics.total_duration;
        let watchers = self.spawn_watchers(&control, base_duration);
        metrics.status = BuildStatus::Running;
        connections.open_all().await;

        let mut state = LoopState {
            spec: &spec,
            store: &store,
            metrics: &mut metrics,
            progress: &mut progress,
            prior_outputs: &mut prior_outputs,
            base_duration,
            started: Instant::now(),
        };
        let outcome = self
            .run_phases(&mut state, start_index, &executor, &cost, &control)
            .await;
        let elapsed = state.elapsed();

        for watcher in watchers {
            watcher.abort();
        }
        let close_errors = connections.close_all().await;
        if !close_errors.is_empty() {
            metrics
                .metadata
                .insert("connection_close_errors".to_string(), json!(close_errors));
        }
        metrics.total_duration = elapsed;

        let failure = outcome?;
        match failure {
            None => {
                metrics.finish(BuildStatus::Completed, None);
                info!(
                    build_id = %metrics.build_id,
                    cost = %metrics.total_cost,
                    tokens = metrics.total_tokens,
                    "build completed"
                );
            }
            Some(err) => {
                let remaining = cost.remaining(budget);
                error!(
                    build_id = %metrics.build_id,
                    class = %err.class(),
                    phase = err.phase().unwrap_or("-"),
                    remaining,
                    "build failed: {err}"
                );
                metrics.finish(
                    BuildStatus::Failed,
                    Some(FailureReport::from_error(&err, remaining)),
                );
            }
        }

        store.save(&metrics, &spec, &progress, None)?;
        Ok(metrics)
    }

    /// Deadline and external-cancel watchers; both only ever cancel `control`.
    fn spawn_watchers(
        &self,
        control: &Arc<RunControl>,
        already_elapsed: Duration,
    ) -> Vec<tokio::task::JoinHandle<()>> {
        let mut watchers = Vec::new();
        if let Some(max) = self.settings.max_duration {
            let remaining = max.saturating_sub(already_elapsed);
            let control = control.clone();
            watchers.push(tokio::spawn(async move {
                tokio::select! {
                    _ = tokio::time::sleep(remaining) => {
                        warn!(max_secs = max.as_secs(), "build deadline reached");
                        control.cancel(CancelReason::Deadline);
                    }
                    _ = control.token().cancelled() => {}
                }
            }));
        }
        if let Some(external) = self.cancel.clone() {
            let control = control.clone();
            watchers.push(tokio::spawn(async move {
                tokio::select! {
                    _ = external.cancelled() => control.cancel(CancelReason::External),
                    _ = control.token().cancelled() => {}
                }
            }));
        }
        watchers
    }

    /// Run phases from `start_index`. Returns the build-terminating
    /// condition, if any; `Err` only for checkpoint write failures.
    async fn run_phases(
        &self,
        state: &mut LoopState<'_>,
        start_index: usize,
        executor: &PhaseExecutor,
        cost: &CostTracker,
        control: &Arc<RunControl>,
    ) -> Result<Option<BuildError>, BuildError> {
        let budget = control.budget();

        for (index, def) in self.phases.iter().enumerate().skip(start_index) {
            if let Some(reason) = control.reason() {
                return Ok(Some(self.cancel_error(reason, &def.name, cost, budget, Cost::ZERO)));
            }

            if !def.enabled {
                info!(phase = %def.name, "phase disabled, skipping");
                state.commit(index, &PhaseResult::skipped(&def.name))?;
                continue;
            }

            if !cost.can_afford(def.min_cost, budget) {
                warn!(
                    phase = %def.name,
                    spent = %cost.spent(),
                    projected = %def.min_cost,
                    budget = %budget,
                    "phase would exceed budget, not starting"
                );
                return Ok(Some(budget_error(&def.name, cost, budget, def.min_cost)));
            }

            let inputs = PhaseInputs {
                spec: state.spec.clone(),
                prior_outputs: Arc::new(state.prior_outputs.clone()),
            };
            info!(phase = %def.name, index, "running phase");
            let result = executor.run(def, &inputs, control).await;
            state.commit(index, &result)?;

            if result.status == PhaseStatus::Failed {
                return Ok(Some(self.phase_error(&result, control, cost, budget)));
            }
            if cost.check(budget).is_err() {
                return Ok(Some(budget_error(&def.name, cost, budget, Cost::ZERO)));
            }
        }

        // A resume past the last phase must not turn an overshoot into success.
        if cost.check(budget).is_err() {
            let last = self.phases.last().map(|p| p.name.as_str()).unwrap_or("-");
            return Ok(Some(budget_error(last, cost, budget, Cost::ZERO)));
        }
        Ok(None)
    }

    fn phase_error(
        &self,
        result: &PhaseResult,
        control: &RunControl,
        cost: &CostTracker,
        budget: Cost,
    ) -> BuildError {
        let Some(err) = &result.error else {
            return BuildError::PhaseFailed {
                phase: result.phase.clone(),
                class: FailureClass::Fatal,
                message: "phase failed without an error".to_string(),
            };
        };
        match (err.class, control.reason()) {
            (FailureClass::BudgetExceeded, Some(reason)) | (FailureClass::Fatal, Some(reason @ CancelReason::External)) => {
                self.cancel_error(reason, &result.phase, cost, budget, Cost::ZERO)
            }
            (FailureClass::BudgetExceeded, None) => budget_error(&result.phase, cost, budget, Cost::ZERO),
            (class, _) => BuildError::PhaseFailed {
                phase: result.phase.clone(),
                class,
                message: err.message.clone(),
            },
        }
    }

    fn cancel_error(
        &self,
        reason: CancelReason,
        phase: &str,
        cost: &CostTracker,
        budget: Cost,
        projected: Cost,
    ) -> BuildError {
        match reason {
            CancelReason::BudgetExceeded => budget_error(phase, cost, budget, projected),
            CancelReason::Deadline => BuildError::DeadlineExceeded {
                phase: phase.to_string(),
                secs: self.settings.max_duration.map(|d| d.as_secs()).unwrap_or(0),
            },
            CancelReason::External => BuildError::Cancelled {
                phase: phase.to_string(),
            },
        }
    }
}

fn budget_error(phase: &str, cost: &CostTracker, budget: Cost, projected: Cost) -> BuildError {
    BuildError::BudgetExceeded {
        phase: phase.to_string(),
        spent: cost.spent().as_f64(),
        projected: projected.as_f64(),
        budget: budget.as_f64(),
        remaining: cost.remaining(budget),
    }
}
