//! End-to-end build scenarios against the library API with a scripted
//! query backend.

use async_trait::async_trait;
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::tempdir;

use buildforge::agent::{AgentKind, QueryBackend, QueryFailure, QueryOutput};
use buildforge::checkpoint::CheckpointStore;
use buildforge::connections::StdioProvider;
use buildforge::cost::Cost;
use buildforge::errors::{AgentError, BuildError, CheckpointError, FailureClass, exit_code};
use buildforge::orchestrator::{BuildOrchestrator, BuildStatus, OrchestratorSettings};
use buildforge::phase::{AgentStep, PhaseDefinition, PhaseStatus, phase_names};
use buildforge::recovery::{Backoff, RecoveryPolicy};
use buildforge::spec::BuildSpecification;

enum Reply {
    Ok(f64),
    Hang,
    Fail(AgentError),
}

/// Replies keyed by the step id in the prompt header.
#[derive(Default)]
struct FakeBackend {
    script: Mutex<HashMap<String, VecDeque<Reply>>>,
    calls: Mutex<Vec<String>>,
}

impl FakeBackend {
    fn reply(self, step: &str, reply: Reply) -> Self {
        self.script
            .lock()
            .unwrap()
            .entry(step.to_string())
            .or_default()
            .push_back(reply);
        self
    }

    fn calls(&self, step: &str) -> usize {
        self.calls.lock().unwrap().iter().filter(|s| *s == step).count()
    }
}

fn step_of(prompt: &str) -> String {
    prompt
        .lines()
        .next()
        .and_then(|header| header.split("agent: ").nth(1))
        .map(|rest| rest.trim_end_matches(']').to_string())
        .unwrap_or_default()
}

#[async_trait]
impl QueryBackend for FakeBackend {
    async fn query(
        &self,
        prompt: &str,
        _allowed_capabilities: &BTreeSet<String>,
    ) -> Result<QueryOutput, QueryFailure> {
        let step = step_of(prompt);
        self.calls.lock().unwrap().push(step.clone());
        let reply = self
            .script
            .lock()
            .unwrap()
            .get_mut(&step)
            .and_then(VecDeque::pop_front)
            .unwrap_or(Reply::Ok(0.0));
        match reply {
            Reply::Ok(cost) => Ok(QueryOutput {
                text: format!("{step} done"),
                cost: Cost::from_f64(cost),
                tokens: 100,
            }),
            Reply::Hang => {
                std::future::pending::<()>().await;
                unreachable!()
            }
            Reply::Fail(err) => Err(err.into()),
        }
    }
}

fn pipeline(names: &[&str]) -> Vec<PhaseDefinition> {
    names
        .iter()
        .map(|name| {
            PhaseDefinition::new(name, "work")
                .then_run(AgentStep::required(&format!("{name}_agent"), AgentKind::Generator))
        })
        .collect()
}

fn write_spec(dir: &Path, text: &str) -> PathBuf {
    let path = dir.join("spec.md");
    std::fs::write(&path, text).unwrap();
    path
}

fn orchestrator(
    phases: Vec<PhaseDefinition>,
    backend: FakeBackend,
    checkpoint_dir: &Path,
) -> (BuildOrchestrator, Arc<FakeBackend>) {
    let backend = Arc::new(backend);
    let orch = BuildOrchestrator::new(
        phases,
        backend.clone(),
        Arc::new(StdioProvider),
        checkpoint_dir,
    );
    (orch, backend)
}

#[tokio::test]
async fn budget_projection_stops_before_the_phase_that_would_overrun() {
    let dir = tempdir().unwrap();
    let checkpoints = dir.path().join("checkpoint");
    let mut phases = pipeline(&["one", "two", "three"]);
    phases[2].min_cost = Cost::from_f64(5.0);
    let backend = FakeBackend::default()
        .reply("one_agent", Reply::Ok(3.0))
        .reply("two_agent", Reply::Ok(4.0))
        .reply("three_agent", Reply::Ok(5.0));
    let (orch, backend) = orchestrator(phases, backend, &checkpoints);

    let spec = BuildSpecification::load(&write_spec(dir.path(), "# App\n")).unwrap();
    let metrics = orch.start(spec, 10.0).await.unwrap();

    assert_eq!(metrics.status, BuildStatus::Failed);
    assert_eq!(metrics.total_cost, Cost::from_f64(7.0));
    assert_eq!(metrics.phases_completed, 2);
    assert_eq!(metrics.exit_code(), exit_code::BUDGET_EXCEEDED);
    let failure = metrics.failure.as_ref().unwrap();
    assert_eq!(failure.class, FailureClass::BudgetExceeded);
    assert_eq!(failure.phase.as_deref(), Some("three"));
    assert_eq!(backend.calls("three_agent"), 0);

    let store = CheckpointStore::new(&checkpoints);
    let metadata = store.load_metadata().unwrap();
    assert_eq!(metadata.status, BuildStatus::Failed);
    assert_eq!(metadata.last_completed_phase.as_deref(), Some("two"));
    assert_eq!(metadata.metrics.total_cost, Cost::from_f64(7.0));
}

#[tokio::test(start_paused = true)]
async fn timed_out_calls_are_retried_until_success() {
    let dir = tempdir().unwrap();
    let checkpoints = dir.path().join("checkpoint");
    let phases = vec![
        PhaseDefinition::new("analysis", "analyze")
            .then_run(AgentStep::required("analyzer", AgentKind::Analyzer))
            .with_call_timeout(Duration::from_secs(5)),
    ];
    let backend = FakeBackend::default()
        .reply("analyzer", Reply::Hang)
        .reply("analyzer", Reply::Hang)
        .reply("analyzer", Reply::Ok(0.25));
    let (orch, backend) = orchestrator(phases.clone(), backend, &checkpoints);
    let orch = orch.with_settings(OrchestratorSettings {
        policy: RecoveryPolicy {
            max_attempts: 3,
            backoff: Backoff::new(Duration::from_millis(100), Duration::from_secs(1)),
            corrective_retry: true,
        },
        ..OrchestratorSettings::default()
    });

    let spec = BuildSpecification::load(&write_spec(dir.path(), "# App\n")).unwrap();
    let metrics = orch.start(spec, 10.0).await.unwrap();

    assert_eq!(metrics.status, BuildStatus::Completed);
    assert_eq!(metrics.agent_calls, 3);
    assert_eq!(backend.calls("analyzer"), 3);

    let checkpoint = CheckpointStore::new(&checkpoints)
        .load(&phase_names(&phases))
        .unwrap();
    let result = &checkpoint.snapshots[0].result;
    assert_eq!(result.status, PhaseStatus::Completed);
    let outcomes: Vec<bool> = result.responses.iter().map(|r| r.success).collect();
    assert_eq!(outcomes, vec![false, false, true]);
}

#[tokio::test]
async fn resume_on_missing_checkpoint_is_not_resumable() {
    let dir = tempdir().unwrap();
    let missing = dir.path().join("never-written");
    let (orch, backend) = orchestrator(pipeline(&["one"]), FakeBackend::default(), &missing);

    let err = orch.resume(&missing, 10.0, false).await.unwrap_err();
    assert!(matches!(
        err,
        BuildError::NotResumable(CheckpointError::NotFound { .. })
    ));
    assert_eq!(err.exit_code(), exit_code::NOT_RESUMABLE);
    assert!(!missing.exists());
    assert_eq!(backend.calls.lock().unwrap().len(), 0);
}

#[tokio::test]
async fn interrupted_build_resumes_without_repeating_completed_phases() {
    let dir = tempdir().unwrap();
    let checkpoints = dir.path().join("checkpoint");
    let spec_path = write_spec(dir.path(), "# App\nbuild it");
    let names = ["one", "two", "three"];

    let first = FakeBackend::default()
        .reply("one_agent", Reply::Ok(1.0))
        .reply("two_agent", Reply::Fail(AgentError::Provider("credentials revoked".into())));
    let (orch, _) = orchestrator(pipeline(&names), first, &checkpoints);
    let spec = BuildSpecification::load(&spec_path).unwrap();
    let interrupted = orch.start(spec, 10.0).await.unwrap();
    assert_eq!(interrupted.status, BuildStatus::Failed);
    assert_eq!(interrupted.exit_code(), exit_code::FATAL);

    let second = FakeBackend::default()
        .reply("two_agent", Reply::Ok(2.0))
        .reply("three_agent", Reply::Ok(3.0));
    let (orch, backend) = orchestrator(pipeline(&names), second, &checkpoints);
    let resumed = orch.resume(&checkpoints, 10.0, false).await.unwrap();

    assert_eq!(resumed.status, BuildStatus::Completed);
    assert_eq!(resumed.build_id, interrupted.build_id);
    assert_eq!(backend.calls("one_agent"), 0);
    assert_eq!(resumed.phases_completed, 3);
    assert_eq!(resumed.total_cost, Cost::from_f64(6.0));

    // A finished build has nothing left to resume.
    let (orch, backend) = orchestrator(pipeline(&names), FakeBackend::default(), &checkpoints);
    let again = orch.resume(&checkpoints, 10.0, false).await.unwrap();
    assert_eq!(again.status, BuildStatus::Completed);
    assert_eq!(backend.calls.lock().unwrap().len(), 0);
}

#[tokio::test]
async fn changed_specification_blocks_resume() {
    let dir = tempdir().unwrap();
    let checkpoints = dir.path().join("checkpoint");
    let spec_path = write_spec(dir.path(), "# App\nversion one");

    let backend = FakeBackend::default()
        .reply("two_agent", Reply::Fail(AgentError::Provider("boom".into())));
    let (orch, _) = orchestrator(pipeline(&["one", "two"]), backend, &checkpoints);
    orch.start(BuildSpecification::load(&spec_path).unwrap(), 10.0)
        .await
        .unwrap();

    std::fs::write(&spec_path, "# App\nversion two").unwrap();
    let (orch, backend) = orchestrator(pipeline(&["one", "two"]), FakeBackend::default(), &checkpoints);
    let err = orch.resume(&checkpoints, 10.0, false).await.unwrap_err();
    assert!(matches!(
        err,
        BuildError::NotResumable(CheckpointError::SpecMismatch { .. })
    ));
    assert_eq!(backend.calls.lock().unwrap().len(), 0);
}

#[tokio::test]
async fn reordered_pipeline_blocks_resume() {
    let dir = tempdir().unwrap();
    let checkpoints = dir.path().join("checkpoint");
    let spec_path = write_spec(dir.path(), "# App\n");

    let (orch, _) = orchestrator(pipeline(&["one", "two"]), FakeBackend::default(), &checkpoints);
    orch.start(BuildSpecification::load(&spec_path).unwrap(), 10.0)
        .await
        .unwrap();

    let (orch, _) = orchestrator(pipeline(&["two", "one"]), FakeBackend::default(), &checkpoints);
    let err = orch.resume(&checkpoints, 10.0, false).await.unwrap_err();
    assert!(matches!(
        err,
        BuildError::NotResumable(CheckpointError::Invalid { .. })
    ));
}

#[tokio::test]
async fn every_phase_lands_in_the_checkpoint_before_the_next_starts() {
    let dir = tempdir().unwrap();
    let checkpoints = dir.path().join("checkpoint");
    let names = ["one", "two", "three"];
    let (orch, _) = orchestrator(pipeline(&names), FakeBackend::default(), &checkpoints);
    orch.start(
        BuildSpecification::load(&write_spec(dir.path(), "# App\n")).unwrap(),
        10.0,
    )
    .await
    .unwrap();

    let checkpoint = CheckpointStore::new(&checkpoints)
        .load(&phase_names(&pipeline(&names)))
        .unwrap();
    assert_eq!(checkpoint.resume_index(), 3);
    let prior = checkpoint.prior_outputs();
    assert_eq!(prior.len(), 3);
    assert!(prior[1].1.contains("two_agent done"));
}

#[tokio::test]
async fn overshoot_on_the_last_phase_is_not_forgiven_by_resume() {
    let dir = tempdir().unwrap();
    let checkpoints = dir.path().join("checkpoint");
    let spec_path = write_spec(dir.path(), "# App\n");
    let backend = FakeBackend::default()
        .reply("one_agent", Reply::Ok(3.0))
        .reply("two_agent", Reply::Ok(9.0));
    let (orch, _) = orchestrator(pipeline(&["one", "two"]), backend, &checkpoints);
    let first = orch
        .start(BuildSpecification::load(&spec_path).unwrap(), 10.0)
        .await
        .unwrap();
    assert_eq!(first.exit_code(), exit_code::BUDGET_EXCEEDED);

    let (orch, backend) = orchestrator(pipeline(&["one", "two"]), FakeBackend::default(), &checkpoints);
    let resumed = orch.resume(&checkpoints, 10.0, false).await.unwrap();

    assert_eq!(resumed.status, BuildStatus::Failed);
    assert_eq!(resumed.exit_code(), exit_code::BUDGET_EXCEEDED);
    assert_eq!(resumed.total_cost, Cost::from_f64(12.0));
    assert_eq!(backend.calls.lock().unwrap().len(), 0);
}
