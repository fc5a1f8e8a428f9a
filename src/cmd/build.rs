//! `buildforge start` and `buildforge resume`.

use anyhow::Result;
use console::style;
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use buildforge::agent::ClaudeCliBackend;
use buildforge::config::Config;
use buildforge::connections::StdioProvider;
use buildforge::errors::BuildError;
use buildforge::hooks::HookManager;
use buildforge::orchestrator::{BuildMetrics, BuildOrchestrator, BuildStatus};
use buildforge::spec::BuildSpecification;

use super::super::Cli;

pub async fn cmd_start(
    cli: &Cli,
    project_dir: &Path,
    spec: &Path,
    budget: Option<f64>,
) -> Result<u8> {
    let config = load_config(cli, project_dir)?;
    let spec = BuildSpecification::load(spec)?;
    let budget = config.budget(budget);

    println!(
        "{} {} (budget {:.4})",
        style("Starting build:").bold(),
        style(spec.source_path().display()).cyan(),
        budget
    );
    let orchestrator = orchestrator(&config)?;
    Ok(report(orchestrator.start(spec, budget).await))
}

pub async fn cmd_resume(
    cli: &Cli,
    project_dir: &Path,
    checkpoint_dir: Option<&Path>,
    budget: Option<f64>,
    reset_cost: bool,
) -> Result<u8> {
    let config = load_config(cli, project_dir)?;
    let checkpoint_dir = checkpoint_dir
        .map(Path::to_path_buf)
        .unwrap_or_else(|| config.checkpoint_dir());
    let budget = config.budget(budget);

    println!(
        "{} {}{}",
        style("Resuming build from").bold(),
        style(checkpoint_dir.display()).cyan(),
        if reset_cost { " (cost reset)" } else { "" }
    );
    let orchestrator = orchestrator(&config)?;
    Ok(report(
        orchestrator.resume(&checkpoint_dir, budget, reset_cost).await,
    ))
}

fn load_config(cli: &Cli, project_dir: &Path) -> Result<Config> {
    let config = Config::load(project_dir, cli.verbose)?;
    for warning in config.validate() {
        warn!("config: {warning}");
    }
    Ok(config)
}

fn orchestrator(config: &Config) -> Result<BuildOrchestrator> {
    let backend = ClaudeCliBackend::new(config.claude_cmd(), &config.project_dir)
        .with_model(config.model());
    let hooks = HookManager::from_definitions(config.hooks(), &config.project_dir);

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupted, stopping after running invocations finish");
            on_interrupt.cancel();
        }
    });

    Ok(BuildOrchestrator::new(
        config.phases()?,
        Arc::new(backend),
        Arc::new(StdioProvider),
        config.checkpoint_dir(),
    )
    .with_providers(config.providers())
    .with_hooks(hooks)
    .with_settings(config.orchestrator_settings())
    .with_project_name(config.project_name())
    .with_cancel_token(cancel))
}

fn report(outcome: Result<BuildMetrics, BuildError>) -> u8 {
    match outcome {
        Ok(metrics) => {
            print_summary(&metrics);
            metrics.exit_code()
        }
        Err(err) => {
            eprintln!("{} {err}", style("Build not run:").red().bold());
            err.exit_code()
        }
    }
}

fn print_summary(metrics: &BuildMetrics) {
    let status = match metrics.status {
        BuildStatus::Completed => style(metrics.status.as_str()).green().bold(),
        BuildStatus::Failed => style(metrics.status.as_str()).red().bold(),
        _ => style(metrics.status.as_str()).yellow(),
    };

    println!();
    println!("Build {} {}", style(&metrics.build_id).dim(), status);
    println!("  Project:   {}", metrics.project_name);
    println!(
        "  Phases:    {} completed, {} skipped, {} failed",
        metrics.phases_completed, metrics.phases_skipped, metrics.phases_failed
    );
    println!("  Cost:      {}", metrics.total_cost);
    println!("  Tokens:    {}", metrics.total_tokens);
    println!("  Calls:     {}", metrics.agent_calls);
    println!("  Duration:  {:.1}s", metrics.total_duration.as_secs_f64());

    if let Some(failure) = &metrics.failure {
        println!();
        println!(
            "  {} [{}] {}",
            style("Failure:").red(),
            failure.class,
            failure.message
        );
        println!("  Remaining budget: {:.4}", failure.remaining_budget);
        println!(
            "  {}",
            style("Run `buildforge resume` to continue from the last checkpoint.").dim()
        );
    }
    if let Some(errors) = metrics.metadata.get("connection_close_errors") {
        println!("  {} {}", style("Close errors:").yellow(), errors);
    }
}
