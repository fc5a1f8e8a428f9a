//! Read-only commands: `buildforge status` and `buildforge phases`.

use anyhow::Result;
use console::style;
use std::path::Path;

use buildforge::checkpoint::CheckpointStore;
use buildforge::config::Config;
use buildforge::errors::{BuildError, CheckpointError, exit_code};

use super::super::Cli;

pub fn cmd_status(cli: &Cli, project_dir: &Path, checkpoint_dir: Option<&Path>) -> Result<u8> {
    let config = Config::load(project_dir, cli.verbose)?;
    let dir = checkpoint_dir
        .map(Path::to_path_buf)
        .unwrap_or_else(|| config.checkpoint_dir());
    let store = CheckpointStore::new(&dir);

    let metadata = match store.load_metadata() {
        Ok(metadata) => metadata,
        Err(CheckpointError::NotFound { .. }) => {
            println!();
            println!("No checkpoint in {}. Run 'buildforge start' first.", dir.display());
            println!();
            return Ok(exit_code::SUCCESS);
        }
        Err(err) => {
            eprintln!("{} {err}", style("error:").red().bold());
            return Ok(BuildError::from(err).exit_code());
        }
    };
    let metrics = &metadata.metrics;

    println!();
    println!("Checkpoint: {}", store.metadata_path().display());
    println!("Project:    {}", metadata.project_name);
    println!("Build:      {}", metrics.build_id);
    println!("Status:     {}", metadata.status);
    println!("Sequence:   {}", metadata.sequence);
    println!("Written at: {}", metadata.written_at.format("%Y-%m-%d %H:%M:%S UTC"));
    let short_hash: String = metadata.spec_hash.chars().take(12).collect();
    println!("Spec:       {} ({short_hash})", metadata.spec_path.display());
    println!(
        "Last completed phase: {}",
        metadata.last_completed_phase.as_deref().unwrap_or("-")
    );
    println!();
    println!("{:<4} {:<24} Status", "#", "Phase");
    println!("{:<4} {:<24} ------", "--", "-----");
    for (i, record) in metadata.progress.iter().enumerate() {
        println!("{:<4} {:<24} {}", i, record.name, record.status);
    }
    println!();
    println!(
        "Spent {} over {} calls ({} tokens)",
        metrics.total_cost, metrics.agent_calls, metrics.total_tokens
    );
    if let Some(failure) = &metrics.failure {
        println!(
            "{} [{}] {}",
            style("Failure:").red(),
            failure.class,
            failure.message
        );
    }
    println!();
    Ok(exit_code::SUCCESS)
}

pub fn cmd_phases(cli: &Cli, project_dir: &Path) -> Result<u8> {
    let config = Config::load(project_dir, cli.verbose)?;
    let phases = config.phases()?;

    let source = config.phases_file();
    println!();
    if source.exists() {
        println!("Phases loaded from: {}", source.display());
    } else {
        println!("Default phases");
    }
    println!();
    println!("{:<4} {:<22} {:<10} {:<8} Agents", "#", "Phase", "Min cost", "Enabled");
    println!("{:<4} {:<22} {:<10} {:<8} ------", "--", "-----", "--------", "-------");

    for (i, phase) in phases.iter().enumerate() {
        let waves: Vec<String> = phase
            .waves
            .iter()
            .map(|wave| {
                wave.iter()
                    .map(|step| {
                        if step.required {
                            step.id.clone()
                        } else {
                            format!("{}?", step.id)
                        }
                    })
                    .collect::<Vec<_>>()
                    .join(" + ")
            })
            .collect();
        let enabled = if phase.enabled {
            style("yes").green()
        } else {
            style("no").dim()
        };
        println!(
            "{:<4} {:<22} {:<10} {:<8} {}",
            i,
            phase.name,
            phase.min_cost.to_string(),
            enabled,
            waves.join(" -> ")
        );
    }
    println!();
    println!("{}", style("`?` marks optional agents; `+` runs in parallel.").dim());
    println!();
    Ok(exit_code::SUCCESS)
}
