use clap::{Parser, Subcommand, ValueEnum};
use console::style;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use buildforge::errors::exit_code;

mod cmd;

#[derive(Parser)]
#[command(name = "buildforge")]
#[command(version, about = "Multi-phase, budget-bounded build orchestrator")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Project root (defaults to the current directory)
    #[arg(long, global = true)]
    pub project_dir: Option<PathBuf>,

    #[arg(long, value_enum, default_value_t = LogFormat::Pretty, global = true)]
    pub log_format: LogFormat,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Pretty,
    Json,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start a new build from a specification file
    Start {
        /// Path to the specification (markdown or plain text)
        #[arg(short, long)]
        spec: PathBuf,

        /// Cost ceiling for the whole build (defaults to build.budget)
        #[arg(short, long)]
        budget: Option<f64>,
    },
    /// Resume a build from its latest checkpoint
    Resume {
        /// Checkpoint directory (defaults to .buildforge/checkpoint)
        #[arg(long)]
        checkpoint_dir: Option<PathBuf>,

        /// Cost ceiling for the whole build, including earlier spend
        #[arg(short, long)]
        budget: Option<f64>,

        /// Start cost accounting from zero
        #[arg(long)]
        reset_cost: bool,
    },
    /// Show the latest checkpoint without changing it
    Status {
        #[arg(long)]
        checkpoint_dir: Option<PathBuf>,
    },
    /// List the effective phase table
    Phases,
}

fn init_logging(verbose: bool, format: LogFormat) {
    let default = if verbose { "buildforge=debug" } else { "buildforge=info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let registry = tracing_subscriber::registry().with(filter);
    let result = match format {
        LogFormat::Pretty => registry
            .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
            .try_init(),
        LogFormat::Json => registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .try_init(),
    };
    if let Err(e) = result {
        eprintln!("Failed to initialize logging: {e}");
    }
}

async fn run(cli: &Cli) -> anyhow::Result<u8> {
    use anyhow::Context;

    let project_dir = match cli.project_dir.clone() {
        Some(dir) => dir,
        None => std::env::current_dir().context("Failed to get current directory")?,
    };

    match &cli.command {
        Commands::Start { spec, budget } => cmd::cmd_start(cli, &project_dir, spec, *budget).await,
        Commands::Resume {
            checkpoint_dir,
            budget,
            reset_cost,
        } => {
            cmd::cmd_resume(
                cli,
                &project_dir,
                checkpoint_dir.as_deref(),
                *budget,
                *reset_cost,
            )
            .await
        }
        Commands::Status { checkpoint_dir } => {
            cmd::cmd_status(cli, &project_dir, checkpoint_dir.as_deref())
        }
        Commands::Phases => cmd::cmd_phases(cli, &project_dir),
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.log_format);

    let code = match run(&cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("{} {e:#}", style("error:").red().bold());
            exit_code::FATAL
        }
    };
    ExitCode::from(code)
}
