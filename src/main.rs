use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

mod cmd;

use cmd::RunArgs;

#[derive(Parser)]
#[command(name = "forge-parallel")]
#[command(version, about = "Work through issue files in parallel git worktrees")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[arg(long, global = true)]
    pub project_dir: Option<PathBuf>,

    /// Config file (defaults to .forge/parallel.toml in the project)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Process active issues wave by wave
    Run(RunArgs),
    /// Print the wave plan without running anything
    Plan(RunArgs),
    /// Show saved run state and leftover worktrees
    Status,
    /// Remove worker worktrees and branches
    Clean {
        /// Also delete the saved run state
        #[arg(long)]
        state: bool,
    },
}

fn init_tracing(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .or_else(|_| EnvFilter::try_new(default_level))
                .unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let project_dir = match cli.project_dir.clone() {
        Some(dir) => dir,
        None => std::env::current_dir().context("Failed to get current directory")?,
    };
    let project_dir = std::fs::canonicalize(&project_dir)
        .with_context(|| format!("Project directory {} not found", project_dir.display()))?;
    let config_path = cli.config.as_deref();

    let code = match &cli.command {
        Commands::Run(args) => cmd::cmd_run(&project_dir, config_path, args, false).await?,
        Commands::Plan(args) => cmd::cmd_run(&project_dir, config_path, args, true).await?,
        Commands::Status => cmd::cmd_status(&project_dir, config_path).await?,
        Commands::Clean { state } => cmd::cmd_clean(&project_dir, config_path, *state).await?,
    };

    if code != 0 {
        std::process::exit(code);
    }
    Ok(())
}
