//! Main CLI application structure

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use super::output::{Output, OutputFormat};
use super::{cache_cmd, errors_cmd, load, plan, status};
use crate::runtime::DegradationMode;
use crate::storage::Workspace;

#[derive(Parser)]
#[command(name = "unitwave")]
#[command(author, version, about = "Dependency-ordered, wave-parallel loading of shell units")]
#[command(propagate_version = true)]
pub struct Cli {
    /// Workspace root (defaults to the nearest directory containing .unitwave/)
    #[arg(long, global = true, env = "UNITWAVE_ROOT")]
    pub root: Option<PathBuf>,

    /// Output format
    #[arg(long, short = 'f', global = true, default_value = "text")]
    pub format: OutputFormat,

    /// Enable debug logging on stderr
    #[arg(long, short = 'v', global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Initialize a new unitwave workspace
    Init {
        /// Path to initialize (defaults to current directory)
        #[arg(default_value = ".")]
        path: PathBuf,
    },

    /// Load every enabled unit and record the result
    Load {
        /// Degradation mode for this load (full, graceful, minimal, safe)
        #[arg(long)]
        mode: Option<DegradationMode>,

        /// Maximum units running at once within a wave
        #[arg(long)]
        max_concurrency: Option<usize>,
    },

    /// Show the waves a load would run, without running anything
    Plan,

    /// Show the report of the last load
    Status,

    /// Show recorded errors, newest last
    Errors {
        /// Number of entries to show
        #[arg(long, short = 'n', default_value = "20")]
        limit: usize,

        /// Only show errors of this unit
        #[arg(long)]
        unit: Option<String>,
    },

    /// Manage the metadata cache
    #[command(subcommand)]
    Cache(cache_cmd::CacheCommands),
}

/// Main entry point for the CLI
pub fn run() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    let output = Output::new(cli.format);

    tracing::debug!(command = command_name(&cli.command), "unitwave starting");

    match cli.command {
        Commands::Init { path } => {
            let workspace = Workspace::init(&path)?;
            tracing::debug!(dir = %workspace.dir().display(), "created workspace directory");
            output.success(&format!(
                "Initialized unitwave workspace at {}",
                workspace.root().display()
            ));
        }

        Commands::Load {
            mode,
            max_concurrency,
        } => {
            let mut workspace = open_workspace(cli.root.as_deref())?;
            load::run(&mut workspace, &output, mode, max_concurrency)?
        }

        Commands::Plan => {
            let workspace = open_workspace(cli.root.as_deref())?;
            plan::run(&workspace, &output)?
        }

        Commands::Status => {
            let workspace = open_workspace(cli.root.as_deref())?;
            status::run(&workspace, &output)?
        }

        Commands::Errors { limit, unit } => {
            let workspace = open_workspace(cli.root.as_deref())?;
            errors_cmd::run(&workspace, &output, limit, unit.as_deref())?
        }

        Commands::Cache(cmd) => {
            let workspace = open_workspace(cli.root.as_deref())?;
            cache_cmd::run(cmd, &workspace, &output)?
        }
    }

    tracing::debug!("command completed");
    Ok(())
}

/// Installs the stderr subscriber
///
/// `--verbose` forces `debug`; otherwise `RUST_LOG` applies, defaulting to
/// `warn`.
fn init_tracing(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };

    // A subscriber may already be installed when embedded in tests
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

fn open_workspace(root: Option<&Path>) -> Result<Workspace> {
    match root {
        Some(root) => Workspace::open(root),
        None => {
            let cwd = std::env::current_dir().context("Failed to read current directory")?;
            Workspace::discover(&cwd)
        }
    }
}

fn command_name(command: &Commands) -> &'static str {
    match command {
        Commands::Init { .. } => "init",
        Commands::Load { .. } => "load",
        Commands::Plan => "plan",
        Commands::Status => "status",
        Commands::Errors { .. } => "errors",
        Commands::Cache(_) => "cache",
    }
}
