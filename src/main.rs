//! rootforge - root filesystem and boot image builder.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use rootforge::commands::{self, BuildOptions};
use rootforge::config::Config;

#[derive(Parser)]
#[command(name = "rootforge")]
#[command(about = "Build a root filesystem from source units and assemble boot images")]
#[command(
    after_help = "QUICK START:\n  rootforge preflight  Check host tools and inputs\n  rootforge build      Build units, then all images\n  rootforge status     Show which units are built\n  rootforge clean      Remove build artifacts"
)]
struct Cli {
    /// Directory holding .env and the default paths (default: current directory)
    #[arg(short = 'C', long, global = true)]
    dir: Option<PathBuf>,

    /// More log output (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Only log errors
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build all units, then normalize, harden, extract the closure and assemble images
    Build {
        #[command(flatten)]
        run: RunArgs,
    },

    /// Build units only
    Units {
        #[command(flatten)]
        run: RunArgs,
    },

    /// Merge legacy top-level directories into /usr
    Normalize,

    /// Apply protection flags to ELF executables
    Harden,

    /// Copy the bootstrap tools and their libraries into the bootstrap root
    Closure {
        /// Check every copied object resolves inside the bootstrap root
        #[arg(long)]
        verify: bool,
    },

    /// Assemble root image, bootstrap archive and boot media
    Image,

    /// Show checkpoint state of every unit
    Status,

    /// Drop checkpoints so units rebuild
    Invalidate {
        /// Units to invalidate
        #[arg(required_unless_present = "all")]
        units: Vec<String>,

        /// Invalidate every unit
        #[arg(long, conflicts_with = "units")]
        all: bool,
    },

    /// Show information
    Show {
        #[command(subcommand)]
        what: ShowTarget,
    },

    /// Run preflight checks (verify host tools and inputs before build)
    Preflight {
        /// Fail if any checks fail (exit code 1)
        #[arg(long)]
        strict: bool,
    },

    /// Clean build artifacts (default: images and bootstrap root)
    Clean {
        #[command(subcommand)]
        what: Option<CleanTarget>,
    },
}

#[derive(clap::Args)]
struct RunArgs {
    /// Rebuild this unit even if it has a checkpoint (repeatable)
    #[arg(long, value_name = "UNIT")]
    force: Vec<String>,

    /// Record unit failures and keep going
    #[arg(long)]
    continue_on_error: bool,
}

impl From<RunArgs> for BuildOptions {
    fn from(args: RunArgs) -> Self {
        BuildOptions {
            force: args.force,
            continue_on_error: args.continue_on_error,
        }
    }
}

#[derive(Subcommand)]
enum ShowTarget {
    /// Show current configuration
    Config,
    /// Show recorded checkpoints
    Checkpoints,
}

#[derive(Subcommand)]
enum CleanTarget {
    /// Images and bootstrap root
    Outputs,
    /// Step logs
    Logs,
    /// Checkpoints (every unit rebuilds)
    State,
    /// Everything, including the installed tree
    All,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = match cli.verbose {
        _ if cli.quiet => "error",
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into()))
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let base_dir = match cli.dir {
        Some(dir) => dir,
        None => std::env::current_dir().context("Failed to determine current directory")?,
    };
    let config = Config::load(&base_dir)?;

    match cli.command {
        Commands::Build { run } => commands::cmd_build(&config, &run.into())?,
        Commands::Units { run } => commands::cmd_units(&config, &run.into())?,
        Commands::Normalize => commands::cmd_normalize(&config)?,
        Commands::Harden => commands::cmd_harden(&config)?,
        Commands::Closure { verify } => commands::cmd_closure(&config, verify)?,
        Commands::Image => commands::cmd_image(&config)?,
        Commands::Status => commands::cmd_status(&config)?,
        Commands::Invalidate { units, all } => commands::cmd_invalidate(&config, &units, all)?,

        Commands::Show { what } => {
            let show_target = match what {
                ShowTarget::Config => commands::ShowTarget::Config,
                ShowTarget::Checkpoints => commands::ShowTarget::Checkpoints,
            };
            commands::cmd_show(show_target, &config)?;
        }

        Commands::Preflight { strict } => {
            commands::cmd_preflight(&config, strict)?;
        }

        Commands::Clean { what } => {
            let clean_target = match what {
                None | Some(CleanTarget::Outputs) => commands::CleanTarget::Outputs,
                Some(CleanTarget::Logs) => commands::CleanTarget::Logs,
                Some(CleanTarget::State) => commands::CleanTarget::State,
                Some(CleanTarget::All) => commands::CleanTarget::All,
            };
            commands::cmd_clean(&config, clean_target)?;
        }
    }

    Ok(())
}
