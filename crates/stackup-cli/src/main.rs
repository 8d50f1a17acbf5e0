use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use clap_complete::Shell;
use stackup_core::{ErrorKind, RunFilter, UpgradeError, UpgradeMode};
use tracing_subscriber::EnvFilter;

mod dispatch;
mod render;
mod session;
mod signal;

use dispatch::{run_cli, CommandStatus};

const LOG_ENV: &str = "STACKUP_LOG";
const DEFAULT_LOG_FILTER: &str = "info";

const EXIT_FAILED: u8 = 1;
const EXIT_PAUSED: u8 = 3;
const EXIT_MANUAL_INTERVENTION: u8 = 4;
/// `EX_TEMPFAIL`: another orchestration holds the lock; try again later.
const EXIT_ALREADY_RUNNING: u8 = 75;

#[derive(Parser, Debug)]
#[command(name = "stackup")]
#[command(version, about = "Idempotent upgrades for a host's observability stack", long_about = None)]
struct Cli {
    /// State and backup root [default: $STACKUP_ROOT or /var/lib/stackup]
    #[arg(long, global = true, value_name = "DIR")]
    root: Option<PathBuf>,
    /// Stack configuration [default: $STACKUP_CONFIG or /etc/stackup/stackup.toml]
    #[arg(long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Debug, Clone, Default, PartialEq, Eq)]
struct SelectionArgs {
    /// Only this phase, by name or 1-based position.
    #[arg(long)]
    phase: Option<String>,
    /// Only this component; repeatable.
    #[arg(long = "component", value_name = "NAME")]
    components: Vec<String>,
}

impl SelectionArgs {
    fn into_filter(self) -> RunFilter {
        RunFilter {
            phase: self.phase,
            components: self.components,
        }
    }
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Upgrade the stack towards its configured target versions, or resume the
    /// run left in progress.
    Upgrade {
        #[arg(long, default_value = "standard", value_parser = parse_mode)]
        mode: UpgradeMode,
        #[command(flatten)]
        selection: SelectionArgs,
        /// Confirm every phase up front in safe mode.
        #[arg(long, short = 'y')]
        yes: bool,
    },
    /// Show what an upgrade would do without touching the host.
    Plan {
        #[command(flatten)]
        selection: SelectionArgs,
        #[arg(long)]
        json: bool,
    },
    /// Current run and the most recent finished one.
    Status {
        #[arg(long)]
        json: bool,
    },
    /// Continue the run left in progress.
    Resume {
        #[arg(long, short = 'y')]
        yes: bool,
    },
    /// Restore the backups taken by a finished upgrade run.
    Rollback {
        /// Run to roll back [default: most recent run with completed upgrades]
        #[arg(long = "run", value_name = "ID")]
        run: Option<String>,
    },
    /// Finished runs, oldest first.
    History {
        #[arg(long)]
        json: bool,
    },
    /// Print a shell completion script.
    Completions { shell: Shell },
}

fn parse_mode(value: &str) -> Result<UpgradeMode, String> {
    UpgradeMode::parse(value).map_err(|err| err.to_string())
}

fn init_tracing() -> Result<()> {
    let filter = EnvFilter::try_from_env(LOG_ENV)
        .or_else(|_| EnvFilter::try_new(DEFAULT_LOG_FILTER))
        .context("failed to initialize log filter")?;
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
    Ok(())
}

fn exit_code_for_status(status: CommandStatus) -> u8 {
    match status {
        CommandStatus::Success => 0,
        CommandStatus::RunFailed => EXIT_FAILED,
        CommandStatus::Paused => EXIT_PAUSED,
    }
}

fn exit_code_for_error(err: &UpgradeError) -> u8 {
    match err.kind() {
        ErrorKind::AlreadyRunning => EXIT_ALREADY_RUNNING,
        ErrorKind::RollbackFailure | ErrorKind::StateCorruption => EXIT_MANUAL_INTERVENTION,
        _ => EXIT_FAILED,
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    if let Err(err) = init_tracing() {
        eprintln!("error: {err:#}");
        return ExitCode::from(EXIT_FAILED);
    }

    match run_cli(cli) {
        Ok(status) => ExitCode::from(exit_code_for_status(status)),
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::from(exit_code_for_error(&err))
        }
    }
}

#[cfg(test)]
mod tests;
