use std::io::{self, Write};
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::CommandFactory;
use clap_complete::Shell;
use serde::Serialize;
use stackup_core::{RunStatus, StackConfig, UpgradeError};
use stackup_engine::{
    default_config_path, default_state_root, Capabilities, HostLayout, HttpReadinessProbe,
    Orchestrator, PauseReason, RunOutcome, RunRequest, SystemHost, SystemVersionReporter,
};

use crate::render::{
    current_output_style, format_history_lines, format_plan_lines, format_run_lines,
    format_status_lines, render_status_line, OutputStyle,
};
use crate::session::TerminalSession;
use crate::signal::install_interrupt_flag;
use crate::{Cli, Commands};

const HTTP_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum CommandStatus {
    Success,
    RunFailed,
    Paused,
}

/// Stack configuration plus the system implementations of every host capability.
struct StackContext {
    config: StackConfig,
    layout: HostLayout,
    host: SystemHost,
    reporter: SystemVersionReporter,
    probe: HttpReadinessProbe,
}

impl StackContext {
    fn load(root: Option<PathBuf>, config_path: Option<PathBuf>) -> Result<Self> {
        let config_path = config_path.unwrap_or_else(default_config_path);
        let config = StackConfig::load(&config_path)?;
        let root = root.unwrap_or_else(default_state_root);
        tracing::debug!(
            config = %config_path.display(),
            root = %root.display(),
            components = config.components.len(),
            "stack configuration loaded"
        );
        Ok(Self {
            config,
            layout: HostLayout::new(root),
            host: SystemHost::new(),
            reporter: SystemVersionReporter::new(HTTP_REQUEST_TIMEOUT)?,
            probe: HttpReadinessProbe::new(HTTP_REQUEST_TIMEOUT)?,
        })
    }

    fn orchestrator(&self) -> Orchestrator<'_> {
        Orchestrator::new(
            &self.config,
            self.layout.clone(),
            Capabilities {
                host: &self.host,
                reporter: &self.reporter,
                probe: &self.probe,
            },
        )
    }
}

pub(crate) fn run_cli(cli: Cli) -> Result<CommandStatus, UpgradeError> {
    let Cli {
        root,
        config,
        command,
    } = cli;
    let style = current_output_style();

    match command {
        Commands::Upgrade {
            mode,
            selection,
            yes,
        } => {
            let context = StackContext::load(root, config)?;
            let session = TerminalSession::new(style, yes);
            let interrupt = install_interrupt_flag()?;
            let outcome = context
                .orchestrator()
                .with_gate(&session)
                .with_observer(&session)
                .with_interrupt(interrupt)
                .run(&RunRequest {
                    mode,
                    filter: selection.into_filter(),
                });
            session.finish();
            Ok(report_outcome(outcome?, style))
        }
        Commands::Plan { selection, json } => {
            let context = StackContext::load(root, config)?;
            let report = context.orchestrator().plan(&selection.into_filter())?;
            if json {
                print_json(&report)?;
            } else {
                print_lines(&format_plan_lines(&report, style));
            }
            Ok(CommandStatus::Success)
        }
        Commands::Status { json } => {
            let context = StackContext::load(root, config)?;
            let report = context.orchestrator().status()?;
            if json {
                print_json(&report)?;
            } else {
                print_lines(&format_status_lines(&report, style));
            }
            Ok(CommandStatus::Success)
        }
        Commands::Resume { yes } => {
            let context = StackContext::load(root, config)?;
            let session = TerminalSession::new(style, yes);
            let interrupt = install_interrupt_flag()?;
            let outcome = context
                .orchestrator()
                .with_gate(&session)
                .with_observer(&session)
                .with_interrupt(interrupt)
                .resume();
            session.finish();
            Ok(report_outcome(outcome?, style))
        }
        Commands::Rollback { run } => {
            let context = StackContext::load(root, config)?;
            let session = TerminalSession::new(style, true);
            let interrupt = install_interrupt_flag()?;
            let outcome = context
                .orchestrator()
                .with_observer(&session)
                .with_interrupt(interrupt)
                .rollback(run.as_deref());
            session.finish();
            Ok(report_outcome(outcome?, style))
        }
        Commands::History { json } => {
            let context = StackContext::load(root, config)?;
            let runs = context.orchestrator().history()?;
            if json {
                print_json(&runs)?;
            } else {
                print_lines(&format_history_lines(&runs));
            }
            Ok(CommandStatus::Success)
        }
        Commands::Completions { shell } => {
            let mut stdout = io::stdout();
            write_completions(shell, &mut stdout)?;
            Ok(CommandStatus::Success)
        }
    }
}

pub(crate) fn report_outcome(outcome: RunOutcome, style: OutputStyle) -> CommandStatus {
    let (lines, status) = outcome_lines(&outcome, style);
    print_lines(&lines);
    status
}

pub(crate) fn outcome_lines(outcome: &RunOutcome, style: OutputStyle) -> (Vec<String>, CommandStatus) {
    match outcome {
        RunOutcome::Finished(run) => {
            let status = match run.status {
                RunStatus::Completed | RunStatus::RolledBack => CommandStatus::Success,
                _ => CommandStatus::RunFailed,
            };
            (format_run_lines(run, style), status)
        }
        RunOutcome::Paused { run, reason } => {
            let why = match reason {
                PauseReason::Declined { phase } => format!("phase {phase} was not confirmed"),
                PauseReason::Interrupted => "interrupted".to_string(),
            };
            let mut lines = format_run_lines(run, style);
            lines.push(render_status_line(
                style,
                "warn",
                &format!("run {} paused ({why}); continue with `stackup resume`", run.id),
            ));
            (lines, CommandStatus::Paused)
        }
        RunOutcome::DryRun(report) => (format_plan_lines(report, style), CommandStatus::Success),
        RunOutcome::NothingToResume => (
            vec![render_status_line(style, "ok", "nothing to resume")],
            CommandStatus::Success,
        ),
    }
}

pub(crate) fn write_completions<W: Write>(shell: Shell, writer: &mut W) -> Result<()> {
    let mut command = Cli::command();
    let mut generated = Vec::new();
    clap_complete::generate(shell, &mut command, "stackup", &mut generated);
    writer
        .write_all(&generated)
        .context("failed writing generated completion script")
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let rendered = serde_json::to_string_pretty(value).context("failed to serialize output")?;
    println!("{rendered}");
    Ok(())
}

fn print_lines(lines: &[String]) {
    for line in lines {
        println!("{line}");
    }
}
