use super::*;
use clap::error::ErrorKind as ClapErrorKind;
use clap::CommandFactory;
use stackup_core::{ComponentStatus, ComponentUpgrade, RunKind, RunStatus, UpgradeRun, UpgradeStage};
use stackup_engine::{
    DryRunEntry, DryRunReport, GateDecision, PauseReason, RunOutcome, StatusReport,
};

use crate::dispatch::{outcome_lines, write_completions};
use crate::render::{
    format_history_lines, format_plan_lines, format_run_lines, format_status_lines,
    format_upgrade_line, render_status_line, OutputStyle,
};
use crate::session::parse_confirmation;

fn completed_upgrade(id: &str, component: &str, from: &str, to: &str) -> ComponentUpgrade {
    let mut upgrade = ComponentUpgrade::new(id, component, 0, Some(from.to_string()), to);
    for stage in [
        UpgradeStage::Validating,
        UpgradeStage::BackingUp,
        UpgradeStage::Installing,
        UpgradeStage::Starting,
        UpgradeStage::HealthChecking,
        UpgradeStage::Completed,
    ] {
        upgrade.enter(stage, 1_771_001_300).expect("must follow stage machine");
    }
    upgrade
}

fn sample_run(status: RunStatus) -> UpgradeRun {
    let mut run = UpgradeRun::new("run-1771001234-42-0", RunKind::Upgrade, UpgradeMode::Standard, 1_771_001_234);
    run.status = status;
    run.phases = vec!["exporters".to_string()];
    run.upgrades
        .push(completed_upgrade("run-1771001234-42-0-1", "node_exporter", "1.7.0", "1.9.1"));
    run
}

#[test]
fn upgrade_flags_parse_into_request_parts() {
    let cli = Cli::try_parse_from([
        "stackup",
        "upgrade",
        "--mode",
        "safe",
        "--phase",
        "metrics",
        "--component",
        "prometheus",
        "--component",
        "alertmanager",
        "--yes",
    ])
    .expect("must parse upgrade");

    let Commands::Upgrade {
        mode,
        selection,
        yes,
    } = cli.command
    else {
        panic!("expected upgrade command");
    };
    assert_eq!(mode, UpgradeMode::Safe);
    assert!(yes);
    assert_eq!(
        selection.into_filter(),
        RunFilter {
            phase: Some("metrics".to_string()),
            components: vec!["prometheus".to_string(), "alertmanager".to_string()],
        }
    );
}

#[test]
fn upgrade_defaults_to_standard_mode() {
    let cli = Cli::try_parse_from(["stackup", "upgrade"]).expect("must parse upgrade");
    assert!(matches!(
        cli.command,
        Commands::Upgrade {
            mode: UpgradeMode::Standard,
            yes: false,
            ..
        }
    ));
}

#[test]
fn dry_run_mode_is_accepted() {
    let cli = Cli::try_parse_from(["stackup", "upgrade", "--mode", "dry-run"])
        .expect("must parse dry-run");
    assert!(matches!(
        cli.command,
        Commands::Upgrade {
            mode: UpgradeMode::DryRun,
            ..
        }
    ));
}

#[test]
fn unknown_mode_is_rejected() {
    let err = Cli::try_parse_from(["stackup", "upgrade", "--mode", "yolo"])
        .expect_err("unknown mode must fail");
    assert_eq!(err.kind(), ClapErrorKind::ValueValidation);
}

#[test]
fn global_root_and_config_follow_subcommand() {
    let cli = Cli::try_parse_from([
        "stackup",
        "status",
        "--json",
        "--root",
        "/tmp/stackup-root",
        "--config",
        "/tmp/stackup.toml",
    ])
    .expect("must parse globals after subcommand");
    assert_eq!(cli.root, Some(PathBuf::from("/tmp/stackup-root")));
    assert_eq!(cli.config, Some(PathBuf::from("/tmp/stackup.toml")));
    assert!(matches!(cli.command, Commands::Status { json: true }));
}

#[test]
fn rollback_accepts_explicit_run_id() {
    let cli = Cli::try_parse_from(["stackup", "rollback", "--run", "run-1771001234-42-0"])
        .expect("must parse rollback");
    let Commands::Rollback { run } = cli.command else {
        panic!("expected rollback command");
    };
    assert_eq!(run.as_deref(), Some("run-1771001234-42-0"));
}

#[test]
fn cli_definition_is_consistent() {
    Cli::command().debug_assert();
}

#[test]
fn completions_name_the_binary_and_commands() {
    let mut output = Vec::new();
    write_completions(Shell::Bash, &mut output).expect("must write completions");
    let script = String::from_utf8(output).expect("completion script is utf-8");
    assert!(script.contains("stackup"));
    assert!(script.contains("rollback"));
}

#[test]
fn render_status_line_plain_is_unadorned() {
    assert_eq!(
        render_status_line(OutputStyle::Plain, "ok", "upgraded node_exporter"),
        "upgraded node_exporter"
    );
}

#[test]
fn render_status_line_rich_includes_ascii_badge() {
    assert_eq!(
        render_status_line(OutputStyle::Rich, "err", "health check failed"),
        "[ERR] health check failed"
    );
    assert_eq!(
        render_status_line(OutputStyle::Rich, "step", "installing"),
        "[..] installing"
    );
}

#[test]
fn upgrade_line_shows_step_and_reason() {
    let mut upgrade = ComponentUpgrade::new("run-1-2", "prometheus", 1, Some("2.45.0".to_string()), "2.55.1");
    upgrade.step = Some("1/2".to_string());
    assert_eq!(
        format_upgrade_line(&upgrade),
        "prometheus (step 1/2): 2.45.0 -> 2.55.1 pending (pending)"
    );

    upgrade
        .enter(UpgradeStage::Validating, 1)
        .expect("must validate");
    upgrade
        .mark_failed("validation failed for prometheus: unmet dependencies", 2)
        .expect("must fail");
    assert_eq!(
        format_upgrade_line(&upgrade),
        "prometheus (step 1/2): 2.45.0 -> 2.55.1 failed (validation failed for prometheus: unmet dependencies)"
    );
}

#[test]
fn run_lines_list_entries_and_errors() {
    let mut run = sample_run(RunStatus::Failed);
    run.errors.push(stackup_core::RunError {
        at_unix: 1_771_001_400,
        kind: ErrorKind::HealthCheck,
        component: Some("node_exporter".to_string()),
        upgrade_id: Some("run-1771001234-42-0-1".to_string()),
        message: "health check failed for node_exporter: HTTP 503".to_string(),
    });

    let lines = format_run_lines(&run, OutputStyle::Rich);
    assert_eq!(
        lines[0],
        "[ERR] run run-1771001234-42-0 (upgrade, mode=standard): failed"
    );
    assert_eq!(
        lines[1],
        "[OK]   node_exporter: 1.7.0 -> 1.9.1 completed"
    );
    assert_eq!(
        lines[2],
        "[ERR]   health_check [node_exporter]: health check failed for node_exporter: HTTP 503"
    );
}

#[test]
fn plan_lines_show_gate_decisions() {
    let report = DryRunReport {
        active_run: None,
        phases: vec!["exporters".to_string(), "logs".to_string()],
        entries: vec![
            DryRunEntry {
                phase: "exporters".to_string(),
                component: "node_exporter".to_string(),
                step: None,
                from: Some("1.7.0".to_string()),
                to: "1.9.1".to_string(),
                decision: GateDecision::Upgrade,
            },
            DryRunEntry {
                phase: "logs".to_string(),
                component: "loki".to_string(),
                step: None,
                from: Some("3.3.0".to_string()),
                to: "3.3.0".to_string(),
                decision: GateDecision::Skip("already at 3.3.0".to_string()),
            },
        ],
    };

    let lines = format_plan_lines(&report, OutputStyle::Plain);
    assert_eq!(
        lines,
        vec![
            "1 of 2 planned upgrade(s) would run across phases: exporters, logs",
            "  [exporters] node_exporter: 1.7.0 -> 1.9.1: upgrade",
            "  [logs] loki: 3.3.0 -> 3.3.0: skip (already at 3.3.0)",
        ]
    );
}

#[test]
fn plan_lines_warn_about_active_run() {
    let report = DryRunReport {
        active_run: Some("run-7".to_string()),
        ..DryRunReport::default()
    };
    let lines = format_plan_lines(&report, OutputStyle::Rich);
    assert!(lines[0].starts_with("[WARN] run run-7 is in progress"));
    assert_eq!(lines[1], "[OK] no components selected");
}

#[test]
fn status_lines_flag_a_running_orchestration() {
    let report = StatusReport {
        active: Some(sample_run(RunStatus::InProgress)),
        last_archived: None,
        running_pid: Some(4242),
    };
    let lines = format_status_lines(&report, OutputStyle::Plain);
    assert_eq!(
        lines[0],
        "upgrade running (pid 4242); state may change while you read it"
    );
    assert!(lines[1].starts_with("active run run-1771001234-42-0"));

    let idle = format_status_lines(&StatusReport::default(), OutputStyle::Plain);
    assert_eq!(idle, vec!["no active run"]);
}

#[test]
fn history_lines_count_statuses() {
    let lines = format_history_lines(&[sample_run(RunStatus::Completed)]);
    assert_eq!(
        lines,
        vec!["run-1771001234-42-0 upgrade completed mode=standard completed=1 skipped=0 failed=0 rolled_back=0"]
    );
    assert_eq!(format_history_lines(&[]), vec!["no finished runs"]);
}

#[test]
fn outcomes_map_to_command_status() {
    let (_, status) = outcome_lines(
        &RunOutcome::Finished(sample_run(RunStatus::Completed)),
        OutputStyle::Plain,
    );
    assert_eq!(status, CommandStatus::Success);

    let (_, status) = outcome_lines(
        &RunOutcome::Finished(sample_run(RunStatus::Failed)),
        OutputStyle::Plain,
    );
    assert_eq!(status, CommandStatus::RunFailed);

    let (lines, status) = outcome_lines(
        &RunOutcome::Paused {
            run: sample_run(RunStatus::InProgress),
            reason: PauseReason::Declined {
                phase: "metrics".to_string(),
            },
        },
        OutputStyle::Plain,
    );
    assert_eq!(status, CommandStatus::Paused);
    assert!(lines
        .last()
        .is_some_and(|line| line.contains("phase metrics was not confirmed")));

    let (lines, status) = outcome_lines(&RunOutcome::NothingToResume, OutputStyle::Plain);
    assert_eq!(status, CommandStatus::Success);
    assert_eq!(lines, vec!["nothing to resume"]);
}

#[test]
fn exit_codes_follow_error_class() {
    assert_eq!(exit_code_for_status(CommandStatus::Success), 0);
    assert_eq!(exit_code_for_status(CommandStatus::RunFailed), EXIT_FAILED);
    assert_eq!(exit_code_for_status(CommandStatus::Paused), EXIT_PAUSED);

    let busy = UpgradeError::AlreadyRunning {
        path: "/var/lib/stackup/state/stackup.lock".to_string(),
        waited_secs: 30,
        holder: " (held by pid 4242)".to_string(),
    };
    assert_eq!(exit_code_for_error(&busy), EXIT_ALREADY_RUNNING);
    assert_eq!(
        exit_code_for_error(&UpgradeError::rollback("loki", "restored version did not become ready")),
        EXIT_MANUAL_INTERVENTION
    );
    assert_eq!(
        exit_code_for_error(&UpgradeError::corruption("run.json", "unparsable")),
        EXIT_MANUAL_INTERVENTION
    );
    assert_eq!(
        exit_code_for_error(&UpgradeError::validation("loki", "downgrade")),
        EXIT_FAILED
    );
}

#[test]
fn only_explicit_yes_confirms_a_phase() {
    assert!(parse_confirmation("y\n"));
    assert!(parse_confirmation(" YES "));
    assert!(!parse_confirmation(""));
    assert!(!parse_confirmation("n\n"));
    assert!(!parse_confirmation("sure"));
}

#[test]
fn completed_sample_status_is_terminal() {
    let run = sample_run(RunStatus::Completed);
    assert_eq!(run.upgrades[0].status, ComponentStatus::Completed);
    run.validate().expect("sample run must be consistent");
}
