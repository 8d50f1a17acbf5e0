use std::io::IsTerminal;

use anstyle::{AnsiColor, Effects, Style};
use stackup_core::{ComponentStatus, ComponentUpgrade, RunKind, RunStatus, UpgradeRun};
use stackup_engine::{DryRunEntry, DryRunReport, GateDecision, StatusReport};

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum OutputStyle {
    Plain,
    Rich,
}

pub(crate) fn current_output_style() -> OutputStyle {
    if std::env::var_os("NO_COLOR").is_some() || !std::io::stdout().is_terminal() {
        OutputStyle::Plain
    } else {
        OutputStyle::Rich
    }
}

pub(crate) fn render_status_line(style: OutputStyle, status: &str, message: &str) -> String {
    match style {
        OutputStyle::Plain => message.to_string(),
        OutputStyle::Rich => format!("{} {message}", status_badge(status)),
    }
}

fn status_badge(status: &str) -> &'static str {
    match status {
        "ok" => "[OK]",
        "warn" => "[WARN]",
        "err" => "[ERR]",
        "skip" => "[SKIP]",
        _ => "[..]",
    }
}

pub(crate) fn render_section_header(style: OutputStyle, title: &str) -> Option<String> {
    match style {
        OutputStyle::Plain => None,
        OutputStyle::Rich => Some(colorize(section_style(), &format!("== {title} =="))),
    }
}

fn section_style() -> Style {
    Style::new()
        .fg_color(Some(AnsiColor::BrightBlue.into()))
        .effects(Effects::BOLD)
}

fn colorize(style: Style, text: &str) -> String {
    format!("{}{}{}", style.render(), text, style.render_reset())
}

pub(crate) fn component_badge(status: ComponentStatus) -> &'static str {
    match status {
        ComponentStatus::Completed => "ok",
        ComponentStatus::Skipped => "skip",
        ComponentStatus::Failed => "err",
        ComponentStatus::RolledBack => "warn",
        ComponentStatus::Pending | ComponentStatus::InProgress => "step",
    }
}

fn run_badge(status: RunStatus) -> &'static str {
    match status {
        RunStatus::Completed => "ok",
        RunStatus::RolledBack => "warn",
        RunStatus::Failed => "err",
        RunStatus::Pending | RunStatus::InProgress => "step",
    }
}

fn component_label(component: &str, step: Option<&str>) -> String {
    match step {
        Some(step) => format!("{component} (step {step})"),
        None => component.to_string(),
    }
}

pub(crate) fn format_upgrade_line(upgrade: &ComponentUpgrade) -> String {
    let mut line = format!(
        "{}: {} -> {} {}",
        component_label(&upgrade.component, upgrade.step.as_deref()),
        upgrade.from_version.as_deref().unwrap_or("-"),
        upgrade.to_version,
        upgrade.status.as_str()
    );
    if !upgrade.is_terminal() {
        line.push_str(&format!(" ({})", upgrade.stage.as_str()));
    } else if let Some(reason) = &upgrade.reason {
        line.push_str(&format!(" ({reason})"));
    }
    line
}

fn format_run_header(run: &UpgradeRun) -> String {
    let kind = match (run.kind, run.restores_run.as_deref()) {
        (RunKind::Restore, Some(target)) => format!("restore of {target}"),
        (RunKind::Restore, None) => "restore".to_string(),
        (RunKind::Upgrade, _) => format!("upgrade, mode={}", run.mode.as_str()),
    };
    format!("run {} ({kind}): {}", run.id, run.status.as_str())
}

pub(crate) fn format_run_lines(run: &UpgradeRun, style: OutputStyle) -> Vec<String> {
    let mut lines = vec![render_status_line(
        style,
        run_badge(run.status),
        &format_run_header(run),
    )];
    for upgrade in &run.upgrades {
        lines.push(render_status_line(
            style,
            component_badge(upgrade.status),
            &format!("  {}", format_upgrade_line(upgrade)),
        ));
    }
    for error in &run.errors {
        let component = error.component.as_deref().unwrap_or("run");
        lines.push(render_status_line(
            style,
            "err",
            &format!("  {} [{component}]: {}", error.kind.as_str(), error.message),
        ));
    }
    lines
}

fn format_plan_entry(entry: &DryRunEntry) -> (&'static str, String) {
    let label = component_label(&entry.component, entry.step.as_deref());
    let from = entry.from.as_deref().unwrap_or("-");
    let (badge, decision) = match &entry.decision {
        GateDecision::Upgrade => ("step", "upgrade".to_string()),
        GateDecision::Skip(reason) => ("skip", format!("skip ({reason})")),
        GateDecision::Refuse(reason) => ("err", format!("refuse ({reason})")),
    };
    (
        badge,
        format!("  [{}] {label}: {from} -> {}: {decision}", entry.phase, entry.to),
    )
}

pub(crate) fn format_plan_lines(report: &DryRunReport, style: OutputStyle) -> Vec<String> {
    let mut lines = Vec::new();
    if let Some(active) = &report.active_run {
        lines.push(render_status_line(
            style,
            "warn",
            &format!("run {active} is in progress; `stackup upgrade` resumes it instead"),
        ));
    }
    if report.entries.is_empty() {
        lines.push(render_status_line(style, "ok", "no components selected"));
        return lines;
    }

    let touched = report.touched().count();
    lines.push(render_status_line(
        style,
        "ok",
        &format!(
            "{touched} of {} planned upgrade(s) would run across phases: {}",
            report.entries.len(),
            report.phases.join(", ")
        ),
    ));
    for entry in &report.entries {
        let (badge, line) = format_plan_entry(entry);
        lines.push(render_status_line(style, badge, &line));
    }
    lines
}

pub(crate) fn format_status_lines(report: &StatusReport, style: OutputStyle) -> Vec<String> {
    let mut lines = Vec::new();
    if let Some(pid) = report.running_pid {
        lines.push(render_status_line(
            style,
            "warn",
            &format!("upgrade running (pid {pid}); state may change while you read it"),
        ));
    }
    match &report.active {
        Some(run) => {
            let phase = run
                .phases
                .get(run.current_phase)
                .map(|name| format!("phase {}/{} ({name})", run.current_phase + 1, run.phases.len()))
                .unwrap_or_else(|| "no phases".to_string());
            lines.push(render_status_line(
                style,
                run_badge(run.status),
                &format!("active {}, {phase}", format_run_header(run)),
            ));
            lines.extend(run.upgrades.iter().map(|upgrade| {
                render_status_line(
                    style,
                    component_badge(upgrade.status),
                    &format!("  {}", format_upgrade_line(upgrade)),
                )
            }));
        }
        None => lines.push(render_status_line(style, "ok", "no active run")),
    }
    if let Some(last) = &report.last_archived {
        lines.push(render_status_line(
            style,
            run_badge(last.status),
            &format!("last {}", format_run_header(last)),
        ));
    }
    lines
}

pub(crate) fn format_history_lines(runs: &[UpgradeRun]) -> Vec<String> {
    if runs.is_empty() {
        return vec!["no finished runs".to_string()];
    }
    runs.iter()
        .map(|run| {
            format!(
                "{} {} {} mode={} completed={} skipped={} failed={} rolled_back={}",
                run.id,
                match run.kind {
                    RunKind::Upgrade => "upgrade",
                    RunKind::Restore => "restore",
                },
                run.status.as_str(),
                run.mode.as_str(),
                run.count_with_status(ComponentStatus::Completed),
                run.count_with_status(ComponentStatus::Skipped),
                run.count_with_status(ComponentStatus::Failed),
                run.count_with_status(ComponentStatus::RolledBack)
            )
        })
        .collect()
}
