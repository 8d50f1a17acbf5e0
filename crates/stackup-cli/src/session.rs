use std::io::{self, BufRead, Write};
use std::time::Duration;

use anyhow::{Context, Result};
use indicatif::{ProgressBar, ProgressStyle};
use stackup_core::{ComponentUpgrade, UpgradeRun};
use stackup_engine::{PhaseGate, RunObserver};

use crate::render::{
    component_badge, format_upgrade_line, render_section_header, render_status_line, OutputStyle,
};

/// Terminal side of a run: a spinner with per-entry lines in rich mode, and the
/// safe-mode confirmation prompt.
pub(crate) struct TerminalSession {
    style: OutputStyle,
    assume_yes: bool,
    spinner: Option<ProgressBar>,
}

impl TerminalSession {
    pub(crate) fn new(style: OutputStyle, assume_yes: bool) -> Self {
        let spinner = (style == OutputStyle::Rich).then(|| {
            let spinner = ProgressBar::new_spinner();
            if let Ok(template) = ProgressStyle::with_template("{spinner:.cyan.bold} {msg} {elapsed}")
            {
                spinner.set_style(template.tick_chars("-=~* "));
            }
            spinner.enable_steady_tick(Duration::from_millis(80));
            spinner
        });
        Self {
            style,
            assume_yes,
            spinner,
        }
    }

    pub(crate) fn finish(&self) {
        if let Some(spinner) = &self.spinner {
            spinner.finish_and_clear();
        }
    }

    fn print_live(&self, line: String) {
        if let Some(spinner) = &self.spinner {
            spinner.println(line);
        }
    }
}

impl RunObserver for TerminalSession {
    fn phase_started(&self, run: &UpgradeRun, phase: usize) {
        let title = format!(
            "phase {}/{}: {}",
            phase + 1,
            run.phases.len(),
            run.phases[phase]
        );
        if let Some(header) = render_section_header(self.style, &title) {
            self.print_live(header);
        }
    }

    fn stage_changed(&self, upgrade: &ComponentUpgrade) {
        if let Some(spinner) = &self.spinner {
            spinner.set_message(format!("{} {}", upgrade.component, upgrade.stage.as_str()));
        }
    }

    fn upgrade_finished(&self, upgrade: &ComponentUpgrade) {
        self.print_live(render_status_line(
            self.style,
            component_badge(upgrade.status),
            &format_upgrade_line(upgrade),
        ));
    }
}

impl PhaseGate for TerminalSession {
    fn confirm(&self, run: &UpgradeRun, phase: usize) -> Result<bool> {
        if self.assume_yes {
            return Ok(true);
        }
        let question = format!(
            "Proceed with phase {}/{} ({}, {} upgrade(s))? [y/N] ",
            phase + 1,
            run.phases.len(),
            run.phases[phase],
            run.phase_indices(phase).len()
        );
        let answer = match &self.spinner {
            Some(spinner) => spinner.suspend(|| prompt(&question)),
            None => prompt(&question),
        }?;
        Ok(parse_confirmation(&answer))
    }
}

fn prompt(question: &str) -> Result<String> {
    let mut stderr = io::stderr();
    stderr
        .write_all(question.as_bytes())
        .and_then(|()| stderr.flush())
        .context("failed to write confirmation prompt")?;
    let mut answer = String::new();
    io::stdin()
        .lock()
        .read_line(&mut answer)
        .context("failed to read confirmation from stdin")?;
    Ok(answer)
}

/// Only an explicit yes proceeds; anything else, including end of input, pauses.
pub(crate) fn parse_confirmation(answer: &str) -> bool {
    matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes")
}
