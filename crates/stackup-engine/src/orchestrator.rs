use anyhow::anyhow;
use serde::Serialize;
use stackup_core::{
    ComponentSpec, ComponentStatus, ComponentUpgrade, RunFilter, RunKind, RunStatus, StackConfig,
    UpgradeError, UpgradeMode, UpgradeRun, UpgradeStage,
};
use stackup_resolver::{
    plan_upgrades, select_components, InstalledVersion, VersionReporter, VersionResolver,
};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::backup::BackupManager;
use crate::fs_utils::current_unix_timestamp;
use crate::health::ReadinessProbe;
use crate::host::HostOps;
use crate::layout::HostLayout;
use crate::observer::{AutoApprove, NoopObserver, PhaseGate, RunObserver};
use crate::state_store::StateStore;
use crate::upgrader::{ComponentUpgrader, DriveOutcome, Gate};

static RUN_SEQUENCE: AtomicU64 = AtomicU64::new(0);

const RESTORE_PHASE: &str = "restore";

/// Host-facing capabilities the orchestrator drives.
#[derive(Clone, Copy)]
pub struct Capabilities<'a> {
    pub host: &'a dyn HostOps,
    pub reporter: &'a dyn VersionReporter,
    pub probe: &'a dyn ReadinessProbe,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunRequest {
    pub mode: UpgradeMode,
    pub filter: RunFilter,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PauseReason {
    /// The safe-mode confirmation for this phase was declined.
    Declined { phase: String },
    Interrupted,
}

#[derive(Debug)]
pub enum RunOutcome {
    /// The run reached a terminal status and was archived.
    Finished(UpgradeRun),
    /// The run is still `in_progress` and can be resumed.
    Paused { run: UpgradeRun, reason: PauseReason },
    DryRun(DryRunReport),
    NothingToResume,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "decision", content = "reason", rename_all = "snake_case")]
pub enum GateDecision {
    Upgrade,
    Skip(String),
    Refuse(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DryRunEntry {
    pub phase: String,
    pub component: String,
    pub step: Option<String>,
    pub from: Option<String>,
    pub to: String,
    pub decision: GateDecision,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DryRunReport {
    /// Id of a run that is still in progress; executing would resume it instead.
    pub active_run: Option<String>,
    pub phases: Vec<String>,
    pub entries: Vec<DryRunEntry>,
}

impl DryRunReport {
    /// Entries the run would actually change.
    pub fn touched(&self) -> impl Iterator<Item = &DryRunEntry> {
        self.entries
            .iter()
            .filter(|entry| entry.decision == GateDecision::Upgrade)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StatusReport {
    pub active: Option<UpgradeRun>,
    pub last_archived: Option<UpgradeRun>,
    /// Pid of the orchestration holding the state lock while this report was read.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub running_pid: Option<u32>,
}

pub struct Orchestrator<'a> {
    config: &'a StackConfig,
    layout: HostLayout,
    capabilities: Capabilities<'a>,
    backups: BackupManager,
    gate: &'a dyn PhaseGate,
    observer: &'a dyn RunObserver,
    interrupt: Arc<AtomicBool>,
}

impl<'a> Orchestrator<'a> {
    pub fn new(config: &'a StackConfig, layout: HostLayout, capabilities: Capabilities<'a>) -> Self {
        Self {
            config,
            backups: BackupManager::new(layout.clone()),
            layout,
            capabilities,
            gate: &AutoApprove,
            observer: &NoopObserver,
            interrupt: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn with_gate(mut self, gate: &'a dyn PhaseGate) -> Self {
        self.gate = gate;
        self
    }

    pub fn with_observer(mut self, observer: &'a dyn RunObserver) -> Self {
        self.observer = observer;
        self
    }

    pub fn with_interrupt(mut self, interrupt: Arc<AtomicBool>) -> Self {
        self.interrupt = interrupt;
        self
    }

    pub fn interrupt_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.interrupt)
    }

    /// Starts a new run, or resumes the one left `in_progress`.
    pub fn run(&self, request: &RunRequest) -> Result<RunOutcome, UpgradeError> {
        if request.mode == UpgradeMode::DryRun {
            return self.plan(&request.filter).map(RunOutcome::DryRun);
        }

        let store = StateStore::open_exclusive(&self.layout, self.lock_timeout())?;
        if let Some(existing) = store.load()? {
            if !existing.status.is_terminal() {
                if existing.mode != request.mode || existing.filter != request.filter {
                    tracing::warn!(
                        run = %existing.id,
                        mode = existing.mode.as_str(),
                        "resuming unfinished run with its original mode and filter"
                    );
                }
                return self.drive(&store, existing);
            }
            store.archive(&existing)?;
        }

        let run = self.new_upgrade_run(request)?;
        store.create(&run)?;
        tracing::info!(
            run = %run.id,
            mode = run.mode.as_str(),
            entries = run.upgrades.len(),
            "run created"
        );
        self.drive(&store, run)
    }

    /// Read-only plan with the Validating gate's verdict for each entry.
    pub fn plan(&self, filter: &RunFilter) -> Result<DryRunReport, UpgradeError> {
        let store = StateStore::open_reader(&self.layout)?;
        let active_run = store
            .load()?
            .filter(|run| !run.status.is_terminal())
            .map(|run| run.id);

        let selected = select_components(self.config, filter)?;
        let installed = self.installed_versions(&selected);
        let plan = plan_upgrades(self.config, &installed, filter)?;
        let upgrader = self.upgrader();

        let mut report = DryRunReport {
            active_run,
            ..DryRunReport::default()
        };
        for phase in &plan.phases {
            report.phases.push(phase.name.clone());
            for step in &phase.steps {
                let component = self.component(&step.component)?;
                let decision = if step.step.is_some_and(|(n, _)| n > 1) {
                    GateDecision::Upgrade
                } else {
                    match upgrader.evaluate_gate(component, &step.to, UpgradeMode::DryRun) {
                        Ok(Gate::Proceed { .. }) => GateDecision::Upgrade,
                        Ok(Gate::Skip(reason)) => GateDecision::Skip(reason),
                        Err(err) if !err.is_escalation() => GateDecision::Refuse(err.to_string()),
                        Err(err) => return Err(err),
                    }
                };
                report.entries.push(DryRunEntry {
                    phase: phase.name.clone(),
                    component: step.component.clone(),
                    step: step.step_label(),
                    from: step.from.as_ref().map(ToString::to_string),
                    to: step.to.to_string(),
                    decision,
                });
            }
        }
        Ok(report)
    }

    /// Continues an unfinished run; never starts a new one.
    pub fn resume(&self) -> Result<RunOutcome, UpgradeError> {
        let store = StateStore::open_exclusive(&self.layout, self.lock_timeout())?;
        match store.load()? {
            Some(run) if !run.status.is_terminal() => self.drive(&store, run),
            Some(run) => {
                store.archive(&run)?;
                Ok(RunOutcome::NothingToResume)
            }
            None => Ok(RunOutcome::NothingToResume),
        }
    }

    /// Operator rollback: restores the backups of an archived upgrade run's
    /// completed entries, newest first.
    pub fn rollback(&self, run_id: Option<&str>) -> Result<RunOutcome, UpgradeError> {
        let store = StateStore::open_exclusive(&self.layout, self.lock_timeout())?;
        if let Some(active) = store.load()? {
            if !active.status.is_terminal() {
                if active.kind == RunKind::Restore {
                    return self.drive(&store, active);
                }
                return Err(anyhow!(
                    "run {} is still in progress; resume it before rolling back",
                    active.id
                )
                .into());
            }
            store.archive(&active)?;
        }

        let history = store.history()?;
        let target = match run_id {
            Some(run_id) => history
                .iter()
                .rev()
                .find(|run| run.id == run_id && run.kind == RunKind::Upgrade)
                .ok_or_else(|| anyhow!("no archived upgrade run with id {run_id}"))?,
            None => history
                .iter()
                .rev()
                .find(|run| {
                    run.kind == RunKind::Upgrade
                        && run.count_with_status(ComponentStatus::Completed) > 0
                })
                .ok_or_else(|| anyhow!("no archived upgrade run with completed upgrades"))?,
        };
        if let Some(previous) = history.iter().find(|run| {
            run.restores_run.as_deref() == Some(target.id.as_str())
                && run.status == RunStatus::RolledBack
        }) {
            return Err(anyhow!(
                "run {} was already rolled back by {}",
                target.id,
                previous.id
            )
            .into());
        }

        let run = self.new_restore_run(target)?;
        store.create(&run)?;
        tracing::info!(
            run = %run.id,
            restores = %target.id,
            entries = run.upgrades.len(),
            "restore run created"
        );
        self.drive(&store, run)
    }

    /// Never waits for a running orchestration; reports it instead.
    pub fn status(&self) -> Result<StatusReport, UpgradeError> {
        let store = StateStore::open_reader(&self.layout)?;
        Ok(StatusReport {
            active: store.load()?,
            last_archived: store.history()?.pop(),
            running_pid: store.lock_holder(),
        })
    }

    pub fn history(&self) -> Result<Vec<UpgradeRun>, UpgradeError> {
        StateStore::open_reader(&self.layout)?.history()
    }

    fn drive(&self, store: &StateStore, mut run: UpgradeRun) -> Result<RunOutcome, UpgradeError> {
        if run.status == RunStatus::Pending {
            run.status = RunStatus::InProgress;
            persist(store, &mut run)?;
        }
        let upgrader = self.upgrader();

        while run.current_phase < run.phases.len() {
            let phase = run.current_phase;
            let phase_name = run.phases[phase].clone();

            if !run.phase_is_terminal(phase) {
                let untouched = run
                    .phase_indices(phase)
                    .iter()
                    .all(|&index| run.upgrades[index].stage == UpgradeStage::Pending);
                if untouched
                    && phase > 0
                    && run.mode.confirms_between_phases()
                    && !self.gate.confirm(&run, phase)?
                {
                    tracing::info!(run = %run.id, phase = %phase_name, "phase not confirmed; run paused");
                    return Ok(RunOutcome::Paused {
                        run,
                        reason: PauseReason::Declined { phase: phase_name },
                    });
                }

                tracing::info!(run = %run.id, phase = %phase_name, "phase started");
                self.observer.phase_started(&run, phase);

                for index in run.phase_indices(phase) {
                    if run.upgrades[index].is_terminal() {
                        continue;
                    }
                    if self.interrupt.load(Ordering::SeqCst) {
                        return Ok(RunOutcome::Paused {
                            run,
                            reason: PauseReason::Interrupted,
                        });
                    }
                    if let Some(blocker) = blocking_dependency(&run, index) {
                        let now = current_unix_timestamp()?;
                        run.upgrades[index]
                            .mark_skipped(format!("blocked: {blocker} did not complete"), now)?;
                        persist(store, &mut run)?;
                        self.observer.upgrade_finished(&run.upgrades[index]);
                        continue;
                    }

                    match upgrader.drive(store, &mut run, index, &self.interrupt) {
                        Ok(DriveOutcome::Settled) => {
                            self.observer.upgrade_finished(&run.upgrades[index]);
                        }
                        Ok(DriveOutcome::Interrupted) => {
                            return Ok(RunOutcome::Paused {
                                run,
                                reason: PauseReason::Interrupted,
                            });
                        }
                        Err(err @ UpgradeError::RollbackFailure { .. }) => {
                            halt_pending(&mut run, 0, "halted: rollback failure requires manual intervention")?;
                            self.finish(store, run)?;
                            return Err(err);
                        }
                        Err(err) => return Err(err),
                    }
                }
            }

            if run.phase_has_failures(phase) {
                let reason = format!("halted: phase {phase_name} had failures");
                halt_pending(&mut run, phase + 1, &reason)?;
                break;
            }
            if phase + 1 >= run.phases.len() {
                break;
            }
            run.current_phase = phase + 1;
            persist(store, &mut run)?;
        }

        self.finish(store, run).map(RunOutcome::Finished)
    }

    fn finish(&self, store: &StateStore, mut run: UpgradeRun) -> Result<UpgradeRun, UpgradeError> {
        let now = current_unix_timestamp()?;
        let failed = run.count_with_status(ComponentStatus::Failed) > 0;
        run.status = match (run.kind, failed) {
            (_, true) => RunStatus::Failed,
            (RunKind::Upgrade, false) => RunStatus::Completed,
            (RunKind::Restore, false) => RunStatus::RolledBack,
        };
        run.finished_at_unix = Some(now);
        run.updated_at_unix = now;
        store.update(&run)?;
        store.archive(&run)?;
        tracing::info!(
            run = %run.id,
            status = run.status.as_str(),
            completed = run.count_with_status(ComponentStatus::Completed),
            skipped = run.count_with_status(ComponentStatus::Skipped),
            failed = run.count_with_status(ComponentStatus::Failed),
            "run finished"
        );
        Ok(run)
    }

    fn new_upgrade_run(&self, request: &RunRequest) -> Result<UpgradeRun, UpgradeError> {
        let selected = select_components(self.config, &request.filter)?;
        let installed = self.installed_versions(&selected);
        let plan = plan_upgrades(self.config, &installed, &request.filter)?;

        let now = current_unix_timestamp()?;
        let id = new_run_id(now);
        let mut run = UpgradeRun::new(&id, RunKind::Upgrade, request.mode, now);
        run.status = RunStatus::InProgress;
        run.filter = request.filter.clone();

        for (phase_index, phase) in plan.phases.iter().enumerate() {
            run.phases.push(phase.name.clone());
            let base = run.upgrades.len();
            for step in &phase.steps {
                let mut entry = ComponentUpgrade::new(
                    format!("{id}-{}", run.upgrades.len() + 1),
                    &step.component,
                    phase_index,
                    step.from.as_ref().map(ToString::to_string),
                    step.to.to_string(),
                );
                entry.step = step.step_label();
                entry.after = step
                    .after
                    .map(|offset| run.upgrades[base + offset].id.clone());
                run.upgrades.push(entry);
            }
        }
        Ok(run)
    }

    fn new_restore_run(&self, target: &UpgradeRun) -> Result<UpgradeRun, UpgradeError> {
        let now = current_unix_timestamp()?;
        let id = new_run_id(now);
        let mut run = UpgradeRun::new(&id, RunKind::Restore, UpgradeMode::Standard, now);
        run.status = RunStatus::InProgress;
        run.restores_run = Some(target.id.clone());
        run.phases = vec![RESTORE_PHASE.to_string()];

        for upgrade in target
            .upgrades
            .iter()
            .rev()
            .filter(|upgrade| upgrade.status == ComponentStatus::Completed)
        {
            let record = upgrade
                .backup_id
                .as_deref()
                .and_then(|backup_id| target.backup(backup_id))
                .ok_or_else(|| {
                    anyhow!(
                        "upgrade {} in run {} has no backup to restore",
                        upgrade.id,
                        target.id
                    )
                })?;
            self.backups.verify(record)?;

            let mut entry = ComponentUpgrade::new(
                format!("{id}-{}", run.upgrades.len() + 1),
                &upgrade.component,
                0,
                Some(upgrade.to_version.clone()),
                upgrade.from_version.clone().unwrap_or_default(),
            );
            entry.backup_id = Some(record.id.clone());
            entry.rollback_available = true;
            if run.backup(&record.id).is_none() {
                run.backups.push(record.clone());
            }
            run.upgrades.push(entry);
        }

        if run.upgrades.is_empty() {
            return Err(anyhow!("run {} has no completed upgrades to roll back", target.id).into());
        }
        Ok(run)
    }

    /// Version query failures are left out of the map: the Validating gate asks
    /// again and fails that component on its own.
    fn installed_versions(
        &self,
        components: &[&ComponentSpec],
    ) -> BTreeMap<String, InstalledVersion> {
        let resolver = VersionResolver::new(self.capabilities.reporter);
        let mut versions = BTreeMap::new();
        for component in components {
            match resolver.installed(component) {
                Ok(installed) => {
                    versions.insert(component.name.clone(), installed);
                }
                Err(err) => {
                    tracing::warn!(component = %component.name, error = %err, "version query failed during planning");
                }
            }
        }
        versions
    }

    fn component(&self, name: &str) -> Result<&'a ComponentSpec, UpgradeError> {
        self.config
            .component(name)
            .ok_or_else(|| anyhow!("component '{name}' is not configured").into())
    }

    fn upgrader(&self) -> ComponentUpgrader<'_> {
        ComponentUpgrader::new(
            self.config,
            self.capabilities.host,
            self.capabilities.reporter,
            self.capabilities.probe,
            &self.backups,
            self.observer,
        )
    }

    fn lock_timeout(&self) -> Duration {
        self.config.defaults.lock_timeout()
    }
}

fn new_run_id(now: u64) -> String {
    let sequence = RUN_SEQUENCE.fetch_add(1, Ordering::Relaxed);
    format!("run-{now}-{}-{sequence}", std::process::id())
}

fn persist(store: &StateStore, run: &mut UpgradeRun) -> Result<(), UpgradeError> {
    run.updated_at_unix = current_unix_timestamp()?;
    store.update(run)
}

/// The `after` entry of `index`, when it has not finished successfully.
fn blocking_dependency(run: &UpgradeRun, index: usize) -> Option<String> {
    let upgrade = &run.upgrades[index];
    if upgrade.stage != UpgradeStage::Pending {
        return None;
    }
    let after = upgrade.after.as_deref()?;
    match run.upgrade(after) {
        Some(dependency) if dependency.unblocks_dependents() => None,
        Some(dependency) => Some(format!("{} ({})", dependency.id, dependency.component)),
        None => Some(after.to_string()),
    }
}

/// Skips every still-pending entry from `from_phase` on.
fn halt_pending(run: &mut UpgradeRun, from_phase: usize, reason: &str) -> Result<(), UpgradeError> {
    let now = current_unix_timestamp()?;
    for upgrade in run
        .upgrades
        .iter_mut()
        .filter(|upgrade| upgrade.phase >= from_phase && upgrade.stage == UpgradeStage::Pending)
    {
        upgrade.mark_skipped(reason, now)?;
    }
    Ok(())
}
