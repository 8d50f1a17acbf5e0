use anyhow::anyhow;
use semver::Version;
use stackup_core::{
    Checkpoint, ComponentSpec, RunKind, StackConfig, UpgradeError, UpgradeMode, UpgradeRun,
    UpgradeStage,
};
use stackup_resolver::{
    split_at_boundaries, unmet_dependencies, InstalledVersion, VersionReporter, VersionResolver,
};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::backup::BackupManager;
use crate::fs_utils::current_unix_timestamp;
use crate::health::{HealthProber, HealthVerdict, ReadinessProbe};
use crate::host::HostOps;
use crate::observer::RunObserver;
use crate::state_store::StateStore;

/// What the Validating gate decided for one component.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Gate {
    Proceed { installed: Version },
    Skip(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriveOutcome {
    /// The entry reached a terminal stage.
    Settled,
    /// The interrupt flag was raised between two transitions.
    Interrupted,
}

/// Drives a single `ComponentUpgrade` through its stage machine, persisting every
/// transition before the next step runs.
pub struct ComponentUpgrader<'a> {
    config: &'a StackConfig,
    host: &'a dyn HostOps,
    resolver: VersionResolver<'a>,
    prober: HealthProber<'a>,
    backups: &'a BackupManager,
    observer: &'a dyn RunObserver,
}

impl<'a> ComponentUpgrader<'a> {
    pub fn new(
        config: &'a StackConfig,
        host: &'a dyn HostOps,
        reporter: &'a dyn VersionReporter,
        probe: &'a dyn ReadinessProbe,
        backups: &'a BackupManager,
        observer: &'a dyn RunObserver,
    ) -> Self {
        Self {
            config,
            host,
            resolver: VersionResolver::new(reporter),
            prober: HealthProber::new(probe),
            backups,
            observer,
        }
    }

    pub fn drive(
        &self,
        store: &StateStore,
        run: &mut UpgradeRun,
        index: usize,
        interrupt: &AtomicBool,
    ) -> Result<DriveOutcome, UpgradeError> {
        let component = self.component_for(run, index)?;

        loop {
            let stage = run.upgrades[index].stage;
            if stage.is_terminal() {
                return Ok(DriveOutcome::Settled);
            }
            if interrupt.load(Ordering::SeqCst) {
                tracing::warn!(
                    upgrade = %run.upgrades[index].id,
                    stage = stage.as_str(),
                    "interrupt requested; pausing between transitions"
                );
                return Ok(DriveOutcome::Interrupted);
            }

            match stage {
                UpgradeStage::Pending => {
                    let next = if run.kind == RunKind::Restore {
                        UpgradeStage::RollingBack
                    } else {
                        UpgradeStage::Validating
                    };
                    self.transition(store, run, index, next)?;
                }
                UpgradeStage::Validating => self.run_validating(store, run, index, component)?,
                UpgradeStage::BackingUp => self.run_backing_up(store, run, index, component)?,
                UpgradeStage::Installing => self.run_installing(store, run, index, component)?,
                UpgradeStage::Starting => self.run_starting(store, run, index, component)?,
                UpgradeStage::HealthChecking => {
                    self.run_health_checking(store, run, index, component)?
                }
                UpgradeStage::RollingBack => self.run_rolling_back(store, run, index, component)?,
                UpgradeStage::Completed | UpgradeStage::Failed => {
                    return Ok(DriveOutcome::Settled);
                }
            }
        }
    }

    /// The read-only Validating gate. Never touches the host.
    pub fn evaluate_gate(
        &self,
        component: &ComponentSpec,
        target: &Version,
        mode: UpgradeMode,
    ) -> Result<Gate, UpgradeError> {
        let name = component.name.as_str();
        let installed = self.resolver.installed(component)?;
        let Some(current) = installed.version().cloned() else {
            return Ok(Gate::Skip("not installed".to_string()));
        };
        if &current == target {
            return Ok(Gate::Skip(format!("already at {target}")));
        }
        if &current > target {
            return Err(UpgradeError::validation(
                name,
                format!(
                    "installed {current} is newer than target {target}; downgrades are not supported"
                ),
            ));
        }
        if split_at_boundaries(Some(&current), target, component).len() > 1 {
            return Err(UpgradeError::validation(
                name,
                format!("{current} -> {target} crosses an incompatible boundary; plan the run again"),
            ));
        }

        let needed = self
            .backups
            .estimated_size(component)
            .map_err(|err| UpgradeError::validation(name, format!("{err:#}")))?
            .saturating_add(self.config.defaults.min_free_disk_bytes());
        let backup_root = self.backups.root();
        let free = self
            .host
            .free_disk_bytes(&backup_root)
            .map_err(|err| UpgradeError::validation(name, format!("{err:#}")))?;
        if free < needed {
            return Err(UpgradeError::validation(
                name,
                format!(
                    "insufficient disk space at {}: {free} bytes free, {needed} required",
                    backup_root.display()
                ),
            ));
        }

        self.host
            .check_artifact(component, target)
            .map_err(|err| UpgradeError::validation(name, format!("{err:#}")))?;

        if mode.runs_corroboration_checks() {
            let unmet = unmet_dependencies(component, &self.dependency_versions(component)?);
            if !unmet.is_empty() {
                return Err(UpgradeError::validation(
                    name,
                    format!("unmet dependencies: {}", unmet.join(", ")),
                ));
            }

            let verdict = if mode == UpgradeMode::DryRun {
                self.prober.observe(component)
            } else {
                self.prober
                    .check(component, component.probe_settings(&self.config.defaults))
            };
            if !verdict.healthy {
                return Err(UpgradeError::validation(
                    name,
                    format!(
                        "running {current} is not ready before upgrade: {}",
                        verdict.signal_detail()
                    ),
                ));
            }
        }

        Ok(Gate::Proceed { installed: current })
    }

    fn component_for(&self, run: &UpgradeRun, index: usize) -> Result<&'a ComponentSpec, UpgradeError> {
        let name = &run.upgrades[index].component;
        self.config.component(name).ok_or_else(|| {
            UpgradeError::Other(anyhow!(
                "component '{name}' from run {} is no longer configured",
                run.id
            ))
        })
    }

    fn dependency_versions(
        &self,
        component: &ComponentSpec,
    ) -> Result<BTreeMap<String, InstalledVersion>, UpgradeError> {
        let mut versions = BTreeMap::new();
        for dependency in component.depends_on.keys() {
            if let Some(spec) = self.config.component(dependency) {
                versions.insert(dependency.clone(), self.resolver.installed(spec)?);
            }
        }
        Ok(versions)
    }

    fn run_validating(
        &self,
        store: &StateStore,
        run: &mut UpgradeRun,
        index: usize,
        component: &ComponentSpec,
    ) -> Result<(), UpgradeError> {
        let target = match target_version(run, index) {
            Ok(target) => target,
            Err(err) => return self.fail(store, run, index, err),
        };
        match self.evaluate_gate(component, &target, run.mode) {
            Ok(Gate::Proceed { installed }) => {
                run.upgrades[index].from_version = Some(installed.to_string());
                self.transition(store, run, index, UpgradeStage::BackingUp)
            }
            Ok(Gate::Skip(reason)) => {
                tracing::info!(
                    component = %component.name,
                    reason = %reason,
                    "skipping component"
                );
                let now = current_unix_timestamp()?;
                run.upgrades[index].mark_skipped(reason, now)?;
                self.settle(store, run, index)
            }
            Err(err) if !err.is_escalation() => self.fail(store, run, index, err),
            Err(err) => Err(err),
        }
    }

    fn run_backing_up(
        &self,
        store: &StateStore,
        run: &mut UpgradeRun,
        index: usize,
        component: &ComponentSpec,
    ) -> Result<(), UpgradeError> {
        let now = current_unix_timestamp()?;
        let upgrade_id = run.upgrades[index].id.clone();
        match self.backups.create(component, &upgrade_id, now) {
            Ok(record) => {
                let upgrade = &mut run.upgrades[index];
                upgrade.backup_id = Some(record.id.clone());
                upgrade.rollback_available = true;
                run.checkpoints.push(Checkpoint {
                    upgrade_id,
                    backup_id: record.id.clone(),
                    stage: UpgradeStage::BackingUp,
                    recorded_at_unix: now,
                });
                run.backups.push(record);
                self.transition(store, run, index, UpgradeStage::Installing)
            }
            Err(err) => self.fail(store, run, index, err),
        }
    }

    fn run_installing(
        &self,
        store: &StateStore,
        run: &mut UpgradeRun,
        index: usize,
        component: &ComponentSpec,
    ) -> Result<(), UpgradeError> {
        let target = target_version(run, index)?;
        self.count_attempt(store, run, index)?;
        let result = self
            .host
            .stop_service(component)
            .and_then(|()| self.host.install_version(component, &target));
        match result {
            Ok(outcome) => {
                run.upgrades[index].checksum = Some(outcome.checksum);
                self.transition(store, run, index, UpgradeStage::Starting)
            }
            Err(err) => self.retry_or_roll_back(store, run, index, component, "install", err),
        }
    }

    fn run_starting(
        &self,
        store: &StateStore,
        run: &mut UpgradeRun,
        index: usize,
        component: &ComponentSpec,
    ) -> Result<(), UpgradeError> {
        self.count_attempt(store, run, index)?;
        match self.host.start_service(component) {
            Ok(()) => self.transition(store, run, index, UpgradeStage::HealthChecking),
            Err(err) => self.retry_or_roll_back(store, run, index, component, "start", err),
        }
    }

    fn run_health_checking(
        &self,
        store: &StateStore,
        run: &mut UpgradeRun,
        index: usize,
        component: &ComponentSpec,
    ) -> Result<(), UpgradeError> {
        let verdict = self
            .prober
            .check(component, component.probe_settings(&self.config.defaults));
        let upgrade = &mut run.upgrades[index];
        upgrade.health_check_passed = Some(verdict.healthy);
        upgrade.health_signal = Some(verdict.signal_detail());

        if verdict.healthy {
            return self.transition(store, run, index, UpgradeStage::Completed);
        }

        let err = UpgradeError::HealthCheck {
            component: component.name.clone(),
            signal: verdict.signal_detail(),
        };
        tracing::warn!(
            component = %component.name,
            polls = verdict.polls,
            signal = %verdict.signal_detail(),
            "health check failed; rolling back"
        );
        let now = current_unix_timestamp()?;
        let upgrade_id = run.upgrades[index].id.clone();
        run.record_error(&err, Some(&upgrade_id), now);
        run.upgrades[index].reason = Some(err.to_string());
        self.transition(store, run, index, UpgradeStage::RollingBack)
    }

    fn run_rolling_back(
        &self,
        store: &StateStore,
        run: &mut UpgradeRun,
        index: usize,
        component: &ComponentSpec,
    ) -> Result<(), UpgradeError> {
        let kind = run.kind;
        let outcome = self.roll_back(run, index, component);
        let now = current_unix_timestamp()?;

        match outcome {
            Ok(verdict) => {
                let upgrade = &mut run.upgrades[index];
                if kind == RunKind::Restore {
                    upgrade.health_check_passed = Some(true);
                    upgrade.health_signal = Some(verdict.signal_detail());
                    upgrade.reason = Some(format!("restored {}", upgrade.to_version));
                    upgrade.mark_rolled_back(now)?;
                } else {
                    let restored_to = upgrade.from_version.clone().unwrap_or_default();
                    let cause = upgrade
                        .reason
                        .take()
                        .unwrap_or_else(|| "upgrade failed".to_string());
                    upgrade.mark_failed(format!("{cause}; rolled back to {restored_to}"), now)?;
                }
                tracing::info!(component = %component.name, "rollback succeeded");
                self.settle(store, run, index)
            }
            Err(err) => {
                tracing::error!(component = %component.name, error = %err, "rollback failed");
                let upgrade_id = run.upgrades[index].id.clone();
                run.record_error(&err, Some(&upgrade_id), now);
                run.upgrades[index].mark_failed(err.to_string(), now)?;
                self.settle(store, run, index)?;
                Err(err)
            }
        }
    }

    /// Stop, restore, restart, re-probe. Any failure is a `RollbackFailure`.
    fn roll_back(
        &self,
        run: &UpgradeRun,
        index: usize,
        component: &ComponentSpec,
    ) -> Result<HealthVerdict, UpgradeError> {
        let name = component.name.as_str();
        let record = run.upgrades[index]
            .backup_id
            .as_deref()
            .and_then(|backup_id| run.backup(backup_id))
            .ok_or_else(|| UpgradeError::rollback(name, "no backup recorded for this upgrade"))?;

        self.host
            .stop_service(component)
            .map_err(|err| UpgradeError::rollback(name, format!("stop failed: {err:#}")))?;
        self.backups
            .restore(record)
            .map_err(|err| UpgradeError::rollback(name, err.to_string()))?;
        self.host
            .start_service(component)
            .map_err(|err| UpgradeError::rollback(name, format!("restart failed: {err:#}")))?;

        let verdict = self
            .prober
            .check(component, component.probe_settings(&self.config.defaults));
        if !verdict.healthy {
            return Err(UpgradeError::rollback(
                name,
                format!(
                    "restored version did not become ready: {}",
                    verdict.signal_detail()
                ),
            ));
        }
        Ok(verdict)
    }

    fn retry_or_roll_back(
        &self,
        store: &StateStore,
        run: &mut UpgradeRun,
        index: usize,
        component: &ComponentSpec,
        step: &str,
        cause: anyhow::Error,
    ) -> Result<(), UpgradeError> {
        let err = UpgradeError::TransientExecution {
            component: component.name.clone(),
            step: step.to_string(),
            reason: format!("{cause:#}"),
        };
        let now = current_unix_timestamp()?;
        let upgrade_id = run.upgrades[index].id.clone();
        run.record_error(&err, Some(&upgrade_id), now);

        let attempts = run.upgrades[index].attempts;
        let max_attempts = component.max_attempts(&self.config.defaults);
        if attempts >= max_attempts {
            tracing::warn!(
                component = %component.name,
                step,
                attempts,
                "retry budget exhausted; rolling back"
            );
            run.upgrades[index].reason = Some(format!("{err} (after {attempts} attempt(s))"));
            return self.transition(store, run, index, UpgradeStage::RollingBack);
        }

        tracing::warn!(
            component = %component.name,
            step,
            attempt = attempts,
            max_attempts,
            error = %err,
            "transient failure; retrying"
        );
        self.persist(store, run)
    }

    fn count_attempt(
        &self,
        store: &StateStore,
        run: &mut UpgradeRun,
        index: usize,
    ) -> Result<(), UpgradeError> {
        run.upgrades[index].attempts += 1;
        self.persist(store, run)
    }

    fn fail(
        &self,
        store: &StateStore,
        run: &mut UpgradeRun,
        index: usize,
        err: UpgradeError,
    ) -> Result<(), UpgradeError> {
        tracing::warn!(upgrade = %run.upgrades[index].id, error = %err, "component failed");
        let now = current_unix_timestamp()?;
        let upgrade_id = run.upgrades[index].id.clone();
        run.record_error(&err, Some(&upgrade_id), now);
        run.upgrades[index].mark_failed(err.to_string(), now)?;
        self.settle(store, run, index)
    }

    fn transition(
        &self,
        store: &StateStore,
        run: &mut UpgradeRun,
        index: usize,
        next: UpgradeStage,
    ) -> Result<(), UpgradeError> {
        let now = current_unix_timestamp()?;
        let upgrade = &mut run.upgrades[index];
        upgrade.enter(next, now)?;
        upgrade.attempts = 0;
        tracing::info!(
            upgrade = %upgrade.id,
            component = %upgrade.component,
            stage = next.as_str(),
            "stage entered"
        );
        self.persist(store, run)?;
        self.observer.stage_changed(&run.upgrades[index]);
        Ok(())
    }

    /// Persists an entry that just reached a terminal stage.
    fn settle(
        &self,
        store: &StateStore,
        run: &mut UpgradeRun,
        index: usize,
    ) -> Result<(), UpgradeError> {
        self.persist(store, run)?;
        self.observer.stage_changed(&run.upgrades[index]);
        Ok(())
    }

    fn persist(&self, store: &StateStore, run: &mut UpgradeRun) -> Result<(), UpgradeError> {
        run.updated_at_unix = current_unix_timestamp()?;
        store.update(run)
    }
}

fn target_version(run: &UpgradeRun, index: usize) -> Result<Version, UpgradeError> {
    let upgrade = &run.upgrades[index];
    Version::parse(&upgrade.to_version).map_err(|err| {
        UpgradeError::validation(
            &upgrade.component,
            format!("invalid target version {:?}: {err}", upgrade.to_version),
        )
    })
}
