use std::collections::HashSet;

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};

use crate::error::{ErrorKind, UpgradeError};

pub const STATE_SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    RolledBack,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::RolledBack => "rolled_back",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::RolledBack)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum UpgradeMode {
    Safe,
    Standard,
    Fast,
    DryRun,
}

impl UpgradeMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Safe => "safe",
            Self::Standard => "standard",
            Self::Fast => "fast",
            Self::DryRun => "dry-run",
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "safe" => Ok(Self::Safe),
            "standard" => Ok(Self::Standard),
            "fast" => Ok(Self::Fast),
            "dry-run" | "dry_run" | "dryrun" => Ok(Self::DryRun),
            _ => Err(anyhow!("invalid upgrade mode: {value}")),
        }
    }

    /// Dependency and pre-upgrade readiness checks; the backup step is not optional.
    pub fn runs_corroboration_checks(&self) -> bool {
        !matches!(self, Self::Fast)
    }

    pub fn confirms_between_phases(&self) -> bool {
        matches!(self, Self::Safe)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunKind {
    Upgrade,
    Restore,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComponentStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    RolledBack,
    Skipped,
}

impl ComponentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::RolledBack => "rolled_back",
            Self::Skipped => "skipped",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending | Self::InProgress)
    }
}

/// Per-component state machine position. The stage names the step currently
/// being executed, so a resumed run re-executes exactly that step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpgradeStage {
    Pending,
    Validating,
    BackingUp,
    Installing,
    Starting,
    HealthChecking,
    RollingBack,
    Completed,
    Failed,
}

impl UpgradeStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Validating => "validating",
            Self::BackingUp => "backing_up",
            Self::Installing => "installing",
            Self::Starting => "starting",
            Self::HealthChecking => "health_checking",
            Self::RollingBack => "rolling_back",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    pub fn mutates_host(&self) -> bool {
        matches!(
            self,
            Self::Installing | Self::Starting | Self::HealthChecking | Self::RollingBack
        )
    }

    pub fn can_transition_to(&self, next: UpgradeStage) -> bool {
        use UpgradeStage::*;
        matches!(
            (self, next),
            (Pending, Validating)
                | (Pending, RollingBack)
                | (Pending, Completed)
                | (Validating, BackingUp)
                | (Validating, Completed)
                | (Validating, Failed)
                | (BackingUp, Installing)
                | (BackingUp, Failed)
                | (Installing, Starting)
                | (Installing, RollingBack)
                | (Starting, HealthChecking)
                | (Starting, RollingBack)
                | (HealthChecking, Completed)
                | (HealthChecking, RollingBack)
                | (RollingBack, Completed)
                | (RollingBack, Failed)
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComponentUpgrade {
    pub id: String,
    pub component: String,
    pub phase: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step: Option<String>,
    pub from_version: Option<String>,
    pub to_version: String,
    pub status: ComponentStatus,
    pub stage: UpgradeStage,
    pub attempts: u32,
    pub backup_id: Option<String>,
    pub rollback_available: bool,
    pub health_check_passed: Option<bool>,
    pub health_signal: Option<String>,
    pub checksum: Option<String>,
    /// Entry that must finish successfully before this one may start.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub after: Option<String>,
    pub reason: Option<String>,
    pub started_at_unix: Option<u64>,
    pub finished_at_unix: Option<u64>,
}

impl ComponentUpgrade {
    pub fn new(
        id: impl Into<String>,
        component: impl Into<String>,
        phase: usize,
        from_version: Option<String>,
        to_version: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            component: component.into(),
            phase,
            step: None,
            from_version,
            to_version: to_version.into(),
            status: ComponentStatus::Pending,
            stage: UpgradeStage::Pending,
            attempts: 0,
            backup_id: None,
            rollback_available: false,
            health_check_passed: None,
            health_signal: None,
            checksum: None,
            after: None,
            reason: None,
            started_at_unix: None,
            finished_at_unix: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.stage.is_terminal()
    }

    /// Whether entries declared `after` this one may proceed.
    pub fn unblocks_dependents(&self) -> bool {
        matches!(
            self.status,
            ComponentStatus::Completed | ComponentStatus::Skipped
        )
    }

    pub fn enter(&mut self, next: UpgradeStage, now: u64) -> Result<()> {
        if !self.stage.can_transition_to(next) {
            return Err(anyhow!(
                "illegal transition for {} ({}): {} -> {}",
                self.id,
                self.component,
                self.stage.as_str(),
                next.as_str()
            ));
        }

        self.stage = next;
        match next {
            UpgradeStage::Pending => self.status = ComponentStatus::Pending,
            UpgradeStage::Completed => {
                self.status = ComponentStatus::Completed;
                self.finished_at_unix = Some(now);
            }
            UpgradeStage::Failed => {
                self.status = ComponentStatus::Failed;
                self.finished_at_unix = Some(now);
            }
            // Nothing on the host has changed yet and no restore point may exist.
            UpgradeStage::Validating | UpgradeStage::BackingUp => {
                self.status = ComponentStatus::Pending;
                self.started_at_unix.get_or_insert(now);
            }
            _ => {
                self.status = ComponentStatus::InProgress;
                self.started_at_unix.get_or_insert(now);
            }
        }
        Ok(())
    }

    pub fn mark_skipped(&mut self, reason: impl Into<String>, now: u64) -> Result<()> {
        self.enter(UpgradeStage::Completed, now)?;
        self.status = ComponentStatus::Skipped;
        self.reason = Some(reason.into());
        Ok(())
    }

    pub fn mark_rolled_back(&mut self, now: u64) -> Result<()> {
        self.enter(UpgradeStage::Completed, now)?;
        self.status = ComponentStatus::RolledBack;
        Ok(())
    }

    pub fn mark_failed(&mut self, reason: impl Into<String>, now: u64) -> Result<()> {
        self.enter(UpgradeStage::Failed, now)?;
        self.reason = Some(reason.into());
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupRecord {
    pub id: String,
    pub upgrade_id: String,
    pub component: String,
    pub path: String,
    pub checksum: String,
    pub created_at_unix: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub upgrade_id: String,
    pub backup_id: String,
    pub stage: UpgradeStage,
    pub recorded_at_unix: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunError {
    pub at_unix: u64,
    pub kind: ErrorKind,
    pub component: Option<String>,
    pub upgrade_id: Option<String>,
    pub message: String,
}

impl RunError {
    pub fn from_error(err: &UpgradeError, upgrade_id: Option<&str>, at_unix: u64) -> Self {
        Self {
            at_unix,
            kind: err.kind(),
            component: err.component().map(ToOwned::to_owned),
            upgrade_id: upgrade_id.map(ToOwned::to_owned),
            message: format!("{err:#}"),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunFilter {
    #[serde(default)]
    pub phase: Option<String>,
    #[serde(default)]
    pub components: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpgradeRun {
    pub id: String,
    pub kind: RunKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restores_run: Option<String>,
    pub status: RunStatus,
    pub mode: UpgradeMode,
    pub created_at_unix: u64,
    pub updated_at_unix: u64,
    pub finished_at_unix: Option<u64>,
    pub current_phase: usize,
    pub phases: Vec<String>,
    #[serde(default)]
    pub filter: RunFilter,
    pub upgrades: Vec<ComponentUpgrade>,
    #[serde(default)]
    pub errors: Vec<RunError>,
    #[serde(default)]
    pub checkpoints: Vec<Checkpoint>,
    #[serde(default)]
    pub backups: Vec<BackupRecord>,
}

impl UpgradeRun {
    pub fn new(id: impl Into<String>, kind: RunKind, mode: UpgradeMode, now: u64) -> Self {
        Self {
            id: id.into(),
            kind,
            restores_run: None,
            status: RunStatus::Pending,
            mode,
            created_at_unix: now,
            updated_at_unix: now,
            finished_at_unix: None,
            current_phase: 0,
            phases: Vec::new(),
            filter: RunFilter::default(),
            upgrades: Vec::new(),
            errors: Vec::new(),
            checkpoints: Vec::new(),
            backups: Vec::new(),
        }
    }

    pub fn upgrade(&self, id: &str) -> Option<&ComponentUpgrade> {
        self.upgrades.iter().find(|upgrade| upgrade.id == id)
    }

    pub fn backup(&self, id: &str) -> Option<&BackupRecord> {
        self.backups.iter().find(|backup| backup.id == id)
    }

    pub fn phase_indices(&self, phase: usize) -> Vec<usize> {
        self.upgrades
            .iter()
            .enumerate()
            .filter(|(_, upgrade)| upgrade.phase == phase)
            .map(|(index, _)| index)
            .collect()
    }

    pub fn phase_is_terminal(&self, phase: usize) -> bool {
        self.upgrades
            .iter()
            .filter(|upgrade| upgrade.phase == phase)
            .all(ComponentUpgrade::is_terminal)
    }

    pub fn phase_has_failures(&self, phase: usize) -> bool {
        self.upgrades
            .iter()
            .any(|upgrade| upgrade.phase == phase && upgrade.status == ComponentStatus::Failed)
    }

    /// First entry a resumed run should continue with.
    pub fn first_non_terminal(&self) -> Option<&ComponentUpgrade> {
        self.upgrades.iter().find(|upgrade| !upgrade.is_terminal())
    }

    pub fn record_error(&mut self, err: &UpgradeError, upgrade_id: Option<&str>, now: u64) {
        self.errors.push(RunError::from_error(err, upgrade_id, now));
    }

    pub fn count_with_status(&self, status: ComponentStatus) -> usize {
        self.upgrades
            .iter()
            .filter(|upgrade| upgrade.status == status)
            .count()
    }

    /// Semantic checks applied on load; a failure means the file cannot be trusted
    /// for resume.
    pub fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(anyhow!("run id is empty"));
        }

        let mut ids = HashSet::new();
        for upgrade in &self.upgrades {
            if !ids.insert(upgrade.id.as_str()) {
                return Err(anyhow!("duplicate upgrade id '{}'", upgrade.id));
            }
            if upgrade.phase >= self.phases.len() {
                return Err(anyhow!(
                    "upgrade '{}' references phase {} but the run has {} phase(s)",
                    upgrade.id,
                    upgrade.phase,
                    self.phases.len()
                ));
            }
            if upgrade.stage.is_terminal() != upgrade.status.is_terminal() {
                return Err(anyhow!(
                    "upgrade '{}' has inconsistent stage {} and status {}",
                    upgrade.id,
                    upgrade.stage.as_str(),
                    upgrade.status.as_str()
                ));
            }
            if let Some(after) = &upgrade.after {
                if !ids.contains(after.as_str()) {
                    return Err(anyhow!(
                        "upgrade '{}' must follow unknown or later entry '{after}'",
                        upgrade.id
                    ));
                }
            }
            if let Some(backup_id) = &upgrade.backup_id {
                if self.backup(backup_id).is_none() {
                    return Err(anyhow!(
                        "upgrade '{}' references unknown backup '{backup_id}'",
                        upgrade.id
                    ));
                }
            }
            if (upgrade.stage.mutates_host() || upgrade.status == ComponentStatus::InProgress)
                && upgrade.backup_id.is_none()
            {
                return Err(anyhow!(
                    "upgrade '{}' is {} without a backup",
                    upgrade.id,
                    upgrade.stage.as_str()
                ));
            }
        }

        for checkpoint in &self.checkpoints {
            if !ids.contains(checkpoint.upgrade_id.as_str()) {
                return Err(anyhow!(
                    "checkpoint references unknown upgrade '{}'",
                    checkpoint.upgrade_id
                ));
            }
            if self.backup(&checkpoint.backup_id).is_none() {
                return Err(anyhow!(
                    "checkpoint references unknown backup '{}'",
                    checkpoint.backup_id
                ));
            }
        }
        for backup in &self.backups {
            if !ids.contains(backup.upgrade_id.as_str()) && self.kind == RunKind::Upgrade {
                return Err(anyhow!(
                    "backup '{}' is owned by unknown upgrade '{}'",
                    backup.id,
                    backup.upgrade_id
                ));
            }
        }

        if !self.phases.is_empty() && self.current_phase >= self.phases.len() {
            return Err(anyhow!(
                "current phase {} is out of range ({} phase(s))",
                self.current_phase,
                self.phases.len()
            ));
        }
        if self.status.is_terminal() {
            if let Some(open) = self.first_non_terminal() {
                return Err(anyhow!(
                    "run is {} but upgrade '{}' is still {}",
                    self.status.as_str(),
                    open.id,
                    open.stage.as_str()
                ));
            }
        }

        Ok(())
    }
}
