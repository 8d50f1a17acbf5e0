use anyhow::Result;
use stackup_core::{ComponentUpgrade, UpgradeRun};

/// Progress hooks; every method defaults to doing nothing.
pub trait RunObserver {
    fn phase_started(&self, _run: &UpgradeRun, _phase: usize) {}

    fn stage_changed(&self, _upgrade: &ComponentUpgrade) {}

    fn upgrade_finished(&self, _upgrade: &ComponentUpgrade) {}
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl RunObserver for NoopObserver {}

/// Asked before every phase after the first in `safe` mode. Returning `false`
/// pauses the run.
pub trait PhaseGate {
    fn confirm(&self, run: &UpgradeRun, phase: usize) -> Result<bool>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct AutoApprove;

impl PhaseGate for AutoApprove {
    fn confirm(&self, _run: &UpgradeRun, _phase: usize) -> Result<bool> {
        Ok(true)
    }
}
