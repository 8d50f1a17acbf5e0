mod config;
mod error;
mod run;

pub use config::{
    ComponentRole, ComponentSpec, IncompatibleBoundary, ProbeSettings, StackConfig,
    StackDefaults, VersionSource,
};
pub use error::{ErrorKind, UpgradeError};
pub use run::{
    BackupRecord, Checkpoint, ComponentStatus, ComponentUpgrade, RunError, RunFilter, RunKind,
    RunStatus, UpgradeMode, UpgradeRun, UpgradeStage, STATE_SCHEMA_VERSION,
};

#[cfg(test)]
mod tests;
