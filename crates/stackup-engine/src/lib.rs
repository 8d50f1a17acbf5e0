mod backup;
mod fs_utils;
mod health;
mod host;
mod layout;
mod lock;
mod observer;
mod orchestrator;
mod probe;
mod state_store;
mod upgrader;

pub use backup::BackupManager;
pub use fs_utils::current_unix_timestamp;
pub use health::{HealthProber, HealthVerdict, ProbeSignal, ReadinessProbe};
pub use host::{HostOps, InstallOutcome, SystemHost, SystemVersionReporter};
pub use layout::{
    default_config_path, default_state_root, HostLayout, DEFAULT_CONFIG_PATH, DEFAULT_STATE_ROOT,
};
pub use lock::{LockMode, StateLock};
pub use observer::{AutoApprove, NoopObserver, PhaseGate, RunObserver};
pub use orchestrator::{
    Capabilities, DryRunEntry, DryRunReport, GateDecision, Orchestrator, PauseReason, RunOutcome,
    RunRequest, StatusReport,
};
pub use probe::HttpReadinessProbe;
pub use state_store::StateStore;
pub use upgrader::{ComponentUpgrader, DriveOutcome, Gate};
