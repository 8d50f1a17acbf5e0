mod constraints;
mod plan;
mod version;

pub use constraints::unmet_dependencies;
pub use plan::{
    parse_phase_selector, phase_for_role, plan_upgrades, select_components, split_at_boundaries,
    PlannedPhase, PlannedStep, UpgradePlan, PHASE_NAMES,
};
pub use version::{
    parse_reported_version, InstalledVersion, ResolvedVersions, VersionReport, VersionReporter,
    VersionResolver,
};

#[cfg(test)]
mod tests;
