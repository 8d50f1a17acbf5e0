use std::collections::BTreeMap;

use anyhow::{anyhow, Result};
use semver::Version;
use stackup_core::{ComponentRole, ComponentSpec, IncompatibleBoundary, RunFilter, StackConfig};

use crate::InstalledVersion;

/// Canonical phases, lowest blast radius first.
pub const PHASE_NAMES: [&str; 4] = ["exporters", "metrics", "logs", "frontends"];

pub fn phase_for_role(role: ComponentRole) -> usize {
    match role {
        ComponentRole::Exporter => 0,
        ComponentRole::MetricsCollector => 1,
        ComponentRole::LogAggregator | ComponentRole::LogShipper => 2,
        ComponentRole::AlertRouter | ComponentRole::Visualization => 3,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedStep {
    pub component: String,
    pub role: ComponentRole,
    pub from: Option<Version>,
    pub to: Version,
    /// `(n, total)` when a jump was split at incompatible boundaries.
    pub step: Option<(usize, usize)>,
    /// Index of a step in the same phase that must succeed first.
    pub after: Option<usize>,
}

impl PlannedStep {
    pub fn step_label(&self) -> Option<String> {
        self.step.map(|(n, total)| format!("{n}/{total}"))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedPhase {
    pub name: String,
    pub steps: Vec<PlannedStep>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpgradePlan {
    pub phases: Vec<PlannedPhase>,
}

impl UpgradePlan {
    pub fn step_count(&self) -> usize {
        self.phases.iter().map(|phase| phase.steps.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.step_count() == 0
    }
}

/// Components in scope for `filter`, in planning order (role, then name).
pub fn select_components<'c>(
    config: &'c StackConfig,
    filter: &RunFilter,
) -> Result<Vec<&'c ComponentSpec>> {
    let phase_filter = filter
        .phase
        .as_deref()
        .map(parse_phase_selector)
        .transpose()?;
    for name in &filter.components {
        if config.component(name).is_none() {
            return Err(anyhow!("unknown component in filter: {name}"));
        }
    }

    let mut selected = config
        .components
        .iter()
        .filter(|component| {
            filter.components.is_empty() || filter.components.contains(&component.name)
        })
        .filter(|component| {
            phase_filter
                .map(|phase| phase_for_role(component.role) == phase)
                .unwrap_or(true)
        })
        .collect::<Vec<_>>();
    selected.sort_by(|a, b| a.role.cmp(&b.role).then_with(|| a.name.cmp(&b.name)));
    Ok(selected)
}

/// Groups the configured components into risk-ordered phases. Pure: the installed
/// versions are supplied by the caller.
pub fn plan_upgrades(
    config: &StackConfig,
    installed: &BTreeMap<String, InstalledVersion>,
    filter: &RunFilter,
) -> Result<UpgradePlan> {
    let selected = select_components(config, filter)?;

    let mut plan = UpgradePlan::default();
    for (phase_index, phase_name) in PHASE_NAMES.iter().enumerate() {
        let mut steps: Vec<PlannedStep> = Vec::new();
        let mut last_aggregator_step = None;

        for component in selected
            .iter()
            .filter(|component| phase_for_role(component.role) == phase_index)
        {
            let from = installed
                .get(&component.name)
                .and_then(InstalledVersion::version)
                .cloned();
            let hops = split_at_boundaries(from.as_ref(), &component.target_version, component);
            let total = hops.len();

            for (hop_index, (hop_from, hop_to)) in hops.into_iter().enumerate() {
                let after = if hop_index > 0 {
                    Some(steps.len() - 1)
                } else if component.role == ComponentRole::LogShipper {
                    last_aggregator_step
                } else {
                    None
                };
                steps.push(PlannedStep {
                    component: component.name.clone(),
                    role: component.role,
                    from: hop_from,
                    to: hop_to,
                    step: (total > 1).then_some((hop_index + 1, total)),
                    after,
                });
            }

            if component.role == ComponentRole::LogAggregator {
                last_aggregator_step = Some(steps.len() - 1);
            }
        }

        if !steps.is_empty() {
            plan.phases.push(PlannedPhase {
                name: phase_name.to_string(),
                steps,
            });
        }
    }

    Ok(plan)
}

/// Splits `from -> to` into hops that never cross a declared incompatible
/// boundary without first stopping at its intermediate version.
pub fn split_at_boundaries(
    from: Option<&Version>,
    to: &Version,
    component: &ComponentSpec,
) -> Vec<(Option<Version>, Version)> {
    let mut hops = Vec::new();
    let mut current = from.cloned();

    for IncompatibleBoundary {
        boundary,
        intermediate,
    } in component.sorted_boundaries()
    {
        let Some(position) = current.as_ref() else {
            break;
        };
        if position < boundary && to >= boundary && position < intermediate {
            hops.push((current.clone(), intermediate.clone()));
            current = Some(intermediate.clone());
        }
    }

    hops.push((current, to.clone()));
    hops
}

/// Accepts a canonical phase name or its 1-based position.
pub fn parse_phase_selector(value: &str) -> Result<usize> {
    let trimmed = value.trim();
    if let Ok(position) = trimmed.parse::<usize>() {
        if (1..=PHASE_NAMES.len()).contains(&position) {
            return Ok(position - 1);
        }
        return Err(anyhow!(
            "phase index out of range: {position} (expected 1-{})",
            PHASE_NAMES.len()
        ));
    }

    PHASE_NAMES
        .iter()
        .position(|name| name.eq_ignore_ascii_case(trimmed))
        .ok_or_else(|| {
            anyhow!(
                "unknown phase '{trimmed}' (expected one of: {})",
                PHASE_NAMES.join(", ")
            )
        })
}
