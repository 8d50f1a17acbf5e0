use std::collections::BTreeMap;

use stackup_core::ComponentSpec;

use crate::InstalledVersion;

/// Declared dependency requirements the currently installed stack does not meet.
pub fn unmet_dependencies(
    component: &ComponentSpec,
    installed: &BTreeMap<String, InstalledVersion>,
) -> Vec<String> {
    let mut unmet = Vec::new();
    for (dependency, requirement) in &component.depends_on {
        match installed.get(dependency).and_then(InstalledVersion::version) {
            Some(version) if requirement.matches(version) => {}
            Some(version) => unmet.push(format!(
                "{dependency} {requirement} (installed {version})"
            )),
            None => unmet.push(format!("{dependency} {requirement} (not installed)")),
        }
    }
    unmet
}
