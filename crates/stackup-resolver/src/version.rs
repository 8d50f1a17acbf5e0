use semver::Version;
use stackup_core::{ComponentSpec, UpgradeError};

/// Raw answer from a component's own version-reporting surface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VersionReport {
    NotInstalled,
    Reported(String),
}

pub trait VersionReporter {
    fn report(&self, component: &ComponentSpec) -> anyhow::Result<VersionReport>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstalledVersion {
    NotInstalled,
    Installed(Version),
}

impl InstalledVersion {
    pub fn version(&self) -> Option<&Version> {
        match self {
            Self::NotInstalled => None,
            Self::Installed(version) => Some(version),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedVersions {
    pub component: String,
    pub installed: InstalledVersion,
    pub target: Version,
}

impl ResolvedVersions {
    pub fn at_target(&self) -> bool {
        self.installed.version() == Some(&self.target)
    }
}

pub struct VersionResolver<'a> {
    reporter: &'a dyn VersionReporter,
}

impl<'a> VersionResolver<'a> {
    pub fn new(reporter: &'a dyn VersionReporter) -> Self {
        Self { reporter }
    }

    pub fn resolve(&self, component: &ComponentSpec) -> Result<ResolvedVersions, UpgradeError> {
        Ok(ResolvedVersions {
            component: component.name.clone(),
            installed: self.installed(component)?,
            target: component.target_version.clone(),
        })
    }

    /// Always asks the component; nothing is cached between calls.
    pub fn installed(&self, component: &ComponentSpec) -> Result<InstalledVersion, UpgradeError> {
        let report = self.reporter.report(component).map_err(|err| {
            UpgradeError::validation(
                &component.name,
                format!("version query failed: {err:#}"),
            )
        })?;

        match report {
            VersionReport::NotInstalled => {
                tracing::debug!(component = %component.name, "component not installed");
                Ok(InstalledVersion::NotInstalled)
            }
            VersionReport::Reported(raw) => parse_reported_version(&raw)
                .inspect(|version| {
                    tracing::debug!(component = %component.name, %version, "installed version resolved");
                })
                .map(InstalledVersion::Installed)
                .ok_or_else(|| {
                    UpgradeError::validation(
                        &component.name,
                        format!("unparsable version string: {:?}", raw.trim()),
                    )
                }),
        }
    }
}

/// Finds the first version-looking token in a component's version output, e.g.
/// `prometheus, version 2.45.0 (branch: HEAD)` or `v11.1`.
pub fn parse_reported_version(raw: &str) -> Option<Version> {
    raw.split(|ch: char| ch.is_whitespace() || matches!(ch, ',' | '(' | ')' | '"' | ';'))
        .filter(|token| !token.is_empty())
        .find_map(parse_version_token)
}

fn parse_version_token(token: &str) -> Option<Version> {
    let token = token
        .strip_prefix('v')
        .or_else(|| token.strip_prefix('V'))
        .unwrap_or(token)
        .trim_end_matches(['.', ':']);
    if !token.starts_with(|ch: char| ch.is_ascii_digit()) {
        return None;
    }
    if let Ok(version) = Version::parse(token) {
        return Some(version);
    }

    let parts = token.split('.').collect::<Vec<_>>();
    if parts.len() == 2
        && parts
            .iter()
            .all(|part| !part.is_empty() && part.chars().all(|ch| ch.is_ascii_digit()))
    {
        return Version::parse(&format!("{token}.0")).ok();
    }
    None
}
