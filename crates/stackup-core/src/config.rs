use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context};
use semver::{Version, VersionReq};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ComponentRole {
    Exporter,
    MetricsCollector,
    LogAggregator,
    LogShipper,
    AlertRouter,
    Visualization,
}

impl ComponentRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Exporter => "exporter",
            Self::MetricsCollector => "metrics-collector",
            Self::LogAggregator => "log-aggregator",
            Self::LogShipper => "log-shipper",
            Self::AlertRouter => "alert-router",
            Self::Visualization => "visualization",
        }
    }
}

/// How a component reports the version it is actually running.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VersionSource {
    /// Run a command (argv) and parse the first version-looking token of its output.
    Command(Vec<String>),
    /// GET a build-info endpoint; `pointer` is a JSON pointer to the version string.
    /// Without a pointer the response body is parsed as plain text.
    Http {
        url: String,
        #[serde(default)]
        pointer: Option<String>,
    },
}

/// A declared storage-format break: crossing `boundary` requires stopping at
/// `intermediate` first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IncompatibleBoundary {
    pub boundary: Version,
    pub intermediate: Version,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StackDefaults {
    #[serde(default = "default_health_timeout_secs")]
    pub health_timeout_secs: u64,
    #[serde(default = "default_health_interval_millis")]
    pub health_interval_millis: u64,
    #[serde(default = "default_required_consecutive_passes")]
    pub required_consecutive_passes: u32,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_min_free_disk_mb")]
    pub min_free_disk_mb: u64,
    #[serde(default = "default_lock_timeout_secs")]
    pub lock_timeout_secs: u64,
}

impl Default for StackDefaults {
    fn default() -> Self {
        Self {
            health_timeout_secs: default_health_timeout_secs(),
            health_interval_millis: default_health_interval_millis(),
            required_consecutive_passes: default_required_consecutive_passes(),
            max_attempts: default_max_attempts(),
            min_free_disk_mb: default_min_free_disk_mb(),
            lock_timeout_secs: default_lock_timeout_secs(),
        }
    }
}

impl StackDefaults {
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_secs(self.lock_timeout_secs)
    }

    pub fn min_free_disk_bytes(&self) -> u64 {
        self.min_free_disk_mb.saturating_mul(1024 * 1024)
    }
}

/// Resolved polling parameters for one component's readiness signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeSettings {
    pub interval: Duration,
    pub timeout: Duration,
    pub required_consecutive: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComponentSpec {
    pub name: String,
    pub role: ComponentRole,
    pub target_version: Version,
    pub service: String,
    pub binary_path: PathBuf,
    #[serde(default)]
    pub config_paths: Vec<PathBuf>,
    #[serde(default)]
    pub service_unit_path: Option<PathBuf>,
    /// Directory holding the staged release; `{version}` is substituted.
    #[serde(default)]
    pub artifact_dir: Option<String>,
    pub health_url: String,
    #[serde(default)]
    pub health_timeout_secs: Option<u64>,
    #[serde(default)]
    pub health_interval_millis: Option<u64>,
    #[serde(default)]
    pub max_attempts: Option<u32>,
    #[serde(default)]
    pub version_source: Option<VersionSource>,
    #[serde(default)]
    pub incompatible: Vec<IncompatibleBoundary>,
    #[serde(default)]
    pub depends_on: BTreeMap<String, VersionReq>,
    #[serde(default)]
    pub checksums: BTreeMap<String, String>,
}

impl ComponentSpec {
    pub fn probe_settings(&self, defaults: &StackDefaults) -> ProbeSettings {
        ProbeSettings {
            interval: Duration::from_millis(
                self.health_interval_millis
                    .unwrap_or(defaults.health_interval_millis),
            ),
            timeout: Duration::from_secs(
                self.health_timeout_secs
                    .unwrap_or(defaults.health_timeout_secs),
            ),
            required_consecutive: defaults.required_consecutive_passes,
        }
    }

    pub fn max_attempts(&self, defaults: &StackDefaults) -> u32 {
        self.max_attempts.unwrap_or(defaults.max_attempts).max(1)
    }

    pub fn version_source(&self) -> VersionSource {
        self.version_source.clone().unwrap_or_else(|| {
            VersionSource::Command(vec![
                self.binary_path.display().to_string(),
                "--version".to_string(),
            ])
        })
    }

    pub fn artifact_dir_for(&self, version: &Version) -> Option<PathBuf> {
        self.artifact_dir
            .as_ref()
            .map(|template| PathBuf::from(template.replace("{version}", &version.to_string())))
    }

    pub fn expected_checksum(&self, version: &Version) -> Option<&str> {
        self.checksums.get(&version.to_string()).map(String::as_str)
    }

    /// Boundaries sorted ascending, the order in which a long jump crosses them.
    pub fn sorted_boundaries(&self) -> Vec<&IncompatibleBoundary> {
        let mut boundaries = self.incompatible.iter().collect::<Vec<_>>();
        boundaries.sort_by(|a, b| a.boundary.cmp(&b.boundary));
        boundaries
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StackConfig {
    #[serde(default)]
    pub defaults: StackDefaults,
    #[serde(default)]
    pub components: Vec<ComponentSpec>,
}

impl StackConfig {
    pub fn from_toml_str(input: &str) -> anyhow::Result<Self> {
        let config: Self = toml::from_str(input).context("failed to parse stackup config")?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read stackup config: {}", path.display()))?;
        Self::from_toml_str(&raw)
            .with_context(|| format!("invalid stackup config: {}", path.display()))
    }

    pub fn component(&self, name: &str) -> Option<&ComponentSpec> {
        self.components
            .iter()
            .find(|component| component.name == name)
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.defaults.max_attempts == 0 {
            return Err(anyhow!("defaults.max_attempts must be at least 1"));
        }
        if self.defaults.health_timeout_secs == 0 {
            return Err(anyhow!("defaults.health_timeout_secs must be positive"));
        }
        if self.defaults.required_consecutive_passes < 2 {
            return Err(anyhow!(
                "defaults.required_consecutive_passes must be at least 2"
            ));
        }

        let mut seen = HashSet::new();
        for component in &self.components {
            validate_component_name(&component.name)?;
            if !seen.insert(component.name.as_str()) {
                return Err(anyhow!("duplicate component '{}'", component.name));
            }
            if component.service.trim().is_empty() {
                return Err(anyhow!(
                    "component '{}' must declare a service",
                    component.name
                ));
            }
            if component.depends_on.contains_key(&component.name) {
                return Err(anyhow!("component '{}' depends on itself", component.name));
            }
            if component.health_timeout_secs == Some(0) {
                return Err(anyhow!(
                    "component '{}' health_timeout_secs must be positive",
                    component.name
                ));
            }
            if component.max_attempts == Some(0) {
                return Err(anyhow!(
                    "component '{}' max_attempts must be at least 1",
                    component.name
                ));
            }
            for boundary in &component.incompatible {
                if boundary.intermediate >= boundary.boundary {
                    return Err(anyhow!(
                        "component '{}' intermediate {} must be below boundary {}",
                        component.name,
                        boundary.intermediate,
                        boundary.boundary
                    ));
                }
            }
            for (version, checksum) in &component.checksums {
                Version::parse(version).with_context(|| {
                    format!(
                        "component '{}' checksum key is not a version: {version}",
                        component.name
                    )
                })?;
                if checksum.len() != 64 || !checksum.chars().all(|ch| ch.is_ascii_hexdigit()) {
                    return Err(anyhow!(
                        "component '{}' checksum for {version} is not a sha256 hex digest",
                        component.name
                    ));
                }
            }
        }

        Ok(())
    }
}

fn validate_component_name(name: &str) -> anyhow::Result<()> {
    if name.trim().is_empty() {
        return Err(anyhow!("component name must not be empty"));
    }
    if !name
        .chars()
        .all(|ch| ch.is_ascii_alphanumeric() || ch == '-' || ch == '_')
    {
        return Err(anyhow!(
            "component name contains invalid character(s): {name}"
        ));
    }
    Ok(())
}

fn default_health_timeout_secs() -> u64 {
    60
}

fn default_health_interval_millis() -> u64 {
    2000
}

fn default_required_consecutive_passes() -> u32 {
    2
}

fn default_max_attempts() -> u32 {
    3
}

fn default_min_free_disk_mb() -> u64 {
    512
}

fn default_lock_timeout_secs() -> u64 {
    10
}
