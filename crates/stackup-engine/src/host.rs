use anyhow::{anyhow, Context, Result};
use reqwest::blocking::Client;
use semver::Version;
use stackup_core::{ComponentSpec, VersionSource};
use stackup_resolver::{VersionReport, VersionReporter};
use stackup_security::{sha256_file, verify_sha256_file};
use nix::sys::statvfs::statvfs;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use crate::fs_utils::{copy_file_atomic, copy_tree};
use crate::probe::{build_http_client, fetch_reported_version};

const CONFIG_OVERLAY_DIR: &str = "config";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallOutcome {
    /// sha256 of the binary now in place.
    pub checksum: String,
}

/// Everything the upgrader does to the host outside of its own state and backup
/// directories.
pub trait HostOps {
    /// Read-only check that the staged release for `version` exists and matches
    /// its declared checksum.
    fn check_artifact(&self, component: &ComponentSpec, version: &Version) -> Result<()>;
    fn stop_service(&self, component: &ComponentSpec) -> Result<()>;
    fn start_service(&self, component: &ComponentSpec) -> Result<()>;
    /// Replaces binary and configuration with the staged release. The service is
    /// expected to be stopped.
    fn install_version(&self, component: &ComponentSpec, version: &Version)
        -> Result<InstallOutcome>;
    fn free_disk_bytes(&self, path: &Path) -> Result<u64>;
}

#[derive(Debug, Clone)]
struct StagedArtifact {
    binary: PathBuf,
    config_overlay: Option<PathBuf>,
    service_unit: Option<PathBuf>,
}

fn locate_artifact(component: &ComponentSpec, version: &Version) -> Result<StagedArtifact> {
    let dir = component.artifact_dir_for(version).ok_or_else(|| {
        anyhow!(
            "component '{}' declares no artifact_dir to install from",
            component.name
        )
    })?;
    if !dir.is_dir() {
        return Err(anyhow!(
            "staged release for {} {version} not found: {}",
            component.name,
            dir.display()
        ));
    }

    let binary_name = component
        .binary_path
        .file_name()
        .ok_or_else(|| anyhow!("binary path has no file name: {}", component.binary_path.display()))?;
    let binary = [dir.join(binary_name), dir.join("bin").join(binary_name)]
        .into_iter()
        .find(|candidate| candidate.is_file())
        .ok_or_else(|| {
            anyhow!(
                "staged release {} does not contain binary '{}'",
                dir.display(),
                binary_name.to_string_lossy()
            )
        })?;

    let config_overlay = Some(dir.join(CONFIG_OVERLAY_DIR)).filter(|path| path.is_dir());
    let service_unit = component
        .service_unit_path
        .as_ref()
        .and_then(|unit| unit.file_name())
        .map(|unit_name| dir.join(unit_name))
        .filter(|path| path.is_file());

    Ok(StagedArtifact {
        binary,
        config_overlay,
        service_unit,
    })
}

fn verify_artifact_checksum(
    component: &ComponentSpec,
    version: &Version,
    artifact: &StagedArtifact,
) -> Result<()> {
    let Some(expected) = component.expected_checksum(version) else {
        return Ok(());
    };
    if !verify_sha256_file(&artifact.binary, expected)? {
        return Err(anyhow!(
            "artifact checksum mismatch for {} {version}: {}",
            component.name,
            artifact.binary.display()
        ));
    }
    Ok(())
}

/// systemd-managed host.
#[derive(Debug, Clone)]
pub struct SystemHost {
    systemctl: PathBuf,
}

impl Default for SystemHost {
    fn default() -> Self {
        Self {
            systemctl: PathBuf::from("systemctl"),
        }
    }
}

impl SystemHost {
    pub fn new() -> Self {
        Self::default()
    }

    fn systemctl(&self, args: &[&str]) -> Command {
        let mut command = Command::new(&self.systemctl);
        command.args(args);
        command
    }
}

impl HostOps for SystemHost {
    fn check_artifact(&self, component: &ComponentSpec, version: &Version) -> Result<()> {
        let artifact = locate_artifact(component, version)?;
        verify_artifact_checksum(component, version, &artifact)
    }

    fn stop_service(&self, component: &ComponentSpec) -> Result<()> {
        run_command(
            &mut self.systemctl(&["stop", &component.service]),
            &format!("failed to stop {}", component.service),
        )
    }

    fn start_service(&self, component: &ComponentSpec) -> Result<()> {
        run_command(
            &mut self.systemctl(&["daemon-reload"]),
            "failed to reload systemd units",
        )?;
        run_command(
            &mut self.systemctl(&["start", &component.service]),
            &format!("failed to start {}", component.service),
        )
    }

    fn install_version(
        &self,
        component: &ComponentSpec,
        version: &Version,
    ) -> Result<InstallOutcome> {
        let artifact = locate_artifact(component, version)?;
        verify_artifact_checksum(component, version, &artifact)?;

        copy_file_atomic(&artifact.binary, &component.binary_path, 0o755)?;
        if let (Some(overlay), Some(config_root)) =
            (&artifact.config_overlay, component.config_paths.first())
        {
            copy_tree(overlay, config_root)?;
        }
        if let (Some(unit), Some(unit_path)) = (&artifact.service_unit, &component.service_unit_path)
        {
            copy_file_atomic(unit, unit_path, 0o644)?;
        }

        Ok(InstallOutcome {
            checksum: sha256_file(&component.binary_path)?,
        })
    }

    fn free_disk_bytes(&self, path: &Path) -> Result<u64> {
        let existing = path
            .ancestors()
            .find(|candidate| candidate.exists())
            .unwrap_or_else(|| Path::new("/"));
        let stats = statvfs(existing)
            .with_context(|| format!("failed to stat filesystem of {}", existing.display()))?;
        #[allow(clippy::unnecessary_cast)]
        Ok((stats.blocks_available() as u64).saturating_mul(stats.fragment_size() as u64))
    }
}

/// Asks the running component for its version through its configured source.
pub struct SystemVersionReporter {
    client: Client,
}

impl SystemVersionReporter {
    pub fn new(request_timeout: Duration) -> Result<Self> {
        Ok(Self {
            client: build_http_client(request_timeout)?,
        })
    }
}

impl VersionReporter for SystemVersionReporter {
    fn report(&self, component: &ComponentSpec) -> Result<VersionReport> {
        if !component.binary_path.exists() {
            return Ok(VersionReport::NotInstalled);
        }

        match component.version_source() {
            VersionSource::Command(argv) => {
                let (program, args) = argv
                    .split_first()
                    .ok_or_else(|| anyhow!("empty version command for {}", component.name))?;
                let output = match Command::new(program).args(args).output() {
                    Ok(output) => output,
                    Err(err) if err.kind() == io::ErrorKind::NotFound => {
                        return Ok(VersionReport::NotInstalled);
                    }
                    Err(err) => {
                        return Err(err)
                            .with_context(|| format!("failed to run version command: {program}"));
                    }
                };
                if !output.status.success() {
                    return Err(anyhow!(
                        "version command {program} exited with {}: {}",
                        output.status,
                        String::from_utf8_lossy(&output.stderr).trim()
                    ));
                }
                // Some components print their version banner on stderr.
                let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
                text.push('\n');
                text.push_str(&String::from_utf8_lossy(&output.stderr));
                Ok(VersionReport::Reported(text))
            }
            VersionSource::Http { url, pointer } => {
                Ok(fetch_reported_version(&self.client, &url, pointer.as_deref())?
                    .map_or(VersionReport::NotInstalled, VersionReport::Reported))
            }
        }
    }
}

pub(crate) fn run_command(command: &mut Command, context_message: &str) -> Result<()> {
    let output = command
        .output()
        .with_context(|| format!("{context_message}: command failed to start"))?;
    if output.status.success() {
        return Ok(());
    }

    let stderr = String::from_utf8_lossy(&output.stderr);
    let stdout = String::from_utf8_lossy(&output.stdout);
    Err(anyhow!(
        "{context_message}: status={} stdout='{}' stderr='{}'",
        output.status,
        stdout.trim(),
        stderr.trim()
    ))
}
