use anyhow::{anyhow, Context, Result};
use nix::unistd::geteuid;
use serde::{Deserialize, Serialize};
use stackup_core::{BackupRecord, ComponentSpec, UpgradeError};
use stackup_security::{sha256_file, sha256_hex, verify_sha256_file};
use std::collections::HashSet;
use std::fs;
use std::io;
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};

use crate::fs_utils::{copy_file_atomic, remove_path_if_exists, write_atomic};
use crate::layout::HostLayout;

const MANIFEST_FILE: &str = "manifest.json";
const PAYLOAD_DIR: &str = "payload";
const MANIFEST_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum BackupEntry {
    File {
        original: PathBuf,
        stored: String,
        mode: u32,
        uid: u32,
        gid: u32,
        sha256: String,
    },
    Directory {
        original: PathBuf,
        /// Set on directories named in the component config; restore prunes
        /// anything below them that the backup does not know about.
        root: bool,
        mode: u32,
        uid: u32,
        gid: u32,
    },
    Symlink {
        original: PathBuf,
        target: PathBuf,
    },
    /// The path did not exist when the backup was taken.
    Absent {
        original: PathBuf,
    },
}

impl BackupEntry {
    fn original(&self) -> &Path {
        match self {
            Self::File { original, .. }
            | Self::Directory { original, .. }
            | Self::Symlink { original, .. }
            | Self::Absent { original } => original,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct BackupManifest {
    version: u32,
    component: String,
    upgrade_id: String,
    created_at_unix: u64,
    checksum: String,
    entries: Vec<BackupEntry>,
}

/// Content-addressed snapshots of a component's binary, configuration and
/// service unit, stored under `<root>/backups/<component>/<backup-id>/`.
#[derive(Debug, Clone)]
pub struct BackupManager {
    layout: HostLayout,
}

impl BackupManager {
    pub fn new(layout: HostLayout) -> Self {
        Self { layout }
    }

    pub fn create(
        &self,
        component: &ComponentSpec,
        upgrade_id: &str,
        now: u64,
    ) -> Result<BackupRecord, UpgradeError> {
        self.capture(component, upgrade_id, now)
            .map_err(|err| UpgradeError::backup(&component.name, format!("{err:#}")))
    }

    pub fn root(&self) -> PathBuf {
        self.layout.backups_dir()
    }

    /// Bytes a backup of `component` would occupy right now.
    pub fn estimated_size(&self, component: &ComponentSpec) -> Result<u64> {
        let mut total = 0u64;
        for source in backup_sources(component) {
            total = total.saturating_add(path_size(&source)?);
        }
        Ok(total)
    }

    /// Re-hashes every stored file and the manifest itself against the record.
    pub fn verify(&self, record: &BackupRecord) -> Result<(), UpgradeError> {
        self.verified_manifest(record)
            .map(|_| ())
            .map_err(|err| UpgradeError::backup(&record.component, format!("{err:#}")))
    }

    /// Puts every captured path back exactly as recorded. Integrity is checked in
    /// full before the first host path is touched.
    pub fn restore(&self, record: &BackupRecord) -> Result<(), UpgradeError> {
        let manifest = self
            .verified_manifest(record)
            .map_err(|err| UpgradeError::backup(&record.component, format!("{err:#}")))?;
        apply_manifest(&manifest, Path::new(&record.path)).map_err(|err| {
            UpgradeError::backup(&record.component, format!("restore failed: {err:#}"))
        })?;
        tracing::info!(
            component = %record.component,
            backup = %record.id,
            "backup restored"
        );
        Ok(())
    }

    fn capture(
        &self,
        component: &ComponentSpec,
        upgrade_id: &str,
        now: u64,
    ) -> Result<BackupRecord> {
        let component_dir = self.layout.component_backups_dir(&component.name);
        let staging = component_dir.join(format!(".staging-{upgrade_id}-{}", std::process::id()));
        remove_path_if_exists(&staging)?;
        fs::create_dir_all(staging.join(PAYLOAD_DIR))
            .with_context(|| format!("failed to create backup staging: {}", staging.display()))?;

        let mut entries = Vec::new();
        for source in backup_sources(component) {
            capture_path(&source, true, &staging, &mut entries)?;
        }
        let checksum = entries_checksum(&entries)?;
        let id = format!("{}-{now}-{}", component.name, &checksum[..12]);

        let manifest = BackupManifest {
            version: MANIFEST_VERSION,
            component: component.name.clone(),
            upgrade_id: upgrade_id.to_string(),
            created_at_unix: now,
            checksum: checksum.clone(),
            entries,
        };
        let payload =
            serde_json::to_vec_pretty(&manifest).context("failed to serialize backup manifest")?;
        write_atomic(&staging.join(MANIFEST_FILE), &payload, 0o600)?;

        let final_dir = self.layout.backup_dir(&component.name, &id);
        if final_dir.exists() {
            // Identical content captured within the same second.
            remove_path_if_exists(&staging)?;
        } else {
            fs::rename(&staging, &final_dir).with_context(|| {
                format!(
                    "failed to finalize backup {} -> {}",
                    staging.display(),
                    final_dir.display()
                )
            })?;
        }

        tracing::info!(
            component = %component.name,
            backup = %id,
            entries = manifest.entries.len(),
            "backup created"
        );
        Ok(BackupRecord {
            id,
            upgrade_id: upgrade_id.to_string(),
            component: component.name.clone(),
            path: final_dir.display().to_string(),
            checksum,
            created_at_unix: now,
        })
    }

    fn verified_manifest(&self, record: &BackupRecord) -> Result<BackupManifest> {
        let backup_dir = Path::new(&record.path);
        let manifest_path = backup_dir.join(MANIFEST_FILE);
        let raw = match fs::read(&manifest_path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return Err(anyhow!(
                    "backup {} is missing its manifest: {}",
                    record.id,
                    manifest_path.display()
                ));
            }
            Err(err) => {
                return Err(err).with_context(|| {
                    format!("failed to read backup manifest: {}", manifest_path.display())
                });
            }
        };
        let manifest: BackupManifest = serde_json::from_slice(&raw).with_context(|| {
            format!("corrupted backup manifest: {}", manifest_path.display())
        })?;

        if manifest.version != MANIFEST_VERSION {
            return Err(anyhow!(
                "backup {} has unsupported manifest version {}",
                record.id,
                manifest.version
            ));
        }
        if !manifest.checksum.eq_ignore_ascii_case(&record.checksum) {
            return Err(anyhow!(
                "backup {} checksum mismatch: recorded {}, manifest {}",
                record.id,
                record.checksum,
                manifest.checksum
            ));
        }
        let actual = entries_checksum(&manifest.entries)?;
        if actual != manifest.checksum {
            return Err(anyhow!(
                "backup {} manifest was altered (expected {}, computed {actual})",
                record.id,
                manifest.checksum
            ));
        }

        for entry in &manifest.entries {
            if let BackupEntry::File { stored, sha256, .. } = entry {
                let stored_path = backup_dir.join(stored);
                if !stored_path.is_file() {
                    return Err(anyhow!(
                        "backup {} is missing stored file {}",
                        record.id,
                        stored_path.display()
                    ));
                }
                if !verify_sha256_file(&stored_path, sha256)? {
                    return Err(anyhow!(
                        "backup {} stored file {} is corrupted",
                        record.id,
                        stored_path.display()
                    ));
                }
            }
        }
        Ok(manifest)
    }
}

fn backup_sources(component: &ComponentSpec) -> Vec<PathBuf> {
    let mut sources = vec![component.binary_path.clone()];
    sources.extend(component.config_paths.iter().cloned());
    sources.extend(component.service_unit_path.iter().cloned());
    let mut seen = HashSet::new();
    sources.retain(|path| seen.insert(path.clone()));
    sources
}

fn path_size(path: &Path) -> Result<u64> {
    let metadata = match fs::symlink_metadata(path) {
        Ok(metadata) => metadata,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(0),
        Err(err) => return Err(err).with_context(|| format!("failed to stat {}", path.display())),
    };
    if !metadata.is_dir() {
        return Ok(metadata.len());
    }
    let mut total = 0u64;
    for entry in
        fs::read_dir(path).with_context(|| format!("failed to read directory: {}", path.display()))?
    {
        let entry =
            entry.with_context(|| format!("failed to iterate directory: {}", path.display()))?;
        total = total.saturating_add(path_size(&entry.path())?);
    }
    Ok(total)
}

fn capture_path(
    original: &Path,
    root: bool,
    staging: &Path,
    entries: &mut Vec<BackupEntry>,
) -> Result<()> {
    let metadata = match fs::symlink_metadata(original) {
        Ok(metadata) => metadata,
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            if root {
                entries.push(BackupEntry::Absent {
                    original: original.to_path_buf(),
                });
            }
            return Ok(());
        }
        Err(err) => {
            return Err(err).with_context(|| format!("failed to stat {}", original.display()));
        }
    };

    if metadata.file_type().is_symlink() {
        let target = fs::read_link(original)
            .with_context(|| format!("failed to read symlink: {}", original.display()))?;
        entries.push(BackupEntry::Symlink {
            original: original.to_path_buf(),
            target,
        });
        return Ok(());
    }

    if metadata.is_dir() {
        entries.push(BackupEntry::Directory {
            original: original.to_path_buf(),
            root,
            mode: metadata.mode() & 0o7777,
            uid: metadata.uid(),
            gid: metadata.gid(),
        });
        let mut children = fs::read_dir(original)
            .with_context(|| format!("failed to read directory: {}", original.display()))?
            .map(|entry| entry.map(|entry| entry.path()))
            .collect::<io::Result<Vec<_>>>()
            .with_context(|| format!("failed to iterate directory: {}", original.display()))?;
        children.sort();
        for child in children {
            capture_path(&child, false, staging, entries)?;
        }
        return Ok(());
    }

    let stored = format!("{PAYLOAD_DIR}/{:05}", entries.len());
    let stored_path = staging.join(&stored);
    fs::copy(original, &stored_path).with_context(|| {
        format!(
            "failed to copy {} into backup {}",
            original.display(),
            stored_path.display()
        )
    })?;
    entries.push(BackupEntry::File {
        original: original.to_path_buf(),
        sha256: sha256_file(&stored_path)?,
        stored,
        mode: metadata.mode() & 0o7777,
        uid: metadata.uid(),
        gid: metadata.gid(),
    });
    Ok(())
}

fn entries_checksum(entries: &[BackupEntry]) -> Result<String> {
    let canonical = serde_json::to_vec(entries).context("failed to serialize backup entries")?;
    Ok(sha256_hex(&canonical))
}

fn apply_manifest(manifest: &BackupManifest, backup_dir: &Path) -> Result<()> {
    let recorded = manifest
        .entries
        .iter()
        .map(BackupEntry::original)
        .collect::<HashSet<_>>();
    let restore_owner = running_as_root();
    let mut directories = Vec::new();

    for entry in &manifest.entries {
        match entry {
            BackupEntry::Absent { original } => remove_path_if_exists(original)?,
            BackupEntry::Directory {
                original,
                root,
                mode,
                uid,
                gid,
            } => {
                if fs::symlink_metadata(original).is_ok_and(|metadata| !metadata.is_dir()) {
                    remove_path_if_exists(original)?;
                }
                fs::create_dir_all(original)
                    .with_context(|| format!("failed to create {}", original.display()))?;
                if *root {
                    prune_unrecorded(original, &recorded)?;
                }
                directories.push((original, *mode, *uid, *gid));
            }
            BackupEntry::File {
                original,
                stored,
                mode,
                uid,
                gid,
                ..
            } => {
                copy_file_atomic(&backup_dir.join(stored), original, *mode)?;
                if restore_owner {
                    restore_ownership(original, *uid, *gid)?;
                }
            }
            BackupEntry::Symlink { original, target } => {
                remove_path_if_exists(original)?;
                if let Some(parent) = original.parent() {
                    fs::create_dir_all(parent)
                        .with_context(|| format!("failed to create {}", parent.display()))?;
                }
                std::os::unix::fs::symlink(target, original).with_context(|| {
                    format!(
                        "failed to restore symlink {} -> {}",
                        original.display(),
                        target.display()
                    )
                })?;
            }
        }
    }

    // Deepest first, so a read-only parent never blocks its children.
    for (path, mode, uid, gid) in directories.into_iter().rev() {
        fs::set_permissions(path, fs::Permissions::from_mode(mode))
            .with_context(|| format!("failed to set mode on {}", path.display()))?;
        if restore_owner {
            restore_ownership(path, uid, gid)?;
        }
    }
    Ok(())
}

fn prune_unrecorded(dir: &Path, recorded: &HashSet<&Path>) -> Result<()> {
    for entry in
        fs::read_dir(dir).with_context(|| format!("failed to read directory: {}", dir.display()))?
    {
        let path = entry
            .with_context(|| format!("failed to iterate directory: {}", dir.display()))?
            .path();
        if !recorded.contains(path.as_path()) {
            tracing::debug!(path = %path.display(), "removing path added after backup");
            remove_path_if_exists(&path)?;
        } else if fs::symlink_metadata(&path).is_ok_and(|metadata| metadata.is_dir()) {
            prune_unrecorded(&path, recorded)?;
        }
    }
    Ok(())
}

fn running_as_root() -> bool {
    geteuid().is_root()
}

fn restore_ownership(path: &Path, uid: u32, gid: u32) -> Result<()> {
    std::os::unix::fs::chown(path, Some(uid), Some(gid))
        .with_context(|| format!("failed to restore ownership of {}", path.display()))
}
