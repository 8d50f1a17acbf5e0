use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};

pub const DEFAULT_STATE_ROOT: &str = "/var/lib/stackup";
pub const DEFAULT_CONFIG_PATH: &str = "/etc/stackup/stackup.toml";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostLayout {
    root: PathBuf,
}

impl HostLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn state_dir(&self) -> PathBuf {
        self.root.join("state")
    }

    pub fn run_state_path(&self) -> PathBuf {
        self.state_dir().join("run.json")
    }

    pub fn history_path(&self) -> PathBuf {
        self.state_dir().join("history.jsonl")
    }

    pub fn lock_path(&self) -> PathBuf {
        self.state_dir().join("stackup.lock")
    }

    pub fn tmp_dir(&self) -> PathBuf {
        self.state_dir().join("tmp")
    }

    pub fn backups_dir(&self) -> PathBuf {
        self.root.join("backups")
    }

    pub fn component_backups_dir(&self, component: &str) -> PathBuf {
        self.backups_dir().join(component)
    }

    pub fn backup_dir(&self, component: &str, backup_id: &str) -> PathBuf {
        self.component_backups_dir(component).join(backup_id)
    }

    pub fn ensure_base_dirs(&self) -> Result<()> {
        for dir in [self.state_dir(), self.tmp_dir(), self.backups_dir()] {
            fs::create_dir_all(&dir)
                .with_context(|| format!("failed to create {}", dir.display()))?;
        }
        Ok(())
    }
}

pub fn default_state_root() -> PathBuf {
    std::env::var_os("STACKUP_ROOT")
        .filter(|value| !value.is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_STATE_ROOT))
}

pub fn default_config_path() -> PathBuf {
    std::env::var_os("STACKUP_CONFIG")
        .filter(|value| !value.is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH))
}
