use anyhow::{anyhow, Context};
use serde::{Deserialize, Serialize};
use stackup_core::{UpgradeError, UpgradeRun, STATE_SCHEMA_VERSION};
use std::fs;
use std::io::{self, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::time::Duration;

use crate::fs_utils::{remove_file_if_exists, write_atomic};
use crate::layout::HostLayout;
use crate::lock::{holder_pid, LockMode, StateLock};

const STATE_FILE_MODE: u32 = 0o600;

#[derive(Debug, Deserialize)]
struct StateFile {
    schema_version: u32,
    run: UpgradeRun,
}

#[derive(Debug, Serialize)]
struct StateFileRef<'a> {
    schema_version: u32,
    run: &'a UpgradeRun,
}

/// Durable home of the single active run. Writers hold the state lock
/// exclusively; readers hold it shared, or go without it while a run owns it.
#[derive(Debug)]
pub struct StateStore {
    layout: HostLayout,
    mode: LockMode,
    lock: Option<StateLock>,
}

impl StateStore {
    pub fn open(
        layout: &HostLayout,
        mode: LockMode,
        lock_timeout: Duration,
    ) -> Result<Self, UpgradeError> {
        let lock_path = layout.lock_path();
        if mode == LockMode::Shared && !lock_path.exists() {
            // Nothing has ever run here; reading must not create the state root.
            return Ok(Self::unlocked(layout));
        }
        if mode == LockMode::Exclusive {
            layout.ensure_base_dirs()?;
        }
        let lock = StateLock::acquire(&lock_path, mode, lock_timeout)?;
        Ok(Self {
            layout: layout.clone(),
            mode,
            lock: Some(lock),
        })
    }

    pub fn open_exclusive(
        layout: &HostLayout,
        lock_timeout: Duration,
    ) -> Result<Self, UpgradeError> {
        Self::open(layout, LockMode::Exclusive, lock_timeout)
    }

    pub fn open_shared(layout: &HostLayout, lock_timeout: Duration) -> Result<Self, UpgradeError> {
        Self::open(layout, LockMode::Shared, lock_timeout)
    }

    /// Read-only view that never waits: takes the shared lock if it is free,
    /// otherwise reads without it. The state file is only ever replaced by
    /// rename, so an unlocked reader sees either the previous or the next
    /// version of it.
    pub fn open_reader(layout: &HostLayout) -> Result<Self, UpgradeError> {
        match Self::open_shared(layout, Duration::ZERO) {
            Err(UpgradeError::AlreadyRunning { .. }) => {
                tracing::debug!(
                    lock = %layout.lock_path().display(),
                    "state lock held by a run; reading without it"
                );
                Ok(Self::unlocked(layout))
            }
            other => other,
        }
    }

    fn unlocked(layout: &HostLayout) -> Self {
        Self {
            layout: layout.clone(),
            mode: LockMode::Shared,
            lock: None,
        }
    }

    pub fn layout(&self) -> &HostLayout {
        &self.layout
    }

    pub fn lock_mode(&self) -> LockMode {
        self.mode
    }

    /// Pid of the run holding the state lock, when this reader could not take it.
    pub fn lock_holder(&self) -> Option<u32> {
        if self.lock.is_some() {
            return None;
        }
        holder_pid(&self.layout.lock_path())
    }

    /// Reads the active run. A file that cannot be parsed or fails semantic
    /// validation is reported as corruption and never guessed at.
    pub fn load(&self) -> Result<Option<UpgradeRun>, UpgradeError> {
        let path = self.layout.run_state_path();
        let raw = match fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                return Err(UpgradeError::corruption(
                    path.display().to_string(),
                    format!("unreadable: {err}"),
                ))
            }
        };

        let state: StateFile = serde_json::from_str(&raw).map_err(|err| {
            UpgradeError::corruption(path.display().to_string(), format!("unparsable: {err}"))
        })?;
        if state.schema_version != STATE_SCHEMA_VERSION {
            return Err(UpgradeError::corruption(
                path.display().to_string(),
                format!(
                    "unsupported schema version {} (expected {STATE_SCHEMA_VERSION})",
                    state.schema_version
                ),
            ));
        }
        state.run.validate().map_err(|err| {
            UpgradeError::corruption(path.display().to_string(), format!("{err:#}"))
        })?;
        Ok(Some(state.run))
    }

    /// Persists a brand-new run. Refuses while another run is still in flight; a
    /// finished run left behind by an interrupted archive is archived first.
    pub fn create(&self, run: &UpgradeRun) -> Result<(), UpgradeError> {
        self.require_exclusive()?;
        if let Some(existing) = self.load()? {
            if !existing.status.is_terminal() {
                return Err(anyhow!(
                    "run {} is still {}; resume or roll it back first",
                    existing.id,
                    existing.status.as_str()
                )
                .into());
            }
            self.archive(&existing)?;
        }
        self.write(run)
    }

    pub fn update(&self, run: &UpgradeRun) -> Result<(), UpgradeError> {
        self.require_exclusive()?;
        self.write(run)
    }

    /// Moves a finished run into the history log and clears the active slot.
    pub fn archive(&self, run: &UpgradeRun) -> Result<(), UpgradeError> {
        self.require_exclusive()?;
        if !run.status.is_terminal() {
            return Err(anyhow!(
                "refusing to archive run {} while it is {}",
                run.id,
                run.status.as_str()
            )
            .into());
        }

        let already_archived = self.history()?.iter().any(|archived| archived.id == run.id);
        if !already_archived {
            let path = self.layout.history_path();
            let line = serde_json::to_string(run).context("failed to serialize run for history")?;
            let mut file = fs::OpenOptions::new()
                .create(true)
                .append(true)
                .mode(STATE_FILE_MODE)
                .open(&path)
                .with_context(|| format!("failed to open history file: {}", path.display()))?;
            file.write_all(format!("{line}\n").as_bytes())
                .with_context(|| format!("failed to append history file: {}", path.display()))?;
            file.sync_all()
                .with_context(|| format!("failed to sync history file: {}", path.display()))?;
        }

        let state_path = self.layout.run_state_path();
        remove_file_if_exists(&state_path)
            .with_context(|| format!("failed to clear run state: {}", state_path.display()))?;
        tracing::info!(run = %run.id, status = run.status.as_str(), "run archived");
        Ok(())
    }

    /// Archived runs, oldest first.
    pub fn history(&self) -> Result<Vec<UpgradeRun>, UpgradeError> {
        let path = self.layout.history_path();
        let raw = match fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => {
                return Err(anyhow::Error::new(err)
                    .context(format!("failed to read history file: {}", path.display()))
                    .into())
            }
        };

        // An unlocked reader may race the append of a final line.
        let complete = match raw.rfind('\n') {
            Some(end) if self.lock.is_none() => &raw[..end],
            None if self.lock.is_none() => "",
            _ => raw.as_str(),
        };
        complete
            .lines()
            .enumerate()
            .filter(|(_, line)| !line.trim().is_empty())
            .map(|(index, line)| {
                serde_json::from_str::<UpgradeRun>(line).map_err(|err| {
                    UpgradeError::corruption(
                        path.display().to_string(),
                        format!("line {}: {err}", index + 1),
                    )
                })
            })
            .collect()
    }

    fn write(&self, run: &UpgradeRun) -> Result<(), UpgradeError> {
        run.validate()
            .with_context(|| format!("refusing to persist inconsistent run {}", run.id))?;
        let payload = serde_json::to_vec_pretty(&StateFileRef {
            schema_version: STATE_SCHEMA_VERSION,
            run,
        })
        .context("failed to serialize run state")?;
        write_atomic(&self.layout.run_state_path(), &payload, STATE_FILE_MODE)?;
        Ok(())
    }

    fn require_exclusive(&self) -> Result<(), UpgradeError> {
        if self.mode != LockMode::Exclusive {
            return Err(anyhow!(
                "state store was opened read-only ({})",
                self.layout.lock_path().display()
            )
            .into());
        }
        Ok(())
    }
}
