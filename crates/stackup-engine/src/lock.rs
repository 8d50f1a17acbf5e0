use anyhow::Context;
use nix::errno::Errno;
use nix::fcntl::{Flock, FlockArg};
use stackup_core::UpgradeError;
use std::fmt;
use std::fs;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    /// Held by read-only callers (`plan`, `status`, `history`).
    Shared,
    /// Held by any caller that mutates state or the host.
    Exclusive,
}

/// Advisory `flock(2)` on the state lock file, released on drop.
pub struct StateLock {
    file: Flock<fs::File>,
    path: PathBuf,
    mode: LockMode,
}

impl fmt::Debug for StateLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateLock")
            .field("path", &self.path)
            .field("mode", &self.mode)
            .finish_non_exhaustive()
    }
}

impl StateLock {
    pub fn acquire(path: &Path, mode: LockMode, timeout: Duration) -> Result<Self, UpgradeError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let mut file = fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .mode(0o600)
            .open(path)
            .with_context(|| format!("failed to open lock file: {}", path.display()))?;
        let operation = match mode {
            LockMode::Shared => FlockArg::LockSharedNonblock,
            LockMode::Exclusive => FlockArg::LockExclusiveNonblock,
        };

        let deadline = Instant::now() + timeout;
        let locked = loop {
            match Flock::lock(file, operation) {
                Ok(locked) => break locked,
                Err((unlocked, Errno::EWOULDBLOCK | Errno::EINTR)) => file = unlocked,
                Err((_, errno)) => {
                    return Err(io::Error::from(errno))
                        .with_context(|| format!("failed to lock {}", path.display()))
                        .map_err(UpgradeError::from);
                }
            }
            let now = Instant::now();
            if now >= deadline {
                let holder = holder_pid(path)
                    .map(|pid| format!(" (held by pid {pid})"))
                    .unwrap_or_default();
                return Err(UpgradeError::AlreadyRunning {
                    path: path.display().to_string(),
                    waited_secs: timeout.as_secs(),
                    holder,
                });
            }
            thread::sleep(LOCK_POLL_INTERVAL.min(deadline - now));
        };

        let mut lock = Self {
            file: locked,
            path: path.to_path_buf(),
            mode,
        };
        if mode == LockMode::Exclusive {
            lock.record_holder()
                .with_context(|| format!("failed to record lock holder: {}", path.display()))?;
        }
        tracing::debug!(path = %path.display(), ?mode, "state lock acquired");
        Ok(lock)
    }

    pub fn mode(&self) -> LockMode {
        self.mode
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn record_holder(&mut self) -> io::Result<()> {
        let file: &mut fs::File = &mut self.file;
        file.set_len(0)?;
        file.seek(SeekFrom::Start(0))?;
        writeln!(file, "{}", std::process::id())?;
        file.flush()
    }
}

/// Pid recorded by the last exclusive holder of the lock at `path`.
pub(crate) fn holder_pid(path: &Path) -> Option<u32> {
    let mut raw = String::new();
    fs::File::open(path).ok()?.read_to_string(&mut raw).ok()?;
    raw.trim().parse().ok()
}
