use serde::{Deserialize, Serialize};

/// Error classes that drive orchestration behavior. Each one is persisted in a
/// run's error list as its [`ErrorKind`].
#[derive(Debug, thiserror::Error)]
pub enum UpgradeError {
    #[error("validation failed for {component}: {reason}")]
    Validation { component: String, reason: String },
    #[error("backup failed for {component}: {reason}")]
    Backup { component: String, reason: String },
    #[error("{step} failed for {component}: {reason}")]
    TransientExecution {
        component: String,
        step: String,
        reason: String,
    },
    #[error("health check failed for {component}: {signal}")]
    HealthCheck { component: String, signal: String },
    #[error("rollback failed for {component}: {reason} (manual intervention required)")]
    RollbackFailure { component: String, reason: String },
    #[error("state corruption in {path}: {reason} (resume refused, manual intervention required)")]
    StateCorruption { path: String, reason: String },
    #[error("another orchestration is active: lock {path} not acquired within {waited_secs}s{holder}")]
    AlreadyRunning {
        path: String,
        waited_secs: u64,
        holder: String,
    },
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl UpgradeError {
    pub fn validation(component: &str, reason: impl Into<String>) -> Self {
        Self::Validation {
            component: component.to_string(),
            reason: reason.into(),
        }
    }

    pub fn backup(component: &str, reason: impl Into<String>) -> Self {
        Self::Backup {
            component: component.to_string(),
            reason: reason.into(),
        }
    }

    pub fn rollback(component: &str, reason: impl Into<String>) -> Self {
        Self::RollbackFailure {
            component: component.to_string(),
            reason: reason.into(),
        }
    }

    pub fn corruption(path: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::StateCorruption {
            path: path.into(),
            reason: reason.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation { .. } => ErrorKind::Validation,
            Self::Backup { .. } => ErrorKind::Backup,
            Self::TransientExecution { .. } => ErrorKind::TransientExecution,
            Self::HealthCheck { .. } => ErrorKind::HealthCheck,
            Self::RollbackFailure { .. } => ErrorKind::RollbackFailure,
            Self::StateCorruption { .. } => ErrorKind::StateCorruption,
            Self::AlreadyRunning { .. } => ErrorKind::AlreadyRunning,
            Self::Other(_) => ErrorKind::Other,
        }
    }

    pub fn component(&self) -> Option<&str> {
        match self {
            Self::Validation { component, .. }
            | Self::Backup { component, .. }
            | Self::TransientExecution { component, .. }
            | Self::HealthCheck { component, .. }
            | Self::RollbackFailure { component, .. } => Some(component),
            Self::StateCorruption { .. } | Self::AlreadyRunning { .. } | Self::Other(_) => None,
        }
    }

    /// Whether the orchestrator must stop the whole run rather than the component.
    pub fn is_escalation(&self) -> bool {
        matches!(
            self,
            Self::RollbackFailure { .. } | Self::StateCorruption { .. } | Self::Other(_)
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    Backup,
    TransientExecution,
    HealthCheck,
    RollbackFailure,
    StateCorruption,
    AlreadyRunning,
    Other,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Validation => "validation",
            Self::Backup => "backup",
            Self::TransientExecution => "transient_execution",
            Self::HealthCheck => "health_check",
            Self::RollbackFailure => "rollback_failure",
            Self::StateCorruption => "state_corruption",
            Self::AlreadyRunning => "already_running",
            Self::Other => "other",
        }
    }
}
