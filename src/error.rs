use thiserror::Error;

pub type Result<T> = std::result::Result<T, StewardError>;

/// Error taxonomy for the scheduler and update orchestrator. Callers match on
/// variants; the surrounding API layer maps them to its own outcomes. Each
/// variant carries a stable `code` used when the error is persisted on an
/// execution or update record.
#[derive(Debug, Error)]
pub enum StewardError {
    #[error("invalid cron expression: {0}")]
    InvalidExpression(String),

    #[error("{subject} already has a run in progress")]
    AlreadyRunning { subject: String },

    #[error("scheduler is not running")]
    SchedulerNotRunning,

    #[error("task {0} has a running execution; retry once it settles")]
    TaskBusy(String),

    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: String },

    #[error("invalid image reference {0:?}")]
    InvalidImageRef(String),

    #[error("registry unreachable for {image}: {reason}")]
    RegistryUnreachable { image: String, reason: String },

    #[error("pull failed for {image} after {attempts} attempts: {reason}")]
    PullFailed {
        image: String,
        attempts: u32,
        reason: String,
    },

    #[error("apply failed for {container}: {reason}")]
    ApplyFailed {
        container: String,
        reason: String,
        /// True when the previous instance was already stopped by the failed
        /// apply. Surfaced so a rollback-disabled failure is not mistaken for
        /// "old container untouched".
        old_stopped: bool,
    },

    #[error("health check for {container} did not pass within {timeout_secs}s")]
    HealthCheckTimeout {
        container: String,
        timeout_secs: u64,
    },

    #[error("rollback failed for {container}: {reason}; operator intervention required")]
    RollbackFailed { container: String, reason: String },

    #[error("container runtime unavailable: {0}")]
    RuntimeUnavailable(String),

    #[error("{entity} {id} is already terminal")]
    InvalidTransition { entity: &'static str, id: String },

    #[error("execution cancelled")]
    Cancelled,

    #[error("{0}")]
    Internal(String),

    #[error("store error: {0}")]
    Store(#[from] sqlx::Error),
}

impl StewardError {
    pub fn code(&self) -> &'static str {
        match self {
            StewardError::InvalidExpression(_) => "invalid-expression",
            StewardError::AlreadyRunning { .. } => "already-running",
            StewardError::SchedulerNotRunning => "scheduler-not-running",
            StewardError::TaskBusy(_) => "task-busy",
            StewardError::NotFound { .. } => "not-found",
            StewardError::InvalidImageRef(_) => "invalid-image",
            StewardError::RegistryUnreachable { .. } => "registry-unreachable",
            StewardError::PullFailed { .. } => "pull-failed",
            StewardError::ApplyFailed { .. } => "apply-failed",
            StewardError::HealthCheckTimeout { .. } => "health-check-timeout",
            StewardError::RollbackFailed { .. } => "rollback-failed",
            StewardError::RuntimeUnavailable(_) => "runtime-unavailable",
            StewardError::InvalidTransition { .. } => "invalid-transition",
            StewardError::Cancelled => "cancelled",
            StewardError::Internal(_) => "internal",
            StewardError::Store(_) => "store-error",
        }
    }
}
