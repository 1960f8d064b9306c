use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub fn new_id(prefix: &str) -> String {
    format!("{prefix}_{}", nanoid::nanoid!(12))
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TaskKind {
    ImageCheck,
    ContainerUpdate,
    Cleanup,
    HealthCheck,
    Backup,
}

impl TaskKind {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskKind::ImageCheck => "image-check",
            TaskKind::ContainerUpdate => "container-update",
            TaskKind::Cleanup => "cleanup",
            TaskKind::HealthCheck => "health-check",
            TaskKind::Backup => "backup",
        }
    }
}

/// Per-kind task parameters. Serialized as tagged JSON in the `params`
/// column; the `kind` column is derived from the tag for querying.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum TaskParams {
    ImageCheck {
        /// Container ids to check. Empty means every auto-policy container.
        #[serde(default)]
        containers: Vec<String>,
        #[serde(default)]
        force_refresh: bool,
    },
    ContainerUpdate {
        container: String,
        #[serde(default)]
        target: Option<String>,
        #[serde(default)]
        strategy: Option<Strategy>,
        #[serde(default)]
        force: bool,
    },
    Cleanup {
        #[serde(default)]
        retention_secs: Option<u64>,
    },
    HealthCheck {
        /// Container ids to probe. Empty means every container with a probe.
        #[serde(default)]
        containers: Vec<String>,
    },
    Backup {
        #[serde(default)]
        keep: Option<usize>,
    },
}

impl TaskParams {
    pub fn kind(&self) -> TaskKind {
        match self {
            TaskParams::ImageCheck { .. } => TaskKind::ImageCheck,
            TaskParams::ContainerUpdate { .. } => TaskKind::ContainerUpdate,
            TaskParams::Cleanup { .. } => TaskKind::Cleanup,
            TaskParams::HealthCheck { .. } => TaskKind::HealthCheck,
            TaskParams::Backup { .. } => TaskKind::Backup,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Task {
    pub id: String,
    pub name: String,
    pub schedule: String,
    pub params: TaskParams,
    pub enabled: bool,
    pub next_run: Option<DateTime<Utc>>,
    pub last_run: Option<DateTime<Utc>>,
    pub created_by: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Task {
    pub fn kind(&self) -> TaskKind {
        self.params.kind()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExecutionStatus {
    Pending,
    Running,
    Success,
    Failed,
    Cancelled,
}

impl ExecutionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ExecutionStatus::Pending => "pending",
            ExecutionStatus::Running => "running",
            ExecutionStatus::Success => "success",
            ExecutionStatus::Failed => "failed",
            ExecutionStatus::Cancelled => "cancelled",
        }
    }

    pub fn from_db(value: &str) -> Self {
        match value.trim() {
            "pending" => ExecutionStatus::Pending,
            "running" => ExecutionStatus::Running,
            "success" => ExecutionStatus::Success,
            "cancelled" => ExecutionStatus::Cancelled,
            _ => ExecutionStatus::Failed,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ExecutionStatus::Success | ExecutionStatus::Failed | ExecutionStatus::Cancelled
        )
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Execution {
    pub id: String,
    pub task_id: String,
    pub status: ExecutionStatus,
    pub scheduled_for: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub attempt: u32,
}

impl Execution {
    pub fn pending(task_id: &str, scheduled_for: DateTime<Utc>) -> Self {
        Self {
            id: new_id("exe"),
            task_id: task_id.to_string(),
            status: ExecutionStatus::Pending,
            scheduled_for,
            started_at: None,
            completed_at: None,
            error: None,
            attempt: 1,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ContainerStatus {
    Created,
    Running,
    Exited,
    Paused,
    Restarting,
    Removing,
    Dead,
}

impl ContainerStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ContainerStatus::Created => "created",
            ContainerStatus::Running => "running",
            ContainerStatus::Exited => "exited",
            ContainerStatus::Paused => "paused",
            ContainerStatus::Restarting => "restarting",
            ContainerStatus::Removing => "removing",
            ContainerStatus::Dead => "dead",
        }
    }

    pub fn from_db(value: &str) -> Self {
        match value.trim() {
            "created" => ContainerStatus::Created,
            "running" => ContainerStatus::Running,
            "exited" => ContainerStatus::Exited,
            "paused" => ContainerStatus::Paused,
            "restarting" => ContainerStatus::Restarting,
            "removing" => ContainerStatus::Removing,
            _ => ContainerStatus::Dead,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum UpdatePolicy {
    Manual,
    Auto,
}

impl UpdatePolicy {
    pub fn as_str(self) -> &'static str {
        match self {
            UpdatePolicy::Manual => "manual",
            UpdatePolicy::Auto => "auto",
        }
    }

    pub fn from_db(value: &str) -> Self {
        match value.trim() {
            "auto" => UpdatePolicy::Auto,
            _ => UpdatePolicy::Manual,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Strategy {
    Recreate,
    Rolling,
    BlueGreen,
}

impl Strategy {
    pub fn as_str(self) -> &'static str {
        match self {
            Strategy::Recreate => "recreate",
            Strategy::Rolling => "rolling",
            Strategy::BlueGreen => "blue-green",
        }
    }

    pub fn from_db(value: &str) -> Self {
        match value.trim() {
            "rolling" => Strategy::Rolling,
            "blue-green" => Strategy::BlueGreen,
            _ => Strategy::Recreate,
        }
    }
}

/// Health probe configuration, stored as tagged JSON on the container row.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum HealthProbe {
    Http { url: String },
    Tcp { addr: String },
    Command { command: Vec<String> },
}

#[derive(Clone, Debug, PartialEq)]
pub struct Container {
    pub id: String,
    pub name: String,
    pub image: String,
    pub tag: String,
    /// Digest the running instance was created from, when known.
    pub digest: Option<String>,
    pub status: ContainerStatus,
    pub update_policy: UpdatePolicy,
    pub strategy: Strategy,
    pub health: Option<HealthProbe>,
    pub runtime_id: Option<String>,
    pub last_auto_update: Option<DateTime<Utc>>,
    pub created_by: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Container {
    pub fn image_ref(&self) -> String {
        format!("{}:{}", self.image, self.tag)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UpdateStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    RolledBack,
    Cancelled,
}

impl UpdateStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            UpdateStatus::Pending => "pending",
            UpdateStatus::InProgress => "in-progress",
            UpdateStatus::Completed => "completed",
            UpdateStatus::Failed => "failed",
            UpdateStatus::RolledBack => "rolled-back",
            UpdateStatus::Cancelled => "cancelled",
        }
    }

    pub fn from_db(value: &str) -> Self {
        match value.trim() {
            "pending" => UpdateStatus::Pending,
            "in-progress" => UpdateStatus::InProgress,
            "completed" => UpdateStatus::Completed,
            "rolled-back" => UpdateStatus::RolledBack,
            "cancelled" => UpdateStatus::Cancelled,
            _ => UpdateStatus::Failed,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            UpdateStatus::Completed
                | UpdateStatus::Failed
                | UpdateStatus::RolledBack
                | UpdateStatus::Cancelled
        )
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct UpdateRecord {
    pub id: String,
    pub container_id: String,
    pub from_ref: String,
    pub to_ref: String,
    pub strategy: Strategy,
    pub status: UpdateStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

impl UpdateRecord {
    pub fn begin(
        container_id: &str,
        from_ref: &str,
        to_ref: &str,
        strategy: Strategy,
        started_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: new_id("upd"),
            container_id: container_id.to_string(),
            from_ref: from_ref.to_string(),
            to_ref: to_ref.to_string(),
            strategy,
            status: UpdateStatus::Pending,
            started_at,
            completed_at: None,
            error: None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CheckStatus {
    Ok,
    Error,
}

impl CheckStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            CheckStatus::Ok => "ok",
            CheckStatus::Error => "error",
        }
    }

    pub fn from_db(value: &str) -> Self {
        match value.trim() {
            "ok" => CheckStatus::Ok,
            _ => CheckStatus::Error,
        }
    }
}

/// Cached registry lookup for one normalized image reference.
#[derive(Clone, Debug, PartialEq)]
pub struct ImageVersion {
    pub image: String,
    pub registry: String,
    pub tag: String,
    pub digest: Option<String>,
    pub is_latest: bool,
    pub status: CheckStatus,
    pub error: Option<String>,
    pub checked_at: DateTime<Utc>,
}

#[derive(Clone, Debug)]
pub struct EventRecord {
    pub id: i64,
    pub ts: DateTime<Utc>,
    pub action: String,
    pub status: u16,
    pub meta: Value,
}

/// Per-item outcome of a bulk operation.
#[derive(Clone, Debug, Serialize)]
pub struct OperationResult {
    pub container_id: String,
    pub success: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}
