use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Duration as ChronoDuration;
use serde_json::{Value, json};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::config::Config;
use crate::error::{Result, StewardError};
use crate::model::{Container, ContainerStatus, Task, TaskKind, TaskParams, UpdateStatus};
use crate::orchestrator::{UpdateOptions, UpdateOrchestrator};
use crate::registry::DigestResolver;
use crate::runtime::{ContainerRuntime, HealthState};
use crate::store::Stores;

/// Cooperative cancellation handle, derived from the scheduler's shutdown
/// channel. Runners check it between discrete steps, never mid-syscall.
#[derive(Clone)]
pub struct CancelSignal {
    rx: watch::Receiver<bool>,
}

impl CancelSignal {
    pub fn new(rx: watch::Receiver<bool>) -> Self {
        Self { rx }
    }

    /// A signal that never fires.
    pub fn none() -> Self {
        let (_tx, rx) = watch::channel(false);
        Self { rx }
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }
}

/// One implementation per task kind. `run` returns a summary persisted into
/// the execution's event trail; errors become the execution's failure.
#[async_trait]
pub trait TaskRunner: Send + Sync {
    fn kind(&self) -> TaskKind;
    async fn run(&self, task: &Task, cancel: &CancelSignal) -> Result<Value>;
}

/// Tagged dispatch over the registered runners. The dispatcher itself never
/// retries; retry policy is each runner's own business (an image check just
/// waits for the next cycle, a pull retries within the run).
pub struct TaskDispatcher {
    runners: Vec<Arc<dyn TaskRunner>>,
}

impl TaskDispatcher {
    pub fn new(runners: Vec<Arc<dyn TaskRunner>>) -> Self {
        Self { runners }
    }

    /// The full runner set wired against the default stores and clients.
    pub fn standard(
        stores: Stores,
        runtime: Arc<dyn ContainerRuntime>,
        resolver: Arc<DigestResolver>,
        orchestrator: Arc<UpdateOrchestrator>,
        clock: Arc<dyn Clock>,
        cfg: &Config,
    ) -> Self {
        Self::new(vec![
            Arc::new(ImageCheckRunner {
                stores: stores.clone(),
                resolver,
                orchestrator: orchestrator.clone(),
                clock: clock.clone(),
                cooldown_secs: cfg.auto_update_cooldown_secs,
            }),
            Arc::new(ContainerUpdateRunner { orchestrator }),
            Arc::new(CleanupRunner {
                stores: stores.clone(),
                runtime: runtime.clone(),
                clock: clock.clone(),
                default_retention_secs: cfg.retention_secs,
            }),
            Arc::new(HealthCheckRunner {
                stores: stores.clone(),
                runtime,
            }),
            Arc::new(BackupRunner {
                stores,
                clock,
                state_dir: cfg.state_dir.clone(),
                default_keep: cfg.backup_keep,
            }),
        ])
    }

    pub async fn dispatch(&self, task: &Task, cancel: &CancelSignal) -> Result<Value> {
        let runner = self
            .runners
            .iter()
            .find(|runner| runner.kind() == task.kind())
            .ok_or_else(|| {
                StewardError::Internal(format!("no runner for task kind {}", task.kind().as_str()))
            })?;
        runner.run(task, cancel).await
    }
}

/// Resolves remote digests for auto-policy containers and hands stale ones
/// to the update orchestrator, honoring a per-container cooldown.
pub struct ImageCheckRunner {
    stores: Stores,
    resolver: Arc<DigestResolver>,
    orchestrator: Arc<UpdateOrchestrator>,
    clock: Arc<dyn Clock>,
    cooldown_secs: u64,
}

#[async_trait]
impl TaskRunner for ImageCheckRunner {
    fn kind(&self) -> TaskKind {
        TaskKind::ImageCheck
    }

    async fn run(&self, task: &Task, cancel: &CancelSignal) -> Result<Value> {
        let TaskParams::ImageCheck {
            containers: ids,
            force_refresh,
        } = &task.params
        else {
            return Err(StewardError::Internal("mismatched params for image-check".into()));
        };

        let targets = if ids.is_empty() {
            self.stores.containers.list_auto_update().await?
        } else {
            let mut out = Vec::with_capacity(ids.len());
            for id in ids {
                out.push(self.stores.containers.get(id).await?);
            }
            out
        };

        let mut up_to_date = 0usize;
        let mut triggered = 0usize;
        let mut skipped = 0usize;
        let mut failures: Vec<Value> = Vec::new();

        for container in &targets {
            if cancel.is_cancelled() {
                return Err(StewardError::Cancelled);
            }

            let resolved = match self
                .resolver
                .resolve(&container.image_ref(), *force_refresh)
                .await
            {
                Ok(resolved) => resolved,
                Err(err) => {
                    warn!(container = %container.name, %err, "image check failed");
                    failures.push(json!({ "container": container.name, "error": err.to_string() }));
                    continue;
                }
            };

            let current = container.digest.as_deref() == Some(resolved.digest.as_str());
            self.record_latest(container, current).await;

            if current {
                up_to_date += 1;
                continue;
            }
            if container.update_policy != crate::model::UpdatePolicy::Auto {
                skipped += 1;
                continue;
            }
            if self.in_cooldown(container) {
                debug!(container = %container.name, "newer image found, cooldown active");
                skipped += 1;
                continue;
            }

            info!(container = %container.name, digest = %resolved.digest, "newer image, triggering update");
            match self
                .orchestrator
                .trigger_update(&container.id, UpdateOptions::default(), cancel)
                .await
            {
                Ok(record) if record.status == UpdateStatus::Completed => {
                    triggered += 1;
                    self.stamp_auto_update(&container.id).await;
                }
                Ok(record) => {
                    failures.push(json!({
                        "container": container.name,
                        "update": record.status.as_str(),
                        "error": record.error,
                    }));
                }
                Err(StewardError::AlreadyRunning { .. }) => {
                    // Someone else is updating it; that is not our failure.
                    skipped += 1;
                }
                Err(err) => {
                    failures.push(json!({ "container": container.name, "error": err.to_string() }));
                }
            }
        }

        if !targets.is_empty() && failures.len() == targets.len() {
            return Err(StewardError::Internal(format!(
                "all {} image checks failed",
                targets.len()
            )));
        }

        Ok(json!({
            "checked": targets.len(),
            "up_to_date": up_to_date,
            "updates_triggered": triggered,
            "skipped": skipped,
            "failures": failures,
        }))
    }
}

impl ImageCheckRunner {
    fn in_cooldown(&self, container: &Container) -> bool {
        match container.last_auto_update {
            Some(last) => {
                self.clock.now() - last < ChronoDuration::seconds(self.cooldown_secs as i64)
            }
            None => false,
        }
    }

    async fn record_latest(&self, container: &Container, current: bool) {
        let image = match crate::registry::ImageRef::parse(&container.image_ref()) {
            Ok(image) => image.normalized,
            Err(_) => return,
        };
        match self.stores.image_versions.get(&image).await {
            Ok(Some(mut row)) => {
                row.is_latest = current;
                if let Err(err) = self.stores.image_versions.upsert(&row).await {
                    warn!(%image, %err, "image version flag update failed");
                }
            }
            Ok(None) => {}
            Err(err) => warn!(%image, %err, "image version lookup failed"),
        }
    }

    async fn stamp_auto_update(&self, container_id: &str) {
        // The orchestrator rewrote the row; reload before stamping.
        match self.stores.containers.get(container_id).await {
            Ok(mut fresh) => {
                fresh.last_auto_update = Some(self.clock.now());
                if let Err(err) = self.stores.containers.save(&fresh).await {
                    warn!(container_id, %err, "cooldown stamp failed");
                }
            }
            Err(err) => warn!(container_id, %err, "container reload failed"),
        }
    }
}

/// Runs one explicit container update through the orchestrator.
pub struct ContainerUpdateRunner {
    orchestrator: Arc<UpdateOrchestrator>,
}

#[async_trait]
impl TaskRunner for ContainerUpdateRunner {
    fn kind(&self) -> TaskKind {
        TaskKind::ContainerUpdate
    }

    async fn run(&self, task: &Task, cancel: &CancelSignal) -> Result<Value> {
        let TaskParams::ContainerUpdate {
            container,
            target,
            strategy,
            force,
        } = &task.params
        else {
            return Err(StewardError::Internal(
                "mismatched params for container-update".into(),
            ));
        };

        let record = self
            .orchestrator
            .trigger_update(
                container,
                UpdateOptions {
                    target: target.clone(),
                    strategy: *strategy,
                    force: *force,
                    ..UpdateOptions::default()
                },
                cancel,
            )
            .await?;

        match record.status {
            UpdateStatus::Completed => Ok(json!({
                "record_id": record.id,
                "status": record.status.as_str(),
                "to": record.to_ref,
            })),
            UpdateStatus::Cancelled => Err(StewardError::Cancelled),
            // A shutdown mid-update rolls the container back; the execution
            // itself was still cancelled, not failed.
            _ if cancel.is_cancelled() => Err(StewardError::Cancelled),
            status => Err(StewardError::Internal(format!(
                "update {} ({}): {}",
                record.id,
                status.as_str(),
                record.error.unwrap_or_else(|| "no detail".into())
            ))),
        }
    }
}

/// Prunes terminal executions, aged events, stale digest cache rows, and
/// dangling images.
pub struct CleanupRunner {
    stores: Stores,
    runtime: Arc<dyn ContainerRuntime>,
    clock: Arc<dyn Clock>,
    default_retention_secs: u64,
}

#[async_trait]
impl TaskRunner for CleanupRunner {
    fn kind(&self) -> TaskKind {
        TaskKind::Cleanup
    }

    async fn run(&self, task: &Task, cancel: &CancelSignal) -> Result<Value> {
        let TaskParams::Cleanup { retention_secs } = &task.params else {
            return Err(StewardError::Internal("mismatched params for cleanup".into()));
        };
        let retention = retention_secs.unwrap_or(self.default_retention_secs).max(1);
        let cutoff = self.clock.now() - ChronoDuration::seconds(retention as i64);

        let executions = self.stores.executions.prune_terminal_before(cutoff).await?;
        let cache_rows = self.stores.image_versions.prune_before(cutoff).await?;
        let events = self.stores.events.prune_before(cutoff).await?;

        if cancel.is_cancelled() {
            return Err(StewardError::Cancelled);
        }

        // Image pruning is advisory; a failure must not fail the cleanup run.
        if let Err(err) = self.runtime.prune_images().await {
            warn!(%err, "image prune failed");
        }

        info!(executions, cache_rows, events, "cleanup pass done");
        Ok(json!({
            "retention_secs": retention,
            "executions_pruned": executions,
            "cache_rows_pruned": cache_rows,
            "events_pruned": events,
        }))
    }
}

/// Probes containers and records the observed runtime status.
pub struct HealthCheckRunner {
    stores: Stores,
    runtime: Arc<dyn ContainerRuntime>,
}

#[async_trait]
impl TaskRunner for HealthCheckRunner {
    fn kind(&self) -> TaskKind {
        TaskKind::HealthCheck
    }

    async fn run(&self, task: &Task, cancel: &CancelSignal) -> Result<Value> {
        let TaskParams::HealthCheck { containers: ids } = &task.params else {
            return Err(StewardError::Internal(
                "mismatched params for health-check".into(),
            ));
        };

        let targets = if ids.is_empty() {
            self.stores.containers.list_all().await?
        } else {
            let mut out = Vec::with_capacity(ids.len());
            for id in ids {
                out.push(self.stores.containers.get(id).await?);
            }
            out
        };

        let mut healthy = 0usize;
        let mut unhealthy: Vec<Value> = Vec::new();
        let mut skipped = 0usize;

        for container in &targets {
            if cancel.is_cancelled() {
                return Err(StewardError::Cancelled);
            }
            let Some(runtime_id) = &container.runtime_id else {
                skipped += 1;
                continue;
            };

            let observed = match self.runtime.inspect_status(runtime_id).await {
                Ok(status) => status,
                Err(err) => {
                    unhealthy.push(json!({ "container": container.name, "error": err.to_string() }));
                    continue;
                }
            };
            if observed != container.status {
                let mut changed = container.clone();
                changed.status = observed;
                if let Err(err) = self.stores.containers.save(&changed).await {
                    warn!(container = %container.name, %err, "status persist failed");
                }
            }

            let probe_ok = match &container.health {
                Some(probe) => match self.runtime.probe_health(runtime_id, probe).await {
                    Ok(HealthState::Healthy) => true,
                    Ok(HealthState::Unhealthy(reason)) => {
                        unhealthy.push(json!({ "container": container.name, "reason": reason }));
                        false
                    }
                    Err(err) => {
                        unhealthy
                            .push(json!({ "container": container.name, "error": err.to_string() }));
                        false
                    }
                },
                None => observed == ContainerStatus::Running,
            };
            if probe_ok {
                healthy += 1;
            } else if container.health.is_none() {
                unhealthy.push(json!({
                    "container": container.name,
                    "reason": format!("runtime status {}", observed.as_str()),
                }));
            }
        }

        Ok(json!({
            "checked": targets.len() - skipped,
            "healthy": healthy,
            "unhealthy": unhealthy.len(),
            "skipped": skipped,
            "detail": unhealthy,
        }))
    }
}

/// Writes a timestamped JSON snapshot of tasks and containers under the
/// state directory and trims old snapshots.
pub struct BackupRunner {
    stores: Stores,
    clock: Arc<dyn Clock>,
    state_dir: PathBuf,
    default_keep: usize,
}

#[async_trait]
impl TaskRunner for BackupRunner {
    fn kind(&self) -> TaskKind {
        TaskKind::Backup
    }

    async fn run(&self, task: &Task, cancel: &CancelSignal) -> Result<Value> {
        let TaskParams::Backup { keep } = &task.params else {
            return Err(StewardError::Internal("mismatched params for backup".into()));
        };
        let keep = keep.unwrap_or(self.default_keep).max(1);

        let tasks = self.stores.tasks.list_all().await?;
        let containers = self.stores.containers.list_all().await?;
        if cancel.is_cancelled() {
            return Err(StewardError::Cancelled);
        }

        let snapshot = json!({
            "taken_at": self.clock.now().to_rfc3339(),
            "tasks": tasks.iter().map(task_snapshot).collect::<Vec<_>>(),
            "containers": containers.iter().map(container_snapshot).collect::<Vec<_>>(),
        });

        let dir = self.state_dir.join("backups");
        fs::create_dir_all(&dir)
            .map_err(|err| StewardError::Internal(format!("backup dir: {err}")))?;
        let name = format!(
            "steward-backup-{}.json",
            self.clock.now().format("%Y%m%dT%H%M%SZ")
        );
        let path = dir.join(&name);
        fs::write(&path, serde_json::to_vec_pretty(&snapshot).unwrap_or_default())
            .map_err(|err| StewardError::Internal(format!("backup write: {err}")))?;

        let removed = trim_snapshots(&dir, keep);
        info!(path = %path.display(), removed, "backup written");
        Ok(json!({
            "path": path.display().to_string(),
            "tasks": tasks.len(),
            "containers": containers.len(),
            "removed_old": removed,
        }))
    }
}

fn task_snapshot(task: &Task) -> Value {
    json!({
        "id": task.id,
        "name": task.name,
        "schedule": task.schedule,
        "params": task.params,
        "enabled": task.enabled,
        "next_run": task.next_run.map(|t| t.to_rfc3339()),
        "last_run": task.last_run.map(|t| t.to_rfc3339()),
        "created_by": task.created_by,
        "created_at": task.created_at.to_rfc3339(),
    })
}

fn container_snapshot(container: &Container) -> Value {
    json!({
        "id": container.id,
        "name": container.name,
        "image": container.image,
        "tag": container.tag,
        "digest": container.digest,
        "status": container.status.as_str(),
        "update_policy": container.update_policy.as_str(),
        "strategy": container.strategy.as_str(),
        "health": container.health,
        "runtime_id": container.runtime_id,
        "created_by": container.created_by,
        "created_at": container.created_at.to_rfc3339(),
    })
}

/// Remove snapshot files beyond the newest `keep`. Timestamped names sort
/// lexicographically, newest last.
fn trim_snapshots(dir: &std::path::Path, keep: usize) -> usize {
    let mut names: Vec<String> = match fs::read_dir(dir) {
        Ok(entries) => entries
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| entry.file_name().into_string().ok())
            .filter(|name| name.starts_with("steward-backup-") && name.ends_with(".json"))
            .collect(),
        Err(_) => return 0,
    };
    names.sort();
    let mut removed = 0;
    while names.len() > keep {
        let victim = names.remove(0);
        if fs::remove_file(dir.join(&victim)).is_ok() {
            removed += 1;
        }
    }
    removed
}
