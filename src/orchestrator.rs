use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tracing::{debug, error, info, warn};

use crate::clock::Clock;
use crate::config::Config;
use crate::error::{Result, StewardError};
use crate::executor::CancelSignal;
use crate::model::{Container, ContainerStatus, Strategy, UpdateRecord, UpdateStatus};
use crate::registry::{DigestResolver, ImageRef};
use crate::runtime::{ContainerRuntime, ContainerSpec, HealthState};
use crate::store::{ContainerStore, EventStore, UpdateRecordStore};

#[derive(Clone, Debug)]
pub struct UpdateOptions {
    /// Target image reference. Defaults to the container's current
    /// `image:tag`, i.e. "re-resolve the tag and apply whatever it points at".
    pub target: Option<String>,
    pub strategy: Option<Strategy>,
    /// Apply even when the resolved digest matches the current one.
    pub force: bool,
    pub rollback_on_failure: bool,
    /// Bypass the digest cache for the check step.
    pub force_refresh: bool,
}

impl Default for UpdateOptions {
    fn default() -> Self {
        Self {
            target: None,
            strategy: None,
            force: false,
            rollback_on_failure: true,
            force_refresh: false,
        }
    }
}

#[derive(Clone, Debug)]
pub struct OrchestratorConfig {
    pub max_pull_retries: u32,
    pub pull_retry_delay: Duration,
    pub health_timeout: Duration,
    pub health_poll: Duration,
}

impl OrchestratorConfig {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            max_pull_retries: cfg.max_pull_retries,
            pull_retry_delay: cfg.pull_retry_delay,
            health_timeout: cfg.health_timeout,
            health_poll: cfg.health_poll,
        }
    }
}

/// What the apply step has mutated so far. Drives the rollback path: undo
/// exactly what happened, nothing more.
#[derive(Debug, Default)]
struct ApplyState {
    new_runtime_id: Option<String>,
    old_stopped: bool,
    old_removed: bool,
}

struct ApplyError {
    error: StewardError,
    state: ApplyState,
}

/// Drives one container update from requested to completed, failed, or
/// rolled back: check → pull → apply-strategy → verify → (rollback|done).
pub struct UpdateOrchestrator {
    containers: Arc<dyn ContainerStore>,
    updates: Arc<dyn UpdateRecordStore>,
    runtime: Arc<dyn ContainerRuntime>,
    resolver: Arc<DigestResolver>,
    events: Arc<dyn EventStore>,
    clock: Arc<dyn Clock>,
    cfg: OrchestratorConfig,
}

impl UpdateOrchestrator {
    pub fn new(
        containers: Arc<dyn ContainerStore>,
        updates: Arc<dyn UpdateRecordStore>,
        runtime: Arc<dyn ContainerRuntime>,
        resolver: Arc<DigestResolver>,
        events: Arc<dyn EventStore>,
        clock: Arc<dyn Clock>,
        cfg: OrchestratorConfig,
    ) -> Self {
        Self {
            containers,
            updates,
            runtime,
            resolver,
            events,
            clock,
            cfg,
        }
    }

    /// Run one update to a terminal state. The returned record carries the
    /// outcome; only pre-flight problems (unknown container, bad target ref,
    /// another update already open) surface as `Err`.
    pub async fn trigger_update(
        &self,
        container_id: &str,
        opts: UpdateOptions,
        cancel: &CancelSignal,
    ) -> Result<UpdateRecord> {
        let container = self.containers.get(container_id).await?;
        let strategy = opts.strategy.unwrap_or(container.strategy);
        let target_raw = opts
            .target
            .clone()
            .unwrap_or_else(|| container.image_ref());
        let target = ImageRef::parse(&target_raw)?;

        let record = UpdateRecord::begin(
            &container.id,
            &container.image_ref(),
            &target.normalized,
            strategy,
            self.clock.now(),
        );
        if !self.updates.try_begin(&record).await? {
            return Err(StewardError::AlreadyRunning {
                subject: format!("container {}", container.id),
            });
        }

        self.event(
            "update-started",
            202,
            json!({
                "record_id": record.id,
                "container": container.name,
                "from": record.from_ref,
                "to": record.to_ref,
                "strategy": strategy.as_str(),
            }),
        )
        .await;

        self.updates
            .set_status(&record.id, UpdateStatus::InProgress, None)
            .await?;

        match self
            .drive(&container, &record, &target, strategy, &opts, cancel)
            .await
        {
            Ok(()) => {}
            Err(err) => {
                // drive() persists the terminal status on its own exit
                // paths; anything surfacing here bypassed them. Store
                // failures are systemic and propagate; for the rest, make
                // sure the record still reaches a terminal state.
                if let StewardError::Store(_) = err {
                    return Err(err);
                }
                let detail = format!("{}: {err}", err.code());
                let _ = self
                    .finish(&record, UpdateStatus::Failed, Some(&detail))
                    .await;
            }
        }
        self.updates.get(&record.id).await
    }

    /// The state machine proper. Persists the terminal status on every exit
    /// path; the `Err` return is only used to carry store failures upward.
    async fn drive(
        &self,
        container: &Container,
        record: &UpdateRecord,
        target: &ImageRef,
        strategy: Strategy,
        opts: &UpdateOptions,
        cancel: &CancelSignal,
    ) -> Result<()> {
        // Checking: resolve the target digest through the cache.
        if cancel.is_cancelled() {
            return self.finish(record, UpdateStatus::Cancelled, Some("cancelled")).await;
        }
        self.phase(record, "checking").await;
        let resolved = match self
            .resolver
            .resolve(&target.normalized, opts.force_refresh)
            .await
        {
            Ok(resolved) => resolved,
            Err(err) => {
                let detail = format!("{}: {err}", err.code());
                return self.finish(record, UpdateStatus::Failed, Some(&detail)).await;
            }
        };

        // Nothing new to apply: a no-op re-run is a success, not an error.
        if !opts.force && container.digest.as_deref() == Some(resolved.digest.as_str()) {
            debug!(container = %container.name, digest = %resolved.digest, "update is a no-op");
            self.event(
                "update-noop",
                200,
                json!({ "record_id": record.id, "container": container.name, "digest": resolved.digest }),
            )
            .await;
            return self.finish(record, UpdateStatus::Completed, None).await;
        }

        // Pulling: transient failures retry in-process up to the policy limit.
        self.phase(record, "pulling").await;
        let mut attempt = 0;
        loop {
            if cancel.is_cancelled() {
                return self.finish(record, UpdateStatus::Cancelled, Some("cancelled")).await;
            }
            attempt += 1;
            match self.runtime.pull(&target.normalized).await {
                Ok(()) => break,
                Err(err) if attempt >= self.cfg.max_pull_retries => {
                    let failure = StewardError::PullFailed {
                        image: target.normalized.clone(),
                        attempts: attempt,
                        reason: err.to_string(),
                    };
                    let detail = format!("{}: {failure}", failure.code());
                    return self.finish(record, UpdateStatus::Failed, Some(&detail)).await;
                }
                Err(err) => {
                    warn!(image = %target.normalized, attempt, %err, "pull failed, retrying");
                    tokio::time::sleep(self.cfg.pull_retry_delay).await;
                }
            }
        }

        // Applying + verifying. Past this point the container may be mutated,
        // so every failure consults the rollback policy.
        if cancel.is_cancelled() {
            return self.finish(record, UpdateStatus::Cancelled, Some("cancelled")).await;
        }
        self.phase(record, "applying").await;
        let apply = match strategy {
            Strategy::Recreate => self.apply_recreate(container, target, record, cancel).await,
            Strategy::Rolling => self.apply_rolling(container, target, record, cancel).await,
            Strategy::BlueGreen => self.apply_blue_green(container, target, record, cancel).await,
        };

        match apply {
            Ok(final_runtime_id) => {
                let mut updated = container.clone();
                updated.image = format!("{}/{}", target.registry, target.repo);
                updated.tag = target.tag.clone();
                updated.digest = Some(resolved.digest.clone());
                updated.runtime_id = Some(final_runtime_id);
                updated.status = ContainerStatus::Running;
                self.containers.save(&updated).await?;

                info!(container = %container.name, to = %target.normalized, "update completed");
                self.event(
                    "update-completed",
                    200,
                    json!({ "record_id": record.id, "container": container.name, "digest": resolved.digest }),
                )
                .await;
                self.finish(record, UpdateStatus::Completed, None).await
            }
            Err(apply_err) => {
                self.handle_apply_failure(container, record, target, apply_err, opts)
                    .await
            }
        }
    }

    async fn handle_apply_failure(
        &self,
        container: &Container,
        record: &UpdateRecord,
        target: &ImageRef,
        apply_err: ApplyError,
        opts: &UpdateOptions,
    ) -> Result<()> {
        let cancelled = matches!(apply_err.error, StewardError::Cancelled);
        let detail = format!("{}: {}", apply_err.error.code(), apply_err.error);

        if !opts.rollback_on_failure {
            // The old instance may already be gone; say so instead of
            // pretending the container was left untouched.
            let mut message = detail.clone();
            if apply_err.state.old_removed {
                message.push_str("; previous instance was removed");
            } else if apply_err.state.old_stopped {
                message.push_str("; previous instance is stopped");
            }
            self.event(
                "update-failed",
                500,
                json!({ "record_id": record.id, "container": container.name, "error": message }),
            )
            .await;
            let status = if cancelled {
                UpdateStatus::Cancelled
            } else {
                UpdateStatus::Failed
            };
            return self.finish(record, status, Some(&message)).await;
        }

        self.phase(record, "rolling-back").await;
        match self.rollback(container, &apply_err.state).await {
            Ok(()) => {
                self.event(
                    "update-rolled-back",
                    200,
                    json!({
                        "record_id": record.id,
                        "container": container.name,
                        "to": target.normalized,
                        "cause": detail,
                    }),
                )
                .await;
                let message = format!("rolled back after: {detail}");
                self.finish(record, UpdateStatus::RolledBack, Some(&message))
                    .await
            }
            Err(rollback_err) => {
                // Terminal and loud. Never retried automatically: another
                // rollback attempt on top of a half-restored container only
                // makes the operator's job harder.
                error!(
                    container = %container.name,
                    cause = %detail,
                    %rollback_err,
                    "rollback failed; operator intervention required"
                );
                self.event(
                    "rollback-failed",
                    500,
                    json!({
                        "record_id": record.id,
                        "container": container.name,
                        "cause": detail,
                        "error": rollback_err.to_string(),
                    }),
                )
                .await;
                let message = format!("{}: {rollback_err} (after: {detail})", rollback_err.code());
                self.finish(record, UpdateStatus::Failed, Some(&message)).await
            }
        }
    }

    /// recreate: stop old, remove old, create + start new under the same
    /// name.
    async fn apply_recreate(
        &self,
        container: &Container,
        target: &ImageRef,
        record: &UpdateRecord,
        cancel: &CancelSignal,
    ) -> std::result::Result<String, ApplyError> {
        let mut state = ApplyState::default();

        if let Some(old_id) = &container.runtime_id {
            if let Err(err) = self.runtime.stop(old_id).await {
                return Err(apply_failed(container, err.to_string(), state));
            }
            state.old_stopped = true;
            if let Err(err) = self.runtime.remove(old_id).await {
                return Err(apply_failed(container, err.to_string(), state));
            }
            state.old_removed = true;
        }

        let spec = ContainerSpec {
            name: container.name.clone(),
            image_ref: target.normalized.clone(),
        };
        let new_id = match self.runtime.create(&spec).await {
            Ok(id) => id,
            Err(err) => return Err(apply_failed(container, err.to_string(), state)),
        };
        state.new_runtime_id = Some(new_id.clone());

        if let Err(err) = self.runtime.start(&new_id).await {
            return Err(apply_failed(container, err.to_string(), state));
        }

        self.phase(record, "verifying").await;
        match self.verify(&new_id, container, cancel).await {
            Ok(()) => Ok(new_id),
            Err(err) => Err(ApplyError { error: err, state }),
        }
    }

    /// rolling: start the replacement alongside the old instance, switch
    /// only once it reports healthy.
    async fn apply_rolling(
        &self,
        container: &Container,
        target: &ImageRef,
        record: &UpdateRecord,
        cancel: &CancelSignal,
    ) -> std::result::Result<String, ApplyError> {
        let mut state = ApplyState::default();

        let spec = ContainerSpec {
            name: format!("{}-next", container.name),
            image_ref: target.normalized.clone(),
        };
        let new_id = match self.runtime.create(&spec).await {
            Ok(id) => id,
            Err(err) => return Err(apply_failed(container, err.to_string(), state)),
        };
        state.new_runtime_id = Some(new_id.clone());

        if let Err(err) = self.runtime.start(&new_id).await {
            return Err(apply_failed(container, err.to_string(), state));
        }

        self.phase(record, "verifying").await;
        if let Err(err) = self.verify(&new_id, container, cancel).await {
            return Err(ApplyError { error: err, state });
        }

        // Healthy: retire the old instance and take over its name.
        if let Some(old_id) = &container.runtime_id {
            if let Err(err) = self.runtime.stop(old_id).await {
                return Err(apply_failed(container, err.to_string(), state));
            }
            state.old_stopped = true;
            if let Err(err) = self.runtime.remove(old_id).await {
                return Err(apply_failed(container, err.to_string(), state));
            }
            state.old_removed = true;
        }
        if let Err(err) = self.runtime.rename(&new_id, &container.name).await {
            return Err(apply_failed(container, err.to_string(), state));
        }

        Ok(new_id)
    }

    /// blue-green: bring up the green instance under its own identity and
    /// only move the pointer after verification. The old instance is kept
    /// (stopped) until an explicit cleanup.
    async fn apply_blue_green(
        &self,
        container: &Container,
        target: &ImageRef,
        record: &UpdateRecord,
        cancel: &CancelSignal,
    ) -> std::result::Result<String, ApplyError> {
        let mut state = ApplyState::default();

        let spec = ContainerSpec {
            name: format!("{}-green", container.name),
            image_ref: target.normalized.clone(),
        };
        let green_id = match self.runtime.create(&spec).await {
            Ok(id) => id,
            Err(err) => return Err(apply_failed(container, err.to_string(), state)),
        };
        state.new_runtime_id = Some(green_id.clone());

        if let Err(err) = self.runtime.start(&green_id).await {
            return Err(apply_failed(container, err.to_string(), state));
        }

        self.phase(record, "verifying").await;
        if let Err(err) = self.verify(&green_id, container, cancel).await {
            return Err(ApplyError { error: err, state });
        }

        if let Some(old_id) = &container.runtime_id {
            if let Err(err) = self.runtime.stop(old_id).await {
                return Err(apply_failed(container, err.to_string(), state));
            }
            state.old_stopped = true;
        }

        Ok(green_id)
    }

    /// Wait for the instance to pass its health probe within the grace
    /// period. Containers without a probe are verified by runtime status.
    async fn verify(
        &self,
        runtime_id: &str,
        container: &Container,
        cancel: &CancelSignal,
    ) -> Result<()> {
        let deadline = tokio::time::Instant::now() + self.cfg.health_timeout;
        let mut last_reason = String::from("no probe attempt completed");

        loop {
            if cancel.is_cancelled() {
                return Err(StewardError::Cancelled);
            }

            let healthy = match &container.health {
                Some(probe) => match self.runtime.probe_health(runtime_id, probe).await {
                    Ok(HealthState::Healthy) => true,
                    Ok(HealthState::Unhealthy(reason)) => {
                        last_reason = reason;
                        false
                    }
                    Err(err) => {
                        last_reason = err.to_string();
                        false
                    }
                },
                None => match self.runtime.inspect_status(runtime_id).await {
                    Ok(ContainerStatus::Running) => true,
                    Ok(status) => {
                        last_reason = format!("runtime status {}", status.as_str());
                        false
                    }
                    Err(err) => {
                        last_reason = err.to_string();
                        false
                    }
                },
            };

            if healthy {
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                debug!(runtime_id, %last_reason, "health deadline elapsed");
                return Err(StewardError::HealthCheckTimeout {
                    container: container.name.clone(),
                    timeout_secs: self.cfg.health_timeout.as_secs(),
                });
            }
            tokio::time::sleep(self.cfg.health_poll).await;
        }
    }

    /// Undo what the failed apply did: drop the new instance, restore and
    /// restart the previous one.
    async fn rollback(&self, container: &Container, state: &ApplyState) -> Result<()> {
        if let Some(new_id) = &state.new_runtime_id {
            // Stop is best-effort; the instance may never have started.
            let _ = self.runtime.stop(new_id).await;
            self.runtime.remove(new_id).await.map_err(|err| {
                StewardError::RollbackFailed {
                    container: container.name.clone(),
                    reason: format!("removing replacement instance: {err}"),
                }
            })?;
        }

        if state.old_removed {
            let spec = ContainerSpec {
                name: container.name.clone(),
                image_ref: container.image_ref(),
            };
            let restored_id =
                self.runtime
                    .create(&spec)
                    .await
                    .map_err(|err| StewardError::RollbackFailed {
                        container: container.name.clone(),
                        reason: format!("recreating previous instance: {err}"),
                    })?;
            self.runtime
                .start(&restored_id)
                .await
                .map_err(|err| StewardError::RollbackFailed {
                    container: container.name.clone(),
                    reason: format!("starting restored instance: {err}"),
                })?;
            let mut restored = container.clone();
            restored.runtime_id = Some(restored_id);
            restored.status = ContainerStatus::Running;
            self.containers.save(&restored).await?;
        } else if state.old_stopped {
            if let Some(old_id) = &container.runtime_id {
                self.runtime
                    .start(old_id)
                    .await
                    .map_err(|err| StewardError::RollbackFailed {
                        container: container.name.clone(),
                        reason: format!("restarting previous instance: {err}"),
                    })?;
            }
        }

        Ok(())
    }

    async fn finish(
        &self,
        record: &UpdateRecord,
        status: UpdateStatus,
        error: Option<&str>,
    ) -> Result<()> {
        self.updates
            .complete(&record.id, status, error, self.clock.now())
            .await
    }

    async fn phase(&self, record: &UpdateRecord, phase: &str) {
        self.event(
            "update-phase",
            200,
            json!({ "record_id": record.id, "phase": phase }),
        )
        .await;
    }

    async fn event(&self, action: &str, status: u16, meta: serde_json::Value) {
        if let Err(err) = self
            .events
            .append(self.clock.now(), action, status, meta)
            .await
        {
            warn!(action, %err, "event append failed");
        }
    }
}

fn apply_failed(container: &Container, reason: String, state: ApplyState) -> ApplyError {
    let error = StewardError::ApplyFailed {
        container: container.name.clone(),
        reason,
        old_stopped: state.old_stopped,
    };
    ApplyError { error, state }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::model::{HealthProbe, UpdatePolicy};
    use crate::registry::{RegistryClient, RegistryError};
    use crate::runtime::RuntimeError;
    use crate::store::{Stores, open_memory_pool};
    use async_trait::async_trait;
    use chrono::TimeZone;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct FixedRegistry {
        digest: String,
    }

    #[async_trait]
    impl RegistryClient for FixedRegistry {
        async fn resolve_digest(
            &self,
            _image: &ImageRef,
        ) -> std::result::Result<String, RegistryError> {
            Ok(self.digest.clone())
        }
    }

    /// Scriptable in-memory runtime. Tracks every call and the liveness of
    /// each instance so tests can assert on the final shape of the world.
    #[derive(Default)]
    struct FakeRuntime {
        calls: Mutex<Vec<String>>,
        next_id: AtomicU32,
        instances: Mutex<HashMap<String, ContainerStatus>>,
        pull_failures: AtomicU32,
        fail_start: Mutex<Vec<String>>,
        fail_remove: Mutex<Vec<String>>,
        healthy_after_probes: AtomicU32,
    }

    impl FakeRuntime {
        fn with_instance(self, runtime_id: &str, status: ContainerStatus) -> Self {
            self.instances
                .lock()
                .unwrap()
                .insert(runtime_id.to_string(), status);
            self
        }

        fn record(&self, call: String) {
            self.calls.lock().unwrap().push(call);
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }

        fn status_of(&self, runtime_id: &str) -> Option<ContainerStatus> {
            self.instances.lock().unwrap().get(runtime_id).copied()
        }
    }

    #[async_trait]
    impl ContainerRuntime for FakeRuntime {
        async fn pull(&self, image_ref: &str) -> std::result::Result<(), RuntimeError> {
            self.record(format!("pull {image_ref}"));
            if self.pull_failures.load(Ordering::SeqCst) > 0 {
                self.pull_failures.fetch_sub(1, Ordering::SeqCst);
                return Err(RuntimeError::CommandFailed {
                    command: format!("pull {image_ref}"),
                    exit: "125".into(),
                    stderr: "connection reset".into(),
                });
            }
            Ok(())
        }

        async fn create(&self, spec: &ContainerSpec) -> std::result::Result<String, RuntimeError> {
            self.record(format!("create {} {}", spec.name, spec.image_ref));
            let id = format!("rt-{}", self.next_id.fetch_add(1, Ordering::SeqCst));
            self.instances
                .lock()
                .unwrap()
                .insert(id.clone(), ContainerStatus::Created);
            Ok(id)
        }

        async fn start(&self, runtime_id: &str) -> std::result::Result<(), RuntimeError> {
            self.record(format!("start {runtime_id}"));
            if self.fail_start.lock().unwrap().iter().any(|id| id == runtime_id) {
                return Err(RuntimeError::CommandFailed {
                    command: format!("start {runtime_id}"),
                    exit: "125".into(),
                    stderr: "cannot start".into(),
                });
            }
            self.instances
                .lock()
                .unwrap()
                .insert(runtime_id.to_string(), ContainerStatus::Running);
            Ok(())
        }

        async fn stop(&self, runtime_id: &str) -> std::result::Result<(), RuntimeError> {
            self.record(format!("stop {runtime_id}"));
            self.instances
                .lock()
                .unwrap()
                .insert(runtime_id.to_string(), ContainerStatus::Exited);
            Ok(())
        }

        async fn remove(&self, runtime_id: &str) -> std::result::Result<(), RuntimeError> {
            self.record(format!("remove {runtime_id}"));
            if self
                .fail_remove
                .lock()
                .unwrap()
                .iter()
                .any(|id| id == runtime_id)
            {
                return Err(RuntimeError::CommandFailed {
                    command: format!("remove {runtime_id}"),
                    exit: "125".into(),
                    stderr: "device busy".into(),
                });
            }
            self.instances.lock().unwrap().remove(runtime_id);
            Ok(())
        }

        async fn rename(
            &self,
            runtime_id: &str,
            new_name: &str,
        ) -> std::result::Result<(), RuntimeError> {
            self.record(format!("rename {runtime_id} {new_name}"));
            Ok(())
        }

        async fn inspect_status(
            &self,
            runtime_id: &str,
        ) -> std::result::Result<ContainerStatus, RuntimeError> {
            self.record(format!("inspect {runtime_id}"));
            Ok(self
                .status_of(runtime_id)
                .unwrap_or(ContainerStatus::Dead))
        }

        async fn probe_health(
            &self,
            runtime_id: &str,
            _probe: &HealthProbe,
        ) -> std::result::Result<HealthState, RuntimeError> {
            self.record(format!("probe {runtime_id}"));
            let remaining = self.healthy_after_probes.load(Ordering::SeqCst);
            if remaining == 0 {
                Ok(HealthState::Healthy)
            } else {
                self.healthy_after_probes.fetch_sub(1, Ordering::SeqCst);
                Ok(HealthState::Unhealthy("starting".into()))
            }
        }

        async fn prune_images(&self) -> std::result::Result<(), RuntimeError> {
            self.record("prune-images".into());
            Ok(())
        }
    }

    fn now() -> chrono::DateTime<chrono::Utc> {
        chrono::Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap()
    }

    fn sample_container(strategy: Strategy) -> Container {
        Container {
            id: "ctr_app".into(),
            name: "app".into(),
            image: "ghcr.io/example/app".into(),
            tag: "main".into(),
            digest: Some("sha256:aaa".into()),
            status: ContainerStatus::Running,
            update_policy: UpdatePolicy::Auto,
            strategy,
            health: None,
            runtime_id: Some("rt-old".into()),
            last_auto_update: None,
            created_by: Some("ops".into()),
            created_at: now(),
        }
    }

    fn test_cfg() -> OrchestratorConfig {
        OrchestratorConfig {
            max_pull_retries: 3,
            pull_retry_delay: Duration::from_millis(1),
            health_timeout: Duration::from_millis(50),
            health_poll: Duration::from_millis(1),
        }
    }

    async fn build(
        digest: &str,
        runtime: FakeRuntime,
        container: Container,
    ) -> (UpdateOrchestrator, Stores, Arc<FakeRuntime>) {
        let stores = Stores::sqlite(open_memory_pool().await.unwrap());
        stores.containers.insert(&container).await.unwrap();
        let clock = Arc::new(ManualClock::at(now()));
        let runtime = Arc::new(runtime);
        let resolver = Arc::new(DigestResolver::new(
            stores.image_versions.clone(),
            Arc::new(FixedRegistry {
                digest: digest.into(),
            }),
            clock.clone(),
            600,
        ));
        let orchestrator = UpdateOrchestrator::new(
            stores.containers.clone(),
            stores.updates.clone(),
            runtime.clone(),
            resolver,
            stores.events.clone(),
            clock,
            test_cfg(),
        );
        (orchestrator, stores, runtime)
    }

    #[tokio::test]
    async fn same_digest_without_force_is_a_noop_success() {
        let container = sample_container(Strategy::Recreate);
        let (orchestrator, stores, runtime) = build(
            "sha256:aaa",
            FakeRuntime::default().with_instance("rt-old", ContainerStatus::Running),
            container.clone(),
        )
        .await;

        let record = orchestrator
            .trigger_update("ctr_app", UpdateOptions::default(), &CancelSignal::none())
            .await
            .unwrap();

        assert_eq!(record.status, UpdateStatus::Completed);
        assert_eq!(record.error, None);
        // Never pulled, never touched the runtime.
        assert!(runtime.calls().is_empty());
        let unchanged = stores.containers.get("ctr_app").await.unwrap();
        assert_eq!(unchanged, container);
    }

    #[tokio::test]
    async fn recreate_update_swaps_the_instance() {
        let (orchestrator, stores, runtime) = build(
            "sha256:bbb",
            FakeRuntime::default().with_instance("rt-old", ContainerStatus::Running),
            sample_container(Strategy::Recreate),
        )
        .await;

        let record = orchestrator
            .trigger_update("ctr_app", UpdateOptions::default(), &CancelSignal::none())
            .await
            .unwrap();

        assert_eq!(record.status, UpdateStatus::Completed);
        let calls = runtime.calls();
        assert_eq!(calls[0], "pull ghcr.io/example/app:main");
        assert_eq!(calls[1], "stop rt-old");
        assert_eq!(calls[2], "remove rt-old");
        assert_eq!(calls[3], "create app ghcr.io/example/app:main");
        assert!(calls[4].starts_with("start rt-"));

        let updated = stores.containers.get("ctr_app").await.unwrap();
        assert_eq!(updated.digest.as_deref(), Some("sha256:bbb"));
        assert_eq!(updated.status, ContainerStatus::Running);
        assert_ne!(updated.runtime_id.as_deref(), Some("rt-old"));
    }

    #[tokio::test]
    async fn pull_exhaustion_fails_without_touching_the_container() {
        let runtime = FakeRuntime::default().with_instance("rt-old", ContainerStatus::Running);
        runtime.pull_failures.store(10, Ordering::SeqCst);
        let (orchestrator, stores, runtime) =
            build("sha256:bbb", runtime, sample_container(Strategy::Recreate)).await;

        let record = orchestrator
            .trigger_update("ctr_app", UpdateOptions::default(), &CancelSignal::none())
            .await
            .unwrap();

        assert_eq!(record.status, UpdateStatus::Failed);
        assert!(record.error.as_deref().unwrap().starts_with("pull-failed"));
        // Three attempts, then nothing else.
        assert_eq!(
            runtime.calls(),
            vec![
                "pull ghcr.io/example/app:main",
                "pull ghcr.io/example/app:main",
                "pull ghcr.io/example/app:main",
            ]
        );
        let unchanged = stores.containers.get("ctr_app").await.unwrap();
        assert_eq!(unchanged.runtime_id.as_deref(), Some("rt-old"));
    }

    #[tokio::test]
    async fn rolling_update_that_never_gets_healthy_rolls_back() {
        let mut container = sample_container(Strategy::Rolling);
        container.health = Some(HealthProbe::Http {
            url: "http://127.0.0.1:1/healthz".into(),
        });
        let runtime = FakeRuntime::default().with_instance("rt-old", ContainerStatus::Running);
        runtime.healthy_after_probes.store(u32::MAX, Ordering::SeqCst);
        let (orchestrator, stores, runtime) = build("sha256:bbb", runtime, container).await;

        let record = orchestrator
            .trigger_update("ctr_app", UpdateOptions::default(), &CancelSignal::none())
            .await
            .unwrap();

        assert_eq!(record.status, UpdateStatus::RolledBack);
        let error = record.error.unwrap();
        assert!(error.contains("health-check-timeout"), "{error}");

        // Old instance untouched and still running; replacement removed.
        assert_eq!(
            runtime.status_of("rt-old"),
            Some(ContainerStatus::Running)
        );
        assert_eq!(runtime.status_of("rt-0"), None);
        let unchanged = stores.containers.get("ctr_app").await.unwrap();
        assert_eq!(unchanged.runtime_id.as_deref(), Some("rt-old"));
        assert_eq!(unchanged.digest.as_deref(), Some("sha256:aaa"));
    }

    #[tokio::test]
    async fn recreate_failure_restores_the_previous_instance() {
        // New instance is created as rt-0 and refuses to start; the old one
        // was already removed, so rollback recreates it (rt-1) and starts it.
        let runtime = FakeRuntime::default().with_instance("rt-old", ContainerStatus::Running);
        runtime.fail_start.lock().unwrap().push("rt-0".into());
        let (orchestrator, stores, runtime) =
            build("sha256:bbb", runtime, sample_container(Strategy::Recreate)).await;

        let record = orchestrator
            .trigger_update("ctr_app", UpdateOptions::default(), &CancelSignal::none())
            .await
            .unwrap();

        assert_eq!(record.status, UpdateStatus::RolledBack);
        assert_eq!(runtime.status_of("rt-1"), Some(ContainerStatus::Running));
        let restored = stores.containers.get("ctr_app").await.unwrap();
        assert_eq!(restored.runtime_id.as_deref(), Some("rt-1"));
        assert_eq!(restored.digest.as_deref(), Some("sha256:aaa"));
    }

    #[tokio::test]
    async fn rollback_disabled_fails_and_reports_stopped_old_instance() {
        let runtime = FakeRuntime::default().with_instance("rt-old", ContainerStatus::Running);
        runtime.fail_start.lock().unwrap().push("rt-0".into());
        let (orchestrator, _stores, _runtime) =
            build("sha256:bbb", runtime, sample_container(Strategy::Recreate)).await;

        let record = orchestrator
            .trigger_update(
                "ctr_app",
                UpdateOptions {
                    rollback_on_failure: false,
                    ..UpdateOptions::default()
                },
                &CancelSignal::none(),
            )
            .await
            .unwrap();

        assert_eq!(record.status, UpdateStatus::Failed);
        let error = record.error.unwrap();
        assert!(error.contains("previous instance was removed"), "{error}");
    }

    #[tokio::test]
    async fn rollback_failure_is_terminal_and_loud() {
        let runtime = FakeRuntime::default().with_instance("rt-old", ContainerStatus::Running);
        runtime.fail_start.lock().unwrap().push("rt-0".into());
        runtime.fail_remove.lock().unwrap().push("rt-0".into());
        let (orchestrator, stores, _runtime) =
            build("sha256:bbb", runtime, sample_container(Strategy::Recreate)).await;

        let record = orchestrator
            .trigger_update("ctr_app", UpdateOptions::default(), &CancelSignal::none())
            .await
            .unwrap();

        assert_eq!(record.status, UpdateStatus::Failed);
        assert!(
            record
                .error
                .as_deref()
                .unwrap()
                .starts_with("rollback-failed")
        );

        let events = stores.events.list_recent(10).await.unwrap();
        assert!(events.iter().any(|e| e.action == "rollback-failed"));
    }

    #[tokio::test]
    async fn second_update_for_same_container_is_rejected() {
        let (orchestrator, stores, _runtime) = build(
            "sha256:bbb",
            FakeRuntime::default().with_instance("rt-old", ContainerStatus::Running),
            sample_container(Strategy::Recreate),
        )
        .await;

        // Simulate an open update left by another worker.
        let open = UpdateRecord::begin(
            "ctr_app",
            "ghcr.io/example/app:main",
            "ghcr.io/example/app:other",
            Strategy::Recreate,
            now(),
        );
        assert!(stores.updates.try_begin(&open).await.unwrap());

        let err = orchestrator
            .trigger_update("ctr_app", UpdateOptions::default(), &CancelSignal::none())
            .await
            .unwrap_err();
        assert!(matches!(err, StewardError::AlreadyRunning { .. }));
    }

    #[tokio::test]
    async fn blue_green_keeps_the_old_instance_stopped() {
        let (orchestrator, stores, runtime) = build(
            "sha256:bbb",
            FakeRuntime::default().with_instance("rt-old", ContainerStatus::Running),
            sample_container(Strategy::BlueGreen),
        )
        .await;

        let record = orchestrator
            .trigger_update("ctr_app", UpdateOptions::default(), &CancelSignal::none())
            .await
            .unwrap();

        assert_eq!(record.status, UpdateStatus::Completed);
        // Old instance retained for manual cleanup, stopped.
        assert_eq!(runtime.status_of("rt-old"), Some(ContainerStatus::Exited));
        let updated = stores.containers.get("ctr_app").await.unwrap();
        assert_eq!(updated.runtime_id.as_deref(), Some("rt-0"));
        assert!(
            runtime
                .calls()
                .contains(&"create app-green ghcr.io/example/app:main".to_string())
        );
    }

    #[tokio::test]
    async fn forced_update_with_same_digest_still_applies() {
        let (orchestrator, _stores, runtime) = build(
            "sha256:aaa",
            FakeRuntime::default().with_instance("rt-old", ContainerStatus::Running),
            sample_container(Strategy::Recreate),
        )
        .await;

        let record = orchestrator
            .trigger_update(
                "ctr_app",
                UpdateOptions {
                    force: true,
                    ..UpdateOptions::default()
                },
                &CancelSignal::none(),
            )
            .await
            .unwrap();

        assert_eq!(record.status, UpdateStatus::Completed);
        assert!(!runtime.calls().is_empty());
    }
}
