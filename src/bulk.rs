use std::sync::Arc;

use tracing::{info, warn};

use crate::error::StewardError;
use crate::executor::CancelSignal;
use crate::model::{Container, ContainerStatus, OperationResult, Strategy, UpdateStatus};
use crate::orchestrator::{UpdateOptions, UpdateOrchestrator};
use crate::runtime::{ContainerRuntime, ContainerSpec};
use crate::store::ContainerStore;

#[derive(Clone, Debug)]
pub enum BulkAction {
    Start,
    Stop,
    Restart,
    Update {
        target: Option<String>,
        strategy: Option<Strategy>,
        force: bool,
    },
}

impl BulkAction {
    fn name(&self) -> &'static str {
        match self {
            BulkAction::Start => "start",
            BulkAction::Stop => "stop",
            BulkAction::Restart => "restart",
            BulkAction::Update { .. } => "update",
        }
    }
}

/// Applies one action to N containers independently: best-effort fan-out,
/// one result per input id, input order, no all-or-nothing semantics.
pub struct BulkCoordinator {
    containers: Arc<dyn ContainerStore>,
    runtime: Arc<dyn ContainerRuntime>,
    orchestrator: Arc<UpdateOrchestrator>,
}

impl BulkCoordinator {
    pub fn new(
        containers: Arc<dyn ContainerStore>,
        runtime: Arc<dyn ContainerRuntime>,
        orchestrator: Arc<UpdateOrchestrator>,
    ) -> Self {
        Self {
            containers,
            runtime,
            orchestrator,
        }
    }

    pub async fn apply_to_many(
        &self,
        container_ids: &[String],
        action: &BulkAction,
        cancel: &CancelSignal,
    ) -> Vec<OperationResult> {
        let mut results = Vec::with_capacity(container_ids.len());

        for id in container_ids {
            if cancel.is_cancelled() {
                results.push(OperationResult {
                    container_id: id.clone(),
                    success: false,
                    message: format!("{} not attempted", action.name()),
                    error: Some("cancelled".to_string()),
                });
                continue;
            }

            let result = match self.apply_one(id, action, cancel).await {
                Ok(message) => OperationResult {
                    container_id: id.clone(),
                    success: true,
                    message,
                    error: None,
                },
                Err(err) => {
                    warn!(container_id = %id, action = action.name(), %err, "bulk item failed");
                    OperationResult {
                        container_id: id.clone(),
                        success: false,
                        message: format!("{} failed", action.name()),
                        error: Some(err.to_string()),
                    }
                }
            };
            results.push(result);
        }

        let succeeded = results.iter().filter(|r| r.success).count();
        info!(
            action = action.name(),
            total = results.len(),
            succeeded,
            "bulk operation done"
        );
        results
    }

    async fn apply_one(
        &self,
        id: &str,
        action: &BulkAction,
        cancel: &CancelSignal,
    ) -> crate::error::Result<String> {
        let container = self.containers.get(id).await?;
        match action {
            BulkAction::Start => self.start_one(container).await,
            BulkAction::Stop => self.stop_one(container).await,
            BulkAction::Restart => self.restart_one(container).await,
            BulkAction::Update {
                target,
                strategy,
                force,
            } => {
                // Fallback carried over from the original bulk endpoint: an
                // update with no image payload refreshes the container in
                // place instead of entering the image-update path.
                if target.is_none() && !force {
                    let message = self.restart_one(container).await?;
                    return Ok(format!("{message} (no image payload, refreshed in place)"));
                }

                let record = self
                    .orchestrator
                    .trigger_update(
                        id,
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
                    UpdateStatus::Completed => Ok(format!("updated to {}", record.to_ref)),
                    status => Err(StewardError::Internal(format!(
                        "update {} ({}): {}",
                        record.id,
                        status.as_str(),
                        record.error.unwrap_or_else(|| "no detail".into())
                    ))),
                }
            }
        }
    }

    async fn start_one(&self, mut container: Container) -> crate::error::Result<String> {
        let runtime_id = match &container.runtime_id {
            Some(runtime_id) => runtime_id.clone(),
            None => {
                // Never materialized: create the instance first.
                let spec = ContainerSpec {
                    name: container.name.clone(),
                    image_ref: container.image_ref(),
                };
                let created = self
                    .runtime
                    .create(&spec)
                    .await
                    .map_err(|err| StewardError::RuntimeUnavailable(err.to_string()))?;
                container.runtime_id = Some(created.clone());
                created
            }
        };
        self.runtime
            .start(&runtime_id)
            .await
            .map_err(|err| StewardError::RuntimeUnavailable(err.to_string()))?;
        container.status = ContainerStatus::Running;
        self.containers.save(&container).await?;
        Ok("started".to_string())
    }

    async fn stop_one(&self, mut container: Container) -> crate::error::Result<String> {
        let Some(runtime_id) = container.runtime_id.clone() else {
            return Err(StewardError::RuntimeUnavailable(
                "no runtime instance".to_string(),
            ));
        };
        self.runtime
            .stop(&runtime_id)
            .await
            .map_err(|err| StewardError::RuntimeUnavailable(err.to_string()))?;
        container.status = ContainerStatus::Exited;
        self.containers.save(&container).await?;
        Ok("stopped".to_string())
    }

    async fn restart_one(&self, mut container: Container) -> crate::error::Result<String> {
        let Some(runtime_id) = container.runtime_id.clone() else {
            return Err(StewardError::RuntimeUnavailable(
                "no runtime instance".to_string(),
            ));
        };
        self.runtime
            .stop(&runtime_id)
            .await
            .map_err(|err| StewardError::RuntimeUnavailable(err.to_string()))?;
        self.runtime
            .start(&runtime_id)
            .await
            .map_err(|err| StewardError::RuntimeUnavailable(err.to_string()))?;
        container.status = ContainerStatus::Running;
        self.containers.save(&container).await?;
        Ok("restarted".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::model::{HealthProbe, UpdatePolicy};
    use crate::orchestrator::OrchestratorConfig;
    use crate::registry::{DigestResolver, ImageRef, RegistryClient, RegistryError};
    use crate::runtime::{HealthState, RuntimeError};
    use crate::store::{Stores, open_memory_pool};
    use async_trait::async_trait;
    use chrono::TimeZone;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Default)]
    struct RecordingRuntime {
        calls: Mutex<Vec<String>>,
        statuses: Mutex<HashMap<String, ContainerStatus>>,
        fail_start: Mutex<Vec<String>>,
    }

    impl RecordingRuntime {
        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }

        fn push(&self, call: String) {
            self.calls.lock().unwrap().push(call);
        }
    }

    #[async_trait]
    impl ContainerRuntime for RecordingRuntime {
        async fn pull(&self, image_ref: &str) -> Result<(), RuntimeError> {
            self.push(format!("pull {image_ref}"));
            Ok(())
        }
        async fn create(&self, spec: &ContainerSpec) -> Result<String, RuntimeError> {
            self.push(format!("create {}", spec.name));
            Ok(format!("rt-{}", spec.name))
        }
        async fn start(&self, id: &str) -> Result<(), RuntimeError> {
            self.push(format!("start {id}"));
            if self.fail_start.lock().unwrap().iter().any(|x| x == id) {
                return Err(RuntimeError::CommandFailed {
                    command: format!("start {id}"),
                    exit: "125".into(),
                    stderr: "broken".into(),
                });
            }
            self.statuses
                .lock()
                .unwrap()
                .insert(id.to_string(), ContainerStatus::Running);
            Ok(())
        }
        async fn stop(&self, id: &str) -> Result<(), RuntimeError> {
            self.push(format!("stop {id}"));
            self.statuses
                .lock()
                .unwrap()
                .insert(id.to_string(), ContainerStatus::Exited);
            Ok(())
        }
        async fn remove(&self, id: &str) -> Result<(), RuntimeError> {
            self.push(format!("remove {id}"));
            self.statuses.lock().unwrap().remove(id);
            Ok(())
        }
        async fn rename(&self, id: &str, new_name: &str) -> Result<(), RuntimeError> {
            self.push(format!("rename {id} {new_name}"));
            Ok(())
        }
        async fn inspect_status(&self, id: &str) -> Result<ContainerStatus, RuntimeError> {
            Ok(self
                .statuses
                .lock()
                .unwrap()
                .get(id)
                .copied()
                .unwrap_or(ContainerStatus::Running))
        }
        async fn probe_health(
            &self,
            _id: &str,
            _probe: &HealthProbe,
        ) -> Result<HealthState, RuntimeError> {
            Ok(HealthState::Healthy)
        }
        async fn prune_images(&self) -> Result<(), RuntimeError> {
            Ok(())
        }
    }

    struct FixedRegistry;

    #[async_trait]
    impl RegistryClient for FixedRegistry {
        async fn resolve_digest(&self, _image: &ImageRef) -> Result<String, RegistryError> {
            Ok("sha256:new".to_string())
        }
    }

    fn now() -> chrono::DateTime<chrono::Utc> {
        chrono::Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap()
    }

    fn container(id: &str, runtime_id: Option<&str>) -> Container {
        Container {
            id: id.into(),
            name: format!("svc-{id}"),
            image: "ghcr.io/example/svc".into(),
            tag: "main".into(),
            digest: Some("sha256:old".into()),
            status: ContainerStatus::Running,
            update_policy: UpdatePolicy::Manual,
            strategy: Strategy::Recreate,
            health: None,
            runtime_id: runtime_id.map(String::from),
            last_auto_update: None,
            created_by: None,
            created_at: now(),
        }
    }

    async fn coordinator() -> (BulkCoordinator, Stores, Arc<RecordingRuntime>) {
        let stores = Stores::sqlite(open_memory_pool().await.unwrap());
        let runtime = Arc::new(RecordingRuntime::default());
        let clock = Arc::new(ManualClock::at(now()));
        let resolver = Arc::new(DigestResolver::new(
            stores.image_versions.clone(),
            Arc::new(FixedRegistry),
            clock.clone(),
            600,
        ));
        let orchestrator = Arc::new(UpdateOrchestrator::new(
            stores.containers.clone(),
            stores.updates.clone(),
            runtime.clone(),
            resolver,
            stores.events.clone(),
            clock,
            OrchestratorConfig {
                max_pull_retries: 3,
                pull_retry_delay: Duration::from_millis(1),
                health_timeout: Duration::from_millis(50),
                health_poll: Duration::from_millis(1),
            },
        ));
        let coordinator = BulkCoordinator::new(
            stores.containers.clone(),
            runtime.clone(),
            orchestrator,
        );
        (coordinator, stores, runtime)
    }

    #[tokio::test]
    async fn one_failure_does_not_abort_the_batch() {
        let (coordinator, stores, runtime) = coordinator().await;
        stores
            .containers
            .insert(&container("ctr_a", Some("rt-a")))
            .await
            .unwrap();
        stores
            .containers
            .insert(&container("ctr_c", Some("rt-c")))
            .await
            .unwrap();
        runtime.fail_start.lock().unwrap().push("rt-a".into());

        let ids = vec![
            "ctr_a".to_string(),
            "ctr_missing".to_string(),
            "ctr_c".to_string(),
        ];
        let results = coordinator
            .apply_to_many(&ids, &BulkAction::Restart, &CancelSignal::none())
            .await;

        assert_eq!(results.len(), ids.len());
        assert_eq!(results[0].container_id, "ctr_a");
        assert!(!results[0].success);
        assert!(!results[1].success);
        assert!(results[1].error.as_deref().unwrap().contains("not found"));
        assert!(results[2].success);
        assert_eq!(results[2].message, "restarted");
    }

    #[tokio::test]
    async fn start_materializes_missing_instances() {
        let (coordinator, stores, runtime) = coordinator().await;
        stores
            .containers
            .insert(&container("ctr_new", None))
            .await
            .unwrap();

        let results = coordinator
            .apply_to_many(
                &["ctr_new".to_string()],
                &BulkAction::Start,
                &CancelSignal::none(),
            )
            .await;

        assert!(results[0].success);
        assert_eq!(
            runtime.calls(),
            vec!["create svc-ctr_new", "start rt-svc-ctr_new"]
        );
        let saved = stores.containers.get("ctr_new").await.unwrap();
        assert_eq!(saved.runtime_id.as_deref(), Some("rt-svc-ctr_new"));
        assert_eq!(saved.status, ContainerStatus::Running);
    }

    #[tokio::test]
    async fn update_without_payload_refreshes_in_place() {
        let (coordinator, stores, runtime) = coordinator_with_container().await;
        let results = coordinator
            .apply_to_many(
                &["ctr_a".to_string()],
                &BulkAction::Update {
                    target: None,
                    strategy: None,
                    force: false,
                },
                &CancelSignal::none(),
            )
            .await;

        assert!(results[0].success, "{:?}", results[0]);
        assert!(results[0].message.contains("refreshed in place"));
        // Plain stop/start, no image pull, no update record.
        assert_eq!(runtime.calls(), vec!["stop rt-a", "start rt-a"]);
        assert!(
            stores
                .updates
                .list_for_container("ctr_a", 10)
                .await
                .unwrap()
                .is_empty()
        );
    }

    async fn coordinator_with_container() -> (BulkCoordinator, Stores, Arc<RecordingRuntime>) {
        let (coordinator, stores, runtime) = coordinator().await;
        stores
            .containers
            .insert(&container("ctr_a", Some("rt-a")))
            .await
            .unwrap();
        (coordinator, stores, runtime)
    }

    #[tokio::test]
    async fn update_with_target_goes_through_the_orchestrator() {
        let (coordinator, stores, runtime) = coordinator_with_container().await;

        let results = coordinator
            .apply_to_many(
                &["ctr_a".to_string()],
                &BulkAction::Update {
                    target: Some("ghcr.io/example/svc:v2".to_string()),
                    strategy: None,
                    force: false,
                },
                &CancelSignal::none(),
            )
            .await;

        assert!(results[0].success, "{:?}", results[0]);
        assert!(
            runtime
                .calls()
                .contains(&"pull ghcr.io/example/svc:v2".to_string())
        );
        let records = stores.updates.list_for_container("ctr_a", 10).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].status, UpdateStatus::Completed);
    }

    #[tokio::test]
    async fn cancellation_fills_remaining_results() {
        let (coordinator, stores, _runtime) = coordinator_with_container().await;
        stores
            .containers
            .insert(&container("ctr_b", Some("rt-b")))
            .await
            .unwrap();

        let (tx, rx) = tokio::sync::watch::channel(true);
        drop(tx);
        let cancelled = CancelSignal::new(rx);

        let ids = vec!["ctr_a".to_string(), "ctr_b".to_string()];
        let results = coordinator
            .apply_to_many(&ids, &BulkAction::Stop, &cancelled)
            .await;

        assert_eq!(results.len(), ids.len());
        assert!(results.iter().all(|r| !r.success));
        assert!(
            results
                .iter()
                .all(|r| r.error.as_deref() == Some("cancelled"))
        );
    }
}
