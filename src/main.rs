use std::env;
use std::process;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::json;
use sqlx::SqlitePool;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use container_steward::clock::{Clock, SystemClock};
use container_steward::config::Config;
use container_steward::error::{Result, StewardError};
use container_steward::executor::{CancelSignal, TaskDispatcher};
use container_steward::model::{
    Container, ContainerStatus, Strategy, Task, TaskParams, UpdatePolicy,
};
use container_steward::orchestrator::{
    OrchestratorConfig, UpdateOptions, UpdateOrchestrator,
};
use container_steward::registry::{DigestResolver, HttpRegistryClient};
use container_steward::runtime::PodmanRuntime;
use container_steward::scheduler::Scheduler;
use container_steward::store::{self, Stores};

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let mut args = env::args();
    let exe = args.next().unwrap_or_else(|| "container-steward".into());
    let command = args.next().unwrap_or_else(|| "scheduler".into());
    let remaining: Vec<String> = args.collect();

    let runtime = tokio::runtime::Runtime::new().unwrap_or_else(|err| {
        eprintln!("failed to start runtime: {err}");
        process::exit(1);
    });

    let outcome = runtime.block_on(async {
        match command.as_str() {
            "scheduler" => run_scheduler().await,
            "trigger" => run_trigger(&remaining).await,
            "update" => run_update(&remaining).await,
            "prune" => run_prune(&remaining).await,
            "seed-demo" => run_seed_demo().await,
            "help" | "--help" | "-h" => {
                print_usage(&exe);
                Ok(())
            }
            other => {
                eprintln!("unknown command: {other}");
                print_usage(&exe);
                process::exit(2);
            }
        }
    });

    if let Err(err) = outcome {
        error!(%err, code = err.code(), "command failed");
        process::exit(1);
    }
}

fn print_usage(exe: &str) {
    eprintln!(
        "usage: {exe} <command> [options]\n\
         \n\
         commands:\n\
         \x20 scheduler                      run the task scheduler until SIGINT/SIGTERM\n\
         \x20 trigger <task-id>              run one task now and wait for the outcome\n\
         \x20 update <container> [--image REF] [--strategy recreate|rolling|blue-green]\n\
         \x20                    [--force] [--no-rollback]\n\
         \x20 prune [--retention-secs N] [--dry-run]\n\
         \x20 seed-demo                      insert a deterministic demo dataset\n\
         \x20 help                           show this text"
    );
}

struct App {
    cfg: Config,
    pool: SqlitePool,
    stores: Stores,
    clock: Arc<SystemClock>,
    scheduler: Scheduler,
    orchestrator: Arc<UpdateOrchestrator>,
}

async fn build_app() -> Result<App> {
    let cfg = Config::from_env();
    let pool = store::open_pool(&cfg.db_url).await?;
    let stores = Stores::sqlite(pool.clone());
    let clock = Arc::new(SystemClock);

    let runtime = Arc::new(PodmanRuntime::new());
    if let Err(err) = runtime.health().await {
        warn!(%err, "container runtime not reachable; runtime operations will fail");
    }

    let registry = Arc::new(HttpRegistryClient::new(cfg.registry_auth_path.clone()));
    let resolver = Arc::new(DigestResolver::new(
        stores.image_versions.clone(),
        registry,
        clock.clone(),
        cfg.digest_ttl_secs,
    ));
    let orchestrator = Arc::new(UpdateOrchestrator::new(
        stores.containers.clone(),
        stores.updates.clone(),
        runtime.clone(),
        resolver.clone(),
        stores.events.clone(),
        clock.clone(),
        OrchestratorConfig::from_config(&cfg),
    ));
    let dispatcher = Arc::new(TaskDispatcher::standard(
        stores.clone(),
        runtime,
        resolver,
        orchestrator.clone(),
        clock.clone(),
        &cfg,
    ));
    let scheduler = Scheduler::new(stores.clone(), dispatcher, clock.clone(), &cfg);

    Ok(App {
        cfg,
        pool,
        stores,
        clock,
        scheduler,
        orchestrator,
    })
}

async fn run_scheduler() -> Result<()> {
    let app = build_app().await?;
    app.scheduler.start().await?;
    info!(db = %app.cfg.db_url, "scheduler running; waiting for shutdown signal");

    wait_for_shutdown_signal().await;
    info!("shutdown signal received");
    app.scheduler.stop().await?;
    Ok(())
}

async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        let mut term = match signal(SignalKind::terminate()) {
            Ok(term) => term,
            Err(err) => {
                warn!(%err, "SIGTERM handler unavailable, falling back to ctrl-c only");
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = term.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

async fn run_trigger(args: &[String]) -> Result<()> {
    let task_id = args
        .first()
        .filter(|value| !value.starts_with("--"))
        .ok_or_else(|| StewardError::Internal("trigger requires a task id".into()))?;

    let app = build_app().await?;
    app.scheduler.start().await?;
    let execution = match app.scheduler.trigger_task(task_id).await {
        Ok(execution) => execution,
        Err(err) => {
            let _ = app.scheduler.stop().await;
            return Err(err);
        }
    };
    info!(execution_id = %execution.id, task_id = %task_id, "execution dispatched");

    // Wait for the run to settle, then report it.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(600);
    let settled = loop {
        let current = app.stores.executions.get(&execution.id).await?;
        if current.status.is_terminal() {
            break current;
        }
        if tokio::time::Instant::now() >= deadline {
            warn!(execution_id = %execution.id, "gave up waiting for the execution to settle");
            break current;
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
    };
    app.scheduler.stop().await?;

    println!(
        "{}",
        json!({
            "execution_id": settled.id,
            "task_id": settled.task_id,
            "status": settled.status.as_str(),
            "error": settled.error,
        })
    );
    Ok(())
}

async fn run_update(args: &[String]) -> Result<()> {
    let container_ref = args
        .first()
        .filter(|value| !value.starts_with("--"))
        .ok_or_else(|| StewardError::Internal("update requires a container id or name".into()))?;

    let mut opts = UpdateOptions::default();
    let mut index = 1;
    while index < args.len() {
        match args[index].as_str() {
            "--image" => {
                opts.target = Some(
                    args.get(index + 1)
                        .cloned()
                        .ok_or_else(|| StewardError::Internal("--image needs a value".into()))?,
                );
                index += 2;
            }
            "--strategy" => {
                let raw = args
                    .get(index + 1)
                    .ok_or_else(|| StewardError::Internal("--strategy needs a value".into()))?;
                opts.strategy = Some(match raw.as_str() {
                    "recreate" => Strategy::Recreate,
                    "rolling" => Strategy::Rolling,
                    "blue-green" => Strategy::BlueGreen,
                    other => {
                        return Err(StewardError::Internal(format!(
                            "unknown strategy: {other}"
                        )));
                    }
                });
                index += 2;
            }
            "--force" => {
                opts.force = true;
                index += 1;
            }
            "--no-rollback" => {
                opts.rollback_on_failure = false;
                index += 1;
            }
            other => {
                return Err(StewardError::Internal(format!("unknown option: {other}")));
            }
        }
    }

    let app = build_app().await?;
    let container = match app.stores.containers.get(container_ref).await {
        Ok(container) => container,
        Err(StewardError::NotFound { .. }) => {
            app.stores.containers.get_by_name(container_ref).await?
        }
        Err(err) => return Err(err),
    };

    let record = app
        .orchestrator
        .trigger_update(&container.id, opts, &CancelSignal::none())
        .await?;
    println!(
        "{}",
        json!({
            "record_id": record.id,
            "container_id": record.container_id,
            "from": record.from_ref,
            "to": record.to_ref,
            "strategy": record.strategy.as_str(),
            "status": record.status.as_str(),
            "error": record.error,
        })
    );
    Ok(())
}

async fn run_prune(args: &[String]) -> Result<()> {
    let mut retention_secs: Option<u64> = None;
    let mut dry_run = false;
    let mut index = 0;
    while index < args.len() {
        match args[index].as_str() {
            "--retention-secs" => {
                let raw = args.get(index + 1).ok_or_else(|| {
                    StewardError::Internal("--retention-secs needs a value".into())
                })?;
                retention_secs = Some(raw.parse::<u64>().map_err(|_| {
                    StewardError::Internal(format!("bad --retention-secs value: {raw}"))
                })?);
                index += 2;
            }
            "--dry-run" => {
                dry_run = true;
                index += 1;
            }
            other => {
                return Err(StewardError::Internal(format!("unknown option: {other}")));
            }
        }
    }

    let app = build_app().await?;
    let retention = retention_secs.unwrap_or(app.cfg.retention_secs).max(1);
    let cutoff = app.clock.now() - chrono::Duration::seconds(retention as i64);
    let cutoff_secs = cutoff.timestamp();

    if dry_run {
        let executions: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM executions
             WHERE status IN ('success', 'failed', 'cancelled') AND completed_at < ?",
        )
        .bind(cutoff_secs)
        .fetch_one(&app.pool)
        .await
        .map_err(StewardError::from)?;
        let cache_rows: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM image_versions WHERE checked_at < ?")
                .bind(cutoff_secs)
                .fetch_one(&app.pool)
                .await
                .map_err(StewardError::from)?;
        let events: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM event_log WHERE ts < ?")
            .bind(cutoff_secs)
            .fetch_one(&app.pool)
            .await
            .map_err(StewardError::from)?;
        println!(
            "{}",
            json!({
                "dry_run": true,
                "retention_secs": retention,
                "executions": executions,
                "cache_rows": cache_rows,
                "events": events,
            })
        );
        return Ok(());
    }

    let executions = app.stores.executions.prune_terminal_before(cutoff).await?;
    let cache_rows = app.stores.image_versions.prune_before(cutoff).await?;
    let events = app.stores.events.prune_before(cutoff).await?;
    println!(
        "{}",
        json!({
            "retention_secs": retention,
            "executions_pruned": executions,
            "cache_rows_pruned": cache_rows,
            "events_pruned": events,
        })
    );
    Ok(())
}

/// Deterministic demo dataset. Idempotent: demo rows are keyed with a
/// `demo-` prefix and replaced on each run.
async fn run_seed_demo() -> Result<()> {
    let app = build_app().await?;
    let now = Utc::now();

    for table in ["tasks", "containers"] {
        sqlx::query(&format!("DELETE FROM {table} WHERE id LIKE 'demo-%'"))
            .execute(&app.pool)
            .await
            .map_err(StewardError::from)?;
    }

    let containers = vec![
        Container {
            id: "demo-ctr-alpha".into(),
            name: "svc-alpha".into(),
            image: "ghcr.io/example/svc-alpha".into(),
            tag: "main".into(),
            digest: Some("sha256:1111111111111111".into()),
            status: ContainerStatus::Running,
            update_policy: UpdatePolicy::Auto,
            strategy: Strategy::Rolling,
            health: Some(container_steward::model::HealthProbe::Http {
                url: "http://127.0.0.1:8081/healthz".into(),
            }),
            runtime_id: Some("demo-rt-alpha".into()),
            last_auto_update: None,
            created_by: Some("demo".into()),
            created_at: now,
        },
        Container {
            id: "demo-ctr-beta".into(),
            name: "svc-beta".into(),
            image: "ghcr.io/example/svc-beta".into(),
            tag: "stable".into(),
            digest: Some("sha256:2222222222222222".into()),
            status: ContainerStatus::Running,
            update_policy: UpdatePolicy::Manual,
            strategy: Strategy::Recreate,
            health: None,
            runtime_id: Some("demo-rt-beta".into()),
            last_auto_update: None,
            created_by: Some("demo".into()),
            created_at: now,
        },
    ];
    for container in &containers {
        app.stores.containers.insert(container).await?;
    }

    let tasks = vec![
        Task {
            id: "demo-task-check".into(),
            name: "check images every 15 minutes".into(),
            schedule: "*/15 * * * *".into(),
            params: TaskParams::ImageCheck {
                containers: vec![],
                force_refresh: false,
            },
            enabled: true,
            next_run: container_steward::cron::CronExpr::parse("*/15 * * * *")
                .ok()
                .and_then(|expr| expr.next_after(now)),
            last_run: None,
            created_by: Some("demo".into()),
            created_at: now,
        },
        Task {
            id: "demo-task-cleanup".into(),
            name: "nightly cleanup".into(),
            schedule: "0 3 * * *".into(),
            params: TaskParams::Cleanup {
                retention_secs: None,
            },
            enabled: true,
            next_run: container_steward::cron::CronExpr::parse("0 3 * * *")
                .ok()
                .and_then(|expr| expr.next_after(now)),
            last_run: None,
            created_by: Some("demo".into()),
            created_at: now,
        },
        Task {
            id: "demo-task-backup".into(),
            name: "weekly backup".into(),
            schedule: "0 4 * * 0".into(),
            params: TaskParams::Backup { keep: None },
            enabled: true,
            next_run: container_steward::cron::CronExpr::parse("0 4 * * 0")
                .ok()
                .and_then(|expr| expr.next_after(now)),
            last_run: None,
            created_by: Some("demo".into()),
            created_at: now,
        },
        Task {
            id: "demo-task-health".into(),
            name: "hourly health sweep".into(),
            schedule: "0 * * * *".into(),
            params: TaskParams::HealthCheck { containers: vec![] },
            enabled: false,
            next_run: None,
            last_run: None,
            created_by: Some("demo".into()),
            created_at: now,
        },
    ];
    for task in &tasks {
        app.stores.tasks.insert(task).await?;
    }

    println!(
        "{}",
        json!({
            "containers": containers.len(),
            "tasks": tasks.len(),
        })
    );
    Ok(())
}
