use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::DateTime;
use chrono::Utc;
use serde_json::json;
use tokio::sync::{Notify, Semaphore, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::clock::Clock;
use crate::config::Config;
use crate::cron::CronExpr;
use crate::error::{Result, StewardError};
use crate::executor::{CancelSignal, TaskDispatcher};
use crate::model::{Execution, ExecutionStatus, Task};
use crate::store::Stores;

const ABANDONED_EXECUTION_ERROR: &str = "stop-grace-exceeded";
const ABANDONED_UPDATE_ERROR: &str = "interrupted-by-restart";

#[derive(Clone, Copy, Debug)]
pub struct SchedulerStatus {
    pub running: bool,
    pub active_executions: u64,
}

enum LoopState {
    Stopped,
    Running {
        shutdown: watch::Sender<bool>,
        handle: JoinHandle<()>,
    },
}

/// The scheduler control loop: polls the task store for due tasks and
/// dispatches each to a bounded worker pool. Owns its lifecycle — `start`
/// and `stop` move it between the two states, nothing runs outside them.
pub struct Scheduler {
    inner: Arc<SchedulerInner>,
}

struct SchedulerInner {
    stores: Stores,
    dispatcher: Arc<TaskDispatcher>,
    clock: Arc<dyn Clock>,
    poll_interval: Duration,
    stop_grace: Duration,
    max_ticks: Option<u64>,
    semaphore: Arc<Semaphore>,
    active: AtomicU64,
    idle: Notify,
    state: Mutex<LoopState>,
}

impl Scheduler {
    pub fn new(
        stores: Stores,
        dispatcher: Arc<TaskDispatcher>,
        clock: Arc<dyn Clock>,
        cfg: &Config,
    ) -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                stores,
                dispatcher,
                clock,
                poll_interval: cfg.poll_interval,
                stop_grace: cfg.stop_grace,
                max_ticks: cfg.max_ticks,
                semaphore: Arc::new(Semaphore::new(cfg.max_concurrent)),
                active: AtomicU64::new(0),
                idle: Notify::new(),
                state: Mutex::new(LoopState::Stopped),
            }),
        }
    }

    /// Stopped → Running. Reconciles executions and update records abandoned
    /// by a previous process before the first poll.
    pub async fn start(&self) -> Result<()> {
        // Reject a double start before reconciliation: abandoned-row cleanup
        // on a live scheduler would fail its in-flight executions.
        {
            let state = self.inner.state.lock().unwrap_or_else(|e| e.into_inner());
            if matches!(*state, LoopState::Running { .. }) {
                return Err(StewardError::AlreadyRunning {
                    subject: "scheduler".to_string(),
                });
            }
        }

        let now = self.inner.clock.now();
        let abandoned = self
            .inner
            .stores
            .executions
            .mark_abandoned(ABANDONED_EXECUTION_ERROR, now)
            .await?;
        let stale_updates = self
            .inner
            .stores
            .updates
            .mark_abandoned(ABANDONED_UPDATE_ERROR, now)
            .await?;
        if abandoned > 0 || stale_updates > 0 {
            warn!(abandoned, stale_updates, "reconciled abandoned rows on startup");
            self.inner
                .event(
                    "scheduler-reconcile",
                    200,
                    json!({ "executions": abandoned, "update_records": stale_updates }),
                )
                .await;
        }

        let mut state = self.inner.state.lock().unwrap_or_else(|e| e.into_inner());
        if matches!(*state, LoopState::Running { .. }) {
            return Err(StewardError::AlreadyRunning {
                subject: "scheduler".to_string(),
            });
        }
        let (shutdown, shutdown_rx) = watch::channel(false);
        let inner = self.inner.clone();
        let handle = tokio::spawn(async move { inner.run_loop(shutdown_rx).await });
        *state = LoopState::Running { shutdown, handle };
        info!(
            poll_interval_secs = self.inner.poll_interval.as_secs(),
            "scheduler started"
        );
        Ok(())
    }

    /// Running → Stopped. Signals cancellation to in-flight executions and
    /// waits for them to settle, bounded by the grace period; anything still
    /// running after that is left for startup reconciliation.
    pub async fn stop(&self) -> Result<()> {
        let (shutdown, handle) = {
            let mut state = self.inner.state.lock().unwrap_or_else(|e| e.into_inner());
            match std::mem::replace(&mut *state, LoopState::Stopped) {
                LoopState::Running { shutdown, handle } => (shutdown, handle),
                LoopState::Stopped => return Err(StewardError::SchedulerNotRunning),
            }
        };

        let _ = shutdown.send(true);
        if let Err(err) = handle.await {
            error!(%err, "poll loop join failed");
        }

        match tokio::time::timeout(self.inner.stop_grace, self.inner.wait_idle()).await {
            Ok(()) => info!("scheduler stopped, all executions settled"),
            Err(_) => {
                let left = self.inner.active.load(Ordering::SeqCst);
                warn!(
                    active = left,
                    grace_secs = self.inner.stop_grace.as_secs(),
                    "stop grace elapsed with executions still in flight"
                );
                self.inner
                    .event(
                        "scheduler-stop-abandoned",
                        500,
                        json!({ "active": left, "grace_secs": self.inner.stop_grace.as_secs() }),
                    )
                    .await;
            }
        }
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        matches!(
            *self.inner.state.lock().unwrap_or_else(|e| e.into_inner()),
            LoopState::Running { .. }
        )
    }

    pub fn status(&self) -> SchedulerStatus {
        SchedulerStatus {
            running: self.is_running(),
            active_executions: self.inner.active.load(Ordering::SeqCst),
        }
    }

    /// Manual run, outside the schedule. Same single-flight rules as the
    /// poll path, but violations surface as errors instead of silent skips.
    pub async fn trigger_task(&self, task_id: &str) -> Result<Execution> {
        let cancel = {
            let state = self.inner.state.lock().unwrap_or_else(|e| e.into_inner());
            match &*state {
                LoopState::Running { shutdown, .. } => CancelSignal::new(shutdown.subscribe()),
                LoopState::Stopped => return Err(StewardError::SchedulerNotRunning),
            }
        };
        let task = self.inner.stores.tasks.get(task_id).await?;
        let now = self.inner.clock.now();
        self.inner.clone().launch(task, now, cancel).await
    }
}

impl SchedulerInner {
    async fn run_loop(self: Arc<Self>, mut shutdown_rx: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut ticks: u64 = 0;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    ticks += 1;
                    if let Err(err) = self.clone().tick(&shutdown_rx).await {
                        error!(%err, "poll tick failed");
                    }
                    if let Some(max) = self.max_ticks {
                        if ticks >= max {
                            info!(ticks, "max tick count reached, loop exiting");
                            break;
                        }
                    }
                }
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        debug!("poll loop shutting down");
                        break;
                    }
                }
            }
        }
    }

    async fn tick(self: Arc<Self>, shutdown_rx: &watch::Receiver<bool>) -> Result<()> {
        let now = self.clock.now();
        let due = self.stores.tasks.list_due(now).await?;
        if due.is_empty() {
            debug!("tick: nothing due");
            return Ok(());
        }

        let mut dispatched = 0usize;
        for task in due {
            let scheduled_for = task.next_run.unwrap_or(now);
            let cancel = CancelSignal::new(shutdown_rx.clone());
            match self.clone().launch(task, scheduled_for, cancel).await {
                Ok(_) => dispatched += 1,
                // Already running or slot consumed: skipped, not an error.
                Err(StewardError::AlreadyRunning { subject }) => {
                    debug!(%subject, "skipping dispatch, already in flight");
                }
                Err(err) => {
                    error!(%err, "dispatch failed");
                }
            }
        }
        if dispatched > 0 {
            self.event("scheduler-tick", 202, json!({ "dispatched": dispatched }))
                .await;
        }
        Ok(())
    }

    /// Single-flight check plus atomic claim of the `(task, scheduled_for)`
    /// slot, then hand-off to the worker pool.
    async fn launch(
        self: Arc<Self>,
        task: Task,
        scheduled_for: DateTime<Utc>,
        cancel: CancelSignal,
    ) -> Result<Execution> {
        if let Some(open) = self.stores.executions.get_running(&task.id).await? {
            debug!(task_id = %task.id, execution_id = %open.id, "execution already open");
            return Err(StewardError::AlreadyRunning {
                subject: format!("task {}", task.id),
            });
        }

        let exec = Execution::pending(&task.id, scheduled_for);
        if !self.stores.executions.try_create(&exec).await? {
            // The slot exists and nothing is open, so a previous life already
            // ran (or abandoned) it. Advance the schedule past the slot so
            // the task does not wedge on the dedupe key forever.
            self.advance_schedule(&task.id).await;
            return Err(StewardError::AlreadyRunning {
                subject: format!("task {} slot {}", task.id, scheduled_for),
            });
        }

        self.active.fetch_add(1, Ordering::SeqCst);
        let inner = self.clone();
        let worker_exec = exec.clone();
        tokio::spawn(async move {
            // Bounded pool: wait for a slot before doing any work.
            let _permit = match inner.semaphore.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => {
                    inner.dec_active();
                    return;
                }
            };
            inner.run_one(task, worker_exec, cancel).await;
            inner.dec_active();
        });

        Ok(exec)
    }

    async fn run_one(&self, task: Task, exec: Execution, cancel: CancelSignal) {
        let started_at = self.clock.now();

        if cancel.is_cancelled() {
            // Shut down while queued for a permit; never ran.
            if let Err(err) = self
                .stores
                .executions
                .finish(&exec.id, ExecutionStatus::Cancelled, Some("cancelled"), started_at)
                .await
            {
                warn!(execution_id = %exec.id, %err, "cancel mark failed");
            }
            self.advance_schedule(&task.id).await;
            return;
        }

        if let Err(err) = self
            .stores
            .executions
            .mark_running(&exec.id, started_at)
            .await
        {
            // Reconciled or mutated underneath us; do not run twice.
            warn!(execution_id = %exec.id, %err, "could not mark running, skipping");
            return;
        }
        info!(task_id = %task.id, execution_id = %exec.id, kind = task.kind().as_str(), "execution started");

        // The dispatcher runs in its own tokio task so a panicking runner is
        // contained and converted to a failure instead of tearing the loop
        // down.
        let dispatcher = self.dispatcher.clone();
        let run_task = task.clone();
        let run_cancel = cancel.clone();
        let outcome =
            tokio::spawn(async move { dispatcher.dispatch(&run_task, &run_cancel).await }).await;

        let (status, error_text, summary) = match outcome {
            Ok(Ok(summary)) => (ExecutionStatus::Success, None, Some(summary)),
            Ok(Err(StewardError::Cancelled)) => (
                ExecutionStatus::Cancelled,
                Some("cancelled".to_string()),
                None,
            ),
            Ok(Err(err)) => (ExecutionStatus::Failed, Some(err.to_string()), None),
            Err(join_err) if join_err.is_panic() => (
                ExecutionStatus::Failed,
                Some(format!("runner panicked: {join_err}")),
                None,
            ),
            Err(join_err) => (
                ExecutionStatus::Failed,
                Some(format!("runner aborted: {join_err}")),
                None,
            ),
        };

        let completed_at = self.clock.now();
        if let Err(err) = self
            .stores
            .executions
            .finish(&exec.id, status, error_text.as_deref(), completed_at)
            .await
        {
            warn!(execution_id = %exec.id, %err, "finish mark failed");
        }

        match status {
            ExecutionStatus::Success => {
                info!(task_id = %task.id, execution_id = %exec.id, "execution succeeded");
            }
            _ => {
                warn!(
                    task_id = %task.id,
                    execution_id = %exec.id,
                    status = status.as_str(),
                    error = error_text.as_deref().unwrap_or(""),
                    "execution did not succeed"
                );
            }
        }
        self.event(
            "execution-finished",
            if status == ExecutionStatus::Success { 200 } else { 500 },
            json!({
                "task_id": task.id,
                "execution_id": exec.id,
                "status": status.as_str(),
                "error": error_text,
                "summary": summary,
            }),
        )
        .await;

        // Whatever the outcome, the schedule moves on.
        self.advance_schedule(&task.id).await;
    }

    /// Recompute `next_run` strictly after now and stamp `last_run`. Reloads
    /// the task first: the schedule may have been edited mid-run.
    async fn advance_schedule(&self, task_id: &str) {
        let now = self.clock.now();
        let mut task = match self.stores.tasks.get(task_id).await {
            Ok(task) => task,
            Err(StewardError::NotFound { .. }) => return,
            Err(err) => {
                warn!(task_id, %err, "task reload failed");
                return;
            }
        };

        task.last_run = Some(now);
        task.next_run = match CronExpr::parse(&task.schedule) {
            Ok(expr) => {
                let next = expr.next_after(now);
                if next.is_none() {
                    warn!(task_id, schedule = %task.schedule, "schedule has no future fire time");
                }
                next
            }
            Err(err) => {
                warn!(task_id, %err, "stored schedule no longer parses");
                None
            }
        };

        if let Err(err) = self.stores.tasks.save(&task).await {
            warn!(task_id, %err, "schedule advance save failed");
        }
    }

    fn dec_active(&self) {
        if self.active.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.idle.notify_waiters();
        }
    }

    async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            if self.active.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }

    async fn event(&self, action: &str, status: u16, meta: serde_json::Value) {
        if let Err(err) = self
            .stores
            .events
            .append(self.clock.now(), action, status, meta)
            .await
        {
            warn!(action, %err, "event append failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::executor::TaskRunner;
    use crate::model::{TaskKind, TaskParams, new_id};
    use crate::store::open_memory_pool;
    use async_trait::async_trait;
    use chrono::TimeZone;
    use serde_json::Value;
    use std::sync::atomic::AtomicU32;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 30).unwrap()
    }

    /// Runner whose behavior is scripted per test.
    struct StubRunner {
        kind: TaskKind,
        runs: AtomicU32,
        delay: Duration,
        panic: bool,
        fail: bool,
        respect_cancel: bool,
    }

    impl StubRunner {
        fn instant(kind: TaskKind) -> Self {
            Self {
                kind,
                runs: AtomicU32::new(0),
                delay: Duration::ZERO,
                panic: false,
                fail: false,
                respect_cancel: false,
            }
        }

        fn slow(kind: TaskKind, delay: Duration) -> Self {
            Self {
                delay,
                ..Self::instant(kind)
            }
        }
    }

    #[async_trait]
    impl TaskRunner for StubRunner {
        fn kind(&self) -> TaskKind {
            self.kind
        }

        async fn run(&self, _task: &Task, cancel: &CancelSignal) -> Result<Value> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            if self.panic {
                panic!("stub runner exploded");
            }
            if !self.delay.is_zero() {
                let deadline = tokio::time::Instant::now() + self.delay;
                while tokio::time::Instant::now() < deadline {
                    if self.respect_cancel && cancel.is_cancelled() {
                        return Err(StewardError::Cancelled);
                    }
                    tokio::time::sleep(Duration::from_millis(5)).await;
                }
            }
            if self.fail {
                return Err(StewardError::Internal("scripted failure".into()));
            }
            Ok(serde_json::json!({ "ok": true }))
        }
    }

    struct Fixture {
        scheduler: Scheduler,
        stores: Stores,
        clock: Arc<ManualClock>,
    }

    async fn fixture(runner: Arc<StubRunner>) -> Fixture {
        let stores = Stores::sqlite(open_memory_pool().await.unwrap());
        let clock = Arc::new(ManualClock::at(now()));
        let cfg = Config {
            poll_interval: Duration::from_millis(10),
            stop_grace: Duration::from_secs(2),
            max_concurrent: 2,
            ..Config::default()
        };
        let scheduler = Scheduler::new(
            stores.clone(),
            Arc::new(TaskDispatcher::new(vec![runner])),
            clock.clone(),
            &cfg,
        );
        Fixture {
            scheduler,
            stores,
            clock,
        }
    }

    fn cleanup_task(next_run: DateTime<Utc>) -> Task {
        Task {
            id: new_id("tsk"),
            name: "cleanup".into(),
            schedule: "*/5 * * * *".into(),
            params: TaskParams::Cleanup {
                retention_secs: None,
            },
            enabled: true,
            next_run: Some(next_run),
            last_run: None,
            created_by: None,
            created_at: now(),
        }
    }

    async fn wait_until<F>(what: &str, mut check: F)
    where
        F: AsyncFnMut() -> bool,
    {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        while tokio::time::Instant::now() < deadline {
            if check().await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("timed out waiting for {what}");
    }

    #[tokio::test]
    async fn lifecycle_transitions() {
        let fx = fixture(Arc::new(StubRunner::instant(TaskKind::Cleanup))).await;
        assert!(!fx.scheduler.is_running());
        assert!(matches!(
            fx.scheduler.stop().await,
            Err(StewardError::SchedulerNotRunning)
        ));

        fx.scheduler.start().await.unwrap();
        assert!(fx.scheduler.is_running());
        assert!(matches!(
            fx.scheduler.start().await,
            Err(StewardError::AlreadyRunning { .. })
        ));

        fx.scheduler.stop().await.unwrap();
        assert!(!fx.scheduler.is_running());
    }

    #[tokio::test]
    async fn due_task_runs_and_schedule_advances() {
        let runner = Arc::new(StubRunner::instant(TaskKind::Cleanup));
        let fx = fixture(runner.clone()).await;
        let task = cleanup_task(now());
        fx.stores.tasks.insert(&task).await.unwrap();

        fx.scheduler.start().await.unwrap();
        wait_until("task to run", async || {
            runner.runs.load(Ordering::SeqCst) >= 1
        })
        .await;
        wait_until("execution to settle", async || {
            let execs = fx
                .stores
                .executions
                .list_recent(Some(&task.id), 10)
                .await
                .unwrap();
            execs.first().is_some_and(|e| e.status == ExecutionStatus::Success)
        })
        .await;
        fx.scheduler.stop().await.unwrap();

        // Exactly one run: next_run advanced past the clock, which is frozen.
        assert_eq!(runner.runs.load(Ordering::SeqCst), 1);
        let saved = fx.stores.tasks.get(&task.id).await.unwrap();
        assert_eq!(saved.last_run, Some(now()));
        // 12:00:30 → next */5 slot at 12:05:00.
        assert_eq!(
            saved.next_run,
            Some(Utc.with_ymd_and_hms(2025, 6, 1, 12, 5, 0).unwrap())
        );
    }

    #[tokio::test]
    async fn disabled_tasks_never_dispatch() {
        let runner = Arc::new(StubRunner::instant(TaskKind::Cleanup));
        let fx = fixture(runner.clone()).await;
        let mut task = cleanup_task(now());
        task.enabled = false;
        fx.stores.tasks.insert(&task).await.unwrap();

        fx.scheduler.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;
        fx.scheduler.stop().await.unwrap();
        assert_eq!(runner.runs.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn concurrent_triggers_keep_single_flight() {
        let runner = Arc::new(StubRunner::slow(
            TaskKind::Cleanup,
            Duration::from_millis(200),
        ));
        let fx = fixture(runner.clone()).await;
        // No next_run: manual triggers only.
        let mut task = cleanup_task(now());
        task.next_run = None;
        fx.stores.tasks.insert(&task).await.unwrap();

        fx.scheduler.start().await.unwrap();
        fx.scheduler.trigger_task(&task.id).await.unwrap();
        wait_until("first trigger to start", async || {
            runner.runs.load(Ordering::SeqCst) >= 1
        })
        .await;

        let err = fx.scheduler.trigger_task(&task.id).await.unwrap_err();
        assert!(matches!(err, StewardError::AlreadyRunning { .. }));

        fx.scheduler.stop().await.unwrap();
        assert_eq!(runner.runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn trigger_rejected_while_stopped() {
        let fx = fixture(Arc::new(StubRunner::instant(TaskKind::Cleanup))).await;
        let mut task = cleanup_task(now());
        task.next_run = None;
        fx.stores.tasks.insert(&task).await.unwrap();

        let err = fx.scheduler.trigger_task(&task.id).await.unwrap_err();
        assert!(matches!(err, StewardError::SchedulerNotRunning));
    }

    #[tokio::test]
    async fn panicking_runner_fails_the_execution_not_the_loop() {
        let runner = Arc::new(StubRunner {
            panic: true,
            ..StubRunner::instant(TaskKind::Cleanup)
        });
        let fx = fixture(runner.clone()).await;
        let task = cleanup_task(now());
        fx.stores.tasks.insert(&task).await.unwrap();

        fx.scheduler.start().await.unwrap();
        wait_until("execution to fail", async || {
            let execs = fx
                .stores
                .executions
                .list_recent(Some(&task.id), 10)
                .await
                .unwrap();
            execs.first().is_some_and(|e| e.status == ExecutionStatus::Failed)
        })
        .await;

        // Loop survived the panic.
        assert!(fx.scheduler.is_running());
        let exec = &fx
            .stores
            .executions
            .list_recent(Some(&task.id), 10)
            .await
            .unwrap()[0];
        assert!(exec.error.as_deref().unwrap().contains("panicked"));
        fx.scheduler.stop().await.unwrap();
    }

    #[tokio::test]
    async fn stop_waits_for_inflight_execution() {
        let runner = Arc::new(StubRunner::slow(
            TaskKind::Cleanup,
            Duration::from_millis(150),
        ));
        let fx = fixture(runner.clone()).await;
        let task = cleanup_task(now());
        fx.stores.tasks.insert(&task).await.unwrap();

        fx.scheduler.start().await.unwrap();
        wait_until("task to start", async || {
            runner.runs.load(Ordering::SeqCst) >= 1
        })
        .await;

        fx.scheduler.stop().await.unwrap();

        // After stop returns, the execution must be terminal.
        let execs = fx
            .stores
            .executions
            .list_recent(Some(&task.id), 10)
            .await
            .unwrap();
        assert_eq!(execs[0].status, ExecutionStatus::Success);
        assert_eq!(fx.scheduler.status().active_executions, 0);
    }

    #[tokio::test]
    async fn startup_reconciliation_fails_abandoned_rows() {
        let fx = fixture(Arc::new(StubRunner::instant(TaskKind::Cleanup))).await;
        let task = cleanup_task(now());
        fx.stores.tasks.insert(&task).await.unwrap();

        // A row left `running` by a previous process.
        let orphan = Execution::pending(&task.id, now() - chrono::Duration::minutes(10));
        fx.stores.executions.try_create(&orphan).await.unwrap();
        fx.stores
            .executions
            .mark_running(&orphan.id, now() - chrono::Duration::minutes(10))
            .await
            .unwrap();

        fx.scheduler.start().await.unwrap();
        let reloaded = fx.stores.executions.get(&orphan.id).await.unwrap();
        assert_eq!(reloaded.status, ExecutionStatus::Failed);
        assert_eq!(reloaded.error.as_deref(), Some(ABANDONED_EXECUTION_ERROR));
        fx.scheduler.stop().await.unwrap();
    }

    #[tokio::test]
    async fn failed_runner_marks_execution_failed_and_advances() {
        let runner = Arc::new(StubRunner {
            fail: true,
            ..StubRunner::instant(TaskKind::Cleanup)
        });
        let fx = fixture(runner.clone()).await;
        let task = cleanup_task(now());
        fx.stores.tasks.insert(&task).await.unwrap();

        fx.scheduler.start().await.unwrap();
        wait_until("execution to fail", async || {
            let execs = fx
                .stores
                .executions
                .list_recent(Some(&task.id), 10)
                .await
                .unwrap();
            execs.first().is_some_and(|e| e.status == ExecutionStatus::Failed)
        })
        .await;
        fx.scheduler.stop().await.unwrap();

        // next_run advanced even though the run failed.
        let saved = fx.stores.tasks.get(&task.id).await.unwrap();
        assert_eq!(
            saved.next_run,
            Some(Utc.with_ymd_and_hms(2025, 6, 1, 12, 5, 0).unwrap())
        );
        assert_eq!(saved.last_run, Some(now()));
    }
}
