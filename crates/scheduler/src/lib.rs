//! Scheduler — persistent, crash-recoverable scheduled tasks.
//!
//! An in-memory priority queue orders active tasks by `next_fire_at`;
//! a worker pool executes firings; retry policies, budgets, and the
//! single-catch-up boot policy are enforced here. Execution itself is
//! delegated through [`TaskExecutor`] (local synthetic sessions or a
//! paired device).

pub mod cron;

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use tokio::sync::{Notify, Semaphore};

use hearth_bus::{EventBus, SubscribeOptions};
use hearth_domain::audit::{AuditEntry, AuditOutcome};
use hearth_domain::config::SchedulerConfig;
use hearth_domain::error::Result;
use hearth_domain::event::{Event, Topic, TopicFilter};
use hearth_domain::id;
use hearth_domain::task::{
    FinalFailureAction, ScheduledTask, TaskRun, TaskRunStatus, TaskStatus, Trigger,
};
use hearth_store::Store;

use cron::CronSchedule;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Executor capability
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Default)]
pub struct TaskOutcome {
    pub tokens_used: u64,
    pub cost: f64,
    pub result: Option<String>,
}

/// Runs a task's action. The gateway's implementation drives a
/// synthetic session locally, or forwards the run to a paired device
/// when `target_device` is set.
#[async_trait::async_trait]
pub trait TaskExecutor: Send + Sync {
    async fn execute(
        &self,
        task: &ScheduledTask,
        run: &TaskRun,
        trigger_payload: Option<serde_json::Value>,
    ) -> Result<TaskOutcome>;
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Boot catch-up policy
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Decide a task's next firing at boot. Returns the new `next_fire_at`
/// and whether a single catch-up firing is owed: cron semantics never
/// backfill more than one missed instant.
pub fn boot_next_fire(
    task: &ScheduledTask,
    now: DateTime<Utc>,
) -> Result<(Option<DateTime<Utc>>, bool)> {
    match &task.trigger {
        Trigger::Cron { spec, timezone } => {
            let schedule = CronSchedule::parse(spec, timezone)?;
            let stored = task.next_fire_at;
            if let Some(next) = stored {
                if next > now {
                    return Ok((Some(next), false));
                }
            }
            let anchor = task.last_fire_at.unwrap_or(task.created_at);
            let missed = schedule.missed_since(anchor, now);
            Ok((schedule.next_after(now), missed))
        }
        Trigger::Interval { seconds } => {
            let interval = ChronoDuration::seconds(*seconds as i64);
            match task.last_fire_at {
                Some(last) if last + interval <= now => Ok((Some(now + interval), true)),
                Some(last) => Ok((Some(last + interval), false)),
                None => match task.next_fire_at {
                    Some(next) if next > now => Ok((Some(next), false)),
                    _ => Ok((Some(now + interval), false)),
                },
            }
        }
        // Event tasks have no timer; they fire off the bus.
        Trigger::Event { .. } => Ok((None, false)),
    }
}

/// The next regular firing after a completed one.
fn next_after_fire(task: &ScheduledTask, now: DateTime<Utc>) -> Result<Option<DateTime<Utc>>> {
    match &task.trigger {
        Trigger::Cron { spec, timezone } => {
            Ok(CronSchedule::parse(spec, timezone)?.next_after(now))
        }
        Trigger::Interval { seconds } => Ok(Some(now + ChronoDuration::seconds(*seconds as i64))),
        Trigger::Event { .. } => Ok(None),
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Scheduler
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

const BUDGET_THRESHOLDS: [(u8, f64); 3] = [(50, 0.50), (75, 0.75), (90, 0.90)];

pub struct Scheduler {
    store: Arc<Store>,
    bus: Arc<EventBus>,
    executor: Arc<dyn TaskExecutor>,
    config: SchedulerConfig,
    workers: Arc<Semaphore>,
    /// Min-heap of (next_fire_at µs, task id).
    queue: Mutex<BinaryHeap<Reverse<(i64, String)>>>,
    wake: Notify,
    stopping: AtomicBool,
    /// Budget warning thresholds already announced, per task/workspace.
    budget_flags: Mutex<HashMap<String, u8>>,
}

impl Scheduler {
    pub fn new(
        store: Arc<Store>,
        bus: Arc<EventBus>,
        executor: Arc<dyn TaskExecutor>,
        config: SchedulerConfig,
    ) -> Arc<Self> {
        let workers = Arc::new(Semaphore::new(config.workers.max(1)));
        Arc::new(Self {
            store,
            bus,
            executor,
            config,
            workers,
            queue: Mutex::new(BinaryHeap::new()),
            wake: Notify::new(),
            stopping: AtomicBool::new(false),
            budget_flags: Mutex::new(HashMap::new()),
        })
    }

    /// Boot pass: apply the catch-up policy to every active task, then
    /// start the timer loop and the event-trigger listener.
    pub async fn start(self: &Arc<Self>) -> Result<Vec<tokio::task::JoinHandle<()>>> {
        let now = Utc::now();
        let mut catch_up = Vec::new();

        for mut task in self.store.tasks_by_next_fire()? {
            match boot_next_fire(&task, now) {
                Ok((next, fire_now)) => {
                    task.next_fire_at = next;
                    task.updated_at = now;
                    self.store.upsert_task(&task)?;
                    if fire_now {
                        catch_up.push(task.id.clone());
                    }
                    self.enqueue(&task);
                }
                Err(e) => {
                    tracing::warn!(task_id = %task.id, error = %e, "task trigger invalid, disabling");
                    task.status = TaskStatus::Disabled;
                    task.next_fire_at = None;
                    self.store.upsert_task(&task)?;
                }
            }
        }

        // At most one catch-up firing per task, regardless of downtime.
        for task_id in catch_up {
            tracing::info!(task_id = %task_id, "catch-up firing for missed schedule");
            self.clone().fire_now(&task_id, None).await?;
        }

        let timer = tokio::spawn(self.clone().timer_loop());
        let events = tokio::spawn(self.clone().event_trigger_loop());
        Ok(vec![timer, events])
    }

    pub fn stop(&self) {
        self.stopping.store(true, Ordering::Release);
        self.wake.notify_waiters();
    }

    /// Re-read a task into the queue after creation or edit.
    pub fn task_changed(&self, task: &ScheduledTask) {
        self.enqueue(task);
        self.wake.notify_waiters();
    }

    fn enqueue(&self, task: &ScheduledTask) {
        if task.status != TaskStatus::Active {
            return;
        }
        if let Some(next) = task.next_fire_at {
            self.queue
                .lock()
                .push(Reverse((next.timestamp_micros(), task.id.clone())));
        }
    }

    // ── Timer loop ───────────────────────────────────────────────────

    async fn timer_loop(self: Arc<Self>) {
        while !self.stopping.load(Ordering::Acquire) {
            let now = Utc::now();
            let mut due: Vec<String> = Vec::new();

            {
                let mut queue = self.queue.lock();
                while let Some(Reverse((at, _))) = queue.peek() {
                    if *at > now.timestamp_micros() {
                        break;
                    }
                    let Some(Reverse((_, task_id))) = queue.pop() else {
                        break;
                    };
                    due.push(task_id);
                }
            }

            for task_id in due {
                // Heap entries go stale when a task is edited or
                // paused; the store is the source of truth.
                let task = match self.store.get_task(&task_id) {
                    Ok(Some(task)) => task,
                    _ => continue,
                };
                if task.status != TaskStatus::Active {
                    continue;
                }
                let Some(next) = task.next_fire_at else { continue };
                if next > now {
                    self.enqueue(&task);
                    continue;
                }
                if let Err(e) = self.clone().fire_now(&task_id, None).await {
                    tracing::warn!(task_id = %task_id, error = %e, "task firing failed");
                }
            }

            // Sleep until the earliest deadline (1 s floor, 30 s cap).
            let sleep_for = {
                let queue = self.queue.lock();
                match queue.peek() {
                    Some(Reverse((at, _))) => {
                        let micros = at - Utc::now().timestamp_micros();
                        std::time::Duration::from_micros(micros.clamp(0, 30_000_000) as u64)
                            .max(std::time::Duration::from_secs(1))
                    }
                    None => std::time::Duration::from_secs(30),
                }
            };
            tokio::select! {
                _ = tokio::time::sleep(sleep_for) => {}
                _ = self.wake.notified() => {}
            }
        }
    }

    // ── Event triggers ───────────────────────────────────────────────

    async fn event_trigger_loop(self: Arc<Self>) {
        let mut subscription = match self
            .bus
            .subscribe(SubscribeOptions {
                topics: TopicFilter::All,
                ..Default::default()
            })
            .await
        {
            Ok(s) => s,
            Err(e) => {
                tracing::error!(error = %e, "event trigger listener could not subscribe");
                return;
            }
        };

        while let Some(event) = subscription.recv().await {
            if self.stopping.load(Ordering::Acquire) {
                return;
            }
            // Never re-trigger off our own firings.
            if matches!(event.topic, Topic::TaskFired | Topic::TaskCompleted) {
                continue;
            }
            let tasks = match self.store.list_tasks() {
                Ok(tasks) => tasks,
                Err(_) => continue,
            };
            for task in tasks {
                let matches = task.status == TaskStatus::Active
                    && matches!(&task.trigger, Trigger::Event { topic }
                        if topic == event.topic.as_str());
                if matches {
                    let payload = event.payload.clone();
                    if let Err(e) = self.clone().fire_now(&task.id, Some(payload)).await {
                        tracing::warn!(task_id = %task.id, error = %e, "event-triggered firing failed");
                    }
                }
            }
        }
    }

    // ── Firing ───────────────────────────────────────────────────────

    /// Fire one task now (timer, event, catch-up, or the run-now API).
    /// Advances the regular schedule, records the TaskRun, and applies
    /// retry/budget policy when the run completes.
    pub async fn fire_now(
        self: Arc<Self>,
        task_id: &str,
        trigger_payload: Option<serde_json::Value>,
    ) -> Result<()> {
        let now = self.store.now();
        let Some(mut task) = self.store.get_task(task_id)? else {
            return Ok(());
        };

        // Advance the schedule before running so a slow run cannot
        // double-fire.
        task.last_fire_at = Some(now);
        task.next_fire_at = next_after_fire(&task, now)?;
        task.updated_at = now;
        self.store.upsert_task(&task)?;
        self.enqueue(&task);

        let attempt_number = task.attempts + 1;
        let run_number = if task.attempts == 0 {
            self.store.next_run_number(&task.id)?
        } else {
            self.store.next_run_number(&task.id)?.saturating_sub(1).max(1)
        };

        let run = TaskRun {
            id: id::new_id(id::TASK_RUN),
            task_id: task.id.clone(),
            run_number,
            attempt_number,
            started_at: now,
            completed_at: None,
            status: TaskRunStatus::Running,
            tokens_used: 0,
            cost: 0.0,
            error: None,
            result: None,
        };
        self.store.insert_task_run(&run)?;

        self.bus
            .publish_or_log(Event::new(
                Topic::TaskFired,
                serde_json::json!({
                    "task_id": task.id,
                    "run_id": run.id,
                    "run_number": run_number,
                    "attempt": attempt_number,
                }),
            ))
            .await;

        let scheduler = self.clone();
        let workers = self.workers.clone();
        tokio::spawn(async move {
            let Ok(_permit) = workers.acquire_owned().await else {
                return;
            };
            scheduler.run_attempt(task, run, trigger_payload).await;
        });
        Ok(())
    }

    async fn run_attempt(
        self: &Arc<Self>,
        task: ScheduledTask,
        run: TaskRun,
        trigger_payload: Option<serde_json::Value>,
    ) {
        let outcome = self.executor.execute(&task, &run, trigger_payload).await;

        match outcome {
            Ok(outcome) => {
                if let Err(e) = self.finish_success(&task, &run, outcome).await {
                    tracing::warn!(task_id = %task.id, error = %e, "recording task success failed");
                }
            }
            Err(error) => {
                if let Err(e) = self.finish_failure(task, &run, &error.to_string()).await {
                    tracing::warn!(error = %e, "recording task failure failed");
                }
            }
        }
    }

    async fn finish_success(
        &self,
        task: &ScheduledTask,
        run: &TaskRun,
        outcome: TaskOutcome,
    ) -> Result<()> {
        self.store.finish_task_run(
            &run.id,
            TaskRunStatus::Success,
            outcome.tokens_used,
            outcome.cost,
            None,
            outcome.result.as_deref(),
        )?;

        if let Some(mut current) = self.store.get_task(&task.id)? {
            if current.attempts != 0 {
                current.attempts = 0;
                current.updated_at = self.store.now();
                self.store.upsert_task(&current)?;
            }
        }

        self.bus
            .publish_or_log(Event::new(
                Topic::TaskCompleted,
                serde_json::json!({
                    "task_id": task.id,
                    "run_id": run.id,
                    "status": "success",
                    "tokens_used": outcome.tokens_used,
                    "cost": outcome.cost,
                }),
            ))
            .await;

        self.enforce_budgets(task).await
    }

    async fn finish_failure(
        &self,
        mut task: ScheduledTask,
        run: &TaskRun,
        error: &str,
    ) -> Result<()> {
        self.store
            .finish_task_run(&run.id, TaskRunStatus::Failed, 0, 0.0, Some(error), None)?;
        self.store.append_audit(&AuditEntry::new(
            "scheduler",
            "task_run.failed",
            "task_run",
            run.id.clone(),
            AuditOutcome::Failed,
            serde_json::json!({
                "task_id": task.id,
                "attempt": run.attempt_number,
                "error": error,
            }),
        ))?;

        self.bus
            .publish_or_log(Event::new(
                Topic::TaskCompleted,
                serde_json::json!({
                    "task_id": task.id,
                    "run_id": run.id,
                    "status": "failed",
                    "error": error,
                }),
            ))
            .await;

        let now = self.store.now();
        task.attempts = run.attempt_number;

        if task.attempts <= task.retry_policy.max_retries {
            let delay = task.retry_policy.delay_for_attempt(task.attempts);
            task.next_fire_at = Some(now + ChronoDuration::seconds(delay as i64));
            task.updated_at = now;
            tracing::info!(
                task_id = %task.id,
                attempt = task.attempts,
                retry_in_secs = delay,
                "task attempt failed, retry scheduled"
            );
            self.store.upsert_task(&task)?;
            self.enqueue(&task);
            self.wake.notify_waiters();
            return Ok(());
        }

        // Retries exhausted: apply the final-failure action.
        match task.retry_policy.on_final_failure {
            FinalFailureAction::MarkFailed => {
                task.status = TaskStatus::Failed;
                task.next_fire_at = None;
            }
            FinalFailureAction::Pause => {
                task.status = TaskStatus::Paused;
                task.next_fire_at = None;
            }
            FinalFailureAction::Notify => {
                self.bus
                    .publish_or_log(Event::new(
                        Topic::ErrorOccurred,
                        serde_json::json!({
                            "scope": "task",
                            "task_id": task.id,
                            "error": format!("retries exhausted: {error}"),
                        }),
                    ))
                    .await;
                task.attempts = 0;
                task.next_fire_at = next_after_fire(&task, now)?;
            }
        }
        task.updated_at = now;
        self.store.upsert_task(&task)?;
        self.enqueue(&task);
        Ok(())
    }

    // ── Budgets ──────────────────────────────────────────────────────

    /// Accumulate cost against per-task and workspace budgets; warn at
    /// 50/75/90 %, optionally pause when exceeded.
    async fn enforce_budgets(&self, task: &ScheduledTask) -> Result<()> {
        if let Some(budget) = &task.budget {
            let spent = self.store.task_cost_total(&task.id)?;
            self.announce_thresholds(&task.id, spent, budget.limit_usd).await;

            if spent >= budget.limit_usd
                && (budget.pause_on_exceed || self.config.pause_on_budget_exceeded)
            {
                if let Some(mut current) = self.store.get_task(&task.id)? {
                    if current.status == TaskStatus::Active {
                        tracing::warn!(task_id = %task.id, spent, "task budget exceeded, pausing");
                        current.status = TaskStatus::Paused;
                        current.next_fire_at = None;
                        current.updated_at = self.store.now();
                        self.store.upsert_task(&current)?;
                    }
                }
            }
        }

        if let Some(limit) = self.config.workspace_budget_usd {
            let spent = self.store.workspace_cost_total(&task.workspace_id)?;
            self.announce_thresholds(&format!("ws:{}", task.workspace_id), spent, limit)
                .await;
        }
        Ok(())
    }

    async fn announce_thresholds(&self, key: &str, spent: f64, limit: f64) {
        if limit <= 0.0 {
            return;
        }
        for (index, (pct, ratio)) in BUDGET_THRESHOLDS.iter().enumerate() {
            let bit = 1u8 << index;
            if spent >= limit * ratio {
                let newly_crossed = {
                    let mut flags = self.budget_flags.lock();
                    let entry = flags.entry(key.to_owned()).or_insert(0);
                    if *entry & bit == 0 {
                        *entry |= bit;
                        true
                    } else {
                        false
                    }
                };
                if newly_crossed {
                    self.bus
                        .publish_or_log(Event::new(
                            Topic::TraceEvent,
                            serde_json::json!({
                                "kind": "budget_warning",
                                "subject": key,
                                "threshold_pct": pct,
                                "spent_usd": spent,
                                "limit_usd": limit,
                            }),
                        ))
                        .await;
                }
            }
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use hearth_domain::task::{BackoffStrategy, RetryPolicy, TaskAction, TaskBudget};
    use std::sync::atomic::AtomicU32;

    struct ScriptedExecutor {
        calls: AtomicU32,
        fail_first: u32,
        cost_per_run: f64,
    }

    #[async_trait::async_trait]
    impl TaskExecutor for ScriptedExecutor {
        async fn execute(
            &self,
            _task: &ScheduledTask,
            _run: &TaskRun,
            _trigger_payload: Option<serde_json::Value>,
        ) -> Result<TaskOutcome> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.fail_first {
                return Err(hearth_domain::Error::Other("scripted failure".into()));
            }
            Ok(TaskOutcome {
                tokens_used: 10,
                cost: self.cost_per_run,
                result: Some("ok".into()),
            })
        }
    }

    fn utc(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap()
    }

    fn cron_task(last_fire: Option<DateTime<Utc>>, next_fire: Option<DateTime<Utc>>) -> ScheduledTask {
        let created = utc(2026, 6, 1, 0, 0);
        ScheduledTask {
            id: id::new_id(id::TASK),
            name: "hourly".into(),
            workspace_id: "ws1".into(),
            trigger: Trigger::Cron {
                spec: "0 * * * *".into(),
                timezone: "UTC".into(),
            },
            action: TaskAction::Prompt {
                prompt: "digest".into(),
                model: None,
            },
            target_device: None,
            retry_policy: RetryPolicy::default(),
            budget: None,
            status: TaskStatus::Active,
            next_fire_at: next_fire,
            last_fire_at: last_fire,
            attempts: 0,
            created_at: created,
            updated_at: created,
        }
    }

    // ── Boot catch-up policy ───────────────────────────────────────

    #[test]
    fn missed_hours_produce_single_catch_up_aligned_next() {
        // Last fired at T−3h; starting at T ⇒ exactly one immediate
        // firing and the next one at the T+1h boundary.
        let now = utc(2026, 6, 15, 12, 0);
        let task = cron_task(Some(utc(2026, 6, 15, 9, 0)), Some(utc(2026, 6, 15, 10, 0)));
        let (next, fire_now) = boot_next_fire(&task, now).unwrap();
        assert!(fire_now, "one catch-up firing is owed");
        assert_eq!(next, Some(utc(2026, 6, 15, 13, 0)));
    }

    #[test]
    fn nothing_missed_skips_to_next_boundary() {
        let now = utc(2026, 6, 15, 12, 10);
        let task = cron_task(Some(utc(2026, 6, 15, 12, 0)), Some(utc(2026, 6, 15, 12, 5)));
        let (next, fire_now) = boot_next_fire(&task, now).unwrap();
        assert!(!fire_now);
        assert_eq!(next, Some(utc(2026, 6, 15, 13, 0)));
    }

    #[test]
    fn future_next_fire_is_kept() {
        let now = utc(2026, 6, 15, 12, 10);
        let task = cron_task(Some(utc(2026, 6, 15, 12, 0)), Some(utc(2026, 6, 15, 13, 0)));
        let (next, fire_now) = boot_next_fire(&task, now).unwrap();
        assert!(!fire_now);
        assert_eq!(next, Some(utc(2026, 6, 15, 13, 0)));
    }

    #[test]
    fn interval_catch_up_fires_once() {
        let now = utc(2026, 6, 15, 12, 0);
        let mut task = cron_task(Some(utc(2026, 6, 15, 9, 30)), None);
        task.trigger = Trigger::Interval { seconds: 3600 };
        let (next, fire_now) = boot_next_fire(&task, now).unwrap();
        assert!(fire_now);
        assert_eq!(next, Some(utc(2026, 6, 15, 13, 0)));
    }

    // ── Firing, retry, budgets ─────────────────────────────────────

    async fn scheduler_with(
        executor: ScriptedExecutor,
        config: SchedulerConfig,
    ) -> (Arc<Store>, Arc<EventBus>, Arc<Scheduler>, Arc<ScriptedExecutor>) {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let bus = Arc::new(EventBus::new(store.clone(), 64));
        let executor = Arc::new(executor);
        let scheduler = Scheduler::new(store.clone(), bus.clone(), executor.clone(), config);
        (store, bus, scheduler, executor)
    }

    async fn settle() {
        tokio::time::sleep(std::time::Duration::from_millis(80)).await;
    }

    #[tokio::test]
    async fn fire_now_records_success_and_resets_attempts() {
        let (store, _bus, scheduler, executor) = scheduler_with(
            ScriptedExecutor {
                calls: AtomicU32::new(0),
                fail_first: 0,
                cost_per_run: 0.01,
            },
            SchedulerConfig::default(),
        )
        .await;

        let mut task = cron_task(None, Some(Utc::now()));
        task.attempts = 0;
        store.upsert_task(&task).unwrap();

        scheduler.clone().fire_now(&task.id, None).await.unwrap();
        settle().await;

        assert_eq!(executor.calls.load(Ordering::SeqCst), 1);
        let runs = store.runs_for_task(&task.id).unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].status, TaskRunStatus::Success);
        assert_eq!(runs[0].run_number, 1);
        assert_eq!(runs[0].attempt_number, 1);

        let task = store.get_task(&task.id).unwrap().unwrap();
        assert_eq!(task.attempts, 0);
        assert!(task.next_fire_at.is_some(), "schedule advanced");
        assert!(task.last_fire_at.is_some());
    }

    #[tokio::test]
    async fn failure_schedules_retry_then_final_action() {
        let (store, _bus, scheduler, _executor) = scheduler_with(
            ScriptedExecutor {
                calls: AtomicU32::new(0),
                fail_first: 99,
                cost_per_run: 0.0,
            },
            SchedulerConfig::default(),
        )
        .await;

        let mut task = cron_task(None, Some(Utc::now()));
        task.retry_policy = RetryPolicy {
            strategy: BackoffStrategy::Fixed,
            max_retries: 1,
            initial_delay_secs: 300,
            max_delay_secs: 300,
            on_final_failure: FinalFailureAction::MarkFailed,
        };
        store.upsert_task(&task).unwrap();

        // Attempt 1 fails → retry scheduled ~300 s out.
        scheduler.clone().fire_now(&task.id, None).await.unwrap();
        settle().await;
        let after_first = store.get_task(&task.id).unwrap().unwrap();
        assert_eq!(after_first.attempts, 1);
        assert_eq!(after_first.status, TaskStatus::Active);
        let eta = after_first.next_fire_at.unwrap() - Utc::now();
        assert!(eta.num_seconds() > 250, "retry delay applied");

        // Attempt 2 fails → retries exhausted → task failed.
        scheduler.clone().fire_now(&task.id, None).await.unwrap();
        settle().await;
        let after_second = store.get_task(&task.id).unwrap().unwrap();
        assert_eq!(after_second.status, TaskStatus::Failed);
        assert_eq!(after_second.next_fire_at, None);

        // Two distinct runs, same run number, incrementing attempts.
        let runs = store.runs_for_task(&task.id).unwrap();
        assert_eq!(runs.len(), 2);
        let mut attempts: Vec<u32> = runs.iter().map(|r| r.attempt_number).collect();
        attempts.sort_unstable();
        assert_eq!(attempts, vec![1, 2]);
        assert!(runs.iter().all(|r| r.run_number == 1));

        // Failures are audited.
        assert!(store.count_audit().unwrap() >= 2);
    }

    #[tokio::test]
    async fn budget_warns_then_pauses() {
        let (store, bus, scheduler, _executor) = scheduler_with(
            ScriptedExecutor {
                calls: AtomicU32::new(0),
                fail_first: 0,
                cost_per_run: 0.6,
            },
            SchedulerConfig::default(),
        )
        .await;

        let mut warnings = bus
            .subscribe(SubscribeOptions {
                topics: TopicFilter::Only(vec![Topic::TraceEvent]),
                ..Default::default()
            })
            .await
            .unwrap();

        let mut task = cron_task(None, Some(Utc::now()));
        task.budget = Some(TaskBudget {
            limit_usd: 1.0,
            pause_on_exceed: true,
        });
        store.upsert_task(&task).unwrap();

        // First run: $0.60 → 50 % warning.
        scheduler.clone().fire_now(&task.id, None).await.unwrap();
        settle().await;
        let warning = warnings.try_recv().expect("50% warning");
        assert_eq!(warning.payload["threshold_pct"], 50);

        // Second run: $1.20 → exceeds → paused.
        scheduler.clone().fire_now(&task.id, None).await.unwrap();
        settle().await;
        let task = store.get_task(&task.id).unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Paused);
    }

    #[tokio::test]
    async fn event_trigger_fires_on_matching_topic() {
        let (store, bus, scheduler, executor) = scheduler_with(
            ScriptedExecutor {
                calls: AtomicU32::new(0),
                fail_first: 0,
                cost_per_run: 0.0,
            },
            SchedulerConfig::default(),
        )
        .await;

        let mut task = cron_task(None, None);
        task.trigger = Trigger::Event {
            topic: "error.occurred".into(),
        };
        task.next_fire_at = None;
        store.upsert_task(&task).unwrap();

        let handles = scheduler.start().await.unwrap();

        bus.publish(Event::new(
            Topic::ErrorOccurred,
            serde_json::json!({"scope": "test"}),
        ))
        .await
        .unwrap();
        settle().await;

        assert_eq!(executor.calls.load(Ordering::SeqCst), 1);
        assert_eq!(store.runs_for_task(&task.id).unwrap().len(), 1);

        scheduler.stop();
        for handle in handles {
            handle.abort();
        }
    }
}
