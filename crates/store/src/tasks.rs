//! Scheduled tasks and task runs.

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};

use hearth_domain::error::{Error, Result};
use hearth_domain::task::{
    RetryPolicy, ScheduledTask, TaskAction, TaskBudget, TaskRun, TaskRunStatus, TaskStatus,
    Trigger,
};

use crate::{micros_to_ts, ts_to_micros, Store};

fn row_to_task(row: &Row<'_>) -> rusqlite::Result<ScheduledTask> {
    let status: String = row.get("status")?;
    let trigger: String = row.get("trigger")?;
    let action: String = row.get("action")?;
    let retry: String = row.get("retry_policy")?;
    let budget: Option<String> = row.get("budget")?;
    Ok(ScheduledTask {
        id: row.get("id")?,
        name: row.get("name")?,
        workspace_id: row.get("workspace_id")?,
        trigger: serde_json::from_str::<Trigger>(&trigger).unwrap_or(Trigger::Interval {
            seconds: u64::MAX,
        }),
        action: serde_json::from_str::<TaskAction>(&action).unwrap_or(TaskAction::Prompt {
            prompt: String::new(),
            model: None,
        }),
        target_device: row.get("target_device")?,
        retry_policy: serde_json::from_str::<RetryPolicy>(&retry).unwrap_or_default(),
        budget: budget.and_then(|b| serde_json::from_str::<TaskBudget>(&b).ok()),
        status: TaskStatus::parse(&status).unwrap_or(TaskStatus::Disabled),
        next_fire_at: row.get::<_, Option<i64>>("next_fire_at")?.map(micros_to_ts),
        last_fire_at: row.get::<_, Option<i64>>("last_fire_at")?.map(micros_to_ts),
        attempts: row.get::<_, i64>("attempts")? as u32,
        created_at: micros_to_ts(row.get("created_at")?),
        updated_at: micros_to_ts(row.get("updated_at")?),
    })
}

fn row_to_run(row: &Row<'_>) -> rusqlite::Result<TaskRun> {
    let status: String = row.get("status")?;
    Ok(TaskRun {
        id: row.get("id")?,
        task_id: row.get("task_id")?,
        run_number: row.get::<_, i64>("run_number")? as u64,
        attempt_number: row.get::<_, i64>("attempt_number")? as u32,
        started_at: micros_to_ts(row.get("started_at")?),
        completed_at: row
            .get::<_, Option<i64>>("completed_at")?
            .map(micros_to_ts),
        status: TaskRunStatus::parse(&status).unwrap_or(TaskRunStatus::Failed),
        tokens_used: row.get::<_, i64>("tokens_used")? as u64,
        cost: row.get("cost")?,
        error: row.get("error")?,
        result: row.get("result")?,
    })
}

impl Store {
    pub fn upsert_task(&self, task: &ScheduledTask) -> Result<()> {
        // An active task must always carry a next firing time.
        if task.status == TaskStatus::Active && task.next_fire_at.is_none() {
            if !matches!(task.trigger, Trigger::Event { .. }) {
                return Err(Error::InvalidInput(format!(
                    "active task {} has no next_fire_at",
                    task.id
                )));
            }
        }
        let trigger = serde_json::to_string(&task.trigger)?;
        let action = serde_json::to_string(&task.action)?;
        let retry = serde_json::to_string(&task.retry_policy)?;
        let budget = task.budget.as_ref().map(serde_json::to_string).transpose()?;
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO tasks (id, name, workspace_id, trigger, action, target_device,
                     retry_policy, budget, status, next_fire_at, last_fire_at, attempts,
                     created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)
                 ON CONFLICT(id) DO UPDATE SET
                     name = excluded.name,
                     trigger = excluded.trigger,
                     action = excluded.action,
                     target_device = excluded.target_device,
                     retry_policy = excluded.retry_policy,
                     budget = excluded.budget,
                     status = excluded.status,
                     next_fire_at = excluded.next_fire_at,
                     last_fire_at = excluded.last_fire_at,
                     attempts = excluded.attempts,
                     updated_at = excluded.updated_at",
                params![
                    task.id,
                    task.name,
                    task.workspace_id,
                    trigger,
                    action,
                    task.target_device,
                    retry,
                    budget,
                    task.status.as_str(),
                    task.next_fire_at.map(ts_to_micros),
                    task.last_fire_at.map(ts_to_micros),
                    task.attempts as i64,
                    ts_to_micros(task.created_at),
                    ts_to_micros(task.updated_at),
                ],
            )?;
            Ok(())
        })
    }

    pub fn get_task(&self, id: &str) -> Result<Option<ScheduledTask>> {
        self.with_conn(|conn| {
            conn.query_row("SELECT * FROM tasks WHERE id = ?1", params![id], row_to_task)
                .optional()
        })
    }

    pub fn delete_task(&self, id: &str) -> Result<bool> {
        self.with_conn(|conn| {
            let n = conn.execute("DELETE FROM tasks WHERE id = ?1", params![id])?;
            Ok(n > 0)
        })
    }

    pub fn list_tasks(&self) -> Result<Vec<ScheduledTask>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT * FROM tasks ORDER BY created_at ASC")?;
            let rows = stmt.query_map([], row_to_task)?;
            rows.collect()
        })
    }

    /// Active tasks ordered by `next_fire_at` (the scheduler's boot scan).
    pub fn tasks_by_next_fire(&self) -> Result<Vec<ScheduledTask>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT * FROM tasks WHERE status = 'active'
                 ORDER BY next_fire_at ASC NULLS LAST",
            )?;
            let rows = stmt.query_map([], row_to_task)?;
            rows.collect()
        })
    }

    // ── Task runs ────────────────────────────────────────────────────

    pub fn insert_task_run(&self, run: &TaskRun) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO task_runs (id, task_id, run_number, attempt_number, started_at,
                     completed_at, status, tokens_used, cost, error, result)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                params![
                    run.id,
                    run.task_id,
                    run.run_number as i64,
                    run.attempt_number as i64,
                    ts_to_micros(run.started_at),
                    run.completed_at.map(ts_to_micros),
                    run.status.as_str(),
                    run.tokens_used as i64,
                    run.cost,
                    run.error,
                    run.result,
                ],
            )?;
            Ok(())
        })
    }

    pub fn finish_task_run(
        &self,
        id: &str,
        status: TaskRunStatus,
        tokens_used: u64,
        cost: f64,
        error: Option<&str>,
        result: Option<&str>,
    ) -> Result<()> {
        let now = ts_to_micros(self.now());
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE task_runs SET status = ?2, completed_at = ?3, tokens_used = ?4,
                     cost = ?5, error = ?6, result = ?7
                 WHERE id = ?1",
                params![id, status.as_str(), now, tokens_used as i64, cost, error, result],
            )?;
            Ok(())
        })
    }

    pub fn runs_for_task(&self, task_id: &str) -> Result<Vec<TaskRun>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT * FROM task_runs WHERE task_id = ?1 ORDER BY started_at DESC",
            )?;
            let rows = stmt.query_map(params![task_id], row_to_run)?;
            rows.collect()
        })
    }

    pub fn next_run_number(&self, task_id: &str) -> Result<u64> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT COALESCE(MAX(run_number), 0) + 1 FROM task_runs WHERE task_id = ?1",
                params![task_id],
                |row| row.get::<_, i64>(0),
            )
            .map(|n| n as u64)
        })
    }

    /// Accumulated cost for one task (budget enforcement).
    pub fn task_cost_total(&self, task_id: &str) -> Result<f64> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT COALESCE(SUM(cost), 0) FROM task_runs WHERE task_id = ?1",
                params![task_id],
                |row| row.get(0),
            )
        })
    }

    /// Accumulated cost across a workspace's tasks.
    pub fn workspace_cost_total(&self, workspace_id: &str) -> Result<f64> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT COALESCE(SUM(r.cost), 0)
                 FROM task_runs r JOIN tasks t ON r.task_id = t.id
                 WHERE t.workspace_id = ?1",
                params![workspace_id],
                |row| row.get(0),
            )
        })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use hearth_domain::id;

    pub(crate) fn make_task(store: &Store, next_fire: Option<DateTime<Utc>>) -> ScheduledTask {
        let now = Utc::now();
        let task = ScheduledTask {
            id: id::new_id(id::TASK),
            name: "hourly digest".into(),
            workspace_id: "ws1".into(),
            trigger: Trigger::Cron {
                spec: "0 * * * *".into(),
                timezone: "UTC".into(),
            },
            action: TaskAction::Prompt {
                prompt: "summarize the news".into(),
                model: None,
            },
            target_device: None,
            retry_policy: RetryPolicy::default(),
            budget: None,
            status: TaskStatus::Active,
            next_fire_at: next_fire.or(Some(now)),
            last_fire_at: None,
            attempts: 0,
            created_at: now,
            updated_at: now,
        };
        store.upsert_task(&task).unwrap();
        task
    }

    #[test]
    fn task_round_trip() {
        let store = Store::open_in_memory().unwrap();
        let task = make_task(&store, None);
        let got = store.get_task(&task.id).unwrap().unwrap();
        assert_eq!(got.name, "hourly digest");
        assert!(matches!(got.trigger, Trigger::Cron { .. }));
        assert_eq!(got.status, TaskStatus::Active);
    }

    #[test]
    fn active_task_requires_next_fire() {
        let store = Store::open_in_memory().unwrap();
        let mut task = make_task(&store, None);
        task.id = id::new_id(id::TASK);
        task.next_fire_at = None;
        assert!(store.upsert_task(&task).is_err());
    }

    #[test]
    fn runs_and_budget_accumulate() {
        let store = Store::open_in_memory().unwrap();
        let task = make_task(&store, None);

        for attempt in 1..=2u32 {
            let run = TaskRun {
                id: id::new_id(id::TASK_RUN),
                task_id: task.id.clone(),
                run_number: 1,
                attempt_number: attempt,
                started_at: Utc::now(),
                completed_at: None,
                status: TaskRunStatus::Running,
                tokens_used: 0,
                cost: 0.0,
                error: None,
                result: None,
            };
            store.insert_task_run(&run).unwrap();
            store
                .finish_task_run(&run.id, TaskRunStatus::Success, 100, 0.25, None, Some("done"))
                .unwrap();
        }

        assert_eq!(store.runs_for_task(&task.id).unwrap().len(), 2);
        assert_eq!(store.next_run_number(&task.id).unwrap(), 2);
        assert!((store.task_cost_total(&task.id).unwrap() - 0.5).abs() < 1e-9);
        assert!((store.workspace_cost_total("ws1").unwrap() - 0.5).abs() < 1e-9);
    }
}
