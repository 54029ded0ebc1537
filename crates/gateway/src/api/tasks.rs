//! Scheduled-task endpoints.

use axum::extract::{Path, State};
use axum::Json;
use chrono::Utc;
use serde::Deserialize;

use hearth_domain::error::Error;
use hearth_domain::id;
use hearth_domain::task::{
    RetryPolicy, ScheduledTask, TaskAction, TaskBudget, TaskStatus, Trigger,
};
use hearth_scheduler::cron::CronSchedule;

use crate::api::error::{ApiError, ApiResult};
use crate::state::AppState;

/// Initial `next_fire_at` for a newly created or resumed task.
fn initial_next_fire(trigger: &Trigger) -> hearth_domain::Result<Option<chrono::DateTime<Utc>>> {
    let now = Utc::now();
    match trigger {
        Trigger::Cron { spec, timezone } => {
            Ok(CronSchedule::parse(spec, timezone)?.next_after(now))
        }
        Trigger::Interval { seconds } => {
            Ok(Some(now + chrono::Duration::seconds(*seconds as i64)))
        }
        Trigger::Event { .. } => Ok(None),
    }
}

fn notify_scheduler(state: &AppState, task: &ScheduledTask) {
    if let Some(scheduler) = state.scheduler.get() {
        scheduler.task_changed(task);
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Handlers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub async fn list_tasks(State(state): State<AppState>) -> ApiResult<Json<serde_json::Value>> {
    Ok(Json(serde_json::json!({ "tasks": state.store.list_tasks()? })))
}

#[derive(Debug, Deserialize)]
pub struct CreateTaskBody {
    pub name: String,
    pub trigger: Trigger,
    pub action: TaskAction,
    #[serde(default)]
    pub workspace_id: Option<String>,
    #[serde(default)]
    pub target_device: Option<String>,
    #[serde(default)]
    pub retry_policy: Option<RetryPolicy>,
    #[serde(default)]
    pub budget: Option<TaskBudget>,
}

pub async fn create_task(
    State(state): State<AppState>,
    Json(body): Json<CreateTaskBody>,
) -> ApiResult<Json<serde_json::Value>> {
    let next_fire_at = initial_next_fire(&body.trigger)?;
    let now = state.store.now();
    let task = ScheduledTask {
        id: id::new_id(id::TASK),
        name: body.name,
        workspace_id: body
            .workspace_id
            .unwrap_or_else(|| state.config.workspace.id.clone()),
        trigger: body.trigger,
        action: body.action,
        target_device: body.target_device,
        retry_policy: body.retry_policy.unwrap_or_default(),
        budget: body.budget,
        status: TaskStatus::Active,
        next_fire_at,
        last_fire_at: None,
        attempts: 0,
        created_at: now,
        updated_at: now,
    };
    state.store.upsert_task(&task)?;
    notify_scheduler(&state, &task);
    Ok(Json(serde_json::json!({ "task": task })))
}

pub async fn get_task(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    let task = state
        .store
        .get_task(&task_id)?
        .ok_or_else(|| Error::NotFound(format!("task {task_id}")))?;
    Ok(Json(serde_json::json!({ "task": task })))
}

#[derive(Debug, Deserialize)]
pub struct PatchTaskBody {
    /// `pause` or `resume`.
    #[serde(default)]
    pub action: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub trigger: Option<Trigger>,
    #[serde(default)]
    pub task_action: Option<TaskAction>,
    #[serde(default)]
    pub retry_policy: Option<RetryPolicy>,
    #[serde(default)]
    pub budget: Option<TaskBudget>,
}

pub async fn patch_task(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
    Json(body): Json<PatchTaskBody>,
) -> ApiResult<Json<serde_json::Value>> {
    let mut task = state
        .store
        .get_task(&task_id)?
        .ok_or_else(|| Error::NotFound(format!("task {task_id}")))?;

    if let Some(name) = body.name {
        task.name = name;
    }
    if let Some(trigger) = body.trigger {
        task.next_fire_at = initial_next_fire(&trigger)?;
        task.trigger = trigger;
    }
    if let Some(action) = body.task_action {
        task.action = action;
    }
    if let Some(retry) = body.retry_policy {
        task.retry_policy = retry;
    }
    if let Some(budget) = body.budget {
        task.budget = Some(budget);
    }

    match body.action.as_deref() {
        Some("pause") => {
            task.status = TaskStatus::Paused;
            task.next_fire_at = None;
        }
        Some("resume") => {
            task.status = TaskStatus::Active;
            task.attempts = 0;
            task.next_fire_at = initial_next_fire(&task.trigger)?;
        }
        Some(other) => {
            return Err(ApiError(Error::InvalidInput(format!(
                "unknown action '{other}' (expected pause or resume)"
            ))))
        }
        None => {}
    }

    task.updated_at = state.store.now();
    state.store.upsert_task(&task)?;
    notify_scheduler(&state, &task);
    Ok(Json(serde_json::json!({ "task": task })))
}

pub async fn delete_task(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    if !state.store.delete_task(&task_id)? {
        return Err(ApiError(Error::NotFound(format!("task {task_id}"))));
    }
    Ok(Json(serde_json::json!({ "deleted": true })))
}

pub async fn list_runs(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    state
        .store
        .get_task(&task_id)?
        .ok_or_else(|| Error::NotFound(format!("task {task_id}")))?;
    Ok(Json(serde_json::json!({
        "runs": state.store.runs_for_task(&task_id)?,
    })))
}

pub async fn run_now(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    state
        .store
        .get_task(&task_id)?
        .ok_or_else(|| Error::NotFound(format!("task {task_id}")))?;
    let scheduler = state
        .scheduler
        .get()
        .ok_or_else(|| Error::Other("scheduler not running".into()))?;
    scheduler.clone().fire_now(&task_id, None).await?;
    Ok(Json(serde_json::json!({ "fired": true })))
}
