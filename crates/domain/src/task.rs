//! Scheduled tasks and task runs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Triggers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Trigger {
    /// 5-field cron expression evaluated in the given timezone.
    Cron {
        spec: String,
        #[serde(default = "default_tz")]
        timezone: String,
    },
    /// Fixed interval in seconds, anchored on the last firing.
    Interval { seconds: u64 },
    /// Fires when a matching bus event is observed.
    Event { topic: String },
}

fn default_tz() -> String {
    "UTC".to_string()
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Retry policy & budget
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    #[default]
    Exponential,
    Linear,
    Fixed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum FinalFailureAction {
    #[default]
    MarkFailed,
    Pause,
    Notify,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    #[serde(default)]
    pub strategy: BackoffStrategy,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_initial_delay")]
    pub initial_delay_secs: u64,
    #[serde(default = "default_max_delay")]
    pub max_delay_secs: u64,
    #[serde(default)]
    pub on_final_failure: FinalFailureAction,
}

fn default_max_retries() -> u32 {
    3
}
fn default_initial_delay() -> u64 {
    10
}
fn default_max_delay() -> u64 {
    3600
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            strategy: BackoffStrategy::Exponential,
            max_retries: default_max_retries(),
            initial_delay_secs: default_initial_delay(),
            max_delay_secs: default_max_delay(),
            on_final_failure: FinalFailureAction::MarkFailed,
        }
    }
}

impl RetryPolicy {
    /// Delay before the given attempt (1-based), capped at `max_delay`.
    pub fn delay_for_attempt(&self, attempt: u32) -> u64 {
        let attempt = attempt.max(1);
        let raw = match self.strategy {
            BackoffStrategy::Exponential => self
                .initial_delay_secs
                .checked_shl(attempt - 1)
                .unwrap_or(self.max_delay_secs),
            BackoffStrategy::Linear => self.initial_delay_secs.saturating_mul(attempt as u64),
            BackoffStrategy::Fixed => self.initial_delay_secs,
        };
        raw.min(self.max_delay_secs)
    }
}

/// Cost ceiling for a task. Warning events fire at 50/75/90 %.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskBudget {
    pub limit_usd: f64,
    /// Pause the task when the limit is exceeded.
    #[serde(default)]
    pub pause_on_exceed: bool,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// ScheduledTask
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// What firing the task actually does: run a prompt through a synthetic
/// session, or invoke a tool directly.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TaskAction {
    Prompt {
        prompt: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        model: Option<String>,
    },
    Tool {
        tool_name: String,
        arguments: serde_json::Value,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Active,
    Paused,
    Failed,
    Disabled,
}

impl TaskStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Paused => "paused",
            Self::Failed => "failed",
            Self::Disabled => "disabled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(Self::Active),
            "paused" => Some(Self::Paused),
            "failed" => Some(Self::Failed),
            "disabled" => Some(Self::Disabled),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduledTask {
    pub id: String,
    pub name: String,
    pub workspace_id: String,
    pub trigger: Trigger,
    pub action: TaskAction,
    /// Run on a paired device instead of locally.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_device: Option<String>,
    #[serde(default)]
    pub retry_policy: RetryPolicy,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub budget: Option<TaskBudget>,
    pub status: TaskStatus,
    /// Always set while `status == Active`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_fire_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_fire_at: Option<DateTime<Utc>>,
    /// Attempts consumed for the current firing (reset on success).
    pub attempts: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// TaskRun
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskRunStatus {
    Running,
    Success,
    Failed,
    Cancelled,
}

impl TaskRunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Success => "success",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "running" => Some(Self::Running),
            "success" => Some(Self::Success),
            "failed" => Some(Self::Failed),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Running)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRun {
    pub id: String,
    pub task_id: String,
    /// Logical firing number (increments per trigger, not per attempt).
    pub run_number: u64,
    /// Attempt within the firing (1-based).
    pub attempt_number: u32,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    pub status: TaskRunStatus,
    pub tokens_used: u64,
    pub cost: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exponential_backoff_caps() {
        let p = RetryPolicy {
            strategy: BackoffStrategy::Exponential,
            max_retries: 10,
            initial_delay_secs: 10,
            max_delay_secs: 60,
            on_final_failure: FinalFailureAction::MarkFailed,
        };
        assert_eq!(p.delay_for_attempt(1), 10);
        assert_eq!(p.delay_for_attempt(2), 20);
        assert_eq!(p.delay_for_attempt(3), 40);
        assert_eq!(p.delay_for_attempt(4), 60); // capped
        assert_eq!(p.delay_for_attempt(60), 60); // shift overflow capped
    }

    #[test]
    fn linear_and_fixed_backoff() {
        let mut p = RetryPolicy::default();
        p.strategy = BackoffStrategy::Linear;
        p.initial_delay_secs = 5;
        assert_eq!(p.delay_for_attempt(3), 15);

        p.strategy = BackoffStrategy::Fixed;
        assert_eq!(p.delay_for_attempt(7), 5);
    }
}
