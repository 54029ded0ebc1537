//! Glue between the scheduler / channel multiplexer and the
//! orchestrator: scheduled firings become synthetic sessions, inbound
//! channel messages become session turns.

use tokio::sync::oneshot;

use hearth_channels::{InboundEnvelope, InboundHandler};
use hearth_domain::error::{Error, Result};
use hearth_domain::policy::PolicyAction;
use hearth_domain::session::MessageContent;
use hearth_domain::task::{ScheduledTask, TaskAction, TaskRun};
use hearth_policy::ToolInvocation;
use hearth_scheduler::{TaskExecutor, TaskOutcome};

use crate::state::AppState;

use super::workers::WorkItem;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Scheduler executor
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Executes task actions: prompts run through a synthetic session per
/// firing; tool actions dispatch directly (still policy-gated); runs
/// targeting a paired device are forwarded over the device link.
pub struct OrchestratorExecutor {
    pub state: AppState,
}

#[async_trait::async_trait]
impl TaskExecutor for OrchestratorExecutor {
    async fn execute(
        &self,
        task: &ScheduledTask,
        run: &TaskRun,
        trigger_payload: Option<serde_json::Value>,
    ) -> Result<TaskOutcome> {
        if let Some(device_id) = &task.target_device {
            return self
                .state
                .devices
                .forward(task, run, trigger_payload, device_id)
                .await;
        }

        match &task.action {
            TaskAction::Prompt { prompt, model } => {
                let session = super::create_session(
                    &self.state,
                    &task.workspace_id,
                    model.clone(),
                    &format!("task: {}", task.name),
                )
                .await?;

                let content = match trigger_payload {
                    Some(payload) => format!("{prompt}\n\nTriggering event:\n{payload}"),
                    None => prompt.clone(),
                };

                let (reply_tx, reply_rx) = oneshot::channel();
                self.state
                    .workers
                    .submit(
                        self.state.clone(),
                        &session.id,
                        WorkItem::Turn {
                            content: MessageContent::Text(content),
                            actor: "scheduler".into(),
                            model_override: model.clone(),
                            reply: Some(reply_tx),
                        },
                    )
                    .await?;

                let report = reply_rx
                    .await
                    .map_err(|_| Error::Other("task session worker dropped".into()))??;

                Ok(TaskOutcome {
                    tokens_used: report.usage.total(),
                    cost: report.cost,
                    result: Some(report.final_text),
                })
            }
            TaskAction::Tool {
                tool_name,
                arguments,
            } => {
                let Some((_, definition)) =
                    self.state.dispatcher.registry().lookup(tool_name)
                else {
                    return Err(Error::NotFound(format!("tool {tool_name}")));
                };

                // Scheduled tool actions cannot park for approval: the
                // decision must be allow.
                let decision = self.state.policy.evaluate(&ToolInvocation {
                    session_id: format!("task:{}", task.id),
                    workspace_id: task.workspace_id.clone(),
                    tool_name: tool_name.clone(),
                    arguments: arguments.clone(),
                    caller_identity: "scheduler".into(),
                    capability: definition.capability,
                })?;
                if decision.action != PolicyAction::Allow {
                    return Err(Error::PolicyDenied {
                        rule: decision.rule,
                        reason: format!(
                            "scheduled tool action needs an allow rule ({})",
                            decision.reason
                        ),
                    });
                }

                let output = self
                    .state
                    .dispatcher
                    .dispatch(tool_name, arguments, || {})
                    .await?;
                if output.is_error {
                    return Err(Error::Tool {
                        tool: tool_name.clone(),
                        message: output.content,
                    });
                }
                Ok(TaskOutcome {
                    tokens_used: 0,
                    cost: 0.0,
                    result: Some(output.content),
                })
            }
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Channel inbound handler
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// The multiplexer's view into the orchestrator.
pub struct MuxHandler {
    pub state: AppState,
}

#[async_trait::async_trait]
impl InboundHandler for MuxHandler {
    async fn create_session(&self, envelope: &InboundEnvelope) -> Result<String> {
        let session = super::create_session(
            &self.state,
            &envelope.workspace_id,
            None,
            &format!("{} / {}", envelope.channel_id, envelope.external_thread_id),
        )
        .await?;
        Ok(session.id)
    }

    async fn deliver(&self, session_id: &str, envelope: InboundEnvelope) {
        let actor = format!("channel:{}", envelope.channel_id);
        let submit = self
            .state
            .workers
            .submit(
                self.state.clone(),
                session_id,
                WorkItem::Turn {
                    content: MessageContent::Text(envelope.content),
                    actor,
                    model_override: None,
                    reply: None,
                },
            )
            .await;
        if let Err(e) = submit {
            tracing::warn!(session_id, error = %e, "channel delivery could not enqueue turn");
        }
    }
}
