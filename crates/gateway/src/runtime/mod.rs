//! The agent orchestrator: per-session serial workers running the
//! conversational turn loop, with policy gating, approval parks, and
//! cancellation.

pub mod approval;
pub mod cancel;
pub mod tasks;
pub mod turn;
pub mod workers;

use chrono::Utc;

use hearth_domain::audit::{AuditEntry, AuditOutcome};
use hearth_domain::error::{Error, Result};
use hearth_domain::event::{Event, Topic};
use hearth_domain::id;
use hearth_domain::session::{Message, MessageContent, Role, Session, SessionStatus};
use hearth_domain::tool::{ApprovalScope, ToolCall, ToolCallStatus};
use hearth_store::ToolCallUpdate;

use crate::state::AppState;

use approval::ApprovalResolution;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Session creation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Create a session: model resolved against the catalog, fallback chain
/// fixed from config, capacity enforced.
pub async fn create_session(
    state: &AppState,
    workspace_id: &str,
    model_override: Option<String>,
    title: &str,
) -> Result<Session> {
    let active = state.store.count_sessions(SessionStatus::Active)?;
    if active >= state.config.limits.max_sessions {
        return Err(Error::Conflict(format!(
            "session limit reached ({} active)",
            active
        )));
    }

    let model_id = model_override
        .or_else(|| state.config.llm.default_model.clone())
        .ok_or_else(|| Error::InvalidInput("no model requested and no default configured".into()))?;
    if state.providers.descriptor(&model_id).is_none() {
        return Err(Error::InvalidInput(format!("model {model_id} not in catalog")));
    }

    let fallback_models = state
        .config
        .llm
        .fallbacks
        .get(&model_id)
        .cloned()
        .unwrap_or_default();

    let now = state.store.now();
    let session = Session {
        id: id::new_id(id::SESSION),
        workspace_id: workspace_id.to_owned(),
        title: title.to_owned(),
        model_id,
        fallback_models,
        created_at: now,
        updated_at: now,
        total_tokens: 0,
        total_cost: 0.0,
        status: SessionStatus::Active,
        sequence_counter: 0,
    };
    state.store.create_session(&session)?;
    Ok(session)
}

/// Re-open a failed or archived session.
pub fn reopen_session(state: &AppState, session_id: &str) -> Result<()> {
    state
        .store
        .set_session_status(session_id, SessionStatus::Active)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Approval resolution (REST/WS entry point)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Resolve a parked approval from an API surface. The parked worker
/// performs the state transition; this just wakes it.
pub fn resolve_approval(
    state: &AppState,
    tool_call_id: &str,
    approved: bool,
    scope: ApprovalScope,
    resolved_by: &str,
) -> Result<()> {
    let resolved = state.approvals.resolve(
        tool_call_id,
        ApprovalResolution {
            approved,
            scope,
            resolved_by: resolved_by.to_owned(),
        },
    );
    if !resolved {
        return Err(Error::Conflict(format!(
            "tool call {tool_call_id} has no pending approval"
        )));
    }
    Ok(())
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Shared helpers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub(crate) fn system_prompt(state: &AppState) -> String {
    format!(
        "You are hearth, a local-first assistant bound to workspace \
         '{}'. Use the available tools when they help; ask before \
         destructive actions; answer plainly otherwise.",
        state.config.workspace.id
    )
}

/// Advance a tool call and audit the transition. Transitions into
/// `PendingApproval` are not audited here — the policy decision entry
/// already records them.
pub(crate) fn advance_tool_call_audited(
    state: &AppState,
    call: &ToolCall,
    next: ToolCallStatus,
    update: ToolCallUpdate,
    actor: &str,
) -> Result<ToolCall> {
    let advanced = state.store.advance_tool_call(&call.id, next, update)?;

    if next != ToolCallStatus::PendingApproval {
        let outcome = match next {
            ToolCallStatus::Denied => AuditOutcome::Denied,
            ToolCallStatus::Failed => AuditOutcome::Failed,
            _ => AuditOutcome::Ok,
        };
        state.store.append_audit(&AuditEntry::new(
            actor,
            format!("tool_call.{}", next.as_str()),
            "tool_call",
            call.id.clone(),
            outcome,
            serde_json::json!({
                "session_id": call.session_id,
                "tool_name": call.tool_name,
                "error": advanced.error,
            }),
        ))?;
    }
    Ok(advanced)
}

/// Append a message row and publish `session.message` for it.
pub(crate) async fn persist_and_publish_message(
    state: &AppState,
    message: &Message,
) -> Result<()> {
    state.store.append_message(message)?;
    state
        .bus
        .publish(Event::for_session(
            Topic::SessionMessage,
            message.session_id.clone(),
            serde_json::json!({
                "message_id": message.id,
                "role": message.role.as_str(),
                "content": message.content.extract_all_text(),
                "is_summary": message.is_summary,
            }),
        ))
        .await?;
    Ok(())
}

/// Record a terminal turn failure: an error Message carrying a trace
/// id, plus `error.occurred` on the bus.
pub(crate) async fn record_turn_failure(state: &AppState, session_id: &str, error: &Error) {
    let trace_id = uuid::Uuid::new_v4().simple().to_string();
    tracing::error!(session_id, trace_id = %trace_id, error = %error, "turn failed");

    let message = Message {
        id: id::new_id(id::MESSAGE),
        session_id: session_id.to_owned(),
        role: Role::System,
        content: MessageContent::Text(format!(
            "The turn failed ({}). Trace: {trace_id}",
            error.code()
        )),
        tool_call_id: None,
        tokens_in: 0,
        tokens_out: 0,
        created_at: Utc::now(),
        is_summary: false,
        covered_by: None,
    };
    if let Err(e) = state.store.append_message(&message) {
        tracing::warn!(error = %e, "failed to persist turn-failure message");
    }

    state
        .bus
        .publish_or_log(Event::for_session(
            Topic::ErrorOccurred,
            session_id.to_owned(),
            serde_json::json!({
                "scope": "session",
                "code": error.code(),
                "error": error.to_string(),
                "trace_id": trace_id,
            }),
        ))
        .await;
}

