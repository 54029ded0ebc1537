//! Session endpoints: lifecycle, messages, approvals, cancel, and the
//! export/import round trip.

use axum::extract::{Path, Query, State};
use axum::Json;
use serde::Deserialize;

use hearth_domain::error::Error;
use hearth_domain::session::{Message, MessageContent, Role};
use hearth_domain::tool::ApprovalScope;
use hearth_domain::id;
use tokio::sync::oneshot;

use crate::api::error::{ApiError, ApiResult};
use crate::runtime::workers::WorkItem;
use crate::runtime::{self};
use crate::state::AppState;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Listing & lifecycle
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    #[serde(default)]
    pub workspace: Option<String>,
}

pub async fn list_sessions(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> ApiResult<Json<serde_json::Value>> {
    let sessions = state.store.list_sessions(query.workspace.as_deref())?;
    Ok(Json(serde_json::json!({ "sessions": sessions })))
}

#[derive(Debug, Deserialize)]
pub struct CreateSessionBody {
    #[serde(default)]
    pub workspace_id: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
}

pub async fn create_session(
    State(state): State<AppState>,
    Json(body): Json<CreateSessionBody>,
) -> ApiResult<Json<serde_json::Value>> {
    let workspace = body
        .workspace_id
        .unwrap_or_else(|| state.config.workspace.id.clone());
    let title = body.title.unwrap_or_else(|| "untitled".into());
    let session = runtime::create_session(&state, &workspace, body.model, &title).await?;
    Ok(Json(serde_json::json!({ "session": session })))
}

pub async fn get_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    let session = state.store.require_session(&session_id)?;
    Ok(Json(serde_json::json!({
        "session": session,
        "running": state.cancels.is_running(&session_id),
    })))
}

pub async fn delete_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    if !state.store.delete_session(&session_id)? {
        return Err(ApiError(Error::NotFound(format!("session {session_id}"))));
    }
    Ok(Json(serde_json::json!({ "deleted": true })))
}

pub async fn reopen_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    state.store.require_session(&session_id)?;
    runtime::reopen_session(&state, &session_id)?;
    Ok(Json(serde_json::json!({ "status": "active" })))
}

pub async fn archive_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    state.store.require_session(&session_id)?;
    if state.cancels.is_running(&session_id) {
        return Err(ApiError(Error::Conflict(format!(
            "session {session_id} has a turn in flight"
        ))));
    }
    state
        .store
        .set_session_status(&session_id, hearth_domain::session::SessionStatus::Archived)?;
    Ok(Json(serde_json::json!({ "status": "archived" })))
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Messages
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Deserialize)]
pub struct PostMessageBody {
    pub content: String,
    #[serde(default)]
    pub model: Option<String>,
}

/// Enqueue a user message and wait for the turn to finish. The live
/// token stream rides the WS event feed; this returns the final state.
pub async fn post_message(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Json(body): Json<PostMessageBody>,
) -> ApiResult<Json<serde_json::Value>> {
    let session = state.store.require_session(&session_id)?;
    if !state.policy.admit_request(&session.workspace_id) {
        return Err(ApiError(Error::RateLimited { retry_after: None }));
    }
    if body.content.trim().is_empty() {
        return Err(ApiError(Error::InvalidInput("content must not be empty".into())));
    }

    let (reply_tx, reply_rx) = oneshot::channel();
    state
        .workers
        .submit(
            state.clone(),
            &session_id,
            WorkItem::Turn {
                content: MessageContent::Text(body.content),
                actor: "api:user".into(),
                model_override: body.model,
                reply: Some(reply_tx),
            },
        )
        .await?;

    let report = reply_rx
        .await
        .map_err(|_| Error::Other("session worker dropped".into()))??;

    Ok(Json(serde_json::json!({
        "content": report.final_text,
        "stopped": report.stopped,
        "usage": report.usage,
        "cost": report.cost,
    })))
}

pub async fn list_messages(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    state.store.require_session(&session_id)?;
    let messages = state.store.messages_by_session(&session_id)?;
    Ok(Json(serde_json::json!({ "messages": messages })))
}

pub async fn cancel_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    state.store.require_session(&session_id)?;
    let cancelled = state.cancels.cancel(&session_id);
    Ok(Json(serde_json::json!({ "cancelled": cancelled })))
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Approvals
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Deserialize)]
pub struct ApprovalBody {
    /// `approve` or `deny`.
    pub decision: String,
    #[serde(default)]
    pub scope: Option<ApprovalScope>,
}

pub async fn resolve_approval(
    State(state): State<AppState>,
    Path((session_id, tool_call_id)): Path<(String, String)>,
    Json(body): Json<ApprovalBody>,
) -> ApiResult<Json<serde_json::Value>> {
    state.store.require_session(&session_id)?;
    let approved = match body.decision.as_str() {
        "approve" => true,
        "deny" => false,
        other => {
            return Err(ApiError(Error::InvalidInput(format!(
                "decision must be approve or deny, got '{other}'"
            ))))
        }
    };
    runtime::resolve_approval(
        &state,
        &tool_call_id,
        approved,
        body.scope.unwrap_or_default(),
        "api:user",
    )?;
    Ok(Json(serde_json::json!({ "resolved": true })))
}

pub async fn list_pending_approvals(
    State(state): State<AppState>,
) -> ApiResult<Json<serde_json::Value>> {
    Ok(Json(serde_json::json!({
        "pending": state.approvals.list_pending(),
    })))
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Export / import
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub async fn export_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    let session = state.store.require_session(&session_id)?;
    let messages = state.store.messages_by_session(&session_id)?;
    let document = serde_json::json!({
        "version": 1,
        "session": session,
        "messages": messages,
    });

    // Best-effort copy into the data directory's exports/.
    let exports_dir = state.config.data_dir.join("exports");
    let write = std::fs::create_dir_all(&exports_dir).and_then(|_| {
        std::fs::write(
            exports_dir.join(format!("{session_id}.json")),
            serde_json::to_string_pretty(&document).unwrap_or_default(),
        )
    });
    if let Err(e) = write {
        tracing::warn!(error = %e, "could not write export file");
    }

    Ok(Json(document))
}

#[derive(Debug, Deserialize)]
pub struct ImportBody {
    pub session: ImportSession,
    pub messages: Vec<ImportMessage>,
}

#[derive(Debug, Deserialize)]
pub struct ImportSession {
    #[serde(default)]
    pub workspace_id: Option<String>,
    pub model_id: String,
    #[serde(default)]
    pub title: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ImportMessage {
    pub role: Role,
    pub content: MessageContent,
    #[serde(default)]
    pub tokens_in: u64,
    #[serde(default)]
    pub tokens_out: u64,
    #[serde(default)]
    pub is_summary: bool,
}

/// Re-import an exported session: the message sequence is reproduced
/// under fresh identifiers.
pub async fn import_session(
    State(state): State<AppState>,
    Json(body): Json<ImportBody>,
) -> ApiResult<Json<serde_json::Value>> {
    let workspace = body
        .session
        .workspace_id
        .unwrap_or_else(|| state.config.workspace.id.clone());
    let title = body.session.title.unwrap_or_else(|| "imported".into());
    let session =
        runtime::create_session(&state, &workspace, Some(body.session.model_id), &title).await?;

    let mut imported = 0usize;
    for entry in body.messages {
        let message = Message {
            id: id::new_id(id::MESSAGE),
            session_id: session.id.clone(),
            role: entry.role,
            content: entry.content,
            tool_call_id: None,
            tokens_in: entry.tokens_in,
            tokens_out: entry.tokens_out,
            created_at: state.store.now(),
            is_summary: entry.is_summary,
            covered_by: None,
        };
        state.store.append_message(&message)?;
        imported += 1;
    }
    state.store.sync_session_tokens(&session.id)?;

    Ok(Json(serde_json::json!({
        "session_id": session.id,
        "imported_messages": imported,
    })))
}
