//! Health, audit, and policy administration endpoints.

use axum::extract::{Path, Query, State};
use axum::Json;
use serde::Deserialize;

use hearth_domain::error::Error;
use hearth_domain::id;
use hearth_domain::policy::{ArgumentConstraints, Policy, PolicyAction};
use hearth_domain::tool::ApprovalScope;
use hearth_store::AuditQuery;

use crate::api::error::{ApiError, ApiResult};
use crate::state::AppState;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Health
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    // The store answers a trivial query or the component is down.
    let store_ok = state.store.count_audit().is_ok();
    let providers: serde_json::Map<String, serde_json::Value> = state
        .dispatcher
        .registry()
        .provider_health()
        .into_iter()
        .map(|(name, health)| {
            (
                name,
                serde_json::json!({
                    "healthy": health.healthy,
                    "tools": health.tool_count,
                    "last_error": health.last_error,
                }),
            )
        })
        .collect();

    let status = if store_ok { "ok" } else { "degraded" };
    Json(serde_json::json!({
        "status": status,
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_seconds": state.uptime_seconds(),
        "components": {
            "store": if store_ok { "ok" } else { "unavailable" },
            "bus": { "subscribers": state.bus.subscriber_count() },
            "providers": providers,
            "sessions": { "workers": state.workers.active_count() },
            "devices": state.devices.connected_devices(),
        },
    }))
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Audit
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Deserialize)]
pub struct AuditParams {
    #[serde(default)]
    pub session: Option<String>,
    #[serde(default)]
    pub tool: Option<String>,
    #[serde(default)]
    pub limit: Option<usize>,
    #[serde(default)]
    pub before: Option<String>,
}

pub async fn query_audit(
    State(state): State<AppState>,
    Query(params): Query<AuditParams>,
) -> ApiResult<Json<serde_json::Value>> {
    let entries = state.store.query_audit(AuditQuery {
        session: params.session.as_deref(),
        tool: params.tool.as_deref(),
        limit: params.limit.unwrap_or(100).min(1000),
        before: params.before.as_deref(),
    })?;
    let next_cursor = entries.last().map(|e| e.id.clone());
    Ok(Json(serde_json::json!({
        "entries": entries,
        "next_before": next_cursor,
    })))
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Policies
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub async fn list_policies(State(state): State<AppState>) -> ApiResult<Json<serde_json::Value>> {
    let policies = state
        .store
        .policies_for_workspace(&state.config.workspace.id)?;
    Ok(Json(serde_json::json!({ "policies": policies })))
}

#[derive(Debug, Deserialize)]
pub struct CreatePolicyBody {
    pub selector: String,
    pub action: PolicyAction,
    #[serde(default)]
    pub scope: Option<ApprovalScope>,
    #[serde(default)]
    pub domains: Vec<String>,
    #[serde(default)]
    pub argument_constraints: Option<ArgumentConstraints>,
    #[serde(default)]
    pub expires_at: Option<chrono::DateTime<chrono::Utc>>,
    #[serde(default)]
    pub workspace_id: Option<String>,
}

pub async fn create_policy(
    State(state): State<AppState>,
    Json(body): Json<CreatePolicyBody>,
) -> ApiResult<Json<serde_json::Value>> {
    if body.selector.is_empty() {
        return Err(ApiError(Error::InvalidInput("selector must not be empty".into())));
    }
    let policy = Policy {
        id: id::new_id(id::POLICY),
        workspace_id: body
            .workspace_id
            .unwrap_or_else(|| state.config.workspace.id.clone()),
        selector: body.selector,
        action: body.action,
        scope: body.scope.unwrap_or_default(),
        domains: body.domains,
        argument_constraints: body.argument_constraints,
        expires_at: body.expires_at,
    };
    state.store.upsert_policy(&policy)?;
    Ok(Json(serde_json::json!({ "policy": policy })))
}

pub async fn delete_policy(
    State(state): State<AppState>,
    Path(policy_id): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    if !state.store.delete_policy(&policy_id)? {
        return Err(ApiError(Error::NotFound(format!("policy {policy_id}"))));
    }
    Ok(Json(serde_json::json!({ "deleted": true })))
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Cost summary (admin RPC shares this)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub async fn cost_summary(State(state): State<AppState>) -> ApiResult<Json<serde_json::Value>> {
    let sessions = state.store.list_sessions(None)?;
    let session_cost: f64 = sessions.iter().map(|s| s.total_cost).sum();
    let session_tokens: u64 = sessions.iter().map(|s| s.total_tokens).sum();
    let task_cost = state
        .store
        .workspace_cost_total(&state.config.workspace.id)?;
    Ok(Json(serde_json::json!({
        "sessions": {
            "count": sessions.len(),
            "total_tokens": session_tokens,
            "total_cost_usd": session_cost,
        },
        "tasks": { "total_cost_usd": task_cost },
    })))
}

pub async fn list_tools(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "tools": state.dispatcher.registry().definitions(),
    }))
}

pub async fn list_models(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({ "models": state.providers.model_ids() }))
}

/// The loaded configuration (secret values never appear here — the
/// config holds only references).
pub async fn get_config(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(serde_json::to_value(state.config.as_ref()).unwrap_or(serde_json::Value::Null))
}
